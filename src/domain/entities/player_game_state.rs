//! PlayerGameState entity - Per-player, per-story progress

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entities::published_story::TransitionError;
use crate::domain::value_objects::{GameStateId, GameStateStatus, StoryId, UserId};

/// A player's position inside a published story: the scene they are on, the
/// flags and variables their choices accumulated, and whether a scene
/// generation task is currently in flight for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerGameState {
    pub id: GameStateId,
    pub player_id: UserId,
    pub published_story_id: StoryId,
    pub language: String,
    pub status: GameStateStatus,
    pub current_scene_index: i32,
    /// Scenes persisted so far, index-aligned with `current_scene_index`.
    pub scenes: Vec<serde_json::Value>,
    pub flags: HashMap<String, bool>,
    pub variables: HashMap<String, String>,
    pub last_choice: Option<String>,
    /// Opaque token naming this point in the session; travels on scene tasks.
    pub state_hash: String,
    pub ending: Option<String>,
    /// Seed the player can start a new character from after a game over.
    pub continuation_seed: Option<String>,
    pub error_details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_generation_attempt_at: Option<DateTime<Utc>>,
}

impl PlayerGameState {
    /// Open a session on a Ready story. The story's first scene is scene 0.
    pub fn new(
        player_id: UserId,
        published_story_id: StoryId,
        language: impl Into<String>,
        first_scene: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: GameStateId::new(),
            player_id,
            published_story_id,
            language: language.into(),
            status: GameStateStatus::Playing,
            current_scene_index: 0,
            scenes: vec![first_scene],
            flags: HashMap::new(),
            variables: HashMap::new(),
            last_choice: None,
            state_hash: Self::fresh_hash(),
            ending: None,
            continuation_seed: None,
            error_details: None,
            created_at: now,
            updated_at: now,
            last_generation_attempt_at: None,
        }
    }

    fn fresh_hash() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    fn ensure_live(&self) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal);
        }
        Ok(())
    }

    /// The player made a choice; a scene task goes out for this state.
    pub fn begin_scene_generation(&mut self, choice: impl Into<String>) -> Result<(), TransitionError> {
        self.ensure_live()?;
        if self.status == GameStateStatus::Generating {
            return Err(TransitionError::InFlight);
        }
        self.last_choice = Some(choice.into());
        self.status = GameStateStatus::Generating;
        self.state_hash = Self::fresh_hash();
        self.last_generation_attempt_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// The generated scene landed; advance and hand control back to the player.
    pub fn complete_scene(&mut self, scene: serde_json::Value) -> Result<(), TransitionError> {
        self.ensure_live()?;
        self.scenes.push(scene);
        self.current_scene_index = (self.scenes.len() as i32) - 1;
        self.status = GameStateStatus::Playing;
        self.touch();
        Ok(())
    }

    /// The story ended for this character.
    pub fn complete_game_over(
        &mut self,
        ending: String,
        continuation_seed: Option<String>,
    ) -> Result<(), TransitionError> {
        self.ensure_live()?;
        self.ending = Some(ending);
        self.continuation_seed = continuation_seed;
        self.status = GameStateStatus::Finished;
        self.touch();
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = GameStateStatus::Error;
        self.error_details = Some(reason.into());
        self.touch();
    }

    /// The scene the player is currently on. Present whenever status is Playing.
    pub fn current_scene(&self) -> Option<&serde_json::Value> {
        self.scenes.get(self.current_scene_index as usize)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
