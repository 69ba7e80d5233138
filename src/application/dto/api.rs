//! HTTP request/response DTOs for the thin REST surface

use serde::{Deserialize, Serialize};

use crate::domain::entities::{PlayerGameState, PublishedStory, StoryConfig};
use crate::domain::value_objects::{
    ConfigStatus, GameStateId, GameStateStatus, GenerationStep, StoryConfigId, StoryId, StoryStatus,
    TaskId, UserId,
};

#[derive(Debug, Deserialize)]
pub struct CreateDraftRequest {
    pub user_id: UserId,
    #[serde(default = "default_language")]
    pub language: String,
    pub user_input: String,
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub player_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct MakeChoiceRequest {
    pub choice: String,
}

/// Handle returned whenever work was accepted asynchronously.
#[derive(Debug, Serialize)]
pub struct TaskAccepted {
    pub task_id: TaskId,
}

#[derive(Debug, Serialize)]
pub struct DraftCreated {
    pub draft_id: StoryConfigId,
    pub task_id: TaskId,
}

#[derive(Debug, Serialize)]
pub struct StoryPublished {
    pub published_story_id: StoryId,
    pub task_id: TaskId,
}

#[derive(Debug, Serialize)]
pub struct DraftSnapshot {
    pub id: StoryConfigId,
    pub user_id: UserId,
    pub language: String,
    pub user_input: String,
    pub narrator_output: Option<String>,
    pub status: ConfigStatus,
    pub error_details: Option<String>,
}

impl From<&StoryConfig> for DraftSnapshot {
    fn from(config: &StoryConfig) -> Self {
        Self {
            id: config.id,
            user_id: config.user_id,
            language: config.language.clone(),
            user_input: config.user_input.clone(),
            narrator_output: config.narrator_output.clone(),
            status: config.status,
            error_details: config.error_details.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StorySnapshot {
    pub id: StoryId,
    pub author_id: UserId,
    pub status: StoryStatus,
    pub step: GenerationStep,
    pub are_images_pending: bool,
    pub is_first_scene_pending: bool,
    pub preview_image_url: Option<String>,
    pub error_details: Option<String>,
}

impl From<&PublishedStory> for StorySnapshot {
    fn from(story: &PublishedStory) -> Self {
        Self {
            id: story.id,
            author_id: story.author_id,
            status: story.status,
            step: story.step,
            are_images_pending: story.are_images_pending,
            is_first_scene_pending: story.is_first_scene_pending,
            preview_image_url: story.preview_image_url.clone(),
            error_details: story.error_details.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GameStateSnapshot {
    pub id: GameStateId,
    pub player_id: UserId,
    pub published_story_id: StoryId,
    pub status: GameStateStatus,
    pub current_scene_index: i32,
    pub current_scene: Option<serde_json::Value>,
    pub last_choice: Option<String>,
    pub ending: Option<String>,
    pub error_details: Option<String>,
}

impl From<&PlayerGameState> for GameStateSnapshot {
    fn from(state: &PlayerGameState) -> Self {
        Self {
            id: state.id,
            player_id: state.player_id,
            published_story_id: state.published_story_id,
            status: state.status,
            current_scene_index: state.current_scene_index,
            current_scene: state.current_scene().cloned(),
            last_choice: state.last_choice.clone(),
            ending: state.ending.clone(),
            error_details: state.error_details.clone(),
        }
    }
}

/// Task status as seen through the result store.
#[derive(Debug, Serialize)]
pub struct TaskStatusResponse {
    pub task_id: TaskId,
    /// `pending` until a terminal attempt is persisted, then `success`/`error`.
    pub status: String,
    pub error: Option<String>,
    pub text: Option<String>,
}
