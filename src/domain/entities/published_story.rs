//! PublishedStory entity - A story progressing through the generation pipeline
//!
//! All transitions are pure and synchronous. The notification consumer runs
//! them on a freshly-read row inside a locked transaction; nothing here does
//! I/O. After any transition the row must satisfy:
//!
//! - pending counters are non-negative
//! - `are_images_pending == (pending_card_image_tasks + pending_character_image_tasks > 0)`
//! - a terminal status implies all counters are zero and all flags false

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{GenerationStep, StoryId, StoryStatus, UserId};

/// A story record owned by its author, generated stage by stage until playable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedStory {
    pub id: StoryId,
    pub author_id: UserId,
    pub language: String,
    /// The author's original premise, forwarded to generation tasks.
    pub user_input: String,
    pub status: StoryStatus,
    pub step: GenerationStep,

    // Stage payloads, filled as the pipeline advances
    pub moderation: Option<serde_json::Value>,
    pub protagonist_goal: Option<String>,
    pub scene_plan: Option<serde_json::Value>,
    pub setup: Option<String>,
    pub first_scene: Option<serde_json::Value>,
    pub preview_image_url: Option<String>,
    pub error_details: Option<String>,

    // Fan-out counters
    pub pending_character_generation_tasks: i32,
    pub pending_card_image_tasks: i32,
    pub pending_character_image_tasks: i32,
    pub are_images_pending: bool,
    pub is_first_scene_pending: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_generation_attempt_at: Option<DateTime<Utc>>,
}

/// Why a transition was refused.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    /// The row is already in a terminal status. Consumers treat this as a
    /// warn-level no-op.
    #[error("row is in a terminal status")]
    Terminal,
    /// A generation for this row is already in flight.
    #[error("a generation is already in flight")]
    InFlight,
    /// A completion arrived for a counter that is already zero.
    #[error("counter underflow for {0}")]
    CounterUnderflow(&'static str),
    /// A completion arrived for a stage the row is not in.
    #[error("unexpected completion {got} while in step {step:?}")]
    UnexpectedStage { got: String, step: GenerationStep },
    /// The stored generation result could not be interpreted.
    #[error("malformed stage result: {0}")]
    MalformedResult(String),
}

impl PublishedStory {
    pub fn new(author_id: UserId, language: impl Into<String>, user_input: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: StoryId::new(),
            author_id,
            language: language.into(),
            user_input: user_input.into(),
            status: StoryStatus::Pending,
            step: GenerationStep::Moderation,
            moderation: None,
            protagonist_goal: None,
            scene_plan: None,
            setup: None,
            first_scene: None,
            preview_image_url: None,
            error_details: None,
            pending_character_generation_tasks: 0,
            pending_card_image_tasks: 0,
            pending_character_image_tasks: 0,
            are_images_pending: false,
            is_first_scene_pending: false,
            created_at: now,
            updated_at: now,
            last_generation_attempt_at: None,
        }
    }

    /// The next internal step, computed from the pending counters alone.
    pub fn next_step(&self) -> GenerationStep {
        if self.pending_character_generation_tasks > 0 {
            GenerationStep::CharacterGeneration
        } else if self.pending_card_image_tasks > 0 {
            GenerationStep::CardImageGeneration
        } else if self.pending_character_image_tasks > 0 {
            GenerationStep::CharacterImageGeneration
        } else {
            GenerationStep::SetupGeneration
        }
    }

    /// Whether any fan-out work is still outstanding.
    pub fn has_pending_fan_out(&self) -> bool {
        self.pending_character_generation_tasks > 0
            || self.pending_card_image_tasks > 0
            || self.pending_character_image_tasks > 0
    }

    pub fn recompute_images_pending(&mut self) {
        self.are_images_pending =
            self.pending_card_image_tasks + self.pending_character_image_tasks > 0;
    }

    fn ensure_live(&self) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal);
        }
        Ok(())
    }

    /// Record the moderation verdict and advance to protagonist-goal generation.
    pub fn complete_moderation(&mut self, verdict: serde_json::Value) -> Result<(), TransitionError> {
        self.ensure_live()?;
        self.expect_step(GenerationStep::Moderation, "content_moderation")?;
        self.moderation = Some(verdict);
        self.status = StoryStatus::Generating;
        self.step = GenerationStep::ProtagonistGoal;
        self.touch();
        Ok(())
    }

    pub fn complete_protagonist_goal(&mut self, goal: String) -> Result<(), TransitionError> {
        self.ensure_live()?;
        self.expect_step(GenerationStep::ProtagonistGoal, "protagonist_goal")?;
        self.protagonist_goal = Some(goal);
        self.step = GenerationStep::ScenePlanner;
        self.touch();
        Ok(())
    }

    /// Record the scene plan and open the fan-out stage.
    ///
    /// `characters` planned characters each get a generation task now and an
    /// image task once their sheet exists; `card_images` counts the card
    /// image tasks dispatched immediately (story preview included).
    pub fn complete_scene_planner(
        &mut self,
        plan: serde_json::Value,
        characters: i32,
        card_images: i32,
    ) -> Result<(), TransitionError> {
        self.ensure_live()?;
        self.expect_step(GenerationStep::ScenePlanner, "scene_planner")?;
        if characters <= 0 {
            return Err(TransitionError::MalformedResult(
                "scene plan contains no characters".to_string(),
            ));
        }
        self.scene_plan = Some(plan);
        self.pending_character_generation_tasks = characters;
        self.pending_card_image_tasks = card_images;
        // One portrait per planned character, dispatched as each sheet completes.
        self.pending_character_image_tasks = characters;
        self.recompute_images_pending();
        self.step = GenerationStep::CharacterGeneration;
        self.touch();
        Ok(())
    }

    pub fn complete_character_generation(&mut self) -> Result<(), TransitionError> {
        self.ensure_live()?;
        if self.pending_character_generation_tasks == 0 {
            return Err(TransitionError::CounterUnderflow(
                "pending_character_generation_tasks",
            ));
        }
        self.pending_character_generation_tasks -= 1;
        self.advance_fan_out();
        Ok(())
    }

    pub fn complete_card_image(&mut self, url: Option<String>) -> Result<(), TransitionError> {
        self.ensure_live()?;
        if self.pending_card_image_tasks == 0 {
            return Err(TransitionError::CounterUnderflow("pending_card_image_tasks"));
        }
        self.pending_card_image_tasks -= 1;
        if let Some(url) = url {
            self.preview_image_url = Some(url);
        }
        self.advance_fan_out();
        Ok(())
    }

    pub fn complete_character_image(&mut self) -> Result<(), TransitionError> {
        self.ensure_live()?;
        if self.pending_character_image_tasks == 0 {
            return Err(TransitionError::CounterUnderflow(
                "pending_character_image_tasks",
            ));
        }
        self.pending_character_image_tasks -= 1;
        self.advance_fan_out();
        Ok(())
    }

    fn advance_fan_out(&mut self) {
        self.recompute_images_pending();
        self.step = if self.has_pending_fan_out() {
            self.next_step()
        } else {
            GenerationStep::SetupGeneration
        };
        self.touch();
    }

    pub fn complete_setup(&mut self, setup: String) -> Result<(), TransitionError> {
        self.ensure_live()?;
        self.expect_step(GenerationStep::SetupGeneration, "setup")?;
        self.setup = Some(setup);
        self.step = GenerationStep::FirstSceneGeneration;
        self.is_first_scene_pending = true;
        self.touch();
        Ok(())
    }

    /// The initial scene landed; the story becomes playable.
    pub fn complete_first_scene(&mut self, scene: serde_json::Value) -> Result<(), TransitionError> {
        self.ensure_live()?;
        self.expect_step(GenerationStep::FirstSceneGeneration, "scene_json")?;
        self.first_scene = Some(scene);
        self.is_first_scene_pending = false;
        self.step = GenerationStep::Done;
        self.status = StoryStatus::Ready;
        self.touch();
        Ok(())
    }

    /// Move the row to Error, capping any outstanding recovery work.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = StoryStatus::Error;
        self.error_details = Some(reason.into());
        self.pending_character_generation_tasks = 0;
        self.pending_card_image_tasks = 0;
        self.pending_character_image_tasks = 0;
        self.are_images_pending = false;
        self.is_first_scene_pending = false;
        self.touch();
    }

    /// Stamp a dispatch attempt, which the stuck-task reaper keys on.
    pub fn mark_generation_attempt(&mut self) {
        self.last_generation_attempt_at = Some(Utc::now());
        self.touch();
    }

    fn expect_step(&self, step: GenerationStep, got: &str) -> Result<(), TransitionError> {
        if self.step != step {
            return Err(TransitionError::UnexpectedStage {
                got: got.to_string(),
                step: self.step,
            });
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Row-level invariants, checked by tests after every committed transition.
    pub fn invariants_hold(&self) -> bool {
        let counters_non_negative = self.pending_character_generation_tasks >= 0
            && self.pending_card_image_tasks >= 0
            && self.pending_character_image_tasks >= 0;
        let images_coherent = self.are_images_pending
            == (self.pending_card_image_tasks + self.pending_character_image_tasks > 0);
        let terminal_clean = !self.status.is_terminal()
            || (self.pending_character_generation_tasks == 0
                && self.pending_card_image_tasks == 0
                && self.pending_character_image_tasks == 0
                && !self.are_images_pending
                && !self.is_first_scene_pending);
        counters_non_negative && images_coherent && terminal_clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn story() -> PublishedStory {
        PublishedStory::new(UserId::new(), "en", "a dark fantasy about a baker")
    }

    #[test]
    fn pipeline_advances_stage_by_stage() {
        let mut s = story();
        assert_eq!(s.step, GenerationStep::Moderation);

        s.complete_moderation(serde_json::json!({"allowed": true})).unwrap();
        assert_eq!(s.step, GenerationStep::ProtagonistGoal);
        assert_eq!(s.status, StoryStatus::Generating);

        s.complete_protagonist_goal("defeat the night court".into()).unwrap();
        assert_eq!(s.step, GenerationStep::ScenePlanner);

        s.complete_scene_planner(serde_json::json!({}), 3, 2).unwrap();
        assert_eq!(s.step, GenerationStep::CharacterGeneration);
        assert_eq!(s.pending_character_generation_tasks, 3);
        assert_eq!(s.pending_card_image_tasks, 2);
        assert_eq!(s.pending_character_image_tasks, 3);
        assert!(s.are_images_pending);
        assert!(s.invariants_hold());
    }

    #[test]
    fn fan_out_completes_in_any_order() {
        let mut s = story();
        s.complete_moderation(serde_json::json!({"allowed": true})).unwrap();
        s.complete_protagonist_goal("goal".into()).unwrap();
        s.complete_scene_planner(serde_json::json!({}), 2, 2).unwrap();

        // Interleave image and character completions
        s.complete_card_image(None).unwrap();
        s.complete_character_generation().unwrap();
        s.complete_character_image().unwrap();
        s.complete_character_generation().unwrap();
        assert!(s.invariants_hold());
        assert!(s.has_pending_fan_out());

        s.complete_card_image(Some("https://cdn/img.jpg".into())).unwrap();
        s.complete_character_image().unwrap();

        assert!(!s.has_pending_fan_out());
        assert!(!s.are_images_pending);
        assert_eq!(s.step, GenerationStep::SetupGeneration);
        assert_eq!(s.preview_image_url.as_deref(), Some("https://cdn/img.jpg"));
        assert!(s.invariants_hold());
    }

    #[test]
    fn next_step_prefers_characters_then_cards_then_portraits() {
        let mut s = story();
        s.pending_character_generation_tasks = 1;
        s.pending_card_image_tasks = 1;
        s.pending_character_image_tasks = 1;
        assert_eq!(s.next_step(), GenerationStep::CharacterGeneration);

        s.pending_character_generation_tasks = 0;
        assert_eq!(s.next_step(), GenerationStep::CardImageGeneration);

        s.pending_card_image_tasks = 0;
        assert_eq!(s.next_step(), GenerationStep::CharacterImageGeneration);

        s.pending_character_image_tasks = 0;
        assert_eq!(s.next_step(), GenerationStep::SetupGeneration);
    }

    #[test]
    fn counter_underflow_is_rejected() {
        let mut s = story();
        s.complete_moderation(serde_json::json!({"allowed": true})).unwrap();
        s.complete_protagonist_goal("goal".into()).unwrap();
        s.complete_scene_planner(serde_json::json!({}), 1, 0).unwrap();
        s.complete_character_generation().unwrap();

        let err = s.complete_character_generation().unwrap_err();
        assert!(matches!(err, TransitionError::CounterUnderflow(_)));
        assert!(s.invariants_hold());
    }

    #[test]
    fn terminal_rows_refuse_transitions_and_stay_clean() {
        let mut s = story();
        s.complete_moderation(serde_json::json!({"allowed": true})).unwrap();
        s.complete_protagonist_goal("goal".into()).unwrap();
        s.complete_scene_planner(serde_json::json!({}), 2, 1).unwrap();

        s.fail("scene planner returned garbage");
        assert_eq!(s.status, StoryStatus::Error);
        assert_eq!(s.pending_character_generation_tasks, 0);
        assert!(!s.are_images_pending);
        assert!(s.invariants_hold());

        let err = s.complete_character_generation().unwrap_err();
        assert!(matches!(err, TransitionError::Terminal));
    }

    #[test]
    fn first_scene_completion_makes_story_ready() {
        let mut s = story();
        s.complete_moderation(serde_json::json!({"allowed": true})).unwrap();
        s.complete_protagonist_goal("goal".into()).unwrap();
        s.complete_scene_planner(serde_json::json!({}), 1, 0).unwrap();
        s.complete_character_generation().unwrap();
        s.complete_character_image().unwrap();
        s.complete_setup("setup text".into()).unwrap();
        assert!(s.is_first_scene_pending);

        s.complete_first_scene(serde_json::json!({"scene": 0})).unwrap();
        assert_eq!(s.status, StoryStatus::Ready);
        assert_eq!(s.step, GenerationStep::Done);
        assert!(!s.is_first_scene_pending);
        assert!(s.invariants_hold());
    }

    #[test]
    fn out_of_stage_completion_is_rejected() {
        let mut s = story();
        let err = s.complete_setup("too early".into()).unwrap_err();
        assert!(matches!(err, TransitionError::UnexpectedStage { .. }));
    }
}
