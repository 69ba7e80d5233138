//! Wire payloads - JSON envelopes that cross the broker
//!
//! These shapes are the contract between services; field names are frozen.
//! Every payload is published with delivery-mode persistent, content-type
//! JSON and the task id as correlation id.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::entities::Platform;
use crate::domain::value_objects::{
    GameStateId, NotificationStatus, PromptType, StoryConfigId, StoryId, TaskId, UserId,
};

/// State hash naming a story's first scene rather than a player position.
pub const INITIAL_STATE_HASH: &str = "initial";

/// Immutable envelope handed to a generator worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationTaskPayload {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub prompt_type: PromptType,
    /// ISO-639-1 language the prompts are resolved in.
    pub language: String,
    #[serde(default)]
    pub user_input: String,

    // Correlating ids, echoed back on the completion notification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_config_id: Option<StoryConfigId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_story_id: Option<StoryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_game_state_id: Option<GameStateId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_hash: Option<String>,

    // Image-task fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<String>,
    /// Deterministic artifact name; the same reference overwrites the same file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_reference: Option<String>,

    #[serde(default)]
    pub attempt: u32,
}

impl GenerationTaskPayload {
    pub fn new(user_id: UserId, prompt_type: PromptType, language: impl Into<String>) -> Self {
        Self {
            task_id: TaskId::new(),
            user_id,
            prompt_type,
            language: language.into(),
            user_input: String::new(),
            story_config_id: None,
            published_story_id: None,
            player_game_state_id: None,
            state_hash: None,
            ratio: None,
            image_reference: None,
            attempt: 0,
        }
    }

    pub fn with_user_input(mut self, input: impl Into<String>) -> Self {
        self.user_input = input.into();
        self
    }

    pub fn for_story_config(mut self, id: StoryConfigId) -> Self {
        self.story_config_id = Some(id);
        self
    }

    pub fn for_published_story(mut self, id: StoryId) -> Self {
        self.published_story_id = Some(id);
        self
    }

    pub fn for_game_state(mut self, id: GameStateId) -> Self {
        self.player_game_state_id = Some(id);
        self
    }

    pub fn with_state_hash(mut self, hash: impl Into<String>) -> Self {
        self.state_hash = Some(hash.into());
        self
    }

    pub fn with_image(mut self, reference: impl Into<String>, ratio: impl Into<String>) -> Self {
        self.image_reference = Some(reference.into());
        self.ratio = Some(ratio.into());
        self
    }
}

/// Completion notice a worker publishes once a task reaches a terminal
/// attempt. Carries no generated content; consumers fetch the result row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub prompt_type: PromptType,
    pub status: NotificationStatus,
    #[serde(default)]
    pub error_details: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_config_id: Option<StoryConfigId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_story_id: Option<StoryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_game_state_id: Option<GameStateId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_hash: Option<String>,
}

impl NotificationPayload {
    /// Success notice echoing the task's correlating ids.
    pub fn success(task: &GenerationTaskPayload) -> Self {
        Self::from_task(task, NotificationStatus::Success, String::new())
    }

    /// Error notice echoing the task's correlating ids.
    pub fn error(task: &GenerationTaskPayload, details: impl Into<String>) -> Self {
        Self::from_task(task, NotificationStatus::Error, details.into())
    }

    fn from_task(task: &GenerationTaskPayload, status: NotificationStatus, error_details: String) -> Self {
        Self {
            task_id: task.task_id,
            user_id: task.user_id,
            prompt_type: task.prompt_type,
            status,
            error_details,
            story_config_id: task.story_config_id,
            published_story_id: task.published_story_id,
            player_game_state_id: task.player_game_state_id,
            state_hash: task.state_hash.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == NotificationStatus::Success
    }
}

/// One dynamic-config key changed; routed with `config.updated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigUpdatePayload {
    pub key: String,
    pub value: String,
}

/// A prompt was created, updated or deleted; routed with `prompt.created`,
/// `prompt.updated` or `prompt.deleted`. `content` is absent on deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptUpdatePayload {
    pub key: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Push request fanned out to a user's devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushNotificationPayload {
    pub user_id: UserId,
    pub notification: PushMessage,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
}

/// A device token a platform reported as unregistered or malformed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenDeletionPayload {
    pub user_id: UserId,
    pub token: String,
    pub platform: Platform,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_payload_round_trips_with_optional_fields_absent() {
        let task = GenerationTaskPayload::new(UserId::new(), PromptType::Narrator, "en")
            .with_user_input("a dark fantasy about a baker");
        let json = serde_json::to_string(&task).unwrap();
        assert!(!json.contains("story_config_id"));
        assert!(json.contains("\"prompt_type\":\"narrator\""));

        let parsed: GenerationTaskPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.task_id, task.task_id);
        assert_eq!(parsed.attempt, 0);
    }

    #[test]
    fn notification_echoes_correlating_ids() {
        let story_id = StoryId::new();
        let task = GenerationTaskPayload::new(UserId::new(), PromptType::SceneJson, "en")
            .for_published_story(story_id)
            .with_state_hash(INITIAL_STATE_HASH);

        let notif = NotificationPayload::success(&task);
        assert_eq!(notif.published_story_id, Some(story_id));
        assert_eq!(notif.state_hash.as_deref(), Some(INITIAL_STATE_HASH));
        assert!(notif.is_success());
        assert!(notif.error_details.is_empty());

        let json = serde_json::to_string(&notif).unwrap();
        assert!(json.contains("\"status\":\"success\""));
    }

    #[test]
    fn config_update_wire_shape() {
        let payload: ConfigUpdatePayload =
            serde_json::from_str(r#"{"key":"generation.npc_count","value":"5"}"#).unwrap();
        assert_eq!(payload.key, "generation.npc_count");
        assert_eq!(payload.value, "5");
    }
}
