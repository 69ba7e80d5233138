//! GenerationResult entity - One row per terminal generation attempt

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{PromptType, TaskId, UserId};

/// What a worker produced for one task, keyed by task id.
///
/// Notifications carry no generated content; consumers fetch it from here.
/// `error` is the empty string on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub prompt_type: PromptType,
    /// Generated text, or the public URL for image tasks.
    pub text: String,
    pub processing_time_ms: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub estimated_cost: f64,
    pub error: String,
    pub created_at: DateTime<Utc>,
}

impl GenerationResult {
    pub fn success(
        task_id: TaskId,
        user_id: UserId,
        prompt_type: PromptType,
        text: String,
        processing_time_ms: i64,
        prompt_tokens: i64,
        completion_tokens: i64,
        estimated_cost: f64,
    ) -> Self {
        Self {
            task_id,
            user_id,
            prompt_type,
            text,
            processing_time_ms,
            prompt_tokens,
            completion_tokens,
            estimated_cost,
            error: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn failure(
        task_id: TaskId,
        user_id: UserId,
        prompt_type: PromptType,
        error: impl Into<String>,
        processing_time_ms: i64,
    ) -> Self {
        Self {
            task_id,
            user_id,
            prompt_type,
            text: String::new(),
            processing_time_ms,
            prompt_tokens: 0,
            completion_tokens: 0,
            estimated_cost: 0.0,
            error: error.into(),
            created_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}
