//! StoryConfig entity - The user-facing draft before publication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{ConfigStatus, StoryConfigId, UserId};

/// A draft the author iterates on with the narrator before publishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryConfig {
    pub id: StoryConfigId,
    pub user_id: UserId,
    pub language: String,
    pub user_input: String,
    /// Latest narrator rendition of the premise.
    pub narrator_output: Option<String>,
    pub status: ConfigStatus,
    pub error_details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_generation_attempt_at: Option<DateTime<Utc>>,
}

impl StoryConfig {
    pub fn new(user_id: UserId, language: impl Into<String>, user_input: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: StoryConfigId::new(),
            user_id,
            language: language.into(),
            user_input: user_input.into(),
            narrator_output: None,
            status: ConfigStatus::Draft,
            error_details: None,
            created_at: now,
            updated_at: now,
            last_generation_attempt_at: None,
        }
    }

    /// A narrator task went out for this draft.
    pub fn begin_generation(&mut self) {
        self.status = ConfigStatus::Generating;
        self.last_generation_attempt_at = Some(Utc::now());
        self.touch();
    }

    /// The narrator answered; the author can keep editing.
    pub fn apply_narrator_output(&mut self, output: String) {
        self.narrator_output = Some(output);
        self.status = ConfigStatus::Draft;
        self.error_details = None;
        self.touch();
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = ConfigStatus::Error;
        self.error_details = Some(reason.into());
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
