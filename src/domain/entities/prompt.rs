//! Prompt entity - A (key, language) -> content record

use serde::{Deserialize, Serialize};

/// One prompt template as stored and cached. `content` may contain the
/// `{{NPC_COUNT}}`, `{{CHOICE_COUNT}}` and `{{USER_INPUT}}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub key: String,
    pub language: String,
    pub content: String,
}
