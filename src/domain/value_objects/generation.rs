//! Structured payloads parsed out of generator results

use serde::{Deserialize, Serialize};

/// Verdict produced by the content-moderation stage.
///
/// The moderation model is instructed to answer with this exact JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationVerdict {
    pub allowed: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Plan produced by the scene-planner stage.
///
/// Drives the fan-out: one character-generation task (and later one
/// character-image task) per planned character, one card-image task per
/// planned card, plus the story preview image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenePlan {
    #[serde(default)]
    pub synopsis: String,
    pub characters: Vec<PlannedCharacter>,
    #[serde(default)]
    pub cards: Vec<PlannedCard>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedCharacter {
    pub name: String,
    #[serde(default)]
    pub brief: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedCard {
    pub title: String,
    #[serde(default)]
    pub image_prompt: String,
}
