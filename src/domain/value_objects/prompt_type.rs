//! Prompt types - The generation stages a task can request

use serde::{Deserialize, Serialize};

/// The kind of generation a task asks a worker to perform.
///
/// The wire representation is the snake_case name; the same string doubles
/// as the prompt key looked up in the prompt cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptType {
    Narrator,
    ContentModeration,
    ProtagonistGoal,
    ScenePlanner,
    CharacterGeneration,
    Setup,
    SceneJson,
    GameOver,
    CardImage,
    CharacterImage,
    StoryPreviewImage,
}

impl PromptType {
    /// Prompt-cache key for this task type.
    pub fn prompt_key(&self) -> &'static str {
        match self {
            Self::Narrator => "narrator",
            Self::ContentModeration => "content_moderation",
            Self::ProtagonistGoal => "protagonist_goal",
            Self::ScenePlanner => "scene_planner",
            Self::CharacterGeneration => "character_generation",
            Self::Setup => "setup",
            Self::SceneJson => "scene_json",
            Self::GameOver => "game_over",
            Self::CardImage => "card_image",
            Self::CharacterImage => "character_image",
            Self::StoryPreviewImage => "story_preview_image",
        }
    }

    /// Whether this task is handled by the image worker rather than the text worker.
    pub fn is_image(&self) -> bool {
        matches!(
            self,
            Self::CardImage | Self::CharacterImage | Self::StoryPreviewImage
        )
    }
}

impl std::fmt::Display for PromptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prompt_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_snake_case() {
        let json = serde_json::to_string(&PromptType::ContentModeration).unwrap();
        assert_eq!(json, "\"content_moderation\"");

        let parsed: PromptType = serde_json::from_str("\"scene_json\"").unwrap();
        assert_eq!(parsed, PromptType::SceneJson);
    }

    #[test]
    fn image_kinds_are_classified() {
        assert!(PromptType::CardImage.is_image());
        assert!(PromptType::CharacterImage.is_image());
        assert!(PromptType::StoryPreviewImage.is_image());
        assert!(!PromptType::Narrator.is_image());
        assert!(!PromptType::SceneJson.is_image());
    }
}
