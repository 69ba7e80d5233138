//! Lifecycle statuses and the internal generation step

use serde::{Deserialize, Serialize};

/// Lifecycle of a published story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    /// Created, generation pipeline not yet started or in flight.
    Pending,
    /// Generation pipeline in flight.
    Generating,
    /// Fully generated and playable.
    Ready,
    Error,
}

impl StoryStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Error)
    }
}

/// Sub-status identifying which stage of the pipeline a story is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStep {
    Moderation,
    ProtagonistGoal,
    ScenePlanner,
    CharacterGeneration,
    CardImageGeneration,
    CharacterImageGeneration,
    SetupGeneration,
    FirstSceneGeneration,
    Done,
}

/// Lifecycle of a per-player game state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStateStatus {
    /// The player can make a choice.
    Playing,
    /// A scene generation task for this state is in flight (or will be reaped).
    Generating,
    /// The story ended for this character.
    Finished,
    Error,
}

impl GameStateStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }
}

/// Lifecycle of a user-facing draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigStatus {
    Draft,
    Generating,
    Error,
}

/// Outcome carried on a completion notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Success,
    Error,
}
