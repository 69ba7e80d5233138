//! Value objects - Immutable objects defined by their attributes

mod generation;
mod ids;
mod prompt_type;
mod status;

pub use generation::{ModerationVerdict, PlannedCard, PlannedCharacter, ScenePlan};
pub use ids::*;
pub use prompt_type::PromptType;
pub use status::{ConfigStatus, GameStateStatus, GenerationStep, NotificationStatus, StoryStatus};
