//! Data transfer objects - wire payloads, transaction effects and API shapes

mod api;
mod effects;
mod wire;

pub use api::{
    CreateDraftRequest, DraftCreated, DraftSnapshot, GameStateSnapshot, MakeChoiceRequest,
    StartSessionRequest, StoryPublished, StorySnapshot, TaskAccepted, TaskStatusResponse,
};
pub use effects::FollowUp;
pub use wire::{
    ConfigUpdatePayload, GenerationTaskPayload, NotificationPayload, PromptUpdatePayload,
    PushMessage, PushNotificationPayload, TokenDeletionPayload, INITIAL_STATE_HASH,
};
