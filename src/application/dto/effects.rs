//! Follow-up effects computed inside a state-machine transaction
//!
//! A transition decides what happens next (tasks, pushes) while the row is
//! locked, but nothing is published until the transaction has committed.
//! The consumer collects these and dispatches them post-commit.

use crate::application::dto::wire::{GenerationTaskPayload, PushNotificationPayload};

#[derive(Debug, Clone)]
pub enum FollowUp {
    /// Publish a generation task to its worker queue.
    Dispatch(GenerationTaskPayload),
    /// Fan a push notification out to the user's devices.
    Push(PushNotificationPayload),
}
