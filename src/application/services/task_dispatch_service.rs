//! Task dispatch service - Publishes envelopes to their well-known queues
//!
//! Single producer-side chokepoint: routes text tasks to the text queue,
//! image tasks to the image queue, and carries completion notifications,
//! pushes and token deletions for the other services.

use std::sync::Arc;

use crate::application::dto::{
    FollowUp, GenerationTaskPayload, NotificationPayload, PushNotificationPayload,
    TokenDeletionPayload,
};
use crate::application::ports::outbound::{BrokerError, BrokerPort};
use crate::infrastructure::broker::topology;

pub struct TaskDispatchService {
    broker: Arc<dyn BrokerPort>,
}

impl TaskDispatchService {
    pub fn new(broker: Arc<dyn BrokerPort>) -> Self {
        Self { broker }
    }

    /// Publish a generation task to its worker queue.
    pub async fn dispatch(&self, task: &GenerationTaskPayload) -> Result<(), BrokerError> {
        let queue = if task.prompt_type.is_image() {
            topology::IMAGE_GENERATION_TASKS
        } else {
            topology::STORY_GENERATION_TASKS
        };
        let body = serde_json::to_vec(task)
            .map_err(|e| BrokerError::Publish(format!("task serialization: {e}")))?;
        tracing::info!(
            task_id = %task.task_id,
            prompt_type = %task.prompt_type,
            queue,
            "dispatching generation task"
        );
        self.broker
            .publish(queue, body, &task.task_id.to_string())
            .await
    }

    /// Publish a completion notification to the given internal-updates queue.
    pub async fn notify(
        &self,
        queue: &str,
        notification: &NotificationPayload,
    ) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(notification)
            .map_err(|e| BrokerError::Publish(format!("notification serialization: {e}")))?;
        self.broker
            .publish(queue, body, &notification.task_id.to_string())
            .await
    }

    pub async fn push(&self, payload: &PushNotificationPayload) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| BrokerError::Publish(format!("push serialization: {e}")))?;
        self.broker
            .publish(topology::PUSH_NOTIFICATIONS, body, &payload.user_id.to_string())
            .await
    }

    pub async fn queue_token_deletion(
        &self,
        payload: &TokenDeletionPayload,
    ) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| BrokerError::Publish(format!("token deletion serialization: {e}")))?;
        self.broker
            .publish(topology::AUTH_TOKEN_DELETIONS, body, &payload.user_id.to_string())
            .await
    }

    /// Dispatch the effects a committed transition produced.
    pub async fn dispatch_follow_ups(&self, follow_ups: Vec<FollowUp>) -> Result<(), BrokerError> {
        for follow_up in follow_ups {
            match follow_up {
                FollowUp::Dispatch(task) => self.dispatch(&task).await?,
                FollowUp::Push(payload) => self.push(&payload).await?,
            }
        }
        Ok(())
    }
}
