//! Push service - Fans a push payload out to a user's devices
//!
//! Tokens come from the auth service; platform senders run concurrently.
//! A token-level rejection never fails the batch: the bad token is queued
//! for deletion and the delivery still acks.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::application::dto::{PushNotificationPayload, TokenDeletionPayload};
use crate::application::ports::outbound::{
    AuthServicePort, BrokerPort, DeliveryPort, PlatformSenderPort, PushError,
};
use crate::application::services::text_generation_worker::HandleOutcome;
use crate::application::services::TaskDispatchService;
use crate::domain::entities::DeviceToken;
use crate::infrastructure::broker::topology;

const PUSH_PREFETCH: u16 = 8;

pub struct PushService {
    broker: Arc<dyn BrokerPort>,
    auth: Arc<dyn AuthServicePort>,
    senders: Vec<Arc<dyn PlatformSenderPort>>,
    dispatch: Arc<TaskDispatchService>,
}

impl PushService {
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        auth: Arc<dyn AuthServicePort>,
        senders: Vec<Arc<dyn PlatformSenderPort>>,
        dispatch: Arc<TaskDispatchService>,
    ) -> Self {
        Self {
            broker,
            auth,
            senders,
            dispatch,
        }
    }

    /// Consume the push queue until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut stream = match self
            .broker
            .subscribe(topology::PUSH_NOTIFICATIONS, PUSH_PREFETCH)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("failed to subscribe to {}: {e}", topology::PUSH_NOTIFICATIONS);
                return;
            }
        };

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = stream.next() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let outcome = self.handle(delivery.payload()).await;
            let settle = match outcome {
                HandleOutcome::Ack => delivery.ack().await,
                HandleOutcome::NackRequeue => delivery.nack(true).await,
                HandleOutcome::NackDead => delivery.nack(false).await,
            };
            if let Err(e) = settle {
                tracing::error!("failed to settle push delivery: {e}");
            }
        }
        tracing::info!("push service stopped");
    }

    /// Handle one raw push payload.
    pub async fn handle(&self, payload: &[u8]) -> HandleOutcome {
        let push: PushNotificationPayload = match serde_json::from_slice(payload) {
            Ok(push) => push,
            Err(e) => {
                tracing::warn!("unparseable push payload, dead-lettering: {e}");
                return HandleOutcome::NackDead;
            }
        };

        let tokens = match self.auth.device_tokens(push.user_id).await {
            Ok(tokens) => tokens,
            Err(e) if e.is_transient() => {
                tracing::warn!("auth service unavailable, requeueing: {e}");
                return HandleOutcome::NackRequeue;
            }
            Err(e) => {
                tracing::warn!(user_id = %push.user_id, "cannot resolve device tokens: {e}");
                return HandleOutcome::Ack;
            }
        };
        if tokens.is_empty() {
            tracing::debug!(user_id = %push.user_id, "no device tokens registered");
            return HandleOutcome::Ack;
        }

        let sends = self.senders.iter().map(|sender| {
            let platform_tokens: Vec<String> = tokens
                .iter()
                .filter(|t| t.platform == sender.platform())
                .map(|t| t.token.clone())
                .collect();
            let push = &push;
            async move {
                if platform_tokens.is_empty() {
                    return (sender.platform(), Ok(Default::default()));
                }
                let report = sender
                    .send(&platform_tokens, &push.notification, &push.data)
                    .await;
                (sender.platform(), report)
            }
        });

        let mut invalid: Vec<String> = Vec::new();
        let mut transient_failure = false;
        for (platform, outcome) in join_all(sends).await {
            match outcome {
                Ok(report) => invalid.extend(report.invalid_tokens),
                Err(PushError::Transient(e)) => {
                    tracing::warn!(?platform, "push send failed transiently: {e}");
                    transient_failure = true;
                }
                Err(PushError::Terminal(e)) => {
                    tracing::error!(?platform, "push send failed terminally: {e}");
                }
            }
        }

        if let Err(outcome) = self.reap_invalid(&push, &tokens, invalid).await {
            return outcome;
        }
        if transient_failure {
            return HandleOutcome::NackRequeue;
        }
        HandleOutcome::Ack
    }

    async fn reap_invalid(
        &self,
        push: &PushNotificationPayload,
        tokens: &[DeviceToken],
        invalid: Vec<String>,
    ) -> Result<(), HandleOutcome> {
        for token in invalid {
            let Some(device) = tokens.iter().find(|t| t.token == token) else {
                continue;
            };
            tracing::info!(user_id = %push.user_id, "queueing invalid token for deletion");
            let payload = TokenDeletionPayload {
                user_id: push.user_id,
                token: device.token.clone(),
                platform: device.platform,
            };
            if let Err(e) = self.dispatch.queue_token_deletion(&payload).await {
                tracing::error!("failed to queue token deletion: {e}");
                return Err(HandleOutcome::NackRequeue);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::application::dto::PushMessage;
    use crate::application::ports::outbound::{AuthServiceError, SendReport};
    use crate::domain::entities::Platform;
    use crate::domain::value_objects::UserId;
    use crate::infrastructure::broker::InMemoryBroker;

    struct FixedAuth(Vec<DeviceToken>);

    #[async_trait]
    impl AuthServicePort for FixedAuth {
        async fn device_tokens(&self, _user_id: UserId) -> Result<Vec<DeviceToken>, AuthServiceError> {
            Ok(self.0.clone())
        }

        async fn delete_token(&self, _user_id: UserId, _token: &str) -> Result<(), AuthServiceError> {
            Ok(())
        }
    }

    struct ScriptedSender {
        platform: Platform,
        invalid: Vec<String>,
        sent: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl PlatformSenderPort for ScriptedSender {
        fn platform(&self) -> Platform {
            self.platform
        }

        async fn send(
            &self,
            tokens: &[String],
            _message: &PushMessage,
            _data: &HashMap<String, String>,
        ) -> Result<SendReport, PushError> {
            self.sent.lock().unwrap().push(tokens.to_vec());
            Ok(SendReport {
                invalid_tokens: self.invalid.clone(),
            })
        }
    }

    fn token(user: UserId, token: &str, platform: Platform) -> DeviceToken {
        DeviceToken {
            user_id: user,
            token: token.to_string(),
            platform,
        }
    }

    fn push_payload(user: UserId) -> Vec<u8> {
        serde_json::to_vec(&PushNotificationPayload {
            user_id: user,
            notification: PushMessage {
                title: "Your story is ready".into(),
                body: "The first scene awaits.".into(),
            },
            data: HashMap::new(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn fans_out_by_platform() {
        let user = UserId::new();
        let broker = Arc::new(InMemoryBroker::new());
        for queue in topology::TASK_QUEUES {
            broker.declare(queue);
        }
        let android = Arc::new(ScriptedSender {
            platform: Platform::Android,
            invalid: vec![],
            sent: Mutex::new(vec![]),
        });
        let ios = Arc::new(ScriptedSender {
            platform: Platform::Ios,
            invalid: vec![],
            sent: Mutex::new(vec![]),
        });
        let service = PushService::new(
            broker.clone(),
            Arc::new(FixedAuth(vec![
                token(user, "and-1", Platform::Android),
                token(user, "ios-1", Platform::Ios),
                token(user, "and-2", Platform::Android),
            ])),
            vec![
                android.clone() as Arc<dyn PlatformSenderPort>,
                ios.clone() as Arc<dyn PlatformSenderPort>,
            ],
            Arc::new(TaskDispatchService::new(broker.clone())),
        );

        let outcome = service.handle(&push_payload(user)).await;
        assert_eq!(outcome, HandleOutcome::Ack);
        assert_eq!(android.sent.lock().unwrap()[0], vec!["and-1", "and-2"]);
        assert_eq!(ios.sent.lock().unwrap()[0], vec!["ios-1"]);
    }

    #[tokio::test]
    async fn invalid_tokens_are_queued_for_deletion_without_failing_the_batch() {
        let user = UserId::new();
        let broker = Arc::new(InMemoryBroker::new());
        for queue in topology::TASK_QUEUES {
            broker.declare(queue);
        }
        let android = Arc::new(ScriptedSender {
            platform: Platform::Android,
            invalid: vec!["and-dead".to_string()],
            sent: Mutex::new(vec![]),
        });
        let service = PushService::new(
            broker.clone(),
            Arc::new(FixedAuth(vec![
                token(user, "and-dead", Platform::Android),
                token(user, "and-live", Platform::Android),
            ])),
            vec![android as Arc<dyn PlatformSenderPort>],
            Arc::new(TaskDispatchService::new(broker.clone())),
        );

        let outcome = service.handle(&push_payload(user)).await;
        assert_eq!(outcome, HandleOutcome::Ack);

        let deletion: TokenDeletionPayload = serde_json::from_slice(
            &broker.take_published(topology::AUTH_TOKEN_DELETIONS).unwrap(),
        )
        .unwrap();
        assert_eq!(deletion.token, "and-dead");
        assert_eq!(deletion.platform, Platform::Android);
        assert!(broker.take_published(topology::AUTH_TOKEN_DELETIONS).is_none());
    }

    #[tokio::test]
    async fn unparseable_push_dead_letters() {
        let broker = Arc::new(InMemoryBroker::new());
        for queue in topology::TASK_QUEUES {
            broker.declare(queue);
        }
        let service = PushService::new(
            broker.clone(),
            Arc::new(FixedAuth(vec![])),
            vec![],
            Arc::new(TaskDispatchService::new(broker)),
        );
        assert_eq!(service.handle(b"nope").await, HandleOutcome::NackDead);
    }
}
