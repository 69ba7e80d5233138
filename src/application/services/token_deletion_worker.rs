//! Token deletion worker - Purges device tokens the platforms rejected

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::application::dto::TokenDeletionPayload;
use crate::application::ports::outbound::{AuthServicePort, BrokerPort, DeliveryPort};
use crate::application::services::text_generation_worker::HandleOutcome;
use crate::infrastructure::broker::topology;

pub struct TokenDeletionWorker {
    broker: Arc<dyn BrokerPort>,
    auth: Arc<dyn AuthServicePort>,
}

impl TokenDeletionWorker {
    pub fn new(broker: Arc<dyn BrokerPort>, auth: Arc<dyn AuthServicePort>) -> Self {
        Self { broker, auth }
    }

    /// Consume the token-deletion queue until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut stream = match self
            .broker
            .subscribe(topology::AUTH_TOKEN_DELETIONS, 1)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("failed to subscribe to {}: {e}", topology::AUTH_TOKEN_DELETIONS);
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
                tracing::error!("failed to settle token deletion delivery: {e}");
            }
        }
        tracing::info!("token deletion worker stopped");
    }

    /// Handle one raw deletion payload.
    pub async fn handle(&self, payload: &[u8]) -> HandleOutcome {
        let deletion: TokenDeletionPayload = match serde_json::from_slice(payload) {
            Ok(deletion) => deletion,
            Err(e) => {
                tracing::warn!("unparseable token deletion payload, dead-lettering: {e}");
                return HandleOutcome::NackDead;
            }
        };

        match self.auth.delete_token(deletion.user_id, &deletion.token).await {
            Ok(()) => {
                tracing::info!(user_id = %deletion.user_id, "purged invalid device token");
                HandleOutcome::Ack
            }
            Err(e) if e.is_transient() => {
                tracing::warn!("auth service unavailable, requeueing token deletion: {e}");
                HandleOutcome::NackRequeue
            }
            Err(e) => {
                // Already purged or never existed; nothing left to do.
                tracing::warn!(user_id = %deletion.user_id, "token purge rejected: {e}");
                HandleOutcome::Ack
            }
        }
    }
}
