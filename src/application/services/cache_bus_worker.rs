//! Cache bus worker - Keeps the prompt and dynamic-config caches coherent
//!
//! Every process binds its own queue to the cache-invalidation exchange and
//! applies `config.updated` and prompt CUD events under the writer side of
//! the cache locks.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::application::dto::{ConfigUpdatePayload, PromptUpdatePayload};
use crate::application::ports::outbound::{BrokerPort, DeliveryPort};
use crate::application::services::text_generation_worker::HandleOutcome;
use crate::application::services::{DynamicConfigService, PromptService};
use crate::infrastructure::broker::topology;

pub struct CacheBusWorker {
    broker: Arc<dyn BrokerPort>,
    config: Arc<DynamicConfigService>,
    prompts: Arc<PromptService>,
}

impl CacheBusWorker {
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        config: Arc<DynamicConfigService>,
        prompts: Arc<PromptService>,
    ) -> Self {
        Self {
            broker,
            config,
            prompts,
        }
    }

    /// Consume the cache-invalidation exchange until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut stream = match self.broker.subscribe_events().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("failed to subscribe to cache events: {e}");
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

            let routing_key = delivery.routing_key().to_string();
            let outcome = self.handle(&routing_key, delivery.payload()).await;
            let settle = match outcome {
                HandleOutcome::Ack => delivery.ack().await,
                HandleOutcome::NackRequeue => delivery.nack(true).await,
                HandleOutcome::NackDead => delivery.nack(false).await,
            };
            if let Err(e) = settle {
                tracing::error!("failed to settle cache event: {e}");
            }
        }
        tracing::info!("cache bus worker stopped");
    }

    /// Apply one cache event.
    pub async fn handle(&self, routing_key: &str, payload: &[u8]) -> HandleOutcome {
        match routing_key {
            topology::CONFIG_UPDATED_KEY => {
                let update: ConfigUpdatePayload = match serde_json::from_slice(payload) {
                    Ok(update) => update,
                    Err(e) => {
                        tracing::warn!("unparseable config update: {e}");
                        return HandleOutcome::NackDead;
                    }
                };
                self.config.apply_update(update.key, update.value).await;
                HandleOutcome::Ack
            }
            topology::PROMPT_CREATED_KEY | topology::PROMPT_UPDATED_KEY => {
                let update: PromptUpdatePayload = match serde_json::from_slice(payload) {
                    Ok(update) => update,
                    Err(e) => {
                        tracing::warn!("unparseable prompt update: {e}");
                        return HandleOutcome::NackDead;
                    }
                };
                let Some(content) = update.content else {
                    tracing::warn!(key = update.key, "prompt upsert without content");
                    return HandleOutcome::NackDead;
                };
                self.prompts.apply_upsert(update.key, update.language, content).await;
                HandleOutcome::Ack
            }
            topology::PROMPT_DELETED_KEY => {
                let update: PromptUpdatePayload = match serde_json::from_slice(payload) {
                    Ok(update) => update,
                    Err(e) => {
                        tracing::warn!("unparseable prompt deletion: {e}");
                        return HandleOutcome::NackDead;
                    }
                };
                self.prompts.apply_delete(&update.key, &update.language).await;
                HandleOutcome::Ack
            }
            other => {
                tracing::debug!(routing_key = other, "ignoring unknown cache event");
                HandleOutcome::Ack
            }
        }
    }
}
