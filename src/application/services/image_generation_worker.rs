//! Image generation worker - Consumes image generation tasks
//!
//! Same delivery discipline as the text worker, with a small prefetch. The
//! artifact filename is deterministic from the image reference, so a
//! redelivered task overwrites the same file instead of duplicating it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::application::dto::{GenerationTaskPayload, NotificationPayload};
use crate::application::ports::outbound::{
    BrokerPort, DeliveryPort, ImageModelError, ImageModelPort, ImageRequest, ImageStorePort,
    ResultStorePort,
};
use crate::application::services::backoff::{retry_with_backoff, RetryPolicy};
use crate::application::services::text_generation_worker::{HandleOutcome, WorkerMetrics};
use crate::application::services::{DynamicConfigService, TaskDispatchService};
use crate::domain::entities::GenerationResult;
use crate::infrastructure::broker::topology;

const DEFAULT_RATIO: &str = "2:3";
const STYLE_SUFFIX_KEY: &str = "generation.image_style_suffix";

pub struct ImageGenerationWorker {
    broker: Arc<dyn BrokerPort>,
    model: Arc<dyn ImageModelPort>,
    store: Arc<dyn ImageStorePort>,
    config: Arc<DynamicConfigService>,
    results: Arc<dyn ResultStorePort>,
    dispatch: Arc<TaskDispatchService>,
    policy: RetryPolicy,
    prefetch: u16,
    metrics: WorkerMetrics,
}

impl ImageGenerationWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        model: Arc<dyn ImageModelPort>,
        store: Arc<dyn ImageStorePort>,
        config: Arc<DynamicConfigService>,
        results: Arc<dyn ResultStorePort>,
        dispatch: Arc<TaskDispatchService>,
        policy: RetryPolicy,
        prefetch: u16,
    ) -> Self {
        Self {
            broker,
            model,
            store,
            config,
            results,
            dispatch,
            policy,
            prefetch,
            metrics: WorkerMetrics::default(),
        }
    }

    /// Consume the image task queue until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut stream = match self
            .broker
            .subscribe(topology::IMAGE_GENERATION_TASKS, self.prefetch)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("failed to subscribe to {}: {e}", topology::IMAGE_GENERATION_TASKS);
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
                tracing::error!("failed to settle delivery: {e}");
            }
            self.metrics.flush("image_generation");
        }
        tracing::info!("image generation worker stopped");
    }

    /// Handle one raw delivery payload.
    pub async fn handle(&self, payload: &[u8]) -> HandleOutcome {
        let task: GenerationTaskPayload = match serde_json::from_slice(payload) {
            Ok(task) => task,
            Err(e) => {
                self.metrics.task_parse_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("unparseable image task payload, dead-lettering: {e}");
                return HandleOutcome::NackDead;
            }
        };
        if !task.prompt_type.is_image() {
            tracing::warn!(task_id = %task.task_id, "text task on the image queue, dead-lettering");
            return HandleOutcome::NackDead;
        }
        let Some(reference) = task.image_reference.clone() else {
            tracing::warn!(task_id = %task.task_id, "image task without a reference, dead-lettering");
            return HandleOutcome::NackDead;
        };
        self.process(task, reference).await
    }

    async fn process(&self, task: GenerationTaskPayload, reference: String) -> HandleOutcome {
        let started = Instant::now();
        tracing::info!(task_id = %task.task_id, reference, "processing image task");

        let style_suffix = self.config.get(STYLE_SUFFIX_KEY).await.unwrap_or_default();
        let prompt = if style_suffix.is_empty() {
            task.user_input.clone()
        } else {
            format!("{}, {}", task.user_input, style_suffix)
        };
        let request = ImageRequest {
            prompt,
            ratio: task.ratio.clone().unwrap_or_else(|| DEFAULT_RATIO.to_string()),
        };

        let model = self.model.clone();
        let timeout = self.policy.timeout;
        let generated = retry_with_backoff(&self.policy, ImageModelError::is_retriable, |attempt| {
            let request = request.clone();
            let model = model.clone();
            async move {
                tracing::debug!(attempt, "calling image model");
                match tokio::time::timeout(timeout, model.generate(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(ImageModelError::Timeout),
                }
            }
        })
        .await;

        let elapsed_ms = started.elapsed().as_millis() as i64;
        match generated {
            Ok(bytes) => {
                let url = match self.store.store(&reference, &bytes).await {
                    Ok(url) => url,
                    Err(e) => {
                        tracing::error!("failed to store image artifact: {e}");
                        return HandleOutcome::NackRequeue;
                    }
                };
                let result = GenerationResult::success(
                    task.task_id,
                    task.user_id,
                    task.prompt_type,
                    url,
                    elapsed_ms,
                    0,
                    0,
                    0.0,
                );
                if let Err(e) = self.results.insert(&result).await {
                    tracing::error!("failed to persist image result: {e}");
                    return HandleOutcome::NackRequeue;
                }
                if let Err(e) = self
                    .dispatch
                    .notify(
                        topology::IMAGE_GENERATOR_RESULTS,
                        &NotificationPayload::success(&task),
                    )
                    .await
                {
                    tracing::error!("failed to publish image completion: {e}");
                    return HandleOutcome::NackRequeue;
                }
                self.metrics.tasks_processed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(task_id = %task.task_id, elapsed_ms, "image task completed");
                HandleOutcome::Ack
            }
            Err(e) => {
                tracing::warn!(task_id = %task.task_id, "image generation failed: {e}");
                let result = GenerationResult::failure(
                    task.task_id,
                    task.user_id,
                    task.prompt_type,
                    e.to_string(),
                    elapsed_ms,
                );
                if let Err(err) = self.results.insert(&result).await {
                    tracing::error!("failed to persist image error result: {err}");
                    return HandleOutcome::NackRequeue;
                }
                if let Err(err) = self
                    .dispatch
                    .notify(
                        topology::IMAGE_GENERATOR_RESULTS,
                        &NotificationPayload::error(&task, e.to_string()),
                    )
                    .await
                {
                    tracing::error!("failed to publish image error notification: {err}");
                    return HandleOutcome::NackRequeue;
                }
                self.metrics.tasks_failed.fetch_add(1, Ordering::Relaxed);
                HandleOutcome::Ack
            }
        }
    }
}
