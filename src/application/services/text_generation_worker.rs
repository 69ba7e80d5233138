//! Text generation worker - Consumes story generation tasks
//!
//! One delivery in flight per worker (prefetch 1); horizontal scale is more
//! replicas. Per delivery: parse the envelope, resolve prompts, call the LLM
//! with bounded retries, persist the result row, emit the completion
//! notification, then ack. The notification goes out before the ack, so the
//! state machine downstream has to tolerate duplicates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::application::dto::{GenerationTaskPayload, NotificationPayload};
use crate::application::ports::outbound::{
    BrokerPort, ChatMessage, DeliveryPort, LlmError, LlmPort, LlmRequest, MessageRole,
};
use crate::application::ports::outbound::ResultStorePort;
use crate::application::services::backoff::{retry_with_backoff, RetryPolicy};
use crate::application::services::prompt_service::{PromptError, SYSTEM_PROMPT_KEY};
use crate::application::services::{DynamicConfigService, PromptService, TaskDispatchService};
use crate::domain::entities::GenerationResult;
use crate::infrastructure::broker::topology;

const TEMPERATURE_KEY: &str = "ai.temperature";
const PROMPT_PRICE_KEY: &str = "ai.prompt_token_price_per_1k";
const COMPLETION_PRICE_KEY: &str = "ai.completion_token_price_per_1k";

/// What to do with the delivery once handling finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Ack,
    /// Transient infrastructure failure; the broker redelivers.
    NackRequeue,
    /// Payload-attributable failure; the message dead-letters.
    NackDead,
}

/// Counters flushed (logged) at the end of every task so short-lived
/// replicas do not lose them.
#[derive(Default)]
pub struct WorkerMetrics {
    pub tasks_processed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub task_parse_errors: AtomicU64,
}

impl WorkerMetrics {
    pub(crate) fn flush(&self, worker: &str) {
        tracing::info!(
            worker,
            tasks_processed = self.tasks_processed.load(Ordering::Relaxed),
            tasks_failed = self.tasks_failed.load(Ordering::Relaxed),
            task_parse_errors = self.task_parse_errors.load(Ordering::Relaxed),
            "task metrics"
        );
    }
}

pub struct TextGenerationWorker {
    broker: Arc<dyn BrokerPort>,
    llm: Arc<dyn LlmPort>,
    prompts: Arc<PromptService>,
    config: Arc<DynamicConfigService>,
    results: Arc<dyn ResultStorePort>,
    dispatch: Arc<TaskDispatchService>,
    policy: RetryPolicy,
    metrics: WorkerMetrics,
}

impl TextGenerationWorker {
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        llm: Arc<dyn LlmPort>,
        prompts: Arc<PromptService>,
        config: Arc<DynamicConfigService>,
        results: Arc<dyn ResultStorePort>,
        dispatch: Arc<TaskDispatchService>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            broker,
            llm,
            prompts,
            config,
            results,
            dispatch,
            policy,
            metrics: WorkerMetrics::default(),
        }
    }

    /// Consume the text task queue until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut stream = match self.broker.subscribe(topology::STORY_GENERATION_TASKS, 1).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("failed to subscribe to {}: {e}", topology::STORY_GENERATION_TASKS);
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
            self.metrics.flush("text_generation");
        }
        tracing::info!("text generation worker stopped");
    }

    /// Handle one raw delivery payload.
    pub async fn handle(&self, payload: &[u8]) -> HandleOutcome {
        let task: GenerationTaskPayload = match serde_json::from_slice(payload) {
            Ok(task) => task,
            Err(e) => {
                self.metrics.task_parse_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("unparseable task payload, dead-lettering: {e}");
                return HandleOutcome::NackDead;
            }
        };
        if task.prompt_type.is_image() {
            tracing::warn!(task_id = %task.task_id, "image task on the text queue, dead-lettering");
            return HandleOutcome::NackDead;
        }
        self.process(task).await
    }

    async fn process(&self, task: GenerationTaskPayload) -> HandleOutcome {
        let started = Instant::now();
        tracing::info!(task_id = %task.task_id, prompt_type = %task.prompt_type, "processing text task");

        let rendered = match self.render_prompts(&task).await {
            Ok(rendered) => rendered,
            Err(e) => {
                // Attributable to missing data, not to infrastructure: the
                // task reaches a terminal failed attempt and is consumed.
                return self
                    .finish_error(&task, e.to_string(), started.elapsed().as_millis() as i64)
                    .await;
            }
        };

        let temperature = self.config.get_f64(TEMPERATURE_KEY, 0.7).await as f32;
        let request = LlmRequest::new(vec![ChatMessage {
            role: MessageRole::User,
            content: rendered.task_prompt,
        }])
        .with_system_prompt(rendered.system_prompt)
        .with_temperature(temperature);

        let llm = self.llm.clone();
        let timeout = self.policy.timeout;
        let generated = retry_with_backoff(&self.policy, LlmError::is_retriable, |attempt| {
            let request = request.clone();
            let llm = llm.clone();
            async move {
                tracing::debug!(attempt, "calling LLM");
                match tokio::time::timeout(timeout, llm.generate(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout),
                }
            }
        })
        .await;

        let elapsed_ms = started.elapsed().as_millis() as i64;
        match generated {
            Ok(response) => {
                let cost = self
                    .estimate_cost(response.usage.prompt_tokens, response.usage.completion_tokens)
                    .await;
                let result = GenerationResult::success(
                    task.task_id,
                    task.user_id,
                    task.prompt_type,
                    response.content,
                    elapsed_ms,
                    response.usage.prompt_tokens,
                    response.usage.completion_tokens,
                    cost,
                );
                if let Err(e) = self.results.insert(&result).await {
                    tracing::error!("failed to persist generation result: {e}");
                    return HandleOutcome::NackRequeue;
                }
                if let Err(e) = self
                    .dispatch
                    .notify(topology::INTERNAL_UPDATES, &NotificationPayload::success(&task))
                    .await
                {
                    tracing::error!("failed to publish completion notification: {e}");
                    return HandleOutcome::NackRequeue;
                }
                self.metrics.tasks_processed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(task_id = %task.task_id, elapsed_ms, "text task completed");
                HandleOutcome::Ack
            }
            Err(e) => {
                tracing::warn!(task_id = %task.task_id, "LLM generation failed: {e}");
                self.finish_error(&task, e.to_string(), elapsed_ms).await
            }
        }
    }

    async fn render_prompts(&self, task: &GenerationTaskPayload) -> Result<RenderedPrompts, PromptError> {
        let system_prompt = self
            .prompts
            .get_prompt(SYSTEM_PROMPT_KEY, &task.language)
            .await?;
        let task_prompt = self
            .prompts
            .render(task.prompt_type.prompt_key(), &task.language, &task.user_input)
            .await?;
        Ok(RenderedPrompts {
            system_prompt,
            task_prompt,
        })
    }

    async fn estimate_cost(&self, prompt_tokens: i64, completion_tokens: i64) -> f64 {
        let prompt_price = self.config.get_f64(PROMPT_PRICE_KEY, 0.0).await;
        let completion_price = self.config.get_f64(COMPLETION_PRICE_KEY, 0.0).await;
        (prompt_tokens as f64 / 1000.0) * prompt_price
            + (completion_tokens as f64 / 1000.0) * completion_price
    }

    /// Persist a failed terminal attempt and notify; the delivery itself is
    /// consumed successfully.
    async fn finish_error(
        &self,
        task: &GenerationTaskPayload,
        error: String,
        elapsed_ms: i64,
    ) -> HandleOutcome {
        let result = GenerationResult::failure(
            task.task_id,
            task.user_id,
            task.prompt_type,
            error.clone(),
            elapsed_ms,
        );
        if let Err(e) = self.results.insert(&result).await {
            tracing::error!("failed to persist error result: {e}");
            return HandleOutcome::NackRequeue;
        }
        if let Err(e) = self
            .dispatch
            .notify(topology::INTERNAL_UPDATES, &NotificationPayload::error(task, error))
            .await
        {
            tracing::error!("failed to publish error notification: {e}");
            return HandleOutcome::NackRequeue;
        }
        self.metrics.tasks_failed.fetch_add(1, Ordering::Relaxed);
        HandleOutcome::Ack
    }
}

struct RenderedPrompts {
    system_prompt: String,
    task_prompt: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::application::ports::outbound::{
        ConfigStorePort, LlmResponse, PromptStorePort, RepositoryError, TokenUsage,
    };
    use crate::domain::entities::Prompt;
    use crate::domain::value_objects::{NotificationStatus, PromptType, TaskId, UserId};
    use crate::infrastructure::broker::InMemoryBroker;
    use crate::infrastructure::persistence::InMemoryResultStore;

    struct ScriptedLlm {
        calls: AtomicU32,
        /// Number of failures before a success; u32::MAX fails forever.
        failures: u32,
    }

    #[async_trait]
    impl LlmPort for ScriptedLlm {
        async fn generate(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(LlmError::Transient("503 from provider".to_string()))
            } else {
                Ok(LlmResponse {
                    content: "Once upon a time".to_string(),
                    usage: TokenUsage {
                        prompt_tokens: 12,
                        completion_tokens: 34,
                    },
                })
            }
        }
    }

    struct SeededPrompts;

    #[async_trait]
    impl PromptStorePort for SeededPrompts {
        async fn load_all(&self) -> Result<Vec<Prompt>, RepositoryError> {
            Ok(vec![
                Prompt {
                    key: "system".into(),
                    language: "en".into(),
                    content: "You narrate interactive novels.".into(),
                },
                Prompt {
                    key: "narrator".into(),
                    language: "en".into(),
                    content: "Premise: {{USER_INPUT}}".into(),
                },
            ])
        }
    }

    struct EmptyConfig;

    #[async_trait]
    impl ConfigStorePort for EmptyConfig {
        async fn load_all(&self) -> Result<Vec<(String, String)>, RepositoryError> {
            Ok(vec![])
        }
    }

    struct Harness {
        worker: TextGenerationWorker,
        broker: Arc<InMemoryBroker>,
        results: Arc<InMemoryResultStore>,
        llm: Arc<ScriptedLlm>,
    }

    async fn harness(llm_failures: u32, max_attempts: u32) -> Harness {
        let broker = Arc::new(InMemoryBroker::new());
        for queue in topology::TASK_QUEUES {
            broker.declare(queue);
        }
        let config = Arc::new(DynamicConfigService::new(Arc::new(EmptyConfig)));
        config.load().await.unwrap();
        let prompts = Arc::new(PromptService::new(Arc::new(SeededPrompts), config.clone()));
        prompts.load().await.unwrap();
        let results = Arc::new(InMemoryResultStore::new());
        let llm = Arc::new(ScriptedLlm {
            calls: AtomicU32::new(0),
            failures: llm_failures,
        });
        let worker = TextGenerationWorker::new(
            broker.clone(),
            llm.clone(),
            prompts,
            config,
            results.clone(),
            Arc::new(TaskDispatchService::new(broker.clone())),
            RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(1),
                timeout: Duration::from_secs(5),
            },
        );
        Harness {
            worker,
            broker,
            results,
            llm,
        }
    }

    fn narrator_task() -> GenerationTaskPayload {
        GenerationTaskPayload::new(UserId::new(), PromptType::Narrator, "en")
            .with_user_input("a dark fantasy about a baker")
    }

    async fn drain_notification(broker: &InMemoryBroker) -> NotificationPayload {
        let body = broker
            .take_published(topology::INTERNAL_UPDATES)
            .expect("a notification should have been published");
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn happy_narrator_persists_result_and_notifies_success() {
        let h = harness(0, 3).await;
        let task = narrator_task();

        let outcome = h.worker.handle(&serde_json::to_vec(&task).unwrap()).await;
        assert_eq!(outcome, HandleOutcome::Ack);

        let result = h.results.get(task.task_id).await.unwrap().unwrap();
        assert!(result.is_success());
        assert_eq!(result.text, "Once upon a time");
        assert_eq!(result.prompt_tokens, 12);

        let notif = drain_notification(&h.broker).await;
        assert_eq!(notif.task_id, task.task_id);
        assert_eq!(notif.status, NotificationStatus::Success);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let h = harness(2, 3).await;
        let task = narrator_task();

        let outcome = h.worker.handle(&serde_json::to_vec(&task).unwrap()).await;
        assert_eq!(outcome, HandleOutcome::Ack);
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 3);

        let result = h.results.get(task.task_id).await.unwrap().unwrap();
        assert!(result.is_success());
        assert_eq!(drain_notification(&h.broker).await.status, NotificationStatus::Success);
    }

    #[tokio::test]
    async fn exhaustion_persists_error_and_acks() {
        let h = harness(u32::MAX, 3).await;
        let task = narrator_task();

        let outcome = h.worker.handle(&serde_json::to_vec(&task).unwrap()).await;
        assert_eq!(outcome, HandleOutcome::Ack);
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 3);

        let result = h.results.get(task.task_id).await.unwrap().unwrap();
        assert!(!result.is_success());
        assert!(result.error.contains("503"));

        let notif = drain_notification(&h.broker).await;
        assert_eq!(notif.status, NotificationStatus::Error);
        assert!(notif.error_details.contains("503"));
    }

    #[tokio::test]
    async fn missing_prompt_is_a_terminal_task_failure() {
        let h = harness(0, 3).await;
        let task = GenerationTaskPayload::new(UserId::new(), PromptType::Setup, "en");

        let outcome = h.worker.handle(&serde_json::to_vec(&task).unwrap()).await;
        assert_eq!(outcome, HandleOutcome::Ack);
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 0);

        let result = h.results.get(task.task_id).await.unwrap().unwrap();
        assert!(result.error.contains("prompt not found"));
        assert_eq!(drain_notification(&h.broker).await.status, NotificationStatus::Error);
    }

    #[tokio::test]
    async fn unparseable_payload_dead_letters() {
        let h = harness(0, 3).await;
        let outcome = h.worker.handle(b"not json").await;
        assert_eq!(outcome, HandleOutcome::NackDead);
        assert!(h.broker.take_published(topology::INTERNAL_UPDATES).is_none());
    }

    #[tokio::test]
    async fn run_consumes_deliveries_until_shutdown() {
        let h = harness(0, 3).await;
        let task = narrator_task();
        h.broker
            .publish(
                topology::STORY_GENERATION_TASKS,
                serde_json::to_vec(&task).unwrap(),
                &task.task_id.to_string(),
            )
            .await
            .unwrap();

        let worker = Arc::new(h.worker);
        let shutdown = CancellationToken::new();
        let run = {
            let worker = worker.clone();
            let token = shutdown.clone();
            tokio::spawn(async move { worker.run(token).await })
        };

        let mut processed = false;
        for _ in 0..200 {
            if h.results.get(task.task_id).await.unwrap().is_some() {
                processed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(processed, "worker should have consumed the task");
        assert_eq!(h.broker.depth(topology::STORY_GENERATION_TASKS), 0);

        shutdown.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn unparseable_delivery_lands_on_the_dlq_exactly_once() {
        let h = harness(0, 3).await;
        h.broker
            .publish(topology::STORY_GENERATION_TASKS, b"not json".to_vec(), "t-err")
            .await
            .unwrap();

        let worker = Arc::new(h.worker);
        let shutdown = CancellationToken::new();
        let run = {
            let worker = worker.clone();
            let token = shutdown.clone();
            tokio::spawn(async move { worker.run(token).await })
        };

        let dlq = topology::dlq_name(topology::STORY_GENERATION_TASKS);
        let mut dead_lettered = false;
        for _ in 0..200 {
            if h.broker.depth(&dlq) == 1 {
                dead_lettered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(dead_lettered, "payload should have been dead-lettered");
        assert_eq!(h.broker.depth(topology::STORY_GENERATION_TASKS), 0);

        shutdown.cancel();
        run.await.unwrap();
        // Never redelivered to the live queue
        assert_eq!(h.broker.depth(topology::STORY_GENERATION_TASKS), 0);
        assert_eq!(h.broker.depth(&dlq), 1);
    }

    #[tokio::test]
    async fn result_row_is_keyed_by_task_id() {
        let h = harness(0, 3).await;
        let task = narrator_task();
        let other = TaskId::new();

        h.worker.handle(&serde_json::to_vec(&task).unwrap()).await;
        assert!(h.results.get(other).await.unwrap().is_none());
        assert!(h.results.get(task.task_id).await.unwrap().is_some());
    }
}
