//! Shared application state

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::application::ports::outbound::{
    AuthServicePort, BrokerPort, ConfigStorePort, GameplayStorePort, PlatformSenderPort,
    PromptStorePort, ResultStorePort,
};
use crate::application::services::{
    CacheBusWorker, DynamicConfigService, ImageGenerationWorker, PromptService, PushService,
    ReaperThresholds, RetryPolicy, StoryPipelineService, StuckTaskReaper, TaskDispatchService,
    TextGenerationWorker, TokenDeletionWorker,
};
use crate::infrastructure::auth_client::AuthServiceClient;
use crate::infrastructure::broker::{topology, InMemoryBroker, RabbitBroker};
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::image_client::{FilesystemImageStore, ImageModelClient};
use crate::infrastructure::ollama::OllamaClient;
use crate::infrastructure::persistence::{
    InMemoryConfigStore, InMemoryGameplayStore, InMemoryPromptStore, InMemoryResultStore,
    PostgresConfigStore, PostgresGameplayStore, PostgresPromptStore, PostgresResultStore,
};
use crate::infrastructure::push::{ApnsSender, FcmSender};

/// Shared application state
pub struct AppState {
    pub config: AppConfig,
    pub broker: Arc<dyn BrokerPort>,
    pub store: Arc<dyn GameplayStorePort>,
    pub results: Arc<dyn ResultStorePort>,
    pub dynamic_config: Arc<DynamicConfigService>,
    pub prompts: Arc<PromptService>,
    pub dispatch: Arc<TaskDispatchService>,
    // Long-running workers, spawned by main
    pub text_worker: Arc<TextGenerationWorker>,
    pub image_worker: Arc<ImageGenerationWorker>,
    pub pipeline: Arc<StoryPipelineService>,
    pub push_service: Arc<PushService>,
    pub token_deletion_worker: Arc<TokenDeletionWorker>,
    pub cache_bus: Arc<CacheBusWorker>,
    pub reaper: Arc<StuckTaskReaper>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> Result<Self> {
        // Broker
        let broker: Arc<dyn BrokerPort> = match config.broker_backend.as_str() {
            "memory" => Arc::new(InMemoryBroker::new()),
            "rabbitmq" => Arc::new(
                RabbitBroker::connect(&config.broker_uri)
                    .await
                    .context("failed to connect to broker")?,
            ),
            backend => anyhow::bail!("unsupported broker backend: {backend}"),
        };
        for queue in topology::TASK_QUEUES {
            broker
                .declare_task_queue(queue)
                .await
                .with_context(|| format!("failed to declare queue {queue}"))?;
        }

        // Stores
        let (store, results, prompt_store, config_store): (
            Arc<dyn GameplayStorePort>,
            Arc<dyn ResultStorePort>,
            Arc<dyn PromptStorePort>,
            Arc<dyn ConfigStorePort>,
        ) = match config.store_backend.as_str() {
            "memory" => (
                Arc::new(InMemoryGameplayStore::new()),
                Arc::new(InMemoryResultStore::new()),
                Arc::new(InMemoryPromptStore::new(vec![])),
                Arc::new(InMemoryConfigStore::new(vec![])),
            ),
            "postgres" => {
                let pool = PgPool::connect(&config.database_url)
                    .await
                    .context("failed to connect to Postgres")?;
                (
                    Arc::new(PostgresGameplayStore::new(pool.clone()).await?),
                    Arc::new(PostgresResultStore::new(pool.clone()).await?),
                    Arc::new(PostgresPromptStore::new(pool.clone()).await?),
                    Arc::new(PostgresConfigStore::new(pool).await?),
                )
            }
            backend => anyhow::bail!("unsupported store backend: {backend}"),
        };

        // Caches
        let dynamic_config = Arc::new(DynamicConfigService::new(config_store));
        let loaded = dynamic_config.load().await?;
        tracing::info!(entries = loaded, "dynamic config loaded");
        let prompts = Arc::new(PromptService::new(prompt_store, dynamic_config.clone()));
        let loaded = prompts.load().await?;
        tracing::info!(entries = loaded, "prompts loaded");

        let dispatch = Arc::new(TaskDispatchService::new(broker.clone()));
        let policy = RetryPolicy {
            max_attempts: config.ai_max_attempts,
            base_delay: config.ai_base_retry_delay,
            timeout: config.ai_timeout,
        };

        // Workers
        let llm = Arc::new(OllamaClient::new(&config.ollama_base_url, &config.ollama_model));
        let text_worker = Arc::new(TextGenerationWorker::new(
            broker.clone(),
            llm,
            prompts.clone(),
            dynamic_config.clone(),
            results.clone(),
            dispatch.clone(),
            policy.clone(),
        ));

        let image_model = Arc::new(ImageModelClient::new(&config.image_model_url));
        let image_store = Arc::new(FilesystemImageStore::new(
            &config.image_output_dir,
            &config.image_public_base_url,
        ));
        let image_worker = Arc::new(ImageGenerationWorker::new(
            broker.clone(),
            image_model,
            image_store,
            dynamic_config.clone(),
            results.clone(),
            dispatch.clone(),
            policy,
            config.image_prefetch,
        ));

        let pipeline = Arc::new(StoryPipelineService::new(
            broker.clone(),
            store.clone(),
            results.clone(),
            dispatch.clone(),
        ));

        let auth: Arc<dyn AuthServicePort> = Arc::new(AuthServiceClient::new(
            &config.auth_service_url,
            &config.internal_service_token,
        ));
        let senders: Vec<Arc<dyn PlatformSenderPort>> = vec![
            Arc::new(FcmSender::new(&config.fcm_server_key)),
            Arc::new(ApnsSender::new(
                &config.apns_base_url,
                &config.apns_token,
                &config.apns_topic,
            )),
        ];
        let push_service = Arc::new(PushService::new(
            broker.clone(),
            auth.clone(),
            senders,
            dispatch.clone(),
        ));
        let token_deletion_worker = Arc::new(TokenDeletionWorker::new(broker.clone(), auth));

        let cache_bus = Arc::new(CacheBusWorker::new(
            broker.clone(),
            dynamic_config.clone(),
            prompts.clone(),
        ));

        let reaper = Arc::new(StuckTaskReaper::new(
            store.clone(),
            dispatch.clone(),
            ReaperThresholds {
                story_configs: config.reaper_story_config_threshold,
                published_stories: config.reaper_story_threshold,
                player_game_states: config.reaper_game_state_threshold,
            },
            config.reaper_interval,
        ));

        Ok(Self {
            config,
            broker,
            store,
            results,
            dynamic_config,
            prompts,
            dispatch,
            text_worker,
            image_worker,
            pipeline,
            push_service,
            token_deletion_worker,
            cache_bus,
            reaper,
        })
    }
}
