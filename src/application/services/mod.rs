//! Application services - The pipeline's long-running concerns

pub mod backoff;
mod cache_bus_worker;
mod dynamic_config_service;
mod image_generation_worker;
mod prompt_service;
mod push_service;
mod story_pipeline_service;
mod stuck_task_reaper;
mod task_dispatch_service;
mod text_generation_worker;
mod token_deletion_worker;

pub use backoff::RetryPolicy;
pub use cache_bus_worker::CacheBusWorker;
pub use dynamic_config_service::DynamicConfigService;
pub use image_generation_worker::ImageGenerationWorker;
pub use prompt_service::{PromptError, PromptService, FALLBACK_LANGUAGE, SYSTEM_PROMPT_KEY};
pub use push_service::PushService;
pub use story_pipeline_service::StoryPipelineService;
pub use stuck_task_reaper::{ReaperThresholds, StuckTaskReaper};
pub use task_dispatch_service::TaskDispatchService;
pub use text_generation_worker::{HandleOutcome, TextGenerationWorker};
pub use token_deletion_worker::TokenDeletionWorker;
