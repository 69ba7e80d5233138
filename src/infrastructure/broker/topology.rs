//! Broker topology - Well-known queue, exchange and routing-key names
//!
//! Every task-like queue has a companion `<queue>_dlq` bound to `tasks_dlx`
//! with the queue's own name as routing key. Routing key = queue name on the
//! default exchange everywhere else.

/// Text generation tasks, consumed by the text worker (prefetch 1).
pub const STORY_GENERATION_TASKS: &str = "story_generation_tasks";
/// Image generation tasks, consumed by the image worker (small prefetch).
pub const IMAGE_GENERATION_TASKS: &str = "image_generation_tasks";
/// Text completion notifications, consumed by the gameplay service.
pub const INTERNAL_UPDATES: &str = "internal_updates";
/// Image completion notifications, consumed by the gameplay service.
pub const IMAGE_GENERATOR_RESULTS: &str = "image_generator_results";
/// Push payloads, consumed by the push service.
pub const PUSH_NOTIFICATIONS: &str = "push_notifications";
/// Invalid device tokens awaiting purge.
pub const AUTH_TOKEN_DELETIONS: &str = "auth_token_deletions";

/// Dead-letter exchange all task queues point at.
pub const TASKS_DLX: &str = "tasks_dlx";

/// Topic exchange for the cache-invalidation bus.
pub const CONFIG_UPDATES_EXCHANGE: &str = "config_updates";
pub const CONFIG_UPDATED_KEY: &str = "config.updated";
pub const PROMPT_CREATED_KEY: &str = "prompt.created";
pub const PROMPT_UPDATED_KEY: &str = "prompt.updated";
pub const PROMPT_DELETED_KEY: &str = "prompt.deleted";

/// Queues a process declares before consuming or publishing.
pub const TASK_QUEUES: &[&str] = &[
    STORY_GENERATION_TASKS,
    IMAGE_GENERATION_TASKS,
    INTERNAL_UPDATES,
    IMAGE_GENERATOR_RESULTS,
    PUSH_NOTIFICATIONS,
    AUTH_TOKEN_DELETIONS,
];

/// Dead-letter companion for a queue.
pub fn dlq_name(queue: &str) -> String {
    format!("{queue}_dlq")
}
