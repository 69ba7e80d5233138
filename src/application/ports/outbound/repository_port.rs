//! Repository ports - Interfaces for the shared relational store
//!
//! The gameplay store is the single serialization point of the pipeline.
//! State-machine transitions run through `apply_*_transition`: the
//! implementation claims the task id (idempotency), takes a row-level lock,
//! runs the mutator on the freshly-read row, and commits; the mutator's
//! follow-up effects are returned to the caller for post-commit dispatch.

use std::time::Duration;

use async_trait::async_trait;

use crate::application::dto::FollowUp;
use crate::domain::entities::{
    GenerationResult, PlayerGameState, Prompt, PublishedStory, StoryConfig, TransitionError,
};
use crate::domain::value_objects::{GameStateId, StoryConfigId, StoryId, TaskId};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(String),
    #[error("row not found")]
    NotFound,
    /// The mutator refused; the transaction rolled back.
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl RepositoryError {
    /// Infrastructure-attributable failures; handlers nack-requeue on these.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Outcome of a serialized transition attempt.
#[derive(Debug)]
pub enum TransitionReceipt {
    /// The transition committed; dispatch these after the fact.
    Applied { follow_ups: Vec<FollowUp> },
    /// The task id was already applied; nothing was committed.
    Duplicate,
}

pub type StoryMutator =
    Box<dyn FnOnce(&mut PublishedStory) -> Result<Vec<FollowUp>, TransitionError> + Send>;
pub type GameStateMutator =
    Box<dyn FnOnce(&mut PlayerGameState) -> Result<Vec<FollowUp>, TransitionError> + Send>;
pub type ConfigMutator =
    Box<dyn FnOnce(&mut StoryConfig) -> Result<Vec<FollowUp>, TransitionError> + Send>;

#[async_trait]
pub trait GameplayStorePort: Send + Sync {
    // Story configs (drafts)
    async fn insert_story_config(&self, config: &StoryConfig) -> Result<(), RepositoryError>;
    async fn get_story_config(&self, id: StoryConfigId)
        -> Result<Option<StoryConfig>, RepositoryError>;
    /// Row-locked mutation without an idempotency claim (HTTP-side transitions).
    async fn mutate_story_config(
        &self,
        id: StoryConfigId,
        mutator: ConfigMutator,
    ) -> Result<Vec<FollowUp>, RepositoryError>;
    /// Task-keyed, idempotent transition (notification consumer).
    async fn apply_config_transition(
        &self,
        id: StoryConfigId,
        task_id: TaskId,
        mutator: ConfigMutator,
    ) -> Result<TransitionReceipt, RepositoryError>;

    // Published stories
    async fn insert_story(&self, story: &PublishedStory) -> Result<(), RepositoryError>;
    async fn get_story(&self, id: StoryId) -> Result<Option<PublishedStory>, RepositoryError>;
    async fn apply_story_transition(
        &self,
        id: StoryId,
        task_id: TaskId,
        mutator: StoryMutator,
    ) -> Result<TransitionReceipt, RepositoryError>;

    // Player game states
    async fn insert_game_state(&self, state: &PlayerGameState) -> Result<(), RepositoryError>;
    async fn get_game_state(
        &self,
        id: GameStateId,
    ) -> Result<Option<PlayerGameState>, RepositoryError>;
    async fn mutate_game_state(
        &self,
        id: GameStateId,
        mutator: GameStateMutator,
    ) -> Result<Vec<FollowUp>, RepositoryError>;
    async fn apply_game_state_transition(
        &self,
        id: GameStateId,
        task_id: TaskId,
        mutator: GameStateMutator,
    ) -> Result<TransitionReceipt, RepositoryError>;

    // Stuck-task reaping: move long-pending rows to Error with a synthetic
    // reason and return them so the caller can emit error pushes.
    async fn reap_stuck_story_configs(
        &self,
        older_than: Duration,
    ) -> Result<Vec<StoryConfig>, RepositoryError>;
    async fn reap_stuck_stories(
        &self,
        older_than: Duration,
    ) -> Result<Vec<PublishedStory>, RepositoryError>;
    async fn reap_stuck_game_states(
        &self,
        older_than: Duration,
    ) -> Result<Vec<PlayerGameState>, RepositoryError>;
}

/// Generation results, keyed by task id; one row per terminal attempt.
#[async_trait]
pub trait ResultStorePort: Send + Sync {
    async fn insert(&self, result: &GenerationResult) -> Result<(), RepositoryError>;
    async fn get(&self, task_id: TaskId) -> Result<Option<GenerationResult>, RepositoryError>;
}

/// Initial cache load for prompts; updates arrive over the bus.
#[async_trait]
pub trait PromptStorePort: Send + Sync {
    async fn load_all(&self) -> Result<Vec<Prompt>, RepositoryError>;
}

/// Initial cache load for dynamic config; updates arrive over the bus.
#[async_trait]
pub trait ConfigStorePort: Send + Sync {
    async fn load_all(&self) -> Result<Vec<(String, String)>, RepositoryError>;
}
