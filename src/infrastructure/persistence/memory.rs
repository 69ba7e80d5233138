//! In-memory store backends - For tests and single-process runs
//!
//! The gameplay store reproduces the transactional discipline of the
//! Postgres backend: transitions serialize behind one lock, the task-id
//! claim and the row write commit together, and a mutator error rolls both
//! back.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::application::dto::FollowUp;
use crate::application::ports::outbound::{
    ConfigMutator, ConfigStorePort, GameStateMutator, GameplayStorePort, PromptStorePort,
    RepositoryError, ResultStorePort, StoryMutator, TransitionReceipt,
};
use crate::domain::entities::{
    GenerationResult, PlayerGameState, Prompt, PublishedStory, StoryConfig,
};
use crate::domain::value_objects::{
    ConfigStatus, GameStateId, GameStateStatus, StoryConfigId, StoryId, TaskId,
};

#[derive(Default)]
struct StoreState {
    configs: HashMap<StoryConfigId, StoryConfig>,
    stories: HashMap<StoryId, PublishedStory>,
    states: HashMap<GameStateId, PlayerGameState>,
    applied: HashSet<TaskId>,
}

#[derive(Default)]
pub struct InMemoryGameplayStore {
    inner: Mutex<StoreState>,
}

impl InMemoryGameplayStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: whether a task id has been claimed.
    pub fn is_applied(&self, task_id: TaskId) -> bool {
        self.inner.lock().unwrap().applied.contains(&task_id)
    }
}

#[async_trait]
impl GameplayStorePort for InMemoryGameplayStore {
    async fn insert_story_config(&self, config: &StoryConfig) -> Result<(), RepositoryError> {
        self.inner
            .lock()
            .unwrap()
            .configs
            .insert(config.id, config.clone());
        Ok(())
    }

    async fn get_story_config(
        &self,
        id: StoryConfigId,
    ) -> Result<Option<StoryConfig>, RepositoryError> {
        Ok(self.inner.lock().unwrap().configs.get(&id).cloned())
    }

    async fn mutate_story_config(
        &self,
        id: StoryConfigId,
        mutator: ConfigMutator,
    ) -> Result<Vec<FollowUp>, RepositoryError> {
        let mut state = self.inner.lock().unwrap();
        let row = state.configs.get(&id).ok_or(RepositoryError::NotFound)?;
        let mut working = row.clone();
        let follow_ups = mutator(&mut working)?;
        state.configs.insert(id, working);
        Ok(follow_ups)
    }

    async fn apply_config_transition(
        &self,
        id: StoryConfigId,
        task_id: TaskId,
        mutator: ConfigMutator,
    ) -> Result<TransitionReceipt, RepositoryError> {
        let mut state = self.inner.lock().unwrap();
        if state.applied.contains(&task_id) {
            return Ok(TransitionReceipt::Duplicate);
        }
        let row = state.configs.get(&id).ok_or(RepositoryError::NotFound)?;
        let mut working = row.clone();
        let follow_ups = mutator(&mut working)?;
        state.configs.insert(id, working);
        state.applied.insert(task_id);
        Ok(TransitionReceipt::Applied { follow_ups })
    }

    async fn insert_story(&self, story: &PublishedStory) -> Result<(), RepositoryError> {
        self.inner
            .lock()
            .unwrap()
            .stories
            .insert(story.id, story.clone());
        Ok(())
    }

    async fn get_story(&self, id: StoryId) -> Result<Option<PublishedStory>, RepositoryError> {
        Ok(self.inner.lock().unwrap().stories.get(&id).cloned())
    }

    async fn apply_story_transition(
        &self,
        id: StoryId,
        task_id: TaskId,
        mutator: StoryMutator,
    ) -> Result<TransitionReceipt, RepositoryError> {
        let mut state = self.inner.lock().unwrap();
        if state.applied.contains(&task_id) {
            return Ok(TransitionReceipt::Duplicate);
        }
        let row = state.stories.get(&id).ok_or(RepositoryError::NotFound)?;
        let mut working = row.clone();
        let follow_ups = mutator(&mut working)?;
        state.stories.insert(id, working);
        state.applied.insert(task_id);
        Ok(TransitionReceipt::Applied { follow_ups })
    }

    async fn insert_game_state(&self, game_state: &PlayerGameState) -> Result<(), RepositoryError> {
        self.inner
            .lock()
            .unwrap()
            .states
            .insert(game_state.id, game_state.clone());
        Ok(())
    }

    async fn get_game_state(
        &self,
        id: GameStateId,
    ) -> Result<Option<PlayerGameState>, RepositoryError> {
        Ok(self.inner.lock().unwrap().states.get(&id).cloned())
    }

    async fn mutate_game_state(
        &self,
        id: GameStateId,
        mutator: GameStateMutator,
    ) -> Result<Vec<FollowUp>, RepositoryError> {
        let mut state = self.inner.lock().unwrap();
        let row = state.states.get(&id).ok_or(RepositoryError::NotFound)?;
        let mut working = row.clone();
        let follow_ups = mutator(&mut working)?;
        state.states.insert(id, working);
        Ok(follow_ups)
    }

    async fn apply_game_state_transition(
        &self,
        id: GameStateId,
        task_id: TaskId,
        mutator: GameStateMutator,
    ) -> Result<TransitionReceipt, RepositoryError> {
        let mut state = self.inner.lock().unwrap();
        if state.applied.contains(&task_id) {
            return Ok(TransitionReceipt::Duplicate);
        }
        let row = state.states.get(&id).ok_or(RepositoryError::NotFound)?;
        let mut working = row.clone();
        let follow_ups = mutator(&mut working)?;
        state.states.insert(id, working);
        state.applied.insert(task_id);
        Ok(TransitionReceipt::Applied { follow_ups })
    }

    async fn reap_stuck_story_configs(
        &self,
        older_than: Duration,
    ) -> Result<Vec<StoryConfig>, RepositoryError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let mut state = self.inner.lock().unwrap();
        let mut reaped = Vec::new();
        for config in state.configs.values_mut() {
            let attempt = config.last_generation_attempt_at.unwrap_or(config.updated_at);
            if config.status == ConfigStatus::Generating && attempt <= cutoff {
                config.fail("generation timed out");
                reaped.push(config.clone());
            }
        }
        Ok(reaped)
    }

    async fn reap_stuck_stories(
        &self,
        older_than: Duration,
    ) -> Result<Vec<PublishedStory>, RepositoryError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let mut state = self.inner.lock().unwrap();
        let mut reaped = Vec::new();
        for story in state.stories.values_mut() {
            let attempt = story.last_generation_attempt_at.unwrap_or(story.updated_at);
            if !story.status.is_terminal() && attempt <= cutoff {
                story.fail("generation timed out");
                reaped.push(story.clone());
            }
        }
        Ok(reaped)
    }

    async fn reap_stuck_game_states(
        &self,
        older_than: Duration,
    ) -> Result<Vec<PlayerGameState>, RepositoryError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let mut state = self.inner.lock().unwrap();
        let mut reaped = Vec::new();
        for game_state in state.states.values_mut() {
            let attempt = game_state
                .last_generation_attempt_at
                .unwrap_or(game_state.updated_at);
            if game_state.status == GameStateStatus::Generating && attempt <= cutoff {
                game_state.fail("generation timed out");
                reaped.push(game_state.clone());
            }
        }
        Ok(reaped)
    }
}

#[derive(Default)]
pub struct InMemoryResultStore {
    rows: Mutex<HashMap<TaskId, GenerationResult>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStorePort for InMemoryResultStore {
    async fn insert(&self, result: &GenerationResult) -> Result<(), RepositoryError> {
        self.rows
            .lock()
            .unwrap()
            .insert(result.task_id, result.clone());
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<GenerationResult>, RepositoryError> {
        Ok(self.rows.lock().unwrap().get(&task_id).cloned())
    }
}

/// Seedable prompt store for the memory backend.
pub struct InMemoryPromptStore {
    prompts: Vec<Prompt>,
}

impl InMemoryPromptStore {
    pub fn new(prompts: Vec<Prompt>) -> Self {
        Self { prompts }
    }
}

#[async_trait]
impl PromptStorePort for InMemoryPromptStore {
    async fn load_all(&self) -> Result<Vec<Prompt>, RepositoryError> {
        Ok(self.prompts.clone())
    }
}

/// Seedable dynamic-config store for the memory backend.
pub struct InMemoryConfigStore {
    entries: Vec<(String, String)>,
}

impl InMemoryConfigStore {
    pub fn new(entries: Vec<(String, String)>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl ConfigStorePort for InMemoryConfigStore {
    async fn load_all(&self) -> Result<Vec<(String, String)>, RepositoryError> {
        Ok(self.entries.clone())
    }
}
