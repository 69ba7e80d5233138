//! Postgres store backends
//!
//! Rows keep the full entity as serialized JSON alongside the columns the
//! queries filter on (status, last generation attempt). State-machine
//! transitions run in one transaction: claim the task id in `applied_tasks`,
//! `SELECT ... FOR UPDATE` the row, run the mutator on the freshly-read
//! entity, write back, commit. Tables are created on construction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::application::dto::FollowUp;
use crate::application::ports::outbound::{
    ConfigMutator, ConfigStorePort, GameStateMutator, GameplayStorePort, PromptStorePort,
    RepositoryError, ResultStorePort, StoryMutator, TransitionReceipt,
};
use crate::domain::entities::{
    GenerationResult, PlayerGameState, Prompt, PublishedStory, StoryConfig,
};
use crate::domain::value_objects::{GameStateId, StoryConfigId, StoryId, TaskId};

fn db_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Database(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Database(e.to_string()))
}

fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(raw).map_err(|e| RepositoryError::Database(format!("corrupt row: {e}")))
}

/// snake_case wire name of a unit enum variant.
fn enum_str<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_default()
        .trim_matches('"')
        .to_string()
}

pub struct PostgresGameplayStore {
    pool: PgPool,
}

impl PostgresGameplayStore {
    pub async fn new(pool: PgPool) -> Result<Self, sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS story_configs (
                id UUID PRIMARY KEY,
                status TEXT NOT NULL,
                last_generation_attempt_at TIMESTAMPTZ,
                data TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
        "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS published_stories (
                id UUID PRIMARY KEY,
                status TEXT NOT NULL,
                last_generation_attempt_at TIMESTAMPTZ,
                data TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
        "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS player_game_states (
                id UUID PRIMARY KEY,
                status TEXT NOT NULL,
                last_generation_attempt_at TIMESTAMPTZ,
                data TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
        "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS applied_tasks (
                task_id UUID PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
        "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Claim a task id inside the transaction; false means already applied.
    async fn claim_task(
        tx: &mut Transaction<'_, Postgres>,
        task_id: TaskId,
    ) -> Result<bool, RepositoryError> {
        let claimed =
            sqlx::query("INSERT INTO applied_tasks (task_id) VALUES ($1) ON CONFLICT DO NOTHING")
                .bind(task_id.as_uuid())
                .execute(&mut **tx)
                .await
                .map_err(db_err)?;
        Ok(claimed.rows_affected() == 1)
    }

    async fn fetch_for_update<T: DeserializeOwned>(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        id: &uuid::Uuid,
    ) -> Result<T, RepositoryError> {
        let row = sqlx::query(&format!("SELECT data FROM {table} WHERE id = $1 FOR UPDATE"))
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?
            .ok_or(RepositoryError::NotFound)?;
        let data: String = row.try_get("data").map_err(db_err)?;
        decode(&data)
    }

    async fn write_back(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        id: &uuid::Uuid,
        status: &str,
        last_attempt: Option<DateTime<Utc>>,
        data: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query(&format!(
            "UPDATE {table} SET status = $2, last_generation_attempt_at = $3, data = $4, updated_at = now() WHERE id = $1"
        ))
        .bind(id)
        .bind(status)
        .bind(last_attempt)
        .bind(data)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_row(
        &self,
        table: &str,
        id: &uuid::Uuid,
        status: &str,
        last_attempt: Option<DateTime<Utc>>,
        data: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (id, status, last_generation_attempt_at, data)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET status = $2, last_generation_attempt_at = $3, data = $4, updated_at = now()
            "#
        ))
        .bind(id)
        .bind(status)
        .bind(last_attempt)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_row<T: DeserializeOwned>(
        &self,
        table: &str,
        id: &uuid::Uuid,
    ) -> Result<Option<T>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT data FROM {table} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => {
                let data: String = row.try_get("data").map_err(db_err)?;
                Ok(Some(decode(&data)?))
            }
            None => Ok(None),
        }
    }

    /// Lock every row of `table` in a reapable status whose last attempt is
    /// older than the threshold.
    async fn fetch_stuck<T: DeserializeOwned>(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        statuses: &[&str],
        older_than: Duration,
    ) -> Result<Vec<T>, RepositoryError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let rows = sqlx::query(&format!(
            r#"
            SELECT data FROM {table}
            WHERE status = ANY($1)
              AND COALESCE(last_generation_attempt_at, updated_at) <= $2
            FOR UPDATE
            "#
        ))
        .bind(statuses.iter().map(|s| s.to_string()).collect::<Vec<_>>())
        .bind(cutoff)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|row| {
                let data: String = row.try_get("data").map_err(db_err)?;
                decode(&data)
            })
            .collect()
    }
}

#[async_trait]
impl GameplayStorePort for PostgresGameplayStore {
    async fn insert_story_config(&self, config: &StoryConfig) -> Result<(), RepositoryError> {
        self.insert_row(
            "story_configs",
            config.id.as_uuid(),
            &enum_str(&config.status),
            config.last_generation_attempt_at,
            &encode(config)?,
        )
        .await
    }

    async fn get_story_config(
        &self,
        id: StoryConfigId,
    ) -> Result<Option<StoryConfig>, RepositoryError> {
        self.get_row("story_configs", id.as_uuid()).await
    }

    async fn mutate_story_config(
        &self,
        id: StoryConfigId,
        mutator: ConfigMutator,
    ) -> Result<Vec<FollowUp>, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut config: StoryConfig =
            Self::fetch_for_update(&mut tx, "story_configs", id.as_uuid()).await?;
        let follow_ups = mutator(&mut config)?;
        Self::write_back(
            &mut tx,
            "story_configs",
            id.as_uuid(),
            &enum_str(&config.status),
            config.last_generation_attempt_at,
            &encode(&config)?,
        )
        .await?;
        tx.commit().await.map_err(db_err)?;
        Ok(follow_ups)
    }

    async fn apply_config_transition(
        &self,
        id: StoryConfigId,
        task_id: TaskId,
        mutator: ConfigMutator,
    ) -> Result<TransitionReceipt, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        if !Self::claim_task(&mut tx, task_id).await? {
            return Ok(TransitionReceipt::Duplicate);
        }
        let mut config: StoryConfig =
            Self::fetch_for_update(&mut tx, "story_configs", id.as_uuid()).await?;
        let follow_ups = mutator(&mut config)?;
        Self::write_back(
            &mut tx,
            "story_configs",
            id.as_uuid(),
            &enum_str(&config.status),
            config.last_generation_attempt_at,
            &encode(&config)?,
        )
        .await?;
        tx.commit().await.map_err(db_err)?;
        Ok(TransitionReceipt::Applied { follow_ups })
    }

    async fn insert_story(&self, story: &PublishedStory) -> Result<(), RepositoryError> {
        self.insert_row(
            "published_stories",
            story.id.as_uuid(),
            &enum_str(&story.status),
            story.last_generation_attempt_at,
            &encode(story)?,
        )
        .await
    }

    async fn get_story(&self, id: StoryId) -> Result<Option<PublishedStory>, RepositoryError> {
        self.get_row("published_stories", id.as_uuid()).await
    }

    async fn apply_story_transition(
        &self,
        id: StoryId,
        task_id: TaskId,
        mutator: StoryMutator,
    ) -> Result<TransitionReceipt, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        if !Self::claim_task(&mut tx, task_id).await? {
            return Ok(TransitionReceipt::Duplicate);
        }
        let mut story: PublishedStory =
            Self::fetch_for_update(&mut tx, "published_stories", id.as_uuid()).await?;
        let follow_ups = mutator(&mut story)?;
        Self::write_back(
            &mut tx,
            "published_stories",
            id.as_uuid(),
            &enum_str(&story.status),
            story.last_generation_attempt_at,
            &encode(&story)?,
        )
        .await?;
        tx.commit().await.map_err(db_err)?;
        Ok(TransitionReceipt::Applied { follow_ups })
    }

    async fn insert_game_state(&self, state: &PlayerGameState) -> Result<(), RepositoryError> {
        self.insert_row(
            "player_game_states",
            state.id.as_uuid(),
            &enum_str(&state.status),
            state.last_generation_attempt_at,
            &encode(state)?,
        )
        .await
    }

    async fn get_game_state(
        &self,
        id: GameStateId,
    ) -> Result<Option<PlayerGameState>, RepositoryError> {
        self.get_row("player_game_states", id.as_uuid()).await
    }

    async fn mutate_game_state(
        &self,
        id: GameStateId,
        mutator: GameStateMutator,
    ) -> Result<Vec<FollowUp>, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut state: PlayerGameState =
            Self::fetch_for_update(&mut tx, "player_game_states", id.as_uuid()).await?;
        let follow_ups = mutator(&mut state)?;
        Self::write_back(
            &mut tx,
            "player_game_states",
            id.as_uuid(),
            &enum_str(&state.status),
            state.last_generation_attempt_at,
            &encode(&state)?,
        )
        .await?;
        tx.commit().await.map_err(db_err)?;
        Ok(follow_ups)
    }

    async fn apply_game_state_transition(
        &self,
        id: GameStateId,
        task_id: TaskId,
        mutator: GameStateMutator,
    ) -> Result<TransitionReceipt, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        if !Self::claim_task(&mut tx, task_id).await? {
            return Ok(TransitionReceipt::Duplicate);
        }
        let mut state: PlayerGameState =
            Self::fetch_for_update(&mut tx, "player_game_states", id.as_uuid()).await?;
        let follow_ups = mutator(&mut state)?;
        Self::write_back(
            &mut tx,
            "player_game_states",
            id.as_uuid(),
            &enum_str(&state.status),
            state.last_generation_attempt_at,
            &encode(&state)?,
        )
        .await?;
        tx.commit().await.map_err(db_err)?;
        Ok(TransitionReceipt::Applied { follow_ups })
    }

    async fn reap_stuck_story_configs(
        &self,
        older_than: Duration,
    ) -> Result<Vec<StoryConfig>, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let stuck: Vec<StoryConfig> =
            Self::fetch_stuck(&mut tx, "story_configs", &["generating"], older_than).await?;
        let mut reaped = Vec::with_capacity(stuck.len());
        for mut config in stuck {
            config.fail("generation timed out");
            Self::write_back(
                &mut tx,
                "story_configs",
                &config.id.as_uuid().to_owned(),
                &enum_str(&config.status),
                config.last_generation_attempt_at,
                &encode(&config)?,
            )
            .await?;
            reaped.push(config);
        }
        tx.commit().await.map_err(db_err)?;
        Ok(reaped)
    }

    async fn reap_stuck_stories(
        &self,
        older_than: Duration,
    ) -> Result<Vec<PublishedStory>, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let stuck: Vec<PublishedStory> = Self::fetch_stuck(
            &mut tx,
            "published_stories",
            &["pending", "generating"],
            older_than,
        )
        .await?;
        let mut reaped = Vec::with_capacity(stuck.len());
        for mut story in stuck {
            story.fail("generation timed out");
            Self::write_back(
                &mut tx,
                "published_stories",
                &story.id.as_uuid().to_owned(),
                &enum_str(&story.status),
                story.last_generation_attempt_at,
                &encode(&story)?,
            )
            .await?;
            reaped.push(story);
        }
        tx.commit().await.map_err(db_err)?;
        Ok(reaped)
    }

    async fn reap_stuck_game_states(
        &self,
        older_than: Duration,
    ) -> Result<Vec<PlayerGameState>, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let stuck: Vec<PlayerGameState> =
            Self::fetch_stuck(&mut tx, "player_game_states", &["generating"], older_than).await?;
        let mut reaped = Vec::with_capacity(stuck.len());
        for mut state in stuck {
            state.fail("generation timed out");
            Self::write_back(
                &mut tx,
                "player_game_states",
                &state.id.as_uuid().to_owned(),
                &enum_str(&state.status),
                state.last_generation_attempt_at,
                &encode(&state)?,
            )
            .await?;
            reaped.push(state);
        }
        tx.commit().await.map_err(db_err)?;
        Ok(reaped)
    }
}

pub struct PostgresResultStore {
    pool: PgPool,
}

impl PostgresResultStore {
    pub async fn new(pool: PgPool) -> Result<Self, sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS generation_results (
                task_id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                prompt_type TEXT NOT NULL,
                text_output TEXT NOT NULL,
                processing_time_ms BIGINT NOT NULL,
                prompt_tokens BIGINT NOT NULL,
                completion_tokens BIGINT NOT NULL,
                estimated_cost DOUBLE PRECISION NOT NULL,
                error TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
        "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ResultStorePort for PostgresResultStore {
    async fn insert(&self, result: &GenerationResult) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO generation_results
                (task_id, user_id, prompt_type, text_output, processing_time_ms,
                 prompt_tokens, completion_tokens, estimated_cost, error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (task_id) DO UPDATE
            SET text_output = $4, processing_time_ms = $5, prompt_tokens = $6,
                completion_tokens = $7, estimated_cost = $8, error = $9
            "#,
        )
        .bind(result.task_id.as_uuid())
        .bind(result.user_id.as_uuid())
        .bind(enum_str(&result.prompt_type))
        .bind(&result.text)
        .bind(result.processing_time_ms)
        .bind(result.prompt_tokens)
        .bind(result.completion_tokens)
        .bind(result.estimated_cost)
        .bind(&result.error)
        .bind(result.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<GenerationResult>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT task_id, user_id, prompt_type, text_output, processing_time_ms,
                   prompt_tokens, completion_tokens, estimated_cost, error, created_at
            FROM generation_results WHERE task_id = $1
            "#,
        )
        .bind(task_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let prompt_type: String = row.try_get("prompt_type").map_err(db_err)?;
        Ok(Some(GenerationResult {
            task_id: TaskId::from_uuid(row.try_get("task_id").map_err(db_err)?),
            user_id: crate::domain::value_objects::UserId::from_uuid(
                row.try_get("user_id").map_err(db_err)?,
            ),
            prompt_type: decode(&format!("\"{prompt_type}\""))?,
            text: row.try_get("text_output").map_err(db_err)?,
            processing_time_ms: row.try_get("processing_time_ms").map_err(db_err)?,
            prompt_tokens: row.try_get("prompt_tokens").map_err(db_err)?,
            completion_tokens: row.try_get("completion_tokens").map_err(db_err)?,
            estimated_cost: row.try_get("estimated_cost").map_err(db_err)?,
            error: row.try_get("error").map_err(db_err)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
        }))
    }
}

pub struct PostgresPromptStore {
    pool: PgPool,
}

impl PostgresPromptStore {
    pub async fn new(pool: PgPool) -> Result<Self, sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prompts (
                key TEXT NOT NULL,
                language TEXT NOT NULL,
                content TEXT NOT NULL,
                PRIMARY KEY (key, language)
            )
        "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl PromptStorePort for PostgresPromptStore {
    async fn load_all(&self) -> Result<Vec<Prompt>, RepositoryError> {
        let rows = sqlx::query("SELECT key, language, content FROM prompts")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter()
            .map(|row| {
                Ok(Prompt {
                    key: row.try_get("key").map_err(db_err)?,
                    language: row.try_get("language").map_err(db_err)?,
                    content: row.try_get("content").map_err(db_err)?,
                })
            })
            .collect()
    }
}

pub struct PostgresConfigStore {
    pool: PgPool,
}

impl PostgresConfigStore {
    pub async fn new(pool: PgPool) -> Result<Self, sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dynamic_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
        "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ConfigStorePort for PostgresConfigStore {
    async fn load_all(&self) -> Result<Vec<(String, String)>, RepositoryError> {
        let rows = sqlx::query("SELECT key, value FROM dynamic_config")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter()
            .map(|row| {
                Ok((
                    row.try_get("key").map_err(db_err)?,
                    row.try_get("value").map_err(db_err)?,
                ))
            })
            .collect()
    }
}
