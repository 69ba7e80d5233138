//! Stuck-task reaper - Marks long-pending generations as Error
//!
//! Periodic scan over story configs, published stories and player game
//! states: rows still in a generating status whose last generation attempt
//! is older than the per-table threshold move to Error with a synthetic
//! reason. The boot scan runs with a zero threshold to clear crash-loop
//! residue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::application::dto::{PushMessage, PushNotificationPayload};
use crate::application::ports::outbound::GameplayStorePort;
use crate::application::services::TaskDispatchService;
use crate::domain::value_objects::UserId;

#[derive(Debug, Clone)]
pub struct ReaperThresholds {
    pub story_configs: Duration,
    pub published_stories: Duration,
    pub player_game_states: Duration,
}

impl ReaperThresholds {
    fn zero() -> Self {
        Self {
            story_configs: Duration::ZERO,
            published_stories: Duration::ZERO,
            player_game_states: Duration::ZERO,
        }
    }
}

pub struct StuckTaskReaper {
    store: Arc<dyn GameplayStorePort>,
    dispatch: Arc<TaskDispatchService>,
    thresholds: ReaperThresholds,
    interval: Duration,
}

impl StuckTaskReaper {
    pub fn new(
        store: Arc<dyn GameplayStorePort>,
        dispatch: Arc<TaskDispatchService>,
        thresholds: ReaperThresholds,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            dispatch,
            thresholds,
            interval,
        }
    }

    /// Boot sweep plus the periodic loop, until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        // Anything still marked generating at boot was orphaned by a crash.
        self.sweep(&ReaperThresholds::zero()).await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep(&self.thresholds).await;
                }
            }
        }
        tracing::info!("stuck-task reaper stopped");
    }

    /// One pass over the three tables.
    pub async fn sweep(&self, thresholds: &ReaperThresholds) {
        match self.store.reap_stuck_story_configs(thresholds.story_configs).await {
            Ok(reaped) if !reaped.is_empty() => {
                tracing::warn!(count = reaped.len(), "reaped stuck story configs");
            }
            Ok(_) => {}
            Err(e) => tracing::error!("failed to reap stuck story configs: {e}"),
        }

        match self.store.reap_stuck_stories(thresholds.published_stories).await {
            Ok(reaped) => {
                for story in reaped {
                    tracing::warn!(story_id = %story.id, "reaped stuck published story");
                    self.push_error(story.author_id, "Story generation timed out").await;
                }
            }
            Err(e) => tracing::error!("failed to reap stuck stories: {e}"),
        }

        match self.store.reap_stuck_game_states(thresholds.player_game_states).await {
            Ok(reaped) => {
                for state in reaped {
                    tracing::warn!(state_id = %state.id, "reaped stuck game state");
                    self.push_error(state.player_id, "Scene generation timed out").await;
                }
            }
            Err(e) => tracing::error!("failed to reap stuck game states: {e}"),
        }
    }

    async fn push_error(&self, user_id: UserId, body: &str) {
        let payload = PushNotificationPayload {
            user_id,
            notification: PushMessage {
                title: "Generation failed".to_string(),
                body: body.to_string(),
            },
            data: HashMap::new(),
        };
        if let Err(e) = self.dispatch.push(&payload).await {
            tracing::error!("failed to publish reaper push: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;

    use crate::domain::entities::PublishedStory;
    use crate::domain::value_objects::{StoryStatus, UserId};
    use crate::infrastructure::broker::{topology, InMemoryBroker};
    use crate::infrastructure::persistence::InMemoryGameplayStore;

    fn reaper(
        store: Arc<InMemoryGameplayStore>,
        broker: Arc<InMemoryBroker>,
    ) -> StuckTaskReaper {
        StuckTaskReaper::new(
            store,
            Arc::new(TaskDispatchService::new(broker)),
            ReaperThresholds {
                story_configs: Duration::from_secs(3600),
                published_stories: Duration::from_secs(3600),
                player_game_states: Duration::from_secs(1800),
            },
            Duration::from_secs(300),
        )
    }

    /// A story two hours into character generation with no completions.
    async fn stuck_story(store: &InMemoryGameplayStore) -> PublishedStory {
        let mut story = PublishedStory::new(UserId::new(), "en", "premise");
        story.complete_moderation(serde_json::json!({"allowed": true})).unwrap();
        story.complete_protagonist_goal("goal".into()).unwrap();
        story.complete_scene_planner(serde_json::json!({}), 2, 1).unwrap();
        story.last_generation_attempt_at = Some(Utc::now() - chrono::Duration::hours(2));
        store.insert_story(&story).await.unwrap();
        story
    }

    #[tokio::test]
    async fn reaps_old_generating_story_and_pushes() {
        let broker = Arc::new(InMemoryBroker::new());
        for queue in topology::TASK_QUEUES {
            broker.declare(queue);
        }
        let store = Arc::new(InMemoryGameplayStore::new());
        let story = stuck_story(&store).await;

        let r = reaper(store.clone(), broker.clone());
        r.sweep(&ReaperThresholds {
            story_configs: Duration::from_secs(3600),
            published_stories: Duration::from_secs(3600),
            player_game_states: Duration::from_secs(1800),
        })
        .await;

        let after = store.get_story(story.id).await.unwrap().unwrap();
        assert_eq!(after.status, StoryStatus::Error);
        assert_eq!(after.pending_character_generation_tasks, 0);
        assert_eq!(after.pending_card_image_tasks, 0);
        assert_eq!(after.pending_character_image_tasks, 0);
        assert!(!after.are_images_pending);
        assert!(after.invariants_hold());

        // Exactly one error push
        assert!(broker.take_published(topology::PUSH_NOTIFICATIONS).is_some());
        assert!(broker.take_published(topology::PUSH_NOTIFICATIONS).is_none());
    }

    #[tokio::test]
    async fn fresh_rows_survive_the_sweep() {
        let broker = Arc::new(InMemoryBroker::new());
        for queue in topology::TASK_QUEUES {
            broker.declare(queue);
        }
        let store = Arc::new(InMemoryGameplayStore::new());
        let mut story = PublishedStory::new(UserId::new(), "en", "premise");
        story.mark_generation_attempt();
        store.insert_story(&story).await.unwrap();

        let r = reaper(store.clone(), broker.clone());
        r.sweep(&ReaperThresholds {
            story_configs: Duration::from_secs(3600),
            published_stories: Duration::from_secs(3600),
            player_game_states: Duration::from_secs(1800),
        })
        .await;

        let after = store.get_story(story.id).await.unwrap().unwrap();
        assert_eq!(after.status, StoryStatus::Pending);
    }
}
