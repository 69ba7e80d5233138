//! Story pipeline service - The single writer for gameplay state
//!
//! Consumes completion notifications from the text and image workers and
//! advances the PublishedStory / PlayerGameState machines. Each notification
//! runs one short transaction: claim the task id, lock the row, re-read,
//! apply the transition, commit; follow-on tasks and pushes are dispatched
//! only after the commit. A duplicate task id is a commit-free ack.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::application::dto::{
    FollowUp, GenerationTaskPayload, NotificationPayload, PushMessage, PushNotificationPayload,
    INITIAL_STATE_HASH,
};
use crate::application::ports::outbound::{
    BrokerPort, DeliveryPort, GameplayStorePort, RepositoryError, ResultStorePort,
    TransitionReceipt,
};
use crate::application::services::text_generation_worker::HandleOutcome;
use crate::application::services::TaskDispatchService;
use crate::domain::entities::{GenerationResult, PlayerGameState, PublishedStory, TransitionError};
use crate::domain::value_objects::{ModerationVerdict, PromptType, ScenePlan, StoryId, UserId};

pub struct StoryPipelineService {
    broker: Arc<dyn BrokerPort>,
    store: Arc<dyn GameplayStorePort>,
    results: Arc<dyn ResultStorePort>,
    dispatch: Arc<TaskDispatchService>,
}

impl StoryPipelineService {
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        store: Arc<dyn GameplayStorePort>,
        results: Arc<dyn ResultStorePort>,
        dispatch: Arc<TaskDispatchService>,
    ) -> Self {
        Self {
            broker,
            store,
            results,
            dispatch,
        }
    }

    /// Consume one internal-updates queue until shutdown. The gameplay
    /// process runs this once per notification queue.
    pub async fn run(&self, queue: &str, shutdown: CancellationToken) {
        let mut stream = match self.broker.subscribe(queue, 1).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("failed to subscribe to {queue}: {e}");
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
                tracing::error!("failed to settle notification delivery: {e}");
            }
        }
        tracing::info!(queue, "notification consumer stopped");
    }

    /// Handle one raw notification payload.
    pub async fn handle(&self, payload: &[u8]) -> HandleOutcome {
        let notif: NotificationPayload = match serde_json::from_slice(payload) {
            Ok(notif) => notif,
            Err(e) => {
                tracing::warn!("unparseable notification, dead-lettering: {e}");
                return HandleOutcome::NackDead;
            }
        };

        // The result row is written before the notification is published, so
        // a missing row on a success notice is a read-visibility hiccup.
        let result = if notif.is_success() {
            match self.results.get(notif.task_id).await {
                Ok(Some(result)) => Some(result),
                Ok(None) => {
                    tracing::warn!(task_id = %notif.task_id, "result row not yet visible, requeueing");
                    return HandleOutcome::NackRequeue;
                }
                Err(e) => {
                    tracing::error!("result store unavailable: {e}");
                    return HandleOutcome::NackRequeue;
                }
            }
        } else {
            None
        };

        let applied = if let Some(state_id) = notif.player_game_state_id {
            self.apply_game_state(state_id, &notif, result).await
        } else if let Some(story_id) = notif.published_story_id {
            self.apply_story(story_id, &notif, result).await
        } else if let Some(config_id) = notif.story_config_id {
            self.apply_draft(config_id, &notif, result).await
        } else {
            tracing::warn!(task_id = %notif.task_id, "notification without a correlating id, dead-lettering");
            return HandleOutcome::NackDead;
        };

        match applied {
            Ok(TransitionReceipt::Applied { follow_ups }) => {
                if let Err(e) = self.dispatch.dispatch_follow_ups(follow_ups).await {
                    // The transition is committed; losing the follow-up
                    // publish must surface as a redelivery, and the task-id
                    // claim makes the replay commit-free.
                    tracing::error!("failed to dispatch follow-ups: {e}");
                    return HandleOutcome::NackRequeue;
                }
                HandleOutcome::Ack
            }
            Ok(TransitionReceipt::Duplicate) => {
                tracing::warn!(task_id = %notif.task_id, "duplicate notification, already applied");
                HandleOutcome::Ack
            }
            Err(RepositoryError::Transition(e)) => {
                tracing::warn!(task_id = %notif.task_id, "transition rejected as no-op: {e}");
                HandleOutcome::Ack
            }
            Err(RepositoryError::NotFound) => {
                tracing::warn!(task_id = %notif.task_id, "notification for unknown row, dead-lettering");
                HandleOutcome::NackDead
            }
            Err(e) => {
                tracing::error!("gameplay store unavailable: {e}");
                HandleOutcome::NackRequeue
            }
        }
    }

    // ---- Draft (narrator) ----

    async fn apply_draft(
        &self,
        config_id: crate::domain::value_objects::StoryConfigId,
        notif: &NotificationPayload,
        result: Option<GenerationResult>,
    ) -> Result<TransitionReceipt, RepositoryError> {
        let notif = notif.clone();
        self.store
            .apply_config_transition(
                config_id,
                notif.task_id,
                Box::new(move |config| {
                    if !notif.is_success() {
                        config.fail(notif.error_details.clone());
                        return Ok(vec![Self::error_push(
                            config.user_id,
                            "Draft generation failed",
                            &notif.error_details,
                        )]);
                    }
                    let result = result.ok_or_else(|| {
                        TransitionError::MalformedResult("missing narrator result".to_string())
                    })?;
                    if !result.is_success() {
                        config.fail(result.error.clone());
                        return Ok(vec![Self::error_push(
                            config.user_id,
                            "Draft generation failed",
                            &result.error,
                        )]);
                    }
                    config.apply_narrator_output(result.text);
                    Ok(vec![])
                }),
            )
            .await
    }

    // ---- Published story (initial generation pipeline) ----

    async fn apply_story(
        &self,
        story_id: StoryId,
        notif: &NotificationPayload,
        result: Option<GenerationResult>,
    ) -> Result<TransitionReceipt, RepositoryError> {
        let notif = notif.clone();
        self.store
            .apply_story_transition(
                story_id,
                notif.task_id,
                Box::new(move |story| Self::story_mutator(story, &notif, result)),
            )
            .await
    }

    fn story_mutator(
        story: &mut PublishedStory,
        notif: &NotificationPayload,
        result: Option<GenerationResult>,
    ) -> Result<Vec<FollowUp>, TransitionError> {
        if !notif.is_success() {
            story.fail(notif.error_details.clone());
            return Ok(vec![Self::error_push(
                story.author_id,
                "Story generation failed",
                &notif.error_details,
            )]);
        }
        let result = result.ok_or_else(|| {
            TransitionError::MalformedResult("missing generation result".to_string())
        })?;

        match notif.prompt_type {
            PromptType::ContentModeration => Self::handle_moderation(story, &result),
            PromptType::ProtagonistGoal => Self::handle_protagonist_goal(story, result.text),
            PromptType::ScenePlanner => Self::handle_scene_plan(story, &result.text),
            PromptType::CharacterGeneration => Self::handle_character_generated(story, &result),
            PromptType::CardImage => {
                story.complete_card_image(None)?;
                Ok(Self::maybe_dispatch_setup(story))
            }
            PromptType::StoryPreviewImage => {
                story.complete_card_image(Some(result.text))?;
                Ok(Self::maybe_dispatch_setup(story))
            }
            PromptType::CharacterImage => {
                story.complete_character_image()?;
                Ok(Self::maybe_dispatch_setup(story))
            }
            PromptType::Setup => {
                story.complete_setup(result.text)?;
                story.mark_generation_attempt();
                let task = Self::story_task(story, PromptType::SceneJson, story.user_input.clone())
                    .with_state_hash(INITIAL_STATE_HASH);
                Ok(vec![FollowUp::Dispatch(task)])
            }
            PromptType::SceneJson => Self::handle_first_scene(story, &result.text),
            other => Err(TransitionError::UnexpectedStage {
                got: other.to_string(),
                step: story.step,
            }),
        }
    }

    fn handle_moderation(
        story: &mut PublishedStory,
        result: &GenerationResult,
    ) -> Result<Vec<FollowUp>, TransitionError> {
        let verdict: ModerationVerdict = match serde_json::from_str(&result.text) {
            Ok(verdict) => verdict,
            Err(e) => {
                // An uninterpretable verdict is a business-terminal failure
                // for this story, not a rollback.
                story.fail(format!("unreadable moderation verdict: {e}"));
                return Ok(vec![Self::error_push(
                    story.author_id,
                    "Story generation failed",
                    "moderation verdict unreadable",
                )]);
            }
        };
        if !verdict.allowed {
            let reason = verdict.reason.unwrap_or_else(|| "content rejected".to_string());
            story.fail(format!("moderation rejected: {reason}"));
            return Ok(vec![Self::error_push(
                story.author_id,
                "Story rejected",
                &reason,
            )]);
        }
        story.complete_moderation(serde_json::json!({ "allowed": true }))?;
        story.mark_generation_attempt();
        let task = Self::story_task(story, PromptType::ProtagonistGoal, story.user_input.clone());
        Ok(vec![FollowUp::Dispatch(task)])
    }

    fn handle_protagonist_goal(
        story: &mut PublishedStory,
        goal: String,
    ) -> Result<Vec<FollowUp>, TransitionError> {
        story.complete_protagonist_goal(goal)?;
        story.mark_generation_attempt();
        let task = Self::story_task(story, PromptType::ScenePlanner, story.user_input.clone());
        Ok(vec![FollowUp::Dispatch(task)])
    }

    fn handle_scene_plan(
        story: &mut PublishedStory,
        raw_plan: &str,
    ) -> Result<Vec<FollowUp>, TransitionError> {
        let plan: ScenePlan = match serde_json::from_str(raw_plan) {
            Ok(plan) => plan,
            Err(e) => {
                story.fail(format!("unreadable scene plan: {e}"));
                return Ok(vec![Self::error_push(
                    story.author_id,
                    "Story generation failed",
                    "scene plan unreadable",
                )]);
            }
        };
        if plan.characters.is_empty() {
            story.fail("scene plan contains no characters");
            return Ok(vec![Self::error_push(
                story.author_id,
                "Story generation failed",
                "scene plan contains no characters",
            )]);
        }

        let characters = plan.characters.len() as i32;
        // Card images plus the story preview share the card counter.
        let card_images = plan.cards.len() as i32 + 1;
        let plan_json = serde_json::to_value(&plan)
            .map_err(|e| TransitionError::MalformedResult(e.to_string()))?;
        story.complete_scene_planner(plan_json, characters, card_images)?;
        story.mark_generation_attempt();

        let mut follow_ups = Vec::new();
        for character in &plan.characters {
            let input = format!("{}: {}", character.name, character.brief);
            follow_ups.push(FollowUp::Dispatch(Self::story_task(
                story,
                PromptType::CharacterGeneration,
                input,
            )));
        }
        for (index, card) in plan.cards.iter().enumerate() {
            let task = Self::story_task(story, PromptType::CardImage, card.image_prompt.clone())
                .with_image(format!("story-{}-card-{}", story.id, index), "2:3");
            follow_ups.push(FollowUp::Dispatch(task));
        }
        let preview_input = if plan.synopsis.is_empty() {
            story.user_input.clone()
        } else {
            plan.synopsis.clone()
        };
        let preview = Self::story_task(story, PromptType::StoryPreviewImage, preview_input)
            .with_image(format!("story-{}-preview", story.id), "2:3");
        follow_ups.push(FollowUp::Dispatch(preview));
        Ok(follow_ups)
    }

    fn handle_character_generated(
        story: &mut PublishedStory,
        result: &GenerationResult,
    ) -> Result<Vec<FollowUp>, TransitionError> {
        story.complete_character_generation()?;
        story.mark_generation_attempt();
        // The generated sheet doubles as the portrait prompt; the completing
        // task id keeps the artifact reference stable across redeliveries.
        let task = Self::story_task(story, PromptType::CharacterImage, result.text.clone())
            .with_image(format!("story-{}-character-{}", story.id, result.task_id), "2:3");
        let mut follow_ups = vec![FollowUp::Dispatch(task)];
        follow_ups.extend(Self::maybe_dispatch_setup(story));
        Ok(follow_ups)
    }

    /// The transition that drains the last fan-out counter dispatches setup.
    fn maybe_dispatch_setup(story: &mut PublishedStory) -> Vec<FollowUp> {
        if story.has_pending_fan_out()
            || story.step != crate::domain::value_objects::GenerationStep::SetupGeneration
        {
            return vec![];
        }
        story.mark_generation_attempt();
        vec![FollowUp::Dispatch(Self::story_task(
            story,
            PromptType::Setup,
            story.user_input.clone(),
        ))]
    }

    fn handle_first_scene(
        story: &mut PublishedStory,
        raw_scene: &str,
    ) -> Result<Vec<FollowUp>, TransitionError> {
        let scene: serde_json::Value = match serde_json::from_str(raw_scene) {
            Ok(scene) => scene,
            Err(e) => {
                story.fail(format!("unreadable first scene: {e}"));
                return Ok(vec![Self::error_push(
                    story.author_id,
                    "Story generation failed",
                    "first scene unreadable",
                )]);
            }
        };
        story.complete_first_scene(scene)?;
        Ok(vec![FollowUp::Push(PushNotificationPayload {
            user_id: story.author_id,
            notification: PushMessage {
                title: "Your story is ready".to_string(),
                body: "The first scene awaits.".to_string(),
            },
            data: HashMap::from([("published_story_id".to_string(), story.id.to_string())]),
        })])
    }

    // ---- Player game state (scene continuation) ----

    async fn apply_game_state(
        &self,
        state_id: crate::domain::value_objects::GameStateId,
        notif: &NotificationPayload,
        result: Option<GenerationResult>,
    ) -> Result<TransitionReceipt, RepositoryError> {
        let notif = notif.clone();
        self.store
            .apply_game_state_transition(
                state_id,
                notif.task_id,
                Box::new(move |state| Self::game_state_mutator(state, &notif, result)),
            )
            .await
    }

    fn game_state_mutator(
        state: &mut PlayerGameState,
        notif: &NotificationPayload,
        result: Option<GenerationResult>,
    ) -> Result<Vec<FollowUp>, TransitionError> {
        if !notif.is_success() {
            state.fail(notif.error_details.clone());
            return Ok(vec![Self::error_push(
                state.player_id,
                "Scene generation failed",
                &notif.error_details,
            )]);
        }
        let result = result.ok_or_else(|| {
            TransitionError::MalformedResult("missing generation result".to_string())
        })?;

        match notif.prompt_type {
            PromptType::SceneJson => {
                let scene: serde_json::Value = match serde_json::from_str(&result.text) {
                    Ok(scene) => scene,
                    Err(e) => {
                        state.fail(format!("unreadable scene: {e}"));
                        return Ok(vec![Self::error_push(
                            state.player_id,
                            "Scene generation failed",
                            "scene unreadable",
                        )]);
                    }
                };
                // A final scene hands off to the game-over stage instead of
                // returning control to the player.
                if scene.get("game_over").and_then(|v| v.as_bool()) == Some(true) {
                    state.last_generation_attempt_at = Some(chrono::Utc::now());
                    let task = Self::state_task(state, PromptType::GameOver)
                        .with_user_input(state.last_choice.clone().unwrap_or_default());
                    return Ok(vec![FollowUp::Dispatch(task)]);
                }
                state.complete_scene(scene)?;
                Ok(vec![FollowUp::Push(PushNotificationPayload {
                    user_id: state.player_id,
                    notification: PushMessage {
                        title: "Your scene is ready".to_string(),
                        body: "The story continues.".to_string(),
                    },
                    data: HashMap::from([(
                        "player_game_state_id".to_string(),
                        state.id.to_string(),
                    )]),
                })])
            }
            PromptType::GameOver => {
                let (ending, seed) = Self::parse_game_over(&result.text);
                state.complete_game_over(ending, seed)?;
                Ok(vec![FollowUp::Push(PushNotificationPayload {
                    user_id: state.player_id,
                    notification: PushMessage {
                        title: "The end".to_string(),
                        body: "Your story has concluded.".to_string(),
                    },
                    data: HashMap::from([(
                        "player_game_state_id".to_string(),
                        state.id.to_string(),
                    )]),
                })])
            }
            other => Err(TransitionError::UnexpectedStage {
                got: other.to_string(),
                step: crate::domain::value_objects::GenerationStep::FirstSceneGeneration,
            }),
        }
    }

    /// Endings may arrive as plain prose or as JSON carrying a continuation
    /// seed for a new character in the same session.
    fn parse_game_over(raw: &str) -> (String, Option<String>) {
        #[derive(serde::Deserialize)]
        struct GameOverPayload {
            ending: String,
            #[serde(default)]
            continuation_prompt: Option<String>,
        }
        match serde_json::from_str::<GameOverPayload>(raw) {
            Ok(payload) => (payload.ending, payload.continuation_prompt),
            Err(_) => (raw.to_string(), None),
        }
    }

    // ---- Task and push builders ----

    fn story_task(
        story: &PublishedStory,
        prompt_type: PromptType,
        user_input: String,
    ) -> GenerationTaskPayload {
        GenerationTaskPayload::new(story.author_id, prompt_type, story.language.clone())
            .with_user_input(user_input)
            .for_published_story(story.id)
    }

    fn state_task(state: &PlayerGameState, prompt_type: PromptType) -> GenerationTaskPayload {
        GenerationTaskPayload::new(state.player_id, prompt_type, state.language.clone())
            .for_game_state(state.id)
            .with_state_hash(state.state_hash.clone())
    }

    fn error_push(user_id: UserId, title: &str, details: &str) -> FollowUp {
        FollowUp::Push(PushNotificationPayload {
            user_id,
            notification: PushMessage {
                title: title.to_string(),
                body: details.to_string(),
            },
            data: HashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::application::dto::INITIAL_STATE_HASH;
    use crate::application::ports::outbound::GameplayStorePort;
    use crate::domain::entities::StoryConfig;
    use crate::domain::value_objects::{GameStateStatus, GenerationStep, StoryStatus};
    use crate::infrastructure::broker::{topology, InMemoryBroker};
    use crate::infrastructure::persistence::{InMemoryGameplayStore, InMemoryResultStore};

    struct Harness {
        service: StoryPipelineService,
        broker: Arc<InMemoryBroker>,
        store: Arc<InMemoryGameplayStore>,
        results: Arc<InMemoryResultStore>,
    }

    fn harness() -> Harness {
        let broker = Arc::new(InMemoryBroker::new());
        for queue in topology::TASK_QUEUES {
            broker.declare(queue);
        }
        let store = Arc::new(InMemoryGameplayStore::new());
        let results = Arc::new(InMemoryResultStore::new());
        let service = StoryPipelineService::new(
            broker.clone(),
            store.clone(),
            results.clone(),
            Arc::new(TaskDispatchService::new(broker.clone())),
        );
        Harness {
            service,
            broker,
            store,
            results,
        }
    }

    impl Harness {
        async fn seed_story(&self) -> PublishedStory {
            let mut story =
                PublishedStory::new(UserId::new(), "en", "a dark fantasy about a baker");
            story.mark_generation_attempt();
            self.store.insert_story(&story).await.unwrap();
            story
        }

        async fn story(&self, id: StoryId) -> PublishedStory {
            self.store.get_story(id).await.unwrap().unwrap()
        }

        /// Simulate a worker: record a success result for `task` and feed the
        /// matching notification through the consumer.
        async fn complete(&self, task: &GenerationTaskPayload, text: &str) -> HandleOutcome {
            let result = GenerationResult::success(
                task.task_id,
                task.user_id,
                task.prompt_type,
                text.to_string(),
                5,
                10,
                20,
                0.0,
            );
            self.results.insert(&result).await.unwrap();
            let notif = NotificationPayload::success(task);
            self.service.handle(&serde_json::to_vec(&notif).unwrap()).await
        }

        /// Pop the next dispatched task off a worker queue.
        fn dispatched(&self, queue: &str) -> Option<GenerationTaskPayload> {
            self.broker
                .take_published(queue)
                .map(|body| serde_json::from_slice(&body).unwrap())
        }

        fn dispatched_all(&self, queue: &str) -> Vec<GenerationTaskPayload> {
            let mut tasks = Vec::new();
            while let Some(task) = self.dispatched(queue) {
                tasks.push(task);
            }
            tasks
        }
    }

    fn moderation_task(story: &PublishedStory) -> GenerationTaskPayload {
        GenerationTaskPayload::new(story.author_id, PromptType::ContentModeration, "en")
            .with_user_input(story.user_input.clone())
            .for_published_story(story.id)
    }

    const PLAN: &str = r#"{
        "synopsis": "a baker against the night court",
        "characters": [
            {"name": "Mira", "brief": "the baker"},
            {"name": "Teodor", "brief": "the rival"}
        ],
        "cards": [{"title": "The Bakery", "image_prompt": "a moonlit bakery"}]
    }"#;

    /// Drive a freshly seeded story to the end of the fan-out stage.
    /// Returns the story id and the image tasks still outstanding.
    async fn advance_to_fan_out(h: &Harness) -> (StoryId, Vec<GenerationTaskPayload>) {
        let story = h.seed_story().await;

        assert_eq!(
            h.complete(&moderation_task(&story), r#"{"allowed": true}"#).await,
            HandleOutcome::Ack
        );
        let goal_task = h.dispatched(topology::STORY_GENERATION_TASKS).unwrap();
        assert_eq!(goal_task.prompt_type, PromptType::ProtagonistGoal);

        assert_eq!(h.complete(&goal_task, "out-bake the night court").await, HandleOutcome::Ack);
        let planner_task = h.dispatched(topology::STORY_GENERATION_TASKS).unwrap();
        assert_eq!(planner_task.prompt_type, PromptType::ScenePlanner);

        assert_eq!(h.complete(&planner_task, PLAN).await, HandleOutcome::Ack);

        let after_plan = h.story(story.id).await;
        assert_eq!(after_plan.pending_character_generation_tasks, 2);
        // One planned card plus the story preview
        assert_eq!(after_plan.pending_card_image_tasks, 2);
        assert_eq!(after_plan.pending_character_image_tasks, 2);
        assert!(after_plan.are_images_pending);
        assert!(after_plan.invariants_hold());

        let character_tasks = h.dispatched_all(topology::STORY_GENERATION_TASKS);
        assert_eq!(character_tasks.len(), 2);
        let mut image_tasks = h.dispatched_all(topology::IMAGE_GENERATION_TASKS);
        assert_eq!(image_tasks.len(), 2); // card + preview

        // Character sheets complete, each spawning a portrait task
        for task in &character_tasks {
            assert_eq!(h.complete(task, "a detailed character sheet").await, HandleOutcome::Ack);
            let portrait = h.dispatched(topology::IMAGE_GENERATION_TASKS).unwrap();
            assert_eq!(portrait.prompt_type, PromptType::CharacterImage);
            image_tasks.push(portrait);
        }

        let mid = h.story(story.id).await;
        assert_eq!(mid.pending_character_generation_tasks, 0);
        assert!(mid.invariants_hold());
        (story.id, image_tasks)
    }

    #[tokio::test]
    async fn draft_narrator_round_trip() {
        let h = harness();
        let mut config = StoryConfig::new(UserId::new(), "en", "a dark fantasy about a baker");
        config.begin_generation();
        h.store.insert_story_config(&config).await.unwrap();

        let task = GenerationTaskPayload::new(config.user_id, PromptType::Narrator, "en")
            .with_user_input(config.user_input.clone())
            .for_story_config(config.id);
        assert_eq!(h.complete(&task, "Narrated premise").await, HandleOutcome::Ack);

        let after = h.store.get_story_config(config.id).await.unwrap().unwrap();
        assert_eq!(after.status, crate::domain::value_objects::ConfigStatus::Draft);
        assert_eq!(after.narrator_output.as_deref(), Some("Narrated premise"));
    }

    #[tokio::test]
    async fn duplicate_notification_is_a_commit_free_ack() {
        let h = harness();
        let mut config = StoryConfig::new(UserId::new(), "en", "premise");
        config.begin_generation();
        h.store.insert_story_config(&config).await.unwrap();

        let task = GenerationTaskPayload::new(config.user_id, PromptType::Narrator, "en")
            .for_story_config(config.id);
        assert_eq!(h.complete(&task, "first rendition").await, HandleOutcome::Ack);
        let after_first = h.store.get_story_config(config.id).await.unwrap().unwrap();

        // Replay the identical success notification
        let notif = NotificationPayload::success(&task);
        let outcome = h.service.handle(&serde_json::to_vec(&notif).unwrap()).await;
        assert_eq!(outcome, HandleOutcome::Ack);

        let after_second = h.store.get_story_config(config.id).await.unwrap().unwrap();
        assert_eq!(after_second.updated_at, after_first.updated_at);
        assert_eq!(after_second.narrator_output, after_first.narrator_output);
    }

    #[tokio::test]
    async fn moderation_rejection_fails_the_story_and_pushes() {
        let h = harness();
        let story = h.seed_story().await;

        let outcome = h
            .complete(&moderation_task(&story), r#"{"allowed": false, "reason": "gore"}"#)
            .await;
        assert_eq!(outcome, HandleOutcome::Ack);

        let after = h.story(story.id).await;
        assert_eq!(after.status, StoryStatus::Error);
        assert!(after.error_details.as_deref().unwrap().contains("gore"));
        assert!(after.invariants_hold());

        let push: PushNotificationPayload = serde_json::from_slice(
            &h.broker.take_published(topology::PUSH_NOTIFICATIONS).unwrap(),
        )
        .unwrap();
        assert_eq!(push.user_id, story.author_id);
        // No follow-on generation was dispatched
        assert!(h.dispatched(topology::STORY_GENERATION_TASKS).is_none());
    }

    #[tokio::test]
    async fn image_fan_out_drains_in_any_order_and_dispatches_setup_once() {
        let h = harness();
        let (story_id, mut image_tasks) = advance_to_fan_out(&h).await;

        // Complete the four images in a scrambled order
        image_tasks.swap(0, 3);
        image_tasks.swap(1, 2);
        for (i, task) in image_tasks.iter().enumerate() {
            assert_eq!(
                h.complete(task, &format!("https://cdn/img-{i}.jpg")).await,
                HandleOutcome::Ack
            );
            assert!(h.story(story_id).await.invariants_hold());
        }

        let drained = h.story(story_id).await;
        assert!(!drained.are_images_pending);
        assert_eq!(drained.pending_card_image_tasks, 0);
        assert_eq!(drained.pending_character_image_tasks, 0);
        assert_eq!(drained.step, GenerationStep::SetupGeneration);

        // Setup dispatched exactly once
        let text_tasks = h.dispatched_all(topology::STORY_GENERATION_TASKS);
        assert_eq!(text_tasks.len(), 1);
        assert_eq!(text_tasks[0].prompt_type, PromptType::Setup);
    }

    #[tokio::test]
    async fn concurrent_completions_serialize_without_underflow() {
        let h = Arc::new(harness());
        let (story_id, image_tasks) = advance_to_fan_out(&h).await;

        // All outstanding images complete at once from separate consumers
        let mut handles = Vec::new();
        for (i, task) in image_tasks.into_iter().enumerate() {
            let h = h.clone();
            handles.push(tokio::spawn(async move {
                h.complete(&task, &format!("https://cdn/img-{i}.jpg")).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), HandleOutcome::Ack);
        }

        let after = h.story(story_id).await;
        assert!(!after.has_pending_fan_out());
        assert!(!after.are_images_pending);
        assert_eq!(after.step, GenerationStep::SetupGeneration);
        assert!(after.invariants_hold());

        // No interleaving dispatched setup more than once
        let text_tasks = h.dispatched_all(topology::STORY_GENERATION_TASKS);
        assert_eq!(text_tasks.len(), 1);
        assert_eq!(text_tasks[0].prompt_type, PromptType::Setup);
    }

    #[tokio::test]
    async fn full_pipeline_reaches_ready() {
        let h = harness();
        let (story_id, image_tasks) = advance_to_fan_out(&h).await;
        for task in &image_tasks {
            assert_eq!(h.complete(task, "https://cdn/img.jpg").await, HandleOutcome::Ack);
        }

        let setup_task = h.dispatched(topology::STORY_GENERATION_TASKS).unwrap();
        assert_eq!(h.complete(&setup_task, "the world as it stands").await, HandleOutcome::Ack);

        let scene_task = h.dispatched(topology::STORY_GENERATION_TASKS).unwrap();
        assert_eq!(scene_task.prompt_type, PromptType::SceneJson);
        assert_eq!(scene_task.state_hash.as_deref(), Some(INITIAL_STATE_HASH));

        assert_eq!(
            h.complete(&scene_task, r#"{"text": "dawn in the bakery", "choices": []}"#).await,
            HandleOutcome::Ack
        );

        let done = h.story(story_id).await;
        assert_eq!(done.status, StoryStatus::Ready);
        assert_eq!(done.step, GenerationStep::Done);
        assert!(!done.is_first_scene_pending);
        assert!(done.first_scene.is_some());
        assert!(done.setup.is_some());
        assert!(done.invariants_hold());

        // The author gets a ready push
        let push: PushNotificationPayload = serde_json::from_slice(
            &h.broker.take_published(topology::PUSH_NOTIFICATIONS).unwrap(),
        )
        .unwrap();
        assert_eq!(push.notification.title, "Your story is ready");
    }

    #[tokio::test]
    async fn error_notification_fails_the_story_and_clears_counters() {
        let h = harness();
        let (story_id, _image_tasks) = advance_to_fan_out(&h).await;

        let task = GenerationTaskPayload::new(UserId::new(), PromptType::CardImage, "en")
            .for_published_story(story_id);
        let notif = NotificationPayload::error(&task, "image model exploded");
        let outcome = h.service.handle(&serde_json::to_vec(&notif).unwrap()).await;
        assert_eq!(outcome, HandleOutcome::Ack);

        let after = h.story(story_id).await;
        assert_eq!(after.status, StoryStatus::Error);
        assert_eq!(after.pending_card_image_tasks, 0);
        assert_eq!(after.pending_character_image_tasks, 0);
        assert!(!after.are_images_pending);
        assert!(after.invariants_hold());
        assert!(h.broker.take_published(topology::PUSH_NOTIFICATIONS).is_some());
    }

    #[tokio::test]
    async fn late_completion_after_terminal_is_a_warned_no_op() {
        let h = harness();
        let (story_id, image_tasks) = advance_to_fan_out(&h).await;

        // Fail the story, then let a straggler image completion arrive
        let task = GenerationTaskPayload::new(UserId::new(), PromptType::CardImage, "en")
            .for_published_story(story_id);
        let notif = NotificationPayload::error(&task, "boom");
        h.service.handle(&serde_json::to_vec(&notif).unwrap()).await;

        let straggler = &image_tasks[0];
        assert_eq!(h.complete(straggler, "https://cdn/late.jpg").await, HandleOutcome::Ack);

        let after = h.story(story_id).await;
        assert_eq!(after.status, StoryStatus::Error);
        assert_eq!(after.pending_card_image_tasks, 0);
        assert!(after.invariants_hold());
    }

    #[tokio::test]
    async fn unknown_story_dead_letters() {
        let h = harness();
        let task = GenerationTaskPayload::new(UserId::new(), PromptType::Setup, "en")
            .for_published_story(StoryId::new());
        let notif = NotificationPayload::error(&task, "whatever");
        assert_eq!(
            h.service.handle(&serde_json::to_vec(&notif).unwrap()).await,
            HandleOutcome::NackDead
        );
    }

    #[tokio::test]
    async fn success_without_visible_result_requeues() {
        let h = harness();
        let story = h.seed_story().await;
        let task = moderation_task(&story);
        // Notification published before the result row becomes visible
        let notif = NotificationPayload::success(&task);
        assert_eq!(
            h.service.handle(&serde_json::to_vec(&notif).unwrap()).await,
            HandleOutcome::NackRequeue
        );
    }

    #[tokio::test]
    async fn garbage_notification_dead_letters() {
        let h = harness();
        assert_eq!(h.service.handle(b"not json").await, HandleOutcome::NackDead);
    }

    #[tokio::test]
    async fn player_scene_round_trip() {
        let h = harness();
        let mut state = PlayerGameState::new(
            UserId::new(),
            StoryId::new(),
            "en",
            serde_json::json!({"scene": 0}),
        );
        state.begin_scene_generation("enter the bakery").unwrap();
        h.store.insert_game_state(&state).await.unwrap();

        let task = GenerationTaskPayload::new(state.player_id, PromptType::SceneJson, "en")
            .for_game_state(state.id)
            .with_state_hash(state.state_hash.clone());
        assert_eq!(
            h.complete(&task, r#"{"text": "flour everywhere", "choices": ["hide"]}"#).await,
            HandleOutcome::Ack
        );

        let after = h.store.get_game_state(state.id).await.unwrap().unwrap();
        assert_eq!(after.status, GameStateStatus::Playing);
        assert_eq!(after.current_scene_index, 1);

        let push: PushNotificationPayload = serde_json::from_slice(
            &h.broker.take_published(topology::PUSH_NOTIFICATIONS).unwrap(),
        )
        .unwrap();
        assert_eq!(push.user_id, state.player_id);
    }

    #[tokio::test]
    async fn final_scene_branches_into_game_over() {
        let h = harness();
        let mut state = PlayerGameState::new(
            UserId::new(),
            StoryId::new(),
            "en",
            serde_json::json!({"scene": 0}),
        );
        state.begin_scene_generation("open the oven").unwrap();
        h.store.insert_game_state(&state).await.unwrap();

        let scene_task = GenerationTaskPayload::new(state.player_id, PromptType::SceneJson, "en")
            .for_game_state(state.id)
            .with_state_hash(state.state_hash.clone());
        assert_eq!(
            h.complete(&scene_task, r#"{"game_over": true}"#).await,
            HandleOutcome::Ack
        );

        // Still generating; a game-over task went out instead of a scene
        let mid = h.store.get_game_state(state.id).await.unwrap().unwrap();
        assert_eq!(mid.status, GameStateStatus::Generating);
        let game_over_task = h.dispatched(topology::STORY_GENERATION_TASKS).unwrap();
        assert_eq!(game_over_task.prompt_type, PromptType::GameOver);

        let ending = r#"{"ending": "the oven wins", "continuation_prompt": "the apprentice"}"#;
        assert_eq!(h.complete(&game_over_task, ending).await, HandleOutcome::Ack);

        let after = h.store.get_game_state(state.id).await.unwrap().unwrap();
        assert_eq!(after.status, GameStateStatus::Finished);
        assert_eq!(after.ending.as_deref(), Some("the oven wins"));
        assert_eq!(after.continuation_seed.as_deref(), Some("the apprentice"));
    }
}
