//! Player session routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::application::dto::{
    FollowUp, GameStateSnapshot, GenerationTaskPayload, MakeChoiceRequest, StartSessionRequest,
    TaskAccepted,
};
use crate::application::ports::outbound::RepositoryError;
use crate::domain::entities::PlayerGameState;
use crate::domain::value_objects::{GameStateId, PromptType, StoryId, StoryStatus};
use crate::infrastructure::state::AppState;

type ApiError = (StatusCode, String);

fn internal(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// POST /api/stories/{id}/sessions - open a session on a Ready story.
pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Path(story_id): Path<StoryId>,
    Json(request): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<GameStateSnapshot>), ApiError> {
    let story = state
        .store
        .get_story(story_id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "story not found".to_string()))?;

    if story.status != StoryStatus::Ready {
        return Err((StatusCode::CONFLICT, "story is not ready to play".to_string()));
    }
    let first_scene = story
        .first_scene
        .clone()
        .ok_or_else(|| internal("ready story has no first scene"))?;

    let game_state = PlayerGameState::new(
        request.player_id,
        story.id,
        story.language.clone(),
        first_scene,
    );
    state.store.insert_game_state(&game_state).await.map_err(internal)?;

    Ok((StatusCode::CREATED, Json(GameStateSnapshot::from(&game_state))))
}

/// GET /api/game-states/{id}
pub async fn get_game_state(
    State(state): State<Arc<AppState>>,
    Path(id): Path<GameStateId>,
) -> Result<Json<GameStateSnapshot>, ApiError> {
    let game_state = state
        .store
        .get_game_state(id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "game state not found".to_string()))?;
    Ok(Json(GameStateSnapshot::from(&game_state)))
}

/// POST /api/game-states/{id}/choice - make a choice and enqueue the next
/// scene generation. 409 while a generation is already in flight.
pub async fn make_choice(
    State(state): State<Arc<AppState>>,
    Path(id): Path<GameStateId>,
    Json(request): Json<MakeChoiceRequest>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    if request.choice.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "choice must not be empty".to_string()));
    }

    let choice = request.choice.clone();
    let follow_ups = state
        .store
        .mutate_game_state(
            id,
            Box::new(move |game_state| {
                game_state.begin_scene_generation(choice.clone())?;
                let task = GenerationTaskPayload::new(
                    game_state.player_id,
                    PromptType::SceneJson,
                    game_state.language.clone(),
                )
                .with_user_input(choice)
                .for_game_state(game_state.id)
                .with_state_hash(game_state.state_hash.clone());
                Ok(vec![FollowUp::Dispatch(task)])
            }),
        )
        .await
        .map_err(|e| match e {
            RepositoryError::NotFound => {
                (StatusCode::NOT_FOUND, "game state not found".to_string())
            }
            RepositoryError::Transition(e) => (StatusCode::CONFLICT, e.to_string()),
            other => internal(other),
        })?;

    let task_id = follow_ups.iter().find_map(|f| match f {
        FollowUp::Dispatch(task) => Some(task.task_id),
        FollowUp::Push(_) => None,
    });
    state
        .dispatch
        .dispatch_follow_ups(follow_ups)
        .await
        .map_err(internal)?;

    let task_id = task_id.ok_or_else(|| internal("choice produced no task"))?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id })))
}
