//! Draft, story and task routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::application::dto::{
    CreateDraftRequest, DraftCreated, DraftSnapshot, GenerationTaskPayload, StoryPublished,
    StorySnapshot, TaskStatusResponse,
};
use crate::domain::entities::{PublishedStory, StoryConfig};
use crate::domain::value_objects::{ConfigStatus, PromptType, StoryConfigId, StoryId, TaskId};
use crate::infrastructure::state::AppState;

type ApiError = (StatusCode, String);

fn internal(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// POST /api/drafts - create a draft and enqueue the narrator task.
pub async fn create_draft(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateDraftRequest>,
) -> Result<(StatusCode, Json<DraftCreated>), ApiError> {
    if request.user_input.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "user_input must not be empty".to_string()));
    }

    let mut config = StoryConfig::new(request.user_id, request.language, request.user_input);
    config.begin_generation();
    state.store.insert_story_config(&config).await.map_err(internal)?;

    let task = GenerationTaskPayload::new(config.user_id, PromptType::Narrator, config.language.clone())
        .with_user_input(config.user_input.clone())
        .for_story_config(config.id);
    state.dispatch.dispatch(&task).await.map_err(internal)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DraftCreated {
            draft_id: config.id,
            task_id: task.task_id,
        }),
    ))
}

/// GET /api/drafts/{id}
pub async fn get_draft(
    State(state): State<Arc<AppState>>,
    Path(id): Path<StoryConfigId>,
) -> Result<Json<DraftSnapshot>, ApiError> {
    let config = state
        .store
        .get_story_config(id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "draft not found".to_string()))?;
    Ok(Json(DraftSnapshot::from(&config)))
}

/// POST /api/drafts/{id}/publish - promote to a PublishedStory and start
/// the generation pipeline with moderation.
pub async fn publish_draft(
    State(state): State<Arc<AppState>>,
    Path(id): Path<StoryConfigId>,
) -> Result<(StatusCode, Json<StoryPublished>), ApiError> {
    let config = state
        .store
        .get_story_config(id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "draft not found".to_string()))?;

    if config.status == ConfigStatus::Generating {
        return Err((
            StatusCode::CONFLICT,
            "draft is still generating".to_string(),
        ));
    }

    // The narrator's rendition, when present, is the premise that ships.
    let premise = config
        .narrator_output
        .clone()
        .unwrap_or_else(|| config.user_input.clone());
    let mut story = PublishedStory::new(config.user_id, config.language.clone(), premise);
    story.mark_generation_attempt();
    state.store.insert_story(&story).await.map_err(internal)?;

    let task = GenerationTaskPayload::new(
        story.author_id,
        PromptType::ContentModeration,
        story.language.clone(),
    )
    .with_user_input(story.user_input.clone())
    .for_published_story(story.id);
    state.dispatch.dispatch(&task).await.map_err(internal)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StoryPublished {
            published_story_id: story.id,
            task_id: task.task_id,
        }),
    ))
}

/// GET /api/stories/{id}
pub async fn get_story(
    State(state): State<Arc<AppState>>,
    Path(id): Path<StoryId>,
) -> Result<Json<StorySnapshot>, ApiError> {
    let story = state
        .store
        .get_story(id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "story not found".to_string()))?;
    Ok(Json(StorySnapshot::from(&story)))
}

/// GET /api/tasks/{id} - task status through the result store.
pub async fn get_task_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let response = match state.results.get(id).await.map_err(internal)? {
        Some(result) if result.is_success() => TaskStatusResponse {
            task_id: id,
            status: "success".to_string(),
            error: None,
            text: Some(result.text),
        },
        Some(result) => TaskStatusResponse {
            task_id: id,
            status: "error".to_string(),
            error: Some(result.error),
            text: None,
        },
        None => TaskStatusResponse {
            task_id: id,
            status: "pending".to_string(),
            error: None,
            text: None,
        },
    };
    Ok(Json(response))
}
