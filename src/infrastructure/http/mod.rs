//! HTTP REST API routes

mod game_routes;
mod story_routes;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::infrastructure::state::AppState;

/// Create all API routes
pub fn create_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Draft routes
        .route("/api/drafts", post(story_routes::create_draft))
        .route("/api/drafts/{id}", get(story_routes::get_draft))
        .route("/api/drafts/{id}/publish", post(story_routes::publish_draft))
        // Story routes
        .route("/api/stories/{id}", get(story_routes::get_story))
        .route("/api/stories/{id}/sessions", post(game_routes::start_session))
        // Game state routes
        .route("/api/game-states/{id}", get(game_routes::get_game_state))
        .route("/api/game-states/{id}/choice", post(game_routes::make_choice))
        // Task status
        .route("/api/tasks/{id}", get(story_routes::get_task_status))
}
