//! TaleForge Engine - Backend for AI-driven interactive novel generation
//!
//! One process hosts:
//! - the REST surface (drafts, stories, sessions, task status)
//! - the text and image generation workers
//! - the notification consumer that drives the story state machine
//! - the push fan-out and token-deletion consumers
//! - the cache-invalidation bus consumer and the stuck-task reaper

mod application;
mod domain;
mod infrastructure;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::infrastructure::broker::topology;
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::http;
use crate::infrastructure::state::AppState;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Structured JSON lines on stdout
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taleforge_engine=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting TaleForge Engine");

    let config = AppConfig::from_env()?;
    tracing::info!("Configuration loaded");
    tracing::info!("  Broker: {} ({})", config.broker_backend, config.broker_uri);
    tracing::info!("  Store: {}", config.store_backend);
    tracing::info!("  Ollama: {}", config.ollama_base_url);
    tracing::info!("  Image model: {}", config.image_model_url);

    let state = Arc::new(AppState::new(config).await?);
    tracing::info!("Application state initialized");

    let shutdown = CancellationToken::new();
    let mut workers = Vec::new();

    workers.push({
        let worker = state.text_worker.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            tracing::info!("Starting text generation worker");
            worker.run(token).await;
        })
    });

    workers.push({
        let worker = state.image_worker.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            tracing::info!("Starting image generation worker");
            worker.run(token).await;
        })
    });

    // The notification consumer reads both internal-update queues
    for queue in [topology::INTERNAL_UPDATES, topology::IMAGE_GENERATOR_RESULTS] {
        workers.push({
            let pipeline = state.pipeline.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                tracing::info!(queue, "Starting notification consumer");
                pipeline.run(queue, token).await;
            })
        });
    }

    workers.push({
        let service = state.push_service.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            tracing::info!("Starting push service");
            service.run(token).await;
        })
    });

    workers.push({
        let worker = state.token_deletion_worker.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            tracing::info!("Starting token deletion worker");
            worker.run(token).await;
        })
    });

    workers.push({
        let worker = state.cache_bus.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            tracing::info!("Starting cache bus worker");
            worker.run(token).await;
        })
    });

    workers.push({
        let reaper = state.reaper.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            tracing::info!("Starting stuck-task reaper");
            reaper.run(token).await;
        })
    });

    tracing::info!("Background workers started");

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(http::create_routes())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.server_port));
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server_shutdown = shutdown.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await });

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, draining workers");
        }
    }

    // Stop consumers and give in-flight handlers a bounded drain window.
    shutdown.cancel();
    let drain = futures_util::future::join_all(workers);
    if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
        tracing::warn!("workers did not drain within {:?}, exiting anyway", SHUTDOWN_DRAIN);
    }
    tracing::info!("Workers stopped");

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}
