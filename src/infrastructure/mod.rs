//! Infrastructure layer - Adapters for the broker, stores, HTTP and providers

pub mod auth_client;
pub mod broker;
pub mod config;
pub mod http;
pub mod image_client;
pub mod ollama;
pub mod persistence;
pub mod push;
pub mod state;
