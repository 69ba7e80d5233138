//! Push ports - Platform senders and the auth service

use std::collections::HashMap;

use async_trait::async_trait;

use crate::application::dto::PushMessage;
use crate::domain::entities::{DeviceToken, Platform};
use crate::domain::value_objects::UserId;

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("transient error: {0}")]
    Transient(String),
    #[error("terminal error: {0}")]
    Terminal(String),
}

/// Outcome of a batch send. A token-level rejection never fails the batch;
/// it is reported here so the caller can queue the token for deletion.
#[derive(Debug, Default)]
pub struct SendReport {
    /// Tokens the platform reported unregistered or malformed.
    pub invalid_tokens: Vec<String>,
}

#[async_trait]
pub trait PlatformSenderPort: Send + Sync {
    fn platform(&self) -> Platform;

    async fn send(
        &self,
        tokens: &[String],
        message: &PushMessage,
        data: &HashMap<String, String>,
    ) -> Result<SendReport, PushError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AuthServiceError {
    #[error("transient error: {0}")]
    Transient(String),
    #[error("terminal error: {0}")]
    Terminal(String),
}

impl AuthServiceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Internal HTTP surface of the auth service, called with the
/// inter-service token header.
#[async_trait]
pub trait AuthServicePort: Send + Sync {
    async fn device_tokens(&self, user_id: UserId) -> Result<Vec<DeviceToken>, AuthServiceError>;
    async fn delete_token(&self, user_id: UserId, token: &str) -> Result<(), AuthServiceError>;
}
