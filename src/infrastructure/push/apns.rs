//! APNS sender for iOS devices
//!
//! APNS takes one request per device token; rejections with 410 Gone (or a
//! BadDeviceToken reason) are reported as invalid so the caller can queue
//! the token for deletion, the same as FCM's NotRegistered.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::application::dto::PushMessage;
use crate::application::ports::outbound::{PlatformSenderPort, PushError, SendReport};
use crate::domain::entities::Platform;

pub struct ApnsSender {
    client: Client,
    base_url: String,
    token: String,
    topic: String,
}

impl ApnsSender {
    pub fn new(base_url: &str, token: &str, topic: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            topic: topic.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApnsError {
    reason: String,
}

#[async_trait]
impl PlatformSenderPort for ApnsSender {
    fn platform(&self) -> Platform {
        Platform::Ios
    }

    async fn send(
        &self,
        tokens: &[String],
        message: &PushMessage,
        data: &HashMap<String, String>,
    ) -> Result<SendReport, PushError> {
        let mut payload = serde_json::json!({
            "aps": {
                "alert": {
                    "title": message.title,
                    "body": message.body,
                }
            }
        });
        for (key, value) in data {
            payload[key.as_str()] = serde_json::Value::String(value.clone());
        }

        let mut invalid_tokens = Vec::new();
        let mut transient: Option<String> = None;
        for token in tokens {
            let response = self
                .client
                .post(format!("{}/3/device/{}", self.base_url, token))
                .header("authorization", format!("bearer {}", self.token))
                .header("apns-topic", &self.topic)
                .json(&payload)
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    transient = Some(e.to_string());
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                continue;
            }
            let reason = response
                .json::<ApnsError>()
                .await
                .map(|e| e.reason)
                .unwrap_or_default();
            if status.as_u16() == 410 || reason == "BadDeviceToken" || reason == "Unregistered" {
                invalid_tokens.push(token.clone());
            } else if status.is_server_error() {
                transient = Some(format!("{status}: {reason}"));
            } else {
                tracing::warn!(%status, reason, "APNS delivery failure");
            }
        }

        // Surface a transient aggregate only when nothing token-level needs
        // reaping; otherwise the report must make it back to the caller.
        if invalid_tokens.is_empty() {
            if let Some(e) = transient {
                return Err(PushError::Transient(e));
            }
        }
        Ok(SendReport { invalid_tokens })
    }
}
