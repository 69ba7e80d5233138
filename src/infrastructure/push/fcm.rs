//! FCM sender for Android devices

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::application::dto::PushMessage;
use crate::application::ports::outbound::{PlatformSenderPort, PushError, SendReport};
use crate::domain::entities::Platform;

const FCM_ENDPOINT: &str = "https://fcm.googleapis.com/fcm/send";

/// Token-level FCM errors that mean the registration is gone for good.
const DEAD_TOKEN_ERRORS: &[&str] = &["NotRegistered", "InvalidRegistration", "MismatchSenderId"];

pub struct FcmSender {
    client: Client,
    server_key: String,
    endpoint: String,
}

impl FcmSender {
    pub fn new(server_key: &str) -> Self {
        Self {
            client: Client::new(),
            server_key: server_key.to_string(),
            endpoint: FCM_ENDPOINT.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct FcmRequest<'a> {
    registration_ids: &'a [String],
    notification: FcmNotification<'a>,
    data: &'a HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct FcmNotification<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct FcmResponse {
    results: Vec<FcmResult>,
}

#[derive(Debug, Deserialize)]
struct FcmResult {
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl PlatformSenderPort for FcmSender {
    fn platform(&self) -> Platform {
        Platform::Android
    }

    async fn send(
        &self,
        tokens: &[String],
        message: &PushMessage,
        data: &HashMap<String, String>,
    ) -> Result<SendReport, PushError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("key={}", self.server_key))
            .json(&FcmRequest {
                registration_ids: tokens,
                notification: FcmNotification {
                    title: &message.title,
                    body: &message.body,
                },
                data,
            })
            .send()
            .await
            .map_err(|e| PushError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                PushError::Transient(format!("{status}: {text}"))
            } else {
                PushError::Terminal(format!("{status}: {text}"))
            });
        }

        let parsed: FcmResponse = response
            .json()
            .await
            .map_err(|e| PushError::Terminal(format!("malformed FCM response: {e}")))?;

        // Results are index-aligned with the token batch.
        let invalid_tokens = parsed
            .results
            .iter()
            .enumerate()
            .filter_map(|(i, result)| {
                let error = result.error.as_deref()?;
                if DEAD_TOKEN_ERRORS.contains(&error) {
                    tokens.get(i).cloned()
                } else {
                    tracing::warn!(error, "FCM delivery failure");
                    None
                }
            })
            .collect();
        Ok(SendReport { invalid_tokens })
    }
}
