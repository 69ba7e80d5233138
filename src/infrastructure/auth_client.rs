//! Auth service client - Internal HTTP calls for device tokens

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::application::ports::outbound::{AuthServiceError, AuthServicePort};
use crate::domain::entities::{DeviceToken, Platform};
use crate::domain::value_objects::UserId;

const INTERNAL_TOKEN_HEADER: &str = "X-Internal-Token";

pub struct AuthServiceClient {
    client: Client,
    base_url: String,
    service_token: String,
}

impl AuthServiceClient {
    pub fn new(base_url: &str, service_token: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_token: service_token.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenRow {
    token: String,
    platform: Platform,
}

#[async_trait]
impl AuthServicePort for AuthServiceClient {
    async fn device_tokens(&self, user_id: UserId) -> Result<Vec<DeviceToken>, AuthServiceError> {
        let response = self
            .client
            .get(format!("{}/internal/users/{}/device-tokens", self.base_url, user_id))
            .header(INTERNAL_TOKEN_HEADER, &self.service_token)
            .send()
            .await
            .map_err(|e| AuthServiceError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                AuthServiceError::Transient(format!("{status}: {text}"))
            } else {
                AuthServiceError::Terminal(format!("{status}: {text}"))
            });
        }

        let rows: Vec<TokenRow> = response
            .json()
            .await
            .map_err(|e| AuthServiceError::Terminal(format!("malformed token list: {e}")))?;
        Ok(rows
            .into_iter()
            .map(|row| DeviceToken {
                user_id,
                token: row.token,
                platform: row.platform,
            })
            .collect())
    }

    async fn delete_token(&self, user_id: UserId, token: &str) -> Result<(), AuthServiceError> {
        let response = self
            .client
            .delete(format!("{}/internal/users/{}/device-tokens/{}", self.base_url, user_id, token))
            .header(INTERNAL_TOKEN_HEADER, &self.service_token)
            .send()
            .await
            .map_err(|e| AuthServiceError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() || status.as_u16() == 404 {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(if status.is_server_error() {
            AuthServiceError::Transient(format!("{status}: {text}"))
        } else {
            AuthServiceError::Terminal(format!("{status}: {text}"))
        })
    }
}
