//! Image model client and filesystem artifact store

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::application::ports::outbound::{
    ImageModelError, ImageModelPort, ImageRequest, ImageStoreError, ImageStorePort,
};

/// Client for the image model's synchronous generation endpoint.
pub struct ImageModelClient {
    client: Client,
    base_url: String,
}

impl ImageModelClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    ratio: &'a str,
}

#[async_trait]
impl ImageModelPort for ImageModelClient {
    async fn generate(&self, request: ImageRequest) -> Result<Vec<u8>, ImageModelError> {
        let response = self
            .client
            .post(format!("{}/generate", self.base_url))
            .json(&GenerateRequest {
                prompt: &request.prompt,
                ratio: &request.ratio,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ImageModelError::Timeout
                } else {
                    ImageModelError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                ImageModelError::Transient(format!("{status}: {text}"))
            } else {
                ImageModelError::Terminal(format!("{status}: {text}"))
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ImageModelError::Transient(e.to_string()))?;
        if bytes.is_empty() {
            return Err(ImageModelError::Terminal("empty image response".to_string()));
        }
        Ok(bytes.to_vec())
    }
}

/// Writes artifacts under the configured output directory and serves them
/// from the public base URL.
pub struct FilesystemImageStore {
    output_dir: String,
    public_base_url: String,
}

impl FilesystemImageStore {
    pub fn new(output_dir: &str, public_base_url: &str) -> Self {
        Self {
            output_dir: output_dir.trim_end_matches('/').to_string(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ImageStorePort for FilesystemImageStore {
    async fn store(&self, reference: &str, bytes: &[u8]) -> Result<String, ImageStoreError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| ImageStoreError::Io(e.to_string()))?;
        let path = format!("{}/{}.jpg", self.output_dir, reference);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ImageStoreError::Io(e.to_string()))?;
        tracing::debug!(path, "stored image artifact");
        Ok(format!("{}/{}.jpg", self.public_base_url, reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_reference_overwrites_the_same_path() {
        let dir = std::env::temp_dir().join(format!("taleforge-test-{}", uuid::Uuid::new_v4()));
        let store = FilesystemImageStore::new(dir.to_str().unwrap(), "https://cdn.example");

        let first = store.store("card-1", b"one").await.unwrap();
        let second = store.store("card-1", b"two").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "https://cdn.example/card-1.jpg");

        let on_disk = tokio::fs::read(dir.join("card-1.jpg")).await.unwrap();
        assert_eq!(on_disk, b"two");
        tokio::fs::remove_dir_all(dir).await.unwrap();
    }
}
