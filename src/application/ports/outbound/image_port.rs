//! Image model port - Interface to the image generation endpoint and artifact store

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct ImageRequest {
    /// Full prompt: task prompt plus the configured style suffix.
    pub prompt: String,
    /// Aspect ratio, e.g. "2:3".
    pub ratio: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ImageModelError {
    #[error("request timed out")]
    Timeout,
    #[error("transient error: {0}")]
    Transient(String),
    #[error("terminal error: {0}")]
    Terminal(String),
}

impl ImageModelError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transient(_))
    }
}

#[async_trait]
pub trait ImageModelPort: Send + Sync {
    /// Synchronous generation call; returns the encoded image bytes.
    async fn generate(&self, request: ImageRequest) -> Result<Vec<u8>, ImageModelError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ImageStoreError {
    #[error("io error: {0}")]
    Io(String),
}

#[async_trait]
pub trait ImageStorePort: Send + Sync {
    /// Write the artifact as `{reference}.jpg` and return its public URL.
    /// The filename is deterministic from the reference, so re-running a
    /// task overwrites the same file identity.
    async fn store(&self, reference: &str, bytes: &[u8]) -> Result<String, ImageStoreError>;
}
