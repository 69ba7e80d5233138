//! Outbound ports - Interfaces that the application requires from external systems

mod broker_port;
mod image_port;
mod llm_port;
mod push_port;
mod repository_port;

pub use broker_port::{BrokerError, BrokerPort, DeliveryPort, DeliveryStreamPort};
pub use image_port::{ImageModelError, ImageModelPort, ImageRequest, ImageStoreError, ImageStorePort};
pub use llm_port::{ChatMessage, LlmError, LlmPort, LlmRequest, LlmResponse, MessageRole, TokenUsage};
pub use push_port::{AuthServiceError, AuthServicePort, PlatformSenderPort, PushError, SendReport};
pub use repository_port::{
    ConfigMutator, ConfigStorePort, GameStateMutator, GameplayStorePort, PromptStorePort,
    RepositoryError, ResultStorePort, StoryMutator, TransitionReceipt,
};
