//! Broker port - Interface to the message broker
//!
//! Task queues are durable and declared with a dead-letter exchange; their
//! companion `<queue>_dlq` is bound to that exchange with the queue's own
//! name as routing key. Consumers acknowledge manually:
//!
//! - ack on successful handle (a persisted task failure is still a handled delivery)
//! - nack without requeue for payload-attributable failures -> DLQ
//! - nack with requeue only for transient infrastructure errors

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("channel error: {0}")]
    Channel(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
}

/// One message handed to a consumer, with its acknowledgement handle.
#[async_trait]
pub trait DeliveryPort: Send {
    fn payload(&self) -> &[u8];
    /// Routing key the message arrived with (event streams dispatch on it).
    fn routing_key(&self) -> &str;
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}

/// A subscription yielding deliveries until the broker shuts down.
#[async_trait]
pub trait DeliveryStreamPort: Send {
    async fn next(&mut self) -> Option<Box<dyn DeliveryPort>>;
}

#[async_trait]
pub trait BrokerPort: Send + Sync {
    /// Declare a durable task queue plus its dead-letter companion.
    async fn declare_task_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Publish persistent JSON to a queue (default exchange, routing key = queue name).
    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        correlation_id: &str,
    ) -> Result<(), BrokerError>;

    /// Publish to the cache-invalidation topic exchange.
    async fn publish_event(&self, routing_key: &str, body: Vec<u8>) -> Result<(), BrokerError>;

    /// Consume a task queue with the given prefetch.
    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliveryStreamPort>, BrokerError>;

    /// Bind a per-process queue to the cache-invalidation exchange
    /// (`config.*` and `prompt.*`) and consume it.
    async fn subscribe_events(&self) -> Result<Box<dyn DeliveryStreamPort>, BrokerError>;
}
