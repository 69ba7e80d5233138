//! In-memory broker - Backend for tests and single-process runs
//!
//! Mirrors the AMQP discipline the lapin adapter provides: buffered queues,
//! a dead-letter companion per task queue, nack-requeue redelivery, and a
//! topic-style cache-event exchange. Selected with `BROKER_BACKEND=memory`;
//! the property tests drive the pipeline against this backend. Empty queues
//! are polled with a short sleep rather than woken.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::application::ports::outbound::{
    BrokerError, BrokerPort, DeliveryPort, DeliveryStreamPort,
};
use crate::infrastructure::broker::topology;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone)]
struct StoredMessage {
    body: Vec<u8>,
    routing_key: String,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    /// Per-process queues bound to the cache-event exchange.
    event_bindings: Vec<String>,
    event_queue_counter: u64,
    closed: bool,
}

#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    /// Declare a queue and its dead-letter companion.
    pub fn declare(&self, queue: &str) {
        let mut state = self.state.lock().unwrap();
        state.queues.entry(queue.to_string()).or_default();
        state.queues.entry(topology::dlq_name(queue)).or_default();
    }

    /// Pop one buffered message off a queue without consuming it through a
    /// subscription. Test helper.
    pub fn take_published(&self, queue: &str) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        state
            .queues
            .get_mut(queue)
            .and_then(|q| q.pop_front())
            .map(|m| m.body)
    }

    /// Number of messages currently buffered on a queue.
    pub fn depth(&self, queue: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.queues.get(queue).map_or(0, |q| q.len())
    }

    /// Stop all streams; `next()` returns None once buffers drain.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }

    fn push(&self, queue: &str, message: StoredMessage, front: bool) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        if front {
            q.push_front(message);
        } else {
            q.push_back(message);
        }
        Ok(())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerPort for InMemoryBroker {
    async fn declare_task_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.declare(queue);
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        _correlation_id: &str,
    ) -> Result<(), BrokerError> {
        self.push(
            queue,
            StoredMessage {
                body,
                routing_key: queue.to_string(),
            },
            false,
        )
    }

    async fn publish_event(&self, routing_key: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let bindings = {
            let state = self.state.lock().unwrap();
            state.event_bindings.clone()
        };
        for queue in bindings {
            self.push(
                &queue,
                StoredMessage {
                    body: body.clone(),
                    routing_key: routing_key.to_string(),
                },
                false,
            )?;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        _prefetch: u16,
    ) -> Result<Box<dyn DeliveryStreamPort>, BrokerError> {
        {
            let state = self.state.lock().unwrap();
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::UnknownQueue(queue.to_string()));
            }
        }
        Ok(Box::new(InMemoryStream {
            state: self.state.clone(),
            queue: queue.to_string(),
        }))
    }

    async fn subscribe_events(&self) -> Result<Box<dyn DeliveryStreamPort>, BrokerError> {
        let queue = {
            let mut state = self.state.lock().unwrap();
            state.event_queue_counter += 1;
            let queue = format!("cache_events_{}", state.event_queue_counter);
            state.queues.insert(queue.clone(), VecDeque::new());
            state.event_bindings.push(queue.clone());
            queue
        };
        Ok(Box::new(InMemoryStream {
            state: self.state.clone(),
            queue,
        }))
    }
}

struct InMemoryStream {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
}

#[async_trait]
impl DeliveryStreamPort for InMemoryStream {
    async fn next(&mut self) -> Option<Box<dyn DeliveryPort>> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                let closed = state.closed;
                let q = state.queues.get_mut(&self.queue)?;
                if let Some(message) = q.pop_front() {
                    return Some(Box::new(InMemoryDelivery {
                        state: self.state.clone(),
                        queue: self.queue.clone(),
                        message,
                    }) as Box<dyn DeliveryPort>);
                }
                if closed {
                    return None;
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

struct InMemoryDelivery {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    message: StoredMessage,
}

#[async_trait]
impl DeliveryPort for InMemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.body
    }

    fn routing_key(&self) -> &str {
        &self.message.routing_key
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        if requeue {
            state
                .queues
                .entry(self.queue.clone())
                .or_default()
                .push_front(self.message);
        } else {
            state
                .queues
                .entry(topology::dlq_name(&self.queue))
                .or_default()
                .push_back(self.message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_consume_then_ack() {
        let broker = InMemoryBroker::new();
        broker.declare("story_generation_tasks");
        broker
            .publish("story_generation_tasks", b"{}".to_vec(), "t-1")
            .await
            .unwrap();

        let mut stream = broker.subscribe("story_generation_tasks", 1).await.unwrap();
        let delivery = stream.next().await.unwrap();
        assert_eq!(delivery.payload(), b"{}");
        delivery.ack().await.unwrap();
        assert_eq!(broker.depth("story_generation_tasks"), 0);
    }

    #[tokio::test]
    async fn nack_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        broker.declare("story_generation_tasks");
        broker
            .publish("story_generation_tasks", b"retry-me".to_vec(), "t-1")
            .await
            .unwrap();

        let mut stream = broker.subscribe("story_generation_tasks", 1).await.unwrap();
        let delivery = stream.next().await.unwrap();
        delivery.nack(true).await.unwrap();

        let redelivered = stream.next().await.unwrap();
        assert_eq!(redelivered.payload(), b"retry-me");
        redelivered.ack().await.unwrap();
    }

    #[tokio::test]
    async fn nack_no_requeue_dead_letters_exactly_once() {
        let broker = InMemoryBroker::new();
        broker.declare("story_generation_tasks");
        broker
            .publish("story_generation_tasks", b"not json".to_vec(), "t-1")
            .await
            .unwrap();

        let mut stream = broker.subscribe("story_generation_tasks", 1).await.unwrap();
        let delivery = stream.next().await.unwrap();
        delivery.nack(false).await.unwrap();

        // On the DLQ exactly once, gone from the live queue
        assert_eq!(broker.depth("story_generation_tasks"), 0);
        assert_eq!(broker.depth("story_generation_tasks_dlq"), 1);
        assert_eq!(
            broker.take_published("story_generation_tasks_dlq").unwrap(),
            b"not json"
        );
        assert_eq!(broker.depth("story_generation_tasks_dlq"), 0);
    }

    #[tokio::test]
    async fn publish_to_unknown_queue_errors() {
        let broker = InMemoryBroker::new();
        let err = broker.publish("nope", vec![], "t-1").await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownQueue(_)));
    }

    #[tokio::test]
    async fn events_fan_out_to_every_bound_process() {
        let broker = InMemoryBroker::new();
        let mut first = broker.subscribe_events().await.unwrap();
        let mut second = broker.subscribe_events().await.unwrap();

        broker
            .publish_event("config.updated", b"{\"key\":\"k\",\"value\":\"v\"}".to_vec())
            .await
            .unwrap();

        let a = first.next().await.unwrap();
        let b = second.next().await.unwrap();
        assert_eq!(a.routing_key(), "config.updated");
        assert_eq!(a.payload(), b.payload());
    }

    #[tokio::test]
    async fn close_drains_and_ends_streams() {
        let broker = InMemoryBroker::new();
        broker.declare("push_notifications");
        broker
            .publish("push_notifications", b"last".to_vec(), "t-1")
            .await
            .unwrap();
        broker.close();

        let mut stream = broker.subscribe("push_notifications", 1).await.unwrap();
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
    }
}
