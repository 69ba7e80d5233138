//! RabbitMQ broker adapter (lapin)
//!
//! One connection per process, one publisher channel behind a mutex, one
//! consumer channel per subscription. Startup dials with bounded retry;
//! consumer streams rebuild their channel (and the connection if needed)
//! when the broker closes it. Publishes do not retry internally: a failed
//! publish is a handler failure and surfaces as a nack-requeue upstream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::Mutex;

use crate::application::ports::outbound::{
    BrokerError, BrokerPort, DeliveryPort, DeliveryStreamPort,
};
use crate::infrastructure::broker::topology;

const DIAL_ATTEMPTS: u32 = 50;
const DIAL_BACKOFF: Duration = Duration::from_secs(3);

struct ConnState {
    connection: Connection,
    publisher: Channel,
}

/// Shared between the broker facade and its consumer streams so a stream can
/// redial after a channel close.
struct RabbitInner {
    uri: String,
    state: Mutex<Option<ConnState>>,
}

impl RabbitInner {
    async fn dial(&self) -> Result<ConnState, BrokerError> {
        let mut last_error = String::new();
        for attempt in 1..=DIAL_ATTEMPTS {
            match Connection::connect(&self.uri, ConnectionProperties::default()).await {
                Ok(connection) => {
                    connection.on_error(|e| {
                        tracing::error!("broker connection error: {e}");
                    });
                    let publisher = connection
                        .create_channel()
                        .await
                        .map_err(|e| BrokerError::Channel(e.to_string()))?;
                    declare_exchanges(&publisher).await?;
                    tracing::info!(attempt, "connected to broker");
                    return Ok(ConnState {
                        connection,
                        publisher,
                    });
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(attempt, "broker dial failed: {e}");
                    tokio::time::sleep(DIAL_BACKOFF).await;
                }
            }
        }
        Err(BrokerError::Connection(format!(
            "gave up after {DIAL_ATTEMPTS} attempts: {last_error}"
        )))
    }

    /// A fresh channel on a live connection, redialing first if needed.
    async fn consumer_channel(&self) -> Result<Channel, BrokerError> {
        let mut state = self.state.lock().await;
        let alive = state
            .as_ref()
            .map(|s| s.connection.status().connected())
            .unwrap_or(false);
        if !alive {
            tracing::warn!("broker connection lost, redialing");
            *state = Some(self.dial().await?);
        }
        let Some(conn_state) = state.as_ref() else {
            return Err(BrokerError::Connection("not connected".to_string()));
        };
        conn_state
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }

    async fn make_consumer(&self, queue: &str, prefetch: u16) -> Result<Consumer, BrokerError> {
        let channel = self.consumer_channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }

    async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BrokerError> {
        let state = self.state.lock().await;
        let publisher = &state
            .as_ref()
            .ok_or_else(|| BrokerError::Connection("not connected".to_string()))?
            .publisher;
        publisher
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }
}

async fn declare_exchanges(channel: &Channel) -> Result<(), BrokerError> {
    channel
        .exchange_declare(
            topology::TASKS_DLX,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Channel(e.to_string()))?;
    channel
        .exchange_declare(
            topology::CONFIG_UPDATES_EXCHANGE,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Channel(e.to_string()))?;
    Ok(())
}

pub struct RabbitBroker {
    inner: Arc<RabbitInner>,
}

impl RabbitBroker {
    /// Dial the broker with bounded retry and declare the shared exchanges.
    pub async fn connect(uri: &str) -> Result<Self, BrokerError> {
        let inner = Arc::new(RabbitInner {
            uri: uri.to_string(),
            state: Mutex::new(None),
        });
        let conn_state = inner.dial().await?;
        *inner.state.lock().await = Some(conn_state);
        Ok(Self { inner })
    }
}

#[async_trait]
impl BrokerPort for RabbitBroker {
    async fn declare_task_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let channel = self.inner.consumer_channel().await?;

        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(topology::TASKS_DLX.into()),
        );
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;

        let dlq = topology::dlq_name(queue);
        channel
            .queue_declare(
                &dlq,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        channel
            .queue_bind(
                &dlq,
                topology::TASKS_DLX,
                queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        correlation_id: &str,
    ) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type(ShortString::from("application/json"))
            .with_correlation_id(ShortString::from(correlation_id))
            .with_timestamp(Utc::now().timestamp() as u64);
        self.inner.publish_raw("", queue, &body, properties).await
    }

    async fn publish_event(&self, routing_key: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_timestamp(Utc::now().timestamp() as u64);
        self.inner
            .publish_raw(topology::CONFIG_UPDATES_EXCHANGE, routing_key, &body, properties)
            .await
    }

    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliveryStreamPort>, BrokerError> {
        let consumer = self.inner.make_consumer(queue, prefetch).await?;
        Ok(Box::new(RabbitStream {
            inner: self.inner.clone(),
            queue: queue.to_string(),
            prefetch,
            consumer: Some(consumer),
        }))
    }

    async fn subscribe_events(&self) -> Result<Box<dyn DeliveryStreamPort>, BrokerError> {
        let channel = self.inner.consumer_channel().await?;
        let declared = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        let queue = declared.name().to_string();
        for pattern in ["config.*", "prompt.*"] {
            channel
                .queue_bind(
                    &queue,
                    topology::CONFIG_UPDATES_EXCHANGE,
                    pattern,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Channel(e.to_string()))?;
        }
        let consumer = channel
            .basic_consume(
                &queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        Ok(Box::new(RabbitStream {
            inner: self.inner.clone(),
            queue,
            prefetch: 1,
            consumer: Some(consumer),
        }))
    }
}

struct RabbitStream {
    inner: Arc<RabbitInner>,
    queue: String,
    prefetch: u16,
    consumer: Option<Consumer>,
}

#[async_trait]
impl DeliveryStreamPort for RabbitStream {
    async fn next(&mut self) -> Option<Box<dyn DeliveryPort>> {
        loop {
            if self.consumer.is_none() {
                match self.inner.make_consumer(&self.queue, self.prefetch.max(1)).await {
                    Ok(consumer) => self.consumer = Some(consumer),
                    Err(e) => {
                        tracing::error!(queue = self.queue, "failed to rebuild consumer: {e}");
                        tokio::time::sleep(DIAL_BACKOFF).await;
                        continue;
                    }
                }
            }

            let Some(consumer) = self.consumer.as_mut() else {
                continue;
            };
            match consumer.next().await {
                Some(Ok(delivery)) => {
                    return Some(Box::new(RabbitDelivery {
                        routing_key: delivery.routing_key.to_string(),
                        delivery,
                    }));
                }
                Some(Err(e)) => {
                    tracing::warn!(queue = self.queue, "consumer error, rebuilding channel: {e}");
                    self.consumer = None;
                }
                None => {
                    tracing::warn!(queue = self.queue, "consumer channel closed, rebuilding");
                    self.consumer = None;
                    tokio::time::sleep(DIAL_BACKOFF).await;
                }
            }
        }
    }
}

struct RabbitDelivery {
    delivery: lapin::message::Delivery,
    routing_key: String,
}

#[async_trait]
impl DeliveryPort for RabbitDelivery {
    fn payload(&self) -> &[u8] {
        &self.delivery.data
    }

    fn routing_key(&self) -> &str {
        &self.routing_key
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.delivery
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        self.delivery
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }
}
