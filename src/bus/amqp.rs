//! AMQP task bus (v0.1)
//!
//! Production [`TaskBus`] over a RabbitMQ-compatible broker using lapin.
//! Publisher confirms are enabled on the channel; every publish awaits its
//! confirmation under a timeout so a wedged broker surfaces as a
//! [`TransportError::ConfirmTimeout`] instead of silent loss.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    queue_for, ResultDelivery, TaskBus, TransportError, AGENT_QUEUE_MAX_PRIORITY, QUEUE_AGENT_TASKS,
    QUEUE_DEAD_LETTER, QUEUE_PROCESS_TASKS, QUEUE_RESULTS, QUEUE_SIMULATION_TASKS, TASKS_DLX,
    TASKS_EXCHANGE,
};
use crate::message::TaskMessage;

/// Initial reconnect backoff; doubles up to the configured ceiling.
const RECONNECT_BASE: Duration = Duration::from_millis(500);

/// AMQP-backed task bus. One connection, one channel, one results consumer.
pub struct AmqpTaskBus {
    _connection: Connection,
    channel: Channel,
    consumer: Mutex<Option<Consumer>>,
    prefetch: u16,
    confirm_timeout: Duration,
}

impl AmqpTaskBus {
    /// Connect and prepare the channel (publisher confirms + prefetch).
    pub async fn connect(
        url: &str,
        prefetch: u16,
        confirm_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        info!(prefetch, "connected to broker");
        Ok(Self {
            _connection: connection,
            channel,
            consumer: Mutex::new(None),
            prefetch,
            confirm_timeout,
        })
    }

    /// Connect with exponential backoff bounded by `ceiling`. Aborts once
    /// the next backoff would exceed the ceiling.
    pub async fn connect_with_backoff(
        url: &str,
        prefetch: u16,
        confirm_timeout: Duration,
        ceiling: Duration,
    ) -> Result<Self, TransportError> {
        let mut backoff = RECONNECT_BASE;
        loop {
            match Self::connect(url, prefetch, confirm_timeout).await {
                Ok(bus) => return Ok(bus),
                Err(e) if backoff > ceiling => return Err(e),
                Err(e) => {
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "broker connect failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    async fn declare_queue(&self, name: &str, args: FieldTable) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                args,
            )
            .await
            .map_err(|e| TransportError::Topology(e.to_string()))?;
        Ok(())
    }

    fn task_queue_args(priority: Option<u8>) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(TASKS_DLX.into()),
        );
        if let Some(max) = priority {
            args.insert("x-max-priority".into(), AMQPValue::LongInt(i32::from(max)));
        }
        args
    }
}

#[async_trait]
impl TaskBus for AmqpTaskBus {
    async fn declare_topology(&self) -> Result<(), TransportError> {
        let durable = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(TASKS_EXCHANGE, ExchangeKind::Direct, durable, FieldTable::default())
            .await
            .map_err(|e| TransportError::Topology(e.to_string()))?;
        self.channel
            .exchange_declare(TASKS_DLX, ExchangeKind::Fanout, durable, FieldTable::default())
            .await
            .map_err(|e| TransportError::Topology(e.to_string()))?;

        self.declare_queue(
            QUEUE_AGENT_TASKS,
            Self::task_queue_args(Some(AGENT_QUEUE_MAX_PRIORITY)),
        )
        .await?;
        self.declare_queue(QUEUE_PROCESS_TASKS, Self::task_queue_args(None)).await?;
        self.declare_queue(QUEUE_SIMULATION_TASKS, Self::task_queue_args(None)).await?;
        // results also dead-letters so unappliable results land in the DLQ
        self.declare_queue(QUEUE_RESULTS, Self::task_queue_args(None)).await?;
        self.declare_queue(QUEUE_DEAD_LETTER, FieldTable::default()).await?;

        for entity in [
            crate::message::EntityType::Reasoning,
            crate::message::EntityType::LightDeterministic,
            crate::message::EntityType::HeavyDeterministic,
        ] {
            self.channel
                .queue_bind(
                    queue_for(entity),
                    TASKS_EXCHANGE,
                    entity.as_str(),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| TransportError::Topology(e.to_string()))?;
        }
        self.channel
            .queue_bind(
                QUEUE_DEAD_LETTER,
                TASKS_DLX,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Topology(e.to_string()))?;

        // single consumer on results; created here so the queue exists first
        let consumer = self
            .channel
            .basic_consume(
                QUEUE_RESULTS,
                "rtlforge-orchestrator",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Consume(e.to_string()))?;
        *self.consumer.lock().await = Some(consumer);

        info!(prefetch = self.prefetch, "broker topology declared");
        Ok(())
    }

    async fn publish(&self, message: &TaskMessage) -> Result<(), TransportError> {
        let payload =
            serde_json::to_vec(message).map_err(|e| TransportError::Publish(e.to_string()))?;
        let properties = BasicProperties::default()
            .with_delivery_mode(2) // persistent
            .with_priority(message.priority.as_u8())
            .with_content_type("application/json".into())
            .with_message_id(message.task_id.to_string().into())
            .with_correlation_id(message.correlation_id.to_string().into());

        let routing_key = message.entity_type.as_str();
        let confirm = self
            .channel
            .basic_publish(
                TASKS_EXCHANGE,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        let confirmation = tokio::time::timeout(self.confirm_timeout, confirm)
            .await
            .map_err(|_| TransportError::ConfirmTimeout)?
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        match confirmation {
            Confirmation::Nack(_) => Err(TransportError::Publish(
                "broker negatively acknowledged publish".to_string(),
            )),
            Confirmation::Ack(_) | Confirmation::NotRequested => {
                debug!(task_id = %message.task_id, routing_key, "published task");
                Ok(())
            }
        }
    }

    async fn recv_result(&self, wait: Duration) -> Result<Option<ResultDelivery>, TransportError> {
        let mut guard = self.consumer.lock().await;
        let consumer = guard.as_mut().ok_or(TransportError::Closed)?;

        // drain mode (zero wait) still gives the socket a bounded moment
        let wait = wait.max(Duration::from_millis(1));
        let next = match tokio::time::timeout(wait, consumer.next()).await {
            Ok(item) => item,
            Err(_) => return Ok(None),
        };

        match next {
            Some(Ok(delivery)) => Ok(Some(ResultDelivery {
                tag: delivery.delivery_tag,
                payload: delivery.data,
            })),
            Some(Err(e)) => Err(TransportError::Consume(e.to_string())),
            None => Err(TransportError::Closed),
        }
    }

    async fn ack(&self, tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::Acknowledge(e.to_string()))
    }

    async fn reject(&self, tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    requeue: false,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(|e| TransportError::Acknowledge(e.to_string()))
    }
}
