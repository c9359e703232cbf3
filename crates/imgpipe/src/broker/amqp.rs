//! RabbitMQ backend over AMQP 0-9-1.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tracing::debug;

use super::{Acknowledger, Broker, Delivery, Session, Subscription};
use crate::error::BrokerError;

const PERSISTENT: u8 = 2;

pub struct AmqpBroker {
    url: String,
}

impl AmqpBroker {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<Box<dyn Session>, BrokerError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        debug!(broker = %self.describe(), "Connected to AMQP broker");
        Ok(Box::new(AmqpSession {
            connection,
            channel,
        }))
    }

    fn describe(&self) -> String {
        redact(&self.url)
    }
}

/// Drops the userinfo part of an AMQP URL.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

fn is_not_found(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp) => {
            matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
        }
        _ => false,
    }
}

fn durable() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

struct AmqpSession {
    connection: Connection,
    /// Confirm-mode channel shared by declarations and publishes.
    channel: Channel,
}

#[async_trait]
impl Session for AmqpSession {
    async fn declare_durable(&self, queue: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(queue, durable(), FieldTable::default())
            .await?;
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<u32, BrokerError> {
        // A failed passive declare closes its channel, so use a throwaway.
        let channel = self.connection.create_channel().await?;
        let options = QueueDeclareOptions {
            passive: true,
            ..durable()
        };

        match channel
            .queue_declare(queue, options, FieldTable::default())
            .await
        {
            Ok(declared) => {
                let _ = channel.close(200, "inspected").await;
                Ok(declared.message_count())
            }
            Err(e) if is_not_found(&e) => Err(BrokerError::QueueNotFound(queue.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn publish_persistent(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(BrokerError::PublishNotConfirmed(queue.to_string()));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        // Prefetch is per channel, so every consumer gets its own.
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let consumer = channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    BrokerError::QueueNotFound(queue.to_string())
                } else {
                    e.into()
                }
            })?;

        Ok(Box::new(AmqpSubscription {
            _channel: channel,
            consumer,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.connection.close(200, "closing").await?;
        Ok(())
    }
}

struct AmqpSubscription {
    _channel: Channel,
    consumer: Consumer,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        match self.consumer.next().await? {
            Ok(delivery) => {
                let acker: Arc<dyn Acknowledger> = Arc::new(AmqpAcker(delivery.acker));
                Some(Ok(Delivery::new(
                    delivery.delivery_tag,
                    delivery.data,
                    delivery.redelivered,
                    acker,
                )))
            }
            Err(e) => Some(Err(e.into())),
        }
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self, _tag: u64) -> Result<(), BrokerError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, _tag: u64) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue: false,
            })
            .await?;
        Ok(())
    }
}
