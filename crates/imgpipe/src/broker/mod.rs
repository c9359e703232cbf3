//! The narrow queue protocol every producer and stage talks to.
//!
//! Durable named FIFO queues with persistent publish, prefetch-bounded
//! consumption with explicit acknowledgement, and passive depth inspection.
//! Messages held unacknowledged by a session that goes away are returned to
//! the front of their queue and flagged as redelivered.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::BrokerError;

pub use memory::MemoryBroker;

#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Session>, BrokerError>;

    /// Human readable target for logs, without credentials.
    fn describe(&self) -> String;
}

#[async_trait]
pub trait Session: Send + Sync {
    /// Idempotent.
    async fn declare_durable(&self, queue: &str) -> Result<(), BrokerError>;

    /// Ready messages in `queue`, without creating it.
    async fn queue_depth(&self, queue: &str) -> Result<u32, BrokerError>;

    /// Returns once the broker has taken responsibility for the message.
    async fn publish_persistent(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError>;

    /// `prefetch` bounds the unacknowledged deliveries held at once.
    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Subscription>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// `None` once the underlying session is gone.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>>;
}

#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, tag: u64) -> Result<(), BrokerError>;

    /// Negative acknowledgement without requeue.
    async fn reject(&self, tag: u64) -> Result<(), BrokerError>;
}

pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
    pub redelivered: bool,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(tag: u64, body: Vec<u8>, redelivered: bool, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            tag,
            body,
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack(self.tag).await
    }

    pub async fn reject(&self) -> Result<(), BrokerError> {
        self.acker.reject(self.tag).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Fixed-delay reconnection. Unlimited unless `max_attempts` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn exhausted(&self, failed_attempts: u32) -> bool {
        self.max_attempts
            .map(|max| failed_attempts >= max)
            .unwrap_or(false)
    }
}

/// Picks a backend from the URL scheme.
pub fn connect_from_url(url: &str) -> Result<Arc<dyn Broker>, BrokerError> {
    let scheme = url.split("://").next().unwrap_or_default();
    match scheme {
        "memory" => Ok(Arc::new(MemoryBroker::new())),
        #[cfg(feature = "amqp")]
        "amqp" | "amqps" => Ok(Arc::new(amqp::AmqpBroker::new(url))),
        _ => Err(BrokerError::UnsupportedUrl(url.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub queue: String,
    /// `None` when the queue has not been declared yet.
    pub messages: Option<u32>,
}

/// Passively inspects each queue over a short-lived session.
pub async fn queue_depths(
    broker: &dyn Broker,
    queues: &[String],
) -> Result<Vec<QueueDepth>, BrokerError> {
    let session = broker.connect().await?;
    let mut depths = Vec::with_capacity(queues.len());

    for queue in queues {
        let messages = match session.queue_depth(queue).await {
            Ok(count) => Some(count),
            Err(BrokerError::QueueNotFound(_)) => None,
            Err(e) => {
                let _ = session.close().await;
                return Err(e);
            }
        };
        depths.push(QueueDepth {
            queue: queue.clone(),
            messages,
        });
    }

    session.close().await?;
    Ok(depths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_policy_unlimited_by_default() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay, Duration::from_secs(5));
        assert!(!policy.exhausted(u32::MAX));
    }

    #[test]
    fn test_reconnect_policy_cap() {
        let policy = ReconnectPolicy::fixed(Duration::from_millis(10)).with_max_attempts(2);
        assert!(!policy.exhausted(1));
        assert!(policy.exhausted(2));
    }

    #[test]
    fn test_connect_from_url_rejects_unknown_scheme() {
        assert!(matches!(
            connect_from_url("kafka://localhost"),
            Err(BrokerError::UnsupportedUrl(_))
        ));
    }

    #[test]
    fn test_connect_from_url_memory() {
        let broker = connect_from_url("memory://").unwrap();
        assert_eq!(broker.describe(), "memory://");
    }

    #[tokio::test]
    async fn test_queue_depths_reports_undeclared() {
        let broker = MemoryBroker::new();
        let session = broker.connect().await.unwrap();
        session.declare_durable("a").await.unwrap();
        session.publish_persistent("a", b"1".to_vec()).await.unwrap();

        let depths = queue_depths(&broker, &["a".to_string(), "b".to_string()])
            .await
            .unwrap();

        assert_eq!(
            depths,
            vec![
                QueueDepth {
                    queue: "a".to_string(),
                    messages: Some(1)
                },
                QueueDepth {
                    queue: "b".to_string(),
                    messages: None
                },
            ]
        );
    }
}
