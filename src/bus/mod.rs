//! Message broker transport.
//!
//! This module contains:
//! - `BrokerChannel` trait: one broker session, owned by one task
//! - `Delivery`: a received message plus its acknowledgment handle
//! - Implementations: AMQP (RabbitMQ), in-memory

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::topology::{ExchangeKind, QueueOptions};

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpChannel, AmqpConnection};
pub use memory::{MemoryBroker, MemoryChannel, MemoryConnection};

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Topology declaration failed: {0}")]
    Topology(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledge failed: {0}")]
    Acknowledge(String),

    #[error("Handler failed: {0}")]
    Handler(String),
}

/// Properties attached to a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: &'static str,
    /// Ask the broker to write the message to disk (delivery mode 2).
    pub persistent: bool,
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Reject the delivery. With `requeue == false` the broker discards it.
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// One message received from a queue.
pub struct Delivery {
    pub queue: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        data: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            queue: queue.into(),
            routing_key: routing_key.into(),
            data,
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .field("bytes", &self.data.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries from one queue subscription.
///
/// Ends when the subscription is cancelled by the broker or the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A broker session.
///
/// Implementations:
/// - `AmqpChannel`: a lapin channel drawn from a pooled RabbitMQ connection
/// - `MemoryChannel`: in-process broker for tests and local runs
///
/// Declarations are idempotent: re-declaring with identical parameters
/// succeeds, conflicting parameters fail with [`BusError::Topology`].
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()>;

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()>;

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()>;

    /// Route `payload` through `exchange`. Success means the transport
    /// accepted the message; it says nothing about delivery.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<()>;

    /// Start a manual-acknowledgment subscription on `queue`.
    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;
}
