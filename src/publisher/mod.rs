//! Fan-out publisher.
//!
//! Each order becomes three projections, serialized and routed
//! independently: a failure on one never stops the other two from being
//! attempted. Nothing is retried; a failed projection is lost for that
//! order and reported to the caller.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{BrokerChannel, BusError, MessageProperties};
use crate::model::{MessageKind, Order, JSON_CONTENT_TYPE};
use crate::topology::Topology;

/// Failure publishing one projection.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Failed to serialize {kind}: {source}")]
    Serialize {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to publish {kind}: {source}")]
    Transport {
        kind: MessageKind,
        #[source]
        source: BusError,
    },
}

impl PublishError {
    pub fn kind(&self) -> MessageKind {
        match self {
            PublishError::Serialize { kind, .. } | PublishError::Transport { kind, .. } => *kind,
        }
    }
}

/// Outcome of fanning out one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutReport {
    pub order_id: Uuid,
    /// Projections that did not reach the transport.
    pub failed: Vec<MessageKind>,
}

impl FanOutReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Publishes order projections to the topology's exchange.
pub struct OrderPublisher {
    channel: Arc<dyn BrokerChannel>,
    exchange: String,
    properties: MessageProperties,
}

impl OrderPublisher {
    pub fn new(channel: Arc<dyn BrokerChannel>, topology: &Topology) -> Self {
        Self {
            channel,
            exchange: topology.exchange.clone(),
            properties: MessageProperties {
                content_type: JSON_CONTENT_TYPE,
                persistent: topology.durable,
            },
        }
    }

    pub async fn publish_log(&self, order: &Order) -> Result<(), PublishError> {
        self.publish(MessageKind::Log, &order.log_entry()).await
    }

    pub async fn publish_buyer_notice(&self, order: &Order) -> Result<(), PublishError> {
        self.publish(MessageKind::BuyerNotice, &order.buyer_notice())
            .await
    }

    pub async fn publish_seller_notice(&self, order: &Order) -> Result<(), PublishError> {
        self.publish(MessageKind::SellerNotice, &order.seller_notice())
            .await
    }

    /// Serialize `projection` and route it with `kind`'s routing key.
    pub async fn publish<T>(&self, kind: MessageKind, projection: &T) -> Result<(), PublishError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = serde_json::to_vec(projection)
            .map_err(|source| PublishError::Serialize { kind, source })?;

        self.channel
            .publish(&self.exchange, kind.routing_key(), &payload, self.properties)
            .await
            .map_err(|source| PublishError::Transport { kind, source })?;

        debug!(kind = %kind, bytes = payload.len(), "Projection published");
        Ok(())
    }

    /// Attempt all three projections for `order`, logging each failure.
    pub async fn fan_out(&self, order: &Order) -> FanOutReport {
        let results = [
            self.publish_log(order).await,
            self.publish_buyer_notice(order).await,
            self.publish_seller_notice(order).await,
        ];

        let mut failed = Vec::new();
        for err in results.into_iter().filter_map(Result::err) {
            warn!(order_id = %order.id, kind = %err.kind(), error = %err, "Failed to publish projection");
            failed.push(err.kind());
        }

        FanOutReport {
            order_id: order.id,
            failed,
        }
    }
}
