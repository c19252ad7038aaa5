//! Exchange, queue and binding declarations.
//!
//! The topology is owned by the broker; this module only makes sure it
//! exists before anything is published or consumed. Every step is
//! idempotent, so the producer and each consumer worker apply the same
//! topology independently and in any order.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::bus::{BrokerChannel, Result};
use crate::config::TopologyConfig;
use crate::model::MessageKind;

/// Exchange routing strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Exact routing-key match.
    #[default]
    Direct,
    /// Pattern match on dot-separated routing keys.
    Topic,
    /// Every bound queue receives every message.
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue declaration toggles. All default to `false`; override only what
/// you need:
///
/// ```
/// use orderflow::topology::QueueOptions;
///
/// let options = QueueOptions { durable: true, ..Default::default() };
/// assert!(!options.exclusive);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Queue survives a broker restart.
    pub durable: bool,
    /// Queue is removed when its last consumer disconnects.
    pub auto_delete: bool,
    /// Queue is usable only by the declaring connection.
    pub exclusive: bool,
    /// Skip the server's declare-ok confirmation.
    pub no_wait: bool,
}

/// One queue and the routing key that feeds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub kind: MessageKind,
    pub queue: String,
    pub options: QueueOptions,
}

impl QueueBinding {
    pub fn routing_key(&self) -> &'static str {
        self.kind.routing_key()
    }
}

/// Complete routing layout: one exchange, one queue per projection kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub durable: bool,
    pub bindings: Vec<QueueBinding>,
}

impl Topology {
    /// The order-events layout described by `config`.
    pub fn orders(config: &TopologyConfig) -> Self {
        let options = QueueOptions {
            durable: config.durable,
            ..Default::default()
        };

        let queue_for = |kind: MessageKind| match kind {
            MessageKind::Log => config.log_queue.clone(),
            MessageKind::BuyerNotice => config.buyer_queue.clone(),
            MessageKind::SellerNotice => config.seller_queue.clone(),
        };

        Self {
            exchange: config.exchange.clone(),
            exchange_kind: ExchangeKind::Direct,
            durable: config.durable,
            bindings: MessageKind::ALL
                .into_iter()
                .map(|kind| QueueBinding {
                    kind,
                    queue: queue_for(kind),
                    options,
                })
                .collect(),
        }
    }

    /// Queue name bound to `kind`.
    pub fn queue(&self, kind: MessageKind) -> Option<&str> {
        self.bindings
            .iter()
            .find(|b| b.kind == kind)
            .map(|b| b.queue.as_str())
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::orders(&TopologyConfig::default())
    }
}

/// Declares exchanges, queues and bindings on one broker channel.
pub struct TopologyConfigurator {
    channel: Arc<dyn BrokerChannel>,
}

impl TopologyConfigurator {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self { channel }
    }

    /// Declare an exchange. Fails if one with the same name but different
    /// parameters already exists.
    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<()> {
        self.channel.declare_exchange(name, kind, durable).await?;
        debug!(exchange = %name, kind = %kind, durable, "Exchange declared");
        Ok(())
    }

    /// Declare a queue. Succeeds if it already exists with the same options.
    pub async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.channel.declare_queue(name, options).await?;
        debug!(queue = %name, ?options, "Queue declared");
        Ok(())
    }

    pub async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        self.channel.bind_queue(queue, routing_key, exchange).await?;
        debug!(
            queue = %queue,
            routing_key = %routing_key,
            exchange = %exchange,
            "Queue bound"
        );
        Ok(())
    }

    /// Declare the exchange, then every queue, then every binding.
    pub async fn apply(&self, topology: &Topology) -> Result<()> {
        self.declare_exchange(&topology.exchange, topology.exchange_kind, topology.durable)
            .await?;

        for binding in &topology.bindings {
            self.declare_queue(&binding.queue, binding.options).await?;
        }

        for binding in &topology.bindings {
            self.bind_queue(&binding.queue, binding.routing_key(), &topology.exchange)
                .await?;
        }

        info!(
            exchange = %topology.exchange,
            queues = topology.bindings.len(),
            "Topology ready"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, MemoryBroker};

    #[test]
    fn test_queue_options_default_all_false() {
        let options = QueueOptions::default();
        assert!(!options.durable);
        assert!(!options.auto_delete);
        assert!(!options.exclusive);
        assert!(!options.no_wait);
    }

    #[test]
    fn test_orders_topology_layout() {
        let topology = Topology::default();

        assert_eq!(topology.exchange, "order_event_exchange");
        assert_eq!(topology.exchange_kind, ExchangeKind::Direct);
        assert_eq!(topology.queue(MessageKind::Log), Some("order log"));
        assert_eq!(topology.queue(MessageKind::BuyerNotice), Some("user notify"));
        assert_eq!(topology.queue(MessageKind::SellerNotice), Some("seller notify"));
        assert!(topology.bindings.iter().all(|b| b.options.durable));
    }

    #[tokio::test]
    async fn test_apply_twice_is_idempotent() {
        let broker = MemoryBroker::new();
        let configurator = TopologyConfigurator::new(Arc::new(broker.connect().open_channel()));
        let topology = Topology::default();

        configurator.apply(&topology).await.unwrap();
        configurator.apply(&topology).await.unwrap();

        assert_eq!(broker.queue_count(), 3);
        assert_eq!(broker.binding_count(), 3);
    }

    #[tokio::test]
    async fn test_declare_same_queue_twice_yields_one_queue() {
        let broker = MemoryBroker::new();
        let configurator = TopologyConfigurator::new(Arc::new(broker.connect().open_channel()));
        let options = QueueOptions {
            durable: true,
            ..Default::default()
        };

        configurator.declare_queue("order log", options).await.unwrap();
        configurator.declare_queue("order log", options).await.unwrap();

        assert_eq!(broker.queue_count(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_exchange_fails_loudly() {
        let broker = MemoryBroker::new();
        let configurator = TopologyConfigurator::new(Arc::new(broker.connect().open_channel()));

        configurator
            .declare_exchange("orders", ExchangeKind::Direct, true)
            .await
            .unwrap();
        let result = configurator
            .declare_exchange("orders", ExchangeKind::Fanout, true)
            .await;

        assert!(matches!(result, Err(BusError::Topology(_))));
    }

    #[tokio::test]
    async fn test_bind_before_exchange_fails() {
        let broker = MemoryBroker::new();
        let configurator = TopologyConfigurator::new(Arc::new(broker.connect().open_channel()));

        configurator
            .declare_queue("order log", QueueOptions::default())
            .await
            .unwrap();
        let result = configurator
            .bind_queue("order log", "log.orders", "missing")
            .await;

        assert!(matches!(result, Err(BusError::Topology(_))));
    }

    #[tokio::test]
    async fn test_producer_and_consumer_apply_concurrently() {
        let broker = MemoryBroker::new();
        let topology = Topology::default();

        let a = TopologyConfigurator::new(Arc::new(broker.connect().open_channel()));
        let b = TopologyConfigurator::new(Arc::new(broker.connect().open_channel()));
        let (ra, rb) = tokio::join!(a.apply(&topology), b.apply(&topology));

        ra.unwrap();
        rb.unwrap();
        assert_eq!(broker.queue_count(), 3);
        assert_eq!(broker.binding_count(), 3);
    }
}
