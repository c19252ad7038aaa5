//! Consumer workers.
//!
//! Each worker subscribes to all three queues on its own channel and
//! multiplexes them in one loop. Workers on the same queues compete; the
//! broker hands each message to exactly one of them.
//!
//! A delivery is acknowledged only after its handler succeeded. Payloads
//! that fail to decode, and notifications the handler refuses, are rejected
//! without requeue so a poison message cannot loop forever.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{BrokerChannel, BusError, Delivery, DeliveryStream, Result};
use crate::model::{MessageKind, Notification};
use crate::shutdown::{shutdown_channel, ShutdownListener, ShutdownTrigger};
use crate::topology::{Topology, TopologyConfigurator};

/// Processes decoded notifications.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Handle one notification on behalf of `worker`.
    ///
    /// An error rejects the delivery.
    async fn handle(&self, worker: usize, notification: Notification) -> Result<()>;
}

/// Renders each notification as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct RenderHandler;

#[async_trait]
impl NotificationHandler for RenderHandler {
    async fn handle(&self, worker: usize, notification: Notification) -> Result<()> {
        match notification {
            Notification::Log(entry) => info!(
                consumer_id = worker,
                order_id = %entry.order_id,
                buyer = %entry.buyer,
                price = entry.price,
                created_at = %entry.created_at.to_rfc3339(),
                "Order logged"
            ),
            Notification::Buyer(notice) => info!(
                consumer_id = worker,
                order_id = %notice.order_id,
                item = %notice.item,
                "Buyer notified"
            ),
            Notification::Seller(notice) => info!(
                consumer_id = worker,
                order_id = %notice.order_id,
                buyer = %notice.buyer,
                address = %notice.address,
                "Seller notified"
            ),
        }
        Ok(())
    }
}

/// Per-worker delivery counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub handled: u64,
    pub malformed: u64,
    pub failed: u64,
}

impl std::ops::AddAssign for WorkerStats {
    fn add_assign(&mut self, other: Self) {
        self.handled += other.handled;
        self.malformed += other.malformed;
        self.failed += other.failed;
    }
}

/// One worker with a subscription on each queue.
pub struct OrderConsumer {
    id: usize,
    // Subscriptions live as long as the channel.
    _channel: Arc<dyn BrokerChannel>,
    logs: DeliveryStream,
    buyers: DeliveryStream,
    sellers: DeliveryStream,
    handler: Arc<dyn NotificationHandler>,
    stats: WorkerStats,
}

impl OrderConsumer {
    /// Apply `topology` on `channel`, then subscribe to its three queues.
    pub async fn subscribe(
        id: usize,
        channel: Arc<dyn BrokerChannel>,
        topology: &Topology,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<Self> {
        TopologyConfigurator::new(channel.clone())
            .apply(topology)
            .await?;

        let logs = subscribe_kind(&*channel, topology, id, MessageKind::Log).await?;
        let buyers = subscribe_kind(&*channel, topology, id, MessageKind::BuyerNotice).await?;
        let sellers = subscribe_kind(&*channel, topology, id, MessageKind::SellerNotice).await?;

        info!(consumer_id = id, "Consumer subscribed");
        Ok(Self {
            id,
            _channel: channel,
            logs,
            buyers,
            sellers,
            handler,
            stats: WorkerStats::default(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Process deliveries until every subscription has ended or `shutdown`
    /// fires. Ready sources are polled in random order so none starves.
    pub async fn run(mut self, mut shutdown: ShutdownListener) -> WorkerStats {
        let (mut logs_open, mut buyers_open, mut sellers_open) = (true, true, true);

        loop {
            let (kind, next) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(consumer_id = self.id, "Consumer stopping on shutdown");
                    break;
                }
                next = self.logs.next(), if logs_open => (MessageKind::Log, next),
                next = self.buyers.next(), if buyers_open => (MessageKind::BuyerNotice, next),
                next = self.sellers.next(), if sellers_open => (MessageKind::SellerNotice, next),
            };

            match next {
                Some(Ok(delivery)) => self.dispatch(kind, delivery).await,
                Some(Err(e)) => {
                    error!(consumer_id = self.id, kind = %kind, error = %e, "Subscription error");
                }
                None => {
                    warn!(consumer_id = self.id, kind = %kind, "Subscription closed");
                    match kind {
                        MessageKind::Log => logs_open = false,
                        MessageKind::BuyerNotice => buyers_open = false,
                        MessageKind::SellerNotice => sellers_open = false,
                    }
                    if !(logs_open || buyers_open || sellers_open) {
                        info!(consumer_id = self.id, "All subscriptions closed");
                        break;
                    }
                }
            }
        }

        info!(
            consumer_id = self.id,
            handled = self.stats.handled,
            malformed = self.stats.malformed,
            failed = self.stats.failed,
            "Consumer stopped"
        );
        self.stats
    }

    async fn dispatch(&mut self, kind: MessageKind, delivery: Delivery) {
        let notification = match Notification::decode(kind, &delivery.data) {
            Ok(notification) => notification,
            Err(e) => {
                self.stats.malformed += 1;
                warn!(
                    consumer_id = self.id,
                    queue = %delivery.queue,
                    error = %e,
                    "Discarding undecodable delivery"
                );
                settle(self.id, &delivery, false).await;
                return;
            }
        };

        let order_id = notification.order_id();
        match self.handler.handle(self.id, notification).await {
            Ok(()) => {
                self.stats.handled += 1;
                debug!(consumer_id = self.id, kind = %kind, order_id = %order_id, "Delivery handled");
                settle(self.id, &delivery, true).await;
            }
            Err(e) => {
                self.stats.failed += 1;
                error!(
                    consumer_id = self.id,
                    kind = %kind,
                    order_id = %order_id,
                    error = %e,
                    "Handler failed, rejecting delivery"
                );
                settle(self.id, &delivery, false).await;
            }
        }
    }
}

/// Ack or reject (without requeue) a delivery; failures are logged only.
async fn settle(consumer_id: usize, delivery: &Delivery, ack: bool) {
    let result = if ack {
        delivery.ack().await
    } else {
        delivery.reject(false).await
    };
    if let Err(e) = result {
        error!(consumer_id, queue = %delivery.queue, error = %e, "Failed to settle delivery");
    }
}

async fn subscribe_kind(
    channel: &dyn BrokerChannel,
    topology: &Topology,
    id: usize,
    kind: MessageKind,
) -> Result<DeliveryStream> {
    let queue = topology
        .queue(kind)
        .ok_or_else(|| BusError::Subscribe(format!("No queue bound for {}", kind)))?;
    channel
        .subscribe(queue, &format!("orderflow-worker-{}-{}", id, kind))
        .await
}

/// A running set of consumer workers.
pub struct WorkerPool {
    workers: Vec<(usize, JoinHandle<WorkerStats>)>,
    exited: ShutdownListener,
}

/// Counts a worker out when its task ends, panics included.
struct ExitGuard {
    remaining: Arc<AtomicUsize>,
    all_exited: ShutdownTrigger,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.all_exited.trigger();
        }
    }
}

impl WorkerPool {
    /// Start one worker per channel. Worker ids count from 1.
    ///
    /// Every worker subscribes before any is spawned, so a setup failure
    /// leaves nothing running.
    pub async fn start(
        channels: Vec<Arc<dyn BrokerChannel>>,
        topology: &Topology,
        handler: Arc<dyn NotificationHandler>,
        shutdown: &ShutdownListener,
    ) -> Result<Self> {
        let mut consumers = Vec::with_capacity(channels.len());
        for (idx, channel) in channels.into_iter().enumerate() {
            consumers.push(OrderConsumer::subscribe(idx + 1, channel, topology, handler.clone()).await?);
        }

        let (all_exited, exited) = shutdown_channel();
        let remaining = Arc::new(AtomicUsize::new(consumers.len()));
        if consumers.is_empty() {
            all_exited.trigger();
        }

        let workers = consumers
            .into_iter()
            .map(|consumer| {
                let id = consumer.id();
                let guard = ExitGuard {
                    remaining: remaining.clone(),
                    all_exited: all_exited.clone(),
                };
                let listener = shutdown.clone();
                let task = tokio::spawn(async move {
                    let _guard = guard;
                    consumer.run(listener).await
                });
                (id, task)
            })
            .collect::<Vec<_>>();

        info!(workers = workers.len(), "Consumer pool started");
        Ok(Self { workers, exited })
    }

    /// Resolves once every worker has exited, whatever the reason.
    pub async fn exited(&self) {
        self.exited.clone().cancelled().await;
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker and sum their counters.
    pub async fn join(self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for (id, handle) in self.workers {
            match handle.await {
                Ok(stats) => total += stats,
                Err(e) => error!(consumer_id = id, error = %e, "Consumer task failed"),
            }
        }
        total
    }
}

#[cfg(test)]
mod tests;
