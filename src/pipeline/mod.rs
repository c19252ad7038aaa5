//! Producer-side event loop.
//!
//! The dispatcher waits on either the next order or the shutdown signal.
//! Each order is fanned out before the next one is taken, so a slow broker
//! slows the generator through the bounded channel. On shutdown the
//! generator is stopped, orders already handed over are still published,
//! and the dispatcher waits for the generator to exit.

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::generator::GeneratorHandle;
use crate::model::Order;
use crate::publisher::OrderPublisher;
use crate::shutdown::ShutdownListener;

/// What the dispatcher did before stopping.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Orders fanned out.
    pub orders: u64,
    /// Individual projections that failed to publish.
    pub failed_publishes: u64,
    /// Orders the generator reports having sent.
    pub generated: u64,
}

pub struct Dispatcher {
    publisher: OrderPublisher,
}

impl Dispatcher {
    pub fn new(publisher: OrderPublisher) -> Self {
        Self { publisher }
    }

    /// Run until `shutdown` fires or the generator goes away.
    pub async fn run(
        &self,
        generator: GeneratorHandle,
        mut orders: mpsc::Receiver<Order>,
        mut shutdown: ShutdownListener,
    ) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        info!("Dispatcher started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Dispatcher received shutdown");
                    break;
                }
                next = orders.recv() => match next {
                    Some(order) => self.dispatch(&order, &mut summary).await,
                    None => {
                        warn!("Order channel closed");
                        break;
                    }
                },
            }
        }

        generator.stop();
        // The channel closes once the generator task has exited.
        while let Some(order) = orders.recv().await {
            self.dispatch(&order, &mut summary).await;
        }

        match generator.join().await {
            Ok(generated) => summary.generated = generated,
            Err(e) => error!(error = %e, "Order generator failed"),
        }

        info!(
            orders = summary.orders,
            failed_publishes = summary.failed_publishes,
            "Dispatcher stopped"
        );
        summary
    }

    async fn dispatch(&self, order: &Order, summary: &mut DispatchSummary) {
        let report = self.publisher.fan_out(order).await;
        summary.orders += 1;
        summary.failed_publishes += report.failed.len() as u64;
    }
}
