//! Rate-limited synthetic order source.
//!
//! The generator owns its random source and emits one [`Order`] per
//! interval onto a bounded channel. The send is the backpressure point: if
//! nobody drains the channel, generation stalls. Stopping is observed while
//! blocked on that send and during the inter-order sleep, and no order is
//! sent once the stop has been seen.

use std::time::Duration;

use chrono::Utc;
use rand::rngs::{OsRng, StdRng};
use rand::{Rng, SeedableRng, TryRngCore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::GeneratorConfig;
use crate::model::Order;
use crate::shutdown::{shutdown_channel, ShutdownListener, ShutdownTrigger};

pub const ITEMS: [&str; 10] = [
    "Laptop",
    "Pillow",
    "Headphones",
    "CoffeeMug",
    "Backpack",
    "Notebook",
    "Smartphone",
    "DeskLamp",
    "WaterBottle",
    "MousePad",
];

pub const SHOPS: [&str; 10] = [
    "Tech Haven",
    "Cozy Corner",
    "Gadget Galaxy",
    "Elegant Emporium",
    "Urban Outfitters",
    "The Book Nook",
    "Fashion Forward",
    "Gourmet Delights",
    "Trendy Treasures",
    "Chic Boutique",
];

pub const BUYERS: [&str; 10] = [
    "Alice Johnson",
    "Bob Smith",
    "Carol Davis",
    "David Wilson",
    "Emma Brown",
    "Frank Harris",
    "Grace Lee",
    "Henry Martin",
    "Ivy Clark",
    "Jack Turner",
];

pub const ADDRESSES: [&str; 10] = [
    "Springfield",
    "Shelbyville",
    "Capital City",
    "Rivertown",
    "Lakewood",
    "Metropolis",
    "Gotham",
    "Star City",
    "Central City",
    "Sunnydale",
];

/// Lowest generated price.
pub const PRICE_MIN: u32 = 20;
/// Highest generated price.
pub const PRICE_MAX: u32 = 119;

/// Errors from the order generator.
#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("Generation rate must be at least 1 order per second, got {0}")]
    InvalidRate(u32),

    #[error("Channel buffer must hold at least one order")]
    InvalidBuffer,

    #[error("Identifier source failed: {0}")]
    IdSource(String),

    #[error("Generator task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Source of order identifiers.
pub trait IdSource: Send {
    fn next_id(&mut self) -> Result<Uuid, GeneratorError>;
}

/// Random (v4) identifiers from the operating system's entropy source.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsIdSource;

impl IdSource for OsIdSource {
    fn next_id(&mut self) -> Result<Uuid, GeneratorError> {
        let mut bytes = [0u8; 16];
        let mut os = OsRng;
        os.try_fill_bytes(&mut bytes)
            .map_err(|e| GeneratorError::IdSource(e.to_string()))?;
        Ok(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }
}

/// Produces orders at a fixed rate.
pub struct OrderGenerator {
    interval: Duration,
    buffer: usize,
    rng: StdRng,
    ids: Box<dyn IdSource>,
}

impl OrderGenerator {
    /// Build a generator. A zero rate is rejected rather than clamped.
    pub fn new(config: &GeneratorConfig) -> Result<Self, GeneratorError> {
        if config.rate == 0 {
            return Err(GeneratorError::InvalidRate(config.rate));
        }
        if config.buffer == 0 {
            return Err(GeneratorError::InvalidBuffer);
        }

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };

        Ok(Self {
            interval: Duration::from_secs(1) / config.rate,
            buffer: config.buffer,
            rng,
            ids: Box::new(OsIdSource),
        })
    }

    /// Replace the identifier source.
    pub fn with_id_source(mut self, ids: impl IdSource + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    /// Delay between consecutive orders.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Build the next order.
    ///
    /// If the identifier source fails the order gets the nil id and a
    /// warning is logged; generation carries on.
    pub fn next_order(&mut self) -> Order {
        let id = self.ids.next_id().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to create order id, using nil id");
            Uuid::nil()
        });

        Order {
            id,
            item: pick(&mut self.rng, &ITEMS),
            price: self.rng.random_range(PRICE_MIN..=PRICE_MAX),
            shop: pick(&mut self.rng, &SHOPS),
            buyer: pick(&mut self.rng, &BUYERS),
            address: pick(&mut self.rng, &ADDRESSES),
            created_at: Utc::now(),
        }
    }

    /// Spawn the generation loop.
    ///
    /// Returns a handle to stop it and the receiving end of the order channel.
    pub fn start(self) -> (GeneratorHandle, mpsc::Receiver<Order>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let (trigger, listener) = shutdown_channel();

        let task = tokio::spawn(self.run(tx, listener));

        (
            GeneratorHandle {
                stop: trigger,
                task,
            },
            rx,
        )
    }

    async fn run(mut self, orders: mpsc::Sender<Order>, mut stop: ShutdownListener) -> u64 {
        let mut emitted = 0u64;
        info!(interval = ?self.interval, "Order generator started");

        loop {
            if stop.is_triggered() {
                break;
            }

            let order = self.next_order();
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                sent = orders.send(order.clone()) => {
                    if sent.is_err() {
                        warn!("Order channel closed, generator stopping");
                        break;
                    }
                }
            }
            emitted += 1;
            info!(order = %order, "New order has been created");

            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(emitted, "Order generator stopped");
        emitted
    }
}

fn pick(rng: &mut StdRng, values: &[&str]) -> String {
    values[rng.random_range(0..values.len())].to_string()
}

/// Handle to a running generator.
pub struct GeneratorHandle {
    stop: ShutdownTrigger,
    task: JoinHandle<u64>,
}

impl GeneratorHandle {
    /// Signal the generator to stop. Safe to call more than once.
    pub fn stop(&self) {
        self.stop.trigger();
    }

    /// Wait for the generation loop to exit; returns the number of orders sent.
    pub async fn join(self) -> Result<u64, GeneratorError> {
        Ok(self.task.await?)
    }
}
