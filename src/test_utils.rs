//! Test utilities and mock implementations.
//!
//! Provides a recording broker channel and a collecting notification
//! handler for exercising the publisher and consumer without a broker.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use uuid::Uuid;

use crate::bus::{BrokerChannel, BusError, DeliveryStream, MessageProperties, Result};
use crate::consumer::NotificationHandler;
use crate::model::{Notification, Order};
use crate::topology::{ExchangeKind, QueueOptions};

/// The order used throughout the examples: Alice Johnson buys a Laptop for 55.
pub fn sample_order() -> Order {
    Order {
        id: Uuid::new_v4(),
        item: "Laptop".to_string(),
        price: 55,
        shop: "Tech Haven".to_string(),
        buyer: "Alice Johnson".to_string(),
        address: "Springfield".to_string(),
        created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A message captured by [`RecordingChannel`].
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

/// Broker channel that records publishes instead of routing them.
#[derive(Default)]
pub struct RecordingChannel {
    published: Mutex<Vec<PublishedMessage>>,
    failing_keys: Mutex<HashSet<String>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish on `routing_key` fail.
    pub fn fail_routing_key(&self, routing_key: &str) {
        lock(&self.failing_keys).insert(routing_key.to_string());
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }
}

#[async_trait]
impl BrokerChannel for RecordingChannel {
    async fn declare_exchange(&self, _name: &str, _kind: ExchangeKind, _durable: bool) -> Result<()> {
        Ok(())
    }

    async fn declare_queue(&self, _name: &str, _options: QueueOptions) -> Result<()> {
        Ok(())
    }

    async fn bind_queue(&self, _queue: &str, _routing_key: &str, _exchange: &str) -> Result<()> {
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<()> {
        if lock(&self.failing_keys).contains(routing_key) {
            return Err(BusError::Publish(format!(
                "Simulated failure for {}",
                routing_key
            )));
        }

        lock(&self.published).push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            properties,
        });
        Ok(())
    }

    async fn subscribe(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        Err(BusError::Subscribe(format!(
            "Recording channel cannot consume {}",
            queue
        )))
    }
}

/// Handler that keeps every notification it sees, tagged with the worker id.
#[derive(Default, Clone)]
pub struct CollectingHandler {
    seen: Arc<Mutex<Vec<(usize, Notification)>>>,
    fail_order: Arc<Mutex<Option<Uuid>>>,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every notification that belongs to `order_id`.
    pub fn fail_order(&self, order_id: Uuid) {
        *lock(&self.fail_order) = Some(order_id);
    }

    pub fn seen(&self) -> Vec<(usize, Notification)> {
        lock(&self.seen).clone()
    }
}

#[async_trait]
impl NotificationHandler for CollectingHandler {
    async fn handle(&self, worker: usize, notification: Notification) -> Result<()> {
        if *lock(&self.fail_order) == Some(notification.order_id()) {
            return Err(BusError::Handler(format!(
                "Rejected order {}",
                notification.order_id()
            )));
        }
        lock(&self.seen).push((worker, notification));
        Ok(())
    }
}
