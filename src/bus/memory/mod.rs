//! In-process broker for tests and local runs.
//!
//! Mirrors the AMQP behaviour the pipeline depends on: exchanges route by
//! binding, queues buffer until a consumer is attached, and consumers on the
//! same queue compete for messages (round-robin push, like RabbitMQ).
//! Declarations are idempotent and fail on conflicting parameters.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    Acknowledge, BrokerChannel, BusError, Delivery, DeliveryStream, MessageProperties, Result,
};
use crate::topology::{ExchangeKind, QueueOptions};

#[derive(Debug, Clone)]
struct Message {
    routing_key: String,
    data: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExchangeDecl {
    kind: ExchangeKind,
    durable: bool,
}

struct ConsumerSlot {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

struct QueueState {
    options: QueueOptions,
    owner: u64,
    backlog: VecDeque<Message>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    acked: u64,
    rejected: u64,
}

impl QueueState {
    fn new(options: QueueOptions, owner: u64) -> Self {
        Self {
            options,
            owner,
            backlog: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            acked: 0,
            rejected: 0,
        }
    }

    /// Hand a message to the next live consumer, or park it in the backlog.
    fn deliver(&mut self, mut message: Message) {
        while !self.consumers.is_empty() {
            let idx = self.next_consumer % self.consumers.len();
            match self.consumers[idx].tx.send(message) {
                Ok(()) => {
                    self.next_consumer = idx + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    message = returned;
                    self.consumers.remove(idx);
                }
            }
        }
        self.backlog.push_back(message);
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDecl>,
    queues: HashMap<String, QueueState>,
    /// (exchange, routing key, queue)
    bindings: HashSet<(String, String, String)>,
    unroutable: u64,
}

impl BrokerState {
    fn route(&self, exchange: &str, kind: ExchangeKind, routing_key: &str) -> Vec<String> {
        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|(ex, key, _)| {
                ex == exchange
                    && match kind {
                        ExchangeKind::Direct => key == routing_key,
                        ExchangeKind::Fanout => true,
                        ExchangeKind::Topic => topic_matches(key, routing_key),
                    }
            })
            .map(|(_, _, queue)| queue.clone())
            .collect();
        targets.sort();
        targets.dedup();
        targets
    }

    fn remove_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|(_, _, queue)| queue != name);
    }
}

/// Match a topic binding pattern against a routing key.
///
/// `*` matches exactly one word, `#` matches zero or more words.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

/// Queue declarations match if everything but `no_wait` agrees; `no_wait`
/// only changes the handshake.
fn equivalent(a: QueueOptions, b: QueueOptions) -> bool {
    a.durable == b.durable && a.auto_delete == b.auto_delete && a.exclusive == b.exclusive
}

type SharedState = Arc<Mutex<BrokerState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory broker. Cheap to clone; clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: SharedState,
    next_id: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection. Exclusive queues belong to one connection.
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            broker: self.clone(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn queue_count(&self) -> usize {
        lock(&self.state).queues.len()
    }

    pub fn binding_count(&self) -> usize {
        lock(&self.state).bindings.len()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        lock(&self.state).queues.contains_key(name)
    }

    /// Messages waiting in `queue` with no consumer to take them.
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.backlog.len())
    }

    pub fn acked(&self, queue: &str) -> u64 {
        lock(&self.state).queues.get(queue).map_or(0, |q| q.acked)
    }

    pub fn rejected(&self, queue: &str) -> u64 {
        lock(&self.state).queues.get(queue).map_or(0, |q| q.rejected)
    }

    /// Delete `queue` and its bindings. Attached consumers see their
    /// stream end, as with a broker-side cancel.
    pub fn delete_queue(&self, queue: &str) {
        lock(&self.state).remove_queue(queue);
    }

    /// Messages published to an exchange with no matching binding.
    pub fn unroutable(&self) -> u64 {
        lock(&self.state).unroutable
    }
}

/// A connection to a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

impl MemoryConnection {
    pub fn open_channel(&self) -> MemoryChannel {
        MemoryChannel {
            state: self.broker.state.clone(),
            next_id: self.broker.next_id.clone(),
            connection: self.id,
        }
    }
}

/// A session on a [`MemoryConnection`].
pub struct MemoryChannel {
    state: SharedState,
    next_id: Arc<AtomicU64>,
    connection: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        let mut state = lock(&self.state);
        let decl = ExchangeDecl { kind, durable };

        match state.exchanges.get(name) {
            Some(existing) if *existing != decl => Err(BusError::Topology(format!(
                "PRECONDITION_FAILED - inequivalent arg for exchange '{}': declared {:?}, existing {:?}",
                name, decl, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), decl);
                debug!(exchange = %name, kind = %kind, "Memory exchange created");
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let mut state = lock(&self.state);

        match state.queues.get(name) {
            Some(existing) if existing.options.exclusive && existing.owner != self.connection => {
                Err(BusError::Topology(format!(
                    "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                    name
                )))
            }
            Some(existing) if !equivalent(existing.options, options) => {
                Err(BusError::Topology(format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue '{}': declared {:?}, existing {:?}",
                    name, options, existing.options
                )))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(name.to_string(), QueueState::new(options, self.connection));
                debug!(queue = %name, ?options, "Memory queue created");
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        let mut state = lock(&self.state);

        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::Topology(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        if !state.queues.contains_key(queue) {
            return Err(BusError::Topology(format!("NOT_FOUND - no queue '{}'", queue)));
        }

        state.bindings.insert((
            exchange.to_string(),
            routing_key.to_string(),
            queue.to_string(),
        ));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        _properties: MessageProperties,
    ) -> Result<()> {
        let mut state = lock(&self.state);

        let kind = state
            .exchanges
            .get(exchange)
            .map(|decl| decl.kind)
            .ok_or_else(|| BusError::Publish(format!("NOT_FOUND - no exchange '{}'", exchange)))?;

        let targets = state.route(exchange, kind, routing_key);
        if targets.is_empty() {
            state.unroutable += 1;
            debug!(exchange = %exchange, routing_key = %routing_key, "Unroutable message dropped");
            return Ok(());
        }

        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.deliver(Message {
                    routing_key: routing_key.to_string(),
                    data: payload.to_vec(),
                    redelivered: false,
                });
            }
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut state = lock(&self.state);
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BusError::Subscribe(format!("NOT_FOUND - no queue '{}'", queue)))?;

            if queue_state.options.exclusive && queue_state.owner != self.connection {
                return Err(BusError::Subscribe(format!(
                    "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                    queue
                )));
            }

            queue_state.consumers.push(ConsumerSlot {
                id: consumer_id,
                tx,
            });
            let backlog: Vec<Message> = queue_state.backlog.drain(..).collect();
            for message in backlog {
                queue_state.deliver(message);
            }
        }

        info!(queue = %queue, consumer_tag = %consumer_tag, "Memory consumer attached");

        let subscription = Subscription {
            state: self.state.clone(),
            queue: queue.to_string(),
            consumer_id,
            rx,
        };

        let stream = futures::stream::unfold(subscription, |mut sub| async move {
            let message = sub.rx.recv().await?;
            let acker = MemoryAcker {
                state: sub.state.clone(),
                queue: sub.queue.clone(),
                message: message.clone(),
                settled: AtomicBool::new(false),
            };
            let delivery = Delivery::new(
                sub.queue.clone(),
                message.routing_key,
                message.data,
                message.redelivered,
                Box::new(acker),
            );
            Some((Ok(delivery), sub))
        });

        Ok(stream.boxed())
    }
}

/// Consumer registration; detaches from the queue when the stream is dropped.
struct Subscription {
    state: SharedState,
    queue: String,
    consumer_id: u64,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.rx.close();
        let mut state = lock(&self.state);

        let remove = match state.queues.get_mut(&self.queue) {
            Some(queue) => {
                queue.consumers.retain(|c| c.id != self.consumer_id);
                // Pushed but never received: back to the queue for the others.
                while let Ok(mut message) = self.rx.try_recv() {
                    message.redelivered = true;
                    queue.deliver(message);
                }
                queue.options.auto_delete && queue.consumers.is_empty()
            }
            None => false,
        };

        if remove {
            state.remove_queue(&self.queue);
            debug!(queue = %self.queue, "Auto-delete queue removed");
        }
    }
}

struct MemoryAcker {
    state: SharedState,
    queue: String,
    message: Message,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BusError::Acknowledge(
                "PRECONDITION_FAILED - delivery already settled".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle()?;
        if let Some(queue) = lock(&self.state).queues.get_mut(&self.queue) {
            queue.acked += 1;
        }
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle()?;
        if let Some(queue) = lock(&self.state).queues.get_mut(&self.queue) {
            if requeue {
                queue.deliver(Message {
                    redelivered: true,
                    ..self.message.clone()
                });
            } else {
                queue.rejected += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
