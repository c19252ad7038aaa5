//! Orderflow - order events over a message broker
//!
//! A rate-limited generator produces synthetic orders. Each order is fanned
//! out as three projections (audit log, buyer notice, seller notice) through
//! one direct exchange into three durable queues, and a pool of workers
//! consumes all three queues concurrently.
//!
//! ```text
//! [OrderGenerator] -> mpsc -> [Dispatcher] -> [OrderPublisher]
//!                                                   |
//!                                   order_event_exchange (direct)
//!                                 /             |              \
//!                           order log      user notify     seller notify
//!                                 \             |              /
//!                               [OrderConsumer] x N (WorkerPool)
//! ```

pub mod bus;
pub mod config;
pub mod consumer;
pub mod generator;
pub mod model;
pub mod pipeline;
pub mod publisher;
pub mod shutdown;
pub mod topology;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
