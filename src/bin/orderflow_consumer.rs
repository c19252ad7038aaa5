//! orderflow-consumer: notification workers
//!
//! Starts a pool of workers. Each worker opens its own channel, declares
//! the order topology, and consumes the log, buyer and seller queues at
//! once. Workers compete, so every message is handled by one of them.
//!
//! Runs until SIGINT or SIGTERM. If every worker stops on its own first
//! (their subscriptions ended, e.g. the broker connection dropped), the
//! process exits with an error.
//!
//! ## Configuration
//! - ORDERFLOW_CONFIG: Optional YAML configuration file
//! - ORDERFLOW__MESSAGING__AMQP__URL: Broker address
//! - ORDERFLOW__MESSAGING__AMQP__PREFETCH: Unacknowledged deliveries per channel
//! - ORDERFLOW__CONSUMER__WORKERS: Pool size
//! - ORDERFLOW_LOG: Log filter (default "info")

use std::sync::Arc;

use tracing::{error, info};

use orderflow::bus::{AmqpConnection, BrokerChannel};
use orderflow::config::Config;
use orderflow::consumer::{NotificationHandler, RenderHandler, WorkerPool};
use orderflow::shutdown::{shutdown_channel, wait_for_signal};
use orderflow::topology::Topology;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    orderflow::utils::bootstrap::init_tracing();

    let config_path = orderflow::utils::bootstrap::parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(workers = config.consumer.workers, "Starting orderflow-consumer");

    let connection = AmqpConnection::connect(&config.messaging.amqp).await?;
    let mut channels: Vec<Arc<dyn BrokerChannel>> = Vec::with_capacity(config.consumer.workers);
    for _ in 0..config.consumer.workers {
        channels.push(Arc::new(connection.open_channel().await?));
    }

    let topology = Topology::orders(&config.topology);
    let handler: Arc<dyn NotificationHandler> = Arc::new(RenderHandler);
    let (trigger, listener) = shutdown_channel();

    let pool = WorkerPool::start(channels, &topology, handler, &listener)
        .await
        .map_err(|e| {
            error!("Failed to start consumers: {}", e);
            e
        })?;

    let workers_died = tokio::select! {
        res = wait_for_signal() => {
            res?;
            false
        }
        _ = pool.exited() => true,
    };
    trigger.trigger();

    let stats = pool.join().await;
    info!(
        handled = stats.handled,
        malformed = stats.malformed,
        failed = stats.failed,
        "orderflow-consumer shut down"
    );

    if workers_died {
        error!("All consumer workers exited before shutdown was requested");
        return Err("consumer workers exited unexpectedly".into());
    }
    Ok(())
}
