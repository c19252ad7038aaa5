//! orderflow-producer: order generator and fan-out publisher
//!
//! Generates synthetic orders at a fixed rate and publishes three
//! projections of each one through the order exchange.
//!
//! ## Architecture
//! ```text
//! [OrderGenerator] -> [Dispatcher] -> [OrderPublisher] -> order_event_exchange
//!                                                          |-- log.orders     -> order log
//!                                                          |-- notify.users   -> user notify
//!                                                          `-- notify.sellers -> seller notify
//! ```
//!
//! ## Configuration
//! - ORDERFLOW_CONFIG: Optional YAML configuration file
//! - ORDERFLOW__MESSAGING__AMQP__URL: Broker address
//! - ORDERFLOW__GENERATOR__RATE: Orders per second
//! - ORDERFLOW_LOG: Log filter (default "info")
//!
//! Runs until SIGINT or SIGTERM, then publishes whatever is already in
//! flight and exits. If the dispatcher stops on its own first, the process
//! exits with an error.

use std::sync::Arc;

use tracing::{error, info};

use orderflow::bus::{AmqpConnection, BrokerChannel};
use orderflow::config::Config;
use orderflow::generator::OrderGenerator;
use orderflow::pipeline::Dispatcher;
use orderflow::publisher::OrderPublisher;
use orderflow::shutdown::{shutdown_channel, wait_for_signal};
use orderflow::topology::{Topology, TopologyConfigurator};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    orderflow::utils::bootstrap::init_tracing();

    let config_path = orderflow::utils::bootstrap::parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting orderflow-producer");

    let connection = AmqpConnection::connect(&config.messaging.amqp).await?;
    let channel: Arc<dyn BrokerChannel> = Arc::new(connection.open_channel().await?);

    let topology = Topology::orders(&config.topology);
    TopologyConfigurator::new(channel.clone())
        .apply(&topology)
        .await
        .map_err(|e| {
            error!("Failed to declare topology: {}", e);
            e
        })?;

    let publisher = OrderPublisher::new(channel, &topology);
    let (generator, orders) = OrderGenerator::new(&config.generator)?.start();
    let (trigger, listener) = shutdown_channel();

    let mut dispatcher = tokio::spawn(async move {
        Dispatcher::new(publisher)
            .run(generator, orders, listener)
            .await
    });

    let stopped_early = tokio::select! {
        res = wait_for_signal() => {
            res?;
            None
        }
        joined = &mut dispatcher => Some(joined),
    };
    trigger.trigger();

    let dispatcher_died = stopped_early.is_some();
    let summary = match stopped_early {
        Some(joined) => joined?,
        None => dispatcher.await?,
    };
    info!(
        orders = summary.orders,
        failed_publishes = summary.failed_publishes,
        "orderflow-producer shut down"
    );

    if dispatcher_died {
        error!("Dispatcher stopped before shutdown was requested");
        return Err("dispatcher exited unexpectedly".into());
    }
    Ok(())
}
