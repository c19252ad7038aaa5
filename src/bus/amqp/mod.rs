//! AMQP (RabbitMQ) transport.
//!
//! Channels are opened on pooled connections; each task that talks to the
//! broker takes its own [`AmqpChannel`] and never shares it.

use async_trait::async_trait;
use backon::Retryable;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, ConnectionProperties,
};
use tracing::{debug, info, warn};

use super::{
    Acknowledge, BrokerChannel, BusError, Delivery, DeliveryStream, MessageProperties, Result,
};
use crate::config::AmqpConfig;
use crate::topology::{ExchangeKind, QueueOptions};
use crate::utils::bootstrap::connection_backoff;

/// Pooled connection to a RabbitMQ broker.
pub struct AmqpConnection {
    pool: Pool,
    prefetch: u16,
}

impl AmqpConnection {
    /// Connect to the broker, retrying with backoff up to
    /// `config.connect_attempts` times before giving up.
    pub async fn connect(config: &AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), ConnectionProperties::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        // Verify connection
        (|| async {
            pool.get()
                .await
                .map(|_| ())
                .map_err(|e: PoolError| BusError::Connection(format!("Failed to connect: {}", e)))
        })
        .retry(connection_backoff(config.connect_attempts))
        .notify(|err: &BusError, dur| {
            warn!(error = %err, delay = ?dur, "Broker connection failed, retrying");
        })
        .await?;

        info!(pool_size = config.pool_size, "Connected to AMQP");

        Ok(Self {
            pool,
            prefetch: config.prefetch,
        })
    }

    /// Open a new channel with the configured prefetch window.
    pub async fn open_channel(&self) -> Result<AmqpChannel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to set prefetch: {}", e)))?;

        Ok(AmqpChannel { channel })
    }
}

/// A single AMQP channel.
pub struct AmqpChannel {
    channel: Channel,
}

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                lapin_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BusError::Topology(format!("Failed to declare exchange '{}': {}", name, e))
            })
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: options.no_wait,
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| BusError::Topology(format!("Failed to declare queue '{}': {}", name, e)))
    }

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Topology(format!("Failed to bind queue '{}': {}", queue, e)))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<()> {
        let delivery_mode = if properties.persistent { 2 } else { 1 };
        let properties = BasicProperties::default()
            .with_content_type(properties.content_type.into())
            .with_delivery_mode(delivery_mode);

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        // Without confirm mode this resolves immediately.
        confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

        debug!(exchange = %exchange, routing_key = %routing_key, "Published message");
        Ok(())
    }

    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        info!(queue = %queue, consumer_tag = %consumer_tag, "AMQP consumer started");

        let queue = queue.to_string();
        let stream = consumer.map(move |delivery| {
            delivery
                .map(|d| {
                    Delivery::new(
                        queue.clone(),
                        d.routing_key.as_str(),
                        d.data,
                        d.redelivered,
                        Box::new(AmqpAcker { acker: d.acker }),
                    )
                })
                .map_err(|e| BusError::Subscribe(format!("Consumer delivery error: {}", e)))
        });

        Ok(stream.boxed())
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Acknowledge(format!("Failed to ack message: {}", e)))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| BusError::Acknowledge(format!("Failed to reject message: {}", e)))
    }
}
