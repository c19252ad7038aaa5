use super::*;
use std::time::Duration;

const JSON: MessageProperties = MessageProperties {
    content_type: "application/json",
    persistent: false,
};

async fn direct_setup(channel: &MemoryChannel, queues: &[(&str, &str)]) {
    channel
        .declare_exchange("orders", ExchangeKind::Direct, true)
        .await
        .unwrap();
    for (queue, key) in queues {
        channel
            .declare_queue(queue, QueueOptions::default())
            .await
            .unwrap();
        channel.bind_queue(queue, key, "orders").await.unwrap();
    }
}

async fn next_payload(stream: &mut DeliveryStream) -> Vec<u8> {
    let delivery = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("timed out waiting for delivery")
        .expect("stream ended")
        .expect("delivery error");
    delivery.ack().await.unwrap();
    delivery.data
}

#[test]
fn test_topic_matches() {
    assert!(topic_matches("log.orders", "log.orders"));
    assert!(topic_matches("log.*", "log.orders"));
    assert!(!topic_matches("log.*", "log.orders.urgent"));
    assert!(topic_matches("log.#", "log.orders.urgent"));
    assert!(topic_matches("#", "anything.at.all"));
    assert!(!topic_matches("notify.*", "log.orders"));
}

#[tokio::test]
async fn test_direct_routing_by_key() {
    let broker = MemoryBroker::new();
    let channel = broker.connect().open_channel();
    direct_setup(&channel, &[("a", "key.a"), ("b", "key.b")]).await;

    channel.publish("orders", "key.a", b"one", JSON).await.unwrap();

    assert_eq!(broker.queue_depth("a"), 1);
    assert_eq!(broker.queue_depth("b"), 0);
}

#[tokio::test]
async fn test_unroutable_is_dropped() {
    let broker = MemoryBroker::new();
    let channel = broker.connect().open_channel();
    direct_setup(&channel, &[("a", "key.a")]).await;

    channel.publish("orders", "nobody", b"x", JSON).await.unwrap();

    assert_eq!(broker.unroutable(), 1);
    assert_eq!(broker.queue_depth("a"), 0);
}

#[tokio::test]
async fn test_publish_to_missing_exchange_fails() {
    let broker = MemoryBroker::new();
    let channel = broker.connect().open_channel();

    let result = channel.publish("missing", "key", b"x", JSON).await;

    assert!(matches!(result, Err(BusError::Publish(_))));
}

#[tokio::test]
async fn test_conflicting_queue_declaration_fails() {
    let broker = MemoryBroker::new();
    let channel = broker.connect().open_channel();
    let durable = QueueOptions {
        durable: true,
        ..Default::default()
    };

    channel.declare_queue("q", durable).await.unwrap();
    let result = channel.declare_queue("q", QueueOptions::default()).await;

    assert!(matches!(result, Err(BusError::Topology(_))));
    // no_wait alone is not a conflict
    channel
        .declare_queue(
            "q",
            QueueOptions {
                no_wait: true,
                ..durable
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_exclusive_queue_locked_to_connection() {
    let broker = MemoryBroker::new();
    let owner = broker.connect();
    let other = broker.connect();
    let exclusive = QueueOptions {
        exclusive: true,
        ..Default::default()
    };

    owner
        .open_channel()
        .declare_queue("private", exclusive)
        .await
        .unwrap();
    // another channel on the same connection is fine
    owner
        .open_channel()
        .declare_queue("private", exclusive)
        .await
        .unwrap();

    let declared = other.open_channel().declare_queue("private", exclusive).await;
    assert!(matches!(declared, Err(BusError::Topology(_))));

    let subscribed = other.open_channel().subscribe("private", "c").await;
    assert!(matches!(subscribed, Err(BusError::Subscribe(_))));
}

#[tokio::test]
async fn test_backlog_flushed_on_subscribe() {
    let broker = MemoryBroker::new();
    let channel = broker.connect().open_channel();
    direct_setup(&channel, &[("a", "key.a")]).await;

    channel.publish("orders", "key.a", b"1", JSON).await.unwrap();
    channel.publish("orders", "key.a", b"2", JSON).await.unwrap();

    let mut stream = channel.subscribe("a", "c").await.unwrap();
    assert_eq!(next_payload(&mut stream).await, b"1");
    assert_eq!(next_payload(&mut stream).await, b"2");
    assert_eq!(broker.acked("a"), 2);
}

#[tokio::test]
async fn test_competing_consumers_split_messages() {
    let broker = MemoryBroker::new();
    let channel = broker.connect().open_channel();
    direct_setup(&channel, &[("a", "key.a")]).await;

    let mut first = channel.subscribe("a", "c1").await.unwrap();
    let mut second = channel.subscribe("a", "c2").await.unwrap();

    for i in 0..4u8 {
        channel.publish("orders", "key.a", &[i], JSON).await.unwrap();
    }

    let mut seen = vec![
        next_payload(&mut first).await,
        next_payload(&mut second).await,
        next_payload(&mut first).await,
        next_payload(&mut second).await,
    ];
    seen.sort();
    assert_eq!(seen, vec![vec![0], vec![1], vec![2], vec![3]]);
}

#[tokio::test]
async fn test_dropped_consumer_returns_pending_messages() {
    let broker = MemoryBroker::new();
    let channel = broker.connect().open_channel();
    direct_setup(&channel, &[("a", "key.a")]).await;

    let first = channel.subscribe("a", "c1").await.unwrap();
    channel.publish("orders", "key.a", b"pending", JSON).await.unwrap();
    drop(first);

    assert_eq!(broker.queue_depth("a"), 1);

    let mut second = channel.subscribe("a", "c2").await.unwrap();
    let delivery = second.next().await.unwrap().unwrap();
    assert!(delivery.redelivered);
    assert_eq!(delivery.data, b"pending");
}

#[tokio::test]
async fn test_auto_delete_queue_removed_with_last_consumer() {
    let broker = MemoryBroker::new();
    let channel = broker.connect().open_channel();
    channel
        .declare_exchange("orders", ExchangeKind::Direct, false)
        .await
        .unwrap();
    channel
        .declare_queue(
            "temp",
            QueueOptions {
                auto_delete: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    channel.bind_queue("temp", "key", "orders").await.unwrap();

    let stream = channel.subscribe("temp", "c").await.unwrap();
    assert!(broker.has_queue("temp"));

    drop(stream);

    assert!(!broker.has_queue("temp"));
    assert_eq!(broker.binding_count(), 0);
}

#[tokio::test]
async fn test_reject_without_requeue_discards() {
    let broker = MemoryBroker::new();
    let channel = broker.connect().open_channel();
    direct_setup(&channel, &[("a", "key.a")]).await;

    let mut stream = channel.subscribe("a", "c").await.unwrap();
    channel.publish("orders", "key.a", b"bad", JSON).await.unwrap();

    let delivery = stream.next().await.unwrap().unwrap();
    delivery.reject(false).await.unwrap();

    assert_eq!(broker.rejected("a"), 1);
    assert_eq!(broker.acked("a"), 0);
    // settling twice is an error
    assert!(matches!(
        delivery.ack().await,
        Err(BusError::Acknowledge(_))
    ));
}

#[tokio::test]
async fn test_reject_with_requeue_redelivers() {
    let broker = MemoryBroker::new();
    let channel = broker.connect().open_channel();
    direct_setup(&channel, &[("a", "key.a")]).await;

    let mut stream = channel.subscribe("a", "c").await.unwrap();
    channel.publish("orders", "key.a", b"again", JSON).await.unwrap();

    let first = stream.next().await.unwrap().unwrap();
    first.reject(true).await.unwrap();

    let second = stream.next().await.unwrap().unwrap();
    assert!(second.redelivered);
    assert_eq!(second.data, b"again");
}

#[tokio::test]
async fn test_deleted_queue_ends_subscription() {
    let broker = MemoryBroker::new();
    let channel = broker.connect().open_channel();
    direct_setup(&channel, &[("a", "key.a")]).await;
    let mut stream = channel.subscribe("a", "c").await.unwrap();

    broker.delete_queue("a");

    let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("stream did not end");
    assert!(next.is_none());
    assert!(!broker.has_queue("a"));
    assert_eq!(broker.binding_count(), 0);
}
