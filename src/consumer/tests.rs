use super::*;
use std::collections::HashSet;
use std::time::Duration;

use crate::bus::{MemoryBroker, MessageProperties};
use crate::model::JSON_CONTENT_TYPE;
use crate::publisher::OrderPublisher;
use crate::shutdown::shutdown_channel;
use crate::test_utils::{sample_order, CollectingHandler};
use crate::topology::ExchangeKind;

const RAW: MessageProperties = MessageProperties {
    content_type: JSON_CONTENT_TYPE,
    persistent: false,
};

async fn wait_for(handler: &CollectingHandler, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while handler.seen().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for notifications");
}

async fn worker(
    broker: &MemoryBroker,
    id: usize,
    handler: &CollectingHandler,
) -> OrderConsumer {
    OrderConsumer::subscribe(
        id,
        Arc::new(broker.connect().open_channel()),
        &Topology::default(),
        Arc::new(handler.clone()),
    )
    .await
    .unwrap()
}

fn publisher(broker: &MemoryBroker) -> OrderPublisher {
    OrderPublisher::new(
        Arc::new(broker.connect().open_channel()),
        &Topology::default(),
    )
}

#[tokio::test]
async fn test_subscribe_declares_topology() {
    let broker = MemoryBroker::new();
    let _consumer = worker(&broker, 1, &CollectingHandler::new()).await;

    assert!(broker.has_queue("order log"));
    assert!(broker.has_queue("user notify"));
    assert!(broker.has_queue("seller notify"));
    assert_eq!(broker.binding_count(), 3);
}

#[tokio::test]
async fn test_subscribe_fails_on_conflicting_topology() {
    let broker = MemoryBroker::new();
    broker
        .connect()
        .open_channel()
        .declare_exchange("order_event_exchange", ExchangeKind::Fanout, true)
        .await
        .unwrap();

    let result = OrderConsumer::subscribe(
        1,
        Arc::new(broker.connect().open_channel()),
        &Topology::default(),
        Arc::new(RenderHandler),
    )
    .await;

    assert!(matches!(result, Err(BusError::Topology(_))));
}

#[tokio::test]
async fn test_one_worker_handles_all_three_kinds() {
    let broker = MemoryBroker::new();
    let handler = CollectingHandler::new();
    let consumer = worker(&broker, 1, &handler).await;
    let (trigger, listener) = shutdown_channel();
    let task = tokio::spawn(consumer.run(listener));

    let order = sample_order();
    assert!(publisher(&broker).fan_out(&order).await.is_complete());
    wait_for(&handler, 3).await;

    trigger.trigger();
    let stats = task.await.unwrap();

    assert_eq!(stats.handled, 3);
    let kinds: HashSet<MessageKind> = handler.seen().iter().map(|(_, n)| n.kind()).collect();
    assert_eq!(kinds.len(), 3);
    assert!(handler
        .seen()
        .iter()
        .all(|(worker, n)| *worker == 1 && n.order_id() == order.id));
    assert_eq!(broker.acked("order log"), 1);
    assert_eq!(broker.acked("user notify"), 1);
    assert_eq!(broker.acked("seller notify"), 1);
}

#[tokio::test]
async fn test_malformed_delivery_is_skipped() {
    let broker = MemoryBroker::new();
    let handler = CollectingHandler::new();
    let consumer = worker(&broker, 1, &handler).await;
    let (trigger, listener) = shutdown_channel();
    let task = tokio::spawn(consumer.run(listener));

    let channel = broker.connect().open_channel();
    channel
        .publish("order_event_exchange", "log.orders", b"not json", RAW)
        .await
        .unwrap();
    publisher(&broker).publish_log(&sample_order()).await.unwrap();
    wait_for(&handler, 1).await;

    trigger.trigger();
    let stats = task.await.unwrap();

    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.handled, 1);
    assert_eq!(broker.rejected("order log"), 1);
    assert_eq!(broker.acked("order log"), 1);
}

#[tokio::test]
async fn test_handler_failure_rejects_without_requeue() {
    let broker = MemoryBroker::new();
    let handler = CollectingHandler::new();
    let consumer = worker(&broker, 1, &handler).await;
    let (trigger, listener) = shutdown_channel();
    let task = tokio::spawn(consumer.run(listener));

    let poisoned = sample_order();
    let healthy = sample_order();
    handler.fail_order(poisoned.id);

    let publisher = publisher(&broker);
    publisher.fan_out(&poisoned).await;
    publisher.fan_out(&healthy).await;
    wait_for(&handler, 3).await;

    trigger.trigger();
    let stats = task.await.unwrap();

    assert_eq!(stats.failed, 3);
    assert_eq!(stats.handled, 3);
    assert!(handler.seen().iter().all(|(_, n)| n.order_id() == healthy.id));
    assert_eq!(broker.rejected("order log"), 1);
    assert_eq!(broker.queue_depth("order log"), 0);
}

#[tokio::test]
async fn test_worker_stops_when_every_queue_is_gone() {
    let broker = MemoryBroker::new();
    let consumer = worker(&broker, 1, &CollectingHandler::new()).await;
    let (_trigger, listener) = shutdown_channel();
    let task = tokio::spawn(consumer.run(listener));

    broker.delete_queue("order log");
    broker.delete_queue("user notify");
    broker.delete_queue("seller notify");

    let stats = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("worker kept running with no subscriptions")
        .unwrap();
    assert_eq!(stats, WorkerStats::default());
}

#[tokio::test]
async fn test_worker_keeps_consuming_after_one_queue_closes() {
    let broker = MemoryBroker::new();
    let handler = CollectingHandler::new();
    let consumer = worker(&broker, 1, &handler).await;
    let (trigger, listener) = shutdown_channel();
    let task = tokio::spawn(consumer.run(listener));

    broker.delete_queue("order log");
    publisher(&broker)
        .publish_seller_notice(&sample_order())
        .await
        .unwrap();
    wait_for(&handler, 1).await;

    trigger.trigger();
    assert_eq!(task.await.unwrap().handled, 1);
}

#[tokio::test]
async fn test_pool_delivers_each_message_exactly_once() {
    let broker = MemoryBroker::new();
    let handler = CollectingHandler::new();
    let (trigger, listener) = shutdown_channel();

    let channels: Vec<Arc<dyn BrokerChannel>> = (0..3)
        .map(|_| Arc::new(broker.connect().open_channel()) as Arc<dyn BrokerChannel>)
        .collect();
    let pool = WorkerPool::start(
        channels,
        &Topology::default(),
        Arc::new(handler.clone()),
        &listener,
    )
    .await
    .unwrap();
    assert_eq!(pool.len(), 3);

    let publisher = publisher(&broker);
    let mut orders = HashSet::new();
    for _ in 0..30 {
        let order = sample_order();
        orders.insert(order.id);
        publisher.fan_out(&order).await;
    }
    wait_for(&handler, 90).await;

    trigger.trigger();
    let stats = pool.join().await;
    assert_eq!(stats.handled, 90);

    let seen = handler.seen();
    let unique: HashSet<(MessageKind, uuid::Uuid)> =
        seen.iter().map(|(_, n)| (n.kind(), n.order_id())).collect();
    assert_eq!(unique.len(), 90);
    assert!(unique.iter().all(|(_, id)| orders.contains(id)));

    let workers: HashSet<usize> = seen.iter().map(|(w, _)| *w).collect();
    assert_eq!(workers, HashSet::from([1, 2, 3]));
}

#[tokio::test]
async fn test_busy_queue_does_not_starve_the_others() {
    let broker = MemoryBroker::new();
    let handler = CollectingHandler::new();
    let consumer = worker(&broker, 1, &handler).await;

    // Everything is queued before the worker starts polling.
    let publisher = publisher(&broker);
    for _ in 0..500 {
        publisher.publish_log(&sample_order()).await.unwrap();
    }
    let seller_order = sample_order();
    publisher.publish_seller_notice(&seller_order).await.unwrap();

    let (trigger, listener) = shutdown_channel();
    let task = tokio::spawn(consumer.run(listener));
    wait_for(&handler, 501).await;
    trigger.trigger();
    task.await.unwrap();

    let position = handler
        .seen()
        .iter()
        .position(|(_, n)| n.kind() == MessageKind::SellerNotice)
        .expect("seller notice never handled");
    assert!(
        position < 100,
        "seller notice waited behind {} log entries",
        position
    );
}

#[tokio::test]
async fn test_pool_exited_fires_when_workers_stop_on_their_own() {
    let broker = MemoryBroker::new();
    let (_trigger, listener) = shutdown_channel();
    let pool = WorkerPool::start(
        vec![
            Arc::new(broker.connect().open_channel()) as Arc<dyn BrokerChannel>,
            Arc::new(broker.connect().open_channel()) as Arc<dyn BrokerChannel>,
        ],
        &Topology::default(),
        Arc::new(CollectingHandler::new()),
        &listener,
    )
    .await
    .unwrap();

    assert!(
        tokio::time::timeout(Duration::from_millis(100), pool.exited())
            .await
            .is_err(),
        "pool reported exit while workers were running"
    );

    broker.delete_queue("order log");
    broker.delete_queue("user notify");
    broker.delete_queue("seller notify");

    tokio::time::timeout(Duration::from_secs(1), pool.exited())
        .await
        .expect("pool did not notice its workers exiting");
    assert_eq!(pool.join().await, WorkerStats::default());
}

#[tokio::test]
async fn test_pool_exited_fires_after_shutdown() {
    let broker = MemoryBroker::new();
    let (trigger, listener) = shutdown_channel();
    let pool = WorkerPool::start(
        vec![Arc::new(broker.connect().open_channel()) as Arc<dyn BrokerChannel>],
        &Topology::default(),
        Arc::new(RenderHandler),
        &listener,
    )
    .await
    .unwrap();

    trigger.trigger();
    tokio::time::timeout(Duration::from_secs(1), pool.exited())
        .await
        .expect("pool did not exit on shutdown");
}
