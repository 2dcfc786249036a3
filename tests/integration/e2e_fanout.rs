//! End-to-end fan-out: a producer node dialing consumer nodes, with
//! interest routing, exactly-once delivery per node, and subscription
//! replay for subscriptions that predate the connection.

use std::sync::Arc;
use std::time::Duration;

use pubsubclub::{Consumer, EndpointConfig, MemoryBroker, PeerControl, Producer};
use serde_json::json;

const MYTOPIC: &str = "http://example.com/mytopic";
const NOT_MYTOPIC: &str = "http://example.com/NOTmytopic";

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

/// One consumer node: a broker plus a listening consumer endpoint.
async fn consumer_node() -> (Arc<MemoryBroker>, Consumer, std::net::SocketAddr) {
    let broker = Arc::new(MemoryBroker::new());
    let consumer = Consumer::new(EndpointConfig::default(), broker.clone());
    let addr = consumer.listen("127.0.0.1:0").await.unwrap();
    (broker, consumer, addr)
}

#[tokio::test]
async fn publish_reaches_exactly_the_interested_node_once() {
    let (broker, consumer, addr) = consumer_node().await;

    // One local client subscribes before the producer appears.
    broker.client_subscribe(MYTOPIC);
    consumer.on_client_subscribed(MYTOPIC).await;

    let producer = Producer::new(EndpointConfig::default());
    producer.connect("127.0.0.1", addr.port());
    wait_until(|| producer.sessions_subscribed_to(MYTOPIC) == 1).await;

    producer.publish(MYTOPIC, &json!({"a": "b"})).await;
    wait_until(|| !broker.dispatched().is_empty()).await;

    // An uninterested topic travels nowhere over the federation.
    producer.publish(NOT_MYTOPIC, &json!({"a": "b"})).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        broker.dispatched(),
        vec![(MYTOPIC.to_owned(), json!({"a": "b"}))]
    );
}

#[tokio::test]
async fn events_are_routed_only_to_nodes_with_matching_interest() {
    let (broker_a, consumer_a, addr_a) = consumer_node().await;
    let (broker_b, consumer_b, addr_b) = consumer_node().await;

    broker_a.client_subscribe("topic-a");
    consumer_a.on_client_subscribed("topic-a").await;
    broker_b.client_subscribe("topic-b");
    consumer_b.on_client_subscribed("topic-b").await;

    let producer = Producer::new(EndpointConfig::default());
    producer.connect("127.0.0.1", addr_a.port());
    producer.connect("127.0.0.1", addr_b.port());
    wait_until(|| {
        producer.sessions_subscribed_to("topic-a") == 1
            && producer.sessions_subscribed_to("topic-b") == 1
    })
    .await;

    producer.publish("topic-a", &json!(1)).await;
    wait_until(|| !broker_a.dispatched().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(broker_a.dispatched(), vec![("topic-a".to_owned(), json!(1))]);
    assert!(
        broker_b.dispatched().is_empty(),
        "node without interest received an event"
    );
}

#[tokio::test]
async fn subscriptions_from_before_the_dial_are_replayed() {
    let (broker, consumer, addr) = consumer_node().await;

    // Two local clients subscribe to the same topic before any producer
    // exists; only the first transition declares interest.
    broker.client_subscribe(MYTOPIC);
    consumer.on_client_subscribed(MYTOPIC).await;
    broker.client_subscribe(MYTOPIC);
    consumer.on_client_subscribed(MYTOPIC).await;

    // The producer dials late: the handshake replay must carry the
    // interest set.
    let producer = Producer::new(EndpointConfig::default());
    producer.connect("127.0.0.1", addr.port());
    wait_until(|| producer.sessions_subscribed_to(MYTOPIC) == 1).await;

    producer.publish(MYTOPIC, &json!({"n": 1})).await;
    wait_until(|| !broker.dispatched().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // One dispatch into the node's broker; local fan-out to the two
    // clients is the broker's business.
    assert_eq!(broker.dispatched().len(), 1);
}

#[tokio::test]
async fn unsubscribing_the_last_local_client_stops_delivery() {
    let (broker, consumer, addr) = consumer_node().await;
    broker.client_subscribe(MYTOPIC);
    consumer.on_client_subscribed(MYTOPIC).await;

    let producer = Producer::new(EndpointConfig::default());
    producer.connect("127.0.0.1", addr.port());
    wait_until(|| producer.sessions_subscribed_to(MYTOPIC) == 1).await;

    broker.client_unsubscribe(MYTOPIC);
    consumer.on_client_unsubscribed(MYTOPIC).await;
    wait_until(|| producer.sessions_subscribed_to(MYTOPIC) == 0).await;

    producer.publish(MYTOPIC, &json!(1)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(broker.dispatched().is_empty());
}
