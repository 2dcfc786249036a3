//! Discovery driving a real producer: the dial set follows the advertised
//! fleet, and sessions come and go with it.

use std::sync::Arc;
use std::time::Duration;

use psc_discovery::{ConsulDiscovery, DiscoveryConfig};
use psc_test_utils::{MockAgent, ServiceInstance};
use pubsubclub::{Consumer, EndpointConfig, MemoryBroker, Producer};
use tokio::sync::watch;

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

fn test_config(agent: &MockAgent) -> DiscoveryConfig {
    let mut config = DiscoveryConfig::new(agent.url(), "pubsub");
    config.poll_wait = Duration::from_secs(1);
    config.debounce_period = Duration::from_millis(400);
    config.min_query_period = Duration::from_millis(50);
    config.http_retry_wait = Duration::from_millis(100);
    config.request_timeout = Duration::from_secs(2);
    config
}

async fn consumer_node() -> (Consumer, std::net::SocketAddr) {
    let broker = Arc::new(MemoryBroker::new());
    let consumer = Consumer::new(EndpointConfig::default(), broker);
    let addr = consumer.listen("127.0.0.1:0").await.unwrap();
    (consumer, addr)
}

#[tokio::test]
async fn discovery_establishes_sessions_with_the_advertised_fleet() {
    let (consumer_a, addr_a) = consumer_node().await;
    let (consumer_b, addr_b) = consumer_node().await;

    let agent = MockAgent::start("self").await.unwrap();
    agent
        .set_fleet(vec![
            // The agent also advertises this node; it must be skipped.
            ServiceInstance::new("self", "127.0.0.1", 1),
            ServiceInstance::new("peer-a", "127.0.0.1", addr_a.port()),
            ServiceInstance::new("peer-b", "127.0.0.1", addr_b.port()),
        ])
        .await;

    let producer = Producer::new(EndpointConfig::default());
    let discovery =
        ConsulDiscovery::new(test_config(&agent), Arc::new(producer.clone())).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(discovery.run(shutdown_rx));

    wait_until(|| producer.ready_session_count() == 2).await;
    assert_eq!(consumer_a.session_count(), 1);
    assert_eq!(consumer_b.session_count(), 1);
    assert_eq!(producer.dialed_peers().len(), 2);

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn a_peer_leaving_the_fleet_is_disconnected_after_the_debounce() {
    let (consumer_a, addr_a) = consumer_node().await;
    let (consumer_b, addr_b) = consumer_node().await;

    let agent = MockAgent::start("self").await.unwrap();
    agent
        .set_fleet(vec![
            ServiceInstance::new("peer-a", "127.0.0.1", addr_a.port()),
            ServiceInstance::new("peer-b", "127.0.0.1", addr_b.port()),
        ])
        .await;

    let producer = Producer::new(EndpointConfig::default());
    let discovery =
        ConsulDiscovery::new(test_config(&agent), Arc::new(producer.clone())).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(discovery.run(shutdown_rx));

    wait_until(|| producer.ready_session_count() == 2).await;

    // peer-b leaves the fleet; after the debounce its session is closed
    // cleanly and never redialed.
    agent
        .set_fleet(vec![ServiceInstance::new(
            "peer-a",
            "127.0.0.1",
            addr_a.port(),
        )])
        .await;

    wait_until(|| consumer_b.session_count() == 0).await;
    wait_until(|| producer.dialed_peers().len() == 1).await;
    assert_eq!(consumer_a.session_count(), 1, "surviving peer must stay connected");

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(consumer_b.session_count(), 0, "departed peer must not be redialed");

    let _ = shutdown_tx.send(true);
}
