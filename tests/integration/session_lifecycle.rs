//! Session lifecycle: self-loop suppression, version mismatch, and the
//! producer's wire-level conformance against a frame-level peer.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use psc_test_utils::FramedPeer;
use pubsubclub::{
    Consumer, EndpointConfig, Frame, MemoryBroker, NodeId, PeerControl, Producer, ProtocolVersion,
};

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn shared_node_id_closes_the_session_and_suppresses_redial() {
    let node_id = NodeId::new(1723).unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let consumer = Consumer::new(EndpointConfig::with_node_id(Some(node_id)), broker);
    let addr = consumer.listen("127.0.0.1:0").await.unwrap();

    let producer = Producer::new(EndpointConfig::with_node_id(Some(node_id)));
    producer.connect("127.0.0.1", addr.port());

    // The session closes within a round-trip and the dialer gives up.
    wait_until(|| producer.session_count() == 0 && producer.dialed_peers().is_empty()).await;

    // And it stays that way: no redial after the backoff would have fired.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(producer.session_count(), 0);
    assert_eq!(consumer.session_count(), 0);
    assert!(producer.dialed_peers().is_empty());
}

#[tokio::test]
async fn distinct_node_ids_keep_the_session_up() {
    let broker = Arc::new(MemoryBroker::new());
    let consumer = Consumer::new(
        EndpointConfig::with_node_id(Some(NodeId::new(1).unwrap())),
        broker,
    );
    let addr = consumer.listen("127.0.0.1:0").await.unwrap();

    let producer = Producer::new(EndpointConfig::with_node_id(Some(NodeId::new(2).unwrap())));
    producer.connect("127.0.0.1", addr.port());

    wait_until(|| producer.ready_session_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(producer.ready_session_count(), 1);
    assert_eq!(consumer.ready_session_count(), 1);
}

#[tokio::test]
async fn version_mismatch_closes_cleanly_and_stops_the_dialer() {
    // Producer only speaks 1.0; the consumer only declares 2.0.
    let producer = Producer::new(EndpointConfig::default());
    let addr = producer.listen("127.0.0.1:0").await.unwrap();

    let broker = Arc::new(MemoryBroker::new());
    let consumer = Consumer::new(
        EndpointConfig {
            node_id: None,
            supported_versions: BTreeSet::from([ProtocolVersion::new(2, 0)]),
        },
        broker,
    );
    consumer.connect("127.0.0.1", addr.port());

    wait_until(|| consumer.session_count() == 0 && consumer.dialed_peers().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(consumer.session_count(), 0);
    assert_eq!(producer.session_count(), 0);
    assert!(consumer.dialed_peers().is_empty(), "clean close must not redial");
}

// ---------------------------------------------------------------------------
// Wire-level conformance against the producer listener
// ---------------------------------------------------------------------------

#[tokio::test]
async fn producer_echoes_the_chosen_version_and_its_node_id() {
    let node_id = NodeId::new(42).unwrap();
    let producer = Producer::new(EndpointConfig::with_node_id(Some(node_id)));
    let addr = producer.listen("127.0.0.1:0").await.unwrap();

    let mut peer = FramedPeer::connect(addr).await.unwrap();
    let reply = peer
        .declare_versions(&[ProtocolVersion::new(2, 0), ProtocolVersion::V1_0])
        .await;
    assert_eq!(
        reply,
        Some(Frame::VersionChosen {
            version: ProtocolVersion::V1_0,
            node_id: Some(node_id),
        })
    );
}

#[tokio::test]
async fn producer_closes_on_misdirected_frames() {
    let producer = Producer::new(EndpointConfig::default());
    let addr = producer.listen("127.0.0.1:0").await.unwrap();

    let mut peer = FramedPeer::connect(addr).await.unwrap();
    let reply = peer.declare_versions(&[ProtocolVersion::V1_0]).await;
    assert!(matches!(reply, Some(Frame::VersionChosen { .. })));
    // 301 is producer-to-consumer; sending it the other way must close.
    peer.send(&Frame::Publish {
        topic: "t".to_owned(),
        event: serde_json::json!(null),
    })
    .await;
    peer.expect_close().await;
    wait_until(|| producer.session_count() == 0).await;
}

#[tokio::test]
async fn peer_close_frame_evicts_the_session() {
    let producer = Producer::new(EndpointConfig::default());
    let addr = producer.listen("127.0.0.1:0").await.unwrap();

    let mut peer = FramedPeer::connect(addr).await.unwrap();
    let reply = peer.declare_versions(&[ProtocolVersion::V1_0]).await;
    assert!(matches!(reply, Some(Frame::VersionChosen { .. })));
    wait_until(|| producer.ready_session_count() == 1).await;

    peer.close().await;
    wait_until(|| producer.session_count() == 0).await;
}
