//! The consumer endpoint: declares the node's local interest to peer
//! producers and injects received events into the local broker.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use psc_protocol::{Frame, NodeId, PeerAddr, ProtocolVersion};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::dialer::DialerSet;
use crate::session::{ConsumerPeer, SessionEnd, run_consumer_session};
use crate::{EndpointConfig, PeerControl};

/// A consumer endpoint. Cheap to clone; all clones share the session
/// registry, broker handle, and dialer set.
#[derive(Clone)]
pub struct Consumer {
    shared: Arc<ConsumerShared>,
}

struct ConsumerShared {
    node_id: Option<NodeId>,
    supported: BTreeSet<ProtocolVersion>,
    broker: Arc<dyn Broker>,
    sessions: RwLock<HashMap<Uuid, Arc<ConsumerPeer>>>,
    dialers: DialerSet,
    shutdown: watch::Sender<bool>,
}

impl Consumer {
    pub fn new(config: EndpointConfig, broker: Arc<dyn Broker>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Consumer {
            shared: Arc::new(ConsumerShared {
                node_id: config.node_id,
                supported: config.supported_versions,
                broker,
                sessions: RwLock::new(HashMap::new()),
                dialers: DialerSet::new(),
                shutdown,
            }),
        }
    }

    /// Accept inbound producer connections on `bind`. Returns the bound
    /// address.
    pub async fn listen(&self, bind: &str) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "consumer listening");
        let shared = Arc::clone(&self.shared);
        tokio::spawn(accept_loop(listener, shared));
        Ok(addr)
    }

    /// Declare interest in `topic` on every ready session.
    ///
    /// Call on the broker's 0->1 subscriber transition. With no ready
    /// sessions this is a no-op: handshake replay will carry the current
    /// interest set to any session that comes up later.
    pub async fn subscribe(&self, topic: &str) {
        self.fan_out(Frame::Subscribe {
            topic: topic.to_owned(),
        })
        .await;
    }

    /// Withdraw interest in `topic` on every ready session.
    pub async fn unsubscribe(&self, topic: &str) {
        self.fan_out(Frame::Unsubscribe {
            topic: topic.to_owned(),
        })
        .await;
    }

    /// Edge trigger: a local client subscribed. Declares interest to peers
    /// only on the first local subscriber.
    pub async fn on_client_subscribed(&self, topic: &str) {
        if self.shared.broker.subscriber_count(topic) == 1 {
            debug!(%topic, "first local subscriber, declaring interest");
            self.subscribe(topic).await;
        } else {
            debug!(%topic, "interest already declared");
        }
    }

    /// Edge trigger: a local client unsubscribed. Withdraws interest only
    /// when no local subscriber remains (the broker has dropped the topic).
    pub async fn on_client_unsubscribed(&self, topic: &str) {
        if self.shared.broker.subscriber_count(topic) == 0 {
            debug!(%topic, "last local subscriber gone, withdrawing interest");
            self.unsubscribe(topic).await;
        } else {
            debug!(%topic, "local subscribers remain");
        }
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.read().unwrap().len()
    }

    pub fn ready_session_count(&self) -> usize {
        self.shared
            .sessions
            .read()
            .unwrap()
            .values()
            .filter(|peer| peer.is_ready())
            .count()
    }

    pub fn dialed_peers(&self) -> Vec<PeerAddr> {
        self.shared.dialers.active()
    }

    pub fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);
        self.shared.dialers.shutdown();
    }

    async fn fan_out(&self, frame: Frame) {
        let message = Message::Text(frame.encode().into());
        let targets: Vec<Arc<ConsumerPeer>> = {
            let sessions = self.shared.sessions.read().unwrap();
            sessions
                .values()
                .filter(|peer| peer.is_ready())
                .cloned()
                .collect()
        };
        if targets.is_empty() {
            debug!("no ready sessions; replay will carry the interest set");
            return;
        }
        for peer in targets {
            if !peer.enqueue(message.clone()).await {
                debug!(session = %peer.id, "fan-out skipped, session closing");
            }
        }
    }
}

impl PeerControl for Consumer {
    fn connect(&self, host: &str, port: u16) {
        let addr = PeerAddr::new(host, port);
        let shared = Arc::clone(&self.shared);
        self.shared
            .dialers
            .connect(addr, move |ws, cancel| Arc::clone(&shared).run_session(ws, cancel));
    }

    fn disconnect(&self, host: &str, port: u16) {
        self.shared.dialers.disconnect(&PeerAddr::new(host, port));
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<ConsumerShared>) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        let cancel = shared.shutdown.subscribe();
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws) => {
                                shared.run_session(ws, cancel).await;
                            }
                            Err(e) => warn!(%remote, error = %e, "websocket handshake failed"),
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            },
        }
    }
}

impl ConsumerShared {
    async fn run_session<S>(self: Arc<Self>, ws: S, cancel: watch::Receiver<bool>) -> SessionEnd
    where
        S: futures_util::Stream<Item = Result<Message, WsError>>
            + futures_util::Sink<Message, Error = WsError>
            + Unpin
            + Send,
    {
        let (tx, rx) = mpsc::channel(64);
        let peer = Arc::new(ConsumerPeer::new(tx));
        self.sessions
            .write()
            .unwrap()
            .insert(peer.id, Arc::clone(&peer));
        debug!(session = %peer.id, "consumer session open");
        let end = run_consumer_session(
            ws,
            Arc::clone(&peer),
            rx,
            Arc::clone(&self.broker),
            self.supported.clone(),
            self.node_id,
            cancel,
        )
        .await;
        self.sessions.write().unwrap().remove(&peer.id);
        debug!(session = %peer.id, ?end, "consumer session closed");
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use futures_util::{SinkExt, StreamExt};
    use std::sync::Mutex;
    use std::time::Duration;

    /// A bare-bones producer peer: answers the handshake and records every
    /// frame it receives afterwards.
    async fn recording_producer() -> (SocketAddr, Arc<Mutex<Vec<Frame>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&frames);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(raw) => {
                        let frame = Frame::decode(&raw).unwrap();
                        if matches!(frame, Frame::DeclaredVersions(_)) {
                            let reply = Frame::VersionChosen {
                                version: ProtocolVersion::V1_0,
                                node_id: None,
                            };
                            ws.send(Message::Text(reply.encode().into())).await.unwrap();
                        } else {
                            recorded.lock().unwrap().push(frame);
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });
        (addr, frames)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    fn subscribes_for(frames: &[Frame], topic: &str) -> usize {
        frames
            .iter()
            .filter(|f| matches!(f, Frame::Subscribe { topic: t } if t == topic))
            .count()
    }

    fn unsubscribes_for(frames: &[Frame], topic: &str) -> usize {
        frames
            .iter()
            .filter(|f| matches!(f, Frame::Unsubscribe { topic: t } if t == topic))
            .count()
    }

    #[tokio::test]
    async fn edge_triggers_fire_exactly_on_count_transitions() {
        let (addr, frames) = recording_producer().await;
        let broker = Arc::new(MemoryBroker::new());
        let consumer = Consumer::new(EndpointConfig::default(), broker.clone());
        consumer.connect("127.0.0.1", addr.port());
        wait_until(|| consumer.ready_session_count() == 1).await;

        // 0 -> 1: declare.
        broker.client_subscribe("t");
        consumer.on_client_subscribed("t").await;
        wait_until(|| subscribes_for(&frames.lock().unwrap(), "t") == 1).await;

        // 1 -> 2: already declared, nothing new on the wire.
        broker.client_subscribe("t");
        consumer.on_client_subscribed("t").await;

        // 2 -> 1: subscribers remain, nothing on the wire.
        broker.client_unsubscribe("t");
        consumer.on_client_unsubscribed("t").await;

        // 1 -> 0: withdraw.
        broker.client_unsubscribe("t");
        consumer.on_client_unsubscribed("t").await;
        wait_until(|| unsubscribes_for(&frames.lock().unwrap(), "t") == 1).await;

        let frames = frames.lock().unwrap();
        assert_eq!(subscribes_for(&frames, "t"), 1, "one Subscribe per 0->1");
        assert_eq!(unsubscribes_for(&frames, "t"), 1, "one Unsubscribe per 1->0");
    }

    #[tokio::test]
    async fn subscribe_without_ready_sessions_is_a_noop() {
        let broker = Arc::new(MemoryBroker::new());
        let consumer = Consumer::new(EndpointConfig::default(), broker);
        consumer.subscribe("t").await;
        consumer.unsubscribe("t").await;
        assert_eq!(consumer.session_count(), 0);
    }
}
