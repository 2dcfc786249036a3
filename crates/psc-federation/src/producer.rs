//! The producer endpoint: forwards locally-published events to every peer
//! consumer that declared interest.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use psc_protocol::{Frame, NodeId, PeerAddr, ProtocolVersion};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dialer::DialerSet;
use crate::session::{ProducerPeer, SessionEnd, run_producer_session};
use crate::{EndpointConfig, PeerControl};

/// A producer endpoint. Cheap to clone; all clones share the session
/// registry and dialer set.
#[derive(Clone)]
pub struct Producer {
    shared: Arc<ProducerShared>,
}

struct ProducerShared {
    node_id: Option<NodeId>,
    supported: BTreeSet<ProtocolVersion>,
    sessions: RwLock<HashMap<Uuid, Arc<ProducerPeer>>>,
    dialers: DialerSet,
    shutdown: watch::Sender<bool>,
}

impl Producer {
    pub fn new(config: EndpointConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Producer {
            shared: Arc::new(ProducerShared {
                node_id: config.node_id,
                supported: config.supported_versions,
                sessions: RwLock::new(HashMap::new()),
                dialers: DialerSet::new(),
                shutdown,
            }),
        }
    }

    /// Accept inbound consumer connections on `bind` (e.g. `"0.0.0.0:19001"`;
    /// port 0 binds an ephemeral port). Returns the bound address.
    pub async fn listen(&self, bind: &str) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "producer listening");
        let shared = Arc::clone(&self.shared);
        tokio::spawn(accept_loop(listener, shared));
        Ok(addr)
    }

    /// Distribute an event to every ready session subscribed to `topic`.
    ///
    /// Best-effort: a session that cannot accept the frame is already on
    /// its way out and is skipped.
    pub async fn publish(&self, topic: &str, event: &Value) {
        let frame = Frame::Publish {
            topic: topic.to_owned(),
            event: event.clone(),
        };
        let message = Message::Text(frame.encode().into());
        let targets: Vec<Arc<ProducerPeer>> = {
            let sessions = self.shared.sessions.read().unwrap();
            sessions
                .values()
                .filter(|peer| peer.is_ready() && peer.is_subscribed(topic))
                .cloned()
                .collect()
        };
        debug!(%topic, sessions = targets.len(), "publishing");
        for peer in targets {
            if !peer.enqueue(message.clone()).await {
                debug!(session = %peer.id, "publish skipped, session closing");
            }
        }
    }

    /// Number of open sessions (ready or not).
    pub fn session_count(&self) -> usize {
        self.shared.sessions.read().unwrap().len()
    }

    /// Number of ready sessions whose peer has declared interest in `topic`.
    pub fn sessions_subscribed_to(&self, topic: &str) -> usize {
        self.shared
            .sessions
            .read()
            .unwrap()
            .values()
            .filter(|peer| peer.is_ready() && peer.is_subscribed(topic))
            .count()
    }

    /// Number of sessions past the version handshake.
    pub fn ready_session_count(&self) -> usize {
        self.shared
            .sessions
            .read()
            .unwrap()
            .values()
            .filter(|peer| peer.is_ready())
            .count()
    }

    /// Peers currently dialed (connected or backing off).
    pub fn dialed_peers(&self) -> Vec<PeerAddr> {
        self.shared.dialers.active()
    }

    /// Stop the listener, every dial loop, and every open session.
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);
        self.shared.dialers.shutdown();
    }
}

impl PeerControl for Producer {
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

async fn accept_loop(listener: TcpListener, shared: Arc<ProducerShared>) {
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

impl ProducerShared {
    /// Register a session, drive it to completion, evict it.
    async fn run_session<S>(self: Arc<Self>, ws: S, cancel: watch::Receiver<bool>) -> SessionEnd
    where
        S: futures_util::Stream<Item = Result<Message, WsError>>
            + futures_util::Sink<Message, Error = WsError>
            + Unpin
            + Send,
    {
        let (tx, rx) = mpsc::channel(64);
        let peer = Arc::new(ProducerPeer::new(tx));
        self.sessions
            .write()
            .unwrap()
            .insert(peer.id, Arc::clone(&peer));
        debug!(session = %peer.id, "producer session open");
        let end = run_producer_session(
            ws,
            Arc::clone(&peer),
            rx,
            self.supported.clone(),
            self.node_id,
            cancel,
        )
        .await;
        self.sessions.write().unwrap().remove(&peer.id);
        debug!(session = %peer.id, ?end, "producer session closed");
        end
    }
}
