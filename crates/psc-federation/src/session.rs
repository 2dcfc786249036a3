//! The per-connection protocol state machine.
//!
//! Both endpoints run the same machine; the role selects which transitions
//! fire. A session task owns its WebSocket exclusively: every read, write,
//! and timer for one connection happens inside its select loop, so the
//! bookkeeping on the session handle needs no further coordination.
//!
//! Producer side: waits for the consumer's version declaration, answers with
//! the chosen version (and the local node id, when configured), then tracks
//! the peer's Subscribe/Unsubscribe set and writes whatever the endpoint
//! fan-out enqueues.
//!
//! Consumer side: declares its versions on open, and on the producer's
//! choice replays every locally-subscribed topic, then starts the pinger.
//! Inbound Publish frames go to the local broker.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use psc_protocol::{Frame, NodeId, ProtocolVersion, negotiate};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::{CloseFrame, coding::CloseCode};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::Broker;

/// How a session ended. The dialer redials only after an `Unclean` end:
/// a clean close is how version mismatch, self-loop suppression, and
/// discovery-driven disconnects take permanent effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Clean,
    Unclean,
}

// ---------------------------------------------------------------------------
// Session handles
// ---------------------------------------------------------------------------

/// Shared state for one producer-side session, owned by the endpoint
/// registry while the session task runs.
pub struct ProducerPeer {
    pub id: Uuid,
    outbound: mpsc::Sender<Message>,
    ready: AtomicBool,
    /// Topics this peer has declared interest in.
    subscriptions: RwLock<HashSet<String>>,
}

impl ProducerPeer {
    pub(crate) fn new(outbound: mpsc::Sender<Message>) -> Self {
        ProducerPeer {
            id: Uuid::new_v4(),
            outbound,
            ready: AtomicBool::new(false),
            subscriptions: RwLock::new(HashSet::new()),
        }
    }

    /// True once the version handshake has completed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.read().unwrap().contains(topic)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.read().unwrap().iter().cloned().collect()
    }

    fn add_subscription(&self, topic: String) {
        self.subscriptions.write().unwrap().insert(topic);
    }

    fn remove_subscription(&self, topic: &str) {
        self.subscriptions.write().unwrap().remove(topic);
    }

    /// Hand a frame to the session task for writing. `false` means the
    /// session is already gone.
    pub(crate) async fn enqueue(&self, message: Message) -> bool {
        self.outbound.send(message).await.is_ok()
    }
}

/// Shared state for one consumer-side session.
pub struct ConsumerPeer {
    pub id: Uuid,
    outbound: mpsc::Sender<Message>,
    ready: AtomicBool,
}

impl ConsumerPeer {
    pub(crate) fn new(outbound: mpsc::Sender<Message>) -> Self {
        ConsumerPeer {
            id: Uuid::new_v4(),
            outbound,
            ready: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub(crate) async fn enqueue(&self, message: Message) -> bool {
        self.outbound.send(message).await.is_ok()
    }
}

// ---------------------------------------------------------------------------
// Close frames
// ---------------------------------------------------------------------------

fn text(frame: &Frame) -> Message {
    Message::Text(frame.encode().into())
}

fn normal_close(reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: reason.into(),
    }))
}

fn protocol_close(reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Protocol,
        reason: reason.into(),
    }))
}

fn ping_interval() -> Duration {
    // Uniform jitter de-correlates pings across peers; the exact
    // distribution is not load-bearing.
    Duration::from_secs_f64(rand::thread_rng().gen_range(3.0..7.0))
}

// ---------------------------------------------------------------------------
// Producer session loop
// ---------------------------------------------------------------------------

pub(crate) async fn run_producer_session<S>(
    mut ws: S,
    peer: Arc<ProducerPeer>,
    mut outbound: mpsc::Receiver<Message>,
    supported: BTreeSet<ProtocolVersion>,
    node_id: Option<NodeId>,
    mut cancel: watch::Receiver<bool>,
) -> SessionEnd
where
    S: futures_util::Stream<Item = Result<Message, WsError>>
        + futures_util::Sink<Message, Error = WsError>
        + Unpin,
{
    loop {
        tokio::select! {
            biased;
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    let _ = ws.send(normal_close("disconnect requested")).await;
                    return SessionEnd::Clean;
                }
            }
            msg = ws.next() => match msg {
                None => return SessionEnd::Unclean,
                Some(Err(e)) => {
                    warn!(session = %peer.id, error = %e, "transport error");
                    return SessionEnd::Unclean;
                }
                Some(Ok(Message::Text(raw))) => match Frame::decode(&raw) {
                    Ok(Frame::DeclaredVersions(versions)) if !peer.is_ready() => {
                        match negotiate(&versions, &supported) {
                            Some(version) => {
                                let reply = Frame::VersionChosen { version, node_id };
                                if ws.send(text(&reply)).await.is_err() {
                                    return SessionEnd::Unclean;
                                }
                                peer.mark_ready();
                                info!(session = %peer.id, %version, "producer session ready");
                            }
                            None => {
                                info!(session = %peer.id, "no mutually supported version, closing");
                                let _ = ws
                                    .send(normal_close("no mutually supported protocol version"))
                                    .await;
                                return SessionEnd::Clean;
                            }
                        }
                    }
                    Ok(Frame::Subscribe { topic }) if peer.is_ready() => {
                        debug!(session = %peer.id, %topic, "peer subscribed");
                        peer.add_subscription(topic);
                    }
                    Ok(Frame::Unsubscribe { topic }) if peer.is_ready() => {
                        // Must tolerate topics this session never saw a
                        // Subscribe for: the peer may be replaying state
                        // from before a reconnect.
                        debug!(session = %peer.id, %topic, "peer unsubscribed");
                        peer.remove_subscription(&topic);
                    }
                    Ok(frame) => {
                        warn!(session = %peer.id, ?frame, "frame not valid here, closing");
                        let _ = ws.send(protocol_close("unexpected frame")).await;
                        return SessionEnd::Clean;
                    }
                    Err(e) => {
                        warn!(session = %peer.id, error = %e, "closing on malformed frame");
                        let _ = ws.send(protocol_close("malformed frame")).await;
                        return SessionEnd::Clean;
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(session = %peer.id, "peer closed");
                    return SessionEnd::Clean;
                }
                Some(Ok(_)) => {}
            },
            Some(message) = outbound.recv() => {
                if ws.send(message).await.is_err() {
                    return SessionEnd::Unclean;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Consumer session loop
// ---------------------------------------------------------------------------

pub(crate) async fn run_consumer_session<S>(
    mut ws: S,
    peer: Arc<ConsumerPeer>,
    mut outbound: mpsc::Receiver<Message>,
    broker: Arc<dyn Broker>,
    supported: BTreeSet<ProtocolVersion>,
    node_id: Option<NodeId>,
    mut cancel: watch::Receiver<bool>,
) -> SessionEnd
where
    S: futures_util::Stream<Item = Result<Message, WsError>>
        + futures_util::Sink<Message, Error = WsError>
        + Unpin,
{
    let declare = Frame::DeclaredVersions(supported.iter().copied().collect());
    if ws.send(text(&declare)).await.is_err() {
        return SessionEnd::Unclean;
    }

    let mut pong_outstanding = false;
    let ping_timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(ping_timer);

    loop {
        tokio::select! {
            biased;
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    let _ = ws.send(normal_close("disconnect requested")).await;
                    return SessionEnd::Clean;
                }
            }
            msg = ws.next() => match msg {
                None => return SessionEnd::Unclean,
                Some(Err(e)) => {
                    warn!(session = %peer.id, error = %e, "transport error");
                    return SessionEnd::Unclean;
                }
                Some(Ok(Message::Text(raw))) => match Frame::decode(&raw) {
                    Ok(Frame::VersionChosen { version, node_id: remote }) if !peer.is_ready() => {
                        if node_id.is_some() && node_id == remote {
                            info!(session = %peer.id, "connected to own producer, closing");
                            let _ = ws.send(normal_close("self connection")).await;
                            return SessionEnd::Clean;
                        }
                        peer.mark_ready();
                        info!(session = %peer.id, %version, "consumer session ready");
                        // Replay the full local interest set so a fresh (or
                        // reconnected) producer needs no external state.
                        for topic in broker.subscribed_topics() {
                            if ws.send(text(&Frame::Subscribe { topic })).await.is_err() {
                                return SessionEnd::Unclean;
                            }
                        }
                        pong_outstanding = false;
                        ping_timer.as_mut().reset(Instant::now() + ping_interval());
                    }
                    Ok(Frame::Publish { topic, event }) if peer.is_ready() => {
                        if let Err(e) = broker.dispatch(&topic, &event) {
                            // One bad local handler must not take the
                            // federation link down.
                            warn!(session = %peer.id, %topic, error = %e, "local dispatch failed");
                        }
                    }
                    Ok(frame) => {
                        warn!(session = %peer.id, ?frame, "frame not valid here, closing");
                        let _ = ws.send(protocol_close("unexpected frame")).await;
                        return SessionEnd::Clean;
                    }
                    Err(e) => {
                        warn!(session = %peer.id, error = %e, "closing on malformed frame");
                        let _ = ws.send(protocol_close("malformed frame")).await;
                        return SessionEnd::Clean;
                    }
                },
                Some(Ok(Message::Pong(_))) => {
                    pong_outstanding = false;
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(session = %peer.id, "peer closed");
                    return SessionEnd::Clean;
                }
                Some(Ok(_)) => {}
            },
            Some(message) = outbound.recv() => {
                if ws.send(message).await.is_err() {
                    return SessionEnd::Unclean;
                }
            }
            () = &mut ping_timer, if peer.is_ready() => {
                if pong_outstanding {
                    warn!(session = %peer.id, "no pong since last ping, dropping connection");
                    return SessionEnd::Unclean;
                }
                pong_outstanding = true;
                if ws.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return SessionEnd::Unclean;
                }
                ping_timer.as_mut().reset(Instant::now() + ping_interval());
            }
        }
    }
}
