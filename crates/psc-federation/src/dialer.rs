//! Persistent outbound connections.
//!
//! Each dialed peer gets one dial loop: connect, run the session, and on an
//! unclean end (or a failed connect) retry with capped exponential backoff.
//! A clean close stops the loop for good; that is how self-loop
//! suppression, version mismatch, and discovery-driven disconnects take
//! permanent effect.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use psc_protocol::PeerAddr;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::SessionEnd;

pub(crate) type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

struct DialerHandle {
    token: Uuid,
    cancel: watch::Sender<bool>,
}

/// The set of live dial loops for one endpoint, keyed by peer address.
pub(crate) struct DialerSet {
    inner: Arc<Mutex<HashMap<PeerAddr, DialerHandle>>>,
}

impl DialerSet {
    pub fn new() -> Self {
        DialerSet {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start dialing `addr`, running `run` over each established connection.
    /// A no-op while a dialer for the same address is alive.
    pub fn connect<F, Fut>(&self, addr: PeerAddr, run: F)
    where
        F: Fn(ClientWs, watch::Receiver<bool>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SessionEnd> + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(&addr) {
            debug!(peer = %addr, "already dialing, ignoring connect");
            return;
        }
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let token = Uuid::new_v4();
        inner.insert(addr.clone(), DialerHandle { token, cancel: cancel_tx });
        let registry = Arc::clone(&self.inner);
        tokio::spawn(dial_loop(addr, token, run, cancel_rx, registry));
    }

    /// Close the session for `addr` cleanly (if one is up) and stop its dial
    /// loop. A no-op for addresses not currently dialed.
    pub fn disconnect(&self, addr: &PeerAddr) {
        if let Some(handle) = self.inner.lock().unwrap().remove(addr) {
            info!(peer = %addr, "disconnect requested");
            let _ = handle.cancel.send(true);
        }
    }

    /// Addresses currently being dialed (connected or backing off).
    pub fn active(&self) -> Vec<PeerAddr> {
        self.inner.lock().unwrap().keys().cloned().collect()
    }

    /// Cancel every dial loop.
    pub fn shutdown(&self) {
        for (_, handle) in self.inner.lock().unwrap().drain() {
            let _ = handle.cancel.send(true);
        }
    }
}

async fn dial_loop<F, Fut>(
    addr: PeerAddr,
    token: Uuid,
    run: F,
    mut cancel: watch::Receiver<bool>,
    registry: Arc<Mutex<HashMap<PeerAddr, DialerHandle>>>,
) where
    F: Fn(ClientWs, watch::Receiver<bool>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SessionEnd> + Send + 'static,
{
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if *cancel.borrow() {
            break;
        }
        match tokio_tungstenite::connect_async(addr.ws_url()).await {
            Ok((ws, _response)) => {
                backoff = INITIAL_BACKOFF;
                info!(peer = %addr, "connected");
                match run(ws, cancel.clone()).await {
                    SessionEnd::Clean => {
                        info!(peer = %addr, "session ended cleanly, not redialing");
                        break;
                    }
                    SessionEnd::Unclean => {
                        warn!(peer = %addr, "session lost, redialing");
                    }
                }
            }
            Err(e) => {
                warn!(peer = %addr, error = %e, backoff = ?backoff, "connect failed");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    // Drop our registry entry unless a newer dialer already replaced it.
    let mut registry = registry.lock().unwrap();
    if registry.get(&addr).is_some_and(|h| h.token == token) {
        registry.remove(&addr);
    }
}
