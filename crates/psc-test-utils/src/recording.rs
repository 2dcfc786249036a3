// recording: A PeerControl that records what discovery asks for.

use std::collections::BTreeSet;
use std::sync::Mutex;

use psc_federation::PeerControl;
use psc_protocol::PeerAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCall {
    Connect(PeerAddr),
    Disconnect(PeerAddr),
}

/// Records every connect/disconnect and tracks the resulting dial set.
#[derive(Default)]
pub struct RecordingControl {
    dialed: Mutex<BTreeSet<PeerAddr>>,
    history: Mutex<Vec<ControlCall>>,
}

impl RecordingControl {
    pub fn new() -> Self {
        RecordingControl::default()
    }

    /// The addresses currently "connected" (connects minus disconnects).
    pub fn dial_set(&self) -> BTreeSet<PeerAddr> {
        self.dialed.lock().unwrap().clone()
    }

    /// Every call in arrival order.
    pub fn history(&self) -> Vec<ControlCall> {
        self.history.lock().unwrap().clone()
    }
}

impl PeerControl for RecordingControl {
    fn connect(&self, host: &str, port: u16) {
        let addr = PeerAddr::new(host, port);
        self.dialed.lock().unwrap().insert(addr.clone());
        self.history.lock().unwrap().push(ControlCall::Connect(addr));
    }

    fn disconnect(&self, host: &str, port: u16) {
        let addr = PeerAddr::new(host, port);
        self.dialed.lock().unwrap().remove(&addr);
        self.history
            .lock()
            .unwrap()
            .push(ControlCall::Disconnect(addr));
    }
}
