// psc-federation: producer/consumer federation endpoints.
//
// A node instantiates a Producer (forwards locally-published events to
// interested peers) and/or a Consumer (declares the node's local interest to
// peers and injects received events into the local broker). Either endpoint
// can listen for inbound connections or dial out; once a session is open the
// protocol state machine is the same regardless of which party dialed.

use std::collections::BTreeSet;

use psc_protocol::{NodeId, ProtocolVersion, default_supported_versions};

pub mod broker;
pub mod consumer;
mod dialer;
pub mod producer;
pub mod session;

pub use broker::{Broker, DispatchError, MemoryBroker};
pub use consumer::Consumer;
pub use producer::Producer;
pub use session::SessionEnd;

/// Shared endpoint configuration.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Identity advertised during the handshake so a consumer can recognize
    /// a session with its own producer. `None` disables self-loop
    /// suppression.
    pub node_id: Option<NodeId>,
    /// Protocol versions this endpoint speaks.
    pub supported_versions: BTreeSet<ProtocolVersion>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            node_id: None,
            supported_versions: default_supported_versions(),
        }
    }
}

impl EndpointConfig {
    pub fn with_node_id(node_id: Option<NodeId>) -> Self {
        EndpointConfig {
            node_id,
            ..EndpointConfig::default()
        }
    }
}

/// The dialing surface an endpoint exposes to whatever decides which peers
/// to hold connections with: a static seed list or the discovery driver.
///
/// `connect` is idempotent while a dialer for the address is alive;
/// `disconnect` closes cleanly and suppresses further redialing.
pub trait PeerControl: Send + Sync + 'static {
    fn connect(&self, host: &str, port: u16);
    fn disconnect(&self, host: &str, port: u16);
}
