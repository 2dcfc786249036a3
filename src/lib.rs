// pubsubclub: facade over the workspace crates.
//
// Most embedders want exactly this surface: build a Producer and a Consumer
// around their broker, seed or discover peers, and publish.

pub use psc_discovery::{ConsulDiscovery, Debouncer, DiscoveryConfig};
pub use psc_federation::{
    Broker, Consumer, DispatchError, EndpointConfig, MemoryBroker, PeerControl, Producer,
    SessionEnd,
};
pub use psc_protocol::{
    Frame, FrameError, NodeId, PeerAddr, ProtocolVersion, default_supported_versions,
};
