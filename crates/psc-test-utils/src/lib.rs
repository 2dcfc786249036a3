// psc-test-utils: Shared test doubles for the federation suites.
//
// Provides a mock discovery agent (Consul-compatible HTTP surface with
// long-poll blocking), a frame-level WebSocket peer for protocol-conformance
// tests, and a recording PeerControl for discovery reconciliation tests.

pub mod framed_peer;
pub mod mock_agent;
pub mod recording;

pub use framed_peer::FramedPeer;
pub use mock_agent::{MockAgent, ServiceInstance};
pub use recording::{ControlCall, RecordingControl};
