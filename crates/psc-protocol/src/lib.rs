// psc-protocol: PubSubClub wire protocol types and codec.
//
// Every frame is a JSON array whose first element is an integer action code
// and whose remaining elements are the positional parameters for that action.
// Frames travel as individual WebSocket text messages (UTF-8, no BOM, no
// batching).

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Action codes
// ---------------------------------------------------------------------------

/// Consumer -> Producer: the protocol versions the consumer implements.
pub const DECLARED_VERSIONS: u64 = 101;
/// Producer -> Consumer: the version selected for this session, plus the
/// producer's node id when one is configured.
pub const VERSION_CHOSEN: u64 = 102;
/// Consumer -> Producer: declare interest in a topic.
pub const SUBSCRIBE: u64 = 201;
/// Consumer -> Producer: withdraw interest in a topic.
pub const UNSUBSCRIBE: u64 = 202;
/// Producer -> Consumer: an event published on a topic.
pub const PUBLISH: u64 = 301;

// ---------------------------------------------------------------------------
// ProtocolVersion
// ---------------------------------------------------------------------------

/// A `(major, minor)` protocol version pair.
///
/// Ordering is lexicographic (major first), which is what version selection
/// relies on: the producer picks the smallest mutually supported version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const V1_0: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    pub fn new(major: u16, minor: u16) -> Self {
        ProtocolVersion { major, minor }
    }

    fn to_wire(self) -> Value {
        json!([self.major, self.minor])
    }

    fn from_wire(value: &Value) -> Result<Self, FrameError> {
        let pair = value.as_array().ok_or(FrameError::BadVersion)?;
        if pair.len() != 2 {
            return Err(FrameError::BadVersion);
        }
        let major = pair[0]
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or(FrameError::BadVersion)?;
        let minor = pair[1]
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or(FrameError::BadVersion)?;
        Ok(ProtocolVersion { major, minor })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// The version set this implementation speaks out of the box.
pub fn default_supported_versions() -> BTreeSet<ProtocolVersion> {
    BTreeSet::from([ProtocolVersion::V1_0])
}

/// Select the session version: the lexicographically smallest element of the
/// intersection between the peer's declared versions and ours, or `None` when
/// there is no mutual version (the session must then be closed).
pub fn negotiate(
    declared: &[ProtocolVersion],
    supported: &BTreeSet<ProtocolVersion>,
) -> Option<ProtocolVersion> {
    declared
        .iter()
        .filter(|v| supported.contains(v))
        .min()
        .copied()
}

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// A 31-bit non-negative node identity.
///
/// Nodes that advertise themselves to service discovery configure one so a
/// consumer can recognize and immediately close a session with its own
/// producer. Without a node id, self-loop suppression is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub const MAX: u32 = (1 << 31) - 1;

    /// Returns `None` when `raw` does not fit in 31 bits.
    pub fn new(raw: u32) -> Option<Self> {
        (raw <= Self::MAX).then_some(NodeId(raw))
    }

    /// Sample a fresh id uniformly from the valid range.
    pub fn generate() -> Self {
        NodeId(rand::thread_rng().gen_range(0..=Self::MAX))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// PeerAddr
// ---------------------------------------------------------------------------

/// A `(host, port)` federation peer address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        PeerAddr {
            host: host.into(),
            port,
        }
    }

    /// The WebSocket URL used to dial this peer.
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/", self.host, self.port)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid peer address '{0}' (expected HOST:PORT)")]
pub struct PeerAddrParseError(String);

impl FromStr for PeerAddr {
    type Err = PeerAddrParseError;

    /// Parse `HOST:PORT`, splitting on the last colon so IPv6-style hosts
    /// with embedded colons still work.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| PeerAddrParseError(s.to_owned()))?;
        if host.is_empty() {
            return Err(PeerAddrParseError(s.to_owned()));
        }
        let port: u16 = port.parse().map_err(|_| PeerAddrParseError(s.to_owned()))?;
        Ok(PeerAddr::new(host, port))
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One protocol frame, ready to encode to (or decoded from) a transport text
/// message. The `Publish` event payload is opaque: it is carried, never
/// inspected.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    DeclaredVersions(Vec<ProtocolVersion>),
    VersionChosen {
        version: ProtocolVersion,
        node_id: Option<NodeId>,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        event: Value,
    },
}

/// Why a payload failed to decode. Any decode failure requires the receiving
/// session to close.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON array")]
    NotAnArray,
    #[error("frame has no action code")]
    Empty,
    #[error("action code is not an integer")]
    NonIntegerAction,
    #[error("unknown action code {0}")]
    UnknownAction(u64),
    #[error("action {action} expects {expected}, got {got} parameter(s)")]
    Arity {
        action: u64,
        expected: &'static str,
        got: usize,
    },
    #[error("malformed version pair (expected [major, minor])")]
    BadVersion,
    #[error("topic is not a string")]
    BadTopic,
    #[error("node id is not a 31-bit non-negative integer")]
    BadNodeId,
}

impl Frame {
    /// Encode to the JSON text carried in one transport message.
    pub fn encode(&self) -> String {
        let value = match self {
            Frame::DeclaredVersions(versions) => {
                let mut items = Vec::with_capacity(versions.len() + 1);
                items.push(json!(DECLARED_VERSIONS));
                items.extend(versions.iter().map(|v| v.to_wire()));
                Value::Array(items)
            }
            Frame::VersionChosen { version, node_id } => {
                let mut items = vec![json!(VERSION_CHOSEN), version.to_wire()];
                if let Some(id) = node_id {
                    items.push(json!(id.get()));
                }
                Value::Array(items)
            }
            Frame::Subscribe { topic } => json!([SUBSCRIBE, topic]),
            Frame::Unsubscribe { topic } => json!([UNSUBSCRIBE, topic]),
            Frame::Publish { topic, event } => json!([PUBLISH, topic, event]),
        };
        value.to_string()
    }

    /// Decode one transport text message.
    pub fn decode(text: &str) -> Result<Frame, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Array(items) = value else {
            return Err(FrameError::NotAnArray);
        };
        let (action, params) = items.split_first().ok_or(FrameError::Empty)?;
        let action = action.as_u64().ok_or(FrameError::NonIntegerAction)?;

        match action {
            DECLARED_VERSIONS => {
                if params.is_empty() {
                    return Err(FrameError::Arity {
                        action,
                        expected: "one or more version pairs",
                        got: 0,
                    });
                }
                let versions = params
                    .iter()
                    .map(ProtocolVersion::from_wire)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Frame::DeclaredVersions(versions))
            }
            VERSION_CHOSEN => match params {
                [version] => Ok(Frame::VersionChosen {
                    version: ProtocolVersion::from_wire(version)?,
                    node_id: None,
                }),
                [version, node_id] => {
                    let raw = node_id
                        .as_u64()
                        .and_then(|n| u32::try_from(n).ok())
                        .ok_or(FrameError::BadNodeId)?;
                    Ok(Frame::VersionChosen {
                        version: ProtocolVersion::from_wire(version)?,
                        node_id: Some(NodeId::new(raw).ok_or(FrameError::BadNodeId)?),
                    })
                }
                _ => Err(FrameError::Arity {
                    action,
                    expected: "a version pair and an optional node id",
                    got: params.len(),
                }),
            },
            SUBSCRIBE | UNSUBSCRIBE => {
                let [topic] = params else {
                    return Err(FrameError::Arity {
                        action,
                        expected: "a topic",
                        got: params.len(),
                    });
                };
                let topic = topic.as_str().ok_or(FrameError::BadTopic)?.to_owned();
                if action == SUBSCRIBE {
                    Ok(Frame::Subscribe { topic })
                } else {
                    Ok(Frame::Unsubscribe { topic })
                }
            }
            PUBLISH => {
                let [topic, event] = params else {
                    return Err(FrameError::Arity {
                        action,
                        expected: "a topic and an event",
                        got: params.len(),
                    });
                };
                let topic = topic.as_str().ok_or(FrameError::BadTopic)?.to_owned();
                Ok(Frame::Publish {
                    topic,
                    event: event.clone(),
                })
            }
            other => Err(FrameError::UnknownAction(other)),
        }
    }
}
