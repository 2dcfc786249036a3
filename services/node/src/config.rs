//! Node configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/pubsubclub/node.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `consumer.bind_port`
//!
//! Everything else has a default: the consumer binds all interfaces, the
//! producer starts with no seed peers, discovery is off unless the
//! `[discovery]` table names an agent URL and service.

use std::collections::BTreeSet;
use std::path::Path;

use psc_protocol::{NodeId, PeerAddr, ProtocolVersion, default_supported_versions};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub schema_version: u32,
    /// Identity for self-loop suppression; omit to disable.
    pub node_id: Option<NodeId>,
    pub supported_versions: BTreeSet<ProtocolVersion>,
    pub consumer: ConsumerConfig,
    pub producer: ProducerConfig,
    pub discovery: Option<DiscoveryConfig>,
    pub status_http: StatusHttpConfig,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub bind_interface: String,
    pub bind_port: u16,
    /// Topics to pre-subscribe one synthetic local client to. Useful for a
    /// leaf node that only tails the federation (e.g. smoke testing).
    pub topics: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Seed dial set, used with or without discovery.
    pub initial_peers: Vec<PeerAddr>,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub url: String,
    pub service: String,
}

#[derive(Debug, Clone)]
pub struct StatusHttpConfig {
    pub bind: String,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    node: Option<RawNodeSection>,
    federation: Option<RawFederationSection>,
    consumer: Option<RawConsumerSection>,
    producer: Option<RawProducerSection>,
    discovery: Option<RawDiscoverySection>,
    status_http: Option<RawStatusHttpSection>,
}

#[derive(Debug, Deserialize)]
struct RawNodeSection {
    node_id: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawFederationSection {
    supported_versions: Option<Vec<Vec<u16>>>,
}

#[derive(Debug, Deserialize)]
struct RawConsumerSection {
    bind_interface: Option<String>,
    bind_port: Option<u16>,
    topics: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawProducerSection {
    initial_peers: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawDiscoverySection {
    url: Option<String>,
    service: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStatusHttpSection {
    bind: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load node config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<NodeConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load node config from the default path `/etc/pubsubclub/node.toml`.
pub fn load_config() -> Result<NodeConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/pubsubclub/node.toml"))
}

/// Load node config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<NodeConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let node_id = match raw.node.and_then(|n| n.node_id) {
        Some(raw_id) => Some(NodeId::new(raw_id).ok_or_else(|| {
            ConfigError::InvalidValue(format!(
                "node.node_id must fit in 31 bits, got {}",
                raw_id
            ))
        })?),
        None => None,
    };

    let supported_versions = match raw.federation.and_then(|f| f.supported_versions) {
        Some(pairs) => {
            if pairs.is_empty() {
                return Err(ConfigError::InvalidValue(
                    "federation.supported_versions must not be empty".to_owned(),
                ));
            }
            let mut versions = BTreeSet::new();
            for pair in &pairs {
                let [major, minor] = pair.as_slice() else {
                    return Err(ConfigError::InvalidValue(format!(
                        "federation.supported_versions entries must be [major, minor], got {:?}",
                        pair
                    )));
                };
                versions.insert(ProtocolVersion::new(*major, *minor));
            }
            versions
        }
        None => default_supported_versions(),
    };

    let raw_consumer = raw
        .consumer
        .ok_or_else(|| ConfigError::MissingField("consumer".to_owned()))?;
    let consumer = ConsumerConfig {
        bind_interface: raw_consumer
            .bind_interface
            .unwrap_or_else(|| "0.0.0.0".to_owned()),
        bind_port: raw_consumer
            .bind_port
            .ok_or_else(|| ConfigError::MissingField("consumer.bind_port".to_owned()))?,
        topics: raw_consumer.topics.unwrap_or_default(),
    };

    let producer = ProducerConfig {
        initial_peers: raw
            .producer
            .and_then(|p| p.initial_peers)
            .unwrap_or_default()
            .iter()
            .map(|peer| {
                peer.parse::<PeerAddr>().map_err(|e| {
                    ConfigError::InvalidValue(format!("producer.initial_peers: {}", e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
    };

    let discovery = match raw.discovery {
        Some(d) => Some(DiscoveryConfig {
            url: d
                .url
                .ok_or_else(|| ConfigError::MissingField("discovery.url".to_owned()))?,
            service: d
                .service
                .ok_or_else(|| ConfigError::MissingField("discovery.service".to_owned()))?,
        }),
        None => None,
    };

    let status_http = StatusHttpConfig {
        bind: raw
            .status_http
            .and_then(|s| s.bind)
            .unwrap_or_else(|| "127.0.0.1:9611".to_owned()),
    };

    Ok(NodeConfig {
        schema_version,
        node_id,
        supported_versions,
        consumer,
        producer,
        discovery,
        status_http,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
