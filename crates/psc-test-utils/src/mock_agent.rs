// mock_agent: A mock Consul-compatible agent for discovery tests.
//
// Serves GET /v1/agent/self and GET /v1/health/service/{name}, honours
// index/wait long-poll blocking, and stamps X-Consul-Index on every health
// response. Each test spins up its own instance on a random port and drives
// the fleet through `set_fleet`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{RwLock, watch};

/// One advertised service instance.
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub node: String,
    pub address: String,
    pub port: u16,
}

impl ServiceInstance {
    pub fn new(node: &str, address: &str, port: u16) -> Self {
        ServiceInstance {
            node: node.to_owned(),
            address: address.to_owned(),
            port,
        }
    }
}

#[derive(Clone)]
struct AgentState {
    self_name: String,
    fleet: Arc<RwLock<Vec<ServiceInstance>>>,
    /// Current index; bumped on every fleet change. Long-poll handlers wait
    /// on this channel.
    index: Arc<watch::Sender<u64>>,
}

pub struct MockAgent {
    addr: SocketAddr,
    fleet: Arc<RwLock<Vec<ServiceInstance>>>,
    index: Arc<watch::Sender<u64>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockAgent {
    /// Start the agent on a random port, reporting `self_name` as the local
    /// member name.
    pub async fn start(self_name: &str) -> std::io::Result<Self> {
        let fleet = Arc::new(RwLock::new(Vec::new()));
        let (index_tx, _) = watch::channel(1u64);
        let index = Arc::new(index_tx);

        let state = AgentState {
            self_name: self_name.to_owned(),
            fleet: Arc::clone(&fleet),
            index: Arc::clone(&index),
        };
        let router = Router::new()
            .route("/v1/agent/self", get(agent_self))
            .route("/v1/health/service/{name}", get(health_service))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Ok(MockAgent {
            addr,
            fleet,
            index,
            _task: task,
        })
    }

    /// Agent base URL, e.g. `http://127.0.0.1:53412`.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Replace the advertised fleet, bump the index, and release any blocked
    /// long polls.
    pub async fn set_fleet(&self, instances: Vec<ServiceInstance>) {
        *self.fleet.write().await = instances;
        self.index.send_modify(|index| *index += 1);
    }
}

async fn agent_self(State(state): State<AgentState>) -> Json<Value> {
    Json(json!({"Member": {"Name": state.self_name}}))
}

#[derive(Debug, Deserialize)]
struct HealthQuery {
    index: Option<u64>,
    wait: Option<String>,
}

async fn health_service(
    State(state): State<AgentState>,
    Path(_name): Path<String>,
    Query(query): Query<HealthQuery>,
) -> impl IntoResponse {
    // Block while the caller's index is current, up to the requested wait.
    if let (Some(client_index), Some(wait)) = (query.index, query.wait.as_deref()) {
        let mut changes = state.index.subscribe();
        if client_index >= *changes.borrow() {
            let _ = tokio::time::timeout(parse_wait(wait), changes.changed()).await;
        }
    }

    let entries: Vec<Value> = state
        .fleet
        .read()
        .await
        .iter()
        .map(|instance| {
            json!({
                "Node": {"Node": instance.node, "Address": instance.address},
                "Service": {"Port": instance.port},
                "Checks": [],
            })
        })
        .collect();

    let mut headers = HeaderMap::new();
    if let Ok(value) = state.index.borrow().to_string().parse() {
        headers.insert("X-Consul-Index", value);
    }
    (headers, Json(Value::Array(entries)))
}

/// Parse Consul's `wait` parameter (`"60s"`); unparsable values fall back to
/// one second so a buggy caller cannot hang a test.
fn parse_wait(wait: &str) -> Duration {
    wait.strip_suffix('s')
        .and_then(|secs| secs.parse::<u64>().ok())
        .map_or(Duration::from_secs(1), Duration::from_secs)
}
