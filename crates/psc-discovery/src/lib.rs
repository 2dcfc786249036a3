// psc-discovery: Consul-compatible service discovery driver.
//
// Watches the agent's health listing for a named service and reconciles the
// endpoint's dial set against the advertised fleet: long-poll the agent with
// the index cursor, diff each response against the known peers, and drive
// connect/disconnect through the endpoint's PeerControl surface. All
// reconciliations after the initial snapshot are debounced so deploy churn
// collapses into one change.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use psc_federation::PeerControl;
use psc_protocol::PeerAddr;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub mod debounce;
pub mod retry;

pub use debounce::Debouncer;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Driver configuration. The durations default to the protocol constants;
/// tests shrink them.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Agent base URL, e.g. `http://localhost:8500`.
    pub agent_url: String,
    /// Service name to watch.
    pub service: String,
    /// Long-poll duration requested from the agent.
    pub poll_wait: Duration,
    /// Quiet period before a staged fleet change is applied.
    pub debounce_period: Duration,
    /// Floor between consecutive queries, so a misbehaving agent cannot
    /// produce a tight loop.
    pub min_query_period: Duration,
    /// Fixed wait before retrying a failed HTTP request.
    pub http_retry_wait: Duration,
    /// Client-side timeout for non-long-poll requests. Long polls get
    /// 1.5 × `poll_wait`.
    pub request_timeout: Duration,
}

impl DiscoveryConfig {
    pub fn new(agent_url: impl Into<String>, service: impl Into<String>) -> Self {
        DiscoveryConfig {
            agent_url: agent_url.into(),
            service: service.into(),
            poll_wait: Duration::from_secs(60),
            debounce_period: Duration::from_secs(30),
            min_query_period: Duration::from_secs(5),
            http_retry_wait: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("agent request failed: {0}")]
    Http(#[from] reqwest::Error),
}

// ---------------------------------------------------------------------------
// Agent response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AgentSelf {
    #[serde(rename = "Member")]
    member: AgentMember,
}

#[derive(Debug, Deserialize)]
struct AgentMember {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Node")]
    node: HealthNode,
    #[serde(rename = "Service")]
    service: HealthService,
}

#[derive(Debug, Deserialize)]
struct HealthNode {
    #[serde(rename = "Node")]
    name: String,
    #[serde(rename = "Address")]
    address: String,
}

#[derive(Debug, Deserialize)]
struct HealthService {
    #[serde(rename = "Port")]
    port: u16,
}

/// One health query's result: the advertised entries (`None` when the body
/// was malformed) and the new index cursor (`None` when the header was
/// missing or unparsable).
struct PollOutcome {
    entries: Option<Vec<HealthEntry>>,
    index: Option<u64>,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct ConsulDiscovery {
    http: reqwest::Client,
    config: DiscoveryConfig,
    control: Arc<dyn PeerControl>,
}

impl ConsulDiscovery {
    pub fn new(
        config: DiscoveryConfig,
        control: Arc<dyn PeerControl>,
    ) -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder().build()?;
        Ok(ConsulDiscovery {
            http,
            config,
            control,
        })
    }

    /// Run the driver until `shutdown` fires.
    ///
    /// Startup: learn the agent's own member name (to filter this node out
    /// of the fleet), apply the initial snapshot immediately, then enter the
    /// debounced long-poll loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            service = %self.config.service,
            url = %self.config.agent_url,
            "discovery starting"
        );

        let Some(self_name) = retry::retry_until(&mut shutdown, self.config.http_retry_wait, || {
            self.fetch_self()
        })
        .await
        else {
            return;
        };
        info!(%self_name, "discovery agent identity");

        // Reconciliation runs on its own task: the initial snapshot is sent
        // straight in, everything later goes through the debouncer.
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        tokio::spawn(reconcile_loop(apply_rx, Arc::clone(&self.control)));
        let debouncer = Debouncer::new(self.config.debounce_period, apply_tx.clone());

        let mut index: Option<u64> = None;
        let Some(initial) = retry::retry_until(&mut shutdown, self.config.http_retry_wait, || {
            self.fetch_services(None, false)
        })
        .await
        else {
            return;
        };
        if let Some(new_index) = initial.index {
            index = Some(new_index);
        }
        // The agent returns a full listing even when nothing changed (a long
        // poll also expires on its own); only actual changes may arm the
        // debouncer.
        let mut last_seen: Option<BTreeSet<PeerAddr>> = None;
        if let Some(entries) = initial.entries {
            let peers = peer_set(&entries, &self_name);
            last_seen = Some(peers.clone());
            let _ = apply_tx.send(peers);
        }

        loop {
            let started = Instant::now();
            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.fetch_services(index, true) => match result {
                    Ok(outcome) => {
                        if let Some(new_index) = outcome.index {
                            debug!(index = new_index, "new agent index");
                            index = Some(new_index);
                        }
                        if let Some(entries) = outcome.entries {
                            let peers = peer_set(&entries, &self_name);
                            if last_seen.as_ref() != Some(&peers) {
                                last_seen = Some(peers.clone());
                                debouncer.stage(peers);
                            }
                        }
                    }
                    Err(e) => {
                        // Retry with the same index after a fixed wait.
                        warn!(error = %e, "discovery query failed");
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(self.config.http_retry_wait) => {}
                        }
                        continue;
                    }
                },
            }
            // Floor the query rate.
            let elapsed = started.elapsed();
            if elapsed < self.config.min_query_period {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.config.min_query_period - elapsed) => {}
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("discovery stopped");
    }

    async fn fetch_self(&self) -> Result<String, DiscoveryError> {
        let url = format!("{}/v1/agent/self", self.base_url());
        let body: AgentSelf = self
            .http
            .get(&url)
            .timeout(self.config.request_timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.member.name)
    }

    async fn fetch_services(
        &self,
        index: Option<u64>,
        long_poll: bool,
    ) -> Result<PollOutcome, DiscoveryError> {
        let url = format!("{}/v1/health/service/{}", self.base_url(), self.config.service);
        let mut query: Vec<(&str, String)> = vec![("passing", "true".to_owned())];
        let timeout = if long_poll {
            query.push(("wait", format!("{}s", self.config.poll_wait.as_secs())));
            if let Some(index) = index {
                query.push(("index", index.to_string()));
            }
            self.config.poll_wait.mul_f64(1.5)
        } else {
            self.config.request_timeout
        };

        let response = self
            .http
            .get(&url)
            .query(&query)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        let index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let text = response.text().await?;
        let entries = match serde_json::from_str::<Vec<HealthEntry>>(&text) {
            Ok(entries) => Some(entries),
            Err(e) => {
                warn!(error = %e, "malformed health listing, skipping reconciliation");
                None
            }
        };
        Ok(PollOutcome { entries, index })
    }

    fn base_url(&self) -> &str {
        self.config.agent_url.trim_end_matches('/')
    }
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// The advertised fleet minus this node.
fn peer_set(entries: &[HealthEntry], self_name: &str) -> BTreeSet<PeerAddr> {
    entries
        .iter()
        .filter(|entry| entry.node.name != self_name)
        .map(|entry| PeerAddr::new(entry.node.address.clone(), entry.service.port))
        .collect()
}

async fn reconcile_loop(
    mut apply_rx: mpsc::UnboundedReceiver<BTreeSet<PeerAddr>>,
    control: Arc<dyn PeerControl>,
) {
    let mut known = BTreeSet::new();
    while let Some(next) = apply_rx.recv().await {
        reconcile(&mut known, next, control.as_ref());
    }
}

/// Diff `next` against `known` and drive connect/disconnect accordingly.
fn reconcile(known: &mut BTreeSet<PeerAddr>, next: BTreeSet<PeerAddr>, control: &dyn PeerControl) {
    for peer in next.difference(known) {
        info!(peer = %peer, "peer joined fleet, connecting");
        control.connect(&peer.host, peer.port);
    }
    for peer in known.difference(&next) {
        info!(peer = %peer, "peer left fleet, disconnecting");
        control.disconnect(&peer.host, peer.port);
    }
    *known = next;
}
