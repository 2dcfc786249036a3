//! Local status HTTP endpoint.
//!
//! Routes:
//!   GET /healthz         - liveness probe, plain "ok"
//!   GET /api/v1/status   - session and dial counts for both endpoints

use std::io;
use std::net::SocketAddr;

use axum::routing::get;
use axum::{Json, Router, extract::State};
use psc_federation::{Consumer, Producer};
use serde::Serialize;
use tracing::info;

#[derive(Clone)]
pub struct StatusState {
    pub producer: Producer,
    pub consumer: Consumer,
}

#[derive(Debug, Serialize)]
pub struct EndpointStatus {
    pub sessions: usize,
    pub ready_sessions: usize,
    pub dialed_peers: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct NodeStatus {
    pub producer: EndpointStatus,
    pub consumer: EndpointStatus,
}

pub fn build_router(state: StatusState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/status", get(status))
        .with_state(state)
}

/// Bind and serve the status router in the background.
pub async fn serve(bind: &str, state: StatusState) -> io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "status http listening");
    let router = build_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok(addr)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(state): State<StatusState>) -> Json<NodeStatus> {
    Json(NodeStatus {
        producer: EndpointStatus {
            sessions: state.producer.session_count(),
            ready_sessions: state.producer.ready_session_count(),
            dialed_peers: state
                .producer
                .dialed_peers()
                .iter()
                .map(ToString::to_string)
                .collect(),
        },
        consumer: EndpointStatus {
            sessions: state.consumer.session_count(),
            ready_sessions: state.consumer.ready_session_count(),
            dialed_peers: state
                .consumer
                .dialed_peers()
                .iter()
                .map(ToString::to_string)
                .collect(),
        },
    })
}
