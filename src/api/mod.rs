//! Read-only status HTTP surface
//!
//! The external proxy layer consults `/status` before forwarding
//! writes: a node reporting Recovering gets a retryable rejection
//! instead of traffic. `/ring` exposes the token ring for operators.
//! Request forwarding itself lives outside this crate.

use crate::cluster::{
    NodeCollection, NodeStatus, Partitioner, ResolveMode, Resolver, DEFAULT_SHARD_TOKEN,
};
use crate::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared state for the status handlers
#[derive(Clone)]
pub struct ApiState {
    pub node_name: String,
    pub nodes: Arc<NodeCollection>,
    pub resolver: Arc<Resolver>,
    pub partitioner: Arc<Partitioner>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    node: String,
    status: String,
    accepts_writes: bool,
    data_location: String,
    owned_tokens: usize,
    ring_size: usize,
    replication_factor: usize,
}

#[derive(Debug, Serialize)]
struct RingEntry {
    token: u32,
    node: String,
}

async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let node = state.nodes.get(&state.node_name);
    let status = node
        .as_ref()
        .map(|node| node.status)
        .unwrap_or(NodeStatus::Joining);
    Json(StatusResponse {
        node: state.node_name.clone(),
        status: status.to_string(),
        accepts_writes: status == NodeStatus::Up,
        data_location: node.map(|node| node.data_location).unwrap_or_default(),
        owned_tokens: state.resolver.tokens_of(&state.node_name).len(),
        ring_size: state.resolver.ring_len(),
        replication_factor: state.resolver.replication_factor(),
    })
}

async fn get_ring(State(state): State<ApiState>) -> Json<Vec<RingEntry>> {
    Json(
        state
            .resolver
            .ring_entries()
            .into_iter()
            .map(|(token, node)| RingEntry { token, node })
            .collect(),
    )
}

#[derive(Debug, Serialize)]
struct RouteResponse {
    token: u32,
    /// False when the measurement has no partition key and the default
    /// shard was used
    partitioned: bool,
    replicas: Vec<RouteReplica>,
}

#[derive(Debug, Serialize)]
struct RouteReplica {
    node: String,
    data_location: String,
}

/// Routing lookup for the proxy layer: `db` and `measurement` select
/// the partition key, every other query parameter is a tag value.
async fn get_route(
    State(state): State<ApiState>,
    Query(mut params): Query<HashMap<String, String>>,
) -> std::result::Result<Json<RouteResponse>, (StatusCode, String)> {
    let db = params
        .remove("db")
        .ok_or((StatusCode::BAD_REQUEST, "missing db parameter".to_string()))?;
    let measurement = params.remove("measurement").ok_or((
        StatusCode::BAD_REQUEST,
        "missing measurement parameter".to_string(),
    ))?;
    let mode = match params.remove("mode").as_deref() {
        Some("read") => ResolveMode::Read,
        _ => ResolveMode::Write,
    };

    let token = state
        .partitioner
        .get_token(&db, &measurement, &params)
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;
    let (token, partitioned) = match token {
        Some(token) => (token, true),
        None => (DEFAULT_SHARD_TOKEN, false),
    };
    // No Up replica anywhere means the request cannot be served by
    // anyone; this is not retryable until the cluster heals.
    if !state.resolver.has_live_replica(token) {
        return Err((
            StatusCode::BAD_GATEWAY,
            format!("no live replica for token {token}"),
        ));
    }
    let replicas = state
        .resolver
        .resolve(token, mode)
        .into_iter()
        .map(|replica| RouteReplica {
            node: replica.node,
            data_location: replica.data_location,
        })
        .collect();
    Ok(Json(RouteResponse {
        token,
        partitioned,
        replicas,
    }))
}

/// Build the status router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/ring", get(get_ring))
        .route("/route", get(get_route))
        .with_state(state)
}

/// Serve the status surface until cancelled.
pub async fn serve(addr: SocketAddr, state: ApiState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "status API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}
