//! Inter-node HTTP surface. Every handler here is authenticated by the
//! `X-Cluster-Token` header against the cluster's shared secret — membership
//! and replication traffic, not tenant traffic.
//!
//! Follows the `api::rest::handlers` convention of one thin handler per
//! endpoint that extracts, delegates to a component, and serializes the
//! result.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::cluster::node::{Node, NodeCapabilities, NodeRole, NodeStatus};
use crate::error::{ClusterError, Result};
use crate::replication::event::ReplicationEvent;
use crate::runtime::ClusterHandle;
use crate::util::now_unix_seconds;

use super::require_cluster_token;

fn auth(state: &ClusterHandle, headers: &HeaderMap) -> Result<()> {
    require_cluster_token(headers, &state.config.cluster_auth_token)
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub hostname: String,
    pub port: u16,
    pub role: NodeRole,
    #[serde(default)]
    pub capabilities: Option<NodeCapabilities>,
    pub owner_user_id: Option<String>,
    pub cluster_token: String,
}

pub async fn register_node(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<Value>> {
    auth(&state, &headers)?;
    let node_id = crate::util::new_id();
    state
        .registry
        .register(
            &node_id,
            &req.hostname,
            req.port,
            req.role,
            req.capabilities.unwrap_or_default(),
            req.owner_user_id,
            &req.cluster_token,
        )
        .await?;
    Ok(Json(json!({"node_id": node_id})))
}

pub async fn apply_replication_event(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Json(event): Json<ReplicationEvent>,
) -> Result<Json<Value>> {
    auth(&state, &headers)?;
    state.replication.apply(event).await?;
    Ok(Json(json!({"status": "success"})))
}

#[derive(Debug, Serialize)]
pub struct ClusterHealthResponse {
    pub status: String,
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub quorum_threshold: usize,
    pub leader_id: Option<String>,
    pub active_alerts: usize,
}

pub async fn cluster_health(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
) -> Result<Json<ClusterHealthResponse>> {
    auth(&state, &headers)?;
    let nodes = state.registry.list_nodes(None, None).await?;
    let status = state.health.cluster_health(&nodes);
    Ok(Json(ClusterHealthResponse {
        status: format!("{status:?}").to_lowercase(),
        total_nodes: nodes.len(),
        healthy_nodes: nodes.iter().filter(|n| n.is_healthy()).count(),
        quorum_threshold: state.health.quorum_threshold(nodes.len()),
        leader_id: state.elector.current_leader(),
        active_alerts: state.health.active_alert_count(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListNodesQuery {
    #[serde(default)]
    pub role: Option<NodeRole>,
    #[serde(default)]
    pub status: Option<NodeStatus>,
}

pub async fn list_nodes(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Query(q): Query<ListNodesQuery>,
) -> Result<Json<Vec<Node>>> {
    auth(&state, &headers)?;
    let nodes = state.registry.list_nodes(q.role, q.status).await?;
    Ok(Json(nodes))
}

pub async fn get_node(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Node>> {
    auth(&state, &headers)?;
    let node = state
        .registry
        .get_node(&id)
        .await?
        .ok_or_else(|| ClusterError::NotFound(format!("node {id}")))?;
    Ok(Json(node))
}

pub async fn remove_node(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    auth(&state, &headers)?;
    state.registry.remove_node(&id).await?;
    Ok(Json(json!({"status": "removed", "node_id": id})))
}

#[derive(Debug, Deserialize)]
pub struct PromoteRequest {
    pub node_id: String,
    #[serde(default)]
    pub force: bool,
}

pub async fn promote_node(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Json(req): Json<PromoteRequest>,
) -> Result<Json<Value>> {
    auth(&state, &headers)?;
    state.registry.promote(&req.node_id, req.force).await?;
    state.elector.elect_leader().await?;
    Ok(Json(json!({"status": "promoted", "node_id": req.node_id})))
}

pub async fn demote_node(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    auth(&state, &headers)?;
    state.registry.demote(&id).await?;
    Ok(Json(json!({"status": "demoted", "node_id": id})))
}

pub async fn replication_lag(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    auth(&state, &headers)?;
    let lag = state.replication.replication_lag(&state.node_id).await?;
    Ok(Json(json!({"lag_seconds": lag})))
}

#[derive(Debug, Deserialize)]
pub struct ValidateOwnerRequest {
    pub owner_user_id: String,
    #[serde(default)]
    pub target_nodes: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct NodeOwnerCheck {
    pub exists: bool,
    pub checked_at: i64,
}

#[derive(Debug, Serialize)]
pub struct OwnerValidationResult {
    pub owner_user_id: String,
    pub nodes: HashMap<String, NodeOwnerCheck>,
    pub consistent: bool,
}

/// Probes every target node's `cluster_nodes` collection for a node owned
/// by `owner_user_id`, and reports whether all reachable nodes agree.
/// Local-only: this process answers for itself, and for peers reuses the
/// node records already replicated into this process's registry rather
/// than making a second round-trip network call per peer.
pub async fn validate_owner(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Json(req): Json<ValidateOwnerRequest>,
) -> Result<Json<OwnerValidationResult>> {
    auth(&state, &headers)?;
    let all_nodes = state.registry.list_nodes(None, None).await?;
    let targets: Vec<&Node> = match &req.target_nodes {
        Some(ids) => all_nodes.iter().filter(|n| ids.contains(&n.node_id)).collect(),
        None => all_nodes.iter().collect(),
    };

    let checked_at = now_unix_seconds();
    let mut nodes = HashMap::new();
    for node in &targets {
        let exists = node.owner_user_id.as_deref() == Some(req.owner_user_id.as_str());
        nodes.insert(node.node_id.clone(), NodeOwnerCheck { exists, checked_at });
    }
    let consistent = nodes.values().all(|c| c.exists) || nodes.values().all(|c| !c.exists);

    Ok(Json(OwnerValidationResult {
        owner_user_id: req.owner_user_id,
        nodes,
        consistent,
    }))
}

pub async fn topology(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
) -> Result<Json<crate::cluster::ClusterTopology>> {
    auth(&state, &headers)?;
    let topo = crate::cluster::ClusterTopology::compute(&state.registry, &state.config).await?;
    Ok(Json(topo))
}

pub async fn check_user(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<Value>> {
    auth(&state, &headers)?;
    let nodes = state.registry.list_nodes(None, None).await?;
    let exists = nodes.iter().any(|n| n.owner_user_id.as_deref() == Some(user_id.as_str()));
    Ok(Json(json!({"exists": exists})))
}
