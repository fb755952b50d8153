//! Node identity, role, status, and the per-node health/replication metrics
//! the registry and health monitor operate on.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Standalone,
    Master,
    Replica,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Joining,
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
    Leaving,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCapabilities {
    pub max_connections: u32,
    pub storage_bytes: u64,
    pub cores: u32,
    pub memory_bytes: u64,
    pub supports_writes: bool,
    pub supports_reads: bool,
    /// 0..=100; higher wins leader election and split-brain resolution ties.
    pub priority: u8,
}

impl Default for NodeCapabilities {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            storage_bytes: 0,
            cores: 1,
            memory_bytes: 0,
            supports_writes: false,
            supports_reads: true,
            priority: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub last_heartbeat: Option<i64>,
    pub uptime_seconds: u64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub active_connections: u32,
    pub requests_per_second: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationMetrics {
    pub lag_seconds: f64,
    pub events_pending: u64,
    pub events_replicated: u64,
    pub events_failed: u64,
    pub last_sync: Option<i64>,
    pub throughput_events_per_second: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub hostname: String,
    pub port: u16,
    pub role: NodeRole,
    pub status: NodeStatus,
    pub capabilities: NodeCapabilities,
    pub health: HealthMetrics,
    pub replication: ReplicationMetrics,
    pub owner_user_id: Option<String>,
    /// SHA-256 hex digest of the cluster auth token. The raw token is never
    /// stored or logged.
    pub hashed_cluster_token: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Node {
    /// A node is eligible to serve as leader/master candidate: healthy and
    /// flagged to accept writes.
    pub fn is_healthy_master(&self) -> bool {
        self.role == NodeRole::Master && self.status == NodeStatus::Healthy
    }

    pub fn is_healthy(&self) -> bool {
        self.status == NodeStatus::Healthy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterEventType {
    NodeRegistered,
    NodePromoted,
    NodeDemoted,
    LeaderElected,
    NodeRemoved,
    NodeStatusChanged,
}

/// Append-only audit trail for membership and role-change activity, written
/// to the `cluster_events` collection. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub event_id: String,
    pub event_type: ClusterEventType,
    pub node_id: String,
    pub timestamp: i64,
    pub details: serde_json::Value,
}
