//! Cluster-wide configuration, loaded from `clusterd.toml` or defaults.
//! Defaults cover quorum percentage, circuit breaker thresholds, and
//! migration rate limit window.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRoleConfig {
    Master,
    Replica,
    Standalone,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMode {
    Async,
    Sync,
    SemiSync,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadPreference {
    Primary,
    Secondary,
    Any,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadBalancingAlgorithm {
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    IpHash,
    LeastResponseTime,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    pub cluster_enabled: bool,
    pub cluster_node_id: Option<String>,
    pub cluster_node_role: NodeRoleConfig,
    pub cluster_advertise_address: String,
    pub cluster_heartbeat_interval_seconds: u64,
    pub cluster_failure_threshold: u32,
    pub cluster_election_timeout_min_ms: u64,
    pub cluster_election_timeout_max_ms: u64,
    pub cluster_replication_enabled: bool,
    pub cluster_replication_mode: ReplicationMode,
    pub cluster_load_balancing_algorithm: LoadBalancingAlgorithm,
    pub cluster_sticky_sessions: bool,
    pub cluster_circuit_breaker_enabled: bool,
    pub cluster_circuit_breaker_threshold: u32,
    pub cluster_circuit_breaker_timeout_seconds: u64,
    pub cluster_request_timeout_seconds: u64,
    pub cluster_read_preference: ReadPreference,
    pub cluster_auth_token: String,
    pub cluster_quorum_percentage: f64,
    pub cluster_auto_failover: bool,
    pub cluster_promote_on_master_failure: bool,
    pub cluster_min_healthy_replicas: usize,
    pub cluster_failover_timeout_seconds: u64,

    pub migration_storage_dir: String,
    pub migration_max_compressed_bytes: u64,
    pub migration_max_decompressed_bytes: u64,
    pub migration_max_decompression_ratio: u64,
    pub migration_allowed_ips: Vec<String>,
    pub migration_rate_limit_hours: u64,
    pub migration_rate_limit_max_per_window: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_enabled: true,
            cluster_node_id: None,
            cluster_node_role: NodeRoleConfig::Standalone,
            cluster_advertise_address: "127.0.0.1:7890".to_string(),
            cluster_heartbeat_interval_seconds: 5,
            cluster_failure_threshold: 3,
            cluster_election_timeout_min_ms: 150,
            cluster_election_timeout_max_ms: 300,
            cluster_replication_enabled: true,
            cluster_replication_mode: ReplicationMode::Async,
            cluster_load_balancing_algorithm: LoadBalancingAlgorithm::RoundRobin,
            cluster_sticky_sessions: false,
            cluster_circuit_breaker_enabled: true,
            cluster_circuit_breaker_threshold: 5,
            cluster_circuit_breaker_timeout_seconds: 30,
            cluster_request_timeout_seconds: 10,
            cluster_read_preference: ReadPreference::Any,
            cluster_auth_token: String::new(),
            cluster_quorum_percentage: 0.5,
            cluster_auto_failover: true,
            cluster_promote_on_master_failure: true,
            cluster_min_healthy_replicas: 1,
            cluster_failover_timeout_seconds: 30,

            migration_storage_dir: "./data/migrations".to_string(),
            migration_max_compressed_bytes: 100 * 1024 * 1024,
            migration_max_decompressed_bytes: 10 * 1024 * 1024 * 1024,
            migration_max_decompression_ratio: 100,
            migration_allowed_ips: Vec::new(),
            migration_rate_limit_hours: 1,
            migration_rate_limit_max_per_window: 1,
        }
    }
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("cluster_enabled", &self.cluster_enabled)
            .field("cluster_node_id", &self.cluster_node_id)
            .field("cluster_node_role", &self.cluster_node_role)
            .field("cluster_advertise_address", &self.cluster_advertise_address)
            .field("cluster_quorum_percentage", &self.cluster_quorum_percentage)
            .field("cluster_auth_token", &"<redacted>")
            .field("migration_storage_dir", &self.migration_storage_dir)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to parse cluster configuration: {0}")]
pub struct ConfigParseError(pub String);

impl ClusterConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigParseError> {
        toml::from_str(s).map_err(|e| ConfigParseError(e.to_string()))
    }
}
