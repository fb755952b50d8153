//! Health and quorum monitor. Runs the heartbeat writer and health sweeper
//! loops, computes quorum/cluster health, detects and resolves split-brain
//! by sorting candidates on `(-priority, created_at)`, and maintains
//! deduplicated alerts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cluster::node::{Node, NodeRole, NodeStatus};
use crate::cluster::registry::{NodeRegistry, NODES_COLLECTION};
use crate::error::Result;
use crate::util::now_unix_seconds;

pub const ALERTS_COLLECTION: &str = "cluster_alerts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    NodeDown,
    NodeDegraded,
    HighReplicationLag,
    ResourceHigh,
    SplitBrain,
    NoQuorum,
    LeaderChange,
    SecurityEvent,
    TaskFailure,
}

impl AlertType {
    fn default_severity(self) -> AlertSeverity {
        match self {
            AlertType::NodeDown => AlertSeverity::Error,
            AlertType::NodeDegraded => AlertSeverity::Warning,
            AlertType::HighReplicationLag => AlertSeverity::Warning,
            AlertType::ResourceHigh => AlertSeverity::Warning,
            AlertType::SplitBrain => AlertSeverity::Critical,
            AlertType::NoQuorum => AlertSeverity::Critical,
            AlertType::LeaderChange => AlertSeverity::Info,
            AlertType::SecurityEvent => AlertSeverity::Error,
            AlertType::TaskFailure => AlertSeverity::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterAlert {
    pub alert_id: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    /// `None` means cluster-scoped (alert key uses `"cluster"`).
    pub node_id: Option<String>,
    pub timestamp: i64,
    pub resolved: bool,
    pub resolved_at: Option<i64>,
}

fn alert_id(alert_type: AlertType, scope: &str) -> String {
    format!("{alert_type:?}:{scope}").to_lowercase()
}

#[derive(Debug, Clone)]
pub struct AlertRule {
    pub enabled: bool,
    pub severity: AlertSeverity,
    /// Threshold meaning depends on the alert type (seconds for lag,
    /// percent for resource_high); unused by boolean-condition alerts.
    pub threshold: f64,
}

impl Default for AlertRule {
    fn default() -> Self {
        Self {
            enabled: true,
            severity: AlertSeverity::Warning,
            threshold: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterHealthStatus {
    Healthy,
    Degraded,
    NoQuorum,
}

pub struct HealthMonitor {
    registry: Arc<NodeRegistry>,
    heartbeat_interval_secs: u64,
    failure_threshold: u32,
    quorum_percentage: f64,
    rules: RwLock<HashMap<AlertType, AlertRule>>,
    active_alerts: RwLock<HashMap<String, ClusterAlert>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        heartbeat_interval_secs: u64,
        failure_threshold: u32,
        quorum_percentage: f64,
    ) -> Self {
        let mut rules = HashMap::new();
        rules.insert(
            AlertType::HighReplicationLag,
            AlertRule {
                threshold: 30.0,
                ..Default::default()
            },
        );
        rules.insert(
            AlertType::ResourceHigh,
            AlertRule {
                threshold: 90.0,
                ..Default::default()
            },
        );
        for t in [
            AlertType::NodeDown,
            AlertType::NodeDegraded,
            AlertType::SplitBrain,
            AlertType::NoQuorum,
            AlertType::LeaderChange,
            AlertType::SecurityEvent,
            AlertType::TaskFailure,
        ] {
            rules.entry(t).or_insert_with(|| AlertRule {
                severity: t.default_severity(),
                ..Default::default()
            });
        }
        Self {
            registry,
            heartbeat_interval_secs,
            failure_threshold,
            quorum_percentage,
            rules: RwLock::new(rules),
            active_alerts: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_rule(&self, alert_type: AlertType, rule: AlertRule) {
        self.rules.write().insert(alert_type, rule);
    }

    fn rule(&self, alert_type: AlertType) -> AlertRule {
        self.rules
            .read()
            .get(&alert_type)
            .cloned()
            .unwrap_or_else(|| AlertRule {
                severity: alert_type.default_severity(),
                ..Default::default()
            })
    }

    /// Raises (or no-ops on) an alert for `(alert_type, scope)`. `scope` is
    /// a node id or `"cluster"`. Returns `true` if a new alert was created.
    pub async fn raise_alert(
        &self,
        alert_type: AlertType,
        scope: &str,
        title: &str,
        message: &str,
    ) -> Result<bool> {
        let rule = self.rule(alert_type);
        if !rule.enabled {
            return Ok(false);
        }
        let key = alert_id(alert_type, scope);
        {
            let alerts = self.active_alerts.read();
            if alerts.contains_key(&key) {
                return Ok(false);
            }
        }
        let alert = ClusterAlert {
            alert_id: key.clone(),
            alert_type,
            severity: rule.severity,
            title: title.to_string(),
            message: message.to_string(),
            node_id: (scope != "cluster").then(|| scope.to_string()),
            timestamp: now_unix_seconds(),
            resolved: false,
            resolved_at: None,
        };
        self.persist_alert(&alert).await?;
        self.active_alerts.write().insert(key, alert);
        warn!(alert_type = ?alert_type, scope, "cluster alert raised");
        Ok(true)
    }

    pub async fn resolve_alert(&self, alert_type: AlertType, scope: &str) -> Result<bool> {
        let key = alert_id(alert_type, scope);
        let mut alert = match self.active_alerts.write().remove(&key) {
            Some(a) => a,
            None => return Ok(false),
        };
        alert.resolved = true;
        alert.resolved_at = Some(now_unix_seconds());
        self.persist_alert(&alert).await?;
        info!(alert_type = ?alert_type, scope, "cluster alert resolved");
        Ok(true)
    }

    async fn persist_alert(&self, alert: &ClusterAlert) -> Result<()> {
        let doc = serde_json::to_value(alert)?;
        self.registry
            .store_handle()
            .replace(ALERTS_COLLECTION, &alert.alert_id, doc)
            .await
    }

    pub fn active_alert_count(&self) -> usize {
        self.active_alerts.read().len()
    }

    /// Quorum holds when healthy_count >= floor(total * quorum_percentage) + 1.
    pub fn quorum_threshold(&self, total_nodes: usize) -> usize {
        ((total_nodes as f64 * self.quorum_percentage) as usize) + 1
    }

    pub fn cluster_health(&self, nodes: &[Node]) -> ClusterHealthStatus {
        if nodes.is_empty() {
            return ClusterHealthStatus::NoQuorum;
        }
        let healthy = nodes.iter().filter(|n| n.is_healthy()).count();
        let threshold = self.quorum_threshold(nodes.len());
        if healthy < threshold {
            ClusterHealthStatus::NoQuorum
        } else if healthy == nodes.len() {
            ClusterHealthStatus::Healthy
        } else {
            ClusterHealthStatus::Degraded
        }
    }

    /// `(detected, candidates)` where candidates are every node with
    /// role=master and status=healthy, in arbitrary order.
    pub fn detect_split_brain(nodes: &[Node]) -> (bool, Vec<Node>) {
        let candidates: Vec<Node> = nodes.iter().filter(|n| n.is_healthy_master()).cloned().collect();
        (candidates.len() > 1, candidates)
    }

    /// Sorts split-brain candidates by `(-priority, created_at)` and returns
    /// the legitimate master. Ties on priority go to the earliest registrant.
    pub fn resolve_split_brain(mut candidates: Vec<Node>) -> Option<Node> {
        candidates.sort_by(|a, b| {
            b.capabilities
                .priority
                .cmp(&a.capabilities.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        candidates.into_iter().next()
    }

    /// A master isolated from enough peers to lose quorum must demote
    /// itself.
    pub fn is_isolated(&self, this_node: &Node, reachable_healthy_peers: usize, total_nodes: usize) -> bool {
        this_node.role == NodeRole::Master
            && reachable_healthy_peers + 1 < self.quorum_threshold(total_nodes)
    }

    /// Updates this node's own heartbeat row. Called on the heartbeat
    /// writer's timer; the only suspension points are this call and the
    /// interval sleep.
    pub async fn write_heartbeat(&self, node_id: &str) -> Result<()> {
        let node_opt = self.registry.get_node(node_id).await?;
        let mut node = match node_opt {
            Some(n) => n,
            None => return Ok(()),
        };
        node.health.last_heartbeat = Some(now_unix_seconds());
        node.health.uptime_seconds += self.heartbeat_interval_secs;
        node.updated_at = now_unix_seconds();
        self.registry
            .store_handle()
            .replace(NODES_COLLECTION, node_id, serde_json::to_value(&node)?)
            .await
    }

    /// Scans all nodes and marks any non-offline row whose last heartbeat
    /// predates `heartbeat_interval * failure_threshold` as unhealthy, then
    /// evaluates resource-threshold alerts and split-brain/quorum.
    pub async fn sweep(&self) -> Result<()> {
        let nodes = self.registry.list_nodes(None, None).await?;
        let staleness_limit = (self.heartbeat_interval_secs * self.failure_threshold as u64) as i64;
        let now = now_unix_seconds();

        for node in &nodes {
            if node.status == NodeStatus::Offline || node.status == NodeStatus::Leaving {
                continue;
            }
            let stale = match node.health.last_heartbeat {
                Some(hb) => now - hb > staleness_limit,
                None => true,
            };
            if stale && node.status != NodeStatus::Unhealthy {
                self.registry
                    .update_status(&node.node_id, NodeStatus::Unhealthy)
                    .await?;
                self.raise_alert(
                    AlertType::NodeDown,
                    &node.node_id,
                    "node unreachable",
                    &format!("node {} missed its heartbeat deadline", node.node_id),
                )
                .await?;
            } else if !stale && node.status == NodeStatus::Unhealthy {
                self.registry
                    .update_status(&node.node_id, NodeStatus::Healthy)
                    .await?;
                self.resolve_alert(AlertType::NodeDown, &node.node_id).await?;
            }

            if node.health.cpu_percent >= self.rule(AlertType::ResourceHigh).threshold
                || node.health.memory_percent >= self.rule(AlertType::ResourceHigh).threshold
            {
                self.raise_alert(
                    AlertType::ResourceHigh,
                    &node.node_id,
                    "resource usage high",
                    &format!(
                        "node {} cpu={:.1}% mem={:.1}%",
                        node.node_id, node.health.cpu_percent, node.health.memory_percent
                    ),
                )
                .await?;
            } else {
                self.resolve_alert(AlertType::ResourceHigh, &node.node_id).await?;
            }

            if node.replication.lag_seconds >= self.rule(AlertType::HighReplicationLag).threshold {
                self.raise_alert(
                    AlertType::HighReplicationLag,
                    &node.node_id,
                    "replication lag high",
                    &format!("node {} lag={:.1}s", node.node_id, node.replication.lag_seconds),
                )
                .await?;
            } else {
                self.resolve_alert(AlertType::HighReplicationLag, &node.node_id).await?;
            }
        }

        let refreshed = self.registry.list_nodes(None, None).await?;
        let (split, candidates) = Self::detect_split_brain(&refreshed);
        if split {
            self.raise_alert(
                AlertType::SplitBrain,
                "cluster",
                "split-brain detected",
                &format!("{} nodes simultaneously healthy masters", candidates.len()),
            )
            .await?;
            if let Some(winner) = Self::resolve_split_brain(candidates.clone()) {
                for node in &candidates {
                    if node.node_id != winner.node_id {
                        self.registry.demote(&node.node_id).await?;
                    }
                }
            }
        } else {
            self.resolve_alert(AlertType::SplitBrain, "cluster").await?;
        }

        match self.cluster_health(&refreshed) {
            ClusterHealthStatus::NoQuorum => {
                self.raise_alert(
                    AlertType::NoQuorum,
                    "cluster",
                    "quorum lost",
                    "healthy node count fell below the quorum threshold",
                )
                .await?;
            }
            _ => {
                self.resolve_alert(AlertType::NoQuorum, "cluster").await?;
            }
        }
        Ok(())
    }

    /// Runs the heartbeat writer loop until `shutdown` fires.
    pub async fn run_heartbeat_loop(self: Arc<Self>, node_id: String, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.heartbeat_interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.write_heartbeat(&node_id).await {
                        error!(error = %e, "heartbeat write failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Runs the health sweeper loop until `shutdown` fires.
    pub async fn run_sweeper_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.heartbeat_interval_secs * 2));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "health sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::{HealthMetrics, NodeCapabilities, ReplicationMetrics};
    use crate::store::InMemoryStore;

    fn node(id: &str, role: NodeRole, status: NodeStatus, priority: u8, created_at: i64) -> Node {
        Node {
            node_id: id.to_string(),
            hostname: "h".to_string(),
            port: 1,
            role,
            status,
            capabilities: NodeCapabilities {
                priority,
                ..Default::default()
            },
            health: HealthMetrics::default(),
            replication: ReplicationMetrics::default(),
            owner_user_id: None,
            hashed_cluster_token: String::new(),
            created_at,
            updated_at: created_at,
        }
    }

    fn monitor() -> HealthMonitor {
        let registry = Arc::new(NodeRegistry::new(Arc::new(InMemoryStore::new())));
        HealthMonitor::new(registry, 1, 3, 0.5)
    }

    #[test]
    fn quorum_threshold_is_floor_half_plus_one() {
        let m = monitor();
        assert_eq!(m.quorum_threshold(4), 3);
        assert_eq!(m.quorum_threshold(3), 2);
        assert_eq!(m.quorum_threshold(1), 1);
    }

    #[test]
    fn cluster_health_classifies_correctly() {
        let m = monitor();
        let all_healthy = vec![
            node("a", NodeRole::Master, NodeStatus::Healthy, 100, 0),
            node("b", NodeRole::Replica, NodeStatus::Healthy, 50, 1),
        ];
        assert_eq!(m.cluster_health(&all_healthy), ClusterHealthStatus::Healthy);

        let degraded = vec![
            node("a", NodeRole::Master, NodeStatus::Healthy, 100, 0),
            node("b", NodeRole::Replica, NodeStatus::Unhealthy, 50, 1),
            node("c", NodeRole::Replica, NodeStatus::Healthy, 50, 2),
        ];
        assert_eq!(m.cluster_health(&degraded), ClusterHealthStatus::Degraded);

        let no_quorum = vec![
            node("a", NodeRole::Master, NodeStatus::Unhealthy, 100, 0),
            node("b", NodeRole::Replica, NodeStatus::Unhealthy, 50, 1),
            node("c", NodeRole::Replica, NodeStatus::Healthy, 50, 2),
        ];
        assert_eq!(m.cluster_health(&no_quorum), ClusterHealthStatus::NoQuorum);
    }

    #[test]
    fn split_brain_resolution_picks_earlier_created_at_on_priority_tie() {
        let a = node("a", NodeRole::Master, NodeStatus::Healthy, 100, 1_000);
        let b = node("b", NodeRole::Master, NodeStatus::Healthy, 100, 1_001);
        let (detected, candidates) = HealthMonitor::detect_split_brain(&[a.clone(), b.clone()]);
        assert!(detected);
        let winner = HealthMonitor::resolve_split_brain(candidates).unwrap();
        assert_eq!(winner.node_id, "a");
    }

    #[test]
    fn split_brain_resolution_prefers_higher_priority() {
        let a = node("a", NodeRole::Master, NodeStatus::Healthy, 50, 1_000);
        let b = node("b", NodeRole::Master, NodeStatus::Healthy, 90, 1_500);
        let winner = HealthMonitor::resolve_split_brain(vec![a, b]).unwrap();
        assert_eq!(winner.node_id, "b");
    }

    #[tokio::test]
    async fn raising_the_same_alert_twice_is_a_noop() {
        let m = monitor();
        assert!(m
            .raise_alert(AlertType::NodeDown, "n1", "t", "m")
            .await
            .unwrap());
        assert!(!m
            .raise_alert(AlertType::NodeDown, "n1", "t", "m")
            .await
            .unwrap());
        assert_eq!(m.active_alert_count(), 1);
        assert!(m.resolve_alert(AlertType::NodeDown, "n1").await.unwrap());
        assert_eq!(m.active_alert_count(), 0);
    }
}
