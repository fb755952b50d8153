//! Leader elector. Picks the authoritative master by priority then
//! earliest registration, demotes illegitimate masters, and runs a jittered
//! background election loop. Shares its resolution ordering with
//! `HealthMonitor::resolve_split_brain`.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{error, info};

use crate::cluster::health::HealthMonitor;
use crate::cluster::node::{Node, NodeRole, NodeStatus};
use crate::cluster::registry::NodeRegistry;
use crate::error::Result;

pub struct LeaderElector {
    registry: Arc<NodeRegistry>,
    health: Arc<HealthMonitor>,
    election_timeout_min_ms: u64,
    election_timeout_max_ms: u64,
}

impl LeaderElector {
    pub fn new(
        registry: Arc<NodeRegistry>,
        health: Arc<HealthMonitor>,
        election_timeout_min_ms: u64,
        election_timeout_max_ms: u64,
    ) -> Self {
        Self {
            registry,
            health,
            election_timeout_min_ms,
            election_timeout_max_ms,
        }
    }

    /// Among healthy masters, the highest `priority` wins; ties go to the
    /// earliest `created_at`.
    fn select(candidates: &[Node]) -> Option<&Node> {
        candidates
            .iter()
            .filter(|n| n.is_healthy_master())
            .min_by(|a, b| {
                b.capabilities
                    .priority
                    .cmp(&a.capabilities.priority)
                    .then(a.created_at.cmp(&b.created_at))
            })
    }

    /// Runs selection, writes the `leader_elected` event, and caches the
    /// result on the registry. Returns `None` if no healthy master exists.
    pub async fn elect_leader(&self) -> Result<Option<String>> {
        let nodes = self.registry.list_nodes(None, None).await?;
        let elected = Self::select(&nodes).map(|n| n.node_id.clone());
        if let Some(ref id) = elected {
            let changed = self.registry.current_leader().as_deref() != Some(id.as_str());
            self.registry.set_cached_leader(Some(id.clone()));
            if changed {
                self.registry.record_leader_elected(id).await?;
                self.health
                    .raise_alert(
                        crate::cluster::health::AlertType::LeaderChange,
                        "cluster",
                        "leader changed",
                        &format!("node {id} elected leader"),
                    )
                    .await?;
                self.health
                    .resolve_alert(crate::cluster::health::AlertType::LeaderChange, "cluster")
                    .await?;
            }
        } else {
            self.registry.set_cached_leader(None);
        }
        Ok(elected)
    }

    pub fn current_leader(&self) -> Option<String> {
        self.registry.current_leader()
    }

    /// `true` if the cached leader, if any, is still a healthy master.
    async fn current_leader_is_healthy(&self) -> Result<bool> {
        match self.registry.current_leader() {
            Some(id) => Ok(self
                .registry
                .get_node(&id)
                .await?
                .map(|n| n.is_healthy_master())
                .unwrap_or(false)),
            None => Ok(false),
        }
    }

    /// Failover: if auto_failover and the master has been lost for at least
    /// `failover_timeout_secs`, promote the highest-priority healthy replica
    /// provided at least `min_healthy_replicas` remain.
    pub async fn run_failover_check(
        &self,
        auto_failover: bool,
        promote_on_master_failure: bool,
        min_healthy_replicas: usize,
        failover_timeout_secs: u64,
    ) -> Result<()> {
        if !auto_failover || !promote_on_master_failure {
            return Ok(());
        }
        if self.current_leader_is_healthy().await? {
            return Ok(());
        }
        if let Some(id) = self.registry.current_leader() {
            if let Some(leader_node) = self.registry.get_node(&id).await? {
                let lost_for = crate::util::now_unix_seconds() - leader_node.updated_at;
                if lost_for < failover_timeout_secs as i64 {
                    return Ok(());
                }
            }
        }
        let nodes = self.registry.list_nodes(None, None).await?;
        let healthy_replicas: Vec<&Node> = nodes
            .iter()
            .filter(|n| n.role == NodeRole::Replica && n.status == NodeStatus::Healthy)
            .collect();
        if healthy_replicas.len() < min_healthy_replicas {
            return Ok(());
        }
        if let Some(best) = healthy_replicas
            .into_iter()
            .max_by_key(|n| n.capabilities.priority)
        {
            info!(node_id = %best.node_id, "promoting replica after master failure");
            self.registry.promote(&best.node_id, true).await?;
            self.elect_leader().await?;
        }
        Ok(())
    }

    /// Runs the election loop: a jittered timer, plus an immediate re-run
    /// whenever the current leader is found unhealthy.
    pub async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let timeout_ms = {
                let mut rng = rand::rng();
                rng.random_range(self.election_timeout_min_ms..=self.election_timeout_max_ms)
            };
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                    if let Err(e) = self.elect_leader().await {
                        error!(error = %e, "election failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }

            match self.current_leader_is_healthy().await {
                Ok(false) => {
                    if let Err(e) = self.elect_leader().await {
                        error!(error = %e, "re-election after unhealthy leader failed");
                    }
                }
                Ok(true) => {}
                Err(e) => error!(error = %e, "leader health check failed"),
            }
        }
    }

    /// Runs the failover check on the heartbeat cadence until `shutdown`
    /// fires. Separate from `run_loop` since failover and ordinary
    /// re-election have independent timers.
    pub async fn run_failover_loop(
        self: Arc<Self>,
        auto_failover: bool,
        promote_on_master_failure: bool,
        min_healthy_replicas: usize,
        failover_timeout_secs: u64,
        check_interval_secs: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(check_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self
                        .run_failover_check(auto_failover, promote_on_master_failure, min_healthy_replicas, failover_timeout_secs)
                        .await
                    {
                        error!(error = %e, "failover check failed");
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
