//! Cluster topology: the shape of the cluster derived from the current node
//! registry plus the configured replication and routing settings. Computed
//! on demand rather than stored, since it is fully a function of state the
//! registry and config already own.

use serde::{Deserialize, Serialize};

use crate::cluster::node::NodeRole;
use crate::cluster::registry::NodeRegistry;
use crate::config::{ClusterConfig, LoadBalancingAlgorithm, ReplicationMode};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyType {
    Standalone,
    MasterSlave,
    MasterMaster,
    MultiMaster,
}

impl TopologyType {
    /// Classifies the topology from a master/replica count: zero or one
    /// master with no replicas is standalone, one master with replicas is
    /// master-slave, exactly two masters is master-master, and three or
    /// more is multi-master.
    fn classify(master_count: usize, replica_count: usize) -> Self {
        match master_count {
            0 | 1 if replica_count == 0 => TopologyType::Standalone,
            0 | 1 => TopologyType::MasterSlave,
            2 => TopologyType::MasterMaster,
            _ => TopologyType::MultiMaster,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancingConfig {
    pub algorithm: LoadBalancingAlgorithm,
    pub sticky_sessions: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    pub auto_failover: bool,
    pub promote_on_master_failure: bool,
    pub min_healthy_replicas: usize,
    pub failover_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub topology_type: TopologyType,
    pub replication_factor: usize,
    pub replication_mode: ReplicationMode,
    pub load_balancing: LoadBalancingConfig,
    pub failover: FailoverConfig,
    pub master_count: usize,
    pub replica_count: usize,
}

impl ClusterTopology {
    /// Derives the current topology from live node membership and the
    /// process's configuration. `replication_factor` is the replica count,
    /// the number of nodes each write is expected to reach beyond its
    /// master.
    pub async fn compute(registry: &NodeRegistry, config: &ClusterConfig) -> Result<Self> {
        let nodes = registry.list_nodes(None, None).await?;
        let master_count = nodes.iter().filter(|n| n.role == NodeRole::Master).count();
        let replica_count = nodes.iter().filter(|n| n.role == NodeRole::Replica).count();

        Ok(Self {
            topology_type: TopologyType::classify(master_count, replica_count),
            replication_factor: replica_count,
            replication_mode: config.cluster_replication_mode,
            load_balancing: LoadBalancingConfig {
                algorithm: config.cluster_load_balancing_algorithm,
                sticky_sessions: config.cluster_sticky_sessions,
            },
            failover: FailoverConfig {
                auto_failover: config.cluster_auto_failover,
                promote_on_master_failure: config.cluster_promote_on_master_failure,
                min_healthy_replicas: config.cluster_min_healthy_replicas,
                failover_timeout_seconds: config.cluster_failover_timeout_seconds,
            },
            master_count,
            replica_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::NodeCapabilities;
    use crate::store::InMemoryStore;
    use std::sync::Arc;

    async fn registry_with(masters: usize, replicas: usize) -> NodeRegistry {
        let reg = NodeRegistry::new(Arc::new(InMemoryStore::new()));
        for i in 0..masters {
            reg.register(
                &format!("m{i}"),
                "h",
                1,
                NodeRole::Master,
                NodeCapabilities::default(),
                None,
                "t",
            )
            .await
            .unwrap();
        }
        for i in 0..replicas {
            reg.register(
                &format!("r{i}"),
                "h",
                1,
                NodeRole::Replica,
                NodeCapabilities::default(),
                None,
                "t",
            )
            .await
            .unwrap();
        }
        reg
    }

    #[tokio::test]
    async fn single_node_with_no_replicas_is_standalone() {
        let reg = registry_with(1, 0).await;
        let topo = ClusterTopology::compute(&reg, &ClusterConfig::default()).await.unwrap();
        assert_eq!(topo.topology_type, TopologyType::Standalone);
        assert_eq!(topo.replication_factor, 0);
    }

    #[tokio::test]
    async fn one_master_with_replicas_is_master_slave() {
        let reg = registry_with(1, 2).await;
        let topo = ClusterTopology::compute(&reg, &ClusterConfig::default()).await.unwrap();
        assert_eq!(topo.topology_type, TopologyType::MasterSlave);
        assert_eq!(topo.replication_factor, 2);
    }

    #[tokio::test]
    async fn two_masters_is_master_master() {
        let reg = registry_with(2, 0).await;
        let topo = ClusterTopology::compute(&reg, &ClusterConfig::default()).await.unwrap();
        assert_eq!(topo.topology_type, TopologyType::MasterMaster);
    }

    #[tokio::test]
    async fn three_or_more_masters_is_multi_master() {
        let reg = registry_with(3, 0).await;
        let topo = ClusterTopology::compute(&reg, &ClusterConfig::default()).await.unwrap();
        assert_eq!(topo.topology_type, TopologyType::MultiMaster);
    }
}
