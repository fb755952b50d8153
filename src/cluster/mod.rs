//! Cluster coordination: node identity and membership, health and quorum,
//! and leader election. Replication, routing, and migration build on top
//! of these.

pub mod elector;
pub mod health;
pub mod node;
pub mod registry;
pub mod topology;

pub use elector::LeaderElector;
pub use health::{AlertSeverity, AlertType, ClusterAlert, ClusterHealthStatus, HealthMonitor};
pub use node::{
    ClusterEvent, ClusterEventType, HealthMetrics, Node, NodeCapabilities, NodeRole,
    NodeStatus, ReplicationMetrics,
};
pub use registry::NodeRegistry;
pub use topology::{ClusterTopology, FailoverConfig, LoadBalancingConfig, TopologyType};
