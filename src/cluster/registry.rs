//! Node registry. Stores node identity, role, health, and capabilities
//! in the `cluster_nodes` collection; tracks the cached leader id; records a
//! `ClusterEvent` for every registration and role change. Built on the
//! `Store` trait so the registry is agnostic to the persistence backend.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::cluster::node::{
    ClusterEvent, ClusterEventType, HealthMetrics, Node, NodeCapabilities, NodeRole,
    NodeStatus, ReplicationMetrics,
};
use crate::error::{ClusterError, Result};
use crate::store::Store;
use crate::util::{new_id, now_unix_seconds, sha256_hex};

pub const NODES_COLLECTION: &str = "cluster_nodes";
pub const EVENTS_COLLECTION: &str = "cluster_events";

pub struct NodeRegistry {
    store: Arc<dyn Store>,
    /// Cached current leader, consulted before falling back to election.
    current_leader: RwLock<Option<String>>,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            current_leader: RwLock::new(None),
        }
    }

    async fn record_event(
        &self,
        event_type: ClusterEventType,
        node_id: &str,
        details: Value,
    ) -> Result<()> {
        let event = ClusterEvent {
            event_id: new_id(),
            event_type,
            node_id: node_id.to_string(),
            timestamp: now_unix_seconds(),
            details,
        };
        self.store
            .insert(EVENTS_COLLECTION, &event.event_id, serde_json::to_value(&event)?)
            .await
    }

    fn load_node(doc: Value) -> Result<Node> {
        serde_json::from_value(doc).map_err(|e| ClusterError::Internal(e.to_string()))
    }

    /// Idempotent upsert by `node_id`: if the node already exists its fields
    /// are overwritten with the passed values, else a new row is created
    /// with status `joining` before transitioning to `healthy`.
    #[allow(clippy::too_many_arguments)]
    pub async fn register(
        &self,
        node_id: &str,
        hostname: &str,
        port: u16,
        role: NodeRole,
        capabilities: NodeCapabilities,
        owner_user_id: Option<String>,
        cluster_token: &str,
    ) -> Result<String> {
        let now = now_unix_seconds();
        let existing = self.store.get(NODES_COLLECTION, node_id).await?;
        let created_at = existing
            .as_ref()
            .and_then(|v| v.get("created_at"))
            .and_then(|v| v.as_i64())
            .unwrap_or(now);

        let node = Node {
            node_id: node_id.to_string(),
            hostname: hostname.to_string(),
            port,
            role,
            status: NodeStatus::Joining,
            capabilities,
            health: HealthMetrics::default(),
            replication: ReplicationMetrics::default(),
            owner_user_id,
            hashed_cluster_token: sha256_hex(cluster_token.as_bytes()),
            created_at,
            updated_at: now,
        };
        let doc = serde_json::to_value(&node)?;
        if existing.is_some() {
            self.store.replace(NODES_COLLECTION, node_id, doc).await?;
        } else {
            self.store.insert(NODES_COLLECTION, node_id, doc).await?;
        }

        // First successful registration transitions joining -> healthy.
        self.update_status(node_id, NodeStatus::Healthy).await?;
        self.record_event(
            ClusterEventType::NodeRegistered,
            node_id,
            json!({"hostname": hostname, "port": port}),
        )
        .await?;
        Ok(node_id.to_string())
    }

    pub async fn get_node(&self, node_id: &str) -> Result<Option<Node>> {
        match self.store.get(NODES_COLLECTION, node_id).await? {
            Some(doc) => Ok(Some(Self::load_node(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn list_nodes(
        &self,
        role: Option<NodeRole>,
        status: Option<NodeStatus>,
    ) -> Result<Vec<Node>> {
        let docs = self.store.list(NODES_COLLECTION).await?;
        let mut nodes = Vec::with_capacity(docs.len());
        for (_, doc) in docs {
            let node = Self::load_node(doc)?;
            if role.is_some_and(|r| r != node.role) {
                continue;
            }
            if status.is_some_and(|s| s != node.status) {
                continue;
            }
            nodes.push(node);
        }
        Ok(nodes)
    }

    pub async fn remove_node(&self, node_id: &str) -> Result<()> {
        self.store.delete(NODES_COLLECTION, node_id).await?;
        self.record_event(ClusterEventType::NodeRemoved, node_id, json!({}))
            .await?;
        let mut leader = self.current_leader.write();
        if leader.as_deref() == Some(node_id) {
            *leader = None;
        }
        Ok(())
    }

    pub async fn update_status(&self, node_id: &str, status: NodeStatus) -> Result<()> {
        let mut node = self
            .get_node(node_id)
            .await?
            .ok_or_else(|| ClusterError::NotFound(format!("node {node_id}")))?;
        node.status = status;
        node.updated_at = now_unix_seconds();
        self.store
            .replace(NODES_COLLECTION, node_id, serde_json::to_value(&node)?)
            .await
    }

    /// Already master is a no-op success. Not healthy + not forced fails.
    /// Otherwise sets role=master, enables writes, bumps priority to 100.
    pub async fn promote(&self, node_id: &str, force: bool) -> Result<bool> {
        let mut node = self
            .get_node(node_id)
            .await?
            .ok_or_else(|| ClusterError::NotFound(format!("node {node_id}")))?;
        if node.role == NodeRole::Master {
            return Ok(true);
        }
        if node.status != NodeStatus::Healthy && !force {
            return Err(ClusterError::NotHealthy(node_id.to_string()));
        }
        node.role = NodeRole::Master;
        node.capabilities.supports_writes = true;
        node.capabilities.priority = 100;
        node.updated_at = now_unix_seconds();
        self.store
            .replace(NODES_COLLECTION, node_id, serde_json::to_value(&node)?)
            .await?;
        self.record_event(ClusterEventType::NodePromoted, node_id, json!({"force": force}))
            .await?;
        *self.current_leader.write() = Some(node_id.to_string());
        Ok(true)
    }

    /// Mirrors `promote`: role=replica, writes disabled, priority to 50.
    pub async fn demote(&self, node_id: &str) -> Result<bool> {
        let mut node = self
            .get_node(node_id)
            .await?
            .ok_or_else(|| ClusterError::NotFound(format!("node {node_id}")))?;
        if node.role == NodeRole::Replica {
            return Ok(true);
        }
        node.role = NodeRole::Replica;
        node.capabilities.supports_writes = false;
        node.capabilities.priority = 50;
        node.updated_at = now_unix_seconds();
        self.store
            .replace(NODES_COLLECTION, node_id, serde_json::to_value(&node)?)
            .await?;
        self.record_event(ClusterEventType::NodeDemoted, node_id, json!({}))
            .await?;
        let mut leader = self.current_leader.write();
        if leader.as_deref() == Some(node_id) {
            *leader = None;
        }
        Ok(true)
    }

    /// Returns the cached leader id if set. Callers that need a guaranteed
    /// fresh answer should run the elector and call `set_cached_leader`.
    pub fn current_leader(&self) -> Option<String> {
        self.current_leader.read().clone()
    }

    pub fn set_cached_leader(&self, node_id: Option<String>) {
        *self.current_leader.write() = node_id;
    }

    pub async fn record_leader_elected(&self, node_id: &str) -> Result<()> {
        self.record_event(ClusterEventType::LeaderElected, node_id, json!({}))
            .await
    }

    /// Exposes the underlying store so sibling components (health monitor,
    /// replication engine) can read/write the shared collections without
    /// each holding their own handle.
    pub fn store_handle(&self) -> Arc<dyn Store> {
        self.store.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn register_is_idempotent_and_transitions_to_healthy() {
        let reg = registry();
        reg.register(
            "n1",
            "host1",
            7890,
            NodeRole::Replica,
            NodeCapabilities::default(),
            None,
            "tok",
        )
        .await
        .unwrap();
        let node = reg.get_node("n1").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Healthy);
        assert_ne!(node.hashed_cluster_token, "tok");

        reg.register(
            "n1",
            "host1-renamed",
            7891,
            NodeRole::Replica,
            NodeCapabilities::default(),
            None,
            "tok",
        )
        .await
        .unwrap();
        let node = reg.get_node("n1").await.unwrap().unwrap();
        assert_eq!(node.hostname, "host1-renamed");
    }

    #[tokio::test]
    async fn promote_requires_healthy_unless_forced() {
        let reg = registry();
        reg.register(
            "n1",
            "h",
            1,
            NodeRole::Replica,
            NodeCapabilities::default(),
            None,
            "t",
        )
        .await
        .unwrap();
        reg.update_status("n1", NodeStatus::Unhealthy).await.unwrap();

        let err = reg.promote("n1", false).await.unwrap_err();
        assert!(matches!(err, ClusterError::NotHealthy(_)));

        assert!(reg.promote("n1", true).await.unwrap());
        let node = reg.get_node("n1").await.unwrap().unwrap();
        assert_eq!(node.role, NodeRole::Master);
        assert!(node.capabilities.supports_writes);
        assert_eq!(node.capabilities.priority, 100);
    }

    #[tokio::test]
    async fn demote_clears_cached_leader() {
        let reg = registry();
        reg.register(
            "n1",
            "h",
            1,
            NodeRole::Replica,
            NodeCapabilities::default(),
            None,
            "t",
        )
        .await
        .unwrap();
        reg.promote("n1", true).await.unwrap();
        assert_eq!(reg.current_leader(), Some("n1".to_string()));

        reg.demote("n1").await.unwrap();
        assert_eq!(reg.current_leader(), None);
        let node = reg.get_node("n1").await.unwrap().unwrap();
        assert_eq!(node.role, NodeRole::Replica);
        assert!(!node.capabilities.supports_writes);
    }

    #[tokio::test]
    async fn list_nodes_filters_by_role_and_status() {
        let reg = registry();
        reg.register(
            "n1",
            "h",
            1,
            NodeRole::Master,
            NodeCapabilities::default(),
            None,
            "t",
        )
        .await
        .unwrap();
        reg.register(
            "n2",
            "h",
            1,
            NodeRole::Replica,
            NodeCapabilities::default(),
            None,
            "t",
        )
        .await
        .unwrap();

        let masters = reg.list_nodes(Some(NodeRole::Master), None).await.unwrap();
        assert_eq!(masters.len(), 1);
        assert_eq!(masters[0].node_id, "n1");

        let healthy = reg
            .list_nodes(None, Some(NodeStatus::Healthy))
            .await
            .unwrap();
        assert_eq!(healthy.len(), 2);
    }
}
