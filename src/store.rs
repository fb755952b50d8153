//! The persistent document collection abstraction the rest of this crate
//! treats as an external dependency, not a general-purpose database engine
//! of its own. Defines the narrow trait the coordination subsystem needs
//! (CRUD by `_id`, listing, and a change stream) plus one in-memory
//! reference implementation sufficient to drive the engine and its tests.
//!
//! Collections are named maps of JSON documents keyed by `_id`, and changes
//! are published as a bounded, subscribable stream of `ChangeEvent`s
//! ordered by a monotonic cluster time.

use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{ClusterError, Result};

/// The names the change-capture loop must never subscribe to, and the
/// migration pipeline must never export/import. One table serves both
/// purposes.
pub const INTERNAL_COLLECTIONS: &[&str] = &[
    "cluster_nodes",
    "replication_log",
    "replication_conflicts",
    "cluster_events",
    "cluster_alerts",
    "migrations",
    "migration_transfers",
    "migration_instances",
    "scheduled_migrations",
    "migration_audit_log",
    "migration_rollback_snapshots",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
    Replace,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    pub collection: String,
    pub document_id: String,
    pub full_document: Option<Value>,
    pub cluster_time: u64,
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Narrow persistence trait the coordination subsystem depends on.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert(&self, collection: &str, id: &str, doc: Value) -> Result<()>;
    async fn update(&self, collection: &str, id: &str, fields: Value) -> Result<()>;
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;
    async fn replace(&self, collection: &str, id: &str, doc: Value) -> Result<()>;
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;
    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>>;
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Subscribe to a live feed of changes across all non-internal
    /// collections. Each call returns an independent receiver; events
    /// published before subscription are not replayed (matches the
    /// teacher's change-stream cursor semantics minus the resume token,
    /// which this crate does not need — capture always runs from "now").
    fn watch(&self) -> broadcast::Receiver<ChangeEvent>;
}

struct CollectionData {
    documents: DashMap<String, Value>,
}

/// In-memory reference `Store`. Good enough to drive `ReplicationEngine`,
/// `MigrationPipeline`, and their tests without a real database backend;
/// production deployments implement `Store` against their document engine.
pub struct InMemoryStore {
    collections: DashMap<String, Arc<CollectionData>>,
    changes_tx: broadcast::Sender<ChangeEvent>,
    // Serializes the "publish a change" step so cluster_time values are
    // strictly increasing even under concurrent writers.
    publish_lock: Mutex<()>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(4096);
        Self {
            collections: DashMap::new(),
            changes_tx: tx,
            publish_lock: Mutex::new(()),
        }
    }

    fn collection(&self, name: &str) -> Arc<CollectionData> {
        self.collections
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CollectionData {
                    documents: DashMap::new(),
                })
            })
            .clone()
    }

    fn publish(&self, collection: &str, operation: ChangeOperation, id: &str, doc: Option<Value>) {
        if INTERNAL_COLLECTIONS.contains(&collection) {
            return;
        }
        let _guard = self.publish_lock.lock();
        let event = ChangeEvent {
            operation,
            collection: collection.to_string(),
            document_id: id.to_string(),
            full_document: doc,
            cluster_time: now_micros(),
        };
        // No subscribers is not an error: capture may not have started yet.
        let _ = self.changes_tx.send(event);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        let col = self.collection(collection);
        if col.documents.contains_key(id) {
            return Err(ClusterError::AlreadyExists(format!(
                "document {id} already exists in {collection}"
            )));
        }
        col.documents.insert(id.to_string(), doc.clone());
        self.publish(collection, ChangeOperation::Insert, id, Some(doc));
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, fields: Value) -> Result<()> {
        let col = self.collection(collection);
        let mut entry = col
            .documents
            .get_mut(id)
            .ok_or_else(|| ClusterError::NotFound(format!("document {id} in {collection}")))?;
        if let (Value::Object(existing), Value::Object(patch)) = (&mut *entry, &fields) {
            for (k, v) in patch {
                existing.insert(k.clone(), v.clone());
            }
        } else {
            *entry = fields.clone();
        }
        let merged = entry.clone();
        drop(entry);
        self.publish(collection, ChangeOperation::Update, id, Some(merged));
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let col = self.collection(collection);
        col.documents
            .remove(id)
            .ok_or_else(|| ClusterError::NotFound(format!("document {id} in {collection}")))?;
        self.publish(collection, ChangeOperation::Delete, id, None);
        Ok(())
    }

    async fn replace(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        let col = self.collection(collection);
        col.documents.insert(id.to_string(), doc.clone());
        self.publish(collection, ChangeOperation::Replace, id, Some(doc));
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let col = self.collection(collection);
        Ok(col.documents.get(id).map(|d| d.clone()))
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let col = self.collection(collection);
        Ok(col
            .documents
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        Ok(self
            .collections
            .iter()
            .map(|e| e.key().clone())
            .filter(|name| !INTERNAL_COLLECTIONS.contains(&name.as_str()))
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn insert_then_get_roundtrips() {
        let store = InMemoryStore::new();
        store
            .insert("users", "u1", json!({"name": "a"}))
            .await
            .unwrap();
        let got = store.get("users", "u1").await.unwrap();
        assert_eq!(got, Some(json!({"name": "a"})));
    }

    #[tokio::test]
    async fn insert_duplicate_id_fails() {
        let store = InMemoryStore::new();
        store.insert("users", "u1", json!({})).await.unwrap();
        let err = store.insert("users", "u1", json!({})).await.unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let store = InMemoryStore::new();
        store
            .insert("users", "u1", json!({"name": "a", "age": 1}))
            .await
            .unwrap();
        store.update("users", "u1", json!({"age": 2})).await.unwrap();
        let got = store.get("users", "u1").await.unwrap().unwrap();
        assert_eq!(got["name"], json!("a"));
        assert_eq!(got["age"], json!(2));
    }

    #[tokio::test]
    async fn change_stream_emits_for_non_internal_collections_only() {
        let store = InMemoryStore::new();
        let mut rx = store.watch();
        store.insert("items", "d1", json!({"v": 1})).await.unwrap();
        store
            .insert("cluster_nodes", "n1", json!({}))
            .await
            .unwrap();

        let evt = rx.try_recv().expect("expected one event for items");
        assert_eq!(evt.collection, "items");
        assert!(rx.try_recv().is_err(), "internal collection must not publish");
    }

    #[tokio::test]
    async fn list_collections_excludes_internal_names() {
        let store = InMemoryStore::new();
        store.insert("items", "d1", json!({})).await.unwrap();
        store.insert("cluster_nodes", "n1", json!({})).await.unwrap();
        let cols = store.list_collections().await.unwrap();
        assert_eq!(cols, vec!["items".to_string()]);
    }
}
