//! Conflict resolution for concurrently-modified documents: last-write-wins
//! by timestamp (default), manual (persist a `ReplicationConflict` for
//! operator review, temporarily keep the first version), and custom
//! per-collection merge (user profiles merge non-null fields by recency,
//! else fall back to last-write-wins).

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::replication::event::{
    ConflictStrategy, ConflictVersion, ReplicationConflict, REPLICATION_CONFLICTS_COLLECTION,
};
use crate::store::Store;
use crate::util::{new_id, now_unix_seconds};

pub struct ConflictResolver {
    store: Arc<dyn Store>,
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    pub fn new(store: Arc<dyn Store>, strategy: ConflictStrategy) -> Self {
        Self { store, strategy }
    }

    pub async fn resolve(
        &self,
        collection: &str,
        document_id: &str,
        versions: Vec<ConflictVersion>,
    ) -> Result<Value> {
        if versions.is_empty() {
            return Err(crate::error::ClusterError::InvalidArgument(
                "no versions provided for conflict resolution".to_string(),
            ));
        }
        if versions.len() == 1 {
            return Ok(versions.into_iter().next().unwrap().data);
        }
        match self.strategy {
            ConflictStrategy::LastWriteWins => Ok(Self::last_write_wins(versions)),
            ConflictStrategy::Manual => {
                self.manual_resolution(collection, document_id, versions).await
            }
            ConflictStrategy::Custom => self.custom_resolution(collection, versions).await,
        }
    }

    fn last_write_wins(mut versions: Vec<ConflictVersion>) -> Value {
        versions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        versions.into_iter().next().unwrap().data
    }

    async fn manual_resolution(
        &self,
        collection: &str,
        document_id: &str,
        versions: Vec<ConflictVersion>,
    ) -> Result<Value> {
        let placeholder = versions[0].data.clone();
        let conflict = ReplicationConflict {
            conflict_id: new_id(),
            collection: collection.to_string(),
            document_id: document_id.to_string(),
            versions,
            resolved: false,
            created_at: now_unix_seconds(),
        };
        self.store
            .insert(
                REPLICATION_CONFLICTS_COLLECTION,
                &conflict.conflict_id,
                serde_json::to_value(&conflict)?,
            )
            .await?;
        Ok(placeholder)
    }

    async fn custom_resolution(&self, collection: &str, versions: Vec<ConflictVersion>) -> Result<Value> {
        if collection == "users" {
            return Ok(Self::merge_user_profile(versions));
        }
        Ok(Self::last_write_wins(versions))
    }

    /// Merges non-null fields across versions ordered by ascending
    /// timestamp, later non-null values winning per field.
    fn merge_user_profile(mut versions: Vec<ConflictVersion>) -> Value {
        versions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let mut merged = serde_json::Map::new();
        for version in versions {
            if let Value::Object(fields) = version.data {
                for (k, v) in fields {
                    if !v.is_null() {
                        merged.insert(k, v);
                    }
                }
            }
        }
        Value::Object(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn version(node: &str, ts: i64, data: Value) -> ConflictVersion {
        ConflictVersion {
            source_node_id: node.to_string(),
            timestamp: ts,
            data,
        }
    }

    #[tokio::test]
    async fn last_write_wins_picks_latest_timestamp() {
        let resolver = ConflictResolver::new(Arc::new(InMemoryStore::new()), ConflictStrategy::LastWriteWins);
        let versions = vec![
            version("a", 100, json!({"v": "old"})),
            version("b", 200, json!({"v": "new"})),
        ];
        let resolved = resolver.resolve("items", "d1", versions).await.unwrap();
        assert_eq!(resolved, json!({"v": "new"}));
    }

    #[tokio::test]
    async fn manual_resolution_persists_conflict_and_returns_first() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = ConflictResolver::new(store.clone(), ConflictStrategy::Manual);
        let versions = vec![
            version("a", 100, json!({"v": "first"})),
            version("b", 200, json!({"v": "second"})),
        ];
        let resolved = resolver.resolve("items", "d1", versions).await.unwrap();
        assert_eq!(resolved, json!({"v": "first"}));
        let stored = store.list(REPLICATION_CONFLICTS_COLLECTION).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn custom_resolution_merges_user_profile_fields_by_recency() {
        let resolver = ConflictResolver::new(Arc::new(InMemoryStore::new()), ConflictStrategy::Custom);
        let versions = vec![
            version("a", 100, json!({"name": "alice", "bio": "old bio"})),
            version("b", 200, json!({"bio": null, "age": 30})),
        ];
        let resolved = resolver.resolve("users", "u1", versions).await.unwrap();
        assert_eq!(resolved["name"], json!("alice"));
        assert_eq!(resolved["bio"], json!("old bio"));
        assert_eq!(resolved["age"], json!(30));
    }

    #[tokio::test]
    async fn custom_resolution_falls_back_to_lww_for_unknown_collections() {
        let resolver = ConflictResolver::new(Arc::new(InMemoryStore::new()), ConflictStrategy::Custom);
        let versions = vec![
            version("a", 100, json!({"v": "old"})),
            version("b", 200, json!({"v": "new"})),
        ];
        let resolved = resolver.resolve("widgets", "d1", versions).await.unwrap();
        assert_eq!(resolved, json!({"v": "new"}));
    }
}
