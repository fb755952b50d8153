//! Rollback: undoes a completed import by restoring the pre-import state
//! captured as a snapshot at import time. An import keeps enough of the
//! previous state to undo itself, rather than replaying the inverse of
//! every write.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ClusterError, Result};
use crate::migration::audit::{AuditLogger, SecurityEventType};
use crate::migration::package::{MigrationRecord, MigrationStatus, MIGRATIONS_COLLECTION};
use crate::store::Store;

pub const ROLLBACK_SNAPSHOTS_COLLECTION: &str = "migration_rollback_snapshots";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackEntry {
    pub collection: String,
    pub document_id: String,
    /// `None` means the document did not exist before the import, so
    /// rollback deletes it rather than restoring a previous value.
    pub previous_document: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackSnapshot {
    pub migration_id: String,
    pub entries: Vec<RollbackEntry>,
}

pub struct RollbackExecutor {
    store: Arc<dyn Store>,
    audit: Arc<AuditLogger>,
}

impl RollbackExecutor {
    pub fn new(store: Arc<dyn Store>, audit: Arc<AuditLogger>) -> Self {
        Self { store, audit }
    }

    pub async fn rollback(&self, migration_id: &str, requested_by: &str) -> Result<()> {
        self.audit
            .log_security_event(
                SecurityEventType::RollbackStarted,
                Some(requested_by),
                None,
                Some(migration_id),
                None,
                json!({}),
            )
            .await?;

        match self.execute(migration_id).await {
            Ok(()) => {
                self.audit
                    .log_security_event(
                        SecurityEventType::RollbackCompleted,
                        Some(requested_by),
                        None,
                        Some(migration_id),
                        None,
                        json!({}),
                    )
                    .await?;
                Ok(())
            }
            Err(e) => {
                self.audit
                    .log_security_event(
                        SecurityEventType::RollbackFailed,
                        Some(requested_by),
                        None,
                        Some(migration_id),
                        None,
                        json!({"error": e.to_string()}),
                    )
                    .await?;
                Err(e)
            }
        }
    }

    async fn execute(&self, migration_id: &str) -> Result<()> {
        let snapshot_doc = self
            .store
            .get(ROLLBACK_SNAPSHOTS_COLLECTION, migration_id)
            .await?
            .ok_or_else(|| ClusterError::NotFound(format!("rollback snapshot for {migration_id}")))?;
        let snapshot: RollbackSnapshot = serde_json::from_value(snapshot_doc)?;

        for entry in snapshot.entries.iter().rev() {
            match &entry.previous_document {
                Some(doc) => {
                    self.store.replace(&entry.collection, &entry.document_id, doc.clone()).await?;
                }
                None => {
                    let _ = self.store.delete(&entry.collection, &entry.document_id).await;
                }
            }
        }

        if let Some(record_doc) = self.store.get(MIGRATIONS_COLLECTION, migration_id).await? {
            let mut record: MigrationRecord = serde_json::from_value(record_doc)?;
            record.status = MigrationStatus::RolledBack;
            record.updated_at = crate::util::now_unix_seconds();
            self.store
                .replace(MIGRATIONS_COLLECTION, migration_id, serde_json::to_value(&record)?)
                .await?;
        }

        self.store.delete(ROLLBACK_SNAPSHOTS_COLLECTION, migration_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn rollback_restores_overwritten_document_and_deletes_new_one() {
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(AuditLogger::new(store.clone()));
        store.insert("users", "u1", json!({"name": "original"})).await.unwrap();

        let snapshot = RollbackSnapshot {
            migration_id: "mig-1".to_string(),
            entries: vec![
                RollbackEntry {
                    collection: "users".to_string(),
                    document_id: "u1".to_string(),
                    previous_document: Some(json!({"name": "original"})),
                },
                RollbackEntry {
                    collection: "users".to_string(),
                    document_id: "u2".to_string(),
                    previous_document: None,
                },
            ],
        };
        store
            .insert(ROLLBACK_SNAPSHOTS_COLLECTION, "mig-1", serde_json::to_value(&snapshot).unwrap())
            .await
            .unwrap();
        store
            .replace("users", "u1", json!({"name": "overwritten"}))
            .await
            .unwrap();
        store.insert("users", "u2", json!({"name": "new"})).await.unwrap();

        let executor = RollbackExecutor::new(store.clone(), audit);
        executor.rollback("mig-1", "admin").await.unwrap();

        let got = store.get("users", "u1").await.unwrap().unwrap();
        assert_eq!(got["name"], json!("original"));
        assert!(store.get("users", "u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rollback_without_a_snapshot_fails() {
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(AuditLogger::new(store.clone()));
        let executor = RollbackExecutor::new(store, audit);
        let err = executor.rollback("unknown", "admin").await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }
}
