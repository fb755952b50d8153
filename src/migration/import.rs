//! Import pipeline: validate an uploaded package (checksum before structure
//! before content), apply its documents under a conflict resolution policy,
//! and snapshot enough pre-import state that `rollback` can undo it.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::migration::audit::{AuditLogger, SecurityEventType};
use crate::migration::package::{
    Compression, ConflictResolutionPolicy, MigrationPackage, MigrationRecord, MigrationStatus, MigrationType,
    MIGRATIONS_COLLECTION,
};
use crate::migration::rollback::{RollbackSnapshot, ROLLBACK_SNAPSHOTS_COLLECTION};
use crate::migration::security;
use crate::store::Store;

pub struct ImportRequest {
    pub tenant_id: Option<String>,
    pub requested_by: String,
    pub package_bytes: Vec<u8>,
    pub expected_checksum: Option<String>,
    pub encryption_key: Option<[u8; 32]>,
    pub compression: Compression,
    pub conflict_policy: ConflictResolutionPolicy,
}

pub struct ImportOutcome {
    pub record: MigrationRecord,
    pub imported: u64,
    pub skipped: u64,
}

pub struct Importer {
    store: Arc<dyn Store>,
    audit: Arc<AuditLogger>,
    cfg: ClusterConfig,
    storage_dir: PathBuf,
}

impl Importer {
    pub fn new(store: Arc<dyn Store>, audit: Arc<AuditLogger>, cfg: ClusterConfig) -> Self {
        let storage_dir = PathBuf::from(&cfg.migration_storage_dir);
        Self {
            store,
            audit,
            cfg,
            storage_dir,
        }
    }

    pub async fn import(&self, request: ImportRequest) -> Result<ImportOutcome> {
        let mut record = MigrationRecord::new_pending(
            MigrationType::Import,
            &request.requested_by,
            request.tenant_id.clone(),
        );
        record.status = MigrationStatus::InProgress;
        self.persist_record(&record).await?;

        self.audit
            .log_security_event(
                SecurityEventType::ImportStarted,
                Some(&request.requested_by),
                request.tenant_id.as_deref(),
                Some(&record.migration_id),
                None,
                json!({"bytes": request.package_bytes.len()}),
            )
            .await?;

        match self.validate_and_apply(&request, &mut record).await {
            Ok((imported, skipped)) => {
                record.status = MigrationStatus::Completed;
                record.progress = 1.0;
                record.completed_at = Some(crate::util::now_unix_seconds());
                record.rollback_available = true;
                self.persist_record(&record).await?;
                self.audit
                    .log_security_event(
                        SecurityEventType::ImportCompleted,
                        Some(&request.requested_by),
                        request.tenant_id.as_deref(),
                        Some(&record.migration_id),
                        None,
                        json!({"imported": imported, "skipped": skipped}),
                    )
                    .await?;
                Ok(ImportOutcome { record, imported, skipped })
            }
            Err(e) => {
                record.status = MigrationStatus::Failed;
                record.error_message = Some(e.to_string());
                self.persist_record(&record).await?;
                let event_type = match &e {
                    ClusterError::ChecksumMismatch { .. } => SecurityEventType::ChecksumMismatch,
                    ClusterError::DecompressionBomb(_) => SecurityEventType::DecompressionBombDetected,
                    ClusterError::Encryption(_) => SecurityEventType::DecryptionFailed,
                    ClusterError::Validation(_) => SecurityEventType::FileValidationFailed,
                    _ => SecurityEventType::ImportFailed,
                };
                self.audit
                    .log_security_event(
                        event_type,
                        Some(&request.requested_by),
                        request.tenant_id.as_deref(),
                        Some(&record.migration_id),
                        None,
                        json!({"error": e.to_string()}),
                    )
                    .await?;
                Err(e)
            }
        }
    }

    async fn validate_and_apply(&self, request: &ImportRequest, record: &mut MigrationRecord) -> Result<(u64, u64)> {
        let compressed = match request.encryption_key {
            Some(key) => security::decrypt(&request.package_bytes, &key)?,
            None => request.package_bytes.clone(),
        };

        let body = security::decompress(&compressed, request.compression, &self.cfg)?;

        if let Some(expected) = &request.expected_checksum {
            security::verify_checksum(&body, expected)?;
        }

        let package: MigrationPackage = serde_json::from_slice(&body)?;
        security::validate_package_structure(&package)?;

        record.metadata = json!({"collections": package.metadata.collections.iter().map(|c| &c.name).collect::<Vec<_>>()});

        let mut snapshot = RollbackSnapshot {
            migration_id: record.migration_id.clone(),
            entries: Vec::new(),
        };

        let mut imported = 0u64;
        let mut skipped = 0u64;

        for block in &package.collections {
            for doc in &block.documents {
                let id = doc
                    .get("_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(crate::util::new_id);

                let existing = self.store.get(&block.collection_name, &id).await?;
                snapshot.entries.push(crate::migration::rollback::RollbackEntry {
                    collection: block.collection_name.clone(),
                    document_id: id.clone(),
                    previous_document: existing.clone(),
                });

                match (existing, request.conflict_policy) {
                    (Some(_), ConflictResolutionPolicy::Skip) => {
                        skipped += 1;
                        continue;
                    }
                    (Some(_), ConflictResolutionPolicy::Fail) => {
                        return Err(ClusterError::Conflict(format!(
                            "document {id} already exists in {}",
                            block.collection_name
                        )));
                    }
                    (Some(_), ConflictResolutionPolicy::Overwrite) => {
                        self.store.replace(&block.collection_name, &id, doc.clone()).await?;
                    }
                    (None, _) => {
                        self.store.insert(&block.collection_name, &id, doc.clone()).await?;
                    }
                }
                imported += 1;
            }
        }

        let snapshot_value = serde_json::to_value(&snapshot)?;
        self.store
            .insert(ROLLBACK_SNAPSHOTS_COLLECTION, &record.migration_id, snapshot_value)
            .await?;
        record.rollback_data_path = Some(record.migration_id.clone());

        Ok((imported, skipped))
    }

    async fn persist_record(&self, record: &MigrationRecord) -> Result<()> {
        let value = serde_json::to_value(record)?;
        match self.store.get(MIGRATIONS_COLLECTION, &record.migration_id).await? {
            Some(_) => self.store.replace(MIGRATIONS_COLLECTION, &record.migration_id, value).await,
            None => self.store.insert(MIGRATIONS_COLLECTION, &record.migration_id, value).await,
        }
    }

    pub async fn read_package_file(&self, migration_id: &str) -> Result<Vec<u8>> {
        let path = self.storage_dir.join(format!("{migration_id}.pkg"));
        Ok(tokio::fs::read(path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::export::{ExportRequest, Exporter};
    use crate::migration::package::Compression;
    use crate::store::InMemoryStore;
    use serde_json::json;
    use tempfile::tempdir;

    async fn harness() -> (Exporter, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(AuditLogger::new(store.clone()));
        let mut cfg = ClusterConfig::default();
        cfg.migration_storage_dir = dir.path().to_string_lossy().into_owned();
        store.insert("users", "u1", json!({"_id": "u1", "name": "alice"})).await.unwrap();
        let exporter = Exporter::new(store.clone(), audit, &cfg);
        (exporter, dir)
    }

    #[tokio::test]
    async fn import_inserts_new_documents_into_target_store() {
        let (exporter, _dir) = harness().await;
        let export_record = exporter
            .export(ExportRequest {
                tenant_id: None,
                collections: vec!["users".to_string()],
                requested_by: "admin".to_string(),
                compression: Compression::Gzip,
                encryption_key: None,
                description: None,
            })
            .await
            .unwrap();
        let bytes = tokio::fs::read(export_record.package_file_path.unwrap()).await.unwrap();

        let target_store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(AuditLogger::new(target_store.clone()));
        let cfg = ClusterConfig::default();
        let target_importer = Importer::new(target_store.clone(), audit, cfg);

        let outcome = target_importer
            .import(ImportRequest {
                tenant_id: None,
                requested_by: "admin".to_string(),
                package_bytes: bytes,
                expected_checksum: None,
                encryption_key: None,
                compression: Compression::Gzip,
                conflict_policy: ConflictResolutionPolicy::Overwrite,
            })
            .await
            .unwrap();

        assert_eq!(outcome.imported, 1);
        let got = target_store.get("users", "u1").await.unwrap();
        assert_eq!(got.unwrap()["name"], json!("alice"));
    }

    #[tokio::test]
    async fn skip_policy_leaves_existing_documents_untouched() {
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(AuditLogger::new(store.clone()));
        let cfg = ClusterConfig::default();
        store.insert("users", "u1", json!({"_id": "u1", "name": "original"})).await.unwrap();
        let importer = Importer::new(store.clone(), audit, cfg);

        let package = crate::migration::package::MigrationPackage {
            metadata: crate::migration::package::PackageMetadata {
                version: "1".to_string(),
                system_version: "1".to_string(),
                export_timestamp: "now".to_string(),
                exported_by: "admin".to_string(),
                tenant_id: None,
                collections: vec![crate::migration::package::CollectionMetadata {
                    name: "users".to_string(),
                    document_count: 1,
                    size_bytes: 0,
                    checksum: String::new(),
                    indexes: vec![],
                }],
                total_documents: 1,
                total_size_bytes: 0,
                checksum: String::new(),
                compression: Compression::None,
                description: None,
            },
            collections: vec![crate::migration::package::CollectionExportData {
                collection_name: "users".to_string(),
                documents: vec![json!({"_id": "u1", "name": "incoming"})],
                indexes: vec![],
                metadata: json!({}),
            }],
        };
        let bytes = serde_json::to_vec(&package).unwrap();

        let outcome = importer
            .import(ImportRequest {
                tenant_id: None,
                requested_by: "admin".to_string(),
                package_bytes: bytes,
                expected_checksum: None,
                encryption_key: None,
                compression: Compression::None,
                conflict_policy: ConflictResolutionPolicy::Skip,
            })
            .await
            .unwrap();

        assert_eq!(outcome.skipped, 1);
        let got = store.get("users", "u1").await.unwrap().unwrap();
        assert_eq!(got["name"], json!("original"));
    }
}
