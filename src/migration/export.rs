//! Export pipeline: snapshot one or more collections into a
//! `MigrationPackage` by reading everything in each collection as of now,
//! optionally compress and encrypt it, assemble metadata and a checksum,
//! and persist the result to `migration_storage_dir`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::migration::audit::{AuditLogger, SecurityEventType};
use crate::migration::package::{
    CollectionExportData, CollectionMetadata, Compression, MigrationPackage, MigrationRecord,
    MigrationStatus, MigrationType, PackageMetadata, MIGRATIONS_COLLECTION,
};
use crate::migration::security;
use crate::store::Store;

pub const SYSTEM_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct ExportRequest {
    pub tenant_id: Option<String>,
    pub collections: Vec<String>,
    pub requested_by: String,
    pub compression: Compression,
    pub encryption_key: Option<[u8; 32]>,
    pub description: Option<String>,
}

pub struct Exporter {
    store: Arc<dyn Store>,
    audit: Arc<AuditLogger>,
    storage_dir: PathBuf,
}

impl Exporter {
    pub fn new(store: Arc<dyn Store>, audit: Arc<AuditLogger>, cfg: &ClusterConfig) -> Self {
        Self {
            store,
            audit,
            storage_dir: PathBuf::from(&cfg.migration_storage_dir),
        }
    }

    fn package_path(&self, migration_id: &str) -> PathBuf {
        self.storage_dir.join(format!("{migration_id}.pkg"))
    }

    pub async fn export(&self, request: ExportRequest) -> Result<MigrationRecord> {
        let mut record = MigrationRecord::new_pending(
            MigrationType::Export,
            &request.requested_by,
            request.tenant_id.clone(),
        );
        record.status = MigrationStatus::InProgress;
        self.persist_record(&record).await?;

        self.audit
            .log_security_event(
                SecurityEventType::ExportStarted,
                Some(&request.requested_by),
                request.tenant_id.as_deref(),
                Some(&record.migration_id),
                None,
                json!({"collections": request.collections}),
            )
            .await?;

        match self.build_and_write_package(&request, &record.migration_id).await {
            Ok((size_bytes, checksum)) => {
                record.status = MigrationStatus::Completed;
                record.progress = 1.0;
                record.completed_at = Some(crate::util::now_unix_seconds());
                record.package_file_path = Some(self.package_path(&record.migration_id).to_string_lossy().into_owned());
                record.package_size_bytes = Some(size_bytes);
                record.package_checksum = Some(checksum);
                self.persist_record(&record).await?;
                self.audit
                    .log_security_event(
                        SecurityEventType::ExportCompleted,
                        Some(&request.requested_by),
                        request.tenant_id.as_deref(),
                        Some(&record.migration_id),
                        None,
                        json!({"size_bytes": size_bytes}),
                    )
                    .await?;
                Ok(record)
            }
            Err(e) => {
                record.status = MigrationStatus::Failed;
                record.error_message = Some(e.to_string());
                self.persist_record(&record).await?;
                self.audit
                    .log_security_event(
                        SecurityEventType::ExportFailed,
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

    async fn build_and_write_package(&self, request: &ExportRequest, migration_id: &str) -> Result<(u64, String)> {
        let mut collection_blocks = Vec::new();
        let mut collection_meta = Vec::new();
        let mut total_documents: u64 = 0;

        for name in &request.collections {
            let rows = self.store.list(name).await?;
            let documents: Vec<_> = rows.iter().map(|(_, doc)| doc.clone()).collect();
            let encoded = serde_json::to_vec(&documents)?;
            collection_meta.push(CollectionMetadata {
                name: name.clone(),
                document_count: documents.len() as u64,
                size_bytes: encoded.len() as u64,
                checksum: security::checksum(&encoded),
                indexes: vec![],
            });
            total_documents += documents.len() as u64;
            collection_blocks.push(CollectionExportData {
                collection_name: name.clone(),
                documents,
                indexes: vec![],
                metadata: json!({}),
            });
        }

        let total_size_bytes = collection_meta.iter().map(|c| c.size_bytes).sum();
        let package_checksum = security::package_checksum(&collection_meta);

        let package = MigrationPackage {
            metadata: PackageMetadata {
                version: "1".to_string(),
                system_version: SYSTEM_VERSION.to_string(),
                export_timestamp: chrono::Utc::now().to_rfc3339(),
                exported_by: request.requested_by.clone(),
                tenant_id: request.tenant_id.clone(),
                collections: collection_meta,
                total_documents,
                total_size_bytes,
                checksum: package_checksum,
                compression: request.compression,
                description: request.description.clone(),
            },
            collections: collection_blocks,
        };

        let body = serde_json::to_vec(&package)?;
        let checksum = security::checksum(&body);
        let compressed = security::compress(&body, request.compression)?;
        let payload = match request.encryption_key {
            Some(key) => security::encrypt(&compressed, &key)?,
            None => compressed,
        };

        tokio::fs::create_dir_all(&self.storage_dir).await?;
        let path = self.package_path(migration_id);
        tokio::fs::write(&path, &payload).await?;
        Ok((payload.len() as u64, checksum))
    }

    async fn persist_record(&self, record: &MigrationRecord) -> Result<()> {
        let value = serde_json::to_value(record)?;
        match self.store.get(MIGRATIONS_COLLECTION, &record.migration_id).await? {
            Some(_) => self.store.replace(MIGRATIONS_COLLECTION, &record.migration_id, value).await,
            None => self.store.insert(MIGRATIONS_COLLECTION, &record.migration_id, value).await,
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }
}

pub fn validate_content_type(content_type: &str) -> Result<()> {
    const ALLOWED: &[&str] = &["application/gzip", "application/x-gzip", "application/octet-stream"];
    if ALLOWED.contains(&content_type) {
        Ok(())
    } else {
        Err(ClusterError::Validation(format!(
            "unsupported migration package content type: {content_type}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;
    use tempfile::tempdir;

    async fn exporter() -> (Exporter, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(AuditLogger::new(store.clone()));
        let mut cfg = ClusterConfig::default();
        cfg.migration_storage_dir = dir.path().to_string_lossy().into_owned();
        store.insert("users", "u1", json!({"name": "alice"})).await.unwrap();
        store.insert("users", "u2", json!({"name": "bob"})).await.unwrap();
        (Exporter::new(store, audit, &cfg), dir)
    }

    #[tokio::test]
    async fn export_writes_a_package_file_and_completes() {
        let (exporter, _dir) = exporter().await;
        let record = exporter
            .export(ExportRequest {
                tenant_id: Some("t1".to_string()),
                collections: vec!["users".to_string()],
                requested_by: "admin".to_string(),
                compression: Compression::Gzip,
                encryption_key: None,
                description: None,
            })
            .await
            .unwrap();
        assert_eq!(record.status, MigrationStatus::Completed);
        let path = record.package_file_path.unwrap();
        assert!(tokio::fs::metadata(&path).await.is_ok());
    }

    #[tokio::test]
    async fn export_encrypts_when_a_key_is_given() {
        let (exporter, _dir) = exporter().await;
        let record = exporter
            .export(ExportRequest {
                tenant_id: None,
                collections: vec!["users".to_string()],
                requested_by: "admin".to_string(),
                compression: Compression::None,
                encryption_key: Some([1u8; 32]),
                description: None,
            })
            .await
            .unwrap();
        let bytes = tokio::fs::read(record.package_file_path.unwrap()).await.unwrap();
        // Ciphertext should not contain the plaintext collection name.
        assert!(!bytes.windows(5).any(|w| w == b"users"));
    }

    #[test]
    fn content_type_allowlist_rejects_unknown_types() {
        assert!(validate_content_type("application/gzip").is_ok());
        assert!(validate_content_type("application/x-gzip").is_ok());
        assert!(validate_content_type("application/octet-stream").is_ok());
        assert!(validate_content_type("application/json").is_err());
        assert!(validate_content_type("text/html").is_err());
    }
}
