//! Migration package data model: metadata, per-collection export blocks, and
//! the on-disk record that tracks a migration's lifecycle.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MIGRATIONS_COLLECTION: &str = "migrations";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Gzip
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationType {
    Export,
    Import,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolutionPolicy {
    Skip,
    Overwrite,
    Fail,
}

impl Default for ConflictResolutionPolicy {
    fn default() -> Self {
        ConflictResolutionPolicy::Skip
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub name: String,
    pub document_count: u64,
    pub size_bytes: u64,
    pub checksum: String,
    pub indexes: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub version: String,
    pub system_version: String,
    pub export_timestamp: String,
    pub exported_by: String,
    pub tenant_id: Option<String>,
    pub collections: Vec<CollectionMetadata>,
    pub total_documents: u64,
    pub total_size_bytes: u64,
    pub checksum: String,
    pub compression: Compression,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionExportData {
    pub collection_name: String,
    pub documents: Vec<Value>,
    pub indexes: Vec<Value>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPackage {
    pub metadata: PackageMetadata,
    pub collections: Vec<CollectionExportData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub migration_id: String,
    pub migration_type: MigrationType,
    pub status: MigrationStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    pub created_by: String,
    pub tenant_id: Option<String>,
    pub metadata: Value,
    pub progress: f64,
    pub package_file_path: Option<String>,
    pub package_size_bytes: Option<u64>,
    pub package_checksum: Option<String>,
    pub rollback_available: bool,
    pub rollback_data_path: Option<String>,
    pub error_message: Option<String>,
    pub error_details: Option<Value>,
}

impl MigrationRecord {
    pub fn new_pending(migration_type: MigrationType, created_by: &str, tenant_id: Option<String>) -> Self {
        let now = crate::util::now_unix_seconds();
        Self {
            migration_id: format!("mig-{}", crate::util::new_id()),
            migration_type,
            status: MigrationStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            created_by: created_by.to_string(),
            tenant_id,
            metadata: Value::Null,
            progress: 0.0,
            package_file_path: None,
            package_size_bytes: None,
            package_checksum: None,
            rollback_available: false,
            rollback_data_path: None,
            error_message: None,
            error_details: None,
        }
    }
}
