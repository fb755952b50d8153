//! Migration pipeline: export/import of collections as encrypted,
//! compressed packages, node-to-node transfer, and rollback, gated by a
//! distributed lock and a per-user rate limiter with a full security audit
//! trail.

pub mod audit;
pub mod export;
pub mod import;
pub mod instance;
pub mod lock;
pub mod package;
pub mod rate_limit;
pub mod rollback;
pub mod schedule;
pub mod security;
pub mod transfer;

pub use audit::{AuditLogRecord, AuditLogger, SecurityEventType};
pub use export::{ExportRequest, Exporter};
pub use import::{ImportOutcome, ImportRequest, Importer};
pub use instance::{InstanceRegistry, RemoteInstance};
pub use lock::{LockGuard, MigrationLock};
pub use package::{
    CollectionExportData, CollectionMetadata, Compression, ConflictResolutionPolicy, MigrationPackage,
    MigrationRecord, MigrationStatus, MigrationType, PackageMetadata,
};
pub use rate_limit::RateLimiter;
pub use rollback::{RollbackEntry, RollbackExecutor, RollbackSnapshot};
pub use schedule::{ScheduleRegistry, ScheduledMigration};
pub use transfer::{
    MigrationTransfer, TransferControl, TransferHandle, TransferOrchestrator, TransferProgress, TransferRecord,
    TransferRecordStatus, TransferStatus,
};
