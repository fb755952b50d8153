//! Replication event and conflict record types, expressed as a tagged enum
//! per operation instead of a free-form untyped payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const REPLICATION_LOG_COLLECTION: &str = "replication_log";
pub const REPLICATION_CONFLICTS_COLLECTION: &str = "replication_conflicts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationOperation {
    Insert,
    Update,
    Delete,
    Replace,
}

impl From<crate::store::ChangeOperation> for ReplicationOperation {
    fn from(op: crate::store::ChangeOperation) -> Self {
        match op {
            crate::store::ChangeOperation::Insert => ReplicationOperation::Insert,
            crate::store::ChangeOperation::Update => ReplicationOperation::Update,
            crate::store::ChangeOperation::Delete => ReplicationOperation::Delete,
            crate::store::ChangeOperation::Replace => ReplicationOperation::Replace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Replicating,
    Replicated,
    Failed,
    Retrying,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationEvent {
    pub event_id: String,
    /// Monotonically increasing per `source_node_id`.
    pub sequence_number: u64,
    pub operation: ReplicationOperation,
    pub collection: String,
    pub document_id: String,
    pub payload: Option<Value>,
    pub timestamp: i64,
    pub source_node_id: String,
    pub target_node_ids: Vec<String>,
    pub status: EventStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub replicated_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    LastWriteWins,
    Manual,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictVersion {
    pub source_node_id: String,
    pub timestamp: i64,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConflict {
    pub conflict_id: String,
    pub collection: String,
    pub document_id: String,
    pub versions: Vec<ConflictVersion>,
    pub resolved: bool,
    pub created_at: i64,
}
