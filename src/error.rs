//! Crate-wide error type.
//!
//! One enum, one variant per failure condition named in the coordination
//! subsystem's error handling design: transport, authn/authz, validation,
//! consistency, concurrency, replication, and fatal-at-startup conditions.
//! Component boundaries return `Result<T>`; the HTTP layer (see
//! `crate::api`) is the only place that maps a variant to a status code.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("decompression bomb detected: {0}")]
    DecompressionBomb(String),

    #[error("no quorum: {0}")]
    NoQuorum(String),

    #[error("split-brain unresolved: {0}")]
    SplitBrain(String),

    #[error("node not healthy: {0}")]
    NotHealthy(String),

    #[error("migration lock busy for tenant {0}")]
    LockBusy(String),

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("replication conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}
