//! Replication engine: change capture on the leader, sequenced dispatch to
//! healthy replicas, idempotent apply, and conflict resolution.

pub mod conflict;
pub mod engine;
pub mod event;

pub use conflict::ConflictResolver;
pub use engine::{HttpReplicationTransport, LoopbackTransport, ReplicationEngine, ReplicationTransport};
pub use event::{
    ConflictStrategy, ConflictVersion, EventStatus, ReplicationConflict, ReplicationEvent,
    ReplicationOperation,
};
