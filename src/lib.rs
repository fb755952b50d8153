//! clusterd - cluster coordination and data-replication subsystem for a
//! multi-node document-store platform: membership, health and quorum,
//! leader election and failover, replication, request routing and load
//! balancing, and a migration pipeline for moving tenant data between
//! clusters.

pub mod api;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod migration;
pub mod replication;
pub mod router;
pub mod runtime;
pub mod store;
pub mod util;

pub use config::ClusterConfig;
pub use error::{ClusterError, Result};
pub use runtime::{ClusterHandle, ClusterRuntime};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
