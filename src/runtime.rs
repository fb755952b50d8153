//! Cluster runtime: owns every coordination component, wires them
//! together from `ClusterConfig`, and supervises their background loops.
//!
//! One `watch::Sender<bool>` broadcasts shutdown to every loop, each spawned
//! with `tokio::spawn`, generalized with a bounded-restart wrapper: a loop
//! that panics is restarted up to a fixed number of times before the runtime
//! gives up on it and raises a `TaskFailure` alert rather than silently
//! running degraded forever.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cache::{Cache, InMemoryCache};
use crate::cluster::health::{AlertType, HealthMonitor};
use crate::cluster::node::{NodeCapabilities, NodeRole};
use crate::cluster::registry::NodeRegistry;
use crate::cluster::LeaderElector;
use crate::config::{ClusterConfig, NodeRoleConfig};
use crate::error::Result;
use crate::migration::{
    AuditLogger, Exporter, Importer, InstanceRegistry, MigrationLock, RateLimiter, RollbackExecutor,
    ScheduleRegistry, TransferOrchestrator,
};
use crate::replication::conflict::ConflictResolver;
use crate::replication::engine::{HttpReplicationTransport, ReplicationEngine, ReplicationTransport};
use crate::replication::event::ConflictStrategy;
use crate::router::balancer::LoadBalancer;
use crate::router::circuit_breaker::CircuitBreaker;
use crate::router::router::Router;
use crate::store::Store;

const MAX_TASK_RESTARTS: u32 = 5;

/// Lightweight bundle of component handles for the HTTP layer, cheap to
/// clone and hand to every axum handler without cloning the runtime itself.
#[derive(Clone)]
pub struct ClusterHandle {
    pub config: Arc<ClusterConfig>,
    pub node_id: String,
    pub store: Arc<dyn Store>,
    pub cache: Arc<dyn Cache>,
    pub registry: Arc<NodeRegistry>,
    pub health: Arc<HealthMonitor>,
    pub elector: Arc<LeaderElector>,
    pub replication: Arc<ReplicationEngine>,
    pub router: Arc<Router>,
    pub migration_lock: Arc<MigrationLock>,
    pub rate_limiter: Arc<RateLimiter>,
    pub audit: Arc<AuditLogger>,
    pub exporter: Arc<Exporter>,
    pub importer: Arc<Importer>,
    pub rollback: Arc<RollbackExecutor>,
    pub instances: Arc<InstanceRegistry>,
    pub schedules: Arc<ScheduleRegistry>,
    pub transfers: Arc<TransferOrchestrator>,
    /// SHA-256 of the cluster auth token, used as the AES-256-GCM key that
    /// protects remote-instance API keys at rest.
    pub instance_key_material: [u8; 32],
    /// Accumulates inbound direct-transfer chunks keyed by `transfer_id:collection`
    /// until the sender marks one final, at which point the receiving handler
    /// drains and applies it.
    pub transfer_inbox: Arc<dashmap::DashMap<String, Vec<u8>>>,
}

pub struct ClusterRuntime {
    handle: ClusterHandle,
    shutdown_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterRuntime {
    pub fn new(config: ClusterConfig, store: Arc<dyn Store>) -> Result<Self> {
        let node_id = config
            .cluster_node_id
            .clone()
            .unwrap_or_else(crate::util::new_id);
        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());
        let registry = Arc::new(NodeRegistry::new(store.clone()));
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            config.cluster_heartbeat_interval_seconds,
            config.cluster_failure_threshold,
            config.cluster_quorum_percentage,
        ));
        let elector = Arc::new(LeaderElector::new(
            registry.clone(),
            health.clone(),
            config.cluster_election_timeout_min_ms,
            config.cluster_election_timeout_max_ms,
        ));

        let transport: Arc<dyn ReplicationTransport> = Arc::new(HttpReplicationTransport::new(
            config.cluster_auth_token.clone(),
            Duration::from_secs(config.cluster_request_timeout_seconds),
        ));
        let resolver = ConflictResolver::new(store.clone(), ConflictStrategy::LastWriteWins);
        let replication = Arc::new(ReplicationEngine::new(
            node_id.clone(),
            store.clone(),
            registry.clone(),
            transport,
            resolver,
            config.cluster_replication_mode,
        ));

        let balancer = LoadBalancer::new(config.cluster_load_balancing_algorithm, config.cluster_sticky_sessions);
        let circuit_breaker = CircuitBreaker::new(
            config.cluster_circuit_breaker_enabled,
            config.cluster_circuit_breaker_threshold,
            config.cluster_circuit_breaker_timeout_seconds,
        );
        let router = Arc::new(Router::new(
            node_id.clone(),
            registry.clone(),
            balancer,
            circuit_breaker,
            matches!(config.cluster_read_preference, crate::config::ReadPreference::Secondary),
            config.cluster_auth_token.clone(),
        ));

        let audit = Arc::new(AuditLogger::new(store.clone()));
        let migration_lock = Arc::new(MigrationLock::new(cache.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(
            cache.clone(),
            config.migration_rate_limit_hours,
            config.migration_rate_limit_max_per_window as u32,
        ));
        let exporter = Arc::new(Exporter::new(store.clone(), audit.clone(), &config));
        let importer = Arc::new(Importer::new(store.clone(), audit.clone(), config.clone()));
        let rollback = Arc::new(RollbackExecutor::new(store.clone(), audit.clone()));
        let instances = Arc::new(InstanceRegistry::new(store.clone()));
        let schedules = Arc::new(ScheduleRegistry::new(store.clone()));
        let transfers = Arc::new(TransferOrchestrator::new(store.clone(), reqwest::Client::new()));
        let instance_key_material = crate::util::sha256_key(config.cluster_auth_token.as_bytes());
        let transfer_inbox = Arc::new(dashmap::DashMap::new());

        let (shutdown_tx, _) = watch::channel(false);

        let handle = ClusterHandle {
            config: Arc::new(config),
            node_id,
            store,
            cache,
            registry,
            health,
            elector,
            replication,
            router,
            migration_lock,
            rate_limiter,
            audit,
            exporter,
            importer,
            rollback,
            instances,
            schedules,
            transfers,
            instance_key_material,
            transfer_inbox,
        };

        Ok(Self {
            handle,
            shutdown_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn handle(&self) -> ClusterHandle {
        self.handle.clone()
    }

    /// Registers this process as a node and starts every background loop:
    /// heartbeat, health sweeper, election, failover, replication dispatch,
    /// and (leader-only) change capture.
    pub async fn start(&self) -> Result<()> {
        let role = match self.handle.config.cluster_node_role {
            NodeRoleConfig::Master => NodeRole::Master,
            NodeRoleConfig::Replica => NodeRole::Replica,
            NodeRoleConfig::Standalone => NodeRole::Standalone,
        };
        let capabilities = NodeCapabilities {
            supports_writes: role != NodeRole::Replica,
            ..Default::default()
        };
        self.handle
            .registry
            .register(
                &self.handle.node_id,
                self.handle.config.cluster_advertise_address.split(':').next().unwrap_or("localhost"),
                self.handle
                    .config
                    .cluster_advertise_address
                    .rsplit(':')
                    .next()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(7890),
                role,
                capabilities,
                None,
                &self.handle.config.cluster_auth_token,
            )
            .await?;

        info!(node_id = %self.handle.node_id, "cluster runtime starting");

        let mut tasks = self.tasks.lock().unwrap();

        tasks.push(self.spawn_supervised("heartbeat", {
            let health = self.handle.health.clone();
            let node_id = self.handle.node_id.clone();
            let shutdown = self.shutdown_tx.subscribe();
            move || health.clone().run_heartbeat_loop(node_id.clone(), shutdown.clone())
        }));

        tasks.push(self.spawn_supervised("health-sweeper", {
            let health = self.handle.health.clone();
            let shutdown = self.shutdown_tx.subscribe();
            move || health.clone().run_sweeper_loop(shutdown.clone())
        }));

        tasks.push(self.spawn_supervised("election", {
            let elector = self.handle.elector.clone();
            let shutdown = self.shutdown_tx.subscribe();
            move || elector.clone().run_loop(shutdown.clone())
        }));

        tasks.push(self.spawn_supervised("failover", {
            let elector = self.handle.elector.clone();
            let cfg = self.handle.config.clone();
            let shutdown = self.shutdown_tx.subscribe();
            move || {
                elector.clone().run_failover_loop(
                    cfg.cluster_auto_failover,
                    cfg.cluster_promote_on_master_failure,
                    cfg.cluster_min_healthy_replicas,
                    cfg.cluster_failover_timeout_seconds,
                    cfg.cluster_heartbeat_interval_seconds,
                    shutdown.clone(),
                )
            }
        }));

        tasks.push(self.spawn_supervised("migration-scheduler", {
            let handle = self.handle.clone();
            let shutdown = self.shutdown_tx.subscribe();
            move || run_migration_scheduler_loop(handle.clone(), shutdown.clone())
        }));

        if self.handle.config.cluster_replication_enabled {
            tasks.push(self.spawn_supervised("replication-dispatch", {
                let replication = self.handle.replication.clone();
                let shutdown = self.shutdown_tx.subscribe();
                move || {
                    replication
                        .clone()
                        .run_dispatch_loop(Duration::from_secs(1), shutdown.clone())
                }
            }));

            if role == NodeRole::Master {
                tasks.push(self.spawn_supervised("replication-capture", {
                    let replication = self.handle.replication.clone();
                    let shutdown = self.shutdown_tx.subscribe();
                    move || replication.clone().run_capture_loop(shutdown.clone())
                }));
            }
        }

        Ok(())
    }

    fn spawn_supervised<F, Fut>(&self, name: &'static str, mut factory: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let health = self.handle.health.clone();
        tokio::spawn(async move {
            let mut restarts = 0u32;
            loop {
                let join = tokio::spawn(factory());
                match join.await {
                    Ok(()) => return,
                    Err(e) if e.is_panic() => {
                        restarts += 1;
                        error!(task = name, restarts, "supervised task panicked");
                        if restarts > MAX_TASK_RESTARTS {
                            let _ = health
                                .raise_alert(
                                    AlertType::TaskFailure,
                                    name,
                                    "background task died",
                                    &format!("{name} exceeded {MAX_TASK_RESTARTS} restarts and was not revived"),
                                )
                                .await;
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        })
    }

    /// Signals every background loop to stop and waits for them to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles = std::mem::take(&mut *self.tasks.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        info!(node_id = %self.handle.node_id, "cluster runtime stopped");
    }
}

/// Polls `ScheduleRegistry::due` once a minute and drives each due schedule's
/// direct transfer to completion, recording the run regardless of outcome so
/// a failing target cannot spin the schedule in a tight retry loop.
async fn run_migration_scheduler_loop(handle: ClusterHandle, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => return,
        }
        if *shutdown.borrow() {
            return;
        }

        let due = match handle.schedules.due().await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "failed to list due migration schedules");
                continue;
            }
        };

        for schedule in due {
            let ran_at = crate::util::now_unix_seconds();
            if let Err(e) = run_scheduled_transfer(&handle, &schedule).await {
                error!(schedule_id = %schedule.schedule_id, error = %e, "scheduled transfer failed to run");
            }
            if let Err(e) = handle.schedules.record_run(&schedule.schedule_id, ran_at).await {
                error!(schedule_id = %schedule.schedule_id, error = %e, "failed to record schedule run");
            }
        }
    }
}

async fn run_scheduled_transfer(
    handle: &ClusterHandle,
    schedule: &crate::migration::ScheduledMigration,
) -> Result<()> {
    let target = handle.instances.require(&schedule.target_instance_id).await?;
    let api_key = handle.instances.decrypt_api_key(&target, &handle.instance_key_material)?;
    let record = crate::migration::TransferRecord::new_pending(
        &schedule.source_instance_id,
        &schedule.target_instance_id,
        schedule.collections.clone(),
        schedule.conflict_policy,
        None,
        &schedule.owner_id,
    );
    handle.transfers.create(&record).await?;
    handle
        .transfers
        .run(&record.transfer_id, &handle.store, &target, &api_key)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn start_registers_this_node_and_shutdown_stops_cleanly() {
        let mut cfg = ClusterConfig::default();
        cfg.cluster_node_id = Some("n1".to_string());
        cfg.cluster_heartbeat_interval_seconds = 1;
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let runtime = ClusterRuntime::new(cfg, store).unwrap();
        runtime.start().await.unwrap();

        let node = runtime.handle().registry.get_node("n1").await.unwrap();
        assert!(node.is_some());

        runtime.shutdown().await;
    }
}
