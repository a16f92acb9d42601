//! Migration replication loader.
//!
//! Keeps exactly one outgoing [`ReplicationSender`] per active migration whose
//! source is the local shard. Senders are keyed by their [`BucketMigration`]
//! descriptor; a topology change that supersedes a migration (new index, new
//! destination, ownership transferred) stops the old sender before a new one
//! starts.
//!
//! ```text
//!  TopologyHandle ──changed──► reconcile()
//!                                 │
//!            ┌────────────────────┼────────────────────┐
//!            ▼                    ▼                    ▼
//!     stop stale senders   restart finished     start missing senders
//! ```

use super::item::DocumentIdExtractor;
use super::sender::{
    MigrationItemFilter, ReplicationItemSource, ReplicationSender, ReplicationSink,
};
use crate::config::ReshardingConfig;
use crate::error::Result;
use crate::metrics::ReshardingMetrics;
use crate::sharding::{BucketMigration, ShardTopology, TopologyHandle};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Opens the outgoing channel of a migration.
#[async_trait::async_trait]
pub trait MigrationSinkFactory: Send + Sync + std::fmt::Debug {
    /// Connect to the destination node of `migration`.
    async fn connect(&self, migration: &BucketMigration) -> Result<Arc<dyn ReplicationSink>>;
}

type MigrationSender = ReplicationSender<MigrationItemFilter>;

#[derive(Debug)]
struct SenderHandle {
    sender: Arc<MigrationSender>,
    cancellation: CancellationToken,
    task: JoinHandle<Result<()>>,
}

/// What a reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Migrations whose sender was started.
    pub started: Vec<BucketMigration>,
    /// Migrations whose sender was stopped.
    pub stopped: Vec<BucketMigration>,
}

/// Owns the outgoing migration senders of one shard.
#[derive(Debug)]
pub struct MigrationReplicationLoader {
    config: ReshardingConfig,
    source: Arc<dyn ReplicationItemSource>,
    sinks: Arc<dyn MigrationSinkFactory>,
    extractor: Arc<dyn DocumentIdExtractor>,
    topology: Arc<TopologyHandle>,
    metrics: Arc<ReshardingMetrics>,
    senders: DashMap<BucketMigration, SenderHandle>,
    cancellation: CancellationToken,
}

impl MigrationReplicationLoader {
    /// Create a loader.
    pub fn new(
        config: ReshardingConfig,
        source: Arc<dyn ReplicationItemSource>,
        sinks: Arc<dyn MigrationSinkFactory>,
        extractor: Arc<dyn DocumentIdExtractor>,
        topology: Arc<TopologyHandle>,
        metrics: Arc<ReshardingMetrics>,
    ) -> Self {
        Self {
            config,
            source,
            sinks,
            extractor,
            topology,
            metrics,
            senders: DashMap::new(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Migrations the local shard must currently be sending.
    pub fn desired_migrations(&self, topology: &ShardTopology) -> Vec<BucketMigration> {
        let mut desired = Vec::new();
        for migration in topology.migrations() {
            if migration.source_shard != self.config.shard_number || !migration.is_active() {
                continue;
            }

            let Some(node) = topology.shard_members(migration.destination_shard).first() else {
                warn!(
                    bucket = migration.bucket,
                    destination_shard = migration.destination_shard,
                    "Destination shard has no members, cannot start migration sender"
                );
                continue;
            };

            match BucketMigration::new(
                migration.bucket,
                migration.destination_shard,
                node.clone(),
                migration.migration_index,
            ) {
                Ok(descriptor) => desired.push(descriptor),
                Err(e) => warn!(bucket = migration.bucket, error = %e, "Invalid migration"),
            }
        }
        desired
    }

    /// Bring running senders in line with `topology`.
    pub async fn reconcile(&self, topology: &ShardTopology) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let desired: HashSet<BucketMigration> =
            self.desired_migrations(topology).into_iter().collect();

        let stale: Vec<BucketMigration> = self
            .senders
            .iter()
            .filter(|entry| {
                let still_current = topology
                    .migration_for(entry.key().bucket())
                    .map(|m| m.is_active() && entry.key().for_bucket_migration(m))
                    .unwrap_or(false);
                !still_current || !desired.contains(entry.key()) || entry.value().task.is_finished()
            })
            .map(|entry| entry.key().clone())
            .collect();

        for migration in stale {
            if self.stop(&migration).await {
                report.stopped.push(migration);
            }
        }

        for migration in desired {
            if self.senders.contains_key(&migration) {
                continue;
            }
            self.start(migration.clone()).await?;
            report.started.push(migration);
        }

        Ok(report)
    }

    async fn start(&self, migration: BucketMigration) -> Result<()> {
        let sink = self.sinks.connect(&migration).await?;
        let filter = MigrationItemFilter::new(
            migration.clone(),
            self.extractor.clone(),
            self.config.replication.tag_failure_policy,
        );
        let sender = Arc::new(ReplicationSender::new(
            migration.describe(),
            filter,
            self.source.clone(),
            sink,
            self.topology.clone(),
            self.config.replication.clone(),
            self.metrics.clone(),
            0,
        ));

        let cancellation = self.cancellation.child_token();
        let task = {
            let sender = sender.clone();
            let cancellation = cancellation.clone();
            tokio::spawn(async move { sender.run(cancellation).await })
        };

        info!(
            bucket = migration.bucket(),
            destination_shard = migration.destination_shard(),
            destination_node = migration.destination_node(),
            migration_index = migration.migration_index(),
            "Started migration sender"
        );
        self.metrics.active_migration_senders.inc();
        self.senders.insert(
            migration,
            SenderHandle {
                sender,
                cancellation,
                task,
            },
        );
        Ok(())
    }

    async fn stop(&self, migration: &BucketMigration) -> bool {
        let Some((_, handle)) = self.senders.remove(migration) else {
            return false;
        };

        handle.cancellation.cancel();
        match handle.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(migration = %migration, error = %e, "Migration sender ended with error"),
            Err(e) => warn!(migration = %migration, error = %e, "Migration sender task panicked"),
        }

        self.metrics.active_migration_senders.dec();
        info!(
            bucket = migration.bucket(),
            migration_index = migration.migration_index(),
            last_etag = handle.sender.last_etag(),
            "Stopped migration sender"
        );
        true
    }

    /// Descriptors of the running senders.
    pub fn active_migrations(&self) -> Vec<BucketMigration> {
        self.senders.iter().map(|e| e.key().clone()).collect()
    }

    /// Last etag read by the sender of `migration`.
    pub fn sender_etag(&self, migration: &BucketMigration) -> Option<u64> {
        self.senders.get(migration).map(|h| h.sender.last_etag())
    }

    /// Reconcile on every topology change until cancelled.
    pub async fn run(&self, cancellation: CancellationToken) -> Result<()> {
        let mut seen = self.topology.version();
        let topology = self.topology.snapshot();
        if let Err(e) = self.reconcile(&topology).await {
            warn!(error = %e, "Initial migration sender reconcile failed");
        }

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                version = self.topology.changed(seen) => {
                    seen = version;
                    let topology = self.topology.snapshot();
                    match self.reconcile(&topology).await {
                        Ok(report) => debug!(
                            version,
                            started = report.started.len(),
                            stopped = report.stopped.len(),
                            "Reconciled migration senders"
                        ),
                        Err(e) => warn!(version, error = %e, "Migration sender reconcile failed"),
                    }
                }
            }
        }

        self.stop_all().await;
        Ok(())
    }

    /// Stop every sender.
    pub async fn stop_all(&self) {
        self.cancellation.cancel();
        let migrations = self.active_migrations();
        for migration in migrations {
            self.stop(&migration).await;
        }
    }
}
