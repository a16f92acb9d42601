//! Resharding lifecycle handler.
//!
//! Reacts to each published topology on behalf of the local shard:
//!
//! - **Destination**, migration `Moved`, this node not yet confirmed: once the
//!   bucket's merged change vector already contains the source's final vector,
//!   confirm the move to the cluster.
//! - **Source**, migration `OwnershipTransferred`: delete the bucket's
//!   documents in batches up to the source's final vector, then report the
//!   cleanup to the cluster.
//!
//! Work for the same migration is never run twice concurrently.

use crate::change_vector::{ChangeVector, ChangeVectorMode, ConflictStatus};
use crate::config::ReshardingConfig;
use crate::error::Result;
use crate::metrics::ReshardingMetrics;
use crate::sharding::{MigrationStatus, ShardBucketMigration, ShardTopology, TopologyHandle};
use crate::types::{Bucket, MigrationIndex};
use dashmap::DashMap;
use std::hash::Hasher;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use twox_hash::XxHash64;
use tracing::{debug, info, warn};

/// Cluster commands issued by the lifecycle handler.
#[async_trait::async_trait]
pub trait ReshardingCluster: Send + Sync + std::fmt::Debug {
    /// Report that `node_tag` on the destination holds everything the source sent.
    async fn destination_migration_confirm(
        &self,
        database: &str,
        bucket: Bucket,
        migration_index: MigrationIndex,
        node_tag: &str,
    ) -> Result<()>;

    /// Report that `node_tag` on the source deleted the migrated bucket.
    async fn source_migration_cleanup(
        &self,
        database: &str,
        bucket: Bucket,
        migration_index: MigrationIndex,
        node_tag: &str,
    ) -> Result<()>;
}

/// Outcome of one bucket deletion transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteBucketResult {
    /// Nothing left in the bucket.
    Empty,
    /// Some documents are newer than the cut-off and were left in place.
    Skipped,
    /// The batch limit was reached; more documents remain.
    FullBatch,
}

/// Bucket-level storage operations.
#[async_trait::async_trait]
pub trait BucketStore: Send + Sync + std::fmt::Debug {
    /// Merge of the change vectors of every document in the bucket.
    async fn merged_change_vector_in_bucket(&self, bucket: Bucket) -> Result<String>;

    /// Delete up to `batch_size` documents of the bucket whose change vector is
    /// already merged into `upto_change_vector`.
    async fn delete_bucket(
        &self,
        bucket: Bucket,
        upto_change_vector: &str,
        batch_size: usize,
    ) -> Result<DeleteBucketResult>;
}

/// What one pass over the topology did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleReport {
    /// Moves confirmed at this destination.
    pub confirmed: Vec<(Bucket, MigrationIndex)>,
    /// Moves whose destination has not caught up yet.
    pub awaiting_catch_up: Vec<(Bucket, MigrationIndex)>,
    /// Buckets fully deleted and reported.
    pub cleaned: Vec<(Bucket, MigrationIndex)>,
    /// Buckets where some documents were left behind.
    pub partially_cleaned: Vec<(Bucket, MigrationIndex)>,
    /// Work skipped because it is already running.
    pub in_progress: Vec<(Bucket, MigrationIndex)>,
    /// Work that failed; retried on the next topology.
    pub failed: Vec<(Bucket, MigrationIndex)>,
}

enum CleanupOutcome {
    Completed,
    Partial,
}

/// Drives destination confirmation and source cleanup for one shard.
#[derive(Debug)]
pub struct ReshardingHandler {
    config: ReshardingConfig,
    cluster: Arc<dyn ReshardingCluster>,
    store: Arc<dyn BucketStore>,
    metrics: Arc<ReshardingMetrics>,
    in_flight: DashMap<u64, ()>,
}

/// Removes an in-flight key when dropped.
struct InFlightGuard<'a> {
    map: &'a DashMap<u64, ()>,
    key: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

impl ReshardingHandler {
    /// Create a handler.
    pub fn new(
        config: ReshardingConfig,
        cluster: Arc<dyn ReshardingCluster>,
        store: Arc<dyn BucketStore>,
        metrics: Arc<ReshardingMetrics>,
    ) -> Self {
        Self {
            config,
            cluster,
            store,
            metrics,
            in_flight: DashMap::new(),
        }
    }

    fn try_begin(&self, key: u64) -> Option<InFlightGuard<'_>> {
        if self.in_flight.insert(key, ()).is_some() {
            return None;
        }
        Some(InFlightGuard {
            map: &self.in_flight,
            key,
        })
    }

    /// Act on every migration of `topology` that concerns the local shard.
    pub async fn handle_topology(&self, topology: &ShardTopology) -> LifecycleReport {
        let mut report = LifecycleReport::default();
        let shard = self.config.shard_number;
        let node = self.config.node_tag.as_str();

        for migration in topology.migrations() {
            let id = (migration.bucket, migration.migration_index);

            if migration.destination_shard == shard
                && migration.status == MigrationStatus::Moved
                && !migration.confirmed_destinations.contains(node)
            {
                let Some(_guard) = self.try_begin(migration.migration_index) else {
                    report.in_progress.push(id);
                    continue;
                };
                match self.confirm_destination(topology, migration).await {
                    Ok(true) => report.confirmed.push(id),
                    Ok(false) => report.awaiting_catch_up.push(id),
                    Err(e) => {
                        warn!(bucket = migration.bucket, migration_index = migration.migration_index, error = %e, "Destination confirmation failed");
                        report.failed.push(id);
                    }
                }
            }

            if migration.source_shard == shard
                && migration.status == MigrationStatus::OwnershipTransferred
                && !migration.confirmed_source_cleanup.contains(node)
            {
                let Some(_guard) = self.try_begin(cleanup_key(migration)) else {
                    report.in_progress.push(id);
                    continue;
                };
                match self.cleanup_source(topology, migration).await {
                    Ok(CleanupOutcome::Completed) => report.cleaned.push(id),
                    Ok(CleanupOutcome::Partial) => report.partially_cleaned.push(id),
                    Err(e) => {
                        warn!(bucket = migration.bucket, migration_index = migration.migration_index, error = %e, "Source cleanup failed");
                        report.failed.push(id);
                    }
                }
            }
        }

        report
    }

    async fn confirm_destination(
        &self,
        topology: &ShardTopology,
        migration: &ShardBucketMigration,
    ) -> Result<bool> {
        let source = ChangeVector::parse(
            migration.last_source_change_vector.as_deref().unwrap_or_default(),
        )?;
        let current = ChangeVector::parse(
            &self
                .store
                .merged_change_vector_in_bucket(migration.bucket)
                .await?,
        )?;

        let status = ChangeVector::conflict_status(&source, &current, ChangeVectorMode::Version);
        if status != ConflictStatus::AlreadyMerged {
            debug!(
                bucket = migration.bucket,
                migration_index = migration.migration_index,
                ?status,
                "Destination has not caught up with the source yet"
            );
            return Ok(false);
        }

        self.cluster
            .destination_migration_confirm(
                topology.database_name(),
                migration.bucket,
                migration.migration_index,
                &self.config.node_tag,
            )
            .await?;
        self.metrics.buckets_confirmed.inc();
        info!(
            bucket = migration.bucket,
            migration_index = migration.migration_index,
            node = %self.config.node_tag,
            "Confirmed moved bucket at destination"
        );
        Ok(true)
    }

    async fn cleanup_source(
        &self,
        topology: &ShardTopology,
        migration: &ShardBucketMigration,
    ) -> Result<CleanupOutcome> {
        let upto = migration
            .last_source_change_vector
            .as_deref()
            .filter(|cv| !cv.is_empty());

        if let Some(upto) = upto {
            let mut batches = 0;
            loop {
                if batches >= self.config.cleanup.max_batches_per_run {
                    warn!(
                        bucket = migration.bucket,
                        batches, "Bucket cleanup hit its batch limit, continuing on next topology"
                    );
                    return Ok(CleanupOutcome::Partial);
                }
                batches += 1;

                match self
                    .store
                    .delete_bucket(migration.bucket, upto, self.config.cleanup.delete_batch_size)
                    .await?
                {
                    DeleteBucketResult::Empty => break,
                    DeleteBucketResult::Skipped => {
                        info!(
                            bucket = migration.bucket,
                            migration_index = migration.migration_index,
                            "Bucket cleanup left newer documents in place"
                        );
                        return Ok(CleanupOutcome::Partial);
                    }
                    DeleteBucketResult::FullBatch => continue,
                }
            }
        }

        self.cluster
            .source_migration_cleanup(
                topology.database_name(),
                migration.bucket,
                migration.migration_index,
                &self.config.node_tag,
            )
            .await?;
        self.metrics.buckets_cleaned.inc();
        info!(
            bucket = migration.bucket,
            migration_index = migration.migration_index,
            node = %self.config.node_tag,
            "Cleaned up migrated bucket at source"
        );
        Ok(CleanupOutcome::Completed)
    }

    /// Handle every published topology until cancelled.
    pub async fn run(&self, topology: Arc<TopologyHandle>, cancellation: CancellationToken) {
        let mut seen = topology.version();
        let report = self.handle_topology(&topology.snapshot()).await;
        debug!(?report, "Handled initial topology");

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                version = topology.changed(seen) => {
                    seen = version;
                    let report = self.handle_topology(&topology.snapshot()).await;
                    debug!(version, ?report, "Handled topology change");
                }
            }
        }
    }
}

fn cleanup_key(migration: &ShardBucketMigration) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    match &migration.last_source_change_vector {
        Some(cv) => hasher.write(cv.as_bytes()),
        None => hasher.write(format!("No docs for {}", migration.migration_index).as_bytes()),
    }
    hasher.finish()
}
