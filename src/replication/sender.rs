//! Outgoing replication sender.
//!
//! The sender is a loop over a storage cursor, parameterized by an
//! [`ItemFilterTagger`] strategy:
//!
//! ```text
//!   items_since(etag) ──► filter_and_tag ──► should_skip ──► ReplicationSink
//!         ▲                                                        │
//!         └──────────── last read etag (dropped items too) ◄───────┘
//! ```
//!
//! [`PlainItemFilter`] forwards everything. [`MigrationItemFilter`] narrows the
//! stream to one bucket, tags every item with the migration entry, and drops
//! artificial documents.

use super::item::{DocumentIdExtractor, ReplicationBatchItem};
use super::tagger::ProvenanceTagger;
use crate::config::{ReplicationConfig, TagFailurePolicy};
use crate::error::{Error, Result};
use crate::metrics::{ReshardingMetrics, SKIP_ARTIFICIAL, SKIP_OTHER_BUCKET, SKIP_TAG_FAILURE};
use crate::sharding::{bucket_for, BucketMigration, ShardTopology, TopologyHandle, MIGRATION_TAG};
use crate::types::Etag;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Storage cursor over replication items.
#[async_trait::async_trait]
pub trait ReplicationItemSource: Send + Sync + std::fmt::Debug {
    /// Up to `limit` items with etag greater than `etag`, in etag order.
    async fn items_since(&self, etag: Etag, limit: usize) -> Result<Vec<ReplicationBatchItem>>;

    /// Resolve once storage holds an item newer than `etag`.
    async fn wait_for_changes(&self, etag: Etag);
}

/// Destination of outgoing batches.
#[async_trait::async_trait]
pub trait ReplicationSink: Send + Sync + std::fmt::Debug {
    /// Deliver a batch to the peer.
    async fn send_batch(&self, batch: ReplicationBatch) -> Result<()>;
}

/// A batch shipped to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationBatch {
    /// Items in etag order.
    pub items: Vec<ReplicationBatchItem>,
    /// Etag of the last item read for this batch, including dropped ones.
    pub last_etag: Etag,
}

/// Per-batch record of dropped items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkippedReplicationItemsInfo {
    pub artificial: u64,
    pub other_bucket: u64,
    pub tag_failures: u64,
    pub tag_failure_skips: u64,
    pub start_etag: Option<Etag>,
    pub end_etag: Option<Etag>,
}

impl SkippedReplicationItemsInfo {
    fn touch(&mut self, etag: Etag) {
        self.start_etag = Some(self.start_etag.map_or(etag, |s| s.min(etag)));
        self.end_etag = Some(self.end_etag.map_or(etag, |e| e.max(etag)));
    }

    /// Record an artificial document drop.
    pub fn record_artificial(&mut self, item: &ReplicationBatchItem) {
        self.artificial += 1;
        self.touch(item.etag);
    }

    /// Record a drop for belonging to another bucket.
    pub fn record_other_bucket(&mut self, item: &ReplicationBatchItem) {
        self.other_bucket += 1;
        self.touch(item.etag);
    }

    /// Record a tagging failure; `dropped` when the item was removed.
    pub fn record_tag_failure(&mut self, item: &ReplicationBatchItem, dropped: bool) {
        self.tag_failures += 1;
        if dropped {
            self.tag_failure_skips += 1;
            self.touch(item.etag);
        }
    }

    /// Items removed from the stream.
    pub fn total_skipped(&self) -> u64 {
        self.artificial + self.other_bucket + self.tag_failure_skips
    }

    fn record_metrics(&self, metrics: &ReshardingMetrics) {
        if self.artificial > 0 {
            metrics.replication_items_skipped.inc_by([SKIP_ARTIFICIAL], self.artificial);
        }
        if self.other_bucket > 0 {
            metrics.replication_items_skipped.inc_by([SKIP_OTHER_BUCKET], self.other_bucket);
        }
        if self.tag_failure_skips > 0 {
            metrics.replication_items_skipped.inc_by([SKIP_TAG_FAILURE], self.tag_failure_skips);
        }
        metrics.tag_failures.inc_by(self.tag_failures);
    }
}

/// Per-item strategy of a [`ReplicationSender`].
pub trait ItemFilterTagger: Send + Sync + std::fmt::Debug {
    /// Narrow and rewrite one item. `Ok(None)` drops it.
    fn filter_and_tag(
        &self,
        item: ReplicationBatchItem,
        topology: &ShardTopology,
        skipped: &mut SkippedReplicationItemsInfo,
    ) -> Result<Option<ReplicationBatchItem>>;

    /// Whether an item that passed the filter must still be withheld.
    fn should_skip(
        &self,
        _item: &ReplicationBatchItem,
        _skipped: &mut SkippedReplicationItemsInfo,
    ) -> bool {
        false
    }
}

/// Forwards every item unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainItemFilter;

impl ItemFilterTagger for PlainItemFilter {
    fn filter_and_tag(
        &self,
        item: ReplicationBatchItem,
        _topology: &ShardTopology,
        _skipped: &mut SkippedReplicationItemsInfo,
    ) -> Result<Option<ReplicationBatchItem>> {
        Ok(Some(item))
    }
}

/// Restricts the stream to one migrating bucket and tags what passes.
#[derive(Debug)]
pub struct MigrationItemFilter {
    migration: BucketMigration,
    extractor: Arc<dyn DocumentIdExtractor>,
    policy: TagFailurePolicy,
}

impl MigrationItemFilter {
    /// Create a filter for a migration.
    pub fn new(
        migration: BucketMigration,
        extractor: Arc<dyn DocumentIdExtractor>,
        policy: TagFailurePolicy,
    ) -> Self {
        Self {
            migration,
            extractor,
            policy,
        }
    }

    /// Migration this filter serves.
    pub fn migration(&self) -> &BucketMigration {
        &self.migration
    }
}

impl ItemFilterTagger for MigrationItemFilter {
    fn filter_and_tag(
        &self,
        mut item: ReplicationBatchItem,
        topology: &ShardTopology,
        skipped: &mut SkippedReplicationItemsInfo,
    ) -> Result<Option<ReplicationBatchItem>> {
        let bucket = bucket_for(topology, &self.extractor.document_id(&item));
        if bucket != self.migration.bucket() {
            skipped.record_other_bucket(&item);
            return Ok(None);
        }

        // Actor is the sharded database id, identical on every shard.
        let tagger = ProvenanceTagger::new(
            MIGRATION_TAG,
            topology.database_id(),
            self.migration.migration_index(),
        );

        match tagger.tag(&item.change_vector) {
            Ok(tagged) => {
                item.change_vector = tagged;
                Ok(Some(item))
            }
            Err(e) => {
                error!(
                    key = %item.key,
                    etag = item.etag,
                    change_vector = %item.change_vector,
                    entry = %tagger.entry(),
                    policy = %self.policy,
                    error = %e,
                    "Failed to tag change vector for migration"
                );

                match self.policy {
                    TagFailurePolicy::Forward => {
                        skipped.record_tag_failure(&item, false);
                        Ok(Some(item))
                    }
                    TagFailurePolicy::Skip => {
                        skipped.record_tag_failure(&item, true);
                        Ok(None)
                    }
                    TagFailurePolicy::Abort => Err(Error::ChangeVector(e)),
                }
            }
        }
    }

    fn should_skip(
        &self,
        item: &ReplicationBatchItem,
        skipped: &mut SkippedReplicationItemsInfo,
    ) -> bool {
        if item.is_artificial() {
            skipped.record_artificial(item);
            return true;
        }
        false
    }
}

/// Result of one sender iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Storage had nothing past the current etag.
    CaughtUp,
    /// Items were read; `sent` of them went to the sink.
    Progressed { sent: usize, last_etag: Etag },
}

/// Outgoing replication loop over one connection.
#[derive(Debug)]
pub struct ReplicationSender<F: ItemFilterTagger> {
    name: String,
    filter: F,
    source: Arc<dyn ReplicationItemSource>,
    sink: Arc<dyn ReplicationSink>,
    topology: Arc<TopologyHandle>,
    config: ReplicationConfig,
    metrics: Arc<ReshardingMetrics>,
    last_etag: AtomicU64,
}

impl<F: ItemFilterTagger> ReplicationSender<F> {
    /// Create a sender starting after `start_etag`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        filter: F,
        source: Arc<dyn ReplicationItemSource>,
        sink: Arc<dyn ReplicationSink>,
        topology: Arc<TopologyHandle>,
        config: ReplicationConfig,
        metrics: Arc<ReshardingMetrics>,
        start_etag: Etag,
    ) -> Self {
        Self {
            name: name.into(),
            filter,
            source,
            sink,
            topology,
            config,
            metrics,
            last_etag: AtomicU64::new(start_etag),
        }
    }

    /// Connection name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Strategy in use.
    pub fn filter(&self) -> &F {
        &self.filter
    }

    /// Etag of the last item read.
    pub fn last_etag(&self) -> Etag {
        self.last_etag.load(Ordering::Acquire)
    }

    /// Read, filter and ship one batch.
    ///
    /// Storage errors are returned unchanged and leave the etag where it was.
    pub async fn send_next_batch(&self) -> Result<BatchOutcome> {
        let topology = self.topology.snapshot();
        let from = self.last_etag();

        let items = self
            .source
            .items_since(from, self.config.max_items_per_batch)
            .await?;
        if items.is_empty() {
            return Ok(BatchOutcome::CaughtUp);
        }

        let mut skipped = SkippedReplicationItemsInfo::default();
        let mut outgoing = Vec::with_capacity(items.len());
        let mut last_etag = from;

        for item in items {
            last_etag = last_etag.max(item.etag);
            if let Some(item) = self.filter.filter_and_tag(item, &topology, &mut skipped)? {
                if !self.filter.should_skip(&item, &mut skipped) {
                    outgoing.push(item);
                }
            }
        }

        let sent = outgoing.len();
        if sent > 0 {
            self.sink
                .send_batch(ReplicationBatch {
                    items: outgoing,
                    last_etag,
                })
                .await?;
            self.metrics.replication_items_sent.inc_by(sent as u64);
        }

        skipped.record_metrics(&self.metrics);
        if skipped.total_skipped() > 0 {
            debug!(
                sender = %self.name,
                artificial = skipped.artificial,
                other_bucket = skipped.other_bucket,
                tag_failures = skipped.tag_failures,
                start_etag = ?skipped.start_etag,
                end_etag = ?skipped.end_etag,
                "Skipped replication items"
            );
        }

        self.last_etag.store(last_etag, Ordering::Release);
        Ok(BatchOutcome::Progressed { sent, last_etag })
    }

    /// Run until cancelled or until a batch fails.
    pub async fn run(&self, cancellation: CancellationToken) -> Result<()> {
        info!(sender = %self.name, etag = self.last_etag(), "Replication sender started");

        loop {
            if cancellation.is_cancelled() {
                break;
            }

            let outcome = tokio::select! {
                _ = cancellation.cancelled() => break,
                result = self.send_next_batch() => result,
            };

            match outcome {
                Ok(BatchOutcome::Progressed { .. }) => continue,
                Ok(BatchOutcome::CaughtUp) => {
                    let etag = self.last_etag();
                    tokio::select! {
                        _ = cancellation.cancelled() => break,
                        _ = self.source.wait_for_changes(etag) => {}
                        _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(sender = %self.name, etag = self.last_etag(), error = %e, "Replication sender failed");
                    return Err(e);
                }
            }
        }

        info!(sender = %self.name, etag = self.last_etag(), "Replication sender stopped");
        Ok(())
    }
}
