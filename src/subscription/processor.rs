//! Per-connection batch processor of a subscription on one shard.
//!
//! One batch is in flight at a time:
//!
//! ```text
//!   get_batch ──► record_batch ──► (client) ──► acknowledge_batch
//!       │               │                │             │
//!   fetch + decide   coordinator          │       coordinator ack,
//!                    (index, skipped)     │       then local state cleared
//!                                         └──error──► release_batch
//! ```
//!
//! The storage etag reached by a batch is committed only once the batch is
//! recorded, so a batch that fails before that is fetched again.

use super::coordinator::{
    AcknowledgeBatchRequest, RecordBatchRequest, ReleaseBatchRequest, SubscriptionGroupCoordinator,
};
use super::decider::{DecisionContext, SendDecider};
use super::fetcher::{DocumentStore, FetchOrigin, FetchRequest, SubscriptionSource};
use super::state::SubscriptionDeliveryState;
use crate::change_vector::{ChangeVector, ChangeVectorMode, ConflictStatus};
use crate::config::{ReshardingConfig, SubscriptionConfig};
use crate::error::{CoordinatorError, Error, Result};
use crate::metrics::ReshardingMetrics;
use crate::sharding::TopologyHandle;
use crate::types::{Document, DocumentRecord, ShardNumber};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A document delivered to the client, possibly with a criteria error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionBatchItem {
    pub document: Document,
    pub error: Option<String>,
}

/// Builds, records and acknowledges the batches of one connection.
#[derive(Debug)]
pub struct SubscriptionProcessor {
    config: SubscriptionConfig,
    shard_number: ShardNumber,
    state: SubscriptionDeliveryState,
    source: Arc<dyn SubscriptionSource>,
    store: Arc<dyn DocumentStore>,
    coordinator: Arc<dyn SubscriptionGroupCoordinator>,
    topology: Arc<TopologyHandle>,
    decider: Arc<dyn SendDecider>,
    metrics: Arc<ReshardingMetrics>,
}

impl SubscriptionProcessor {
    /// Create a processor for `subscription` on the configured shard.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &ReshardingConfig,
        subscription: impl Into<String>,
        source: Arc<dyn SubscriptionSource>,
        store: Arc<dyn DocumentStore>,
        coordinator: Arc<dyn SubscriptionGroupCoordinator>,
        topology: Arc<TopologyHandle>,
        decider: Arc<dyn SendDecider>,
        metrics: Arc<ReshardingMetrics>,
    ) -> Self {
        Self {
            config: config.subscription.clone(),
            shard_number: config.shard_number,
            state: SubscriptionDeliveryState::new(subscription, config.shard_name()),
            source,
            store,
            coordinator,
            topology,
            decider,
            metrics,
        }
    }

    /// Resume from an existing state.
    pub fn with_state(mut self, state: SubscriptionDeliveryState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> &SubscriptionDeliveryState {
        &self.state
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    pub fn source(&self) -> &Arc<dyn SubscriptionSource> {
        &self.source
    }

    /// Documents of the recorded batch another shard is delivering.
    pub fn skipped(&self) -> &HashSet<String> {
        &self.state.skipped
    }

    /// Fetch the next batch.
    ///
    /// Only documents that carry a payload are delivered; suppressed ones are
    /// tracked for resend when their bucket is still migrating.
    pub async fn get_batch(&mut self) -> Result<Vec<SubscriptionBatchItem>> {
        if let Some(batch_id) = self.state.pending_batch {
            return Err(Error::InvalidArgument(format!(
                "batch {} is not acknowledged",
                batch_id
            )));
        }

        let topology = self.topology.snapshot();
        let active = self
            .coordinator
            .active_batch_documents(&self.state.subscription, &self.state.shard_name)
            .await?;
        self.state.begin_batch(active);

        let resend = self
            .coordinator
            .resend_documents(&self.state.subscription, &self.state.shard_name)
            .await?;
        let mut fetcher = self
            .source
            .open_fetcher(FetchRequest {
                subscription: self.state.subscription.clone(),
                shard: self.state.shard_name.clone(),
                start_etag: self.state.last_fetched_etag,
                resend,
                page_size: self.config.batch_size,
            })
            .await?;

        let mut items = Vec::new();
        let mut included = HashSet::new();
        let mut size = 0usize;
        let mut fetched_etag = self.state.last_fetched_etag;

        while let Some(fetched) = fetcher.next().await? {
            let origin = fetched.origin;
            let document = fetched.document;
            if origin == FetchOrigin::Storage {
                fetched_etag = fetched_etag.max(document.etag);
            }

            let current = match origin {
                FetchOrigin::Resend => self.store.get_document(&document.id).await?,
                _ => None,
            };
            let original = DocumentRecord::new(document.id.clone(), document.change_vector.clone());

            let state = &mut self.state;
            let starting_point = state
                .starting_point_per_shard
                .get(&state.shard_name)
                .map(String::as_str)
                .unwrap_or("");
            let mut ctx = DecisionContext {
                topology: &topology,
                shard_number: self.shard_number,
                origin,
                starting_point,
                last_change_vector_sent: &state.last_change_vector_sent,
                active_batch_documents: &state.active_batch_documents,
                current: current.as_ref(),
                resend_removals: &mut state.resend_removals,
            };
            let decision = self.decider.should_send(&mut ctx, document);

            if !decision.send {
                debug!(
                    subscription = %self.state.subscription,
                    document_id = %decision.result.id,
                    origin = %origin,
                    reason = decision.reason.as_deref().unwrap_or(""),
                    "Skipping subscription document"
                );
                if decision.error.is_none() {
                    if decision.is_active_migration {
                        self.state.deferred.push(original);
                    }
                    continue;
                }
            }

            let result = decision.result;
            if result.data.is_none() {
                continue;
            }
            if !included.insert(result.id.clone()) {
                debug!(document_id = %result.id, origin = %origin, "Document already in batch");
                continue;
            }

            size += result.size();
            self.state
                .batch_items
                .push(DocumentRecord::new(result.id.clone(), result.change_vector.clone()));
            if origin != FetchOrigin::Resend {
                self.state.record_sent_vector(&result.change_vector);
            }
            items.push(SubscriptionBatchItem {
                document: result,
                error: decision.error,
            });

            if size >= self.config.max_batch_bytes || items.len() >= self.config.batch_size {
                break;
            }
        }

        self.state.batch_fetched_etag = fetched_etag;
        if items.is_empty() && !self.state.has_bookkeeping() {
            // Nothing will be recorded; every document read was skipped.
            self.state.commit_fetched_etag();
        }
        Ok(items)
    }

    /// Record the current batch with the coordinator and return its id.
    ///
    /// Documents the coordinator reports as skipped are dropped from the batch.
    pub async fn record_batch(&mut self) -> Result<u64> {
        let removals: Vec<String> = self.state.resend_removals.iter().cloned().collect();
        let response = self
            .coordinator
            .record_batch(RecordBatchRequest {
                subscription: self.state.subscription.clone(),
                shard: self.state.shard_name.clone(),
                documents: self.state.batch_items.clone(),
                resend_removals: removals.clone(),
                last_change_vector: self.state.last_change_vector_sent.clone(),
            })
            .await?;

        self.metrics.batches_recorded.inc();
        self.metrics.resend_removals.inc_by(removals.len() as u64);

        self.state
            .batch_items
            .retain(|r| !response.skipped.contains(&r.document_id));
        self.state.skipped = response.skipped;
        self.state.pending_batch = Some(response.index);
        self.state.commit_fetched_etag();

        debug!(
            subscription = %self.state.subscription,
            batch_id = response.index,
            documents = self.state.batch_items.len(),
            skipped = self.state.skipped.len(),
            resend_removals = removals.len(),
            "Recorded batch"
        );
        Ok(response.index)
    }

    /// Acknowledge the recorded batch.
    ///
    /// Local state is updated only after the coordinator accepted the ack, so
    /// a failed ack can be retried with nothing lost.
    pub async fn acknowledge_batch(&mut self, batch_id: u64, change_vector: &str) -> Result<()> {
        if self.state.pending_batch != Some(batch_id) {
            return Err(CoordinatorError::UnknownBatch(batch_id).into());
        }

        let mut resend = Vec::new();
        for record in &self.state.batch_items {
            let current = self.store.get_document(&record.document_id).await?;
            if should_add_to_resend(current.as_ref(), &record.change_vector) {
                resend.push(record.clone());
            }
        }
        resend.extend(self.state.deferred.iter().cloned());
        let resent = resend.len();

        self.coordinator
            .acknowledge_batch(AcknowledgeBatchRequest {
                subscription: self.state.subscription.clone(),
                shard: self.state.shard_name.clone(),
                batch_id,
                last_sent_change_vector: self.state.last_change_vector_sent.clone(),
                ack_change_vector: change_vector.to_string(),
                resend,
            })
            .await?;

        self.metrics.batches_acknowledged.inc();
        self.state.complete_batch(change_vector);

        info!(
            subscription = %self.state.subscription,
            shard = %self.state.shard_name,
            batch_id,
            resend = resent,
            "Acknowledged batch"
        );
        Ok(())
    }

    /// Give up the recorded batch without an acknowledgment.
    ///
    /// The coordinator puts the batch documents and the deferred ones back
    /// into the resend set, where the next batch picks them up.
    pub async fn release_batch(&mut self) -> Result<()> {
        let Some(batch_id) = self.state.pending_batch else {
            return Ok(());
        };

        self.coordinator
            .release_batch(ReleaseBatchRequest {
                subscription: self.state.subscription.clone(),
                shard: self.state.shard_name.clone(),
                batch_id,
                resend: self.state.deferred.clone(),
            })
            .await?;

        self.metrics.batches_released.inc();
        self.state.abandon_batch();

        warn!(
            subscription = %self.state.subscription,
            shard = %self.state.shard_name,
            batch_id,
            "Released unacknowledged batch"
        );
        Ok(())
    }
}

/// A sent document goes back to resend only if it changed since it was sent.
fn should_add_to_resend(current: Option<&Document>, sent_change_vector: &str) -> bool {
    let Some(current) = current else {
        return false;
    };
    ChangeVector::conflict_status_str(
        &current.change_vector,
        sent_change_vector,
        ChangeVectorMode::Version,
    ) == ConflictStatus::Update
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardingConfig;
    use crate::sharding::{ShardBucketMigration, ShardBucketRange, ShardTopology};
    use crate::subscription::{
        InMemorySubscriptionGroup, MigrationAwareSendDecider, StorageSubscriptionSource,
    };
    use crate::testing::fakes::{id_in_bucket, InMemoryDocumentStore};

    struct Fixture {
        store: Arc<InMemoryDocumentStore>,
        group: Arc<InMemorySubscriptionGroup>,
        topology: Arc<TopologyHandle>,
        metrics: Arc<ReshardingMetrics>,
    }

    impl Fixture {
        fn new() -> Self {
            let topology = ShardTopology::new(
                "db",
                "dbid",
                &ShardingConfig::new(16),
                vec![ShardBucketRange::new(0, 0), ShardBucketRange::new(8, 1)],
            )
            .unwrap();
            Self {
                store: Arc::new(InMemoryDocumentStore::new("n1")),
                group: Arc::new(InMemorySubscriptionGroup::new()),
                topology: Arc::new(TopologyHandle::new(topology)),
                metrics: Arc::new(ReshardingMetrics::new()),
            }
        }

        fn processor(&self, config: ReshardingConfig) -> SubscriptionProcessor {
            SubscriptionProcessor::new(
                &config,
                "feed",
                Arc::new(StorageSubscriptionSource::new(self.store.clone())),
                self.store.clone(),
                self.group.clone(),
                self.topology.clone(),
                Arc::new(MigrationAwareSendDecider::sharded(None, self.metrics.clone())),
                self.metrics.clone(),
            )
        }

        fn id(&self, bucket: u32, nth: usize) -> String {
            id_in_bucket(&self.topology.snapshot(), bucket, nth)
        }
    }

    fn ids(items: &[SubscriptionBatchItem]) -> Vec<String> {
        items.iter().map(|i| i.document.id.clone()).collect()
    }

    #[tokio::test]
    async fn test_batch_only_contains_owned_documents() {
        let fixture = Fixture::new();
        let owned = fixture.id(2, 0);
        let foreign = fixture.id(9, 0);
        fixture.store.put(&owned, "{}");
        fixture.store.put(&foreign, "{}");

        let mut processor = fixture.processor(ReshardingConfig::new("db", 0));
        let batch = processor.get_batch().await.unwrap();
        assert_eq!(ids(&batch), vec![owned]);
        assert_eq!(processor.state().deferred().len(), 1);
    }

    #[tokio::test]
    async fn test_full_cycle_advances_starting_point() {
        let fixture = Fixture::new();
        let doc = fixture.store.put(&fixture.id(2, 0), "{}");

        let mut processor = fixture.processor(ReshardingConfig::new("db", 0));
        let batch = processor.get_batch().await.unwrap();
        assert_eq!(batch.len(), 1);

        let batch_id = processor.record_batch().await.unwrap();
        assert_eq!(processor.state().pending_batch(), Some(batch_id));
        assert!(processor.get_batch().await.is_err());

        processor
            .acknowledge_batch(batch_id, &doc.change_vector)
            .await
            .unwrap();
        assert_eq!(processor.state().pending_batch(), None);
        assert_eq!(processor.state().starting_point(), doc.change_vector);

        let batch = processor.get_batch().await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(fixture.metrics.snapshot().batches_acknowledged, 1);
    }

    #[tokio::test]
    async fn test_batch_size_limit() {
        let fixture = Fixture::new();
        for nth in 0..3 {
            fixture.store.put(&fixture.id(2, nth), "{}");
        }
        let config = ReshardingConfig::new("db", 0).with_subscription(
            crate::config::SubscriptionConfig::default().with_batch_size(2),
        );

        let mut processor = fixture.processor(config);
        let batch = processor.get_batch().await.unwrap();
        assert_eq!(batch.len(), 2);
        let batch_id = processor.record_batch().await.unwrap();
        processor.acknowledge_batch(batch_id, "").await.unwrap();

        let batch = processor.get_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_byte_limit_counts_only_delivered_documents() {
        let fixture = Fixture::new();
        fixture
            .store
            .put(&fixture.id(9, 0), "{\"padding\":\"not owned by this shard\"}");
        for nth in 0..3 {
            fixture.store.put(&fixture.id(2, nth), "{}");
        }
        fixture.store.put(&fixture.id(2, 3), "{\"v\":\"large\"}");
        let config = ReshardingConfig::new("db", 0)
            .with_subscription(SubscriptionConfig::default().with_max_batch_bytes(8));

        let mut processor = fixture.processor(config);
        let batch = processor.get_batch().await.unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(processor.state().deferred().len(), 1);
    }

    #[tokio::test]
    async fn test_resend_and_storage_copy_delivered_once() {
        let fixture = Fixture::new();
        let doc = fixture.store.put(&fixture.id(2, 0), "{}");
        fixture
            .group
            .add_to_resend("feed", "db$0", DocumentRecord::new(doc.id.clone(), doc.change_vector.clone()))
            .await;

        let mut processor = fixture.processor(ReshardingConfig::new("db", 0));
        let batch = processor.get_batch().await.unwrap();
        assert_eq!(ids(&batch), vec![doc.id.clone()]);
        assert_eq!(processor.state().batch_items().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_document_goes_back_to_resend() {
        let fixture = Fixture::new();
        let id = fixture.id(2, 0);
        fixture.store.put(&id, "{\"v\":1}");

        let mut processor = fixture.processor(ReshardingConfig::new("db", 0));
        processor.get_batch().await.unwrap();
        let batch_id = processor.record_batch().await.unwrap();

        fixture.store.put(&id, "{\"v\":2}");
        processor.acknowledge_batch(batch_id, "").await.unwrap();

        let resend = fixture.group.resend_documents("feed", "db$0").await.unwrap();
        assert_eq!(resend.len(), 1);
        assert_eq!(resend[0].document_id, id);
    }

    #[tokio::test]
    async fn test_deferred_documents_resent_after_migration() {
        let fixture = Fixture::new();
        let id = fixture.id(3, 0);
        fixture.store.put(&id, "{}");
        let topology = fixture.topology.snapshot().as_ref().clone();
        fixture
            .topology
            .swap(topology.with_migration(ShardBucketMigration::new(3, 0, 1, 42)).unwrap());

        let mut processor = fixture.processor(ReshardingConfig::new("db", 0));
        assert!(processor.get_batch().await.unwrap().is_empty());
        assert!(processor.state().has_bookkeeping());
        let batch_id = processor.record_batch().await.unwrap();
        processor.acknowledge_batch(batch_id, "").await.unwrap();

        let resend = fixture.group.resend_documents("feed", "db$0").await.unwrap();
        assert_eq!(resend.len(), 1);

        // Migration rolled back: the bucket stays on shard 0.
        let topology = fixture.topology.snapshot().as_ref().clone();
        fixture.topology.swap(topology.without_migration(3));

        let batch = processor.get_batch().await.unwrap();
        assert_eq!(ids(&batch), vec![id]);
    }
}
