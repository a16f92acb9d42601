//! End-to-end resharding scenarios over in-memory collaborators.

use super::fakes::{
    id_in_bucket, FlakyCoordinator, InMemoryDocumentStore, InMemoryItemSource,
    RecordingSinkFactory, RecordingSubscriptionSink, ScriptedSubscriptionSource,
};
use super::utils::wait_for_result;
use crate::config::{ReshardingConfig, ShardingConfig, SubscriptionConfig};
use crate::error::{CoordinatorError, Error};
use crate::metrics::ReshardingMetrics;
use crate::replication::{KeyDocumentIdExtractor, MigrationReplicationLoader, ReplicationBatchItem};
use crate::sharding::{
    BucketMigration, MigrationStatus, ShardBucketMigration, ShardBucketRange, ShardTopology,
    TopologyHandle,
};
use crate::subscription::{
    BatchStep, ClientAck, FetchOrigin, FetchedDocument, InMemorySubscriptionGroup,
    MigrationAwareSendDecider, StorageSubscriptionSource, SubscriptionConnection,
    SubscriptionGroupCoordinator, SubscriptionProcessor, SubscriptionSource,
};
use crate::types::Document;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DB_ID: &str = "shardeddb";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("reshard=debug")
        .with_test_writer()
        .try_init();
}

/// Buckets 0..8 on shard 0 (node A), 8..16 on shard 1 (node B).
fn base_topology() -> ShardTopology {
    ShardTopology::new(
        "orders",
        DB_ID,
        &ShardingConfig::new(16),
        vec![ShardBucketRange::new(0, 0), ShardBucketRange::new(8, 1)],
    )
    .unwrap()
    .with_shard_members(0, ["A"])
    .with_shard_members(1, ["B"])
}

fn config(shard: u32) -> ReshardingConfig {
    ReshardingConfig::new("orders", shard)
        .with_sharding(ShardingConfig::new(16))
        .with_subscription(
            SubscriptionConfig::default()
                .with_ack_timeout(Duration::from_millis(500))
                .with_idle_poll_interval(Duration::from_millis(20)),
        )
}

struct Shard {
    store: Arc<InMemoryDocumentStore>,
    metrics: Arc<ReshardingMetrics>,
}

impl Shard {
    fn new(node: &str) -> Self {
        Self {
            store: Arc::new(InMemoryDocumentStore::new(node)),
            metrics: Arc::new(ReshardingMetrics::new()),
        }
    }

    fn processor(
        &self,
        shard: u32,
        coordinator: Arc<dyn SubscriptionGroupCoordinator>,
        topology: Arc<TopologyHandle>,
    ) -> SubscriptionProcessor {
        self.processor_with_source(
            shard,
            Arc::new(StorageSubscriptionSource::new(self.store.clone())),
            coordinator,
            topology,
        )
    }

    fn processor_with_source(
        &self,
        shard: u32,
        source: Arc<dyn SubscriptionSource>,
        coordinator: Arc<dyn SubscriptionGroupCoordinator>,
        topology: Arc<TopologyHandle>,
    ) -> SubscriptionProcessor {
        SubscriptionProcessor::new(
            &config(shard),
            "orders-feed",
            source,
            self.store.clone(),
            coordinator,
            topology,
            Arc::new(MigrationAwareSendDecider::sharded(None, self.metrics.clone())),
            self.metrics.clone(),
        )
    }
}

#[tokio::test]
async fn test_migration_stream_carries_only_the_moving_bucket() {
    init_tracing();
    let topology = base_topology()
        .with_migration(ShardBucketMigration::new(5, 0, 1, 42))
        .unwrap();
    let handle = Arc::new(TopologyHandle::new(topology.clone()));
    let source = Arc::new(InMemoryItemSource::new());
    let sinks = Arc::new(RecordingSinkFactory::new());
    let metrics = Arc::new(ReshardingMetrics::new());

    let loader = MigrationReplicationLoader::new(
        config(0),
        source.clone(),
        sinks.clone(),
        Arc::new(KeyDocumentIdExtractor),
        handle,
        metrics.clone(),
    );
    loader.reconcile(&topology).await.unwrap();

    let moving = id_in_bucket(&topology, 5, 0);
    let staying = id_in_bucket(&topology, 7, 0);
    source.push(ReplicationBatchItem::document(staying, 1, "A:1-n1", "{}"));
    source.push(ReplicationBatchItem::document(moving.clone(), 2, "A:2-n1", "{}"));

    let migration = BucketMigration::new(5, 1, "B", 42).unwrap();
    let sink = sinks.sink_for(&migration).unwrap();
    sink.wait_for_items(1, Duration::from_secs(2)).await;

    let items = sink.items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].key, moving);
    assert_eq!(items[0].change_vector, format!("A:2-n1, MOVE:42-{}", DB_ID));

    let etag = wait_for_result(
        || async { loader.sender_etag(&migration) },
        |etag| *etag == Some(2),
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(etag, Some(Some(2)));
    assert_eq!(metrics.snapshot().skipped_other_bucket, 1);

    loader.stop_all().await;
}

#[tokio::test]
async fn test_stale_descriptor_never_matches() {
    let running = BucketMigration::new(5, 1, "B", 42).unwrap();
    let newer = BucketMigration::new(5, 1, "B", 43).unwrap();
    assert!(running.matches(&running));
    assert!(!running.matches(&newer));

    let topology = base_topology()
        .with_migration(ShardBucketMigration::new(5, 0, 1, 43))
        .unwrap();
    let entry = topology.migration_for(5).unwrap();
    assert!(!running.for_bucket_migration(entry));
    assert!(newer.for_bucket_migration(entry));
}

#[tokio::test]
async fn test_storage_document_of_migrating_bucket_is_deferred() {
    init_tracing();
    let topology = base_topology()
        .with_migration(ShardBucketMigration::new(5, 0, 1, 42))
        .unwrap();
    let id = id_in_bucket(&topology, 5, 0);
    let shard = Shard::new("n1");
    shard.store.put(&id, "{\"total\":10}");

    let group = Arc::new(InMemorySubscriptionGroup::new());
    let handle = Arc::new(TopologyHandle::new(topology));
    let mut processor = shard.processor(0, group.clone(), handle);

    let batch = processor.get_batch().await.unwrap();
    assert!(batch.is_empty());
    assert_eq!(processor.state().deferred().len(), 1);
    assert_eq!(shard.metrics.snapshot().suppressed_active_migration, 1);

    let batch_id = processor.record_batch().await.unwrap();
    let starting_point = processor.state().starting_point().to_string();
    processor
        .acknowledge_batch(batch_id, &starting_point)
        .await
        .unwrap();

    let resend = group.resend_documents("orders-feed", "orders$0").await.unwrap();
    assert_eq!(resend.len(), 1);
    assert_eq!(resend[0].document_id, id);
}

#[tokio::test]
async fn test_live_document_of_migrating_bucket_is_dropped() {
    let topology = base_topology()
        .with_migration(ShardBucketMigration::new(5, 0, 1, 42))
        .unwrap();
    let id = id_in_bucket(&topology, 5, 0);
    let shard = Shard::new("n1");

    let live = Arc::new(ScriptedSubscriptionSource::new());
    live.push(FetchedDocument::new(
        Document::new(id, 3, "A:3-n1", "{}"),
        FetchOrigin::Live,
    ));

    let mut processor = shard.processor_with_source(
        0,
        live,
        Arc::new(InMemorySubscriptionGroup::new()),
        Arc::new(TopologyHandle::new(topology)),
    );
    let batch = processor.get_batch().await.unwrap();
    assert!(batch.is_empty());
    assert!(processor.state().deferred().is_empty());
    assert!(!processor.state().has_bookkeeping());
}

#[tokio::test]
async fn test_deleted_document_leaves_resend_exactly_once() {
    init_tracing();
    let topology = base_topology();
    let id = id_in_bucket(&topology, 2, 0);
    let shard = Shard::new("n1");
    let group = Arc::new(InMemorySubscriptionGroup::new());
    let mut processor = shard.processor(0, group.clone(), Arc::new(TopologyHandle::new(topology)));

    let sent = shard.store.put(&id, "{\"v\":1}");
    assert_eq!(processor.get_batch().await.unwrap().len(), 1);
    let batch_id = processor.record_batch().await.unwrap();

    // Changed while the client held it, then deleted.
    shard.store.put(&id, "{\"v\":2}");
    processor
        .acknowledge_batch(batch_id, &sent.change_vector)
        .await
        .unwrap();
    assert_eq!(group.resend_documents("orders-feed", "orders$0").await.unwrap().len(), 1);
    shard.store.delete(&id);

    let batch = processor.get_batch().await.unwrap();
    assert!(batch.is_empty());
    assert_eq!(processor.state().resend_removals().len(), 1);
    let batch_id = processor.record_batch().await.unwrap();
    processor.acknowledge_batch(batch_id, "").await.unwrap();
    assert!(group.resend_documents("orders-feed", "orders$0").await.unwrap().is_empty());

    let batch = processor.get_batch().await.unwrap();
    assert!(batch.is_empty());
    assert!(!processor.state().has_bookkeeping());
    assert_eq!(shard.metrics.snapshot().resend_removals, 1);
}

#[tokio::test]
async fn test_pending_state_survives_failed_ack() {
    let topology = base_topology();
    let shard = Shard::new("n1");
    let coordinator = Arc::new(FlakyCoordinator::new());
    let mut processor = shard.processor(
        0,
        coordinator.clone(),
        Arc::new(TopologyHandle::new(topology.clone())),
    );

    let doc = shard.store.put(&id_in_bucket(&topology, 1, 0), "{}");
    processor.get_batch().await.unwrap();
    let batch_id = processor.record_batch().await.unwrap();

    coordinator.set_fail_acks(true);
    let result = processor.acknowledge_batch(batch_id, &doc.change_vector).await;
    assert!(matches!(
        result,
        Err(Error::Coordinator(CoordinatorError::Unavailable(_)))
    ));
    assert_eq!(processor.state().pending_batch(), Some(batch_id));
    assert_eq!(processor.state().batch_items().len(), 1);
    assert!(processor.get_batch().await.is_err());

    coordinator.set_fail_acks(false);
    processor
        .acknowledge_batch(batch_id, &doc.change_vector)
        .await
        .unwrap();
    assert_eq!(processor.state().pending_batch(), None);
    assert_eq!(processor.state().starting_point(), doc.change_vector);

    assert_eq!(coordinator.records().len(), 1);
    assert!(coordinator.group().active_batches("orders-feed").await.is_empty());
}

#[tokio::test]
async fn test_document_in_other_shards_batch_is_skipped() {
    init_tracing();
    let coordinator = Arc::new(InMemorySubscriptionGroup::new());
    let topology = base_topology();
    let id = id_in_bucket(&topology, 5, 0);

    let source = Shard::new("n1");
    source.store.put(&id, "{}");
    let mut on_source =
        source.processor(0, coordinator.clone(), Arc::new(TopologyHandle::new(topology.clone())));

    // Ownership moved to shard 1, which received the migrated copy.
    let moved = topology
        .with_bucket_owner(5, 1)
        .unwrap()
        .with_migration(
            ShardBucketMigration::new(5, 0, 1, 42).with_status(MigrationStatus::OwnershipTransferred),
        )
        .unwrap();
    let destination = Shard::new("n2");
    destination
        .store
        .put_with_change_vector(&id, &format!("A:1-n1, MOVE:42-{}", DB_ID), "{}");
    let mut on_destination =
        destination.processor(1, coordinator.clone(), Arc::new(TopologyHandle::new(moved)));

    // Both shards picked the document before either recorded.
    assert_eq!(on_source.get_batch().await.unwrap().len(), 1);
    assert_eq!(on_destination.get_batch().await.unwrap().len(), 1);

    on_source.record_batch().await.unwrap();
    on_destination.record_batch().await.unwrap();
    assert!(on_destination.skipped().contains(&id));
    assert!(on_destination.state().batch_items().is_empty());

    // While shard 0's batch is open, later batches of shard 1 leave the document alone.
    let active = coordinator
        .active_batch_documents("orders-feed", "orders$1")
        .await
        .unwrap();
    assert!(active.contains(&id));
    let own = coordinator
        .active_batch_documents("orders-feed", "orders$0")
        .await
        .unwrap();
    assert!(own.is_empty());
}

#[tokio::test]
async fn test_abandoned_batch_is_redelivered_on_reconnect() {
    init_tracing();
    let topology = base_topology();
    let id = id_in_bucket(&topology, 4, 0);
    let shard = Shard::new("n1");
    shard.store.put(&id, "{}");
    let group = Arc::new(InMemorySubscriptionGroup::new());
    let handle = Arc::new(TopologyHandle::new(topology));

    // The first connection dies after recording, without ack or release.
    {
        let mut first = shard.processor(0, group.clone(), handle.clone());
        assert_eq!(first.get_batch().await.unwrap().len(), 1);
        first.record_batch().await.unwrap();
    }

    let mut second = shard.processor(0, group.clone(), handle);
    let batch = second.get_batch().await.unwrap();
    let delivered: Vec<String> = batch.iter().map(|i| i.document.id.clone()).collect();
    assert_eq!(delivered, vec![id.clone()]);

    let batch_id = second.record_batch().await.unwrap();
    assert!(second.skipped().is_empty());
    second
        .acknowledge_batch(batch_id, &batch[0].document.change_vector)
        .await
        .unwrap();
    assert_eq!(group.active_batches("orders-feed").await, Vec::<u64>::new());
    assert!(group.resend_documents("orders-feed", "orders$0").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_record_is_fetched_again() {
    let topology = base_topology();
    let id = id_in_bucket(&topology, 4, 0);
    let shard = Shard::new("n1");
    shard.store.put(&id, "{}");
    let coordinator = Arc::new(FlakyCoordinator::new());
    let mut processor =
        shard.processor(0, coordinator.clone(), Arc::new(TopologyHandle::new(topology)));

    coordinator.fail_next_records(1);
    assert_eq!(processor.get_batch().await.unwrap().len(), 1);
    let result = processor.record_batch().await;
    assert!(matches!(
        result,
        Err(Error::Coordinator(CoordinatorError::Unavailable(_)))
    ));
    assert_eq!(processor.state().last_fetched_etag(), 0);

    let retry = processor.get_batch().await.unwrap();
    assert_eq!(retry.len(), 1);
    assert_eq!(retry[0].document.id, id);
    processor.record_batch().await.unwrap();
    assert_eq!(processor.state().last_fetched_etag(), retry[0].document.etag);
    assert_eq!(coordinator.records().len(), 1);
}

#[tokio::test]
async fn test_failed_send_releases_batch_for_next_connection() {
    init_tracing();
    let topology = base_topology();
    let shard = Shard::new("n1");
    let coordinator = Arc::new(FlakyCoordinator::new());
    let handle = Arc::new(TopologyHandle::new(topology.clone()));
    let doc = shard.store.put(&id_in_bucket(&topology, 1, 0), "{}");

    let broken = Arc::new(RecordingSubscriptionSink::new());
    broken.set_fail_sends(true);
    let (_ack_tx, ack_rx) = mpsc::channel(1);
    let mut connection = SubscriptionConnection::new(
        shard.processor(0, coordinator.clone(), handle.clone()),
        broken,
        ack_rx,
        shard.metrics.clone(),
    );
    let result = connection.process_next_batch(&CancellationToken::new()).await;
    assert!(matches!(result, Err(Error::SendFailed(_))));
    assert_eq!(coordinator.releases().len(), 1);
    assert_eq!(connection.processor().state().pending_batch(), None);

    let resend = coordinator
        .group()
        .resend_documents("orders-feed", "orders$0")
        .await
        .unwrap();
    assert_eq!(resend.len(), 1);
    assert_eq!(resend[0].document_id, doc.id);

    // Same connection state, healthy client: the document comes back from resend.
    let sink = Arc::new(RecordingSubscriptionSink::new());
    let (ack_tx, ack_rx) = mpsc::channel(1);
    let mut connection = SubscriptionConnection::new(
        shard
            .processor(0, coordinator.clone(), handle)
            .with_state(connection.processor().state().clone()),
        sink.clone(),
        ack_rx,
        shard.metrics.clone(),
    );
    ack_tx
        .send(ClientAck {
            batch_id: 2,
            change_vector: doc.change_vector.clone(),
        })
        .await
        .unwrap();
    let step = connection
        .process_next_batch(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(step, BatchStep::Delivered { batch_id: 2, documents: 1 });
    assert_eq!(sink.batches()[0].items[0].document.id, doc.id);
    assert!(coordinator
        .group()
        .resend_documents("orders-feed", "orders$0")
        .await
        .unwrap()
        .is_empty());
    assert_eq!(shard.metrics.snapshot().batches_released, 1);
}

#[tokio::test]
async fn test_connection_delivers_and_stops_on_cancel() {
    init_tracing();
    let topology = base_topology();
    let shard = Shard::new("n1");
    let group = Arc::new(InMemorySubscriptionGroup::new());
    let processor = shard.processor(0, group.clone(), Arc::new(TopologyHandle::new(topology.clone())));

    let sink = Arc::new(RecordingSubscriptionSink::new());
    let (ack_tx, ack_rx) = mpsc::channel(4);
    let mut connection = SubscriptionConnection::new(processor, sink.clone(), ack_rx, shard.metrics.clone());

    let token = CancellationToken::new();
    let task = {
        let token = token.clone();
        tokio::spawn(async move { connection.run(token).await })
    };

    let doc = shard.store.put(&id_in_bucket(&topology, 1, 0), "{}");
    let batches = sink.wait_for_batches(1, Duration::from_secs(2)).await;
    assert_eq!(batches[0].items.len(), 1);
    assert_eq!(batches[0].items[0].document.id, doc.id);

    ack_tx
        .send(ClientAck {
            batch_id: batches[0].batch_id,
            change_vector: doc.change_vector.clone(),
        })
        .await
        .unwrap();

    let acknowledged = wait_for_result(
        || async { group.active_batches("orders-feed").await },
        |active| active.is_empty(),
        Duration::from_secs(2),
    )
    .await;
    assert!(acknowledged.is_some());

    // Idle now; cancellation interrupts the wait for new documents.
    token.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(shard.metrics.snapshot().subscription_documents_sent, 1);
}

#[tokio::test]
async fn test_connection_cancelled_while_waiting_for_ack() {
    let topology = base_topology();
    let shard = Shard::new("n1");
    let group = Arc::new(InMemorySubscriptionGroup::new());
    let processor = shard.processor(
        0,
        group.clone(),
        Arc::new(TopologyHandle::new(topology.clone())),
    );
    shard.store.put(&id_in_bucket(&topology, 1, 0), "{}");

    let (_ack_tx, ack_rx) = mpsc::channel(1);
    let mut connection = SubscriptionConnection::new(
        processor,
        Arc::new(RecordingSubscriptionSink::new()),
        ack_rx,
        shard.metrics.clone(),
    );

    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        })
    };

    let step = connection.process_next_batch(&token).await.unwrap();
    assert_eq!(step, BatchStep::Cancelled);
    canceller.await.unwrap();
    assert_eq!(connection.processor().state().pending_batch(), None);
    assert_eq!(group.resend_documents("orders-feed", "orders$0").await.unwrap().len(), 1);
    assert!(group.active_batches("orders-feed").await.is_empty());
}

#[tokio::test]
async fn test_connection_ack_timeout_redelivers_on_reconnect() {
    let topology = base_topology();
    let shard = Shard::new("n1");
    let group = Arc::new(InMemorySubscriptionGroup::new());
    let handle = Arc::new(TopologyHandle::new(topology.clone()));
    let processor = shard.processor(0, group.clone(), handle.clone());
    let doc = shard.store.put(&id_in_bucket(&topology, 1, 0), "{}");

    let (_ack_tx, ack_rx) = mpsc::channel(1);
    let mut connection = SubscriptionConnection::new(
        processor,
        Arc::new(RecordingSubscriptionSink::new()),
        ack_rx,
        shard.metrics.clone(),
    );

    let result = connection.process_next_batch(&CancellationToken::new()).await;
    assert!(matches!(result, Err(Error::Timeout)));
    assert!(group.active_batches("orders-feed").await.is_empty());

    // A fresh connection starts from etag 0 and also reads the document from resend.
    let mut reconnected = shard.processor(0, group.clone(), handle);
    let batch = reconnected.get_batch().await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].document.id, doc.id);
    let batch_id = reconnected.record_batch().await.unwrap();
    reconnected
        .acknowledge_batch(batch_id, &doc.change_vector)
        .await
        .unwrap();
    assert!(group.resend_documents("orders-feed", "orders$0").await.unwrap().is_empty());
}
