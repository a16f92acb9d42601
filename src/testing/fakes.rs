//! In-memory collaborators for unit and end-to-end tests.

use crate::error::{CoordinatorError, Error, Result, StorageError};
use crate::replication::{
    MigrationSinkFactory, ReplicationBatch, ReplicationBatchItem, ReplicationItemSource,
    ReplicationSink,
};
use crate::sharding::{
    bucket_for, BucketMigration, BucketStore, DeleteBucketResult, ReshardingCluster, ShardTopology,
};
use crate::subscription::{
    AcknowledgeBatchRequest, DocumentStore, FetchRequest, FetchedDocument, InMemorySubscriptionGroup,
    RecordBatchRequest, RecordBatchResponse, ReleaseBatchRequest, SubscriptionBatch, SubscriptionFetcher,
    SubscriptionGroupCoordinator, SubscriptionSink, SubscriptionSource,
};
use crate::types::{Bucket, Document, DocumentRecord, Etag, MigrationIndex};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// The `nth` id of the form `users/<i>` that routes to `bucket`.
pub fn id_in_bucket(topology: &ShardTopology, bucket: Bucket, nth: usize) -> String {
    (0u64..)
        .map(|i| format!("users/{}", i))
        .filter(|id| bucket_for(topology, id) == bucket)
        .nth(nth)
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Replication
// ---------------------------------------------------------------------------

/// Replication items kept in etag order; reads do not consume.
#[derive(Debug, Default)]
pub struct InMemoryItemSource {
    items: Mutex<Vec<ReplicationBatchItem>>,
    fail_next: Mutex<Option<String>>,
    changed: Notify,
}

impl InMemoryItemSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: ReplicationBatchItem) {
        self.items.lock().push(item);
        self.changed.notify_waiters();
    }

    /// Make the next read fail with a storage error.
    pub fn fail_next_read(&self, reason: impl Into<String>) {
        *self.fail_next.lock() = Some(reason.into());
    }

    fn last_etag(&self) -> Etag {
        self.items.lock().last().map(|i| i.etag).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl ReplicationItemSource for InMemoryItemSource {
    async fn items_since(&self, etag: Etag, limit: usize) -> Result<Vec<ReplicationBatchItem>> {
        if let Some(reason) = self.fail_next.lock().take() {
            return Err(StorageError::ReadFailed { etag, reason }.into());
        }
        Ok(self
            .items
            .lock()
            .iter()
            .filter(|i| i.etag > etag)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn wait_for_changes(&self, etag: Etag) {
        loop {
            let notified = self.changed.notified();
            if self.last_etag() > etag {
                return;
            }
            notified.await;
        }
    }
}

/// Records every batch it receives.
#[derive(Debug, Default)]
pub struct RecordingReplicationSink {
    batches: Mutex<Vec<ReplicationBatch>>,
    received: Notify,
}

impl RecordingReplicationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every item received, in order.
    pub fn items(&self) -> Vec<ReplicationBatchItem> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.items.iter().cloned())
            .collect()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    /// Wait until at least `n` items arrived; panics after `timeout`.
    pub async fn wait_for_items(&self, n: usize, timeout: Duration) {
        let wait = async {
            loop {
                let notified = self.received.notified();
                if self.items().len() >= n {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(timeout, wait).await.is_err() {
            panic!("expected {} items, got {}", n, self.items().len());
        }
    }
}

#[async_trait::async_trait]
impl ReplicationSink for RecordingReplicationSink {
    async fn send_batch(&self, batch: ReplicationBatch) -> Result<()> {
        self.batches.lock().push(batch);
        self.received.notify_waiters();
        Ok(())
    }
}

/// Hands out one recording sink per migration.
#[derive(Debug, Default)]
pub struct RecordingSinkFactory {
    sinks: Mutex<HashMap<BucketMigration, Arc<RecordingReplicationSink>>>,
}

impl RecordingSinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink_for(&self, migration: &BucketMigration) -> Option<Arc<RecordingReplicationSink>> {
        self.sinks.lock().get(migration).cloned()
    }
}

#[async_trait::async_trait]
impl MigrationSinkFactory for RecordingSinkFactory {
    async fn connect(&self, migration: &BucketMigration) -> Result<Arc<dyn ReplicationSink>> {
        let sink: Arc<dyn ReplicationSink> = self
            .sinks
            .lock()
            .entry(migration.clone())
            .or_insert_with(|| Arc::new(RecordingReplicationSink::new()))
            .clone();
        Ok(sink)
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

type ClusterCall = (String, Bucket, MigrationIndex, String);

/// Records confirm and cleanup commands.
#[derive(Debug, Default)]
pub struct RecordingCluster {
    confirmations: Mutex<Vec<ClusterCall>>,
    cleanups: Mutex<Vec<ClusterCall>>,
    fail_next: Mutex<Option<String>>,
}

impl RecordingCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn confirmations(&self) -> Vec<ClusterCall> {
        self.confirmations.lock().clone()
    }

    pub fn cleanups(&self) -> Vec<ClusterCall> {
        self.cleanups.lock().clone()
    }

    /// Make the next command fail.
    pub fn fail_next(&self, reason: impl Into<String>) {
        *self.fail_next.lock() = Some(reason.into());
    }

    fn check(&self) -> Result<()> {
        match self.fail_next.lock().take() {
            Some(reason) => Err(CoordinatorError::Unavailable(reason).into()),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ReshardingCluster for RecordingCluster {
    async fn destination_migration_confirm(
        &self,
        database: &str,
        bucket: Bucket,
        migration_index: MigrationIndex,
        node_tag: &str,
    ) -> Result<()> {
        self.check()?;
        self.confirmations.lock().push((
            database.to_string(),
            bucket,
            migration_index,
            node_tag.to_string(),
        ));
        Ok(())
    }

    async fn source_migration_cleanup(
        &self,
        database: &str,
        bucket: Bucket,
        migration_index: MigrationIndex,
        node_tag: &str,
    ) -> Result<()> {
        self.check()?;
        self.cleanups.lock().push((
            database.to_string(),
            bucket,
            migration_index,
            node_tag.to_string(),
        ));
        Ok(())
    }
}

/// Bucket store with scripted delete outcomes; an exhausted script yields `Empty`.
#[derive(Debug, Default)]
pub struct InMemoryBucketStore {
    merged: Mutex<HashMap<Bucket, String>>,
    scripts: Mutex<HashMap<Bucket, VecDeque<DeleteBucketResult>>>,
    delete_calls: Mutex<HashMap<Bucket, usize>>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_merged_change_vector(&self, bucket: Bucket, vector: impl Into<String>) {
        self.merged.lock().insert(bucket, vector.into());
    }

    pub fn script_deletes(&self, bucket: Bucket, results: Vec<DeleteBucketResult>) {
        self.scripts.lock().insert(bucket, results.into());
    }

    pub fn delete_calls(&self, bucket: Bucket) -> usize {
        self.delete_calls.lock().get(&bucket).copied().unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn merged_change_vector_in_bucket(&self, bucket: Bucket) -> Result<String> {
        Ok(self.merged.lock().get(&bucket).cloned().unwrap_or_default())
    }

    async fn delete_bucket(
        &self,
        bucket: Bucket,
        _upto_change_vector: &str,
        _batch_size: usize,
    ) -> Result<DeleteBucketResult> {
        *self.delete_calls.lock().entry(bucket).or_insert(0) += 1;
        Ok(self
            .scripts
            .lock()
            .get_mut(&bucket)
            .and_then(|s| s.pop_front())
            .unwrap_or(DeleteBucketResult::Empty))
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StoreInner {
    last_etag: Etag,
    by_etag: BTreeMap<Etag, Document>,
    by_id: HashMap<String, Etag>,
}

/// Document storage of one shard. Every write gets the next etag and the
/// vector `A:<etag>-<db_id>`.
#[derive(Debug)]
pub struct InMemoryDocumentStore {
    db_id: String,
    inner: Mutex<StoreInner>,
    changed: Notify,
}

impl InMemoryDocumentStore {
    pub fn new(db_id: impl Into<String>) -> Self {
        Self {
            db_id: db_id.into(),
            inner: Mutex::new(StoreInner::default()),
            changed: Notify::new(),
        }
    }

    /// Write a document and return the stored version.
    pub fn put(&self, id: &str, data: &'static str) -> Document {
        let mut inner = self.inner.lock();
        let etag = inner.last_etag + 1;
        let change_vector = format!("A:{}-{}", etag, self.db_id);
        self.store(&mut inner, Document::new(id, etag, change_vector, data))
    }

    /// Write a document with an explicit change vector.
    pub fn put_with_change_vector(&self, id: &str, change_vector: &str, data: &'static str) -> Document {
        let mut inner = self.inner.lock();
        let etag = inner.last_etag + 1;
        self.store(&mut inner, Document::new(id, etag, change_vector, data))
    }

    pub fn delete(&self, id: &str) {
        let mut inner = self.inner.lock();
        if let Some(etag) = inner.by_id.remove(id) {
            inner.by_etag.remove(&etag);
        }
    }

    fn store(&self, inner: &mut StoreInner, document: Document) -> Document {
        inner.last_etag = document.etag;
        if let Some(previous) = inner.by_id.insert(document.id.clone(), document.etag) {
            inner.by_etag.remove(&previous);
        }
        inner.by_etag.insert(document.etag, document.clone());
        self.changed.notify_waiters();
        document
    }
}

#[async_trait::async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let inner = self.inner.lock();
        Ok(inner
            .by_id
            .get(id)
            .and_then(|etag| inner.by_etag.get(etag))
            .cloned())
    }

    async fn documents_since(&self, etag: Etag, limit: usize) -> Result<Vec<Document>> {
        let inner = self.inner.lock();
        Ok(inner
            .by_etag
            .range(etag + 1..)
            .take(limit)
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn wait_for_changes(&self, etag: Etag) {
        loop {
            let notified = self.changed.notified();
            if self.inner.lock().last_etag > etag {
                return;
            }
            notified.await;
        }
    }
}

/// Source that replays a fixed list of documents with a fixed origin.
#[derive(Debug, Default)]
pub struct ScriptedSubscriptionSource {
    documents: Mutex<Vec<FetchedDocument>>,
}

impl ScriptedSubscriptionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, document: FetchedDocument) {
        self.documents.lock().push(document);
    }
}

struct ScriptedFetcher {
    documents: VecDeque<FetchedDocument>,
}

#[async_trait::async_trait]
impl SubscriptionFetcher for ScriptedFetcher {
    async fn next(&mut self) -> Result<Option<FetchedDocument>> {
        Ok(self.documents.pop_front())
    }
}

#[async_trait::async_trait]
impl SubscriptionSource for ScriptedSubscriptionSource {
    async fn open_fetcher(&self, _request: FetchRequest) -> Result<Box<dyn SubscriptionFetcher>> {
        let documents = std::mem::take(&mut *self.documents.lock());
        Ok(Box::new(ScriptedFetcher {
            documents: documents.into(),
        }))
    }

    async fn wait_for_changes(&self, _etag: Etag) {
        std::future::pending::<()>().await
    }
}

/// Records batches sent to the client.
#[derive(Debug, Default)]
pub struct RecordingSubscriptionSink {
    batches: Mutex<Vec<SubscriptionBatch>>,
    received: Notify,
    fail_sends: AtomicBool,
}

impl RecordingSubscriptionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<SubscriptionBatch> {
        self.batches.lock().clone()
    }

    /// Fail every send until reset, as a dropped client would.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Wait until at least `n` batches arrived; panics after `timeout`.
    pub async fn wait_for_batches(&self, n: usize, timeout: Duration) -> Vec<SubscriptionBatch> {
        let wait = async {
            loop {
                let notified = self.received.notified();
                if self.batches.lock().len() >= n {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(timeout, wait).await.is_err() {
            panic!("expected {} batches, got {}", n, self.batches.lock().len());
        }
        self.batches()
    }
}

#[async_trait::async_trait]
impl SubscriptionSink for RecordingSubscriptionSink {
    async fn send_batch(&self, batch: SubscriptionBatch) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::SendFailed("client connection reset".into()));
        }
        self.batches.lock().push(batch);
        self.received.notify_waiters();
        Ok(())
    }
}

/// Coordinator whose records and acknowledgments can be made to fail.
#[derive(Debug, Default)]
pub struct FlakyCoordinator {
    inner: InMemorySubscriptionGroup,
    fail_acks: AtomicBool,
    failing_records: AtomicUsize,
    records: Mutex<Vec<RecordBatchRequest>>,
    releases: Mutex<Vec<ReleaseBatchRequest>>,
}

impl FlakyCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(&self) -> &InMemorySubscriptionGroup {
        &self.inner
    }

    /// Fail every ack until reset.
    pub fn set_fail_acks(&self, fail: bool) {
        self.fail_acks.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `n` record requests.
    pub fn fail_next_records(&self, n: usize) {
        self.failing_records.store(n, Ordering::SeqCst);
    }

    /// Every record request that reached the group.
    pub fn records(&self) -> Vec<RecordBatchRequest> {
        self.records.lock().clone()
    }

    /// Every release request received.
    pub fn releases(&self) -> Vec<ReleaseBatchRequest> {
        self.releases.lock().clone()
    }
}

#[async_trait::async_trait]
impl SubscriptionGroupCoordinator for FlakyCoordinator {
    async fn record_batch(&self, request: RecordBatchRequest) -> Result<RecordBatchResponse> {
        let failing = self
            .failing_records
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Error::Coordinator(CoordinatorError::Unavailable(
                "coordinator unreachable".into(),
            )));
        }
        self.records.lock().push(request.clone());
        self.inner.record_batch(request).await
    }

    async fn acknowledge_batch(&self, request: AcknowledgeBatchRequest) -> Result<()> {
        if self.fail_acks.load(Ordering::SeqCst) {
            return Err(Error::Coordinator(CoordinatorError::Unavailable(
                "coordinator unreachable".into(),
            )));
        }
        self.inner.acknowledge_batch(request).await
    }

    async fn release_batch(&self, request: ReleaseBatchRequest) -> Result<()> {
        self.releases.lock().push(request.clone());
        self.inner.release_batch(request).await
    }

    async fn active_batch_documents(
        &self,
        subscription: &str,
        shard: &str,
    ) -> Result<HashSet<String>> {
        self.inner.active_batch_documents(subscription, shard).await
    }

    async fn resend_documents(&self, subscription: &str, shard: &str) -> Result<Vec<DocumentRecord>> {
        self.inner.resend_documents(subscription, shard).await
    }
}
