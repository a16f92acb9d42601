//! Subscription group coordination.
//!
//! Every shard serving a logical subscription records its batches with one
//! coordinator. The coordinator hands out batch ids, reports documents another
//! shard is already delivering, and owns the per-shard resend sets.
//!
//! A recorded batch stays active until it is acknowledged or released. Its
//! documents leave the shard's resend set only on acknowledgment; a released
//! batch puts them back. Recording a new batch for a shard supersedes that
//! shard's older active batches the same way, since a shard has at most one
//! batch in flight per subscription.
//!
//! ```text
//!  shard 0 ──record_batch──►┌──────────────────────────┐
//!  shard 1 ──record_batch──►│ SubscriptionGroup        │
//!  shard 2 ──acknowledge───►│  active batches by id    │
//!                           │  resend set per shard    │
//!                           └──────────────────────────┘
//! ```
//!
//! Calls are serialized per group. Acknowledging an already acknowledged batch
//! succeeds without effect, so a retried ack is safe.

use crate::error::{CoordinatorError, Result};
use crate::types::DocumentRecord;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Request to record a batch about to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatchRequest {
    pub subscription: String,
    pub shard: String,
    /// Documents in the batch.
    pub documents: Vec<DocumentRecord>,
    /// Ids to drop from the shard's resend set.
    pub resend_removals: Vec<String>,
    /// Merge of the vectors sent so far on the connection.
    pub last_change_vector: String,
}

/// Coordinator answer to [`RecordBatchRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatchResponse {
    /// Batch id, increasing across the group.
    pub index: u64,
    /// Documents of this batch another shard is already delivering.
    pub skipped: HashSet<String>,
}

/// Request to acknowledge a delivered batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcknowledgeBatchRequest {
    pub subscription: String,
    pub shard: String,
    /// Idempotency key.
    pub batch_id: u64,
    /// Merge of the vectors sent so far on the connection.
    pub last_sent_change_vector: String,
    /// Vector acknowledged by the client.
    pub ack_change_vector: String,
    /// Documents to put back into the shard's resend set.
    pub resend: Vec<DocumentRecord>,
}

/// Request to give up a recorded batch that will not be acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseBatchRequest {
    pub subscription: String,
    pub shard: String,
    pub batch_id: u64,
    /// Documents held back locally that must be delivered later.
    pub resend: Vec<DocumentRecord>,
}

/// Cross-shard bookkeeping service of a subscription.
#[async_trait::async_trait]
pub trait SubscriptionGroupCoordinator: Send + Sync + std::fmt::Debug {
    /// Record a batch; returns its id and the documents to skip.
    async fn record_batch(&self, request: RecordBatchRequest) -> Result<RecordBatchResponse>;

    /// Acknowledge a recorded batch.
    async fn acknowledge_batch(&self, request: AcknowledgeBatchRequest) -> Result<()>;

    /// Give up a recorded batch; its documents go back to the shard's resend set.
    async fn release_batch(&self, request: ReleaseBatchRequest) -> Result<()>;

    /// Ids of every document in an unacknowledged batch of a shard other than `shard`.
    async fn active_batch_documents(&self, subscription: &str, shard: &str)
        -> Result<HashSet<String>>;

    /// Resend set of a shard.
    async fn resend_documents(&self, subscription: &str, shard: &str)
        -> Result<Vec<DocumentRecord>>;
}

#[derive(Debug)]
struct ActiveBatch {
    shard: String,
    /// Delivered id to the vector it was delivered with.
    documents: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct GroupState {
    next_batch_id: u64,
    active: BTreeMap<u64, ActiveBatch>,
    acknowledged: BTreeSet<u64>,
    resend: HashMap<String, BTreeMap<String, String>>,
    last_acknowledged: HashMap<String, String>,
}

impl GroupState {
    fn resend_of(&mut self, shard: &str) -> &mut BTreeMap<String, String> {
        self.resend.entry(shard.to_string()).or_default()
    }

    /// Drop an active batch and put its documents back into its shard's resend set.
    fn return_to_resend(&mut self, batch_id: u64) -> Option<usize> {
        let batch = self.active.remove(&batch_id)?;
        let returned = batch.documents.len();
        let resend = self.resend_of(&batch.shard);
        for (id, change_vector) in batch.documents {
            resend.insert(id, change_vector);
        }
        Some(returned)
    }
}

/// In-process coordinator for all subscriptions of a database.
#[derive(Debug, Default)]
pub struct InMemorySubscriptionGroup {
    groups: Mutex<HashMap<String, GroupState>>,
}

impl InMemorySubscriptionGroup {
    /// Create an empty coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a document into a shard's resend set.
    pub async fn add_to_resend(&self, subscription: &str, shard: &str, record: DocumentRecord) {
        let mut groups = self.groups.lock().await;
        groups
            .entry(subscription.to_string())
            .or_default()
            .resend
            .entry(shard.to_string())
            .or_default()
            .insert(record.document_id, record.change_vector);
    }

    /// Last vector acknowledged by a shard.
    pub async fn last_acknowledged(&self, subscription: &str, shard: &str) -> Option<String> {
        let groups = self.groups.lock().await;
        groups
            .get(subscription)
            .and_then(|g| g.last_acknowledged.get(shard).cloned())
    }

    /// Ids of batches recorded but not acknowledged.
    pub async fn active_batches(&self, subscription: &str) -> Vec<u64> {
        let groups = self.groups.lock().await;
        groups
            .get(subscription)
            .map(|g| g.active.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl SubscriptionGroupCoordinator for InMemorySubscriptionGroup {
    async fn record_batch(&self, request: RecordBatchRequest) -> Result<RecordBatchResponse> {
        let mut groups = self.groups.lock().await;
        let group = groups.entry(request.subscription.clone()).or_default();

        let superseded: Vec<u64> = group
            .active
            .iter()
            .filter(|(_, b)| b.shard == request.shard)
            .map(|(id, _)| *id)
            .collect();
        for batch_id in superseded {
            if let Some(returned) = group.return_to_resend(batch_id) {
                warn!(
                    subscription = %request.subscription,
                    shard = %request.shard,
                    batch_id,
                    returned,
                    "Superseded unacknowledged subscription batch"
                );
            }
        }

        let skipped: HashSet<String> = request
            .documents
            .iter()
            .filter(|d| {
                group
                    .active
                    .values()
                    .any(|b| b.documents.contains_key(&d.document_id))
            })
            .map(|d| d.document_id.clone())
            .collect();

        let resend = group.resend_of(&request.shard);
        for id in request.resend_removals.iter().chain(skipped.iter()) {
            resend.remove(id);
        }

        group.next_batch_id += 1;
        let index = group.next_batch_id;
        let documents = request
            .documents
            .into_iter()
            .filter(|d| !skipped.contains(&d.document_id))
            .map(|d| (d.document_id, d.change_vector))
            .collect();
        group.active.insert(
            index,
            ActiveBatch {
                shard: request.shard.clone(),
                documents,
            },
        );

        debug!(
            subscription = %request.subscription,
            shard = %request.shard,
            batch_id = index,
            skipped = skipped.len(),
            "Recorded subscription batch"
        );
        Ok(RecordBatchResponse { index, skipped })
    }

    async fn acknowledge_batch(&self, request: AcknowledgeBatchRequest) -> Result<()> {
        let mut groups = self.groups.lock().await;
        let group = groups.entry(request.subscription.clone()).or_default();

        if group.acknowledged.contains(&request.batch_id) {
            debug!(batch_id = request.batch_id, "Batch already acknowledged");
            return Ok(());
        }

        let batch = group
            .active
            .get(&request.batch_id)
            .ok_or(CoordinatorError::UnknownBatch(request.batch_id))?;
        if batch.shard != request.shard {
            return Err(CoordinatorError::WrongShard {
                batch_id: request.batch_id,
                owner: batch.shard.clone(),
                requester: request.shard,
            }
            .into());
        }

        let delivered = group
            .active
            .remove(&request.batch_id)
            .map(|b| b.documents)
            .unwrap_or_default();
        group.acknowledged.insert(request.batch_id);

        let resend = group.resend_of(&request.shard);
        for id in delivered.keys() {
            resend.remove(id);
        }
        for record in request.resend {
            resend.insert(record.document_id, record.change_vector);
        }
        group
            .last_acknowledged
            .insert(request.shard.clone(), request.ack_change_vector);

        debug!(
            subscription = %request.subscription,
            shard = %request.shard,
            batch_id = request.batch_id,
            "Acknowledged subscription batch"
        );
        Ok(())
    }

    async fn release_batch(&self, request: ReleaseBatchRequest) -> Result<()> {
        let mut groups = self.groups.lock().await;
        let group = groups.entry(request.subscription.clone()).or_default();

        if group.acknowledged.contains(&request.batch_id) {
            debug!(batch_id = request.batch_id, "Released batch was already acknowledged");
            return Ok(());
        }
        if let Some(batch) = group.active.get(&request.batch_id) {
            if batch.shard != request.shard {
                return Err(CoordinatorError::WrongShard {
                    batch_id: request.batch_id,
                    owner: batch.shard.clone(),
                    requester: request.shard,
                }
                .into());
            }
        }

        let returned = group.return_to_resend(request.batch_id).unwrap_or(0);
        let resend = group.resend_of(&request.shard);
        for record in request.resend {
            resend.insert(record.document_id, record.change_vector);
        }

        info!(
            subscription = %request.subscription,
            shard = %request.shard,
            batch_id = request.batch_id,
            returned,
            "Released subscription batch"
        );
        Ok(())
    }

    async fn active_batch_documents(
        &self,
        subscription: &str,
        shard: &str,
    ) -> Result<HashSet<String>> {
        let groups = self.groups.lock().await;
        Ok(groups
            .get(subscription)
            .map(|g| {
                g.active
                    .values()
                    .filter(|b| b.shard != shard)
                    .flat_map(|b| b.documents.keys().cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn resend_documents(
        &self,
        subscription: &str,
        shard: &str,
    ) -> Result<Vec<DocumentRecord>> {
        let groups = self.groups.lock().await;
        Ok(groups
            .get(subscription)
            .and_then(|g| g.resend.get(shard))
            .map(|r| {
                r.iter()
                    .map(|(id, cv)| DocumentRecord::new(id.clone(), cv.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
