//! Per-connection subscription delivery state.

use crate::change_vector::ChangeVector;
use crate::types::{DocumentRecord, Etag};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Delivery bookkeeping of one subscription on one shard.
///
/// Created when a client attaches, updated on every batch, dropped when the
/// connection closes. Cross-shard state lives in the group coordinator.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionDeliveryState {
    pub(crate) subscription: String,
    pub(crate) shard_name: String,
    pub(crate) starting_point_per_shard: HashMap<String, String>,
    pub(crate) last_change_vector_sent: String,
    pub(crate) last_fetched_etag: Etag,
    /// Storage etag reached by the current batch, committed once it is recorded.
    pub(crate) batch_fetched_etag: Etag,
    pub(crate) batch_items: Vec<DocumentRecord>,
    pub(crate) resend_removals: BTreeSet<String>,
    pub(crate) deferred: Vec<DocumentRecord>,
    pub(crate) skipped: HashSet<String>,
    pub(crate) active_batch_documents: HashSet<String>,
    pub(crate) pending_batch: Option<u64>,
}

impl SubscriptionDeliveryState {
    /// Fresh state for a subscription on a shard.
    pub fn new(subscription: impl Into<String>, shard_name: impl Into<String>) -> Self {
        Self {
            subscription: subscription.into(),
            shard_name: shard_name.into(),
            ..Default::default()
        }
    }

    /// Resume from a previously acknowledged vector and storage etag.
    pub fn with_starting_point(mut self, change_vector: impl Into<String>, etag: Etag) -> Self {
        self.starting_point_per_shard
            .insert(self.shard_name.clone(), change_vector.into());
        self.last_fetched_etag = etag;
        self
    }

    /// Subscription name.
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Local shard database name.
    pub fn shard_name(&self) -> &str {
        &self.shard_name
    }

    /// Vector from which this shard's next batch starts.
    pub fn starting_point(&self) -> &str {
        self.starting_point_per_shard
            .get(&self.shard_name)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Last acknowledged vector of every shard seen so far.
    pub fn starting_points(&self) -> &HashMap<String, String> {
        &self.starting_point_per_shard
    }

    /// Merge of every vector sent on this connection.
    pub fn last_change_vector_sent(&self) -> &str {
        &self.last_change_vector_sent
    }

    /// Highest storage etag whose documents are recorded or skipped.
    pub fn last_fetched_etag(&self) -> Etag {
        self.last_fetched_etag
    }

    /// Documents sent in the current batch.
    pub fn batch_items(&self) -> &[DocumentRecord] {
        &self.batch_items
    }

    /// Ids to drop from the resend set with the next record.
    pub fn resend_removals(&self) -> &BTreeSet<String> {
        &self.resend_removals
    }

    /// Documents held back by an active migration.
    pub fn deferred(&self) -> &[DocumentRecord] {
        &self.deferred
    }

    /// Ids another shard delivers in its active batch.
    pub fn skipped(&self) -> &HashSet<String> {
        &self.skipped
    }

    /// Batch recorded but not yet acknowledged.
    pub fn pending_batch(&self) -> Option<u64> {
        self.pending_batch
    }

    /// Whether anything must reach the coordinator even without documents.
    pub fn has_bookkeeping(&self) -> bool {
        !self.resend_removals.is_empty() || !self.deferred.is_empty()
    }

    pub(crate) fn begin_batch(&mut self, active_batch_documents: HashSet<String>) {
        self.clear_batch();
        self.batch_fetched_etag = self.last_fetched_etag;
        self.active_batch_documents = active_batch_documents;
    }

    pub(crate) fn commit_fetched_etag(&mut self) {
        self.last_fetched_etag = self.last_fetched_etag.max(self.batch_fetched_etag);
    }

    pub(crate) fn record_sent_vector(&mut self, change_vector: &str) {
        self.last_change_vector_sent = merge_vectors(&self.last_change_vector_sent, change_vector);
    }

    pub(crate) fn complete_batch(&mut self, ack_change_vector: &str) {
        let merged = merge_vectors(self.starting_point(), ack_change_vector);
        self.starting_point_per_shard
            .insert(self.shard_name.clone(), merged);
        self.clear_batch();
    }

    /// Forget the recorded batch; the coordinator owns its documents again.
    pub(crate) fn abandon_batch(&mut self) {
        self.clear_batch();
    }

    fn clear_batch(&mut self) {
        self.batch_items.clear();
        self.resend_removals.clear();
        self.deferred.clear();
        self.skipped.clear();
        self.pending_batch = None;
    }
}

/// Entry-wise merge of two textual vectors. An unparseable side is ignored.
pub fn merge_vectors(a: &str, b: &str) -> String {
    match (ChangeVector::parse(a), ChangeVector::parse(b)) {
        (Ok(a), Ok(b)) => a.merge(&b).to_string(),
        (Ok(a), Err(_)) => a.to_string(),
        (Err(_), Ok(b)) => b.to_string(),
        (Err(_), Err(_)) => String::new(),
    }
}
