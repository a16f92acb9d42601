//! Per-document delivery decisions.
//!
//! A [`SendDecider`] looks at one fetched document and answers whether it goes
//! to the client. The plain pipeline is [`DefaultSendDecider`]; on a sharded
//! database it is wrapped by [`MigrationAwareSendDecider`], which first checks
//! bucket ownership against the topology snapshot:
//!
//! ```text
//!   document ──► bucket ──► active migration? ──yes──► suppress
//!                               │ no
//!                               ▼
//!                      owner == local shard? ──no──► suppress
//!                               │ yes
//!                               ▼
//!                        DefaultSendDecider
//! ```
//!
//! Suppressed documents lose their payload and change vector so the client
//! never sees a version whose ownership is in flux.

use super::fetcher::FetchOrigin;
use crate::change_vector::{ChangeVector, ChangeVectorMode, ConflictStatus};
use crate::metrics::{ReshardingMetrics, SUPPRESSED_ACTIVE_MIGRATION, SUPPRESSED_NOT_OWNER};
use crate::sharding::{bucket_for, shard_for, ShardTopology};
use crate::types::{Document, ShardNumber};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything a decision may look at for one document.
#[derive(Debug)]
pub struct DecisionContext<'a> {
    pub topology: &'a ShardTopology,
    pub shard_number: ShardNumber,
    pub origin: FetchOrigin,
    /// Last acknowledged vector of the local shard.
    pub starting_point: &'a str,
    /// Merge of every vector sent on this connection.
    pub last_change_vector_sent: &'a str,
    /// Documents in unacknowledged batches of other shards of the group.
    pub active_batch_documents: &'a HashSet<String>,
    /// Stored version of a resend document.
    pub current: Option<&'a Document>,
    /// Ids to drop from the resend set with the next record.
    pub resend_removals: &'a mut BTreeSet<String>,
}

/// Result of [`SendDecider::should_send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendDecision {
    pub send: bool,
    pub reason: Option<String>,
    /// Document to deliver; payload is `None` when nothing is delivered.
    pub result: Document,
    /// Suppressed by bucket ownership while reading storage.
    pub is_active_migration: bool,
    /// Criteria failure reported to the client with the item.
    pub error: Option<String>,
}

impl SendDecision {
    /// Deliver `result`.
    pub fn send(result: Document) -> Self {
        Self {
            send: true,
            reason: None,
            result,
            is_active_migration: false,
            error: None,
        }
    }

    /// Skip `result` for `reason`.
    pub fn skip(result: Document, reason: impl Into<String>) -> Self {
        Self {
            send: false,
            reason: Some(reason.into()),
            result,
            is_active_migration: false,
            error: None,
        }
    }
}

/// Result of [`ResendDecider::should_fetch_from_resend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendDecision {
    pub fetch: bool,
    pub reason: Option<String>,
}

impl ResendDecision {
    fn fetch() -> Self {
        Self {
            fetch: true,
            reason: None,
        }
    }

    fn skip(reason: String) -> Self {
        Self {
            fetch: false,
            reason: Some(reason),
        }
    }
}

/// Decides whether a fetched document is delivered.
pub trait SendDecider: Send + Sync + std::fmt::Debug {
    fn should_send(&self, ctx: &mut DecisionContext<'_>, item: Document) -> SendDecision;
}

/// Decides whether a resend entry is delivered again.
pub trait ResendDecider: Send + Sync + std::fmt::Debug {
    /// `current` is the stored document, `resend_change_vector` the vector it was sent with.
    fn should_fetch_from_resend(
        &self,
        ctx: &mut DecisionContext<'_>,
        id: &str,
        current: Option<&Document>,
        resend_change_vector: &str,
    ) -> ResendDecision;
}

/// Subscription filter.
pub trait SubscriptionCriteria: Send + Sync + std::fmt::Debug {
    /// `Err` carries the failure reported to the client.
    fn matches(&self, document: &Document) -> Result<bool, String>;
}

/// Matches documents whose id starts with a prefix, ignoring case.
#[derive(Debug, Clone)]
pub struct IdPrefixCriteria {
    prefix: String,
}

impl IdPrefixCriteria {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().to_lowercase(),
        }
    }
}

impl SubscriptionCriteria for IdPrefixCriteria {
    fn matches(&self, document: &Document) -> Result<bool, String> {
        Ok(document.id.to_lowercase().starts_with(&self.prefix))
    }
}

/// Resend decision of an unsharded database.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResendDecider;

impl ResendDecider for DefaultResendDecider {
    fn should_fetch_from_resend(
        &self,
        ctx: &mut DecisionContext<'_>,
        id: &str,
        current: Option<&Document>,
        resend_change_vector: &str,
    ) -> ResendDecision {
        let Some(current) = current else {
            ctx.resend_removals.insert(id.to_string());
            return ResendDecision::skip(format!(
                "document '{}' removed and skipped from resend",
                id
            ));
        };

        let status = ChangeVector::conflict_status_str(
            &current.change_vector,
            resend_change_vector,
            ChangeVectorMode::Version,
        );
        match status {
            ConflictStatus::Update => {
                let progress = ChangeVector::conflict_status_str(
                    &current.change_vector,
                    ctx.last_change_vector_sent,
                    ChangeVectorMode::Order,
                );
                match progress {
                    ConflictStatus::Update => {
                        // Delivered later through storage.
                        ctx.resend_removals.insert(id.to_string());
                        ResendDecision::skip(format!(
                            "document '{}' was updated ({}), but the subscription went too far and skipped from resend (sub progress: {})",
                            id, current.change_vector, ctx.last_change_vector_sent
                        ))
                    }
                    ConflictStatus::AlreadyMerged => ResendDecision::fetch(),
                    ConflictStatus::Conflict => ResendDecision::skip(format!(
                        "document '{}' is in status {:?} (local: {}) with the subscription progress (sub progress: {})",
                        id, progress, current.change_vector, ctx.last_change_vector_sent
                    )),
                }
            }
            ConflictStatus::AlreadyMerged => ResendDecision::fetch(),
            ConflictStatus::Conflict => ResendDecision::skip(format!(
                "document '{}' is in conflict, CV in storage '{}' CV in resend list '{}' (sub progress: {})",
                id, current.change_vector, resend_change_vector, ctx.last_change_vector_sent
            )),
        }
    }
}

/// Resend decision of a shard: migration entries of the database are ignored.
#[derive(Debug, Clone)]
pub struct MigrationAwareResendDecider {
    inner: Arc<dyn ResendDecider>,
}

impl MigrationAwareResendDecider {
    pub fn new(inner: Arc<dyn ResendDecider>) -> Self {
        Self { inner }
    }
}

impl Default for MigrationAwareResendDecider {
    fn default() -> Self {
        Self::new(Arc::new(DefaultResendDecider))
    }
}

impl ResendDecider for MigrationAwareResendDecider {
    fn should_fetch_from_resend(
        &self,
        ctx: &mut DecisionContext<'_>,
        id: &str,
        current: Option<&Document>,
        resend_change_vector: &str,
    ) -> ResendDecision {
        let Some(document) = current else {
            return self
                .inner
                .should_fetch_from_resend(ctx, id, None, resend_change_vector);
        };

        match ChangeVector::parse(&document.change_vector) {
            Ok(vector) if vector.is_single() => {
                let mut stripped = document.clone();
                stripped.change_vector = vector.remove_id(ctx.topology.database_id()).to_string();
                self.inner
                    .should_fetch_from_resend(ctx, id, Some(&stripped), resend_change_vector)
            }
            _ => self
                .inner
                .should_fetch_from_resend(ctx, id, Some(document), resend_change_vector),
        }
    }
}

/// Storage, resend and criteria checks of an unsharded subscription.
#[derive(Debug, Clone)]
pub struct DefaultSendDecider {
    resend: Arc<dyn ResendDecider>,
    criteria: Option<Arc<dyn SubscriptionCriteria>>,
}

impl DefaultSendDecider {
    pub fn new(resend: Arc<dyn ResendDecider>) -> Self {
        Self {
            resend,
            criteria: None,
        }
    }

    /// Decider with the unsharded resend rules.
    pub fn plain() -> Self {
        Self::new(Arc::new(DefaultResendDecider))
    }

    /// Filter documents through `criteria`.
    pub fn with_criteria(mut self, criteria: Arc<dyn SubscriptionCriteria>) -> Self {
        self.criteria = Some(criteria);
        self
    }
}

impl SendDecider for DefaultSendDecider {
    fn should_send(&self, ctx: &mut DecisionContext<'_>, mut item: Document) -> SendDecision {
        match ctx.origin {
            FetchOrigin::Storage => {
                let status = ChangeVector::conflict_status_str(
                    &item.change_vector,
                    ctx.starting_point,
                    ChangeVectorMode::Version,
                );
                if status == ConflictStatus::AlreadyMerged {
                    let reason = format!("{} is already merged", item.id);
                    return SendDecision::skip(item, reason);
                }
                if ctx.active_batch_documents.contains(&item.id) {
                    let reason = format!("{} exists in an active batch", item.id);
                    return SendDecision::skip(item, reason);
                }
            }
            FetchOrigin::Resend => {
                let current = ctx.current;
                let decision =
                    self.resend
                        .should_fetch_from_resend(ctx, &item.id, current, &item.change_vector);
                if !decision.fetch {
                    item.change_vector.clear();
                    let reason = decision.reason.unwrap_or_default();
                    return SendDecision::skip(item, reason);
                }
                if let Some(current) = current {
                    item.id = current.id.clone();
                    item.data = current.data.clone();
                    item.change_vector = current.change_vector.clone();
                    item.flags = current.flags;
                }
            }
            FetchOrigin::Live => {}
        }

        let Some(criteria) = &self.criteria else {
            return SendDecision::send(item);
        };

        match criteria.matches(&item) {
            Ok(true) => SendDecision::send(item),
            Ok(false) => {
                if ctx.origin == FetchOrigin::Resend {
                    item.change_vector.clear();
                    ctx.resend_removals.insert(item.id.clone());
                }
                item.data = None;
                let reason = format!("{} filtered out by criteria", item.id);
                SendDecision::skip(item, reason)
            }
            Err(error) => {
                warn!(document_id = %item.id, error = %error, "Subscription criteria failed");
                let reason = format!("Criteria threw exception for document id {}", item.id);
                let mut decision = SendDecision::skip(item, reason);
                decision.error = Some(error);
                decision
            }
        }
    }
}

/// Bucket ownership checks in front of another decider.
#[derive(Debug, Clone)]
pub struct MigrationAwareSendDecider {
    inner: Arc<dyn SendDecider>,
    metrics: Arc<ReshardingMetrics>,
}

impl MigrationAwareSendDecider {
    pub fn new(inner: Arc<dyn SendDecider>, metrics: Arc<ReshardingMetrics>) -> Self {
        Self { inner, metrics }
    }

    /// The full shard pipeline: ownership checks, migration-aware resend rules and optional criteria.
    pub fn sharded(
        criteria: Option<Arc<dyn SubscriptionCriteria>>,
        metrics: Arc<ReshardingMetrics>,
    ) -> Self {
        let mut inner = DefaultSendDecider::new(Arc::new(MigrationAwareResendDecider::default()));
        if let Some(criteria) = criteria {
            inner = inner.with_criteria(criteria);
        }
        Self::new(Arc::new(inner), metrics)
    }

    fn suppress(ctx: &DecisionContext<'_>, mut item: Document, reason: String) -> SendDecision {
        item.clear_content();
        let mut decision = SendDecision::skip(item, reason);
        decision.is_active_migration = ctx.origin == FetchOrigin::Storage;
        decision
    }
}

impl SendDecider for MigrationAwareSendDecider {
    fn should_send(&self, ctx: &mut DecisionContext<'_>, item: Document) -> SendDecision {
        let bucket = bucket_for(ctx.topology, &item.id);
        let owner = shard_for(ctx.topology, bucket);

        if let Some(migration) = ctx.topology.active_migration(bucket) {
            let reason = format!(
                "The document '{}' from bucket '{}' is under active migration to shard '{}' (current shard number: '{}').",
                item.id, bucket, migration.destination_shard, ctx.shard_number
            );
            debug!(
                document_id = %item.id,
                bucket,
                migration_index = migration.migration_index,
                origin = %ctx.origin,
                "Suppressing document of migrating bucket"
            );
            self.metrics
                .record_subscription_suppressed(SUPPRESSED_ACTIVE_MIGRATION);
            return Self::suppress(ctx, item, reason);
        }

        if owner != ctx.shard_number {
            let reason = format!(
                "The owner of '{}' document is shard '{}' (current shard number: '{}').",
                item.id, owner, ctx.shard_number
            );
            if ctx.origin == FetchOrigin::Resend {
                // The owning shard delivers it.
                ctx.resend_removals.insert(item.id.clone());
            }
            self.metrics.record_subscription_suppressed(SUPPRESSED_NOT_OWNER);
            return Self::suppress(ctx, item, reason);
        }

        self.inner.should_send(ctx, item)
    }
}
