//! Metrics for resharding observability.
//!
//! Prometheus-style counters and gauges, aggregated in [`ReshardingMetrics`]:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    ReshardingMetrics                          │
//! │  ┌────────────────────────┐  ┌─────────────────────────────┐ │
//! │  │ Replication            │  │ Subscriptions               │ │
//! │  │ - items sent           │  │ - documents sent            │ │
//! │  │ - items skipped{reason}│  │ - suppressed{reason}        │ │
//! │  │ - tag failures         │  │ - resend removals           │ │
//! │  │ - active senders       │  │ - batches recorded / acked  │ │
//! │  │                        │  │ - batches released          │ │
//! │  └────────────────────────┘  └─────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;

pub use counters::{Counter, LabeledCounter};
pub use gauges::Gauge;

/// Skip reason: item flagged artificial.
pub const SKIP_ARTIFICIAL: &str = "artificial";
/// Skip reason: item belongs to another bucket.
pub const SKIP_OTHER_BUCKET: &str = "other_bucket";
/// Skip reason: tagging failed under the `Skip` policy.
pub const SKIP_TAG_FAILURE: &str = "tag_failure";

/// Suppression reason: bucket is being moved.
pub const SUPPRESSED_ACTIVE_MIGRATION: &str = "active_migration";
/// Suppression reason: bucket is owned by another shard.
pub const SUPPRESSED_NOT_OWNER: &str = "not_owner";

/// Counters and gauges for one shard's resharding components.
#[derive(Debug)]
pub struct ReshardingMetrics {
    /// Replication items shipped to a destination.
    pub replication_items_sent: Counter,
    /// Replication items dropped, by reason.
    pub replication_items_skipped: LabeledCounter<1>,
    /// Change vectors that could not be tagged.
    pub tag_failures: Counter,
    /// Migration senders currently running.
    pub active_migration_senders: Gauge,
    /// Subscription documents delivered.
    pub subscription_documents_sent: Counter,
    /// Subscription documents suppressed, by reason.
    pub subscription_documents_suppressed: LabeledCounter<1>,
    /// Ids removed from resend sets.
    pub resend_removals: Counter,
    /// Batches recorded with the coordinator.
    pub batches_recorded: Counter,
    /// Batches acknowledged with the coordinator.
    pub batches_acknowledged: Counter,
    /// Batches given up without an acknowledgment.
    pub batches_released: Counter,
    /// Buckets confirmed at a destination.
    pub buckets_confirmed: Counter,
    /// Buckets deleted at a source.
    pub buckets_cleaned: Counter,
}

impl ReshardingMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self {
            replication_items_sent: Counter::new(
                "resharding_replication_items_sent",
                "Replication items sent on migration channels",
            ),
            replication_items_skipped: LabeledCounter::new(
                "resharding_replication_items_skipped",
                "Replication items dropped from migration channels",
                ["reason"],
            ),
            tag_failures: Counter::new(
                "resharding_tag_failures",
                "Change vectors that could not be tagged with a migration entry",
            ),
            active_migration_senders: Gauge::new(
                "resharding_active_migration_senders",
                "Outgoing migration senders currently running",
            ),
            subscription_documents_sent: Counter::new(
                "resharding_subscription_documents_sent",
                "Subscription documents delivered",
            ),
            subscription_documents_suppressed: LabeledCounter::new(
                "resharding_subscription_documents_suppressed",
                "Subscription documents suppressed because of bucket ownership",
                ["reason"],
            ),
            resend_removals: Counter::new(
                "resharding_resend_removals",
                "Document ids removed from subscription resend sets",
            ),
            batches_recorded: Counter::new(
                "resharding_batches_recorded",
                "Subscription batches recorded with the group coordinator",
            ),
            batches_acknowledged: Counter::new(
                "resharding_batches_acknowledged",
                "Subscription batches acknowledged with the group coordinator",
            ),
            batches_released: Counter::new(
                "resharding_batches_released",
                "Subscription batches released without an acknowledgment",
            ),
            buckets_confirmed: Counter::new(
                "resharding_buckets_confirmed",
                "Moved buckets confirmed by this destination",
            ),
            buckets_cleaned: Counter::new(
                "resharding_buckets_cleaned",
                "Migrated buckets deleted from this source",
            ),
        }
    }

    /// Record a dropped replication item.
    pub fn record_replication_skip(&self, reason: &str) {
        self.replication_items_skipped.inc([reason]);
    }

    /// Record a suppressed subscription document.
    pub fn record_subscription_suppressed(&self, reason: &str) {
        self.subscription_documents_suppressed.inc([reason]);
    }

    /// Point-in-time copy of all values.
    pub fn snapshot(&self) -> ReshardingMetricsSnapshot {
        ReshardingMetricsSnapshot {
            replication_items_sent: self.replication_items_sent.get(),
            skipped_artificial: self.replication_items_skipped.get([SKIP_ARTIFICIAL]),
            skipped_other_bucket: self.replication_items_skipped.get([SKIP_OTHER_BUCKET]),
            skipped_tag_failure: self.replication_items_skipped.get([SKIP_TAG_FAILURE]),
            tag_failures: self.tag_failures.get(),
            active_migration_senders: self.active_migration_senders.get().max(0) as u64,
            subscription_documents_sent: self.subscription_documents_sent.get(),
            suppressed_active_migration: self
                .subscription_documents_suppressed
                .get([SUPPRESSED_ACTIVE_MIGRATION]),
            suppressed_not_owner: self
                .subscription_documents_suppressed
                .get([SUPPRESSED_NOT_OWNER]),
            resend_removals: self.resend_removals.get(),
            batches_recorded: self.batches_recorded.get(),
            batches_acknowledged: self.batches_acknowledged.get(),
            batches_released: self.batches_released.get(),
            buckets_confirmed: self.buckets_confirmed.get(),
            buckets_cleaned: self.buckets_cleaned.get(),
        }
    }
}

impl ReshardingMetrics {
    /// Render every metric in the Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        for counter in [
            &self.replication_items_sent,
            &self.tag_failures,
            &self.subscription_documents_sent,
            &self.resend_removals,
            &self.batches_recorded,
            &self.batches_acknowledged,
            &self.batches_released,
            &self.buckets_confirmed,
            &self.buckets_cleaned,
        ] {
            write_header(&mut out, counter.name(), counter.help(), "counter");
            out.push_str(&format!("{} {}\n", counter.name(), counter.get()));
        }

        for labeled in [
            &self.replication_items_skipped,
            &self.subscription_documents_suppressed,
        ] {
            write_header(&mut out, labeled.name(), labeled.help(), "counter");
            let [label] = labeled.label_names();
            for ([value], count) in labeled.values() {
                out.push_str(&format!(
                    "{}{{{}=\"{}\"}} {}\n",
                    labeled.name(),
                    label,
                    value,
                    count
                ));
            }
        }

        let gauge = &self.active_migration_senders;
        write_header(&mut out, gauge.name(), gauge.help(), "gauge");
        out.push_str(&format!("{} {}\n", gauge.name(), gauge.get()));
        out
    }
}

fn write_header(out: &mut String, name: &str, help: &str, kind: &str) {
    out.push_str(&format!("# HELP {} {}\n# TYPE {} {}\n", name, help, name, kind));
}

impl Default for ReshardingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of [`ReshardingMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReshardingMetricsSnapshot {
    pub replication_items_sent: u64,
    pub skipped_artificial: u64,
    pub skipped_other_bucket: u64,
    pub skipped_tag_failure: u64,
    pub tag_failures: u64,
    pub active_migration_senders: u64,
    pub subscription_documents_sent: u64,
    pub suppressed_active_migration: u64,
    pub suppressed_not_owner: u64,
    pub resend_removals: u64,
    pub batches_recorded: u64,
    pub batches_acknowledged: u64,
    pub batches_released: u64,
    pub buckets_confirmed: u64,
    pub buckets_cleaned: u64,
}

impl ReshardingMetricsSnapshot {
    /// Total replication items dropped.
    pub fn replication_items_skipped(&self) -> u64 {
        self.skipped_artificial + self.skipped_other_bucket + self.skipped_tag_failure
    }
}
