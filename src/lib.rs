//! Online bucket resharding for a sharded document database.
//!
//! Documents are routed to one of a fixed number of buckets, and every bucket
//! is owned by exactly one shard. Resharding moves a bucket from a source shard
//! to a destination shard while both keep serving traffic. This crate provides
//! the pieces that make the move safe:
//!
//! - **Routing**: document id to bucket to shard, with `$` suffix routing
//! - **Migration replication**: a filtered stream of one bucket's items from
//!   source to destination, with `MOVE` provenance tagged on change vectors
//! - **Lifecycle**: destination confirmation and source cleanup, driven by
//!   topology changes
//! - **Subscriptions**: delivery that never hands a document to a client twice
//!   while its bucket is in flight
//!
//! # Example
//!
//! ```rust,no_run
//! use reshard::{ShardBucketMigration, ShardBucketRange, ShardTopology, ShardingConfig};
//!
//! fn main() -> reshard::Result<()> {
//!     let topology = ShardTopology::new(
//!         "orders",
//!         "orders-db",
//!         &ShardingConfig::new(1024),
//!         vec![ShardBucketRange::new(0, 0), ShardBucketRange::new(512, 1)],
//!     )?
//!     .with_shard_members(0, ["A"])
//!     .with_shard_members(1, ["B"])
//!     // Move bucket 7 from shard 0 to shard 1 at migration index 1.
//!     .with_migration(ShardBucketMigration::new(7, 0, 1, 1))?;
//!
//!     // Everything after `$` is the routing key.
//!     let bucket = topology.router().bucket_for("users/1$orders/7");
//!     println!("bucket {bucket} lives on shard {}", topology.shard_for_bucket(bucket));
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     TopologyHandle                           │
//! │   buckets ─► shards, per-bucket ShardBucketMigration         │
//! └──────────────────────────────────────────────────────────────┘
//!        │                      │                        │
//!        ▼                      ▼                        ▼
//! ┌──────────────┐   ┌────────────────────┐   ┌────────────────────┐
//! │ Replication  │   │ ReshardingHandler  │   │ Subscriptions      │
//! │ loader/sender│   │ confirm / cleanup  │   │ ownership-aware    │
//! │ MOVE tagging │   │                    │   │ batch delivery     │
//! └──────────────┘   └────────────────────┘   └────────────────────┘
//! ```

pub mod change_vector;
pub mod config;
pub mod error;
pub mod metrics;
pub mod replication;
pub mod sharding;
pub mod subscription;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use change_vector::{ChangeVector, ChangeVectorEntry, ChangeVectorMode, ConflictStatus};
pub use config::{
    CleanupConfig, ReplicationConfig, ReshardingConfig, ShardingConfig, SubscriptionConfig,
    TagFailurePolicy,
};
pub use error::{ChangeVectorError, CoordinatorError, Error, Result, StorageError};
pub use types::{
    shard_name, Bucket, Document, DocumentFlags, DocumentRecord, Etag, MigrationIndex, ShardNumber,
};

// Re-export metrics types
pub use metrics::{Counter, Gauge, LabeledCounter, ReshardingMetrics, ReshardingMetricsSnapshot};

// Re-export sharding types
pub use sharding::{
    BucketMigration, BucketRouter, BucketStore, DeleteBucketResult, LifecycleReport,
    MigrationStatus, ReshardingCluster, ReshardingHandler, ShardBucketMigration,
    ShardBucketRange, ShardTopology, TopologyHandle,
};

// Re-export replication types
pub use replication::{
    MigrationReplicationLoader, MigrationSinkFactory, ProvenanceTagger, ReplicationBatchItem,
    ReplicationItemSource, ReplicationSender, ReplicationSink,
};

// Re-export subscription types
pub use subscription::{
    SubscriptionConnection, SubscriptionGroupCoordinator, SubscriptionProcessor,
    SubscriptionSink, SubscriptionSource,
};
