//! Bucket sharding: routing, topology, migration descriptors and the
//! resharding lifecycle.
//!
//! ```text
//!  document id ──► BucketRouter ──► bucket ──► ShardTopology ──► shard
//!                                                  │
//!                                   ShardBucketMigration (per bucket)
//!                                                  │
//!                     BucketMigration descriptor ◄─┘ (one per outgoing move)
//! ```

pub mod lifecycle;
pub mod migration;
pub mod router;
pub mod topology;

pub use lifecycle::{
    BucketStore, DeleteBucketResult, LifecycleReport, ReshardingCluster, ReshardingHandler,
};
pub use migration::{BucketMigration, BucketMigrationRecord, MIGRATION_TAG};
pub use router::{bucket_for, routing_key, shard_for, shard_for_document, BucketRouter};
pub use topology::{
    MigrationStatus, ShardBucketMigration, ShardBucketRange, ShardTopology, TopologyHandle,
};
