//! Test support for resharding components.
//!
//! In-memory fakes stand in for the storage engine, the cluster and the
//! client side of replication and subscription connections, so a whole
//! migration can be driven inside one process:
//!
//! ```text
//!  InMemoryItemSource ──► ReplicationSender ──► RecordingReplicationSink
//!  InMemoryDocumentStore ──► SubscriptionProcessor ──► RecordingSubscriptionSink
//!  RecordingCluster / InMemoryBucketStore ◄── ReshardingHandler
//! ```

pub mod fakes;

#[cfg(test)]
mod resharding_e2e_tests;
#[cfg(test)]
mod utils;

pub use fakes::{
    id_in_bucket, FlakyCoordinator, InMemoryBucketStore, InMemoryDocumentStore,
    InMemoryItemSource, RecordingCluster, RecordingReplicationSink, RecordingSinkFactory,
    RecordingSubscriptionSink, ScriptedSubscriptionSource,
};
