//! Bucket migration descriptors.
//!
//! A [`BucketMigration`] names exactly one move of a bucket: the same bucket
//! moved twice produces two descriptors that differ by `migration_index`. Any
//! component acting on a migration re-checks its descriptor against the current
//! topology first, so a superseded move is never acted upon.

use super::topology::ShardBucketMigration;
use crate::error::{Error, Result};
use crate::types::{Bucket, MigrationIndex, ShardNumber};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Reserved change-vector tag of migration entries.
pub const MIGRATION_TAG: &str = "MOVE";

/// One in-flight move of a bucket to a destination shard node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketMigration {
    bucket: Bucket,
    destination_shard: ShardNumber,
    destination_node: String,
    migration_index: MigrationIndex,
}

impl BucketMigration {
    /// Create a descriptor. Fails if the destination node is empty.
    pub fn new(
        bucket: Bucket,
        destination_shard: ShardNumber,
        destination_node: impl Into<String>,
        migration_index: MigrationIndex,
    ) -> Result<Self> {
        let destination_node = destination_node.into();
        if destination_node.is_empty() {
            return Err(Error::InvalidArgument(
                "destination node of a bucket migration must not be empty".into(),
            ));
        }
        Ok(Self {
            bucket,
            destination_shard,
            destination_node,
            migration_index,
        })
    }

    /// Bucket being moved.
    pub fn bucket(&self) -> Bucket {
        self.bucket
    }

    /// Destination shard.
    pub fn destination_shard(&self) -> ShardNumber {
        self.destination_shard
    }

    /// Destination node tag.
    pub fn destination_node(&self) -> &str {
        &self.destination_node
    }

    /// Index of the command that started the move.
    pub fn migration_index(&self) -> MigrationIndex {
        self.migration_index
    }

    /// Whether `candidate` describes the very same migration.
    pub fn matches(&self, candidate: &BucketMigration) -> bool {
        self == candidate
    }

    /// Whether a topology entry still refers to this migration.
    pub fn for_bucket_migration(&self, migration: &ShardBucketMigration) -> bool {
        self.migration_index == migration.migration_index
            && self.bucket == migration.bucket
            && self.destination_shard == migration.destination_shard
    }

    /// Human-readable description.
    pub fn describe(&self) -> String {
        self.to_string()
    }

    /// Self-describing record for persistence and propagation.
    pub fn to_record(&self) -> BucketMigrationRecord {
        BucketMigrationRecord {
            bucket: self.bucket,
            destination_shard: self.destination_shard,
            destination_node: self.destination_node.clone(),
            migration_index: self.migration_index,
            description: self.describe(),
        }
    }

    /// Rebuild a descriptor from a record, re-validating it.
    pub fn from_record(record: &BucketMigrationRecord) -> Result<Self> {
        Self::new(
            record.bucket,
            record.destination_shard,
            record.destination_node.clone(),
            record.migration_index,
        )
    }

    /// Serialize the record with bincode.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.to_record())?)
    }

    /// Deserialize a record written by [`BucketMigration::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let record: BucketMigrationRecord = bincode::deserialize(bytes)?;
        Self::from_record(&record)
    }
}

impl fmt::Display for BucketMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Migrating bucket '{}' to shard '{}' on node '{}' @ {}",
            self.bucket, self.destination_shard, self.destination_node, self.migration_index
        )
    }
}

impl Hash for BucketMigration {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut node = XxHash64::with_seed(0);
        node.write(self.destination_node.as_bytes());
        state.write_u64(node.finish() ^ mix64(self.migration_index));
    }
}

/// 64-bit finalizer (murmur3 fmix64).
fn mix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// Serialized form of a [`BucketMigration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketMigrationRecord {
    pub bucket: Bucket,
    pub destination_shard: ShardNumber,
    pub destination_node: String,
    pub migration_index: MigrationIndex,
    pub description: String,
}
