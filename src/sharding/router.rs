//! Bucket routing.
//!
//! Maps a document id to its bucket and a bucket to the shard that owns it.
//!
//! ```text
//! bucket = xxhash64(lowercase(routing_key(id)), seed) % number_of_buckets
//! shard  = owner of the range containing bucket
//! ```
//!
//! Routing is pure: no locks, no I/O. Callers hold an immutable
//! [`ShardTopology`] snapshot for the duration of a batch.

use super::topology::ShardTopology;
use crate::config::ShardingConfig;
use crate::types::{Bucket, ShardNumber};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Separator after which an id carries an explicit routing key.
pub const ROUTING_SEPARATOR: char = '$';

/// Stateless id → bucket hasher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRouter {
    number_of_buckets: u32,
    hash_seed: u64,
}

impl BucketRouter {
    /// Create a router. A zero bucket count is clamped to one.
    pub fn new(number_of_buckets: u32, hash_seed: u64) -> Self {
        Self {
            number_of_buckets: number_of_buckets.max(1),
            hash_seed,
        }
    }

    /// Create a router from configuration.
    pub fn from_config(config: &ShardingConfig) -> Self {
        Self::new(config.number_of_buckets, config.hash_seed)
    }

    /// Number of buckets in the keyspace.
    pub fn number_of_buckets(&self) -> u32 {
        self.number_of_buckets
    }

    /// Hash seed.
    pub fn hash_seed(&self) -> u64 {
        self.hash_seed
    }

    /// Hash a routing key, case-insensitively.
    pub fn hash_key(&self, key: &str) -> u64 {
        let mut hasher = XxHash64::with_seed(self.hash_seed);
        hasher.write(key.to_lowercase().as_bytes());
        hasher.finish()
    }

    /// Bucket of a document id.
    pub fn bucket_for(&self, document_id: &str) -> Bucket {
        let hash = self.hash_key(routing_key(document_id));
        (hash % self.number_of_buckets as u64) as Bucket
    }
}

/// Part of the id that determines placement: the text after the last `$`,
/// or the whole id.
pub fn routing_key(document_id: &str) -> &str {
    match document_id.rfind(ROUTING_SEPARATOR) {
        Some(pos) if pos + 1 < document_id.len() => &document_id[pos + 1..],
        _ => document_id,
    }
}

/// Bucket of a document id under a topology.
pub fn bucket_for(topology: &ShardTopology, document_id: &str) -> Bucket {
    topology.router().bucket_for(document_id)
}

/// Shard owning a bucket under a topology.
pub fn shard_for(topology: &ShardTopology, bucket: Bucket) -> ShardNumber {
    topology.shard_for_bucket(bucket)
}

/// Shard owning a document id under a topology.
pub fn shard_for_document(topology: &ShardTopology, document_id: &str) -> ShardNumber {
    shard_for(topology, bucket_for(topology, document_id))
}
