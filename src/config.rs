//! Configuration types for the resharding subsystem.

use crate::error::{Error, Result};
use crate::types::ShardNumber;
use std::time::Duration;

/// Default number of buckets in the keyspace (1024 * 1024).
pub const DEFAULT_NUMBER_OF_BUCKETS: u32 = 1024 * 1024;

/// Main configuration for one shard's resharding components.
#[derive(Debug, Clone)]
pub struct ReshardingConfig {
    /// Name of the sharded database (without the shard suffix).
    pub database_name: String,

    /// Shard number served by this process.
    pub shard_number: ShardNumber,

    /// Tag of the local cluster node.
    pub node_tag: String,

    /// Bucket routing configuration.
    pub sharding: ShardingConfig,

    /// Outgoing replication configuration.
    pub replication: ReplicationConfig,

    /// Subscription delivery configuration.
    pub subscription: SubscriptionConfig,

    /// Source-side bucket cleanup configuration.
    pub cleanup: CleanupConfig,
}

impl Default for ReshardingConfig {
    fn default() -> Self {
        Self {
            database_name: "db".to_string(),
            shard_number: 0,
            node_tag: "A".to_string(),
            sharding: ShardingConfig::default(),
            replication: ReplicationConfig::default(),
            subscription: SubscriptionConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl ReshardingConfig {
    /// Create a new configuration for a shard.
    pub fn new(database_name: impl Into<String>, shard_number: ShardNumber) -> Self {
        Self {
            database_name: database_name.into(),
            shard_number,
            ..Default::default()
        }
    }

    /// Set the local node tag.
    pub fn with_node_tag(mut self, tag: impl Into<String>) -> Self {
        self.node_tag = tag.into();
        self
    }

    /// Set the sharding configuration.
    pub fn with_sharding(mut self, sharding: ShardingConfig) -> Self {
        self.sharding = sharding;
        self
    }

    /// Set the replication configuration.
    pub fn with_replication(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }

    /// Set the subscription configuration.
    pub fn with_subscription(mut self, subscription: SubscriptionConfig) -> Self {
        self.subscription = subscription;
        self
    }

    /// Set the cleanup configuration.
    pub fn with_cleanup(mut self, cleanup: CleanupConfig) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Name of the local shard database.
    pub fn shard_name(&self) -> String {
        crate::types::shard_name(&self.database_name, self.shard_number)
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<()> {
        if self.database_name.is_empty() {
            return Err(Error::Config("database_name must not be empty".into()));
        }
        if self.node_tag.is_empty() {
            return Err(Error::Config("node_tag must not be empty".into()));
        }
        self.sharding.validate()?;
        self.replication.validate()?;
        self.subscription.validate()?;
        self.cleanup.validate()
    }
}

/// Bucket routing configuration.
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// Number of buckets in the keyspace.
    pub number_of_buckets: u32,

    /// Seed for the xxHash64 bucket hash. Must be identical cluster-wide.
    pub hash_seed: u64,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            number_of_buckets: DEFAULT_NUMBER_OF_BUCKETS,
            hash_seed: 0,
        }
    }
}

impl ShardingConfig {
    /// Create a config with a custom bucket count.
    pub fn new(number_of_buckets: u32) -> Self {
        Self {
            number_of_buckets,
            ..Default::default()
        }
    }

    /// Set the hash seed.
    pub fn with_hash_seed(mut self, seed: u64) -> Self {
        self.hash_seed = seed;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.number_of_buckets == 0 {
            return Err(Error::Config("number_of_buckets must be positive".into()));
        }
        Ok(())
    }
}

/// What the migration sender does when an item's change vector cannot be tagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagFailurePolicy {
    /// Forward the item with its original change vector.
    #[default]
    Forward,
    /// Drop the item from the outgoing stream.
    Skip,
    /// Fail the batch; the connection layer decides whether to reconnect.
    Abort,
}

impl std::fmt::Display for TagFailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TagFailurePolicy::Forward => write!(f, "forward"),
            TagFailurePolicy::Skip => write!(f, "skip"),
            TagFailurePolicy::Abort => write!(f, "abort"),
        }
    }
}

/// Outgoing replication configuration.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Maximum items read from storage per batch.
    pub max_items_per_batch: usize,

    /// How long to wait for a change notification before polling storage again.
    pub idle_poll_interval: Duration,

    /// Policy for items whose change vector could not be tagged.
    pub tag_failure_policy: TagFailurePolicy,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_items_per_batch: 1024,
            idle_poll_interval: Duration::from_secs(15),
            tag_failure_policy: TagFailurePolicy::Forward,
        }
    }
}

impl ReplicationConfig {
    /// Set the batch size.
    pub fn with_max_items_per_batch(mut self, n: usize) -> Self {
        self.max_items_per_batch = n;
        self
    }

    /// Set the idle poll interval.
    pub fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    /// Set the tag failure policy.
    pub fn with_tag_failure_policy(mut self, policy: TagFailurePolicy) -> Self {
        self.tag_failure_policy = policy;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_items_per_batch == 0 {
            return Err(Error::Config("max_items_per_batch must be positive".into()));
        }
        Ok(())
    }
}

/// Subscription delivery configuration.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Maximum documents per batch.
    pub batch_size: usize,

    /// Maximum payload bytes per batch.
    pub max_batch_bytes: usize,

    /// How long to wait for a client acknowledgment.
    pub ack_timeout: Duration,

    /// How long to wait for new documents before re-checking storage.
    pub idle_poll_interval: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            batch_size: 4096,
            max_batch_bytes: 32 * 1024 * 1024, // 32MB
            ack_timeout: Duration::from_secs(60),
            idle_poll_interval: Duration::from_secs(15),
        }
    }
}

impl SubscriptionConfig {
    /// Set the batch size.
    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    /// Set the byte limit per batch.
    pub fn with_max_batch_bytes(mut self, n: usize) -> Self {
        self.max_batch_bytes = n;
        self
    }

    /// Set the ack timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the idle poll interval.
    pub fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if self.max_batch_bytes == 0 {
            return Err(Error::Config("max_batch_bytes must be positive".into()));
        }
        Ok(())
    }
}

/// Source-side bucket cleanup configuration.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Documents deleted per cleanup transaction.
    pub delete_batch_size: usize,

    /// Upper bound on cleanup transactions per run.
    pub max_batches_per_run: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            delete_batch_size: 1024,
            max_batches_per_run: 10_000,
        }
    }
}

impl CleanupConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.delete_batch_size == 0 || self.max_batches_per_run == 0 {
            return Err(Error::Config("cleanup limits must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ReshardingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ReshardingConfig::new("orders", 2)
            .with_node_tag("B")
            .with_sharding(ShardingConfig::new(64).with_hash_seed(7))
            .with_replication(
                ReplicationConfig::default().with_tag_failure_policy(TagFailurePolicy::Skip),
            );

        assert_eq!(config.shard_name(), "orders$2");
        assert_eq!(config.node_tag, "B");
        assert_eq!(config.sharding.number_of_buckets, 64);
        assert_eq!(config.sharding.hash_seed, 7);
        assert_eq!(config.replication.tag_failure_policy, TagFailurePolicy::Skip);
    }

    #[test]
    fn test_invalid_config() {
        let config = ReshardingConfig::default().with_sharding(ShardingConfig::new(0));
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ReshardingConfig::default()
            .with_subscription(SubscriptionConfig::default().with_batch_size(0));
        assert!(config.validate().is_err());

        let config = ReshardingConfig::new("", 0);
        assert!(config.validate().is_err());
    }
}
