//! Shard topology snapshots.
//!
//! A [`ShardTopology`] is immutable once built. The consensus layer publishes a
//! new snapshot through [`TopologyHandle::swap`]; readers take one
//! [`TopologyHandle::snapshot`] per batch and never observe it change.

use super::router::BucketRouter;
use crate::config::ShardingConfig;
use crate::error::{Error, Result};
use crate::types::{Bucket, MigrationIndex, ShardNumber};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// First bucket of a contiguous range and the shard that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardBucketRange {
    /// First bucket in the range.
    pub range_start: Bucket,
    /// Owning shard.
    pub shard: ShardNumber,
}

impl ShardBucketRange {
    /// Create a range.
    pub fn new(range_start: Bucket, shard: ShardNumber) -> Self {
        Self { range_start, shard }
    }
}

/// Progress of a bucket migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationStatus {
    /// Source is streaming the bucket to the destination.
    Moving,
    /// Source finished sending; waiting for destinations to confirm.
    Moved,
    /// Destination owns the bucket; source may clean up.
    OwnershipTransferred,
}

impl MigrationStatus {
    /// Whether ownership of the bucket is still in flux.
    pub fn is_active(&self) -> bool {
        matches!(self, MigrationStatus::Moving | MigrationStatus::Moved)
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::Moving => write!(f, "Moving"),
            MigrationStatus::Moved => write!(f, "Moved"),
            MigrationStatus::OwnershipTransferred => write!(f, "OwnershipTransferred"),
        }
    }
}

/// A bucket migration as recorded in the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardBucketMigration {
    /// Bucket being moved.
    pub bucket: Bucket,
    /// Shard the bucket is moving from.
    pub source_shard: ShardNumber,
    /// Shard the bucket is moving to.
    pub destination_shard: ShardNumber,
    /// Raft index of the command that started the migration.
    pub migration_index: MigrationIndex,
    /// Current status.
    pub status: MigrationStatus,
    /// Merged change vector of the bucket at the source when sending finished.
    pub last_source_change_vector: Option<String>,
    /// Destination nodes that confirmed they caught up.
    pub confirmed_destinations: HashSet<String>,
    /// Source nodes that finished deleting the bucket.
    pub confirmed_source_cleanup: HashSet<String>,
}

impl ShardBucketMigration {
    /// Create a migration in the `Moving` state.
    pub fn new(
        bucket: Bucket,
        source_shard: ShardNumber,
        destination_shard: ShardNumber,
        migration_index: MigrationIndex,
    ) -> Self {
        Self {
            bucket,
            source_shard,
            destination_shard,
            migration_index,
            status: MigrationStatus::Moving,
            last_source_change_vector: None,
            confirmed_destinations: HashSet::new(),
            confirmed_source_cleanup: HashSet::new(),
        }
    }

    /// Set the status.
    pub fn with_status(mut self, status: MigrationStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the source's final change vector for the bucket.
    pub fn with_last_source_change_vector(mut self, vector: impl Into<String>) -> Self {
        self.last_source_change_vector = Some(vector.into());
        self
    }

    /// Record a destination confirmation.
    pub fn with_confirmed_destination(mut self, node: impl Into<String>) -> Self {
        self.confirmed_destinations.insert(node.into());
        self
    }

    /// Record a completed source cleanup.
    pub fn with_confirmed_source_cleanup(mut self, node: impl Into<String>) -> Self {
        self.confirmed_source_cleanup.insert(node.into());
        self
    }

    /// Whether ownership is still in flux.
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Immutable view of bucket ownership and in-flight migrations.
#[derive(Debug, Clone)]
pub struct ShardTopology {
    database_name: String,
    database_id: String,
    router: BucketRouter,
    ranges: Vec<ShardBucketRange>,
    shards: BTreeMap<ShardNumber, Vec<String>>,
    migrations: HashMap<Bucket, ShardBucketMigration>,
}

impl ShardTopology {
    /// Build a topology from bucket ranges.
    ///
    /// Ranges must be non-empty, start at bucket 0, be strictly ascending and
    /// lie inside the keyspace.
    pub fn new(
        database_name: impl Into<String>,
        database_id: impl Into<String>,
        sharding: &ShardingConfig,
        ranges: Vec<ShardBucketRange>,
    ) -> Result<Self> {
        sharding.validate()?;
        let router = BucketRouter::from_config(sharding);
        validate_ranges(&ranges, router.number_of_buckets())?;

        let database_id = database_id.into();
        if database_id.is_empty() {
            return Err(Error::InvalidTopology("database id must not be empty".into()));
        }

        let shards = ranges
            .iter()
            .map(|r| (r.shard, Vec::new()))
            .collect::<BTreeMap<_, _>>();

        Ok(Self {
            database_name: database_name.into(),
            database_id,
            router,
            ranges,
            shards,
            migrations: HashMap::new(),
        })
    }

    /// Set the member nodes of a shard.
    pub fn with_shard_members<I, S>(mut self, shard: ShardNumber, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shards
            .insert(shard, members.into_iter().map(Into::into).collect());
        self
    }

    /// Insert or replace the migration entry of a bucket.
    pub fn with_migration(mut self, migration: ShardBucketMigration) -> Result<Self> {
        if migration.bucket >= self.router.number_of_buckets() {
            return Err(Error::InvalidTopology(format!(
                "migration bucket {} outside keyspace of {} buckets",
                migration.bucket,
                self.router.number_of_buckets()
            )));
        }
        if migration.source_shard == migration.destination_shard {
            return Err(Error::InvalidTopology(format!(
                "bucket {} migrates to its own shard {}",
                migration.bucket, migration.source_shard
            )));
        }
        self.migrations.insert(migration.bucket, migration);
        Ok(self)
    }

    /// Remove the migration entry of a bucket.
    pub fn without_migration(mut self, bucket: Bucket) -> Self {
        self.migrations.remove(&bucket);
        self
    }

    /// Assign a single bucket to a shard, splitting and coalescing ranges.
    pub fn with_bucket_owner(mut self, bucket: Bucket, shard: ShardNumber) -> Result<Self> {
        let buckets = self.router.number_of_buckets();
        if bucket >= buckets {
            return Err(Error::InvalidTopology(format!(
                "bucket {} outside keyspace of {} buckets",
                bucket, buckets
            )));
        }

        let next = bucket + 1;
        let next_owner = (next < buckets).then(|| self.shard_for_bucket(next));

        self.ranges
            .retain(|r| r.range_start != bucket && r.range_start != next);
        self.ranges.push(ShardBucketRange::new(bucket, shard));
        if let Some(owner) = next_owner {
            self.ranges.push(ShardBucketRange::new(next, owner));
        }
        self.ranges.sort_by_key(|r| r.range_start);
        self.ranges.dedup_by(|later, earlier| later.shard == earlier.shard);
        self.shards.entry(shard).or_default();

        validate_ranges(&self.ranges, buckets)?;
        Ok(self)
    }

    /// Sharded database name.
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Identity shared by every shard of the database.
    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    /// Router for this topology's keyspace.
    pub fn router(&self) -> &BucketRouter {
        &self.router
    }

    /// Number of buckets in the keyspace.
    pub fn number_of_buckets(&self) -> u32 {
        self.router.number_of_buckets()
    }

    /// Bucket ranges in ascending order.
    pub fn ranges(&self) -> &[ShardBucketRange] {
        &self.ranges
    }

    /// Shard numbers known to the topology.
    pub fn shard_numbers(&self) -> impl Iterator<Item = ShardNumber> + '_ {
        self.shards.keys().copied()
    }

    /// Member nodes of a shard.
    pub fn shard_members(&self, shard: ShardNumber) -> &[String] {
        self.shards.get(&shard).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Owner of a bucket.
    pub fn shard_for_bucket(&self, bucket: Bucket) -> ShardNumber {
        // The first range starts at 0, so the index is always >= 1.
        let idx = self.ranges.partition_point(|r| r.range_start <= bucket);
        self.ranges[idx.saturating_sub(1)].shard
    }

    /// Migration entry of a bucket, whatever its status.
    pub fn migration_for(&self, bucket: Bucket) -> Option<&ShardBucketMigration> {
        self.migrations.get(&bucket)
    }

    /// Migration entry of a bucket while ownership is in flux.
    pub fn active_migration(&self, bucket: Bucket) -> Option<&ShardBucketMigration> {
        self.migrations.get(&bucket).filter(|m| m.is_active())
    }

    /// Whether the bucket is currently being moved.
    pub fn has_active_migration(&self, bucket: Bucket) -> bool {
        self.active_migration(bucket).is_some()
    }

    /// All migration entries.
    pub fn migrations(&self) -> impl Iterator<Item = &ShardBucketMigration> {
        self.migrations.values()
    }
}

fn validate_ranges(ranges: &[ShardBucketRange], number_of_buckets: u32) -> Result<()> {
    let first = ranges
        .first()
        .ok_or_else(|| Error::InvalidTopology("no bucket ranges".into()))?;
    if first.range_start != 0 {
        return Err(Error::InvalidTopology(format!(
            "first range starts at {} instead of 0",
            first.range_start
        )));
    }
    for pair in ranges.windows(2) {
        if pair[1].range_start <= pair[0].range_start {
            return Err(Error::InvalidTopology(format!(
                "range starts are not ascending: {} then {}",
                pair[0].range_start, pair[1].range_start
            )));
        }
    }
    if let Some(last) = ranges.last() {
        if last.range_start >= number_of_buckets {
            return Err(Error::InvalidTopology(format!(
                "range start {} outside keyspace of {} buckets",
                last.range_start, number_of_buckets
            )));
        }
    }
    Ok(())
}

/// Atomically swappable topology snapshot.
#[derive(Debug)]
pub struct TopologyHandle {
    current: RwLock<Arc<ShardTopology>>,
    version: AtomicU64,
    changed: Notify,
}

impl TopologyHandle {
    /// Create a handle holding an initial topology.
    pub fn new(topology: ShardTopology) -> Self {
        Self {
            current: RwLock::new(Arc::new(topology)),
            version: AtomicU64::new(0),
            changed: Notify::new(),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<ShardTopology> {
        self.current.read().clone()
    }

    /// Publish a new topology, returning the previous one.
    pub fn swap(&self, topology: ShardTopology) -> Arc<ShardTopology> {
        let previous = {
            let mut current = self.current.write();
            std::mem::replace(&mut *current, Arc::new(topology))
        };
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.changed.notify_waiters();
        tracing::debug!(version, "Published new shard topology");
        previous
    }

    /// Number of swaps so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Wait until the version differs from `seen`, returning the new version.
    pub async fn changed(&self, seen: u64) -> u64 {
        loop {
            let notified = self.changed.notified();
            let version = self.version();
            if version != seen {
                return version;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn two_shards() -> ShardTopology {
        ShardTopology::new(
            "orders",
            "dbid",
            &ShardingConfig::new(16),
            vec![ShardBucketRange::new(0, 0), ShardBucketRange::new(8, 1)],
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_ranges() {
        let cfg = ShardingConfig::new(16);
        assert!(ShardTopology::new("db", "id", &cfg, vec![]).is_err());
        assert!(ShardTopology::new("db", "id", &cfg, vec![ShardBucketRange::new(1, 0)]).is_err());
        assert!(ShardTopology::new(
            "db",
            "id",
            &cfg,
            vec![ShardBucketRange::new(0, 0), ShardBucketRange::new(0, 1)]
        )
        .is_err());
        assert!(ShardTopology::new(
            "db",
            "id",
            &cfg,
            vec![ShardBucketRange::new(0, 0), ShardBucketRange::new(16, 1)]
        )
        .is_err());
        assert!(ShardTopology::new("db", "", &cfg, vec![ShardBucketRange::new(0, 0)]).is_err());
    }

    #[test]
    fn test_active_migration() {
        let topology = two_shards()
            .with_migration(ShardBucketMigration::new(5, 0, 1, 42))
            .unwrap()
            .with_migration(
                ShardBucketMigration::new(6, 0, 1, 43)
                    .with_status(MigrationStatus::OwnershipTransferred),
            )
            .unwrap();

        assert!(topology.has_active_migration(5));
        assert!(!topology.has_active_migration(6));
        assert!(topology.migration_for(6).is_some());
        assert!(!topology.has_active_migration(7));
    }

    #[test]
    fn test_invalid_migration() {
        assert!(two_shards()
            .with_migration(ShardBucketMigration::new(16, 0, 1, 1))
            .is_err());
        assert!(two_shards()
            .with_migration(ShardBucketMigration::new(3, 0, 0, 1))
            .is_err());
    }

    #[test]
    fn test_with_bucket_owner() {
        let topology = two_shards().with_bucket_owner(5, 1).unwrap();
        assert_eq!(topology.shard_for_bucket(4), 0);
        assert_eq!(topology.shard_for_bucket(5), 1);
        assert_eq!(topology.shard_for_bucket(6), 0);
        assert_eq!(topology.shard_for_bucket(8), 1);
        assert_eq!(topology.ranges().len(), 4);

        // Giving it back coalesces the ranges again
        let topology = topology.with_bucket_owner(5, 0).unwrap();
        assert_eq!(topology.ranges(), two_shards().ranges());

        let topology = two_shards().with_bucket_owner(7, 1).unwrap();
        assert_eq!(
            topology.ranges(),
            &[ShardBucketRange::new(0, 0), ShardBucketRange::new(7, 1)]
        );
    }

    #[test]
    fn test_shard_members() {
        let topology = two_shards().with_shard_members(1, ["B", "C"]);
        assert_eq!(topology.shard_members(1), &["B".to_string(), "C".to_string()]);
        assert!(topology.shard_members(0).is_empty());
        assert_eq!(topology.shard_numbers().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_handle_swap_and_changed() {
        let handle = Arc::new(TopologyHandle::new(two_shards()));
        let before = handle.snapshot();
        assert_eq!(handle.version(), 0);

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.changed(0).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        handle.swap(two_shards().with_bucket_owner(3, 1).unwrap());
        let version = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(version, 1);

        // Old snapshot is unchanged
        assert_eq!(before.shard_for_bucket(3), 0);
        assert_eq!(handle.snapshot().shard_for_bucket(3), 1);
    }
}
