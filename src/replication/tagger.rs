//! Change-vector provenance tagging.
//!
//! Every item that crosses a migration channel carries a `MOVE:<index>-<dbid>`
//! entry, so the destination can tell which move delivered it and order it
//! against later writes.

use crate::change_vector::ChangeVector;
use crate::error::ChangeVectorError;
use crate::types::MigrationIndex;

/// Insert or bump the migration entry `tag:index-actor_id` in a textual vector.
///
/// Applying the same tag twice with the same index returns the same vector.
pub fn tag_for_migration(
    vector: &str,
    tag: &str,
    actor_id: &str,
    index: MigrationIndex,
) -> Result<String, ChangeVectorError> {
    let parsed = ChangeVector::parse(vector)?;
    let tagged = parsed.with_entry(tag, actor_id, index)?;
    Ok(tagged.to_string())
}

/// Tags vectors for one migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceTagger {
    tag: String,
    actor_id: String,
    index: MigrationIndex,
}

impl ProvenanceTagger {
    /// Create a tagger for a migration.
    pub fn new(tag: impl Into<String>, actor_id: impl Into<String>, index: MigrationIndex) -> Self {
        Self {
            tag: tag.into(),
            actor_id: actor_id.into(),
            index,
        }
    }

    /// Entry this tagger writes, e.g. `MOVE:42-dbid`.
    pub fn entry(&self) -> String {
        format!("{}:{}-{}", self.tag, self.index, self.actor_id)
    }

    /// Tag a vector.
    pub fn tag(&self, vector: &str) -> Result<String, ChangeVectorError> {
        tag_for_migration(vector, &self.tag, &self.actor_id, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::MIGRATION_TAG;

    #[test]
    fn test_tag_appends_entry() {
        let tagged = tag_for_migration("A:5-node1", MIGRATION_TAG, "shardeddb", 42).unwrap();
        assert_eq!(tagged, "A:5-node1, MOVE:42-shardeddb");
    }

    #[test]
    fn test_tag_empty_vector() {
        let tagged = tag_for_migration("", MIGRATION_TAG, "shardeddb", 42).unwrap();
        assert_eq!(tagged, "MOVE:42-shardeddb");
    }

    #[test]
    fn test_tag_is_idempotent() {
        let tagger = ProvenanceTagger::new(MIGRATION_TAG, "shardeddb", 42);
        let once = tagger.tag("A:5-node1, B:3-node2").unwrap();
        let twice = tagger.tag(&once).unwrap();
        assert_eq!(once, twice);
        assert_eq!(tagger.entry(), "MOVE:42-shardeddb");
    }

    #[test]
    fn test_later_migration_bumps_entry() {
        let first = tag_for_migration("A:5-node1", MIGRATION_TAG, "shardeddb", 42).unwrap();
        let second = tag_for_migration(&first, MIGRATION_TAG, "shardeddb", 50).unwrap();
        assert_eq!(second, "A:5-node1, MOVE:50-shardeddb");
    }

    #[test]
    fn test_malformed_vector() {
        let result = tag_for_migration("not a vector", MIGRATION_TAG, "shardeddb", 42);
        assert!(matches!(result, Err(ChangeVectorError::Malformed { .. })));
    }
}
