//! Change vectors: per-document vector clocks.
//!
//! A change vector is a list of `TAG:ETAG-DBID` entries, one per database that
//! contributed to the document's history. Sharded databases keep *composite*
//! vectors of the form `version|order`: the version part is portable across
//! shards, the order part records local ordering.
//!
//! ```text
//! A:12-Hfk2, B:7-0jUs                      single
//! A:12-Hfk2, MOVE:42-Sh4rd|A:3-Loc4l       composite (version|order)
//! ```

use crate::error::ChangeVectorError;
use std::fmt;
use std::str::FromStr;

/// One `(actor, counter)` pair of a change vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeVectorEntry {
    /// Actor tag (node tag, or a reserved tag such as `MOVE`).
    pub tag: String,
    /// Counter for this actor.
    pub etag: u64,
    /// Identity of the database the counter belongs to.
    pub db_id: String,
}

impl ChangeVectorEntry {
    /// Create a validated entry.
    pub fn new(
        tag: impl Into<String>,
        etag: u64,
        db_id: impl Into<String>,
    ) -> Result<Self, ChangeVectorError> {
        let entry = Self {
            tag: tag.into(),
            etag,
            db_id: db_id.into(),
        };
        entry.validate()?;
        Ok(entry)
    }

    fn validate(&self) -> Result<(), ChangeVectorError> {
        if self.tag.is_empty() || !self.tag.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ChangeVectorError::InvalidEntry(format!(
                "tag '{}' must be non-empty alphanumeric",
                self.tag
            )));
        }
        if self.db_id.is_empty()
            || self
                .db_id
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, ',' | '|' | ':'))
        {
            return Err(ChangeVectorError::InvalidEntry(format!(
                "database id '{}' is empty or contains a separator",
                self.db_id
            )));
        }
        Ok(())
    }

    fn parse(s: &str, whole: &str) -> Result<Self, ChangeVectorError> {
        let malformed = |reason: String| ChangeVectorError::Malformed {
            vector: whole.to_string(),
            reason,
        };

        let (tag, rest) = s
            .split_once(':')
            .ok_or_else(|| malformed(format!("entry '{}' has no ':'", s)))?;
        let (etag, db_id) = rest
            .split_once('-')
            .ok_or_else(|| malformed(format!("entry '{}' has no '-'", s)))?;
        let etag = etag
            .parse::<u64>()
            .map_err(|_| malformed(format!("entry '{}' has a non-numeric etag", s)))?;

        Self::new(tag, etag, db_id).map_err(|e| malformed(e.to_string()))
    }
}

impl fmt::Display for ChangeVectorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.tag, self.etag, self.db_id)
    }
}

/// Result of comparing a remote change vector against a local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStatus {
    /// Remote is strictly newer than local.
    Update,
    /// Each side has changes the other lacks.
    Conflict,
    /// Local already contains everything remote has.
    AlreadyMerged,
}

/// Which part of a composite vector to compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeVectorMode {
    /// The cross-shard portable part.
    Version,
    /// The local ordering part (falls back to version for single vectors).
    Order,
}

/// A document's vector clock.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangeVector {
    version: Vec<ChangeVectorEntry>,
    order: Option<Vec<ChangeVectorEntry>>,
}

impl ChangeVector {
    /// Create an empty vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a single vector from entries.
    pub fn from_entries(entries: Vec<ChangeVectorEntry>) -> Result<Self, ChangeVectorError> {
        check_unique(&entries)?;
        Ok(Self {
            version: entries,
            order: None,
        })
    }

    /// Create a composite `version|order` vector.
    pub fn composite(
        version: Vec<ChangeVectorEntry>,
        order: Vec<ChangeVectorEntry>,
    ) -> Result<Self, ChangeVectorError> {
        check_unique(&version)?;
        check_unique(&order)?;
        Ok(Self {
            version,
            order: Some(order),
        })
    }

    /// Parse a textual vector.
    pub fn parse(s: &str) -> Result<Self, ChangeVectorError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Self::new());
        }

        let mut parts = trimmed.split('|');
        let version = parse_part(parts.next().unwrap_or_default(), s)?;
        let order = match parts.next() {
            Some(part) => Some(parse_part(part, s)?),
            None => None,
        };
        if parts.next().is_some() {
            return Err(ChangeVectorError::Malformed {
                vector: s.to_string(),
                reason: "more than one '|' separator".to_string(),
            });
        }

        Ok(Self { version, order })
    }

    /// Whether the vector has no entries at all.
    pub fn is_empty(&self) -> bool {
        self.version.is_empty() && self.order.as_ref().map_or(true, |o| o.is_empty())
    }

    /// Whether this is a single (non-composite) vector.
    pub fn is_single(&self) -> bool {
        self.order.is_none()
    }

    /// Version part (the whole vector when single).
    pub fn version(&self) -> &[ChangeVectorEntry] {
        &self.version
    }

    /// Order part (the version part when single).
    pub fn order(&self) -> &[ChangeVectorEntry] {
        self.order.as_deref().unwrap_or(&self.version)
    }

    fn part(&self, mode: ChangeVectorMode) -> &[ChangeVectorEntry] {
        match mode {
            ChangeVectorMode::Version => self.version(),
            ChangeVectorMode::Order => self.order(),
        }
    }

    /// Counter recorded for a database in the version part.
    pub fn etag_of(&self, db_id: &str) -> Option<u64> {
        self.version
            .iter()
            .find(|e| e.db_id == db_id)
            .map(|e| e.etag)
    }

    /// Insert or bump an entry in every part.
    ///
    /// An existing entry for `db_id` keeps the larger counter, so applying the
    /// same update twice is a no-op.
    pub fn update(&mut self, tag: &str, db_id: &str, etag: u64) -> Result<(), ChangeVectorError> {
        let entry = ChangeVectorEntry::new(tag, etag, db_id)?;
        update_part(&mut self.version, &entry);
        if let Some(order) = self.order.as_mut() {
            update_part(order, &entry);
        }
        Ok(())
    }

    /// Copy of this vector with an entry inserted or bumped.
    pub fn with_entry(&self, tag: &str, db_id: &str, etag: u64) -> Result<Self, ChangeVectorError> {
        let mut updated = self.clone();
        updated.update(tag, db_id, etag)?;
        Ok(updated)
    }

    /// Copy of this vector without any entry of `db_id`.
    pub fn remove_id(&self, db_id: &str) -> Self {
        let strip = |part: &[ChangeVectorEntry]| {
            part.iter()
                .filter(|e| e.db_id != db_id)
                .cloned()
                .collect::<Vec<_>>()
        };
        Self {
            version: strip(&self.version),
            order: self.order.as_deref().map(strip),
        }
    }

    /// Entry-wise maximum of two vectors.
    pub fn merge(&self, other: &ChangeVector) -> Self {
        let order = match (&self.order, &other.order) {
            (Some(a), Some(b)) => Some(merge_parts(a, b)),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };
        Self {
            version: merge_parts(&self.version, &other.version),
            order,
        }
    }

    /// Compare `remote` against `local`.
    pub fn conflict_status(
        remote: &ChangeVector,
        local: &ChangeVector,
        mode: ChangeVectorMode,
    ) -> ConflictStatus {
        let remote = remote.part(mode);
        let local = local.part(mode);

        let counter = |part: &[ChangeVectorEntry], db_id: &str| {
            part.iter()
                .find(|e| e.db_id == db_id)
                .map(|e| e.etag)
                .unwrap_or(0)
        };

        let remote_has_larger = remote.iter().any(|r| r.etag > counter(local, &r.db_id));
        let local_has_larger = local.iter().any(|l| l.etag > counter(remote, &l.db_id));

        match (remote_has_larger, local_has_larger) {
            (true, true) => ConflictStatus::Conflict,
            (true, false) => ConflictStatus::Update,
            _ => ConflictStatus::AlreadyMerged,
        }
    }

    /// Compare two textual vectors. Unparseable vectors compare as empty.
    pub fn conflict_status_str(remote: &str, local: &str, mode: ChangeVectorMode) -> ConflictStatus {
        let remote = ChangeVector::parse(remote).unwrap_or_default();
        let local = ChangeVector::parse(local).unwrap_or_default();
        Self::conflict_status(&remote, &local, mode)
    }
}

fn check_unique(entries: &[ChangeVectorEntry]) -> Result<(), ChangeVectorError> {
    for (i, entry) in entries.iter().enumerate() {
        entry.validate()?;
        if entries[..i].iter().any(|e| e.db_id == entry.db_id) {
            return Err(ChangeVectorError::InvalidEntry(format!(
                "duplicate database id '{}'",
                entry.db_id
            )));
        }
    }
    Ok(())
}

fn parse_part(part: &str, whole: &str) -> Result<Vec<ChangeVectorEntry>, ChangeVectorError> {
    let part = part.trim();
    if part.is_empty() {
        return Err(ChangeVectorError::Malformed {
            vector: whole.to_string(),
            reason: "empty vector part".to_string(),
        });
    }

    let mut entries: Vec<ChangeVectorEntry> = Vec::new();
    for raw in part.split(',') {
        let entry = ChangeVectorEntry::parse(raw.trim(), whole)?;
        if entries.iter().any(|e| e.db_id == entry.db_id) {
            return Err(ChangeVectorError::Malformed {
                vector: whole.to_string(),
                reason: format!("duplicate database id '{}'", entry.db_id),
            });
        }
        entries.push(entry);
    }
    Ok(entries)
}

fn update_part(part: &mut Vec<ChangeVectorEntry>, entry: &ChangeVectorEntry) {
    match part.iter_mut().find(|e| e.db_id == entry.db_id) {
        Some(existing) => {
            existing.tag = entry.tag.clone();
            existing.etag = existing.etag.max(entry.etag);
        }
        None => part.push(entry.clone()),
    }
}

fn merge_parts(a: &[ChangeVectorEntry], b: &[ChangeVectorEntry]) -> Vec<ChangeVectorEntry> {
    let mut merged = a.to_vec();
    for entry in b {
        match merged.iter_mut().find(|e| e.db_id == entry.db_id) {
            Some(existing) if entry.etag > existing.etag => {
                existing.etag = entry.etag;
                existing.tag = entry.tag.clone();
            }
            Some(_) => {}
            None => merged.push(entry.clone()),
        }
    }
    merged
}

fn write_part(f: &mut fmt::Formatter<'_>, part: &[ChangeVectorEntry]) -> fmt::Result {
    for (i, entry) in part.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", entry)?;
    }
    Ok(())
}

impl fmt::Display for ChangeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_part(f, &self.version)?;
        if let Some(order) = &self.order {
            f.write_str("|")?;
            write_part(f, order)?;
        }
        Ok(())
    }
}

impl FromStr for ChangeVector {
    type Err = ChangeVectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cv(s: &str) -> ChangeVector {
        ChangeVector::parse(s).unwrap()
    }

    #[test]
    fn test_parse_and_format() {
        let vector = cv("A:12-db1, B:7-db2");
        assert!(vector.is_single());
        assert_eq!(vector.version().len(), 2);
        assert_eq!(vector.etag_of("db2"), Some(7));
        assert_eq!(vector.to_string(), "A:12-db1, B:7-db2");

        let composite = cv("A:12-db1|C:3-db3");
        assert!(!composite.is_single());
        assert_eq!(composite.order()[0].db_id, "db3");
        assert_eq!(composite.to_string(), "A:12-db1|C:3-db3");
    }

    #[test]
    fn test_parse_db_id_with_dash() {
        let vector = cv("A:1-abc-def");
        assert_eq!(vector.version()[0].db_id, "abc-def");
    }

    #[test]
    fn test_parse_empty() {
        let vector = cv("");
        assert!(vector.is_empty());
        assert!(vector.is_single());
        assert_eq!(vector.to_string(), "");
    }

    #[test]
    fn test_parse_malformed() {
        assert!(ChangeVector::parse("A12-db1").is_err());
        assert!(ChangeVector::parse("A:x-db1").is_err());
        assert!(ChangeVector::parse("A:1").is_err());
        assert!(ChangeVector::parse("A:1-db1, B:2-db1").is_err());
        assert!(ChangeVector::parse("A:1-db1|B:2-db2|C:3-db3").is_err());
        assert!(ChangeVector::parse("A:1-db1,,B:2-db2").is_err());
        assert!(ChangeVector::parse(":1-db1").is_err());
    }

    #[test]
    fn test_update_is_idempotent() {
        let base = cv("A:5-db1");
        let once = base.with_entry("MOVE", "shardeddb", 42).unwrap();
        let twice = once.with_entry("MOVE", "shardeddb", 42).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.to_string(), "A:5-db1, MOVE:42-shardeddb");
    }

    #[test]
    fn test_update_bumps_existing() {
        let vector = cv("A:5-db1, MOVE:10-shardeddb")
            .with_entry("MOVE", "shardeddb", 42)
            .unwrap();
        assert_eq!(vector.etag_of("shardeddb"), Some(42));
        assert_eq!(vector.version().len(), 2);

        // Older index never lowers the counter
        let vector = vector.with_entry("MOVE", "shardeddb", 7).unwrap();
        assert_eq!(vector.etag_of("shardeddb"), Some(42));
    }

    #[test]
    fn test_update_composite_touches_both_parts() {
        let vector = cv("A:5-db1|B:2-db2")
            .with_entry("MOVE", "shardeddb", 3)
            .unwrap();
        assert_eq!(vector.to_string(), "A:5-db1, MOVE:3-shardeddb|B:2-db2, MOVE:3-shardeddb");
    }

    #[test]
    fn test_update_rejects_invalid_entry() {
        let mut vector = cv("A:5-db1");
        assert!(vector.update("", "db", 1).is_err());
        assert!(vector.update("MOVE", "", 1).is_err());
        assert!(vector.update("MOVE", "a,b", 1).is_err());
        assert_eq!(vector, cv("A:5-db1"));
    }

    #[test]
    fn test_remove_id() {
        let vector = cv("A:5-db1, MOVE:3-shardeddb");
        assert_eq!(vector.remove_id("shardeddb").to_string(), "A:5-db1");

        let composite = cv("A:5-db1, MOVE:3-shardeddb|MOVE:3-shardeddb, B:1-db2");
        assert_eq!(composite.remove_id("shardeddb").to_string(), "A:5-db1|B:1-db2");
    }

    #[test]
    fn test_merge() {
        let merged = cv("A:5-db1, B:2-db2").merge(&cv("A:3-db1, C:9-db3"));
        assert_eq!(merged.to_string(), "A:5-db1, B:2-db2, C:9-db3");
    }

    #[test]
    fn test_conflict_status() {
        use ChangeVectorMode::Version;

        assert_eq!(
            ChangeVector::conflict_status(&cv("A:6-db1"), &cv("A:5-db1"), Version),
            ConflictStatus::Update
        );
        assert_eq!(
            ChangeVector::conflict_status(&cv("A:5-db1"), &cv("A:5-db1"), Version),
            ConflictStatus::AlreadyMerged
        );
        assert_eq!(
            ChangeVector::conflict_status(&cv("A:4-db1"), &cv("A:5-db1"), Version),
            ConflictStatus::AlreadyMerged
        );
        assert_eq!(
            ChangeVector::conflict_status(&cv("A:6-db1"), &cv("A:5-db1, B:1-db2"), Version),
            ConflictStatus::Conflict
        );
        assert_eq!(
            ChangeVector::conflict_status(&cv("A:1-db1"), &ChangeVector::new(), Version),
            ConflictStatus::Update
        );
    }

    #[test]
    fn test_conflict_status_order_mode() {
        let remote = cv("A:5-db1|B:9-db2");
        let local = cv("A:5-db1|B:3-db2");
        assert_eq!(
            ChangeVector::conflict_status(&remote, &local, ChangeVectorMode::Version),
            ConflictStatus::AlreadyMerged
        );
        assert_eq!(
            ChangeVector::conflict_status(&remote, &local, ChangeVectorMode::Order),
            ConflictStatus::Update
        );
    }
}
