//! Core types used throughout the resharding subsystem.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Shard number within a sharded database.
pub type ShardNumber = u32;

/// Hash bucket of the document keyspace.
pub type Bucket = u32;

/// Storage etag; monotonically increasing per shard.
pub type Etag = u64;

/// Raft index of the command that started a migration.
pub type MigrationIndex = u64;

bitflags::bitflags! {
    /// Flags stored alongside a document.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DocumentFlags: u32 {
        /// No flags.
        const NONE = 0;
        /// Document was generated by the server (e.g. map-reduce output) and is local only.
        const ARTIFICIAL = 1;
        /// Document has attachments.
        const HAS_ATTACHMENTS = 1 << 1;
        /// Document has counters.
        const HAS_COUNTERS = 1 << 2;
        /// Document has time series.
        const HAS_TIME_SERIES = 1 << 3;
        /// Document has revisions.
        const HAS_REVISIONS = 1 << 4;
        /// Document arrived through a bucket migration.
        const FROM_RESHARDING = 1 << 5;
        /// Entry is a tombstone.
        const DELETED = 1 << 6;
    }
}

impl Serialize for DocumentFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DocumentFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        Self::from_bits(bits).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid DocumentFlags bits: {bits:#x}"))
        })
    }
}

/// A document as seen by the subscription pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Document identifier.
    pub id: String,
    /// Storage etag of this version; zero when the document came from the resend list.
    pub etag: Etag,
    /// Change vector in textual form. Empty when cleared.
    pub change_vector: String,
    /// Payload; `None` when suppressed or filtered.
    pub data: Option<Bytes>,
    /// Document flags.
    pub flags: DocumentFlags,
}

impl Document {
    /// Create a new document.
    pub fn new(
        id: impl Into<String>,
        etag: Etag,
        change_vector: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: id.into(),
            etag,
            change_vector: change_vector.into(),
            data: Some(data.into()),
            flags: DocumentFlags::NONE,
        }
    }

    /// Set the flags.
    pub fn with_flags(mut self, flags: DocumentFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.data.as_ref().map(|d| d.len()).unwrap_or(0)
    }

    /// Drop payload and change vector so a consumer never sees pre-migration content.
    pub fn clear_content(&mut self) {
        self.data = None;
        self.change_vector.clear();
    }
}

/// Id and change vector of a document that was sent in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Document identifier.
    pub document_id: String,
    /// Change vector at the time it was sent.
    pub change_vector: String,
}

impl DocumentRecord {
    /// Create a new record.
    pub fn new(document_id: impl Into<String>, change_vector: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            change_vector: change_vector.into(),
        }
    }
}

/// Name of a shard database, e.g. `orders$1`.
pub fn shard_name(database: &str, shard: ShardNumber) -> String {
    format!("{}${}", database, shard)
}
