//! Replication batch items.

use crate::types::{DocumentFlags, Etag};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Separator between the document id and the item name in compound keys
/// (attachments, counter groups, time-series segments).
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Kind of replicated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicationItemKind {
    Document,
    Tombstone,
    Attachment,
    CounterGroup,
    TimeSeriesSegment,
    DeletedTimeSeriesRange,
}

/// One unit of replicated state read from storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationBatchItem {
    /// What the item is.
    pub kind: ReplicationItemKind,
    /// Document id, or `<document id><RS><name>` for compound items.
    pub key: String,
    /// Storage etag.
    pub etag: Etag,
    /// Change vector in textual form.
    pub change_vector: String,
    /// Document flags.
    pub flags: DocumentFlags,
    /// Payload, absent for tombstones.
    pub data: Option<Bytes>,
}

impl ReplicationBatchItem {
    /// A document item.
    pub fn document(
        id: impl Into<String>,
        etag: Etag,
        change_vector: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            kind: ReplicationItemKind::Document,
            key: id.into(),
            etag,
            change_vector: change_vector.into(),
            flags: DocumentFlags::NONE,
            data: Some(data.into()),
        }
    }

    /// A tombstone item.
    pub fn tombstone(id: impl Into<String>, etag: Etag, change_vector: impl Into<String>) -> Self {
        Self {
            kind: ReplicationItemKind::Tombstone,
            key: id.into(),
            etag,
            change_vector: change_vector.into(),
            flags: DocumentFlags::DELETED,
            data: None,
        }
    }

    /// An item attached to a document, such as an attachment or counter group.
    pub fn attached(
        kind: ReplicationItemKind,
        document_id: &str,
        name: &str,
        etag: Etag,
        change_vector: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            kind,
            key: format!("{}{}{}", document_id, RECORD_SEPARATOR, name),
            etag,
            change_vector: change_vector.into(),
            flags: DocumentFlags::NONE,
            data: Some(data.into()),
        }
    }

    /// Set the flags.
    pub fn with_flags(mut self, flags: DocumentFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Whether the item is a server-generated document.
    pub fn is_artificial(&self) -> bool {
        self.kind == ReplicationItemKind::Document && self.flags.contains(DocumentFlags::ARTIFICIAL)
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.data.as_ref().map(Bytes::len).unwrap_or(0)
    }
}

/// Resolves the document an item belongs to.
pub trait DocumentIdExtractor: Send + Sync + std::fmt::Debug {
    /// Document id used for bucket routing.
    fn document_id<'a>(&self, item: &'a ReplicationBatchItem) -> Cow<'a, str>;
}

/// Extracts the id from the item key, cutting compound keys at the record separator.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyDocumentIdExtractor;

impl DocumentIdExtractor for KeyDocumentIdExtractor {
    fn document_id<'a>(&self, item: &'a ReplicationBatchItem) -> Cow<'a, str> {
        match item.kind {
            ReplicationItemKind::Document | ReplicationItemKind::Tombstone => {
                Cow::Borrowed(item.key.as_str())
            }
            _ => Cow::Borrowed(
                item.key
                    .split(RECORD_SEPARATOR)
                    .next()
                    .unwrap_or(item.key.as_str()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_extraction() {
        let extractor = KeyDocumentIdExtractor;

        let doc = ReplicationBatchItem::document("users/1", 1, "A:1-db", "{}");
        assert_eq!(extractor.document_id(&doc), "users/1");

        let counter = ReplicationBatchItem::attached(
            ReplicationItemKind::CounterGroup,
            "users/1",
            "likes",
            2,
            "A:2-db",
            "",
        );
        assert_eq!(extractor.document_id(&counter), "users/1");

        let tombstone = ReplicationBatchItem::tombstone("users/2", 3, "A:3-db");
        assert_eq!(extractor.document_id(&tombstone), "users/2");
        assert!(tombstone.data.is_none());
    }

    #[test]
    fn test_is_artificial() {
        let doc = ReplicationBatchItem::document("reduce/1", 1, "A:1-db", "{}")
            .with_flags(DocumentFlags::ARTIFICIAL);
        assert!(doc.is_artificial());

        let attachment = ReplicationBatchItem::attached(
            ReplicationItemKind::Attachment,
            "reduce/1",
            "file",
            2,
            "A:2-db",
            "",
        )
        .with_flags(DocumentFlags::ARTIFICIAL);
        assert!(!attachment.is_artificial());
    }
}
