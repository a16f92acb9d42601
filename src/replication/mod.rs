//! Outgoing replication for bucket migrations.
//!
//! - [`item`]: replicated units and document id extraction
//! - [`tagger`]: `MOVE` provenance entries on change vectors
//! - [`sender`]: the filter/tag strategy and the sender loop
//! - [`loader`]: one sender per active outgoing migration

pub mod item;
pub mod loader;
pub mod sender;
pub mod tagger;

pub use item::{
    DocumentIdExtractor, KeyDocumentIdExtractor, ReplicationBatchItem, ReplicationItemKind,
};
pub use loader::{MigrationReplicationLoader, MigrationSinkFactory, ReconcileReport};
pub use sender::{
    BatchOutcome, ItemFilterTagger, MigrationItemFilter, PlainItemFilter, ReplicationBatch,
    ReplicationItemSource, ReplicationSender, ReplicationSink, SkippedReplicationItemsInfo,
};
pub use tagger::{tag_for_migration, ProvenanceTagger};
