//! Document sources feeding the subscription processor.

use crate::error::Result;
use crate::types::{Document, DocumentFlags, DocumentRecord, Etag};
use std::collections::VecDeque;
use std::sync::Arc;

/// Where a fetched document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchOrigin {
    /// Read from the shard's storage in etag order.
    Storage,
    /// Taken from the shard's resend set.
    Resend,
    /// Pushed by a live feed that bypasses storage paging.
    Live,
}

impl std::fmt::Display for FetchOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchOrigin::Storage => write!(f, "storage"),
            FetchOrigin::Resend => write!(f, "resend"),
            FetchOrigin::Live => write!(f, "live"),
        }
    }
}

/// A document together with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDocument {
    pub document: Document,
    pub origin: FetchOrigin,
}

impl FetchedDocument {
    /// Wrap a document.
    pub fn new(document: Document, origin: FetchOrigin) -> Self {
        Self { document, origin }
    }
}

/// Parameters of one fetch pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub subscription: String,
    pub shard: String,
    /// Storage documents with an etag above this one are returned.
    pub start_etag: Etag,
    /// Resend set, served before storage.
    pub resend: Vec<DocumentRecord>,
    /// Storage page size.
    pub page_size: usize,
}

/// Cursor over the documents of one batch.
#[async_trait::async_trait]
pub trait SubscriptionFetcher: Send {
    /// Next document, or `None` once the pass is exhausted.
    async fn next(&mut self) -> Result<Option<FetchedDocument>>;
}

/// Opens fetchers for a subscription.
#[async_trait::async_trait]
pub trait SubscriptionSource: Send + Sync + std::fmt::Debug {
    /// Start a fetch pass.
    async fn open_fetcher(&self, request: FetchRequest) -> Result<Box<dyn SubscriptionFetcher>>;

    /// Resolve once a document newer than `etag` may be available.
    async fn wait_for_changes(&self, etag: Etag);
}

/// Read side of the shard's document storage.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync + std::fmt::Debug {
    /// Current version of a document; `None` when deleted or never written.
    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// Up to `limit` documents with etag greater than `etag`, in etag order.
    async fn documents_since(&self, etag: Etag, limit: usize) -> Result<Vec<Document>>;

    /// Resolve once storage holds a document newer than `etag`.
    async fn wait_for_changes(&self, etag: Etag);
}

/// Source that serves the resend set first and then pages through storage.
#[derive(Debug, Clone)]
pub struct StorageSubscriptionSource {
    store: Arc<dyn DocumentStore>,
}

impl StorageSubscriptionSource {
    /// Create a source over a document store.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl SubscriptionSource for StorageSubscriptionSource {
    async fn open_fetcher(&self, request: FetchRequest) -> Result<Box<dyn SubscriptionFetcher>> {
        Ok(Box::new(StorageFetcher {
            store: self.store.clone(),
            resend: request.resend.into(),
            etag: request.start_etag,
            page: VecDeque::new(),
            page_size: request.page_size.max(1),
            exhausted: false,
        }))
    }

    async fn wait_for_changes(&self, etag: Etag) {
        self.store.wait_for_changes(etag).await
    }
}

struct StorageFetcher {
    store: Arc<dyn DocumentStore>,
    resend: VecDeque<DocumentRecord>,
    etag: Etag,
    page: VecDeque<Document>,
    page_size: usize,
    exhausted: bool,
}

#[async_trait::async_trait]
impl SubscriptionFetcher for StorageFetcher {
    async fn next(&mut self) -> Result<Option<FetchedDocument>> {
        if let Some(record) = self.resend.pop_front() {
            // Resend entries carry the vector that was sent; the processor loads the current version.
            let document = Document {
                id: record.document_id,
                etag: 0,
                change_vector: record.change_vector,
                data: None,
                flags: DocumentFlags::NONE,
            };
            return Ok(Some(FetchedDocument::new(document, FetchOrigin::Resend)));
        }

        loop {
            if let Some(document) = self.page.pop_front() {
                return Ok(Some(FetchedDocument::new(document, FetchOrigin::Storage)));
            }
            if self.exhausted {
                return Ok(None);
            }

            let documents = self.store.documents_since(self.etag, self.page_size).await?;
            if documents.len() < self.page_size {
                self.exhausted = true;
            }
            if let Some(last) = documents.last() {
                self.etag = last.etag;
            }
            self.page.extend(documents);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fakes::InMemoryDocumentStore;

    async fn drain(fetcher: &mut Box<dyn SubscriptionFetcher>) -> Vec<(String, FetchOrigin)> {
        let mut out = Vec::new();
        while let Some(fetched) = fetcher.next().await.unwrap() {
            out.push((fetched.document.id, fetched.origin));
        }
        out
    }

    #[tokio::test]
    async fn test_resend_served_before_storage() {
        let store = Arc::new(InMemoryDocumentStore::new("dbid"));
        store.put("users/1", "{}");
        store.put("users/2", "{}");

        let source = StorageSubscriptionSource::new(store);
        let mut fetcher = source
            .open_fetcher(FetchRequest {
                subscription: "feed".into(),
                shard: "db$0".into(),
                start_etag: 0,
                resend: vec![DocumentRecord::new("users/9", "A:1-dbid")],
                page_size: 1,
            })
            .await
            .unwrap();

        let fetched = drain(&mut fetcher).await;
        assert_eq!(
            fetched,
            vec![
                ("users/9".to_string(), FetchOrigin::Resend),
                ("users/1".to_string(), FetchOrigin::Storage),
                ("users/2".to_string(), FetchOrigin::Storage),
            ]
        );
    }

    #[tokio::test]
    async fn test_start_etag_skips_older_documents() {
        let store = Arc::new(InMemoryDocumentStore::new("dbid"));
        let first = store.put("users/1", "{}");
        store.put("users/2", "{}");

        let source = StorageSubscriptionSource::new(store);
        let mut fetcher = source
            .open_fetcher(FetchRequest {
                subscription: "feed".into(),
                shard: "db$0".into(),
                start_etag: first.etag,
                resend: Vec::new(),
                page_size: 16,
            })
            .await
            .unwrap();

        let fetched = drain(&mut fetcher).await;
        assert_eq!(fetched, vec![("users/2".to_string(), FetchOrigin::Storage)]);
    }
}
