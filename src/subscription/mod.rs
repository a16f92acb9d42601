//! Migration-aware subscription delivery.
//!
//! ```text
//!  SubscriptionSource ──► SubscriptionProcessor ──► SubscriptionConnection ──► client
//!   (resend, storage)      │  SendDecider            │  one batch in flight
//!                          │  (ownership checks)     │  ack with timeout
//!                          ▼                         ▼
//!                   SubscriptionGroupCoordinator (record / acknowledge)
//! ```

pub mod connection;
pub mod coordinator;
pub mod decider;
pub mod fetcher;
pub mod processor;
pub mod state;

pub use connection::{BatchStep, ClientAck, SubscriptionBatch, SubscriptionConnection, SubscriptionSink};
pub use coordinator::{
    AcknowledgeBatchRequest, InMemorySubscriptionGroup, RecordBatchRequest, RecordBatchResponse,
    ReleaseBatchRequest, SubscriptionGroupCoordinator,
};
pub use decider::{
    DecisionContext, DefaultResendDecider, DefaultSendDecider, IdPrefixCriteria,
    MigrationAwareResendDecider, MigrationAwareSendDecider, ResendDecider, ResendDecision,
    SendDecider, SendDecision, SubscriptionCriteria,
};
pub use fetcher::{
    DocumentStore, FetchOrigin, FetchRequest, FetchedDocument, StorageSubscriptionSource,
    SubscriptionFetcher, SubscriptionSource,
};
pub use processor::{SubscriptionBatchItem, SubscriptionProcessor};
pub use state::{merge_vectors, SubscriptionDeliveryState};
