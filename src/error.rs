//! Error types for the resharding subsystem.

use thiserror::Error;

/// Result type alias for resharding operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the resharding subsystem.
#[derive(Error, Debug)]
pub enum Error {
    /// A caller passed a value that violates a construction contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The shard topology is not internally consistent.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Change vector errors.
    #[error("change vector error: {0}")]
    ChangeVector(#[from] ChangeVectorError),

    /// Storage read errors, propagated unchanged from the storage engine.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Subscription-group coordinator errors.
    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Serialization errors.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Outgoing stream could not deliver a batch.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Change vector parse and update errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChangeVectorError {
    /// The textual vector could not be parsed.
    #[error("malformed change vector '{vector}': {reason}")]
    Malformed { vector: String, reason: String },

    /// An entry carries an empty or reserved component.
    #[error("invalid change vector entry: {0}")]
    InvalidEntry(String),
}

/// Storage layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Reading from the storage cursor failed.
    #[error("read failed at etag {etag}: {reason}")]
    ReadFailed { etag: u64, reason: String },

    /// The read transaction was closed underneath the reader.
    #[error("transaction closed")]
    TransactionClosed,

    /// Write failed.
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Subscription-group coordinator errors.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The coordinator could not be reached.
    #[error("coordinator unavailable: {0}")]
    Unavailable(String),

    /// Acknowledgment for a batch the coordinator never recorded.
    #[error("unknown batch: {0}")]
    UnknownBatch(u64),

    /// The batch was recorded by a different shard.
    #[error("batch {batch_id} belongs to shard '{owner}', not '{requester}'")]
    WrongShard {
        batch_id: u64,
        owner: String,
        requester: String,
    },
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
