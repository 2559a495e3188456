//! Error types for the sync engine.

use sensync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for local store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a local row store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The table is not in the configured allow-list.
    #[error("invalid table name: {0}")]
    InvalidTable(String),

    /// The store failed to run a statement.
    #[error("query failed: {0}")]
    Query(String),
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The channel is not open.
    #[error("not connected to server")]
    NotConnected,

    /// The connection did not open within the connect timeout.
    #[error("connection attempt timed out")]
    ConnectTimeout,

    /// The connection closed or failed while a batch was in flight.
    #[error("connection lost")]
    ConnectionLost,

    /// No ack arrived before the per-batch deadline.
    #[error("ack timeout for batch {batch_id}")]
    AckTimeout {
        /// Batch that was not acknowledged.
        batch_id: u64,
    },

    /// The collector answered `success: false`.
    #[error("server rejected batch {batch_id} of {table}: {message}")]
    Rejected {
        /// Table the batch came from.
        table: String,
        /// Rejected batch.
        batch_id: u64,
        /// Server-supplied reason.
        message: String,
    },

    /// Protocol error (invalid message format).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// `start()` was called while a sync was already running.
    #[error("sync already in progress")]
    AlreadyRunning,

    /// A table failed `max_retries` consecutive times.
    #[error("retries exhausted for {table} at offset {offset} after {retries} attempts: {last_error}")]
    ExhaustedRetries {
        /// Offending table.
        table: String,
        /// Last saved offset of the table.
        offset: u64,
        /// Consecutive failures recorded.
        retries: u32,
        /// The failure that exhausted the budget.
        last_error: String,
    },

    /// The channel could not be re-established.
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted {
        /// Reconnect attempts made.
        attempts: u32,
    },

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// A batch id was registered twice.
    #[error("batch {0} already awaiting an ack")]
    DuplicateBatch(u64),

    /// Local store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::NotConnected
            | SyncError::ConnectTimeout
            | SyncError::ConnectionLost
            | SyncError::AckTimeout { .. }
            | SyncError::Rejected { .. }
            | SyncError::Protocol(_) => true,
            _ => false,
        }
    }

    /// Returns true if the failure means the channel is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, SyncError::NotConnected | SyncError::ConnectionLost)
    }
}
