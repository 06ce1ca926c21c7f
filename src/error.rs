//! Error types for the bridge and the SMS store.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::RefId;

/// Result alias for bridge operations.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Coarse classification carried on the wire so the client can rebuild
/// the right [`BridgeError`] variant from a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Timeout,
    TransportError,
    ActionFailed,
    ValidationError,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// No matching response arrived before the deadline.
    #[error("request {id} timed out after {}ms", after.as_millis())]
    Timeout { id: RefId, after: Duration },

    /// The request could not be delivered, or the channel is gone.
    #[error("transport error: {0}")]
    Transport(String),

    /// The host exhausted its strategy chain.
    #[error("host action failed: {0}")]
    ActionFailed(String),

    /// Malformed request/response shape or payload.
    #[error("validation error: {0}")]
    Validation(String),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Timeout { .. } => ErrorKind::Timeout,
            BridgeError::Transport(_) => ErrorKind::TransportError,
            BridgeError::ActionFailed(_) => ErrorKind::ActionFailed,
            BridgeError::Validation(_) => ErrorKind::ValidationError,
        }
    }

    /// Rebuild an error from a kind and message received over the wire.
    pub fn from_remote(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::ValidationError => BridgeError::Validation(message),
            ErrorKind::TransportError => BridgeError::Transport(message),
            // The host never reports our own deadline; treat it as a failed action.
            ErrorKind::Timeout | ErrorKind::ActionFailed => BridgeError::ActionFailed(message),
        }
    }

    /// Whether retrying the same call could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. } | BridgeError::Transport(_))
    }

    /// Short text suitable for a toast or inline error in the phone UI.
    pub fn user_message(&self) -> String {
        match self {
            BridgeError::Timeout { .. } => "The chat host did not answer in time.".to_string(),
            BridgeError::Transport(_) => "Could not reach the chat host.".to_string(),
            BridgeError::ActionFailed(cause) => format!("The chat host could not do that: {cause}"),
            BridgeError::Validation(cause) => format!("Invalid request: {cause}"),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Validation(e.to_string())
    }
}

/// Errors raised by the durable storage layer and the SMS store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("database: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("transaction: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("encoding snapshot: {0}")]
    Encode(#[from] bincode::Error),

    /// Persisted or imported data failed to deserialize or is inconsistent.
    #[error("invalid data: {0}")]
    Validation(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Validation(e.to_string())
    }
}

/// Failures of a phone session operation, which touches both the bridge
/// and the local store.
#[derive(Debug, Error)]
pub enum PhoneError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
