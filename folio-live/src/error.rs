use folio_store::StoreError;
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors surfaced to Edit API and admin callers.
#[derive(Debug, Error)]
pub enum EditError {
    /// Malformed input, rejected before any write
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {reason}")]
    AccessDenied { reason: String },

    /// Concurrent writer won twice in a row
    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("storage failure: {0}")]
    Storage(StoreError),
}

impl EditError {
    pub fn denied(reason: impl Into<String>) -> Self {
        EditError::AccessDenied {
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for EditError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(msg) => EditError::Conflict(msg),
            StoreError::Invalid(msg) => EditError::Validation(msg),
            e if e.is_not_found() => EditError::NotFound(e.to_string()),
            e => EditError::Storage(e),
        }
    }
}

/// Notification relay failures. Logged, never surfaced to editors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The broker could not take the event; it is dropped
    #[error("notification delivery failed: {0}")]
    Delivery(String),

    #[error("change feed error: {0}")]
    Feed(#[from] StoreError),

    #[error("signing failed: {0}")]
    Signing(String),
}

/// Broker transport failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connect failed: {0}")]
    Connect(String),

    #[error("broker connection closed")]
    Closed,

    #[error("broker protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
