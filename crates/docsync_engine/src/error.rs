//! Error types for the replication engine.

use docsync_protocol::{ErrorCode, ProtocolError, RevisionErrorCode};
use docsync_store::StoreError;
use thiserror::Error;

/// Result type for replication operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during replication.
///
/// Errors are `Clone` so one failure can be attached both to the terminal
/// status and to per-document events.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The call is not valid in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The local store has been closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// Local store error.
    #[error("store error: {0}")]
    Store(StoreError),

    /// The peer sent something that could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether a reconnect may succeed.
        retryable: bool,
    },

    /// The peer stopped answering.
    #[error("connection timed out")]
    Timeout,

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Credentials were rejected.
    #[error("authentication rejected: {0}")]
    Unauthorized(String),

    /// The peer's TLS certificate is not trusted.
    #[error("TLS certificate not trusted: {0}")]
    TlsUntrusted(String),

    /// The peer refused access.
    #[error("access forbidden: {0}")]
    Forbidden(String),

    /// The peer does not accept writes.
    #[error("peer is read-only: {0}")]
    ReadOnly(String),

    /// Any other error reported by the peer.
    #[error("peer error {code:?}: {message}")]
    Peer {
        /// Error class.
        code: ErrorCode,
        /// Description.
        message: String,
    },

    /// A conflict resolver or filter failed.
    #[error("unexpected error in callback for document {doc_id}: {message}")]
    UnexpectedError {
        /// Document being processed.
        doc_id: String,
        /// The failure reported by the callback.
        message: String,
    },

    /// A resolved document references a blob saved to another store.
    #[error("document {doc_id} contains a blob that was saved to a different database")]
    ForeignBlob {
        /// Document being resolved.
        doc_id: String,
    },

    /// The document disappeared before its resolution was committed.
    #[error("document {doc_id} not found")]
    DocumentNotFound {
        /// Document being resolved.
        doc_id: String,
    },

    /// The peer rejected a pushed revision.
    #[error("push of document {doc_id} rejected ({code:?}): {message}")]
    PushRejected {
        /// Document that was pushed.
        doc_id: String,
        /// Error class.
        code: RevisionErrorCode,
        /// Description.
        message: String,
    },
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

    /// Maps an error message received from the peer.
    pub fn from_peer(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ErrorCode::Unauthorized => Self::Unauthorized(message),
            ErrorCode::Forbidden => Self::Forbidden(message),
            ErrorCode::ReadOnly => Self::ReadOnly(message),
            code => Self::Peer { code, message },
        }
    }

    /// Returns true if a reconnect may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::ConnectionClosed => true,
            SyncError::Peer { code, .. } => !code.is_permanent(),
            _ => false,
        }
    }

    /// Returns true if this error concerns a single document only.
    pub fn is_document_error(&self) -> bool {
        matches!(
            self,
            SyncError::UnexpectedError { .. }
                | SyncError::ForeignBlob { .. }
                | SyncError::DocumentNotFound { .. }
                | SyncError::PushRejected { .. }
        )
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Closed => SyncError::DatabaseClosed,
            other => SyncError::Store(other),
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}
