//! Error types for the document store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in document store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store has been closed.
    #[error("database is closed")]
    Closed,

    /// Document not found.
    #[error("document not found: {doc_id} in collection {collection}")]
    NotFound {
        /// The collection searched.
        collection: String,
        /// The document ID that was not found.
        doc_id: String,
    },

    /// The expected revision did not match the stored one.
    #[error("revision conflict on document {doc_id} in collection {collection}")]
    Conflict {
        /// The collection where the conflict occurred.
        collection: String,
        /// The conflicting document.
        doc_id: String,
    },

    /// The operation is not allowed on this object.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A revision ID could not be parsed.
    #[error("invalid revision id: {0}")]
    InvalidRevision(String),

    /// Blob content not present in this store.
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Snapshot or local record (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Creates a not-found error.
    pub fn not_found(collection: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self::NotFound {
            collection: collection.into(),
            doc_id: doc_id.into(),
        }
    }

    /// Creates a revision conflict error.
    pub fn conflict(collection: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self::Conflict {
            collection: collection.into(),
            doc_id: doc_id.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    /// Returns true if this error means the document is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
