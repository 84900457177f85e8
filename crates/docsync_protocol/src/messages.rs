//! Replication messages.
//!
//! The active side opens with [`Message::Hello`], then subscribes to the
//! passive side's changes per collection and pushes its own revisions.
//! Every message travels as one [`Frame`](crate::Frame).

use docsync_store::{RemoteRevision, RevisionId};
use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 3;

/// A replication message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Opens a session.
    Hello {
        /// Protocol version spoken by the client.
        version: u16,
        /// Client identity, stable across sessions.
        client_id: String,
        /// Collections the client wants to replicate.
        collections: Vec<String>,
    },
    /// Accepts a session.
    HelloAck {
        /// Protocol version spoken by the server.
        version: u16,
        /// Collections the server will serve.
        collections: Vec<String>,
    },
    /// Requests the peer's changes for one collection.
    Subscribe {
        /// Collection name.
        collection: String,
        /// Sequence to start after.
        since: u64,
        /// Keep streaming new changes after catching up.
        continuous: bool,
        /// Only send these documents.
        doc_ids: Option<Vec<String>>,
        /// Maximum revisions per batch.
        batch_size: u32,
    },
    /// A batch of changes.
    Changes {
        /// Collection name.
        collection: String,
        /// Revisions in sequence order.
        revs: Vec<RemoteRevision>,
        /// Sequence of the last change covered by this batch.
        last_seq: u64,
        /// True if the sender has nothing newer right now.
        caught_up: bool,
    },
    /// Pushes local revisions to the peer.
    PushRevs {
        /// Correlates the acknowledgment.
        request_id: u64,
        /// Collection name.
        collection: String,
        /// Revisions to apply.
        revs: Vec<RemoteRevision>,
    },
    /// Acknowledges a push.
    PushAck {
        /// Request being acknowledged.
        request_id: u64,
        /// One result per pushed revision.
        results: Vec<PushResult>,
    },
    /// Keep-alive probe.
    Ping {
        /// Echoed back in the pong.
        nonce: u64,
    },
    /// Keep-alive reply.
    Pong {
        /// Nonce from the ping.
        nonce: u64,
    },
    /// Connection-level error.
    Error {
        /// Error class.
        code: ErrorCode,
        /// Description.
        message: String,
    },
    /// Orderly close.
    Close,
}

impl Message {
    /// Returns the message name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::HelloAck { .. } => "hello_ack",
            Message::Subscribe { .. } => "subscribe",
            Message::Changes { .. } => "changes",
            Message::PushRevs { .. } => "push_revs",
            Message::PushAck { .. } => "push_ack",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::Error { .. } => "error",
            Message::Close => "close",
        }
    }

    /// Creates an error message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Message::Error {
            code,
            message: message.into(),
        }
    }
}

/// Outcome of one pushed revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResult {
    /// Document ID.
    pub doc_id: String,
    /// Revision that was pushed.
    pub revision: RevisionId,
    /// Set if the peer did not accept the revision.
    pub error: Option<RevisionError>,
}

impl PushResult {
    /// Creates a successful result.
    pub fn accepted(doc_id: impl Into<String>, revision: RevisionId) -> Self {
        Self {
            doc_id: doc_id.into(),
            revision,
            error: None,
        }
    }

    /// Creates a failed result.
    pub fn rejected(
        doc_id: impl Into<String>,
        revision: RevisionId,
        code: RevisionErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            revision,
            error: Some(RevisionError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Why a peer rejected a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionError {
    /// Error class.
    pub code: RevisionErrorCode,
    /// Description.
    pub message: String,
}

/// Per-revision error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevisionErrorCode {
    /// The peer holds a divergent revision.
    Conflict,
    /// The peer refused the write.
    Forbidden,
    /// The peer failed to store the revision.
    Internal,
}

/// Connection-level error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Credentials were rejected.
    Unauthorized,
    /// The client may not access what it asked for.
    Forbidden,
    /// The peer does not accept writes.
    ReadOnly,
    /// A requested collection does not exist on the peer.
    UnknownCollection,
    /// The peer speaks an incompatible protocol version.
    VersionMismatch,
    /// The peer hit an internal error.
    Internal,
    /// The peer is temporarily unavailable.
    Unavailable,
}

impl ErrorCode {
    /// Returns true if retrying cannot help.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, ErrorCode::Internal | ErrorCode::Unavailable)
    }

    /// Converts to a numeric code.
    pub fn to_code(&self) -> u16 {
        match self {
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::ReadOnly => 405,
            ErrorCode::UnknownCollection => 404,
            ErrorCode::VersionMismatch => 426,
            ErrorCode::Internal => 500,
            ErrorCode::Unavailable => 503,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            401 => Some(ErrorCode::Unauthorized),
            403 => Some(ErrorCode::Forbidden),
            405 => Some(ErrorCode::ReadOnly),
            404 => Some(ErrorCode::UnknownCollection),
            426 => Some(ErrorCode::VersionMismatch),
            500 => Some(ErrorCode::Internal),
            503 => Some(ErrorCode::Unavailable),
            _ => None,
        }
    }
}
