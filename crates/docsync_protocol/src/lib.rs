//! # docsync protocol
//!
//! Messages exchanged between the active (replicator) and passive
//! (listener) sides of a replication session.
//!
//! This crate provides:
//! - The [`Message`] set: hello, subscribe, change batches, pushes and
//!   their acknowledgments, keep-alives and errors
//! - Connection and per-revision error codes with their retry class
//! - A CBOR [`Frame`] codec

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod frame;
mod messages;

pub use error::{ProtocolError, ProtocolResult};
pub use frame::{Frame, MAX_FRAME_SIZE};
pub use messages::{
    ErrorCode, Message, PushResult, RevisionError, RevisionErrorCode, PROTOCOL_VERSION,
};
