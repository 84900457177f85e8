//! # docsync store
//!
//! Revisioned document store used as the local side of replication.
//!
//! This crate provides:
//! - JSON documents with revision IDs and tombstones
//! - Compare-and-swap saves against the revision a document was read at
//! - Change enumeration by sequence number, with change notification
//! - Remote revision application with conflict detection
//! - Conflict branches and their resolution
//! - Per-peer "known revision" bookkeeping
//! - Local (non-replicated) records and blob storage
//!
//! The [`DocumentStore`] trait is what the replicator talks to;
//! [`MemoryStore`] is an in-memory implementation of it.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod blob;
mod document;
mod error;
mod memory;
mod revision;
mod store;

pub use blob::{collect_blobs, Blob, BlobData, BLOB_TYPE};
pub use document::{Document, Properties};
pub use error::{StoreError, StoreResult};
pub use memory::{MemoryStore, StorageFlags, StoreSnapshot};
pub use revision::{RevisionId, MAX_HISTORY};
pub use store::{
    ApplyOutcome, ChangeRecord, ConflictedRevisions, DocumentStore, RemoteRevision,
    ResolvedRevision, StoreId,
};
