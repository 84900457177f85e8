//! The document store interface used by the replicator.

use crate::blob::{Blob, BlobData};
use crate::document::{Document, Properties};
use crate::error::StoreResult;
use crate::revision::RevisionId;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Unique identifier of a store instance.
pub type StoreId = uuid::Uuid;

/// The newest change to one document, as seen by change enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Sequence number of the change.
    pub sequence: u64,
    /// Document ID.
    pub doc_id: String,
    /// Current revision.
    pub revision: RevisionId,
    /// Whether the current revision is a tombstone.
    pub deleted: bool,
    /// Whether the document has an unresolved conflict.
    pub conflicted: bool,
}

/// A revision received from a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRevision {
    /// Document ID.
    pub doc_id: String,
    /// Revision ID.
    pub revision: RevisionId,
    /// Ancestors, newest first, not including `revision`.
    pub history: Vec<RevisionId>,
    /// Whether this revision is a tombstone.
    pub deleted: bool,
    /// Whether the peer revoked this client's access to the document.
    #[serde(default)]
    pub access_removed: bool,
    /// Body.
    pub properties: Properties,
    /// Content of the blobs the body references.
    #[serde(default)]
    pub attachments: Vec<BlobData>,
}

impl RemoteRevision {
    /// Returns true if `rev` is this revision or one of its ancestors.
    pub fn descends_from(&self, rev: &RevisionId) -> bool {
        &self.revision == rev || self.history.contains(rev)
    }

    /// Builds a document carrying this revision's ID and body.
    pub fn to_document(&self) -> Document {
        Document::stored(
            &self.doc_id,
            self.revision.clone(),
            self.properties.clone(),
            self.deleted,
            None,
        )
    }
}

/// What happened when a remote revision was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The document did not exist locally.
    Inserted,
    /// The remote revision descends from the local one and replaced it.
    FastForwarded,
    /// The local store already has this revision or a descendant of it.
    AlreadyKnown,
    /// The histories diverged; the remote revision was kept as a conflict.
    Conflicted,
}

impl ApplyOutcome {
    /// Returns true if the local current revision changed.
    pub fn changed_local(&self) -> bool {
        matches!(self, ApplyOutcome::Inserted | ApplyOutcome::FastForwarded)
    }
}

/// Both sides of an unresolved conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictedRevisions {
    /// The local current revision. May be a tombstone.
    pub local: Document,
    /// The conflicting remote revision. May be a tombstone.
    pub remote: Document,
}

/// Outcome of conflict resolution to commit.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedRevision {
    /// Keep the local body.
    KeepLocal,
    /// Adopt the remote revision as-is.
    TakeRemote,
    /// Store new content.
    Merged(Properties),
    /// Store a tombstone.
    Deleted,
}

/// A revisioned document store.
///
/// Every method fails with [`StoreError::Closed`](crate::StoreError::Closed)
/// once the store has been closed.
pub trait DocumentStore: Send + Sync {
    /// Unique ID of this store.
    fn id(&self) -> StoreId;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// Returns true until [`DocumentStore::close`] is called.
    fn is_open(&self) -> bool;

    /// Closes the store.
    fn close(&self);

    /// Gets a live document. Tombstones read as `None`.
    fn get(&self, collection: &str, doc_id: &str) -> StoreResult<Option<Document>>;

    /// Gets a document, including tombstones.
    fn get_including_deleted(&self, collection: &str, doc_id: &str)
        -> StoreResult<Option<Document>>;

    /// Saves a document, checking that its revision is still current.
    ///
    /// Returns the saved document at its new revision.
    fn save(&self, collection: &str, doc: &Document) -> StoreResult<Document>;

    /// Writes a tombstone over the current revision.
    fn delete(&self, collection: &str, doc_id: &str) -> StoreResult<RevisionId>;

    /// Removes a document and all of its metadata. Purges do not replicate.
    fn purge(&self, collection: &str, doc_id: &str) -> StoreResult<()>;

    /// Latest sequence number in the store.
    fn last_sequence(&self) -> StoreResult<u64>;

    /// Newest change per document with sequence greater than `since`, in
    /// ascending sequence order.
    fn changes_since(
        &self,
        collection: &str,
        since: u64,
        limit: usize,
    ) -> StoreResult<Vec<ChangeRecord>>;

    /// Subscribes to the last sequence; notified on every local write.
    fn subscribe(&self) -> watch::Receiver<u64>;

    /// Exports the current revision of a document for transfer to a peer.
    fn export_revision(&self, collection: &str, doc_id: &str)
        -> StoreResult<Option<RemoteRevision>>;

    /// Applies a revision received from a peer.
    ///
    /// Divergent histories are kept as a conflict when `allow_conflict` is
    /// true and rejected with `StoreError::Conflict` otherwise.
    fn apply_remote(
        &self,
        collection: &str,
        rev: &RemoteRevision,
        allow_conflict: bool,
    ) -> StoreResult<ApplyOutcome>;

    /// Returns both sides of a document's unresolved conflict.
    fn conflict(&self, collection: &str, doc_id: &str)
        -> StoreResult<Option<ConflictedRevisions>>;

    /// Commits the resolution of a conflict.
    ///
    /// Fails with `Conflict` if either branch moved since it was read, and
    /// with `NotFound` if the document was purged or deleted meanwhile.
    fn resolve_conflict(
        &self,
        collection: &str,
        doc_id: &str,
        expected_local: &RevisionId,
        expected_remote: &RevisionId,
        resolved: ResolvedRevision,
    ) -> StoreResult<Document>;

    /// IDs of documents with an unresolved conflict.
    fn conflicted_ids(&self, collection: &str) -> StoreResult<Vec<String>>;

    /// The revision a given peer is known to have for a document.
    fn remote_revision(
        &self,
        collection: &str,
        doc_id: &str,
        remote: &str,
    ) -> StoreResult<Option<RevisionId>>;

    /// Records the revision a given peer is known to have for a document.
    fn set_remote_revision(
        &self,
        collection: &str,
        doc_id: &str,
        remote: &str,
        rev: &RevisionId,
    ) -> StoreResult<()>;

    /// Reads a local (non-replicated) record.
    fn get_local(&self, key: &str) -> StoreResult<Option<serde_json::Value>>;

    /// Writes a local record.
    fn put_local(&self, key: &str, value: serde_json::Value) -> StoreResult<()>;

    /// Removes a local record.
    fn delete_local(&self, key: &str) -> StoreResult<()>;

    /// Stores blob content.
    fn save_blob(&self, content_type: &str, data: &[u8]) -> StoreResult<Blob>;

    /// Reads blob content.
    fn blob_data(&self, digest: &str) -> StoreResult<Vec<u8>>;

    /// Returns true if blob content with this digest is stored here.
    fn has_blob(&self, digest: &str) -> StoreResult<bool>;
}
