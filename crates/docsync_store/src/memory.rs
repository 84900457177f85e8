//! In-memory document store.

use crate::blob::{collect_blobs, Blob, BlobData};
use crate::document::{Document, Properties};
use crate::error::{StoreError, StoreResult};
use crate::revision::{RevisionId, MAX_HISTORY};
use crate::store::{
    ApplyOutcome, ChangeRecord, ConflictedRevisions, DocumentStore, RemoteRevision,
    ResolvedRevision, StoreId,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::debug;

/// Per-document state flags kept by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageFlags {
    /// The current revision is a tombstone.
    pub deleted: bool,
    /// A conflicting remote revision is waiting for resolution.
    pub conflicted: bool,
    /// The current body references at least one blob.
    pub has_attachments: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRevision {
    revision: RevisionId,
    history: Vec<RevisionId>,
    deleted: bool,
    properties: Properties,
}

impl StoredRevision {
    fn root(deleted: bool, properties: Properties) -> Self {
        Self {
            revision: RevisionId::compute(None, deleted, &properties),
            history: Vec::new(),
            deleted,
            properties,
        }
    }

    fn child(&self, deleted: bool, properties: Properties) -> Self {
        let history = std::iter::once(self.revision.clone())
            .chain(self.history.iter().cloned())
            .take(MAX_HISTORY)
            .collect();
        Self {
            revision: RevisionId::compute(Some(&self.revision), deleted, &properties),
            history,
            deleted,
            properties,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDocument {
    current: StoredRevision,
    conflict: Option<StoredRevision>,
    sequence: u64,
    flags: StorageFlags,
    #[serde(default)]
    remote_revisions: BTreeMap<String, RevisionId>,
}

impl StoredDocument {
    fn new(current: StoredRevision, sequence: u64) -> Self {
        let mut doc = Self {
            current,
            conflict: None,
            sequence,
            flags: StorageFlags::default(),
            remote_revisions: BTreeMap::new(),
        };
        doc.refresh_flags();
        doc
    }

    fn refresh_flags(&mut self) {
        self.flags.deleted = self.current.deleted;
        self.flags.conflicted = self.conflict.is_some();
        self.flags.has_attachments = !collect_blobs(&self.current.properties).is_empty();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredBlob {
    content_type: String,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    collections: BTreeMap<String, BTreeMap<String, StoredDocument>>,
    local: BTreeMap<String, serde_json::Value>,
    blobs: BTreeMap<String, StoredBlob>,
    last_sequence: u64,
}

impl StoreData {
    fn next_sequence(&mut self) -> u64 {
        self.last_sequence += 1;
        self.last_sequence
    }

    fn document(&self, collection: &str, doc_id: &str) -> Option<&StoredDocument> {
        self.collections.get(collection)?.get(doc_id)
    }

    fn document_mut(&mut self, collection: &str, doc_id: &str) -> Option<&mut StoredDocument> {
        self.collections.get_mut(collection)?.get_mut(doc_id)
    }

    fn insert(&mut self, collection: &str, doc_id: &str, doc: StoredDocument) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(doc_id.to_string(), doc);
    }
}

/// Serializable image of a [`MemoryStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    id: StoreId,
    name: String,
    data: StoreData,
}

impl StoreSnapshot {
    /// ID of the store the snapshot was taken from.
    pub fn id(&self) -> StoreId {
        self.id
    }

    /// Name of the store the snapshot was taken from.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A [`DocumentStore`] kept entirely in memory.
pub struct MemoryStore {
    id: StoreId,
    name: String,
    open: AtomicBool,
    data: RwLock<StoreData>,
    notify: watch::Sender<u64>,
}

impl MemoryStore {
    /// Creates an empty store with a fresh ID.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(StoreId::new_v4(), name)
    }

    /// Creates an empty store with the given ID.
    pub fn with_id(id: StoreId, name: impl Into<String>) -> Self {
        Self::from_parts(id, name.into(), StoreData::default())
    }

    /// Restores a store from a snapshot.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self::from_parts(snapshot.id, snapshot.name, snapshot.data)
    }

    fn from_parts(id: StoreId, name: String, data: StoreData) -> Self {
        let (notify, _) = watch::channel(data.last_sequence);
        Self {
            id,
            name,
            open: AtomicBool::new(true),
            data: RwLock::new(data),
            notify,
        }
    }

    /// Takes a snapshot of the whole store.
    pub fn snapshot(&self) -> StoreResult<StoreSnapshot> {
        self.check_open()?;
        Ok(StoreSnapshot {
            id: self.id,
            name: self.name.clone(),
            data: self.data.read().clone(),
        })
    }

    /// Returns the storage flags of a document.
    pub fn flags(&self, collection: &str, doc_id: &str) -> StoreResult<Option<StorageFlags>> {
        self.check_open()?;
        Ok(self.data.read().document(collection, doc_id).map(|d| d.flags))
    }

    /// Number of live documents in a collection.
    pub fn document_count(&self, collection: &str) -> StoreResult<usize> {
        self.check_open()?;
        Ok(self
            .data
            .read()
            .collections
            .get(collection)
            .map(|docs| docs.values().filter(|d| !d.current.deleted).count())
            .unwrap_or(0))
    }

    /// Names of collections that hold at least one document.
    pub fn collections(&self) -> StoreResult<Vec<String>> {
        self.check_open()?;
        Ok(self.data.read().collections.keys().cloned().collect())
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }

    fn publish(&self, sequence: u64) {
        self.notify.send_replace(sequence);
    }

    fn to_document(&self, doc_id: &str, rev: &StoredRevision) -> Document {
        Document::stored(
            doc_id,
            rev.revision.clone(),
            rev.properties.clone(),
            rev.deleted,
            Some(self.id),
        )
    }

    fn check_blob_origins(&self, doc: &Document) -> StoreResult<()> {
        for blob in doc.blobs() {
            match doc.blob_origin(blob.digest()) {
                Some(origin) if origin != self.id => {
                    return Err(StoreError::invalid_operation(format!(
                        "document {} contains a blob saved to a different database",
                        doc.id()
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl DocumentStore for MemoryStore {
    fn id(&self) -> StoreId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!(store = %self.name, "store closed");
        }
    }

    fn get(&self, collection: &str, doc_id: &str) -> StoreResult<Option<Document>> {
        Ok(self
            .get_including_deleted(collection, doc_id)?
            .filter(|doc| !doc.is_deleted()))
    }

    fn get_including_deleted(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> StoreResult<Option<Document>> {
        self.check_open()?;
        Ok(self
            .data
            .read()
            .document(collection, doc_id)
            .map(|d| self.to_document(doc_id, &d.current)))
    }

    fn save(&self, collection: &str, doc: &Document) -> StoreResult<Document> {
        self.check_open()?;
        if doc.is_sealed() {
            return Err(StoreError::invalid_operation(format!(
                "document {} is a read-only snapshot and cannot be saved",
                doc.id()
            )));
        }
        self.check_blob_origins(doc)?;

        let mut data = self.data.write();
        let properties = doc.properties().clone();
        let next = match (data.document(collection, doc.id()), doc.revision()) {
            (None, None) => StoredRevision::root(false, properties),
            (Some(existing), Some(rev)) if &existing.current.revision == rev => {
                existing.current.child(false, properties)
            }
            (Some(existing), None) if existing.current.deleted => {
                existing.current.child(false, properties)
            }
            _ => return Err(StoreError::conflict(collection, doc.id())),
        };

        let sequence = data.next_sequence();
        let stored = match data.document_mut(collection, doc.id()) {
            Some(existing) => {
                existing.current = next;
                existing.sequence = sequence;
                existing.refresh_flags();
                existing.clone()
            }
            None => {
                let created = StoredDocument::new(next, sequence);
                data.insert(collection, doc.id(), created.clone());
                created
            }
        };
        drop(data);

        self.publish(sequence);
        Ok(self.to_document(doc.id(), &stored.current))
    }

    fn delete(&self, collection: &str, doc_id: &str) -> StoreResult<RevisionId> {
        self.check_open()?;
        let mut data = self.data.write();
        let sequence = data.last_sequence + 1;
        let existing = data
            .document_mut(collection, doc_id)
            .filter(|d| !d.current.deleted)
            .ok_or_else(|| StoreError::not_found(collection, doc_id))?;
        existing.current = existing.current.child(true, Properties::new());
        existing.sequence = sequence;
        existing.refresh_flags();
        let rev = existing.current.revision.clone();
        data.last_sequence = sequence;
        drop(data);

        self.publish(sequence);
        Ok(rev)
    }

    fn purge(&self, collection: &str, doc_id: &str) -> StoreResult<()> {
        self.check_open()?;
        let mut data = self.data.write();
        let removed = data
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.remove(doc_id));
        if removed.is_none() {
            return Err(StoreError::not_found(collection, doc_id));
        }
        // Purges leave no change record but still advance the sequence so
        // observers notice the document disappeared.
        let sequence = data.next_sequence();
        drop(data);

        debug!(collection, doc_id, "document purged");
        self.publish(sequence);
        Ok(())
    }

    fn last_sequence(&self) -> StoreResult<u64> {
        self.check_open()?;
        Ok(self.data.read().last_sequence)
    }

    fn changes_since(
        &self,
        collection: &str,
        since: u64,
        limit: usize,
    ) -> StoreResult<Vec<ChangeRecord>> {
        self.check_open()?;
        let data = self.data.read();
        let Some(docs) = data.collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut changes: Vec<ChangeRecord> = docs
            .iter()
            .filter(|(_, d)| d.sequence > since)
            .map(|(id, d)| ChangeRecord {
                sequence: d.sequence,
                doc_id: id.clone(),
                revision: d.current.revision.clone(),
                deleted: d.current.deleted,
                conflicted: d.conflict.is_some(),
            })
            .collect();
        changes.sort_by_key(|c| c.sequence);
        changes.truncate(limit);
        Ok(changes)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    fn export_revision(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> StoreResult<Option<RemoteRevision>> {
        self.check_open()?;
        let data = self.data.read();
        let Some(doc) = data.document(collection, doc_id) else {
            return Ok(None);
        };
        let attachments = collect_blobs(&doc.current.properties)
            .into_iter()
            .filter_map(|blob| {
                data.blobs.get(blob.digest()).map(|stored| BlobData {
                    digest: blob.digest().to_string(),
                    content_type: stored.content_type.clone(),
                    data: stored.data.clone(),
                })
            })
            .collect();
        Ok(Some(RemoteRevision {
            doc_id: doc_id.to_string(),
            revision: doc.current.revision.clone(),
            history: doc.current.history.clone(),
            deleted: doc.current.deleted,
            access_removed: false,
            properties: doc.current.properties.clone(),
            attachments,
        }))
    }

    fn apply_remote(
        &self,
        collection: &str,
        rev: &RemoteRevision,
        allow_conflict: bool,
    ) -> StoreResult<ApplyOutcome> {
        self.check_open()?;
        let mut data = self.data.write();
        for blob in &rev.attachments {
            data.blobs
                .entry(blob.digest.clone())
                .or_insert_with(|| StoredBlob {
                    content_type: blob.content_type.clone(),
                    data: blob.data.clone(),
                });
        }

        let incoming = StoredRevision {
            revision: rev.revision.clone(),
            history: rev.history.iter().take(MAX_HISTORY).cloned().collect(),
            deleted: rev.deleted,
            properties: rev.properties.clone(),
        };

        let Some(mut doc) = data.document(collection, &rev.doc_id).cloned() else {
            let sequence = data.next_sequence();
            data.insert(collection, &rev.doc_id, StoredDocument::new(incoming, sequence));
            drop(data);
            self.publish(sequence);
            return Ok(ApplyOutcome::Inserted);
        };

        let known = doc.current.revision == rev.revision
            || doc.current.history.contains(&rev.revision)
            || doc
                .conflict
                .as_ref()
                .is_some_and(|c| c.revision == rev.revision);
        if known {
            return Ok(ApplyOutcome::AlreadyKnown);
        }

        if rev.descends_from(&doc.current.revision) {
            if doc
                .conflict
                .as_ref()
                .is_some_and(|c| rev.descends_from(&c.revision))
            {
                doc.conflict = None;
            }
            doc.current = incoming;
            let sequence = data.next_sequence();
            doc.sequence = sequence;
            doc.refresh_flags();
            data.insert(collection, &rev.doc_id, doc);
            drop(data);
            self.publish(sequence);
            return Ok(ApplyOutcome::FastForwarded);
        }

        if !allow_conflict {
            return Err(StoreError::conflict(collection, &rev.doc_id));
        }

        debug!(collection, doc_id = %rev.doc_id, remote_rev = %rev.revision, "conflicting revision stored");
        doc.conflict = Some(incoming);
        doc.refresh_flags();
        data.insert(collection, &rev.doc_id, doc);
        Ok(ApplyOutcome::Conflicted)
    }

    fn conflict(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> StoreResult<Option<ConflictedRevisions>> {
        self.check_open()?;
        let data = self.data.read();
        Ok(data.document(collection, doc_id).and_then(|doc| {
            doc.conflict.as_ref().map(|remote| ConflictedRevisions {
                local: self.to_document(doc_id, &doc.current),
                remote: self.to_document(doc_id, remote),
            })
        }))
    }

    fn resolve_conflict(
        &self,
        collection: &str,
        doc_id: &str,
        expected_local: &RevisionId,
        expected_remote: &RevisionId,
        resolved: ResolvedRevision,
    ) -> StoreResult<Document> {
        self.check_open()?;
        let mut data = self.data.write();
        let sequence = data.last_sequence + 1;
        let doc = data
            .document_mut(collection, doc_id)
            .ok_or_else(|| StoreError::not_found(collection, doc_id))?;

        if &doc.current.revision != expected_local {
            if doc.current.deleted {
                return Err(StoreError::not_found(collection, doc_id));
            }
            return Err(StoreError::conflict(collection, doc_id));
        }
        let remote = match &doc.conflict {
            Some(remote) if &remote.revision == expected_remote => remote.clone(),
            _ => return Err(StoreError::conflict(collection, doc_id)),
        };

        // The winner is always a child of the remote branch.
        doc.current = match resolved {
            ResolvedRevision::TakeRemote => remote,
            ResolvedRevision::KeepLocal => {
                remote.child(doc.current.deleted, doc.current.properties.clone())
            }
            ResolvedRevision::Merged(properties) => remote.child(false, properties),
            ResolvedRevision::Deleted => remote.child(true, Properties::new()),
        };
        doc.conflict = None;
        doc.sequence = sequence;
        doc.refresh_flags();
        let current = doc.current.clone();
        data.last_sequence = sequence;
        drop(data);

        debug!(collection, doc_id, rev = %current.revision, "conflict resolved");
        self.publish(sequence);
        Ok(self.to_document(doc_id, &current))
    }

    fn conflicted_ids(&self, collection: &str) -> StoreResult<Vec<String>> {
        self.check_open()?;
        let data = self.data.read();
        Ok(data
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, d)| d.conflict.is_some())
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn remote_revision(
        &self,
        collection: &str,
        doc_id: &str,
        remote: &str,
    ) -> StoreResult<Option<RevisionId>> {
        self.check_open()?;
        Ok(self
            .data
            .read()
            .document(collection, doc_id)
            .and_then(|d| d.remote_revisions.get(remote).cloned()))
    }

    fn set_remote_revision(
        &self,
        collection: &str,
        doc_id: &str,
        remote: &str,
        rev: &RevisionId,
    ) -> StoreResult<()> {
        self.check_open()?;
        let mut data = self.data.write();
        let doc = data
            .document_mut(collection, doc_id)
            .ok_or_else(|| StoreError::not_found(collection, doc_id))?;
        doc.remote_revisions.insert(remote.to_string(), rev.clone());
        Ok(())
    }

    fn get_local(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        self.check_open()?;
        Ok(self.data.read().local.get(key).cloned())
    }

    fn put_local(&self, key: &str, value: serde_json::Value) -> StoreResult<()> {
        self.check_open()?;
        self.data.write().local.insert(key.to_string(), value);
        Ok(())
    }

    fn delete_local(&self, key: &str) -> StoreResult<()> {
        self.check_open()?;
        self.data.write().local.remove(key);
        Ok(())
    }

    fn save_blob(&self, content_type: &str, data: &[u8]) -> StoreResult<Blob> {
        self.check_open()?;
        let blob = Blob::new(content_type, data, self.id);
        self.data.write().blobs.insert(
            blob.digest().to_string(),
            StoredBlob {
                content_type: content_type.to_string(),
                data: data.to_vec(),
            },
        );
        Ok(blob)
    }

    fn blob_data(&self, digest: &str) -> StoreResult<Vec<u8>> {
        self.check_open()?;
        self.data
            .read()
            .blobs
            .get(digest)
            .map(|b| b.data.clone())
            .ok_or_else(|| StoreError::BlobNotFound(digest.to_string()))
    }

    fn has_blob(&self, digest: &str) -> StoreResult<bool> {
        self.check_open()?;
        Ok(self.data.read().blobs.contains_key(digest))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: serde_json::Value) -> Properties {
        value.as_object().cloned().unwrap()
    }

    fn save_new(store: &MemoryStore, id: &str, body: serde_json::Value) -> Document {
        store
            .save("docs", &Document::with_properties(id, props(body)))
            .unwrap()
    }

    #[test]
    fn save_and_get() {
        let store = MemoryStore::new("db");
        let saved = save_new(&store, "doc1", json!({"name": "Cat"}));
        assert_eq!(saved.revision().unwrap().generation(), 1);

        let loaded = store.get("docs", "doc1").unwrap().unwrap();
        assert_eq!(loaded.string("name"), Some("Cat"));
        assert_eq!(loaded.store_id(), Some(store.id()));
        assert_eq!(store.last_sequence().unwrap(), 1);
    }

    #[test]
    fn save_checks_revision() {
        let store = MemoryStore::new("db");
        let first = save_new(&store, "doc1", json!({"n": 1}));

        let mut edit = first.clone();
        edit.set("n", 2);
        store.save("docs", &edit).unwrap();

        // Stale revision.
        let mut stale = first;
        stale.set("n", 3);
        let err = store.save("docs", &stale).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        // A new document over an existing one.
        let err = store.save("docs", &Document::new("doc1")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[test]
    fn sealed_documents_cannot_be_saved() {
        let store = MemoryStore::new("db");
        let doc = save_new(&store, "doc1", json!({})).into_sealed();
        let err = store.save("docs", &doc).unwrap_err();
        assert!(matches!(err, StoreError::InvalidOperation(_)));
        assert!(store.save("docs", &doc.to_mutable()).is_ok());
    }

    #[test]
    fn delete_writes_tombstone() {
        let store = MemoryStore::new("db");
        save_new(&store, "doc1", json!({"n": 1}));
        let rev = store.delete("docs", "doc1").unwrap();
        assert_eq!(rev.generation(), 2);
        assert!(store.get("docs", "doc1").unwrap().is_none());
        let tomb = store.get_including_deleted("docs", "doc1").unwrap().unwrap();
        assert!(tomb.is_deleted());
        assert!(store.delete("docs", "doc1").unwrap_err().is_not_found());

        // Recreating over a tombstone continues its history.
        let again = save_new(&store, "doc1", json!({"n": 2}));
        assert_eq!(again.revision().unwrap().generation(), 3);
    }

    #[test]
    fn purge_removes_everything() {
        let store = MemoryStore::new("db");
        save_new(&store, "doc1", json!({}));
        store.purge("docs", "doc1").unwrap();
        assert!(store.get_including_deleted("docs", "doc1").unwrap().is_none());
        assert!(store.changes_since("docs", 0, 10).unwrap().is_empty());
        assert!(store.purge("docs", "doc1").unwrap_err().is_not_found());
    }

    #[test]
    fn changes_are_ordered_by_sequence() {
        let store = MemoryStore::new("db");
        save_new(&store, "b", json!({}));
        save_new(&store, "a", json!({}));
        let b = store.get("docs", "b").unwrap().unwrap();
        store.save("docs", &b).unwrap();

        let changes = store.changes_since("docs", 0, 10).unwrap();
        let ids: Vec<_> = changes.iter().map(|c| c.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(changes[1].sequence, 3);

        let later = store.changes_since("docs", 2, 10).unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(store.changes_since("docs", 0, 1).unwrap().len(), 1);
    }

    #[test]
    fn apply_remote_fast_forward_and_known() {
        let local = MemoryStore::new("local");
        let remote = MemoryStore::new("remote");
        let doc = remote
            .save("docs", &Document::with_properties("doc1", props(json!({"v": 1}))))
            .unwrap();

        let rev1 = remote.export_revision("docs", "doc1").unwrap().unwrap();
        assert_eq!(
            local.apply_remote("docs", &rev1, true).unwrap(),
            ApplyOutcome::Inserted
        );
        assert_eq!(
            local.apply_remote("docs", &rev1, true).unwrap(),
            ApplyOutcome::AlreadyKnown
        );

        let mut edit = doc;
        edit.set("v", 2);
        remote.save("docs", &edit).unwrap();
        let rev2 = remote.export_revision("docs", "doc1").unwrap().unwrap();
        assert_eq!(
            local.apply_remote("docs", &rev2, false).unwrap(),
            ApplyOutcome::FastForwarded
        );
        assert_eq!(local.get("docs", "doc1").unwrap().unwrap().get("v"), Some(&json!(2)));

        // Older revision is already known.
        assert_eq!(
            local.apply_remote("docs", &rev1, false).unwrap(),
            ApplyOutcome::AlreadyKnown
        );
    }

    fn diverge(local: &MemoryStore, remote: &MemoryStore) -> RemoteRevision {
        let base = remote
            .save("docs", &Document::with_properties("doc1", props(json!({"name": "Base"}))))
            .unwrap();
        let rev = remote.export_revision("docs", "doc1").unwrap().unwrap();
        local.apply_remote("docs", &rev, true).unwrap();

        let mut theirs = base;
        theirs.set("name", "Lion");
        remote.save("docs", &theirs).unwrap();

        let mut mine = local.get("docs", "doc1").unwrap().unwrap();
        mine.set("name", "Cat");
        local.save("docs", &mine).unwrap();

        remote.export_revision("docs", "doc1").unwrap().unwrap()
    }

    #[test]
    fn divergence_is_a_conflict() {
        let local = MemoryStore::new("local");
        let remote = MemoryStore::new("remote");
        let rev = diverge(&local, &remote);

        let err = local.apply_remote("docs", &rev, false).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let before = local.last_sequence().unwrap();
        assert_eq!(
            local.apply_remote("docs", &rev, true).unwrap(),
            ApplyOutcome::Conflicted
        );
        assert_eq!(local.last_sequence().unwrap(), before);
        assert!(local.flags("docs", "doc1").unwrap().unwrap().conflicted);
        assert_eq!(local.conflicted_ids("docs").unwrap(), vec!["doc1".to_string()]);

        let pair = local.conflict("docs", "doc1").unwrap().unwrap();
        assert_eq!(pair.local.string("name"), Some("Cat"));
        assert_eq!(pair.remote.string("name"), Some("Lion"));
    }

    #[test]
    fn resolve_keep_local_descends_from_remote() {
        let local = MemoryStore::new("local");
        let remote = MemoryStore::new("remote");
        let rev = diverge(&local, &remote);
        local.apply_remote("docs", &rev, true).unwrap();
        let pair = local.conflict("docs", "doc1").unwrap().unwrap();

        let resolved = local
            .resolve_conflict(
                "docs",
                "doc1",
                pair.local.revision().unwrap(),
                pair.remote.revision().unwrap(),
                ResolvedRevision::KeepLocal,
            )
            .unwrap();
        assert_eq!(resolved.string("name"), Some("Cat"));
        assert_eq!(
            resolved.revision().unwrap().generation(),
            rev.revision.generation() + 1
        );
        assert!(!local.flags("docs", "doc1").unwrap().unwrap().conflicted);

        // The remote can fast-forward to the resolution.
        let out = local.export_revision("docs", "doc1").unwrap().unwrap();
        assert_eq!(
            remote.apply_remote("docs", &out, false).unwrap(),
            ApplyOutcome::FastForwarded
        );
    }

    #[test]
    fn resolve_rejects_stale_local() {
        let local = MemoryStore::new("local");
        let remote = MemoryStore::new("remote");
        let rev = diverge(&local, &remote);
        local.apply_remote("docs", &rev, true).unwrap();
        let pair = local.conflict("docs", "doc1").unwrap().unwrap();

        let mut edit = local.get("docs", "doc1").unwrap().unwrap();
        edit.set("name", "Tiger");
        local.save("docs", &edit).unwrap();

        let err = local
            .resolve_conflict(
                "docs",
                "doc1",
                pair.local.revision().unwrap(),
                pair.remote.revision().unwrap(),
                ResolvedRevision::TakeRemote,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[test]
    fn resolve_after_purge_or_delete_is_not_found() {
        let local = MemoryStore::new("local");
        let remote = MemoryStore::new("remote");
        let rev = diverge(&local, &remote);
        local.apply_remote("docs", &rev, true).unwrap();
        let pair = local.conflict("docs", "doc1").unwrap().unwrap();

        local.delete("docs", "doc1").unwrap();
        let err = local
            .resolve_conflict(
                "docs",
                "doc1",
                pair.local.revision().unwrap(),
                pair.remote.revision().unwrap(),
                ResolvedRevision::TakeRemote,
            )
            .unwrap_err();
        assert!(err.is_not_found());

        local.purge("docs", "doc1").unwrap();
        let err = local
            .resolve_conflict(
                "docs",
                "doc1",
                pair.local.revision().unwrap(),
                pair.remote.revision().unwrap(),
                ResolvedRevision::TakeRemote,
            )
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn resolution_keeps_attachment_flag() {
        let local = MemoryStore::new("local");
        let remote = MemoryStore::new("remote");
        let rev = diverge(&local, &remote);

        let blob = local.save_blob("text/plain", b"hello").unwrap();
        let mut mine = local.get("docs", "doc1").unwrap().unwrap();
        mine.set_blob("file", &blob);
        local.save("docs", &mine).unwrap();
        local.apply_remote("docs", &rev, true).unwrap();
        assert!(local.flags("docs", "doc1").unwrap().unwrap().has_attachments);

        let pair = local.conflict("docs", "doc1").unwrap().unwrap();
        local
            .resolve_conflict(
                "docs",
                "doc1",
                pair.local.revision().unwrap(),
                pair.remote.revision().unwrap(),
                ResolvedRevision::KeepLocal,
            )
            .unwrap();
        let flags = local.flags("docs", "doc1").unwrap().unwrap();
        assert!(flags.has_attachments);
        assert!(!flags.conflicted);
        assert!(!flags.deleted);
    }

    #[test]
    fn foreign_blob_is_rejected() {
        let local = MemoryStore::new("local");
        let other = MemoryStore::new("other");
        let blob = other.save_blob("text/plain", b"x").unwrap();
        let mut doc = Document::new("doc1");
        doc.set_blob("file", &blob);
        let err = local.save("docs", &doc).unwrap_err();
        assert!(matches!(err, StoreError::InvalidOperation(_)));
    }

    #[test]
    fn attachments_travel_with_revisions() {
        let local = MemoryStore::new("local");
        let remote = MemoryStore::new("remote");
        let blob = remote.save_blob("text/plain", b"payload").unwrap();
        let mut doc = Document::new("doc1");
        doc.set_blob("file", &blob);
        remote.save("docs", &doc).unwrap();

        let rev = remote.export_revision("docs", "doc1").unwrap().unwrap();
        assert_eq!(rev.attachments.len(), 1);
        local.apply_remote("docs", &rev, true).unwrap();
        assert_eq!(local.blob_data(blob.digest()).unwrap(), b"payload".to_vec());
    }

    #[test]
    fn local_records_and_remote_revisions() {
        let store = MemoryStore::new("db");
        store.put_local("checkpoint/x", json!({"push": 3})).unwrap();
        assert_eq!(store.get_local("checkpoint/x").unwrap(), Some(json!({"push": 3})));
        store.delete_local("checkpoint/x").unwrap();
        assert_eq!(store.get_local("checkpoint/x").unwrap(), None);

        let saved = save_new(&store, "doc1", json!({}));
        let rev = saved.revision().unwrap().clone();
        store.set_remote_revision("docs", "doc1", "peer", &rev).unwrap();
        assert_eq!(store.remote_revision("docs", "doc1", "peer").unwrap(), Some(rev));
        assert_eq!(store.remote_revision("docs", "doc1", "other").unwrap(), None);
    }

    #[test]
    fn closed_store_rejects_calls() {
        let store = MemoryStore::new("db");
        store.close();
        assert!(!store.is_open());
        assert_eq!(store.get("docs", "x").unwrap_err(), StoreError::Closed);
        assert_eq!(store.last_sequence().unwrap_err(), StoreError::Closed);
    }

    #[test]
    fn snapshot_roundtrip() {
        let store = MemoryStore::new("db");
        save_new(&store, "doc1", json!({"name": "Cat"}));
        store.put_local("k", json!(1)).unwrap();

        let encoded = serde_json::to_string(&store.snapshot().unwrap()).unwrap();
        let restored = MemoryStore::from_snapshot(serde_json::from_str(&encoded).unwrap());
        assert_eq!(restored.id(), store.id());
        assert_eq!(
            restored.get("docs", "doc1").unwrap().unwrap().string("name"),
            Some("Cat")
        );
        assert_eq!(restored.last_sequence().unwrap(), 1);
        assert_eq!(restored.get_local("k").unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn subscribers_see_writes() {
        let store = MemoryStore::new("db");
        let mut rx = store.subscribe();
        save_new(&store, "doc1", json!({}));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
