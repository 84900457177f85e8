//! Document values.

use crate::blob::{collect_blobs, Blob};
use crate::revision::RevisionId;
use crate::store::StoreId;
use serde_json::Value;
use std::collections::BTreeMap;

/// JSON body of a document.
pub type Properties = serde_json::Map<String, Value>;

/// A document: an ID, the revision it was read at, and its body.
///
/// Documents returned by a store can be edited and saved back; the save
/// is checked against the revision they were read at. A *sealed* document
/// is a read-only snapshot handed to callbacks; saving one fails.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    id: String,
    revision: Option<RevisionId>,
    properties: Properties,
    deleted: bool,
    sealed: bool,
    store_id: Option<StoreId>,
    blob_origins: BTreeMap<String, StoreId>,
}

impl Document {
    /// Creates a new, empty, unsaved document.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_properties(id, Properties::new())
    }

    /// Creates an unsaved document with the given body.
    pub fn with_properties(id: impl Into<String>, properties: Properties) -> Self {
        Self {
            id: id.into(),
            revision: None,
            properties,
            deleted: false,
            sealed: false,
            store_id: None,
            blob_origins: BTreeMap::new(),
        }
    }

    pub(crate) fn stored(
        id: &str,
        revision: RevisionId,
        properties: Properties,
        deleted: bool,
        store_id: Option<StoreId>,
    ) -> Self {
        Self {
            id: id.to_string(),
            revision: Some(revision),
            properties,
            deleted,
            sealed: false,
            store_id,
            blob_origins: BTreeMap::new(),
        }
    }

    /// Document ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Revision this document was read at, if it has been saved.
    pub fn revision(&self) -> Option<&RevisionId> {
        self.revision.as_ref()
    }

    /// Document body.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Consumes the document, returning its body.
    pub fn into_properties(self) -> Properties {
        self.properties
    }

    /// Gets a property.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Gets a string property.
    pub fn string(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    /// Sets a property.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Removes a property.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    /// Attaches a blob under the given key.
    pub fn set_blob(&mut self, key: impl Into<String>, blob: &Blob) -> &mut Self {
        if let Some(origin) = blob.store_id() {
            self.blob_origins.insert(blob.digest().to_string(), origin);
        }
        self.set(key, blob.to_json())
    }

    /// Returns every blob referenced by the body.
    pub fn blobs(&self) -> Vec<Blob> {
        collect_blobs(&self.properties)
    }

    /// Returns the store a referenced blob was saved to, when the blob was
    /// attached through [`Document::set_blob`].
    pub fn blob_origin(&self, digest: &str) -> Option<StoreId> {
        self.blob_origins.get(digest).copied()
    }

    /// Returns true if the body references at least one blob.
    pub fn has_attachments(&self) -> bool {
        !self.blobs().is_empty()
    }

    /// Returns true if this is a deletion tombstone.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Returns true if this is a read-only snapshot.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// The store this document was read from.
    pub fn store_id(&self) -> Option<StoreId> {
        self.store_id
    }

    /// Turns this document into a read-only snapshot.
    pub fn into_sealed(mut self) -> Self {
        self.sealed = true;
        self
    }

    /// Returns an editable copy that keeps the revision it was read at.
    pub fn to_mutable(&self) -> Self {
        let mut copy = self.clone();
        copy.sealed = false;
        copy
    }

    /// Returns a copy carrying a different document ID.
    pub fn with_id(&self, id: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.id = id.into();
        copy
    }
}
