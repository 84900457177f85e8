//! Replication checkpoints.
//!
//! A checkpoint records, per collection and peer, the last local sequence
//! whose changes have been pushed and the last remote sequence whose
//! changes have been pulled. It is stored as a local record of the store
//! under a key hashed from everything that changes what gets replicated:
//! the store, the collection, the peer, the filter names and the document
//! ID allowlist.
//!
//! Documents the peer rejected on push are listed in the checkpoint too:
//! the push position moves past them, but they stay pending until a later
//! push of them is accepted.

use crate::config::{CollectionConfig, Endpoint};
use crate::error::SyncResult;
use docsync_store::{DocumentStore, StoreId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const LOCAL_PREFIX: &str = "checkpoint/";

/// Replication progress for one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last local sequence whose push the peer answered.
    pub push: u64,
    /// Last remote sequence applied locally.
    pub pull: u64,
    /// Documents at or before `push` whose last push was rejected.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub rejected: BTreeSet<String>,
}

/// Computes the checkpoint key for a collection.
pub fn checkpoint_id(store_id: StoreId, collection: &CollectionConfig, endpoint: &Endpoint) -> String {
    let mut hasher = Sha256::new();
    let mut field = |value: &str| {
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value.as_bytes());
    };
    field(&store_id.to_string());
    field(collection.name());
    field(&endpoint.key());
    field(collection.push_filter().map(|f| f.name()).unwrap_or(""));
    field(collection.pull_filter().map(|f| f.name()).unwrap_or(""));
    let mut ids: Vec<&str> = collection
        .document_ids()
        .map(|ids| ids.iter().map(String::as_str).collect())
        .unwrap_or_default();
    ids.sort_unstable();
    for id in ids {
        field(id);
    }
    let digest = hasher.finalize();
    let hex: String = digest[..20].iter().map(|b| format!("{b:02x}")).collect();
    format!("cp-{hex}")
}

/// Reads a checkpoint without taking ownership of it.
pub fn read_checkpoint(store: &dyn DocumentStore, key: &str) -> SyncResult<Checkpoint> {
    let record = store.get_local(&format!("{LOCAL_PREFIX}{key}"))?;
    Ok(record
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default())
}

/// The checkpoint of one collection, owned by the session worker.
pub struct CheckpointStore {
    store: Arc<dyn DocumentStore>,
    key: String,
    current: Checkpoint,
    saved: Checkpoint,
    interval: Duration,
    last_save: Instant,
}

impl CheckpointStore {
    /// Loads the checkpoint stored under `key`.
    pub fn open(store: Arc<dyn DocumentStore>, key: String, interval: Duration) -> SyncResult<Self> {
        let current = read_checkpoint(store.as_ref(), &key)?;
        debug!(key = %key, push = current.push, pull = current.pull, "checkpoint loaded");
        Ok(Self {
            store,
            key,
            saved: current.clone(),
            current,
            interval,
            last_save: Instant::now(),
        })
    }

    /// Checkpoint key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current, possibly unsaved, value.
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.current
    }

    /// Discards the stored checkpoint.
    pub fn reset(&mut self) -> SyncResult<()> {
        self.store.delete_local(&self.local_key())?;
        self.current = Checkpoint::default();
        self.saved = Checkpoint::default();
        info!(key = %self.key, "checkpoint reset");
        Ok(())
    }

    /// Moves the push position forward. Never moves backwards.
    pub fn advance_push(&mut self, sequence: u64) {
        self.current.push = self.current.push.max(sequence);
    }

    /// Moves the pull position forward. Never moves backwards.
    pub fn advance_pull(&mut self, sequence: u64) {
        self.current.pull = self.current.pull.max(sequence);
    }

    /// Records that the peer rejected the push of `doc_id`.
    pub fn mark_rejected(&mut self, doc_id: &str) {
        self.current.rejected.insert(doc_id.to_string());
    }

    /// Forgets an earlier rejection of `doc_id`.
    pub fn clear_rejected(&mut self, doc_id: &str) {
        self.current.rejected.remove(doc_id);
    }

    /// Returns true if there are unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.current != self.saved
    }

    /// Saves if dirty and the save interval has elapsed.
    pub fn save_if_due(&mut self) -> SyncResult<bool> {
        if self.is_dirty() && self.last_save.elapsed() >= self.interval {
            self.save()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Saves if dirty.
    pub fn save(&mut self) -> SyncResult<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        let value = serde_json::to_value(&self.current)
            .map_err(|e| docsync_store::StoreError::Serialization(e.to_string()))?;
        self.store.put_local(&self.local_key(), value)?;
        self.saved = self.current.clone();
        self.last_save = Instant::now();
        debug!(key = %self.key, push = self.current.push, pull = self.current.pull, "checkpoint saved");
        Ok(())
    }

    fn local_key(&self) -> String {
        format!("{LOCAL_PREFIX}{}", self.key)
    }
}
