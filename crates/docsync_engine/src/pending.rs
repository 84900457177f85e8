//! Pending documents in the push direction.
//!
//! A document is pending while its current revision passes the allowlist
//! and push filter and the peer is not yet known to have it. The set is
//! computed lazily and cached until the store moves on or the session
//! confirms a push.

use crate::checkpoint::{checkpoint_id, read_checkpoint};
use crate::config::{CollectionConfig, ReplicatorConfig};
use crate::error::{SyncError, SyncResult};
use crate::filter::{DocumentFlags, FilterPipeline, FilterVerdict};
use docsync_store::DocumentStore;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

const SCAN_PAGE: usize = 500;

struct CachedSet {
    sequence: u64,
    generation: u64,
    ids: BTreeSet<String>,
}

/// Answers pending-document queries for one replicator.
pub struct PendingTracker {
    store: Arc<dyn DocumentStore>,
    config: Arc<ReplicatorConfig>,
    remote_key: String,
    checkpoint_keys: HashMap<String, String>,
    cache: Mutex<HashMap<String, CachedSet>>,
    generation: AtomicU64,
}

impl PendingTracker {
    /// Creates a tracker.
    pub fn new(store: Arc<dyn DocumentStore>, config: Arc<ReplicatorConfig>) -> Self {
        let checkpoint_keys = config
            .collections()
            .iter()
            .map(|c| {
                (
                    c.name().to_string(),
                    checkpoint_id(store.id(), c, config.endpoint()),
                )
            })
            .collect();
        Self {
            remote_key: config.endpoint().key(),
            store,
            config,
            checkpoint_keys,
            cache: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Drops cached sets.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// IDs of documents in `collection` with changes the peer has not
    /// confirmed.
    ///
    /// Fails with `InvalidOperation` on a pull-only replicator or an
    /// unconfigured collection, and with `DatabaseClosed` once the store is
    /// closed.
    pub fn pending_document_ids(&self, collection: &str) -> SyncResult<BTreeSet<String>> {
        let config = self.collection_config(collection)?;
        let sequence = self.store.last_sequence()?;
        let generation = self.generation.load(Ordering::Acquire);

        if let Some(cached) = self.cache.lock().get(collection) {
            if cached.sequence == sequence && cached.generation == generation {
                return Ok(cached.ids.clone());
            }
        }

        let ids = self.compute(config)?;
        debug!(collection, pending = ids.len(), "pending documents computed");
        self.cache.lock().insert(
            collection.to_string(),
            CachedSet {
                sequence,
                generation,
                ids: ids.clone(),
            },
        );
        Ok(ids)
    }

    /// Returns true if `doc_id` is in [`Self::pending_document_ids`].
    pub fn is_document_pending(&self, doc_id: &str, collection: &str) -> SyncResult<bool> {
        Ok(self.pending_document_ids(collection)?.contains(doc_id))
    }

    fn collection_config(&self, collection: &str) -> SyncResult<&CollectionConfig> {
        if !self.config.replicator_type().is_push() {
            return Err(SyncError::InvalidOperation(
                "pending documents are only tracked for push replication".into(),
            ));
        }
        if !self.store.is_open() {
            return Err(SyncError::DatabaseClosed);
        }
        self.config.collection(collection).ok_or_else(|| {
            SyncError::InvalidOperation(format!("collection '{collection}' is not replicated"))
        })
    }

    fn compute(&self, config: &CollectionConfig) -> SyncResult<BTreeSet<String>> {
        let name = config.name();
        let checkpoint = match self.checkpoint_keys.get(name) {
            Some(key) => read_checkpoint(self.store.as_ref(), key)?,
            None => Default::default(),
        };
        let pipeline = FilterPipeline::new(config);
        let mut ids = BTreeSet::new();
        let mut cursor = checkpoint.push;
        loop {
            let changes = self.store.changes_since(name, cursor, SCAN_PAGE)?;
            let Some(last) = changes.last() else {
                break;
            };
            cursor = last.sequence;
            for change in changes {
                if self.is_pending(name, &pipeline, &change.doc_id)? {
                    ids.insert(change.doc_id);
                }
            }
        }
        // Rejected pushes sit behind the push position.
        for doc_id in checkpoint.rejected {
            if !ids.contains(&doc_id) && self.is_pending(name, &pipeline, &doc_id)? {
                ids.insert(doc_id);
            }
        }
        Ok(ids)
    }

    fn is_pending(&self, name: &str, pipeline: &FilterPipeline, doc_id: &str) -> SyncResult<bool> {
        if !pipeline.allows_id(doc_id) {
            return Ok(false);
        }
        let Some(doc) = self.store.get_including_deleted(name, doc_id)? else {
            return Ok(false);
        };
        let known = self.store.remote_revision(name, doc_id, &self.remote_key)?;
        if known.is_some() && known.as_ref() == doc.revision() {
            return Ok(false);
        }
        let flags = DocumentFlags::from_state(doc.is_deleted(), false);
        Ok(matches!(
            pipeline.check_push(&doc.into_sealed(), flags),
            FilterVerdict::Accept
        ))
    }
}

impl std::fmt::Debug for PendingTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTracker")
            .field("remote_key", &self.remote_key)
            .finish()
    }
}
