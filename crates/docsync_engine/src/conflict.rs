//! Conflict resolution.
//!
//! When a pulled revision diverges from the local one, the store keeps both
//! and the session hands the document to the [`ConflictCoordinator`]. The
//! coordinator runs at most one resolution per document at a time, runs
//! different documents concurrently up to a pool size, and never holds a
//! lock while user code runs, so a resolver may freely read and write the
//! store.
//!
//! A resolution commits with compare-and-swap on both branches. If the
//! document changed while the resolver ran, the resolver is called again
//! with the fresh state.

use crate::error::SyncError;
use crate::filter::panic_message;
use docsync_store::{Document, DocumentStore, ResolvedRevision, StoreError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Error type returned by resolvers.
pub type ResolverError = Box<dyn std::error::Error + Send + Sync>;

/// Attempts before a resolution that keeps racing local writes gives up.
const MAX_RESOLVE_ATTEMPTS: usize = 5;

/// Two divergent revisions of one document.
#[derive(Debug, Clone)]
pub struct Conflict {
    collection: String,
    doc_id: String,
    local: Option<Document>,
    remote: Option<Document>,
}

impl Conflict {
    /// Creates a conflict. `None` stands for a deleted side.
    pub fn new(
        collection: impl Into<String>,
        doc_id: impl Into<String>,
        local: Option<Document>,
        remote: Option<Document>,
    ) -> Self {
        Self {
            collection: collection.into(),
            doc_id: doc_id.into(),
            local,
            remote,
        }
    }

    /// Collection name.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Document ID.
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Local revision, or `None` if deleted locally.
    pub fn local(&self) -> Option<&Document> {
        self.local.as_ref()
    }

    /// Remote revision, or `None` if deleted remotely.
    pub fn remote(&self) -> Option<&Document> {
        self.remote.as_ref()
    }
}

/// What a resolver decided.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Keep the local revision.
    Local,
    /// Take the remote revision.
    Remote,
    /// Store new content. Saved under the conflicting document's ID
    /// whatever ID the document carries.
    Merged(Document),
    /// Delete the document.
    Delete,
}

/// Decides the outcome of a conflict.
pub trait ConflictResolver: Send + Sync {
    /// Resolves one conflict.
    fn resolve(&self, conflict: &Conflict) -> Result<Resolution, ResolverError>;
}

impl<F> ConflictResolver for F
where
    F: Fn(&Conflict) -> Result<Resolution, ResolverError> + Send + Sync,
{
    fn resolve(&self, conflict: &Conflict) -> Result<Resolution, ResolverError> {
        self(conflict)
    }
}

/// The resolver used when none is configured.
///
/// A deletion wins; otherwise the revision with the higher generation wins,
/// ties going to the greater revision ID.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConflictResolver;

impl ConflictResolver for DefaultConflictResolver {
    fn resolve(&self, conflict: &Conflict) -> Result<Resolution, ResolverError> {
        let (Some(local), Some(remote)) = (conflict.local(), conflict.remote()) else {
            return Ok(Resolution::Delete);
        };
        if local.revision() > remote.revision() {
            Ok(Resolution::Local)
        } else {
            Ok(Resolution::Remote)
        }
    }
}

/// How one resolution run ended.
#[derive(Debug, Clone)]
pub enum ResolutionOutcome {
    /// The winner was committed.
    Resolved(Document),
    /// The document had no conflict by the time the run started.
    NothingToResolve,
    /// The resolution failed; the conflict stays in place.
    Failed(SyncError),
}

/// Reported once per finished resolution run that did something.
#[derive(Debug, Clone)]
pub struct ResolutionEvent {
    /// Collection name.
    pub collection: String,
    /// Document ID.
    pub doc_id: String,
    /// Outcome.
    pub outcome: ResolutionOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DocKey {
    collection: String,
    doc_id: String,
}

struct InFlight {
    rerun: bool,
}

struct Inner {
    store: Arc<dyn DocumentStore>,
    remote_key: String,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashMap<DocKey, InFlight>>,
    suspended: watch::Sender<bool>,
    cancelled: watch::Sender<bool>,
    pending: watch::Sender<usize>,
    events: mpsc::UnboundedSender<ResolutionEvent>,
}

/// Schedules conflict resolutions.
#[derive(Clone)]
pub struct ConflictCoordinator {
    inner: Arc<Inner>,
}

impl ConflictCoordinator {
    /// Creates a coordinator running up to `pool_size` resolutions at once.
    ///
    /// `remote_key` identifies the peer; taking the remote side records
    /// that the peer already has the winning revision.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        remote_key: impl Into<String>,
        pool_size: usize,
        events: mpsc::UnboundedSender<ResolutionEvent>,
    ) -> Self {
        let (suspended, _) = watch::channel(false);
        let (cancelled, _) = watch::channel(false);
        let (pending, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                store,
                remote_key: remote_key.into(),
                permits: Arc::new(Semaphore::new(pool_size.max(1))),
                in_flight: Mutex::new(HashMap::new()),
                suspended,
                cancelled,
                pending,
                events,
            }),
        }
    }

    /// Schedules resolution of a document.
    ///
    /// If the document is already being resolved, it is resolved again
    /// once the running resolution finishes. Must be called from within a
    /// Tokio runtime.
    pub fn dispatch(
        &self,
        collection: &str,
        doc_id: &str,
        resolver: Arc<dyn ConflictResolver>,
    ) {
        let key = DocKey {
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
        };
        {
            let mut in_flight = self.inner.in_flight.lock();
            if let Some(entry) = in_flight.get_mut(&key) {
                entry.rerun = true;
                debug!(collection, doc_id, "resolution already scheduled; will run again");
                return;
            }
            in_flight.insert(key.clone(), InFlight { rerun: false });
            self.inner.pending.send_modify(|n| *n += 1);
        }
        debug!(collection, doc_id, "conflict dispatched");
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run(key, resolver).await });
    }

    /// Pauses or resumes dispatch. Running resolutions finish either way.
    pub fn set_suspended(&self, suspended: bool) {
        self.inner.suspended.send_replace(suspended);
    }

    /// Drops every resolution that has not started yet.
    pub fn cancel_queued(&self) {
        self.inner.cancelled.send_replace(true);
    }

    /// Number of documents scheduled or being resolved.
    pub fn pending_count(&self) -> usize {
        *self.inner.pending.borrow()
    }

    /// Subscribes to the pending count.
    pub fn watch_pending(&self) -> watch::Receiver<usize> {
        self.inner.pending.subscribe()
    }

    /// Waits until no resolution is scheduled or running.
    pub async fn wait_idle(&self) {
        let mut pending = self.inner.pending.subscribe();
        let _ = pending.wait_for(|n| *n == 0).await;
    }
}

impl fmt::Debug for ConflictCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictCoordinator")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Inner {
    async fn run(self: Arc<Self>, key: DocKey, resolver: Arc<dyn ConflictResolver>) {
        loop {
            let Some(permit) = self.admit().await else {
                debug!(collection = %key.collection, doc_id = %key.doc_id, "queued resolution cancelled");
                self.finish(&key);
                return;
            };

            let store = self.store.clone();
            let remote_key = self.remote_key.clone();
            let task_key = key.clone();
            let task_resolver = resolver.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                resolve_document(
                    store.as_ref(),
                    &task_key.collection,
                    &task_key.doc_id,
                    task_resolver.as_ref(),
                    &remote_key,
                )
            })
            .await
            .unwrap_or_else(|err| {
                ResolutionOutcome::Failed(SyncError::UnexpectedError {
                    doc_id: key.doc_id.clone(),
                    message: err.to_string(),
                })
            });
            drop(permit);

            if !matches!(outcome, ResolutionOutcome::NothingToResolve) {
                let _ = self.events.send(ResolutionEvent {
                    collection: key.collection.clone(),
                    doc_id: key.doc_id.clone(),
                    outcome,
                });
            }

            if !self.rerun_or_finish(&key) {
                return;
            }
        }
    }

    /// Waits for a pool slot while not suspended. `None` once cancelled.
    async fn admit(&self) -> Option<OwnedSemaphorePermit> {
        let mut suspended = self.suspended.subscribe();
        let mut cancelled = self.cancelled.subscribe();
        loop {
            if *cancelled.borrow() {
                return None;
            }
            tokio::select! {
                _ = cancelled.wait_for(|c| *c) => return None,
                resumed = suspended.wait_for(|s| !*s) => {
                    if resumed.is_err() {
                        return None;
                    }
                }
            }
            let permit = tokio::select! {
                _ = cancelled.wait_for(|c| *c) => return None,
                permit = self.permits.clone().acquire_owned() => permit.ok()?,
            };
            if *suspended.borrow() {
                drop(permit);
                continue;
            }
            return Some(permit);
        }
    }

    fn rerun_or_finish(&self, key: &DocKey) -> bool {
        let mut in_flight = self.in_flight.lock();
        match in_flight.get_mut(key) {
            Some(entry) if entry.rerun => {
                entry.rerun = false;
                true
            }
            _ => {
                in_flight.remove(key);
                self.pending.send_modify(|n| *n = n.saturating_sub(1));
                false
            }
        }
    }

    fn finish(&self, key: &DocKey) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.remove(key).is_some() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
        }
    }
}

fn resolve_document(
    store: &dyn DocumentStore,
    collection: &str,
    doc_id: &str,
    resolver: &dyn ConflictResolver,
    remote_key: &str,
) -> ResolutionOutcome {
    for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
        let pair = match store.conflict(collection, doc_id) {
            Ok(Some(pair)) => pair,
            Ok(None) => return ResolutionOutcome::NothingToResolve,
            Err(err) => return ResolutionOutcome::Failed(err.into()),
        };
        let (Some(local_rev), Some(remote_rev)) =
            (pair.local.revision().cloned(), pair.remote.revision().cloned())
        else {
            return ResolutionOutcome::Failed(SyncError::UnexpectedError {
                doc_id: doc_id.to_string(),
                message: "conflict without revisions".into(),
            });
        };

        let local = (!pair.local.is_deleted()).then(|| pair.local.into_sealed());
        let remote = (!pair.remote.is_deleted()).then(|| pair.remote.into_sealed());
        let conflict = Conflict::new(collection, doc_id, local, remote);

        let resolution = match catch_unwind(AssertUnwindSafe(|| resolver.resolve(&conflict))) {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(err)) => {
                warn!(collection, doc_id, error = %err, "conflict resolver failed");
                return ResolutionOutcome::Failed(SyncError::UnexpectedError {
                    doc_id: doc_id.to_string(),
                    message: err.to_string(),
                });
            }
            Err(panic) => {
                warn!(collection, doc_id, "conflict resolver panicked");
                return ResolutionOutcome::Failed(SyncError::UnexpectedError {
                    doc_id: doc_id.to_string(),
                    message: panic_message(&*panic),
                });
            }
        };

        let took_remote = matches!(resolution, Resolution::Remote);
        let resolved = match resolution {
            Resolution::Local => ResolvedRevision::KeepLocal,
            Resolution::Remote => ResolvedRevision::TakeRemote,
            Resolution::Delete => ResolvedRevision::Deleted,
            Resolution::Merged(doc) => {
                if let Err(err) = check_blobs(store, doc_id, &doc) {
                    return ResolutionOutcome::Failed(err);
                }
                if doc.id() != doc_id {
                    debug!(collection, doc_id, returned_id = doc.id(), "resolved document stored under the conflicting id");
                }
                if doc.is_deleted() {
                    ResolvedRevision::Deleted
                } else {
                    ResolvedRevision::Merged(doc.into_properties())
                }
            }
        };

        match store.resolve_conflict(collection, doc_id, &local_rev, &remote_rev, resolved) {
            Ok(document) => {
                if took_remote {
                    if let Err(err) =
                        store.set_remote_revision(collection, doc_id, remote_key, &remote_rev)
                    {
                        warn!(collection, doc_id, error = %err, "failed to record remote revision");
                    }
                }
                info!(collection, doc_id, attempt, rev = ?document.revision(), "conflict resolved");
                return ResolutionOutcome::Resolved(document);
            }
            Err(StoreError::Conflict { .. }) => {
                debug!(collection, doc_id, attempt, "document changed during resolution; resolving again");
            }
            Err(err) if err.is_not_found() => {
                return ResolutionOutcome::Failed(SyncError::DocumentNotFound {
                    doc_id: doc_id.to_string(),
                });
            }
            Err(err) => return ResolutionOutcome::Failed(err.into()),
        }
    }

    ResolutionOutcome::Failed(SyncError::UnexpectedError {
        doc_id: doc_id.to_string(),
        message: format!("document kept changing across {MAX_RESOLVE_ATTEMPTS} resolution attempts"),
    })
}

fn check_blobs(store: &dyn DocumentStore, doc_id: &str, doc: &Document) -> Result<(), SyncError> {
    for blob in doc.blobs() {
        let local = match doc.blob_origin(blob.digest()) {
            Some(origin) => origin == store.id(),
            None => store.has_blob(blob.digest())?,
        };
        if !local {
            return Err(SyncError::ForeignBlob {
                doc_id: doc_id.to_string(),
            });
        }
    }
    Ok(())
}
