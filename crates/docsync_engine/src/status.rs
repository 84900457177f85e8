//! Replicator status and document events.

use crate::error::SyncError;
use crate::filter::DocumentFlags;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Activity level of a replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityLevel {
    /// Not running.
    Stopped,
    /// Waiting to reconnect, or suspended.
    Offline,
    /// Opening a connection.
    Connecting,
    /// Connected and caught up.
    Idle,
    /// Transferring.
    Busy,
}

impl ActivityLevel {
    /// Returns true while a session is running.
    pub fn is_active(&self) -> bool {
        !matches!(self, ActivityLevel::Stopped)
    }

    /// Returns the level name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityLevel::Stopped => "stopped",
            ActivityLevel::Offline => "offline",
            ActivityLevel::Connecting => "connecting",
            ActivityLevel::Idle => "idle",
            ActivityLevel::Busy => "busy",
        }
    }
}

/// Transfer progress within one connection attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Revisions transferred.
    pub completed: u64,
    /// Revisions known to need transfer.
    pub total: u64,
}

/// Snapshot of a replicator's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatorStatus {
    /// Activity level.
    pub activity: ActivityLevel,
    /// Progress.
    pub progress: Progress,
    /// Last error, if any.
    pub error: Option<SyncError>,
}

impl ReplicatorStatus {
    fn stopped() -> Self {
        Self {
            activity: ActivityLevel::Stopped,
            progress: Progress::default(),
            error: None,
        }
    }
}

/// Direction of a replicated document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Sent to the peer.
    Push,
    /// Received from the peer.
    Pull,
}

/// One document that finished (or failed) replicating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedDocument {
    /// Collection name.
    pub collection: String,
    /// Document ID.
    pub id: String,
    /// Revision flags.
    pub flags: DocumentFlags,
    /// Set if this document failed.
    pub error: Option<SyncError>,
}

/// A batch of replicated documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentReplication {
    /// Direction of the batch.
    pub direction: Direction,
    /// Documents.
    pub documents: Vec<ReplicatedDocument>,
}

/// Handle used to remove a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

type StatusListener = Arc<dyn Fn(&ReplicatorStatus) + Send + Sync>;
type DocumentListener = Arc<dyn Fn(&DocumentReplication) + Send + Sync>;

/// Merges state transitions, progress and errors into one status stream.
pub struct StatusAggregator {
    current: watch::Sender<ReplicatorStatus>,
    progress: Mutex<Progress>,
    status_listeners: RwLock<Vec<(ListenerToken, StatusListener)>>,
    document_listeners: RwLock<Vec<(ListenerToken, DocumentListener)>>,
    next_token: AtomicU64,
}

impl StatusAggregator {
    /// Creates an aggregator reporting `Stopped`.
    pub fn new() -> Self {
        let (current, _) = watch::channel(ReplicatorStatus::stopped());
        Self {
            current,
            progress: Mutex::new(Progress::default()),
            status_listeners: RwLock::new(Vec::new()),
            document_listeners: RwLock::new(Vec::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Latest status.
    pub fn status(&self) -> ReplicatorStatus {
        self.current.borrow().clone()
    }

    /// Subscribes to status changes.
    pub fn watch(&self) -> watch::Receiver<ReplicatorStatus> {
        self.current.subscribe()
    }

    /// Registers a status listener.
    pub fn add_change_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&ReplicatorStatus) + Send + Sync + 'static,
    {
        let token = self.token();
        self.status_listeners.write().push((token, Arc::new(listener)));
        token
    }

    /// Registers a document listener.
    pub fn add_document_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&DocumentReplication) + Send + Sync + 'static,
    {
        let token = self.token();
        self.document_listeners
            .write()
            .push((token, Arc::new(listener)));
        token
    }

    /// Removes a listener. Returns false if the token was unknown.
    pub fn remove_listener(&self, token: ListenerToken) -> bool {
        let mut removed = false;
        self.status_listeners.write().retain(|(t, _)| {
            let keep = *t != token;
            removed |= !keep;
            keep
        });
        self.document_listeners.write().retain(|(t, _)| {
            let keep = *t != token;
            removed |= !keep;
            keep
        });
        removed
    }

    /// Starts a new connection attempt: progress restarts from zero.
    pub fn begin_attempt(&self) {
        *self.progress.lock() = Progress::default();
    }

    /// Adds work to the total.
    pub fn add_total(&self, count: u64) {
        if count > 0 {
            self.progress.lock().total += count;
        }
    }

    /// Marks work as completed. `completed` never passes `total`.
    pub fn add_completed(&self, count: u64) {
        if count > 0 {
            let mut progress = self.progress.lock();
            progress.completed = (progress.completed + count).min(progress.total);
        }
    }

    /// Current progress.
    pub fn progress(&self) -> Progress {
        *self.progress.lock()
    }

    /// Publishes a new activity level. Unchanged statuses are dropped.
    pub fn set_activity(&self, activity: ActivityLevel, error: Option<SyncError>) {
        let mut progress = self.progress();
        if activity == ActivityLevel::Idle {
            // Everything counted has been transferred by the time we idle.
            progress.completed = progress.total;
        }
        let status = ReplicatorStatus {
            activity,
            progress,
            error,
        };
        let changed = self.current.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status.clone();
                true
            }
        });
        if !changed {
            return;
        }
        info!(
            activity = activity.as_str(),
            completed = progress.completed,
            total = progress.total,
            error = ?status.error,
            "replicator status"
        );
        let listeners: Vec<StatusListener> = self
            .status_listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(&status);
        }
    }

    /// Delivers a batch of document events.
    pub fn post_documents(&self, replication: DocumentReplication) {
        if replication.documents.is_empty() {
            return;
        }
        let listeners: Vec<DocumentListener> = self
            .document_listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(&replication);
        }
    }

    fn token(&self) -> ListenerToken {
        ListenerToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for StatusAggregator {
    fn default() -> Self {
        Self::new()
    }
}
