//! Records what a replicator reports.

use docsync_engine::{
    ActivityLevel, Connector, Direction, DocumentFlags, ReplicatedDocument, Replicator,
    ReplicatorStatus, SyncError,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// One recorded per-document event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDocument {
    /// Direction of the batch.
    pub direction: Direction,
    /// The document.
    pub document: ReplicatedDocument,
}

/// Collects status changes and document events.
#[derive(Debug, Clone, Default)]
pub struct EventRecorder {
    statuses: Arc<Mutex<Vec<ReplicatorStatus>>>,
    documents: Arc<Mutex<Vec<RecordedDocument>>>,
}

impl EventRecorder {
    /// Registers listeners on a replicator.
    pub fn attach<C: Connector>(replicator: &Replicator<C>) -> Self {
        let recorder = Self::default();
        let statuses = recorder.statuses.clone();
        replicator.add_change_listener(move |status| statuses.lock().push(status.clone()));
        let documents = recorder.documents.clone();
        replicator.add_document_listener(move |batch| {
            let mut documents = documents.lock();
            for document in &batch.documents {
                documents.push(RecordedDocument {
                    direction: batch.direction,
                    document: document.clone(),
                });
            }
        });
        recorder
    }

    /// Every status seen, in order.
    pub fn statuses(&self) -> Vec<ReplicatorStatus> {
        self.statuses.lock().clone()
    }

    /// Activity levels seen, in order.
    pub fn activities(&self) -> Vec<ActivityLevel> {
        self.statuses.lock().iter().map(|s| s.activity).collect()
    }

    /// Returns true if the activity level was ever reported.
    pub fn saw(&self, activity: ActivityLevel) -> bool {
        self.statuses.lock().iter().any(|s| s.activity == activity)
    }

    /// Every document event, in order.
    pub fn documents(&self) -> Vec<RecordedDocument> {
        self.documents.lock().clone()
    }

    /// IDs of documents replicated without error in one direction, sorted.
    pub fn replicated_ids(&self, direction: Direction) -> Vec<String> {
        let mut ids: Vec<String> = self
            .documents
            .lock()
            .iter()
            .filter(|r| r.direction == direction && r.document.error.is_none())
            .map(|r| r.document.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Per-document errors, in order.
    pub fn document_errors(&self) -> Vec<(String, SyncError)> {
        self.documents
            .lock()
            .iter()
            .filter_map(|r| {
                r.document
                    .error
                    .clone()
                    .map(|err| (r.document.id.clone(), err))
            })
            .collect()
    }

    /// Events for documents carrying `flags`.
    pub fn flagged(&self, flags: DocumentFlags) -> Vec<RecordedDocument> {
        self.documents
            .lock()
            .iter()
            .filter(|r| r.document.flags.contains(flags))
            .cloned()
            .collect()
    }
}
