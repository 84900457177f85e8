//! Push and pull filters.
//!
//! A filter is a named predicate over a read-only document snapshot and
//! its [`DocumentFlags`]. The name takes part in the checkpoint key, so
//! swapping a filter for a differently named one starts replication over.

use crate::config::CollectionConfig;
use crate::error::SyncError;
use docsync_store::Document;
use std::collections::HashSet;
use std::fmt;
use std::ops::BitOr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Flags describing a replicated revision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DocumentFlags(u8);

impl DocumentFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// The revision is a deletion.
    pub const DELETED: Self = Self(1);
    /// The peer revoked access to the document.
    pub const ACCESS_REMOVED: Self = Self(2);

    /// Returns true if every flag in `other` is set.
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if no flag is set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Flags for a revision with the given state.
    pub fn from_state(deleted: bool, access_removed: bool) -> Self {
        let mut flags = Self::NONE;
        if deleted {
            flags = flags | Self::DELETED;
        }
        if access_removed {
            flags = flags | Self::ACCESS_REMOVED;
        }
        flags
    }
}

impl BitOr for DocumentFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

type FilterFn = dyn Fn(&Document, DocumentFlags) -> bool + Send + Sync;

/// A named replication filter.
#[derive(Clone)]
pub struct ReplicationFilter {
    name: String,
    func: Arc<FilterFn>,
}

impl ReplicationFilter {
    /// Creates a filter. Return `true` to let the document through.
    ///
    /// The name identifies the filter in the checkpoint key; the predicate
    /// does not. Give a filter whose logic changed a new name, otherwise
    /// the old checkpoint is reused and documents it already skipped are
    /// never looked at again.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Document, DocumentFlags) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Filter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the predicate, turning a panic into an error.
    pub fn evaluate(&self, doc: &Document, flags: DocumentFlags) -> Result<bool, SyncError> {
        catch_unwind(AssertUnwindSafe(|| (self.func)(doc, flags))).map_err(|panic| {
            SyncError::UnexpectedError {
                doc_id: doc.id().to_string(),
                message: panic_message(&*panic),
            }
        })
    }
}

impl fmt::Debug for ReplicationFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationFilter")
            .field("name", &self.name)
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}

/// Result of running a candidate through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterVerdict {
    /// Transfer the revision.
    Accept,
    /// Skip the revision silently.
    Reject,
    /// The filter failed; skip the revision and report the error.
    Failed(SyncError),
}

impl FilterVerdict {
    /// Returns true for [`FilterVerdict::Accept`].
    pub fn is_accept(&self) -> bool {
        matches!(self, FilterVerdict::Accept)
    }
}

/// Per-collection admission checks for both directions.
#[derive(Debug, Clone)]
pub struct FilterPipeline {
    collection: String,
    doc_ids: Option<HashSet<String>>,
    push: Option<ReplicationFilter>,
    pull: Option<ReplicationFilter>,
}

impl FilterPipeline {
    /// Builds the pipeline for a collection.
    pub fn new(config: &CollectionConfig) -> Self {
        Self {
            collection: config.name().to_string(),
            doc_ids: config
                .document_ids()
                .map(|ids| ids.iter().cloned().collect()),
            push: config.push_filter().cloned(),
            pull: config.pull_filter().cloned(),
        }
    }

    /// Returns true if the document ID passes the allowlist.
    pub fn allows_id(&self, doc_id: &str) -> bool {
        self.doc_ids
            .as_ref()
            .map(|ids| ids.contains(doc_id))
            .unwrap_or(true)
    }

    /// The allowlist, sorted.
    pub fn doc_ids(&self) -> Option<Vec<String>> {
        self.doc_ids.as_ref().map(|ids| {
            let mut ids: Vec<String> = ids.iter().cloned().collect();
            ids.sort();
            ids
        })
    }

    /// Checks an outgoing revision.
    pub fn check_push(&self, doc: &Document, flags: DocumentFlags) -> FilterVerdict {
        self.check(self.push.as_ref(), doc, flags, "push")
    }

    /// Checks an incoming revision before it is stored.
    pub fn check_pull(&self, doc: &Document, flags: DocumentFlags) -> FilterVerdict {
        self.check(self.pull.as_ref(), doc, flags, "pull")
    }

    fn check(
        &self,
        filter: Option<&ReplicationFilter>,
        doc: &Document,
        flags: DocumentFlags,
        direction: &str,
    ) -> FilterVerdict {
        if !self.allows_id(doc.id()) {
            return FilterVerdict::Reject;
        }
        let Some(filter) = filter else {
            return FilterVerdict::Accept;
        };
        match filter.evaluate(doc, flags) {
            Ok(true) => FilterVerdict::Accept,
            Ok(false) => {
                debug!(collection = %self.collection, doc_id = doc.id(), direction, filter = filter.name(), "document rejected by filter");
                FilterVerdict::Reject
            }
            Err(err) => {
                warn!(collection = %self.collection, doc_id = doc.id(), direction, error = %err, "filter failed");
                FilterVerdict::Failed(err)
            }
        }
    }
}
