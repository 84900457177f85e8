//! The passive (listener) side of a replication session.
//!
//! [`PassivePeer`] serves one connection against a local store. Accepting
//! sockets and authenticating clients happen before it is created; it only
//! receives the resulting collection allowlist.

use crate::error::{SyncError, SyncResult};
use crate::transport::Connection;
use docsync_protocol::{
    ErrorCode, Frame, Message, PushResult, RevisionErrorCode, PROTOCOL_VERSION,
};
use docsync_store::{DocumentStore, Properties, RemoteRevision, RevisionId, StoreError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

type AccessCheck = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Settings of the passive side.
#[derive(Clone, Default)]
pub struct PassiveOptions {
    allowed_collections: Option<Vec<String>>,
    read_only: bool,
    access: Option<AccessCheck>,
}

impl PassiveOptions {
    /// Restricts the collections a client may replicate.
    pub fn with_allowed_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_collections = Some(collections.into_iter().map(Into::into).collect());
        self
    }

    /// Rejects pushes.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Decides, per `(collection, doc_id)`, whether the client may still
    /// read a document. Revisions of documents it may not are sent with
    /// the access-removed flag and no body.
    pub fn with_access_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        self.access = Some(Arc::new(check));
        self
    }

    /// Returns true if pushes are rejected.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn allows(&self, collection: &str) -> bool {
        self.allowed_collections
            .as_ref()
            .map(|allowed| allowed.iter().any(|c| c == collection))
            .unwrap_or(true)
    }
}

impl fmt::Debug for PassiveOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassiveOptions")
            .field("allowed_collections", &self.allowed_collections)
            .field("read_only", &self.read_only)
            .field("access_check", &self.access.is_some())
            .finish()
    }
}

struct Subscription {
    since: u64,
    continuous: bool,
    doc_ids: Option<HashSet<String>>,
    batch_size: usize,
    caught_up: bool,
}

/// Serves one replication connection.
pub struct PassivePeer {
    store: Arc<dyn DocumentStore>,
    options: PassiveOptions,
    collections: Vec<String>,
    subscriptions: BTreeMap<String, Subscription>,
    /// Revisions received from the client, not echoed back to it.
    received: HashMap<(String, String), RevisionId>,
}

enum Flow {
    Continue,
    End,
}

impl PassivePeer {
    /// Creates a peer for `store`.
    pub fn new(store: Arc<dyn DocumentStore>, options: PassiveOptions) -> Self {
        Self {
            store,
            options,
            collections: Vec::new(),
            subscriptions: BTreeMap::new(),
            received: HashMap::new(),
        }
    }

    /// Runs the session until the client closes or an error ends it.
    pub async fn serve<C: Connection>(mut self, conn: C) -> SyncResult<()> {
        let mut store_rx = self.store.subscribe();
        let result = self.serve_inner(&conn, &mut store_rx).await;
        conn.close().await;
        result
    }

    async fn serve_inner<C: Connection>(
        &mut self,
        conn: &C,
        store_rx: &mut tokio::sync::watch::Receiver<u64>,
    ) -> SyncResult<()> {
        let mut store_open = true;
        loop {
            if let Err(err) = self.pump(conn).await {
                if let SyncError::DatabaseClosed = err {
                    send(conn, Message::error(ErrorCode::Unavailable, "database closed")).await?;
                }
                return Err(err);
            }
            let watching = store_open && self.subscriptions.values().any(|s| s.continuous);
            tokio::select! {
                frame = conn.recv() => {
                    let Some(frame) = frame? else {
                        debug!("client disconnected");
                        return Ok(());
                    };
                    if let Flow::End = self.handle(conn, frame.decode()?).await? {
                        return Ok(());
                    }
                }
                changed = store_rx.changed(), if watching => {
                    if changed.is_err() {
                        store_open = false;
                    }
                }
            }
        }
    }

    async fn handle<C: Connection>(&mut self, conn: &C, message: Message) -> SyncResult<Flow> {
        match message {
            Message::Hello {
                version,
                client_id,
                collections,
            } => {
                if version != PROTOCOL_VERSION {
                    let reply = Message::error(
                        ErrorCode::VersionMismatch,
                        format!("protocol version {version} not supported"),
                    );
                    send(conn, reply).await?;
                    return Ok(Flow::End);
                }
                if let Some(denied) = collections.iter().find(|c| !self.options.allows(c)) {
                    let reply = Message::error(
                        ErrorCode::Forbidden,
                        format!("collection '{denied}' is not accessible"),
                    );
                    send(conn, reply).await?;
                    return Ok(Flow::End);
                }
                info!(client_id = %client_id, collections = ?collections, "client connected");
                self.collections = collections.clone();
                send(
                    conn,
                    Message::HelloAck {
                        version: PROTOCOL_VERSION,
                        collections,
                    },
                )
                .await?;
            }
            Message::Subscribe {
                collection,
                since,
                continuous,
                doc_ids,
                batch_size,
            } => {
                if !self.collections.contains(&collection) {
                    let reply = Message::error(
                        ErrorCode::UnknownCollection,
                        format!("collection '{collection}' was not negotiated"),
                    );
                    send(conn, reply).await?;
                    return Ok(Flow::End);
                }
                debug!(collection = %collection, since, continuous, "subscription opened");
                self.subscriptions.insert(
                    collection,
                    Subscription {
                        since,
                        continuous,
                        doc_ids: doc_ids.map(|ids| ids.into_iter().collect()),
                        batch_size: batch_size.max(1) as usize,
                        caught_up: false,
                    },
                );
            }
            Message::PushRevs {
                request_id,
                collection,
                revs,
            } => {
                if self.options.read_only {
                    send(conn, Message::error(ErrorCode::ReadOnly, "database is read-only"))
                        .await?;
                    return Ok(Flow::End);
                }
                if !self.collections.contains(&collection) {
                    let reply = Message::error(
                        ErrorCode::UnknownCollection,
                        format!("collection '{collection}' was not negotiated"),
                    );
                    send(conn, reply).await?;
                    return Ok(Flow::End);
                }
                let results = self.apply_push(&collection, revs)?;
                send(conn, Message::PushAck { request_id, results }).await?;
            }
            Message::Ping { nonce } => send(conn, Message::Pong { nonce }).await?,
            Message::Close => {
                debug!("client closed the session");
                return Ok(Flow::End);
            }
            other => debug!(kind = other.kind(), "ignoring message"),
        }
        Ok(Flow::Continue)
    }

    fn apply_push(
        &mut self,
        collection: &str,
        revs: Vec<RemoteRevision>,
    ) -> SyncResult<Vec<PushResult>> {
        let mut results = Vec::with_capacity(revs.len());
        for rev in revs {
            match self.store.apply_remote(collection, &rev, false) {
                Ok(outcome) => {
                    debug!(collection, doc_id = %rev.doc_id, rev = %rev.revision, ?outcome, "revision received");
                    self.received.insert(
                        (collection.to_string(), rev.doc_id.clone()),
                        rev.revision.clone(),
                    );
                    results.push(PushResult::accepted(rev.doc_id, rev.revision));
                }
                Err(StoreError::Conflict { .. }) => {
                    results.push(PushResult::rejected(
                        rev.doc_id,
                        rev.revision,
                        RevisionErrorCode::Conflict,
                        "document update conflict",
                    ));
                }
                Err(StoreError::Closed) => return Err(SyncError::DatabaseClosed),
                Err(err) => {
                    warn!(collection, doc_id = %rev.doc_id, error = %err, "failed to apply pushed revision");
                    results.push(PushResult::rejected(
                        rev.doc_id,
                        rev.revision,
                        RevisionErrorCode::Internal,
                        err.to_string(),
                    ));
                }
            }
        }
        Ok(results)
    }

    /// Sends every change the subscriptions have not seen yet.
    async fn pump<C: Connection>(&mut self, conn: &C) -> SyncResult<()> {
        let names: Vec<String> = self.subscriptions.keys().cloned().collect();
        for collection in names {
            loop {
                let Some(sub) = self.subscriptions.get(&collection) else {
                    break;
                };
                let (since, batch_size) = (sub.since, sub.batch_size);
                let changes = self.store.changes_since(&collection, since, batch_size)?;
                if changes.is_empty() && sub.caught_up {
                    break;
                }
                let last_seq = changes.last().map(|c| c.sequence).unwrap_or(since);
                let caught_up = changes.len() < batch_size;

                let mut revs = Vec::with_capacity(changes.len());
                for change in &changes {
                    if let Some(rev) = self.outgoing(&collection, sub, &change.doc_id, &change.revision)? {
                        revs.push(rev);
                    }
                }
                debug!(collection = %collection, count = revs.len(), last_seq, caught_up, "sending changes");
                send(
                    conn,
                    Message::Changes {
                        collection: collection.clone(),
                        revs,
                        last_seq,
                        caught_up,
                    },
                )
                .await?;

                let Some(sub) = self.subscriptions.get_mut(&collection) else {
                    break;
                };
                sub.since = last_seq;
                sub.caught_up = caught_up;
                if caught_up {
                    if !sub.continuous {
                        self.subscriptions.remove(&collection);
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    fn outgoing(
        &self,
        collection: &str,
        sub: &Subscription,
        doc_id: &str,
        revision: &RevisionId,
    ) -> SyncResult<Option<RemoteRevision>> {
        if let Some(ids) = &sub.doc_ids {
            if !ids.contains(doc_id) {
                return Ok(None);
            }
        }
        let key = (collection.to_string(), doc_id.to_string());
        if self.received.get(&key) == Some(revision) {
            return Ok(None);
        }
        let Some(mut rev) = self.store.export_revision(collection, doc_id)? else {
            return Ok(None);
        };
        if let Some(check) = &self.options.access {
            if !check(collection, doc_id) {
                rev.access_removed = true;
                rev.properties = Properties::new();
                rev.attachments.clear();
            }
        }
        Ok(Some(rev))
    }
}

impl fmt::Debug for PassivePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassivePeer")
            .field("store", &self.store.name())
            .field("options", &self.options)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

async fn send<C: Connection>(conn: &C, message: Message) -> SyncResult<()> {
    conn.send(Frame::encode(&message)?).await
}
