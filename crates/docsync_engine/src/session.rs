//! The session state machine.
//!
//! One session runs per `start` of a replicator, as a single Tokio task
//! that owns the checkpoints and the connection. It loops through
//! `Connecting -> Busy <-> Idle` per connection and through `Offline`
//! between attempts, until it completes (one-shot), is stopped, or hits a
//! permanent error.
//!
//! Control arrives as [`Command`]s on one queue; repeated signals are
//! coalesced before they take effect.

use crate::checkpoint::{checkpoint_id, CheckpointStore};
use crate::config::ReplicatorConfig;
use crate::conflict::{
    ConflictCoordinator, ConflictResolver, DefaultConflictResolver, ResolutionEvent,
    ResolutionOutcome,
};
use crate::error::{SyncError, SyncResult};
use crate::filter::{DocumentFlags, FilterPipeline, FilterVerdict};
use crate::pending::PendingTracker;
use crate::retry::{BackoffController, RetryDecision};
use crate::status::{
    ActivityLevel, Direction, DocumentReplication, ReplicatedDocument, StatusAggregator,
};
use crate::transport::{Connection, Connector};
use docsync_protocol::{Frame, Message, PushResult, PROTOCOL_VERSION};
use docsync_store::{ApplyOutcome, DocumentStore, RemoteRevision, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Control messages sent to a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Stop,
    Suspend(bool),
}

/// How one connection ended.
#[derive(Debug)]
enum ConnectionEnd {
    Completed,
    Stopped,
    Suspended,
    Failed(SyncError),
}

struct InFlightPush {
    request_id: u64,
    last_seq: u64,
    flags: HashMap<String, DocumentFlags>,
}

struct CollectionState {
    name: String,
    pipeline: FilterPipeline,
    checkpoint: CheckpointStore,
    resolver: Arc<dyn ConflictResolver>,
    in_flight: Option<InFlightPush>,
    push_caught_up: bool,
    pull_caught_up: bool,
}

impl CollectionState {
    fn reset_connection(&mut self) {
        self.in_flight = None;
        self.push_caught_up = false;
        self.pull_caught_up = false;
    }
}

/// Everything a session needs, handed over by the replicator.
pub(crate) struct SessionParts<C> {
    pub config: Arc<ReplicatorConfig>,
    pub store: Arc<dyn DocumentStore>,
    pub connector: Arc<C>,
    pub status: Arc<StatusAggregator>,
    pub pending: Arc<PendingTracker>,
    pub coordinator: ConflictCoordinator,
    pub resolutions: mpsc::UnboundedReceiver<ResolutionEvent>,
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub client_id: String,
    pub reset: bool,
    pub suspended: bool,
}

pub(crate) struct Session<C> {
    config: Arc<ReplicatorConfig>,
    store: Arc<dyn DocumentStore>,
    connector: Arc<C>,
    status: Arc<StatusAggregator>,
    pending: Arc<PendingTracker>,
    coordinator: ConflictCoordinator,
    resolutions: mpsc::UnboundedReceiver<ResolutionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    backoff: BackoffController,
    collections: Vec<CollectionState>,
    client_id: String,
    remote_key: String,
    reset: bool,
    suspended: bool,
    stopping: bool,
    next_request: u64,
    next_nonce: u64,
}

impl<C: Connector> Session<C> {
    /// Prepares a session, loading every collection's checkpoint.
    pub(crate) fn new(parts: SessionParts<C>) -> SyncResult<Self> {
        let SessionParts {
            config,
            store,
            connector,
            status,
            pending,
            coordinator,
            resolutions,
            commands,
            client_id,
            reset,
            suspended,
        } = parts;

        let mut collections = Vec::with_capacity(config.collections().len());
        for collection in config.collections() {
            let key = checkpoint_id(store.id(), collection, config.endpoint());
            let checkpoint =
                CheckpointStore::open(store.clone(), key, config.checkpoint_interval())?;
            let resolver = collection
                .conflict_resolver()
                .cloned()
                .unwrap_or_else(|| Arc::new(DefaultConflictResolver));
            collections.push(CollectionState {
                name: collection.name().to_string(),
                pipeline: FilterPipeline::new(collection),
                checkpoint,
                resolver,
                in_flight: None,
                push_caught_up: false,
                pull_caught_up: false,
            });
        }

        Ok(Self {
            backoff: BackoffController::new(config.retry_policy()),
            remote_key: config.endpoint().key(),
            config,
            store,
            connector,
            status,
            pending,
            coordinator,
            resolutions,
            commands,
            collections,
            client_id,
            reset,
            suspended,
            stopping: false,
            next_request: 1,
            next_nonce: 1,
        })
    }

    /// Runs until the session stops, then reports `Stopped`.
    pub(crate) async fn run(mut self) {
        info!(
            endpoint = %self.config.endpoint(),
            continuous = self.config.is_continuous(),
            reset = self.reset,
            "replicator started"
        );
        let final_error = self.run_attempts().await;

        self.coordinator.cancel_queued();
        self.coordinator.wait_idle().await;
        while let Ok(event) = self.resolutions.try_recv() {
            self.on_resolution(event);
        }
        self.save_checkpoints();

        match &final_error {
            Some(err) => error!(error = %err, "replicator stopped with error"),
            None => info!("replicator stopped"),
        }
        self.status.set_activity(ActivityLevel::Stopped, final_error);
    }

    async fn run_attempts(&mut self) -> Option<SyncError> {
        if self.reset {
            for collection in &mut self.collections {
                if let Err(err) = collection.checkpoint.reset() {
                    return Some(err);
                }
            }
            self.pending.invalidate();
        }

        loop {
            if self.suspended {
                self.status.set_activity(ActivityLevel::Offline, None);
                if !self.wait_resume().await {
                    return None;
                }
            }

            self.status.begin_attempt();
            self.status.set_activity(ActivityLevel::Connecting, None);
            let end = self.run_connection().await;
            for collection in &mut self.collections {
                collection.reset_connection();
            }
            self.save_checkpoints();

            match end {
                ConnectionEnd::Completed | ConnectionEnd::Stopped => return None,
                ConnectionEnd::Suspended => continue,
                ConnectionEnd::Failed(err) => match self.backoff.on_failure(&err) {
                    RetryDecision::GiveUp => {
                        warn!(
                            error = %err,
                            failures = self.backoff.failures(),
                            recoverable = err.is_recoverable(),
                            "giving up on connection"
                        );
                        return Some(err);
                    }
                    RetryDecision::Retry { attempt, delay } => {
                        info!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "connection failed; retrying"
                        );
                        self.status.set_activity(ActivityLevel::Offline, Some(err));
                        if !self.backoff_wait(delay).await {
                            return None;
                        }
                    }
                },
            }
        }
    }

    /// Waits while suspended. Returns false if stopped instead.
    async fn wait_resume(&mut self) -> bool {
        loop {
            tokio::select! {
                command = self.commands.recv() => match self.coalesce(command) {
                    Command::Stop => return false,
                    Command::Suspend(false) => {
                        self.set_suspended(false);
                        return true;
                    }
                    Command::Suspend(true) => {}
                },
                Some(event) = self.resolutions.recv() => self.on_resolution(event),
            }
        }
    }

    /// Sleeps before the next attempt. Returns false if stopped meanwhile.
    async fn backoff_wait(&mut self, delay: Duration) -> bool {
        let timer = sleep(delay);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => return true,
                command = self.commands.recv() => match self.coalesce(command) {
                    Command::Stop => return false,
                    Command::Suspend(true) => {
                        self.set_suspended(true);
                        return true;
                    }
                    Command::Suspend(false) => {}
                },
                Some(event) = self.resolutions.recv() => self.on_resolution(event),
            }
        }
    }

    /// Takes every queued command and returns the one that wins.
    fn coalesce(&mut self, first: Option<Command>) -> Command {
        let mut command = first.unwrap_or(Command::Stop);
        while let Ok(next) = self.commands.try_recv() {
            if command != Command::Stop {
                command = next;
            }
        }
        command
    }

    fn set_suspended(&mut self, suspended: bool) {
        if self.suspended != suspended {
            info!(suspended, "suspension changed");
        }
        self.suspended = suspended;
        self.coordinator.set_suspended(suspended);
    }

    async fn run_connection(&mut self) -> ConnectionEnd {
        let connect = self
            .connector
            .connect(self.config.endpoint(), self.config.connect_options());
        let conn = tokio::select! {
            result = connect => match result {
                Ok(conn) => conn,
                Err(err) => return ConnectionEnd::Failed(err),
            },
            command = self.commands.recv() => {
                return match self.coalesce(command) {
                    Command::Stop => ConnectionEnd::Stopped,
                    Command::Suspend(true) => {
                        self.set_suspended(true);
                        ConnectionEnd::Suspended
                    }
                    // Nothing to resume; reconnect right away.
                    Command::Suspend(false) => ConnectionEnd::Suspended,
                };
            }
        };

        let end = match self.handshake(&conn).await {
            Ok(None) => self.drive(&conn).await,
            Ok(Some(end)) => end,
            Err(err) => ConnectionEnd::Failed(err),
        };
        if matches!(end, ConnectionEnd::Completed | ConnectionEnd::Stopped) {
            let _ = send(&conn, Message::Close).await;
        }
        conn.close().await;
        debug!(end = ?end, "connection closed");
        end
    }

    /// Exchanges hello messages. `Some` if a command ended the attempt.
    async fn handshake(&mut self, conn: &C::Conn) -> SyncResult<Option<ConnectionEnd>> {
        let collections = self.collections.iter().map(|c| c.name.clone()).collect();
        send(
            conn,
            Message::Hello {
                version: PROTOCOL_VERSION,
                client_id: self.client_id.clone(),
                collections,
            },
        )
        .await?;

        let deadline = sleep(self.config.heartbeat());
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                frame = conn.recv() => {
                    let Some(frame) = frame? else {
                        return Err(SyncError::ConnectionClosed);
                    };
                    match frame.decode()? {
                        Message::HelloAck { version, .. } if version == PROTOCOL_VERSION => break,
                        Message::HelloAck { version, .. } => {
                            return Err(SyncError::from_peer(
                                docsync_protocol::ErrorCode::VersionMismatch,
                                format!("peer speaks protocol version {version}"),
                            ));
                        }
                        Message::Error { code, message } => {
                            return Err(SyncError::from_peer(code, message));
                        }
                        other => debug!(kind = other.kind(), "ignoring message before handshake"),
                    }
                }
                _ = &mut deadline => return Err(SyncError::Timeout),
                command = self.commands.recv() => match self.coalesce(command) {
                    Command::Stop => return Ok(Some(ConnectionEnd::Stopped)),
                    Command::Suspend(true) => {
                        self.set_suspended(true);
                        return Ok(Some(ConnectionEnd::Suspended));
                    }
                    Command::Suspend(false) => {}
                },
            }
        }

        info!(endpoint = %self.config.endpoint(), "connected");
        self.backoff.reset();
        self.set_suspended(false);
        self.status.set_activity(ActivityLevel::Busy, None);
        Ok(None)
    }

    async fn drive(&mut self, conn: &C::Conn) -> ConnectionEnd {
        if let Err(err) = self.open_streams(conn).await {
            return ConnectionEnd::Failed(err);
        }
        match self.settle(conn).await {
            Ok(true) => return ConnectionEnd::Completed,
            Ok(false) => {}
            Err(err) => return ConnectionEnd::Failed(err),
        }

        let mut store_rx = self.store.subscribe();
        let mut store_open = true;
        let mut pending_rx = self.coordinator.watch_pending();
        let heartbeat = self.config.heartbeat();
        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_pong: Option<u64> = None;

        loop {
            let step: SyncResult<Option<ConnectionEnd>> = tokio::select! {
                // A closed queue reads as `Stop` forever; stop polling it
                // once stopping.
                command = self.commands.recv(), if !self.stopping => {
                    match self.coalesce(command) {
                        Command::Stop => {
                            info!("stop requested");
                            self.stopping = true;
                            Ok(self.stopped_if_drained())
                        }
                        Command::Suspend(true) => {
                            self.set_suspended(true);
                            Ok(Some(ConnectionEnd::Suspended))
                        }
                        Command::Suspend(false) => Ok(None),
                    }
                }
                frame = conn.recv() => match frame {
                    Ok(Some(frame)) => match frame.decode() {
                        Ok(message) => {
                            if let Message::Pong { nonce } = message {
                                if awaiting_pong == Some(nonce) {
                                    awaiting_pong = None;
                                }
                                Ok(None)
                            } else {
                                self.on_message(conn, message).await
                            }
                        }
                        Err(err) => Err(err.into()),
                    },
                    Ok(None) => Err(SyncError::ConnectionClosed),
                    Err(err) => Err(err),
                },
                changed = store_rx.changed(), if store_open => {
                    if changed.is_err() {
                        store_open = false;
                    }
                    self.pending.invalidate();
                    Ok(None)
                }
                Some(event) = self.resolutions.recv() => {
                    self.on_resolution(event);
                    Ok(None)
                }
                _ = pending_rx.changed() => Ok(None),
                _ = ticker.tick() => {
                    if awaiting_pong.is_some() {
                        warn!("peer did not answer heartbeat");
                        Err(SyncError::Timeout)
                    } else {
                        let nonce = self.next_nonce;
                        self.next_nonce += 1;
                        awaiting_pong = Some(nonce);
                        send(conn, Message::Ping { nonce }).await.map(|_| None)
                    }
                }
            };

            match step {
                Ok(Some(end)) => return end,
                Ok(None) => {}
                Err(_) if self.stopping => return ConnectionEnd::Stopped,
                Err(err) => return ConnectionEnd::Failed(err),
            }

            if self.stopping {
                continue;
            }
            match self.settle(conn).await {
                Ok(true) => return ConnectionEnd::Completed,
                Ok(false) => {}
                Err(err) => return ConnectionEnd::Failed(err),
            }
        }
    }

    /// Subscribes to the peer's changes and re-dispatches leftover conflicts.
    async fn open_streams(&mut self, conn: &C::Conn) -> SyncResult<()> {
        let replicator_type = self.config.replicator_type();
        for collection in &self.collections {
            let conflicted = self.store.conflicted_ids(&collection.name)?;
            for doc_id in conflicted {
                self.coordinator
                    .dispatch(&collection.name, &doc_id, collection.resolver.clone());
            }
            if replicator_type.is_pull() {
                let since = collection.checkpoint.checkpoint().pull;
                debug!(collection = %collection.name, since, "subscribing");
                send(
                    conn,
                    Message::Subscribe {
                        collection: collection.name.clone(),
                        since,
                        continuous: self.config.is_continuous(),
                        doc_ids: collection.pipeline.doc_ids(),
                        batch_size: self.config.batch_size(),
                    },
                )
                .await?;
            }
        }
        Ok(())
    }

    fn stopped_if_drained(&self) -> Option<ConnectionEnd> {
        if self.collections.iter().all(|c| c.in_flight.is_none()) {
            Some(ConnectionEnd::Stopped)
        } else {
            debug!("waiting for in-flight pushes before stopping");
            None
        }
    }

    /// Pushes whatever is ready and decides between busy, idle and done.
    /// Returns true when a one-shot session has nothing left to do.
    async fn settle(&mut self, conn: &C::Conn) -> SyncResult<bool> {
        // Read before scanning: a resolution that commits mid-scan must not
        // let the session finish without pushing its result.
        let resolving = self.coordinator.pending_count() > 0;
        if self.config.replicator_type().is_push() {
            for idx in 0..self.collections.len() {
                if self.collections[idx].in_flight.is_some() {
                    continue;
                }
                if let Some(message) = self.scan_push(idx)? {
                    send(conn, message).await?;
                }
            }
        }

        let replicator_type = self.config.replicator_type();
        let transfers_done = self.collections.iter().all(|c| {
            (!replicator_type.is_push() || (c.in_flight.is_none() && c.push_caught_up))
                && (!replicator_type.is_pull() || c.pull_caught_up)
        });
        if transfers_done && !resolving {
            self.save_checkpoints();
            if !self.config.is_continuous() {
                info!("one-shot replication complete");
                return Ok(true);
            }
            self.status.set_activity(ActivityLevel::Idle, None);
        } else {
            self.status.set_activity(ActivityLevel::Busy, None);
        }
        Ok(false)
    }

    /// Builds the next push batch for a collection, skipping pages with
    /// nothing to send.
    fn scan_push(&mut self, idx: usize) -> SyncResult<Option<Message>> {
        let batch_size = self.config.batch_size() as usize;
        loop {
            let state = &self.collections[idx];
            let since = state.checkpoint.checkpoint().push;
            let changes = self.store.changes_since(&state.name, since, batch_size)?;
            let Some(last) = changes.last() else {
                self.collections[idx].push_caught_up = true;
                return Ok(None);
            };
            let page_last = last.sequence;

            let mut revs = Vec::new();
            let mut flags = HashMap::new();
            let mut failures = Vec::new();
            for change in changes {
                if change.conflicted || !state.pipeline.allows_id(&change.doc_id) {
                    continue;
                }
                let known =
                    self.store
                        .remote_revision(&state.name, &change.doc_id, &self.remote_key)?;
                if known.as_ref() == Some(&change.revision) {
                    continue;
                }
                let Some(rev) = self.store.export_revision(&state.name, &change.doc_id)? else {
                    continue;
                };
                let doc_flags = DocumentFlags::from_state(rev.deleted, false);
                let doc = rev.to_document().into_sealed();
                match state.pipeline.check_push(&doc, doc_flags) {
                    FilterVerdict::Accept => {
                        flags.insert(rev.doc_id.clone(), doc_flags);
                        revs.push(rev);
                    }
                    FilterVerdict::Reject => {}
                    FilterVerdict::Failed(err) => failures.push(ReplicatedDocument {
                        collection: state.name.clone(),
                        id: change.doc_id,
                        flags: doc_flags,
                        error: Some(err),
                    }),
                }
            }
            let name = state.name.clone();
            self.status.post_documents(DocumentReplication {
                direction: Direction::Push,
                documents: failures,
            });

            let state = &mut self.collections[idx];
            if revs.is_empty() {
                state.checkpoint.advance_push(page_last);
                continue;
            }

            let request_id = self.next_request;
            self.next_request += 1;
            debug!(collection = %name, request_id, count = revs.len(), "pushing revisions");
            self.status.add_total(revs.len() as u64);
            state.push_caught_up = false;
            state.in_flight = Some(InFlightPush {
                request_id,
                last_seq: page_last,
                flags,
            });
            return Ok(Some(Message::PushRevs {
                request_id,
                collection: name,
                revs,
            }));
        }
    }

    async fn on_message(
        &mut self,
        conn: &C::Conn,
        message: Message,
    ) -> SyncResult<Option<ConnectionEnd>> {
        match message {
            Message::Changes {
                collection,
                revs,
                last_seq,
                caught_up,
            } => {
                if self.stopping {
                    debug!(collection = %collection, count = revs.len(), "stopping; changes ignored");
                    return Ok(None);
                }
                self.on_changes(&collection, revs, last_seq, caught_up)?;
                Ok(None)
            }
            Message::PushAck {
                request_id,
                results,
            } => {
                self.on_push_ack(request_id, results)?;
                if self.stopping {
                    return Ok(self.stopped_if_drained());
                }
                Ok(None)
            }
            Message::Ping { nonce } => {
                send(conn, Message::Pong { nonce }).await?;
                Ok(None)
            }
            Message::Error { code, message } => Err(SyncError::from_peer(code, message)),
            Message::Close => Err(SyncError::ConnectionClosed),
            other => {
                debug!(kind = other.kind(), "ignoring message");
                Ok(None)
            }
        }
    }

    fn collection_index(&self, name: &str) -> SyncResult<usize> {
        self.collections
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| SyncError::Protocol(format!("unexpected collection '{name}'")))
    }

    fn on_changes(
        &mut self,
        collection: &str,
        revs: Vec<RemoteRevision>,
        last_seq: u64,
        caught_up: bool,
    ) -> SyncResult<()> {
        let idx = self.collection_index(collection)?;
        let count = revs.len() as u64;
        self.status.add_total(count);

        let mut documents = Vec::new();
        for rev in revs {
            if let Some(document) = self.pull_revision(idx, rev)? {
                documents.push(document);
            }
        }

        self.status.add_completed(count);
        let state = &mut self.collections[idx];
        state.checkpoint.advance_pull(last_seq);
        state.pull_caught_up = caught_up;
        if let Err(err) = state.checkpoint.save_if_due() {
            warn!(collection, error = %err, "failed to save checkpoint");
        }
        debug!(collection, count, last_seq, caught_up, "changes applied");
        self.status.post_documents(DocumentReplication {
            direction: Direction::Pull,
            documents,
        });
        Ok(())
    }

    /// Applies one pulled revision. Returns the event to report, if any.
    fn pull_revision(
        &mut self,
        idx: usize,
        rev: RemoteRevision,
    ) -> SyncResult<Option<ReplicatedDocument>> {
        let state = &self.collections[idx];
        let name = state.name.as_str();
        let flags = DocumentFlags::from_state(rev.deleted, rev.access_removed);
        let event = |error: Option<SyncError>| ReplicatedDocument {
            collection: name.to_string(),
            id: rev.doc_id.clone(),
            flags,
            error,
        };

        if !state.pipeline.allows_id(&rev.doc_id) {
            return Ok(None);
        }
        if rev.access_removed && !self.config.auto_purge() {
            debug!(collection = name, doc_id = %rev.doc_id, "access removed; keeping local copy");
            return Ok(None);
        }

        match state.pipeline.check_pull(&rev.to_document().into_sealed(), flags) {
            FilterVerdict::Accept => {}
            FilterVerdict::Reject => return Ok(None),
            FilterVerdict::Failed(err) => return Ok(Some(event(Some(err)))),
        }

        if rev.access_removed {
            match self.store.purge(name, &rev.doc_id) {
                Ok(()) => info!(collection = name, doc_id = %rev.doc_id, "access removed; document purged"),
                Err(err) if err.is_not_found() => {}
                Err(StoreError::Closed) => return Err(SyncError::DatabaseClosed),
                Err(err) => return Ok(Some(event(Some(err.into())))),
            }
            return Ok(Some(event(None)));
        }

        let outcome = match self.store.apply_remote(name, &rev, true) {
            Ok(outcome) => outcome,
            Err(StoreError::Closed) => return Err(SyncError::DatabaseClosed),
            Err(err) => {
                warn!(collection = name, doc_id = %rev.doc_id, error = %err, "failed to apply pulled revision");
                return Ok(Some(event(Some(err.into()))));
            }
        };
        self.store
            .set_remote_revision(name, &rev.doc_id, &self.remote_key, &rev.revision)?;

        match outcome {
            ApplyOutcome::Inserted | ApplyOutcome::FastForwarded => Ok(Some(event(None))),
            ApplyOutcome::AlreadyKnown => Ok(None),
            ApplyOutcome::Conflicted => {
                info!(collection = name, doc_id = %rev.doc_id, rev = %rev.revision, "conflict detected");
                self.coordinator
                    .dispatch(name, &rev.doc_id, state.resolver.clone());
                Ok(None)
            }
        }
    }

    fn on_push_ack(&mut self, request_id: u64, results: Vec<PushResult>) -> SyncResult<()> {
        let Some(idx) = self.collections.iter().position(|c| {
            c.in_flight
                .as_ref()
                .map(|f| f.request_id == request_id)
                .unwrap_or(false)
        }) else {
            return Err(SyncError::Protocol(format!(
                "acknowledgment for unknown request {request_id}"
            )));
        };
        let state = &mut self.collections[idx];
        let Some(in_flight) = state.in_flight.take() else {
            return Ok(());
        };

        let mut documents = Vec::with_capacity(results.len());
        for result in &results {
            let flags = in_flight
                .flags
                .get(&result.doc_id)
                .copied()
                .unwrap_or(DocumentFlags::NONE);
            let error = match &result.error {
                None => {
                    match self.store.set_remote_revision(
                        &state.name,
                        &result.doc_id,
                        &self.remote_key,
                        &result.revision,
                    ) {
                        Ok(()) => {}
                        Err(StoreError::Closed) => return Err(SyncError::DatabaseClosed),
                        Err(err) => {
                            debug!(collection = %state.name, doc_id = %result.doc_id, error = %err, "pushed document vanished locally");
                        }
                    }
                    state.checkpoint.clear_rejected(&result.doc_id);
                    None
                }
                Some(rejection) => {
                    warn!(collection = %state.name, doc_id = %result.doc_id, code = ?rejection.code, "push rejected");
                    state.checkpoint.mark_rejected(&result.doc_id);
                    Some(SyncError::PushRejected {
                        doc_id: result.doc_id.clone(),
                        code: rejection.code,
                        message: rejection.message.clone(),
                    })
                }
            };
            documents.push(ReplicatedDocument {
                collection: state.name.clone(),
                id: result.doc_id.clone(),
                flags,
                error,
            });
        }

        state.checkpoint.advance_push(in_flight.last_seq);
        if let Err(err) = state.checkpoint.save_if_due() {
            warn!(collection = %state.name, error = %err, "failed to save checkpoint");
        }
        debug!(collection = %state.name, request_id, count = results.len(), "push acknowledged");
        self.status.add_completed(results.len() as u64);
        self.pending.invalidate();
        self.status.post_documents(DocumentReplication {
            direction: Direction::Push,
            documents,
        });
        Ok(())
    }

    fn on_resolution(&mut self, event: ResolutionEvent) {
        let (flags, error) = match event.outcome {
            ResolutionOutcome::Resolved(doc) => {
                (DocumentFlags::from_state(doc.is_deleted(), false), None)
            }
            ResolutionOutcome::Failed(err) => (DocumentFlags::NONE, Some(err)),
            ResolutionOutcome::NothingToResolve => return,
        };
        self.pending.invalidate();
        self.status.post_documents(DocumentReplication {
            direction: Direction::Pull,
            documents: vec![ReplicatedDocument {
                collection: event.collection,
                id: event.doc_id,
                flags,
                error,
            }],
        });
    }

    fn save_checkpoints(&mut self) {
        for collection in &mut self.collections {
            if let Err(err) = collection.checkpoint.save() {
                warn!(collection = %collection.name, error = %err, "failed to save checkpoint");
            }
        }
    }
}

async fn send<T: Connection>(conn: &T, message: Message) -> SyncResult<()> {
    conn.send(Frame::encode(&message)?).await
}
