//! The replicator handle.

use crate::config::ReplicatorConfig;
use crate::conflict::ConflictCoordinator;
use crate::error::{SyncError, SyncResult};
use crate::pending::PendingTracker;
use crate::session::{Command, Session, SessionParts};
use crate::status::{
    ActivityLevel, DocumentReplication, ListenerToken, ReplicatorStatus, StatusAggregator,
};
use crate::transport::Connector;
use docsync_store::DocumentStore;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Default)]
struct Control {
    commands: Option<mpsc::UnboundedSender<Command>>,
    coordinator: Option<ConflictCoordinator>,
    task: Option<JoinHandle<()>>,
    suspended: bool,
    stop_requested: bool,
}

impl Control {
    fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

/// Replicates a local store with one peer.
///
/// The configuration is frozen at construction. Each [`start`](Self::start)
/// runs one session on the current Tokio runtime; status and per-document
/// results are reported through listeners and [`status_watch`](Self::status_watch).
///
/// # Example
///
/// ```rust,ignore
/// let config = ReplicatorConfig::builder(Endpoint::database(&*target))
///     .add_collection(CollectionConfig::new("tasks"))?
///     .build()?;
/// let replicator = Replicator::new(config, local, LocalConnector::new(target))?;
/// replicator.start(false)?;
/// let status = replicator.wait_until_stopped().await;
/// ```
pub struct Replicator<C: Connector> {
    config: Arc<ReplicatorConfig>,
    store: Arc<dyn DocumentStore>,
    connector: Arc<C>,
    status: Arc<StatusAggregator>,
    pending: Arc<PendingTracker>,
    client_id: String,
    control: Mutex<Control>,
}

impl<C: Connector> Replicator<C> {
    /// Creates a replicator. Fails if the store is closed.
    pub fn new(
        config: ReplicatorConfig,
        store: Arc<dyn DocumentStore>,
        connector: C,
    ) -> SyncResult<Self> {
        if !store.is_open() {
            return Err(SyncError::DatabaseClosed);
        }
        let config = Arc::new(config);
        Ok(Self {
            pending: Arc::new(PendingTracker::new(store.clone(), config.clone())),
            config,
            store,
            connector: Arc::new(connector),
            status: Arc::new(StatusAggregator::new()),
            client_id: uuid::Uuid::new_v4().to_string(),
            control: Mutex::new(Control::default()),
        })
    }

    /// The frozen configuration.
    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    /// Starts a session. With `reset`, checkpoints are discarded first so
    /// both sides are scanned from the beginning.
    ///
    /// Starting a running replicator does nothing; starting one that is
    /// still stopping is an error. Must be called within a Tokio runtime.
    pub fn start(&self, reset: bool) -> SyncResult<()> {
        let mut control = self.control.lock();
        // The task reports `Stopped` as its last step.
        let active = control.is_running()
            && self.status.status().activity != ActivityLevel::Stopped;
        if active {
            if control.stop_requested {
                return Err(SyncError::InvalidOperation(
                    "replicator is stopping".into(),
                ));
            }
            debug!("replicator already running");
            return Ok(());
        }
        if !self.store.is_open() {
            return Err(SyncError::DatabaseClosed);
        }
        let runtime = Handle::try_current().map_err(|_| {
            SyncError::InvalidOperation("replicator must be started within a Tokio runtime".into())
        })?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (resolution_tx, resolution_rx) = mpsc::unbounded_channel();
        let coordinator = ConflictCoordinator::new(
            self.store.clone(),
            self.config.endpoint().key(),
            self.config.conflict_pool_size(),
            resolution_tx,
        );
        coordinator.set_suspended(control.suspended);

        let session = Session::new(SessionParts {
            config: self.config.clone(),
            store: self.store.clone(),
            connector: self.connector.clone(),
            status: self.status.clone(),
            pending: self.pending.clone(),
            coordinator: coordinator.clone(),
            resolutions: resolution_rx,
            commands: command_rx,
            client_id: self.client_id.clone(),
            reset,
            suspended: control.suspended,
        })?;

        self.status.set_activity(ActivityLevel::Connecting, None);
        control.task = Some(runtime.spawn(session.run()));
        control.commands = Some(command_tx);
        control.coordinator = Some(coordinator);
        control.stop_requested = false;
        info!(client_id = %self.client_id, reset, "replicator starting");
        Ok(())
    }

    /// Requests a graceful stop. Safe to call in any state.
    ///
    /// In-flight pushes and running conflict resolutions finish first; the
    /// status becomes `Stopped` once the connection is torn down.
    pub fn stop(&self) {
        let mut control = self.control.lock();
        if !control.is_running() {
            return;
        }
        if let Some(commands) = &control.commands {
            if commands.send(Command::Stop).is_ok() {
                control.stop_requested = true;
                info!("replicator stop requested");
            }
        }
    }

    /// Suspends or resumes replication.
    ///
    /// While suspended the replicator is `Offline` and starts no new
    /// conflict resolutions. Repeating the current value does nothing.
    pub fn set_suspended(&self, suspended: bool) {
        let mut control = self.control.lock();
        if control.suspended == suspended {
            return;
        }
        control.suspended = suspended;
        if let Some(commands) = &control.commands {
            let _ = commands.send(Command::Suspend(suspended));
        }
    }

    /// Returns true while suspended.
    pub fn is_suspended(&self) -> bool {
        self.control.lock().suspended
    }

    /// Current status.
    pub fn status(&self) -> ReplicatorStatus {
        self.status.status()
    }

    /// Subscribes to status changes.
    pub fn status_watch(&self) -> watch::Receiver<ReplicatorStatus> {
        self.status.watch()
    }

    /// Registers a status listener. Listeners run on the session task.
    pub fn add_change_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&ReplicatorStatus) + Send + Sync + 'static,
    {
        self.status.add_change_listener(listener)
    }

    /// Registers a per-document listener.
    pub fn add_document_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&DocumentReplication) + Send + Sync + 'static,
    {
        self.status.add_document_listener(listener)
    }

    /// Removes a listener. Returns false if the token is unknown.
    pub fn remove_listener(&self, token: ListenerToken) -> bool {
        self.status.remove_listener(token)
    }

    /// IDs of local documents the peer has not confirmed yet.
    pub fn pending_document_ids(&self, collection: &str) -> SyncResult<BTreeSet<String>> {
        self.pending.pending_document_ids(collection)
    }

    /// Returns true if the document is pending.
    pub fn is_document_pending(&self, doc_id: &str, collection: &str) -> SyncResult<bool> {
        self.pending.is_document_pending(doc_id, collection)
    }

    /// Documents whose conflict is waiting for or undergoing resolution.
    pub fn pending_conflict_count(&self) -> usize {
        self.control
            .lock()
            .coordinator
            .as_ref()
            .map(|c| c.pending_count())
            .unwrap_or(0)
    }

    /// Waits until the status is `Stopped` and returns it.
    pub async fn wait_until_stopped(&self) -> ReplicatorStatus {
        let mut status = self.status.watch();
        let stopped = status
            .wait_for(|s| s.activity == ActivityLevel::Stopped)
            .await
            .map(|s| s.clone());
        match stopped {
            Ok(status) => status,
            Err(_) => self.status.status(),
        }
    }

    /// Stops and waits for teardown.
    pub async fn shutdown(&self) -> ReplicatorStatus {
        self.stop();
        self.wait_until_stopped().await
    }
}

impl<C: Connector> Drop for Replicator<C> {
    fn drop(&mut self) {
        let control = self.control.get_mut();
        if let Some(commands) = control.commands.take() {
            let _ = commands.send(Command::Stop);
        }
    }
}

impl<C: Connector> fmt::Debug for Replicator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replicator")
            .field("endpoint", &self.config.endpoint())
            .field("client_id", &self.client_id)
            .field("status", &self.status.status())
            .finish()
    }
}
