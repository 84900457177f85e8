//! Transport abstraction.
//!
//! A [`Connector`] opens [`Connection`]s to the endpoint of a replicator
//! configuration. Connections carry [`Frame`]s in both directions; their
//! errors must say whether a reconnect may help (see
//! [`SyncError::is_recoverable`]).

use crate::config::{ConnectOptions, Endpoint};
use crate::error::{SyncError, SyncResult};
use crate::passive::{PassiveOptions, PassivePeer};
use docsync_protocol::Frame;
use docsync_store::DocumentStore;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// An open, framed, bidirectional connection.
pub trait Connection: Send + Sync + 'static {
    /// Sends a frame.
    fn send(&self, frame: Frame) -> impl Future<Output = SyncResult<()>> + Send;

    /// Receives the next frame. `Ok(None)` once the peer has closed.
    ///
    /// Must be cancel safe: dropping the future loses no frame.
    fn recv(&self) -> impl Future<Output = SyncResult<Option<Frame>>> + Send;

    /// Closes the sending half.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Opens connections.
pub trait Connector: Send + Sync + 'static {
    /// The connection type.
    type Conn: Connection;

    /// Connects to `endpoint`. Options are passed through untouched.
    fn connect(
        &self,
        endpoint: &Endpoint,
        options: &ConnectOptions,
    ) -> impl Future<Output = SyncResult<Self::Conn>> + Send;
}

/// One end of an in-memory connection.
pub struct MemoryConnection {
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl MemoryConnection {
    /// Creates two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Mutex::new(Some(a_tx)),
                rx: tokio::sync::Mutex::new(b_rx),
            },
            Self {
                tx: Mutex::new(Some(b_tx)),
                rx: tokio::sync::Mutex::new(a_rx),
            },
        )
    }
}

impl Connection for MemoryConnection {
    async fn send(&self, frame: Frame) -> SyncResult<()> {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx.send(frame).map_err(|_| SyncError::ConnectionClosed),
            None => Err(SyncError::ConnectionClosed),
        }
    }

    async fn recv(&self) -> SyncResult<Option<Frame>> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self) {
        self.tx.lock().take();
    }
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("open", &self.tx.lock().is_some())
            .finish()
    }
}

/// Replicates with another store in the same process.
///
/// Each connection spawns a [`PassivePeer`] serving the target store.
#[derive(Clone)]
pub struct LocalConnector {
    target: Arc<dyn DocumentStore>,
    options: PassiveOptions,
}

impl LocalConnector {
    /// Creates a connector serving `target`.
    pub fn new(target: Arc<dyn DocumentStore>) -> Self {
        Self {
            target,
            options: PassiveOptions::default(),
        }
    }

    /// Sets the passive side's options.
    pub fn with_options(mut self, options: PassiveOptions) -> Self {
        self.options = options;
        self
    }

    /// The store being served.
    pub fn target(&self) -> &Arc<dyn DocumentStore> {
        &self.target
    }
}

impl Connector for LocalConnector {
    type Conn = MemoryConnection;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        _options: &ConnectOptions,
    ) -> SyncResult<MemoryConnection> {
        if let Endpoint::Database { store_id, .. } = endpoint {
            if *store_id != self.target.id() {
                return Err(SyncError::InvalidConfig(format!(
                    "endpoint {endpoint} does not name the connector's database"
                )));
            }
        }
        if !self.target.is_open() {
            return Err(SyncError::transport_retryable("target database is closed"));
        }
        let (client, server) = MemoryConnection::pair();
        let peer = PassivePeer::new(self.target.clone(), self.options.clone());
        tokio::spawn(async move {
            if let Err(err) = peer.serve(server).await {
                debug!(error = %err, "passive session ended with error");
            }
        });
        debug!(endpoint = %endpoint, "local connection opened");
        Ok(client)
    }
}

impl std::fmt::Debug for LocalConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConnector")
            .field("target", &self.target.name())
            .field("options", &self.options)
            .finish()
    }
}
