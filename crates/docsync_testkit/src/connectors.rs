//! Fault-injecting connectors.

use docsync_engine::{
    ConnectOptions, Connection, Connector, Endpoint, LocalConnector, MemoryConnection, SyncError,
    SyncResult,
};
use docsync_protocol::{Frame, Message, PushResult, PROTOCOL_VERSION};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Fails a number of connection attempts before delegating.
pub struct FlakyConnector<C = LocalConnector> {
    inner: C,
    error: SyncError,
    remaining: AtomicUsize,
    attempts: Arc<AtomicUsize>,
}

impl<C: Connector> FlakyConnector<C> {
    /// Fails the first `times` attempts with `error`.
    pub fn new(inner: C, error: SyncError, times: usize) -> Self {
        Self {
            inner,
            error,
            remaining: AtomicUsize::new(times),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fails every attempt with `error`.
    pub fn always(inner: C, error: SyncError) -> Self {
        Self::new(inner, error, usize::MAX)
    }

    /// Shared counter of connection attempts.
    pub fn attempts(&self) -> Arc<AtomicUsize> {
        self.attempts.clone()
    }
}

impl<C: Connector> Connector for FlakyConnector<C> {
    type Conn = C::Conn;

    async fn connect(&self, endpoint: &Endpoint, options: &ConnectOptions) -> SyncResult<C::Conn> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(self.error.clone());
        }
        self.inner.connect(endpoint, options).await
    }
}

/// Accepts connections and never answers on them.
#[derive(Default)]
pub struct SilentConnector {
    peers: Mutex<Vec<MemoryConnection>>,
    attempts: Arc<AtomicUsize>,
}

impl SilentConnector {
    /// Creates the connector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared counter of connection attempts.
    pub fn attempts(&self) -> Arc<AtomicUsize> {
        self.attempts.clone()
    }
}

impl Connector for SilentConnector {
    type Conn = MemoryConnection;

    async fn connect(&self, _: &Endpoint, _: &ConnectOptions) -> SyncResult<MemoryConnection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (client, server) = MemoryConnection::pair();
        self.peers.lock().push(server);
        Ok(client)
    }
}

/// Never finishes connecting.
#[derive(Debug, Default)]
pub struct HangingConnector;

impl Connector for HangingConnector {
    type Conn = MemoryConnection;

    async fn connect(&self, _: &Endpoint, _: &ConnectOptions) -> SyncResult<MemoryConnection> {
        std::future::pending().await
    }
}

/// A hand-driven peer: it completes the handshake, reports every
/// subscription as caught up and accepts every pushed revision.
///
/// Pongs can be switched off and acknowledgments held back on the
/// [`ack_gate`](Self::ack_gate), which lets tests park a session in the
/// middle of a push or let its heartbeat run dry.
pub struct ScriptedConnector {
    answer_pings: bool,
    hold_acks: bool,
    ack_gate: Arc<Notify>,
    before_ack: Vec<Message>,
    attempts: Arc<AtomicUsize>,
    pushes: Arc<AtomicUsize>,
    receives: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    /// A peer that answers pings and acknowledges pushes right away.
    pub fn new() -> Self {
        Self {
            answer_pings: true,
            hold_acks: false,
            ack_gate: Arc::new(Notify::new()),
            before_ack: Vec::new(),
            attempts: Arc::new(AtomicUsize::new(0)),
            pushes: Arc::new(AtomicUsize::new(0)),
            receives: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Never answers pings after the handshake.
    pub fn without_pongs(mut self) -> Self {
        self.answer_pings = false;
        self
    }

    /// Holds every push acknowledgment until released on the gate.
    pub fn with_held_acks(mut self) -> Self {
        self.hold_acks = true;
        self
    }

    /// Sends `message` right before every push acknowledgment.
    pub fn with_message_before_ack(mut self, message: Message) -> Self {
        self.before_ack.push(message);
        self
    }

    /// Gate for held acknowledgments; `notify_one` lets one through.
    pub fn ack_gate(&self) -> Arc<Notify> {
        self.ack_gate.clone()
    }

    /// Shared counter of connection attempts.
    pub fn attempts(&self) -> Arc<AtomicUsize> {
        self.attempts.clone()
    }

    /// Shared counter of push batches received.
    pub fn pushes(&self) -> Arc<AtomicUsize> {
        self.pushes.clone()
    }

    /// Shared counter of receive calls made by the client side.
    pub fn receives(&self) -> Arc<AtomicUsize> {
        self.receives.clone()
    }
}

impl Default for ScriptedConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for ScriptedConnector {
    type Conn = CountingConnection;

    async fn connect(&self, _: &Endpoint, _: &ConnectOptions) -> SyncResult<CountingConnection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (client, server) = MemoryConnection::pair();
        tokio::spawn(serve_scripted(
            server,
            Script {
                answer_pings: self.answer_pings,
                ack_gate: self.hold_acks.then(|| self.ack_gate.clone()),
                before_ack: self.before_ack.clone(),
                pushes: self.pushes.clone(),
            },
        ));
        Ok(CountingConnection {
            inner: client,
            receives: self.receives.clone(),
        })
    }
}

/// Client end of a [`ScriptedConnector`] connection. Counts receive calls.
pub struct CountingConnection {
    inner: MemoryConnection,
    receives: Arc<AtomicUsize>,
}

impl Connection for CountingConnection {
    async fn send(&self, frame: Frame) -> SyncResult<()> {
        self.inner.send(frame).await
    }

    async fn recv(&self) -> SyncResult<Option<Frame>> {
        self.receives.fetch_add(1, Ordering::SeqCst);
        self.inner.recv().await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

struct Script {
    answer_pings: bool,
    ack_gate: Option<Arc<Notify>>,
    before_ack: Vec<Message>,
    pushes: Arc<AtomicUsize>,
}

async fn serve_scripted(conn: MemoryConnection, script: Script) {
    while let Ok(Some(frame)) = conn.recv().await {
        let Ok(message) = frame.decode() else {
            break;
        };
        let reply = match message {
            Message::Hello { collections, .. } => Some(Message::HelloAck {
                version: PROTOCOL_VERSION,
                collections,
            }),
            Message::Subscribe {
                collection, since, ..
            } => Some(Message::Changes {
                collection,
                revs: Vec::new(),
                last_seq: since,
                caught_up: true,
            }),
            Message::Ping { nonce } if script.answer_pings => Some(Message::Pong { nonce }),
            Message::PushRevs {
                request_id, revs, ..
            } => {
                script.pushes.fetch_add(1, Ordering::SeqCst);
                if let Some(gate) = &script.ack_gate {
                    gate.notified().await;
                }
                for message in &script.before_ack {
                    if send_message(&conn, message).await.is_err() {
                        return;
                    }
                }
                Some(Message::PushAck {
                    request_id,
                    results: revs
                        .into_iter()
                        .map(|rev| PushResult::accepted(rev.doc_id, rev.revision))
                        .collect(),
                })
            }
            Message::Close => break,
            _ => None,
        };
        let Some(reply) = reply else {
            continue;
        };
        if send_message(&conn, &reply).await.is_err() {
            break;
        }
    }
}

async fn send_message(conn: &MemoryConnection, message: &Message) -> SyncResult<()> {
    let frame = Frame::encode(message)?;
    conn.send(frame).await
}
