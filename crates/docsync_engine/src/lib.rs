//! # docsync engine
//!
//! Replication engine for revisioned document stores.
//!
//! This crate provides:
//! - The session state machine (connecting → busy ⇄ idle → stopped, with
//!   offline between reconnect attempts)
//! - Per-collection checkpoints keyed by the replication configuration
//! - Push/pull filters and document ID allowlists
//! - Conflict resolution with per-document serialization and a bounded pool
//! - Pending-document queries for the push direction
//! - Retry with exponential backoff and error classification
//! - Status and per-document event reporting
//! - A transport abstraction, an in-memory connection and the passive peer
//!
//! ## Architecture
//!
//! A [`Replicator`] owns a frozen [`ReplicatorConfig`]. Each start spawns
//! one session task that drives a [`Connection`] opened by a
//! [`Connector`]: it subscribes to the peer's changes, pushes local
//! changes past the push checkpoint, and hands divergent revisions to the
//! [`ConflictCoordinator`].
//!
//! ## Key Invariants
//!
//! - Checkpoints only move forward, and only the session task writes them
//! - At most one resolution runs per document at a time
//! - Resolvers run without any engine lock held
//! - Per-document errors never become the replicator's status error
//! - Permanent connection errors stop the replicator without retrying

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod config;
mod conflict;
mod error;
mod filter;
mod passive;
mod pending;
mod replicator;
mod retry;
mod session;
mod status;
mod transport;

pub use checkpoint::{checkpoint_id, read_checkpoint, Checkpoint, CheckpointStore};
pub use config::{
    Authenticator, CollectionConfig, ConnectOptions, Endpoint, ReplicatorConfig,
    ReplicatorConfigBuilder, ReplicatorType, DEFAULT_CHECKPOINT_INTERVAL,
    DEFAULT_CONTINUOUS_MAX_ATTEMPTS, DEFAULT_HEARTBEAT, DEFAULT_MAX_ATTEMPTS_WAIT_TIME,
    DEFAULT_ONE_SHOT_MAX_ATTEMPTS,
};
pub use conflict::{
    Conflict, ConflictCoordinator, ConflictResolver, DefaultConflictResolver, Resolution,
    ResolutionEvent, ResolutionOutcome, ResolverError,
};
pub use error::{SyncError, SyncResult};
pub use filter::{DocumentFlags, FilterPipeline, FilterVerdict, ReplicationFilter};
pub use passive::{PassiveOptions, PassivePeer};
pub use pending::PendingTracker;
pub use replicator::Replicator;
pub use retry::{BackoffController, RetryDecision, RetryPolicy};
pub use status::{
    ActivityLevel, Direction, DocumentReplication, ListenerToken, Progress, ReplicatedDocument,
    ReplicatorStatus, StatusAggregator,
};
pub use transport::{Connection, Connector, LocalConnector, MemoryConnection};
