//! Replicator configuration.
//!
//! A [`ReplicatorConfig`] is an immutable snapshot produced by
//! [`ReplicatorConfigBuilder::build`]. A replicator holds it behind an
//! `Arc`; to change anything, derive a new builder with
//! [`ReplicatorConfig::to_builder`] and create a new replicator.

use crate::conflict::ConflictResolver;
use crate::error::{SyncError, SyncResult};
use crate::filter::ReplicationFilter;
use crate::retry::RetryPolicy;
use docsync_store::{DocumentStore, StoreId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default keep-alive interval.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(300);
/// Default ceiling for the delay between reconnect attempts.
pub const DEFAULT_MAX_ATTEMPTS_WAIT_TIME: Duration = Duration::from_secs(300);
/// Default attempt limit for one-shot replication.
pub const DEFAULT_ONE_SHOT_MAX_ATTEMPTS: u32 = 10;
/// Default attempt limit for continuous replication.
pub const DEFAULT_CONTINUOUS_MAX_ATTEMPTS: u32 = u32::MAX;
/// Default minimum interval between checkpoint saves while busy.
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);

/// Smallest accepted heartbeat and maximum wait time.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Direction of replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorType {
    /// Send local changes only.
    Push,
    /// Receive remote changes only.
    Pull,
    /// Both directions.
    PushAndPull,
}

impl ReplicatorType {
    /// Returns true if local changes are sent.
    pub fn is_push(&self) -> bool {
        matches!(self, ReplicatorType::Push | ReplicatorType::PushAndPull)
    }

    /// Returns true if remote changes are received.
    pub fn is_pull(&self) -> bool {
        matches!(self, ReplicatorType::Pull | ReplicatorType::PushAndPull)
    }
}

/// The peer to replicate with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A remote listener reached over `ws://` or `wss://`.
    Url(String),
    /// Another local store.
    Database {
        /// Store name.
        name: String,
        /// Store ID.
        store_id: StoreId,
    },
}

impl Endpoint {
    /// Creates a URL endpoint, rejecting schemes other than `ws`/`wss`.
    pub fn url(url: impl Into<String>) -> SyncResult<Self> {
        let url = url.into();
        let rest = url
            .strip_prefix("ws://")
            .or_else(|| url.strip_prefix("wss://"))
            .ok_or_else(|| {
                SyncError::InvalidConfig(format!("unsupported endpoint URL scheme: {url}"))
            })?;
        let host = rest.split(['/', ':']).next().unwrap_or_default();
        if host.is_empty() {
            return Err(SyncError::InvalidConfig(format!(
                "endpoint URL has no host: {url}"
            )));
        }
        Ok(Endpoint::Url(url))
    }

    /// Creates an endpoint for another local store.
    pub fn database(store: &dyn DocumentStore) -> Self {
        Endpoint::Database {
            name: store.name().to_string(),
            store_id: store.id(),
        }
    }

    /// Stable key identifying this peer in local bookkeeping.
    pub fn key(&self) -> String {
        match self {
            Endpoint::Url(url) => url.trim_end_matches('/').to_string(),
            Endpoint::Database { store_id, .. } => format!("db:{store_id}"),
        }
    }

    /// Returns true for `wss://` URLs.
    pub fn is_tls(&self) -> bool {
        matches!(self, Endpoint::Url(url) if url.starts_with("wss://"))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Url(url) => f.write_str(url),
            Endpoint::Database { name, .. } => write!(f, "database {name}"),
        }
    }
}

/// Credentials handed to the connector.
#[derive(Clone, PartialEq, Eq)]
pub enum Authenticator {
    /// HTTP basic authentication.
    Basic {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },
    /// An existing session cookie.
    Session {
        /// Session ID.
        session_id: String,
        /// Cookie name.
        cookie_name: String,
    },
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authenticator::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Authenticator::Session { cookie_name, .. } => f
                .debug_struct("Session")
                .field("cookie_name", cookie_name)
                .finish_non_exhaustive(),
        }
    }
}

/// Connection parameters passed through to the connector untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
    /// Credentials.
    pub authenticator: Option<Authenticator>,
    /// DER-encoded certificate the peer must present.
    pub pinned_certificate: Option<Vec<u8>>,
}

impl ConnectOptions {
    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the authenticator.
    pub fn with_authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Pins the peer certificate.
    pub fn with_pinned_certificate(mut self, der: Vec<u8>) -> Self {
        self.pinned_certificate = Some(der);
        self
    }
}

/// Per-collection replication settings.
#[derive(Clone)]
pub struct CollectionConfig {
    name: String,
    push_filter: Option<ReplicationFilter>,
    pull_filter: Option<ReplicationFilter>,
    document_ids: Option<Vec<String>>,
    conflict_resolver: Option<Arc<dyn ConflictResolver>>,
}

impl CollectionConfig {
    /// Creates settings for the named collection.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            push_filter: None,
            pull_filter: None,
            document_ids: None,
            conflict_resolver: None,
        }
    }

    /// Sets the push filter.
    pub fn with_push_filter(mut self, filter: ReplicationFilter) -> Self {
        self.push_filter = Some(filter);
        self
    }

    /// Sets the pull filter.
    pub fn with_pull_filter(mut self, filter: ReplicationFilter) -> Self {
        self.pull_filter = Some(filter);
        self
    }

    /// Restricts replication to these document IDs.
    pub fn with_document_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.document_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the conflict resolver.
    pub fn with_conflict_resolver(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.conflict_resolver = Some(Arc::new(resolver));
        self
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Push filter.
    pub fn push_filter(&self) -> Option<&ReplicationFilter> {
        self.push_filter.as_ref()
    }

    /// Pull filter.
    pub fn pull_filter(&self) -> Option<&ReplicationFilter> {
        self.pull_filter.as_ref()
    }

    /// Document ID allowlist.
    pub fn document_ids(&self) -> Option<&[String]> {
        self.document_ids.as_deref()
    }

    /// Conflict resolver, if one was set.
    pub fn conflict_resolver(&self) -> Option<&Arc<dyn ConflictResolver>> {
        self.conflict_resolver.as_ref()
    }
}

impl fmt::Debug for CollectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionConfig")
            .field("name", &self.name)
            .field("push_filter", &self.push_filter)
            .field("pull_filter", &self.pull_filter)
            .field("document_ids", &self.document_ids)
            .field("conflict_resolver", &self.conflict_resolver.is_some())
            .finish()
    }
}

/// Frozen replicator configuration.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    endpoint: Endpoint,
    replicator_type: ReplicatorType,
    continuous: bool,
    heartbeat: Duration,
    max_attempts: u32,
    max_attempts_wait_time: Duration,
    checkpoint_interval: Duration,
    initial_retry_delay: Duration,
    conflict_pool_size: usize,
    batch_size: u32,
    auto_purge: bool,
    collections: Vec<CollectionConfig>,
    connect_options: ConnectOptions,
}

impl ReplicatorConfig {
    /// Starts a builder for the given endpoint.
    pub fn builder(endpoint: Endpoint) -> ReplicatorConfigBuilder {
        ReplicatorConfigBuilder::new(endpoint)
    }

    /// Returns a builder pre-filled with this configuration.
    pub fn to_builder(&self) -> ReplicatorConfigBuilder {
        ReplicatorConfigBuilder {
            endpoint: self.endpoint.clone(),
            replicator_type: self.replicator_type,
            continuous: self.continuous,
            heartbeat: self.heartbeat,
            max_attempts: self.max_attempts,
            max_attempts_wait_time: self.max_attempts_wait_time,
            checkpoint_interval: self.checkpoint_interval,
            initial_retry_delay: self.initial_retry_delay,
            conflict_pool_size: self.conflict_pool_size,
            batch_size: self.batch_size,
            auto_purge: self.auto_purge,
            collections: self.collections.clone(),
            connect_options: self.connect_options.clone(),
        }
    }

    /// Peer endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Replication direction.
    pub fn replicator_type(&self) -> ReplicatorType {
        self.replicator_type
    }

    /// Whether the session keeps running after catching up.
    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    /// Keep-alive interval.
    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    /// Consecutive failed attempts before giving up. Never zero.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Ceiling for the delay between attempts.
    pub fn max_attempts_wait_time(&self) -> Duration {
        self.max_attempts_wait_time
    }

    /// Minimum interval between checkpoint saves while busy.
    pub fn checkpoint_interval(&self) -> Duration {
        self.checkpoint_interval
    }

    /// Delay before the first reconnect attempt.
    pub fn initial_retry_delay(&self) -> Duration {
        self.initial_retry_delay
    }

    /// Number of conflicts resolved concurrently.
    pub fn conflict_pool_size(&self) -> usize {
        self.conflict_pool_size
    }

    /// Maximum revisions per batch.
    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Whether documents the peer revoked access to are purged locally.
    pub fn auto_purge(&self) -> bool {
        self.auto_purge
    }

    /// Collections to replicate.
    pub fn collections(&self) -> &[CollectionConfig] {
        &self.collections
    }

    /// Looks up a collection by name.
    pub fn collection(&self, name: &str) -> Option<&CollectionConfig> {
        self.collections.iter().find(|c| c.name() == name)
    }

    /// Connection parameters.
    pub fn connect_options(&self) -> &ConnectOptions {
        &self.connect_options
    }

    /// Reconnect policy derived from this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
            .with_initial_delay(self.initial_retry_delay)
            .with_max_delay(self.max_attempts_wait_time)
    }
}

/// Builder for [`ReplicatorConfig`].
///
/// Setters that can reject a value return `SyncResult<Self>`, so the error
/// surfaces at the call that caused it.
#[derive(Debug, Clone)]
pub struct ReplicatorConfigBuilder {
    endpoint: Endpoint,
    replicator_type: ReplicatorType,
    continuous: bool,
    heartbeat: Duration,
    max_attempts: u32,
    max_attempts_wait_time: Duration,
    checkpoint_interval: Duration,
    initial_retry_delay: Duration,
    conflict_pool_size: usize,
    batch_size: u32,
    auto_purge: bool,
    collections: Vec<CollectionConfig>,
    connect_options: ConnectOptions,
}

impl ReplicatorConfigBuilder {
    /// Creates a builder with default settings.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            replicator_type: ReplicatorType::PushAndPull,
            continuous: false,
            heartbeat: DEFAULT_HEARTBEAT,
            max_attempts: 0,
            max_attempts_wait_time: DEFAULT_MAX_ATTEMPTS_WAIT_TIME,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            initial_retry_delay: Duration::from_secs(1),
            conflict_pool_size: 4,
            batch_size: 100,
            auto_purge: true,
            collections: Vec::new(),
            connect_options: ConnectOptions::default(),
        }
    }

    /// Sets the direction.
    pub fn with_type(mut self, replicator_type: ReplicatorType) -> Self {
        self.replicator_type = replicator_type;
        self
    }

    /// Sets continuous mode.
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Sets the keep-alive interval. Must be at least one second.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> SyncResult<Self> {
        if heartbeat < MIN_INTERVAL {
            return Err(SyncError::InvalidConfig(format!(
                "heartbeat must be at least 1s, got {heartbeat:?}"
            )));
        }
        self.heartbeat = heartbeat;
        Ok(self)
    }

    /// Sets the attempt limit. Zero selects the default for the mode.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the ceiling for the delay between attempts. Must be at least
    /// one second.
    pub fn with_max_attempts_wait_time(mut self, wait: Duration) -> SyncResult<Self> {
        if wait < MIN_INTERVAL {
            return Err(SyncError::InvalidConfig(format!(
                "max attempts wait time must be at least 1s, got {wait:?}"
            )));
        }
        self.max_attempts_wait_time = wait;
        Ok(self)
    }

    /// Sets the minimum interval between checkpoint saves while busy.
    pub fn with_checkpoint_interval(mut self, interval: Duration) -> SyncResult<Self> {
        if interval.is_zero() {
            return Err(SyncError::InvalidConfig(
                "checkpoint interval must be positive".into(),
            ));
        }
        self.checkpoint_interval = interval;
        Ok(self)
    }

    /// Sets the delay before the first reconnect attempt.
    pub fn with_initial_retry_delay(mut self, delay: Duration) -> Self {
        self.initial_retry_delay = delay;
        self
    }

    /// Sets how many conflicts are resolved concurrently.
    pub fn with_conflict_pool_size(mut self, size: usize) -> SyncResult<Self> {
        if size == 0 {
            return Err(SyncError::InvalidConfig(
                "conflict pool size must be at least 1".into(),
            ));
        }
        self.conflict_pool_size = size;
        Ok(self)
    }

    /// Sets the maximum revisions per batch.
    pub fn with_batch_size(mut self, size: u32) -> SyncResult<Self> {
        if size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch size must be at least 1".into(),
            ));
        }
        self.batch_size = size;
        Ok(self)
    }

    /// Enables or disables purging documents the peer revoked access to.
    pub fn with_auto_purge(mut self, enabled: bool) -> Self {
        self.auto_purge = enabled;
        self
    }

    /// Adds a collection. Each collection may be added once.
    pub fn add_collection(mut self, collection: CollectionConfig) -> SyncResult<Self> {
        if self
            .collections
            .iter()
            .any(|c| c.name() == collection.name())
        {
            return Err(SyncError::InvalidConfig(format!(
                "collection {} added twice",
                collection.name()
            )));
        }
        self.collections.push(collection);
        Ok(self)
    }

    /// Sets connection parameters.
    pub fn with_connect_options(mut self, options: ConnectOptions) -> Self {
        self.connect_options = options;
        self
    }

    /// Freezes the configuration.
    pub fn build(self) -> SyncResult<ReplicatorConfig> {
        if self.collections.is_empty() {
            return Err(SyncError::InvalidConfig(
                "at least one collection is required".into(),
            ));
        }
        let max_attempts = match self.max_attempts {
            0 if self.continuous => DEFAULT_CONTINUOUS_MAX_ATTEMPTS,
            0 => DEFAULT_ONE_SHOT_MAX_ATTEMPTS,
            n => n,
        };
        Ok(ReplicatorConfig {
            endpoint: self.endpoint,
            replicator_type: self.replicator_type,
            continuous: self.continuous,
            heartbeat: self.heartbeat,
            max_attempts,
            max_attempts_wait_time: self.max_attempts_wait_time,
            checkpoint_interval: self.checkpoint_interval,
            initial_retry_delay: self.initial_retry_delay,
            conflict_pool_size: self.conflict_pool_size,
            batch_size: self.batch_size,
            auto_purge: self.auto_purge,
            collections: self.collections,
            connect_options: self.connect_options,
        })
    }
}
