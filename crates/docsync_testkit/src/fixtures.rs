//! Store fixtures and replicator helpers.

use docsync_engine::{
    CollectionConfig, Conflict, Connector, Endpoint, LocalConnector, Replicator, ReplicatorConfig,
    ReplicatorConfigBuilder, ReplicatorStatus, ReplicatorType, Resolution, ResolverError,
};
use docsync_store::{Document, DocumentStore, MemoryStore, Properties};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Converts a JSON object into document properties.
///
/// # Panics
///
/// Panics if `value` is not an object.
pub fn props(value: Value) -> Properties {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Creates an empty store.
pub fn empty_store(name: &str) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(name))
}

/// Creates a store holding the given documents.
pub fn seeded_store(name: &str, collection: &str, docs: &[(&str, Value)]) -> Arc<MemoryStore> {
    let store = empty_store(name);
    for (id, body) in docs {
        save(&store, collection, id, body.clone());
    }
    store
}

/// Creates a store with `count` documents named `doc-000`, `doc-001`, ...
pub fn numbered_store(name: &str, collection: &str, count: usize) -> Arc<MemoryStore> {
    let store = empty_store(name);
    for i in 0..count {
        let mut doc = Document::new(format!("doc-{i:03}"));
        doc.set("n", i as u64).set("origin", name);
        store.save(collection, &doc).expect("save failed");
    }
    store
}

/// Creates or updates a document with the given body.
pub fn save(store: &MemoryStore, collection: &str, id: &str, body: Value) -> Document {
    let doc = match store.get(collection, id).expect("get failed") {
        Some(existing) => {
            let mut doc = existing;
            for (key, value) in props(body) {
                doc.set(key, value);
            }
            doc
        }
        None => Document::with_properties(id, props(body)),
    };
    store.save(collection, &doc).expect("save failed")
}

/// Reads a string property of a live document.
pub fn read_string(store: &MemoryStore, collection: &str, id: &str, key: &str) -> Option<String> {
    store
        .get(collection, id)
        .expect("get failed")
        .and_then(|doc| doc.string(key).map(str::to_string))
}

/// Starts a builder targeting another in-memory store.
pub fn builder(target: &MemoryStore, kind: ReplicatorType) -> ReplicatorConfigBuilder {
    ReplicatorConfig::builder(Endpoint::database(target)).with_type(kind)
}

/// Builds a one-shot configuration for one collection.
pub fn one_shot_config(
    target: &MemoryStore,
    kind: ReplicatorType,
    collection: CollectionConfig,
) -> ReplicatorConfig {
    builder(target, kind)
        .add_collection(collection)
        .expect("add collection")
        .build()
        .expect("build config")
}

/// One-shot push of one unfiltered collection.
pub fn push_config(target: &MemoryStore, collection: &str) -> ReplicatorConfig {
    one_shot_config(target, ReplicatorType::Push, CollectionConfig::new(collection))
}

/// One-shot pull of one unfiltered collection.
pub fn pull_config(target: &MemoryStore, collection: &str) -> ReplicatorConfig {
    one_shot_config(target, ReplicatorType::Pull, CollectionConfig::new(collection))
}

/// Pins a closure to the conflict resolver signature.
pub fn resolver<F>(f: F) -> F
where
    F: Fn(&Conflict) -> Result<Resolution, ResolverError> + Send + Sync + 'static,
{
    f
}

/// Creates a replicator between two in-memory stores.
pub fn local_replicator(
    local: &Arc<MemoryStore>,
    remote: &Arc<MemoryStore>,
    config: ReplicatorConfig,
) -> Replicator<LocalConnector> {
    Replicator::new(config, local.clone(), LocalConnector::new(remote.clone()))
        .expect("create replicator")
}

/// Starts a replicator and waits until it stops.
///
/// # Panics
///
/// Panics if the replicator does not stop within [`TEST_TIMEOUT`].
pub async fn run_to_completion<C: Connector>(
    replicator: &Replicator<C>,
    reset: bool,
) -> ReplicatorStatus {
    replicator.start(reset).expect("start replicator");
    tokio::time::timeout(TEST_TIMEOUT, replicator.wait_until_stopped())
        .await
        .expect("replicator did not stop in time")
}

/// Polls `check` until it holds.
///
/// # Panics
///
/// Panics if it does not hold within [`TEST_TIMEOUT`].
pub async fn eventually<F: FnMut() -> bool>(mut check: F) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Leaves `doc_id` conflicted in `store` without a peer: the local
/// revision says `local_name`, the conflicting one `remote_name`.
pub fn make_conflict(
    store: &MemoryStore,
    collection: &str,
    doc_id: &str,
    local_name: &str,
    remote_name: &str,
) {
    let scratch = MemoryStore::new("scratch");
    let base = scratch
        .save(collection, &Document::with_properties(doc_id, props(json!({"name": "Base"}))))
        .expect("save failed");
    let rev = scratch
        .export_revision(collection, doc_id)
        .expect("export failed")
        .expect("revision missing");
    store.apply_remote(collection, &rev, true).expect("apply failed");

    let mut theirs = base;
    theirs.set("name", remote_name);
    scratch.save(collection, &theirs).expect("save failed");
    save(store, collection, doc_id, json!({ "name": local_name }));

    let rev = scratch
        .export_revision(collection, doc_id)
        .expect("export failed")
        .expect("revision missing");
    store.apply_remote(collection, &rev, true).expect("apply failed");
}

/// Live document IDs of a collection, sorted.
pub fn live_ids(store: &MemoryStore, collection: &str) -> Vec<String> {
    let mut ids: Vec<String> = store
        .changes_since(collection, 0, usize::MAX)
        .expect("changes failed")
        .into_iter()
        .filter(|c| !c.deleted)
        .map(|c| c.doc_id)
        .collect();
    ids.sort();
    ids
}
