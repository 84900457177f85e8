//! Benchmark utilities.

#![warn(missing_docs)]

use docsync_engine::{
    CollectionConfig, Endpoint, LocalConnector, Replicator, ReplicatorConfig, ReplicatorType,
};
use docsync_store::{Document, DocumentStore, MemoryStore, Properties};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;

/// Collection used by every benchmark.
pub const COLLECTION: &str = "bench";

/// Generates a document body with `fields` random string fields.
pub fn random_properties(fields: usize, value_len: usize) -> Properties {
    let mut rng = rand::thread_rng();
    (0..fields)
        .map(|i| {
            let value: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(value_len)
                .map(char::from)
                .collect();
            (format!("field{i}"), Value::String(value))
        })
        .collect()
}

/// Creates a store holding `count` random documents.
pub fn populated_store(name: &str, count: usize) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new(name));
    for i in 0..count {
        let doc = Document::with_properties(format!("doc-{i:06}"), random_properties(8, 32));
        store
            .save(COLLECTION, &doc)
            .expect("failed to populate store");
    }
    store
}

/// Builds a one-shot replicator from `local` to `remote`.
pub fn replicator(
    local: &Arc<MemoryStore>,
    remote: &Arc<MemoryStore>,
    replicator_type: ReplicatorType,
) -> Replicator<LocalConnector> {
    let config = ReplicatorConfig::builder(Endpoint::database(remote.as_ref()))
        .with_type(replicator_type)
        .add_collection(CollectionConfig::new(COLLECTION))
        .and_then(|builder| builder.build())
        .expect("invalid benchmark configuration");
    Replicator::new(config, local.clone(), LocalConnector::new(remote.clone()))
        .expect("failed to create replicator")
}
