//! Pending command implementation.

use crate::snapshot;
use docsync_engine::{
    CollectionConfig, Endpoint, LocalConnector, Replicator, ReplicatorConfig, ReplicatorType,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;

/// Pending documents of one collection.
#[derive(Debug, Serialize)]
pub struct PendingResult {
    /// Collection name.
    pub collection: String,
    /// IDs the target has not received.
    pub pending: BTreeSet<String>,
}

/// Computes the documents of `collection` the target has not received.
pub fn collect(
    source: &Path,
    target: &Path,
    collection: &str,
) -> Result<PendingResult, Box<dyn std::error::Error>> {
    let local = snapshot::load(source)?;
    let remote = snapshot::load_or_create(target)?;
    let config = ReplicatorConfig::builder(Endpoint::database(&*remote))
        .with_type(ReplicatorType::Push)
        .add_collection(CollectionConfig::new(collection))?
        .build()?;
    let replicator = Replicator::new(config, local, LocalConnector::new(remote))?;
    Ok(PendingResult {
        collection: collection.to_string(),
        pending: replicator.pending_document_ids(collection)?,
    })
}

/// Runs the pending command.
pub fn run(
    source: &Path,
    target: &Path,
    collection: &str,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = collect(source, target, collection)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => {
            println!("Pending in {}: {}", result.collection, result.pending.len());
            for id in &result.pending {
                println!("  {id}");
            }
        }
    }
    Ok(())
}
