//! Reset-checkpoint command implementation.

use crate::snapshot;
use docsync_store::DocumentStore;
use docsync_engine::{
    checkpoint_id, read_checkpoint, CheckpointStore, CollectionConfig, Endpoint,
    DEFAULT_CHECKPOINT_INTERVAL,
};
use std::path::Path;
use tracing::info;

/// Clears the source's checkpoint for `collection` against the target.
pub fn run(source: &Path, target: &Path, collection: &str) -> Result<(), Box<dyn std::error::Error>> {
    let local = snapshot::load(source)?;
    let remote = snapshot::load(target)?;
    let key = checkpoint_id(
        local.id(),
        &CollectionConfig::new(collection),
        &Endpoint::database(&*remote),
    );
    let before = read_checkpoint(&*local, &key)?;
    info!("Resetting checkpoint {key} of {:?}", source);

    CheckpointStore::open(local.clone(), key, DEFAULT_CHECKPOINT_INTERVAL)?.reset()?;
    snapshot::save(source, &local)?;

    println!("✓ Checkpoint reset");
    println!("  Collection: {collection}");
    println!("  Was: push {} / pull {}", before.push, before.pull);
    Ok(())
}
