//! Replicate command implementation.

use crate::snapshot;
use docsync_engine::{
    CollectionConfig, Direction, Endpoint, LocalConnector, ReplicatedDocument, Replicator,
    ReplicatorConfig, ReplicatorStatus, ReplicatorType, SyncError,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Outcome of one replication run.
#[derive(Debug)]
pub struct ReplicationReport {
    /// Documents reported by the replicator, in order.
    pub documents: Vec<(Direction, ReplicatedDocument)>,
    /// Final status.
    pub status: ReplicatorStatus,
    /// Error that stopped the replicator, if any.
    pub error: Option<SyncError>,
}

impl ReplicationReport {
    /// Number of documents transferred without error in one direction.
    pub fn transferred(&self, direction: Direction) -> usize {
        self.documents
            .iter()
            .filter(|(d, doc)| *d == direction && doc.error.is_none())
            .count()
    }

    /// Prints the report.
    pub fn print(&self) {
        for (direction, doc) in &self.documents {
            let arrow = match direction {
                Direction::Push => "->",
                Direction::Pull => "<-",
            };
            match &doc.error {
                None => println!("  {arrow} {}/{}", doc.collection, doc.id),
                Some(err) => println!("  {arrow} {}/{}: {err}", doc.collection, doc.id),
            }
        }
        if self.error.is_none() {
            println!("✓ Replication complete");
        } else {
            println!("✗ Replication failed");
        }
        println!("  Pushed: {}", self.transferred(Direction::Push));
        println!("  Pulled: {}", self.transferred(Direction::Pull));
        println!(
            "  Progress: {}/{}",
            self.status.progress.completed, self.status.progress.total
        );
        if let Some(err) = &self.error {
            println!("  Error: {err}");
        }
    }
}

/// Runs a one-shot replication and writes both snapshots back.
pub fn run(
    source: &Path,
    target: &Path,
    replicator_type: ReplicatorType,
    collections: &[String],
    reset: bool,
) -> Result<ReplicationReport, Box<dyn std::error::Error>> {
    let local = snapshot::load_or_create(source)?;
    let remote = snapshot::load_or_create(target)?;
    info!("Replicating {:?} with {:?}", source, target);

    let mut builder =
        ReplicatorConfig::builder(Endpoint::database(&*remote)).with_type(replicator_type);
    for name in collections {
        builder = builder.add_collection(CollectionConfig::new(name.as_str()))?;
    }
    let config = builder.build()?;

    let documents = Arc::new(Mutex::new(Vec::new()));
    let sink = documents.clone();
    let runtime = tokio::runtime::Runtime::new()?;
    let status = runtime.block_on(async {
        let replicator =
            Replicator::new(config, local.clone(), LocalConnector::new(remote.clone()))?;
        replicator.add_document_listener(move |batch| {
            let mut sink = sink.lock();
            for doc in &batch.documents {
                sink.push((batch.direction, doc.clone()));
            }
        });
        replicator.start(reset)?;
        Ok::<_, SyncError>(replicator.wait_until_stopped().await)
    })?;

    snapshot::save(source, &local)?;
    snapshot::save(target, &remote)?;

    let documents = std::mem::take(&mut *documents.lock());
    Ok(ReplicationReport {
        documents,
        error: status.error.clone(),
        status,
    })
}
