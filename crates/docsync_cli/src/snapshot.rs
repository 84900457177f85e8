//! JSON snapshot files.
//!
//! A snapshot holds a whole [`MemoryStore`]: documents, checkpoints and
//! blobs. Snapshots are written to a sibling temporary file first and then
//! renamed over the original.

use docsync_store::{MemoryStore, StoreError, StoreSnapshot};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Errors reading or writing snapshot files.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The file could not be read or written.
    #[error("I/O error on {path:?}: {source}")]
    Io {
        /// Snapshot path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not a valid snapshot.
    #[error("invalid snapshot {path:?}: {source}")]
    Json {
        /// Snapshot path.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// The store refused to produce a snapshot.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for snapshot operations.
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Loads a snapshot.
pub fn load(path: &Path) -> SnapshotResult<Arc<MemoryStore>> {
    let io = |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    };
    let json = fs::read_to_string(path).map_err(io)?;
    let snapshot: StoreSnapshot = serde_json::from_str(&json).map_err(|source| SnapshotError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Loaded snapshot {:?}", path);
    Ok(Arc::new(MemoryStore::from_snapshot(snapshot)))
}

/// Loads a snapshot, or creates an empty store named after the file if it
/// does not exist yet.
pub fn load_or_create(path: &Path) -> SnapshotResult<Arc<MemoryStore>> {
    if path.exists() {
        return load(path);
    }
    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    info!("Creating new store {name:?} for {:?}", path);
    Ok(Arc::new(MemoryStore::new(name)))
}

/// Writes a snapshot.
pub fn save(path: &Path, store: &MemoryStore) -> SnapshotResult<()> {
    let io = |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_string_pretty(&store.snapshot()?).map_err(|source| {
        SnapshotError::Json {
            path: path.to_path_buf(),
            source,
        }
    })?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, json).map_err(io)?;
    fs::rename(&tmp, path).map_err(io)?;
    debug!("Saved snapshot {:?}", path);
    Ok(())
}
