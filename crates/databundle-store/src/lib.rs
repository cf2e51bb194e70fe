//! Backing store of a databundle bundle.
//!
//! This crate owns everything a bundle persists under `build/`: the directory
//! layout (`BundleLayout`), the checksummed key-value configuration
//! (`ConfigStore`, `FileConfigStore`) that carries phase state
//! (`StateRecord`, `set_build_state`), the partition records and their
//! finalization (`PartitionStore`, `Partition`), and the shared `Library`
//! index that installed bundles are registered in.

pub mod config;
pub mod layout;
pub mod library;
pub mod partition;
pub mod state;

pub use config::{is_truthy, ConfigStore, FileConfigStore, MemoryConfigStore};
pub use layout::{BundleLayout, MANIFEST_FILE, META_COMPLETE_MARKER, STORE_FORMAT_VERSION};
pub use library::{Library, LibraryEntry};
pub use partition::{
    Coverage, FilePartition, FinalizeError, Partition, PartitionRecord, PartitionStats,
    PartitionStore,
};
pub use state::{set_build_state, BuildMarker, Phase, StateRecord, PROCESS_GROUP, STATE_GROUP};

use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Write `content` to a temp file next to `path`, fsync it, and rename it
/// into place.
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for '{path}': expected {expected}, got {actual}")]
    IntegrityFailure {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("partition not found: {0}")]
    PartitionNotFound(String),
    #[error("bundle not in library: {0}")]
    NotInLibrary(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
