//! Declarative inputs of a databundle bundle.
//!
//! This crate defines the schema layer: the `bundle.toml` manifest
//! (`BundleManifest`), the table definitions in `meta/schema.toml` (`Schema`),
//! bundle identity (`BundleIdentity`) and the identifier newtypes used by the
//! store and the orchestrator.

pub mod identity;
pub mod manifest;
pub mod schema;
pub mod types;

pub use identity::BundleIdentity;
pub use manifest::{
    parse_manifest_file, parse_manifest_str, AboutSection, BuildSection, BundleManifest,
    CoverageSection, ManifestError, SourceDef,
};
pub use schema::{ColumnDef, Schema, SchemaIssue, TableDef, KNOWN_DATATYPES};
pub use types::{BundleId, BundleVid, PartitionVid};

use std::fs;
use std::io::Write;
use std::path::Path;

/// Write `content` to `path` through a temp file in the same directory, then
/// rename it into place and fsync the directory.
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<(), std::io::Error> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    if let Ok(f) = fs::File::open(dir) {
        let _ = f.sync_all();
    }
    Ok(())
}
