use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current build-store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

pub const MANIFEST_FILE: &str = "bundle.toml";
pub const META_COMPLETE_MARKER: &str = ".meta-complete";

/// Directory layout of one bundle.
///
/// Declarative inputs live at the top level and under `meta/`; everything the
/// pipeline generates lives under `build/`, which is the bundle's backing
/// store. `build/` is created lazily on [`initialize`](Self::initialize).
#[derive(Debug, Clone)]
pub struct BundleLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl BundleLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    #[inline]
    pub fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    #[inline]
    pub fn schema_path(&self) -> PathBuf {
        self.meta_dir().join("schema.toml")
    }

    /// Synchronized source list, written after a successful prepare.
    #[inline]
    pub fn sources_path(&self) -> PathBuf {
        self.meta_dir().join("sources.json")
    }

    /// Marker written after meta generation so the phase is not repeated.
    #[inline]
    pub fn meta_marker(&self) -> PathBuf {
        self.meta_dir().join(META_COMPLETE_MARKER)
    }

    #[inline]
    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    #[inline]
    pub fn config_path(&self) -> PathBuf {
        self.build_dir().join("config.json")
    }

    /// Schema revised during a build, moved over `meta/schema.toml` afterwards.
    #[inline]
    pub fn revised_schema_path(&self) -> PathBuf {
        self.build_dir().join("schema.revised.toml")
    }

    #[inline]
    pub fn partitions_dir(&self) -> PathBuf {
        self.build_dir().join("partitions")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.build_dir().join(".lock")
    }

    /// The backing store exists once `build/` carries a version marker.
    pub fn store_exists(&self) -> bool {
        self.build_dir().join(VERSION_FILE).is_file()
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.meta_dir())?;
        fs::create_dir_all(self.partitions_dir())?;

        let version_path = self.build_dir().join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            crate::write_atomic(&version_path, content.as_bytes())?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.build_dir().join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
