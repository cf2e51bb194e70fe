use crate::StoreError;
use databundle_schema::{BundleIdentity, BundleVid};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const INDEX_FILE: &str = "index.json";

/// One installed bundle revision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LibraryEntry {
    pub identity: BundleIdentity,
    pub directory: PathBuf,
    pub installed_at: String,
}

impl LibraryEntry {
    pub fn vid(&self) -> BundleVid {
        self.identity.vid()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LibraryIndex {
    entries: Vec<LibraryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
}

impl LibraryIndex {
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let json = serde_json::to_string_pretty(&self.entries)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

/// Registry of installed bundles, used to resolve dependencies and to detect
/// revision conflicts. Backed by a single checksummed `index.json`.
#[derive(Debug, Clone)]
pub struct Library {
    root: PathBuf,
}

impl Library {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn load(&self) -> Result<LibraryIndex, StoreError> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(LibraryIndex::default());
        }
        let index: LibraryIndex = serde_json::from_str(&fs::read_to_string(&path)?)?;
        if let Some(ref expected) = index.checksum {
            let actual = index.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    path: path.display().to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(index)
    }

    fn save(&self, mut index: LibraryIndex) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)?;
        index
            .entries
            .sort_by(|a, b| a.vid().cmp(&b.vid()));
        index.checksum = Some(index.compute_checksum()?);
        let content = serde_json::to_string_pretty(&index)?;
        crate::write_atomic(&self.index_path(), content.as_bytes())
    }

    /// Record `identity` as installed from `directory`, replacing any entry
    /// with the same versioned id.
    pub fn install(
        &self,
        identity: &BundleIdentity,
        directory: &Path,
    ) -> Result<LibraryEntry, StoreError> {
        let mut index = self.load()?;
        let vid = identity.vid();
        index.entries.retain(|e| e.vid() != vid);
        let entry = LibraryEntry {
            identity: identity.clone(),
            directory: directory.to_path_buf(),
            installed_at: chrono::Utc::now().to_rfc3339(),
        };
        index.entries.push(entry.clone());
        self.save(index)?;
        tracing::info!("installed {} into library {}", identity.vname(), self.root.display());
        Ok(entry)
    }

    pub fn list(&self) -> Result<Vec<LibraryEntry>, StoreError> {
        Ok(self.load()?.entries)
    }

    /// Look up a bundle by versioned id, or by unversioned id (highest
    /// installed revision wins).
    pub fn resolve(&self, reference: &str) -> Result<Option<LibraryEntry>, StoreError> {
        let entries = self.list()?;
        if let Some(exact) = entries.iter().find(|e| e.vid() == reference) {
            return Ok(Some(exact.clone()));
        }
        Ok(entries
            .into_iter()
            .filter(|e| e.identity.id.as_str() == reference)
            .max_by_key(|e| e.identity.revision))
    }

    /// Look up the highest installed revision carrying `name`, or the entry
    /// whose versioned name is exactly `name`.
    pub fn resolve_name(&self, name: &str) -> Result<Option<LibraryEntry>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|e| e.identity.name() == name || e.identity.vname() == name)
            .max_by_key(|e| e.identity.revision))
    }

    pub fn remove(&self, vid: &str) -> Result<(), StoreError> {
        let mut index = self.load()?;
        let before = index.entries.len();
        index.entries.retain(|e| e.vid() != vid);
        if index.entries.len() == before {
            return Err(StoreError::NotInLibrary(vid.to_owned()));
        }
        self.save(index)
    }
}
