use crate::identity::BundleIdentity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("failed to serialize manifest: {0}")]
    SerializeToml(#[from] toml::ser::Error),
    #[error("identity.{0} must not be empty")]
    EmptyIdentityField(&'static str),
    #[error("identity.revision must be at least 1")]
    ZeroRevision,
    #[error("source '{0}' is declared more than once")]
    DuplicateSource(String),
}

/// The declarative `bundle.toml` of a bundle.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BundleManifest {
    pub identity: BundleIdentity,
    #[serde(default)]
    pub about: AboutSection,
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default)]
    pub coverage: CoverageSection,
    #[serde(default)]
    pub sources: Vec<SourceDef>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AboutSection {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    /// Name of the remote the bundle is published to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    /// Time the data covers: a year or an inclusive `YYYY-YYYY` range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grain: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BuildSection {
    /// Creation time carried into `process.dbcreated` on prepare.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbcreated: Option<String>,
    /// Other bundles this one is built from: local name -> bundle id or name.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    /// Tools that must be on `PATH`: executable -> package providing it.
    #[serde(default)]
    pub requirements: BTreeMap<String, String>,
}

/// Coverage recomputed after every build and written back to the manifest.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CoverageSection {
    #[serde(default)]
    pub time: Vec<i32>,
    #[serde(default)]
    pub geo: Vec<String>,
    #[serde(default)]
    pub grain: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SourceDef {
    pub name: String,
    /// Path of the source file, relative to the bundle directory.
    pub path: String,
    /// Destination table; defaults to the source name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

impl SourceDef {
    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.name)
    }
}

impl BundleManifest {
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.identity.id.trim().is_empty() {
            return Err(ManifestError::EmptyIdentityField("id"));
        }
        if self.identity.source.trim().is_empty() {
            return Err(ManifestError::EmptyIdentityField("source"));
        }
        if self.identity.dataset.trim().is_empty() {
            return Err(ManifestError::EmptyIdentityField("dataset"));
        }
        if self.identity.revision == 0 {
            return Err(ManifestError::ZeroRevision);
        }
        let mut seen = std::collections::BTreeSet::new();
        for source in &self.sources {
            if !seen.insert(source.name.as_str()) {
                return Err(ManifestError::DuplicateSource(source.name.clone()));
            }
        }
        Ok(())
    }

    pub fn source(&self, name: &str) -> Option<&SourceDef> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), ManifestError> {
        let content = toml::to_string_pretty(self)?;
        crate::write_atomic(path.as_ref(), &content)?;
        Ok(())
    }
}

pub fn parse_manifest_str(input: &str) -> Result<BundleManifest, ManifestError> {
    let manifest: BundleManifest = toml::from_str(input)?;
    manifest.validate()?;
    Ok(manifest)
}

pub fn parse_manifest_file(path: impl AsRef<Path>) -> Result<BundleManifest, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_manifest_str(&content)
}
