use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the library directory.
pub const LIBRARY_ENV: &str = "DATABUNDLE_LIBRARY";

/// User-level settings shared by every bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Directory installed bundles are registered in.
    pub library: PathBuf,
}

impl LibraryConfig {
    pub fn new(library: impl Into<PathBuf>) -> Self {
        Self {
            library: library.into(),
        }
    }

    /// Load `~/.config/databundle/config.json`, falling back to the default
    /// library location when the file does not exist.
    pub fn load_default() -> Result<Self, CoreError> {
        let path = default_config_path()?;
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::new(default_library_dir()?))
        }
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| CoreError::Config(format!("invalid config {}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Library directory to use: an explicit override wins, then
    /// `DATABUNDLE_LIBRARY`, then the config file.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, CoreError> {
        if let Some(dir) = explicit {
            return Ok(Self::new(dir));
        }
        match std::env::var_os(LIBRARY_ENV) {
            Some(dir) if !dir.is_empty() => Ok(Self::new(PathBuf::from(dir))),
            _ => Self::load_default(),
        }
    }
}

fn home_dir() -> Result<PathBuf, CoreError> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| CoreError::Config("HOME not set".to_owned()))
}

fn default_config_path() -> Result<PathBuf, CoreError> {
    Ok(home_dir()?.join(".config/databundle/config.json"))
}

fn default_library_dir() -> Result<PathBuf, CoreError> {
    Ok(home_dir()?.join(".local/share/databundle/library"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");

        LibraryConfig::new("/srv/library").save(&path).unwrap();
        let loaded = LibraryConfig::load(&path).unwrap();
        assert_eq!(loaded.library, PathBuf::from("/srv/library"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            LibraryConfig::load(&path),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn explicit_override_wins() {
        let cfg = LibraryConfig::resolve(Some(Path::new("/tmp/lib"))).unwrap();
        assert_eq!(cfg.library, PathBuf::from("/tmp/lib"));
    }
}
