use crate::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

type Groups = BTreeMap<String, BTreeMap<String, Value>>;

/// Persisted, hierarchical key-value configuration of one bundle, keyed by
/// `(group, key)`.
///
/// Writes are buffered until [`commit`](Self::commit); a commit is the unit
/// of durability for phase state.
pub trait ConfigStore {
    fn get(&self, group: &str, key: &str) -> Option<Value>;

    fn set(&mut self, group: &str, key: &str, value: Value);

    /// Remove every key in `group`.
    fn clear_group(&mut self, group: &str);

    fn group(&self, group: &str) -> BTreeMap<String, Value>;

    fn commit(&mut self) -> Result<(), StoreError>;

    fn get_or(&self, group: &str, key: &str, default: Value) -> Value {
        self.get(group, key).unwrap_or(default)
    }

    fn is_set(&self, group: &str, key: &str) -> bool {
        self.get(group, key).is_some_and(|v| is_truthy(&v))
    }
}

/// Truthiness of a stored value: `null`, `false`, zero, and empty strings,
/// arrays, or objects are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ConfigFile {
    groups: Groups,
    /// blake3 over the pretty-printed groups. `None` for hand-written files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
}

fn checksum(groups: &Groups) -> Result<String, StoreError> {
    let json = serde_json::to_string_pretty(groups)?;
    Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
}

/// [`ConfigStore`] persisted as a checksummed JSON document.
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    groups: Groups,
}

impl FileConfigStore {
    /// Open the store at `path`. A missing file yields an empty store; the
    /// file is only created on the first commit.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let groups = if path.exists() {
            let content = fs::read_to_string(&path)?;
            let file: ConfigFile = serde_json::from_str(&content)?;
            if let Some(ref expected) = file.checksum {
                let actual = checksum(&file.groups)?;
                if actual != *expected {
                    return Err(StoreError::IntegrityFailure {
                        path: path.display().to_string(),
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
            file.groups
        } else {
            Groups::new()
        };
        Ok(Self { path, groups })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn get(&self, group: &str, key: &str) -> Option<Value> {
        self.groups.get(group).and_then(|g| g.get(key)).cloned()
    }

    fn set(&mut self, group: &str, key: &str, value: Value) {
        self.groups
            .entry(group.to_owned())
            .or_default()
            .insert(key.to_owned(), value);
    }

    fn clear_group(&mut self, group: &str) {
        self.groups.remove(group);
    }

    fn group(&self, group: &str) -> BTreeMap<String, Value> {
        self.groups.get(group).cloned().unwrap_or_default()
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let file = ConfigFile {
            checksum: Some(checksum(&self.groups)?),
            groups: self.groups.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        crate::write_atomic(&self.path, content.as_bytes())?;
        tracing::trace!("committed configuration to {}", self.path.display());
        Ok(())
    }
}

/// In-memory [`ConfigStore`]; counts commits so tests can assert on them.
#[derive(Debug, Default, Clone)]
pub struct MemoryConfigStore {
    groups: Groups,
    committed: Groups,
    commits: usize,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    /// Value as of the last commit.
    pub fn committed(&self, group: &str, key: &str) -> Option<Value> {
        self.committed.get(group).and_then(|g| g.get(key)).cloned()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, group: &str, key: &str) -> Option<Value> {
        self.groups.get(group).and_then(|g| g.get(key)).cloned()
    }

    fn set(&mut self, group: &str, key: &str, value: Value) {
        self.groups
            .entry(group.to_owned())
            .or_default()
            .insert(key.to_owned(), value);
    }

    fn clear_group(&mut self, group: &str) {
        self.groups.remove(group);
    }

    fn group(&self, group: &str) -> BTreeMap<String, Value> {
        self.groups.get(group).cloned().unwrap_or_default()
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.committed = self.groups.clone();
        self.commits += 1;
        Ok(())
    }
}
