use crate::manifest::ManifestError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Datatypes a column may declare in `schema.toml`.
pub const KNOWN_DATATYPES: &[&str] = &[
    "int", "integer", "real", "float", "text", "str", "date", "datetime", "bool", "geometry",
];

/// Table definitions of a bundle, read from `meta/schema.toml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Schema {
    #[serde(default)]
    pub tables: Vec<TableDef>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TableDef {
    pub name: String,
    /// Human-readable title of the table; required before a bundle may be prepared.
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub columns: Vec<ColumnDef>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ColumnDef {
    pub name: String,
    #[serde(default = "default_datatype")]
    pub datatype: String,
    #[serde(default)]
    pub description: String,
}

fn default_datatype() -> String {
    "text".to_owned()
}

/// A problem found while loading a schema. `column` is `None` for table-level issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaIssue {
    pub table: String,
    pub column: Option<String>,
    pub message: String,
}

impl std::fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.column {
            Some(column) => write!(f, "{}.{}: {}", self.table, column, self.message),
            None => write!(f, "{}: {}", self.table, self.message),
        }
    }
}

impl Schema {
    pub fn parse_str(input: &str) -> Result<Self, ManifestError> {
        Ok(toml::from_str(input)?)
    }

    /// Read a schema file. A missing file yields an empty schema.
    pub fn read(path: &Path) -> Result<Self, ManifestError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::parse_str(&fs::read_to_string(path)?)
    }

    /// Read a schema file and check it. With `fast` set, per-column checks are
    /// skipped and only table-level issues are reported.
    pub fn load(path: &Path, fast: bool) -> Result<(Self, Vec<SchemaIssue>), ManifestError> {
        let schema = Self::read(path)?;
        let issues = schema.check(fast);
        Ok((schema, issues))
    }

    pub fn check(&self, fast: bool) -> Vec<SchemaIssue> {
        let mut issues = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        for table in &self.tables {
            if !seen.insert(table.name.as_str()) {
                issues.push(SchemaIssue {
                    table: table.name.clone(),
                    column: None,
                    message: "table is defined more than once".to_owned(),
                });
            }
            if fast {
                continue;
            }
            for column in &table.columns {
                if column.name.trim().is_empty() {
                    issues.push(SchemaIssue {
                        table: table.name.clone(),
                        column: None,
                        message: "column with an empty name".to_owned(),
                    });
                } else if !KNOWN_DATATYPES.contains(&column.datatype.as_str()) {
                    issues.push(SchemaIssue {
                        table: table.name.clone(),
                        column: Some(column.name.clone()),
                        message: format!("unknown datatype '{}'", column.datatype),
                    });
                }
            }
        }
        issues
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn has_contents(&self) -> bool {
        !self.tables.is_empty()
    }

    /// Every table whose description is blank. All tables are inspected.
    pub fn missing_descriptions(&self) -> Vec<&TableDef> {
        self.tables
            .iter()
            .filter(|t| t.description.trim().is_empty())
            .collect()
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), ManifestError> {
        let content = toml::to_string_pretty(self)?;
        crate::write_atomic(path.as_ref(), &content)?;
        Ok(())
    }
}
