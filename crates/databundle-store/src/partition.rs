use crate::layout::BundleLayout;
use crate::StoreError;
use databundle_schema::PartitionVid;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// Why a partition could not be finalized. The class decides what the
/// finalization loop does next.
#[derive(Debug, Error)]
pub enum FinalizeError {
    /// The partition kind has no statistics to compute.
    #[error("finalize is not implemented for partition {partition}: {reason}")]
    NotImplemented { partition: String, reason: String },
    /// The partition's own definition or data is malformed.
    #[error("configuration error in partition {partition}: {message}")]
    Configuration { partition: String, message: String },
    /// The environment failed: I/O, exhausted handles, unwritable store.
    #[error("operational error in partition {partition}: {message}")]
    Operational { partition: String, message: String },
}

/// Time, space, and grain a partition's rows cover.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Coverage {
    #[serde(default)]
    pub time: Vec<i32>,
    #[serde(default)]
    pub geo: Vec<String>,
    #[serde(default)]
    pub grain: Vec<String>,
}

/// A physical slice of a bundle's data, as seen by the finalization loop.
pub trait Partition {
    fn identity(&self) -> &str;

    /// Alias of a partition owned by another bundle revision.
    fn is_reference(&self) -> bool;

    fn is_finalized(&self) -> bool;

    /// Compute and persist summary statistics.
    fn finalize(&mut self) -> Result<(), FinalizeError>;

    /// Release any handle the partition holds. Must be safe to call twice.
    fn close(&mut self);

    fn coverage(&self) -> Coverage {
        Coverage::default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionStats {
    pub rows: u64,
    pub columns: usize,
    pub bytes: u64,
    /// Non-empty cells per column.
    pub non_empty: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionRecord {
    pub name: String,
    pub vid: PartitionVid,
    pub table: String,
    #[serde(default = "default_format")]
    pub format: String,
    /// Set when this partition aliases one from a prior revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<PartitionVid>,
    #[serde(default)]
    pub finalized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<PartitionStats>,
    #[serde(default)]
    pub coverage: Coverage,
    pub created_at: String,
}

fn default_format() -> String {
    "csv".to_owned()
}

impl PartitionRecord {
    pub fn new(name: &str, vid: PartitionVid, table: &str) -> Self {
        Self {
            name: name.to_owned(),
            vid,
            table: table.to_owned(),
            format: default_format(),
            reference: None,
            finalized: false,
            stats: None,
            coverage: Coverage::default(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// File-backed partition collection under `build/partitions/`: one JSON
/// record per partition plus its data file.
#[derive(Debug, Clone)]
pub struct PartitionStore {
    dir: PathBuf,
}

impl PartitionStore {
    pub fn new(layout: &BundleLayout) -> Self {
        Self {
            dir: layout.partitions_dir(),
        }
    }

    pub fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn data_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.csv"))
    }

    pub fn put(&self, record: &PartitionRecord) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(record)?;
        crate::write_atomic(&self.record_path(&record.name), content.as_bytes())
    }

    pub fn get(&self, name: &str) -> Result<PartitionRecord, StoreError> {
        let path = self.record_path(name);
        if !path.exists() {
            return Err(StoreError::PartitionNotFound(name.to_owned()));
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    /// Every record, ordered by name.
    pub fn list(&self) -> Result<Vec<PartitionRecord>, StoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_owned());
                }
            }
        }
        names.sort();
        names.iter().map(|n| self.get(n)).collect()
    }

    /// Delete every record and data file.
    pub fn remove_all(&self) -> Result<usize, StoreError> {
        let records = self.list()?;
        for record in &records {
            for path in [self.record_path(&record.name), self.data_path(&record.name)] {
                if path.exists() {
                    fs::remove_file(path)?;
                }
            }
        }
        Ok(records.len())
    }

    pub fn open(&self, name: &str) -> Result<FilePartition, StoreError> {
        Ok(FilePartition {
            store: self.clone(),
            record: self.get(name)?,
            reader: None,
        })
    }

    pub fn open_all(&self) -> Result<Vec<FilePartition>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .map(|record| FilePartition {
                store: self.clone(),
                record,
                reader: None,
            })
            .collect())
    }
}

/// A partition stored as CSV. Finalizing it scans the data once and writes
/// row, column, byte, and per-column fill counts into its record.
#[derive(Debug)]
pub struct FilePartition {
    store: PartitionStore,
    record: PartitionRecord,
    reader: Option<csv::Reader<File>>,
}

impl FilePartition {
    pub fn record(&self) -> &PartitionRecord {
        &self.record
    }

    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }
}

impl Partition for FilePartition {
    fn identity(&self) -> &str {
        &self.record.name
    }

    fn is_reference(&self) -> bool {
        self.record.reference.is_some()
    }

    fn is_finalized(&self) -> bool {
        self.record.finalized
    }

    fn finalize(&mut self) -> Result<(), FinalizeError> {
        let name = self.record.name.clone();
        if self.record.format != "csv" {
            return Err(FinalizeError::NotImplemented {
                partition: name,
                reason: format!("no statistics for format '{}'", self.record.format),
            });
        }

        let operational = |message: String| FinalizeError::Operational {
            partition: name.clone(),
            message,
        };
        let classify = |e: csv::Error| match e.kind() {
            csv::ErrorKind::Io(_) => FinalizeError::Operational {
                partition: name.clone(),
                message: e.to_string(),
            },
            _ => FinalizeError::Configuration {
                partition: name.clone(),
                message: e.to_string(),
            },
        };

        let path = self.store.data_path(&name);
        let file = File::open(&path)
            .map_err(|e| operational(format!("cannot open {}: {e}", path.display())))?;
        let bytes = file
            .metadata()
            .map_err(|e| operational(e.to_string()))?
            .len();
        let reader = self.reader.insert(
            csv::ReaderBuilder::new()
                .has_headers(true)
                .from_reader(file),
        );

        let headers = reader.headers().map_err(classify)?.clone();
        if headers.is_empty() || headers.iter().any(|h| h.trim().is_empty()) {
            return Err(FinalizeError::Configuration {
                partition: name.clone(),
                message: "missing or blank header".to_owned(),
            });
        }
        let year_col = headers.iter().position(|h| h.trim() == "year");

        let mut stats = PartitionStats {
            columns: headers.len(),
            bytes,
            non_empty: headers.iter().map(|h| (h.to_owned(), 0)).collect(),
            ..PartitionStats::default()
        };
        let mut years = BTreeSet::new();
        for row in reader.records() {
            let row = row.map_err(classify)?;
            stats.rows += 1;
            for (header, value) in headers.iter().zip(row.iter()) {
                if !value.trim().is_empty() {
                    *stats.non_empty.entry(header.to_owned()).or_default() += 1;
                }
            }
            if let Some(year) = year_col.and_then(|i| row.get(i)) {
                if let Ok(year) = year.trim().parse::<i32>() {
                    years.insert(year);
                }
            }
        }

        debug!("partition {name}: {} rows, {} columns", stats.rows, stats.columns);
        self.record.coverage.time.extend(years);
        self.record.coverage.time.sort_unstable();
        self.record.coverage.time.dedup();
        self.record.stats = Some(stats);
        self.record.finalized = true;
        self.store
            .put(&self.record)
            .map_err(|e| operational(e.to_string()))
    }

    fn close(&mut self) {
        self.reader = None;
    }

    fn coverage(&self) -> Coverage {
        self.record.coverage.clone()
    }
}
