use crate::handle::{BundleHandle, BundleOpener, Dataset};
use crate::options::RunOptions;
use crate::CoreError;
use databundle_schema::{
    parse_manifest_file, BundleIdentity, BundleManifest, CoverageSection, PartitionVid, Schema,
    SchemaIssue, SourceDef,
};
use databundle_store::state::KEY_DBCREATED;
use databundle_store::{
    BundleLayout, ConfigStore, FileConfigStore, Partition, PartitionRecord, PartitionStore,
    PROCESS_GROUP,
};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// A bundle backed by its directory: `bundle.toml`, `meta/`, and the
/// `build/` store.
pub struct FileBundle {
    layout: BundleLayout,
    manifest: BundleManifest,
    schema: Schema,
    config: FileConfigStore,
    partition_store: PartitionStore,
    partitions: Vec<Box<dyn Partition>>,
    sources: Vec<SourceDef>,
}

impl FileBundle {
    /// Open the bundle rooted at `directory`. The manifest must exist; the
    /// schema and store are optional until prepare.
    pub fn open(directory: &Path) -> Result<Self, CoreError> {
        let layout = BundleLayout::new(directory);
        let manifest = parse_manifest_file(layout.manifest_path())?;
        let schema = Schema::read(&layout.schema_path())?;
        let config = FileConfigStore::open(layout.config_path())?;
        let partition_store = PartitionStore::new(&layout);
        debug!("opened bundle {} at {}", manifest.identity, directory.display());
        Ok(Self {
            layout,
            manifest,
            schema,
            config,
            partition_store,
            partitions: Vec::new(),
            sources: Vec::new(),
        })
    }

    pub fn layout(&self) -> &BundleLayout {
        &self.layout
    }

    pub fn partition_store(&self) -> &PartitionStore {
        &self.partition_store
    }

    fn partition_vid(&self, name: &str) -> PartitionVid {
        PartitionVid::new(format!("{}.{name}", self.manifest.identity.vid()))
    }
}

impl Dataset for FileBundle {
    fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn sync_sources(&mut self) -> Result<usize, CoreError> {
        self.manifest = parse_manifest_file(self.layout.manifest_path())?;
        for source in &self.manifest.sources {
            if !self.layout.root().join(&source.path).exists() {
                warn!("source {} not found at {}", source.name, source.path);
            }
        }
        self.sources = self.manifest.sources.clone();
        Ok(self.sources.len())
    }

    fn clean(&mut self) -> Result<(), CoreError> {
        self.partitions.clear();
        let removed = self.partition_store.remove_all()?;
        debug!("removed {removed} partitions");

        if !self.manifest.sources.is_empty() {
            self.sources.clear();
            let path = self.layout.sources_path();
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        if Schema::read(&self.layout.schema_path())?.has_contents() {
            self.schema.tables.clear();
        }
        let revised = self.layout.revised_schema_path();
        if revised.exists() {
            fs::remove_file(revised)?;
        }
        Ok(())
    }

    fn rebuild_schema(&mut self) -> Result<Vec<SchemaIssue>, CoreError> {
        let (schema, issues) = Schema::load(&self.layout.schema_path(), false)?;
        self.schema = schema;
        Ok(issues)
    }

    fn recreate_partitions(&mut self) -> Result<usize, CoreError> {
        self.partitions.clear();
        Ok(self.partition_store.remove_all()?)
    }

    fn load_schema(&mut self, fast: bool) -> Result<Vec<SchemaIssue>, CoreError> {
        let (schema, issues) = Schema::load(&self.layout.schema_path(), fast)?;
        self.schema = schema;
        Ok(issues)
    }

    fn update_configuration(&mut self) -> Result<(), CoreError> {
        if let Some(created) = self
            .config
            .get(PROCESS_GROUP, KEY_DBCREATED)
            .and_then(|v| v.as_str().map(str::to_owned))
        {
            self.manifest.build.dbcreated = Some(created);
        }
        Ok(())
    }

    fn write_config(&mut self) -> Result<(), CoreError> {
        self.manifest.write_to_file(self.layout.manifest_path())?;
        Ok(())
    }

    fn move_revised_schema(&mut self) -> Result<bool, CoreError> {
        let revised = self.layout.revised_schema_path();
        if !revised.exists() {
            return Ok(false);
        }
        fs::rename(&revised, self.layout.schema_path())?;
        self.schema = Schema::read(&self.layout.schema_path())?;
        info!("moved revised schema into place");
        Ok(true)
    }

    fn write_sources(&mut self) -> Result<(), CoreError> {
        let content = serde_json::to_string_pretty(&self.sources)?;
        fs::create_dir_all(self.layout.meta_dir())?;
        fs::write(self.layout.sources_path(), content)?;
        Ok(())
    }

    fn copy_schema_from(&mut self, prior: &Path) -> Result<(), CoreError> {
        let source = BundleLayout::new(prior).schema_path();
        if !source.exists() {
            return Err(CoreError::Dataset(format!(
                "prior revision has no schema at {}",
                source.display()
            )));
        }
        fs::create_dir_all(self.layout.meta_dir())?;
        fs::copy(&source, self.layout.schema_path())?;
        self.schema = Schema::read(&self.layout.schema_path())?;
        Ok(())
    }

    fn copy_partitions_from(&mut self, prior: &Path) -> Result<usize, CoreError> {
        let prior_store = PartitionStore::new(&BundleLayout::new(prior));
        let mut copied = 0;
        for record in prior_store.list()? {
            if record.reference.is_some() || self.partition_store.get(&record.name).is_ok() {
                continue;
            }
            let alias = PartitionRecord {
                vid: self.partition_vid(&record.name),
                reference: Some(record.vid.clone()),
                created_at: chrono::Utc::now().to_rfc3339(),
                ..record
            };
            self.partition_store.put(&alias)?;
            copied += 1;
        }
        Ok(copied)
    }

    fn set_coverage(&mut self, coverage: CoverageSection) -> Result<(), CoreError> {
        self.manifest.coverage = coverage;
        Ok(())
    }

    fn add_partition(&mut self, name: &str, table: &str, data: &[u8]) -> Result<(), CoreError> {
        fs::create_dir_all(self.layout.partitions_dir())?;
        fs::write(self.partition_store.data_path(name), data)?;
        let record = PartitionRecord::new(name, self.partition_vid(name), table);
        self.partition_store.put(&record)?;
        Ok(())
    }
}

impl BundleHandle for FileBundle {
    fn identity(&self) -> BundleIdentity {
        self.manifest.identity.clone()
    }

    fn directory(&self) -> &Path {
        self.layout.root()
    }

    fn dataset(&self) -> &dyn Dataset {
        self
    }

    fn dataset_mut(&mut self) -> &mut dyn Dataset {
        self
    }

    fn session(&mut self) -> &mut dyn ConfigStore {
        &mut self.config
    }

    fn config(&self) -> &dyn ConfigStore {
        &self.config
    }

    fn partitions(&mut self) -> Result<&mut [Box<dyn Partition>], CoreError> {
        self.partitions = self
            .partition_store
            .open_all()?
            .into_iter()
            .map(|p| Box::new(p) as Box<dyn Partition>)
            .collect();
        Ok(&mut self.partitions)
    }

    fn store_exists(&self) -> bool {
        self.layout.store_exists()
    }

    fn create_store(&mut self) -> Result<(), CoreError> {
        self.layout.initialize()?;
        Ok(())
    }

    fn close(&mut self) {
        for partition in &mut self.partitions {
            partition.close();
        }
        self.partitions.clear();
    }
}

/// Opens [`FileBundle`]s for worker processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileOpener;

impl BundleOpener for FileOpener {
    fn open(
        &self,
        directory: &Path,
        _options: RunOptions,
    ) -> Result<Box<dyn BundleHandle>, CoreError> {
        Ok(Box::new(FileBundle::open(directory)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MANIFEST: &str = r#"
[identity]
id = "dtest"
source = "example.com"
dataset = "rates"
revision = 2

[about]
title = "Rates"
summary = "Interest rates"

[[sources]]
name = "rates"
path = "data/rates.csv"
"#;

    const SCHEMA: &str = r#"
[[tables]]
name = "rates"
description = "Rates by year"

[[tables.columns]]
name = "year"
datatype = "int"
"#;

    fn bundle_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bundle.toml"), MANIFEST).unwrap();
        fs::create_dir_all(dir.path().join("meta")).unwrap();
        fs::write(dir.path().join("meta/schema.toml"), SCHEMA).unwrap();
        dir
    }

    #[test]
    fn open_reads_manifest_and_schema() {
        let dir = bundle_dir();
        let bundle = FileBundle::open(dir.path()).unwrap();
        assert_eq!(bundle.identity().vid(), "dtest002");
        assert_eq!(bundle.schema().tables.len(), 1);
        assert!(!bundle.store_exists());
    }

    #[test]
    fn open_without_manifest_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FileBundle::open(dir.path()),
            Err(CoreError::Manifest(_))
        ));
    }

    #[test]
    fn add_partition_and_enumerate() {
        let dir = bundle_dir();
        let mut bundle = FileBundle::open(dir.path()).unwrap();
        bundle.create_store().unwrap();
        bundle
            .add_partition("rates", "rates", b"year,rate\n2010,1.5\n")
            .unwrap();

        let parts = bundle.partitions().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].identity(), "rates");
        parts[0].finalize().unwrap();
        bundle.close();

        let record = bundle.partition_store().get("rates").unwrap();
        assert!(record.finalized);
        assert_eq!(record.vid, "dtest002.rates");
    }

    #[test]
    fn clean_drops_generated_state_only() {
        let dir = bundle_dir();
        let mut bundle = FileBundle::open(dir.path()).unwrap();
        bundle.create_store().unwrap();
        bundle.sync_sources().unwrap();
        bundle.write_sources().unwrap();
        bundle.add_partition("rates", "rates", b"year\n2010\n").unwrap();

        bundle.clean().unwrap();

        assert!(bundle.partition_store().list().unwrap().is_empty());
        assert!(!bundle.layout().sources_path().exists());
        assert!(bundle.schema().tables.is_empty());
        assert!(bundle.layout().schema_path().exists());
        assert!(bundle.layout().manifest_path().exists());
    }

    #[test]
    fn clean_keeps_tables_without_a_schema_file() {
        let dir = bundle_dir();
        fs::remove_file(dir.path().join("meta/schema.toml")).unwrap();
        let mut bundle = FileBundle::open(dir.path()).unwrap();
        bundle.schema = databundle_schema::Schema::parse_str(SCHEMA).unwrap();
        bundle.clean().unwrap();
        assert_eq!(bundle.schema().tables.len(), 1);
    }

    #[test]
    fn update_configuration_carries_dbcreated() {
        let dir = bundle_dir();
        let mut bundle = FileBundle::open(dir.path()).unwrap();
        bundle
            .session()
            .set(PROCESS_GROUP, KEY_DBCREATED, json!("2015-06-01T00:00:00Z"));
        bundle.update_configuration().unwrap();
        bundle.write_config().unwrap();

        let reopened = FileBundle::open(dir.path()).unwrap();
        assert_eq!(
            reopened.manifest().build.dbcreated.as_deref(),
            Some("2015-06-01T00:00:00Z")
        );
    }

    #[test]
    fn revised_schema_is_moved_into_place() {
        let dir = bundle_dir();
        let mut bundle = FileBundle::open(dir.path()).unwrap();
        assert!(!bundle.move_revised_schema().unwrap());

        bundle.create_store().unwrap();
        fs::write(
            bundle.layout().revised_schema_path(),
            "[[tables]]\nname = \"revised\"\ndescription = \"Revised\"\n",
        )
        .unwrap();
        assert!(bundle.move_revised_schema().unwrap());
        assert_eq!(bundle.schema().tables[0].name, "revised");
        assert!(!bundle.layout().revised_schema_path().exists());
    }

    #[test]
    fn copy_from_prior_revision_creates_references() {
        let prior_dir = bundle_dir();
        let mut prior = FileBundle::open(prior_dir.path()).unwrap();
        prior.create_store().unwrap();
        prior.add_partition("rates", "rates", b"year\n2010\n").unwrap();

        let dir = bundle_dir();
        fs::remove_file(dir.path().join("meta/schema.toml")).unwrap();
        let mut bundle = FileBundle::open(dir.path()).unwrap();
        bundle.create_store().unwrap();

        bundle.copy_schema_from(prior_dir.path()).unwrap();
        assert_eq!(bundle.schema().tables.len(), 1);

        assert_eq!(bundle.copy_partitions_from(prior_dir.path()).unwrap(), 1);
        assert_eq!(bundle.copy_partitions_from(prior_dir.path()).unwrap(), 0);
        let parts = bundle.partitions().unwrap();
        assert!(parts[0].is_reference());
    }
}
