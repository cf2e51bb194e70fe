//! In-memory collaborators for exercising the orchestrator without touching
//! a real bundle directory or spawning processes.

use crate::dispatch::{DispatchRequest, WorkerLauncher};
use crate::handle::{BundleHandle, Dataset, DependencyResolver};
use crate::hooks::{BuildHook, BundleHooks, HookContext, MetaHook, TestHook, UpdateHook};
use crate::CoreError;
use databundle_schema::{
    AboutSection, BuildSection, BundleIdentity, BundleManifest, CoverageSection, Schema, SchemaIssue, TableDef,
};
use databundle_store::{
    ConfigStore, Coverage, FinalizeError, LibraryEntry, MemoryConfigStore, Partition,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Shared call counter; clones observe the same count.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome a [`MockPartition`] produces when finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptedFinalize {
    #[default]
    Succeed,
    NotImplemented,
    Configuration,
    Operational,
}

#[derive(Debug, Clone, Default)]
pub struct MockPartition {
    name: String,
    reference: bool,
    finalized: bool,
    script: ScriptedFinalize,
    coverage: Coverage,
    finalize_calls: CallCounter,
    close_calls: CallCounter,
}

impl MockPartition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_script(mut self, script: ScriptedFinalize) -> Self {
        self.script = script;
        self
    }

    #[must_use]
    pub fn as_reference(mut self) -> Self {
        self.reference = true;
        self
    }

    #[must_use]
    pub fn already_finalized(mut self) -> Self {
        self.finalized = true;
        self
    }

    #[must_use]
    pub fn with_coverage(mut self, coverage: Coverage) -> Self {
        self.coverage = coverage;
        self
    }

    pub fn finalize_calls(&self) -> CallCounter {
        self.finalize_calls.clone()
    }

    pub fn close_calls(&self) -> CallCounter {
        self.close_calls.clone()
    }

    pub fn boxed(self) -> Box<dyn Partition> {
        Box::new(self)
    }
}

impl Partition for MockPartition {
    fn identity(&self) -> &str {
        &self.name
    }

    fn is_reference(&self) -> bool {
        self.reference
    }

    fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn finalize(&mut self) -> Result<(), FinalizeError> {
        self.finalize_calls.incr();
        let partition = self.name.clone();
        match self.script {
            ScriptedFinalize::Succeed => {
                self.finalized = true;
                Ok(())
            }
            ScriptedFinalize::NotImplemented => Err(FinalizeError::NotImplemented {
                partition,
                reason: "no statistics for this kind".to_owned(),
            }),
            ScriptedFinalize::Configuration => Err(FinalizeError::Configuration {
                partition,
                message: "bad column definition".to_owned(),
            }),
            ScriptedFinalize::Operational => Err(FinalizeError::Operational {
                partition,
                message: "too many open files".to_owned(),
            }),
        }
    }

    fn close(&mut self) {
        self.close_calls.incr();
    }

    fn coverage(&self) -> Coverage {
        self.coverage.clone()
    }
}

/// A manifest with a complete `[about]` section and no sources.
pub fn sample_manifest() -> BundleManifest {
    BundleManifest {
        identity: BundleIdentity::new("dtest", "example.com", "mock", 1),
        about: AboutSection {
            title: "Mock bundle".to_owned(),
            summary: "Bundle used in tests".to_owned(),
            ..AboutSection::default()
        },
        build: BuildSection::default(),
        coverage: CoverageSection::default(),
        sources: Vec::new(),
    }
}

/// A schema with one described table.
pub fn sample_schema() -> Schema {
    Schema {
        tables: vec![TableDef {
            name: "rates".to_owned(),
            description: "Rates by year".to_owned(),
            columns: Vec::new(),
        }],
    }
}

/// In-memory [`Dataset`] that records the operations invoked on it.
#[derive(Debug, Clone)]
pub struct MockDataset {
    manifest: BundleManifest,
    schema: Schema,
    calls: Vec<String>,
    fail_on: BTreeSet<&'static str>,
    partitions_added: Vec<String>,
}

impl MockDataset {
    fn record(&mut self, op: &'static str) -> Result<(), CoreError> {
        self.calls.push(op.to_owned());
        if self.fail_on.contains(op) {
            return Err(CoreError::Dataset(format!("{op} failed")));
        }
        Ok(())
    }

    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    pub fn called(&self, op: &str) -> bool {
        self.calls.iter().any(|c| c == op)
    }
}

impl Dataset for MockDataset {
    fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn sync_sources(&mut self) -> Result<usize, CoreError> {
        self.record("sync_sources")?;
        Ok(self.manifest.sources.len())
    }

    fn clean(&mut self) -> Result<(), CoreError> {
        self.record("clean")
    }

    fn rebuild_schema(&mut self) -> Result<Vec<SchemaIssue>, CoreError> {
        self.record("rebuild_schema")?;
        Ok(self.schema.check(false))
    }

    fn recreate_partitions(&mut self) -> Result<usize, CoreError> {
        self.record("recreate_partitions")?;
        Ok(0)
    }

    fn load_schema(&mut self, fast: bool) -> Result<Vec<SchemaIssue>, CoreError> {
        self.record("load_schema")?;
        Ok(self.schema.check(fast))
    }

    fn update_configuration(&mut self) -> Result<(), CoreError> {
        self.record("update_configuration")
    }

    fn write_config(&mut self) -> Result<(), CoreError> {
        self.record("write_config")
    }

    fn move_revised_schema(&mut self) -> Result<bool, CoreError> {
        self.record("move_revised_schema")?;
        Ok(false)
    }

    fn write_sources(&mut self) -> Result<(), CoreError> {
        self.record("write_sources")
    }

    fn copy_schema_from(&mut self, _prior: &Path) -> Result<(), CoreError> {
        self.record("copy_schema_from")
    }

    fn copy_partitions_from(&mut self, _prior: &Path) -> Result<usize, CoreError> {
        self.record("copy_partitions_from")?;
        Ok(0)
    }

    fn set_coverage(&mut self, coverage: CoverageSection) -> Result<(), CoreError> {
        self.record("set_coverage")?;
        self.manifest.coverage = coverage;
        Ok(())
    }

    fn add_partition(&mut self, name: &str, _table: &str, _data: &[u8]) -> Result<(), CoreError> {
        self.record("add_partition")?;
        self.partitions_added.push(name.to_owned());
        Ok(())
    }
}

/// In-memory [`BundleHandle`] backed by a [`MemoryConfigStore`].
pub struct MockBundle {
    directory: PathBuf,
    dataset: MockDataset,
    store: MemoryConfigStore,
    partitions: Vec<Box<dyn Partition>>,
    exists: bool,
    closes: usize,
}

impl MockBundle {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            dataset: MockDataset {
                manifest: sample_manifest(),
                schema: sample_schema(),
                calls: Vec::new(),
                fail_on: BTreeSet::new(),
                partitions_added: Vec::new(),
            },
            store: MemoryConfigStore::new(),
            partitions: Vec::new(),
            exists: false,
            closes: 0,
        }
    }

    #[must_use]
    pub fn with_manifest(mut self, manifest: BundleManifest) -> Self {
        self.dataset.manifest = manifest;
        self
    }

    #[must_use]
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.dataset.schema = schema;
        self
    }

    #[must_use]
    pub fn with_partition(mut self, partition: Box<dyn Partition>) -> Self {
        self.partitions.push(partition);
        self
    }

    /// Make the named dataset operation (or `create_store`) fail.
    #[must_use]
    pub fn failing(mut self, op: &'static str) -> Self {
        self.dataset.fail_on.insert(op);
        self
    }

    #[must_use]
    pub fn with_existing_store(mut self) -> Self {
        self.exists = true;
        self
    }

    pub fn store(&self) -> &MemoryConfigStore {
        &self.store
    }

    pub fn mock_dataset(&self) -> &MockDataset {
        &self.dataset
    }

    pub fn partitions_added(&self) -> &[String] {
        &self.dataset.partitions_added
    }

    pub fn closes(&self) -> usize {
        self.closes
    }
}

impl BundleHandle for MockBundle {
    fn identity(&self) -> BundleIdentity {
        self.dataset.manifest.identity.clone()
    }

    fn directory(&self) -> &Path {
        &self.directory
    }

    fn dataset(&self) -> &dyn Dataset {
        &self.dataset
    }

    fn dataset_mut(&mut self) -> &mut dyn Dataset {
        &mut self.dataset
    }

    fn session(&mut self) -> &mut dyn ConfigStore {
        &mut self.store
    }

    fn config(&self) -> &dyn ConfigStore {
        &self.store
    }

    fn partitions(&mut self) -> Result<&mut [Box<dyn Partition>], CoreError> {
        Ok(&mut self.partitions)
    }

    fn store_exists(&self) -> bool {
        self.exists
    }

    fn create_store(&mut self) -> Result<(), CoreError> {
        self.dataset.record("create_store")?;
        self.exists = true;
        Ok(())
    }

    fn close(&mut self) {
        self.closes += 1;
    }
}

/// Resolver over a fixed list of installed bundles.
#[derive(Debug, Clone, Default)]
pub struct MockResolver {
    installed: Vec<LibraryEntry>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_installed(mut self, identity: BundleIdentity, directory: impl Into<PathBuf>) -> Self {
        self.installed.push(LibraryEntry {
            identity,
            directory: directory.into(),
            installed_at: chrono::Utc::now().to_rfc3339(),
        });
        self
    }
}

impl DependencyResolver for MockResolver {
    fn check_dependencies(&self, manifest: &BundleManifest) -> Result<(), CoreError> {
        for (name, reference) in &manifest.build.dependencies {
            let found = self.installed.iter().any(|e| {
                e.identity.id.as_str() == reference
                    || e.vid() == reference.as_str()
                    || e.identity.name() == *reference
            });
            if !found {
                return Err(CoreError::DependencyNotFound {
                    name: name.clone(),
                    reference: reference.clone(),
                });
            }
        }
        Ok(())
    }

    fn resolve(&self, identity: &BundleIdentity) -> Result<Option<LibraryEntry>, CoreError> {
        Ok(self
            .installed
            .iter()
            .filter(|e| e.identity.id == identity.id)
            .max_by_key(|e| e.identity.revision)
            .cloned())
    }
}

/// Launcher that records requests instead of spawning processes.
#[derive(Debug, Clone, Default)]
pub struct RecordingLauncher {
    requests: Arc<Mutex<Vec<DispatchRequest>>>,
    fail: bool,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A launcher whose every launch fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl WorkerLauncher for RecordingLauncher {
    fn launch(&self, request: &DispatchRequest) -> Result<(), CoreError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if self.fail {
            return Err(CoreError::Worker(format!("{} refused", request.operation)));
        }
        Ok(())
    }
}

/// Hooks whose results are fixed up front. A `None` result means the hook
/// is not provided.
#[derive(Debug, Clone, Default)]
pub struct ScriptedHooks {
    pub meta: Option<bool>,
    pub build: Option<bool>,
    pub update: Option<bool>,
    /// `Some(Err(message))` makes the test hook fail with `message`.
    pub test: Option<Result<(), String>>,
    calls: Arc<Mutex<Vec<&'static str>>>,
}

impl ScriptedHooks {
    pub fn building(result: bool) -> Self {
        Self::default().with_build(result)
    }

    #[must_use]
    pub fn with_meta(mut self, result: bool) -> Self {
        self.meta = Some(result);
        self
    }

    #[must_use]
    pub fn with_build(mut self, result: bool) -> Self {
        self.build = Some(result);
        self
    }

    #[must_use]
    pub fn with_update(mut self, result: bool) -> Self {
        self.update = Some(result);
        self
    }

    #[must_use]
    pub fn with_test(mut self, result: Result<(), String>) -> Self {
        self.test = Some(result);
        self
    }

    /// Hooks invoked so far, shared between clones.
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, hook: &'static str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(hook);
        }
    }
}

impl BundleHooks for ScriptedHooks {
    fn meta(&mut self) -> Option<&mut dyn MetaHook> {
        if self.meta.is_some() {
            Some(self as &mut dyn MetaHook)
        } else {
            None
        }
    }

    fn build(&mut self) -> Option<&mut dyn BuildHook> {
        if self.build.is_some() {
            Some(self as &mut dyn BuildHook)
        } else {
            None
        }
    }

    fn update(&mut self) -> Option<&mut dyn UpdateHook> {
        if self.update.is_some() {
            Some(self as &mut dyn UpdateHook)
        } else {
            None
        }
    }

    fn test(&mut self) -> Option<&mut dyn TestHook> {
        if self.test.is_some() {
            Some(self as &mut dyn TestHook)
        } else {
            None
        }
    }
}

impl MetaHook for ScriptedHooks {
    fn meta(&mut self, _ctx: &mut HookContext<'_>) -> Result<bool, CoreError> {
        self.record("meta");
        Ok(self.meta.unwrap_or(true))
    }
}

impl BuildHook for ScriptedHooks {
    fn build(&mut self, _ctx: &mut HookContext<'_>) -> Result<bool, CoreError> {
        self.record("build");
        Ok(self.build.unwrap_or(false))
    }
}

impl UpdateHook for ScriptedHooks {
    fn update(&mut self, _ctx: &mut HookContext<'_>) -> Result<bool, CoreError> {
        self.record("update");
        Ok(self.update.unwrap_or(false))
    }
}

impl TestHook for ScriptedHooks {
    fn test(&mut self, _ctx: &mut HookContext<'_>) -> Result<(), CoreError> {
        self.record("test");
        match &self.test {
            Some(Err(message)) => Err(CoreError::Dataset(message.clone())),
            _ => Ok(()),
        }
    }
}
