use crate::options::RunOptions;
use crate::CoreError;
use databundle_schema::{BundleIdentity, BundleManifest, CoverageSection, Schema, SchemaIssue};
use databundle_store::{BundleLayout, ConfigStore, LibraryEntry, Partition};
use std::path::{Path, PathBuf};

/// The generated contents of a bundle: its manifest, schema, synchronized
/// sources, and partitions.
pub trait Dataset {
    fn manifest(&self) -> &BundleManifest;

    fn schema(&self) -> &Schema;

    /// Reload the declared sources. Returns how many were synchronized.
    fn sync_sources(&mut self) -> Result<usize, CoreError>;

    /// Drop generated partitions, and drop synchronized sources and loaded
    /// tables only when their declarative inputs can regenerate them.
    fn clean(&mut self) -> Result<(), CoreError>;

    /// Reload the full schema from `meta/schema.toml`, validating every column.
    fn rebuild_schema(&mut self) -> Result<Vec<SchemaIssue>, CoreError>;

    /// Remove every partition so the next build regenerates them.
    fn recreate_partitions(&mut self) -> Result<usize, CoreError>;

    fn load_schema(&mut self, fast: bool) -> Result<Vec<SchemaIssue>, CoreError>;

    /// Fold persisted process values back into the manifest.
    fn update_configuration(&mut self) -> Result<(), CoreError>;

    /// Write the manifest back to `bundle.toml`.
    fn write_config(&mut self) -> Result<(), CoreError>;

    /// Move a schema revised during a build over the declared one. Returns
    /// whether there was one to move.
    fn move_revised_schema(&mut self) -> Result<bool, CoreError>;

    fn write_sources(&mut self) -> Result<(), CoreError>;

    /// Copy the schema of a prior revision installed at `prior`.
    fn copy_schema_from(&mut self, prior: &Path) -> Result<(), CoreError>;

    /// Create reference partitions aliasing those of a prior revision.
    fn copy_partitions_from(&mut self, prior: &Path) -> Result<usize, CoreError>;

    fn set_coverage(&mut self, coverage: CoverageSection) -> Result<(), CoreError>;

    /// Store `data` as a new csv partition of `table`.
    fn add_partition(&mut self, name: &str, table: &str, data: &[u8]) -> Result<(), CoreError>;
}

/// What the orchestrator may see of a bundle.
pub trait BundleHandle {
    fn identity(&self) -> BundleIdentity;

    fn directory(&self) -> &Path;

    fn dataset(&self) -> &dyn Dataset;

    fn dataset_mut(&mut self) -> &mut dyn Dataset;

    /// The unit of work phase state is written to. Nothing is durable until
    /// it is committed.
    fn session(&mut self) -> &mut dyn ConfigStore;

    fn config(&self) -> &dyn ConfigStore;

    /// The live partition collection, in enumeration order.
    fn partitions(&mut self) -> Result<&mut [Box<dyn Partition>], CoreError>;

    fn store_exists(&self) -> bool;

    fn create_store(&mut self) -> Result<(), CoreError>;

    /// Release any open partition or store handles.
    fn close(&mut self);

    fn meta_marker(&self) -> PathBuf {
        BundleLayout::new(self.directory()).meta_marker()
    }
}

/// Looks up other bundles in the library.
pub trait DependencyResolver {
    /// Fail with [`CoreError::DependencyNotFound`] for the first declared
    /// dependency that cannot be resolved.
    fn check_dependencies(&self, manifest: &BundleManifest) -> Result<(), CoreError>;

    /// The highest installed revision sharing `identity`'s id, if any.
    fn resolve(&self, identity: &BundleIdentity) -> Result<Option<LibraryEntry>, CoreError>;
}

/// Re-opens a bundle from its directory, used by worker processes.
pub trait BundleOpener {
    fn open(&self, directory: &Path, options: RunOptions)
        -> Result<Box<dyn BundleHandle>, CoreError>;
}
