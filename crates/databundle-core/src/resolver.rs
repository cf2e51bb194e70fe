use crate::handle::DependencyResolver;
use crate::CoreError;
use databundle_schema::{BundleIdentity, BundleManifest};
use databundle_store::{Library, LibraryEntry};
use tracing::debug;

/// Resolves dependencies against an installed-bundle [`Library`].
///
/// A dependency reference may be a versioned id, an unversioned id, or a
/// bundle name; the highest installed revision wins.
#[derive(Debug, Clone)]
pub struct LibraryResolver {
    library: Library,
}

impl LibraryResolver {
    pub fn new(library: Library) -> Self {
        Self { library }
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    fn lookup(&self, reference: &str) -> Result<Option<LibraryEntry>, CoreError> {
        if let Some(entry) = self.library.resolve(reference)? {
            return Ok(Some(entry));
        }
        Ok(self.library.resolve_name(reference)?)
    }
}

impl DependencyResolver for LibraryResolver {
    fn check_dependencies(&self, manifest: &BundleManifest) -> Result<(), CoreError> {
        for (name, reference) in &manifest.build.dependencies {
            match self.lookup(reference)? {
                Some(entry) => debug!("dependency {name} resolved to {}", entry.identity),
                None => {
                    return Err(CoreError::DependencyNotFound {
                        name: name.clone(),
                        reference: reference.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    fn resolve(&self, identity: &BundleIdentity) -> Result<Option<LibraryEntry>, CoreError> {
        Ok(self.library.resolve(identity.id.as_str())?)
    }
}

/// Resolver for bundles built without a library: nothing is installed, so
/// any declared dependency is unmet.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyResolver;

impl DependencyResolver for EmptyResolver {
    fn check_dependencies(&self, manifest: &BundleManifest) -> Result<(), CoreError> {
        match manifest.build.dependencies.iter().next() {
            Some((name, reference)) => Err(CoreError::DependencyNotFound {
                name: name.clone(),
                reference: reference.clone(),
            }),
            None => Ok(()),
        }
    }

    fn resolve(&self, _identity: &BundleIdentity) -> Result<Option<LibraryEntry>, CoreError> {
        Ok(None)
    }
}
