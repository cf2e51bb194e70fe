//! Built-in bundle behaviour: every declared source becomes a csv partition.

use databundle_core::{
    BuildHook, BundleHooks, CoreError, Dispatcher, HookContext, OperationRegistry,
    ProcessLauncher,
};
use serde_json::{json, Value};
use std::fs;

pub const BUILD_SOURCE: &str = "build_source";

/// Hooks of a bundle whose build copies its sources into partitions.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceCopyBundle;

impl BundleHooks for SourceCopyBundle {
    fn build(&mut self) -> Option<&mut dyn BuildHook> {
        Some(self)
    }
}

impl BuildHook for SourceCopyBundle {
    fn build(&mut self, ctx: &mut HookContext<'_>) -> Result<bool, CoreError> {
        let names: Vec<Value> = ctx
            .handle
            .dataset()
            .manifest()
            .sources
            .iter()
            .map(|s| json!(s.name))
            .collect();
        if names.is_empty() {
            ctx.logger.warn("no sources declared; nothing to build");
            return Ok(true);
        }
        ctx.run_parallel(BUILD_SOURCE, names)?;
        Ok(true)
    }
}

/// Copy the named source into a partition of its table.
pub fn build_source(ctx: &mut HookContext<'_>, args: &[Value]) -> Result<(), CoreError> {
    let name = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::InvalidArguments {
            operation: BUILD_SOURCE.to_owned(),
            message: format!("expected a source name, got {args:?}"),
        })?;
    let source = ctx
        .handle
        .dataset()
        .manifest()
        .source(name)
        .cloned()
        .ok_or_else(|| CoreError::Dataset(format!("no source named '{name}'")))?;

    let path = ctx.handle.directory().join(&source.path);
    let data = fs::read(&path).map_err(|e| {
        CoreError::Dataset(format!("cannot read source {}: {e}", path.display()))
    })?;
    let table = source.table.as_deref().unwrap_or(&source.name);
    ctx.handle
        .dataset_mut()
        .add_partition(&source.name, table, &data)?;
    ctx.logger
        .info(&format!("built partition {} from {}", source.name, path.display()));
    Ok(())
}

/// Operations a worker process can be asked to run.
pub fn registry() -> OperationRegistry {
    let mut registry = OperationRegistry::new();
    registry.register(BUILD_SOURCE, build_source);
    registry
}

pub fn dispatcher() -> Dispatcher {
    Dispatcher::new(registry(), Box::new(ProcessLauncher::default()))
}
