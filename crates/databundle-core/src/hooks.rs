use crate::dispatch::{DispatchRequest, Dispatcher};
use crate::handle::BundleHandle;
use crate::logger::BundleLogger;
use crate::options::{resolve_parallelism, RunOptions};
use crate::CoreError;
use serde_json::Value;

/// Everything a hook or a dispatched operation may touch while it runs.
pub struct HookContext<'a> {
    pub handle: &'a mut dyn BundleHandle,
    pub logger: &'a mut BundleLogger,
    pub options: RunOptions,
    pub dispatcher: &'a Dispatcher,
}

impl HookContext<'_> {
    /// Run `operation` once per argument set with the configured degree of
    /// parallelism.
    pub fn run_parallel(&mut self, operation: &str, arg_sets: Vec<Value>) -> Result<(), CoreError> {
        let degree = self.options.multi;
        self.run_parallel_with(operation, arg_sets, degree)
    }

    /// Run `operation` once per argument set on up to `degree` workers.
    ///
    /// An array is taken as a positional argument list; any other value is
    /// passed as the single argument. With one worker every call happens in
    /// order, in this process. Otherwise each set becomes a
    /// [`DispatchRequest`] and workers re-open the bundle themselves, in no
    /// particular order.
    pub fn run_parallel_with(
        &mut self,
        operation: &str,
        arg_sets: Vec<Value>,
        degree: usize,
    ) -> Result<(), CoreError> {
        if arg_sets.is_empty() {
            return Ok(());
        }
        let arg_sets: Vec<Vec<Value>> = arg_sets.into_iter().map(into_args).collect();
        let degree = resolve_parallelism(degree);

        if degree == 1 {
            let op = self.dispatcher.operation(operation)?;
            for args in &arg_sets {
                op(self, args)?;
            }
            return Ok(());
        }

        let directory = self.handle.directory().to_path_buf();
        let requests = arg_sets
            .into_iter()
            .map(|args| DispatchRequest {
                directory: directory.clone(),
                operation: operation.to_owned(),
                args,
                options: self.options,
            })
            .collect();
        self.logger
            .info(&format!("dispatching {operation} to {degree} workers"));
        self.dispatcher.dispatch(requests, degree)
    }
}

fn into_args(value: Value) -> Vec<Value> {
    match value {
        Value::Array(args) => args,
        scalar => vec![scalar],
    }
}

pub trait MetaHook {
    fn meta(&mut self, ctx: &mut HookContext<'_>) -> Result<bool, CoreError>;
}

pub trait BuildHook {
    fn build(&mut self, ctx: &mut HookContext<'_>) -> Result<bool, CoreError>;
}

pub trait UpdateHook {
    fn update(&mut self, ctx: &mut HookContext<'_>) -> Result<bool, CoreError>;
}

/// Post-build checks. An error fails the build.
pub trait TestHook {
    fn test(&mut self, ctx: &mut HookContext<'_>) -> Result<(), CoreError>;
}

/// The optional capabilities of a concrete bundle. A `None` means the bundle
/// does not provide that hook.
pub trait BundleHooks {
    fn meta(&mut self) -> Option<&mut dyn MetaHook> {
        None
    }

    fn build(&mut self) -> Option<&mut dyn BuildHook> {
        None
    }

    fn update(&mut self) -> Option<&mut dyn UpdateHook> {
        None
    }

    fn test(&mut self) -> Option<&mut dyn TestHook> {
        None
    }
}

/// A bundle with no hooks at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl BundleHooks for NoHooks {}
