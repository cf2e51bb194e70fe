//! Fan-out of per-item work to worker processes.
//!
//! A live orchestrator holds open store handles and cannot cross a process
//! boundary, so work is described as a [`DispatchRequest`] naming the bundle
//! directory and a registered operation. Each worker re-opens the bundle and
//! resolves the operation through its own [`OperationRegistry`].

use crate::handle::BundleOpener;
use crate::hooks::HookContext;
use crate::logger::{BundleLogger, FatalMode};
use crate::options::RunOptions;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error};

/// A unit of work that can be invoked by name.
pub type Operation = fn(&mut HookContext<'_>, &[Value]) -> Result<(), CoreError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub directory: PathBuf,
    pub operation: String,
    pub args: Vec<Value>,
    pub options: RunOptions,
}

#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: BTreeMap<String, Operation>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: &str, operation: Operation) -> &mut Self {
        self.operations.insert(id.to_owned(), operation);
        self
    }

    pub fn get(&self, id: &str) -> Option<Operation> {
        self.operations.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.operations.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.operations.keys()).finish()
    }
}

/// Runs one request to completion somewhere outside the caller.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, request: &DispatchRequest) -> Result<(), CoreError>;
}

/// Launches each request as a child process that reads the request as JSON
/// from stdin. By default the child is the current executable run with the
/// `worker` subcommand.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: Option<PathBuf>,
    args: Vec<String>,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["worker".to_owned()],
        }
    }
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            program: Some(program.into()),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
        }
    }

    fn program(&self) -> Result<PathBuf, CoreError> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe().map_err(|e| {
                CoreError::Worker(format!("failed to resolve current executable: {e}"))
            }),
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, request: &DispatchRequest) -> Result<(), CoreError> {
        let program = self.program()?;
        let payload = serde_json::to_vec(request)?;

        let mut child = Command::new(&program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| {
                CoreError::Worker(format!("failed to spawn {}: {e}", program.display()))
            })?;
        debug!("spawned worker {} for {}", child.id(), request.operation);

        // The pipe closes when `stdin` drops, before the child is reaped.
        let sent = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(&payload),
            None => Ok(()),
        };
        let status = child.wait()?;
        if !status.success() {
            return Err(CoreError::Worker(format!(
                "worker for {} exited with {status}",
                request.operation
            )));
        }
        sent.map_err(|e| {
            CoreError::Worker(format!(
                "failed to send {} request to worker: {e}",
                request.operation
            ))
        })
    }
}

/// Take the next queued request. A poisoned queue is still drained.
fn next_request(queue: &Mutex<VecDeque<DispatchRequest>>) -> Option<DispatchRequest> {
    queue
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .pop_front()
}

/// Operation registry plus the launcher used when work leaves the process.
pub struct Dispatcher {
    registry: OperationRegistry,
    launcher: Box<dyn WorkerLauncher>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(OperationRegistry::new(), Box::new(ProcessLauncher::default()))
    }
}

impl Dispatcher {
    pub fn new(registry: OperationRegistry, launcher: Box<dyn WorkerLauncher>) -> Self {
        Self { registry, launcher }
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn operation(&self, id: &str) -> Result<Operation, CoreError> {
        self.registry
            .get(id)
            .ok_or_else(|| CoreError::UnknownOperation(id.to_owned()))
    }

    /// Run every request on at most `workers` concurrent launches. Failed
    /// requests are logged; once all have run, any failure is reported as
    /// [`CoreError::WorkerFailed`].
    pub fn dispatch(&self, requests: Vec<DispatchRequest>, workers: usize) -> Result<(), CoreError> {
        let total = requests.len();
        if total == 0 {
            return Ok(());
        }
        for request in &requests {
            self.operation(&request.operation)?;
        }

        let queue = Mutex::new(VecDeque::from(requests));
        let failed = AtomicUsize::new(0);
        let launcher = self.launcher.as_ref();

        std::thread::scope(|scope| {
            for _ in 0..workers.clamp(1, total) {
                scope.spawn(|| loop {
                    let Some(request) = next_request(&queue) else { break };
                    if let Err(e) = launcher.launch(&request) {
                        error!(
                            "{} {:?} failed in {}: {e}",
                            request.operation,
                            request.args,
                            request.directory.display()
                        );
                        failed.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        match failed.into_inner() {
            0 => Ok(()),
            failed => Err(CoreError::WorkerFailed { failed, total }),
        }
    }
}

/// Worker-side half of a dispatch: re-open the bundle named by `request` and
/// invoke its operation. Nested fan-out inside a worker runs serially.
pub fn run_worker(
    request: &DispatchRequest,
    opener: &dyn BundleOpener,
    registry: &OperationRegistry,
) -> Result<(), CoreError> {
    let operation = registry
        .get(&request.operation)
        .ok_or_else(|| CoreError::UnknownOperation(request.operation.clone()))?;
    let mut handle = opener.open(&request.directory, request.options)?;
    let mut logger = BundleLogger::new(&handle.identity().vname(), FatalMode::Raise);
    let dispatcher = Dispatcher::new(registry.clone(), Box::new(ProcessLauncher::default()));

    let mut ctx = HookContext {
        handle: handle.as_mut(),
        logger: &mut logger,
        options: RunOptions {
            multi: 1,
            ..request.options
        },
        dispatcher: &dispatcher,
    };
    let result = operation(&mut ctx, &request.args);
    handle.close();
    result
}
