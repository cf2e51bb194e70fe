//! Build orchestration for databundle bundles.
//!
//! This crate drives a bundle through its pipeline (sync, clean, meta,
//! prepare, build, update, finalize, install) with the [`StateMachine`].
//! The orchestrator talks to the bundle only through the [`BundleHandle`],
//! [`Dataset`], and [`DependencyResolver`] seams, so the file-backed
//! [`FileBundle`] and the test doubles in [`mock`] are interchangeable. Work
//! that fans out across processes goes through the dispatcher in
//! [`dispatch`], and cross-process exclusion over a bundle is available
//! through [`StoreLock`].

pub mod bundle;
pub mod concurrency;
pub mod config;
pub mod coverage;
pub mod dispatch;
pub mod finalize;
pub mod handle;
pub mod hooks;
pub mod logger;
pub mod machine;
pub mod mock;
pub mod options;
pub mod resolver;

pub use bundle::{FileBundle, FileOpener};
pub use concurrency::StoreLock;
pub use config::LibraryConfig;
pub use dispatch::{
    run_worker, DispatchRequest, Dispatcher, Operation, OperationRegistry, ProcessLauncher,
    WorkerLauncher,
};
pub use finalize::{post_build_finalize, FinalizeSummary};
pub use handle::{BundleHandle, BundleOpener, Dataset, DependencyResolver};
pub use hooks::{BuildHook, BundleHooks, HookContext, MetaHook, NoHooks, TestHook, UpdateHook};
pub use logger::{BundleLogger, FatalMode};
pub use machine::{PhaseOutcome, StateMachine};
pub use options::RunOptions;
pub use resolver::{EmptyResolver, LibraryResolver};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("manifest error: {0}")]
    Manifest(#[from] databundle_schema::ManifestError),
    #[error("store error: {0}")]
    Store(#[from] databundle_store::StoreError),
    #[error("partition error: {0}")]
    Finalize(#[from] databundle_store::FinalizeError),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("dependency '{name}' not found in library: {reference}")]
    DependencyNotFound { name: String, reference: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("dataset error: {0}")]
    Dataset(String),
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error("invalid arguments for {operation}: {message}")]
    InvalidArguments { operation: String, message: String },
    #[error("{failed} of {total} worker requests failed")]
    WorkerFailed { failed: usize, total: usize },
    #[error("worker error: {0}")]
    Worker(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Fatal errors end the run instead of being reported as a failed phase.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Fatal(_))
    }
}
