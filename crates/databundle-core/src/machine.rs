//! The persisted phase state machine that drives a bundle through its
//! pipeline.
//!
//! Each `do_*` method wraps a `pre → main → post` sequence. The `pre` step is
//! the idempotency guard: it decides whether the phase is skipped, refused, or
//! run. Failures inside a phase body are logged, recorded as the bundle's error
//! marker, and reported as [`PhaseOutcome::Failed`]; only a fatal error or a
//! failure to persist state escapes as `Err`.

use crate::coverage;
use crate::dispatch::Dispatcher;
use crate::finalize::post_build_finalize;
use crate::handle::{BundleHandle, DependencyResolver};
use crate::hooks::{BundleHooks, HookContext, NoHooks};
use crate::logger::{BundleLogger, FatalMode};
use crate::options::RunOptions;
use crate::resolver::EmptyResolver;
use crate::CoreError;
use databundle_store::state::{
    now_epoch, now_rfc3339, set_build_state, BuildMarker, KEY_BUILDTIME, KEY_BUILT,
    KEY_DBCREATED, KEY_PREPARED, KEY_UPDATED, KEY_UPDATETIME, PROCESS_GROUP,
};
use databundle_store::{Coverage, Library, Phase, StateRecord};
use serde_json::{json, Value};
use std::fmt;
use std::fs;
use std::path::PathBuf;

/// Result of one phase invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Nothing to do: the phase already ran or its preconditions asked to skip.
    Skipped,
    Failed,
    Ran,
}

impl PhaseOutcome {
    pub fn succeeded(self) -> bool {
        !matches!(self, PhaseOutcome::Failed)
    }
}

impl fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PhaseOutcome::Skipped => "skipped",
            PhaseOutcome::Failed => "failed",
            PhaseOutcome::Ran => "done",
        })
    }
}

fn hook_context<'a, H: BundleHandle + 'a>(
    handle: &'a mut H,
    logger: &'a mut BundleLogger,
    options: RunOptions,
    dispatcher: &'a Dispatcher,
) -> HookContext<'a> {
    HookContext {
        handle,
        logger,
        options,
        dispatcher,
    }
}

fn find_on_path(tool: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}

/// Orchestrator for one bundle.
pub struct StateMachine<H: BundleHandle> {
    handle: H,
    hooks: Box<dyn BundleHooks>,
    resolver: Box<dyn DependencyResolver>,
    dispatcher: Dispatcher,
    logger: BundleLogger,
    options: RunOptions,
    started: Option<f64>,
    /// Set once `--clean` has been honored by this machine.
    cleaned: bool,
}

impl<H: BundleHandle> StateMachine<H> {
    pub fn new(handle: H, options: RunOptions) -> Self {
        let logger = BundleLogger::new(&handle.identity().vname(), FatalMode::default());
        Self {
            handle,
            hooks: Box::new(NoHooks),
            resolver: Box::new(EmptyResolver),
            dispatcher: Dispatcher::default(),
            logger,
            options,
            started: None,
            cleaned: false,
        }
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: impl BundleHooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: impl DependencyResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Replace the logger with one in `mode`. Messages already recorded are
    /// dropped.
    #[must_use]
    pub fn with_fatal_mode(mut self, mode: FatalMode) -> Self {
        self.logger = BundleLogger::new(&self.handle.identity().vname(), mode);
        self
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    pub fn into_handle(self) -> H {
        self.handle
    }

    pub fn logger(&self) -> &BundleLogger {
        &self.logger
    }

    pub fn options(&self) -> RunOptions {
        self.options
    }

    // ---- state ----

    pub fn state_record(&self) -> StateRecord {
        StateRecord::load(self.handle.config())
    }

    pub fn state(&self) -> Option<Phase> {
        self.state_record().current
    }

    /// When the last phase failed, as seconds since the epoch.
    pub fn error_state(&self) -> Option<f64> {
        self.state_record().error
    }

    fn set_state(&mut self, phase: Phase) {
        StateRecord::enter(self.handle.session(), phase);
    }

    fn set_error_state(&mut self) {
        StateRecord::mark_error(self.handle.session());
    }

    fn set_build_state(&mut self, marker: BuildMarker) {
        set_build_state(self.handle.session(), marker);
    }

    fn commit(&mut self) -> Result<(), CoreError> {
        self.handle.session().commit()?;
        Ok(())
    }

    /// Forget every phase marker and the phase record.
    pub fn clear_states(&mut self) -> Result<(), CoreError> {
        self.forget_states();
        self.commit()
    }

    fn forget_states(&mut self) {
        let session = self.handle.session();
        session.clear_group(PROCESS_GROUP);
        StateRecord::clear(session);
    }

    /// Record a soft failure and persist it.
    fn fail(&mut self, message: &str) -> Result<PhaseOutcome, CoreError> {
        self.logger.error(message);
        self.set_error_state();
        self.commit()?;
        Ok(PhaseOutcome::Failed)
    }

    /// Turn the result of a phase body into success or soft failure. Fatal
    /// errors keep propagating.
    fn settle(&mut self, step: &str, result: Result<bool, CoreError>) -> Result<bool, CoreError> {
        match result {
            Ok(ok) => Ok(ok),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.logger.error(&format!("{step} failed: {e}"));
                Ok(false)
            }
        }
    }

    fn refuse_if_finalized(&mut self, phase: &str) -> bool {
        if self.is_finalized() {
            self.logger
                .error(&format!("cannot {phase}: bundle is finalized"));
            return true;
        }
        false
    }

    pub fn is_prepared(&self) -> bool {
        self.handle.store_exists()
            && !self.options.rebuild
            && self.handle.config().is_set(PROCESS_GROUP, KEY_PREPARED)
    }

    pub fn is_built(&self) -> bool {
        let config = self.handle.config();
        self.handle.store_exists()
            && (config.is_set(PROCESS_GROUP, KEY_BUILT) || config.is_set(PROCESS_GROUP, KEY_UPDATED))
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self.state(), Some(Phase::Finalized | Phase::Installed))
    }

    // ---- sync ----

    /// Synchronize the declared sources into the dataset.
    pub fn sync(&mut self) -> Result<PhaseOutcome, CoreError> {
        if self.refuse_if_finalized("sync") {
            return Ok(PhaseOutcome::Failed);
        }
        match self.handle.dataset_mut().sync_sources() {
            Ok(count) => self.logger.info(&format!("synchronized {count} sources")),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => return self.fail(&format!("sync failed: {e}")),
        }
        self.set_state(Phase::Synced);
        self.commit()?;
        Ok(PhaseOutcome::Ran)
    }

    // ---- clean ----

    pub fn do_clean(&mut self) -> Result<PhaseOutcome, CoreError> {
        if self.refuse_if_finalized("clean") {
            return Ok(PhaseOutcome::Failed);
        }
        if self.state() == Some(Phase::Cleaned) && !self.options.force && !self.options.clean {
            self.logger.info("already clean, skipping");
            return Ok(PhaseOutcome::Skipped);
        }

        self.cleaned = true;
        self.logger.info("---- cleaning ----");
        self.forget_states();
        self.set_state(Phase::Cleaning);

        let result = self.clean();
        let mut ok = self.settle("clean", result)?;
        if ok {
            let result = self.post_clean();
            ok = self.settle("post-clean", result)?;
        }

        let outcome = if ok {
            self.logger.info("done cleaning");
            self.set_state(Phase::Cleaned);
            PhaseOutcome::Ran
        } else {
            self.logger.error("cleaning ended in failure");
            self.set_state(Phase::Cleaning);
            self.set_error_state();
            PhaseOutcome::Failed
        };
        self.commit()?;
        Ok(outcome)
    }

    /// Drop generated content.
    pub fn clean(&mut self) -> Result<bool, CoreError> {
        self.handle.dataset_mut().clean()?;
        Ok(true)
    }

    /// Honor `--clean` once per machine: the first phase entered cleans the
    /// bundle before anything else runs. `false` means the clean failed.
    fn clean_if_requested(&mut self, phase: &str) -> Result<bool, CoreError> {
        if !self.options.clean || self.cleaned {
            return Ok(true);
        }
        if self.do_clean()?.succeeded() {
            return Ok(true);
        }
        self.logger
            .error(&format!("clean failed; skipping {phase}"));
        Ok(false)
    }

    pub fn post_clean(&mut self) -> Result<bool, CoreError> {
        Ok(true)
    }

    // ---- meta ----

    /// Run the meta hook once, leaving a marker file behind. The phase record
    /// is not touched.
    pub fn do_meta(&mut self) -> Result<PhaseOutcome, CoreError> {
        if !self.clean_if_requested("meta")? {
            return Ok(PhaseOutcome::Failed);
        }
        let marker = self.handle.meta_marker();
        if marker.exists() && !self.options.clean {
            self.logger.info("meta already generated, skipping");
            return Ok(PhaseOutcome::Skipped);
        }

        self.logger.info("---- meta ----");
        let result = match self.hooks.meta() {
            None => Ok(true),
            Some(hook) => {
                let mut ctx = hook_context(
                    &mut self.handle,
                    &mut self.logger,
                    self.options,
                    &self.dispatcher,
                );
                hook.meta(&mut ctx)
            }
        };
        if !self.settle("meta", result)? {
            return self.fail("meta exited with failure");
        }

        if let Some(parent) = marker.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&marker, now_rfc3339())?;
        Ok(PhaseOutcome::Ran)
    }

    // ---- prepare ----

    /// Decide whether prepare runs. [`PhaseOutcome::Ran`] means go ahead.
    fn pre_prepare(&mut self) -> Result<PhaseOutcome, CoreError> {
        if self.refuse_if_finalized("prepare") {
            return Ok(PhaseOutcome::Failed);
        }
        if self.is_prepared() {
            self.logger.info("already prepared, skipping");
            return Ok(PhaseOutcome::Skipped);
        }

        let manifest = self.handle.dataset().manifest().clone();
        for (tool, package) in &manifest.build.requirements {
            if find_on_path(tool).is_none() {
                self.logger.warn(&format!(
                    "required tool '{tool}' not found on PATH; install package '{package}'"
                ));
                return Ok(PhaseOutcome::Skipped);
            }
        }

        let mut incomplete = false;
        if manifest.about.title.trim().is_empty() {
            self.logger.error("about.title must be set in bundle.toml");
            incomplete = true;
        }
        if manifest.about.summary.trim().is_empty() {
            self.logger.error("about.summary must be set in bundle.toml");
            incomplete = true;
        }
        if incomplete {
            return Ok(PhaseOutcome::Failed);
        }

        let identity = manifest.identity;
        let prior = match self.resolver.resolve(&identity) {
            Ok(prior) => prior,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                self.logger.error(&format!("library lookup failed: {e}"));
                return Ok(PhaseOutcome::Failed);
            }
        };
        if let Some(prior) = prior {
            if prior.identity.revision >= identity.revision && !self.options.force {
                return Err(self.logger.fatal(&format!(
                    "cannot prepare {}: library already has revision {} ({}); \
                     bump the revision or use --force",
                    identity.vname(),
                    prior.identity.revision,
                    prior.vid()
                )));
            }
        }
        Ok(PhaseOutcome::Ran)
    }

    pub fn do_prepare(&mut self) -> Result<PhaseOutcome, CoreError> {
        if !self.clean_if_requested("prepare")? {
            return Ok(PhaseOutcome::Failed);
        }
        match self.pre_prepare()? {
            PhaseOutcome::Ran => {}
            PhaseOutcome::Skipped => {
                self.logger.info("---- skipping prepare ----");
                return Ok(PhaseOutcome::Skipped);
            }
            PhaseOutcome::Failed => {
                self.set_error_state();
                self.commit()?;
                return Ok(PhaseOutcome::Failed);
            }
        }

        self.logger.info("---- preparing ----");
        self.set_state(Phase::Preparing);

        let result = self.prepare();
        if !self.settle("prepare", result)? {
            self.set_build_state(BuildMarker::Failed("prepare"));
            return self.fail("prepare exited with failure");
        }

        let result = self.post_prepare();
        if !self.settle("post-prepare", result)? {
            return self.fail("post-prepare exited with failure");
        }

        self.set_state(Phase::Prepared);
        self.commit()?;
        self.logger.info("done preparing");
        Ok(PhaseOutcome::Ran)
    }

    /// Create the store if needed, check dependencies, and load the schema.
    pub fn prepare(&mut self) -> Result<bool, CoreError> {
        if !self.handle.store_exists() {
            self.handle.create_store()?;
        }

        if let Err(e) = self
            .resolver
            .check_dependencies(self.handle.dataset().manifest())
        {
            return Err(match e {
                CoreError::Fatal(_) => e,
                other => self.logger.fatal(&other.to_string()),
            });
        }

        let dataset = self.handle.dataset_mut();
        let issues = if self.options.rebuild {
            let issues = dataset.rebuild_schema()?;
            let removed = dataset.recreate_partitions()?;
            self.logger
                .info(&format!("rebuilt schema; removed {removed} partitions"));
            issues
        } else {
            dataset.load_schema(self.options.fast)?
        };

        for issue in &issues {
            self.logger.error(&issue.to_string());
        }
        Ok(issues.is_empty())
    }

    /// Validate every table, then write the prepared configuration back.
    pub fn post_prepare(&mut self) -> Result<bool, CoreError> {
        let created = self
            .handle
            .dataset()
            .manifest()
            .build
            .dbcreated
            .clone()
            .unwrap_or_else(now_rfc3339);
        self.handle
            .session()
            .set(PROCESS_GROUP, KEY_DBCREATED, json!(created));
        self.commit()?;

        let undescribed: Vec<String> = self
            .handle
            .dataset()
            .schema()
            .missing_descriptions()
            .into_iter()
            .map(|table| table.name.clone())
            .collect();
        for table in &undescribed {
            self.logger
                .error(&format!("no description set for table '{table}'"));
        }
        if !undescribed.is_empty() {
            self.set_build_state(BuildMarker::Failed("prepare"));
            return Ok(false);
        }

        let dataset = self.handle.dataset_mut();
        dataset.update_configuration()?;
        dataset.write_config()?;
        dataset.move_revised_schema()?;
        self.set_build_state(BuildMarker::Prepared);
        self.handle.dataset_mut().write_sources()?;
        self.commit()?;
        Ok(true)
    }

    // ---- build ----

    /// Decide whether build runs. [`PhaseOutcome::Ran`] means go ahead.
    fn pre_build(&mut self) -> Result<PhaseOutcome, CoreError> {
        if !self.handle.store_exists() {
            return Err(self
                .logger
                .fatal("build called before the bundle store was created"));
        }
        if self.is_built() && !self.options.force {
            self.logger
                .info("already built, skipping (use --clean or --force to rebuild)");
            return Ok(PhaseOutcome::Skipped);
        }
        if !self.handle.config().is_set(PROCESS_GROUP, KEY_PREPARED) {
            self.logger.error("build called before prepare completed");
            return Ok(PhaseOutcome::Failed);
        }
        self.started = Some(now_epoch());
        self.handle.close();
        Ok(PhaseOutcome::Ran)
    }

    pub fn do_build(&mut self) -> Result<PhaseOutcome, CoreError> {
        if self.refuse_if_finalized("build") || !self.clean_if_requested("build")? {
            return Ok(PhaseOutcome::Failed);
        }

        if !self.is_prepared() {
            let prepared = self.do_prepare()?;
            if !prepared.succeeded() {
                self.logger.error("prepare failed; skipping build");
                return Ok(PhaseOutcome::Failed);
            }
            if prepared == PhaseOutcome::Skipped && !self.handle.store_exists() {
                self.logger.error("prepare was skipped; cannot build");
                return Ok(PhaseOutcome::Failed);
            }
        }

        match self.pre_build()? {
            PhaseOutcome::Ran => {}
            PhaseOutcome::Skipped => {
                self.logger.info("---- skipping build ----");
                return Ok(PhaseOutcome::Skipped);
            }
            PhaseOutcome::Failed => {
                self.set_error_state();
                self.commit()?;
                return Ok(PhaseOutcome::Failed);
            }
        }

        self.logger.info("---- build ----");
        self.set_state(Phase::Building);
        self.commit()?;

        let result = self.build_main();
        if !self.settle("build", result)? {
            self.set_build_state(BuildMarker::Failed("build"));
            return self.fail("build exited with failure");
        }

        let result = self.post_build();
        if !self.settle("post-build", result)? {
            self.set_build_state(BuildMarker::Failed("build"));
            return self.fail("post-build exited with failure");
        }

        self.set_state(Phase::Built);
        self.commit()?;
        self.logger.info("done building");
        Ok(PhaseOutcome::Ran)
    }

    fn build_main(&mut self) -> Result<bool, CoreError> {
        self.set_build_state(BuildMarker::Building);
        self.commit()?;

        match self.hooks.build() {
            None => {
                self.logger.error("no build logic provided");
                Ok(false)
            }
            Some(hook) => {
                let mut ctx = hook_context(
                    &mut self.handle,
                    &mut self.logger,
                    self.options,
                    &self.dispatcher,
                );
                hook.build(&mut ctx)
            }
        }
    }

    pub fn post_build(&mut self) -> Result<bool, CoreError> {
        if let Some(started) = self.started.take() {
            self.handle
                .session()
                .set(PROCESS_GROUP, KEY_BUILDTIME, json!(now_epoch() - started));
        }
        self.finish_build(BuildMarker::Built)
    }

    /// Steps shared by build and update once their main body succeeded.
    fn finish_build(&mut self, marker: BuildMarker) -> Result<bool, CoreError> {
        let summary = post_build_finalize(self.handle.partitions()?, &mut self.logger)?;
        self.logger.info(&format!(
            "finalized {} partitions ({} skipped, {} unsupported, {} failed)",
            summary.finalized, summary.skipped, summary.unsupported, summary.failed
        ));

        if !self.post_build_test()? {
            return Ok(false);
        }

        self.recompute_coverage()?;

        let dataset = self.handle.dataset_mut();
        dataset.update_configuration()?;
        dataset.write_config()?;
        dataset.move_revised_schema()?;

        self.set_build_state(marker);
        self.commit()?;
        self.handle.close();
        Ok(true)
    }

    /// Run the test hook, if the bundle has one.
    pub fn post_build_test(&mut self) -> Result<bool, CoreError> {
        let Some(hook) = self.hooks.test() else {
            return Ok(true);
        };
        self.logger.info("---- testing ----");
        let mut ctx = hook_context(
            &mut self.handle,
            &mut self.logger,
            self.options,
            &self.dispatcher,
        );
        match hook.test(&mut ctx) {
            Ok(()) => Ok(true),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.logger.error(&format!("test case failed: {e}"));
                Ok(false)
            }
        }
    }

    fn recompute_coverage(&mut self) -> Result<(), CoreError> {
        let partitions: Vec<Coverage> = self
            .handle
            .partitions()?
            .iter()
            .map(|p| p.coverage())
            .collect();
        let coverage = coverage::recompute(self.handle.dataset().manifest(), &partitions);
        self.handle.dataset_mut().set_coverage(coverage)
    }

    // ---- update ----

    fn pre_update(&mut self) -> Result<PhaseOutcome, CoreError> {
        if self.refuse_if_finalized("update") {
            return Ok(PhaseOutcome::Failed);
        }
        if !self.handle.store_exists() {
            self.logger
                .error("cannot update: bundle store does not exist; run prepare first");
            return Ok(PhaseOutcome::Failed);
        }
        if !self.handle.config().is_set(PROCESS_GROUP, KEY_PREPARED) {
            self.logger.error("cannot update: bundle is not prepared");
            return Ok(PhaseOutcome::Failed);
        }
        if self.handle.config().is_set(PROCESS_GROUP, KEY_UPDATED) && !self.options.force {
            self.logger.info("already updated, skipping");
            return Ok(PhaseOutcome::Skipped);
        }
        self.started = Some(now_epoch());
        Ok(PhaseOutcome::Ran)
    }

    pub fn do_update(&mut self) -> Result<PhaseOutcome, CoreError> {
        if self.options.clean && !self.cleaned {
            if !self.clean_if_requested("update")? {
                return Ok(PhaseOutcome::Failed);
            }
            if !self.do_prepare()?.succeeded() {
                self.logger.error("prepare failed; skipping update");
                return Ok(PhaseOutcome::Failed);
            }
        }
        match self.pre_update()? {
            PhaseOutcome::Ran => {}
            PhaseOutcome::Skipped => return Ok(PhaseOutcome::Skipped),
            PhaseOutcome::Failed => {
                self.set_error_state();
                self.commit()?;
                return Ok(PhaseOutcome::Failed);
            }
        }

        self.logger.info("---- update ----");
        self.set_state(Phase::Building);
        self.set_build_state(BuildMarker::Building);
        self.commit()?;

        let result = match self.hooks.update() {
            None => self.update(),
            Some(hook) => {
                let mut ctx = hook_context(
                    &mut self.handle,
                    &mut self.logger,
                    self.options,
                    &self.dispatcher,
                );
                hook.update(&mut ctx)
            }
        };
        if !self.settle("update", result)? {
            self.set_build_state(BuildMarker::Failed("update"));
            return self.fail("update exited with failure");
        }

        let result = self.post_update();
        if !self.settle("post-update", result)? {
            self.set_build_state(BuildMarker::Failed("update"));
            return self.fail("post-update exited with failure");
        }

        self.set_state(Phase::Built);
        self.commit()?;
        self.logger.info("done updating");
        Ok(PhaseOutcome::Ran)
    }

    /// Carry the prior installed revision forward: copy its schema, prepare
    /// again, then alias its partitions.
    pub fn update(&mut self) -> Result<bool, CoreError> {
        let identity = self.handle.identity();
        let prior = match self.resolver.resolve(&identity)? {
            Some(prior) if prior.identity.revision < identity.revision => prior,
            _ => {
                self.logger.error(&format!(
                    "no earlier revision of {} in the library to update from",
                    identity.id
                ));
                return Ok(false);
            }
        };
        self.logger
            .info(&format!("updating from {}", prior.identity));

        self.handle.dataset_mut().copy_schema_from(&prior.directory)?;
        if !self.prepare()? {
            return Ok(false);
        }
        let copied = self
            .handle
            .dataset_mut()
            .copy_partitions_from(&prior.directory)?;
        self.logger
            .info(&format!("referenced {copied} partitions from {}", prior.vid()));
        Ok(true)
    }

    pub fn post_update(&mut self) -> Result<bool, CoreError> {
        if let Some(started) = self.started.take() {
            self.handle
                .session()
                .set(PROCESS_GROUP, KEY_UPDATETIME, json!(now_epoch() - started));
        }
        self.finish_build(BuildMarker::Updated)
    }

    // ---- finalize ----

    pub fn do_finalize(&mut self) -> Result<PhaseOutcome, CoreError> {
        if self.is_finalized() {
            self.logger.info("already finalized, skipping");
            return Ok(PhaseOutcome::Skipped);
        }
        if !self.is_built() {
            return self.fail("cannot finalize: bundle is not built");
        }

        self.logger.info("---- finalizing ----");
        self.set_state(Phase::Finalizing);

        let result = match self.handle.partitions() {
            Ok(parts) => post_build_finalize(parts, &mut self.logger).map_err(CoreError::from),
            Err(e) => Err(e),
        };
        self.handle.close();
        if let Err(e) = result {
            if e.is_fatal() {
                return Err(e);
            }
            return self.fail(&format!("finalize failed: {e}"));
        }

        self.set_state(Phase::Finalized);
        self.commit()?;
        Ok(PhaseOutcome::Ran)
    }

    // ---- install ----

    /// Register the built bundle in `library`.
    pub fn do_install(&mut self, library: &Library) -> Result<PhaseOutcome, CoreError> {
        if self.options.clean && !self.cleaned && !self.do_build()?.succeeded() {
            self.logger.error("build failed; skipping install");
            return Ok(PhaseOutcome::Failed);
        }
        if !self.is_built() {
            return self.fail("cannot install: bundle is not built");
        }

        let identity = self.handle.identity();
        let vid = identity.vid();
        if self.state() == Some(Phase::Installed)
            && !self.options.force
            && library.resolve(vid.as_str())?.is_some()
        {
            self.logger
                .info(&format!("{vid} already installed, skipping"));
            return Ok(PhaseOutcome::Skipped);
        }

        self.logger.info("---- installing ----");
        self.set_state(Phase::Installing);

        let directory = self.handle.directory();
        let directory = directory
            .canonicalize()
            .unwrap_or_else(|_| directory.to_path_buf());
        if let Err(e) = library.install(&identity, &directory) {
            return self.fail(&format!("install failed: {e}"));
        }

        self.set_build_state(BuildMarker::Installed);
        self.set_state(Phase::Installed);
        self.commit()?;
        self.logger.info(&format!(
            "installed {} into {}",
            identity.vname(),
            library.root().display()
        ));
        Ok(PhaseOutcome::Ran)
    }

    // ---- pipeline ----

    /// Clean (when requested), then sync, meta, prepare, build, and finalize,
    /// stopping at the first phase that fails.
    pub fn run(&mut self) -> Result<PhaseOutcome, CoreError> {
        if !self.clean_if_requested("run")? {
            return Ok(PhaseOutcome::Failed);
        }

        let steps: [(&str, fn(&mut Self) -> Result<PhaseOutcome, CoreError>); 5] = [
            ("sync", Self::sync),
            ("meta", Self::do_meta),
            ("prepare", Self::do_prepare),
            ("build", Self::do_build),
            ("finalize", Self::do_finalize),
        ];
        for (name, step) in steps {
            if !step(self)?.succeeded() {
                self.logger.error(&format!("run stopped: {name} failed"));
                return Ok(PhaseOutcome::Failed);
            }
        }
        Ok(PhaseOutcome::Ran)
    }

    /// Run a registered operation once per argument set on up to `degree`
    /// workers.
    pub fn run_parallel(
        &mut self,
        operation: &str,
        arg_sets: Vec<Value>,
        degree: usize,
    ) -> Result<(), CoreError> {
        let mut ctx = hook_context(
            &mut self.handle,
            &mut self.logger,
            self.options,
            &self.dispatcher,
        );
        ctx.run_parallel_with(operation, arg_sets, degree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Dataset;
    use crate::mock::{
        sample_manifest, MockBundle, MockPartition, MockResolver, ScriptedFinalize, ScriptedHooks,
    };
    use databundle_schema::{BundleIdentity, Schema, TableDef};
    use databundle_store::state::KEY_LAST;

    fn machine(bundle: MockBundle, options: RunOptions) -> StateMachine<MockBundle> {
        StateMachine::new(bundle, options).with_fatal_mode(FatalMode::Raise)
    }

    fn building(bundle: MockBundle) -> StateMachine<MockBundle> {
        machine(bundle, RunOptions::default()).with_hooks(ScriptedHooks::building(true))
    }

    fn process(m: &StateMachine<MockBundle>, key: &str) -> Option<Value> {
        m.handle().config().get(PROCESS_GROUP, key)
    }

    #[test]
    fn outcome_success() {
        assert!(PhaseOutcome::Skipped.succeeded());
        assert!(PhaseOutcome::Ran.succeeded());
        assert!(!PhaseOutcome::Failed.succeeded());
    }

    #[test]
    fn sync_enters_synced_and_commits() {
        let mut m = machine(MockBundle::new("/b"), RunOptions::default());
        assert_eq!(m.sync().unwrap(), PhaseOutcome::Ran);
        assert_eq!(m.state(), Some(Phase::Synced));
        assert!(m.handle().store().commits() >= 1);
    }

    #[test]
    fn prepare_twice_skips_second_time() {
        let mut m = machine(MockBundle::new("/b"), RunOptions::default());
        assert_eq!(m.do_prepare().unwrap(), PhaseOutcome::Ran);
        assert_eq!(m.state(), Some(Phase::Prepared));
        assert!(m.is_prepared());
        assert!(process(&m, KEY_DBCREATED).is_some());
        assert!(m.handle().mock_dataset().called("write_sources"));

        let second = m.do_prepare().unwrap();
        assert_eq!(second, PhaseOutcome::Skipped);
        assert!(second.succeeded());
        assert_eq!(m.state(), Some(Phase::Prepared));
        assert!(m.error_state().is_none());
    }

    #[test]
    fn rebuild_reloads_schema_and_partitions() {
        let options = RunOptions {
            rebuild: true,
            ..RunOptions::default()
        };
        let mut m = machine(MockBundle::new("/b"), options);
        assert_eq!(m.do_prepare().unwrap(), PhaseOutcome::Ran);
        let calls = m.handle().mock_dataset().calls();
        assert!(calls.iter().any(|c| c == "rebuild_schema"));
        assert!(calls.iter().any(|c| c == "recreate_partitions"));
        assert!(!m.handle().mock_dataset().called("load_schema"));
        // rebuild always asks for a fresh prepare
        assert!(!m.is_prepared());
    }

    #[test]
    fn build_twice_skips_second_time() {
        let mut m = building(MockBundle::new("/b"));
        assert_eq!(m.do_build().unwrap(), PhaseOutcome::Ran);
        assert_eq!(m.state(), Some(Phase::Built));
        assert!(m.is_built());

        let second = m.do_build().unwrap();
        assert_eq!(second, PhaseOutcome::Skipped);
        assert!(second.succeeded());
        assert_eq!(m.state(), Some(Phase::Built));
    }

    #[test]
    fn clean_twice_skips_second_time() {
        let mut m = machine(MockBundle::new("/b"), RunOptions::default());
        assert_eq!(m.do_clean().unwrap(), PhaseOutcome::Ran);
        assert_eq!(m.state(), Some(Phase::Cleaned));
        assert_eq!(m.do_clean().unwrap(), PhaseOutcome::Skipped);
        assert_eq!(m.state(), Some(Phase::Cleaned));
        assert_eq!(
            m.handle()
                .mock_dataset()
                .calls()
                .iter()
                .filter(|c| *c == "clean")
                .count(),
            1
        );
    }

    #[test]
    fn clean_forgets_phase_markers() {
        let mut m = building(MockBundle::new("/b"));
        m.do_build().unwrap();
        assert!(m.is_built());

        assert_eq!(m.do_clean().unwrap(), PhaseOutcome::Ran);
        assert!(!m.is_built());
        assert!(!m.is_prepared());
        assert_eq!(m.state(), Some(Phase::Cleaned));
    }

    #[test]
    fn clean_records_when_cleaning_began() {
        let mut m = building(MockBundle::new("/b"));
        m.do_build().unwrap();
        assert_eq!(m.do_clean().unwrap(), PhaseOutcome::Ran);

        let record = m.state_record();
        assert!(record.entered(Phase::Cleaning).is_some());
        assert!(record.entered(Phase::Cleaned).is_some());
        assert!(record.entered(Phase::Built).is_none());
    }

    fn clean_calls(m: &StateMachine<MockBundle>) -> usize {
        m.handle()
            .mock_dataset()
            .calls()
            .iter()
            .filter(|c| *c == "clean")
            .count()
    }

    #[test]
    fn clean_option_rebuilds_a_built_bundle() {
        let mut m = building(MockBundle::new("/b"));
        assert_eq!(m.do_build().unwrap(), PhaseOutcome::Ran);
        assert_eq!(clean_calls(&m), 0);

        let options = RunOptions {
            clean: true,
            ..RunOptions::default()
        };
        let mut again =
            machine(m.into_handle(), options).with_hooks(ScriptedHooks::building(true));
        assert_eq!(again.do_build().unwrap(), PhaseOutcome::Ran);
        assert_eq!(clean_calls(&again), 1);
        assert_eq!(again.state(), Some(Phase::Built));
        assert!(again.is_built());
        assert!(again.state_record().entered(Phase::Cleaned).is_some());
    }

    #[test]
    fn clean_option_cleans_once_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let options = RunOptions {
            clean: true,
            ..RunOptions::default()
        };
        let mut m = machine(MockBundle::new(dir.path()), options)
            .with_hooks(ScriptedHooks::building(true));
        assert_eq!(m.run().unwrap(), PhaseOutcome::Ran);
        assert_eq!(clean_calls(&m), 1);
        assert_eq!(m.state(), Some(Phase::Finalized));
    }

    #[test]
    fn clean_option_on_finalized_bundle_fails_prepare() {
        let mut m = building(MockBundle::new("/b"));
        m.do_build().unwrap();
        m.do_finalize().unwrap();

        let options = RunOptions {
            clean: true,
            ..RunOptions::default()
        };
        let mut again = machine(m.into_handle(), options);
        assert_eq!(again.do_prepare().unwrap(), PhaseOutcome::Failed);
        assert_eq!(clean_calls(&again), 0);
        assert_eq!(again.state(), Some(Phase::Finalized));
    }

    #[test]
    fn failed_clean_stays_in_cleaning_with_error() {
        let mut m = machine(MockBundle::new("/b").failing("clean"), RunOptions::default());
        m.sync().unwrap();
        assert_eq!(m.state(), Some(Phase::Synced));

        let outcome = m.do_clean().unwrap();
        assert_eq!(outcome, PhaseOutcome::Failed);
        assert_eq!(m.state(), Some(Phase::Cleaning));
        let error = m.error_state().unwrap();
        assert!(error > 0.0);

        let committed = m.handle().store().committed("process.state", "current");
        assert_eq!(committed, Some(json!("cleaning")));
    }

    #[test]
    fn failed_cascade_never_marks_building() {
        let mut m = building(MockBundle::new("/b").failing("load_schema"));
        let outcome = m.do_build().unwrap();

        assert_eq!(outcome, PhaseOutcome::Failed);
        assert!(process(&m, "building").is_none());
        assert_eq!(process(&m, KEY_LAST), Some(json!("failed/prepare")));
        assert_eq!(m.state(), Some(Phase::Preparing));
        assert!(m.error_state().is_some());
    }

    #[test]
    fn skipped_cascade_without_store_fails_build() {
        let mut manifest = sample_manifest();
        manifest
            .build
            .requirements
            .insert("databundle-no-such-tool".to_owned(), "nothing".to_owned());
        let mut m = building(MockBundle::new("/b").with_manifest(manifest));

        assert_eq!(m.do_prepare().unwrap(), PhaseOutcome::Skipped);
        assert!(m.error_state().is_none());
        assert_eq!(m.do_build().unwrap(), PhaseOutcome::Failed);
        assert!(process(&m, "building").is_none());
    }

    #[test]
    fn post_prepare_reports_every_undescribed_table() {
        let schema = Schema {
            tables: vec![
                TableDef {
                    name: "described".to_owned(),
                    description: "Has one".to_owned(),
                    columns: Vec::new(),
                },
                TableDef {
                    name: "bare".to_owned(),
                    description: "  ".to_owned(),
                    columns: Vec::new(),
                },
            ],
        };
        let mut m = machine(MockBundle::new("/b").with_schema(schema), RunOptions::default());

        assert!(!m.post_prepare().unwrap());
        assert_eq!(m.logger().errors().len(), 1);
        assert!(m.logger().errors()[0].contains("bare"));
        assert_eq!(process(&m, KEY_LAST), Some(json!("failed/prepare")));
        assert!(!m.handle().mock_dataset().called("write_config"));
    }

    #[test]
    fn post_prepare_accumulates_before_failing() {
        let table = |name: &str| TableDef {
            name: name.to_owned(),
            description: String::new(),
            columns: Vec::new(),
        };
        let schema = Schema {
            tables: vec![table("a"), table("b"), table("c")],
        };
        let mut m = machine(MockBundle::new("/b").with_schema(schema), RunOptions::default());
        assert!(!m.post_prepare().unwrap());
        assert_eq!(m.logger().errors().len(), 3);
    }

    #[test]
    fn incomplete_about_fails_prepare() {
        let mut manifest = sample_manifest();
        manifest.about.summary = String::new();
        let mut m = machine(
            MockBundle::new("/b").with_manifest(manifest),
            RunOptions::default(),
        );
        assert_eq!(m.do_prepare().unwrap(), PhaseOutcome::Failed);
        assert!(m.error_state().is_some());
        assert!(!m.handle().store_exists());
    }

    #[test]
    fn missing_dependency_is_fatal() {
        let mut manifest = sample_manifest();
        manifest
            .build
            .dependencies
            .insert("geo".to_owned(), "example.com-geo".to_owned());
        let mut m = machine(
            MockBundle::new("/b").with_manifest(manifest),
            RunOptions::default(),
        )
        .with_resolver(MockResolver::new());

        let err = m.do_prepare().unwrap_err();
        assert!(err.is_fatal());
        assert!(m.logger().errors()[0].starts_with("fatal:"));
    }

    #[test]
    fn installed_revision_conflict_is_fatal_unless_forced() {
        let installed = sample_manifest().identity;
        let resolver = MockResolver::new().with_installed(installed, "/library/dtest001");

        let mut m = machine(MockBundle::new("/b"), RunOptions::default())
            .with_resolver(resolver.clone());
        assert!(m.do_prepare().unwrap_err().is_fatal());

        let forced = RunOptions {
            force: true,
            ..RunOptions::default()
        };
        let mut m = machine(MockBundle::new("/b"), forced).with_resolver(resolver);
        assert_eq!(m.do_prepare().unwrap(), PhaseOutcome::Ran);
    }

    #[test]
    fn build_without_hook_is_a_failure() {
        let mut m = machine(MockBundle::new("/b"), RunOptions::default());
        assert_eq!(m.do_build().unwrap(), PhaseOutcome::Failed);
        assert!(m
            .logger()
            .errors()
            .iter()
            .any(|e| e == "no build logic provided"));
        assert_eq!(m.state(), Some(Phase::Building));
        assert!(m.error_state().is_some());
        assert_eq!(process(&m, KEY_LAST), Some(json!("failed/build")));
        assert!(process(&m, KEY_BUILT).is_none());
    }

    #[test]
    fn build_finalizes_partitions_and_records_coverage() {
        let partition = MockPartition::new("rates").with_coverage(Coverage {
            time: vec![2014],
            geo: vec!["alameda".to_owned()],
            grain: Vec::new(),
        });
        let finalized = partition.finalize_calls();
        let alias = MockPartition::new("old").as_reference();
        let alias_calls = alias.finalize_calls();
        let mut m = building(
            MockBundle::new("/b")
                .with_partition(partition.boxed())
                .with_partition(alias.boxed()),
        );

        assert_eq!(m.do_build().unwrap(), PhaseOutcome::Ran);
        assert_eq!(finalized.get(), 1);
        assert_eq!(alias_calls.get(), 0);
        let coverage = &m.handle().mock_dataset().manifest().coverage;
        assert_eq!(coverage.time, vec![2014]);
        assert_eq!(coverage.geo, vec!["alameda"]);
        assert!(process(&m, KEY_BUILDTIME).is_some());
        assert!(process(&m, "building").is_some());
        assert!(m.handle().closes() >= 2);
    }

    #[test]
    fn operational_finalize_error_fails_build() {
        let bad = MockPartition::new("bad").with_script(ScriptedFinalize::Operational);
        let mut m = building(MockBundle::new("/b").with_partition(bad.boxed()));
        assert_eq!(m.do_build().unwrap(), PhaseOutcome::Failed);
        assert!(!m.is_built());
        assert_eq!(m.state(), Some(Phase::Building));
    }

    #[test]
    fn configuration_finalize_error_does_not_fail_build() {
        let bad = MockPartition::new("bad").with_script(ScriptedFinalize::Configuration);
        let mut m = building(MockBundle::new("/b").with_partition(bad.boxed()));
        assert_eq!(m.do_build().unwrap(), PhaseOutcome::Ran);
        assert_eq!(m.logger().errors().len(), 1);
    }

    #[test]
    fn failing_test_hook_fails_build() {
        let hooks = ScriptedHooks::building(true).with_test(Err("row count mismatch".to_owned()));
        let mut m = machine(MockBundle::new("/b"), RunOptions::default()).with_hooks(hooks.clone());

        assert_eq!(m.do_build().unwrap(), PhaseOutcome::Failed);
        assert_eq!(hooks.calls(), vec!["build", "test"]);
        assert!(m
            .logger()
            .errors()
            .iter()
            .any(|e| e.starts_with("test case failed")));
    }

    #[test]
    fn meta_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = ScriptedHooks::default().with_meta(true);
        let mut m =
            machine(MockBundle::new(dir.path()), RunOptions::default()).with_hooks(hooks.clone());

        assert_eq!(m.do_meta().unwrap(), PhaseOutcome::Ran);
        assert!(m.handle().meta_marker().exists());
        assert_eq!(m.do_meta().unwrap(), PhaseOutcome::Skipped);
        assert_eq!(hooks.calls(), vec!["meta"]);
    }

    #[test]
    fn failed_meta_leaves_no_marker() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = ScriptedHooks::default().with_meta(false);
        let mut m = machine(MockBundle::new(dir.path()), RunOptions::default()).with_hooks(hooks);
        assert_eq!(m.do_meta().unwrap(), PhaseOutcome::Failed);
        assert!(!m.handle().meta_marker().exists());
        assert!(m.error_state().is_some());
    }

    #[test]
    fn update_requires_preparation() {
        let mut m = machine(MockBundle::new("/b"), RunOptions::default());
        assert_eq!(m.do_update().unwrap(), PhaseOutcome::Failed);
        assert!(m.error_state().is_some());
    }

    #[test]
    fn update_carries_prior_revision_forward() {
        let mut manifest = sample_manifest();
        manifest.identity.revision = 2;
        let prior = BundleIdentity::new("dtest", "example.com", "mock", 1);
        let resolver = MockResolver::new().with_installed(prior, "/library/dtest001");
        let mut m = machine(
            MockBundle::new("/b").with_manifest(manifest),
            RunOptions::default(),
        )
        .with_resolver(resolver);

        assert_eq!(m.do_prepare().unwrap(), PhaseOutcome::Ran);
        assert_eq!(m.do_update().unwrap(), PhaseOutcome::Ran);
        let dataset = m.handle().mock_dataset();
        assert!(dataset.called("copy_schema_from"));
        assert!(dataset.called("copy_partitions_from"));
        assert!(process(&m, KEY_UPDATED).is_some());
        assert!(process(&m, KEY_UPDATETIME).is_some());
        assert_eq!(m.state(), Some(Phase::Built));
        assert!(m.is_built());

        assert_eq!(m.do_update().unwrap(), PhaseOutcome::Skipped);
    }

    #[test]
    fn update_without_prior_revision_fails() {
        let mut m = machine(MockBundle::new("/b"), RunOptions::default());
        m.do_prepare().unwrap();
        assert_eq!(m.do_update().unwrap(), PhaseOutcome::Failed);
        assert_eq!(process(&m, KEY_LAST), Some(json!("failed/update")));
    }

    #[test]
    fn update_hook_replaces_builtin_update() {
        let hooks = ScriptedHooks::default().with_update(true);
        let mut m = machine(MockBundle::new("/b"), RunOptions::default()).with_hooks(hooks.clone());
        m.do_prepare().unwrap();
        assert_eq!(m.do_update().unwrap(), PhaseOutcome::Ran);
        assert_eq!(hooks.calls(), vec!["update"]);
        assert!(!m.handle().mock_dataset().called("copy_schema_from"));
    }

    #[test]
    fn finalize_requires_build_and_is_terminal() {
        let mut m = building(MockBundle::new("/b"));
        assert_eq!(m.do_finalize().unwrap(), PhaseOutcome::Failed);

        m.do_build().unwrap();
        assert_eq!(m.do_finalize().unwrap(), PhaseOutcome::Ran);
        assert_eq!(m.state(), Some(Phase::Finalized));
        assert!(m.is_finalized());
        assert_eq!(m.do_finalize().unwrap(), PhaseOutcome::Skipped);

        assert_eq!(m.do_clean().unwrap(), PhaseOutcome::Failed);
        assert_eq!(m.sync().unwrap(), PhaseOutcome::Failed);
        assert_eq!(m.do_prepare().unwrap(), PhaseOutcome::Failed);
        assert_eq!(m.state(), Some(Phase::Finalized));
    }

    #[test]
    fn install_registers_in_library() {
        let lib_dir = tempfile::tempdir().unwrap();
        let library = Library::new(lib_dir.path());
        let mut m = building(MockBundle::new("/b"));

        assert_eq!(m.do_install(&library).unwrap(), PhaseOutcome::Failed);

        m.do_build().unwrap();
        assert_eq!(m.do_install(&library).unwrap(), PhaseOutcome::Ran);
        assert_eq!(m.state(), Some(Phase::Installed));
        assert!(process(&m, "installed").is_some());
        assert!(library.resolve("dtest001").unwrap().is_some());
        assert!(m.is_finalized());

        assert_eq!(m.do_install(&library).unwrap(), PhaseOutcome::Skipped);
    }

    #[test]
    fn run_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = machine(MockBundle::new(dir.path()), RunOptions::default());
        assert_eq!(m.run().unwrap(), PhaseOutcome::Failed);
        assert!(m
            .logger()
            .errors()
            .iter()
            .any(|e| e == "run stopped: build failed"));
        assert!(!m.is_finalized());
    }

    #[test]
    fn run_completes_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = building(MockBundle::new(dir.path()));
        assert_eq!(m.run().unwrap(), PhaseOutcome::Ran);
        assert_eq!(m.state(), Some(Phase::Finalized));
        assert!(m.error_state().is_none());
    }

    #[test]
    fn clear_states_forgets_everything() {
        let mut m = building(MockBundle::new("/b"));
        m.do_build().unwrap();
        m.clear_states().unwrap();
        assert!(m.state().is_none());
        assert!(!m.is_built());
        assert!(m.state_record().timestamps.is_empty());
    }
}
