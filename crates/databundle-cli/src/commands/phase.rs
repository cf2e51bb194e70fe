use super::{
    colorize_phase, json_pretty, open_machine, spin_fail, spin_ok, spinner, EXIT_FAILURE,
    EXIT_SUCCESS,
};
use databundle_core::{
    BundleHandle, CoreError, FileBundle, PhaseOutcome, RunOptions, StateMachine, StoreLock,
};
use databundle_store::{BundleLayout, Library, Phase};
use std::path::Path;

/// A pipeline command that moves a bundle through one or more phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseCommand {
    Sync,
    Clean,
    Meta,
    Prepare,
    Build,
    Update,
    Finalize,
    Install,
    Run,
}

impl PhaseCommand {
    pub fn label(self) -> &'static str {
        match self {
            PhaseCommand::Sync => "sync",
            PhaseCommand::Clean => "clean",
            PhaseCommand::Meta => "meta",
            PhaseCommand::Prepare => "prepare",
            PhaseCommand::Build => "build",
            PhaseCommand::Update => "update",
            PhaseCommand::Finalize => "finalize",
            PhaseCommand::Install => "install",
            PhaseCommand::Run => "run",
        }
    }

    fn progress(self) -> &'static str {
        match self {
            PhaseCommand::Sync => "synchronizing sources...",
            PhaseCommand::Clean => "cleaning bundle...",
            PhaseCommand::Meta => "generating metadata...",
            PhaseCommand::Prepare => "preparing bundle...",
            PhaseCommand::Build => "building bundle...",
            PhaseCommand::Update => "updating bundle...",
            PhaseCommand::Finalize => "finalizing bundle...",
            PhaseCommand::Install => "installing bundle...",
            PhaseCommand::Run => "running pipeline...",
        }
    }
}

fn execute(
    machine: &mut StateMachine<FileBundle>,
    library: &Library,
    command: PhaseCommand,
) -> Result<PhaseOutcome, CoreError> {
    match command {
        PhaseCommand::Sync => machine.sync(),
        PhaseCommand::Clean => machine.do_clean(),
        PhaseCommand::Meta => machine.do_meta(),
        PhaseCommand::Prepare => machine.do_prepare(),
        PhaseCommand::Build => machine.do_build(),
        PhaseCommand::Update => machine.do_update(),
        PhaseCommand::Finalize => machine.do_finalize(),
        PhaseCommand::Install => machine.do_install(library),
        PhaseCommand::Run => machine.run(),
    }
}

pub fn run(
    bundle: &Path,
    library: &Library,
    options: RunOptions,
    command: PhaseCommand,
    json: bool,
) -> Result<u8, String> {
    let manifest = BundleLayout::new(bundle).manifest_path();
    if !manifest.is_file() {
        return Err(format!(
            "manifest error: no bundle manifest at {}",
            manifest.display()
        ));
    }
    let _lock = StoreLock::for_bundle(bundle).map_err(|e| e.to_string())?;
    let mut machine = open_machine(bundle, library, options)?;

    let pb = if json {
        None
    } else {
        Some(spinner(command.progress()))
    };
    let outcome = match execute(&mut machine, library, command) {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, &format!("{} aborted", command.label()));
            }
            return Err(e.to_string());
        }
    };

    let identity = machine.handle().identity();
    let state = machine.state();
    if json {
        let payload = serde_json::json!({
            "bundle": identity.vname(),
            "vid": identity.vid(),
            "command": command.label(),
            "outcome": outcome.to_string(),
            "phase": state.map(Phase::as_str),
            "errors": machine.logger().errors(),
            "warnings": machine.logger().warnings(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        let message = format!("{} {outcome}", command.label());
        if let Some(ref pb) = pb {
            if outcome.succeeded() {
                spin_ok(pb, &message);
            } else {
                spin_fail(pb, &message);
            }
        }
        println!("{}: {}", identity.vname(), colorize_phase(state));
        for error in machine.logger().errors() {
            eprintln!("  {error}");
        }
    }

    Ok(if outcome.succeeded() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}
