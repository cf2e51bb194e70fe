mod commands;

use clap::{Parser, Subcommand};
use commands::phase::PhaseCommand;
use commands::exit_code_for;
use databundle_core::{LibraryConfig, RunOptions};
use databundle_store::Library;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "databundle",
    version,
    about = "Build, finalize, and install versioned data bundles"
)]
struct Cli {
    /// Bundle directory containing bundle.toml.
    #[arg(long, short = 'b', default_value = ".", global = true)]
    bundle: PathBuf,

    /// Library directory installed bundles are registered in.
    #[arg(long, global = true)]
    library: Option<PathBuf>,

    /// Rebuild the schema and partitions from scratch.
    #[arg(long, default_value_t = false, global = true)]
    rebuild: bool,

    /// Run phases even when they already completed.
    #[arg(long, default_value_t = false, global = true)]
    force: bool,

    /// Clean the bundle before running.
    #[arg(long, default_value_t = false, global = true)]
    clean: bool,

    /// Skip per-column schema validation.
    #[arg(long, default_value_t = false, global = true)]
    fast: bool,

    /// Number of worker processes; 0 uses every core, 1 runs in-process.
    #[arg(long, short = 'm', default_value_t = 1, global = true)]
    multi: usize,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Synchronize declared sources into the bundle.
    Sync,
    /// Remove generated partitions and phase state.
    Clean,
    /// Run the metadata step once.
    Meta,
    /// Create the store and load the schema.
    Prepare,
    /// Build partitions, preparing first if needed.
    Build,
    /// Carry the previous installed revision forward.
    Update,
    /// Finalize a built bundle.
    Finalize,
    /// Register a built bundle in the library.
    Install,
    /// Sync, meta, prepare, build, and finalize in order.
    Run,
    /// Show the bundle's phase state and partitions.
    Info,
    /// Run one dispatched operation read from stdin.
    #[command(hide = true)]
    Worker,
}

impl Commands {
    fn phase(&self) -> Option<PhaseCommand> {
        Some(match self {
            Commands::Sync => PhaseCommand::Sync,
            Commands::Clean => PhaseCommand::Clean,
            Commands::Meta => PhaseCommand::Meta,
            Commands::Prepare => PhaseCommand::Prepare,
            Commands::Build => PhaseCommand::Build,
            Commands::Update => PhaseCommand::Update,
            Commands::Finalize => PhaseCommand::Finalize,
            Commands::Install => PhaseCommand::Install,
            Commands::Run => PhaseCommand::Run,
            Commands::Info | Commands::Worker => return None,
        })
    }
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("DATABUNDLE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let options = RunOptions {
        rebuild: cli.rebuild,
        force: cli.force,
        clean: cli.clean,
        fast: cli.fast,
        multi: cli.multi,
    };

    let result = match cli.command.phase() {
        Some(phase) => run_phase(&cli, options, phase),
        None if matches!(cli.command, Commands::Worker) => commands::worker::run(),
        None => commands::info::run(&cli.bundle, cli.json),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

fn run_phase(cli: &Cli, options: RunOptions, phase: PhaseCommand) -> Result<u8, String> {
    let config = LibraryConfig::resolve(cli.library.as_deref()).map_err(|e| e.to_string())?;
    let library = Library::new(config.library);
    commands::phase::run(&cli.bundle, &library, options, phase, cli.json)
}
