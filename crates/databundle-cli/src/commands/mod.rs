pub mod info;
pub mod phase;
pub mod source;
pub mod worker;

use databundle_core::{FatalMode, FileBundle, LibraryResolver, RunOptions, StateMachine};
use databundle_store::{Library, Phase};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;
pub const EXIT_FATAL: u8 = 4;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Exit code for an error message produced by a command.
pub fn exit_code_for(message: &str) -> u8 {
    if message.starts_with("fatal:") {
        EXIT_FATAL
    } else if message.starts_with("manifest error:") {
        EXIT_MANIFEST_ERROR
    } else if message.starts_with("store error:") {
        EXIT_STORE_ERROR
    } else {
        EXIT_FAILURE
    }
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish(pb: &ProgressBar, msg: String) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg);
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✗ {msg}"));
}

pub fn colorize_phase(phase: Option<Phase>) -> String {
    use console::Style;
    let Some(phase) = phase else {
        return Style::new().dim().apply_to("new").to_string();
    };
    let label = phase.as_str();
    match phase {
        Phase::Built | Phase::Prepared | Phase::Cleaned | Phase::Synced => {
            Style::new().green().apply_to(label).to_string()
        }
        Phase::Finalized | Phase::Installed => Style::new().blue().bold().apply_to(label).to_string(),
        p if p.in_progress() => Style::new().yellow().apply_to(label).to_string(),
        _ => label.to_owned(),
    }
}

/// Open the bundle at `bundle` wired with the built-in hooks, the library
/// resolver, and the process-pool dispatcher.
pub fn open_machine(
    bundle: &Path,
    library: &Library,
    options: RunOptions,
) -> Result<StateMachine<FileBundle>, String> {
    let handle = FileBundle::open(bundle).map_err(|e| e.to_string())?;
    Ok(StateMachine::new(handle, options)
        .with_hooks(source::SourceCopyBundle)
        .with_resolver(LibraryResolver::new(library.clone()))
        .with_dispatcher(source::dispatcher())
        .with_fatal_mode(FatalMode::Raise))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            EXIT_SUCCESS,
            EXIT_FAILURE,
            EXIT_MANIFEST_ERROR,
            EXIT_STORE_ERROR,
            EXIT_FATAL,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn errors_map_to_exit_codes() {
        assert_eq!(exit_code_for("fatal: dependency missing"), EXIT_FATAL);
        assert_eq!(exit_code_for("manifest error: bad toml"), EXIT_MANIFEST_ERROR);
        assert_eq!(exit_code_for("store error: lock failed"), EXIT_STORE_ERROR);
        assert_eq!(exit_code_for("something else"), EXIT_FAILURE);
    }

    #[test]
    fn colorize_keeps_phase_name() {
        assert!(colorize_phase(Some(Phase::Built)).contains("built"));
        assert!(colorize_phase(Some(Phase::Cleaning)).contains("cleaning"));
        assert!(colorize_phase(None).contains("new"));
    }

    #[test]
    fn spinner_finishes() {
        let pb = spinner("testing...");
        spin_ok(&pb, "done");
        let pb = spinner("testing...");
        spin_fail(&pb, "failed");
    }

    #[test]
    fn open_machine_requires_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::new(dir.path().join("library"));
        let err = open_machine(dir.path(), &library, RunOptions::default())
            .err()
            .unwrap();
        assert_eq!(exit_code_for(&err), EXIT_MANIFEST_ERROR);
    }
}
