use super::{source, EXIT_SUCCESS};
use databundle_core::{run_worker, DispatchRequest, FileOpener};
use std::io::Read;

/// Read one dispatch request as JSON from stdin and run it.
pub fn run() -> Result<u8, String> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| format!("failed to read request from stdin: {e}"))?;
    let request: DispatchRequest =
        serde_json::from_str(&input).map_err(|e| format!("invalid dispatch request: {e}"))?;
    tracing::debug!(
        "worker {} running {} {:?}",
        std::process::id(),
        request.operation,
        request.args
    );
    run_worker(&request, &FileOpener, &source::registry()).map_err(|e| e.to_string())?;
    Ok(EXIT_SUCCESS)
}
