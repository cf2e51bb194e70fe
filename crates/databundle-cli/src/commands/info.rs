use super::{colorize_phase, json_pretty, EXIT_SUCCESS};
use databundle_core::{BundleHandle, FileBundle};
use databundle_store::{StateRecord, PROCESS_GROUP};
use serde_json::Value;
use std::path::Path;

pub fn run(bundle: &Path, json: bool) -> Result<u8, String> {
    let handle = FileBundle::open(bundle).map_err(|e| e.to_string())?;
    let identity = handle.identity();
    let record = StateRecord::load(handle.config());
    let markers = handle.config().group(PROCESS_GROUP);
    let partitions = handle
        .partition_store()
        .list()
        .map_err(|e| format!("store error: {e}"))?;

    if json {
        let payload = serde_json::json!({
            "bundle": identity.vname(),
            "vid": identity.vid(),
            "directory": bundle,
            "store": handle.store_exists(),
            "state": record,
            "process": markers,
            "partitions": partitions,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("bundle:     {} ({})", identity.vname(), identity.vid());
    println!("directory:  {}", bundle.display());
    println!("phase:      {}", colorize_phase(record.current));
    if let Some(error) = record.error {
        println!("error at:   {error:.3}");
    }
    if let Some(last) = markers.get("last").and_then(Value::as_str) {
        println!("last:       {last}");
    }
    println!("store:      {}", if handle.store_exists() { "present" } else { "absent" });
    println!("partitions: {}", partitions.len());
    for partition in &partitions {
        let mut flags = Vec::new();
        if partition.finalized {
            flags.push("finalized");
        }
        if partition.reference.is_some() {
            flags.push("reference");
        }
        let rows = partition
            .stats
            .as_ref()
            .map_or_else(|| "-".to_owned(), |s| s.rows.to_string());
        println!(
            "  {:<24} {:<12} rows={rows} {}",
            partition.vid.as_str(),
            partition.table,
            flags.join(",")
        );
    }
    Ok(EXIT_SUCCESS)
}
