//! Typed view of the phase state persisted in a bundle's [`ConfigStore`].

use crate::config::{is_truthy, ConfigStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Group holding completion markers and timings (`prepared`, `built`, `buildtime`, ...).
pub const PROCESS_GROUP: &str = "process";
/// Group holding the current phase, the error marker, and per-phase entry times.
pub const STATE_GROUP: &str = "process.state";

pub const KEY_DBCREATED: &str = "dbcreated";
pub const KEY_PREPARED: &str = "prepared";
pub const KEY_BUILT: &str = "built";
pub const KEY_BUILDTIME: &str = "buildtime";
pub const KEY_UPDATED: &str = "updated";
pub const KEY_UPDATETIME: &str = "updatetime";
pub const KEY_INSTALLED: &str = "installed";
pub const KEY_SUBMITTED: &str = "submitted";
pub const KEY_EXTRACTED: &str = "extracted";
pub const KEY_LAST: &str = "last";

const KEY_CURRENT: &str = "current";
const KEY_ERROR: &str = "error";
const KEY_LASTTIME: &str = "lasttime";

/// Pipeline phase. Variants are declared in their intended order of progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Synced,
    Cleaning,
    Cleaned,
    Preparing,
    Prepared,
    Building,
    Built,
    Finalizing,
    Finalized,
    Installing,
    Installed,
}

impl Phase {
    pub const ALL: [Phase; 11] = [
        Phase::Synced,
        Phase::Cleaning,
        Phase::Cleaned,
        Phase::Preparing,
        Phase::Prepared,
        Phase::Building,
        Phase::Built,
        Phase::Finalizing,
        Phase::Finalized,
        Phase::Installing,
        Phase::Installed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Synced => "synced",
            Phase::Cleaning => "cleaning",
            Phase::Cleaned => "cleaned",
            Phase::Preparing => "preparing",
            Phase::Prepared => "prepared",
            Phase::Building => "building",
            Phase::Built => "built",
            Phase::Finalizing => "finalizing",
            Phase::Finalized => "finalized",
            Phase::Installing => "installing",
            Phase::Installed => "installed",
        }
    }

    /// True for the "-ing" variants a phase holds while its body runs (and
    /// keeps if the body fails).
    pub fn in_progress(self) -> bool {
        matches!(
            self,
            Phase::Cleaning
                | Phase::Preparing
                | Phase::Building
                | Phase::Finalizing
                | Phase::Installing
        )
    }

    /// The settled variant a successful phase ends in.
    pub fn completed(self) -> Phase {
        match self {
            Phase::Cleaning => Phase::Cleaned,
            Phase::Preparing => Phase::Prepared,
            Phase::Building => Phase::Built,
            Phase::Finalizing => Phase::Finalized,
            Phase::Installing => Phase::Installed,
            other => other,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown phase '{s}'"))
    }
}

/// Completion markers written under the `process` group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMarker {
    Building,
    Prepared,
    Built,
    Updated,
    Installed,
    Submitted,
    Extracted,
    /// Failure of the named phase; recorded as `failed/<phase>` in `process.last`.
    Failed(&'static str),
}

impl BuildMarker {
    pub fn label(self) -> String {
        match self {
            BuildMarker::Building => "building".to_owned(),
            BuildMarker::Prepared => KEY_PREPARED.to_owned(),
            BuildMarker::Built => KEY_BUILT.to_owned(),
            BuildMarker::Updated => KEY_UPDATED.to_owned(),
            BuildMarker::Installed => KEY_INSTALLED.to_owned(),
            BuildMarker::Submitted => KEY_SUBMITTED.to_owned(),
            BuildMarker::Extracted => KEY_EXTRACTED.to_owned(),
            BuildMarker::Failed(phase) => format!("failed/{phase}"),
        }
    }
}

/// Record `marker` in the `process` group. Completion markers are stamped
/// with the current RFC 3339 time; every marker updates `process.last`.
pub fn set_build_state(store: &mut dyn ConfigStore, marker: BuildMarker) {
    let label = marker.label();
    if !matches!(marker, BuildMarker::Failed(_)) {
        store.set(PROCESS_GROUP, &label, json!(now_rfc3339()));
    }
    store.set(PROCESS_GROUP, KEY_LAST, json!(label));
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Seconds since the Unix epoch, with sub-second precision.
pub fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Phase, error marker, and phase timestamps of a bundle.
///
/// The error marker is independent of the phase: a failed phase leaves the
/// phase at its in-progress variant and sets `error`, and only entering a new
/// phase clears it again.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateRecord {
    pub current: Option<Phase>,
    pub error: Option<f64>,
    pub lasttime: Option<f64>,
    pub timestamps: BTreeMap<String, f64>,
}

impl StateRecord {
    pub fn load(store: &dyn ConfigStore) -> Self {
        let group = store.group(STATE_GROUP);
        let current = group
            .get(KEY_CURRENT)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok());
        let error = group
            .get(KEY_ERROR)
            .filter(|v| is_truthy(v))
            .and_then(Value::as_f64);
        let lasttime = group.get(KEY_LASTTIME).and_then(Value::as_f64);
        let timestamps = group
            .iter()
            .filter(|(k, _)| k.parse::<Phase>().is_ok())
            .filter_map(|(k, v)| v.as_f64().map(|t| (k.clone(), t)))
            .collect();
        Self {
            current,
            error,
            lasttime,
            timestamps,
        }
    }

    /// Enter `phase`: make it current, clear the error marker, and stamp the
    /// phase and `lasttime`.
    pub fn enter(store: &mut dyn ConfigStore, phase: Phase) {
        let now = now_epoch();
        store.set(STATE_GROUP, KEY_CURRENT, json!(phase.as_str()));
        store.set(STATE_GROUP, KEY_ERROR, json!(false));
        store.set(STATE_GROUP, phase.as_str(), json!(now));
        store.set(STATE_GROUP, KEY_LASTTIME, json!(now));
    }

    pub fn mark_error(store: &mut dyn ConfigStore) {
        store.set(STATE_GROUP, KEY_ERROR, json!(now_epoch()));
    }

    pub fn clear(store: &mut dyn ConfigStore) {
        store.clear_group(STATE_GROUP);
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn entered(&self, phase: Phase) -> Option<f64> {
        self.timestamps.get(phase.as_str()).copied()
    }
}
