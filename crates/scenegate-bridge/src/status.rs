//! Advisory status and heartbeat files for out-of-process monitors.

use std::path::Path;

use scenegate_kernel::util::{now_iso8601, write_json_atomic};
use scenegate_kernel::{BridgeState, HealthReport};
use serde::{Deserialize, Serialize};

/// Contents of the status file. Rewritten on every lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: String,
    pub timestamp: String,
    #[serde(default)]
    pub nonce: Option<String>,
    pub pid: u32,
}

impl StatusSnapshot {
    pub fn now(state: BridgeState, nonce: Option<&str>) -> Self {
        Self {
            state: state.to_string(),
            timestamp: now_iso8601(),
            nonce: nonce.map(str::to_string),
            pid: std::process::id(),
        }
    }
}

pub fn write_status(path: &Path, state: BridgeState, nonce: Option<&str>) {
    if let Err(err) = write_json_atomic(path, &StatusSnapshot::now(state, nonce)) {
        tracing::debug!(path = %path.display(), "status write failed: {err}");
    }
}

pub fn write_health(path: &Path, report: &HealthReport) {
    if let Err(err) = write_json_atomic(path, report) {
        tracing::debug!(path = %path.display(), "health write failed: {err}");
    }
}
