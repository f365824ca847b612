use std::path::{Path, PathBuf};

use crate::gate::SanityLimits;
use crate::telemetry::DEFAULT_TELEMETRY_CAPACITY;

pub const REGISTRY_FILE: &str = "metadata/registry.json";
pub const SESSION_FILE: &str = "metadata/session.json";
pub const AUDIT_LOG_FILE: &str = "logs/audit.jsonl";

/// Durable locations and limits for one kernel. `None` paths keep that piece
/// of state in memory only.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelConfig {
    pub registry_path: Option<PathBuf>,
    pub session_path: Option<PathBuf>,
    pub audit_log_path: Option<PathBuf>,
    pub sanity: SanityLimits,
    pub telemetry_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            registry_path: None,
            session_path: None,
            audit_log_path: None,
            sanity: SanityLimits::default(),
            telemetry_capacity: DEFAULT_TELEMETRY_CAPACITY,
        }
    }
}

impl KernelConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Standard on-disk layout under a project root.
    pub fn rooted(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            registry_path: Some(root.join(REGISTRY_FILE)),
            session_path: Some(root.join(SESSION_FILE)),
            audit_log_path: Some(root.join(AUDIT_LOG_FILE)),
            ..Self::default()
        }
    }
}
