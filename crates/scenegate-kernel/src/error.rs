use thiserror::Error;

use crate::audit::LedgerError;
use crate::registry::RegistryError;
use crate::session::SessionError;

/// Pipeline error taxonomy. Every variant is returned to callers as data
/// (`{"error": ..., "code": ...}`); none of them escape as a host fault.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("UNSAFE_STATE: host is {0}; operation rejected")]
    UnsafeState(String),
    #[error("SANITY_CHECK: {key} {value} exceeds cap ({cap})")]
    SanityRejected { key: String, value: f64, cap: f64 },
    #[error("Tool not found: {0}")]
    ToolNotFound(String),
    #[error("Target not found: {0}")]
    TargetNotFound(String),
    #[error("{action} failed: {reason}")]
    HandlerFailure { action: String, reason: String },
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Recipe aborted at step {step} ({action}): {reason}")]
    RecipeAborted {
        step: usize,
        action: String,
        reason: String,
    },
    #[error("kernel is {0}; mutating commands are only accepted while running")]
    NotRunning(String),
    #[error("malformed command: {0}")]
    MalformedCommand(String),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("audit ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

impl KernelError {
    /// Stable machine-readable code carried next to the message.
    pub fn code(&self) -> &'static str {
        match self {
            KernelError::UnsafeState(_) => "UNSAFE_STATE",
            KernelError::SanityRejected { .. } => "SANITY_REJECTED",
            KernelError::ToolNotFound(_) => "TOOL_NOT_FOUND",
            KernelError::TargetNotFound(_) => "TARGET_NOT_FOUND",
            KernelError::HandlerFailure { .. } => "HANDLER_FAILURE",
            KernelError::Unauthorized => "UNAUTHORIZED",
            KernelError::RecipeAborted { .. } => "RECIPE_ABORTED",
            KernelError::NotRunning(_) => "NOT_RUNNING",
            KernelError::MalformedCommand(_) => "MALFORMED_COMMAND",
            KernelError::Registry(_) | KernelError::Ledger(_) | KernelError::Session(_) => {
                "INTERNAL"
            }
        }
    }

    /// Whether a caller may reasonably retry the same command later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KernelError::UnsafeState(_) | KernelError::TargetNotFound(_) | KernelError::NotRunning(_)
        )
    }

    /// Wire representation used by both intake channels.
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        })
    }
}
