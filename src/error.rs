//! Crate-wide error taxonomy.
//!
//! Mirrors the policy table of the engine's error handling design: each
//! variant maps to one row (caller-surfaced vs. audit-only, retriable vs.
//! fatal). Components return `Result<T, EngineError>` uniformly instead of
//! the ad hoc `Result<T, String>` style of one-off helpers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {issues:?}")]
    ValidationError { issues: Vec<String> },

    #[error("action failed: rule={rule_id} action_index={action_index}: {message}")]
    ActionFailed {
        rule_id: String,
        action_index: usize,
        message: String,
    },

    #[error("cascade depth exceeded: correlation={correlation_id} depth={depth} max={max}")]
    CascadeDepthExceeded {
        correlation_id: String,
        depth: u32,
        max: u32,
    },

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("storage error ({operation}): {message}")]
    StorageError { operation: String, message: String },
}

impl EngineError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Surfaced synchronously to the external caller (spec §7), as opposed to
    /// errors captured only as audit entries during cascade processing.
    pub fn is_caller_facing(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::Conflict(_) | Self::NotFound(_) | Self::ValidationError { .. }
        )
    }

    /// `StorageError` is the only variant the engine retries (capped
    /// exponential backoff, three attempts) before failing closed.
    pub fn is_retriable_storage(&self) -> bool {
        matches!(self, Self::StorageError { .. })
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
