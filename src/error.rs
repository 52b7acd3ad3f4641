//! Error taxonomy for an assessment run.
//!
//! Every variant is fatal to the step that raised it. The top-level runner
//! (`warden::run`) converts any of them into the fail-safe assessment, so a
//! decision artifact is always produced.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Failure modes of the agent session and the extraction pipeline.
#[derive(Debug, Error)]
pub enum WardenError {
    /// The agent process exited (or closed stdout) while we still needed it.
    #[error("agent process exited ({status}); stderr: {stderr}")]
    TransportFailure { status: String, stderr: String },

    /// No response to a request within the per-RPC deadline.
    #[error("timed out after {}s waiting for JSON-RPC response to {method}; stderr: {stderr}", .after.as_secs())]
    RpcTimeout {
        method: String,
        after: Duration,
        stderr: String,
    },

    /// No completion signal for a turn within the per-turn deadline.
    #[error("timed out after {}s waiting for completion of turn {turn_id}; stderr: {stderr}", .after.as_secs())]
    TurnTimeout {
        turn_id: String,
        after: Duration,
        stderr: String,
    },

    /// The agent answered a request with a JSON-RPC error object.
    #[error("JSON-RPC error from agent for {method}: code {code}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    /// A response was well-formed JSON-RPC but lacked something we depend on.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No schema-conforming assessment could be recovered.
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    /// The repair turn did not help either; both attempts' diagnostics are kept.
    #[error("assessment extraction failed after repair turn; first attempt: {first}; repair attempt: {repair}")]
    RepairFailed {
        first: ExtractionError,
        repair: ExtractionError,
    },

    #[error("agent pipe I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// Whether this is the turn-completion wait expiring (and nothing worse).
    pub fn is_turn_timeout(&self) -> bool {
        matches!(self, WardenError::TurnTimeout { .. })
    }
}

/// Every candidate found during an extraction pass failed validation, or no
/// candidate was found at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionError {
    pub errors: Vec<String>,
}

impl ExtractionError {
    pub fn new(errors: Vec<String>) -> Self {
        Self { errors }
    }
}

impl fmt::Display for ExtractionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: Vec<&str> = self.errors.iter().take(3).map(String::as_str).collect();
        write!(
            f,
            "no valid structured assessment found in payload (errors={shown:?})"
        )
    }
}

impl std::error::Error for ExtractionError {}
