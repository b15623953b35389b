use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{RequestId, Value};

// =============================================================================
// Code Blocks
// =============================================================================

/// One executed unit of code, recorded in a session's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeBlock {
    /// Position in the session history, starting at 1.
    pub ordinal: u64,
    /// Source text as submitted.
    pub source: String,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error (warnings, tracebacks).
    pub stderr: String,
    /// Value returned by the block, if any.
    pub return_value: Option<Value>,
    /// Structured error, if the block did not complete cleanly.
    pub error: Option<BlockError>,
    /// Queries answered while the block ran.
    pub queries: Vec<QueryTrace>,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock execution time.
    pub duration_ms: u64,
}

impl CodeBlock {
    /// Whether the block completed without any error.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Why a block did not complete cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockErrorKind {
    /// The executed code raised an error. The session stays usable.
    InSandbox,
    /// The sandbox or isolation boundary failed. The session is `failed`.
    ExecutionFault,
    /// The execute timeout elapsed.
    Timeout,
    /// The block was cancelled by the caller.
    Cancelled,
}

/// Structured error attached to a [`CodeBlock`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockError {
    pub kind: BlockErrorKind,
    pub message: String,
}

impl BlockError {
    pub fn new(kind: BlockErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn in_sandbox(message: impl Into<String>) -> Self {
        Self::new(BlockErrorKind::InSandbox, message)
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self::new(BlockErrorKind::ExecutionFault, message)
    }
}

impl std::fmt::Display for BlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Record of one query served through the bridge during a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTrace {
    pub request_id: RequestId,
    /// Number of prompts carried (1 for single queries).
    pub prompts: usize,
    /// Whether the response carried an error indicator.
    pub failed: bool,
    pub duration_ms: u64,
}
