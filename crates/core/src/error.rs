//! Error types for Codebox.

use thiserror::Error;

use crate::types::SessionState;

/// Result type alias using Codebox's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for Codebox.
///
/// Errors raised by code *inside* a sandbox are never represented here; they
/// are recorded on the [`CodeBlock`](crate::types::CodeBlock) as data.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Session Creation
    // =========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend initialization failed: {0}")]
    BackendInit(String),

    // =========================================================================
    // Session Lifecycle
    // =========================================================================
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Operation '{operation}' not allowed while session is {state}")]
    InvalidState {
        state: SessionState,
        operation: &'static str,
    },

    // =========================================================================
    // Execution
    // =========================================================================
    #[error("Execution fault: {0}")]
    ExecutionFault(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    // =========================================================================
    // Query Bridge
    // =========================================================================
    #[error("Bridge error: {0}")]
    Bridge(String),

    #[error("Model backend error: {0}")]
    ModelBackend(String),

    #[error("Wire protocol error: {0}")]
    Wire(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a backend initialization error.
    pub fn backend_init(msg: impl Into<String>) -> Self {
        Self::BackendInit(msg.into())
    }

    /// Create an execution fault.
    pub fn execution_fault(msg: impl Into<String>) -> Self {
        Self::ExecutionFault(msg.into())
    }

    /// Create a snapshot error.
    pub fn snapshot(msg: impl Into<String>) -> Self {
        Self::Snapshot(msg.into())
    }

    /// Create a bridge error.
    pub fn bridge(msg: impl Into<String>) -> Self {
        Self::Bridge(msg.into())
    }

    /// Create a model backend error.
    pub fn model_backend(msg: impl Into<String>) -> Self {
        Self::ModelBackend(msg.into())
    }

    /// Create a wire protocol error.
    pub fn wire(msg: impl Into<String>) -> Self {
        Self::Wire(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(state: SessionState, operation: &'static str) -> Self {
        Self::InvalidState { state, operation }
    }

    /// Whether this error must be reported at session creation and not retried.
    pub fn is_fatal_at_creation(&self) -> bool {
        matches!(self, Self::Config(_) | Self::BackendInit(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
