//! The sandbox backend contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use codebox_bridge::BridgeChannel;
use codebox_core::{BackendVariant, Namespace, Result, SessionId, Value};

// =============================================================================
// Block Types
// =============================================================================

/// One block handed to a backend.
#[derive(Debug, Clone)]
pub struct BlockRequest {
    pub session_id: SessionId,
    pub ordinal: u64,
    pub code: String,
    pub execute_timeout: Duration,
    pub query_timeout: Duration,
}

/// Why a block was stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Requested,
    TimedOut,
}

/// How a block ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Ran to the end, with or without an in-sandbox error.
    Completed,
    /// Stopped early. `clean` is true when the sandbox is still usable.
    Cancelled { reason: CancelReason, clean: bool },
}

/// What a backend reports for one block.
#[derive(Debug, Clone)]
pub struct BlockOutput {
    pub stdout: String,
    pub stderr: String,
    pub return_value: Option<Value>,
    /// In-sandbox error message.
    pub error: Option<String>,
    pub termination: Termination,
}

impl BlockOutput {
    pub fn completed(stdout: String, stderr: String, return_value: Option<Value>, error: Option<String>) -> Self {
        Self {
            stdout,
            stderr,
            return_value,
            error,
            termination: Termination::Completed,
        }
    }

    pub fn cancelled(reason: CancelReason, clean: bool) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            return_value: None,
            error: None,
            termination: Termination::Cancelled { reason, clean },
        }
    }
}

// =============================================================================
// Execution Control
// =============================================================================

/// Cancellation signal for one running block. The first reason wins.
#[derive(Debug)]
pub struct ExecControl {
    state: watch::Sender<Option<CancelReason>>,
}

impl ExecControl {
    pub fn new() -> Self {
        Self {
            state: watch::channel(None).0,
        }
    }

    /// Request cancellation. Returns false if already cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(reason);
            true
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.state.borrow()
    }

    /// Resolve once cancellation has been requested.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.state.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(CancelReason::Requested),
            Err(_) => CancelReason::Requested,
        };
        reason
    }
}

impl Default for ExecControl {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Backend Trait
// =============================================================================

/// An isolation variant able to run code blocks against a namespace.
///
/// `run_block` replaces `namespace` only when the block completes without
/// an in-sandbox error. An `Err` means the sandbox itself broke
/// (`ExecutionFault`); in-sandbox errors are reported in [`BlockOutput`].
/// Implementations watch `ctl` and return a cancelled output once it fires.
#[async_trait]
pub trait SandboxBackend: Send {
    fn variant(&self) -> BackendVariant;

    /// Acquire sandbox resources and wire the session's bridge channel.
    async fn start(&mut self, bridge: Arc<BridgeChannel>) -> Result<()>;

    async fn run_block(
        &mut self,
        namespace: &mut Namespace,
        block: &BlockRequest,
        ctl: &ExecControl,
    ) -> Result<BlockOutput>;

    /// Release sandbox resources. Safe to call more than once.
    async fn shutdown(&mut self) -> Result<()>;
}
