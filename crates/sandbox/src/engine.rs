//! Sandbox engines.
//!
//! A [`SandboxEngine`] provides the primitive operations an isolated
//! backend needs from a sandbox: create it, move files in and out, run a
//! command, and destroy it. The Docker engine drives a local container via
//! `bollard`; the remote engine talks to a managed sandbox service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use codebox_core::{BackendVariant, Error, Result, SessionId};

/// Name of the runner binary inside a sandbox.
pub const RUNNER_NAME: &str = "codebox-runner";

// =============================================================================
// Sandbox Types
// =============================================================================

/// Unique identifier for a sandbox instance.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SandboxId(pub String);

impl std::fmt::Display for SandboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of executing a command in the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    /// Exit code of the command.
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    /// Whether the command timed out.
    #[serde(default)]
    pub timed_out: bool,
}

impl ExecResult {
    /// Whether the execution was successful (exit code 0, no timeout).
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

// =============================================================================
// Sandbox Engine Trait
// =============================================================================

/// Primitive sandbox operations used by the isolated backends.
///
/// File paths passed to `write_file`/`read_file` are relative to
/// [`root`](Self::root); commands receive absolute in-sandbox paths.
#[async_trait]
pub trait SandboxEngine: Send + Sync {
    fn variant(&self) -> BackendVariant;

    /// Absolute directory inside the sandbox holding codebox files.
    fn root(&self) -> &str;

    /// Create and start a sandbox for `session`.
    async fn create(&self, session: &SessionId) -> Result<SandboxId>;

    /// Make the runner available inside the sandbox and return the command
    /// that invokes it.
    async fn install_runner(&self, id: &SandboxId) -> Result<String>;

    /// Execute a command inside the sandbox.
    async fn exec(&self, id: &SandboxId, command: &[String], timeout: Duration) -> Result<ExecResult>;

    async fn write_file(&self, id: &SandboxId, path: &str, content: &[u8]) -> Result<()>;

    async fn read_file(&self, id: &SandboxId, path: &str) -> Result<Vec<u8>>;

    /// Kill the runner whose pid is recorded in `pid_file`, leaving the
    /// sandbox usable. Returns false when the engine cannot do that.
    async fn interrupt(&self, id: &SandboxId, pid_file: &str) -> Result<bool> {
        let _ = (id, pid_file);
        Ok(false)
    }

    /// Destroy the sandbox and clean up resources.
    async fn destroy(&self, id: &SandboxId) -> Result<()>;

    /// Check if the sandbox backend is available (e.g., Docker daemon running).
    async fn is_available(&self) -> bool;

    /// Absolute in-sandbox path of `relative`.
    fn sandbox_path(&self, relative: &str) -> String {
        format!("{}/{}", self.root().trim_end_matches('/'), relative.trim_start_matches('/'))
    }
}

/// Join a sandbox-relative path onto a host directory, refusing escapes.
pub fn host_path(base: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    if rel.is_absolute() || rel.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
        return Err(Error::internal(format!("sandbox path '{}' is not a plain relative path", relative)));
    }
    Ok(base.join(rel))
}

/// Host path of the runner binary: the configured one, or `codebox-runner`
/// next to the current executable.
pub fn locate_runner(configured: Option<&Path>) -> Result<PathBuf> {
    let path = match configured {
        Some(path) => path.to_path_buf(),
        None => std::env::current_exe()?
            .parent()
            .map(|dir| dir.join(RUNNER_NAME))
            .ok_or_else(|| Error::backend_init("cannot determine the runner location"))?,
    };
    if !path.is_file() {
        return Err(Error::backend_init(format!(
            "runner binary not found at {} (build it with `cargo build -p codebox_runtime`)",
            path.display()
        )));
    }
    Ok(path)
}
