//! Runner job contract shared by the isolated backends and `codebox-runner`.
//!
//! The host writes the namespace snapshot and a [`RunnerJob`] into the
//! sandbox, starts the runner, and reads one [`RunnerOutcome`] line back
//! from the runner's stdout. The snapshot is rewritten only when the block
//! completes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use codebox_core::{Error, Namespace, Result, SessionId, Value};

use crate::capability::CapabilitySet;
use crate::interpreter::{Interpreter, Interrupt, Limits};
use crate::port::{NullPort, QueryPort, TcpQueryPort};

/// Prefix of the outcome line on the runner's stdout.
pub const OUTCOME_MARKER: &str = "__CODEBOX_OUTCOME__ ";

fn default_retries() -> u32 {
    3
}

/// One block to run inside an isolated sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerJob {
    pub session_id: SessionId,
    pub block: u64,
    pub code: String,
    /// Snapshot read before and rewritten after a successful block.
    pub snapshot_path: PathBuf,
    /// Root for the file capability. File access is disabled when absent.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// `host:port` of the bridge listener as seen from inside the sandbox.
    #[serde(default)]
    pub bridge_address: Option<String>,
    /// Secret the bridge listener expects on every request.
    #[serde(default)]
    pub bridge_token: Option<String>,
    pub query_timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub connect_retries: u32,
    pub execute_timeout_ms: u64,
    pub max_output_bytes: usize,
    #[serde(default)]
    pub max_memory_bytes: Option<usize>,
    /// Where the runner records its pid so the host can kill it.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
}

impl RunnerJob {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

/// What the runner reports back for one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerOutcome {
    pub stdout: String,
    pub stderr: String,
    pub return_value: Option<Value>,
    pub error: Option<String>,
    pub interrupted: bool,
    /// Binding count of the committed snapshot, 0 when nothing was committed.
    pub bindings: usize,
}

impl RunnerOutcome {
    pub fn render(&self) -> Result<String> {
        Ok(format!("{}{}", OUTCOME_MARKER, serde_json::to_string(self)?))
    }
}

/// Execute a job against its snapshot.
pub fn run_job(job: &RunnerJob) -> Result<RunnerOutcome> {
    if let Some(pid_file) = &job.pid_file {
        std::fs::write(pid_file, std::process::id().to_string())?;
    }

    let result = execute(job);

    if let Some(pid_file) = &job.pid_file {
        let _ = std::fs::remove_file(pid_file);
    }
    result
}

fn execute(job: &RunnerJob) -> Result<RunnerOutcome> {
    let namespace = Namespace::read_snapshot(&job.snapshot_path)?;

    let capabilities = match &job.workdir {
        Some(dir) => CapabilitySet::standard().with_files(dir),
        None => CapabilitySet::standard(),
    };
    let interpreter = Interpreter::new(
        capabilities,
        Limits {
            max_output_bytes: job.max_output_bytes,
            max_memory_bytes: job.max_memory_bytes,
            ..Limits::default()
        },
    );

    let port: Arc<dyn QueryPort> = match &job.bridge_address {
        Some(address) => {
            let mut port = TcpQueryPort::new(
                address.clone(),
                job.session_id.clone(),
                job.block,
                Duration::from_millis(job.query_timeout_ms),
            )
            .with_retries(job.connect_retries);
            if let Some(token) = &job.bridge_token {
                port = port.with_token(token.clone());
            }
            Arc::new(port)
        }
        None => Arc::new(NullPort),
    };
    let interrupt = Arc::new(Interrupt::with_deadline(
        Instant::now() + Duration::from_millis(job.execute_timeout_ms),
    ));

    let execution = interpreter.run(&job.code, &namespace, port, interrupt)?;

    let bindings = match &execution.namespace {
        Some(next) => {
            next.write_snapshot(&job.snapshot_path)?;
            next.len()
        }
        None => 0,
    };

    Ok(RunnerOutcome {
        stdout: execution.stdout,
        stderr: execution.stderr,
        return_value: execution.return_value,
        error: execution.error,
        interrupted: execution.interrupted,
        bindings,
    })
}

/// Load a job file, run it and render the outcome line.
pub fn run_job_file(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)?;
    let job: RunnerJob = serde_json::from_str(&raw)
        .map_err(|e| Error::execution_fault(format!("malformed runner job {}: {}", path.display(), e)))?;
    run_job(&job)?.render()
}

/// Find and decode the outcome line in the runner's stdout.
pub fn parse_outcome(stdout: &str) -> Result<RunnerOutcome> {
    let line = stdout
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(OUTCOME_MARKER))
        .ok_or_else(|| Error::execution_fault("sandbox runner produced no outcome"))?;
    serde_json::from_str(line)
        .map_err(|e| Error::execution_fault(format!("malformed runner outcome: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(dir: &Path, block: u64, code: &str) -> RunnerJob {
        RunnerJob {
            session_id: SessionId("cbx-test".into()),
            block,
            code: code.to_string(),
            snapshot_path: dir.join("state.json"),
            workdir: Some(dir.to_path_buf()),
            bridge_address: None,
            bridge_token: None,
            query_timeout_ms: 1_000,
            connect_retries: 0,
            execute_timeout_ms: 5_000,
            max_output_bytes: 4096,
            max_memory_bytes: None,
            pid_file: Some(dir.join("runner.pid")),
        }
    }

    #[test]
    fn test_state_carries_across_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut seed = Namespace::new();
        seed.insert("x", Value::Int(1));
        seed.write_snapshot(&dir.path().join("state.json")).unwrap();

        let first = run_job(&job(dir.path(), 1, "x = x + 1")).unwrap();
        assert!(first.error.is_none());
        assert_eq!(first.bindings, 1);

        let second = run_job(&job(dir.path(), 2, "print(x)\nreturn x")).unwrap();
        assert_eq!(second.stdout, "2\n");
        assert_eq!(second.return_value, Some(Value::Int(2)));
        assert!(!dir.path().join("runner.pid").exists());
    }

    #[test]
    fn test_failed_job_keeps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        run_job(&job(dir.path(), 1, "x = 1")).unwrap();

        let failed = run_job(&job(dir.path(), 2, "x = 2\nerror('nope')")).unwrap();
        assert!(failed.error.unwrap().contains("nope"));
        assert_eq!(failed.bindings, 0);

        let snapshot = Namespace::read_snapshot(&dir.path().join("state.json")).unwrap();
        assert_eq!(snapshot.get("x"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_job_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let mut slow = job(dir.path(), 1, "while true do end");
        slow.execute_timeout_ms = 50;
        let outcome = run_job(&slow).unwrap();
        assert!(outcome.interrupted);
    }

    #[test]
    fn test_outcome_line_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        job(dir.path(), 1, "return 'done'").write_to(&path).unwrap();

        let line = run_job_file(&path).unwrap();
        assert!(line.starts_with(OUTCOME_MARKER));

        let stdout = format!("noise\n{}\n", line);
        let outcome = parse_outcome(&stdout).unwrap();
        assert_eq!(outcome.return_value, Some(Value::Str("done".into())));
    }

    #[test]
    fn test_missing_outcome_is_fault() {
        let err = parse_outcome("segfault\n").unwrap_err();
        assert!(matches!(err, Error::ExecutionFault(_)));
    }
}
