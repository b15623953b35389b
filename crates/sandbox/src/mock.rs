//! Mock sandbox engine and backend for testing.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use codebox_bridge::BridgeChannel;
use codebox_core::{BackendVariant, EnvironmentConfig, Error, Namespace, Result, SessionId, Value};

use crate::backend::{BlockOutput, BlockRequest, ExecControl, SandboxBackend};
use crate::engine::{host_path, ExecResult, SandboxEngine, SandboxId, RUNNER_NAME};
use crate::factory::BackendFactory;

// =============================================================================
// Mock Engine
// =============================================================================

/// Engine whose "sandbox" is a local temporary directory.
///
/// Runner commands execute the job in this process on a blocking thread,
/// unless a scripted response is queued, which is returned instead.
/// Other commands succeed without doing anything.
pub struct MockEngine {
    dir: TempDir,
    root: String,
    variant: BackendVariant,
    available: bool,
    exec_responses: tokio::sync::Mutex<VecDeque<ExecResult>>,
    commands: Mutex<Vec<Vec<String>>>,
    destroyed: AtomicUsize,
}

impl MockEngine {
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("codebox-mock-").tempdir()?;
        let root = dir.path().to_string_lossy().into_owned();
        Ok(Self {
            dir,
            root,
            variant: BackendVariant::Container,
            available: true,
            exec_responses: tokio::sync::Mutex::new(VecDeque::new()),
            commands: Mutex::new(Vec::new()),
            destroyed: AtomicUsize::new(0),
        })
    }

    pub fn with_variant(mut self, variant: BackendVariant) -> Self {
        self.variant = variant;
        self
    }

    /// Report the engine as unavailable.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Queue a result for the next runner invocation.
    pub async fn push_runner_response(&self, result: ExecResult) {
        self.exec_responses.lock().await.push_back(result);
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn destroy_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn host_root(&self) -> &Path {
        self.dir.path()
    }
}

#[async_trait]
impl SandboxEngine for MockEngine {
    fn variant(&self) -> BackendVariant {
        self.variant
    }

    fn root(&self) -> &str {
        &self.root
    }

    async fn create(&self, _session: &SessionId) -> Result<SandboxId> {
        for dir in ["bin", "state", "jobs", "work"] {
            tokio::fs::create_dir_all(self.dir.path().join(dir)).await?;
        }
        Ok(SandboxId(format!("mock-sandbox-{}", uuid::Uuid::new_v4())))
    }

    async fn install_runner(&self, _id: &SandboxId) -> Result<String> {
        Ok(self.sandbox_path(&format!("bin/{}", RUNNER_NAME)))
    }

    async fn exec(&self, _id: &SandboxId, command: &[String], timeout: Duration) -> Result<ExecResult> {
        self.commands
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(command.to_vec());

        let is_runner = command.first().is_some_and(|c| c.ends_with(RUNNER_NAME));
        if !is_runner {
            return Ok(ExecResult {
                exit_code: 0,
                stdout: "[mock] command executed".to_string(),
                stderr: String::new(),
                timed_out: false,
            });
        }
        if let Some(scripted) = self.exec_responses.lock().await.pop_front() {
            return Ok(scripted);
        }

        let job = command
            .get(1)
            .cloned()
            .ok_or_else(|| Error::execution_fault("runner invoked without a job file"))?;
        let run = tokio::task::spawn_blocking(move || codebox_runtime::run_job_file(Path::new(&job)));
        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(Ok(line))) => Ok(ExecResult {
                exit_code: 0,
                stdout: format!("{}\n", line),
                stderr: String::new(),
                timed_out: false,
            }),
            Ok(Ok(Err(e))) => Ok(ExecResult {
                exit_code: 2,
                stdout: String::new(),
                stderr: format!("codebox-runner: {}", e),
                timed_out: false,
            }),
            Ok(Err(join)) => Err(Error::execution_fault(format!("mock runner panicked: {}", join))),
            Err(_) => Ok(ExecResult {
                exit_code: -1,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: true,
            }),
        }
    }

    async fn write_file(&self, _id: &SandboxId, path: &str, content: &[u8]) -> Result<()> {
        let target = host_path(self.dir.path(), path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, content).await?;
        Ok(())
    }

    async fn read_file(&self, _id: &SandboxId, path: &str) -> Result<Vec<u8>> {
        let target = host_path(self.dir.path(), path)?;
        tokio::fs::read(&target)
            .await
            .map_err(|e| Error::execution_fault(format!("File not found in mock sandbox: {} ({})", path, e)))
    }

    async fn destroy(&self, _id: &SandboxId) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_available(&self) -> bool {
        self.available
    }
}

// =============================================================================
// Mock Backend
// =============================================================================

/// One scripted reaction of [`MockBackend`] to a block.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Complete the block. Bindings are applied only when `error` is `None`.
    Output {
        stdout: String,
        bindings: Vec<(String, Value)>,
        error: Option<String>,
    },
    /// Fail with an execution fault.
    Fault(String),
    /// Run until cancelled, then stop with the given cleanliness.
    Hang { clean: bool },
    /// Ignore cancellation and never finish.
    Stuck,
}

impl MockStep {
    pub fn output(stdout: &str) -> Self {
        MockStep::Output {
            stdout: stdout.to_string(),
            bindings: Vec::new(),
            error: None,
        }
    }

    pub fn bind(name: &str, value: Value) -> Self {
        MockStep::Output {
            stdout: String::new(),
            bindings: vec![(name.to_string(), value)],
            error: None,
        }
    }

    pub fn error(message: &str) -> Self {
        MockStep::Output {
            stdout: String::new(),
            bindings: Vec::new(),
            error: Some(message.to_string()),
        }
    }
}

#[derive(Default)]
struct MockState {
    steps: VecDeque<MockStep>,
    fail_start: bool,
    started: usize,
    codes: Vec<String>,
    shutdowns: usize,
}

/// Scripted backend. Clones share their script and records, so a test can
/// keep one handle while the session manager owns another.
///
/// Blocks beyond the script complete with empty output.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, step: MockStep) -> Self {
        self.lock().steps.push_back(step);
        self
    }

    pub fn failing_start(self) -> Self {
        self.lock().fail_start = true;
        self
    }

    /// Source of every block run so far, in order.
    pub fn codes(&self) -> Vec<String> {
        self.lock().codes.clone()
    }

    pub fn start_count(&self) -> usize {
        self.lock().started
    }

    pub fn shutdown_count(&self) -> usize {
        self.lock().shutdowns
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl SandboxBackend for MockBackend {
    fn variant(&self) -> BackendVariant {
        BackendVariant::InProcess
    }

    async fn start(&mut self, _bridge: Arc<BridgeChannel>) -> Result<()> {
        let mut state = self.lock();
        if state.fail_start {
            return Err(Error::backend_init("mock backend refused to start"));
        }
        state.started += 1;
        Ok(())
    }

    async fn run_block(
        &mut self,
        namespace: &mut Namespace,
        block: &BlockRequest,
        ctl: &ExecControl,
    ) -> Result<BlockOutput> {
        let step = {
            let mut state = self.lock();
            state.codes.push(block.code.clone());
            state.steps.pop_front()
        };

        match step {
            None => Ok(BlockOutput::completed(String::new(), String::new(), None, None)),
            Some(MockStep::Output { stdout, bindings, error }) => {
                if error.is_none() {
                    for (name, value) in bindings {
                        namespace.insert(name, value);
                    }
                }
                Ok(BlockOutput::completed(stdout, String::new(), None, error))
            }
            Some(MockStep::Fault(message)) => Err(Error::execution_fault(message)),
            Some(MockStep::Hang { clean }) => {
                let reason = ctl.cancelled().await;
                Ok(BlockOutput::cancelled(reason, clean))
            }
            Some(MockStep::Stuck) => std::future::pending().await,
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.lock().shutdowns += 1;
        Ok(())
    }
}

impl BackendFactory for MockBackend {
    fn create(&self, _config: &EnvironmentConfig) -> Result<Box<dyn SandboxBackend>> {
        Ok(Box::new(self.clone()))
    }
}
