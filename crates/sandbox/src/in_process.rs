//! In-process backend: the embedded interpreter on a blocking thread of the
//! host runtime. Suitable for trusted code only.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tokio::runtime::Handle;
use tracing::{debug, info};

use codebox_bridge::BridgeChannel;
use codebox_core::{BackendVariant, Error, ExecutionLimits, InProcessOptions, Namespace, QueryRequest, Result, SessionId};
use codebox_runtime::{CapabilitySet, Interpreter, Interrupt, Limits, QueryPort};

use crate::backend::{BlockOutput, BlockRequest, CancelReason, ExecControl, SandboxBackend};

// =============================================================================
// Channel Port
// =============================================================================

/// Query port that dispatches straight into the session's bridge channel.
///
/// Called from the interpreter thread; blocks that thread on the host
/// runtime until the channel answers.
pub struct ChannelPort {
    channel: Arc<BridgeChannel>,
    handle: Handle,
    session_id: SessionId,
    block: u64,
}

impl ChannelPort {
    pub fn new(channel: Arc<BridgeChannel>, handle: Handle, session_id: SessionId, block: u64) -> Self {
        Self {
            channel,
            handle,
            session_id,
            block,
        }
    }
}

impl QueryPort for ChannelPort {
    fn query(&self, prompt: &str) -> std::result::Result<String, String> {
        let request = QueryRequest::single(self.session_id.clone(), self.block, prompt);
        self.handle.block_on(self.channel.dispatch(request)).into_single()
    }

    fn query_batched(&self, prompts: &[String]) -> Vec<std::result::Result<String, String>> {
        if prompts.is_empty() {
            return Vec::new();
        }
        let request = QueryRequest::batched(self.session_id.clone(), self.block, prompts.to_vec());
        self.handle
            .block_on(self.channel.dispatch(request))
            .into_batch(prompts.len())
    }
}

// =============================================================================
// Backend
// =============================================================================

pub struct InProcessBackend {
    options: InProcessOptions,
    limits: ExecutionLimits,
    workdir: Option<PathBuf>,
    scratch: Option<TempDir>,
    bridge: Option<Arc<BridgeChannel>>,
}

impl InProcessBackend {
    pub fn new(options: InProcessOptions, limits: ExecutionLimits) -> Self {
        Self {
            options,
            limits,
            workdir: None,
            scratch: None,
            bridge: None,
        }
    }

    /// Directory exposed to the file primitives, once started.
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }
}

#[async_trait]
impl SandboxBackend for InProcessBackend {
    fn variant(&self) -> BackendVariant {
        BackendVariant::InProcess
    }

    async fn start(&mut self, bridge: Arc<BridgeChannel>) -> Result<()> {
        let workdir = match &self.options.workdir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await.map_err(|e| {
                    Error::backend_init(format!("cannot create workdir {}: {}", dir.display(), e))
                })?;
                dir.clone()
            }
            None => {
                let scratch = tempfile::Builder::new()
                    .prefix("codebox-")
                    .tempdir()
                    .map_err(|e| Error::backend_init(format!("cannot create workdir: {}", e)))?;
                let path = scratch.path().to_path_buf();
                self.scratch = Some(scratch);
                path
            }
        };

        info!(session_id = %bridge.session_id(), workdir = %workdir.display(), "In-process sandbox ready");
        self.workdir = Some(workdir);
        self.bridge = Some(bridge);
        Ok(())
    }

    async fn run_block(
        &mut self,
        namespace: &mut Namespace,
        block: &BlockRequest,
        ctl: &ExecControl,
    ) -> Result<BlockOutput> {
        let (bridge, workdir) = match (&self.bridge, &self.workdir) {
            (Some(bridge), Some(workdir)) => (Arc::clone(bridge), workdir.clone()),
            _ => return Err(Error::execution_fault("in-process sandbox is not running")),
        };

        let interpreter = Interpreter::new(
            CapabilitySet::standard().with_files(workdir),
            Limits {
                max_output_bytes: self.limits.max_output_bytes,
                max_memory_bytes: self.limits.max_memory_bytes,
                ..Limits::default()
            },
        );
        let port: Arc<dyn QueryPort> = Arc::new(ChannelPort::new(
            bridge,
            Handle::current(),
            block.session_id.clone(),
            block.ordinal,
        ));
        // Backstop in case nobody cancels.
        let interrupt = Arc::new(Interrupt::with_deadline(Instant::now() + block.execute_timeout));

        let snapshot = namespace.clone();
        let code = block.code.clone();
        let worker_interrupt = Arc::clone(&interrupt);
        let mut worker =
            tokio::task::spawn_blocking(move || interpreter.run(&code, &snapshot, port, worker_interrupt));

        let mut cancelled = None;
        let joined = tokio::select! {
            joined = &mut worker => joined,
            reason = ctl.cancelled() => {
                debug!(ordinal = block.ordinal, ?reason, "Interrupting interpreter");
                interrupt.trigger();
                cancelled = Some(reason);
                (&mut worker).await
            }
        };

        let execution = joined.map_err(|e| Error::execution_fault(format!("interpreter thread failed: {}", e)))??;

        if execution.interrupted {
            let reason = cancelled
                .or_else(|| ctl.reason())
                .unwrap_or(CancelReason::TimedOut);
            let mut output = BlockOutput::cancelled(reason, true);
            output.stdout = execution.stdout;
            output.stderr = execution.stderr;
            return Ok(output);
        }

        if let Some(next) = execution.namespace {
            *namespace = next;
        }
        Ok(BlockOutput::completed(
            execution.stdout,
            execution.stderr,
            execution.return_value,
            execution.error,
        ))
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.bridge = None;
        self.workdir = None;
        if let Some(scratch) = self.scratch.take() {
            let _ = scratch.close();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Termination;
    use codebox_bridge::QueryHandler;
    use codebox_core::mocks::MockModel;
    use codebox_core::Value;
    use std::time::Duration;

    async fn started(model: MockModel) -> (InProcessBackend, Arc<BridgeChannel>, SessionId) {
        let session = SessionId::new();
        let handler = Arc::new(QueryHandler::new(Arc::new(model), 4));
        let bridge = Arc::new(BridgeChannel::new(session.clone(), handler, Duration::from_secs(5)));
        let mut backend = InProcessBackend::new(InProcessOptions::default(), ExecutionLimits::default());
        backend.start(Arc::clone(&bridge)).await.unwrap();
        (backend, bridge, session)
    }

    fn block(session: &SessionId, ordinal: u64, code: &str) -> BlockRequest {
        BlockRequest {
            session_id: session.clone(),
            ordinal,
            code: code.to_string(),
            execute_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_state_persists_between_blocks() {
        let (mut backend, _bridge, session) = started(MockModel::new()).await;
        let mut ns = Namespace::new();
        let ctl = ExecControl::new();

        backend.run_block(&mut ns, &block(&session, 1, "x = 41"), &ctl).await.unwrap();
        let out = backend
            .run_block(&mut ns, &block(&session, 2, "x = x + 1\nprint(x)\nreturn x"), &ctl)
            .await
            .unwrap();

        assert_eq!(out.termination, Termination::Completed);
        assert_eq!(out.stdout, "42\n");
        assert_eq!(out.return_value, Some(Value::Int(42)));
        assert_eq!(ns.get("x"), Some(&Value::Int(42)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shared_output_limit_applied() {
        let session = SessionId::new();
        let handler = Arc::new(QueryHandler::new(Arc::new(MockModel::new()), 1));
        let bridge = Arc::new(BridgeChannel::new(session.clone(), handler, Duration::from_secs(5)));
        let limits = ExecutionLimits {
            max_output_bytes: 16,
            max_memory_bytes: None,
        };
        let mut backend = InProcessBackend::new(InProcessOptions::default(), limits);
        backend.start(bridge).await.unwrap();

        let mut ns = Namespace::new();
        let out = backend
            .run_block(&mut ns, &block(&session, 1, "print(string.rep('a', 100))"), &ExecControl::new())
            .await
            .unwrap();
        assert!(out.stdout.starts_with(&"a".repeat(16)));
        assert!(out.stdout.contains("[output truncated]"));
        assert!(!out.stdout.contains(&"a".repeat(17)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_query_through_channel() {
        let (mut backend, bridge, session) = started(MockModel::new().with_reply("hi", "hello")).await;
        let mut ns = Namespace::new();
        bridge.begin_block(1);
        let out = backend
            .run_block(&mut ns, &block(&session, 1, "answer = llm_query('hi')"), &ExecControl::new())
            .await
            .unwrap();
        assert!(out.error.is_none(), "{:?}", out.error);
        assert_eq!(ns.get("answer"), Some(&Value::Str("hello".into())));
        assert_eq!(bridge.end_block().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_interrupts_loop() {
        let (mut backend, _bridge, session) = started(MockModel::new()).await;
        let mut ns = Namespace::new();
        ns.insert("kept", Value::Int(1));
        let ctl = Arc::new(ExecControl::new());

        let canceller = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                ctl.cancel(CancelReason::Requested);
            })
        };
        let out = backend
            .run_block(&mut ns, &block(&session, 1, "kept = 2\nwhile true do end"), &ctl)
            .await
            .unwrap();
        canceller.await.unwrap();

        assert_eq!(
            out.termination,
            Termination::Cancelled {
                reason: CancelReason::Requested,
                clean: true
            }
        );
        assert_eq!(ns.get("kept"), Some(&Value::Int(1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_files_live_in_workdir() {
        let (mut backend, _bridge, session) = started(MockModel::new()).await;
        let mut ns = Namespace::new();
        backend
            .run_block(&mut ns, &block(&session, 1, "write_file('notes.txt', 'abc')"), &ExecControl::new())
            .await
            .unwrap();
        let written = std::fs::read_to_string(backend.workdir().unwrap().join("notes.txt")).unwrap();
        assert_eq!(written, "abc");

        let workdir = backend.workdir().unwrap().to_path_buf();
        backend.shutdown().await.unwrap();
        assert!(!workdir.exists());
    }
}
