//! Session manager: lifecycle, execution control and event emission.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

use codebox_bridge::{BridgeChannel, QueryHandler};
use codebox_core::{
    BlockError, BlockErrorKind, BlockExecutedPayload, CodeBlock, EnvironmentConfig, Error, EventEmitter,
    EventEnvelope, EventSeverity, EventType, Namespace, Result, SessionEndedPayload, SessionId, SessionStartedPayload,
    SessionState,
};
use codebox_sandbox::{BackendFactory, BlockRequest, CancelReason, ExecControl, SandboxBackend, Termination};

use crate::session::Session;

/// Ordinal under which `setup_code` runs. It is not recorded in history.
const SETUP_ORDINAL: u64 = 0;

type Lane = Option<Box<dyn SandboxBackend>>;

/// Result of running one block through a backend.
struct RunOutcome {
    block: CodeBlock,
    /// False when the backend can no longer be trusted.
    healthy: bool,
}

/// Owns every session and binds each to a backend, a namespace and a
/// bridge channel on the shared [`QueryHandler`].
///
/// Blocks within a session run one at a time; callers of `execute` on the
/// same session queue behind each other. Sessions never wait on each other.
pub struct SessionManager {
    handler: Arc<QueryHandler>,
    emitter: Arc<dyn EventEmitter>,
    factory: Arc<dyn BackendFactory>,
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionManager {
    pub fn new(handler: Arc<QueryHandler>, emitter: Arc<dyn EventEmitter>, factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            handler,
            emitter,
            factory,
            sessions: DashMap::new(),
        }
    }

    pub fn handler(&self) -> &Arc<QueryHandler> {
        &self.handler
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create and start a session.
    ///
    /// Fails with `Config` on invalid configuration or a failing
    /// `setup_code`, and with `BackendInit` when the sandbox cannot start.
    #[instrument(skip_all, fields(backend = %config.backend))]
    pub async fn create_session(&self, config: EnvironmentConfig) -> Result<SessionId> {
        config.validate()?;

        let id = SessionId::new();
        let mut backend = self.factory.create(&config).map_err(as_init_error)?;
        let bridge = Arc::new(BridgeChannel::new(
            id.clone(),
            Arc::clone(&self.handler),
            config.query_timeout(),
        ));

        if let Err(e) = backend.start(Arc::clone(&bridge)).await {
            warn!(session_id = %id, error = %e, "Backend failed to start");
            bridge.close();
            if let Err(e) = backend.shutdown().await {
                warn!(session_id = %id, error = %e, "Backend cleanup failed");
            }
            return Err(as_init_error(e));
        }

        let mut namespace = Namespace::new();
        if let Some(seed) = &config.seed {
            namespace.seed(seed);
        }
        let seeded_bindings = namespace.len();
        let setup_code = config.setup_code.clone();
        let session = Arc::new(Session::new(id.clone(), config, bridge, backend, namespace));

        if let Some(code) = &setup_code {
            let mut lane = session.lane.lock().await;
            let outcome = match lane.as_mut() {
                Some(backend) => self.run(&session, backend, code, SETUP_ORDINAL).await,
                None => return Err(Error::internal("backend released before setup")),
            };
            if let Some(error) = outcome.block.error {
                release(&session, &mut lane).await;
                return Err(Error::config(format!("setup_code failed: {}", error.message)));
            }
        }

        session.transition(SessionState::Ready)?;
        info!(session_id = %id, backend = %session.variant, seeded_bindings, "Session ready");

        let payload = SessionStartedPayload {
            backend: session.variant,
            seeded_bindings,
            ran_setup_code: setup_code.is_some(),
        };
        self.sessions.insert(id.clone(), session);
        self.emit(&id, EventType::SessionStarted, json!(payload), EventSeverity::Info)
            .await;
        Ok(id)
    }

    /// Run one block and record it.
    ///
    /// In-sandbox errors, timeouts, cancellations and execution faults are
    /// recorded on the returned block. A fault or an unclean cancellation
    /// releases the backend and leaves the session `failed`.
    #[instrument(skip(self, code), fields(session_id = %session_id))]
    pub async fn execute(&self, session_id: &SessionId, code: &str) -> Result<CodeBlock> {
        let session = self.get(session_id)?;
        let mut lane = session.lane.lock().await;

        let backend = match lane.as_mut() {
            Some(backend) => backend,
            None => return Err(Error::invalid_state(session.state(), "execute")),
        };
        session
            .begin_execution()
            .map_err(|state| Error::invalid_state(state, "execute"))?;

        let ordinal = session.records().history.len() as u64 + 1;
        let outcome = self.run(&session, backend, code, ordinal).await;
        let block = outcome.block;
        session.records().history.push(block.clone());

        let payload = BlockExecutedPayload {
            ordinal,
            duration_ms: block.duration_ms,
            queries: block.queries.len(),
            error_kind: block.error.as_ref().map(|e| e.kind),
        };
        self.emit(session_id, EventType::BlockExecuted, json!(payload), EventSeverity::Info)
            .await;

        if outcome.healthy {
            session.transition(SessionState::Ready)?;
        } else {
            let reason = block
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            warn!(session_id = %session_id, ordinal, %reason, "Session failed");
            release(&session, &mut lane).await;
            session.transition(SessionState::Failed)?;
            self.emit(
                session_id,
                EventType::SessionFailed,
                json!({ "ordinal": ordinal, "reason": reason }),
                EventSeverity::Error,
            )
            .await;
        }

        Ok(block)
    }

    /// Cancel the executing block, if any. Returns whether a block was
    /// cancelled by this call.
    pub fn cancel(&self, session_id: &SessionId) -> Result<bool> {
        let session = self.get(session_id)?;
        let Some(control) = session.control() else {
            return Ok(false);
        };
        let fired = control.cancel(CancelReason::Requested);
        if fired {
            info!(session_id = %session_id, "Cancelling block");
            session.bridge.invalidate();
        }
        Ok(fired)
    }

    /// Release backend resources, close the bridge channel and discard the
    /// namespace. Calling it again on a closed session does nothing.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn teardown(&self, session_id: &SessionId) -> Result<()> {
        let session = self.get(session_id)?;
        match session.state() {
            SessionState::Closed => return Ok(()),
            state if !state.can_teardown() => return Err(Error::invalid_state(state, "teardown")),
            _ => {}
        }
        let mut lane = session.lane.lock().await;
        self.close(&session, &mut lane, None).await
    }

    /// Tear down every session, cancelling running blocks first.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        for session in sessions {
            if let Some(control) = session.control() {
                control.cancel(CancelReason::Requested);
                session.bridge.invalidate();
            }
            let mut lane = session.lane.lock().await;
            if let Err(e) = self.close(&session, &mut lane, Some("manager shutdown")).await {
                warn!(session_id = %session.id, error = %e, "Teardown during shutdown failed");
            }
        }
        self.sessions.clear();
        info!("Session manager shut down");
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn state(&self, session_id: &SessionId) -> Result<SessionState> {
        Ok(self.get(session_id)?.state())
    }

    /// Blocks executed so far, in order.
    pub fn history(&self, session_id: &SessionId) -> Result<Vec<CodeBlock>> {
        Ok(self.get(session_id)?.records().history.clone())
    }

    /// Current bindings.
    pub fn namespace(&self, session_id: &SessionId) -> Result<Namespace> {
        Ok(self.get(session_id)?.records().namespace.clone())
    }

    /// Bind a context payload as `context_N` (and `context` for index 0).
    /// Returns the index used.
    pub async fn add_context(
        &self,
        session_id: &SessionId,
        payload: &serde_json::Value,
        index: Option<usize>,
    ) -> Result<usize> {
        let session = self.get(session_id)?;
        let _lane = session.lane.lock().await;
        match session.state() {
            SessionState::Ready => Ok(session.records().namespace.add_context(payload, index)),
            state => Err(Error::invalid_state(state, "add_context")),
        }
    }

    /// Bind a message history as `history_N` (and `history` for index 0).
    /// Returns the index used.
    pub async fn add_history(
        &self,
        session_id: &SessionId,
        messages: &[serde_json::Value],
        index: Option<usize>,
    ) -> Result<usize> {
        let session = self.get(session_id)?;
        let _lane = session.lane.lock().await;
        match session.state() {
            SessionState::Ready => Ok(session.records().namespace.add_history(messages, index)),
            state => Err(Error::invalid_state(state, "add_history")),
        }
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn get(&self, session_id: &SessionId) -> Result<Arc<Session>> {
        self.sessions
            .get(session_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Drive one block through the backend under the execute timeout.
    async fn run(
        &self,
        session: &Session,
        backend: &mut Box<dyn SandboxBackend>,
        code: &str,
        ordinal: u64,
    ) -> RunOutcome {
        let execute_timeout = session.config.execute_timeout();
        let grace = session.config.cancel_grace();
        let request = BlockRequest {
            session_id: session.id.clone(),
            ordinal,
            code: code.to_string(),
            execute_timeout,
            query_timeout: session.config.query_timeout(),
        };

        let ctl = Arc::new(ExecControl::new());
        session.set_control(Some(Arc::clone(&ctl)));
        let mut namespace = session.records().namespace.clone();
        let started_at = Utc::now();
        let started = Instant::now();
        session.bridge.begin_block(ordinal);

        let result = {
            let mut run = backend.run_block(&mut namespace, &request, &ctl);
            let finished = tokio::select! {
                result = &mut run => Some(result),
                _ = tokio::time::sleep(execute_timeout) => {
                    ctl.cancel(CancelReason::TimedOut);
                    None
                }
                _ = ctl.cancelled() => None,
            };
            match finished {
                Some(result) => result,
                None => {
                    // Late responses for this block must never be delivered.
                    session.bridge.invalidate();
                    match tokio::time::timeout(grace, &mut run).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::execution_fault(format!(
                            "backend did not stop within {}ms of cancellation",
                            grace.as_millis()
                        ))),
                    }
                }
            }
        };

        let queries = session.bridge.end_block();
        session.set_control(None);
        let duration_ms = started.elapsed().as_millis() as u64;

        let (stdout, stderr, return_value, error, healthy) = match result {
            Ok(output) => match output.termination {
                Termination::Completed => (
                    output.stdout,
                    output.stderr,
                    output.return_value,
                    output.error.map(BlockError::in_sandbox),
                    true,
                ),
                Termination::Cancelled { reason, clean } => {
                    let error = match reason {
                        CancelReason::TimedOut => BlockError::new(
                            BlockErrorKind::Timeout,
                            format!("execution timed out after {}ms", execute_timeout.as_millis()),
                        ),
                        CancelReason::Requested => BlockError::new(BlockErrorKind::Cancelled, "execution cancelled"),
                    };
                    (output.stdout, output.stderr, None, Some(error), clean)
                }
            },
            Err(e) => (String::new(), String::new(), None, Some(BlockError::fault(e.to_string())), false),
        };

        session.records().namespace = namespace;

        RunOutcome {
            block: CodeBlock {
                ordinal,
                source: code.to_string(),
                stdout,
                stderr,
                return_value,
                error,
                queries,
                started_at,
                duration_ms,
            },
            healthy,
        }
    }

    async fn close(&self, session: &Session, lane: &mut Lane, reason: Option<&str>) -> Result<()> {
        let previous = session.state();
        if previous == SessionState::Closed {
            return Ok(());
        }
        release(session, lane).await;
        let blocks_executed = {
            let mut records = session.records();
            records.namespace.clear();
            records.history.len()
        };
        session.transition(SessionState::Closed)?;
        info!(session_id = %session.id, blocks_executed, "Session closed");

        let payload = SessionEndedPayload {
            blocks_executed,
            final_state: previous.to_string(),
            reason: reason.map(str::to_string),
        };
        self.emit(&session.id, EventType::SessionEnded, json!(payload), EventSeverity::Info)
            .await;
        Ok(())
    }

    async fn emit(&self, session_id: &SessionId, event_type: EventType, payload: serde_json::Value, severity: EventSeverity) {
        let event = EventEnvelope::new(event_type, payload)
            .with_session(session_id)
            .with_actor("session_manager")
            .with_severity(severity);
        self.emitter.emit(event).await;
    }
}

/// Shut the backend down and close the bridge channel.
async fn release(session: &Session, lane: &mut Lane) {
    if let Some(mut backend) = lane.take() {
        if let Err(e) = backend.shutdown().await {
            warn!(session_id = %session.id, error = %e, "Backend shutdown failed");
        }
    }
    session.bridge.close();
}

fn as_init_error(e: Error) -> Error {
    if e.is_fatal_at_creation() {
        e
    } else {
        Error::backend_init(e.to_string())
    }
}
