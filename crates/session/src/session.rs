//! One session: its backend, namespace, history and bridge channel.

use std::sync::{Arc, Mutex, MutexGuard};

use codebox_bridge::BridgeChannel;
use codebox_core::{BackendVariant, CodeBlock, EnvironmentConfig, Error, Namespace, Result, SessionId, SessionState};
use codebox_sandbox::{ExecControl, SandboxBackend};

/// Namespace and history, readable without waiting for a running block.
#[derive(Default)]
pub(crate) struct Records {
    pub namespace: Namespace,
    pub history: Vec<CodeBlock>,
}

pub(crate) struct Session {
    pub id: SessionId,
    pub variant: BackendVariant,
    pub config: EnvironmentConfig,
    pub bridge: Arc<BridgeChannel>,
    /// Execution lane. Holding it serializes blocks; `None` once the backend
    /// has been released.
    pub lane: tokio::sync::Mutex<Option<Box<dyn SandboxBackend>>>,
    state: Mutex<SessionState>,
    control: Mutex<Option<Arc<ExecControl>>>,
    records: Mutex<Records>,
}

impl Session {
    pub fn new(
        id: SessionId,
        config: EnvironmentConfig,
        bridge: Arc<BridgeChannel>,
        backend: Box<dyn SandboxBackend>,
        namespace: Namespace,
    ) -> Self {
        Self {
            id,
            variant: backend.variant(),
            config,
            bridge,
            lane: tokio::sync::Mutex::new(Some(backend)),
            state: Mutex::new(SessionState::Initializing),
            control: Mutex::new(None),
            records: Mutex::new(Records {
                namespace,
                history: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Move to `next`, refusing illegal transitions.
    pub fn transition(&self, next: SessionState) -> Result<()> {
        let mut state = lock(&self.state);
        if *state == next {
            return Ok(());
        }
        if !state.can_transition_to(next) {
            return Err(Error::internal(format!(
                "illegal session transition {} -> {}",
                *state, next
            )));
        }
        tracing::debug!(session_id = %self.id, from = %*state, to = %next, "Session transition");
        *state = next;
        Ok(())
    }

    /// Enter `executing` from `ready`, returning the state found otherwise.
    pub fn begin_execution(&self) -> std::result::Result<(), SessionState> {
        let mut state = lock(&self.state);
        if *state != SessionState::Ready {
            return Err(*state);
        }
        *state = SessionState::Executing;
        Ok(())
    }

    pub fn set_control(&self, control: Option<Arc<ExecControl>>) {
        *lock(&self.control) = control;
    }

    pub fn control(&self) -> Option<Arc<ExecControl>> {
        lock(&self.control).clone()
    }

    pub fn records(&self) -> MutexGuard<'_, Records> {
        lock(&self.records)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
