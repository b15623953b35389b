use serde::{Deserialize, Serialize};

// =============================================================================
// Session Identity & Lifecycle
// =============================================================================

/// Unique identifier for a session.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(format!("cbx-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a session.
///
/// ```text
/// initializing -> ready -> executing -> ready -> ... -> closed
///        \           \         \
///         +-----------+---------+--> failed (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Ready,
    Executing,
    Closed,
    Failed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (Failed, Closed) => true,
            (Failed, _) => false,
            (_, Failed) => true,
            (Initializing, Ready) => true,
            (Ready, Executing) => true,
            (Executing, Ready) => true,
            (Ready, Closed) => true,
            _ => false,
        }
    }

    /// Only `ready` and `failed` sessions may be torn down.
    pub fn can_teardown(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Failed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Executing => "executing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Isolation variant a session executes under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendVariant {
    /// Embedded interpreter in the host process. Trusted code only.
    #[default]
    InProcess,
    /// Docker container per session.
    Container,
    /// Managed remote sandbox service.
    Remote,
}

impl BackendVariant {
    /// Whether the sandbox lives outside host memory and needs a network bridge.
    pub fn is_isolated(self) -> bool {
        !matches!(self, BackendVariant::InProcess)
    }
}

impl std::fmt::Display for BackendVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendVariant::InProcess => "in_process",
            BackendVariant::Container => "container",
            BackendVariant::Remote => "remote",
        };
        f.write_str(s)
    }
}
