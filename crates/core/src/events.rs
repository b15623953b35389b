use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{BackendVariant, BlockErrorKind, SessionId};

/// Structured Event Envelope
///
/// The payload schema is owned by whoever consumes the events; the core only
/// guarantees the envelope fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: String,
    /// Session ID (if applicable)
    pub session_id: Option<String>,
    /// Component that emitted the event
    pub actor: String,
    /// Timestamp of the event
    pub timestamp: DateTime<Utc>,
    /// Event type category
    pub event_type: EventType,
    /// Event severity level
    pub severity: EventSeverity,
    /// Structured payload (event-specific data)
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: None,
            actor: "system".to_string(),
            timestamp: Utc::now(),
            event_type,
            severity: EventSeverity::Info,
            payload,
        }
    }

    pub fn with_session(mut self, session_id: &SessionId) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }

    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Session created and ready
    SessionStarted,
    /// A code block finished (successfully or not)
    BlockExecuted,
    /// Session moved to the failed state
    SessionFailed,
    /// Session torn down
    SessionEnded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// Helper structs for common payloads

#[derive(Serialize, Deserialize)]
pub struct SessionStartedPayload {
    pub backend: BackendVariant,
    pub seeded_bindings: usize,
    pub ran_setup_code: bool,
}

#[derive(Serialize, Deserialize)]
pub struct BlockExecutedPayload {
    pub ordinal: u64,
    pub duration_ms: u64,
    pub queries: usize,
    pub error_kind: Option<BlockErrorKind>,
}

#[derive(Serialize, Deserialize)]
pub struct SessionEndedPayload {
    pub blocks_executed: usize,
    pub final_state: String,
    pub reason: Option<String>,
}
