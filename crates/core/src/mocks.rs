//! Mock implementations of core traits for testing.
//!
//! Used by unit and integration tests across the workspace.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::{
    events::{EventEnvelope, EventType},
    traits::{EventEmitter, ModelBackend},
    Error, Result,
};

// =============================================================================
// Mock Model Backend
// =============================================================================

/// Scripted model backend.
///
/// Prompts with a registered reply get it; prompts registered as failing
/// return a backend error; everything else is echoed as `echo: <prompt>`.
#[derive(Default)]
pub struct MockModel {
    replies: HashMap<String, String>,
    failing: HashSet<String>,
    delays: HashMap<String, Duration>,
    default_delay: Option<Duration>,
    batch_support: bool,
    calls: AtomicUsize,
    batch_calls: AtomicUsize,
    prompts_seen: Mutex<Vec<String>>,
}

impl MockModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply `response` whenever `prompt` is asked.
    pub fn with_reply(mut self, prompt: &str, response: &str) -> Self {
        self.replies.insert(prompt.to_string(), response.to_string());
        self
    }

    /// Fail whenever `prompt` is asked.
    pub fn failing_on(mut self, prompt: &str) -> Self {
        self.failing.insert(prompt.to_string());
        self
    }

    /// Delay the answer to one prompt.
    pub fn with_delay_for(mut self, prompt: &str, delay: Duration) -> Self {
        self.delays.insert(prompt.to_string(), delay);
        self
    }

    /// Delay every answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = Some(delay);
        self
    }

    /// Advertise native batch support.
    pub fn with_batch_support(mut self) -> Self {
        self.batch_support = true;
        self
    }

    /// Number of single completions served.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of native batch calls served.
    pub fn batch_call_count(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// Every prompt received, in arrival order.
    pub fn prompts_seen(&self) -> Vec<String> {
        self.prompts_seen.lock().unwrap().clone()
    }

    fn answer(&self, prompt: &str) -> Result<String> {
        self.prompts_seen.lock().unwrap().push(prompt.to_string());
        if self.failing.contains(prompt) {
            return Err(Error::model_backend(format!("mock failure for '{}'", prompt)));
        }
        Ok(self
            .replies
            .get(prompt)
            .cloned()
            .unwrap_or_else(|| format!("echo: {}", prompt)))
    }

    fn delay_for(&self, prompt: &str) -> Option<Duration> {
        self.delays.get(prompt).copied().or(self.default_delay)
    }
}

#[async_trait]
impl ModelBackend for MockModel {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay_for(prompt) {
            tokio::time::sleep(delay).await;
        }
        self.answer(prompt)
    }

    async fn complete_batch(&self, prompts: &[String]) -> Result<Vec<String>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let delay = prompts.iter().filter_map(|p| self.delay_for(p)).max();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        prompts.iter().map(|p| self.answer(p)).collect()
    }

    fn supports_batch(&self) -> bool {
        self.batch_support
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// =============================================================================
// Recording Event Emitter
// =============================================================================

/// Emitter that keeps every event for later assertions.
#[derive(Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<EventEnvelope>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().unwrap().clone()
    }

    pub fn types(&self) -> Vec<EventType> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }
}

#[async_trait]
impl EventEmitter for RecordingEmitter {
    async fn emit(&self, event: EventEnvelope) {
        self.events.lock().unwrap().push(event);
    }
}
