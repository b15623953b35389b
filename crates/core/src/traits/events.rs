use async_trait::async_trait;
use crate::events::EventEnvelope;

/// Trait for emitting structured events.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    /// Emit an event.
    async fn emit(&self, event: EventEnvelope);
}

/// Emitter that writes every event to the tracing subscriber.
pub struct TracingEventEmitter;

#[async_trait]
impl EventEmitter for TracingEventEmitter {
    async fn emit(&self, event: EventEnvelope) {
        tracing::info!(
            event_id = %event.id,
            event_type = ?event.event_type,
            session_id = event.session_id.as_deref().unwrap_or("-"),
            actor = %event.actor,
            payload = %event.payload,
            "lifecycle event"
        );
    }
}
