//! Queue events.
//!
//! Events travel on two buses:
//!
//! - **Global**: staged inside store transactions and published on commit
//!   (a Redis stream, or a broadcast channel for the in-memory store), so every
//!   process sharing the queue sees them.
//! - **Local**: an [`EventBus`] owned by a single worker process. Background
//!   loops (lock renewal, stalled sweeps, continuations) report errors here
//!   because they have no synchronous caller.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of a local event bus before slow subscribers start lagging.
const EVENT_BUS_CAPACITY: usize = 1024;

/// Something that happened to a job or to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum QueueEvent {
    /// Job is ready to be picked up.
    Waiting { job_id: String },
    /// Job is scheduled for later.
    Delayed { job_id: String, delay: i64 },
    /// Job was handed to a worker.
    Active { job_id: String },
    /// Job finished successfully.
    Completed {
        job_id: String,
        return_value: serde_json::Value,
    },
    /// Job attempt failed.
    Failed { job_id: String, failed_reason: String },
    /// Job lost its lock while active and was moved back to waiting.
    Stalled { job_id: String },
    /// An add or upsert targeted an id that already existed.
    Duplicated { job_id: String },
    /// Job was removed.
    Removed { job_id: String },
    /// Worker-level error from a background loop.
    Error { message: String },
}

impl QueueEvent {
    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::Waiting { .. } => "waiting",
            QueueEvent::Delayed { .. } => "delayed",
            QueueEvent::Active { .. } => "active",
            QueueEvent::Completed { .. } => "completed",
            QueueEvent::Failed { .. } => "failed",
            QueueEvent::Stalled { .. } => "stalled",
            QueueEvent::Duplicated { .. } => "duplicated",
            QueueEvent::Removed { .. } => "removed",
            QueueEvent::Error { .. } => "error",
        }
    }

    /// Job the event refers to, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            QueueEvent::Waiting { job_id }
            | QueueEvent::Delayed { job_id, .. }
            | QueueEvent::Active { job_id }
            | QueueEvent::Completed { job_id, .. }
            | QueueEvent::Failed { job_id, .. }
            | QueueEvent::Stalled { job_id }
            | QueueEvent::Duplicated { job_id }
            | QueueEvent::Removed { job_id } => Some(job_id),
            QueueEvent::Error { .. } => None,
        }
    }

    /// Shorthand for a worker-level error event.
    pub fn error(message: impl Into<String>) -> Self {
        QueueEvent::Error {
            message: message.into(),
        }
    }
}

/// Local (per-process) publish interface.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn emit(&self, event: QueueEvent) {
        if let QueueEvent::Error { ref message } = event {
            tracing::error!(error = %message, "worker error");
        }
        let _ = self.tx.send(event);
    }

    /// Subscribes to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = QueueEvent::Delayed {
            job_id: "repeat:s1:1000".to_string(),
            delay: 500,
        };
        let json = serde_json::to_value(&event).expect("event should serialize");
        assert_eq!(json["event"], "delayed");
        assert_eq!(json["job_id"], "repeat:s1:1000");
        assert_eq!(event.name(), "delayed");
    }

    #[test]
    fn test_error_event_has_no_job() {
        let event = QueueEvent::error("boom");
        assert_eq!(event.job_id(), None);
        assert_eq!(event.name(), "error");
    }

    #[tokio::test]
    async fn test_event_bus_delivers_to_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(QueueEvent::Stalled {
            job_id: "j1".to_string(),
        });

        let received = rx.recv().await.expect("event should arrive");
        assert_eq!(received.job_id(), Some("j1"));
    }

    #[test]
    fn test_event_bus_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(QueueEvent::error("nobody listening"));
    }
}
