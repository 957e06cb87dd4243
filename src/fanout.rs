//! Fan-out of session output and lifecycle events to connected observers.

use serde::Serialize;
use tokio::sync::broadcast;

/// One event on the push channel. Data events mirror every chunk the backend
/// emits; lifecycle events track registry mutations. There is no replay for
/// events prior to subscription — new observers are seeded with a synthetic
/// full-buffer data event per live session instead (see the ws handler).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Created {
        name: String,
        cols: u16,
        rows: u16,
    },
    Data {
        name: String,
        data: String,
    },
    Resized {
        name: String,
        cols: u16,
        rows: u16,
    },
    Closed {
        name: String,
    },
    Exited {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
}

/// Broadcast-based fan-out.
///
/// Uses `tokio::broadcast` so every observer gets an independent copy of
/// each event; a slow observer lags (misses events) rather than blocking
/// the session that produced the output.
#[derive(Debug, Clone)]
pub struct FanOut {
    sender: broadcast::Sender<SessionEvent>,
}

impl FanOut {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Publishes to all current observers; dropped silently when none.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new(1024)
    }
}
