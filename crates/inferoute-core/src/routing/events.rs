//! Router event stream
//!
//! Fire-and-forget notifications for analytics and UI collaborators. Events
//! go out over a bounded broadcast channel: publishing never blocks, nobody
//! listening is fine, and a subscriber that falls behind loses the oldest
//! events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use super::types::{SelectionReason, TaskCategory};

/// Default channel capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Envelope around every router event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterEvent {
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Unique event ID
    pub event_id: Uuid,
    /// Event payload
    pub kind: RouterEventKind,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RouterEventKind {
    /// A request was answered from the semantic cache
    CacheHit {
        response_id: String,
        backend_id: String,
        similarity: f32,
        category: TaskCategory,
    },
    /// The selector chose a primary backend
    BackendSelected {
        backend_id: String,
        alternatives: Vec<String>,
        reason: SelectionReason,
        chain: Vec<String>,
    },
    /// Every backend in the chain failed
    ExecutionFailedAll {
        chain: Vec<String>,
        last_error: String,
    },
    /// User feedback was attributed to a backend
    FeedbackApplied {
        response_id: String,
        backend_id: String,
        user_id: Option<String>,
        satisfaction: f64,
    },
}

/// Publisher side of the event stream
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RouterEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus holding at most `capacity` undelivered events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish an event; never blocks
    pub fn publish(&self, kind: RouterEventKind) {
        let event = RouterEvent {
            timestamp: Utc::now(),
            event_id: Uuid::new_v4(),
            kind,
        };
        if self.sender.send(event).is_err() {
            trace!("Router event dropped, no subscribers");
        }
    }
}
