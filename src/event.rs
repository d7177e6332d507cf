//! Structured events emitted on every queue and updater state transition.
//!
//! Consumers subscribe to build status indicators ("saving…", "saved"),
//! audit trails, or test assertions. The queue and every updater built on
//! it share one bus, so sequence numbers are totally ordered across both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

use crate::model::{UnitId, UnitOutcome};

/// Events buffered per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 1024;

/// A structured event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    UnitQueued {
        id: UnitId,
        pending: usize,
    },
    UnitStarted {
        id: UnitId,
        active: usize,
        waited_ms: u64,
    },
    UnitFinished {
        id: UnitId,
        outcome: UnitOutcome,
        duration_ms: u64,
    },
    QueueCleared {
        discarded: usize,
    },
    UpdateScheduled {
        key: String,
    },
    UpdateCoalesced {
        key: String,
    },
    UpdateDeferred {
        key: String,
    },
    UpdateCancelled {
        key: String,
    },
    UpdateDispatched {
        key: String,
        unit: UnitId,
    },
    UpdateSettled {
        key: String,
        success: bool,
    },
    Flushed {
        rounds: usize,
    },
}

/// Cloneable publisher half. Publishing with no subscribers is a no-op.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    // Held across the send so subscribers observe seq in order.
    seq: Arc<Mutex<u64>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tx,
            seq: Arc::new(Mutex::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, kind: EventKind) {
        let mut seq = self.seq.lock().unwrap_or_else(PoisonError::into_inner);
        *seq += 1;
        let _ = self.tx.send(Event {
            seq: *seq,
            timestamp: Utc::now(),
            kind,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
