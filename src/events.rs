//! Job lifecycle events.
//!
//! Every submission, attempt, completion and sweep is published on the
//! [`EventBus`]. `GET /api/events` serves the retained history.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use uuid::Uuid;

use webmforge_common::{ArtifactId, CallerId, ErrorKind, JobId};

const MAX_RECENT_EVENTS: usize = 100;

/// What happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    ConversionSubmitted {
        job_id: JobId,
        caller: CallerId,
        size: u64,
    },
    AttemptStarted {
        job_id: JobId,
        strategy: String,
        index: usize,
        count: usize,
    },
    AttemptFailed {
        job_id: JobId,
        strategy: String,
        reason: String,
    },
    ConversionProgress {
        job_id: JobId,
        progress: f64,
        phase: String,
    },
    ConversionSucceeded {
        job_id: JobId,
        strategy: String,
        artifact_id: ArtifactId,
    },
    ConversionFailed {
        job_id: JobId,
        reason: ErrorKind,
    },
    ArtifactsSwept {
        expired: usize,
        orphaned: usize,
        jobs_pruned: usize,
    },
}

/// One published pipeline event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn now(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Fan-out of pipeline events to live subscribers, plus a bounded history
/// for clients that poll.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    history: RwLock<VecDeque<Event>>,
    history_len: usize,
}

impl EventBus {
    /// `capacity` bounds how far a live subscriber may lag before it starts
    /// missing events. History keeps the last [`MAX_RECENT_EVENTS`].
    pub fn new(capacity: usize) -> Self {
        Self::with_history(capacity, MAX_RECENT_EVENTS)
    }

    pub fn with_history(capacity: usize, history_len: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            history: RwLock::new(VecDeque::with_capacity(history_len)),
            history_len,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, payload: EventPayload) {
        let event = Event::now(payload);
        tracing::trace!(event = ?event.payload, "Publishing event");

        let mut history = self.history.write();
        if history.len() == self.history_len {
            history.pop_front();
        }
        if self.history_len > 0 {
            history.push_back(event.clone());
        }
        drop(history);

        // Nobody listening is normal.
        let _ = self.tx.send(event);
    }

    /// Up to `limit` retained events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        self.history.read().iter().rev().take(limit).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
