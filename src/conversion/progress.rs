//! Progress reporter: the caller-visible view of a running job.
//!
//! Backed by a `watch` channel, so bursts coalesce into the latest value and
//! nothing queues when nobody is listening. Progress events on the bus are
//! throttled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::events::{EventBus, EventPayload};
use webmforge_common::{JobId, JobState};
use webmforge_engine::ProgressSink;

/// Minimum interval between progress events on the bus.
const EVENT_INTERVAL: Duration = Duration::from_secs(2);

/// Point-in-time view of a job's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// 0.0 to 1.0, non-decreasing within one attempt.
    pub ratio: f64,
    pub phase: String,
    pub state: JobState,
    /// Zero-based index of the active (or last) attempt.
    pub strategy_index: Option<usize>,
    pub strategy_count: usize,
    /// Number of attempts begun so far.
    pub transitions: usize,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> u8 {
        (self.ratio * 100.0).round().clamp(0.0, 100.0) as u8
    }
}

pub struct ProgressReporter {
    tx: watch::Sender<ProgressSnapshot>,
    events: Option<(Arc<EventBus>, JobId)>,
    last_event: Mutex<Option<Instant>>,
}

impl ProgressReporter {
    pub fn new(strategy_count: usize) -> Self {
        let (tx, _) = watch::channel(ProgressSnapshot {
            ratio: 0.0,
            phase: "submitted".to_string(),
            state: JobState::Submitted,
            strategy_index: None,
            strategy_count,
            transitions: 0,
        });
        Self {
            tx,
            events: None,
            last_event: Mutex::new(None),
        }
    }

    pub fn with_events(mut self, bus: Arc<EventBus>, job_id: JobId) -> Self {
        self.events = Some((bus, job_id));
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    /// Latest snapshot. Never blocks on the engine.
    pub fn current(&self) -> ProgressSnapshot {
        self.tx.borrow().clone()
    }

    /// Move to a pre-conversion state (`Validating`, `Staged`).
    pub fn set_state(&self, state: JobState) {
        self.tx.send_modify(|s| {
            s.state = state;
            s.phase = state.label().to_string();
        });
    }

    /// Start attempt `index` (zero-based): resets the ratio and labels the
    /// phase `attempting strategy {i} of {n} ({name})`.
    pub fn begin_attempt(&self, index: usize, name: &str) {
        self.tx.send_modify(|s| {
            s.ratio = 0.0;
            s.state = JobState::Converting {
                strategy_index: index,
            };
            s.strategy_index = Some(index);
            s.transitions += 1;
            s.phase = format!(
                "attempting strategy {} of {} ({})",
                index + 1,
                s.strategy_count,
                name
            );
        });
        *self.last_event.lock() = None;
    }

    /// Record a ratio for attempt `index`. Updates from any attempt other
    /// than the active one, and decreases, are ignored.
    pub fn report(&self, index: usize, ratio: f64) {
        if !ratio.is_finite() {
            return;
        }
        let ratio = ratio.clamp(0.0, 1.0);
        let changed = self.tx.send_if_modified(|s| {
            let active = matches!(s.state, JobState::Converting { strategy_index } if strategy_index == index);
            if !active || ratio <= s.ratio {
                return false;
            }
            s.ratio = ratio;
            true
        });
        if changed {
            self.emit_progress(false);
        }
    }

    /// Sink for the engine, bound to attempt `index`.
    pub fn attempt_sink(&self, index: usize) -> AttemptSink<'_> {
        AttemptSink {
            reporter: self,
            index,
        }
    }

    /// Terminal success: ratio 1.0.
    pub fn finish_success(&self, strategy: &str) {
        self.tx.send_modify(|s| {
            s.ratio = 1.0;
            s.state = JobState::Succeeded;
            s.phase = format!("completed with {strategy}");
        });
        self.emit_progress(true);
    }

    /// Terminal failure: the last known ratio is kept.
    pub fn finish_failure(&self, phase: impl Into<String>) {
        let phase = phase.into();
        self.tx.send_modify(|s| {
            s.state = JobState::Failed;
            s.phase = phase;
        });
        self.emit_progress(true);
    }

    fn emit_progress(&self, force: bool) {
        let Some((bus, job_id)) = &self.events else {
            return;
        };
        {
            let mut last = self.last_event.lock();
            let due = last.map_or(true, |at| at.elapsed() >= EVENT_INTERVAL);
            if !force && !due {
                return;
            }
            *last = Some(Instant::now());
        }
        let snapshot = self.current();
        bus.publish(EventPayload::ConversionProgress {
            job_id: *job_id,
            progress: snapshot.ratio,
            phase: snapshot.phase,
        });
    }
}

/// [`ProgressSink`] tagged with the attempt it belongs to.
pub struct AttemptSink<'a> {
    reporter: &'a ProgressReporter,
    index: usize,
}

impl ProgressSink for AttemptSink<'_> {
    fn report(&self, ratio: f64) {
        self.reporter.report(self.index, ratio);
    }
}
