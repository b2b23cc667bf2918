use crate::config::AnalyticsConfig;
use crate::core::writer::{AggregationWriter, BatchOutcome};
use crate::models::event::BatchEvent;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Coalesces hot-path events so a burst of views becomes one grouped store
/// write per window instead of a round-trip each. Callers `enqueue` without
/// touching the store; a spawned `run_flush_loop` drains on an interval, and
/// `flush` drains on demand.
pub struct EventBatcher {
    writer: Arc<AggregationWriter>,
    pending: Mutex<Vec<BatchEvent>>,
    flush_interval: Duration,
}

impl EventBatcher {
    pub fn new(writer: Arc<AggregationWriter>, config: &AnalyticsConfig) -> Self {
        Self {
            writer,
            pending: Mutex::new(Vec::new()),
            flush_interval: Duration::from_millis(config.batch_flush_interval_ms.max(1)),
        }
    }

    /// Queues one event for the next flush. Never blocks on the store.
    pub fn enqueue(&self, event: BatchEvent) {
        self.pending.lock().push(event);
    }

    pub fn enqueue_all(&self, events: Vec<BatchEvent>) {
        if events.is_empty() {
            return;
        }
        self.pending.lock().extend(events);
    }

    /// Events waiting for the next flush.
    pub fn pending_events(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drains the buffer into one grouped write. An empty buffer skips the
    /// store entirely. The lock is released before the write starts, so
    /// events enqueued while it runs land in the next window.
    pub async fn flush(&self) -> BatchOutcome {
        let drained = std::mem::take(&mut *self.pending.lock());
        if drained.is_empty() {
            return BatchOutcome::default();
        }
        let outcome = self.writer.record_batch(&drained).await;
        if let Some(err) = &outcome.dropped {
            warn!(error = %err, recorded = outcome.recorded, "batch flush lost events");
        } else {
            debug!(
                recorded = outcome.recorded,
                suppressed = outcome.suppressed,
                "batch flushed"
            );
        }
        outcome
    }

    /// Flushes on a fixed cadence until the task is aborted. Spawn on the
    /// runtime; call `flush` once more at shutdown to drain stragglers.
    pub async fn run_flush_loop(self: Arc<Self>) {
        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.flush().await;
        }
    }
}
