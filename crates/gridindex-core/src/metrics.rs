//! Counters for the projection pipeline.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::event::EventKind;

/// Metrics snapshot for the engine, the sweeper and the ingest driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectionMetrics {
    pub events_applied: u64,
    pub events_failed: u64,
    /// Logs that failed to decode and were dropped.
    pub logs_dropped: u64,
    pub blocks_processed: u64,
    pub sweeps_run: u64,
    pub orders_completed: u64,
    pub nodes_released: u64,
    pub sweep_failures: u64,
    pub applied_by_kind: BTreeMap<String, u64>,
    /// Failures keyed by [`ProjectionError::kind`](crate::ProjectionError::kind).
    pub failures_by_kind: BTreeMap<String, u64>,
}

/// Shared handle that components record into.
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder {
    inner: Arc<Mutex<ProjectionMetrics>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of current metrics.
    pub fn snapshot(&self) -> ProjectionMetrics {
        self.guard().clone()
    }

    pub(crate) fn event_applied(&self, kind: EventKind) {
        let mut m = self.guard();
        m.events_applied += 1;
        *m.applied_by_kind.entry(kind.as_str().to_string()).or_default() += 1;
    }

    pub(crate) fn event_failed(&self, error_kind: &'static str) {
        let mut m = self.guard();
        m.events_failed += 1;
        *m.failures_by_kind.entry(error_kind.to_string()).or_default() += 1;
    }

    pub(crate) fn log_dropped(&self) {
        self.guard().logs_dropped += 1;
    }

    pub(crate) fn block_processed(&self) {
        self.guard().blocks_processed += 1;
    }

    pub(crate) fn sweep_finished(&self, completed: u64, released: u64, failures: u64) {
        let mut m = self.guard();
        m.sweeps_run += 1;
        m.orders_completed += completed;
        m.nodes_released += released;
        m.sweep_failures += failures;
    }

    fn guard(&self) -> MutexGuard<'_, ProjectionMetrics> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
