//! Lifecycle sweeper — settles orders whose window has closed.
//!
//! Runs independently of the event stream, either on demand or on a timer
//! via [`LifecycleSweeper::spawn`]. Every expired, not-yet-completed order is
//! completed in its own unit of work: status, fee release, node release and
//! the used-resource counters commit together. One bad order is reported and
//! skipped; the rest of the batch still settles.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::entity::normalize_address;
use crate::error::ProjectionError;
use crate::locks::ProviderLocks;
use crate::metrics::MetricsRecorder;
use crate::store::{Completion, EntityStore};

/// Which orders a sweep considers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SweepScope {
    #[default]
    All,
    Provider(String),
}

impl SweepScope {
    pub fn provider(address: impl AsRef<str>) -> Self {
        Self::Provider(normalize_address(address.as_ref()))
    }

    fn as_filter(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Provider(p) => Some(p.as_str()),
        }
    }
}

/// An order the sweep could not settle.
#[derive(Debug, Serialize)]
pub struct SweepFailure {
    pub order_id: u64,
    pub kind: &'static str,
    pub message: String,
}

/// Summary of one sweep pass.
#[derive(Debug, Default, Serialize)]
pub struct SweepReport {
    /// The instant orders were compared against.
    pub now: i64,
    /// Expired, unsettled orders found.
    pub examined: usize,
    pub completed: usize,
    /// Nodes flipped back to unsold.
    pub released_nodes: usize,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone)]
pub struct LifecycleSweeper {
    store: Arc<dyn EntityStore>,
    locks: ProviderLocks,
    metrics: MetricsRecorder,
}

impl LifecycleSweeper {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self::with_locks(store, ProviderLocks::new())
    }

    /// Share provider locks with the engine writing to the same store.
    pub fn with_locks(store: Arc<dyn EntityStore>, locks: ProviderLocks) -> Self {
        Self {
            store,
            locks,
            metrics: MetricsRecorder::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRecorder) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sweep against the wall clock.
    pub async fn sweep(&self, scope: &SweepScope) -> Result<SweepReport, ProjectionError> {
        self.sweep_at(scope, chrono::Utc::now().timestamp()).await
    }

    /// Complete every order in `scope` with `end_time < now`.
    ///
    /// Only a failure to list candidate orders is returned as an error.
    /// Per-order failures are collected in the report.
    pub async fn sweep_at(
        &self,
        scope: &SweepScope,
        now: i64,
    ) -> Result<SweepReport, ProjectionError> {
        let ids = self.store.expired_order_ids(scope.as_filter(), now).await?;
        let mut report = SweepReport {
            now,
            examined: ids.len(),
            ..Default::default()
        };

        for order_id in ids {
            match self.settle(order_id, now).await {
                Ok(Completion::Completed { node_released }) => {
                    report.completed += 1;
                    if node_released {
                        report.released_nodes += 1;
                    }
                    debug!(order_id, node_released, "order settled");
                }
                Ok(Completion::AlreadyCompleted) => {}
                Err(e) => {
                    if e.is_row_local() {
                        warn!(order_id, error = %e, "skipping order in sweep");
                    } else {
                        error!(order_id, error = %e, "sweep failed to settle order");
                    }
                    report.failures.push(SweepFailure {
                        order_id,
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        }

        self.metrics.sweep_finished(
            report.completed as u64,
            report.released_nodes as u64,
            report.failures.len() as u64,
        );
        if report.examined > 0 {
            info!(
                now,
                completed = report.completed,
                released_nodes = report.released_nodes,
                failures = report.failures.len(),
                "sweep finished"
            );
        }
        Ok(report)
    }

    async fn settle(&self, order_id: u64, now: i64) -> Result<Completion, ProjectionError> {
        let order = self
            .store
            .order(order_id)
            .await?
            .ok_or_else(|| ProjectionError::NotFound {
                entity: "order",
                key: order_id.to_string(),
            })?;
        let _guard = self.locks.lock(&order.provider).await;
        self.store.complete_order(order_id, now).await
    }

    /// Run [`Self::sweep`] every `period` until the handle is shut down.
    pub fn spawn(self, scope: SweepScope, period: Duration) -> SweeperHandle {
        let (shutdown, mut rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(period_secs = period.as_secs(), ?scope, "sweeper started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep(&scope).await {
                            error!(error = %e, "sweep pass failed");
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("sweeper stopped");
        });
        SweeperHandle { shutdown, join }
    }
}

/// Handle to a background sweeper task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the task to stop and wait for the current pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "sweeper task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ProjectionEngine;
    use crate::entity::{NodeKey, OrderStatus};
    use crate::event::{EventContext, GridEvent};
    use crate::memory::InMemoryStore;
    use crate::testing::{add_node_event, create_order_event, register_event};
    use alloy_primitives::U256;

    async fn setup() -> (ProjectionEngine, LifecycleSweeper) {
        let store: Arc<dyn EntityStore> = Arc::new(InMemoryStore::new());
        let locks = ProviderLocks::new();
        let engine = ProjectionEngine::with_locks(store.clone(), locks.clone());
        let sweeper = LifecycleSweeper::with_locks(store, locks);
        let ctx = EventContext {
            block_timestamp: 10,
            ..EventContext::at_block(1, 0)
        };
        for p in ["0xaaaa", "0xbbbb"] {
            engine
                .apply(&GridEvent::Register(register_event(p)), &ctx)
                .await
                .unwrap();
            engine
                .apply(&GridEvent::AddNode(add_node_event(p, 1, 10, 20)), &ctx)
                .await
                .unwrap();
        }
        (engine, sweeper)
    }

    async fn order(engine: &ProjectionEngine, provider: &str, id: u64, node: u64, dur: u64) {
        let ctx = EventContext {
            block_timestamp: 10,
            ..EventContext::at_block(2, 0)
        };
        engine
            .apply(
                &GridEvent::CreateOrder(create_order_event(provider, id, node, 0, 0, dur)),
                &ctx,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expired_order_is_settled_once() {
        let (engine, sweeper) = setup().await;
        let before = engine.store().global_counters().await.unwrap();
        order(&engine, "0xaaaa", 1, 1, 100).await;

        // Window still open.
        let report = sweeper.sweep_at(&SweepScope::All, 100).await.unwrap();
        assert_eq!(report.examined, 0);

        let report = sweeper.sweep_at(&SweepScope::All, 101).await.unwrap();
        assert_eq!((report.completed, report.released_nodes), (1, 1));
        assert!(report.is_clean());

        let after = engine.store().global_counters().await.unwrap();
        assert_eq!(
            (after.node_used, after.mem_used, after.disk_used),
            (before.node_used, before.mem_used, before.disk_used)
        );
        assert_eq!(after.cp_num, before.cp_num + 1);
        let o = engine.store().order(1).await.unwrap().unwrap();
        assert_eq!(o.status, OrderStatus::Completed);
        assert!(!engine.store().node(&NodeKey::new("0xaaaa", 1)).await.unwrap().unwrap().sold);

        // Fee became withdrawable.
        let ledger = engine.store().profit("0xaaaa").await.unwrap().unwrap();
        assert_eq!(ledger.balance, U256::from(11_300u64));

        let again = sweeper.sweep_at(&SweepScope::All, 500).await.unwrap();
        assert_eq!((again.examined, again.completed), (0, 0));
        assert_eq!(engine.store().global_counters().await.unwrap(), after);
        assert_eq!(
            engine.store().profit("0xaaaa").await.unwrap().unwrap().balance,
            U256::from(11_300u64)
        );
    }

    #[tokio::test]
    async fn provider_scope_only_touches_that_provider() {
        let (engine, sweeper) = setup().await;
        order(&engine, "0xaaaa", 1, 1, 10).await;
        order(&engine, "0xbbbb", 2, 1, 10).await;

        let report = sweeper
            .sweep_at(&SweepScope::provider("0xBBBB"), 1_000)
            .await
            .unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(
            engine.store().order(1).await.unwrap().unwrap().status,
            OrderStatus::Unactive
        );
        assert_eq!(
            engine.store().order(2).await.unwrap().unwrap().status,
            OrderStatus::Completed
        );
    }

    #[tokio::test]
    async fn cancelled_orders_are_settled_too() {
        let (engine, sweeper) = setup().await;
        order(&engine, "0xaaaa", 1, 1, 10).await;
        engine.set_order_status(1, OrderStatus::Cancelled).await.unwrap();
        let report = sweeper.sweep_at(&SweepScope::All, 1_000).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(engine.store().global_counters().await.unwrap().node_used, 0);
    }

    #[tokio::test]
    async fn spawned_sweeper_settles_and_stops() {
        let (engine, sweeper) = setup().await;
        order(&engine, "0xaaaa", 1, 1, 10).await;
        let metrics = MetricsRecorder::new();
        let handle = sweeper
            .with_metrics(metrics.clone())
            .spawn(SweepScope::All, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        assert!(metrics.snapshot().sweeps_run >= 1);
        assert_eq!(metrics.snapshot().orders_completed, 1);
        assert_eq!(
            engine.store().order(1).await.unwrap().unwrap().status,
            OrderStatus::Completed
        );
    }
}
