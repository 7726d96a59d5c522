//! Projection engine — dispatches typed events to their handlers.

use std::sync::Arc;

use alloy_primitives::U256;
use tracing::warn;

use crate::entity::{NodeFlag, OrderStatus};
use crate::error::{ApplyError, ProjectionError};
use crate::event::{EventContext, GridEvent, SetNodeFlagEvent, SetOrderStatusEvent, WithdrawEvent};
use crate::handler::{EventHandler, HandlerRegistry};
use crate::handlers::register_builtin;
use crate::locks::ProviderLocks;
use crate::metrics::MetricsRecorder;
use crate::store::EntityStore;

/// Applies events to an [`EntityStore`], one at a time, all-or-nothing.
#[derive(Clone)]
pub struct ProjectionEngine {
    store: Arc<dyn EntityStore>,
    registry: HandlerRegistry,
    locks: ProviderLocks,
    metrics: MetricsRecorder,
}

impl ProjectionEngine {
    /// An engine with the built-in handlers and its own provider locks.
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self::with_locks(store, ProviderLocks::new())
    }

    /// An engine sharing `locks` with other writers, e.g. the sweeper.
    pub fn with_locks(store: Arc<dyn EntityStore>, locks: ProviderLocks) -> Self {
        let mut registry = HandlerRegistry::new();
        register_builtin(&mut registry, store.clone(), locks.clone());
        Self {
            store,
            registry,
            locks,
            metrics: MetricsRecorder::new(),
        }
    }

    /// Record into a shared metrics handle instead of a private one.
    pub fn with_metrics(mut self, metrics: MetricsRecorder) -> Self {
        self.metrics = metrics;
        self
    }

    /// Add a handler that runs after the built-in one for its event kind.
    pub fn on_event(&mut self, handler: Arc<dyn EventHandler>) {
        self.registry.on_event(handler);
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn locks(&self) -> &ProviderLocks {
        &self.locks
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    /// Apply one event. On failure nothing is changed and the error names
    /// the event kind, its key fields and its position.
    pub async fn apply(&self, event: &GridEvent, ctx: &EventContext) -> Result<(), ApplyError> {
        let kind = event.kind();
        match self.registry.dispatch(event, ctx).await {
            Ok(_) => {
                self.metrics.event_applied(kind);
                Ok(())
            }
            Err(source) => {
                self.metrics.event_failed(source.kind());
                let err = ApplyError {
                    event: kind.as_str(),
                    key: event.key(),
                    block_number: ctx.block_number,
                    log_index: ctx.log_index,
                    source,
                };
                warn!(error = %err, "event not applied");
                Err(err)
            }
        }
    }

    // ── Direct setters for off-chain collaborators ──────────────────────────

    /// Move an order to `status`. Completing releases its fee and node.
    pub async fn set_order_status(
        &self,
        order_id: u64,
        status: OrderStatus,
    ) -> Result<(), ApplyError> {
        let event = GridEvent::SetOrderStatus(SetOrderStatusEvent {
            order_id,
            status: status.as_u8(),
        });
        self.apply(&event, &EventContext::default()).await
    }

    /// Set one node flag, e.g. `online` from the monitoring collaborator.
    pub async fn set_node_flag(
        &self,
        provider: &str,
        node_id: u64,
        flag: NodeFlag,
        value: bool,
    ) -> Result<(), ApplyError> {
        let event = GridEvent::SetNodeFlag(SetNodeFlagEvent {
            provider: provider.to_string(),
            node_id,
            flag,
            value,
        });
        self.apply(&event, &EventContext::default()).await
    }

    pub async fn withdraw(&self, provider: &str, amount: U256) -> Result<(), ApplyError> {
        let event = GridEvent::Withdraw(WithdrawEvent {
            provider: provider.to_string(),
            amount,
        });
        self.apply(&event, &EventContext::default()).await
    }

    /// Shorthand used by callers that only need the error kind.
    pub async fn try_apply(
        &self,
        event: &GridEvent,
        ctx: &EventContext,
    ) -> Result<(), ProjectionError> {
        self.apply(event, ctx).await.map_err(|e| e.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{NodeKey, ProfitEntry};
    use crate::memory::InMemoryStore;
    use crate::testing::{add_node_event, create_order_event, register_event};

    fn engine() -> ProjectionEngine {
        ProjectionEngine::new(Arc::new(InMemoryStore::new()))
    }

    fn ctx(block: u64, ts: i64) -> EventContext {
        EventContext {
            block_timestamp: ts,
            ..EventContext::at_block(block, 0)
        }
    }

    async fn seed(engine: &ProjectionEngine) {
        engine
            .apply(&GridEvent::Register(register_event("0xAAAA")), &ctx(1, 100))
            .await
            .unwrap();
        engine
            .apply(&GridEvent::AddNode(add_node_event("0xaaaa", 1, 10, 20)), &ctx(2, 100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn register_creates_provider_and_zero_ledger() {
        let e = engine();
        seed(&e).await;
        let p = e.store().provider("0xaaaa").await.unwrap().unwrap();
        assert_eq!(p.address, "0xaaaa");
        let ledger = e.store().profit("0xAAAA").await.unwrap().unwrap();
        assert_eq!(ledger, ProfitEntry::zeroed("0xaaaa", 100));
    }

    #[tokio::test]
    async fn duplicate_register_is_rejected_and_row_unchanged() {
        let e = engine();
        seed(&e).await;
        let mut again = register_event("0xaaaa");
        again.name = "renamed".into();
        let err = e
            .apply(&GridEvent::Register(again), &ctx(3, 200))
            .await
            .unwrap_err();
        assert!(matches!(err.source, ProjectionError::DuplicateEntity { .. }));
        assert_eq!(err.block_number, 3);
        assert_eq!(e.store().provider("0xaaaa").await.unwrap().unwrap().name, "provider");
        assert_eq!(e.store().profit("0xaaaa").await.unwrap().unwrap().last_time, 100);
        assert_eq!(e.metrics().snapshot().failures_by_kind["duplicate_entity"], 1);
    }

    #[tokio::test]
    async fn add_node_accumulates_globals() {
        let e = engine();
        seed(&e).await;
        e.apply(&GridEvent::AddNode(add_node_event("0xaaaa", 2, 5, 7)), &ctx(3, 100))
            .await
            .unwrap();
        e.apply(&GridEvent::AddNode(add_node_event("0xbbbb", 1, 1, 1)), &ctx(3, 100))
            .await
            .unwrap();
        let err = e
            .apply(&GridEvent::AddNode(add_node_event("0xaaaa", 2, 5, 7)), &ctx(4, 100))
            .await
            .unwrap_err();
        assert!(matches!(err.source, ProjectionError::DuplicateEntity { .. }));

        let g = e.store().global_counters().await.unwrap();
        assert_eq!(g.node_global, 3);
        assert_eq!(g.mem_global, 16);
        assert_eq!(g.disk_global, 28);
        let node = e.store().node(&NodeKey::new("0xaaaa", 2)).await.unwrap().unwrap();
        assert!(!node.online);
    }

    #[tokio::test]
    async fn create_order_schedules_and_accrues_fee() {
        let e = engine();
        seed(&e).await;
        e.apply(
            &GridEvent::CreateOrder(create_order_event("0xaaaa", 7, 1, 1_000, 60, 100)),
            &ctx(5, 1_000),
        )
        .await
        .unwrap();

        let order = e.store().order(7).await.unwrap().unwrap();
        assert_eq!((order.start_time, order.end_time), (1_060, 1_160));
        assert_eq!(order.fee, U256::from(11_300u64));

        let ledger = e.store().profit("0xaaaa").await.unwrap().unwrap();
        assert_eq!(ledger.profit, U256::from(11_300u64));
        assert_eq!(ledger.balance, U256::ZERO);
        assert_eq!(ledger.end_time, 1_160);

        let g = e.store().global_counters().await.unwrap();
        assert_eq!((g.cp_num, g.node_used, g.mem_used, g.disk_used), (1, 1, 10, 20));
        assert!(e.store().node(&NodeKey::new("0xaaaa", 1)).await.unwrap().unwrap().sold);
    }

    #[tokio::test]
    async fn create_order_on_missing_node_is_not_found() {
        let e = engine();
        seed(&e).await;
        let err = e
            .try_apply(
                &GridEvent::CreateOrder(create_order_event("0xaaaa", 1, 99, 0, 0, 10)),
                &ctx(5, 10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProjectionError::NotFound { entity: "node", .. }));
        assert_eq!(e.store().global_counters().await.unwrap().cp_num, 0);
    }

    #[tokio::test]
    async fn create_order_with_oversized_duration_overflows() {
        let e = engine();
        seed(&e).await;
        let mut ev = create_order_event("0xaaaa", 1, 1, 0, 0, 0);
        ev.duration = U256::from(u128::MAX);
        let err = e
            .try_apply(&GridEvent::CreateOrder(ev), &ctx(5, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, ProjectionError::Overflow { .. }));
        assert!(e.store().order(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_orders_on_one_provider_sum_profit() {
        let e = engine();
        seed(&e).await;
        e.apply(&GridEvent::AddNode(add_node_event("0xaaaa", 2, 10, 20)), &ctx(3, 100))
            .await
            .unwrap();

        let a = GridEvent::CreateOrder(create_order_event("0xaaaa", 1, 1, 0, 0, 100));
        let b = GridEvent::CreateOrder(create_order_event("0xaaaa", 2, 2, 0, 0, 200));
        let (e1, e2) = (e.clone(), e.clone());
        let t1 = tokio::spawn(async move { e1.apply(&a, &ctx(6, 10)).await });
        let t2 = tokio::spawn(async move { e2.apply(&b, &ctx(6, 10)).await });
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();

        let ledger = e.store().profit("0xaaaa").await.unwrap().unwrap();
        assert_eq!(ledger.profit, U256::from(11_300u64 + 22_600u64));
    }

    #[tokio::test]
    async fn withdraw_overdraft_is_rejected() {
        let e = engine();
        seed(&e).await;
        let err = e.withdraw("0xaaaa", U256::from(1u64)).await.unwrap_err();
        assert!(matches!(err.source, ProjectionError::InsufficientBalance { .. }));
        assert_eq!(e.store().profit("0xaaaa").await.unwrap().unwrap().nonce, 0);
        e.withdraw("0xaaaa", U256::ZERO).await.unwrap();
        assert_eq!(e.store().profit("0xaaaa").await.unwrap().unwrap().nonce, 1);
    }

    #[tokio::test]
    async fn status_moves_forward_or_to_cancelled() {
        let e = engine();
        seed(&e).await;
        e.apply(
            &GridEvent::CreateOrder(create_order_event("0xaaaa", 1, 1, 0, 0, 100)),
            &ctx(5, 10),
        )
        .await
        .unwrap();

        e.set_order_status(1, OrderStatus::Active).await.unwrap();
        let err = e.set_order_status(1, OrderStatus::Unactive).await.unwrap_err();
        assert!(matches!(
            err.source,
            ProjectionError::InvalidStatusTransition { from: 2, to: 1, .. }
        ));
        e.set_order_status(1, OrderStatus::Cancelled).await.unwrap();
        assert_eq!(
            e.store().order(1).await.unwrap().unwrap().status,
            OrderStatus::Cancelled
        );

        let err = e.set_order_status(99, OrderStatus::Active).await.unwrap_err();
        assert!(matches!(err.source, ProjectionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn online_flag_is_set_without_touching_counters() {
        let e = engine();
        seed(&e).await;
        e.set_node_flag("0xAAAA", 1, NodeFlag::Online, true).await.unwrap();
        let node = e.store().node(&NodeKey::new("0xaaaa", 1)).await.unwrap().unwrap();
        assert!(node.online);
        assert_eq!(e.store().global_counters().await.unwrap().node_used, 0);

        let err = e
            .set_node_flag("0xaaaa", 42, NodeFlag::Avail, false)
            .await
            .unwrap_err();
        assert!(matches!(err.source, ProjectionError::NotFound { .. }));
    }
}
