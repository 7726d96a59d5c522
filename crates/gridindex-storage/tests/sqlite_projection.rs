//! Projection, sweep and checkpoint flows against the SQLite backend.

use std::sync::Arc;

use alloy_primitives::U256;

use gridindex_core::entity::{CapacitySpec, CpuSpec, GpuSpec};
use gridindex_core::event::{AddNodeEvent, CreateOrderEvent, RegisterEvent};
use gridindex_core::{
    CheckpointStore, CheckpointTracker, EntityStore, EventContext, GridEvent, LifecycleSweeper,
    NodeKey, OrderStatus, ProjectionEngine, ProjectionError, ProviderLocks, SweepScope,
};
use gridindex_storage::SqliteStore;

const ALPHA: &str = "0xaaaa";
const BETA: &str = "0xbbbb";

fn ctx(block: u64, ts: i64) -> EventContext {
    EventContext {
        chain: "sepolia".into(),
        block_number: block,
        block_timestamp: ts,
        ..Default::default()
    }
}

fn register(provider: &str) -> GridEvent {
    GridEvent::Register(RegisterEvent {
        provider: provider.into(),
        name: "grid".into(),
        ip: "10.0.0.1".into(),
        domain: "grid.example".into(),
        port: "8080".into(),
    })
}

fn add_node(provider: &str, id: u64) -> GridEvent {
    let p = |v: u64| U256::from(v);
    GridEvent::AddNode(AddNodeEvent {
        provider: provider.into(),
        node_id: id,
        cpu: CpuSpec { price_mon: p(0), price_sec: p(1), core: 8, model: "epyc".into() },
        gpu: GpuSpec { price_mon: p(0), price_sec: p(2), model: "a100".into() },
        mem: CapacitySpec { price_mon: p(0), price_sec: p(3), capacity: 10 },
        disk: CapacitySpec { price_mon: p(0), price_sec: p(4), capacity: 20 },
        exist: true,
        sold: false,
        avail: true,
    })
}

fn create_order(provider: &str, order_id: u64, node_id: u64, duration: u64) -> GridEvent {
    GridEvent::CreateOrder(CreateOrderEvent {
        provider: provider.into(),
        order_id,
        node_id,
        activate_time: U256::from(1_000u64),
        probation: U256::from(60u64),
        duration: U256::from(duration),
        status: OrderStatus::Unactive.as_u8(),
        user: "0xUSER".into(),
    })
}

struct Harness {
    store: Arc<SqliteStore>,
    engine: ProjectionEngine,
    sweeper: LifecycleSweeper,
}

async fn harness() -> Harness {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let locks = ProviderLocks::new();
    let engine = ProjectionEngine::with_locks(store.clone(), locks.clone());
    let sweeper = LifecycleSweeper::with_locks(store.clone(), locks);
    Harness { store, engine, sweeper }
}

async fn seed(h: &Harness) {
    for provider in [ALPHA, BETA] {
        h.engine.apply(&register(provider), &ctx(1, 500)).await.unwrap();
        h.engine.apply(&add_node(provider, 1), &ctx(1, 500)).await.unwrap();
    }
}

#[tokio::test]
async fn order_lifecycle_on_sqlite() {
    let h = harness().await;
    seed(&h).await;
    h.engine
        .apply(&create_order(ALPHA, 7, 1, 100), &ctx(2, 900))
        .await
        .unwrap();

    let order = h.store.order(7).await.unwrap().unwrap();
    assert_eq!((order.start_time, order.end_time), (1_060, 1_160));
    assert_eq!(order.user, "0xuser");
    assert_eq!(order.fee, U256::from(11_300u64));

    let ledger = h.store.profit(ALPHA).await.unwrap().unwrap();
    assert_eq!(ledger.profit, U256::from(11_300u64));
    assert_eq!(ledger.balance, U256::ZERO);
    assert_eq!(ledger.end_time, 1_160);

    let g = h.store.global_counters().await.unwrap();
    assert_eq!((g.cp_num, g.node_global, g.node_used), (1, 2, 1));
    assert_eq!((g.mem_used, g.disk_used), (10, 20));
    assert_eq!(h.store.order_count(ALPHA).await.unwrap(), 1);
    assert_eq!(h.store.active_orders(1_100).await.unwrap().len(), 1);
    assert!(h.store.active_orders(1_200).await.unwrap().is_empty());

    let report = h.sweeper.sweep_at(&SweepScope::All, 1_200).await.unwrap();
    assert_eq!((report.examined, report.completed, report.released_nodes), (1, 1, 1));
    assert!(report.is_clean());

    let order = h.store.order(7).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Completed);
    let ledger = h.store.profit(ALPHA).await.unwrap().unwrap();
    assert_eq!(ledger.balance, U256::from(11_300u64));
    assert_eq!(ledger.profit, U256::ZERO);
    assert!(!h.store.node(&NodeKey::new(ALPHA, 1)).await.unwrap().unwrap().sold);

    let g = h.store.global_counters().await.unwrap();
    assert_eq!((g.node_used, g.mem_used, g.disk_used), (0, 0, 0));

    let again = h.sweeper.sweep_at(&SweepScope::All, 1_300).await.unwrap();
    assert_eq!(again.examined, 0);

    h.engine.withdraw(ALPHA, U256::from(300u64)).await.unwrap();
    let ledger = h.store.profit(ALPHA).await.unwrap().unwrap();
    assert_eq!(ledger.balance, U256::from(11_000u64));
    assert_eq!(ledger.nonce, 1);
}

#[tokio::test]
async fn corrupt_row_fails_alone_in_sweep() {
    let h = harness().await;
    seed(&h).await;
    h.engine.apply(&create_order(ALPHA, 1, 1, 100), &ctx(2, 900)).await.unwrap();
    h.engine.apply(&create_order(BETA, 2, 1, 100), &ctx(2, 900)).await.unwrap();

    sqlx::query("UPDATE orders SET fee = 'bogus' WHERE id = 1")
        .execute(h.store.pool())
        .await
        .unwrap();

    let report = h.sweeper.sweep_at(&SweepScope::All, 2_000).await.unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.completed, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].order_id, 1);
    assert_eq!(report.failures[0].kind, "corrupt_state");

    let beta = h.store.order(2).await.unwrap().unwrap();
    assert_eq!(beta.status, OrderStatus::Completed);
    let g = h.store.global_counters().await.unwrap();
    assert_eq!(g.node_used, 1);
}

#[tokio::test]
async fn provider_scope_leaves_other_providers() {
    let h = harness().await;
    seed(&h).await;
    h.engine.apply(&create_order(ALPHA, 1, 1, 100), &ctx(2, 900)).await.unwrap();
    h.engine.apply(&create_order(BETA, 2, 1, 100), &ctx(2, 900)).await.unwrap();

    let report = h
        .sweeper
        .sweep_at(&SweepScope::provider("0xBBBB"), 2_000)
        .await
        .unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(h.store.order(1).await.unwrap().unwrap().status, OrderStatus::Unactive);
    assert_eq!(h.store.order(2).await.unwrap().unwrap().status, OrderStatus::Completed);
}

#[tokio::test]
async fn failed_event_changes_nothing() {
    let h = harness().await;
    seed(&h).await;
    let before = h.store.global_counters().await.unwrap();

    let err = h
        .engine
        .try_apply(&create_order(ALPHA, 1, 42, 100), &ctx(2, 900))
        .await
        .unwrap_err();
    assert!(matches!(err, ProjectionError::NotFound { .. }));

    let err = h
        .engine
        .try_apply(&register(ALPHA), &ctx(3, 900))
        .await
        .unwrap_err();
    assert!(matches!(err, ProjectionError::DuplicateEntity { .. }));

    assert_eq!(h.store.global_counters().await.unwrap(), before);
    assert!(h.store.order(1).await.unwrap().is_none());
    assert_eq!(h.store.profit(ALPHA).await.unwrap().unwrap().profit, U256::ZERO);
}

#[tokio::test]
async fn concurrent_orders_sum_profit() {
    let h = harness().await;
    seed(&h).await;
    let mut tasks = Vec::new();
    for id in 1..=8u64 {
        let engine = h.engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .apply(&create_order(ALPHA, id, 1, 10), &ctx(2, 900))
                .await
        }));
    }
    for t in tasks {
        t.await.unwrap().unwrap();
    }
    let ledger = h.store.profit(ALPHA).await.unwrap().unwrap();
    // 113 per second of duration, 10 seconds, 8 orders
    assert_eq!(ledger.profit, U256::from(113u64 * 10 * 8));
    let g = h.store.global_counters().await.unwrap();
    assert_eq!((g.cp_num, g.node_used), (8, 1));
}

#[tokio::test]
async fn checkpoint_tracker_persists_in_file() {
    let dir = std::env::temp_dir().join(format!("gridindex-cp-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("grid.db");
    let path = path.to_str().unwrap().to_string();

    {
        let store = Arc::new(SqliteStore::open(&path).await.unwrap());
        let tracker = CheckpointTracker::new(store as Arc<dyn CheckpointStore>);
        assert_eq!(tracker.current().await.unwrap(), 0);
        tracker.advance(10).await.unwrap();
        tracker.advance(10).await.unwrap();
        let err = tracker.advance(9).await.unwrap_err();
        assert!(matches!(err, ProjectionError::NotMonotonic { current: 10, attempted: 9 }));
    }

    let store = Arc::new(SqliteStore::open(&path).await.unwrap());
    let tracker = CheckpointTracker::new(store as Arc<dyn CheckpointStore>);
    assert_eq!(tracker.stored().await.unwrap(), Some(10));
    tracker.reset(3).await.unwrap();
    assert_eq!(tracker.current().await.unwrap(), 3);

    let _ = std::fs::remove_dir_all(&dir);
}
