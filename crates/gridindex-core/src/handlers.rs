//! Built-in handlers that project registry and market events.
//!
//! Handlers hold no state of their own. Each one validates and narrows the
//! event's fields, then hands a single unit of work to the [`EntityStore`].
//! Work that rewrites a provider's profit ledger runs under that provider's
//! lock.

use std::sync::Arc;

use alloy_primitives::U256;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::entity::{normalize_address, Node, NodeKey, Order, OrderStatus, ProfitEntry, Provider};
use crate::error::ProjectionError;
use crate::event::{EventContext, EventKind, GridEvent};
use crate::handler::{EventHandler, HandlerRegistry};
use crate::locks::ProviderLocks;
use crate::store::{Completion, EntityStore};

/// Register every built-in handler against `store`.
pub fn register_builtin(
    registry: &mut HandlerRegistry,
    store: Arc<dyn EntityStore>,
    locks: ProviderLocks,
) {
    let ctx = HandlerCtx { store, locks };
    registry.on_event(Arc::new(RegisterHandler(ctx.clone())));
    registry.on_event(Arc::new(AddNodeHandler(ctx.clone())));
    registry.on_event(Arc::new(CreateOrderHandler(ctx.clone())));
    registry.on_event(Arc::new(WithdrawHandler(ctx.clone())));
    registry.on_event(Arc::new(SetOrderStatusHandler(ctx.clone())));
    registry.on_event(Arc::new(SetNodeFlagHandler(ctx)));
}

#[derive(Clone)]
struct HandlerCtx {
    store: Arc<dyn EntityStore>,
    locks: ProviderLocks,
}

fn mismatched(expected: EventKind, got: &GridEvent) -> ProjectionError {
    ProjectionError::Other(format!(
        "{expected} handler received a {} event",
        got.kind()
    ))
}

fn narrow_u64(value: U256, what: &str) -> Result<u64, ProjectionError> {
    u64::try_from(value).map_err(|_| ProjectionError::Overflow {
        context: format!("{what} {value} does not fit in 64 bits"),
    })
}

fn narrow_i64(value: U256, what: &str) -> Result<i64, ProjectionError> {
    i64::try_from(value).map_err(|_| ProjectionError::Overflow {
        context: format!("{what} {value} does not fit in a timestamp"),
    })
}

// ─── Register ────────────────────────────────────────────────────────────────

struct RegisterHandler(HandlerCtx);

#[async_trait]
impl EventHandler for RegisterHandler {
    async fn handle(&self, event: &GridEvent, ctx: &EventContext) -> Result<(), ProjectionError> {
        let GridEvent::Register(e) = event else {
            return Err(mismatched(self.kind(), event));
        };
        let address = normalize_address(&e.provider);
        let provider = Provider {
            address: address.clone(),
            name: e.name.clone(),
            ip: e.ip.clone(),
            domain: e.domain.clone(),
            port: e.port.clone(),
        };
        let ledger = ProfitEntry::zeroed(&address, ctx.timestamp_or_now());

        let _guard = self.0.locks.lock(&address).await;
        self.0.store.create_provider(provider, ledger).await?;
        info!(provider = %address, name = %e.name, "provider registered");
        Ok(())
    }

    fn kind(&self) -> EventKind {
        EventKind::Register
    }
}

// ─── AddNode ─────────────────────────────────────────────────────────────────

struct AddNodeHandler(HandlerCtx);

#[async_trait]
impl EventHandler for AddNodeHandler {
    async fn handle(&self, event: &GridEvent, _ctx: &EventContext) -> Result<(), ProjectionError> {
        let GridEvent::AddNode(e) = event else {
            return Err(mismatched(self.kind(), event));
        };
        let node = Node {
            provider: normalize_address(&e.provider),
            id: e.node_id,
            cpu: e.cpu.clone(),
            gpu: e.gpu.clone(),
            mem: e.mem.clone(),
            disk: e.disk.clone(),
            exist: e.exist,
            sold: e.sold,
            avail: e.avail,
            online: false,
        };
        let key = node.key();
        let (mem, disk) = (node.mem.capacity, node.disk.capacity);
        self.0.store.create_node(node).await?;
        info!(node = %key, mem, disk, "node added");
        Ok(())
    }

    fn kind(&self) -> EventKind {
        EventKind::AddNode
    }
}

// ─── CreateOrder ─────────────────────────────────────────────────────────────

struct CreateOrderHandler(HandlerCtx);

#[async_trait]
impl EventHandler for CreateOrderHandler {
    async fn handle(&self, event: &GridEvent, ctx: &EventContext) -> Result<(), ProjectionError> {
        let GridEvent::CreateOrder(e) = event else {
            return Err(mismatched(self.kind(), event));
        };
        let status = OrderStatus::try_from(e.status).map_err(|to| {
            ProjectionError::InvalidStatusTransition {
                order_id: e.order_id,
                from: OrderStatus::NotExist.as_u8(),
                to,
            }
        })?;
        let activate_time = narrow_i64(e.activate_time, "activate time")?;
        let probation = narrow_u64(e.probation, "probation")?;
        let duration = narrow_u64(e.duration, "duration")?;
        let (start_time, end_time) = Order::schedule(activate_time, probation, duration)?;

        let key = NodeKey::new(&e.provider, e.node_id);
        let node = self
            .0
            .store
            .node(&key)
            .await?
            .ok_or_else(|| ProjectionError::NotFound {
                entity: "node",
                key: key.to_string(),
            })?;
        let fee = node.order_fee(duration)?;

        let order = Order {
            id: e.order_id,
            user: normalize_address(&e.user),
            provider: key.provider.clone(),
            node_id: e.node_id,
            activate_time,
            start_time,
            end_time,
            probation,
            duration,
            status,
            fee,
        };

        let _guard = self.0.locks.lock(&key.provider).await;
        let created = self
            .0
            .store
            .create_order(order, ctx.timestamp_or_now())
            .await?;
        info!(
            order_id = e.order_id,
            node = %key,
            %fee,
            start_time,
            end_time,
            node_sold = created.node_sold,
            "order created"
        );
        Ok(())
    }

    fn kind(&self) -> EventKind {
        EventKind::CreateOrder
    }
}

// ─── Withdraw ────────────────────────────────────────────────────────────────

struct WithdrawHandler(HandlerCtx);

#[async_trait]
impl EventHandler for WithdrawHandler {
    async fn handle(&self, event: &GridEvent, ctx: &EventContext) -> Result<(), ProjectionError> {
        let GridEvent::Withdraw(e) = event else {
            return Err(mismatched(self.kind(), event));
        };
        let address = normalize_address(&e.provider);
        let _guard = self.0.locks.lock(&address).await;
        let ledger = self
            .0
            .store
            .withdraw(&address, e.amount, ctx.timestamp_or_now())
            .await?;
        info!(
            provider = %address,
            amount = %e.amount,
            balance = %ledger.balance,
            nonce = ledger.nonce,
            "withdrawal applied"
        );
        Ok(())
    }

    fn kind(&self) -> EventKind {
        EventKind::Withdraw
    }
}

// ─── SetOrderStatus ──────────────────────────────────────────────────────────

/// Upper bound on compare-and-set retries; statuses only move forward, so
/// a concurrent writer can win at most once per status.
const STATUS_CAS_ATTEMPTS: usize = 5;

struct SetOrderStatusHandler(HandlerCtx);

#[async_trait]
impl EventHandler for SetOrderStatusHandler {
    async fn handle(&self, event: &GridEvent, ctx: &EventContext) -> Result<(), ProjectionError> {
        let GridEvent::SetOrderStatus(e) = event else {
            return Err(mismatched(self.kind(), event));
        };
        let not_found = || ProjectionError::NotFound {
            entity: "order",
            key: e.order_id.to_string(),
        };
        let mut order = self.0.store.order(e.order_id).await?.ok_or_else(not_found)?;
        let to = OrderStatus::try_from(e.status).map_err(|to| {
            ProjectionError::InvalidStatusTransition {
                order_id: e.order_id,
                from: order.status.as_u8(),
                to,
            }
        })?;

        if to == OrderStatus::Completed {
            let _guard = self.0.locks.lock(&order.provider).await;
            let outcome = self
                .0
                .store
                .complete_order(e.order_id, ctx.timestamp_or_now())
                .await?;
            if let Completion::Completed { node_released } = outcome {
                info!(order_id = e.order_id, node_released, "order completed");
            }
            return Ok(());
        }

        for _ in 0..STATUS_CAS_ATTEMPTS {
            let from = order.status;
            if !from.can_transition_to(to) {
                return Err(ProjectionError::InvalidStatusTransition {
                    order_id: e.order_id,
                    from: from.as_u8(),
                    to: to.as_u8(),
                });
            }
            if from == to {
                debug!(order_id = e.order_id, status = %to, "order status unchanged");
                return Ok(());
            }
            if self.0.store.update_order_status(e.order_id, from, to).await? {
                info!(order_id = e.order_id, %from, %to, "order status updated");
                return Ok(());
            }
            order = self.0.store.order(e.order_id).await?.ok_or_else(not_found)?;
        }
        Err(ProjectionError::Storage(format!(
            "order {} status kept changing underneath the update",
            e.order_id
        )))
    }

    fn kind(&self) -> EventKind {
        EventKind::SetOrderStatus
    }
}

// ─── SetNodeFlag ─────────────────────────────────────────────────────────────

struct SetNodeFlagHandler(HandlerCtx);

#[async_trait]
impl EventHandler for SetNodeFlagHandler {
    async fn handle(&self, event: &GridEvent, _ctx: &EventContext) -> Result<(), ProjectionError> {
        let GridEvent::SetNodeFlag(e) = event else {
            return Err(mismatched(self.kind(), event));
        };
        let key = NodeKey::new(&e.provider, e.node_id);
        let changed = self.0.store.set_node_flag(&key, e.flag, e.value).await?;
        debug!(node = %key, flag = e.flag.column(), value = e.value, changed, "node flag set");
        Ok(())
    }

    fn kind(&self) -> EventKind {
        EventKind::SetNodeFlag
    }
}
