//! In-memory storage backend.
//!
//! Holds every table behind a single mutex, so each unit of work runs
//! atomically. Useful for tests and short-lived projections that don't need
//! persistence; all data is lost when the process exits.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use alloy_primitives::U256;
use async_trait::async_trait;

use crate::entity::{
    normalize_address, GlobalCounters, Node, NodeFlag, NodeKey, Order, OrderStatus, ProfitEntry,
    Provider,
};
use crate::error::ProjectionError;
use crate::store::{Checkpoint, CheckpointStore, Completion, EntityStore, OrderCreated};

#[derive(Default)]
struct Tables {
    providers: BTreeMap<String, Provider>,
    nodes: BTreeMap<NodeKey, Node>,
    orders: BTreeMap<u64, Order>,
    profits: HashMap<String, ProfitEntry>,
    global: GlobalCounters,
    checkpoints: HashMap<String, Checkpoint>,
}

impl Tables {
    /// Flip a node's `sold` flag and move its resources in or out of the
    /// used counters. Returns `true` if the flag changed.
    fn set_sold(&mut self, key: &NodeKey, sold: bool) -> Result<bool, ProjectionError> {
        let node = self.nodes.get_mut(key).ok_or_else(|| node_not_found(key))?;
        if node.sold == sold {
            return Ok(false);
        }
        let (mem, disk) = (node.mem.capacity, node.disk.capacity);
        let mut global = self.global;
        if sold {
            global.allocate(mem, disk)?;
        } else {
            global.deallocate(mem, disk)?;
        }
        node.sold = sold;
        self.global = global;
        Ok(true)
    }
}

fn node_not_found(key: &NodeKey) -> ProjectionError {
    ProjectionError::NotFound {
        entity: "node",
        key: key.to_string(),
    }
}

fn order_not_found(id: u64) -> ProjectionError {
    ProjectionError::NotFound {
        entity: "order",
        key: id.to_string(),
    }
}

fn profit_not_found(address: &str) -> ProjectionError {
    ProjectionError::NotFound {
        entity: "profit",
        key: address.to_string(),
    }
}

/// In-memory entity and checkpoint store.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, ProjectionError> {
        self.tables
            .lock()
            .map_err(|_| ProjectionError::Storage("in-memory store lock poisoned".into()))
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn create_provider(
        &self,
        provider: Provider,
        ledger: ProfitEntry,
    ) -> Result<(), ProjectionError> {
        let mut t = self.lock()?;
        let address = normalize_address(&provider.address);
        if t.providers.contains_key(&address) || t.profits.contains_key(&address) {
            return Err(ProjectionError::DuplicateEntity {
                entity: "provider",
                key: address,
            });
        }
        t.profits.insert(address.clone(), ledger);
        t.providers.insert(address, provider);
        Ok(())
    }

    async fn provider(&self, address: &str) -> Result<Option<Provider>, ProjectionError> {
        Ok(self.lock()?.providers.get(&normalize_address(address)).cloned())
    }

    async fn list_providers(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Provider>, ProjectionError> {
        Ok(self
            .lock()?
            .providers
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_node(&self, node: Node) -> Result<(), ProjectionError> {
        let mut t = self.lock()?;
        let key = node.key();
        if t.nodes.contains_key(&key) {
            return Err(ProjectionError::DuplicateEntity {
                entity: "node",
                key: key.to_string(),
            });
        }
        t.global
            .register_node(node.mem.capacity, node.disk.capacity, node.sold)?;
        t.nodes.insert(key, node);
        Ok(())
    }

    async fn node(&self, key: &NodeKey) -> Result<Option<Node>, ProjectionError> {
        Ok(self.lock()?.nodes.get(key).cloned())
    }

    async fn nodes_by_provider(&self, provider: &str) -> Result<Vec<Node>, ProjectionError> {
        let provider = normalize_address(provider);
        Ok(self
            .lock()?
            .nodes
            .values()
            .filter(|n| n.provider == provider)
            .cloned()
            .collect())
    }

    async fn set_node_flag(
        &self,
        key: &NodeKey,
        flag: NodeFlag,
        value: bool,
    ) -> Result<bool, ProjectionError> {
        let mut t = self.lock()?;
        if flag == NodeFlag::Sold {
            return t.set_sold(key, value);
        }
        let node = t.nodes.get_mut(key).ok_or_else(|| node_not_found(key))?;
        let slot = match flag {
            NodeFlag::Exist => &mut node.exist,
            NodeFlag::Avail => &mut node.avail,
            NodeFlag::Online => &mut node.online,
            NodeFlag::Sold => unreachable!("handled above"),
        };
        let changed = *slot != value;
        *slot = value;
        Ok(changed)
    }

    async fn create_order(&self, order: Order, now: i64) -> Result<OrderCreated, ProjectionError> {
        let mut t = self.lock()?;
        let key = order.node_key();
        if !t.nodes.contains_key(&key) {
            return Err(node_not_found(&key));
        }
        if t.orders.contains_key(&order.id) {
            return Err(ProjectionError::DuplicateEntity {
                entity: "order",
                key: order.id.to_string(),
            });
        }
        // Stage the ledger update first so a failure leaves nothing behind.
        let mut ledger = t
            .profits
            .get(&key.provider)
            .cloned()
            .ok_or_else(|| profit_not_found(&key.provider))?;
        ledger.accrue(order.fee, order.end_time, now)?;
        let mut global = t.global;
        global.count_order()?;

        let node_sold = t.set_sold(&key, true)?;
        t.global.cp_num = global.cp_num;
        t.profits.insert(key.provider.clone(), ledger);
        t.orders.insert(order.id, order);
        Ok(OrderCreated { node_sold })
    }

    async fn order(&self, id: u64) -> Result<Option<Order>, ProjectionError> {
        Ok(self.lock()?.orders.get(&id).cloned())
    }

    async fn orders_by_user(&self, user: &str) -> Result<Vec<Order>, ProjectionError> {
        let user = normalize_address(user);
        Ok(self
            .lock()?
            .orders
            .values()
            .filter(|o| o.user == user)
            .cloned()
            .collect())
    }

    async fn orders_by_provider(&self, provider: &str) -> Result<Vec<Order>, ProjectionError> {
        let provider = normalize_address(provider);
        Ok(self
            .lock()?
            .orders
            .values()
            .filter(|o| o.provider == provider)
            .cloned()
            .collect())
    }

    async fn order_count(&self, provider: &str) -> Result<u64, ProjectionError> {
        let provider = normalize_address(provider);
        Ok(self
            .lock()?
            .orders
            .values()
            .filter(|o| o.provider == provider)
            .count() as u64)
    }

    async fn active_orders(&self, now: i64) -> Result<Vec<Order>, ProjectionError> {
        Ok(self
            .lock()?
            .orders
            .values()
            .filter(|o| o.start_time < now && o.end_time > now)
            .cloned()
            .collect())
    }

    async fn expired_order_ids(
        &self,
        provider: Option<&str>,
        now: i64,
    ) -> Result<Vec<u64>, ProjectionError> {
        let provider = provider.map(normalize_address);
        Ok(self
            .lock()?
            .orders
            .values()
            .filter(|o| o.is_expired(now) && o.status != OrderStatus::Completed)
            .filter(|o| provider.as_ref().map_or(true, |p| &o.provider == p))
            .map(|o| o.id)
            .collect())
    }

    async fn complete_order(&self, order_id: u64, now: i64) -> Result<Completion, ProjectionError> {
        let mut t = self.lock()?;
        let order = t
            .orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| order_not_found(order_id))?;
        if order.status == OrderStatus::Completed {
            return Ok(Completion::AlreadyCompleted);
        }

        let key = order.node_key();
        if !t.nodes.contains_key(&key) {
            return Err(node_not_found(&key));
        }
        let mut ledger = t
            .profits
            .get(&order.provider)
            .cloned()
            .ok_or_else(|| profit_not_found(&order.provider))?;
        ledger.release(order.fee, now)?;
        let still_held = t
            .orders
            .values()
            .any(|o| o.id != order_id && o.node_key() == key && o.is_live(now));

        let node_released = if still_held {
            false
        } else {
            t.set_sold(&key, false)?
        };
        t.profits.insert(order.provider.clone(), ledger);
        if let Some(o) = t.orders.get_mut(&order_id) {
            o.status = OrderStatus::Completed;
        }
        Ok(Completion::Completed { node_released })
    }

    async fn update_order_status(
        &self,
        order_id: u64,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, ProjectionError> {
        let mut t = self.lock()?;
        let order = t
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| order_not_found(order_id))?;
        if order.status != from {
            return Ok(false);
        }
        order.status = to;
        Ok(true)
    }

    async fn profit(&self, address: &str) -> Result<Option<ProfitEntry>, ProjectionError> {
        Ok(self.lock()?.profits.get(&normalize_address(address)).cloned())
    }

    async fn withdraw(
        &self,
        address: &str,
        amount: U256,
        now: i64,
    ) -> Result<ProfitEntry, ProjectionError> {
        let mut t = self.lock()?;
        let address = normalize_address(address);
        let ledger = t
            .profits
            .get_mut(&address)
            .ok_or_else(|| profit_not_found(&address))?;
        let mut updated = ledger.clone();
        updated.withdraw(amount, now)?;
        *ledger = updated.clone();
        Ok(updated)
    }

    async fn global_counters(&self) -> Result<GlobalCounters, ProjectionError> {
        Ok(self.lock()?.global)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>, ProjectionError> {
        Ok(self.lock()?.checkpoints.get(key).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), ProjectionError> {
        self.lock()?
            .checkpoints
            .insert(checkpoint.key.clone(), checkpoint);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ProjectionError> {
        self.lock()?.checkpoints.remove(key);
        Ok(())
    }
}
