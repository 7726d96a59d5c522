//! Storage traits for projected entities and the block checkpoint.
//!
//! Every mutating method is one unit of work: a backend applies it
//! atomically or not at all. Methods that touch a node's `sold` flag also
//! adjust the global `node_used` / `mem_used` / `disk_used` counters in the
//! same unit, so the counters always equal the resources of sold nodes.
//!
//! Implementations: [`crate::memory::InMemoryStore`] and, in
//! `gridindex-storage`, `SqliteStore`.

use alloy_primitives::U256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entity::{
    GlobalCounters, Node, NodeFlag, NodeKey, Order, OrderStatus, ProfitEntry, Provider,
};
use crate::error::ProjectionError;

/// Outcome of [`EntityStore::create_order`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderCreated {
    /// `true` if the node moved from unsold to sold.
    pub node_sold: bool,
}

/// Outcome of [`EntityStore::complete_order`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The order moved to `completed`.
    Completed {
        /// `true` if the node was flipped back to unsold.
        node_released: bool,
    },
    /// The order was already completed; nothing changed.
    AlreadyCompleted,
}

/// Projected entity storage.
#[async_trait]
pub trait EntityStore: Send + Sync {
    // ── Providers ────────────────────────────────────────────────────────────

    /// Insert a provider together with its zeroed profit ledger.
    ///
    /// Fails with `DuplicateEntity` if the address is already registered;
    /// the existing rows are left untouched.
    async fn create_provider(
        &self,
        provider: Provider,
        ledger: ProfitEntry,
    ) -> Result<(), ProjectionError>;

    async fn provider(&self, address: &str) -> Result<Option<Provider>, ProjectionError>;

    /// Providers ordered by address.
    async fn list_providers(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Provider>, ProjectionError>;

    // ── Nodes ────────────────────────────────────────────────────────────────

    /// Insert a node and add it to `node_global`, `mem_global` and
    /// `disk_global`. A node registered as already sold also counts as used.
    async fn create_node(&self, node: Node) -> Result<(), ProjectionError>;

    async fn node(&self, key: &NodeKey) -> Result<Option<Node>, ProjectionError>;

    async fn nodes_by_provider(&self, provider: &str) -> Result<Vec<Node>, ProjectionError>;

    /// Set one flag on a node. Returns `true` if the stored value changed.
    ///
    /// Changing `sold` adjusts the used-resource counters.
    async fn set_node_flag(
        &self,
        key: &NodeKey,
        flag: NodeFlag,
        value: bool,
    ) -> Result<bool, ProjectionError>;

    // ── Orders ───────────────────────────────────────────────────────────────

    /// Insert an order, mark its node sold, count it in `cp_num`, and accrue
    /// `order.fee` on the provider's ledger (raising `end_time` if later).
    async fn create_order(&self, order: Order, now: i64) -> Result<OrderCreated, ProjectionError>;

    async fn order(&self, id: u64) -> Result<Option<Order>, ProjectionError>;

    async fn orders_by_user(&self, user: &str) -> Result<Vec<Order>, ProjectionError>;

    async fn orders_by_provider(&self, provider: &str) -> Result<Vec<Order>, ProjectionError>;

    async fn order_count(&self, provider: &str) -> Result<u64, ProjectionError>;

    /// Orders whose `start_time < now < end_time`.
    async fn active_orders(&self, now: i64) -> Result<Vec<Order>, ProjectionError>;

    /// Ids of orders with `end_time < now` that are not completed, optionally
    /// restricted to one provider, in ascending id order.
    async fn expired_order_ids(
        &self,
        provider: Option<&str>,
        now: i64,
    ) -> Result<Vec<u64>, ProjectionError>;

    /// Move an order to `completed`.
    ///
    /// In one unit: set the status (only if not already completed), release
    /// the order's fee into the provider's withdrawable balance, and flip the
    /// node back to unsold unless another order still holds it at `now`.
    async fn complete_order(&self, order_id: u64, now: i64) -> Result<Completion, ProjectionError>;

    /// Compare-and-set an order's status. Returns `false` if the stored status
    /// was not `from`. Not for `completed`; use [`Self::complete_order`].
    async fn update_order_status(
        &self,
        order_id: u64,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, ProjectionError>;

    // ── Profit ledger ────────────────────────────────────────────────────────

    async fn profit(&self, address: &str) -> Result<Option<ProfitEntry>, ProjectionError>;

    /// Subtract `amount` from the balance and bump the nonce.
    ///
    /// Fails with `InsufficientBalance` (and changes nothing) on overdraft.
    async fn withdraw(
        &self,
        address: &str,
        amount: U256,
        now: i64,
    ) -> Result<ProfitEntry, ProjectionError>;

    // ── Global counters ──────────────────────────────────────────────────────

    async fn global_counters(&self) -> Result<GlobalCounters, ProjectionError>;
}

// ─── Checkpoints ─────────────────────────────────────────────────────────────

/// A persisted ingestion position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Row key, e.g. `"block_number_key"`.
    pub key: String,
    /// Last block whose events were fully projected.
    pub block_number: u64,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
    /// Set on the progress row of a block that is only partly projected:
    /// the last log of `block_number` that was applied.
    #[serde(default)]
    pub log_index: Option<u32>,
}

/// Trait for storing and loading checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>, ProjectionError>;

    /// Save (upsert) a checkpoint.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), ProjectionError>;

    /// Delete a checkpoint (full resync).
    async fn delete(&self, key: &str) -> Result<(), ProjectionError>;
}
