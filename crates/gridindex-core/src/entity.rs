//! Persistent entities projected from the registry and market contracts.
//!
//! All monetary and pricing values are 256-bit unsigned integers. Backends
//! that persist them as text use base-10 strings (see [`parse_amount`]).

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::error::ProjectionError;

/// Fixed id of the singleton global-counters row.
pub const GLOBAL_ROW_ID: u64 = 0;

/// Lower-cases a `0x…` address so lookups are case-insensitive.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// Parse a stored base-10 amount, mapping failures to `CorruptState`.
pub fn parse_amount(
    entity: &'static str,
    key: &str,
    field: &'static str,
    value: &str,
) -> Result<U256, ProjectionError> {
    let corrupt = || ProjectionError::CorruptState {
        entity,
        key: key.to_string(),
        field,
        value: value.to_string(),
    };
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(corrupt());
    }
    U256::from_str_radix(value, 10).map_err(|_| corrupt())
}

// ─── Provider ────────────────────────────────────────────────────────────────

/// A compute provider registered on the registry contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub address: String,
    pub name: String,
    pub ip: String,
    pub domain: String,
    pub port: String,
}

// ─── Node ────────────────────────────────────────────────────────────────────

/// Composite key of a node: the owning provider plus its local id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub provider: String,
    pub id: u64,
}

impl NodeKey {
    pub fn new(provider: impl AsRef<str>, id: u64) -> Self {
        Self {
            provider: normalize_address(provider.as_ref()),
            id,
        }
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSpec {
    pub price_mon: U256,
    pub price_sec: U256,
    pub core: u64,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuSpec {
    pub price_mon: U256,
    pub price_sec: U256,
    pub model: String,
}

/// Pricing and size of a capacity-billed resource (memory or disk).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySpec {
    pub price_mon: U256,
    pub price_sec: U256,
    pub capacity: u64,
}

/// One leasable unit of CPU/GPU/Mem/Disk resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub provider: String,
    pub id: u64,
    pub cpu: CpuSpec,
    pub gpu: GpuSpec,
    pub mem: CapacitySpec,
    pub disk: CapacitySpec,
    pub exist: bool,
    pub sold: bool,
    pub avail: bool,
    /// Set by the monitoring collaborator; no contract event carries it.
    pub online: bool,
}

impl Node {
    pub fn key(&self) -> NodeKey {
        NodeKey::new(&self.provider, self.id)
    }

    /// Per-second price of the whole node:
    /// `cpu + gpu + mem.capacity * mem + disk.capacity * disk`.
    pub fn price_per_second(&self) -> Result<U256, ProjectionError> {
        let overflow = || ProjectionError::Overflow {
            context: format!("per-second price of node {}", self.key()),
        };
        let mem = U256::from(self.mem.capacity)
            .checked_mul(self.mem.price_sec)
            .ok_or_else(overflow)?;
        let disk = U256::from(self.disk.capacity)
            .checked_mul(self.disk.price_sec)
            .ok_or_else(overflow)?;
        self.cpu
            .price_sec
            .checked_add(self.gpu.price_sec)
            .and_then(|p| p.checked_add(mem))
            .and_then(|p| p.checked_add(disk))
            .ok_or_else(overflow)
    }

    /// Total fee of leasing this node for `duration_secs`.
    pub fn order_fee(&self, duration_secs: u64) -> Result<U256, ProjectionError> {
        self.price_per_second()?
            .checked_mul(U256::from(duration_secs))
            .ok_or_else(|| ProjectionError::Overflow {
                context: format!("order fee of node {} for {duration_secs}s", self.key()),
            })
    }
}

/// The opaque boolean flags of a node that can be set one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeFlag {
    Exist,
    Sold,
    Avail,
    Online,
}

impl NodeFlag {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Exist => "exist",
            Self::Sold => "sold",
            Self::Avail => "avail",
            Self::Online => "online",
        }
    }
}

impl std::str::FromStr for NodeFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exist" => Ok(Self::Exist),
            "sold" => Ok(Self::Sold),
            "avail" => Ok(Self::Avail),
            "online" => Ok(Self::Online),
            other => Err(format!("unknown node flag '{other}'")),
        }
    }
}

// ─── Order ───────────────────────────────────────────────────────────────────

/// Lifecycle status of an order, as numbered by the market contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OrderStatus {
    NotExist = 0,
    Unactive = 1,
    Active = 2,
    Cancelled = 3,
    Completed = 4,
}

impl OrderStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Statuses only move forward, except that a non-completed order may be
    /// cancelled. Re-applying the current status is allowed.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        if next == self {
            return true;
        }
        match next {
            OrderStatus::Cancelled => self != OrderStatus::Completed,
            _ => next > self,
        }
    }
}

impl TryFrom<u8> for OrderStatus {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::NotExist),
            1 => Ok(Self::Unactive),
            2 => Ok(Self::Active),
            3 => Ok(Self::Cancelled),
            4 => Ok(Self::Completed),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotExist => "not-exist",
            Self::Unactive => "unactive",
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// A lease of one node by a user, timed in unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub user: String,
    pub provider: String,
    pub node_id: u64,
    pub activate_time: i64,
    /// `activate_time + probation`
    pub start_time: i64,
    /// `start_time + duration`
    pub end_time: i64,
    pub probation: u64,
    pub duration: u64,
    pub status: OrderStatus,
    /// Total fee credited to the provider when the order was created.
    pub fee: U256,
}

impl Order {
    pub fn node_key(&self) -> NodeKey {
        NodeKey::new(&self.provider, self.node_id)
    }

    /// Compute `(start_time, end_time)` from the activation time and the
    /// probation and duration windows.
    pub fn schedule(
        activate_time: i64,
        probation: u64,
        duration: u64,
    ) -> Result<(i64, i64), ProjectionError> {
        let overflow = || ProjectionError::Overflow {
            context: format!("order schedule {activate_time}+{probation}+{duration}"),
        };
        let probation = i64::try_from(probation).map_err(|_| overflow())?;
        let duration = i64::try_from(duration).map_err(|_| overflow())?;
        let start = activate_time.checked_add(probation).ok_or_else(overflow)?;
        let end = start.checked_add(duration).ok_or_else(overflow)?;
        Ok((start, end))
    }

    /// `true` once the order's window has closed at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        self.end_time < now
    }

    /// `true` if the order still holds its node at `now`.
    pub fn is_live(&self, now: i64) -> bool {
        self.status != OrderStatus::Completed && self.end_time >= now
    }
}

// ─── Profit ledger ───────────────────────────────────────────────────────────

/// Per-provider profit ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfitEntry {
    pub address: String,
    /// Withdrawable amount.
    pub balance: U256,
    /// Total accrued; never decreases.
    pub profit: U256,
    pub penalty: U256,
    pub last_time: i64,
    /// Furthest moment at which all accrued profit is withdrawable.
    pub end_time: i64,
    /// Incremented on every applied withdrawal.
    pub nonce: u64,
}

impl ProfitEntry {
    /// A fresh ledger with every amount at zero.
    pub fn zeroed(address: impl AsRef<str>, now: i64) -> Self {
        Self {
            address: normalize_address(address.as_ref()),
            balance: U256::ZERO,
            profit: U256::ZERO,
            penalty: U256::ZERO,
            last_time: now,
            end_time: now,
            nonce: 0,
        }
    }

    /// Accrue an order's fee; `end_time` only ever moves later.
    pub fn accrue(&mut self, fee: U256, order_end: i64, now: i64) -> Result<(), ProjectionError> {
        self.profit = self
            .profit
            .checked_add(fee)
            .ok_or_else(|| ProjectionError::Overflow {
                context: format!("profit of {}", self.address),
            })?;
        self.end_time = self.end_time.max(order_end);
        self.last_time = now;
        Ok(())
    }

    /// Make a completed order's fee withdrawable.
    pub fn release(&mut self, fee: U256, now: i64) -> Result<(), ProjectionError> {
        self.balance = self
            .balance
            .checked_add(fee)
            .ok_or_else(|| ProjectionError::Overflow {
                context: format!("balance of {}", self.address),
            })?;
        self.last_time = now;
        Ok(())
    }

    /// Withdraw `amount` from the balance and bump `nonce`.
    ///
    /// An overdraft fails with `InsufficientBalance` and leaves the ledger
    /// untouched, nonce included: a rejected withdrawal is not applied, so
    /// the nonce counts applied withdrawals only.
    pub fn withdraw(&mut self, amount: U256, now: i64) -> Result<(), ProjectionError> {
        self.balance = self.balance.checked_sub(amount).ok_or_else(|| {
            ProjectionError::InsufficientBalance {
                provider: self.address.clone(),
                balance: self.balance.to_string(),
                requested: amount.to_string(),
            }
        })?;
        self.nonce += 1;
        self.last_time = now;
        Ok(())
    }
}

// ─── Global counters ─────────────────────────────────────────────────────────

/// Running aggregates over the whole event history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalCounters {
    /// Orders ever created.
    pub cp_num: u64,
    /// Nodes ever registered.
    pub node_global: u64,
    /// Nodes currently sold.
    pub node_used: u64,
    pub mem_global: u64,
    pub disk_global: u64,
    pub mem_used: u64,
    pub disk_used: u64,
}

fn counter_add(value: u64, by: u64, name: &str) -> Result<u64, ProjectionError> {
    value.checked_add(by).ok_or_else(|| ProjectionError::Overflow {
        context: format!("{name} {value} + {by}"),
    })
}

fn counter_sub(value: u64, by: u64, name: &str) -> Result<u64, ProjectionError> {
    value.checked_sub(by).ok_or_else(|| ProjectionError::Overflow {
        context: format!("{name} {value} - {by} would go below zero"),
    })
}

impl GlobalCounters {
    /// Count a newly registered node. A node registered as sold is also
    /// counted as used.
    pub fn register_node(&mut self, mem: u64, disk: u64, sold: bool) -> Result<(), ProjectionError> {
        let mut next = *self;
        next.node_global = counter_add(next.node_global, 1, "node_global")?;
        next.mem_global = counter_add(next.mem_global, mem, "mem_global")?;
        next.disk_global = counter_add(next.disk_global, disk, "disk_global")?;
        if sold {
            next.allocate(mem, disk)?;
        }
        *self = next;
        Ok(())
    }

    /// A node flipped to sold.
    pub fn allocate(&mut self, mem: u64, disk: u64) -> Result<(), ProjectionError> {
        let node_used = counter_add(self.node_used, 1, "node_used")?;
        let mem_used = counter_add(self.mem_used, mem, "mem_used")?;
        let disk_used = counter_add(self.disk_used, disk, "disk_used")?;
        (self.node_used, self.mem_used, self.disk_used) = (node_used, mem_used, disk_used);
        Ok(())
    }

    /// A node flipped back to unsold. Going below zero means the counters
    /// no longer match the sold nodes and is reported, not clamped.
    pub fn deallocate(&mut self, mem: u64, disk: u64) -> Result<(), ProjectionError> {
        let node_used = counter_sub(self.node_used, 1, "node_used")?;
        let mem_used = counter_sub(self.mem_used, mem, "mem_used")?;
        let disk_used = counter_sub(self.disk_used, disk, "disk_used")?;
        (self.node_used, self.mem_used, self.disk_used) = (node_used, mem_used, disk_used);
        Ok(())
    }

    pub fn count_order(&mut self) -> Result<(), ProjectionError> {
        self.cp_num = counter_add(self.cp_num, 1, "cp_num")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::priced_node;

    #[test]
    fn counters_reject_overflow_without_change() {
        let mut g = GlobalCounters::default();
        g.register_node(1 << 63, 1, false).unwrap();
        let before = g;
        let err = g.register_node(1 << 63, 1, false).unwrap_err();
        assert!(matches!(err, ProjectionError::Overflow { .. }));
        assert_eq!(g, before);

        g.register_node(1, 1, true).unwrap();
        let err = g.allocate(u64::MAX, 0).unwrap_err();
        assert!(matches!(err, ProjectionError::Overflow { .. }));
        assert_eq!((g.node_used, g.mem_used, g.disk_used), (1, 1, 1));
    }

    #[test]
    fn deallocate_reports_drift() {
        let mut g = GlobalCounters::default();
        g.allocate(10, 20).unwrap();
        let err = g.deallocate(11, 20).unwrap_err();
        assert!(matches!(err, ProjectionError::Overflow { .. }));
        assert_eq!((g.node_used, g.mem_used, g.disk_used), (1, 10, 20));
        g.deallocate(10, 20).unwrap();
        assert_eq!(g, GlobalCounters::default());
    }

    #[test]
    fn rejected_withdrawal_keeps_nonce() {
        let mut ledger = ProfitEntry::zeroed("0xaaaa", 0);
        let err = ledger.withdraw(U256::from(1u64), 5).unwrap_err();
        assert!(matches!(err, ProjectionError::InsufficientBalance { .. }));
        assert_eq!(ledger, ProfitEntry::zeroed("0xaaaa", 0));
    }

    #[test]
    fn order_fee_is_exact() {
        let node = priced_node(1, 2, 3, 4);
        // (1 + 2 + 10*3 + 20*4) * 100
        assert_eq!(node.order_fee(100).unwrap(), U256::from(11_300u64));
    }

    #[test]
    fn order_fee_exceeds_u128() {
        let mut node = priced_node(0, 0, 0, 0);
        node.cpu.price_sec = U256::from(u128::MAX);
        let fee = node.order_fee(1_000).unwrap();
        assert_eq!(fee, U256::from(u128::MAX) * U256::from(1_000u64));
    }

    #[test]
    fn order_fee_overflow_is_reported() {
        let mut node = priced_node(0, 0, 0, 0);
        node.cpu.price_sec = U256::MAX;
        assert!(matches!(node.order_fee(2), Err(ProjectionError::Overflow { .. })));
    }

    #[test]
    fn schedule_adds_windows() {
        let (start, end) = Order::schedule(1_000, 60, 3_600).unwrap();
        assert_eq!(start, 1_060);
        assert_eq!(end, 4_660);
        assert!(Order::schedule(i64::MAX, 1, 1).is_err());
    }

    #[test]
    fn status_transitions() {
        use OrderStatus::*;
        assert!(Unactive.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(Active.can_transition_to(Cancelled));
        assert!(Active.can_transition_to(Active));
        assert!(!Active.can_transition_to(Unactive));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(Cancelled.can_transition_to(Completed));
    }

    #[test]
    fn ledger_end_time_never_moves_back() {
        let mut ledger = ProfitEntry::zeroed("0xAB", 100);
        ledger.accrue(U256::from(5u64), 1_000, 110).unwrap();
        ledger.accrue(U256::from(7u64), 500, 120).unwrap();
        assert_eq!(ledger.end_time, 1_000);
        assert_eq!(ledger.profit, U256::from(12u64));
        assert_eq!(ledger.address, "0xab");
    }

    #[test]
    fn withdraw_rejects_overdraft_and_bumps_nonce() {
        let mut ledger = ProfitEntry::zeroed("0xab", 0);
        ledger.release(U256::from(10u64), 1).unwrap();
        ledger.withdraw(U256::from(4u64), 2).unwrap();
        assert_eq!(ledger.balance, U256::from(6u64));
        assert_eq!(ledger.nonce, 1);

        let err = ledger.withdraw(U256::from(7u64), 3).unwrap_err();
        assert!(matches!(err, ProjectionError::InsufficientBalance { .. }));
        assert_eq!(ledger.balance, U256::from(6u64));
        assert_eq!(ledger.nonce, 1);
        // profit is untouched by withdrawals
        assert_eq!(ledger.profit, U256::ZERO);
    }

    #[test]
    fn parse_amount_rejects_garbage() {
        assert_eq!(
            parse_amount("node", "k", "cpu_price", "12345").unwrap(),
            U256::from(12_345u64)
        );
        for bad in ["", "-1", "0x10", "1.5", "12a"] {
            let err = parse_amount("node", "k", "cpu_price", bad).unwrap_err();
            assert!(matches!(err, ProjectionError::CorruptState { .. }), "{bad}");
        }
    }
}
