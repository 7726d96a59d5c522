//! Typed events emitted by the registry and market contracts.
//!
//! Field layouts match the contracts' declared event shapes. Every `uint256`
//! stays a [`U256`]; narrowing to machine integers happens in the handlers,
//! where a value that does not fit is reported as an overflow.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::entity::{CapacitySpec, CpuSpec, GpuSpec, NodeFlag};

/// `Register(address cp, string name, string ip, string domain, string port)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterEvent {
    pub provider: String,
    pub name: String,
    pub ip: String,
    pub domain: String,
    pub port: String,
}

/// `AddNode(address cp, uint64 id, Cpu cpu, Gpu gpu, Mem mem, Disk disk, bool exist, bool sold, bool avail)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddNodeEvent {
    pub provider: String,
    pub node_id: u64,
    pub cpu: CpuSpec,
    pub gpu: GpuSpec,
    pub mem: CapacitySpec,
    pub disk: CapacitySpec,
    pub exist: bool,
    pub sold: bool,
    pub avail: bool,
}

/// `CreateOrder(address cp, uint64 id, uint64 nid, uint256 act, uint256 pro, uint256 dur, uint8 status)`
///
/// The paying user is not part of the event; it is the sender of the
/// transaction that emitted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderEvent {
    pub provider: String,
    pub order_id: u64,
    pub node_id: u64,
    pub activate_time: U256,
    pub probation: U256,
    pub duration: U256,
    pub status: u8,
    pub user: String,
}

/// `Withdraw(address cp, uint256 amount)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawEvent {
    pub provider: String,
    pub amount: U256,
}

/// Explicit status update of an order (cancellation or forward move).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetOrderStatusEvent {
    pub order_id: u64,
    pub status: u8,
}

/// Explicit update of a single node flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetNodeFlagEvent {
    pub provider: String,
    pub node_id: u64,
    pub flag: NodeFlag,
    pub value: bool,
}

/// Discriminant of [`GridEvent`], used for handler dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Register,
    AddNode,
    CreateOrder,
    Withdraw,
    SetOrderStatus,
    SetNodeFlag,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "Register",
            Self::AddNode => "AddNode",
            Self::CreateOrder => "CreateOrder",
            Self::Withdraw => "Withdraw",
            Self::SetOrderStatus => "SetOrderStatus",
            Self::SetNodeFlag => "SetNodeFlag",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded event ready for projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "fields")]
pub enum GridEvent {
    Register(RegisterEvent),
    AddNode(AddNodeEvent),
    CreateOrder(CreateOrderEvent),
    Withdraw(WithdrawEvent),
    SetOrderStatus(SetOrderStatusEvent),
    SetNodeFlag(SetNodeFlagEvent),
}

impl GridEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Register(_) => EventKind::Register,
            Self::AddNode(_) => EventKind::AddNode,
            Self::CreateOrder(_) => EventKind::CreateOrder,
            Self::Withdraw(_) => EventKind::Withdraw,
            Self::SetOrderStatus(_) => EventKind::SetOrderStatus,
            Self::SetNodeFlag(_) => EventKind::SetNodeFlag,
        }
    }

    /// Natural key fields, for error reports and log lines.
    pub fn key(&self) -> String {
        match self {
            Self::Register(e) => format!("provider={}", e.provider),
            Self::AddNode(e) => format!("provider={} node={}", e.provider, e.node_id),
            Self::CreateOrder(e) => format!(
                "provider={} order={} node={}",
                e.provider, e.order_id, e.node_id
            ),
            Self::Withdraw(e) => format!("provider={} amount={}", e.provider, e.amount),
            Self::SetOrderStatus(e) => format!("order={} status={}", e.order_id, e.status),
            Self::SetNodeFlag(e) => format!(
                "provider={} node={} {}={}",
                e.provider,
                e.node_id,
                e.flag.column(),
                e.value
            ),
        }
    }
}

/// Where an event came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContext {
    /// Chain slug (e.g. `"ethereum"`).
    pub chain: String,
    pub block_number: u64,
    /// Unix timestamp of the block; `0` when the upstream did not supply it.
    pub block_timestamp: i64,
    pub log_index: u32,
    pub tx_hash: String,
}

impl EventContext {
    pub fn at_block(block_number: u64, log_index: u32) -> Self {
        Self {
            block_number,
            log_index,
            ..Default::default()
        }
    }

    /// The block time if known, otherwise the wall clock.
    pub fn timestamp_or_now(&self) -> i64 {
        if self.block_timestamp > 0 {
            self.block_timestamp
        } else {
            chrono::Utc::now().timestamp()
        }
    }
}
