//! Shared fixtures for unit tests.

use alloy_primitives::U256;

use crate::entity::{
    normalize_address, CapacitySpec, CpuSpec, GpuSpec, Node, Order, OrderStatus, Provider,
};
use crate::event::{AddNodeEvent, CreateOrderEvent, RegisterEvent};

pub fn provider(address: &str) -> Provider {
    Provider {
        address: normalize_address(address),
        name: "provider".into(),
        ip: "10.0.0.1".into(),
        domain: "grid.example".into(),
        port: "8080".into(),
    }
}

/// Node `0xaaaa/1` with 10 units of memory and 20 of disk at the given
/// per-second prices.
pub fn priced_node(cpu: u64, gpu: u64, mem: u64, disk: u64) -> Node {
    Node {
        provider: "0xaaaa".into(),
        id: 1,
        cpu: CpuSpec {
            price_mon: U256::ZERO,
            price_sec: U256::from(cpu),
            core: 8,
            model: "epyc".into(),
        },
        gpu: GpuSpec {
            price_mon: U256::ZERO,
            price_sec: U256::from(gpu),
            model: "a100".into(),
        },
        mem: CapacitySpec {
            price_mon: U256::ZERO,
            price_sec: U256::from(mem),
            capacity: 10,
        },
        disk: CapacitySpec {
            price_mon: U256::ZERO,
            price_sec: U256::from(disk),
            capacity: 20,
        },
        exist: true,
        sold: false,
        avail: true,
        online: false,
    }
}

pub fn node(provider: &str, id: u64, mem: u64, disk: u64) -> Node {
    let mut n = priced_node(1, 1, 1, 1);
    n.provider = normalize_address(provider);
    n.id = id;
    n.mem.capacity = mem;
    n.disk.capacity = disk;
    n
}

/// An unactive order with no probation window.
pub fn order(id: u64, provider: &str, node_id: u64, activate: i64, duration: u64) -> Order {
    Order {
        id,
        user: "0xuser".into(),
        provider: normalize_address(provider),
        node_id,
        activate_time: activate,
        start_time: activate,
        end_time: activate + duration as i64,
        probation: 0,
        duration,
        status: OrderStatus::Unactive,
        fee: U256::from(duration),
    }
}

pub fn register_event(provider: &str) -> RegisterEvent {
    RegisterEvent {
        provider: provider.into(),
        name: "provider".into(),
        ip: "10.0.0.1".into(),
        domain: "grid.example".into(),
        port: "8080".into(),
    }
}

/// `AddNode` with the prices of [`priced_node(1, 2, 3, 4)`](priced_node).
pub fn add_node_event(provider: &str, node_id: u64, mem: u64, disk: u64) -> AddNodeEvent {
    let n = priced_node(1, 2, 3, 4);
    AddNodeEvent {
        provider: provider.into(),
        node_id,
        cpu: n.cpu,
        gpu: n.gpu,
        mem: CapacitySpec { capacity: mem, ..n.mem },
        disk: CapacitySpec {
            capacity: disk,
            ..n.disk
        },
        exist: true,
        sold: false,
        avail: true,
    }
}

pub fn create_order_event(
    provider: &str,
    order_id: u64,
    node_id: u64,
    activate: u64,
    probation: u64,
    duration: u64,
) -> CreateOrderEvent {
    CreateOrderEvent {
        provider: provider.into(),
        order_id,
        node_id,
        activate_time: U256::from(activate),
        probation: U256::from(probation),
        duration: U256::from(duration),
        status: OrderStatus::Unactive.as_u8(),
        user: "0xuser".into(),
    }
}
