//! Event schemas of the registry and market contracts.
//!
//! Every event parameter is non-indexed, so topics[0] selects the schema and
//! the whole payload sits in `data`.

use std::collections::HashMap;

use alloy_core::dyn_abi::DynSolType;

use gridindex_core::entity::normalize_address;
use gridindex_core::event::EventKind;

use crate::fingerprint::keccak256_signature;

/// Which contract emitted a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractKind {
    Registry,
    Market,
}

impl ContractKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registry => "registry",
            Self::Market => "market",
        }
    }
}

impl std::fmt::Display for ContractKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const REGISTER_SIGNATURE: &str = "Register(address,string,string,string,string)";
pub const ADD_NODE_SIGNATURE: &str = "AddNode(address,uint64,(uint256,uint256,uint64,string),(uint256,uint256,string),(uint256,uint256,uint64),(uint256,uint256,uint64),bool,bool,bool)";
pub const CREATE_ORDER_SIGNATURE: &str =
    "CreateOrder(address,uint64,uint64,uint256,uint256,uint256,uint8)";
pub const WITHDRAW_SIGNATURE: &str = "Withdraw(address,uint256)";

/// One event's signature and parameter layout.
#[derive(Debug, Clone)]
pub struct EventSchema {
    pub kind: EventKind,
    pub signature: &'static str,
    /// keccak256 of `signature`, i.e. the expected topics[0].
    pub fingerprint: String,
    /// The data payload as a parameter tuple.
    pub params: DynSolType,
}

impl EventSchema {
    fn new(kind: EventKind, signature: &'static str, params: Vec<DynSolType>) -> Self {
        Self {
            kind,
            signature,
            fingerprint: keccak256_signature(signature),
            params: DynSolType::Tuple(params),
        }
    }
}

fn uint(bits: usize) -> DynSolType {
    DynSolType::Uint(bits)
}

fn price_pair() -> [DynSolType; 2] {
    [uint(256), uint(256)]
}

/// `(priceMon, priceSec, num)` of memory or disk.
fn capacity_tuple() -> DynSolType {
    let [mon, sec] = price_pair();
    DynSolType::Tuple(vec![mon, sec, uint(64)])
}

fn registry_events() -> Vec<EventSchema> {
    let [cpu_mon, cpu_sec] = price_pair();
    let [gpu_mon, gpu_sec] = price_pair();
    vec![
        EventSchema::new(
            EventKind::Register,
            REGISTER_SIGNATURE,
            vec![
                DynSolType::Address,
                DynSolType::String,
                DynSolType::String,
                DynSolType::String,
                DynSolType::String,
            ],
        ),
        EventSchema::new(
            EventKind::AddNode,
            ADD_NODE_SIGNATURE,
            vec![
                DynSolType::Address,
                uint(64),
                DynSolType::Tuple(vec![cpu_mon, cpu_sec, uint(64), DynSolType::String]),
                DynSolType::Tuple(vec![gpu_mon, gpu_sec, DynSolType::String]),
                capacity_tuple(),
                capacity_tuple(),
                DynSolType::Bool,
                DynSolType::Bool,
                DynSolType::Bool,
            ],
        ),
    ]
}

fn market_events() -> Vec<EventSchema> {
    vec![
        EventSchema::new(
            EventKind::CreateOrder,
            CREATE_ORDER_SIGNATURE,
            vec![
                DynSolType::Address,
                uint(64),
                uint(64),
                uint(256),
                uint(256),
                uint(256),
                uint(8),
            ],
        ),
        EventSchema::new(
            EventKind::Withdraw,
            WITHDRAW_SIGNATURE,
            vec![DynSolType::Address, uint(256)],
        ),
    ]
}

/// The schemas of one contract, indexed by fingerprint.
#[derive(Debug, Clone)]
pub struct ContractSchema {
    pub kind: ContractKind,
    by_fingerprint: HashMap<String, EventSchema>,
}

impl ContractSchema {
    fn new(kind: ContractKind, events: Vec<EventSchema>) -> Self {
        Self {
            kind,
            by_fingerprint: events
                .into_iter()
                .map(|e| (e.fingerprint.clone(), e))
                .collect(),
        }
    }

    pub fn registry() -> Self {
        Self::new(ContractKind::Registry, registry_events())
    }

    pub fn market() -> Self {
        Self::new(ContractKind::Market, market_events())
    }

    pub fn event(&self, fingerprint: &str) -> Option<&EventSchema> {
        self.by_fingerprint.get(fingerprint)
    }

    pub fn events(&self) -> impl Iterator<Item = &EventSchema> {
        self.by_fingerprint.values()
    }
}

/// Known contract addresses and their schemas.
#[derive(Debug, Clone)]
pub struct ContractSet {
    contracts: HashMap<String, ContractSchema>,
}

impl ContractSet {
    pub fn new(registry_address: &str, market_address: &str) -> Self {
        let mut contracts = HashMap::new();
        contracts.insert(normalize_address(registry_address), ContractSchema::registry());
        contracts.insert(normalize_address(market_address), ContractSchema::market());
        Self { contracts }
    }

    /// Schema selector: the contract whose address emitted the log.
    pub fn for_address(&self, address: &str) -> Option<&ContractSchema> {
        self.contracts.get(&normalize_address(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_match_signatures() {
        for contract in [ContractSchema::registry(), ContractSchema::market()] {
            for schema in contract.events() {
                let name = schema.signature.split('(').next().unwrap_or_default();
                assert_eq!(
                    format!("{name}{}", schema.params.sol_type_name()),
                    schema.signature
                );
            }
        }
    }

    #[test]
    fn selects_by_address_case_insensitively() {
        let set = ContractSet::new(
            "0x1111111111111111111111111111111111111111",
            "0x2222222222222222222222222222222222222222",
        );
        let market = set
            .for_address("0x2222222222222222222222222222222222222222")
            .unwrap();
        assert_eq!(market.kind, ContractKind::Market);
        let withdraw = market.event(&keccak256_signature(WITHDRAW_SIGNATURE)).unwrap();
        assert_eq!(withdraw.kind, EventKind::Withdraw);
        assert!(market.event(&keccak256_signature(REGISTER_SIGNATURE)).is_none());
        assert!(set.for_address("0x3333333333333333333333333333333333333333").is_none());
    }
}
