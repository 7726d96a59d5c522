//! gridindex-evm — decodes registry and market logs into typed grid events.
//!
//! Built on alloy-rs `dyn-abi`. The contract that emitted a log selects the
//! schema set; topics[0] selects the event; the data payload is decoded
//! against the event's parameter tuple.

pub mod decoder;
pub mod fingerprint;
pub mod log;
pub mod schema;

pub use decoder::EvmLogDecoder;
pub use log::RawLog;
pub use schema::{ContractKind, ContractSchema, ContractSet, EventSchema};
