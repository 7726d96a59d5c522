//! `EvmLogDecoder` — turns registry and market logs into [`GridEvent`]s.

use alloy_core::dyn_abi::DynSolValue;
use alloy_primitives::U256;
use tracing::trace;

use gridindex_core::entity::{normalize_address, CapacitySpec, CpuSpec, GpuSpec};
use gridindex_core::error::DecodeError;
use gridindex_core::event::{
    AddNodeEvent, CreateOrderEvent, EventContext, EventKind, GridEvent, RegisterEvent,
    WithdrawEvent,
};
use gridindex_core::ingest::LogDecoder;

use crate::fingerprint;
use crate::log::RawLog;
use crate::schema::{ContractSet, EventSchema};

/// Decoder for the registry and market contracts on one chain.
#[derive(Debug, Clone)]
pub struct EvmLogDecoder {
    chain: String,
    contracts: ContractSet,
}

impl EvmLogDecoder {
    pub fn new(chain: impl Into<String>, contracts: ContractSet) -> Self {
        Self {
            chain: chain.into(),
            contracts,
        }
    }

    /// Resolve the schema a log should be decoded with.
    pub fn schema_for(&self, log: &RawLog) -> Result<&EventSchema, DecodeError> {
        let contract =
            self.contracts
                .for_address(&log.address)
                .ok_or_else(|| DecodeError::UnknownContract {
                    address: log.address.clone(),
                })?;
        let fp = fingerprint::from_topics(&log.topics).ok_or_else(|| {
            DecodeError::InvalidRawLog {
                reason: "missing or malformed topics[0]".into(),
            }
        })?;
        contract
            .event(&fp)
            .ok_or_else(|| DecodeError::UnknownEvent {
                contract: contract.kind.to_string(),
                fingerprint: fp,
            })
    }

    pub fn decode_log(&self, log: &RawLog) -> Result<GridEvent, DecodeError> {
        if log.is_removed() {
            return Err(DecodeError::InvalidRawLog {
                reason: "log was removed by a reorg".into(),
            });
        }
        log.block_number_u64()?;
        log.log_index_u32()?;

        let schema = self.schema_for(log)?;
        let data = log.data_bytes()?;
        let event = schema.kind.as_str();
        let decoded = schema
            .params
            .abi_decode_params(&data)
            .map_err(|e| DecodeError::AbiDecodeFailed {
                event: event.to_string(),
                reason: e.to_string(),
            })?;
        let values = match decoded {
            DynSolValue::Tuple(vals) => vals,
            other => vec![other],
        };
        let f = Fields { event, values: &values };
        trace!(event, tx = %log.tx_hash, "decoding log");

        match schema.kind {
            EventKind::Register => Ok(GridEvent::Register(RegisterEvent {
                provider: f.address(0, "cp")?,
                name: f.string(1, "name")?,
                ip: f.string(2, "ip")?,
                domain: f.string(3, "domain")?,
                port: f.string(4, "port")?,
            })),
            EventKind::AddNode => {
                let cpu = f.tuple(2, "cpu")?;
                let gpu = f.tuple(3, "gpu")?;
                let mem = f.tuple(4, "mem")?;
                let disk = f.tuple(5, "disk")?;
                Ok(GridEvent::AddNode(AddNodeEvent {
                    provider: f.address(0, "cp")?,
                    node_id: f.u64(1, "id")?,
                    cpu: CpuSpec {
                        price_mon: cpu.uint(0, "cpu.priceMon")?,
                        price_sec: cpu.uint(1, "cpu.priceSec")?,
                        core: cpu.u64(2, "cpu.core")?,
                        model: cpu.string(3, "cpu.model")?,
                    },
                    gpu: GpuSpec {
                        price_mon: gpu.uint(0, "gpu.priceMon")?,
                        price_sec: gpu.uint(1, "gpu.priceSec")?,
                        model: gpu.string(2, "gpu.model")?,
                    },
                    mem: capacity(&mem, "mem")?,
                    disk: capacity(&disk, "disk")?,
                    exist: f.boolean(6, "exist")?,
                    sold: f.boolean(7, "sold")?,
                    avail: f.boolean(8, "avail")?,
                }))
            }
            EventKind::CreateOrder => {
                let user = log
                    .from
                    .as_deref()
                    .filter(|s| !s.is_empty())
                    .map(normalize_address)
                    .ok_or_else(|| DecodeError::MissingField {
                        field: "sender".into(),
                    })?;
                Ok(GridEvent::CreateOrder(CreateOrderEvent {
                    provider: f.address(0, "cp")?,
                    order_id: f.u64(1, "id")?,
                    node_id: f.u64(2, "nid")?,
                    activate_time: f.uint(3, "act")?,
                    probation: f.uint(4, "pro")?,
                    duration: f.uint(5, "dur")?,
                    status: f.u8(6, "status")?,
                    user,
                }))
            }
            EventKind::Withdraw => Ok(GridEvent::Withdraw(WithdrawEvent {
                provider: f.address(0, "cp")?,
                amount: f.uint(1, "amount")?,
            })),
            other => Err(DecodeError::InvalidRawLog {
                reason: format!("{other} is not a contract event"),
            }),
        }
    }
}

impl LogDecoder for EvmLogDecoder {
    type Log = RawLog;

    fn decode(&self, log: &RawLog) -> Result<GridEvent, DecodeError> {
        self.decode_log(log)
    }

    fn context(&self, log: &RawLog) -> EventContext {
        EventContext {
            chain: self.chain.clone(),
            block_number: log.block_number_u64().unwrap_or_default(),
            block_timestamp: log.block_timestamp_secs(),
            log_index: log.log_index_u32().unwrap_or_default(),
            tx_hash: log.tx_hash.clone(),
        }
    }
}

fn capacity(f: &Fields<'_>, name: &str) -> Result<CapacitySpec, DecodeError> {
    Ok(CapacitySpec {
        price_mon: f.uint(0, &format!("{name}.priceMon"))?,
        price_sec: f.uint(1, &format!("{name}.priceSec"))?,
        capacity: f.u64(2, &format!("{name}.num"))?,
    })
}

/// Positional accessor over a decoded parameter tuple.
struct Fields<'a> {
    event: &'static str,
    values: &'a [DynSolValue],
}

impl<'a> Fields<'a> {
    fn get(&self, i: usize, field: &str) -> Result<&'a DynSolValue, DecodeError> {
        self.values.get(i).ok_or_else(|| DecodeError::MissingField {
            field: format!("{}.{field}", self.event),
        })
    }

    fn mismatch(&self, field: &str, expected: &str) -> DecodeError {
        DecodeError::TypeMismatch {
            event: self.event.to_string(),
            field: field.to_string(),
            expected: expected.to_string(),
        }
    }

    fn address(&self, i: usize, field: &str) -> Result<String, DecodeError> {
        match self.get(i, field)? {
            DynSolValue::Address(a) => Ok(format!("0x{}", hex::encode(a.as_slice()))),
            _ => Err(self.mismatch(field, "address")),
        }
    }

    fn uint(&self, i: usize, field: &str) -> Result<U256, DecodeError> {
        match self.get(i, field)? {
            DynSolValue::Uint(v, _) => Ok(*v),
            _ => Err(self.mismatch(field, "uint")),
        }
    }

    fn u64(&self, i: usize, field: &str) -> Result<u64, DecodeError> {
        let v = self.uint(i, field)?;
        u64::try_from(v).map_err(|_| self.mismatch(field, "uint64"))
    }

    fn u8(&self, i: usize, field: &str) -> Result<u8, DecodeError> {
        let v = self.uint(i, field)?;
        u8::try_from(v).map_err(|_| self.mismatch(field, "uint8"))
    }

    fn string(&self, i: usize, field: &str) -> Result<String, DecodeError> {
        match self.get(i, field)? {
            DynSolValue::String(s) => Ok(s.clone()),
            _ => Err(self.mismatch(field, "string")),
        }
    }

    fn boolean(&self, i: usize, field: &str) -> Result<bool, DecodeError> {
        match self.get(i, field)? {
            DynSolValue::Bool(b) => Ok(*b),
            _ => Err(self.mismatch(field, "bool")),
        }
    }

    fn tuple(&self, i: usize, field: &str) -> Result<Fields<'a>, DecodeError> {
        match self.get(i, field)? {
            DynSolValue::Tuple(values) => Ok(Fields {
                event: self.event,
                values,
            }),
            _ => Err(self.mismatch(field, "tuple")),
        }
    }
}
