//! Raw EVM log records as delivered by the chain-connectivity layer.

use serde::{Deserialize, Serialize};

use gridindex_core::error::DecodeError;

/// A raw EVM log in `eth_getLogs` shape.
///
/// `from` is the sender of the emitting transaction. It is not part of the
/// `eth_getLogs` response; the fetcher attaches it from the transaction so
/// order-creation events can name the paying user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    #[serde(rename = "data")]
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "blockHash", default)]
    pub block_hash: String,
    #[serde(rename = "blockTimestamp", default, skip_serializing_if = "Option::is_none")]
    pub block_timestamp: Option<String>,
    #[serde(rename = "transactionHash", default)]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    #[serde(rename = "removed", default)]
    pub removed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl RawLog {
    /// Returns the block number as u64.
    pub fn block_number_u64(&self) -> Result<u64, DecodeError> {
        parse_hex_u64(&self.block_number).map_err(|reason| DecodeError::InvalidRawLog {
            reason: format!("blockNumber: {reason}"),
        })
    }

    /// Returns the log index as u32.
    pub fn log_index_u32(&self) -> Result<u32, DecodeError> {
        parse_hex_u64(&self.log_index)
            .and_then(|v| u32::try_from(v).map_err(|_| format!("{v} exceeds u32")))
            .map_err(|reason| DecodeError::InvalidRawLog {
                reason: format!("logIndex: {reason}"),
            })
    }

    /// Block timestamp in unix seconds, `0` if absent or malformed.
    pub fn block_timestamp_secs(&self) -> i64 {
        self.block_timestamp
            .as_deref()
            .and_then(|t| parse_hex_u64(t).ok())
            .and_then(|t| i64::try_from(t).ok())
            .unwrap_or(0)
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }

    /// The `data` payload as bytes.
    pub fn data_bytes(&self) -> Result<Vec<u8>, DecodeError> {
        let hex = self.data.strip_prefix("0x").unwrap_or(&self.data);
        hex::decode(hex).map_err(|e| DecodeError::InvalidRawLog {
            reason: format!("invalid data hex: {e}"),
        })
    }
}

/// Parse a `0x`-prefixed (or bare) hex quantity.
pub fn parse_hex_u64(s: &str) -> Result<u64, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return Err("empty quantity".into());
    }
    u64::from_str_radix(digits, 16).map_err(|e| format!("{s:?}: {e}"))
}
