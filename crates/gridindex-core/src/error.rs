//! Error types for the projection pipeline.

use thiserror::Error;

/// Errors raised while turning a raw log into a typed event.
///
/// A decode failure drops the log: the upstream stream is append-only, so
/// retrying the same bytes can never succeed.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("log emitted by unknown contract {address}")]
    UnknownContract { address: String },

    #[error("no event with signature {fingerprint} in the {contract} schema")]
    UnknownEvent { contract: String, fingerprint: String },

    #[error("ABI decode of {event} failed: {reason}")]
    AbiDecodeFailed { event: String, reason: String },

    #[error("field '{field}' of {event}: expected {expected}")]
    TypeMismatch {
        event: String,
        field: String,
        expected: String,
    },

    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("invalid raw log: {reason}")]
    InvalidRawLog { reason: String },
}

/// Errors raised by the entity store, the projection handlers, the sweeper
/// and the checkpoint tracker.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("{entity} {key} already exists")]
    DuplicateEntity { entity: &'static str, key: String },

    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },

    #[error("provider {provider} balance {balance} is less than withdrawal {requested}")]
    InsufficientBalance {
        provider: String,
        balance: String,
        requested: String,
    },

    #[error("checkpoint regression: stored {current}, attempted {attempted}")]
    NotMonotonic { current: u64, attempted: u64 },

    #[error("corrupt {field} on {entity} {key}: {value:?}")]
    CorruptState {
        entity: &'static str,
        key: String,
        field: &'static str,
        value: String,
    },

    #[error("order {order_id} cannot move from status {from} to {to}")]
    InvalidStatusTransition { order_id: u64, from: u8, to: u8 },

    #[error("arithmetic overflow computing {context}")]
    Overflow { context: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Other(String),
}

impl ProjectionError {
    /// Returns `true` for errors that only affect the row being processed.
    ///
    /// The sweeper and the ingest driver keep going past these.
    pub fn is_row_local(&self) -> bool {
        matches!(
            self,
            Self::CorruptState { .. }
                | Self::NotFound { .. }
                | Self::DuplicateEntity { .. }
                | Self::InvalidStatusTransition { .. }
                | Self::Overflow { .. }
        )
    }

    /// Short, stable name used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::DuplicateEntity { .. } => "duplicate_entity",
            Self::NotFound { .. } => "not_found",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::NotMonotonic { .. } => "not_monotonic",
            Self::CorruptState { .. } => "corrupt_state",
            Self::InvalidStatusTransition { .. } => "invalid_status_transition",
            Self::Overflow { .. } => "overflow",
            Self::Storage(_) => "storage",
            Self::Other(_) => "other",
        }
    }
}

/// A handler failure, annotated with enough context to triage or replay it.
#[derive(Debug, Error)]
#[error("{event} [{key}] at block {block_number} log {log_index}: {source}")]
pub struct ApplyError {
    /// Event kind, e.g. `"CreateOrder"`.
    pub event: &'static str,
    /// Natural key fields of the event, e.g. `"provider=0x.. order=7"`.
    pub key: String,
    pub block_number: u64,
    pub log_index: u32,
    #[source]
    pub source: ProjectionError,
}

/// Errors from the ingest driver.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A handler failed; the checkpoint stays below this block.
    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),
}
