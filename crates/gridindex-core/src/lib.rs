//! gridindex-core — event-to-state projection for grid compute contracts.
//!
//! # Architecture
//!
//! ```text
//! raw log → LogDecoder → GridEvent → ProjectionEngine → EntityStore
//!                                        │                 ├── providers / nodes / orders
//!                                        │                 ├── profit ledger
//!                                        │                 └── global counters
//!                                        └── Ingestor ──→ CheckpointTracker
//!
//! timer / on demand → LifecycleSweeper → EntityStore (expire orders, release nodes)
//! ```
//!
//! Storage backends: [`memory::InMemoryStore`] here, SQLite in
//! `gridindex-storage`. Log decoding for EVM contracts lives in
//! `gridindex-evm`.

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod event;
pub mod handler;
pub mod handlers;
pub mod ingest;
pub mod locks;
pub mod memory;
pub mod metrics;
pub mod store;
pub mod sweeper;

#[cfg(test)]
pub(crate) mod testing;

pub use checkpoint::{CheckpointTracker, LogCursor, CHECKPOINT_KEY, GENESIS_HEIGHT};
pub use config::{ConfigBuilder, ConfigError, GridIndexConfig, LogConfig};
pub use engine::ProjectionEngine;
pub use entity::{
    GlobalCounters, Node, NodeFlag, NodeKey, Order, OrderStatus, ProfitEntry, Provider,
};
pub use error::{ApplyError, DecodeError, IngestError, ProjectionError};
pub use event::{EventContext, EventKind, GridEvent};
pub use handler::{EventHandler, HandlerRegistry};
pub use ingest::{BlockReport, Ingestor, LogDecoder};
pub use locks::ProviderLocks;
pub use memory::InMemoryStore;
pub use metrics::{MetricsRecorder, ProjectionMetrics};
pub use store::{Checkpoint, CheckpointStore, Completion, EntityStore, OrderCreated};
pub use sweeper::{LifecycleSweeper, SweepReport, SweepScope, SweeperHandle};
