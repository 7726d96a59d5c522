//! gridindex-storage — persistent storage backends for GridIndex.
//!
//! Backends:
//! - [`InMemoryStore`] — re-exported from `gridindex-core` (dev/testing, no persistence)
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use gridindex_core::memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
