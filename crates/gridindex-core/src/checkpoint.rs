//! Checkpoint tracker — persists the last fully projected block height.
//!
//! On restart the ingest driver resumes from `current() + 1` rather than
//! re-projecting from genesis. Heights only move forward; the single way back
//! is an explicit [`CheckpointTracker::reset`].
//!
//! While a block is being projected, the last applied log of that block is
//! kept in a second row (`<key>.log`). A block that failed halfway resumes
//! after that log instead of applying its earlier events a second time.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::ProjectionError;
use crate::store::{Checkpoint, CheckpointStore};

/// Row key of the block-height checkpoint.
pub const CHECKPOINT_KEY: &str = "block_number_key";

/// Height reported when no checkpoint has been stored yet.
pub const GENESIS_HEIGHT: u64 = 0;

/// Position of the last applied log in a partly projected block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogCursor {
    pub block_number: u64,
    pub log_index: u32,
}

/// Reads and advances the block-height checkpoint.
#[derive(Clone)]
pub struct CheckpointTracker {
    store: Arc<dyn CheckpointStore>,
    key: String,
}

impl CheckpointTracker {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self::with_key(store, CHECKPOINT_KEY)
    }

    /// Track a checkpoint under a custom row key (one per ingest stream).
    pub fn with_key(store: Arc<dyn CheckpointStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The stored height, or [`GENESIS_HEIGHT`] if nothing has been stored.
    pub async fn current(&self) -> Result<u64, ProjectionError> {
        Ok(self
            .store
            .load(&self.key)
            .await?
            .map(|cp| cp.block_number)
            .unwrap_or(GENESIS_HEIGHT))
    }

    /// The stored height, if any.
    pub async fn stored(&self) -> Result<Option<u64>, ProjectionError> {
        Ok(self.store.load(&self.key).await?.map(|cp| cp.block_number))
    }

    /// Record that every event up to and including `height` is projected.
    ///
    /// Fails with `NotMonotonic` if `height` is below the stored value.
    /// Re-advancing to the current height is accepted.
    pub async fn advance(&self, height: u64) -> Result<(), ProjectionError> {
        let current = self.current().await?;
        if height < current {
            return Err(ProjectionError::NotMonotonic {
                current,
                attempted: height,
            });
        }
        self.save(height).await?;
        self.store.delete(&self.progress_key()).await?;
        debug!(key = %self.key, block = height, "checkpoint advanced");
        Ok(())
    }

    /// The last applied log of a block that has not been fully projected.
    pub async fn in_progress(&self) -> Result<Option<LogCursor>, ProjectionError> {
        let row = self.store.load(&self.progress_key()).await?;
        Ok(row.and_then(|cp| {
            cp.log_index.map(|log_index| LogCursor {
                block_number: cp.block_number,
                log_index,
            })
        }))
    }

    /// Record that the log at `log_index` of block `height` was applied.
    ///
    /// Fails with `NotMonotonic` if `height` is already fully projected.
    pub async fn record_log(&self, height: u64, log_index: u32) -> Result<(), ProjectionError> {
        if let Some(current) = self.stored().await? {
            if height <= current {
                return Err(ProjectionError::NotMonotonic {
                    current,
                    attempted: height,
                });
            }
        }
        self.store
            .save(Checkpoint {
                key: self.progress_key(),
                block_number: height,
                updated_at: chrono::Utc::now().timestamp(),
                log_index: Some(log_index),
            })
            .await
    }

    /// Operator override: move the checkpoint to `height` unconditionally.
    pub async fn reset(&self, height: u64) -> Result<(), ProjectionError> {
        let previous = self.current().await?;
        self.save(height).await?;
        self.store.delete(&self.progress_key()).await?;
        warn!(key = %self.key, previous, block = height, "checkpoint reset");
        Ok(())
    }

    /// Forget the checkpoint entirely (full resync from genesis).
    pub async fn clear(&self) -> Result<(), ProjectionError> {
        self.store.delete(&self.key).await?;
        self.store.delete(&self.progress_key()).await?;
        warn!(key = %self.key, "checkpoint cleared");
        Ok(())
    }

    fn progress_key(&self) -> String {
        format!("{}.log", self.key)
    }

    async fn save(&self, height: u64) -> Result<(), ProjectionError> {
        self.store
            .save(Checkpoint {
                key: self.key.clone(),
                block_number: height,
                updated_at: chrono::Utc::now().timestamp(),
                log_index: None,
            })
            .await
    }
}
