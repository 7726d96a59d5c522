//! Ingest driver: decode → project → advance the checkpoint, one block at a time.
//!
//! Logs are applied in the order they are given, which must be block order
//! and in-block log order. A log that fails to decode is logged and dropped;
//! the upstream stream is append-only, so it is never retried. A handler
//! failure stops the block and leaves the checkpoint below it.
//!
//! Each applied log is recorded on the checkpoint tracker as it lands. When a
//! failed block is processed again, logs up to the recorded one are counted
//! as replayed and not applied a second time.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointTracker;
use crate::engine::ProjectionEngine;
use crate::error::{DecodeError, IngestError};
use crate::event::{EventContext, GridEvent};
use crate::metrics::MetricsRecorder;

/// Turns an upstream log record into a typed event.
pub trait LogDecoder: Send + Sync {
    type Log: Send + Sync;

    fn decode(&self, log: &Self::Log) -> Result<GridEvent, DecodeError>;

    /// Position of the log in the chain.
    fn context(&self, log: &Self::Log) -> EventContext;
}

/// What happened to one block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BlockReport {
    pub height: u64,
    pub applied: usize,
    pub dropped: usize,
    /// Logs an earlier, interrupted attempt at this block already applied.
    pub replayed: usize,
    /// The block was at or below the checkpoint and was not re-projected.
    pub skipped: bool,
}

pub struct Ingestor<D> {
    decoder: D,
    engine: ProjectionEngine,
    checkpoint: CheckpointTracker,
    metrics: MetricsRecorder,
}

impl<D: LogDecoder> Ingestor<D> {
    pub fn new(decoder: D, engine: ProjectionEngine, checkpoint: CheckpointTracker) -> Self {
        let metrics = engine.metrics().clone();
        Self {
            decoder,
            engine,
            checkpoint,
            metrics,
        }
    }

    pub fn engine(&self) -> &ProjectionEngine {
        &self.engine
    }

    pub fn checkpoint(&self) -> &CheckpointTracker {
        &self.checkpoint
    }

    /// Project every log of block `height`, then advance the checkpoint.
    ///
    /// `block_timestamp` (unix seconds, `0` if unknown) is stamped on each
    /// event context.
    pub async fn process_block(
        &self,
        height: u64,
        block_timestamp: i64,
        logs: &[D::Log],
    ) -> Result<BlockReport, IngestError> {
        let mut report = BlockReport {
            height,
            ..Default::default()
        };
        if let Some(current) = self.checkpoint.stored().await? {
            if height <= current {
                debug!(block = height, checkpoint = current, "block already projected");
                report.skipped = true;
                return Ok(report);
            }
        }

        let resume = self
            .checkpoint
            .in_progress()
            .await?
            .filter(|cursor| cursor.block_number == height)
            .map(|cursor| cursor.log_index);
        if let Some(last) = resume {
            debug!(block = height, log_index = last, "resuming partly projected block");
        }

        for log in logs {
            let mut ctx = self.decoder.context(log);
            ctx.block_number = height;
            if block_timestamp > 0 {
                ctx.block_timestamp = block_timestamp;
            }
            if resume.is_some_and(|last| ctx.log_index <= last) {
                report.replayed += 1;
                continue;
            }
            let event = match self.decoder.decode(log) {
                Ok(event) => event,
                Err(e) => {
                    warn!(
                        block = height,
                        log_index = ctx.log_index,
                        tx = %ctx.tx_hash,
                        error = %e,
                        "dropping undecodable log"
                    );
                    self.metrics.log_dropped();
                    report.dropped += 1;
                    continue;
                }
            };
            self.engine.apply(&event, &ctx).await?;
            self.checkpoint.record_log(height, ctx.log_index).await?;
            report.applied += 1;
        }

        self.checkpoint.advance(height).await?;
        self.metrics.block_processed();
        if report.applied > 0 || report.dropped > 0 {
            info!(
                block = height,
                applied = report.applied,
                dropped = report.dropped,
                replayed = report.replayed,
                "block projected"
            );
        }
        Ok(report)
    }

    /// Split `logs` into runs of equal block number and process each run.
    ///
    /// Stops at the first failing block.
    pub async fn process_logs(&self, logs: &[D::Log]) -> Result<Vec<BlockReport>, IngestError> {
        let mut reports = Vec::new();
        let mut start = 0;
        while start < logs.len() {
            let ctx = self.decoder.context(&logs[start]);
            let height = ctx.block_number;
            let end = logs[start..]
                .iter()
                .position(|l| self.decoder.context(l).block_number != height)
                .map_or(logs.len(), |offset| start + offset);
            reports.push(
                self.process_block(height, ctx.block_timestamp, &logs[start..end])
                    .await?,
            );
            start = end;
        }
        Ok(reports)
    }
}
