//! `gridindex ingest` — project a file of logs block by block.

use anyhow::{Context, Result};
use gridindex_core::{GridIndexConfig, Ingestor};

use crate::{decoder, read_logs, Runtime};

pub async fn run(config: &GridIndexConfig, file: &str, as_json: bool) -> Result<()> {
    let logs = read_logs(file)?;
    let rt = Runtime::open(config).await?;
    let ingestor = Ingestor::new(decoder(config), rt.engine, rt.checkpoint);

    let reports = ingestor
        .process_logs(&logs)
        .await
        .with_context(|| format!("ingest '{file}'"))?;
    let metrics = rt.metrics.snapshot();

    if as_json {
        let out = serde_json::json!({ "blocks": reports, "metrics": metrics });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    for r in &reports {
        if r.skipped {
            println!("  - block {:>10}  skipped (at or below checkpoint)", r.height);
        } else if r.replayed > 0 {
            println!(
                "  ✓ block {:>10}  {} applied, {} dropped, {} already applied",
                r.height, r.applied, r.dropped, r.replayed
            );
        } else {
            println!(
                "  ✓ block {:>10}  {} applied, {} dropped",
                r.height, r.applied, r.dropped
            );
        }
    }
    println!();
    println!("Logs:        {}", logs.len());
    println!("Applied:     {}", metrics.events_applied);
    println!("Dropped:     {}", metrics.logs_dropped);
    println!("Checkpoint:  {}", ingestor.checkpoint().current().await?);
    Ok(())
}
