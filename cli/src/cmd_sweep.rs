//! `gridindex sweep` — settle expired orders once or on an interval.

use std::time::Duration;

use anyhow::Result;
use gridindex_core::{GridIndexConfig, SweepReport, SweepScope};
use tracing::info;

use crate::Runtime;

pub async fn run(
    config: &GridIndexConfig,
    scope: SweepScope,
    watch: bool,
    as_json: bool,
) -> Result<()> {
    let rt = Runtime::open(config).await?;

    if watch {
        let period = Duration::from_secs(config.sweep_interval_secs);
        let handle = rt.sweeper.spawn(scope, period);
        tokio::signal::ctrl_c().await?;
        info!("ctrl-c received, stopping sweeper");
        handle.shutdown().await;
        print_totals(&rt.metrics.snapshot());
        return Ok(());
    }

    let report = rt.sweeper.sweep(&scope).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if !report.is_clean() {
        anyhow::bail!("{} orders could not be settled", report.failures.len());
    }
    Ok(())
}

fn print_report(report: &SweepReport) {
    println!("Swept at:    {}", report.now);
    println!("Expired:     {}", report.examined);
    println!("Completed:   {}", report.completed);
    println!("Released:    {} nodes", report.released_nodes);
    for f in &report.failures {
        eprintln!("  ✗ order {} [{}]: {}", f.order_id, f.kind, f.message);
    }
}

fn print_totals(metrics: &gridindex_core::ProjectionMetrics) {
    println!("Sweeps:      {}", metrics.sweeps_run);
    println!("Completed:   {}", metrics.orders_completed);
    println!("Released:    {} nodes", metrics.nodes_released);
    println!("Failures:    {}", metrics.sweep_failures);
}
