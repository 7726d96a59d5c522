//! GridIndex CLI — projects grid compute contract events into queryable state.
//!
//! # Commands
//! ```text
//! gridindex status
//! gridindex decode-log  --file <logs.json>
//! gridindex ingest      --file <logs.json>
//! gridindex sweep       [--provider <addr>] [--watch]
//! gridindex checkpoint  show|reset --height <N>|clear
//! gridindex info
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use gridindex_core::{
    CheckpointStore, CheckpointTracker, EntityStore, GridIndexConfig, LifecycleSweeper,
    MetricsRecorder, ProjectionEngine, ProviderLocks, SweepScope,
};
use gridindex_evm::{ContractSet, EvmLogDecoder, RawLog};
use gridindex_storage::SqliteStore;

mod cmd_ingest;
mod cmd_sweep;
mod logging;

#[derive(Parser)]
#[command(
    name = "gridindex",
    about = "Event-to-state projection for grid compute contracts",
    long_about = "
GridIndex CLI: decode registry and market logs, project them into a SQLite
database, settle expired orders and inspect the result.

Logs are read from JSON files in eth_getLogs shape (a single object or an
array). Set RUST_LOG to override the configured log filter.
",
    version
)]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, global = true, default_value = "gridindex.yaml")]
    config: String,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show global counters, checkpoint and metrics
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Decode logs without touching the database
    #[command(name = "decode-log")]
    DecodeLog {
        /// JSON file with one log or an array of logs
        #[arg(short, long)]
        file: String,
    },

    /// Decode and project logs, advancing the checkpoint per block
    Ingest {
        /// JSON file with one log or an array of logs
        #[arg(short, long)]
        file: String,
        /// Output block reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Complete orders whose window has closed
    Sweep {
        /// Only settle this provider's orders
        #[arg(long)]
        provider: Option<String>,
        /// Keep sweeping every `sweep_interval_secs` until Ctrl-C
        #[arg(long)]
        watch: bool,
        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect or move the block checkpoint
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Show build info and known event signatures
    Info,
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print the stored checkpoint
    Show,
    /// Force the checkpoint to a height (may move backwards)
    Reset {
        #[arg(long)]
        height: u64,
    },
    /// Delete the checkpoint; the next ingest starts from genesis
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Info = cli.command {
        return cmd_info();
    }

    let mut config = load_config(&cli.config)?;
    if cli.verbose {
        config.log.level = "debug".into();
    }
    logging::init_tracing(&config.log);

    match cli.command {
        Commands::Status { json } => cmd_status(&config, json).await,
        Commands::DecodeLog { file } => cmd_decode_log(&config, &file),
        Commands::Ingest { file, json } => cmd_ingest::run(&config, &file, json).await,
        Commands::Sweep {
            provider,
            watch,
            json,
        } => {
            let scope = provider.map(SweepScope::provider).unwrap_or_default();
            cmd_sweep::run(&config, scope, watch, json).await
        }
        Commands::Checkpoint { action } => cmd_checkpoint(&config, action).await,
        Commands::Info => cmd_info(),
    }
}

// ─── Shared setup ────────────────────────────────────────────────────────────

fn load_config(path: &str) -> Result<GridIndexConfig> {
    GridIndexConfig::load(path).with_context(|| format!("load config '{path}'"))
}

/// Everything a command needs to read or write projected state.
pub(crate) struct Runtime {
    pub store: Arc<SqliteStore>,
    pub engine: ProjectionEngine,
    pub sweeper: LifecycleSweeper,
    pub checkpoint: CheckpointTracker,
    pub metrics: MetricsRecorder,
}

impl Runtime {
    pub async fn open(config: &GridIndexConfig) -> Result<Self> {
        let store = Arc::new(
            SqliteStore::open(&config.database)
                .await
                .with_context(|| format!("open database '{}'", config.database))?,
        );
        let locks = ProviderLocks::new();
        let metrics = MetricsRecorder::new();
        let engine = ProjectionEngine::with_locks(store.clone(), locks.clone())
            .with_metrics(metrics.clone());
        let sweeper =
            LifecycleSweeper::with_locks(store.clone(), locks).with_metrics(metrics.clone());
        let checkpoint = CheckpointTracker::with_key(
            store.clone() as Arc<dyn CheckpointStore>,
            config.checkpoint_key.clone(),
        );
        Ok(Self {
            store,
            engine,
            sweeper,
            checkpoint,
            metrics,
        })
    }
}

pub(crate) fn decoder(config: &GridIndexConfig) -> EvmLogDecoder {
    EvmLogDecoder::new(
        config.chain.clone(),
        ContractSet::new(&config.registry_address, &config.market_address),
    )
}

/// Read a JSON file holding either one log object or an array of them.
pub(crate) fn read_logs(file: &str) -> Result<Vec<RawLog>> {
    let content = std::fs::read_to_string(Path::new(file))
        .with_context(|| format!("read log file '{file}'"))?;
    let value: serde_json::Value =
        serde_json::from_str(&content).with_context(|| format!("parse JSON in '{file}'"))?;
    let logs = if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|log: RawLog| vec![log])
    }
    .with_context(|| format!("'{file}' is not in eth_getLogs shape"))?;
    Ok(logs)
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn cmd_status(config: &GridIndexConfig, as_json: bool) -> Result<()> {
    let rt = Runtime::open(config).await?;
    let counters = rt.store.global_counters().await?;
    let checkpoint = rt.checkpoint.stored().await?;
    let now = chrono::Utc::now().timestamp();
    let live = rt.store.active_orders(now).await?.len();
    let expired = rt.store.expired_order_ids(None, now).await?.len();

    if as_json {
        let status = serde_json::json!({
            "chain": config.chain,
            "database": config.database,
            "checkpoint": checkpoint,
            "counters": counters,
            "active_orders": live,
            "expired_orders": expired,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Chain:       {}", config.chain);
    println!("Database:    {}", config.database);
    match checkpoint {
        Some(h) => println!("Checkpoint:  {h}"),
        None => println!("Checkpoint:  none (starts at genesis)"),
    }
    println!("Orders:      {} created, {live} active, {expired} awaiting sweep", counters.cp_num);
    println!(
        "Nodes:       {} / {} sold",
        counters.node_used, counters.node_global
    );
    println!("Memory:      {} / {} used", counters.mem_used, counters.mem_global);
    println!("Disk:        {} / {} used", counters.disk_used, counters.disk_global);
    Ok(())
}

fn cmd_decode_log(config: &GridIndexConfig, file: &str) -> Result<()> {
    let decoder = decoder(config);
    let logs = read_logs(file)?;
    let mut failed = 0usize;
    for log in &logs {
        match decoder.decode_log(log) {
            Ok(event) => println!("{}", serde_json::to_string(&event)?),
            Err(e) => {
                failed += 1;
                eprintln!(
                    "✗ block {} log {} tx {}: {e}",
                    log.block_number, log.log_index, log.tx_hash
                );
            }
        }
    }
    eprintln!("{} decoded, {failed} failed", logs.len() - failed);
    Ok(())
}

async fn cmd_checkpoint(config: &GridIndexConfig, action: CheckpointAction) -> Result<()> {
    let rt = Runtime::open(config).await?;
    match action {
        CheckpointAction::Show => match rt.checkpoint.stored().await? {
            Some(h) => println!("{}: {h}", rt.checkpoint.key()),
            None => println!("{}: none", rt.checkpoint.key()),
        },
        CheckpointAction::Reset { height } => {
            rt.checkpoint.reset(height).await?;
            println!("{} reset to {height}", rt.checkpoint.key());
        }
        CheckpointAction::Clear => {
            rt.checkpoint.clear().await?;
            println!("{} cleared", rt.checkpoint.key());
        }
    }
    Ok(())
}

fn cmd_info() -> Result<()> {
    use gridindex_evm::ContractSchema;

    println!("GridIndex v{}", env!("CARGO_PKG_VERSION"));
    println!();
    for contract in [ContractSchema::registry(), ContractSchema::market()] {
        println!("{} events:", contract.kind);
        let mut events: Vec<_> = contract.events().collect();
        events.sort_by_key(|e| e.signature);
        for e in events {
            println!("  {:12} {}", e.kind.as_str(), e.fingerprint);
            println!("  {:12} {}", "", e.signature);
        }
    }
    println!();
    println!("Storage:     SQLite (sqlx), one transaction per unit of work");
    println!("Decoding:    alloy dyn-abi, schema selected by emitting contract");
    Ok(())
}
