//! chainledger — reorg-aware event ingestion daemon and operator CLI.
//!
//! Usage:
//! ```bash
//! chainledger run      --config chainledger.yaml
//! chainledger status   --config chainledger.yaml
//! chainledger backfill --config chainledger.yaml --contract 0xA0b8... --block 19000000
//! chainledger check    --config chainledger.yaml
//! chainledger info
//! ```

mod admin;
mod config;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use chainledger_evm::{CheckpointSummary, Indexer, IndexerBuilder};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(
    name = "chainledger",
    version,
    about = "Reorg-aware blockchain event ingestion",
    long_about = "ChainLedger follows contract events on an EVM chain, persists them \
                  exactly once and repairs its state when the chain reorganizes.\n\n\
                  ENV VARS:\n  \
                  CHAINLEDGER_RPC_URL       overrides rpcUrl from the config file\n  \
                  CHAINLEDGER_DATABASE_URL  overrides databaseUrl from the config file\n  \
                  RUST_LOG                  overrides the logging section"
)]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, global = true, default_value = "chainledger.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the indexer and the admin HTTP server until Ctrl-C
    Run {
        /// Do not start the admin HTTP server
        #[arg(long)]
        no_admin: bool,
    },

    /// Print node head and per-subscription checkpoints as JSON
    Status,

    /// Rewind every checkpoint of a contract so ingestion restarts at a block
    Backfill {
        /// Contract address
        #[arg(long)]
        contract: String,
        /// First block to re-ingest
        #[arg(long)]
        block: u64,
        /// Abandon everything stored from --block on and reset the block
        /// ledger (recovery after an unresolvable divergence)
        #[arg(long)]
        reset_ledger: bool,
    },

    /// Verify that stored events, counters and divergence records agree
    Check,

    /// Show build and capability info
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Info = cli.command {
        cmd_info();
        return Ok(());
    }

    let config = AppConfig::load(&cli.config)?;
    logging::init_tracing(&config.logging);
    let indexer = build_indexer(&config).await?;

    match cli.command {
        Commands::Run { no_admin } => cmd_run(&config, indexer, no_admin).await,
        Commands::Status => cmd_status(&indexer).await,
        Commands::Backfill { contract, block, reset_ledger } => {
            cmd_backfill(&indexer, &contract, block, reset_ledger).await
        }
        Commands::Check => cmd_check(&indexer).await,
        Commands::Info => {
            cmd_info();
            Ok(())
        }
    }
}

async fn build_indexer(config: &AppConfig) -> Result<Arc<Indexer>> {
    let store = config.open_store().await?;
    let indexer = IndexerBuilder::from_config(config.indexer.clone())
        .store(store)
        .build()
        .context("invalid indexer configuration")?;
    Ok(Arc::new(indexer))
}

async fn cmd_run(config: &AppConfig, indexer: Arc<Indexer>, no_admin: bool) -> Result<()> {
    indexer.start().await.context("failed to start indexer")?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl-C");
        }
        tracing::info!("shutdown requested");
    };
    let served = if no_admin {
        shutdown.await;
        Ok(())
    } else {
        admin::serve(&config.admin_listen, indexer.clone(), shutdown).await
    };

    indexer.stop().await;
    served
}

async fn cmd_status(indexer: &Indexer) -> Result<()> {
    indexer.ensure_checkpoints().await?;
    let status = indexer.status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn cmd_backfill(indexer: &Indexer, contract: &str, block: u64, reset_ledger: bool) -> Result<()> {
    indexer.ensure_checkpoints().await?;
    let rewound = if reset_ledger {
        indexer.backfill_from_fork(contract, block).await
    } else {
        indexer.backfill(contract, block).await
    }
    .with_context(|| format!("backfill of {contract} failed"))?;
    for cp in rewound.into_iter().map(CheckpointSummary::from) {
        println!(
            "{} {}: next block {} ({:?})",
            cp.contract_address,
            cp.event_type,
            cp.last_processed_block.map_or(0, |b| b + 1),
            cp.status
        );
    }
    Ok(())
}

async fn cmd_check(indexer: &Indexer) -> Result<()> {
    let report = indexer.check_consistency().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_consistent() {
        eprintln!("{} mismatch(es) found", report.mismatches.len());
        std::process::exit(2);
    }
    Ok(())
}

fn cmd_info() {
    println!("chainledger {}", env!("CARGO_PKG_VERSION"));
    println!("Reorg-aware blockchain event ingestion\n");
    println!("Chains:     EVM (JSON-RPC: eth_blockNumber, eth_getLogs, eth_getBlockByNumber)");
    println!("Decoding:   Solidity event signatures (alloy-dyn-abi)");
    println!("Storage:    SQLite (sqlx), in-memory");
    println!("Reorgs:     parent-hash divergence detection, confirmation sweep, orphan recovery");
    println!("Admin HTTP: GET /status  POST /restart  POST /backfill  GET /consistency");
}
