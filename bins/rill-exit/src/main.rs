//! Rill exit node binary.
//!
//! Serves account-set transaction chains over JSON-RPC, backed by an
//! in-memory regtest ledger that mines its mempool on a fixed interval.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use rill_exit_lib::address::Network;
use rill_exit_lib::{start_rpc_server, AccountChainService, ExitConfig, MemoryLedger};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "rill-exit",
    version,
    about = "Rill exit node serving account transaction chains over JSON-RPC"
)]
struct Args {
    /// Config file (TOML). Defaults to <config dir>/rill/rill-exit.toml if present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// RPC server bind address
    #[arg(long)]
    rpc_bind: Option<String>,

    /// RPC server port
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Accept testnet addresses instead of mainnet.
    #[arg(long)]
    testnet: bool,

    /// Maximum transactions per page
    #[arg(long)]
    page_limit: Option<usize>,

    /// Derive handles from the sorted account set
    #[arg(long)]
    canonical_handles: bool,

    /// Seconds between regtest blocks (0 disables mining)
    #[arg(long)]
    block_interval_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long)]
    log_format: Option<String>,
}

impl Args {
    /// Apply command-line overrides on top of a loaded config.
    fn apply(self, mut config: ExitConfig) -> ExitConfig {
        if let Some(bind) = self.rpc_bind {
            config.rpc_bind = bind;
        }
        if let Some(port) = self.rpc_port {
            config.rpc_port = port;
        }
        if self.testnet {
            config.network = Network::Testnet;
        }
        if let Some(limit) = self.page_limit {
            config.page_limit = limit;
        }
        if self.canonical_handles {
            config.canonical_handles = true;
        }
        if let Some(secs) = self.block_interval_secs {
            config.block_interval_secs = secs;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let loaded = ExitConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let config = args.apply(loaded);

    init_logging(&config.log_level, &config.log_format);

    info!("Rill Exit Node v{}", env!("CARGO_PKG_VERSION"));
    info!("network: {:?}", config.network);
    info!("rpc_addr: {}", config.rpc_addr());
    info!("page_limit: {}", config.page_limit);
    info!("canonical_handles: {}", config.canonical_handles);

    let ledger = Arc::new(MemoryLedger::new());
    let service = Arc::new(AccountChainService::new(
        ledger.clone(),
        ledger.clone(),
        config.service_config(),
    ));

    let rpc_handle = start_rpc_server(&config.rpc_addr(), service)
        .await
        .with_context(|| format!("failed to start RPC server on {}", config.rpc_addr()))?;
    info!("RPC server listening on {}", config.rpc_addr());

    info!("Rill exit node running (Ctrl+C to stop)");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("received Ctrl+C, shutting down...");
    };

    tokio::select! {
        _ = mine_blocks(ledger, config.block_interval_secs) => {
            info!("block producer exited");
        }
        _ = rpc_handle.clone().stopped() => {
            info!("RPC server exited");
        }
        _ = shutdown_signal => {
            info!("shutdown signal received");
        }
    }

    rpc_handle.stop().ok();
    info!("RPC server stopped");
    info!("Rill exit node shutdown complete");
    Ok(())
}

/// Mine pending mempool transactions every `interval_secs`. Never returns
/// when mining is disabled.
async fn mine_blocks(ledger: Arc<MemoryLedger>, interval_secs: u64) {
    if interval_secs == 0 {
        info!("regtest mining disabled");
        return std::future::pending().await;
    }
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if ledger.mempool_len() == 0 {
            continue;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        match ledger.mine_pending(now) {
            Ok(block) => info!(height = block.height, hash = %block.hash, "mined regtest block"),
            Err(e) => warn!("failed to mine block: {}", e),
        }
    }
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// `format = "json"` selects structured JSON output. Any other value
/// defaults to human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
