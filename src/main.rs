/// lnwatchd - chain notification daemon
///
/// Wires the pieces together: telemetry, config, the RocksDB hint cache,
/// the bitcoind-backed chain notifier, and the invoice registry, then
/// polls for blocks until ctrl-c.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use lnwatch::bitcoind_client::{run_block_monitor, BitcoindClient};
use lnwatch::chain_notifier::ChainNotifier;
use lnwatch::config::{get_global_config, init_global_config, Settings};
use lnwatch::hint_cache::RocksHintCache;
use lnwatch::invoice_registry::{InvoiceRegistry, StaticCltvDecoder};
use lnwatch::invoice_store::MemInvoiceStore;
use lnwatch::metrics;
use lnwatch::telemetry::{init_tracing, TelemetryConfig};

#[derive(Parser)]
#[command(name = "lnwatchd", about = "Chain-aware notification daemon")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Override the log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Write logs to this file with daily rotation
    #[arg(long)]
    log_file: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let mut telemetry = TelemetryConfig::default();
    if let Some(level) = cli.log_level {
        telemetry.log_level = level;
    }
    if let Some(file) = cli.log_file {
        telemetry.log_file = Some(file);
    }
    init_tracing(telemetry)?;
    metrics::register_metrics();

    init_global_config(&cli.config)?;
    let settings = Settings::from_config(get_global_config())?;

    let hint_cache = Arc::new(RocksHintCache::open(&settings.hint_cache_path)?);
    let client = Arc::new(BitcoindClient::new(
        settings.rpc_host.clone(),
        settings.rpc_user.clone(),
        settings.rpc_pass.clone(),
    ));

    let start_height = client.block_count().await?;
    info!(start_height, "connected to bitcoind");

    let notifier = Arc::new(ChainNotifier::new(
        start_height,
        settings.reorg_safety_limit,
        client.clone(),
        hint_cache,
    ));
    notifier.start();

    let registry = Arc::new(InvoiceRegistry::new(
        Arc::new(MemInvoiceStore::new()),
        Arc::new(StaticCltvDecoder {
            delta: settings.min_final_cltv_fallback,
        }),
    ));
    registry.start();

    let quit = CancellationToken::new();
    let monitor = tokio::spawn(run_block_monitor(
        client,
        notifier.clone(),
        Duration::from_secs(settings.poll_interval_secs),
        settings.reorg_safety_limit,
        quit.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    quit.cancel();
    let _ = monitor.await;
    notifier.stop().await;
    registry.stop().await;
    Ok(())
}
