//! Bluesmart CLI
//!
//! Replays captured advertisements through a registry built from a config
//! file and prints the resulting device records.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use bluesmart::store::JsonFileStore;
use bluesmart::transport::{ScanResult, SimulatedTransport};
use bluesmart::{Config, DeviceRegistry, Scanner};

/// Smart peripheral runtime
#[derive(Parser, Debug)]
#[command(name = "bluesmart")]
#[command(about = "Smart peripheral advertisement tooling", long_about = None)]
struct Args {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Feed a capture of advertisements through the registry
    Replay {
        /// Path to bluesmart.toml
        #[arg(short, long, default_value = "./bluesmart.toml")]
        config: PathBuf,

        /// JSON lines file, one {"address", "rssi", "data"} object per line
        #[arg(long)]
        capture: PathBuf,

        /// Keep devices no profile recognizes
        #[arg(long)]
        allow_unknown: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    match args.command {
        Command::Replay {
            config,
            capture,
            allow_unknown,
        } => replay(config, capture, allow_unknown).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bluesmart=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn replay(config_path: PathBuf, capture: PathBuf, allow_unknown: bool) -> Result<()> {
    info!("Starting bluesmart replay v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&config_path)
        .await
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.apply_env()?;
    if allow_unknown {
        config.registry.allow_unknown = true;
    }

    let sim = SimulatedTransport::new();
    let registry = Arc::new(DeviceRegistry::from_config(&config, Arc::new(sim.clone()))?);

    if let Some(store) = &config.registry.store {
        let loaded = registry.attach_store(Arc::new(JsonFileStore::new(store)))?;
        info!("Loaded {} stored devices from {}", loaded, store.display());
    }

    let scanner = Scanner::new(registry.clone(), config.scanner.clone());
    scanner.start()?;

    let content = tokio::fs::read_to_string(&capture)
        .await
        .with_context(|| format!("reading {}", capture.display()))?;

    let mut skipped = 0usize;
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<ScanResult>(line) {
            Ok(result) => {
                sim.deliver_advertisement(result).await;
            }
            Err(e) => {
                warn!("Skipping line {} of {}: {}", index + 1, capture.display(), e);
                skipped += 1;
            }
        }
    }

    let delivered = scanner.stop().await;
    info!(delivered, skipped, devices = registry.len(), "Replay finished");

    let mut records: Vec<_> = registry.devices().iter().map(|d| d.record()).collect();
    records.sort_by(|a, b| a.address.cmp(&b.address));
    println!("{}", serde_json::to_string_pretty(&records)?);

    registry.shutdown().await;
    Ok(())
}
