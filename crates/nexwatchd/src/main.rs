//! Nexwatch Daemon - nexmon wifi watchdog
//!
//! Watches the monitor interface for silent driver degradation and runs the
//! driver reload sequence when it stalls.

use anyhow::{Context, Result};
use clap::Parser;
use nexwatch_common::{resolve_path, WatchdogConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "nexwatchd", version, about = "Nexmon wifi watchdog daemon")]
struct Args {
    /// Config file (default: $NEXWATCH_CONFIG or /etc/nexwatch/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    debug: bool,

    /// Validate the config, print the effective settings and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(true)
        .init();

    let path = resolve_path(args.config.as_deref());
    let config = WatchdogConfig::load(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.validate().context("Invalid configuration")?;

    if args.check_config {
        let rendered = config.to_toml().context("Failed to render config")?;
        println!("# effective configuration ({})", path.display());
        println!("{}", rendered);
        return Ok(());
    }

    info!("nexwatchd v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Config: {}", path.display());
    info!(
        "Watching {} (driver {}), blind threshold {}, max {} recoveries per {}s",
        config.interface.monitor_interface,
        config.interface.driver_module,
        config.recovery.blind_epoch_threshold,
        config.recovery.max_recoveries,
        config.recovery.window_secs
    );

    nexwatchd::daemon::run(config).await
}
