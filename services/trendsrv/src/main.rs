//! trendsrv binary

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use common::{shutdown_token, LogConfig, SystemClock};
use tracing::{error, info};
use trendsrv::{AppConfig, TrendService};

const SERVICE_NAME: &str = "trendsrv";

/// Tick of the virtual device's synthetic waveform
const WAVEFORM_PERIOD: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", env = "TRENDSRV_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// SQLite database path
    #[arg(long, value_name = "FILE")]
    db_path: Option<PathBuf>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(path) = args.db_path {
        config.database.path = path;
    }

    if args.validate {
        config.validate()?;
        println!("Configuration is valid");
        return Ok(());
    }

    let _log_guard = common::init_with_config(&LogConfig {
        service_name: SERVICE_NAME.to_string(),
        level: config.logging.level.clone(),
        log_dir: config.logging.dir.clone(),
        enable_json: config.logging.json,
        ansi: true,
    })
    .context("Failed to initialize logging")?;

    info!(
        "Starting {} v{} (device {}, polling every {:?})",
        SERVICE_NAME,
        env!("CARGO_PKG_VERSION"),
        config.device.endpoint(),
        config.polling.interval()
    );

    let service = TrendService::build(&config, Arc::new(SystemClock))
        .await
        .context("Failed to build service")?;

    let token = shutdown_token();

    // Without hardware the virtual device needs something to report
    let points = service.repository.all_points().await?;
    let waveform = service
        .device
        .spawn_waveform(points, WAVEFORM_PERIOD, token.child_token());

    let handles = service.start(&token);
    info!("{} running, press Ctrl+C to stop", SERVICE_NAME);

    token.cancelled().await;
    info!("Shutting down");

    handles.join().await;
    if let Err(e) = waveform.await {
        error!("Waveform task ended abnormally: {}", e);
    }
    service.close().await;

    info!("{} stopped", SERVICE_NAME);
    Ok(())
}
