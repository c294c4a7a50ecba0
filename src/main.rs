//! # Weather Hub Entry Point
//!
//! Loads `weather-config.toml`, wires the configured location inputs and
//! output sinks to the BOM client, and polls until interrupted.
//!
//! Usage:
//! ```text
//! weather-hub [--config <path>] [--once]
//! ```
//! `--once` runs a single cycle and exits, which is handy for checking a
//! configuration from a shell.

use anyhow::Context;
use std::env;
use std::sync::Arc;
use weather_hub_lib::config::{Config, DEFAULT_CONFIG_PATH};
use weather_hub_lib::device_io::{build_router, FileInput};
use weather_hub_lib::geo::PositionInput;
use weather_hub_lib::provider::BomClient;
use weather_hub_lib::scheduler::PollScheduler;

/// Value following `flag` on the command line, if any.
fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Main application entry point.
fn main() -> anyhow::Result<()> {
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    let args: Vec<String> = env::args().collect();
    let config_arg = arg_value(&args, "--config");
    let config_path = config_arg.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.into());
    let run_once = args.iter().any(|a| a == "--once");

    // Configuration problems are fatal; nothing after this point is.
    let loaded = match &config_arg {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };
    let config = loaded
        .with_context(|| format!("loading {}", config_path))?
        .validate()
        .with_context(|| format!("validating {}", config_path))?;

    let client = BomClient::new(&config.provider).context("building HTTP client")?;
    let router = build_router(&config.outputs);
    // Sensor references in the config are files kept current by a GPS daemon.
    // Files cannot announce a first fix, so the run loop's location retry
    // picks it up within a few seconds.
    let mut scheduler = PollScheduler::from_config(&config, client, router, |path| {
        Some(Arc::new(FileInput::new(path)) as Arc<dyn PositionInput>)
    })?;

    // A current-thread runtime: cycles are strictly sequential and the
    // network calls are the only suspension points
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    if run_once {
        scheduler.dump_config();
        let report = rt.block_on(scheduler.run_cycle());
        if report.deferred() {
            log::warn!("Location not available, nothing fetched");
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C, shutting down gracefully...");
        let _ = shutdown_tx.send(());
    })
    .context("installing Ctrl+C handler")?;

    rt.block_on(scheduler.run(shutdown_rx));
    Ok(())
}
