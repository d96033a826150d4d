pub mod config;
pub mod db;
pub mod detection;
pub mod error;
pub mod frame;
pub mod orchestrator;
pub mod position;
pub mod recorder;
pub mod retention;
pub mod utils;

use std::path::PathBuf;

use anyhow::{Context, Result};
use config::AppConfig;
use log::{error, info};
use orchestrator::Orchestrator;

const DEFAULT_CONFIG_PATH: &str = "/etc/dashcam/config.json";

fn debug_requested() -> bool {
    std::env::var("DASHCAM_DEBUG")
        .map(|value| matches!(value.trim(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn config_path() -> PathBuf {
    std::env::var_os("DASHCAM_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn run_appliance() -> Result<()> {
    let path = config_path();
    let config = AppConfig::load(&path)?;
    info!("Configuration loaded from {}", path.display());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("dashcam-rt")
        .build()
        .context("failed to build async runtime")?;

    runtime.block_on(async move {
        let mut orchestrator = Orchestrator::new(config)?;
        orchestrator.run_until_signal().await
    })
}

pub fn run() {
    utils::init_logging(debug_requested());
    info!("Dashcam starting up...");

    if let Err(err) = run_appliance() {
        error!("Dashcam failed: {err:#}");
        std::process::exit(1);
    }
}
