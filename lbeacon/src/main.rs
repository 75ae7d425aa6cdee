//! LBeacon firmware daemon entry point (spec §6).

use std::path::PathBuf;

use clap::Parser;
use lbeacon_core::supervisor::{self, RunOptions};

const DEFAULT_CONFIG_PATH: &str = "../config/config.conf";

/// Advertises a location-derived BLE identifier, scans for nearby
/// Bluetooth devices, and forwards sightings to a gateway over UDP.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(default_value = DEFAULT_CONFIG_PATH, env = "LBEACON_CONFIG")]
    config: PathBuf,

    /// Stay attached to the controlling terminal instead of treating
    /// daemonization as delegated to the process supervisor.
    #[arg(long)]
    foreground: bool,

    /// Run a single scan/advertise/upload cycle and exit; for tests.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let code = supervisor::run(RunOptions {
        config_path: cli.config,
        foreground: cli.foreground,
        once: cli.once,
    })
    .await;

    std::process::exit(code);
}
