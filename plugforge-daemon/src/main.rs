//! # plugforge-daemon
//!
//! The plugforge host daemon.
//!
//! This daemon is responsible for:
//! - Discovering plugins and resolving their load order
//! - Verifying, loading and activating each plugin in its own boundary
//! - Checking for plugin updates and applying automatic ones
//! - Shutting every plugin down cleanly on Ctrl+C
//!
//! ## Configuration
//!
//! The daemon reads configuration from `$XDG_CONFIG_HOME/plugforge/config.toml`,
//! or from the path given as its first argument.
//!
//! ## Running
//!
//! ```bash
//! # Start the daemon
//! cargo run --bin plugforge-daemon
//!
//! # With debug logging
//! RUST_LOG=debug cargo run --bin plugforge-daemon
//! ```

use anyhow::Result;
use plugforge_daemon::{init_logging, Config, Daemon};
use std::path::PathBuf;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);

    // Logging needs the configured level, so load configuration first.
    let (config, load_error) = match config_path {
        Some(path) => (Config::load(&path)?, None),
        None => match Config::load_default() {
            Ok(cfg) => (cfg, None),
            Err(e) => (Config::default(), Some(e)),
        },
    };

    init_logging(&config.logging.level);
    info!("Starting plugforge-daemon v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        None => info!("Loaded configuration"),
        Some(e) => warn!("Failed to load config, using defaults: {:#}", e),
    }

    let daemon = Daemon::start(config).await?;

    info!("Daemon startup complete");
    info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    daemon.stop().await;

    info!("Daemon stopped");
    Ok(())
}
