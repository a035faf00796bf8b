//! The running daemon: a booted plugin host plus its periodic update checks.

use crate::config::Config;
use anyhow::{Context, Result};
use plugforge_host::{BootReport, HostBootstrap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

pub struct Daemon {
    host: Arc<HostBootstrap>,
    report: BootReport,
    shutdown: CancellationToken,
    update_task: Option<JoinHandle<()>>,
}

impl Daemon {
    /// Boot the plugin host and start periodic update checks.
    pub async fn start(config: Config) -> Result<Self> {
        let host = Arc::new(
            HostBootstrap::new(config.host.clone()).context("Failed to create plugin host")?,
        );
        let shutdown = CancellationToken::new();

        let report = host
            .boot(&shutdown)
            .await
            .context("Failed to boot plugin host")?;
        for (plugin_id, reason) in &report.failed {
            warn!("Plugin '{}' did not start: {}", plugin_id, reason);
        }
        if report.discovery_errors > 0 {
            warn!("{} plugin manifest(s) could not be read", report.discovery_errors);
        }
        info!(
            "Started {} plugin(s): {:?}",
            report.activated.len(),
            report.activated
        );

        let update_task = match config.updates.check_interval_minutes {
            0 => {
                debug!("Periodic update checks disabled");
                None
            }
            minutes => Some(spawn_update_checks(
                Arc::clone(&host),
                Duration::from_secs(minutes * 60),
                shutdown.clone(),
            )),
        };

        Ok(Self {
            host,
            report,
            shutdown,
            update_task,
        })
    }

    pub fn host(&self) -> &Arc<HostBootstrap> {
        &self.host
    }

    pub fn boot_report(&self) -> &BootReport {
        &self.report
    }

    /// Stop update checks and shut the plugin host down.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.update_task.take() {
            if let Err(e) = task.await {
                warn!("Update check task ended abnormally: {}", e);
            }
        }
        self.host.shutdown().await;
    }
}

fn spawn_update_checks(
    host: Arc<HostBootstrap>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    info!("Checking for plugin updates every {:?}", every);

    tokio::spawn(async move {
        let mut ticker = interval(every);
        // The first tick completes immediately; plugins were just booted.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let available = host.check_for_updates(&shutdown).await;
                    debug!("Update check found {} update(s)", available.len());
                }
                _ = shutdown.cancelled() => {
                    info!("Update check task received shutdown signal");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_and_stop_with_no_plugins() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.host.plugins.directories = vec![temp_dir.path().to_path_buf()];

        let daemon = Daemon::start(config).await.unwrap();
        assert!(daemon.boot_report().activated.is_empty());
        assert!(daemon.update_task.is_some());

        daemon.stop().await;
    }

    #[tokio::test]
    async fn test_update_checks_can_be_disabled() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.host.plugins.directories = vec![temp_dir.path().to_path_buf()];
        config.updates.check_interval_minutes = 0;

        let daemon = Daemon::start(config).await.unwrap();
        assert!(daemon.update_task.is_none());
        daemon.stop().await;
    }
}
