//! Integration tests for plugforge-daemon.
//!
//! These tests boot the daemon from a configuration file on disk and verify
//! how it reports plugins that cannot be started.

use plugforge_daemon::{Config, Daemon};
use std::path::Path;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

/// Writes a config file pointing the daemon at `plugins_dir`.
fn write_config(dir: &Path, plugins_dir: &Path) -> std::path::PathBuf {
    let path = dir.join("config.toml");
    let content = format!(
        r#"
[host]
version = "1.0.0"

[plugins]
directories = ["{}"]
unload_timeout_secs = 1

[logging]
level = "debug"

[updates]
check_interval_minutes = 0
"#,
        plugins_dir.display()
    );
    std::fs::write(&path, content).unwrap();
    path
}

/// Writes a manifest whose native module does not exist.
fn create_plugin_without_module(dir: &Path, id: &str) {
    let plugin_dir = dir.join(id);
    std::fs::create_dir_all(&plugin_dir).unwrap();
    std::fs::write(
        plugin_dir.join(format!("{id}.plugin.toml")),
        format!(
            r#"
id = "{id}"
version = "1.0.0"
quiesce_seconds = 0

[entry_points]
native = "lib{id}.so"
"#
        ),
    )
    .unwrap();
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_daemon_reports_plugins_without_modules() {
    let temp = TempDir::new().unwrap();
    let plugins_dir = temp.path().join("plugins");
    create_plugin_without_module(&plugins_dir, "ghost");

    let config = Config::load(write_config(temp.path(), &plugins_dir)).unwrap();
    let daemon = Daemon::start(config).await.unwrap();

    let report = daemon.boot_report();
    assert!(report.activated.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "ghost");
    assert!(report.failed[0].1.contains("does not exist"));

    daemon.stop().await;
}

#[tokio::test]
async fn test_daemon_counts_unreadable_manifests() {
    let temp = TempDir::new().unwrap();
    let plugins_dir = temp.path().join("plugins");
    std::fs::create_dir_all(plugins_dir.join("broken")).unwrap();
    std::fs::write(plugins_dir.join("broken/broken.plugin.json"), "{ not json").unwrap();

    let config = Config::load(write_config(temp.path(), &plugins_dir)).unwrap();
    let daemon = Daemon::start(config).await.unwrap();

    assert_eq!(daemon.boot_report().discovery_errors, 1);
    assert!(daemon.host().boot_order().is_empty());

    daemon.stop().await;
}
