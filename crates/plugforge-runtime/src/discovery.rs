//! Plugin discovery from plugin directories.
//!
//! Every root directory is scanned recursively for files named
//! `*.plugin.json` or `*.plugin.toml`. When no roots are configured the
//! following locations are used:
//!
//! 1. `$XDG_DATA_HOME/plugforge/plugins/` (user plugins)
//! 2. `$XDG_DATA_DIRS/plugforge/plugins/` (system plugins)
//!
//! A malformed manifest never aborts the scan; it is reported in the
//! [`DiscoveryReport`] and the remaining manifests are still returned.

use crate::error::{RuntimeError, RuntimeResult};
use crate::manifest::{is_manifest_file, PluginManifest};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A manifest that failed to parse.
#[derive(Debug)]
pub struct DiscoveryError {
    pub path: PathBuf,
    pub error: RuntimeError,
}

/// Result of a discovery pass.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Parsed, enabled manifests in scan order.
    pub manifests: Vec<PluginManifest>,

    /// Manifests that were skipped because they could not be parsed.
    pub errors: Vec<DiscoveryError>,

    /// Manifests that parsed but are disabled.
    pub disabled: Vec<String>,
}

impl DiscoveryReport {
    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }
}

/// Get the user plugins directory.
pub fn user_plugins_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "raibid-labs", "plugforge")
        .map(|dirs| dirs.data_dir().join("plugins"))
}

/// Get the system plugins directories.
pub fn system_plugins_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Ok(data_dirs) = std::env::var("XDG_DATA_DIRS") {
        for dir in data_dirs.split(':').filter(|d| !d.is_empty()) {
            let plugin_dir = PathBuf::from(dir).join("plugforge/plugins");
            if plugin_dir.exists() && !dirs.contains(&plugin_dir) {
                dirs.push(plugin_dir);
            }
        }
    }

    dirs
}

/// Default roots: the user directory first, then system directories.
pub fn default_plugin_dirs() -> Vec<PathBuf> {
    user_plugins_dir()
        .into_iter()
        .chain(system_plugins_dirs())
        .collect()
}

/// Discover manifests under the given roots.
pub fn discover_plugins(
    roots: &[PathBuf],
    cancel: &CancellationToken,
) -> RuntimeResult<DiscoveryReport> {
    let mut report = DiscoveryReport::default();

    for root in roots {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled("plugin discovery".to_string()));
        }
        debug!("Scanning plugins directory: {:?}", root);
        discover_in_directory(root, &mut report, cancel)?;
    }

    info!(
        "Discovered {} plugins ({} invalid, {} disabled)",
        report.manifests.len(),
        report.errors.len(),
        report.disabled.len()
    );
    Ok(report)
}

/// Discover manifests in a single directory tree, appending to `report`.
pub fn discover_in_directory(
    dir: &Path,
    report: &mut DiscoveryReport,
    cancel: &CancellationToken,
) -> RuntimeResult<()> {
    if !dir.exists() {
        warn!("Plugins directory {:?} does not exist", dir);
        return Ok(());
    }

    let walker = WalkDir::new(dir)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter();

    for entry in walker {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled("plugin discovery".to_string()));
        }

        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Failed to read entry under {:?}: {}", dir, e);
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file() || !is_manifest_file(path) {
            continue;
        }

        match discover_plugin(path) {
            Ok(manifest) if !manifest.enabled => {
                info!("Skipping disabled plugin: {}", manifest.id);
                report.disabled.push(manifest.id);
            }
            Ok(manifest) => {
                info!(
                    "Discovered plugin: {} v{} at {:?}",
                    manifest.display_name(),
                    manifest.version,
                    path
                );
                report.manifests.push(manifest);
            }
            Err(error) => {
                warn!("Failed to load manifest from {:?}: {}", path, error);
                report.errors.push(DiscoveryError {
                    path: path.to_path_buf(),
                    error,
                });
            }
        }
    }

    Ok(())
}

/// Read a single manifest file and resolve its entry points.
pub fn discover_plugin(manifest_path: &Path) -> RuntimeResult<PluginManifest> {
    let mut manifest = PluginManifest::from_file(manifest_path)?;
    if let Some(dir) = manifest_path.parent() {
        manifest.resolve_entry_points(dir);
    }
    Ok(manifest)
}
