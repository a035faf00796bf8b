//! Plugin updates with automatic rollback.
//!
//! The [`UpdateManager`] replaces a running plugin with another version of
//! the same plugin obtained from an [`UpdateSource`]. The version being
//! replaced is retained, so a failed swap restores it and a later
//! [`rollback`](UpdateManager::rollback) can return to it. Every attempt is
//! recorded in a per-plugin history and announced on a broadcast channel.

use crate::runtime::PluginRuntime;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use plugforge_runtime::{
    discover_plugin, discover_plugins, PluginManifest, RuntimeError, RuntimeResult, UpdateChannel,
};
use semver::Version;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the update event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Update sources
// ============================================================================

/// Where new plugin versions come from.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Every manifest the source offers for a plugin id.
    async fn available_versions(&self, plugin_id: &str) -> RuntimeResult<Vec<PluginManifest>>;

    /// Make a version's files available locally and return its final manifest.
    async fn fetch(&self, manifest: &PluginManifest) -> RuntimeResult<PluginManifest>;
}

/// Offers whatever plugin versions are installed under a set of directories.
pub struct DirectoryUpdateSource {
    roots: Vec<PathBuf>,
}

impl DirectoryUpdateSource {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

#[async_trait]
impl UpdateSource for DirectoryUpdateSource {
    async fn available_versions(&self, plugin_id: &str) -> RuntimeResult<Vec<PluginManifest>> {
        let roots = self.roots.clone();
        let plugin_id = plugin_id.to_string();
        tokio::task::spawn_blocking(move || {
            let report = discover_plugins(&roots, &CancellationToken::new())?;
            let mut manifests: Vec<PluginManifest> = report
                .manifests
                .into_iter()
                .filter(|m| m.id == plugin_id)
                .collect();
            manifests.sort_by(|a, b| b.version.cmp(&a.version));
            Ok(manifests)
        })
        .await
        .map_err(|e| RuntimeError::Cancelled(format!("update scan: {e}")))?
    }

    async fn fetch(&self, manifest: &PluginManifest) -> RuntimeResult<PluginManifest> {
        // Files are already on disk; re-read the manifest in case it changed.
        match manifest.source_path.clone() {
            Some(path) => tokio::task::spawn_blocking(move || discover_plugin(&path))
                .await
                .map_err(|e| RuntimeError::Cancelled(format!("update fetch: {e}")))?,
            None => Ok(manifest.clone()),
        }
    }
}

// ============================================================================
// Records and events
// ============================================================================

/// An update that a source offers for a running plugin.
#[derive(Debug, Clone)]
pub struct UpdateInfo {
    pub plugin_id: String,
    pub current_version: Version,
    pub available_version: Version,
    pub channel: UpdateChannel,
    pub manifest: PluginManifest,
}

/// What triggered an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Manual,
    Automatic,
    Rollback,
    HotFix,
}

/// One update attempt.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateRecord {
    pub plugin_id: String,
    pub from_version: Version,
    pub to_version: Version,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub update_type: UpdateType,
    /// Manifest of the version that a rollback would return to.
    pub rollback_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum UpdateEvent {
    UpdateAvailable(UpdateInfo),
    UpdateStarted {
        plugin_id: String,
        from_version: Version,
        to_version: Version,
    },
    UpdateCompleted(UpdateRecord),
    UpdateFailed(UpdateRecord),
}

/// Whether a release channel accepts a version.
///
/// Stable takes releases only, beta also takes `beta` and `rc`
/// pre-releases, and alpha takes everything.
pub fn channel_accepts(channel: UpdateChannel, version: &Version) -> bool {
    if version.pre.is_empty() {
        return true;
    }
    match channel {
        UpdateChannel::Stable => false,
        UpdateChannel::Beta => {
            let pre = version.pre.as_str();
            pre.starts_with("beta") || pre.starts_with("rc")
        }
        UpdateChannel::Alpha => true,
    }
}

// ============================================================================
// UpdateManager
// ============================================================================

/// Applies plugin updates and rollbacks, one at a time.
pub struct UpdateManager {
    runtime: Arc<PluginRuntime>,
    source: Arc<dyn UpdateSource>,
    host_version: Version,
    history_retention: usize,
    events: broadcast::Sender<UpdateEvent>,
    history: RwLock<HashMap<String, Vec<UpdateRecord>>>,
    retained: RwLock<HashMap<String, Vec<PluginManifest>>>,
    auto_update: RwLock<HashMap<String, bool>>,
    update_lock: Mutex<()>,
}

impl UpdateManager {
    /// Create an update manager.
    ///
    /// # Arguments
    ///
    /// * `runtime` - Components used to swap plugins
    /// * `source` - Where new versions come from
    /// * `host_version` - Version checked against candidate compatibility
    /// * `history_retention` - Records kept per plugin
    pub fn new(
        runtime: Arc<PluginRuntime>,
        source: Arc<dyn UpdateSource>,
        host_version: Version,
        history_retention: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            runtime,
            source,
            host_version,
            history_retention,
            events,
            history: RwLock::new(HashMap::new()),
            retained: RwLock::new(HashMap::new()),
            auto_update: RwLock::new(HashMap::new()),
            update_lock: Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }

    pub fn set_auto_update(&self, plugin_id: &str, enabled: bool) {
        self.auto_update.write().insert(plugin_id.to_string(), enabled);
    }

    /// Explicit setting, otherwise the running manifest's `autoUpdate` flag.
    pub fn is_auto_update(&self, plugin_id: &str) -> bool {
        if let Some(enabled) = self.auto_update.read().get(plugin_id) {
            return *enabled;
        }
        self.runtime
            .manifests
            .get(plugin_id)
            .and_then(|m| m.update_info)
            .is_some_and(|u| u.auto_update)
    }

    /// Update records for a plugin, newest first.
    pub fn get_history(&self, plugin_id: &str) -> Vec<UpdateRecord> {
        self.history
            .read()
            .get(plugin_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Versions kept for rollback, newest first.
    pub fn retained_versions(&self, plugin_id: &str) -> Vec<Version> {
        self.retained
            .read()
            .get(plugin_id)
            .map(|manifests| manifests.iter().map(|m| m.version.clone()).collect())
            .unwrap_or_default()
    }

    /// Find the newest version the source offers on the plugin's channel.
    ///
    /// Emits [`UpdateEvent::UpdateAvailable`] when there is one.
    pub async fn check_for_updates(&self, plugin_id: &str) -> RuntimeResult<Option<UpdateInfo>> {
        let current = self.running_manifest(plugin_id)?;
        let channel = current
            .update_info
            .as_ref()
            .map(|u| u.channel)
            .unwrap_or_default();

        let candidate = self
            .source
            .available_versions(plugin_id)
            .await?
            .into_iter()
            .filter(|m| m.version > current.version)
            .filter(|m| channel_accepts(channel, &m.version))
            .filter(|m| m.is_compatible_with(&self.host_version))
            .max_by(|a, b| a.version.cmp(&b.version));

        let Some(manifest) = candidate else {
            debug!("No update available for {} v{}", plugin_id, current.version);
            return Ok(None);
        };

        let info = UpdateInfo {
            plugin_id: plugin_id.to_string(),
            current_version: current.version.clone(),
            available_version: manifest.version.clone(),
            channel,
            manifest,
        };
        info!(
            "Update available for {}: v{} -> v{}",
            plugin_id, info.current_version, info.available_version
        );
        self.emit(UpdateEvent::UpdateAvailable(info.clone()));
        Ok(Some(info))
    }

    /// Replace a running plugin with `target_version`.
    ///
    /// Returns `Ok(true)` when the new version is running and `Ok(false)`
    /// when nothing changed: the plugin already runs that version, or the
    /// swap failed and the previous version was restored.
    ///
    /// # Errors
    ///
    /// `UpdateFailed` when the version is not offered, or when the swap
    /// failed and the previous version could not be restored either.
    pub async fn update(&self, plugin_id: &str, target_version: &Version) -> RuntimeResult<bool> {
        self.update_with_type(plugin_id, target_version, UpdateType::Manual)
            .await
    }

    /// [`update`](Self::update), recording the given trigger.
    pub async fn update_with_type(
        &self,
        plugin_id: &str,
        target_version: &Version,
        update_type: UpdateType,
    ) -> RuntimeResult<bool> {
        let _serialized = self.update_lock.lock().await;

        let current = self.running_manifest(plugin_id)?;
        if current.version == *target_version {
            debug!("Plugin {} already at v{}", plugin_id, target_version);
            return Ok(false);
        }

        let failed = |reason: String| RuntimeError::UpdateFailed {
            plugin: plugin_id.to_string(),
            version: target_version.to_string(),
            reason,
        };

        let offered = self
            .source
            .available_versions(plugin_id)
            .await?
            .into_iter()
            .find(|m| m.version == *target_version)
            .ok_or_else(|| failed("version is not available".to_string()))?;
        let candidate = self.source.fetch(&offered).await?;
        if candidate.id != plugin_id || candidate.version != *target_version {
            return Err(failed(format!("source delivered {}", candidate.key())));
        }
        if !candidate.is_compatible_with(&self.host_version) {
            return Err(failed(format!(
                "not compatible with host version {}",
                self.host_version
            )));
        }

        info!(
            "Updating plugin {}: v{} -> v{}",
            plugin_id, current.version, target_version
        );
        self.emit(UpdateEvent::UpdateStarted {
            plugin_id: plugin_id.to_string(),
            from_version: current.version.clone(),
            to_version: target_version.clone(),
        });

        let policy = candidate.rollback_policy();
        self.retain(&current, policy.max_versions);

        let started = Instant::now();
        let outcome = self
            .swap(plugin_id, &candidate, Duration::from_secs(policy.timeout_seconds))
            .await;

        let mut record = UpdateRecord {
            plugin_id: plugin_id.to_string(),
            from_version: current.version.clone(),
            to_version: target_version.clone(),
            timestamp: Utc::now(),
            success: outcome.is_ok(),
            error_message: outcome.as_ref().err().map(ToString::to_string),
            duration_ms: elapsed_ms(started),
            update_type,
            rollback_path: current.source_path.clone(),
        };

        let Err(e) = outcome else {
            info!("Updated plugin {} to v{}", plugin_id, target_version);
            self.record(record.clone());
            self.emit(UpdateEvent::UpdateCompleted(record));
            return Ok(true);
        };

        error!("Update of plugin {} to v{} failed: {}", plugin_id, target_version, e);
        self.record(record.clone());
        self.emit(UpdateEvent::UpdateFailed(record.clone()));

        if !policy.enabled {
            return Err(failed(format!("{e}; rollback disabled")));
        }

        // Restore the version that was running.
        let restore_started = Instant::now();
        let restored = self
            .swap(plugin_id, &current, Duration::from_secs(policy.timeout_seconds))
            .await;
        record.from_version = target_version.clone();
        record.to_version = current.version.clone();
        record.timestamp = Utc::now();
        record.success = restored.is_ok();
        record.error_message = restored.as_ref().err().map(ToString::to_string);
        record.duration_ms = elapsed_ms(restore_started);
        record.update_type = UpdateType::Rollback;
        self.record(record.clone());

        match restored {
            Ok(()) => {
                warn!("Rolled plugin {} back to v{}", plugin_id, current.version);
                self.forget_retained(plugin_id, &current.version);
                self.emit(UpdateEvent::UpdateCompleted(record));
                Ok(false)
            }
            Err(rollback_err) => {
                error!(
                    "Rollback of plugin {} to v{} failed: {}",
                    plugin_id, current.version, rollback_err
                );
                self.emit(UpdateEvent::UpdateFailed(record));
                Err(failed(format!("{e}; rollback failed: {rollback_err}")))
            }
        }
    }

    /// Return a plugin to the most recent retained version.
    ///
    /// Returns `Ok(false)` when no earlier version is retained.
    pub async fn rollback(&self, plugin_id: &str) -> RuntimeResult<bool> {
        let _serialized = self.update_lock.lock().await;

        let current = self.runtime.manifests.get(plugin_id);
        let previous = self.retained.read().get(plugin_id).and_then(|manifests| {
            manifests
                .iter()
                .find(|m| current.as_ref().map_or(true, |c| c.version != m.version))
                .cloned()
        });
        let Some(previous) = previous else {
            info!("No retained version of {} to roll back to", plugin_id);
            return Ok(false);
        };

        let from_version = current
            .as_ref()
            .map_or_else(|| Version::new(0, 0, 0), |c| c.version.clone());
        info!(
            "Rolling back plugin {}: v{} -> v{}",
            plugin_id, from_version, previous.version
        );
        self.emit(UpdateEvent::UpdateStarted {
            plugin_id: plugin_id.to_string(),
            from_version: from_version.clone(),
            to_version: previous.version.clone(),
        });

        let policy = previous.rollback_policy();
        let started = Instant::now();
        let outcome = self
            .swap(plugin_id, &previous, Duration::from_secs(policy.timeout_seconds))
            .await;

        let record = UpdateRecord {
            plugin_id: plugin_id.to_string(),
            from_version,
            to_version: previous.version.clone(),
            timestamp: Utc::now(),
            success: outcome.is_ok(),
            error_message: outcome.as_ref().err().map(ToString::to_string),
            duration_ms: elapsed_ms(started),
            update_type: UpdateType::Rollback,
            rollback_path: previous.source_path.clone(),
        };
        self.record(record.clone());

        match outcome {
            Ok(()) => {
                self.forget_retained(plugin_id, &previous.version);
                self.emit(UpdateEvent::UpdateCompleted(record));
                Ok(true)
            }
            Err(e) => {
                self.emit(UpdateEvent::UpdateFailed(record));
                if let Some(current) = current {
                    warn!("Rollback of {} failed, restoring v{}", plugin_id, current.version);
                    if let Err(restore_err) = self
                        .swap(plugin_id, &current, Duration::from_secs(policy.timeout_seconds))
                        .await
                    {
                        error!("Restoring plugin {} failed: {}", plugin_id, restore_err);
                    }
                }
                Err(RuntimeError::UpdateFailed {
                    plugin: plugin_id.to_string(),
                    version: previous.version.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Unload whatever runs under `plugin_id` and install `next` in its place.
    async fn swap(&self, plugin_id: &str, next: &PluginManifest, limit: Duration) -> RuntimeResult<()> {
        let cancel = CancellationToken::new();
        let work = async {
            if self.runtime.loader.is_loaded(plugin_id).await {
                self.runtime.tear_down(plugin_id, &cancel).await?;
            }
            self.runtime.install(next, &cancel).await.map(|_| ())
        };

        match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(RuntimeError::UpdateFailed {
                    plugin: plugin_id.to_string(),
                    version: next.version.to_string(),
                    reason: format!("timed out after {:?}", limit),
                })
            }
        }
    }

    fn running_manifest(&self, plugin_id: &str) -> RuntimeResult<PluginManifest> {
        self.runtime
            .manifests
            .get(plugin_id)
            .ok_or_else(|| RuntimeError::PluginNotFound(plugin_id.to_string()))
    }

    fn retain(&self, manifest: &PluginManifest, max_versions: usize) {
        let mut retained = self.retained.write();
        let versions = retained.entry(manifest.id.clone()).or_default();
        versions.retain(|m| m.version != manifest.version);
        versions.insert(0, manifest.clone());
        versions.truncate(max_versions.max(1));
    }

    fn forget_retained(&self, plugin_id: &str, version: &Version) {
        if let Some(versions) = self.retained.write().get_mut(plugin_id) {
            versions.retain(|m| m.version != *version);
        }
    }

    fn record(&self, record: UpdateRecord) {
        let mut history = self.history.write();
        let records = history.entry(record.plugin_id.clone()).or_default();
        records.insert(0, record);
        records.truncate(self.history_retention);
    }

    fn emit(&self, event: UpdateEvent) {
        // Sending only fails when nobody is subscribed.
        let _ = self.events.send(event);
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_channel_filter() {
        assert!(channel_accepts(UpdateChannel::Stable, &version("2.0.0")));
        assert!(!channel_accepts(UpdateChannel::Stable, &version("2.0.0-beta.1")));
        assert!(channel_accepts(UpdateChannel::Beta, &version("2.0.0-beta.1")));
        assert!(channel_accepts(UpdateChannel::Beta, &version("2.0.0-rc.2")));
        assert!(!channel_accepts(UpdateChannel::Beta, &version("2.0.0-alpha.1")));
        assert!(channel_accepts(UpdateChannel::Alpha, &version("2.0.0-alpha.1")));
    }

    #[tokio::test]
    async fn test_directory_source_lists_versions_newest_first() {
        let temp = tempfile::tempdir().unwrap();
        for v in ["1.0.0", "1.5.0", "2.0.0"] {
            let dir = temp.path().join(format!("x-{v}"));
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(
                dir.join("x.plugin.json"),
                format!(r#"{{"id": "x", "version": "{v}"}}"#),
            )
            .unwrap();
        }
        std::fs::create_dir_all(temp.path().join("y")).unwrap();
        std::fs::write(
            temp.path().join("y/y.plugin.json"),
            r#"{"id": "y", "version": "9.0.0"}"#,
        )
        .unwrap();

        let source = DirectoryUpdateSource::new(vec![temp.path().to_path_buf()]);
        let versions: Vec<Version> = source
            .available_versions("x")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.version)
            .collect();
        assert_eq!(versions, vec![version("2.0.0"), version("1.5.0"), version("1.0.0")]);
    }
}
