//! Isolated plugin loader.
//!
//! Each loaded plugin lives in its own [`IsolationBoundary`]. The loader is
//! the only owner of loaded plugins; everything else receives snapshots.
//!
//! State machine per plugin id:
//!
//! ```text
//! Unloaded -(load)-> Loading -> Loaded -(activate)-> Activating -> Activated
//! Activated -(deactivate)-> Deactivating -> Loaded
//! Loaded -(unload)-> Unloaded
//! ```
//!
//! A lifecycle hook that fails moves the plugin to `Failed`; a failed
//! plugin can only be unloaded.

use crate::activator::{ActivationContext, PluginActivator};
use crate::module::{IsolationBoundary, ModuleBackend};
use crate::registry::{ServiceRegistration, ServiceRegistry};
use chrono::{DateTime, Utc};
use plugforge_runtime::{PermissionEnforcer, PluginManifest, RuntimeError, RuntimeResult};
use semver::Version;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often reclamation is polled during unload.
const RECLAIM_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle state of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginState {
    Unloaded,
    Loading,
    Loaded,
    Activating,
    Activated,
    Deactivating,
    Failed,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginState::Unloaded => "unloaded",
            PluginState::Loading => "loading",
            PluginState::Loaded => "loaded",
            PluginState::Activating => "activating",
            PluginState::Activated => "activated",
            PluginState::Deactivating => "deactivating",
            PluginState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of a loaded plugin.
#[derive(Debug, Clone)]
pub struct LoadedPluginInfo {
    pub id: String,
    pub version: Version,
    pub boundary_id: Uuid,
    pub state: PluginState,
    pub module_path: PathBuf,
    pub loaded_at: DateTime<Utc>,
}

struct LoadedPlugin {
    manifest: PluginManifest,
    boundary: IsolationBoundary,
    activator: Option<Box<dyn PluginActivator>>,
    state: PluginState,
    module_path: PathBuf,
    loaded_at: DateTime<Utc>,
    sequence: u64,
}

impl LoadedPlugin {
    fn info(&self) -> LoadedPluginInfo {
        LoadedPluginInfo {
            id: self.manifest.id.clone(),
            version: self.manifest.version.clone(),
            boundary_id: self.boundary.id(),
            state: self.state,
            module_path: self.module_path.clone(),
            loaded_at: self.loaded_at,
        }
    }
}

#[derive(Default)]
struct LoaderTable {
    plugins: HashMap<String, LoadedPlugin>,
    next_sequence: u64,
}

/// Loads, activates and unloads plugins, one isolation boundary each.
pub struct IsolatedLoader {
    backend: Arc<dyn ModuleBackend>,
    target: String,
    registry: Arc<ServiceRegistry>,
    permissions: Arc<PermissionEnforcer>,
    unload_timeout: Duration,
    table: Mutex<LoaderTable>,
}

impl IsolatedLoader {
    pub fn new(
        backend: Arc<dyn ModuleBackend>,
        target: impl Into<String>,
        registry: Arc<ServiceRegistry>,
        permissions: Arc<PermissionEnforcer>,
        unload_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            target: target.into(),
            registry,
            permissions,
            unload_timeout,
            table: Mutex::new(LoaderTable::default()),
        }
    }

    /// Runtime target whose entry points this loader opens.
    pub fn target(&self) -> &str {
        &self.target
    }

    fn entry_path(&self, manifest: &PluginManifest) -> RuntimeResult<PathBuf> {
        match manifest.entry_point(&self.target) {
            Some(path) if !self.backend.requires_file() || path.is_file() => Ok(path.to_path_buf()),
            Some(path) => Err(RuntimeError::ModuleNotFound {
                plugin: manifest.id.clone(),
                detail: format!("{} does not exist", path.display()),
            }),
            None if !self.backend.requires_file() => Ok(PathBuf::from(&manifest.id)),
            None => Err(RuntimeError::ModuleNotFound {
                plugin: manifest.id.clone(),
                detail: format!("no entry point for target '{}'", self.target),
            }),
        }
    }

    /// Load a plugin's module into a fresh isolation boundary.
    pub async fn load(
        &self,
        manifest: &PluginManifest,
        cancel: &CancellationToken,
    ) -> RuntimeResult<LoadedPluginInfo> {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled(format!("load of {}", manifest.id)));
        }

        let mut table = self.table.lock().await;
        if table.plugins.contains_key(&manifest.id) {
            return Err(RuntimeError::AlreadyLoaded(manifest.id.clone()));
        }

        info!(
            "Loading plugin: {} v{} ({})",
            manifest.display_name(),
            manifest.version,
            self.backend.name()
        );
        let entry = self.entry_path(manifest)?;
        let module = self.backend.open(manifest, &entry).map_err(|e| match e {
            e @ (RuntimeError::ModuleNotFound { .. } | RuntimeError::LoadFailure { .. }) => e,
            other => RuntimeError::LoadFailure {
                plugin: manifest.id.clone(),
                reason: other.to_string(),
            },
        })?;

        if cancel.is_cancelled() {
            // Dropping the module here leaves the plugin unloaded.
            return Err(RuntimeError::Cancelled(format!("load of {}", manifest.id)));
        }

        let sequence = table.next_sequence;
        table.next_sequence += 1;
        let plugin = LoadedPlugin {
            manifest: manifest.clone(),
            boundary: IsolationBoundary::new(manifest.key(), module.handle),
            activator: module.activator,
            state: PluginState::Loaded,
            module_path: entry,
            loaded_at: Utc::now(),
            sequence,
        };
        let info = plugin.info();
        debug!(
            "Plugin {} bound to boundary {} (lifecycle hook: {})",
            manifest.id,
            info.boundary_id,
            plugin.activator.is_some()
        );
        table.plugins.insert(manifest.id.clone(), plugin);
        Ok(info)
    }

    /// Run the plugin's activation hook and return the services it declared.
    ///
    /// The caller decides when the declared services become visible in the
    /// registry.
    pub async fn activate(&self, plugin_id: &str) -> RuntimeResult<Vec<ServiceRegistration>> {
        let (activator, mut ctx) = {
            let mut table = self.table.lock().await;
            let plugin = table
                .plugins
                .get_mut(plugin_id)
                .ok_or_else(|| RuntimeError::PluginNotFound(plugin_id.to_string()))?;
            if plugin.state != PluginState::Loaded {
                return Err(RuntimeError::InvalidState {
                    plugin: plugin_id.to_string(),
                    state: plugin.state.to_string(),
                    operation: "activate",
                });
            }
            plugin.state = PluginState::Activating;
            let ctx = ActivationContext::new(
                plugin_id.to_string(),
                Arc::clone(&self.registry),
                plugin.boundary.guard(),
            );
            (plugin.activator.take(), ctx)
        };

        // The hook runs without the table lock so it may call back into the host.
        let (activator, outcome) = match activator {
            Some(mut activator) => {
                let outcome = activator.activate(&mut ctx).await;
                (Some(activator), outcome)
            }
            None => (None, Ok(())),
        };

        let mut table = self.table.lock().await;
        let plugin = table
            .plugins
            .get_mut(plugin_id)
            .ok_or_else(|| RuntimeError::PluginNotFound(plugin_id.to_string()))?;
        plugin.activator = activator;

        match outcome {
            Ok(()) => {
                plugin.state = PluginState::Activated;
                info!("Activated plugin: {}", plugin_id);
                Ok(ctx.into_registrations())
            }
            Err(e) => {
                plugin.state = PluginState::Failed;
                error!("Activation of plugin {} failed: {}", plugin_id, e);
                Err(RuntimeError::ActivationFailed {
                    plugin: plugin_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Run the plugin's deactivation hook and withdraw its services.
    pub async fn deactivate(&self, plugin_id: &str) -> RuntimeResult<()> {
        let activator = {
            let mut table = self.table.lock().await;
            let plugin = table
                .plugins
                .get_mut(plugin_id)
                .ok_or_else(|| RuntimeError::PluginNotFound(plugin_id.to_string()))?;
            if plugin.state != PluginState::Activated {
                return Err(RuntimeError::InvalidState {
                    plugin: plugin_id.to_string(),
                    state: plugin.state.to_string(),
                    operation: "deactivate",
                });
            }
            plugin.state = PluginState::Deactivating;
            plugin.activator.take()
        };

        self.registry.unregister_owner(plugin_id);

        let (activator, outcome) = match activator {
            Some(mut activator) => {
                let outcome = activator.deactivate().await;
                (Some(activator), outcome)
            }
            None => (None, Ok(())),
        };

        let mut table = self.table.lock().await;
        let plugin = table
            .plugins
            .get_mut(plugin_id)
            .ok_or_else(|| RuntimeError::PluginNotFound(plugin_id.to_string()))?;
        plugin.activator = activator;

        match outcome {
            Ok(()) => {
                plugin.state = PluginState::Loaded;
                info!("Deactivated plugin: {}", plugin_id);
                Ok(())
            }
            Err(e) => {
                plugin.state = PluginState::Failed;
                Err(RuntimeError::ActivationFailed {
                    plugin: plugin_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Tear down a plugin's boundary and wait until its module is reclaimed.
    ///
    /// An activated plugin is deactivated first. Services owned by the plugin
    /// and its permission grant are dropped before waiting. The plugin is
    /// `Unloaded` when this returns, even on error; an error means the module
    /// may still be resident.
    pub async fn unload(&self, plugin_id: &str, cancel: &CancellationToken) -> RuntimeResult<()> {
        if self.state(plugin_id).await == PluginState::Activated {
            if let Err(e) = self.deactivate(plugin_id).await {
                warn!("Deactivation of plugin {} failed during unload: {}", plugin_id, e);
            }
        }

        let plugin = {
            let mut table = self.table.lock().await;
            let plugin = table
                .plugins
                .get(plugin_id)
                .ok_or_else(|| RuntimeError::PluginNotFound(plugin_id.to_string()))?;
            if matches!(
                plugin.state,
                PluginState::Activating | PluginState::Deactivating
            ) {
                return Err(RuntimeError::InvalidState {
                    plugin: plugin_id.to_string(),
                    state: plugin.state.to_string(),
                    operation: "unload",
                });
            }
            table
                .plugins
                .remove(plugin_id)
                .ok_or_else(|| RuntimeError::PluginNotFound(plugin_id.to_string()))?
        };

        self.registry.unregister_owner(plugin_id);
        self.permissions.revoke_permissions(plugin_id);

        let LoadedPlugin {
            manifest,
            boundary,
            activator,
            ..
        } = plugin;
        // Hook code lives in the module, so it goes before the module does.
        drop(activator);

        let quiesce = Duration::from_secs(manifest.quiesce_seconds);
        if !quiesce.is_zero() {
            debug!("Quiescing plugin {} for {:?}", plugin_id, quiesce);
            tokio::select! {
                _ = tokio::time::sleep(quiesce) => {}
                _ = cancel.cancelled() => {
                    debug!("Quiesce of plugin {} cut short by cancellation", plugin_id);
                }
            }
        }

        let boundary_id = boundary.id();
        let probe = boundary.release();
        let deadline = tokio::time::Instant::now() + self.unload_timeout;
        while !probe.is_reclaimed() {
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled(format!("unload of {}", plugin_id)));
            }
            if tokio::time::Instant::now() >= deadline {
                error!(
                    "Boundary {} of plugin {} still referenced after {:?}",
                    boundary_id, plugin_id, self.unload_timeout
                );
                return Err(RuntimeError::UnloadTimeout {
                    plugin: plugin_id.to_string(),
                    timeout: self.unload_timeout,
                });
            }
            tokio::time::sleep(RECLAIM_POLL_INTERVAL).await;
        }

        info!("Unloaded plugin: {} (boundary {})", plugin_id, boundary_id);
        Ok(())
    }

    /// Unload and load again with the same manifest.
    ///
    /// If the load fails the plugin stays `Unloaded`.
    pub async fn reload(
        &self,
        plugin_id: &str,
        cancel: &CancellationToken,
    ) -> RuntimeResult<LoadedPluginInfo> {
        let manifest = self
            .manifest(plugin_id)
            .await
            .ok_or_else(|| RuntimeError::PluginNotFound(plugin_id.to_string()))?;

        self.unload(plugin_id, cancel).await?;
        self.load(&manifest, cancel).await.map_err(|e| {
            warn!("Reload of plugin {} failed, plugin left unloaded: {}", plugin_id, e);
            e
        })
    }

    pub async fn state(&self, plugin_id: &str) -> PluginState {
        self.table
            .lock()
            .await
            .plugins
            .get(plugin_id)
            .map_or(PluginState::Unloaded, |p| p.state)
    }

    pub async fn manifest(&self, plugin_id: &str) -> Option<PluginManifest> {
        self.table
            .lock()
            .await
            .plugins
            .get(plugin_id)
            .map(|p| p.manifest.clone())
    }

    pub async fn info(&self, plugin_id: &str) -> Option<LoadedPluginInfo> {
        self.table.lock().await.plugins.get(plugin_id).map(LoadedPlugin::info)
    }

    /// Snapshots of every resident plugin, in load order.
    pub async fn loaded_plugins(&self) -> Vec<LoadedPluginInfo> {
        let table = self.table.lock().await;
        let mut plugins: Vec<&LoadedPlugin> = table.plugins.values().collect();
        plugins.sort_by_key(|p| p.sequence);
        plugins.into_iter().map(LoadedPlugin::info).collect()
    }

    pub async fn is_loaded(&self, plugin_id: &str) -> bool {
        self.table.lock().await.plugins.contains_key(plugin_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activator::HookResult;
    use crate::module::StaticModuleBackend;
    use crate::registry::{ContractId, ServiceInstance};
    use async_trait::async_trait;

    struct Publisher;

    #[async_trait]
    impl PluginActivator for Publisher {
        async fn activate(&mut self, ctx: &mut ActivationContext) -> HookResult {
            ctx.provide_instance(ContractId::Audio, ServiceInstance::new(Arc::new(7u32)), 1);
            Ok(())
        }
    }

    fn manifest(id: &str) -> PluginManifest {
        let mut m = PluginManifest::new(id, Version::new(1, 0, 0));
        m.quiesce_seconds = 0;
        m
    }

    fn loader(backend: StaticModuleBackend) -> IsolatedLoader {
        IsolatedLoader::new(
            Arc::new(backend),
            "native",
            Arc::new(ServiceRegistry::new()),
            Arc::new(PermissionEnforcer::new()),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_state_machine() {
        let backend = StaticModuleBackend::new().with("p", |_| {
            Ok(Some(Box::new(Publisher) as Box<dyn PluginActivator>))
        });
        let loader = loader(backend);
        let cancel = CancellationToken::new();

        assert_eq!(loader.state("p").await, PluginState::Unloaded);
        loader.load(&manifest("p"), &cancel).await.unwrap();
        assert_eq!(loader.state("p").await, PluginState::Loaded);

        assert!(matches!(
            loader.load(&manifest("p"), &cancel).await,
            Err(RuntimeError::AlreadyLoaded(_))
        ));
        assert!(matches!(
            loader.deactivate("p").await,
            Err(RuntimeError::InvalidState { .. })
        ));

        let registrations = loader.activate("p").await.unwrap();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].owner.as_deref(), Some("p"));
        assert_eq!(loader.state("p").await, PluginState::Activated);

        loader.deactivate("p").await.unwrap();
        assert_eq!(loader.state("p").await, PluginState::Loaded);

        loader.unload("p", &cancel).await.unwrap();
        assert_eq!(loader.state("p").await, PluginState::Unloaded);
        assert!(loader.loaded_plugins().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_module() {
        let loader = loader(StaticModuleBackend::new());
        let result = loader.load(&manifest("ghost"), &CancellationToken::new()).await;
        assert!(matches!(result, Err(RuntimeError::ModuleNotFound { .. })));
        assert_eq!(loader.state("ghost").await, PluginState::Unloaded);
    }

    #[tokio::test]
    async fn test_cancelled_load_leaves_plugin_unloaded() {
        let backend = StaticModuleBackend::new().with("p", |_| Ok(None));
        let loader = loader(backend);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = loader.load(&manifest("p"), &cancel).await;
        assert!(matches!(result, Err(RuntimeError::Cancelled(_))));
        assert!(!loader.is_loaded("p").await);
    }

    #[tokio::test]
    async fn test_reload_gets_new_boundary() {
        let backend = StaticModuleBackend::new().with("p", |_| Ok(None));
        let loader = loader(backend);
        let cancel = CancellationToken::new();

        let first = loader.load(&manifest("p"), &cancel).await.unwrap();
        let second = loader.reload("p", &cancel).await.unwrap();
        assert_ne!(first.boundary_id, second.boundary_id);
        assert_eq!(second.state, PluginState::Loaded);
    }
}
