//! Host bootstrap.
//!
//! [`HostBootstrap`] owns the host's plugin components and drives them
//! through startup and shutdown:
//!
//! 1. Register the host's own services
//! 2. Discover manifests, or synthesise them from the legacy plugin list
//! 3. Validate dependencies and compute the load order
//! 4. Security-check and load every plugin, in order
//! 5. Activate every loaded plugin, in the same order
//!
//! Shutdown deactivates every plugin in reverse order and then unloads them,
//! again in reverse order.

use crate::config::HostConfig;
use crate::loader::{IsolatedLoader, LoadedPluginInfo, PluginState};
use crate::module::{ModuleBackend, NativeModuleBackend};
use crate::registry::{Contract, ContractId, ServiceRegistry};
use crate::runtime::{ManifestRegistry, PluginRuntime};
use crate::update::{DirectoryUpdateSource, UpdateEvent, UpdateInfo, UpdateManager, UpdateSource, UpdateType};
use parking_lot::{Mutex, RwLock};
use plugforge_runtime::{
    default_plugin_dirs, discover_plugins, manifests_from_legacy, resolve_load_order,
    validate_dependencies, DiscoveryReport, LoadStrategy, PermissionEnforcer, PluginManifest,
    PluginPriority, RuntimeError, RuntimeResult, SignatureVerifier,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Owner recorded on services the host registers itself.
pub const HOST_OWNER: &str = "host";

/// Priority of the host's own services.
const HOST_SERVICE_PRIORITY: i32 = 1000;

// ============================================================================
// Intrinsic contracts
// ============================================================================

pub struct RegistryContract;

impl Contract for RegistryContract {
    type Service = ServiceRegistry;

    fn id() -> ContractId {
        ContractId::Registry
    }
}

pub struct PluginLoaderContract;

impl Contract for PluginLoaderContract {
    type Service = IsolatedLoader;

    fn id() -> ContractId {
        ContractId::PluginLoader
    }
}

pub struct PermissionEnforcerContract;

impl Contract for PermissionEnforcerContract {
    type Service = PermissionEnforcer;

    fn id() -> ContractId {
        ContractId::PermissionEnforcer
    }
}

pub struct ManifestRegistryContract;

impl Contract for ManifestRegistryContract {
    type Service = ManifestRegistry;

    fn id() -> ContractId {
        ContractId::ManifestRegistry
    }
}

pub struct ConfigContract;

impl Contract for ConfigContract {
    type Service = HostConfig;

    fn id() -> ContractId {
        ContractId::Config
    }
}

// ============================================================================
// HostBootstrap
// ============================================================================

/// Outcome of [`HostBootstrap::boot`].
#[derive(Debug, Default)]
pub struct BootReport {
    /// Activated plugins, in activation order.
    pub activated: Vec<String>,

    /// Plugins that failed to load or activate, with the reason.
    pub failed: Vec<(String, String)>,

    /// Explicit plugins left for [`HostBootstrap::load_explicit`].
    pub deferred: Vec<String>,

    /// Plugins skipped because of their profile list.
    pub skipped: Vec<String>,

    /// Manifests that could not be parsed.
    pub discovery_errors: usize,
}

pub struct HostBootstrap {
    config: Arc<HostConfig>,
    runtime: Arc<PluginRuntime>,
    updates: Arc<UpdateManager>,
    boot_order: RwLock<Vec<String>>,
    deferred: RwLock<Vec<PluginManifest>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl HostBootstrap {
    /// Create a host that loads native modules and updates from its plugin
    /// directories.
    pub fn new(config: HostConfig) -> RuntimeResult<Self> {
        let source = Arc::new(DirectoryUpdateSource::new(plugin_dirs(&config)));
        Self::with_components(config, Arc::new(NativeModuleBackend::new()), source)
    }

    pub fn with_components(
        config: HostConfig,
        backend: Arc<dyn ModuleBackend>,
        source: Arc<dyn UpdateSource>,
    ) -> RuntimeResult<Self> {
        let host_version = config.host_version()?;

        let mut verifier = SignatureVerifier::new();
        for key in config.trusted_keys()? {
            verifier.add_trusted_key(&key);
        }

        let registry = Arc::new(ServiceRegistry::new());
        let permissions = Arc::new(PermissionEnforcer::new());
        let loader = Arc::new(IsolatedLoader::new(
            backend,
            config.host.runtime_target.clone(),
            Arc::clone(&registry),
            Arc::clone(&permissions),
            config.unload_timeout(),
        ));
        let runtime = Arc::new(PluginRuntime {
            loader,
            registry,
            permissions,
            manifests: Arc::new(ManifestRegistry::new()),
            verifier,
        });
        let updates = Arc::new(UpdateManager::new(
            Arc::clone(&runtime),
            source,
            host_version,
            config.plugins.history_retention,
        ));

        Ok(Self {
            config: Arc::new(config),
            runtime,
            updates,
            boot_order: RwLock::new(Vec::new()),
            deferred: RwLock::new(Vec::new()),
            event_task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<PluginRuntime> {
        &self.runtime
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.runtime.registry
    }

    pub fn updates(&self) -> &Arc<UpdateManager> {
        &self.updates
    }

    /// Activated plugins, in activation order.
    pub fn boot_order(&self) -> Vec<String> {
        self.boot_order.read().clone()
    }

    /// Ids of explicit plugins that have not been loaded yet.
    pub fn deferred(&self) -> Vec<String> {
        self.deferred.read().iter().map(|m| m.id.clone()).collect()
    }

    /// Start the host.
    ///
    /// # Errors
    ///
    /// Fails on dependency violations, on an unresolvable load order, on
    /// cancellation, and when a `Critical` plugin cannot be brought up. In
    /// the last two cases everything loaded so far is shut down first.
    pub async fn boot(&self, cancel: &CancellationToken) -> RuntimeResult<BootReport> {
        info!(
            "Booting plugin host v{} (profile '{}', target '{}')",
            self.config.host.version, self.config.host.profile, self.config.host.runtime_target
        );
        let host_version = self.config.host_version()?;
        self.register_intrinsics();

        let mut report = BootReport::default();
        let discovered = self.discover(cancel).await?;
        report.discovery_errors = discovered.errors.len();
        let manifests = self.select_sources(discovered);

        let profile = self.config.host.profile.as_str();
        let (manifests, skipped): (Vec<_>, Vec<_>) = manifests
            .into_iter()
            .partition(|m| supports_profile(m, profile));
        for manifest in &skipped {
            info!("Skipping plugin {}: not for profile '{}'", manifest.id, profile);
        }
        report.skipped = skipped.into_iter().map(|m| m.id).collect();

        // Validation must see the same candidates the resolver will pick from.
        let manifests: Vec<PluginManifest> = manifests
            .into_iter()
            .filter(|m| {
                let ok = m.is_compatible_with(&host_version);
                if !ok {
                    info!(
                        "Skipping plugin {} v{}: not compatible with host {}",
                        m.id, m.version, host_version
                    );
                }
                ok
            })
            .collect();

        validate_dependencies(&manifests).into_result()?;
        let order = resolve_load_order(&manifests, &host_version)?;

        let (order, deferred) = split_explicit(order);
        report.deferred = deferred.iter().map(|m| m.id.clone()).collect();
        for manifest in &deferred {
            debug!("Deferring explicit plugin {}", manifest.id);
        }
        *self.deferred.write() = deferred;

        // Load everything first so activation sees every module resident.
        let mut failed: HashSet<String> = HashSet::new();
        let mut admitted: Vec<&PluginManifest> = Vec::new();
        for manifest in &order {
            if let Some(dep) = failed_dependency(manifest, &failed) {
                warn!("Skipping plugin {}: dependency {} failed", manifest.id, dep);
                report.failed.push((manifest.id.clone(), format!("dependency {dep} failed")));
                failed.insert(manifest.id.clone());
                continue;
            }

            match self.runtime.admit(manifest, cancel).await {
                Ok(info) => {
                    debug!("Admitted plugin {} into boundary {}", info.id, info.boundary_id);
                    admitted.push(manifest);
                }
                Err(e) => {
                    self.handle_boot_failure(manifest, &e).await?;
                    report.failed.push((manifest.id.clone(), e.to_string()));
                    failed.insert(manifest.id.clone());
                }
            }
        }

        for manifest in admitted {
            if let Some(dep) = failed_dependency(manifest, &failed) {
                warn!("Not activating plugin {}: dependency {} failed", manifest.id, dep);
                self.discard(&manifest.id).await;
                report.failed.push((manifest.id.clone(), format!("dependency {dep} failed")));
                failed.insert(manifest.id.clone());
                continue;
            }

            match self.runtime.bring_up(&manifest.id).await {
                Ok(_) => {
                    self.boot_order.write().push(manifest.id.clone());
                    report.activated.push(manifest.id.clone());
                }
                Err(e) => {
                    self.discard(&manifest.id).await;
                    self.handle_boot_failure(manifest, &e).await?;
                    report.failed.push((manifest.id.clone(), e.to_string()));
                    failed.insert(manifest.id.clone());
                }
            }
        }

        self.spawn_event_logger();

        info!(
            "Plugin host ready: {} activated, {} failed, {} deferred",
            report.activated.len(),
            report.failed.len(),
            report.deferred.len()
        );
        Ok(report)
    }

    /// Load and activate an explicit plugin that boot deferred.
    ///
    /// Its dependencies must already be activated.
    pub async fn load_explicit(
        &self,
        plugin_id: &str,
        cancel: &CancellationToken,
    ) -> RuntimeResult<LoadedPluginInfo> {
        let manifest = self
            .deferred
            .read()
            .iter()
            .find(|m| m.id == plugin_id)
            .cloned()
            .ok_or_else(|| RuntimeError::PluginNotFound(plugin_id.to_string()))?;

        for dependency in manifest.dependencies.keys() {
            if self.runtime.loader.state(dependency).await != PluginState::Activated {
                return Err(RuntimeError::UnsatisfiedDependency {
                    plugin: plugin_id.to_string(),
                    dependency: dependency.clone(),
                });
            }
        }

        let info = self.runtime.install(&manifest, cancel).await?;
        self.deferred.write().retain(|m| m.id != plugin_id);
        self.boot_order.write().push(plugin_id.to_string());
        Ok(info)
    }

    /// Ask the update manager about every resident plugin.
    ///
    /// Plugins with auto-update enabled are updated right away.
    pub async fn check_for_updates(&self, cancel: &CancellationToken) -> Vec<UpdateInfo> {
        let mut available = Vec::new();

        for plugin in self.runtime.loader.loaded_plugins().await {
            if cancel.is_cancelled() {
                debug!("Update check cancelled");
                break;
            }

            let info = match self.updates.check_for_updates(&plugin.id).await {
                Ok(Some(info)) => info,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Update check for plugin {} failed: {}", plugin.id, e);
                    continue;
                }
            };

            if self.updates.is_auto_update(&plugin.id) {
                match self
                    .updates
                    .update_with_type(&plugin.id, &info.available_version, UpdateType::Automatic)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => warn!("Automatic update of plugin {} was rolled back", plugin.id),
                    Err(e) => error!("Automatic update of plugin {} failed: {}", plugin.id, e),
                }
            }
            available.push(info);
        }

        available
    }

    /// Stop every plugin and release the host's services.
    pub async fn shutdown(&self) {
        info!("Shutting down plugin host");
        let loader = &self.runtime.loader;

        let mut order = std::mem::take(&mut *self.boot_order.write());
        // Plugins swapped in by updates keep their id; anything else goes last.
        for plugin in loader.loaded_plugins().await {
            if !order.contains(&plugin.id) {
                order.insert(0, plugin.id);
            }
        }

        for plugin_id in order.iter().rev() {
            if loader.state(plugin_id).await == PluginState::Activated {
                if let Err(e) = loader.deactivate(plugin_id).await {
                    warn!("Failed to deactivate plugin {}: {}", plugin_id, e);
                }
            }
        }

        let cancel = CancellationToken::new();
        for plugin_id in order.iter().rev() {
            if let Err(e) = self.runtime.tear_down(plugin_id, &cancel).await {
                warn!("Failed to unload plugin {}: {}", plugin_id, e);
            }
        }

        // The registry holds itself among the intrinsic services.
        self.runtime.registry.unregister_owner(HOST_OWNER);
        self.runtime.manifests.clear();

        self.shutdown.cancel();
        let task = self.event_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                debug!("Update event logger ended abnormally: {}", e);
            }
        }
        info!("Plugin host stopped");
    }

    fn register_intrinsics(&self) {
        let registry = &self.runtime.registry;
        let owner = Some(HOST_OWNER);
        registry.provide::<RegistryContract>(Arc::clone(registry), HOST_SERVICE_PRIORITY, owner);
        registry.provide::<PluginLoaderContract>(
            Arc::clone(&self.runtime.loader),
            HOST_SERVICE_PRIORITY,
            owner,
        );
        registry.provide::<PermissionEnforcerContract>(
            Arc::clone(&self.runtime.permissions),
            HOST_SERVICE_PRIORITY,
            owner,
        );
        registry.provide::<ManifestRegistryContract>(
            Arc::clone(&self.runtime.manifests),
            HOST_SERVICE_PRIORITY,
            owner,
        );
        registry.provide::<ConfigContract>(Arc::clone(&self.config), HOST_SERVICE_PRIORITY, owner);
        debug!("Registered intrinsic host services");
    }

    async fn discover(&self, cancel: &CancellationToken) -> RuntimeResult<DiscoveryReport> {
        let roots = plugin_dirs(&self.config);
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || discover_plugins(&roots, &cancel))
            .await
            .map_err(|e| RuntimeError::Cancelled(format!("plugin discovery: {e}")))?
    }

    /// Discovered manifests, or the legacy list when forced or when
    /// discovery found nothing.
    fn select_sources(&self, discovered: DiscoveryReport) -> Vec<PluginManifest> {
        let legacy = &self.config.plugins.legacy;
        if self.config.plugins.force_legacy || (discovered.is_empty() && !legacy.is_empty()) {
            info!("Using {} legacy plugin entries", legacy.len());
            return manifests_from_legacy(legacy);
        }
        discovered.manifests
    }

    /// Decide whether a failed plugin aborts the boot.
    async fn handle_boot_failure(
        &self,
        manifest: &PluginManifest,
        error: &RuntimeError,
    ) -> RuntimeResult<()> {
        let fatal = manifest.priority == PluginPriority::Critical
            || matches!(error, RuntimeError::Cancelled(_));
        if !fatal {
            warn!("Plugin {} failed and will be skipped: {}", manifest.id, error);
            return Ok(());
        }

        error!("Plugin {} failed, aborting boot: {}", manifest.id, error);
        self.shutdown().await;
        Err(match error {
            RuntimeError::Cancelled(what) => RuntimeError::Cancelled(what.clone()),
            other => RuntimeError::LoadFailure {
                plugin: manifest.id.clone(),
                reason: format!("critical plugin failed: {other}"),
            },
        })
    }

    /// Unload a plugin that will not be activated.
    async fn discard(&self, plugin_id: &str) {
        if let Err(e) = self
            .runtime
            .tear_down(plugin_id, &CancellationToken::new())
            .await
        {
            warn!("Failed to unload plugin {}: {}", plugin_id, e);
        }
    }

    fn spawn_event_logger(&self) {
        let mut events = self.updates.subscribe();
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => log_update_event(&event),
                        Err(RecvError::Lagged(missed)) => {
                            warn!("Update event logger missed {} events", missed);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("Update event logger stopped");
        });

        if let Some(previous) = self.event_task.lock().replace(task) {
            previous.abort();
        }
    }
}

fn log_update_event(event: &UpdateEvent) {
    match event {
        UpdateEvent::UpdateAvailable(info) => info!(
            "Update available: {} v{} -> v{}",
            info.plugin_id, info.current_version, info.available_version
        ),
        UpdateEvent::UpdateStarted {
            plugin_id,
            from_version,
            to_version,
        } => info!("Update started: {} v{} -> v{}", plugin_id, from_version, to_version),
        UpdateEvent::UpdateCompleted(record) => info!(
            "Update completed: {} v{} -> v{} in {}ms",
            record.plugin_id, record.from_version, record.to_version, record.duration_ms
        ),
        UpdateEvent::UpdateFailed(record) => warn!(
            "Update failed: {} v{} -> v{}: {}",
            record.plugin_id,
            record.from_version,
            record.to_version,
            record.error_message.as_deref().unwrap_or("unknown error")
        ),
    }
}

/// Configured plugin roots, or the platform defaults.
pub fn plugin_dirs(config: &HostConfig) -> Vec<PathBuf> {
    if config.plugins.directories.is_empty() {
        default_plugin_dirs()
    } else {
        config.plugins.directories.clone()
    }
}

fn supports_profile(manifest: &PluginManifest, profile: &str) -> bool {
    let listed = |profiles: &[String]| profiles.is_empty() || profiles.iter().any(|p| p == profile);
    let required = manifest
        .compatibility
        .as_ref()
        .map_or(&[][..], |c| c.required_profiles.as_slice());
    listed(&manifest.supported_profiles) && listed(required)
}

/// Split explicit plugins that nothing loaded at boot depends on.
///
/// `order` lists dependencies before dependents, so walking it backwards
/// sees every dependent before its dependencies.
fn split_explicit(order: Vec<PluginManifest>) -> (Vec<PluginManifest>, Vec<PluginManifest>) {
    let mut needed: HashSet<String> = HashSet::new();
    let mut boot = Vec::new();
    let mut deferred = Vec::new();

    for manifest in order.into_iter().rev() {
        if manifest.load_strategy == LoadStrategy::Explicit && !needed.contains(&manifest.id) {
            deferred.push(manifest);
            continue;
        }
        needed.extend(manifest.dependencies.keys().cloned());
        boot.push(manifest);
    }

    boot.reverse();
    deferred.reverse();
    (boot, deferred)
}

fn failed_dependency<'a>(manifest: &'a PluginManifest, failed: &HashSet<String>) -> Option<&'a str> {
    manifest
        .dependencies
        .keys()
        .find(|dep| failed.contains(*dep))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;

    fn manifest(id: &str, deps: &[&str], strategy: LoadStrategy) -> PluginManifest {
        let mut m = PluginManifest::new(id, Version::new(1, 0, 0));
        m.load_strategy = strategy;
        for dep in deps {
            m.dependencies.insert(dep.to_string(), "*".to_string());
        }
        m
    }

    #[test]
    fn test_split_explicit_keeps_needed_dependencies() {
        let order = vec![
            manifest("base", &[], LoadStrategy::Explicit),
            manifest("tool", &[], LoadStrategy::Explicit),
            manifest("app", &["base"], LoadStrategy::Eager),
        ];

        let (boot, deferred) = split_explicit(order);
        let boot: Vec<_> = boot.iter().map(|m| m.id.as_str()).collect();
        let deferred: Vec<_> = deferred.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(boot, vec!["base", "app"]);
        assert_eq!(deferred, vec!["tool"]);
    }

    #[test]
    fn test_profile_filter() {
        let mut m = manifest("p", &[], LoadStrategy::Lazy);
        assert!(supports_profile(&m, "server"));

        m.supported_profiles = vec!["desktop".to_string()];
        assert!(!supports_profile(&m, "server"));
        assert!(supports_profile(&m, "desktop"));
    }

    #[test]
    fn test_plugin_dirs_prefers_configuration() {
        let mut config = HostConfig::default();
        config.plugins.directories = vec![PathBuf::from("/opt/plugins")];
        assert_eq!(plugin_dirs(&config), vec![PathBuf::from("/opt/plugins")]);
    }
}
