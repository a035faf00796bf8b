//! Shared plugin bring-up and tear-down.
//!
//! [`PluginRuntime`] bundles the components that every lifecycle path
//! touches (loader, service registry, permission enforcer, manifest
//! registry, signature verifier) so that bootstrap and updates admit,
//! activate and retire plugins the same way.

use crate::loader::{IsolatedLoader, LoadedPluginInfo};
use crate::registry::{ContractId, ServiceRegistry};
use parking_lot::RwLock;
use plugforge_runtime::{
    plugin_files, PermissionEnforcer, PluginManifest, RuntimeError, RuntimeResult,
    SecurityVerdict, SignatureVerifier,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Manifests of plugins that are currently admitted, in admission order.
#[derive(Default)]
pub struct ManifestRegistry {
    manifests: RwLock<Vec<PluginManifest>>,
}

impl ManifestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a manifest, replacing any previous manifest with the same id.
    pub fn register(&self, manifest: PluginManifest) {
        let mut manifests = self.manifests.write();
        match manifests.iter_mut().find(|m| m.id == manifest.id) {
            Some(existing) => *existing = manifest,
            None => manifests.push(manifest),
        }
    }

    pub fn remove(&self, plugin_id: &str) -> Option<PluginManifest> {
        let mut manifests = self.manifests.write();
        let index = manifests.iter().position(|m| m.id == plugin_id)?;
        Some(manifests.remove(index))
    }

    pub fn get(&self, plugin_id: &str) -> Option<PluginManifest> {
        self.manifests
            .read()
            .iter()
            .find(|m| m.id == plugin_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<PluginManifest> {
        self.manifests.read().clone()
    }

    pub fn clear(&self) {
        self.manifests.write().clear();
    }
}

/// Components shared by bootstrap and the update manager.
pub struct PluginRuntime {
    pub loader: Arc<IsolatedLoader>,
    pub registry: Arc<ServiceRegistry>,
    pub permissions: Arc<PermissionEnforcer>,
    pub manifests: Arc<ManifestRegistry>,
    pub verifier: SignatureVerifier,
}

impl PluginRuntime {
    /// Run the security gate off the async executor.
    pub async fn verify(&self, manifest: &PluginManifest) -> RuntimeResult<SecurityVerdict> {
        let verifier = self.verifier.clone();
        let manifest = manifest.clone();
        let plugin_id = manifest.id.clone();
        tokio::task::spawn_blocking(move || {
            // Only a signature needs the plugin's contents.
            let files = if manifest.signature().is_some() && manifest.plugin_root().is_some() {
                plugin_files(&manifest)?
            } else {
                Vec::new()
            };
            verifier.gate(&manifest, &files)
        })
        .await
        .map_err(|e| RuntimeError::LoadFailure {
            plugin: plugin_id,
            reason: format!("security check aborted: {e}"),
        })?
    }

    /// Security gate, load, and record the manifest.
    pub async fn admit(
        &self,
        manifest: &PluginManifest,
        cancel: &CancellationToken,
    ) -> RuntimeResult<LoadedPluginInfo> {
        let verdict = self.verify(manifest).await?;
        for warning in &verdict.warnings {
            debug!("Security warning for {}: {}", manifest.id, warning);
        }

        let info = self.loader.load(manifest, cancel).await?;
        self.manifests.register(manifest.clone());
        Ok(info)
    }

    /// Grant permissions, activate, and publish the plugin's services.
    ///
    /// Returns the number of services published. If activation fails the
    /// permission grant is withdrawn again.
    pub async fn bring_up(&self, plugin_id: &str) -> RuntimeResult<usize> {
        let manifest = self
            .loader
            .manifest(plugin_id)
            .await
            .ok_or_else(|| RuntimeError::PluginNotFound(plugin_id.to_string()))?;

        self.permissions
            .register_permissions(plugin_id, manifest.permissions());

        let registrations = match self.loader.activate(plugin_id).await {
            Ok(registrations) => registrations,
            Err(e) => {
                self.permissions.revoke_permissions(plugin_id);
                return Err(e);
            }
        };

        let count = registrations.len();
        for registration in registrations {
            self.registry.insert(registration);
        }

        let published = self.registry.contracts_owned_by(plugin_id);
        for export in &manifest.exports {
            let contract = ContractId::from_name(&export.contract);
            if !published.contains(&contract) {
                warn!(
                    "Plugin {} declares export {} but did not register it",
                    plugin_id, contract
                );
            }
        }

        info!("Plugin {} is up with {} services", plugin_id, count);
        Ok(count)
    }

    /// Admit and bring up in one step, unloading again if activation fails.
    pub async fn install(
        &self,
        manifest: &PluginManifest,
        cancel: &CancellationToken,
    ) -> RuntimeResult<LoadedPluginInfo> {
        self.admit(manifest, cancel).await?;
        if let Err(e) = self.bring_up(&manifest.id).await {
            if let Err(unload_err) = self.tear_down(&manifest.id, cancel).await {
                warn!(
                    "Unloading plugin {} after failed activation also failed: {}",
                    manifest.id, unload_err
                );
            }
            return Err(e);
        }
        self.loader
            .info(&manifest.id)
            .await
            .ok_or_else(|| RuntimeError::PluginNotFound(manifest.id.clone()))
    }

    /// Unload a plugin and forget its manifest.
    pub async fn tear_down(&self, plugin_id: &str, cancel: &CancellationToken) -> RuntimeResult<()> {
        let result = self.loader.unload(plugin_id, cancel).await;
        self.manifests.remove(plugin_id);
        result
    }
}
