//! Plugin lifecycle hooks.
//!
//! A plugin that wants to publish services implements [`PluginActivator`].
//! During activation it receives an [`ActivationContext`] through which it
//! can read the host's services and declare its own. Declared services are
//! committed to the host registry only after `activate` returns successfully.

use crate::module::ModuleGuard;
use crate::registry::{Contract, ContractId, ServiceInstance, ServiceRef, ServiceRegistration, ServiceRegistry};
use async_trait::async_trait;
use plugforge_runtime::RuntimeResult;
use std::sync::Arc;

/// Error type returned by lifecycle hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by lifecycle hooks.
pub type HookResult = Result<(), HookError>;

/// Lifecycle hook of a plugin.
#[async_trait]
pub trait PluginActivator: Send + Sync {
    /// Called once after the plugin and all of its dependencies are loaded.
    async fn activate(&mut self, ctx: &mut ActivationContext) -> HookResult;

    /// Called before the plugin's module is released.
    async fn deactivate(&mut self) -> HookResult {
        Ok(())
    }
}

/// Services declared by a plugin while it activates.
pub struct ActivationContext {
    plugin_id: String,
    host: Arc<ServiceRegistry>,
    guard: ModuleGuard,
    registrations: Vec<ServiceRegistration>,
}

impl ActivationContext {
    pub(crate) fn new(plugin_id: String, host: Arc<ServiceRegistry>, guard: ModuleGuard) -> Self {
        Self {
            plugin_id,
            host,
            guard,
            registrations: Vec::new(),
        }
    }

    /// Id of the plugin being activated.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Read access to services already registered with the host.
    pub fn services(&self) -> &ServiceRegistry {
        &self.host
    }

    /// Resolve the highest-priority provider of a contract.
    pub fn resolve<C: Contract>(&self) -> RuntimeResult<ServiceRef<C::Service>> {
        self.host.resolve::<C>()
    }

    /// Declare a typed service.
    pub fn provide<C: Contract>(&mut self, service: Arc<C::Service>, priority: i32) {
        self.provide_instance(C::id(), ServiceInstance::new(service), priority);
    }

    /// Declare a service under a contract id.
    pub fn provide_instance(&mut self, contract: ContractId, instance: ServiceInstance, priority: i32) {
        let instance = instance.with_guard(self.guard.clone());
        self.registrations.push(ServiceRegistration::new(
            contract,
            instance,
            priority,
            Some(self.plugin_id.clone()),
        ));
    }

    /// Services declared so far.
    pub fn declared(&self) -> &[ServiceRegistration] {
        &self.registrations
    }

    pub(crate) fn into_registrations(self) -> Vec<ServiceRegistration> {
        self.registrations
    }
}
