//! Service registry for capabilities published by the host and its plugins.
//!
//! Services are registered against a [`ContractId`] with a priority.
//! Single-result lookups return the highest-priority registration; among
//! equal priorities the earliest registration wins. Registrations are
//! additive: a higher-priority provider loaded later displaces an earlier
//! one for single-result consumers without either being unregistered.

use crate::module::ModuleGuard;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use plugforge_runtime::{RuntimeError, RuntimeResult};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Identifies a capability contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContractId {
    Registry,
    PluginLoader,
    PermissionEnforcer,
    ManifestRegistry,
    Config,
    Resource,
    Diagnostics,
    Render,
    Game,
    Ecs,
    TerminalApp,
    WebSocket,
    Pty,
    Audio,
    Custom(String),
}

impl ContractId {
    pub fn as_str(&self) -> &str {
        match self {
            ContractId::Registry => "registry",
            ContractId::PluginLoader => "plugin_loader",
            ContractId::PermissionEnforcer => "permission_enforcer",
            ContractId::ManifestRegistry => "manifest_registry",
            ContractId::Config => "config",
            ContractId::Resource => "resource",
            ContractId::Diagnostics => "diagnostics",
            ContractId::Render => "render",
            ContractId::Game => "game",
            ContractId::Ecs => "ecs",
            ContractId::TerminalApp => "terminal_app",
            ContractId::WebSocket => "websocket",
            ContractId::Pty => "pty",
            ContractId::Audio => "audio",
            ContractId::Custom(name) => name,
        }
    }

    /// Map a contract name to its id; unknown names become `Custom`.
    pub fn from_name(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "registry" => ContractId::Registry,
            "plugin_loader" | "pluginloader" => ContractId::PluginLoader,
            "permission_enforcer" | "permissionenforcer" => ContractId::PermissionEnforcer,
            "manifest_registry" | "manifestregistry" => ContractId::ManifestRegistry,
            "config" => ContractId::Config,
            "resource" => ContractId::Resource,
            "diagnostics" => ContractId::Diagnostics,
            "render" => ContractId::Render,
            "game" => ContractId::Game,
            "ecs" => ContractId::Ecs,
            "terminal_app" | "terminalapp" => ContractId::TerminalApp,
            "websocket" | "web_socket" => ContractId::WebSocket,
            "pty" => ContractId::Pty,
            "audio" => ContractId::Audio,
            _ => ContractId::Custom(s.to_string()),
        }
    }
}

impl FromStr for ContractId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binds a [`ContractId`] to the service type published under it.
///
/// ```ignore
/// struct RenderContract;
/// impl Contract for RenderContract {
///     type Service = dyn Renderer;
///     fn id() -> ContractId { ContractId::Render }
/// }
/// ```
pub trait Contract: 'static {
    type Service: ?Sized + Send + Sync + 'static;

    fn id() -> ContractId;
}

/// Type-erased service value.
///
/// Instances compare by identity. An instance published by a plugin carries
/// a guard that keeps the plugin's module resident.
#[derive(Clone)]
pub struct ServiceInstance {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    guard: Option<ModuleGuard>,
}

impl ServiceInstance {
    pub fn new<T: ?Sized + Send + Sync + 'static>(service: Arc<T>) -> Self {
        Self {
            value: Arc::new(service),
            type_name: std::any::type_name::<T>(),
            guard: None,
        }
    }

    pub(crate) fn with_guard(mut self, guard: ModuleGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Recover the service if it was registered as `Arc<T>`.
    ///
    /// The returned reference keeps the owner's module resident.
    pub fn downcast<T: ?Sized + Send + Sync + 'static>(&self) -> Option<ServiceRef<T>> {
        let service = self.value.downcast_ref::<Arc<T>>()?;
        Some(ServiceRef {
            service: Arc::clone(service),
            _guard: self.guard.clone(),
        })
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Identity comparison.
    pub fn same_as(&self, other: &ServiceInstance) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInstance")
            .field("type", &self.type_name)
            .field("owner_module", &self.guard.as_ref().map(|g| g.plugin_id()))
            .finish()
    }
}

/// A resolved service. Holding it keeps the providing plugin's module resident.
pub struct ServiceRef<T: ?Sized> {
    service: Arc<T>,
    _guard: Option<ModuleGuard>,
}

impl<T: ?Sized> Clone for ServiceRef<T> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            _guard: self._guard.clone(),
        }
    }
}

impl<T: ?Sized> Deref for ServiceRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.service
    }
}

/// How `get` chooses among several registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionMode {
    /// Exactly one registration is expected.
    One,
    #[default]
    HighestPriority,
}

/// A service registered under a contract.
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    pub contract: ContractId,
    pub instance: ServiceInstance,
    pub priority: i32,
    /// Plugin that published the service; `None` for host services.
    pub owner: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl ServiceRegistration {
    pub fn new(
        contract: ContractId,
        instance: ServiceInstance,
        priority: i32,
        owner: Option<String>,
    ) -> Self {
        Self {
            contract,
            instance,
            priority,
            owner,
            registered_at: Utc::now(),
        }
    }
}

/// Metadata about a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMetadata {
    pub priority: i32,
    pub owner: Option<String>,
    pub registered_at: DateTime<Utc>,
}

/// Registry of services keyed by contract.
pub struct ServiceRegistry {
    services: RwLock<HashMap<ContractId, Vec<ServiceRegistration>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
        }
    }

    // ==========================================================================
    // Untyped API
    // ==========================================================================

    /// Register a service instance.
    pub fn register(
        &self,
        contract: ContractId,
        instance: ServiceInstance,
        priority: i32,
        owner: Option<&str>,
    ) {
        self.insert(ServiceRegistration::new(
            contract,
            instance,
            priority,
            owner.map(str::to_string),
        ));
    }

    /// Add a prepared registration.
    pub fn insert(&self, registration: ServiceRegistration) {
        debug!(
            "Registered {} for contract {} (priority {}, owner {:?})",
            registration.instance.type_name(),
            registration.contract,
            registration.priority,
            registration.owner
        );
        self.services
            .write()
            .entry(registration.contract.clone())
            .or_default()
            .push(registration);
    }

    /// Get one service for a contract.
    pub fn get(&self, contract: &ContractId, mode: SelectionMode) -> RuntimeResult<ServiceInstance> {
        let services = self.services.read();
        let entries = services
            .get(contract)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| RuntimeError::ServiceNotFound(contract.to_string()))?;

        if mode == SelectionMode::One && entries.len() > 1 {
            return Err(RuntimeError::MultipleServices {
                contract: contract.to_string(),
                count: entries.len(),
            });
        }

        // Strictly greater keeps the earliest registration on ties.
        let mut best = &entries[0];
        for entry in &entries[1..] {
            if entry.priority > best.priority {
                best = entry;
            }
        }
        Ok(best.instance.clone())
    }

    /// All services for a contract, highest priority first.
    pub fn get_all(&self, contract: &ContractId) -> Vec<ServiceInstance> {
        let services = self.services.read();
        let mut entries: Vec<&ServiceRegistration> =
            services.get(contract).map(|e| e.iter().collect()).unwrap_or_default();
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        entries.into_iter().map(|e| e.instance.clone()).collect()
    }

    pub fn is_registered(&self, contract: &ContractId) -> bool {
        self.services
            .read()
            .get(contract)
            .map_or(false, |e| !e.is_empty())
    }

    /// Remove one registration. Returns whether it was present.
    pub fn unregister(&self, contract: &ContractId, instance: &ServiceInstance) -> bool {
        let mut services = self.services.write();
        let Some(entries) = services.get_mut(contract) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| !e.instance.same_as(instance));
        let removed = entries.len() != before;
        if entries.is_empty() {
            services.remove(contract);
        }
        removed
    }

    /// Remove every registration for a contract. Returns the number removed.
    pub fn unregister_all(&self, contract: &ContractId) -> usize {
        self.services
            .write()
            .remove(contract)
            .map_or(0, |entries| entries.len())
    }

    /// Remove every registration published by a plugin.
    pub fn unregister_owner(&self, plugin_id: &str) -> usize {
        let mut services = self.services.write();
        let mut removed = 0;
        for entries in services.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.owner.as_deref() != Some(plugin_id));
            removed += before - entries.len();
        }
        services.retain(|_, entries| !entries.is_empty());
        if removed > 0 {
            debug!("Removed {} services owned by plugin {}", removed, plugin_id);
        }
        removed
    }

    pub fn get_metadata(
        &self,
        contract: &ContractId,
        instance: &ServiceInstance,
    ) -> Option<ServiceMetadata> {
        self.services.read().get(contract).and_then(|entries| {
            entries
                .iter()
                .find(|e| e.instance.same_as(instance))
                .map(|e| ServiceMetadata {
                    priority: e.priority,
                    owner: e.owner.clone(),
                    registered_at: e.registered_at,
                })
        })
    }

    /// Contracts that currently have at least one registration.
    pub fn contracts(&self) -> Vec<ContractId> {
        let mut contracts: Vec<ContractId> = self.services.read().keys().cloned().collect();
        contracts.sort();
        contracts
    }

    /// Contracts with a registration owned by `plugin_id`.
    pub fn contracts_owned_by(&self, plugin_id: &str) -> Vec<ContractId> {
        let mut contracts: Vec<ContractId> = self
            .services
            .read()
            .iter()
            .filter(|(_, entries)| entries.iter().any(|e| e.owner.as_deref() == Some(plugin_id)))
            .map(|(contract, _)| contract.clone())
            .collect();
        contracts.sort();
        contracts
    }

    // ==========================================================================
    // Typed API
    // ==========================================================================

    /// Register a typed service.
    pub fn provide<C: Contract>(&self, service: Arc<C::Service>, priority: i32, owner: Option<&str>) {
        self.register(C::id(), ServiceInstance::new(service), priority, owner);
    }

    /// Resolve the highest-priority service for a contract.
    pub fn resolve<C: Contract>(&self) -> RuntimeResult<ServiceRef<C::Service>> {
        let instance = self.get(&C::id(), SelectionMode::HighestPriority)?;
        instance
            .downcast::<C::Service>()
            .ok_or_else(|| RuntimeError::ServiceNotFound(format!(
                "{} (registered as {})",
                C::id(),
                instance.type_name()
            )))
    }

    /// All services of a contract that have the contract's type, highest priority first.
    pub fn resolve_all<C: Contract>(&self) -> Vec<ServiceRef<C::Service>> {
        self.get_all(&C::id())
            .iter()
            .filter_map(|i| i.downcast::<C::Service>())
            .collect()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct Named(&'static str);

    impl Greeter for Named {
        fn greet(&self) -> String {
            self.0.to_string()
        }
    }

    struct GreeterContract;

    impl Contract for GreeterContract {
        type Service = dyn Greeter;

        fn id() -> ContractId {
            ContractId::Custom("greeter".into())
        }
    }

    fn greeter(name: &'static str) -> Arc<dyn Greeter> {
        Arc::new(Named(name))
    }

    #[test]
    fn test_highest_priority_wins_in_any_order() {
        let orders: [[(i32, &'static str); 3]; 3] = [
            [(10, "ten"), (100, "hundred"), (1000, "thousand")],
            [(1000, "thousand"), (10, "ten"), (100, "hundred")],
            [(100, "hundred"), (1000, "thousand"), (10, "ten")],
        ];

        for order in orders {
            let registry = ServiceRegistry::new();
            for (priority, name) in order {
                registry.provide::<GreeterContract>(greeter(name), priority, None);
            }

            assert_eq!(registry.resolve::<GreeterContract>().unwrap().greet(), "thousand");
            let all: Vec<_> = registry
                .resolve_all::<GreeterContract>()
                .iter()
                .map(|g| g.greet())
                .collect();
            assert_eq!(all, vec!["thousand", "hundred", "ten"]);
        }
    }

    #[test]
    fn test_ties_keep_first_registration() {
        let registry = ServiceRegistry::new();
        registry.provide::<GreeterContract>(greeter("first"), 5, None);
        registry.provide::<GreeterContract>(greeter("second"), 5, None);
        assert_eq!(registry.resolve::<GreeterContract>().unwrap().greet(), "first");
    }

    #[test]
    fn test_selection_mode_one() {
        let registry = ServiceRegistry::new();
        let contract = ContractId::Audio;
        assert!(matches!(
            registry.get(&contract, SelectionMode::One),
            Err(RuntimeError::ServiceNotFound(_))
        ));

        registry.register(contract.clone(), ServiceInstance::new(Arc::new(1u32)), 0, None);
        assert!(registry.get(&contract, SelectionMode::One).is_ok());

        registry.register(contract.clone(), ServiceInstance::new(Arc::new(2u32)), 0, None);
        assert!(matches!(
            registry.get(&contract, SelectionMode::One),
            Err(RuntimeError::MultipleServices { count: 2, .. })
        ));
    }

    #[test]
    fn test_unregister_and_metadata() {
        let registry = ServiceRegistry::new();
        let a = ServiceInstance::new(Arc::new("a".to_string()));
        let b = ServiceInstance::new(Arc::new("b".to_string()));
        registry.register(ContractId::Config, a.clone(), 1, Some("plugin-a"));
        registry.register(ContractId::Config, b.clone(), 2, None);

        let meta = registry.get_metadata(&ContractId::Config, &a).unwrap();
        assert_eq!(meta.priority, 1);
        assert_eq!(meta.owner.as_deref(), Some("plugin-a"));

        assert!(registry.unregister(&ContractId::Config, &b));
        assert!(!registry.unregister(&ContractId::Config, &b));
        assert_eq!(
            registry
                .get(&ContractId::Config, SelectionMode::HighestPriority)
                .unwrap()
                .downcast::<String>()
                .unwrap()
                .as_str(),
            "a"
        );

        assert_eq!(registry.unregister_all(&ContractId::Config), 1);
        assert!(!registry.is_registered(&ContractId::Config));
    }

    #[test]
    fn test_unregister_owner() {
        let registry = ServiceRegistry::new();
        registry.register(ContractId::Render, ServiceInstance::new(Arc::new(1u8)), 0, Some("gl"));
        registry.register(ContractId::Audio, ServiceInstance::new(Arc::new(2u8)), 0, Some("gl"));
        registry.register(ContractId::Audio, ServiceInstance::new(Arc::new(3u8)), 0, Some("al"));

        assert_eq!(registry.contracts_owned_by("gl"), vec![ContractId::Render, ContractId::Audio]);
        assert_eq!(registry.unregister_owner("gl"), 2);
        assert!(!registry.is_registered(&ContractId::Render));
        assert_eq!(registry.get_all(&ContractId::Audio).len(), 1);
    }

    #[test]
    fn test_contract_id_parsing() {
        assert_eq!("Render".parse::<ContractId>().unwrap(), ContractId::Render);
        assert_eq!("plugin_loader".parse::<ContractId>().unwrap(), ContractId::PluginLoader);
        assert_eq!(
            "my.custom".parse::<ContractId>().unwrap(),
            ContractId::Custom("my.custom".into())
        );
        assert_eq!(ContractId::TerminalApp.to_string(), "terminal_app");
    }
}
