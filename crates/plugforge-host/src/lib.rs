//! # plugforge-host
//!
//! Runs plugins inside a host process.
//!
//! This crate provides:
//!
//! - A priority-ranked service registry keyed by capability contract
//! - The lifecycle hook API plugins implement
//! - Module backends (native shared libraries and statically linked plugins)
//! - An isolated loader giving each plugin its own reclaimable boundary
//! - An update manager with automatic rollback
//! - The host bootstrap that ties discovery, resolution and loading together
//!
//! ## Writing a Plugin
//!
//! ```ignore
//! use plugforge_host::{declare_activator, ActivationContext, HookResult, PluginActivator};
//!
//! struct Greeter;
//!
//! #[async_trait::async_trait]
//! impl PluginActivator for Greeter {
//!     async fn activate(&mut self, ctx: &mut ActivationContext) -> HookResult {
//!         ctx.provide::<GreeterContract>(std::sync::Arc::new(EnglishGreeter), 100);
//!         Ok(())
//!     }
//! }
//!
//! declare_activator!(Greeter);
//! ```

pub mod activator;
pub mod bootstrap;
pub mod config;
pub mod loader;
pub mod module;
pub mod registry;
pub mod runtime;
pub mod update;

pub use activator::{ActivationContext, HookError, HookResult, PluginActivator};
pub use bootstrap::{BootReport, HostBootstrap, HOST_OWNER};
pub use config::HostConfig;
pub use loader::{IsolatedLoader, LoadedPluginInfo, PluginState};
pub use module::{
    IsolationBoundary, ModuleBackend, ModuleGuard, NativeModuleBackend, StaticModuleBackend,
};
pub use registry::{
    Contract, ContractId, SelectionMode, ServiceInstance, ServiceRef, ServiceRegistration,
    ServiceRegistry,
};
pub use runtime::{ManifestRegistry, PluginRuntime};
pub use update::{
    DirectoryUpdateSource, UpdateEvent, UpdateInfo, UpdateManager, UpdateRecord, UpdateSource,
    UpdateType,
};
