//! Module backends and isolation boundaries.
//!
//! A module backend turns a manifest entry point into a [`ModuleHandle`]
//! and, optionally, the plugin's lifecycle hook. The loader wraps each
//! handle in an [`IsolationBoundary`]. Anything that must keep the plugin's
//! code resident (its registered services, references handed out to
//! consumers) holds a [`ModuleGuard`]; the boundary is reclaimed once the
//! last guard is gone.

use crate::activator::PluginActivator;
use libloading::{Library, Symbol};
use plugforge_runtime::{PluginManifest, RuntimeError, RuntimeResult};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use uuid::Uuid;

/// Symbol a native plugin may export to provide its lifecycle hook.
pub const CREATE_ACTIVATOR_SYMBOL: &[u8] = b"plugforge_create_activator";

/// Signature of [`CREATE_ACTIVATOR_SYMBOL`].
///
/// Returns a `Box<Box<dyn PluginActivator>>` leaked as a raw pointer, or null.
pub type CreateActivatorFn = unsafe extern "C" fn() -> *mut ();

/// Export a lifecycle hook from a native plugin.
///
/// The plugin must be built against the same `plugforge-host` version and
/// compiler as the host.
#[macro_export]
macro_rules! declare_activator {
    ($ctor:expr) => {
        #[no_mangle]
        pub extern "C" fn plugforge_create_activator() -> *mut () {
            let activator: Box<dyn $crate::PluginActivator> = Box::new($ctor);
            Box::into_raw(Box::new(activator)) as *mut ()
        }
    };
}

/// Code loaded for one plugin.
pub struct ModuleHandle {
    plugin_id: String,
    path: PathBuf,
    library: Option<Library>,
}

impl ModuleHandle {
    /// A handle for code that is linked into the host.
    pub fn in_process(plugin_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            path: path.into(),
            library: None,
        }
    }

    fn native(plugin_id: String, path: PathBuf, library: Library) -> Self {
        Self {
            plugin_id,
            path,
            library: Some(library),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_native(&self) -> bool {
        self.library.is_some()
    }
}

impl Drop for ModuleHandle {
    fn drop(&mut self) {
        debug!("Releasing module {:?} of plugin {}", self.path, self.plugin_id);
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("plugin_id", &self.plugin_id)
            .field("path", &self.path)
            .field("native", &self.is_native())
            .finish()
    }
}

/// Keeps a plugin's module resident while held.
#[derive(Clone, Debug)]
pub struct ModuleGuard(Arc<ModuleHandle>);

impl ModuleGuard {
    pub fn plugin_id(&self) -> &str {
        self.0.plugin_id()
    }
}

/// Output of a [`ModuleBackend`].
pub struct LoadedModule {
    pub handle: ModuleHandle,
    pub activator: Option<Box<dyn PluginActivator>>,
}

/// Opens plugin modules for one runtime target.
pub trait ModuleBackend: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &str;

    /// Whether the entry point must be an existing file.
    fn requires_file(&self) -> bool {
        true
    }

    fn open(&self, manifest: &PluginManifest, entry: &Path) -> RuntimeResult<LoadedModule>;
}

/// Loads shared libraries with `libloading`.
#[derive(Debug, Default)]
pub struct NativeModuleBackend;

impl NativeModuleBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ModuleBackend for NativeModuleBackend {
    fn name(&self) -> &str {
        "native"
    }

    fn open(&self, manifest: &PluginManifest, entry: &Path) -> RuntimeResult<LoadedModule> {
        let library = unsafe { Library::new(entry) }.map_err(|e| RuntimeError::LoadFailure {
            plugin: manifest.id.clone(),
            reason: format!("Failed to load library {:?}: {}", entry, e),
        })?;

        let activator = {
            let symbol: Result<Symbol<CreateActivatorFn>, _> =
                unsafe { library.get(CREATE_ACTIVATOR_SYMBOL) };
            match symbol {
                Ok(create) => {
                    let raw = unsafe { create() };
                    if raw.is_null() {
                        debug!("Plugin {} returned no lifecycle hook", manifest.id);
                        None
                    } else {
                        let boxed = unsafe { Box::from_raw(raw as *mut Box<dyn PluginActivator>) };
                        Some(*boxed)
                    }
                }
                Err(_) => {
                    debug!("Plugin {} exports no lifecycle hook", manifest.id);
                    None
                }
            }
        };

        info!("Loaded native module {:?} for plugin {}", entry, manifest.id);
        Ok(LoadedModule {
            handle: ModuleHandle::native(manifest.id.clone(), entry.to_path_buf(), library),
            activator,
        })
    }
}

/// Factory producing a statically linked plugin's lifecycle hook.
pub type ActivatorFactory = Arc<
    dyn Fn(&PluginManifest) -> RuntimeResult<Option<Box<dyn PluginActivator>>> + Send + Sync,
>;

/// Serves plugins compiled into the host binary, keyed by plugin id.
#[derive(Default)]
pub struct StaticModuleBackend {
    factories: HashMap<String, ActivatorFactory>,
}

impl StaticModuleBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a plugin id.
    pub fn register<F>(&mut self, plugin_id: impl Into<String>, factory: F)
    where
        F: Fn(&PluginManifest) -> RuntimeResult<Option<Box<dyn PluginActivator>>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(plugin_id.into(), Arc::new(factory));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<F>(mut self, plugin_id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&PluginManifest) -> RuntimeResult<Option<Box<dyn PluginActivator>>>
            + Send
            + Sync
            + 'static,
    {
        self.register(plugin_id, factory);
        self
    }
}

impl ModuleBackend for StaticModuleBackend {
    fn name(&self) -> &str {
        "static"
    }

    fn requires_file(&self) -> bool {
        false
    }

    fn open(&self, manifest: &PluginManifest, entry: &Path) -> RuntimeResult<LoadedModule> {
        let factory = self
            .factories
            .get(&manifest.id)
            .ok_or_else(|| RuntimeError::ModuleNotFound {
                plugin: manifest.id.clone(),
                detail: "no statically linked module with this id".to_string(),
            })?;

        let activator = factory(manifest)?;
        Ok(LoadedModule {
            handle: ModuleHandle::in_process(manifest.id.clone(), entry),
            activator,
        })
    }
}

/// One plugin's boundary: a fresh id plus the only owning reference to its
/// module that the loader keeps.
pub struct IsolationBoundary {
    id: Uuid,
    name: String,
    module: Arc<ModuleHandle>,
}

impl IsolationBoundary {
    pub fn new(name: impl Into<String>, handle: ModuleHandle) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            module: Arc::new(handle),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn guard(&self) -> ModuleGuard {
        ModuleGuard(Arc::clone(&self.module))
    }

    /// Number of guards currently alive, excluding the boundary itself.
    pub fn outstanding_guards(&self) -> usize {
        Arc::strong_count(&self.module) - 1
    }

    /// Drop the boundary's own reference and return a probe for reclamation.
    pub fn release(self) -> ReclaimProbe {
        let probe = ReclaimProbe(Arc::downgrade(&self.module));
        drop(self.module);
        probe
    }
}

/// Observes whether a released module has been reclaimed.
pub struct ReclaimProbe(Weak<ModuleHandle>);

impl ReclaimProbe {
    pub fn is_reclaimed(&self) -> bool {
        self.0.strong_count() == 0
    }
}
