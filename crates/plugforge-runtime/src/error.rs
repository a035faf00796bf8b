//! Error types for the plugforge runtime.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while discovering, resolving, verifying, loading
/// or updating plugins.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A manifest could not be parsed or is missing its identity.
    #[error("Invalid manifest {path:?}: {reason}")]
    ManifestParse { path: Option<PathBuf>, reason: String },

    /// A version string is not a semantic version.
    #[error("Invalid version '{0}'")]
    InvalidVersion(String),

    /// A version range expression could not be parsed.
    #[error("Invalid version range '{range}': {reason}")]
    InvalidVersionRange { range: String, reason: String },

    /// The plugin does not support the running host version.
    #[error("Plugin {plugin} v{version} is not compatible with host version {host}")]
    IncompatibleHostVersion {
        plugin: String,
        version: String,
        host: String,
    },

    /// A dependency is not present in the manifest set.
    #[error("Plugin {plugin} depends on {dependency} which is not available")]
    UnsatisfiedDependency { plugin: String, dependency: String },

    /// A dependency is present but at a version outside the requested range.
    #[error("Plugin {plugin} requires {dependency} {requirement}, but version {found} is available")]
    VersionConflict {
        plugin: String,
        dependency: String,
        requirement: String,
        found: String,
    },

    /// Two plugins declared as conflicting are both present.
    #[error("Plugin {plugin} conflicts with {conflict} which is also present")]
    ConflictingPlugins { plugin: String, conflict: String },

    /// The dependency graph contains a cycle.
    #[error("Circular dependency detected in plugins: {}", plugins.join(", "))]
    CircularDependency { plugins: Vec<String> },

    /// Pre-flight dependency validation reported violations.
    #[error("Plugin dependency validation failed: {}", violations.join("; "))]
    DependencyValidation { violations: Vec<String> },

    /// A present signature did not verify.
    #[error("Signature verification failed for plugin {0}")]
    SignatureInvalid(String),

    /// The security level requires a signature but none was provided.
    #[error("Plugin {0} requires a signature but none was provided")]
    SignatureMissing(String),

    /// A gated operation was attempted without permission.
    #[error("Plugin {plugin} does not have permission for operation: {operation}")]
    PermissionDenied { plugin: String, operation: String },

    /// A plugin with the same id is already resident.
    #[error("Plugin already loaded: {0}")]
    AlreadyLoaded(String),

    /// No entry point resolved to an existing module file.
    #[error("Module not found for plugin {plugin}: {detail}")]
    ModuleNotFound { plugin: String, detail: String },

    /// Loading the module failed.
    #[error("Failed to load plugin {plugin}: {reason}")]
    LoadFailure { plugin: String, reason: String },

    /// The plugin's lifecycle hook failed during activation or deactivation.
    #[error("Lifecycle hook of plugin {plugin} failed: {reason}")]
    ActivationFailed { plugin: String, reason: String },

    /// The operation is not valid in the plugin's current state.
    #[error("Cannot {operation} plugin {plugin} in state {state}")]
    InvalidState {
        plugin: String,
        state: String,
        operation: &'static str,
    },

    /// No such plugin is known to the component.
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// The isolation boundary was not reclaimed in time.
    #[error("Plugin {plugin} was not reclaimed within {timeout:?}")]
    UnloadTimeout { plugin: String, timeout: Duration },

    /// An update could not be applied.
    #[error("Update of plugin {plugin} to {version} failed: {reason}")]
    UpdateFailed {
        plugin: String,
        version: String,
        reason: String,
    },

    /// No service is registered for the contract.
    #[error("No service registered for contract: {0}")]
    ServiceNotFound(String),

    /// Exactly one service was requested but several are registered.
    #[error("Expected a single service for contract {contract}, found {count}")]
    MultipleServices { contract: String, count: usize },

    /// The operation observed a cancellation request.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl RuntimeError {
    /// Whether this error makes the overall load order undefined.
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            RuntimeError::UnsatisfiedDependency { .. }
                | RuntimeError::VersionConflict { .. }
                | RuntimeError::ConflictingPlugins { .. }
                | RuntimeError::CircularDependency { .. }
                | RuntimeError::DependencyValidation { .. }
        )
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
