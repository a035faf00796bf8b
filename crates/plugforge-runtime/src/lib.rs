//! # plugforge-runtime
//!
//! Plugin model and pre-load checks for plugforge hosts.
//!
//! This crate provides:
//! - Plugin manifest parsing (JSON and TOML)
//! - Version ranges over semantic versions
//! - Plugin discovery from plugin directories
//! - Synthesised manifests for legacy plugin lists
//! - Dependency validation and load ordering
//! - Content hashing and ed25519 signature checks
//! - Per-plugin permission enforcement
//!
//! ## Plugin Structure
//!
//! A plugin is a directory containing:
//! - `<name>.plugin.json` or `<name>.plugin.toml` - identity, entry points,
//!   dependencies and security posture
//! - one module per runtime target, referenced from `entryPoints`
//!
//! Nothing in this crate holds loaded code; loading lives in
//! `plugforge-host`.

pub mod discovery;
pub mod error;
pub mod legacy;
pub mod manifest;
pub mod permission;
pub mod resolver;
pub mod security;
pub mod version;

pub use discovery::{default_plugin_dirs, discover_plugin, discover_plugins, DiscoveryReport};
pub use error::{RuntimeError, RuntimeResult};
pub use legacy::{manifests_from_legacy, LegacyPluginEntry};
pub use manifest::{
    LoadStrategy, PluginManifest, PluginPriority, RollbackPolicy, SecurityLevel, UpdateChannel,
};
pub use permission::{Operation, PermissionContext, PermissionEnforcer, PluginPermissions};
pub use resolver::{
    find_available_versions, find_best_version, resolve_load_order, validate_dependencies,
    DependencyValidation, DependencyViolation,
};
pub use security::{
    compute_plugin_hash, plugin_files, PluginSignature, SecurityVerdict, SignatureVerifier,
};
pub use version::{parse_version, VersionRange};
