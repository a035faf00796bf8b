//! Permission model and enforcement for plugins.
//!
//! Plugins declare the permissions they need in the `security` section of
//! their manifest. The host registers the grant when the plugin is activated
//! and revokes it on unload. A plugin without a registered grant is denied
//! every operation; grants are never shared across plugin ids.

use crate::error::{RuntimeError, RuntimeResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Complete permission grant for one plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginPermissions {
    #[serde(default, alias = "file_system")]
    pub filesystem: FileSystemPermissions,

    #[serde(default)]
    pub network: NetworkPermissions,

    #[serde(default)]
    pub process: ProcessPermissions,

    #[serde(default)]
    pub system: SystemPermissions,

    /// Permissions for custom operations, keyed by operation name.
    #[serde(default)]
    pub custom: BTreeMap<String, bool>,
}

impl PluginPermissions {
    /// A grant that denies everything.
    pub fn none() -> Self {
        Self {
            filesystem: FileSystemPermissions {
                can_read: false,
                ..Default::default()
            },
            network: NetworkPermissions {
                can_http_client: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Filesystem access. Reading is allowed by default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemPermissions {
    #[serde(default = "default_true", alias = "can_read")]
    pub can_read: bool,

    #[serde(default, alias = "can_write")]
    pub can_write: bool,

    #[serde(default, alias = "can_delete")]
    pub can_delete: bool,

    /// When non-empty, path-scoped checks must fall under one of these.
    #[serde(default, alias = "allowed_paths")]
    pub allowed_paths: Vec<PathBuf>,

    /// Paths that are always denied, taking precedence over `allowed_paths`.
    #[serde(default, alias = "denied_paths")]
    pub denied_paths: Vec<PathBuf>,
}

impl Default for FileSystemPermissions {
    fn default() -> Self {
        Self {
            can_read: true,
            can_write: false,
            can_delete: false,
            allowed_paths: Vec::new(),
            denied_paths: Vec::new(),
        }
    }
}

/// Network access. Outbound HTTP is allowed by default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPermissions {
    #[serde(default = "default_true", alias = "can_http_client")]
    pub can_http_client: bool,

    #[serde(default, alias = "can_listen")]
    pub can_listen: bool,

    #[serde(default, alias = "allowed_hosts")]
    pub allowed_hosts: Vec<String>,

    #[serde(default, alias = "allowed_ports")]
    pub allowed_ports: Vec<u16>,
}

impl Default for NetworkPermissions {
    fn default() -> Self {
        Self {
            can_http_client: true,
            can_listen: false,
            allowed_hosts: Vec::new(),
            allowed_ports: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessPermissions {
    #[serde(default, alias = "can_spawn")]
    pub can_spawn: bool,

    #[serde(default, alias = "can_inspect")]
    pub can_inspect: bool,

    #[serde(default, alias = "allowed_executables")]
    pub allowed_executables: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPermissions {
    #[serde(default, alias = "can_access_environment")]
    pub can_access_environment: bool,

    #[serde(default, alias = "can_access_system_info")]
    pub can_access_system_info: bool,

    #[serde(default, alias = "can_modify_system")]
    pub can_modify_system: bool,
}

fn default_true() -> bool {
    true
}

/// A gated operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    FileRead,
    FileWrite,
    FileDelete,
    NetworkHttp,
    NetworkListen,
    ProcessSpawn,
    ProcessInspect,
    SystemEnvironment,
    SystemInfo,
    SystemModify,
    /// Any other operation, looked up in the `custom` permission map.
    Custom(String),
}

impl Operation {
    pub fn as_str(&self) -> &str {
        match self {
            Operation::FileRead => "filesystem.read",
            Operation::FileWrite => "filesystem.write",
            Operation::FileDelete => "filesystem.delete",
            Operation::NetworkHttp => "network.http",
            Operation::NetworkListen => "network.listen",
            Operation::ProcessSpawn => "process.spawn",
            Operation::ProcessInspect => "process.inspect",
            Operation::SystemEnvironment => "system.environment",
            Operation::SystemInfo => "system.info",
            Operation::SystemModify => "system.modify",
            Operation::Custom(name) => name,
        }
    }
}

impl FromStr for Operation {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "filesystem.read" => Operation::FileRead,
            "filesystem.write" => Operation::FileWrite,
            "filesystem.delete" => Operation::FileDelete,
            "network.http" => Operation::NetworkHttp,
            "network.listen" => Operation::NetworkListen,
            "process.spawn" => Operation::ProcessSpawn,
            "process.inspect" => Operation::ProcessInspect,
            "system.environment" => Operation::SystemEnvironment,
            "system.info" => Operation::SystemInfo,
            "system.modify" => Operation::SystemModify,
            other => Operation::Custom(other.to_string()),
        })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource an operation targets, used to refine a check against allow/deny lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionContext {
    Path(PathBuf),
    Endpoint { host: String, port: Option<u16> },
    Executable(String),
}

/// Registry of per-plugin grants.
pub struct PermissionEnforcer {
    grants: RwLock<HashMap<String, PluginPermissions>>,
}

impl PermissionEnforcer {
    pub fn new() -> Self {
        Self {
            grants: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the grant for a plugin.
    pub fn register_permissions(&self, plugin_id: &str, permissions: PluginPermissions) {
        debug!("Registering permissions for plugin {}", plugin_id);
        self.grants
            .write()
            .insert(plugin_id.to_string(), permissions);
    }

    /// Drop the grant for a plugin. Returns whether one existed.
    pub fn revoke_permissions(&self, plugin_id: &str) -> bool {
        let removed = self.grants.write().remove(plugin_id).is_some();
        if removed {
            debug!("Revoked permissions for plugin {}", plugin_id);
        }
        removed
    }

    /// Snapshot of a plugin's grant.
    pub fn permissions(&self, plugin_id: &str) -> Option<PluginPermissions> {
        self.grants.read().get(plugin_id).cloned()
    }

    /// Check an operation. Unknown plugins are denied everything.
    pub fn has_permission(
        &self,
        plugin_id: &str,
        operation: &Operation,
        context: Option<&PermissionContext>,
    ) -> bool {
        let grants = self.grants.read();
        let Some(perms) = grants.get(plugin_id) else {
            return false;
        };

        let granted = match operation {
            Operation::FileRead => perms.filesystem.can_read,
            Operation::FileWrite => perms.filesystem.can_write,
            Operation::FileDelete => perms.filesystem.can_delete,
            Operation::NetworkHttp => perms.network.can_http_client,
            Operation::NetworkListen => perms.network.can_listen,
            Operation::ProcessSpawn => perms.process.can_spawn,
            Operation::ProcessInspect => perms.process.can_inspect,
            Operation::SystemEnvironment => perms.system.can_access_environment,
            Operation::SystemInfo => perms.system.can_access_system_info,
            Operation::SystemModify => perms.system.can_modify_system,
            Operation::Custom(name) => perms.custom.get(name).copied().unwrap_or(false),
        };

        granted && context.map_or(true, |ctx| context_allowed(perms, ctx))
    }

    /// Like [`has_permission`](Self::has_permission) but fails with `PermissionDenied`.
    pub fn enforce_permission(
        &self,
        plugin_id: &str,
        operation: &Operation,
        context: Option<&PermissionContext>,
    ) -> RuntimeResult<()> {
        if self.has_permission(plugin_id, operation, context) {
            return Ok(());
        }
        warn!(
            "Denied operation {} for plugin {} ({:?})",
            operation, plugin_id, context
        );
        Err(RuntimeError::PermissionDenied {
            plugin: plugin_id.to_string(),
            operation: operation.to_string(),
        })
    }
}

impl Default for PermissionEnforcer {
    fn default() -> Self {
        Self::new()
    }
}

fn context_allowed(perms: &PluginPermissions, context: &PermissionContext) -> bool {
    match context {
        PermissionContext::Path(path) => path_allowed(&perms.filesystem, path),
        PermissionContext::Endpoint { host, port } => {
            let net = &perms.network;
            let host_ok = net.allowed_hosts.is_empty()
                || net
                    .allowed_hosts
                    .iter()
                    .any(|allowed| host_matches(allowed, host));
            let port_ok = match port {
                Some(port) => net.allowed_ports.is_empty() || net.allowed_ports.contains(port),
                None => true,
            };
            host_ok && port_ok
        }
        PermissionContext::Executable(exe) => {
            let allowed = &perms.process.allowed_executables;
            allowed.is_empty() || allowed.iter().any(|a| a == exe)
        }
    }
}

fn path_allowed(fs: &FileSystemPermissions, path: &Path) -> bool {
    if fs.denied_paths.iter().any(|denied| path.starts_with(denied)) {
        return false;
    }
    fs.allowed_paths.is_empty() || fs.allowed_paths.iter().any(|a| path.starts_with(a))
}

/// `*.example.com` matches subdomains of `example.com`. Case-insensitive.
fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => host
            .strip_suffix(suffix)
            .map_or(false, |prefix| prefix.ends_with('.')),
        None => pattern == host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_plugin_is_denied() {
        let enforcer = PermissionEnforcer::new();
        for op in ["filesystem.read", "network.http", "system.info", "custom.thing"] {
            let op: Operation = op.parse().unwrap();
            assert!(!enforcer.has_permission("ghost", &op, None));
        }
        assert!(matches!(
            enforcer.enforce_permission("ghost", &Operation::FileRead, None),
            Err(RuntimeError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn test_defaults() {
        let enforcer = PermissionEnforcer::new();
        enforcer.register_permissions("p", PluginPermissions::default());

        assert!(enforcer.has_permission("p", &Operation::FileRead, None));
        assert!(enforcer.has_permission("p", &Operation::NetworkHttp, None));
        assert!(!enforcer.has_permission("p", &Operation::FileWrite, None));
        assert!(!enforcer.has_permission("p", &Operation::ProcessSpawn, None));
        assert!(!enforcer.has_permission("p", &Operation::SystemModify, None));
        assert!(!enforcer.has_permission("p", &Operation::Custom("x".into()), None));
    }

    #[test]
    fn test_grants_do_not_leak_across_plugins() {
        let enforcer = PermissionEnforcer::new();
        let mut perms = PluginPermissions::default();
        perms.process.can_spawn = true;
        enforcer.register_permissions("a", perms);

        assert!(enforcer.has_permission("a", &Operation::ProcessSpawn, None));
        assert!(!enforcer.has_permission("b", &Operation::ProcessSpawn, None));

        assert!(enforcer.revoke_permissions("a"));
        assert!(!enforcer.has_permission("a", &Operation::ProcessSpawn, None));
        assert!(!enforcer.revoke_permissions("a"));
    }

    #[test]
    fn test_custom_operations() {
        let enforcer = PermissionEnforcer::new();
        let mut perms = PluginPermissions::none();
        perms.custom.insert("render.fullscreen".into(), true);
        enforcer.register_permissions("p", perms);

        let op: Operation = "render.fullscreen".parse().unwrap();
        assert_eq!(op, Operation::Custom("render.fullscreen".into()));
        assert!(enforcer.has_permission("p", &op, None));
        assert!(!enforcer.has_permission("p", &Operation::FileRead, None));
    }

    #[test]
    fn test_context_refines_checks() {
        let enforcer = PermissionEnforcer::new();
        let mut perms = PluginPermissions::default();
        perms.filesystem.allowed_paths = vec![PathBuf::from("/data")];
        perms.filesystem.denied_paths = vec![PathBuf::from("/data/secret")];
        perms.network.allowed_hosts = vec!["*.example.com".into()];
        perms.network.allowed_ports = vec![443];
        enforcer.register_permissions("p", perms);

        let read = |p: &str| {
            enforcer.has_permission(
                "p",
                &Operation::FileRead,
                Some(&PermissionContext::Path(PathBuf::from(p))),
            )
        };
        assert!(read("/data/file.txt"));
        assert!(!read("/data/secret/key"));
        assert!(!read("/etc/passwd"));

        let http = |host: &str, port: u16| {
            enforcer.has_permission(
                "p",
                &Operation::NetworkHttp,
                Some(&PermissionContext::Endpoint {
                    host: host.into(),
                    port: Some(port),
                }),
            )
        };
        assert!(http("api.example.com", 443));
        assert!(!http("api.example.com", 80));
        assert!(!http("example.org", 443));
    }

    #[test]
    fn test_host_patterns_ignore_case() {
        assert!(host_matches("*.Example.com", "api.example.COM"));
        assert!(host_matches("API.example.com", "api.EXAMPLE.com"));
        assert!(!host_matches("*.example.com", "example.com"));
    }

    #[test]
    fn test_operation_round_trip() {
        for op in [
            Operation::FileDelete,
            Operation::NetworkListen,
            Operation::ProcessInspect,
            Operation::SystemEnvironment,
        ] {
            let parsed: Operation = op.to_string().parse().unwrap();
            assert_eq!(parsed, op);
        }
    }
}
