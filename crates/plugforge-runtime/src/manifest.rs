//! Plugin manifest parsing.
//!
//! Each plugin ships a `<name>.plugin.json` or `<name>.plugin.toml` file that
//! describes its identity, entry points, dependencies and security posture.
//! JSON manifests use camelCase keys and TOML manifests use snake_case keys;
//! both spellings are accepted in either format.

use crate::error::{RuntimeError, RuntimeResult};
use crate::permission::PluginPermissions;
use crate::security::PluginSignature;
use crate::version::{parse_version, VersionRange};
use semver::Version;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File suffix of JSON manifests.
pub const JSON_MANIFEST_SUFFIX: &str = ".plugin.json";

/// File suffix of TOML manifests.
pub const TOML_MANIFEST_SUFFIX: &str = ".plugin.toml";

/// Whether a file name denotes a plugin manifest.
pub fn is_manifest_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(JSON_MANIFEST_SUFFIX) || n.ends_with(TOML_MANIFEST_SUFFIX))
        .unwrap_or(false)
}

/// Plugin manifest structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Unique identifier for the plugin.
    pub id: String,

    /// Plugin version.
    #[serde(with = "lenient_version")]
    pub version: Version,

    /// Human-readable name.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub author: Option<String>,

    #[serde(default)]
    pub license: Option<String>,

    /// Module paths keyed by runtime target (e.g. `native`).
    #[serde(default, alias = "entry_points")]
    pub entry_points: BTreeMap<String, PathBuf>,

    /// Dependencies as `plugin id -> version range`.
    ///
    /// A plain list of ids is accepted and means "any version".
    #[serde(default, deserialize_with = "deserialize_dependencies")]
    pub dependencies: BTreeMap<String, String>,

    /// Services the plugin declares it will register.
    #[serde(default)]
    pub exports: Vec<ServiceExport>,

    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default, alias = "supported_profiles")]
    pub supported_profiles: Vec<String>,

    #[serde(default, alias = "load_strategy")]
    pub load_strategy: LoadStrategy,

    #[serde(default)]
    pub priority: PluginPriority,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Grace period between deactivation and module release.
    #[serde(default = "default_quiesce_seconds", alias = "quiesce_seconds")]
    pub quiesce_seconds: u64,

    #[serde(default)]
    pub security: Option<PluginSecurity>,

    #[serde(default)]
    pub compatibility: Option<PluginCompatibility>,

    #[serde(default, alias = "update_info")]
    pub update_info: Option<PluginUpdateInfo>,

    /// File the manifest was read from.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_quiesce_seconds() -> u64 {
    5
}

/// How eagerly the host brings a plugin up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStrategy {
    #[serde(alias = "Eager")]
    Eager,
    #[default]
    #[serde(alias = "Lazy")]
    Lazy,
    /// Only loaded on demand or when another plugin depends on it.
    #[serde(alias = "Explicit")]
    Explicit,
}

/// Plugin importance. Failures of `Critical` plugins abort host start-up.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PluginPriority {
    #[serde(alias = "Low")]
    Low,
    #[default]
    #[serde(alias = "Normal")]
    Normal,
    #[serde(alias = "High")]
    High,
    #[serde(alias = "Critical")]
    Critical,
}

/// How strictly the host treats a plugin's integrity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    #[serde(alias = "Unrestricted")]
    Unrestricted,
    #[default]
    #[serde(alias = "Standard")]
    Standard,
    #[serde(alias = "Restricted")]
    Restricted,
    #[serde(alias = "Isolated")]
    Isolated,
}

impl SecurityLevel {
    /// Whether a valid signature is mandatory at this level.
    pub fn requires_signature(self) -> bool {
        matches!(self, SecurityLevel::Restricted | SecurityLevel::Isolated)
    }
}

/// A service the plugin intends to publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceExport {
    /// Contract name, e.g. `render` or a custom contract id.
    pub contract: String,

    #[serde(default)]
    pub priority: i32,
}

/// Security section of a manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSecurity {
    #[serde(default)]
    pub signature: Option<PluginSignature>,

    #[serde(default)]
    pub permissions: PluginPermissions,

    #[serde(default, alias = "security_level")]
    pub security_level: SecurityLevel,
}

/// Host compatibility constraints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginCompatibility {
    /// Lowest supported host version (inclusive).
    #[serde(default, with = "lenient_version_opt", alias = "min_host_version")]
    pub min_host_version: Option<Version>,

    /// Highest supported host version (inclusive).
    #[serde(default, with = "lenient_version_opt", alias = "max_host_version")]
    pub max_host_version: Option<Version>,

    #[serde(default, alias = "required_profiles")]
    pub required_profiles: Vec<String>,

    /// Plugin ids that must not be present alongside this plugin.
    #[serde(default, alias = "conflicts_with")]
    pub conflicts_with: Vec<String>,

    #[serde(default, alias = "breaking_changes")]
    pub breaking_changes: Vec<String>,
}

/// Release channel a plugin follows for updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateChannel {
    #[default]
    Stable,
    Beta,
    Alpha,
}

/// Update section of a manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginUpdateInfo {
    #[serde(default)]
    pub channel: UpdateChannel,

    #[serde(default, alias = "auto_update")]
    pub auto_update: bool,

    #[serde(default, alias = "update_url")]
    pub update_url: Option<String>,

    #[serde(default, alias = "rollback_policy")]
    pub rollback_policy: RollbackPolicy,
}

/// How many previous versions are retained and for how long an update may run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_versions", alias = "max_versions")]
    pub max_versions: usize,

    #[serde(default = "default_timeout_seconds", alias = "timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_max_versions() -> usize {
    3
}

fn default_timeout_seconds() -> u64 {
    300
}

impl Default for RollbackPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_versions: default_max_versions(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl PluginManifest {
    /// Create a minimal manifest.
    pub fn new(id: impl Into<String>, version: Version) -> Self {
        Self {
            id: id.into(),
            version,
            name: None,
            description: None,
            author: None,
            license: None,
            entry_points: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            exports: Vec::new(),
            capabilities: Vec::new(),
            supported_profiles: Vec::new(),
            load_strategy: LoadStrategy::default(),
            priority: PluginPriority::default(),
            enabled: true,
            quiesce_seconds: default_quiesce_seconds(),
            security: None,
            compatibility: None,
            update_info: None,
            source_path: None,
        }
    }

    /// Load a manifest from a file, picking the format from its extension.
    pub fn from_file(path: &Path) -> RuntimeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let parsed = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            _ => Self::from_json_str(&content),
        };

        let mut manifest = parsed.map_err(|e| match e {
            RuntimeError::ManifestParse { reason, .. } => RuntimeError::ManifestParse {
                path: Some(path.to_path_buf()),
                reason,
            },
            other => other,
        })?;
        manifest.source_path = Some(path.to_path_buf());
        Ok(manifest)
    }

    /// Parse a manifest from a JSON string.
    pub fn from_json_str(content: &str) -> RuntimeResult<Self> {
        let manifest: PluginManifest =
            serde_json::from_str(content).map_err(|e| RuntimeError::ManifestParse {
                path: None,
                reason: e.to_string(),
            })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse a manifest from a TOML string.
    pub fn from_toml_str(content: &str) -> RuntimeResult<Self> {
        let manifest: PluginManifest =
            toml::from_str(content).map_err(|e| RuntimeError::ManifestParse {
                path: None,
                reason: e.to_string(),
            })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate the manifest.
    fn validate(&self) -> RuntimeResult<()> {
        if self.id.trim().is_empty() {
            return Err(RuntimeError::ManifestParse {
                path: None,
                reason: "Plugin ID cannot be empty".to_string(),
            });
        }

        for (dependency, range) in &self.dependencies {
            if dependency.trim().is_empty() {
                return Err(RuntimeError::ManifestParse {
                    path: None,
                    reason: format!("Plugin {} declares a dependency with an empty id", self.id),
                });
            }
            VersionRange::parse(range).map_err(|e| RuntimeError::ManifestParse {
                path: None,
                reason: format!("dependency {dependency}: {e}"),
            })?;
        }

        Ok(())
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Check whether the plugin supports the given host version.
    pub fn is_compatible_with(&self, host_version: &Version) -> bool {
        let Some(compat) = &self.compatibility else {
            return true;
        };
        if let Some(min) = &compat.min_host_version {
            if host_version < min {
                return false;
            }
        }
        if let Some(max) = &compat.max_host_version {
            if host_version > max {
                return false;
            }
        }
        true
    }

    /// Module path for a runtime target.
    pub fn entry_point(&self, target: &str) -> Option<&Path> {
        self.entry_points.get(target).map(PathBuf::as_path)
    }

    /// Rewrite relative entry points to absolute paths under `base`.
    pub fn resolve_entry_points(&mut self, base: &Path) {
        for path in self.entry_points.values_mut() {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Directory containing the plugin's files.
    ///
    /// This is the manifest's directory, or the first entry point's directory
    /// for manifests that were synthesised without a file.
    pub fn plugin_root(&self) -> Option<PathBuf> {
        if let Some(source) = &self.source_path {
            return source.parent().map(Path::to_path_buf);
        }
        self.entry_points
            .values()
            .next()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf)
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.security
            .as_ref()
            .map(|s| s.security_level)
            .unwrap_or_default()
    }

    pub fn signature(&self) -> Option<&PluginSignature> {
        self.security.as_ref().and_then(|s| s.signature.as_ref())
    }

    /// Permissions requested by the plugin, or the defaults when absent.
    pub fn permissions(&self) -> PluginPermissions {
        self.security
            .as_ref()
            .map(|s| s.permissions.clone())
            .unwrap_or_default()
    }

    /// Ids of plugins declared as conflicting.
    pub fn conflicts(&self) -> &[String] {
        self.compatibility
            .as_ref()
            .map(|c| c.conflicts_with.as_slice())
            .unwrap_or(&[])
    }

    /// Rollback policy, or the defaults when the manifest has no update section.
    pub fn rollback_policy(&self) -> RollbackPolicy {
        self.update_info
            .as_ref()
            .map(|u| u.rollback_policy.clone())
            .unwrap_or_default()
    }

    /// `id@version`, used in log lines.
    pub fn key(&self) -> String {
        format!("{}@{}", self.id, self.version)
    }
}

/// Accept either `{"id": "range"}` or `["id", ...]`.
fn deserialize_dependencies<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Dependencies {
        Map(BTreeMap<String, String>),
        List(Vec<String>),
    }

    Ok(match Dependencies::deserialize(deserializer)? {
        Dependencies::Map(map) => map,
        Dependencies::List(ids) => ids.into_iter().map(|id| (id, "*".to_string())).collect(),
    })
}

mod lenient_version {
    use super::*;

    pub fn serialize<S: Serializer>(version: &Version, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(version)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Version, D::Error> {
        let raw = String::deserialize(d)?;
        parse_version(&raw).map_err(serde::de::Error::custom)
    }
}

mod lenient_version_opt {
    use super::*;

    pub fn serialize<S: Serializer>(version: &Option<Version>, s: S) -> Result<S::Ok, S::Error> {
        match version {
            Some(v) => s.collect_str(v),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Version>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|raw| parse_version(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}
