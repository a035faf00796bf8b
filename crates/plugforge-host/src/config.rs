//! Host configuration.
//!
//! This is the `[host]` and `[plugins]` part of the daemon's TOML file.
//! Every field has a default so an empty file is a valid configuration.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use plugforge_runtime::{parse_version, LegacyPluginEntry, RuntimeError, RuntimeResult};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Host configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    #[serde(default)]
    pub host: HostSettings,

    #[serde(default)]
    pub plugins: PluginSettings,
}

/// Identity of the running host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostSettings {
    /// Host version checked against plugin compatibility windows.
    #[serde(default = "default_host_version")]
    pub version: String,

    /// Active profile, matched against plugin profile lists.
    #[serde(default = "default_profile")]
    pub profile: String,

    /// Entry point key used to pick a plugin's module.
    #[serde(default = "default_runtime_target")]
    pub runtime_target: String,
}

/// Where plugins come from and how they are managed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginSettings {
    /// Roots scanned for manifests. Empty means the platform defaults.
    #[serde(default)]
    pub directories: Vec<PathBuf>,

    /// Use `legacy` entries even when discovery finds manifests.
    #[serde(default)]
    pub force_legacy: bool,

    /// Upper bound on waiting for a plugin's module to be reclaimed.
    #[serde(default = "default_unload_timeout_secs")]
    pub unload_timeout_secs: u64,

    /// Update records kept per plugin.
    #[serde(default = "default_history_retention")]
    pub history_retention: usize,

    /// Base64 ed25519 keys trusted to sign plugins. Empty trusts any key.
    #[serde(default)]
    pub trusted_keys: Vec<String>,

    #[serde(default)]
    pub legacy: Vec<LegacyPluginEntry>,
}

fn default_host_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_profile() -> String {
    "default".to_string()
}

fn default_runtime_target() -> String {
    "native".to_string()
}

fn default_unload_timeout_secs() -> u64 {
    30
}

fn default_history_retention() -> usize {
    50
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            version: default_host_version(),
            profile: default_profile(),
            runtime_target: default_runtime_target(),
        }
    }
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            force_legacy: false,
            unload_timeout_secs: default_unload_timeout_secs(),
            history_retention: default_history_retention(),
            trusted_keys: Vec::new(),
            legacy: Vec::new(),
        }
    }
}

impl HostConfig {
    pub fn host_version(&self) -> RuntimeResult<Version> {
        parse_version(&self.host.version)
    }

    /// Anchor relative legacy module paths at `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        for entry in &mut self.plugins.legacy {
            entry.resolve_relative_to(base);
        }
    }

    pub fn unload_timeout(&self) -> Duration {
        Duration::from_secs(self.plugins.unload_timeout_secs)
    }

    /// Decode the configured trusted keys.
    pub fn trusted_keys(&self) -> RuntimeResult<Vec<VerifyingKey>> {
        self.plugins
            .trusted_keys
            .iter()
            .map(|encoded| {
                let invalid = || RuntimeError::SignatureInvalid(format!("trusted key {encoded}"));
                let bytes: [u8; 32] = BASE64
                    .decode(encoded)
                    .map_err(|_| invalid())?
                    .try_into()
                    .map_err(|_| invalid())?;
                VerifyingKey::from_bytes(&bytes).map_err(|_| invalid())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: HostConfig = toml::from_str("").unwrap();
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.host.runtime_target, "native");
        assert_eq!(config.unload_timeout(), Duration::from_secs(30));
        assert!(config.host_version().is_ok());
    }

    #[test]
    fn test_parse_sections() {
        let config: HostConfig = toml::from_str(
            r#"
[host]
version = "2.1"
profile = "server"

[plugins]
directories = ["/opt/plugins"]
force_legacy = true
unload_timeout_secs = 2

[[plugins.legacy]]
id = "core"
path = "/opt/core.so"
priority = 5
"#,
        )
        .unwrap();

        assert_eq!(config.host_version().unwrap(), Version::new(2, 1, 0));
        assert_eq!(config.host.profile, "server");
        assert!(config.plugins.force_legacy);
        assert_eq!(config.plugins.legacy[0].priority, 5);
        assert_eq!(config.unload_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_trusted_keys() {
        let mut config = HostConfig::default();
        config.plugins.trusted_keys = vec!["not a key".into()];
        assert!(config.trusted_keys().is_err());

        let key = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]).verifying_key();
        config.plugins.trusted_keys = vec![BASE64.encode(key.to_bytes())];
        assert_eq!(config.trusted_keys().unwrap().len(), 1);
    }
}
