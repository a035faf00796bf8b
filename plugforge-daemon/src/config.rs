//! Configuration file loading and management
//!
//! This module handles loading and parsing the daemon configuration from
//! `$XDG_CONFIG_HOME/plugforge/config.toml`. If the configuration file doesn't
//! exist, a default configuration is created with documented comments.

use anyhow::{Context, Result};
use plugforge_host::HostConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// `[host]` and `[plugins]` sections
    #[serde(flatten)]
    pub host: HostConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Update check configuration
    #[serde(default)]
    pub updates: UpdatesConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    /// Default: "info"
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Update check configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdatesConfig {
    /// Minutes between update checks, 0 disables them
    /// Default: 60
    #[serde(default = "default_check_interval_minutes")]
    pub check_interval_minutes: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_check_interval_minutes() -> u64 {
    60
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            check_interval_minutes: default_check_interval_minutes(),
        }
    }
}

impl Config {
    /// Load configuration from the specified path
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    /// The parsed configuration or an error if loading/parsing fails
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        if let Some(dir) = path.parent() {
            config.host.resolve_paths(dir);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default XDG config location
    ///
    /// If the configuration file doesn't exist, creates a default configuration
    /// file with documented comments.
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_file(&config_path)?;
        }

        Self::load(&config_path)
    }

    /// Get the default configuration file path
    ///
    /// Returns `$XDG_CONFIG_HOME/plugforge/config.toml`
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "raibid-labs", "plugforge")
            .context("Failed to determine project directories")?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Create a default configuration file with documented comments
    pub fn create_default_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, Self::default_config_content())
            .with_context(|| format!("Failed to write default config file: {}", path.display()))?;

        tracing::info!("Created default configuration file at: {}", path.display());
        Ok(())
    }

    /// Generate the default configuration file content with comments
    pub fn default_config_content() -> String {
        r#"# plugforge Daemon Configuration
# This file configures the plugforge-daemon behavior.

[host]
# Host version checked against each plugin's compatibility window
# Default: the daemon's own version
# version = "0.1.0"

# Profile matched against each plugin's supported profiles
# Default: "default"
profile = "default"

# Entry point key used to pick each plugin's module
# Default: "native"
runtime_target = "native"

[plugins]
# Directories scanned for *.plugin.json / *.plugin.toml manifests
# If empty, defaults to the user data directory and $XDG_DATA_DIRS/plugforge/plugins
directories = []

# Use the [[plugins.legacy]] list even when manifests are found
force_legacy = false

# Seconds to wait for an unloaded plugin's module to be released
# Default: 30
unload_timeout_secs = 30

# Update records kept per plugin
# Default: 50
history_retention = 50

# Base64 ed25519 public keys trusted to sign plugins
# If empty, any valid signature is accepted
trusted_keys = []

# Legacy plugin list, used when no manifests are discovered
# [[plugins.legacy]]
# id = "core"
# path = "/usr/lib/plugforge/libcore.so"
# version = "1.0.0"
# priority = 10
# dependencies = []

[logging]
# Log level: trace, debug, info, warn, error
# RUST_LOG takes precedence when set
# Default: "info"
level = "info"

[updates]
# Minutes between update checks, 0 disables them
# Default: 60
check_interval_minutes = 60
"#
        .to_string()
    }

    /// Validate the configuration
    ///
    /// Ensures all configuration values are valid and within acceptable ranges.
    pub fn validate(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Invalid logging.level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.host
            .host_version()
            .with_context(|| format!("Invalid host.version: {}", self.host.host.version))?;

        if self.host.host.runtime_target.is_empty() {
            anyhow::bail!("host.runtime_target must not be empty");
        }

        if self.host.plugins.unload_timeout_secs == 0 {
            anyhow::bail!("plugins.unload_timeout_secs must be greater than 0");
        }

        if self.host.plugins.history_retention == 0 {
            anyhow::bail!("plugins.history_retention must be greater than 0");
        }

        self.host
            .trusted_keys()
            .context("Invalid entry in plugins.trusted_keys")?;

        for entry in &self.host.plugins.legacy {
            if entry.id.is_empty() {
                anyhow::bail!("Legacy plugin entry at {} has no id", entry.path.display());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.updates.check_interval_minutes, 60);
        assert_eq!(config.host.host.profile, "default");
        assert!(config.host.plugins.directories.is_empty());
    }

    #[test]
    fn test_default_content_is_valid() {
        let config: Config = toml::from_str(&Config::default_config_content()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_valid_config() {
        let config_content = r#"
[host]
version = "2.0"
profile = "server"

[plugins]
directories = ["/opt/plugforge/plugins"]
unload_timeout_secs = 5

[[plugins.legacy]]
id = "core"
path = "/opt/plugforge/libcore.so"

[logging]
level = "debug"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(config_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.host.host.profile, "server");
        assert_eq!(config.host.plugins.unload_timeout_secs, 5);
        assert_eq!(config.host.plugins.legacy.len(), 1);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.updates.check_interval_minutes, 60);
    }

    #[test]
    fn test_legacy_paths_relative_to_config_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[[plugins.legacy]]
id = "local"
path = "modules/liblocal.so"

[[plugins.legacy]]
id = "system"
path = "/usr/lib/plugforge/libsystem.so"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        let legacy = &config.host.plugins.legacy;
        assert_eq!(legacy[0].path, temp_dir.path().join("modules/liblocal.so"));
        assert_eq!(legacy[1].path, PathBuf::from("/usr/lib/plugforge/libsystem.so"));
    }

    #[test]
    fn test_load_minimal_config() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"").unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_create_default_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        Config::create_default_file(&path).unwrap();
        assert!(path.exists());
        assert!(Config::load(&path).is_ok());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_host_version() {
        let mut config = Config::default();
        config.host.host.version = "not-a-version".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_unload_timeout() {
        let mut config = Config::default();
        config.host.plugins.unload_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_trusted_key() {
        let mut config = Config::default();
        config.host.plugins.trusted_keys = vec!["nope".to_string()];
        assert!(config.validate().is_err());
    }
}
