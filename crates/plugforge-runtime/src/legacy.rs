//! Adapter for the flat plugin list used before manifest files existed.
//!
//! Hosts that still configure plugins as a list of module paths get
//! synthesised manifests so the rest of the pipeline treats them like any
//! discovered plugin.

use crate::manifest::{LoadStrategy, PluginManifest};
use crate::version::parse_version;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Runtime target under which legacy modules are registered.
pub const LEGACY_TARGET: &str = "native";

/// One entry of the legacy plugin list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyPluginEntry {
    pub id: String,

    /// Module path.
    pub path: PathBuf,

    #[serde(default)]
    pub version: Option<String>,

    /// Higher values load first among otherwise unordered plugins.
    #[serde(default)]
    pub priority: i32,

    #[serde(default, alias = "load_strategy")]
    pub load_strategy: LoadStrategy,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Plugin ids this entry depends on, at any version.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl LegacyPluginEntry {
    /// Anchor a relative module path at `base`, normally the directory of
    /// the configuration file the entry came from.
    pub fn resolve_relative_to(&mut self, base: &Path) {
        if self.path.is_relative() {
            self.path = base.join(&self.path);
        }
    }

    /// Synthesise a manifest for this entry.
    pub fn to_manifest(&self) -> PluginManifest {
        let version = match self.version.as_deref().map(parse_version) {
            Some(Ok(v)) => v,
            Some(Err(e)) => {
                warn!("Legacy plugin {}: {}, using 0.0.0", self.id, e);
                Version::new(0, 0, 0)
            }
            None => Version::new(0, 0, 0),
        };

        let mut manifest = PluginManifest::new(self.id.clone(), version);
        manifest
            .entry_points
            .insert(LEGACY_TARGET.to_string(), self.path.clone());
        manifest.dependencies = self
            .dependencies
            .iter()
            .map(|id| (id.clone(), "*".to_string()))
            .collect();
        manifest.load_strategy = self.load_strategy;
        manifest.enabled = self.enabled;
        manifest
    }
}

/// Convert legacy entries to manifests, highest priority first.
///
/// Disabled entries are dropped. Entries with equal priority keep their
/// configured order.
pub fn manifests_from_legacy(entries: &[LegacyPluginEntry]) -> Vec<PluginManifest> {
    let mut enabled: Vec<&LegacyPluginEntry> = entries
        .iter()
        .filter(|e| {
            if !e.enabled {
                debug!("Skipping disabled legacy plugin: {}", e.id);
            }
            e.enabled
        })
        .collect();
    enabled.sort_by(|a, b| b.priority.cmp(&a.priority));
    enabled.into_iter().map(LegacyPluginEntry::to_manifest).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, priority: i32) -> LegacyPluginEntry {
        LegacyPluginEntry {
            id: id.to_string(),
            path: PathBuf::from(format!("/plugins/{id}.so")),
            version: None,
            priority,
            load_strategy: LoadStrategy::Lazy,
            enabled: true,
            dependencies: Vec::new(),
        }
    }

    #[test]
    fn test_sorted_by_priority_stable() {
        let mut disabled = entry("off", 100);
        disabled.enabled = false;
        let entries = vec![
            entry("low", 1),
            entry("first-high", 10),
            disabled,
            entry("second-high", 10),
        ];

        let ids: Vec<_> = manifests_from_legacy(&entries)
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["first-high", "second-high", "low"]);
    }

    #[test]
    fn test_to_manifest() {
        let mut e = entry("audio", 0);
        e.version = Some("1.4".into());
        e.dependencies = vec!["core".into()];

        let manifest = e.to_manifest();
        assert_eq!(manifest.version, Version::new(1, 4, 0));
        assert_eq!(manifest.dependencies["core"], "*");
        assert_eq!(
            manifest.entry_point(LEGACY_TARGET).unwrap(),
            std::path::Path::new("/plugins/audio.so")
        );
        assert_eq!(manifest.plugin_root(), Some(PathBuf::from("/plugins")));
    }

    #[test]
    fn test_relative_path_is_anchored() {
        let mut relative = entry("rel", 0);
        relative.path = PathBuf::from("lib/rel.so");
        relative.resolve_relative_to(Path::new("/etc/plugforge"));
        assert_eq!(relative.path, PathBuf::from("/etc/plugforge/lib/rel.so"));
        assert_eq!(
            relative.to_manifest().plugin_root(),
            Some(PathBuf::from("/etc/plugforge/lib"))
        );

        let mut absolute = entry("abs", 0);
        absolute.resolve_relative_to(Path::new("/etc/plugforge"));
        assert_eq!(absolute.path, PathBuf::from("/plugins/abs.so"));
    }

    #[test]
    fn test_bad_version_falls_back() {
        let mut e = entry("x", 0);
        e.version = Some("nope".into());
        assert_eq!(e.to_manifest().version, Version::new(0, 0, 0));
    }
}
