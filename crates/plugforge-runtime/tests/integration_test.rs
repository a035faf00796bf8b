//! Integration tests for the plugforge-runtime plugin model.
//!
//! These tests cover:
//! - Discovery feeding dependency resolution
//! - Signing discovered plugins and detecting tampering
//! - Legacy plugin lists as a discovery fallback
//! - Permission grants taken from manifests

use ed25519_dalek::SigningKey;
use plugforge_runtime::manifest::PluginSecurity;
use plugforge_runtime::{
    discover_plugins, manifests_from_legacy, plugin_files, resolve_load_order,
    validate_dependencies, LegacyPluginEntry, LoadStrategy, Operation, PermissionEnforcer,
    PluginManifest, RuntimeError, SecurityLevel, SignatureVerifier,
};
use rand::rngs::OsRng;
use semver::Version;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ==============================================================================
// Test Fixture Helpers
// ==============================================================================

/// Create a plugin directory with a JSON manifest and a fake module.
fn create_test_plugin(dir: &Path, id: &str, version: &str, deps: &[(&str, &str)]) -> PathBuf {
    let plugin_dir = dir.join(format!("{id}-{version}"));
    std::fs::create_dir_all(&plugin_dir).unwrap();

    let deps = deps
        .iter()
        .map(|(d, r)| format!("\"{d}\": \"{r}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let manifest = format!(
        r#"{{
    "id": "{id}",
    "version": "{version}",
    "entryPoints": {{ "native": "lib{id}.so" }},
    "dependencies": {{ {deps} }}
}}"#
    );

    let mut file = std::fs::File::create(plugin_dir.join(format!("{id}.plugin.json"))).unwrap();
    file.write_all(manifest.as_bytes()).unwrap();
    std::fs::write(plugin_dir.join(format!("lib{id}.so")), id.as_bytes()).unwrap();
    plugin_dir
}

fn scan(dir: &Path) -> Vec<PluginManifest> {
    discover_plugins(&[dir.to_path_buf()], &CancellationToken::new())
        .unwrap()
        .manifests
}

// ==============================================================================
// Discovery and Resolution
// ==============================================================================

#[test]
fn test_discovered_plugins_resolve_in_dependency_order() {
    let temp = TempDir::new().unwrap();
    create_test_plugin(temp.path(), "a", "1.0.0", &[("b", "^1.0.0")]);
    create_test_plugin(temp.path(), "b", "1.0.0", &[]);
    create_test_plugin(temp.path(), "b", "1.2.0", &[]);
    create_test_plugin(temp.path(), "c", "0.1.0", &[]);

    let manifests = scan(temp.path());
    assert_eq!(manifests.len(), 4);
    assert!(validate_dependencies(&manifests).is_valid());

    let order = resolve_load_order(&manifests, &Version::new(1, 0, 0)).unwrap();
    let keys: Vec<_> = order.iter().map(|m| m.key()).collect();
    assert_eq!(keys, vec!["b@1.2.0", "a@1.0.0", "c@0.1.0"]);

    let entry = order[0].entry_point("native").unwrap();
    assert!(entry.exists());
}

#[test]
fn test_missing_dependency_is_reported() {
    let temp = TempDir::new().unwrap();
    create_test_plugin(temp.path(), "a", "1.0.0", &[("b", "^1.0.0")]);
    create_test_plugin(temp.path(), "c", "1.0.0", &[]);

    let manifests = scan(temp.path());
    let validation = validate_dependencies(&manifests);
    assert!(!validation.is_valid());
    assert_eq!(validation.violations[0].to_string(), "a -> b");

    let err = resolve_load_order(&manifests, &Version::new(1, 0, 0)).unwrap_err();
    assert!(matches!(err, RuntimeError::UnsatisfiedDependency { .. }));
}

// ==============================================================================
// Signatures
// ==============================================================================

#[test]
fn test_signed_discovered_plugin() {
    let temp = TempDir::new().unwrap();
    let dir = create_test_plugin(temp.path(), "signed", "1.0.0", &[]);
    let mut manifest = scan(temp.path()).remove(0);

    let key = SigningKey::generate(&mut OsRng);
    let verifier = SignatureVerifier::new();
    let files = plugin_files(&manifest).unwrap();
    assert_eq!(files.len(), 1);

    let signature = verifier.sign(&manifest, &files, &key).unwrap();
    manifest.security = Some(PluginSecurity {
        signature: Some(signature),
        security_level: SecurityLevel::Isolated,
        ..Default::default()
    });
    assert!(verifier.gate(&manifest, &files).unwrap().verified);

    // Adding a file changes the plugin's content set.
    std::fs::write(dir.join("payload.bin"), b"extra").unwrap();
    let files = plugin_files(&manifest).unwrap();
    assert!(!verifier.verify(&manifest, &files).unwrap());
    assert!(matches!(
        verifier.gate(&manifest, &files),
        Err(RuntimeError::SignatureInvalid(_))
    ));
}

// ==============================================================================
// Legacy Fallback
// ==============================================================================

#[test]
fn test_legacy_entries_resolve() {
    let entries: Vec<LegacyPluginEntry> = serde_json::from_str(
        r#"[
            { "id": "ui", "path": "/opt/ui.so", "priority": 1, "dependencies": ["core"] },
            { "id": "core", "path": "/opt/core.so", "priority": 10 },
            { "id": "tools", "path": "/opt/tools.so", "loadStrategy": "explicit" },
            { "id": "old", "path": "/opt/old.so", "enabled": false }
        ]"#,
    )
    .unwrap();

    let manifests = manifests_from_legacy(&entries);
    assert_eq!(manifests.len(), 3);
    assert_eq!(manifests[2].load_strategy, LoadStrategy::Explicit);

    let order = resolve_load_order(&manifests, &Version::new(1, 0, 0)).unwrap();
    let ids: Vec<_> = order.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["core", "ui", "tools"]);
}

// ==============================================================================
// Permissions
// ==============================================================================

#[test]
fn test_manifest_permissions_are_enforced() {
    let manifest = PluginManifest::from_json_str(
        r#"{
            "id": "net",
            "version": "1.0.0",
            "security": {
                "securityLevel": "standard",
                "permissions": {
                    "network": { "canListen": true, "allowedPorts": [8080] },
                    "custom": { "audio.capture": true }
                }
            }
        }"#,
    )
    .unwrap();

    let enforcer = PermissionEnforcer::new();
    enforcer.register_permissions(&manifest.id, manifest.permissions());

    assert!(enforcer.has_permission("net", &Operation::NetworkListen, None));
    assert!(enforcer.has_permission("net", &Operation::NetworkHttp, None));
    assert!(enforcer.has_permission("net", &"audio.capture".parse().unwrap(), None));
    assert!(!enforcer.has_permission("net", &Operation::FileWrite, None));
    assert!(enforcer
        .enforce_permission("other", &Operation::FileRead, None)
        .is_err());
}
