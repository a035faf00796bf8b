//! Plugin integrity checks.
//!
//! A plugin signature is an ed25519 signature over the plugin's content
//! hash. The content hash is a SHA-256 digest over every file under the
//! plugin root (manifest files excluded), visited in relative-path order.
//! For each file the digest absorbs the `/`-separated relative path, a NUL
//! byte, the file length as 8 little-endian bytes and the file contents.

use crate::error::{RuntimeError, RuntimeResult};
use crate::manifest::{is_manifest_file, PluginManifest, SecurityLevel};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// The only supported signature algorithm.
pub const ED25519: &str = "ed25519";

/// Detached signature carried in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSignature {
    /// Base64 signature bytes.
    pub signature: String,

    /// Base64 ed25519 public key.
    #[serde(alias = "public_key")]
    pub public_key: String,

    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    #[serde(default, alias = "signed_at")]
    pub signed_at: Option<DateTime<Utc>>,

    /// Carried for publishers that issue certificates; not validated.
    #[serde(default, alias = "certificate_chain")]
    pub certificate_chain: Vec<String>,
}

fn default_algorithm() -> String {
    ED25519.to_string()
}

/// Outcome of the security gate for a plugin that is allowed to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityVerdict {
    pub level: SecurityLevel,
    pub signed: bool,
    pub verified: bool,
    pub warnings: Vec<String>,
}

impl SecurityVerdict {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// List the files that make up a plugin, sorted by path relative to its root.
pub fn plugin_files(manifest: &PluginManifest) -> RuntimeResult<Vec<PathBuf>> {
    let root = plugin_root(manifest)?;
    let mut files = Vec::new();
    for entry in WalkDir::new(&root).follow_links(false) {
        let entry = entry.map_err(|e| {
            RuntimeError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walk error")),
            )
        })?;
        if entry.file_type().is_file() && !is_manifest_file(entry.path()) {
            files.push(entry.into_path());
        }
    }
    files.sort_by_key(|f| relative_name(&root, f));
    Ok(files)
}

/// Compute the content hash of a plugin as a lowercase hex string.
pub fn compute_plugin_hash(root: &Path, files: &[PathBuf]) -> RuntimeResult<String> {
    let mut ordered: Vec<(String, &PathBuf)> =
        files.iter().map(|f| (relative_name(root, f), f)).collect();
    ordered.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (name, path) in ordered {
        let contents = std::fs::read(path)?;
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update((contents.len() as u64).to_le_bytes());
        hasher.update(&contents);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn plugin_root(manifest: &PluginManifest) -> RuntimeResult<PathBuf> {
    manifest
        .plugin_root()
        .ok_or_else(|| RuntimeError::ManifestParse {
            path: manifest.source_path.clone(),
            reason: format!("Plugin {} has no root directory", manifest.id),
        })
}

fn relative_name(root: &Path, file: &Path) -> String {
    let rel = file.strip_prefix(root).unwrap_or(file);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Message that is actually signed: binds identity and content together.
fn signing_message(manifest: &PluginManifest, hash: &str) -> Vec<u8> {
    format!("{}@{}:{}", manifest.id, manifest.version, hash).into_bytes()
}

/// Verifies and produces plugin signatures.
///
/// With no trusted keys configured, any well-formed key embedded in the
/// manifest is accepted. Once keys are trusted, signatures from other keys
/// fail verification.
#[derive(Debug, Clone, Default)]
pub struct SignatureVerifier {
    trusted_keys: Vec<[u8; 32]>,
}

impl SignatureVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict verification to signatures made with this key.
    pub fn add_trusted_key(&mut self, key: &VerifyingKey) {
        let bytes = key.to_bytes();
        if !self.trusted_keys.contains(&bytes) {
            self.trusted_keys.push(bytes);
        }
    }

    pub fn trusted_key_count(&self) -> usize {
        self.trusted_keys.len()
    }

    /// Check the manifest's signature against the plugin's current contents.
    ///
    /// Returns `Ok(false)` for a missing, malformed or mismatching signature;
    /// errors are reserved for failures reading the plugin files.
    pub fn verify(&self, manifest: &PluginManifest, files: &[PathBuf]) -> RuntimeResult<bool> {
        let Some(signature) = manifest.signature() else {
            return Ok(false);
        };
        if !signature.algorithm.eq_ignore_ascii_case(ED25519) {
            debug!(
                "Unsupported signature algorithm {} for plugin {}",
                signature.algorithm, manifest.id
            );
            return Ok(false);
        }

        let Some(key) = decode_public_key(&signature.public_key) else {
            debug!("Malformed public key for plugin {}", manifest.id);
            return Ok(false);
        };
        if !self.trusted_keys.is_empty() && !self.trusted_keys.contains(&key.to_bytes()) {
            debug!("Plugin {} is signed by an untrusted key", manifest.id);
            return Ok(false);
        }
        let Some(sig) = decode_signature(&signature.signature) else {
            debug!("Malformed signature for plugin {}", manifest.id);
            return Ok(false);
        };

        let hash = compute_plugin_hash(&plugin_root(manifest)?, files)?;
        Ok(key.verify(&signing_message(manifest, &hash), &sig).is_ok())
    }

    /// Sign a plugin's current contents.
    pub fn sign(
        &self,
        manifest: &PluginManifest,
        files: &[PathBuf],
        signing_key: &SigningKey,
    ) -> RuntimeResult<PluginSignature> {
        let hash = compute_plugin_hash(&plugin_root(manifest)?, files)?;
        let sig = signing_key.sign(&signing_message(manifest, &hash));
        info!("Signed plugin {} (hash {})", manifest.key(), hash);
        Ok(PluginSignature {
            signature: BASE64.encode(sig.to_bytes()),
            public_key: BASE64.encode(signing_key.verifying_key().to_bytes()),
            algorithm: ED25519.to_string(),
            signed_at: Some(Utc::now()),
            certificate_chain: Vec::new(),
        })
    }

    /// Decide whether a plugin may load under its security level.
    ///
    /// `Restricted` and `Isolated` plugins must carry a valid signature.
    /// Lower levels load regardless, with a warning for an invalid
    /// signature. A missing signature is only reported below `Unrestricted`.
    pub fn gate(&self, manifest: &PluginManifest, files: &[PathBuf]) -> RuntimeResult<SecurityVerdict> {
        let level = manifest.security_level();
        let signed = manifest.signature().is_some();
        let mut verdict = SecurityVerdict {
            level,
            signed,
            verified: false,
            warnings: Vec::new(),
        };

        if !signed {
            if level == SecurityLevel::Unrestricted {
                return Ok(verdict);
            }
            if level.requires_signature() {
                return Err(RuntimeError::SignatureMissing(manifest.id.clone()));
            }
            warn!("Plugin {} is not signed", manifest.id);
            verdict.warnings.push("plugin is not signed".to_string());
            return Ok(verdict);
        }

        verdict.verified = self.verify(manifest, files)?;
        if !verdict.verified {
            if level.requires_signature() {
                return Err(RuntimeError::SignatureInvalid(manifest.id.clone()));
            }
            warn!("Signature of plugin {} does not verify", manifest.id);
            verdict
                .warnings
                .push("signature does not verify".to_string());
        }
        Ok(verdict)
    }
}

fn decode_public_key(encoded: &str) -> Option<VerifyingKey> {
    let bytes: [u8; 32] = BASE64.decode(encoded).ok()?.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

fn decode_signature(encoded: &str) -> Option<Signature> {
    let bytes: [u8; 64] = BASE64.decode(encoded).ok()?.try_into().ok()?;
    Some(Signature::from_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PluginSecurity;
    use rand::rngs::OsRng;
    use semver::Version;
    use tempfile::TempDir;

    fn create_plugin(dir: &Path, level: SecurityLevel) -> PluginManifest {
        std::fs::create_dir_all(dir.join("lib")).unwrap();
        std::fs::write(dir.join("lib/module.so"), b"module bytes").unwrap();
        std::fs::write(dir.join("README"), b"docs").unwrap();
        std::fs::write(dir.join("p.plugin.json"), b"{}").unwrap();

        let mut manifest = PluginManifest::new("p", Version::new(1, 0, 0));
        manifest.source_path = Some(dir.join("p.plugin.json"));
        manifest.security = Some(PluginSecurity {
            security_level: level,
            ..Default::default()
        });
        manifest
    }

    fn attach(manifest: &mut PluginManifest, signature: PluginSignature) {
        if let Some(security) = manifest.security.as_mut() {
            security.signature = Some(signature);
        }
    }

    #[test]
    fn test_plugin_files_excludes_manifest() {
        let temp = TempDir::new().unwrap();
        let manifest = create_plugin(temp.path(), SecurityLevel::Standard);

        let files = plugin_files(&manifest).unwrap();
        let names: Vec<_> = files.iter().map(|f| relative_name(temp.path(), f)).collect();
        assert_eq!(names, vec!["README", "lib/module.so"]);
    }

    #[test]
    fn test_hash_is_order_independent_and_content_sensitive() {
        let temp = TempDir::new().unwrap();
        let manifest = create_plugin(temp.path(), SecurityLevel::Standard);
        let mut files = plugin_files(&manifest).unwrap();

        let first = compute_plugin_hash(temp.path(), &files).unwrap();
        files.reverse();
        assert_eq!(first, compute_plugin_hash(temp.path(), &files).unwrap());

        std::fs::write(temp.path().join("README"), b"docs!").unwrap();
        assert_ne!(first, compute_plugin_hash(temp.path(), &files).unwrap());
    }

    #[test]
    fn test_sign_and_tamper() {
        let temp = TempDir::new().unwrap();
        let mut manifest = create_plugin(temp.path(), SecurityLevel::Restricted);
        let files = plugin_files(&manifest).unwrap();
        let key = SigningKey::generate(&mut OsRng);
        let verifier = SignatureVerifier::new();

        let signature = verifier.sign(&manifest, &files, &key).unwrap();
        attach(&mut manifest, signature);
        assert!(verifier.verify(&manifest, &files).unwrap());
        assert!(verifier.gate(&manifest, &files).unwrap().verified);

        std::fs::write(temp.path().join("lib/module.so"), b"evil bytes").unwrap();
        assert!(!verifier.verify(&manifest, &files).unwrap());
        assert!(matches!(
            verifier.gate(&manifest, &files),
            Err(RuntimeError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_untrusted_key_is_rejected() {
        let temp = TempDir::new().unwrap();
        let mut manifest = create_plugin(temp.path(), SecurityLevel::Standard);
        let files = plugin_files(&manifest).unwrap();
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);

        let mut verifier = SignatureVerifier::new();
        let signature = verifier.sign(&manifest, &files, &key).unwrap();
        attach(&mut manifest, signature);
        verifier.add_trusted_key(&other.verifying_key());
        assert!(!verifier.verify(&manifest, &files).unwrap());

        verifier.add_trusted_key(&key.verifying_key());
        assert_eq!(verifier.trusted_key_count(), 2);
        assert!(verifier.verify(&manifest, &files).unwrap());
    }

    #[test]
    fn test_gate_by_level() {
        let temp = TempDir::new().unwrap();
        let verifier = SignatureVerifier::new();

        let restricted = create_plugin(temp.path(), SecurityLevel::Restricted);
        assert!(matches!(
            verifier.gate(&restricted, &[]),
            Err(RuntimeError::SignatureMissing(_))
        ));

        let standard = create_plugin(temp.path(), SecurityLevel::Standard);
        let verdict = verifier.gate(&standard, &[]).unwrap();
        assert!(!verdict.signed);
        assert!(!verdict.is_clean());

        let unrestricted = create_plugin(temp.path(), SecurityLevel::Unrestricted);
        assert!(verifier.gate(&unrestricted, &[]).unwrap().is_clean());
    }

    #[test]
    fn test_malformed_signature_is_false() {
        let temp = TempDir::new().unwrap();
        let mut manifest = create_plugin(temp.path(), SecurityLevel::Standard);
        attach(
            &mut manifest,
            PluginSignature {
                signature: "not base64!".into(),
                public_key: "AAAA".into(),
                algorithm: ED25519.into(),
                signed_at: None,
                certificate_chain: Vec::new(),
            },
        );
        assert!(!SignatureVerifier::new().verify(&manifest, &[]).unwrap());
    }

    #[test]
    fn test_unrestricted_bad_signature_warns() {
        let temp = TempDir::new().unwrap();
        let mut manifest = create_plugin(temp.path(), SecurityLevel::Unrestricted);
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let files = plugin_files(&manifest).unwrap();
        let mut signature = SignatureVerifier::new().sign(&manifest, &files, &key).unwrap();
        signature.public_key = BASE64.encode(other.verifying_key().to_bytes());
        attach(&mut manifest, signature);

        let verdict = SignatureVerifier::new().gate(&manifest, &files).unwrap();
        assert!(verdict.signed);
        assert!(!verdict.verified);
        assert_eq!(verdict.warnings, vec!["signature does not verify"]);
    }
}
