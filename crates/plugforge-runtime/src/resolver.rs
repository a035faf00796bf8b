//! Dependency resolution and load ordering.
//!
//! Resolution runs in stages: host-incompatible manifests are dropped, the
//! highest version of each plugin id is selected, every dependency edge and
//! declared conflict is validated, and the survivors are topologically
//! sorted so that dependencies always precede their dependents.
//!
//! Plugins with no ordering constraint between them keep the order in which
//! their id first appeared in the input.

use crate::error::{RuntimeError, RuntimeResult};
use crate::manifest::PluginManifest;
use crate::version::VersionRange;
use semver::Version;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, info, warn};

/// What is wrong with one dependency edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    /// The dependency is not present at all.
    Missing,
    /// The dependency is present at a version outside the range.
    VersionMismatch { requirement: String, found: Version },
    /// The requirement could not be parsed.
    InvalidRange { requirement: String },
    /// The dependency is a declared conflict that is present.
    Conflict,
}

/// A single failed dependency or conflict check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyViolation {
    pub plugin: String,
    pub dependency: String,
    pub kind: ViolationKind,
}

impl DependencyViolation {
    fn into_error(self) -> RuntimeError {
        match self.kind {
            ViolationKind::Missing => RuntimeError::UnsatisfiedDependency {
                plugin: self.plugin,
                dependency: self.dependency,
            },
            ViolationKind::VersionMismatch { requirement, found } => {
                RuntimeError::VersionConflict {
                    plugin: self.plugin,
                    dependency: self.dependency,
                    requirement,
                    found: found.to_string(),
                }
            }
            ViolationKind::InvalidRange { requirement } => RuntimeError::VersionConflict {
                plugin: self.plugin,
                dependency: self.dependency,
                requirement,
                found: "unparsable requirement".to_string(),
            },
            ViolationKind::Conflict => RuntimeError::ConflictingPlugins {
                plugin: self.plugin,
                conflict: self.dependency,
            },
        }
    }
}

impl fmt::Display for DependencyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ViolationKind::Missing => write!(f, "{} -> {}", self.plugin, self.dependency),
            ViolationKind::VersionMismatch { requirement, found } => write!(
                f,
                "{} -> {} {} (found {})",
                self.plugin, self.dependency, requirement, found
            ),
            ViolationKind::InvalidRange { requirement } => write!(
                f,
                "{} -> {} (invalid range '{}')",
                self.plugin, self.dependency, requirement
            ),
            ViolationKind::Conflict => {
                write!(f, "{} conflicts with {}", self.plugin, self.dependency)
            }
        }
    }
}

/// Result of a pre-flight dependency check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyValidation {
    pub violations: Vec<DependencyViolation>,
}

impl DependencyValidation {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// Convert into a `DependencyValidation` error when there are violations.
    pub fn into_result(self) -> RuntimeResult<()> {
        if self.is_valid() {
            return Ok(());
        }
        Err(RuntimeError::DependencyValidation {
            violations: self.violations.iter().map(ToString::to_string).collect(),
        })
    }
}

/// All versions of `plugin_id` present in `manifests`, highest first.
pub fn find_available_versions(manifests: &[PluginManifest], plugin_id: &str) -> Vec<Version> {
    let mut versions: Vec<Version> = manifests
        .iter()
        .filter(|m| m.id == plugin_id)
        .map(|m| m.version.clone())
        .collect();
    versions.sort_by(|a, b| b.cmp(a));
    versions.dedup();
    versions
}

/// The highest version of `plugin_id` that satisfies `range`.
pub fn find_best_version<'a>(
    manifests: &'a [PluginManifest],
    plugin_id: &str,
    range: &VersionRange,
) -> Option<&'a PluginManifest> {
    manifests
        .iter()
        .filter(|m| m.id == plugin_id && range.satisfies(&m.version))
        .fold(None, |best: Option<&PluginManifest>, m| match best {
            Some(b) if b.version >= m.version => Some(b),
            _ => Some(m),
        })
}

/// Keep the highest version of each id, in order of first appearance.
fn select_highest_versions(manifests: &[PluginManifest]) -> Vec<&PluginManifest> {
    let mut selected: Vec<&PluginManifest> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for manifest in manifests {
        match index.get(manifest.id.as_str()) {
            Some(&i) => {
                let current = selected[i];
                if manifest.version > current.version {
                    debug!(
                        "Plugin {} v{} shadows v{}",
                        manifest.id, manifest.version, current.version
                    );
                    selected[i] = manifest;
                } else {
                    debug!(
                        "Plugin {} v{} shadowed by v{}",
                        manifest.id, manifest.version, current.version
                    );
                }
            }
            None => {
                index.insert(manifest.id.as_str(), selected.len());
                selected.push(manifest);
            }
        }
    }

    selected
}

fn collect_violations(selected: &[&PluginManifest]) -> Vec<DependencyViolation> {
    let by_id: HashMap<&str, &PluginManifest> =
        selected.iter().map(|m| (m.id.as_str(), *m)).collect();
    let mut violations = Vec::new();

    for manifest in selected {
        for (dependency, requirement) in &manifest.dependencies {
            let violation = |kind| DependencyViolation {
                plugin: manifest.id.clone(),
                dependency: dependency.clone(),
                kind,
            };

            let Some(found) = by_id.get(dependency.as_str()) else {
                violations.push(violation(ViolationKind::Missing));
                continue;
            };
            match VersionRange::parse(requirement) {
                Ok(range) if range.satisfies(&found.version) => {}
                Ok(_) => violations.push(violation(ViolationKind::VersionMismatch {
                    requirement: requirement.clone(),
                    found: found.version.clone(),
                })),
                Err(_) => violations.push(violation(ViolationKind::InvalidRange {
                    requirement: requirement.clone(),
                })),
            }
        }
    }

    for manifest in selected {
        for conflict in manifest.conflicts() {
            if by_id.contains_key(conflict.as_str()) {
                violations.push(DependencyViolation {
                    plugin: manifest.id.clone(),
                    dependency: conflict.clone(),
                    kind: ViolationKind::Conflict,
                });
            }
        }
    }

    violations
}

/// Check every dependency edge and declared conflict without sorting.
///
/// Validation runs against the highest version of each plugin id.
pub fn validate_dependencies(manifests: &[PluginManifest]) -> DependencyValidation {
    let selected = select_highest_versions(manifests);
    DependencyValidation {
        violations: collect_violations(&selected),
    }
}

/// Compute the order in which plugins must be loaded.
pub fn resolve_load_order(
    manifests: &[PluginManifest],
    host_version: &Version,
) -> RuntimeResult<Vec<PluginManifest>> {
    let compatible: Vec<PluginManifest> = manifests
        .iter()
        .filter(|m| {
            let ok = m.is_compatible_with(host_version);
            if !ok {
                info!(
                    "Skipping plugin {} v{}: not compatible with host {}",
                    m.id, m.version, host_version
                );
            }
            ok
        })
        .cloned()
        .collect();

    let selected = select_highest_versions(&compatible);

    let mut violations = collect_violations(&selected);
    if !violations.is_empty() {
        for v in &violations {
            warn!("Dependency violation: {}", v);
        }
        // Dependency edges are reported before conflicts.
        return Err(violations.remove(0).into_error());
    }

    let order = topological_sort(&selected)?;
    info!(
        "Resolved load order: {}",
        order
            .iter()
            .map(|m| m.key())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(order)
}

/// Kahn's algorithm with edges pointing from dependency to dependent.
fn topological_sort(selected: &[&PluginManifest]) -> RuntimeResult<Vec<PluginManifest>> {
    let index: HashMap<&str, usize> = selected
        .iter()
        .enumerate()
        .map(|(i, m)| (m.id.as_str(), i))
        .collect();

    let mut pending = vec![0usize; selected.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); selected.len()];
    for (i, manifest) in selected.iter().enumerate() {
        for dependency in manifest.dependencies.keys() {
            if let Some(&j) = index.get(dependency.as_str()) {
                pending[i] += 1;
                dependents[j].push(i);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..selected.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(selected.len());

    while let Some(i) = ready.pop_first() {
        order.push(selected[i].clone());
        for &d in &dependents[i] {
            pending[d] -= 1;
            if pending[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() != selected.len() {
        let plugins: Vec<String> = (0..selected.len())
            .filter(|&i| pending[i] > 0)
            .map(|i| selected[i].id.clone())
            .collect();
        return Err(RuntimeError::CircularDependency { plugins });
    }

    Ok(order)
}
