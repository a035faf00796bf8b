//! Semantic versions and version-range expressions.
//!
//! Dependency requirements in manifests accept the following forms:
//!
//! | Expression          | Meaning                  |
//! |---------------------|--------------------------|
//! | `*`                 | any version              |
//! | `1.2.3`             | exactly 1.2.3            |
//! | `^1.2.3`            | `>=1.2.3, <2.0.0`        |
//! | `~1.2.3`            | `>=1.2.3, <1.3.0`        |
//! | `[1.0.0, 2.0.0)`    | interval notation        |
//! | `>=1.0.0 <2.0.0`    | comparator list          |

use crate::error::{RuntimeError, RuntimeResult};
use semver::Version;
use std::fmt;
use std::str::FromStr;

/// Parse a version string, padding missing minor/patch components.
///
/// `1` and `1.2` are accepted as `1.0.0` and `1.2.0`; a leading `v` is ignored.
pub fn parse_version(input: &str) -> RuntimeResult<Version> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Err(RuntimeError::InvalidVersion(input.to_string()));
    }

    let split_at = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split_at);
    let padded = match core.split('.').count() {
        1 => format!("{core}.0.0{suffix}"),
        2 => format!("{core}.0{suffix}"),
        _ => trimmed.to_string(),
    };

    Version::parse(&padded).map_err(|_| RuntimeError::InvalidVersion(input.to_string()))
}

/// One end of a version interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bound {
    pub version: Version,
    pub inclusive: bool,
}

impl Bound {
    fn inclusive(version: Version) -> Self {
        Self {
            version,
            inclusive: true,
        }
    }

    fn exclusive(version: Version) -> Self {
        Self {
            version,
            inclusive: false,
        }
    }
}

/// A parsed version requirement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionRange {
    min: Option<Bound>,
    max: Option<Bound>,
}

impl VersionRange {
    /// A range matching every version.
    pub fn any() -> Self {
        Self::default()
    }

    /// A range matching exactly one version.
    pub fn exact(version: Version) -> Self {
        Self {
            min: Some(Bound::inclusive(version.clone())),
            max: Some(Bound::inclusive(version)),
        }
    }

    /// Parse a range expression.
    pub fn parse(expr: &str) -> RuntimeResult<Self> {
        let trimmed = expr.trim();
        let invalid = |reason: &str| RuntimeError::InvalidVersionRange {
            range: expr.to_string(),
            reason: reason.to_string(),
        };

        if trimmed.is_empty() || trimmed == "*" || trimmed == "latest" {
            return Ok(Self::any());
        }

        if let Some(rest) = trimmed.strip_prefix('^') {
            let version = parse_version(rest).map_err(|_| invalid("bad caret version"))?;
            let upper = Version::new(version.major + 1, 0, 0);
            return Ok(Self {
                min: Some(Bound::inclusive(version)),
                max: Some(Bound::exclusive(upper)),
            });
        }

        if let Some(rest) = trimmed.strip_prefix('~') {
            let version = parse_version(rest).map_err(|_| invalid("bad tilde version"))?;
            let upper = Version::new(version.major, version.minor + 1, 0);
            return Ok(Self {
                min: Some(Bound::inclusive(version)),
                max: Some(Bound::exclusive(upper)),
            });
        }

        if trimmed.starts_with('[') || trimmed.starts_with('(') {
            return Self::parse_interval(trimmed).map_err(|reason| invalid(&reason));
        }

        if trimmed.starts_with(['>', '<', '=']) {
            return Self::parse_comparators(trimmed).map_err(|reason| invalid(&reason));
        }

        let version = parse_version(trimmed).map_err(|_| invalid("not a version"))?;
        Ok(Self::exact(version))
    }

    fn parse_interval(expr: &str) -> Result<Self, String> {
        let min_inclusive = expr.starts_with('[');
        let max_inclusive = if expr.ends_with(']') {
            true
        } else if expr.ends_with(')') {
            false
        } else {
            return Err("interval must end with ']' or ')'".to_string());
        };
        let inner = &expr[1..expr.len() - 1];

        let Some((lower, upper)) = inner.split_once(',') else {
            // `[1.0.0]` pins a single version.
            if !(min_inclusive && max_inclusive) {
                return Err("single-version interval must be inclusive".to_string());
            }
            let version = parse_version(inner).map_err(|e| e.to_string())?;
            return Ok(Self::exact(version));
        };

        let bound = |text: &str, inclusive: bool| -> Result<Option<Bound>, String> {
            let text = text.trim();
            if text.is_empty() {
                return Ok(None);
            }
            let version = parse_version(text).map_err(|e| e.to_string())?;
            Ok(Some(Bound { version, inclusive }))
        };

        let range = Self {
            min: bound(lower, min_inclusive)?,
            max: bound(upper, max_inclusive)?,
        };
        if range.min.is_none() && range.max.is_none() {
            return Err("interval has no bounds".to_string());
        }
        Ok(range)
    }

    fn parse_comparators(expr: &str) -> Result<Self, String> {
        let mut range = Self::any();
        for token in expr.split([' ', ',']).filter(|t| !t.is_empty()) {
            let (op, rest) = if let Some(rest) = token.strip_prefix(">=") {
                (">=", rest)
            } else if let Some(rest) = token.strip_prefix("<=") {
                ("<=", rest)
            } else if let Some(rest) = token.strip_prefix('>') {
                (">", rest)
            } else if let Some(rest) = token.strip_prefix('<') {
                ("<", rest)
            } else if let Some(rest) = token.strip_prefix('=') {
                ("=", rest)
            } else {
                return Err(format!("unknown comparator '{token}'"));
            };
            let version = parse_version(rest).map_err(|e| e.to_string())?;
            match op {
                ">=" => range.raise_min(Bound::inclusive(version)),
                ">" => range.raise_min(Bound::exclusive(version)),
                "<=" => range.lower_max(Bound::inclusive(version)),
                "<" => range.lower_max(Bound::exclusive(version)),
                _ => {
                    range.raise_min(Bound::inclusive(version.clone()));
                    range.lower_max(Bound::inclusive(version));
                }
            }
        }
        if range.is_empty() {
            return Err("comparators exclude every version".to_string());
        }
        Ok(range)
    }

    // Comparators intersect, so each new bound only ever narrows the range.
    fn raise_min(&mut self, bound: Bound) {
        let tighter = match &self.min {
            None => true,
            Some(cur) => {
                bound.version > cur.version
                    || (bound.version == cur.version && cur.inclusive && !bound.inclusive)
            }
        };
        if tighter {
            self.min = Some(bound);
        }
    }

    fn lower_max(&mut self, bound: Bound) {
        let tighter = match &self.max {
            None => true,
            Some(cur) => {
                bound.version < cur.version
                    || (bound.version == cur.version && cur.inclusive && !bound.inclusive)
            }
        };
        if tighter {
            self.max = Some(bound);
        }
    }

    fn is_empty(&self) -> bool {
        match (&self.min, &self.max) {
            (Some(lo), Some(hi)) => {
                lo.version > hi.version
                    || (lo.version == hi.version && !(lo.inclusive && hi.inclusive))
            }
            _ => false,
        }
    }

    /// Check whether a version falls inside this range.
    pub fn satisfies(&self, version: &Version) -> bool {
        let above_min = match &self.min {
            None => true,
            Some(b) if b.inclusive => version >= &b.version,
            Some(b) => version > &b.version,
        };
        let below_max = match &self.max {
            None => true,
            Some(b) if b.inclusive => version <= &b.version,
            Some(b) => version < &b.version,
        };
        above_min && below_max
    }

    /// Whether the range accepts any version.
    pub fn is_any(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    pub fn min(&self) -> Option<&Bound> {
        self.min.as_ref()
    }

    pub fn max(&self) -> Option<&Bound> {
        self.max.as_ref()
    }
}

impl FromStr for VersionRange {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.min, &self.max) {
            (None, None) => write!(f, "*"),
            (Some(lo), Some(hi)) if lo.inclusive && hi.inclusive && lo.version == hi.version => {
                write!(f, "{}", lo.version)
            }
            (Some(lo), None) => write!(f, "{}{}", if lo.inclusive { ">=" } else { ">" }, lo.version),
            (None, Some(hi)) => write!(f, "{}{}", if hi.inclusive { "<=" } else { "<" }, hi.version),
            (Some(lo), Some(hi)) => write!(
                f,
                "{}{}, {}{}",
                if lo.inclusive { '[' } else { '(' },
                lo.version,
                hi.version,
                if hi.inclusive { ']' } else { ')' }
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        parse_version(s).unwrap()
    }

    #[test]
    fn test_parse_version_pads_components() {
        assert_eq!(v("1"), Version::new(1, 0, 0));
        assert_eq!(v("1.2"), Version::new(1, 2, 0));
        assert_eq!(v("v2.3.4"), Version::new(2, 3, 4));
        assert_eq!(v("1.2-beta.1").pre.as_str(), "beta.1");
        assert!(parse_version("").is_err());
        assert!(parse_version("one.two").is_err());
    }

    #[test]
    fn test_caret_range() {
        let range = VersionRange::parse("^1.0.0").unwrap();
        assert!(range.satisfies(&v("1.0.0")));
        assert!(range.satisfies(&v("1.9.3")));
        assert!(!range.satisfies(&v("2.0.0")));
        assert!(!range.satisfies(&v("0.9.0")));
    }

    #[test]
    fn test_tilde_range() {
        let range = VersionRange::parse("~1.2.3").unwrap();
        assert!(range.satisfies(&v("1.2.3")));
        assert!(range.satisfies(&v("1.2.9")));
        assert!(!range.satisfies(&v("1.3.0")));
    }

    #[test]
    fn test_exact_and_any() {
        let exact = VersionRange::parse("1.2.0").unwrap();
        assert!(exact.satisfies(&v("1.2.0")));
        assert!(!exact.satisfies(&v("1.2.1")));

        let any = VersionRange::parse("*").unwrap();
        assert!(any.is_any());
        assert!(any.satisfies(&v("42.0.0")));
    }

    #[test]
    fn test_interval_notation() {
        let range = VersionRange::parse("[1.0.0, 2.0.0)").unwrap();
        assert!(range.satisfies(&v("1.0.0")));
        assert!(range.satisfies(&v("1.99.0")));
        assert!(!range.satisfies(&v("2.0.0")));

        let open = VersionRange::parse("(1.0.0,)").unwrap();
        assert!(!open.satisfies(&v("1.0.0")));
        assert!(open.satisfies(&v("1.0.1")));

        let pinned = VersionRange::parse("[3.1.0]").unwrap();
        assert!(pinned.satisfies(&v("3.1.0")));
        assert!(!pinned.satisfies(&v("3.1.1")));

        assert!(VersionRange::parse("[1.0.0, 2.0.0").is_err());
        assert!(VersionRange::parse("(1.0.0)").is_err());
    }

    #[test]
    fn test_comparator_list() {
        let range = VersionRange::parse(">=1.0.0 <2.0.0").unwrap();
        assert!(range.satisfies(&v("1.5.0")));
        assert!(!range.satisfies(&v("2.0.0")));
        assert!(VersionRange::parse(">>1.0.0").is_err());
    }

    #[test]
    fn test_comparators_intersect() {
        let pinned = VersionRange::parse("=1.2.0 <2.0.0").unwrap();
        assert_eq!(pinned, VersionRange::exact(v("1.2.0")));

        let narrowed = VersionRange::parse(">=1.0.0 >=1.5.0 <3.0.0 <=2.0.0").unwrap();
        assert!(!narrowed.satisfies(&v("1.2.0")));
        assert!(narrowed.satisfies(&v("2.0.0")));
        assert!(!narrowed.satisfies(&v("2.1.0")));

        assert!(VersionRange::parse("=1.0.0 <0.5").is_err());
        assert!(VersionRange::parse(">=2.0.0 <2.0.0").is_err());
    }

    #[test]
    fn test_display_round_trips_meaning() {
        let range = VersionRange::parse("^1.2.0").unwrap();
        assert_eq!(range.to_string(), "[1.2.0, 2.0.0)");
        let reparsed = VersionRange::parse(&range.to_string()).unwrap();
        assert_eq!(range, reparsed);
        assert_eq!(VersionRange::parse("1.0.0").unwrap().to_string(), "1.0.0");
    }
}
