use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::version::Version;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstraintParseError {
    #[error("empty version constraint segment in '{0}'")]
    EmptySegment(String),

    #[error("missing version after '=' in '{0}'")]
    EmptyExact(String),
}

/// A constraint over version values.
///
/// Grammar (one segment): `=1.2.3` exact, `1.2` prefix, `1.2:1.4` inclusive
/// range with optional bounds (`1.2:`, `:1.4`, `:`). Comma-separated
/// segments form a union.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionConstraint {
    /// Matches any version (`:`).
    Any,
    /// Matches exactly one version (`=1.2.3`).
    Exact(Version),
    /// Matches the version or any version it prefixes (`1.2` matches `1.2.5`).
    Prefix(Version),
    /// Inclusive range; the upper bound matches by prefix as well, so
    /// `:1.4` includes `1.4.5`.
    Range {
        lo: Option<Version>,
        hi: Option<Version>,
    },
    /// Union of segments, in input order.
    Union(Vec<VersionConstraint>),
}

impl VersionConstraint {
    /// Exact pin on a version.
    pub fn exact(version: Version) -> VersionConstraint {
        VersionConstraint::Exact(version)
    }

    /// True if this constraint pins a single version.
    pub fn is_exact(&self) -> bool {
        matches!(self, VersionConstraint::Exact(_))
    }

    pub fn is_any(&self) -> bool {
        matches!(self, VersionConstraint::Any)
    }

    /// The pinned version, if this constraint is exact.
    pub fn as_exact(&self) -> Option<&Version> {
        match self {
            VersionConstraint::Exact(v) => Some(v),
            _ => None,
        }
    }

    pub fn satisfies(&self, version: &Version) -> bool {
        match self {
            VersionConstraint::Any => true,
            VersionConstraint::Exact(v) => v == version,
            VersionConstraint::Prefix(v) => v == version || v.is_prefix_of(version),
            VersionConstraint::Range { lo, hi } => {
                if let Some(lo) = lo {
                    if version < lo && !lo.is_prefix_of(version) {
                        return false;
                    }
                }
                if let Some(hi) = hi {
                    if version > hi && !hi.is_prefix_of(version) {
                        return false;
                    }
                }
                true
            }
            VersionConstraint::Union(parts) => parts.iter().any(|p| p.satisfies(version)),
        }
    }

    /// Versions mentioned by this constraint, used to seed synthetic
    /// possible versions for virtual packages.
    pub fn mentioned_versions(&self) -> Vec<Version> {
        match self {
            VersionConstraint::Any => Vec::new(),
            VersionConstraint::Exact(v) | VersionConstraint::Prefix(v) => vec![v.clone()],
            VersionConstraint::Range { lo, hi } => {
                lo.iter().chain(hi.iter()).cloned().collect()
            }
            VersionConstraint::Union(parts) => {
                parts.iter().flat_map(|p| p.mentioned_versions()).collect()
            }
        }
    }

    fn parse_segment(segment: &str, whole: &str) -> Result<VersionConstraint, ConstraintParseError> {
        if segment.is_empty() {
            return Err(ConstraintParseError::EmptySegment(whole.to_string()));
        }

        if let Some(rest) = segment.strip_prefix('=') {
            if rest.is_empty() {
                return Err(ConstraintParseError::EmptyExact(whole.to_string()));
            }
            return Ok(VersionConstraint::Exact(Version::new(rest)));
        }

        if let Some((lo, hi)) = segment.split_once(':') {
            let lo = (!lo.is_empty()).then(|| Version::new(lo));
            let hi = (!hi.is_empty()).then(|| Version::new(hi));
            if lo.is_none() && hi.is_none() {
                return Ok(VersionConstraint::Any);
            }
            return Ok(VersionConstraint::Range { lo, hi });
        }

        Ok(VersionConstraint::Prefix(Version::new(segment)))
    }
}

impl Default for VersionConstraint {
    fn default() -> Self {
        VersionConstraint::Any
    }
}

impl FromStr for VersionConstraint {
    type Err = ConstraintParseError;

    fn from_str(text: &str) -> Result<VersionConstraint, ConstraintParseError> {
        let text = text.trim();
        if text.is_empty() || text == ":" {
            return Ok(VersionConstraint::Any);
        }

        let segments: Vec<&str> = text.split(',').map(str::trim).collect();
        if segments.len() == 1 {
            return VersionConstraint::parse_segment(segments[0], text);
        }

        let parts = segments
            .into_iter()
            .map(|s| VersionConstraint::parse_segment(s, text))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(VersionConstraint::Union(parts))
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Any => write!(f, ":"),
            VersionConstraint::Exact(v) => write!(f, "={}", v),
            VersionConstraint::Prefix(v) => write!(f, "{}", v),
            VersionConstraint::Range { lo, hi } => {
                if let Some(lo) = lo {
                    write!(f, "{}", lo)?;
                }
                write!(f, ":")?;
                if let Some(hi) = hi {
                    write!(f, "{}", hi)?;
                }
                Ok(())
            }
            VersionConstraint::Union(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", part)?;
                }
                Ok(())
            }
        }
    }
}

impl Serialize for VersionConstraint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VersionConstraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<VersionConstraint, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(text: &str) -> Version {
        Version::new(text)
    }

    #[test]
    fn test_parse_any() {
        assert_eq!(":".parse::<VersionConstraint>().unwrap(), VersionConstraint::Any);
        assert_eq!("".parse::<VersionConstraint>().unwrap(), VersionConstraint::Any);
    }

    #[test]
    fn test_exact() {
        let c: VersionConstraint = "=1.2.3".parse().unwrap();
        assert!(c.is_exact());
        assert!(c.satisfies(&v("1.2.3")));
        assert!(!c.satisfies(&v("1.2.3.1")));
        assert!(!c.satisfies(&v("1.2")));
    }

    #[test]
    fn test_prefix() {
        let c: VersionConstraint = "1.2".parse().unwrap();
        assert!(c.satisfies(&v("1.2")));
        assert!(c.satisfies(&v("1.2.9")));
        assert!(!c.satisfies(&v("1.20")));
        assert!(!c.satisfies(&v("1.3")));
    }

    #[test]
    fn test_range() {
        let c: VersionConstraint = "1.2:1.4".parse().unwrap();
        assert!(c.satisfies(&v("1.2")));
        assert!(c.satisfies(&v("1.3.7")));
        assert!(c.satisfies(&v("1.4.5")), "upper bound matches by prefix");
        assert!(!c.satisfies(&v("1.5")));
        assert!(!c.satisfies(&v("1.1.9")));

        let open: VersionConstraint = "2.0:".parse().unwrap();
        assert!(open.satisfies(&v("3.1")));
        assert!(!open.satisfies(&v("1.9")));
    }

    #[test]
    fn test_union() {
        let c: VersionConstraint = "1.2,2.0:2.4".parse().unwrap();
        assert!(c.satisfies(&v("1.2.1")));
        assert!(c.satisfies(&v("2.3")));
        assert!(!c.satisfies(&v("1.4")));
    }

    #[test]
    fn test_display_round_trip() {
        for text in ["=1.2.3", "1.2", "1.2:1.4", "1.2:", ":1.4", ":", "1.2,2.0:2.4"] {
            let parsed: VersionConstraint = text.parse().unwrap();
            assert_eq!(parsed.to_string(), text);
            let reparsed: VersionConstraint = parsed.to_string().parse().unwrap();
            assert_eq!(parsed, reparsed);
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!("=".parse::<VersionConstraint>().is_err());
        assert!("1.2,,1.4".parse::<VersionConstraint>().is_err());
    }
}
