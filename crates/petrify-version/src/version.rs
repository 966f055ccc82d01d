use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One component of a version string.
///
/// Numeric components compare numerically, alphanumeric components compare
/// lexically, and a numeric component always sorts after an alphanumeric one
/// so that `1.2` is newer than `1.2rc1`-style prereleases split on the dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Component {
    Number(u64),
    Text(String),
}

impl Component {
    fn parse(token: &str) -> Component {
        match token.parse::<u64>() {
            Ok(n) => Component::Number(n),
            Err(_) => Component::Text(token.to_string()),
        }
    }
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Component::Number(a), Component::Number(b)) => a.cmp(b),
            (Component::Text(a), Component::Text(b)) => a.cmp(b),
            (Component::Number(_), Component::Text(_)) => Ordering::Greater,
            (Component::Text(_), Component::Number(_)) => Ordering::Less,
        }
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A concrete version value.
///
/// Parsing is infallible: any non-empty string is a valid version, split on
/// `.`, `-` and `_` separators. The original spelling is preserved for
/// display while comparisons use the parsed components.
#[derive(Debug, Clone)]
pub struct Version {
    components: Vec<Component>,
    original: String,
}

impl Version {
    pub fn new(text: &str) -> Version {
        let components = text
            .split(['.', '-', '_'])
            .filter(|t| !t.is_empty())
            .map(Component::parse)
            .collect();
        Version {
            components,
            original: text.to_string(),
        }
    }

    /// The original spelling of this version.
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// True if `self` is a component-wise prefix of `other`.
    ///
    /// `1.2` is a prefix of `1.2`, `1.2.0` and `1.2.9`, but not of `1.20`.
    pub fn is_prefix_of(&self, other: &Version) -> bool {
        if self.components.len() > other.components.len() {
            return false;
        }
        self.components
            .iter()
            .zip(other.components.iter())
            .all(|(a, b)| a == b)
    }

    /// Number of parsed components.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.components == other.components
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.components.hash(state);
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let common = self.components.len().min(other.components.len());
        for i in 0..common {
            match self.components[i].cmp(&other.components[i]) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        // A longer version with a common prefix is newer: 1.2 < 1.2.1
        self.components.len().cmp(&other.components.len())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}

impl From<&str> for Version {
    fn from(text: &str) -> Version {
        Version::new(text)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.original)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Version, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text.is_empty() {
            return Err(D::Error::custom("empty version string"));
        }
        Ok(Version::new(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        assert!(Version::new("1.0") < Version::new("2.0"));
        assert!(Version::new("1.2") < Version::new("1.10"));
        assert!(Version::new("1.2") < Version::new("1.2.1"));
        assert!(Version::new("1.2rc1") < Version::new("1.2"));
        assert_eq!(Version::new("1.2-0"), Version::new("1.2.0"));
    }

    #[test]
    fn test_version_prefix() {
        assert!(Version::new("1.2").is_prefix_of(&Version::new("1.2.3")));
        assert!(Version::new("1.2").is_prefix_of(&Version::new("1.2")));
        assert!(!Version::new("1.2").is_prefix_of(&Version::new("1.20")));
        assert!(!Version::new("1.2.3").is_prefix_of(&Version::new("1.2")));
    }

    #[test]
    fn test_version_display_preserves_spelling() {
        assert_eq!(Version::new("1.02.0").to_string(), "1.02.0");
    }
}
