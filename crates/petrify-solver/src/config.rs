//! Concretizer policy configuration.
//!
//! Configuration arrives as already-constructed values (deserializable with
//! serde for embedders that load it from JSON); there is no ambient global
//! configuration anywhere in the crate.

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Concretization-cache limits. Either limit can be disabled with a value
/// of zero or below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enable: bool,
    /// Root directory of the cache. Required when `enable` is true.
    pub root: Option<PathBuf>,
    pub entry_limit: i64,
    pub size_limit: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enable: false,
            root: None,
            entry_limit: 1000,
            size_limit: 300_000_000,
        }
    }
}

/// An explicit splice directive: replace subtrees matching `target` with
/// the hash-pinned `replacement` spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplicitSplice {
    pub target: String,
    pub replacement: String,
    #[serde(default)]
    pub transitive: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpliceConfig {
    /// Load the automatic splicing rule module into the solve.
    pub automatic: bool,
    pub explicit: Vec<ExplicitSplice>,
}

/// Filters applied to external/reusable specs. Empty include list means
/// include everything not excluded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReuseConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// One externally-installed instance of a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalEntry {
    pub spec: String,
    pub prefix: String,
}

/// A requirement group sourced from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigRequirement {
    /// `one_of` or `any_of`.
    pub policy: String,
    pub specs: Vec<String>,
    pub when: Option<String>,
    pub message: Option<String>,
}

impl Default for ConfigRequirement {
    fn default() -> Self {
        ConfigRequirement {
            policy: "one_of".to_string(),
            specs: Vec::new(),
            when: None,
            message: None,
        }
    }
}

/// Per-package policy from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagePolicy {
    pub buildable: bool,
    pub externals: Vec<ExternalEntry>,
    pub require: Vec<ConfigRequirement>,
    /// Preferred versions, most preferred first. Each must match a version
    /// known from the package or an external.
    pub version: Vec<String>,
    /// Preferred variant settings, as spec fragments (e.g. `+shared`).
    pub variants: Vec<String>,
}

impl Default for PackagePolicy {
    fn default() -> Self {
        PackagePolicy {
            buildable: true,
            externals: Vec::new(),
            require: Vec::new(),
            version: Vec::new(),
            variants: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagesConfig {
    /// Provider preference per virtual name, most preferred first.
    pub providers: IndexMap<String, Vec<String>>,
    /// Requirement groups that apply to every package.
    pub all_require: Vec<ConfigRequirement>,
    pub packages: IndexMap<String, PackagePolicy>,
}

/// Top-level concretizer policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcretizerConfig {
    /// Wall-clock budget for the solve, in seconds. Zero means unlimited.
    pub timeout: u64,
    /// On timeout, fail hard instead of accepting the best model found.
    pub error_on_timeout: bool,
    pub reuse: ReuseConfig,
    /// `os_compatible[new]` lists older OSs whose binaries still run.
    pub os_compatible: IndexMap<String, Vec<String>>,
    /// Check libc compatibility instead of plain OS equality.
    pub check_libc: bool,
    pub splice: SpliceConfig,
    pub cache: CacheConfig,
    pub packages: PackagesConfig,
}

impl Default for ConcretizerConfig {
    fn default() -> Self {
        ConcretizerConfig {
            timeout: 0,
            error_on_timeout: true,
            reuse: ReuseConfig::default(),
            os_compatible: IndexMap::new(),
            check_libc: false,
            splice: SpliceConfig::default(),
            cache: CacheConfig::default(),
            packages: PackagesConfig::default(),
        }
    }
}

impl ConcretizerConfig {
    pub fn package_policy(&self, name: &str) -> Option<&PackagePolicy> {
        self.packages.packages.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConcretizerConfig::default();
        assert_eq!(config.timeout, 0);
        assert!(config.error_on_timeout);
        assert!(!config.cache.enable);
        assert_eq!(config.cache.entry_limit, 1000);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ConcretizerConfig = serde_json::from_str(
            r#"{ "timeout": 30, "cache": { "enable": true, "entry_limit": 10 } }"#,
        )
        .unwrap();
        assert_eq!(config.timeout, 30);
        assert!(config.cache.enable);
        assert_eq!(config.cache.entry_limit, 10);
        assert_eq!(config.cache.size_limit, 300_000_000);
    }
}
