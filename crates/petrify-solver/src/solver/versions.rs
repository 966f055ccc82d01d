//! Version declarations and their provenance.

use std::fmt;

use petrify_version::Version;

/// Where a declared version came from. The ordering is the authority
/// ranking used when weighting version facts: package-declared versions
/// sort first, installed versions last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Provenance {
    PackageDef,
    External,
    PackagesConfig,
    Spec,
    DevSpec,
    Installed,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Provenance::PackageDef => "package_def",
            Provenance::External => "external",
            Provenance::PackagesConfig => "packages_config",
            Provenance::Spec => "spec",
            Provenance::DevSpec => "dev_spec",
            Provenance::Installed => "installed",
        };
        write!(f, "{}", name)
    }
}

/// A version declared somewhere, with its preference index within that
/// provenance and the provenance itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeclaredVersion {
    pub version: Version,
    /// Preference index within the origin; lower is preferred.
    pub idx: usize,
    pub origin: Provenance,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provenance_ranking() {
        assert!(Provenance::PackageDef < Provenance::External);
        assert!(Provenance::External < Provenance::PackagesConfig);
        assert!(Provenance::Spec < Provenance::Installed);
    }
}
