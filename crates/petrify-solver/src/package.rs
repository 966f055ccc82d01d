//! Package metadata: the read-only collaborator the concretizer encodes
//! facts from.
//!
//! A [`PackageDef`] is the declarative description of one package: declared
//! versions, variants, conditional dependencies, conflicts, virtual
//! provisions, patches, splice rules and requirement groups. The
//! [`PackageRepository`] trait is the lookup interface; [`Repo`] is the
//! in-memory implementation used in tests and by embedders that assemble
//! metadata programmatically.

use indexmap::IndexMap;
use petrify_version::Version;

use crate::deptype::{self, DepFlag};
use crate::error::{ConcretizeError, Result};
use crate::spec::{Spec, VariantValue};

/// One declared version of a package. Declaration order is preference
/// order: earlier versions are preferred.
#[derive(Debug, Clone)]
pub struct VersionDecl {
    pub version: Version,
    pub deprecated: bool,
}

/// One possible value of a variant, optionally usable only when a
/// condition holds.
#[derive(Debug, Clone)]
pub struct VariantDefValue {
    pub value: String,
    pub when: Option<Spec>,
    /// The value is never allowed; it stays a possible value only so that
    /// using it produces a good conflict message instead of an unknown
    /// value error.
    pub disabled: bool,
}

impl VariantDefValue {
    pub fn new(value: &str) -> VariantDefValue {
        VariantDefValue {
            value: value.to_string(),
            when: None,
            disabled: false,
        }
    }

    pub fn when(mut self, condition: Spec) -> VariantDefValue {
        self.when = Some(condition);
        self
    }

    pub fn disabled(mut self) -> VariantDefValue {
        self.disabled = true;
        self
    }
}

/// A variant definition. A package may define the same variant name
/// several times under different `when` conditions; later definitions take
/// precedence where they overlap.
#[derive(Debug, Clone)]
pub struct VariantDef {
    pub name: String,
    pub when: Option<Spec>,
    pub default: VariantValue,
    pub values: Vec<VariantDefValue>,
    pub multi: bool,
    pub sticky: bool,
}

impl VariantDef {
    pub fn bool(name: &str, default: bool) -> VariantDef {
        VariantDef {
            name: name.to_string(),
            when: None,
            default: VariantValue::Bool(default),
            values: Vec::new(),
            multi: false,
            sticky: false,
        }
    }

    pub fn single(name: &str, default: &str, values: &[&str]) -> VariantDef {
        VariantDef {
            name: name.to_string(),
            when: None,
            default: VariantValue::Single(default.to_string()),
            values: values.iter().map(|v| VariantDefValue::new(v)).collect(),
            multi: false,
            sticky: false,
        }
    }

    pub fn multi(name: &str, defaults: &[&str], values: &[&str]) -> VariantDef {
        VariantDef {
            name: name.to_string(),
            when: None,
            default: VariantValue::Multi(defaults.iter().map(|v| v.to_string()).collect()),
            values: values.iter().map(|v| VariantDefValue::new(v)).collect(),
            multi: true,
            sticky: false,
        }
    }

    pub fn when(mut self, condition: Spec) -> VariantDef {
        self.when = Some(condition);
        self
    }
}

/// A patch declared by a package or on a dependency edge.
#[derive(Debug, Clone)]
pub struct PatchDef {
    pub when: Option<Spec>,
    pub sha256: String,
    /// Declaration index; the ordering of applied patches is load-bearing.
    pub index: usize,
}

/// A `depends_on` directive.
#[derive(Debug, Clone)]
pub struct DependencyDef {
    pub when: Option<Spec>,
    pub spec: Spec,
    pub depflag: DepFlag,
    /// Patches the dependent wants applied to this dependency.
    pub patches: Vec<PatchDef>,
}

/// A conflict directive: `conflict` cannot hold while `when` holds.
#[derive(Debug, Clone)]
pub struct ConflictDef {
    pub when: Option<Spec>,
    pub conflict: Spec,
    pub message: Option<String>,
}

/// A virtual-provision directive.
#[derive(Debug, Clone)]
pub struct ProvideDef {
    pub when: Option<Spec>,
    pub virtual_spec: Spec,
}

/// A splice rule: when this package matches `when`, an installed spec
/// matching `target` can replace it without rebuilding dependents.
#[derive(Debug, Clone)]
pub struct SpliceDef {
    pub when: Spec,
    pub target: Spec,
    /// Variants that must match between the two specs; `None` means no
    /// variant matching, an empty list matches all single-valued variants.
    pub match_variants: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementPolicy {
    OneOf,
    AnyOf,
}

impl RequirementPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequirementPolicy::OneOf => "one_of",
            RequirementPolicy::AnyOf => "any_of",
        }
    }
}

/// Where a requirement rule comes from; rules from the defaults group are
/// skipped when they cannot be emitted instead of erroring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementKind {
    Package,
    Virtual,
    Default,
}

/// A requirement group: one (or any) of `requirements` must hold,
/// optionally guarded by `condition`.
#[derive(Debug, Clone)]
pub struct RequirementRule {
    pub pkg_name: String,
    pub policy: RequirementPolicy,
    pub requirements: Vec<String>,
    pub condition: Option<Spec>,
    pub kind: RequirementKind,
    pub message: Option<String>,
}

/// Declarative description of one package.
#[derive(Debug, Clone)]
pub struct PackageDef {
    pub name: String,
    pub namespace: String,
    pub versions: Vec<VersionDecl>,
    pub variants: Vec<VariantDef>,
    pub dependencies: Vec<DependencyDef>,
    pub conflicts: Vec<ConflictDef>,
    pub provided: Vec<ProvideDef>,
    pub patches: Vec<PatchDef>,
    pub splices: Vec<SpliceDef>,
    pub requirements: Vec<RequirementRule>,
}

impl PackageDef {
    pub fn new(name: &str) -> PackageDef {
        PackageDef {
            name: name.to_string(),
            namespace: "builtin".to_string(),
            versions: Vec::new(),
            variants: Vec::new(),
            dependencies: Vec::new(),
            conflicts: Vec::new(),
            provided: Vec::new(),
            patches: Vec::new(),
            splices: Vec::new(),
            requirements: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: &str) -> PackageDef {
        self.versions.push(VersionDecl {
            version: Version::new(version),
            deprecated: false,
        });
        self
    }

    pub fn with_deprecated_version(mut self, version: &str) -> PackageDef {
        self.versions.push(VersionDecl {
            version: Version::new(version),
            deprecated: true,
        });
        self
    }

    pub fn with_variant(mut self, variant: VariantDef) -> PackageDef {
        self.variants.push(variant);
        self
    }

    /// Add an unconditional dependency; `spec` is parsed, `deptypes` is a
    /// comma list (empty means the default build,link).
    pub fn depends_on(self, spec: &str, deptypes: &str) -> PackageDef {
        self.depends_on_when(spec, deptypes, None)
    }

    pub fn depends_on_when(
        mut self,
        spec: &str,
        deptypes: &str,
        when: Option<&str>,
    ) -> PackageDef {
        let depflag = if deptypes.is_empty() {
            deptype::DEFAULT
        } else {
            deptype::string_to_flag(deptypes)
        };
        self.dependencies.push(DependencyDef {
            when: when.map(|w| Spec::parse(w).expect("valid when spec")),
            spec: Spec::parse(spec).expect("valid dependency spec"),
            depflag,
            patches: Vec::new(),
        });
        self
    }

    pub fn conflicts_with(mut self, conflict: &str, when: Option<&str>, msg: Option<&str>) -> PackageDef {
        self.conflicts.push(ConflictDef {
            when: when.map(|w| Spec::parse(w).expect("valid when spec")),
            conflict: Spec::parse(conflict).expect("valid conflict spec"),
            message: msg.map(str::to_string),
        });
        self
    }

    pub fn provides(mut self, virtual_spec: &str, when: Option<&str>) -> PackageDef {
        self.provided.push(ProvideDef {
            when: when.map(|w| Spec::parse(w).expect("valid when spec")),
            virtual_spec: Spec::parse(virtual_spec).expect("valid virtual spec"),
        });
        self
    }

    pub fn with_patch(mut self, sha256: &str, when: Option<&str>) -> PackageDef {
        let index = self.patches.len();
        self.patches.push(PatchDef {
            when: when.map(|w| Spec::parse(w).expect("valid when spec")),
            sha256: sha256.to_string(),
            index,
        });
        self
    }

    pub fn with_requirement(mut self, rule: RequirementRule) -> PackageDef {
        self.requirements.push(rule);
        self
    }

    /// Virtual names this package can provide under some condition.
    pub fn provided_virtual_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .provided
            .iter()
            .map(|p| p.virtual_spec.name.as_str())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Variant definitions for a name, in declaration order.
    pub fn variant_definitions(&self, name: &str) -> Vec<&VariantDef> {
        self.variants.iter().filter(|v| v.name == name).collect()
    }

    pub fn has_variant(&self, name: &str) -> bool {
        self.variants.iter().any(|v| v.name == name)
    }
}

/// Read-only queries over package metadata.
pub trait PackageRepository {
    fn get(&self, name: &str) -> Result<&PackageDef>;

    fn exists(&self, name: &str) -> bool;

    /// True if the name is a virtual capability rather than a package.
    fn is_virtual(&self, name: &str) -> bool;

    /// Packages that can provide a virtual under some condition.
    fn providers_of(&self, virtual_name: &str) -> Vec<&PackageDef>;

    fn package_names(&self) -> Vec<&str>;
}

/// In-memory package repository.
#[derive(Debug, Default)]
pub struct Repo {
    packages: IndexMap<String, PackageDef>,
}

impl Repo {
    pub fn new() -> Repo {
        Repo::default()
    }

    pub fn add(&mut self, package: PackageDef) -> &mut Repo {
        self.packages.insert(package.name.clone(), package);
        self
    }

    pub fn with(mut self, package: PackageDef) -> Repo {
        self.add(package);
        self
    }
}

impl PackageRepository for Repo {
    fn get(&self, name: &str) -> Result<&PackageDef> {
        self.packages
            .get(name)
            .ok_or_else(|| ConcretizeError::PackageNotFound {
                name: name.to_string(),
            })
    }

    fn exists(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    fn is_virtual(&self, name: &str) -> bool {
        !self.packages.contains_key(name)
            && self
                .packages
                .values()
                .any(|p| p.provided_virtual_names().contains(&name))
    }

    fn providers_of(&self, virtual_name: &str) -> Vec<&PackageDef> {
        self.packages
            .values()
            .filter(|p| p.provided_virtual_names().contains(&virtual_name))
            .collect()
    }

    fn package_names(&self) -> Vec<&str> {
        self.packages.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_builder() {
        let pkg = PackageDef::new("curl")
            .with_version("8.5")
            .with_deprecated_version("7.0")
            .with_variant(VariantDef::bool("ssl", true))
            .depends_on("zlib@1.2:", "build,link")
            .depends_on_when("openssl", "", Some("+ssl"));

        assert_eq!(pkg.versions.len(), 2);
        assert!(pkg.versions[1].deprecated);
        assert_eq!(pkg.dependencies.len(), 2);
        assert!(pkg.dependencies[1].when.is_some());
    }

    #[test]
    fn test_repo_virtuals() {
        let repo = Repo::new()
            .with(PackageDef::new("openssl").with_version("3.0").provides("ssl", None))
            .with(PackageDef::new("libressl").with_version("3.8").provides("ssl", None));

        assert!(repo.is_virtual("ssl"));
        assert!(!repo.is_virtual("openssl"));
        assert!(!repo.is_virtual("unknown"));
        assert_eq!(repo.providers_of("ssl").len(), 2);
    }

    #[test]
    fn test_repo_lookup_error() {
        let repo = Repo::new();
        assert!(matches!(
            repo.get("missing"),
            Err(ConcretizeError::PackageNotFound { .. })
        ));
    }
}
