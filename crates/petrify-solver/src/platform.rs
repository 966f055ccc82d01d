//! Platform and compiler collaborators.
//!
//! These are read-only descriptions injected by the embedder; the
//! concretizer never detects anything itself.

use indexmap::IndexMap;

use crate::spec::Spec;

/// A known microarchitecture target and its compatibility ancestry.
#[derive(Debug, Clone)]
pub struct TargetDef {
    pub name: String,
    pub family: String,
    /// Older targets whose code can run on this one, nearest first.
    pub ancestors: Vec<String>,
}

impl TargetDef {
    pub fn new(name: &str, family: &str, ancestors: &[&str]) -> TargetDef {
        TargetDef {
            name: name.to_string(),
            family: family.to_string(),
            ancestors: ancestors.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Host platform description: default OS/target plus the known choices.
#[derive(Debug, Clone)]
pub struct PlatformInfo {
    pub name: String,
    pub default_os: String,
    pub default_target: String,
    /// Operating systems that can be built for, preference order.
    pub operating_systems: Vec<String>,
    pub targets: Vec<TargetDef>,
}

impl PlatformInfo {
    /// A generic single-OS, single-target platform, enough for tests and
    /// for embedders that do not care about microarchitectures.
    pub fn generic(name: &str, os: &str, target: &str) -> PlatformInfo {
        PlatformInfo {
            name: name.to_string(),
            default_os: os.to_string(),
            default_target: target.to_string(),
            operating_systems: vec![os.to_string()],
            targets: vec![TargetDef::new(target, target, &[])],
        }
    }
}

impl Default for PlatformInfo {
    fn default() -> Self {
        PlatformInfo::generic("linux", "generic-os", "x86_64")
    }
}

/// A candidate compiler, with the auxiliary dependencies it injects.
#[derive(Debug, Clone)]
pub struct Compiler {
    /// The compiler package spec, e.g. `gcc@=13.2`.
    pub spec: Spec,
    pub languages: Vec<String>,
    /// Targets this compiler can generate code for; empty means all.
    pub supported_targets: Vec<String>,
    /// Default flags injected per flag type (flag group text).
    pub default_flags: IndexMap<String, String>,
    /// Language runtime package injected when this compiler is used,
    /// e.g. `gcc-runtime@=13.2`.
    pub runtime: Option<Spec>,
    /// The C library this compiler links against, e.g. `glibc@=2.38`.
    pub libc: Option<Spec>,
    /// True if the compiler is known not to run; rejected up front.
    pub broken: bool,
}

impl Compiler {
    pub fn new(spec: &str) -> Compiler {
        Compiler {
            spec: Spec::parse(spec).expect("valid compiler spec"),
            languages: vec!["c".to_string(), "cxx".to_string()],
            supported_targets: Vec::new(),
            default_flags: IndexMap::new(),
            runtime: None,
            libc: None,
            broken: false,
        }
    }

    pub fn with_runtime(mut self, spec: &str) -> Compiler {
        self.runtime = Some(Spec::parse(spec).expect("valid runtime spec"));
        self
    }

    pub fn with_libc(mut self, spec: &str) -> Compiler {
        self.libc = Some(Spec::parse(spec).expect("valid libc spec"));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_platform() {
        let platform = PlatformInfo::default();
        assert_eq!(platform.default_os, "generic-os");
        assert_eq!(platform.targets.len(), 1);
    }

    #[test]
    fn test_compiler_injections() {
        let compiler = Compiler::new("gcc@=13.2")
            .with_runtime("gcc-runtime@=13.2")
            .with_libc("glibc@=2.38");
        assert_eq!(compiler.spec.name, "gcc");
        assert_eq!(compiler.runtime.as_ref().unwrap().name, "gcc-runtime");
        assert_eq!(compiler.libc.as_ref().unwrap().name, "glibc");
    }
}
