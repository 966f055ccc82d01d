//! End-to-end concretization tests.
//!
//! These drive the whole pipeline: constraint encoding, the bundled
//! backend, answer interpretation and the result API.

use std::sync::Arc;

use super::*;
use crate::config::{CacheConfig, ConcretizerConfig, ExternalEntry, PackagePolicy};
use crate::error::ConcretizeError;
use crate::package::{PackageDef, Repo, VariantDef};
use crate::platform::{Compiler, PlatformInfo};
use crate::spec::Spec;

fn solve(repo: &Repo, specs: &[&str]) -> crate::error::Result<SolveResult> {
    let platform = PlatformInfo::default();
    let config = ConcretizerConfig::default();
    let solver = Solver::new(repo, &platform, &[], &config);
    let specs: Vec<Spec> = specs.iter().map(|s| Spec::parse(s).unwrap()).collect();
    solver.solve(&specs)
}

// ============================================================================
// Basic resolution
// ============================================================================

#[test]
fn test_solve_single_package() {
    let repo = Repo::new().with(PackageDef::new("zlib").with_version("1.3").with_version("1.2"));
    let result = solve(&repo, &["zlib"]).unwrap();
    assert_eq!(result.satisfiable, Some(true));

    let specs = result.specs();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].name, "zlib");
    // first declared version is preferred
    assert_eq!(specs[0].version().unwrap().to_string(), "1.3");
    assert!(specs[0].concrete);
}

#[test]
fn test_solve_with_dependency_chain() {
    let repo = Repo::new()
        .with(PackageDef::new("app").with_version("1.0").depends_on("libfoo", ""))
        .with(PackageDef::new("libfoo").with_version("2.1").depends_on("zlib@1.2:", "link"))
        .with(PackageDef::new("zlib").with_version("1.3"));
    let result = solve(&repo, &["app"]).unwrap();

    let app = &result.specs()[0];
    let names: Vec<&str> = app.traverse().iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["app", "libfoo", "zlib"]);
}

#[test]
fn test_deprecated_version_is_avoided() {
    // b has two declared versions: 1.0 (deprecated) and 0.9; with
    // deprecated versions not allowed, the solve must select b@0.9
    let repo = Repo::new()
        .with(PackageDef::new("a").with_version("1.0").depends_on("b", ""))
        .with(
            PackageDef::new("b")
                .with_deprecated_version("1.0")
                .with_version("0.9"),
        );
    let result = solve(&repo, &["a"]).unwrap();
    let a = &result.specs()[0];
    let b = a.traverse().into_iter().find(|s| s.name == "b").unwrap();
    assert_eq!(b.version().unwrap().to_string(), "0.9");
}

#[test]
fn test_deprecated_version_allowed_when_requested() {
    let repo = Repo::new().with(
        PackageDef::new("b")
            .with_deprecated_version("1.0")
            .with_version("0.9"),
    );
    let platform = PlatformInfo::default();
    let config = ConcretizerConfig::default();
    let solver = Solver::new(&repo, &platform, &[], &config);
    let options = SolveOptions {
        allow_deprecated: true,
        ..SolveOptions::default()
    };
    let result = solver
        .solve_with_options(&[Spec::parse("b@=1.0").unwrap()], &options)
        .unwrap();
    assert_eq!(result.specs()[0].version().unwrap().to_string(), "1.0");
}

// ============================================================================
// Structural sharing
// ============================================================================

#[test]
fn test_shared_dependency_is_one_object() {
    // x and z both transitively depend on y: the graph must contain
    // exactly one y node, referenced by both
    let repo = Repo::new()
        .with(PackageDef::new("x").with_version("1.0").depends_on("y", ""))
        .with(PackageDef::new("z").with_version("1.0").depends_on("y", ""))
        .with(PackageDef::new("y").with_version("2.0").with_version("1.0"));
    let result = solve(&repo, &["x ^y@=2.0", "z"]).unwrap();

    let by_input = result.specs_by_input();
    let x = &by_input["x ^y@=2.0"];
    let z = &by_input["z"];

    let y_from_x = x.edges.iter().find(|e| e.spec.name == "y").unwrap();
    let y_from_z = z.edges.iter().find(|e| e.spec.name == "y").unwrap();
    assert_eq!(y_from_x.spec.version().unwrap().to_string(), "2.0");
    assert!(
        Arc::ptr_eq(&y_from_x.spec, &y_from_z.spec),
        "structurally identical subgraphs must be reference-shared"
    );
}

// ============================================================================
// Unsatisfiable requests
// ============================================================================

#[test]
fn test_self_conflicting_input_reports_core() {
    let repo = Repo::new().with(
        PackageDef::new("a")
            .with_version("1.0")
            .with_variant(VariantDef::bool("foo", false)),
    );
    let err = solve(&repo, &["a +foo ~foo"]).unwrap_err();
    match err {
        ConcretizeError::Unsatisfiable(msg) => {
            assert!(msg.contains("unsatisfiable"), "{msg}");
            // the minimized core is non-empty and names the variant facts
            assert!(msg.contains("variant_set"), "{msg}");
        }
        other => panic!("expected an unsatisfiable error, got {other:?}"),
    }
}

#[test]
fn test_unknown_package_is_a_user_error() {
    let repo = Repo::new().with(PackageDef::new("a").with_version("1.0"));
    let err = solve(&repo, &["ghost"]).unwrap_err();
    assert!(matches!(err, ConcretizeError::Unsatisfiable(_)));
    assert!(err.to_string().contains("does not exist"));
}

#[test]
fn test_impossible_version_request() {
    // a range that no declared version falls into (a concrete version
    // would be declared ad-hoc from the request instead)
    let repo = Repo::new().with(PackageDef::new("a").with_version("1.0"));
    let err = solve(&repo, &["a@9:"]).unwrap_err();
    assert!(matches!(err, ConcretizeError::Unsatisfiable(_)));
}

// ============================================================================
// Variants and conflicts
// ============================================================================

#[test]
fn test_variant_defaults_and_explicit_values() {
    let repo = Repo::new().with(
        PackageDef::new("curl")
            .with_version("8.5")
            .with_variant(VariantDef::bool("ssl", true))
            .with_variant(VariantDef::single("opt", "high", &["low", "high"])),
    );
    let result = solve(&repo, &["curl opt=low"]).unwrap();
    let curl = &result.specs()[0];
    assert_eq!(
        curl.variants.get("ssl").unwrap().value,
        crate::spec::VariantValue::Bool(true)
    );
    assert_eq!(
        curl.variants.get("opt").unwrap().value.value_strings(),
        vec!["low".to_string()]
    );
}

#[test]
fn test_conditional_dependency_follows_variant() {
    let repo = Repo::new()
        .with(
            PackageDef::new("curl")
                .with_version("8.5")
                .with_variant(VariantDef::bool("ssl", false))
                .depends_on_when("openssl", "", Some("+ssl")),
        )
        .with(PackageDef::new("openssl").with_version("3.0"));

    let without = solve(&repo, &["curl"]).unwrap();
    assert_eq!(without.specs()[0].edges.len(), 0);

    let with = solve(&repo, &["curl +ssl"]).unwrap();
    let with_specs = with.specs();
    let names: Vec<&str> = with_specs[0]
        .traverse()
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    assert!(names.contains(&"openssl"));
}

#[test]
fn test_declared_conflict_aborts_with_diagnostics() {
    let repo = Repo::new().with(
        PackageDef::new("a")
            .with_version("1.0")
            .conflicts_with("a@1.0", None, Some("version 1.0 is known broken")),
    );
    let err = solve(&repo, &["a@=1.0"]).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("failed to concretize"), "{msg}");
    assert!(msg.contains("version 1.0 is known broken"), "{msg}");
}

// ============================================================================
// Virtuals
// ============================================================================

#[test]
fn test_virtual_provider_preference_from_config() {
    let repo = Repo::new()
        .with(PackageDef::new("app").with_version("1.0").depends_on("ssl", ""))
        .with(PackageDef::new("openssl").with_version("3.0").provides("ssl@3.0", None))
        .with(PackageDef::new("libressl").with_version("3.8").provides("ssl@3.8", None));

    let platform = PlatformInfo::default();
    let mut config = ConcretizerConfig::default();
    config
        .packages
        .providers
        .insert("ssl".to_string(), vec!["openssl".to_string()]);
    let solver = Solver::new(&repo, &platform, &[], &config);
    let result = solver.solve(&[Spec::parse("app").unwrap()]).unwrap();

    let app = &result.specs()[0];
    let edge = app.edges.iter().find(|e| !e.virtuals.is_empty()).unwrap();
    assert_eq!(edge.spec.name, "openssl");
    assert_eq!(edge.virtuals, vec!["ssl".to_string()]);
}

#[test]
fn test_virtual_root_request() {
    let repo = Repo::new()
        .with(PackageDef::new("openssl").with_version("3.0").provides("ssl@3.0", None));
    let result = solve(&repo, &["ssl"]).unwrap();
    let specs = result.specs();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].name, "openssl");
}

// ============================================================================
// Externals
// ============================================================================

#[test]
fn test_nonbuildable_package_uses_external() {
    let repo = Repo::new()
        .with(PackageDef::new("app").with_version("1.0").depends_on("cmake", "build"))
        .with(PackageDef::new("cmake").with_version("3.27"));

    let platform = PlatformInfo::default();
    let mut config = ConcretizerConfig::default();
    config.packages.packages.insert(
        "cmake".to_string(),
        PackagePolicy {
            buildable: false,
            externals: vec![ExternalEntry {
                spec: "cmake@=3.27".to_string(),
                prefix: "/usr".to_string(),
            }],
            ..PackagePolicy::default()
        },
    );
    let solver = Solver::new(&repo, &platform, &[], &config);
    let result = solver.solve(&[Spec::parse("app").unwrap()]).unwrap();

    let app = &result.specs()[0];
    let cmake = app.traverse().into_iter().find(|s| s.name == "cmake").unwrap();
    assert_eq!(cmake.external_path.as_deref(), Some("/usr"));
    assert_eq!(cmake.version().unwrap().to_string(), "3.27");
}

// ============================================================================
// Compiler runtime injection
// ============================================================================

#[test]
fn test_compiler_injects_language_runtime() {
    let repo = Repo::new()
        .with(PackageDef::new("app").with_version("1.0"))
        .with(PackageDef::new("gcc").with_version("13.2"))
        .with(PackageDef::new("gcc-runtime").with_version("13.2"));

    let platform = PlatformInfo::default();
    let config = ConcretizerConfig::default();
    let compilers = vec![Compiler::new("gcc@=13.2").with_runtime("gcc-runtime@=13.2")];
    let solver = Solver::new(&repo, &platform, &compilers, &config);
    let result = solver.solve(&[Spec::parse("app %gcc@13").unwrap()]).unwrap();

    let app = &result.specs()[0];
    let names: Vec<&str> = app.traverse().iter().map(|s| s.name.as_str()).collect();
    assert!(names.contains(&"gcc"), "{names:?}");
    assert!(names.contains(&"gcc-runtime"), "{names:?}");
    let runtime = app
        .traverse()
        .into_iter()
        .find(|s| s.name == "gcc-runtime")
        .unwrap();
    assert_eq!(runtime.version().unwrap().to_string(), "13.2");
}

#[test]
fn test_broken_compiler_is_rejected() {
    let repo = Repo::new()
        .with(PackageDef::new("app").with_version("1.0"))
        .with(PackageDef::new("gcc").with_version("13.2"))
        .with(PackageDef::new("gcc-runtime").with_version("13.2"));

    let platform = PlatformInfo::default();
    let config = ConcretizerConfig::default();
    let mut broken = Compiler::new("gcc@=13.2").with_runtime("gcc-runtime@=13.2");
    broken.broken = true;
    let compilers = vec![broken];
    let solver = Solver::new(&repo, &platform, &compilers, &config);
    let result = solver.solve(&[Spec::parse("app").unwrap()]).unwrap();

    // no runtime injection from a rejected compiler
    let app = &result.specs()[0];
    assert_eq!(app.traverse().len(), 1);
}

// ============================================================================
// Compiler flags
// ============================================================================

#[test]
fn test_literal_flags_preserve_group_order() {
    let repo = Repo::new().with(PackageDef::new("a").with_version("1.0"));
    let result = solve(&repo, &["a cflags=\"-O2 -g\""]).unwrap();
    let a = &result.specs()[0];
    let flags: Vec<&str> = a
        .compiler_flags
        .get("cflags")
        .iter()
        .map(|f| f.flag.as_str())
        .collect();
    assert_eq!(flags, vec!["-O2", "-g"]);
}

// ============================================================================
// Result round trip
// ============================================================================

#[test]
fn test_result_json_round_trip() {
    let repo = Repo::new()
        .with(PackageDef::new("a").with_version("1.0").depends_on("b", ""))
        .with(PackageDef::new("b").with_version("2.0"));
    let result = solve(&repo, &["a"]).unwrap();
    let restored = SolveResult::from_json(&result.to_json()).unwrap();

    assert_eq!(restored.satisfiable, result.satisfiable);
    assert_eq!(restored.criteria, result.criteria);

    let original: Vec<String> = result
        .specs()
        .iter()
        .map(|s| s.dag_hash().unwrap().to_string())
        .collect();
    let restored_specs: Vec<String> = restored
        .specs()
        .iter()
        .map(|s| s.dag_hash().unwrap().to_string())
        .collect();
    assert_eq!(original, restored_specs);
}

// ============================================================================
// Concretization cache
// ============================================================================

#[test]
fn test_identical_problem_hits_cache() {
    let repo = Repo::new()
        .with(PackageDef::new("a").with_version("1.0").depends_on("b", ""))
        .with(PackageDef::new("b").with_version("2.0"));
    let platform = PlatformInfo::default();
    let cache_dir = tempfile::tempdir().unwrap();
    let config = ConcretizerConfig {
        cache: CacheConfig {
            enable: true,
            root: Some(cache_dir.path().to_path_buf()),
            ..CacheConfig::default()
        },
        ..ConcretizerConfig::default()
    };
    let solver = Solver::new(&repo, &platform, &[], &config);
    let specs = vec![Spec::parse("a").unwrap()];

    let first = solver.solve(&specs).unwrap();
    // one entry landed in the fan-out tree
    let entries: Vec<_> = std::fs::read_dir(cache_dir.path())
        .unwrap()
        .flatten()
        .filter(|e| e.path().is_dir())
        .collect();
    assert_eq!(entries.len(), 1);

    // byte-identical program: the second call must be served from the
    // cache and produce the same concrete specs
    let second = solver.solve(&specs).unwrap();
    assert_eq!(second.satisfiable, Some(true));
    let first_hashes: Vec<String> = first
        .specs()
        .iter()
        .map(|s| s.dag_hash().unwrap().to_string())
        .collect();
    let second_hashes: Vec<String> = second
        .specs()
        .iter()
        .map(|s| s.dag_hash().unwrap().to_string())
        .collect();
    assert_eq!(first_hashes, second_hashes);
}

// ============================================================================
// Requirements
// ============================================================================

#[test]
fn test_config_requirement_pins_version() {
    let repo = Repo::new().with(
        PackageDef::new("a")
            .with_version("2.0")
            .with_version("1.0"),
    );
    let platform = PlatformInfo::default();
    let mut config = ConcretizerConfig::default();
    config.packages.packages.insert(
        "a".to_string(),
        PackagePolicy {
            require: vec![crate::config::ConfigRequirement {
                policy: "one_of".to_string(),
                specs: vec!["@=1.0".to_string()],
                when: None,
                message: None,
            }],
            ..PackagePolicy::default()
        },
    );
    let solver = Solver::new(&repo, &platform, &[], &config);
    let result = solver.solve(&[Spec::parse("a").unwrap()]).unwrap();
    assert_eq!(result.specs()[0].version().unwrap().to_string(), "1.0");
}

// ============================================================================
// Reuse
// ============================================================================

#[test]
fn test_reusable_spec_is_preferred() {
    let repo = Repo::new().with(PackageDef::new("zlib").with_version("1.3").with_version("1.2"));
    let platform = PlatformInfo::default();
    let config = ConcretizerConfig::default();

    // an installed zlib at the non-preferred version
    let mut installed = Spec::new("zlib");
    installed.versions =
        petrify_version::VersionConstraint::exact(petrify_version::Version::new("1.2"));
    installed.arch.platform = Some(platform.name.clone());
    installed.arch.os = Some(platform.default_os.clone());
    installed.arch.target = Some(platform.default_target.clone());
    let installed = installed.finalize().unwrap();

    let solver = Solver::new(&repo, &platform, &[], &config);
    let options = SolveOptions {
        reuse: vec![installed.clone()],
        ..SolveOptions::default()
    };
    let result = solver
        .solve_with_options(&[Spec::parse("zlib@1.2").unwrap()], &options)
        .unwrap();

    let zlib = &result.specs()[0];
    assert_eq!(zlib.version().unwrap().to_string(), "1.2");
    assert_eq!(zlib.dag_hash(), installed.dag_hash());
}

// ============================================================================
// Rounds
// ============================================================================

#[test]
fn test_solve_in_rounds_handles_conflicting_inputs() {
    let repo = Repo::new().with(
        PackageDef::new("y").with_version("2.0").with_version("1.0"),
    );
    let platform = PlatformInfo::default();
    let config = ConcretizerConfig::default();
    let solver = Solver::new(&repo, &platform, &[], &config);

    let specs = vec![
        Spec::parse("y@=1.0").unwrap(),
        Spec::parse("y@=2.0").unwrap(),
    ];
    let rounds = solver.solve_in_rounds(&specs, &SolveOptions::default()).unwrap();

    // two mutually exclusive requests need two rounds
    assert_eq!(rounds.len(), 2);
    for round in &rounds {
        assert_eq!(round.satisfiable, Some(true));
    }
    let mut versions: Vec<String> = rounds
        .iter()
        .map(|r| r.specs()[0].version().unwrap().to_string())
        .collect();
    versions.sort();
    assert_eq!(versions, vec!["1.0".to_string(), "2.0".to_string()]);
}
