//! The constraint encoder.
//!
//! [`SolverSetup`] walks possible packages, versions, variants, virtuals,
//! externals, requirements, compilers/runtimes and the input specs
//! themselves, and emits the ground fact set the solver backend grounds.
//! Conditions are deduplicated through the trigger/effect caches and
//! flushed once per package.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use petrify_version::{Version, VersionConstraint};

use crate::config::ConcretizerConfig;
use crate::deptype;
use crate::error::{ConcretizeError, Result};
use crate::package::{
    PackageRepository, RequirementKind, RequirementPolicy, RequirementRule, VariantDef,
};
use crate::platform::{Compiler, PlatformInfo};
use crate::solver::condition::{
    ConditionCache, ConditionContext, ConditionIdContext, ConstraintOrigin, FactTransform,
};
use crate::solver::fact::{atoms, Fact, ProgramBuilder};
use crate::solver::versions::{DeclaredVersion, Provenance};
use crate::spec::{ConcreteSpecsByHash, Spec, VariantValue, FLAG_TYPES};

/// Which packages get their test dependencies included in the solve.
#[derive(Debug, Clone, Default)]
pub enum Tests {
    #[default]
    None,
    All,
    Packages(Vec<String>),
}

impl Tests {
    fn enabled_for(&self, pkg: &str) -> bool {
        match self {
            Tests::None => false,
            Tests::All => true,
            Tests::Packages(pkgs) => pkgs.iter().any(|p| p == pkg),
        }
    }
}

/// The generated problem instance: rendered text (hashed for the cache)
/// plus the typed facts the backend grounds.
#[derive(Debug, Clone)]
pub struct Program {
    pub text: String,
    pub facts: Vec<Fact>,
}

/// Options for one `spec_clauses` call.
#[derive(Debug, Clone, Copy)]
struct ClauseOptions {
    /// Generate body-form clauses (final values) instead of head-form
    /// clauses (setters).
    body: bool,
    transitive: bool,
    /// Descend into hashes of concrete specs instead of stopping at them.
    expand_hashes: bool,
    /// Include pure build dependencies of concrete specs.
    concrete_build_deps: bool,
    /// Emit full dependency clauses for runtime libraries that are
    /// otherwise re-solved.
    include_runtimes: bool,
}

impl Default for ClauseOptions {
    fn default() -> Self {
        ClauseOptions {
            body: false,
            transitive: true,
            expand_hashes: false,
            concrete_build_deps: false,
            include_runtimes: false,
        }
    }
}

enum WhichCache {
    Trigger,
    Effect,
}

pub struct SolverSetup<'a> {
    pub(crate) repo: &'a dyn PackageRepository,
    platform: &'a PlatformInfo,
    compilers: &'a [Compiler],
    pub(crate) config: &'a ConcretizerConfig,

    pub(crate) gen: ProgramBuilder,
    id_counter: u64,
    trigger_cache: ConditionCache,
    effect_cache: ConditionCache,

    declared_versions: IndexMap<String, Vec<DeclaredVersion>>,
    possible_versions: IndexMap<String, IndexSet<Version>>,
    deprecated_versions: IndexMap<String, IndexSet<Version>>,
    /// Recorded version constraints, per package, keyed by display form.
    version_constraints: IndexMap<String, IndexMap<String, VersionConstraint>>,

    pub(crate) pkgs: IndexSet<String>,
    possible_virtuals: IndexSet<String>,
    possible_oses: IndexSet<String>,

    /// (pkg, variant name, value) seen on specs; declared as possible
    /// values at the end of setup.
    variant_values_from_specs: IndexSet<(String, String, String)>,
    /// Variant definition ids per (pkg, variant name), declaration order.
    variant_def_ids: IndexMap<(String, String), Vec<u64>>,

    rejected_compilers: Vec<Spec>,
    /// Names of packages injected by compilers (runtimes and libcs); these
    /// are re-solved even on concrete reused specs.
    runtime_pkgs: IndexSet<String>,

    pub(crate) reusable_and_possible: ConcreteSpecsByHash,

    pub(crate) tests: Tests,
    pub(crate) concretize_everything: bool,
    enable_splicing: bool,
}

impl<'a> SolverSetup<'a> {
    pub fn new(
        repo: &'a dyn PackageRepository,
        platform: &'a PlatformInfo,
        compilers: &'a [Compiler],
        config: &'a ConcretizerConfig,
    ) -> SolverSetup<'a> {
        let gen = match std::env::var("PETRIFY_SOLVER_RANDOMIZATION") {
            Ok(seed) => ProgramBuilder::randomized(seed.parse().unwrap_or(1)),
            Err(_) => ProgramBuilder::new(),
        };
        SolverSetup {
            repo,
            platform,
            compilers,
            config,
            gen,
            id_counter: 0,
            trigger_cache: ConditionCache::new(),
            effect_cache: ConditionCache::new(),
            declared_versions: IndexMap::new(),
            possible_versions: IndexMap::new(),
            deprecated_versions: IndexMap::new(),
            version_constraints: IndexMap::new(),
            pkgs: IndexSet::new(),
            possible_virtuals: IndexSet::new(),
            possible_oses: IndexSet::new(),
            variant_values_from_specs: IndexSet::new(),
            variant_def_ids: IndexMap::new(),
            rejected_compilers: Vec::new(),
            runtime_pkgs: IndexSet::new(),
            reusable_and_possible: ConcreteSpecsByHash::new(),
            tests: Tests::None,
            concretize_everything: true,
            enable_splicing: config.splice.automatic,
        }
    }

    pub fn with_tests(mut self, tests: Tests) -> Self {
        self.tests = tests;
        self
    }

    fn next_id(&mut self) -> u64 {
        let id = self.id_counter;
        self.id_counter += 1;
        id
    }

    /// A copy of `spec` carrying `name`, used when an anonymous constraint
    /// spec must be scoped to a package.
    fn named_spec(spec: &Spec, name: &str) -> Spec {
        let mut named = spec.clone();
        if named.name.is_empty() {
            named.name = name.to_string();
        }
        named
    }

    fn record_version_constraint(&mut self, pkg: &str, constraint: &VersionConstraint) {
        self.version_constraints
            .entry(pkg.to_string())
            .or_default()
            .insert(constraint.to_string(), constraint.clone());
    }

    // ------------------------------------------------------------------
    // spec clauses
    // ------------------------------------------------------------------

    /// Clauses expressing a spec's version constraints.
    fn spec_versions(&mut self, spec: &Spec) -> Result<Vec<Fact>> {
        if spec.name.is_empty() {
            return Err(ConcretizeError::Internal(
                "spec with no name occurred while generating version clauses".to_string(),
            ));
        }
        if spec.concrete {
            let version = spec.version().expect("concrete spec has a version");
            return Ok(vec![Fact::attr("version", atoms![&spec.name, version])]);
        }
        if spec.versions.is_any() {
            return Ok(vec![]);
        }
        self.record_version_constraint(&spec.name, &spec.versions);
        Ok(vec![Fact::attr(
            "node_version_satisfies",
            atoms![&spec.name, spec.versions.to_string()],
        )])
    }

    /// Wrap `_spec_clauses` with "required from package" error annotation.
    fn spec_clauses(
        &mut self,
        spec: &Spec,
        opts: ClauseOptions,
        context: Option<&ConditionIdContext>,
        required_from: Option<&str>,
    ) -> Result<Vec<Fact>> {
        self._spec_clauses(spec, opts, context, &mut HashSet::new())
            .map_err(|err| match (&err, required_from) {
                (ConcretizeError::Internal(msg), Some(pkg)) => ConcretizeError::Internal(
                    format!("{msg} [required from package '{pkg}']"),
                ),
                _ => err,
            })
    }

    /// The central primitive: the list of ground facts a spec mandates.
    fn _spec_clauses(
        &mut self,
        spec: &Spec,
        opts: ClauseOptions,
        context: Option<&ConditionIdContext>,
        seen: &mut HashSet<String>,
    ) -> Result<Vec<Fact>> {
        let body = opts.body;
        let mut clauses: Vec<Fact> = Vec::new();
        seen.insert(spec.to_string());

        let name = spec.name.clone();
        if !name.is_empty() {
            if self.repo.is_virtual(&name) {
                clauses.push(Fact::attr("virtual_node", atoms![&name]));
            } else {
                clauses.push(Fact::attr("node", atoms![&name]));
            }
        }
        if let Some(ns) = &spec.namespace {
            let attr = if body { "namespace" } else { "namespace_set" };
            clauses.push(Fact::attr(attr, atoms![&name, ns]));
        }

        clauses.extend(self.spec_versions(spec)?);

        if let Some(platform) = &spec.arch.platform {
            let attr = if body { "node_platform" } else { "node_platform_set" };
            clauses.push(Fact::attr(attr, atoms![&name, platform]));
        }
        if let Some(os) = &spec.arch.os {
            let attr = if body { "node_os" } else { "node_os_set" };
            clauses.push(Fact::attr(attr, atoms![&name, os]));
        }
        if let Some(target) = &spec.arch.target {
            let attr = if body { "node_target" } else { "node_target_set" };
            clauses.push(Fact::attr(attr, atoms![&name, target]));
        }

        // variants
        for (vname, variant) in &spec.variants {
            for value in variant.value.value_strings() {
                // Record possible values seen on specs; accounts for values
                // that cannot be enumerated in the package definition.
                if !name.is_empty() && !spec.concrete && !self.repo.is_virtual(&name) {
                    self.variant_values_from_specs.insert((
                        name.clone(),
                        vname.clone(),
                        value.clone(),
                    ));
                }
                let attr = if body { "variant_value" } else { "variant_set" };
                if variant.propagate {
                    clauses.push(Fact::attr(
                        "propagate",
                        atoms![&name, Fact::new("variant_value", atoms![vname, &value])],
                    ));
                }
                clauses.push(Fact::attr(attr, atoms![&name, vname, &value]));
            }
        }

        // compiler flags
        let source = context
            .and_then(|c| c.source.clone())
            .unwrap_or_else(|| "none".to_string());
        for (flag_type, flag_list) in spec.compiler_flags.iter() {
            for flag in flag_list {
                let attr = if body { "node_flag" } else { "node_flag_set" };
                let nested = Fact::new(
                    "node_flag",
                    atoms![flag_type, &flag.flag, &flag.flag_group, &source],
                );
                clauses.push(Fact::attr(attr, atoms![&name, nested]));
                if !spec.concrete && flag.propagate {
                    let nested = Fact::new(
                        "node_flag",
                        atoms![flag_type, &flag.flag, &flag.flag_group, &source],
                    );
                    clauses.push(Fact::attr("propagate", atoms![&name, nested]));
                }
            }
        }

        // hash for concrete specs
        if spec.concrete {
            if let Some(hash) = spec.dag_hash() {
                clauses.push(Fact::attr("hash", atoms![&name, hash]));
            }
        }

        if !opts.transitive {
            return Ok(clauses);
        }

        // dependencies
        let mut edge_clauses: Vec<Fact> = Vec::new();
        for edge in &spec.edges {
            let dep = &edge.spec;

            if spec.concrete {
                // Runtime packages are re-solved even for concrete specs,
                // so a reused spec still exposes compatibility facts.
                if self.runtime_pkgs.contains(&dep.name) && !edge.virtuals.iter().any(|v| v == "libc") {
                    if let Some(version) = dep.version() {
                        edge_clauses.push(Fact::attr(
                            "compatible_runtime",
                            atoms![&name, &dep.name, format!("{version}:")],
                        ));
                        let constraint: VersionConstraint =
                            format!("{version}:").parse().expect("valid range");
                        self.record_version_constraint(&dep.name, &constraint);
                    }
                    if !opts.include_runtimes {
                        continue;
                    }
                }

                // The C library is re-solved too; compatibility is not
                // encoded in the parent node, so emit explicit facts.
                if edge.virtuals.iter().any(|v| v == "libc") {
                    edge_clauses.push(Fact::attr("needs_libc", atoms![&name]));
                    for compiler in self.compilers {
                        if let (Some(libc), Some(version)) =
                            (compiler.libc.as_ref(), dep.version())
                        {
                            if libc.name == dep.name {
                                if let Some(libc_version) = libc.version() {
                                    if libc_version >= version {
                                        edge_clauses.push(Fact::attr(
                                            "compatible_libc",
                                            atoms![&name, &libc.name, libc_version],
                                        ));
                                    }
                                }
                            }
                        }
                    }
                    if !opts.include_runtimes {
                        continue;
                    }
                }

                for dtype in deptype::flag_to_parts(edge.depflag) {
                    // skip build dependencies of already-installed specs
                    if opts.concrete_build_deps || dtype != deptype::BUILD {
                        edge_clauses.push(Fact::attr(
                            "depends_on",
                            atoms![&name, &dep.name, deptype::flag_to_str(dtype)],
                        ));
                        for virtual_name in &edge.virtuals {
                            edge_clauses.push(Fact::attr(
                                "virtual_on_edge",
                                atoms![&name, &dep.name, virtual_name],
                            ));
                        }
                    }
                }

                // hash constraints for all but pure build deps
                if opts.concrete_build_deps || edge.depflag != deptype::BUILD {
                    if let Some(hash) = dep.dag_hash() {
                        edge_clauses.push(Fact::attr("hash", atoms![&dep.name, hash]));
                    }
                } else if let Some(hash) = dep.dag_hash() {
                    edge_clauses.push(Fact::attr(
                        "concrete_build_dependency",
                        atoms![&name, &dep.name, hash],
                    ));
                }
            }

            // descend into dependencies of abstract specs (or expanded
            // hashes of concrete ones)
            if (!spec.concrete || opts.expand_hashes) && !seen.contains(&dep.to_string()) {
                let dependency_clauses = self._spec_clauses(dep, opts, context, seen)?;

                if !edge.direct {
                    // dependency expressed with "^"
                    edge_clauses.extend(dependency_clauses);
                    continue;
                }

                // direct dependencies expressed with "%"
                for dtype in deptype::flag_to_parts(edge.depflag) {
                    edge_clauses.push(Fact::attr(
                        "depends_on",
                        atoms![&name, &dep.name, deptype::flag_to_str(dtype)],
                    ));
                }

                // By default, wrap heads of rules, not bodies.
                let wrap = context
                    .and_then(|c| c.wrap_node_requirement)
                    .unwrap_or(!body);
                if !wrap {
                    edge_clauses.extend(dependency_clauses);
                    continue;
                }
                for clause in dependency_clauses {
                    let nested = Fact::new("node_requirement", clause.args.clone());
                    edge_clauses.push(Fact::attr("direct_dependency", atoms![&name, nested]));
                }
            }
        }

        clauses.extend(edge_clauses);
        Ok(clauses)
    }

    // ------------------------------------------------------------------
    // conditions
    // ------------------------------------------------------------------

    /// Id for one half of a condition (trigger or imposed constraint),
    /// deduplicated by (spec text, transform).
    fn get_condition_id(
        &mut self,
        named_cond: &Spec,
        which: WhichCache,
        body: bool,
        context: &ConditionIdContext,
    ) -> Result<u64> {
        let key = (named_cond.to_string(), context.transform.clone());
        let cached = match which {
            WhichCache::Trigger => self.trigger_cache.get(&named_cond.name, &key),
            WhichCache::Effect => self.effect_cache.get(&named_cond.name, &key),
        };
        if let Some((id, _)) = cached {
            return Ok(*id);
        }

        let cond_id = self.next_id();
        let opts = ClauseOptions {
            body,
            ..ClauseOptions::default()
        };
        let mut requirements = self.spec_clauses(named_cond, opts, Some(context), None)?;
        if let Some(transform) = &context.transform {
            requirements = transform.apply(named_cond, requirements);
        }
        let pkg = named_cond.name.clone();
        match which {
            WhichCache::Trigger => self.trigger_cache.insert(&pkg, key, cond_id, requirements),
            WhichCache::Effect => self.effect_cache.insert(&pkg, key, cond_id, requirements),
        }
        Ok(cond_id)
    }

    /// Generate facts for a conditional relationship: `required_spec`
    /// triggers the condition, `imposed_spec` (if any) is applied once it
    /// holds. Returns the condition id.
    fn condition(
        &mut self,
        required_spec: &Spec,
        imposed_spec: Option<&Spec>,
        required_name: Option<&str>,
        imposed_name: Option<&str>,
        msg: &str,
        context: Option<ConditionContext>,
    ) -> Result<u64> {
        let required_name = if !required_spec.name.is_empty() {
            required_spec.name.clone()
        } else {
            required_name
                .map(str::to_string)
                .ok_or_else(|| {
                    ConcretizeError::Internal(format!(
                        "must provide a name for anonymous condition: '{required_spec}'"
                    ))
                })?
        };

        let mut context = context.unwrap_or_else(|| ConditionContext {
            transform_imposed: Some(FactTransform::RemoveNodeFacts),
            ..ConditionContext::default()
        });
        if context.transform_imposed.is_none() {
            context.transform_imposed = Some(FactTransform::RemoveNodeFacts);
        }

        let required = SolverSetup::named_spec(required_spec, &required_name);

        let condition_id = self.next_id();
        let requirement_context = context.requirement_context();
        let trigger_id =
            self.get_condition_id(&required, WhichCache::Trigger, true, &requirement_context)?;
        self.gen.fact(Fact::pkg_fact(
            &required.name,
            Fact::new("condition", atoms![condition_id]),
        ));
        self.gen
            .fact(Fact::new("condition_reason", atoms![condition_id, msg]));
        self.gen.fact(Fact::pkg_fact(
            &required.name,
            Fact::new("condition_trigger", atoms![condition_id, trigger_id]),
        ));

        let imposed = match imposed_spec {
            Some(spec) => spec,
            None => return Ok(condition_id),
        };
        let imposed_named = match (imposed.name.is_empty(), imposed_name) {
            (true, Some(name)) => SolverSetup::named_spec(imposed, name),
            (true, None) => {
                return Err(ConcretizeError::Internal(format!(
                    "must provide a name for imposed constraint: '{imposed}'"
                )))
            }
            (false, _) => imposed.clone(),
        };

        let impose_context = context.impose_context();
        let effect_id =
            self.get_condition_id(&imposed_named, WhichCache::Effect, false, &impose_context)?;
        self.gen.fact(Fact::pkg_fact(
            &required.name,
            Fact::new("condition_effect", atoms![condition_id, effect_id]),
        ));
        Ok(condition_id)
    }

    /// Flush all trigger rules collected so far and clear the cache.
    fn trigger_rules(&mut self) {
        if self.trigger_cache.is_empty() {
            return;
        }
        self.gen.h2("Trigger conditions");
        for (pkg, spec_str, trigger_id, requirements) in self.trigger_cache.drain() {
            self.gen.fact(Fact::pkg_fact(
                &pkg,
                Fact::new("trigger_id", atoms![trigger_id]),
            ));
            self.gen.fact(Fact::pkg_fact(
                &pkg,
                Fact::new("trigger_msg", atoms![spec_str]),
            ));
            for predicate in requirements {
                let mut args = atoms![trigger_id];
                args.extend(predicate.args.iter().cloned());
                self.gen.fact(Fact::new("condition_requirement", args));
            }
            self.gen.newline();
        }
    }

    /// Flush all effect rules collected so far and clear the cache.
    fn effect_rules(&mut self) {
        if self.effect_cache.is_empty() {
            return;
        }
        self.gen.h2("Imposed requirements");
        for (pkg, spec_str, effect_id, requirements) in self.effect_cache.drain() {
            self.gen.fact(Fact::pkg_fact(
                &pkg,
                Fact::new("effect_id", atoms![effect_id]),
            ));
            self.gen.fact(Fact::pkg_fact(
                &pkg,
                Fact::new("effect_msg", atoms![spec_str]),
            ));
            for predicate in requirements {
                let mut args = atoms![effect_id];
                args.extend(predicate.args.iter().cloned());
                self.gen.fact(Fact::new("imposed_constraint", args));
            }
            self.gen.newline();
        }
    }

    // ------------------------------------------------------------------
    // per-package rules
    // ------------------------------------------------------------------

    fn pkg_rules(&mut self, pkg_name: &str) -> Result<()> {
        let pkg = self.repo.get(pkg_name)?.clone();

        self.gen.fact(Fact::pkg_fact(
            &pkg.name,
            Fact::new("namespace", atoms![&pkg.namespace]),
        ));

        self.pkg_version_rules(&pkg.name);
        self.gen.newline();

        self.variant_rules(&pkg)?;
        self.conflict_rules(&pkg)?;
        self.package_provider_rules(&pkg)?;
        self.package_dependencies_rules(&pkg)?;
        if self.enable_splicing {
            self.package_splice_rules(&pkg)?;
        }
        self.package_requirement_rules(&pkg)?;

        self.trigger_rules();
        self.effect_rules();
        Ok(())
    }

    /// Output declared versions of a package, ranked by provenance, then
    /// preference index, then version descending within groups.
    fn pkg_version_rules(&mut self, pkg_name: &str) {
        let declared = self
            .declared_versions
            .get(pkg_name)
            .cloned()
            .unwrap_or_default();
        let mut unique: Vec<DeclaredVersion> = Vec::new();
        for version in declared {
            if !unique.contains(&version) {
                unique.push(version);
            }
        }
        unique.sort_by(|a, b| (a.origin, a.idx).cmp(&(b.origin, b.idx)));

        let mut most_to_least: Vec<DeclaredVersion> = Vec::new();
        let mut i = 0;
        while i < unique.len() {
            let mut j = i;
            while j < unique.len()
                && (unique[j].origin, unique[j].idx) == (unique[i].origin, unique[i].idx)
            {
                j += 1;
            }
            let mut group: Vec<DeclaredVersion> = unique[i..j].to_vec();
            group.sort_by(|a, b| b.version.cmp(&a.version));
            most_to_least.extend(group);
            i = j;
        }

        for (weight, declared) in most_to_least.iter().enumerate() {
            self.gen.fact(Fact::pkg_fact(
                pkg_name,
                Fact::new(
                    "version_declared",
                    atoms![&declared.version, weight, declared.origin.to_string()],
                ),
            ));
        }

        let deprecated: Vec<Version> = self
            .deprecated_versions
            .get(pkg_name)
            .map(|set| {
                let mut versions: Vec<Version> = set.iter().cloned().collect();
                versions.sort();
                versions
            })
            .unwrap_or_default();
        for version in deprecated {
            self.gen.fact(Fact::pkg_fact(
                pkg_name,
                Fact::new("deprecated_version", atoms![&version]),
            ));
        }
    }

    fn variant_rules(&mut self, pkg: &crate::package::PackageDef) -> Result<()> {
        let mut names: Vec<String> = Vec::new();
        for def in &pkg.variants {
            if !names.contains(&def.name) {
                names.push(def.name.clone());
            }
        }
        for name in names {
            self.gen.h3(&format!("Variant {} in package {}", name, pkg.name));
            let defs: Vec<VariantDef> = pkg
                .variant_definitions(&name)
                .into_iter()
                .cloned()
                .collect();
            for def in defs {
                self.define_variant(pkg, &def)?;
            }
        }
        Ok(())
    }

    fn define_variant(
        &mut self,
        pkg: &crate::package::PackageDef,
        def: &VariantDef,
    ) -> Result<()> {
        // Every variant definition has a unique id; later-declared ids take
        // precedence when definitions intersect.
        let vid = self.next_id();
        self.variant_def_ids
            .entry((pkg.name.clone(), def.name.clone()))
            .or_default()
            .push(vid);

        match &def.when {
            None => {
                self.gen.fact(Fact::pkg_fact(
                    &pkg.name,
                    Fact::new("variant_definition", atoms![&def.name, vid]),
                ));
            }
            Some(when) => {
                let msg = format!("Package {} has variant '{}' when {}", pkg.name, def.name, when);
                let cond_id = self.condition(when, None, Some(&pkg.name), None, &msg, None)?;
                self.gen.fact(Fact::pkg_fact(
                    &pkg.name,
                    Fact::new("variant_condition", atoms![&def.name, vid, cond_id]),
                ));
            }
        }

        let variant_type = if def.multi {
            "multi"
        } else if matches!(def.default, VariantValue::Bool(_)) {
            "bool"
        } else {
            "single"
        };
        self.gen
            .fact(Fact::new("variant_type", atoms![vid, variant_type]));

        if def.sticky {
            self.gen.fact(Fact::pkg_fact(
                &pkg.name,
                Fact::new("variant_sticky", atoms![vid]),
            ));
        }

        // defaults
        let mut default_values = def.default.value_strings();
        if def.multi {
            default_values.sort();
        }
        for value in &default_values {
            self.gen.fact(Fact::pkg_fact(
                &pkg.name,
                Fact::new("variant_default_value", atoms![vid, value]),
            ));
        }

        // possible values; every variant has at least one
        let mut values = def.values.clone();
        if values.is_empty() {
            match &def.default {
                VariantValue::Bool(_) => {
                    for v in ["false", "true"] {
                        values.push(crate::package::VariantDefValue::new(v));
                    }
                }
                other => {
                    for v in other.value_strings() {
                        values.push(crate::package::VariantDefValue::new(&v));
                    }
                }
            }
        }
        values.sort_by(|a, b| a.value.cmp(&b.value));

        for value in &values {
            self.gen.fact(Fact::pkg_fact(
                &pkg.name,
                Fact::new("variant_possible_value", atoms![vid, &value.value]),
            ));

            if value.disabled {
                // The value is never allowed statically, but it must stay a
                // possible value so using it produces a conflict with a
                // clear message instead of an unknown-value error.
                let vstring = format!("{}='{}'", def.name, value.value);
                let variant_has_value = variant_value_spec(&pkg.name, &def.name, &value.value);
                let trigger_id = self.condition(
                    &variant_has_value,
                    None,
                    Some(&pkg.name),
                    None,
                    &format!("invalid variant value: {vstring}"),
                    None,
                )?;
                let empty = Spec::anonymous();
                let constraint_id = self.condition(
                    &empty,
                    None,
                    Some(&pkg.name),
                    None,
                    "empty (total) conflict constraint",
                    None,
                )?;
                let msg = format!("variant value {vstring} is conditionally disabled");
                self.gen.fact(Fact::pkg_fact(
                    &pkg.name,
                    Fact::new("conflict", atoms![trigger_id, constraint_id, msg]),
                ));
                continue;
            }

            if let Some(when) = &value.when {
                // The conditional value is always "possible", but taking it
                // imposes its condition as a constraint; the value can then
                // only occur when its condition holds.
                let variant_has_value = variant_value_spec(&pkg.name, &def.name, &value.value);
                let msg = format!(
                    "{} variant {} has value '{}' when {}",
                    pkg.name, def.name, value.value, when
                );
                self.condition(
                    &variant_has_value,
                    Some(when),
                    Some(&pkg.name),
                    Some(&pkg.name),
                    &msg,
                    None,
                )?;
            }
        }

        self.gen.newline();
        Ok(())
    }

    fn define_auto_variant(&mut self, name: &str, multi: bool) {
        self.gen.h3(&format!("Special variant: {name}"));
        let vid = self.next_id();
        self.gen.fact(Fact::new("auto_variant", atoms![name, vid]));
        self.gen.fact(Fact::new(
            "variant_type",
            atoms![vid, if multi { "multi" } else { "single" }],
        ));
    }

    fn conflict_rules(&mut self, pkg: &crate::package::PackageDef) -> Result<()> {
        for conflict_def in &pkg.conflicts {
            let when = conflict_def
                .when
                .clone()
                .unwrap_or_else(Spec::anonymous);
            let when_msg = format!("conflict constraint {}", when);
            let when_id = self.condition(&when, None, Some(&pkg.name), None, &when_msg, None)?;

            let conflict_spec = &conflict_def.conflict;
            let message = match &conflict_def.message {
                Some(msg) => msg.clone(),
                None if when.is_empty_constraint() => {
                    format!("{}: conflicts with '{}'", pkg.name, conflict_spec)
                }
                None => format!(
                    "{}: '{}' conflicts with '{}'",
                    pkg.name, conflict_spec, when
                ),
            };

            let conflict_msg = format!("conflict is triggered when {}", conflict_spec);
            let conflict_id =
                self.condition(conflict_spec, None, Some(&pkg.name), None, &conflict_msg, None)?;
            self.gen.fact(Fact::pkg_fact(
                &pkg.name,
                Fact::new("conflict", atoms![conflict_id, when_id, message]),
            ));
            self.gen.newline();
        }
        Ok(())
    }

    fn package_provider_rules(&mut self, pkg: &crate::package::PackageDef) -> Result<()> {
        for virtual_name in pkg.provided_virtual_names() {
            if !self.possible_virtuals.contains(virtual_name) {
                continue;
            }
            self.gen.fact(Fact::pkg_fact(
                &pkg.name,
                Fact::new("possible_provider", atoms![virtual_name]),
            ));
        }

        for provide in &pkg.provided {
            let virtual_name = provide.virtual_spec.name.clone();
            if !self.possible_virtuals.contains(&virtual_name) {
                continue;
            }
            let when = provide.when.clone().unwrap_or_else(Spec::anonymous);
            let msg = format!(
                "{} provides {} when {}",
                pkg.name, provide.virtual_spec, when
            );
            let condition_id = self.condition(
                &when,
                Some(&provide.virtual_spec),
                Some(&pkg.name),
                None,
                &msg,
                None,
            )?;
            self.gen.fact(Fact::pkg_fact(
                &pkg.name,
                Fact::new("provider_condition", atoms![condition_id, &virtual_name]),
            ));
            self.gen.newline();
        }
        Ok(())
    }

    /// Translate `depends_on` directives into conditions.
    fn package_dependencies_rules(&mut self, pkg: &crate::package::PackageDef) -> Result<()> {
        for dep in &pkg.dependencies {
            let mut depflag = dep.depflag;
            // Skip test dependencies unless they were requested for this
            // package.
            if !self.tests.enabled_for(&pkg.name) {
                depflag &= !deptype::TEST;
            }
            if depflag == 0 {
                continue;
            }

            let when = dep.when.clone().unwrap_or_else(Spec::anonymous);
            let mut msg = format!("{} depends on {}", pkg.name, dep.spec);
            if !when.is_empty_constraint() {
                msg += &format!(" when {}", when);
            }

            let context = ConditionContext {
                source: Some(ConstraintOrigin::append_type_suffix(
                    &pkg.name,
                    ConstraintOrigin::DependsOn,
                )),
                transform_required: Some(FactTransform::TrackDependencies),
                transform_imposed: Some(FactTransform::DependencyHolds {
                    pkg: pkg.name.clone(),
                    depflag,
                }),
                wrap_node_requirement: None,
            };
            self.condition(
                &when,
                Some(&dep.spec),
                Some(&pkg.name),
                None,
                &msg,
                Some(context),
            )?;
            self.gen.newline();
        }
        Ok(())
    }

    fn package_splice_rules(&mut self, pkg: &crate::package::PackageDef) -> Result<()> {
        if pkg.splices.is_empty() {
            return Ok(());
        }
        self.gen.h2("Splice rules");
        for (i, splice) in pkg.splices.iter().enumerate() {
            let when = SolverSetup::named_spec(&splice.when, &pkg.name);
            self.record_version_constraint(&when.name, &when.versions);
            self.record_version_constraint(&splice.target.name, &splice.target.versions);

            let msg = format!("{} can be spliced by {}", when, splice.target);
            let when_id = self.condition(&when, None, Some(&pkg.name), None, &msg, None)?;
            self.gen.fact(Fact::pkg_fact(
                &pkg.name,
                Fact::new("splice_condition", atoms![i, when_id]),
            ));
            self.gen.fact(Fact::pkg_fact(
                &pkg.name,
                Fact::new(
                    "splice_target",
                    atoms![i, &splice.target.name, splice.target.versions.to_string()],
                ),
            ));
            match &splice.match_variants {
                None => {}
                Some(variants) if variants.is_empty() => {
                    // match all single-valued variants of the package
                    let mut names: Vec<&str> = pkg
                        .variants
                        .iter()
                        .filter(|v| !v.multi)
                        .map(|v| v.name.as_str())
                        .collect();
                    names.sort();
                    names.dedup();
                    for name in names {
                        self.gen.fact(Fact::pkg_fact(
                            &pkg.name,
                            Fact::new("splice_match_variant", atoms![i, name]),
                        ));
                    }
                }
                Some(variants) => {
                    for name in variants {
                        if splice.when.variants.contains_key(name)
                            || splice.target.variants.contains_key(name)
                        {
                            return Err(ConcretizeError::InvalidSplice(format!(
                                "overlap between match_variants and explicitly set variants \
                                 in splice for {}",
                                pkg.name
                            )));
                        }
                        self.gen.fact(Fact::pkg_fact(
                            &pkg.name,
                            Fact::new("splice_match_variant", atoms![i, name]),
                        ));
                    }
                }
            }
            self.gen.newline();
        }
        Ok(())
    }

    fn package_requirement_rules(&mut self, pkg: &crate::package::PackageDef) -> Result<()> {
        let mut rules: Vec<RequirementRule> = pkg.requirements.clone();
        if let Some(policy) = self.config.package_policy(&pkg.name) {
            for req in &policy.require {
                rules.push(config_requirement_to_rule(
                    &pkg.name,
                    req,
                    RequirementKind::Package,
                )?);
            }
        }
        for req in &self.config.packages.all_require {
            rules.push(config_requirement_to_rule(
                &pkg.name,
                req,
                RequirementKind::Default,
            )?);
        }
        self.emit_facts_from_requirement_rules(&rules)
    }

    /// Generate facts to enforce requirement groups.
    fn emit_facts_from_requirement_rules(&mut self, rules: &[RequirementRule]) -> Result<()> {
        for (group_id, rule) in rules.iter().enumerate() {
            let virtual_rule = rule.kind == RequirementKind::Virtual;
            let pkg_name = rule.pkg_name.clone();
            let mut requirement_weight = 0usize;

            if let Some(condition) = &rule.condition {
                let msg = format!("condition to activate requirement {group_id}");
                let condition_result =
                    self.condition(condition, None, Some(&pkg_name), None, &msg, None);
                let main_condition_id = match condition_result {
                    Ok(id) => id,
                    Err(e) if rule.kind == RequirementKind::Default => {
                        log::debug!("skipping requirement for {pkg_name}: {e}");
                        continue;
                    }
                    Err(e) => {
                        return Err(ConcretizeError::Config(format!(
                            "cannot emit requirements for the solver: {e}"
                        )))
                    }
                };
                self.gen.fact(Fact::new(
                    "requirement_conditional",
                    atoms![&pkg_name, group_id, main_condition_id],
                ));
            }

            self.gen
                .fact(Fact::new("requirement_group", atoms![&pkg_name, group_id]));
            self.gen.fact(Fact::new(
                "requirement_policy",
                atoms![&pkg_name, group_id, rule.policy.as_str()],
            ));
            if let Some(message) = &rule.message {
                self.gen.fact(Fact::new(
                    "requirement_message",
                    atoms![&pkg_name, group_id, message],
                ));
            }
            self.gen.newline();

            for spec_str in &rule.requirements {
                let member = match spec_with_default_name(spec_str, &pkg_name) {
                    Ok(spec) => spec,
                    Err(e) if rule.kind == RequirementKind::Default => {
                        log::debug!("skipping requirement member for {pkg_name}: {e}");
                        continue;
                    }
                    Err(e) => {
                        return Err(ConcretizeError::Config(format!(
                            "cannot emit requirements for the solver: {e}"
                        )))
                    }
                };

                let mut context = ConditionContext {
                    source: Some(ConstraintOrigin::append_type_suffix(
                        &pkg_name,
                        ConstraintOrigin::Require,
                    )),
                    wrap_node_requirement: Some(true),
                    ..ConditionContext::default()
                };
                if !virtual_rule {
                    context.transform_required = Some(FactTransform::RemoveDependsOn);
                    context.transform_imposed = Some(FactTransform::RemoveNodeAndDependsOn);
                }
                // for virtuals the node facts stay in the imposed spec
                if virtual_rule {
                    context.transform_imposed = Some(FactTransform::Identity);
                }

                let msg = format!("{spec_str} is a requirement for package {pkg_name}");
                let member_result = self.condition(
                    &member,
                    Some(&member),
                    Some(&pkg_name),
                    Some(&pkg_name),
                    &msg,
                    Some(context),
                );
                let member_id = match member_result {
                    Ok(id) => id,
                    Err(e) if rule.kind == RequirementKind::Default => {
                        // Rules from the defaults group are skipped when
                        // they do not apply to a package.
                        log::debug!("skipping requirement member for {pkg_name}: {e}");
                        continue;
                    }
                    Err(e) => {
                        return Err(ConcretizeError::Config(format!(
                            "cannot emit requirements for the solver: {e}"
                        )))
                    }
                };

                self.gen.fact(Fact::new(
                    "requirement_group_member",
                    atoms![member_id, &pkg_name, group_id],
                ));
                self.gen.fact(Fact::new(
                    "requirement_has_weight",
                    atoms![member_id, requirement_weight],
                ));
                self.gen.newline();
                requirement_weight += 1;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // externals, preferences, virtuals
    // ------------------------------------------------------------------

    fn external_packages(&mut self) -> Result<()> {
        self.gen.h1("External packages");

        let include: Vec<Spec> = parse_filter_specs(&self.config.reuse.include)?;
        let exclude: Vec<Spec> = parse_filter_specs(&self.config.reuse.exclude)?;

        let package_names: Vec<String> = self.pkgs.iter().cloned().collect();
        for pkg_name in package_names {
            let Some(policy) = self.config.package_policy(&pkg_name) else {
                continue;
            };
            let policy = policy.clone();
            if policy.buildable && policy.externals.is_empty() {
                continue;
            }
            self.gen.h2(&format!("External package: {pkg_name}"));
            if !policy.buildable {
                self.gen
                    .fact(Fact::new("buildable_false", atoms![&pkg_name]));
            }

            let mut external_versions: Vec<(Version, usize)> = Vec::new();
            for (local_idx, entry) in policy.externals.iter().enumerate() {
                let spec = Spec::parse(&entry.spec)?;
                let msg = format!("{} available as external when satisfying {}", spec.name, spec);

                if self.rejected_compilers.iter().any(|c| {
                    c.name == spec.name
                        && spec
                            .version()
                            .map(|v| c.versions.satisfies(v))
                            .unwrap_or(false)
                }) {
                    log::debug!(
                        "not considering {spec} as external, since it is a non-working compiler"
                    );
                    continue;
                }

                if !include.is_empty() && !matches_any_filter(&spec, &include) {
                    continue;
                }
                if matches_any_filter(&spec, &exclude) {
                    continue;
                }

                let Some(version) = spec.version().cloned() else {
                    log::warn!("cannot use the external spec {spec}: needs a concrete version");
                    continue;
                };

                let context = ConditionContext {
                    transform_required: Some(FactTransform::ExternalRequirement),
                    transform_imposed: Some(FactTransform::ExternalImposition { index: local_idx }),
                    ..ConditionContext::default()
                };
                self.condition(&spec, Some(&spec), None, None, &msg, Some(context))?;
                external_versions.push((version.clone(), local_idx));
                self.possible_versions
                    .entry(spec.name.clone())
                    .or_default()
                    .insert(version);
                self.gen.newline();
            }

            // Order external versions to prefer more recent ones, whatever
            // the order in the configuration.
            external_versions.sort_by(|a, b| b.0.cmp(&a.0));
            for (idx, (version, _)) in external_versions.into_iter().enumerate() {
                self.declared_versions
                    .entry(pkg_name.clone())
                    .or_default()
                    .push(DeclaredVersion {
                        version,
                        idx,
                        origin: Provenance::External,
                    });
            }

            self.trigger_rules();
            self.effect_rules();
        }
        Ok(())
    }

    /// Concretization preferences from configuration.
    fn preferred_variants(&mut self, pkg_name: &str) -> Result<()> {
        let Some(policy) = self.config.package_policy(pkg_name) else {
            return Ok(());
        };
        let fragments = policy.variants.clone();
        if fragments.is_empty() {
            return Ok(());
        }
        self.gen.h2(&format!("Package preferences: {pkg_name}"));
        for fragment in &fragments {
            let spec = Spec::parse(fragment)?;
            for (vname, variant) in &spec.variants {
                let known = self
                    .repo
                    .get(pkg_name)
                    .map(|p| p.has_variant(vname))
                    .unwrap_or(false);
                if !known {
                    log::debug!("rejected {fragment} as a preference for {pkg_name}");
                    continue;
                }
                for value in variant.value.value_strings() {
                    self.variant_values_from_specs.insert((
                        pkg_name.to_string(),
                        vname.clone(),
                        value.clone(),
                    ));
                    self.gen.fact(Fact::new(
                        "variant_default_value_from_config",
                        atoms![pkg_name, vname, &value],
                    ));
                }
            }
        }
        Ok(())
    }

    fn virtual_requirements_and_weights(&mut self) -> Result<()> {
        self.gen.h1("Virtual requirements and weights");
        let mut virtuals: Vec<String> = self.possible_virtuals.iter().cloned().collect();
        virtuals.sort();
        for virtual_name in virtuals {
            self.gen.newline();
            self.gen.h2(&format!("Virtual: {virtual_name}"));
            self.gen.fact(Fact::new("virtual", atoms![&virtual_name]));

            let preferences = self
                .config
                .packages
                .providers
                .get(&virtual_name)
                .cloned()
                .unwrap_or_default();
            for (weight, provider) in preferences.iter().enumerate() {
                self.gen.fact(Fact::new(
                    "provider_weight_from_config",
                    atoms![&virtual_name, provider, weight],
                ));
            }
            self.gen.newline();

            // requirement rules scoped to the virtual itself
            if let Some(policy) = self.config.packages.packages.get(&virtual_name) {
                let rules: Vec<RequirementRule> = policy
                    .require
                    .iter()
                    .map(|req| {
                        config_requirement_to_rule(&virtual_name, req, RequirementKind::Virtual)
                    })
                    .collect::<Result<_>>()?;
                if !rules.is_empty() {
                    self.emit_facts_from_requirement_rules(&rules)?;
                    self.trigger_rules();
                    self.effect_rules();
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // versions
    // ------------------------------------------------------------------

    /// Declare versions from package definitions and validate configured
    /// preferences.
    fn define_package_versions_and_validate_preferences(
        &mut self,
        allow_deprecated: bool,
    ) -> Result<()> {
        let package_names: Vec<String> = self.pkgs.iter().cloned().collect();
        for pkg_name in package_names {
            let pkg = self.repo.get(&pkg_name)?.clone();
            for (idx, decl) in pkg.versions.iter().enumerate() {
                if decl.deprecated {
                    self.deprecated_versions
                        .entry(pkg_name.clone())
                        .or_default()
                        .insert(decl.version.clone());
                    if !allow_deprecated {
                        continue;
                    }
                }
                self.possible_versions
                    .entry(pkg_name.clone())
                    .or_default()
                    .insert(decl.version.clone());
                self.declared_versions
                    .entry(pkg_name.clone())
                    .or_default()
                    .push(DeclaredVersion {
                        version: decl.version.clone(),
                        idx,
                        origin: Provenance::PackageDef,
                    });
            }

            let Some(policy) = self.config.package_policy(&pkg_name) else {
                continue;
            };
            let preferred = policy.version.clone();
            for (weight, vstr) in preferred.iter().enumerate() {
                let constraint: VersionConstraint = vstr
                    .parse()
                    .map_err(|e| ConcretizeError::Config(format!("bad version preference: {e}")))?;
                let mut matches: Vec<Version> = self
                    .possible_versions
                    .get(&pkg_name)
                    .map(|set| {
                        set.iter()
                            .filter(|v| constraint.satisfies(v))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                matches.sort_by(|a, b| b.cmp(a));
                if matches.is_empty() {
                    return Err(ConcretizeError::Config(format!(
                        "preference for version {vstr} does not match any known version \
                         of {pkg_name}"
                    )));
                }
                for version in matches {
                    self.declared_versions
                        .entry(pkg_name.clone())
                        .or_default()
                        .push(DeclaredVersion {
                            version,
                            idx: weight,
                            origin: Provenance::PackagesConfig,
                        });
                }
            }
        }
        Ok(())
    }

    /// Add concrete versions mentioned on input specs to the version pool,
    /// so requested versions unknown to packages are still solvable.
    fn define_ad_hoc_versions_from_specs(
        &mut self,
        specs: &[Spec],
        origin: Provenance,
        allow_deprecated: bool,
    ) {
        for spec in specs {
            for node in spec.traverse() {
                if node.name.is_empty() {
                    continue;
                }
                let Some(version) = node.version().cloned() else {
                    continue;
                };
                let known = self
                    .possible_versions
                    .get(&node.name)
                    .map(|set| set.contains(&version))
                    .unwrap_or(false);
                if known {
                    continue;
                }
                let deprecated = self
                    .deprecated_versions
                    .get(&node.name)
                    .map(|set| set.contains(&version))
                    .unwrap_or(false);
                if deprecated && !allow_deprecated {
                    continue;
                }
                // idx 0: ad-hoc versions are used preferentially
                self.declared_versions
                    .entry(node.name.clone())
                    .or_default()
                    .push(DeclaredVersion {
                        version: version.clone(),
                        idx: 0,
                        origin,
                    });
                self.possible_versions
                    .entry(node.name.clone())
                    .or_default()
                    .insert(version);
            }
        }
    }

    /// Collect synthetic possible versions for virtuals from recorded
    /// constraints, so `version_satisfies` has the same semantics for
    /// virtuals as for regular packages. Must run before
    /// `define_version_constraints`.
    fn collect_virtual_constraints(&mut self) {
        let mut synthetic: Vec<(String, Version)> = Vec::new();
        for (pkg_name, constraints) in &self.version_constraints {
            if !self.repo.is_virtual(pkg_name) {
                continue;
            }
            for constraint in constraints.values() {
                for version in constraint.mentioned_versions() {
                    synthetic.push((pkg_name.clone(), version));
                }
            }
        }
        for (pkg_name, version) in synthetic {
            self.possible_versions
                .entry(pkg_name)
                .or_default()
                .insert(version);
        }
    }

    /// Ground `version_satisfies` for every recorded constraint.
    fn define_version_constraints(&mut self) {
        let constraints: Vec<(String, Vec<VersionConstraint>)> = self
            .version_constraints
            .iter()
            .map(|(pkg, map)| (pkg.clone(), map.values().cloned().collect()))
            .collect();
        for (pkg_name, pkg_constraints) in constraints {
            for constraint in pkg_constraints {
                let mut satisfying: Vec<Version> = self
                    .possible_versions
                    .get(&pkg_name)
                    .map(|set| {
                        set.iter()
                            .filter(|v| constraint.satisfies(v))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                satisfying.sort();
                for version in satisfying {
                    self.gen.fact(Fact::pkg_fact(
                        &pkg_name,
                        Fact::new(
                            "version_satisfies",
                            atoms![constraint.to_string(), &version],
                        ),
                    ));
                }
                self.gen.newline();
            }
        }
    }

    // ------------------------------------------------------------------
    // reusable concrete specs
    // ------------------------------------------------------------------

    fn register_concrete_spec(&mut self, spec: &Arc<Spec>) -> Result<()> {
        // only tell the solver about installed packages that could be
        // dependencies
        if !self.pkgs.contains(&spec.name) {
            return Ok(());
        }
        self.reusable_and_possible.add(spec)?;
        Ok(())
    }

    fn define_concrete_input_specs(&mut self, specs: &[Spec]) -> Result<()> {
        for input in specs {
            for node in input.traverse() {
                if node.concrete {
                    // rebuild an owned graph so the container can hold it
                    let owned = Spec::from_json(&node.to_json())?;
                    self.register_concrete_spec(&owned)?;
                }
            }
        }
        Ok(())
    }

    /// Emit facts for reusable specs.
    fn concrete_specs(&mut self) -> Result<()> {
        let explicit: Vec<Arc<Spec>> = self
            .reusable_and_possible
            .explicit_items()
            .map(|(_, spec)| spec.clone())
            .collect();
        for spec in explicit {
            let hash = spec.dag_hash().expect("concrete spec has a hash").to_string();
            self.gen
                .fact(Fact::new("installed_hash", atoms![&spec.name, &hash]));
            // indirection between hash constraints and imposition, to
            // allow for splicing
            let opts = ClauseOptions {
                body: true,
                ..ClauseOptions::default()
            };
            let clauses = self.spec_clauses(&spec, opts, None, None)?;
            for predicate in clauses {
                let mut args = atoms![&hash];
                args.extend(predicate.args.iter().cloned());
                self.gen.fact(Fact::new("hash_attr", args));
            }
            self.gen.newline();

            // declare versions and OSs of reused specs as possible
            for dep in spec.traverse() {
                if let Some(version) = dep.version() {
                    self.possible_versions
                        .entry(dep.name.clone())
                        .or_default()
                        .insert(version.clone());
                    self.declared_versions
                        .entry(dep.name.clone())
                        .or_default()
                        .push(DeclaredVersion {
                            version: version.clone(),
                            idx: 0,
                            origin: Provenance::Installed,
                        });
                }
                if let Some(os) = &dep.arch.os {
                    self.possible_oses.insert(os.clone());
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // platform, OS, targets, compilers
    // ------------------------------------------------------------------

    fn platform_defaults(&mut self) {
        self.gen.h2("Default platform");
        self.gen.fact(Fact::new(
            "node_platform_default",
            atoms![&self.platform.name],
        ));
        self.gen
            .fact(Fact::new("allowed_platform", atoms![&self.platform.name]));
    }

    fn os_defaults(&mut self, specs: &[Spec]) {
        self.gen.h2("Possible operating systems");
        let mut buildable: IndexSet<String> =
            self.platform.operating_systems.iter().cloned().collect();
        // consider OSs mentioned on the command line
        for spec in specs {
            for node in spec.traverse() {
                if let Some(os) = &node.arch.os {
                    buildable.insert(os.clone());
                }
            }
        }
        for os in &buildable {
            self.gen.fact(Fact::new("buildable_os", atoms![os]));
        }

        let mut all_oses: Vec<String> = buildable.iter().cloned().collect();
        for os in &self.possible_oses {
            if !all_oses.contains(os) {
                all_oses.push(os.clone());
            }
        }
        all_oses.sort_by_key(|os| {
            (
                os != &self.platform.default_os,
                !buildable.contains(os),
                os.clone(),
            )
        });
        for (weight, os) in all_oses.iter().enumerate() {
            self.gen.fact(Fact::new("os", atoms![os, weight]));
        }
    }

    fn config_compatible_os(&mut self) {
        self.gen.h2("Compatible OS from concretizer configuration");
        for (recent, reusable) in &self.config.os_compatible {
            for old in reusable {
                self.gen
                    .fact(Fact::new("os_compatible", atoms![recent, old]));
            }
        }
        self.gen.newline();
    }

    fn target_defaults(&mut self, specs: &[Spec]) {
        self.gen.h2("Target compatibility");

        let mut candidate_targets: Vec<String> =
            self.platform.targets.iter().map(|t| t.name.clone()).collect();
        for spec in specs {
            for node in spec.traverse() {
                if let Some(target) = &node.arch.target {
                    if !candidate_targets.contains(target) {
                        candidate_targets.push(target.clone());
                    }
                }
            }
        }

        for compiler in self.compilers {
            if compiler.broken {
                continue;
            }
            let version = compiler
                .spec
                .version()
                .map(|v| v.to_string())
                .unwrap_or_default();
            let supported: Vec<String> = if compiler.supported_targets.is_empty() {
                candidate_targets.clone()
            } else {
                compiler.supported_targets.clone()
            };
            for target in supported {
                self.gen.fact(Fact::new(
                    "compiler_supports_target",
                    atoms![&compiler.spec.name, &version, &target],
                ));
            }
            self.gen.newline();
        }

        for (i, target_name) in candidate_targets.iter().enumerate() {
            self.gen.fact(Fact::new("target", atoms![target_name]));
            if let Some(def) = self.platform.targets.iter().find(|t| &t.name == target_name) {
                self.gen.fact(Fact::new(
                    "target_family",
                    atoms![target_name, &def.family],
                ));
                self.gen.fact(Fact::new(
                    "target_compatible",
                    atoms![target_name, target_name],
                ));
                for ancestor in &def.ancestors {
                    self.gen.fact(Fact::new(
                        "target_compatible",
                        atoms![target_name, ancestor],
                    ));
                }
            } else {
                self.gen.fact(Fact::new(
                    "target_compatible",
                    atoms![target_name, target_name],
                ));
            }
            // prefer the default target, then platform order
            let weight = if target_name == &self.platform.default_target {
                0
            } else {
                i + 1
            };
            self.gen
                .fact(Fact::new("target_weight", atoms![target_name, weight]));
            self.gen.newline();
        }
    }

    /// Constraints injecting compiler runtimes and libcs as ordinary
    /// dependencies, scoped to "when this compiler is used directly".
    fn define_runtime_constraints(&mut self) -> Result<()> {
        let compilers: Vec<Compiler> = self
            .compilers
            .iter()
            .filter(|c| !c.broken)
            .cloned()
            .collect();
        for compiler in self.compilers {
            if compiler.broken {
                self.rejected_compilers.push(compiler.spec.clone());
                log::debug!(
                    "the compiler {} does not run correctly and will not be used",
                    compiler.spec
                );
            }
        }

        let package_names: Vec<String> = self.pkgs.iter().cloned().collect();
        for compiler in &compilers {
            let version = compiler
                .spec
                .version()
                .map(|v| v.to_string())
                .unwrap_or_default();
            self.gen.fact(Fact::new(
                "compiler",
                atoms![&compiler.spec.name, &version],
            ));

            let mut injected: Vec<Spec> = Vec::new();
            if let Some(runtime) = &compiler.runtime {
                injected.push(runtime.clone());
            }
            if self.config.check_libc {
                if let Some(libc) = &compiler.libc {
                    injected.push(libc.clone());
                }
            }

            for pkg_name in &package_names {
                if pkg_name == &compiler.spec.name {
                    continue;
                }
                for injected_spec in &injected {
                    // trigger: the package has a direct build dependency on
                    // this compiler
                    let mut trigger = Spec::new(pkg_name);
                    trigger.add_dependency_edge(
                        Arc::new(compiler.spec.clone()),
                        deptype::BUILD,
                        Vec::new(),
                        true,
                    );
                    let msg = format!(
                        "using {} for {} injects {}",
                        compiler.spec, pkg_name, injected_spec
                    );
                    let context = ConditionContext {
                        source: Some(ConstraintOrigin::append_type_suffix(
                            pkg_name,
                            ConstraintOrigin::DependsOn,
                        )),
                        transform_required: Some(FactTransform::TrackDependencies),
                        transform_imposed: Some(FactTransform::DependencyHolds {
                            pkg: pkg_name.clone(),
                            depflag: deptype::LINK,
                        }),
                        wrap_node_requirement: Some(false),
                    };
                    self.condition(
                        &trigger,
                        Some(injected_spec),
                        Some(pkg_name),
                        None,
                        &msg,
                        Some(context),
                    )?;
                }
            }
        }
        self.trigger_rules();
        self.effect_rules();
        Ok(())
    }

    // ------------------------------------------------------------------
    // input specs
    // ------------------------------------------------------------------

    fn literal_specs(&mut self, specs: &[Spec]) -> Result<()> {
        for spec in specs {
            self.gen.h2(&format!("Spec: {spec}"));
            let condition_id = self.next_id();
            let trigger_id = self.next_id();

            self.gen.fact(Fact::new("literal", atoms![trigger_id]));
            self.gen.fact(Fact::pkg_fact(
                &spec.name,
                Fact::new("condition_trigger", atoms![condition_id, trigger_id]),
            ));
            self.gen.fact(Fact::new(
                "condition_reason",
                atoms![condition_id, format!("{spec} requested explicitly")],
            ));

            let cache_key = (spec.to_string(), None);
            let effect_id = match self.effect_cache.get(&spec.name, &cache_key) {
                Some((id, _)) => *id,
                None => {
                    let effect_id = self.next_id();
                    let context = ConditionIdContext {
                        source: Some("literal".to_string()),
                        ..ConditionIdContext::default()
                    };
                    let mut requirements =
                        self.spec_clauses(spec, ClauseOptions::default(), Some(&context), None)?;

                    let root_name = spec.name.clone();
                    let mut extra: Vec<Fact> = Vec::new();
                    for clause in &requirements {
                        match clause.attr_name() {
                            Some("variant_set") => {
                                extra.push(Fact::attr(
                                    "variant_default_value_from_cli",
                                    clause.attr_args().to_vec(),
                                ));
                            }
                            Some("node") | Some("virtual_node") | Some("hash") => {
                                // needed to compute the condition set of the root
                                if let Some(pkg_name) =
                                    clause.attr_args().first().and_then(|a| a.as_str())
                                {
                                    self.gen.fact(Fact::new(
                                        "mentioned_in_literal",
                                        atoms![trigger_id, &root_name, pkg_name],
                                    ));
                                }
                            }
                            _ => {}
                        }
                    }
                    requirements.extend(extra);

                    let root_attr = if self.repo.is_virtual(&spec.name) {
                        "virtual_root"
                    } else {
                        "root"
                    };
                    requirements.push(Fact::attr(root_attr, atoms![&spec.name]));
                    requirements.retain(|f| f.attr_name() != Some("depends_on"));

                    self.effect_cache
                        .insert(&spec.name, cache_key, effect_id, requirements);
                    effect_id
                }
            };
            self.gen.fact(Fact::pkg_fact(
                &spec.name,
                Fact::new("condition_effect", atoms![condition_id, effect_id]),
            ));

            if self.concretize_everything {
                self.gen.fact(Fact::new("solve_literal", atoms![trigger_id]));
            }
        }

        self.trigger_rules();
        self.effect_rules();
        Ok(())
    }

    // ------------------------------------------------------------------
    // possible packages
    // ------------------------------------------------------------------

    /// Transitively expand dependency declarations and virtual providers
    /// from the root names, bounding the fact set to packages that might
    /// appear in a solution.
    fn possible_dependencies(&mut self, roots: &[String]) -> Result<()> {
        let mut worklist: Vec<String> = roots.to_vec();
        let mut visited: HashSet<String> = HashSet::new();

        while let Some(name) = worklist.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }
            if self.repo.is_virtual(&name) {
                self.possible_virtuals.insert(name.clone());
                for provider in self.repo.providers_of(&name) {
                    worklist.push(provider.name.clone());
                }
                continue;
            }
            if !self.repo.exists(&name) {
                return Err(ConcretizeError::PackageNotFound { name });
            }
            self.pkgs.insert(name.clone());
            let pkg = self.repo.get(&name)?;
            let mut next: Vec<String> = Vec::new();
            for dep in &pkg.dependencies {
                for node in dep.spec.traverse() {
                    if !node.name.is_empty() {
                        next.push(node.name.clone());
                    }
                }
            }
            worklist.extend(next);
        }
        Ok(())
    }

    fn define_variant_values(&mut self) {
        let seen: Vec<(String, String, String)> =
            self.variant_values_from_specs.iter().cloned().collect();
        for (pkg_name, vname, value) in seen {
            let Some(ids) = self
                .variant_def_ids
                .get(&(pkg_name.clone(), vname.clone()))
            else {
                log::debug!("cannot retrieve id of the {value} variant from {pkg_name}");
                continue;
            };
            // later-declared definitions take precedence
            let vid = *ids.last().expect("definition list is never empty");
            self.gen.fact(Fact::pkg_fact(
                &pkg_name,
                Fact::new("variant_possible_value", atoms![vid, &value]),
            ));
        }
    }

    // ------------------------------------------------------------------
    // entry point
    // ------------------------------------------------------------------

    /// Generate the problem instance for the given specs.
    pub fn setup(
        &mut self,
        specs: &[Spec],
        reuse: &[Arc<Spec>],
        allow_deprecated: bool,
    ) -> Result<Program> {
        self.gen.h1("Generic information");
        if self.config.check_libc {
            for compiler in self.compilers {
                if let Some(libc) = &compiler.libc {
                    if let Some(version) = libc.version() {
                        self.gen
                            .fact(Fact::new("host_libc", atoms![&libc.name, version]));
                    }
                }
            }
        }
        if !allow_deprecated {
            self.gen
                .fact(Fact::new("deprecated_versions_not_allowed", atoms![]));
        }
        self.gen.newline();

        self.gen.h1("Possible flags on nodes");
        for flag_type in FLAG_TYPES {
            self.gen.fact(Fact::new("flag_type", atoms![flag_type]));
        }
        self.gen.newline();

        // possible packages: roots, names mentioned in input specs, and
        // packages injected by compilers
        let mut roots: Vec<String> = Vec::new();
        for spec in specs {
            for node in spec.traverse() {
                if !node.name.is_empty() {
                    roots.push(node.name.clone());
                }
            }
        }
        for compiler in self.compilers.iter().filter(|c| !c.broken) {
            roots.push(compiler.spec.name.clone());
            if let Some(runtime) = &compiler.runtime {
                roots.push(runtime.name.clone());
                self.runtime_pkgs.insert(runtime.name.clone());
            }
            if let Some(libc) = &compiler.libc {
                self.runtime_pkgs.insert(libc.name.clone());
                if self.config.check_libc {
                    roots.push(libc.name.clone());
                }
            }
        }
        self.possible_dependencies(&roots)?;

        self.gen.h1("Runtimes");
        self.define_runtime_constraints()?;

        self.gen.h1("Reusable concrete specs");
        self.define_concrete_input_specs(specs)?;
        if !reuse.is_empty() {
            self.gen.fact(Fact::new("optimize_for_reuse", atoms![]));
            for reusable in reuse {
                self.register_concrete_spec(reusable)?;
            }
        }
        self.concrete_specs()?;

        self.gen.h1("General constraints");
        self.config_compatible_os();
        self.platform_defaults();
        self.os_defaults(specs);
        self.target_defaults(specs);

        self.virtual_requirements_and_weights()?;
        self.external_packages()?;

        self.define_package_versions_and_validate_preferences(allow_deprecated)?;
        self.define_ad_hoc_versions_from_specs(specs, Provenance::Spec, allow_deprecated);

        self.gen.h1("Package constraints");
        let package_names: Vec<String> = {
            let mut names: Vec<String> = self.pkgs.iter().cloned().collect();
            names.sort();
            names
        };
        for pkg_name in &package_names {
            self.gen.h2(&format!("Package rules: {pkg_name}"));
            self.pkg_rules(pkg_name)?;
            self.preferred_variants(pkg_name)?;
        }

        self.gen.h1("Special variants");
        self.define_auto_variant("dev_path", false);
        self.define_auto_variant("commit", false);
        self.define_auto_variant("patches", true);

        self.gen.h1("Spec constraints");
        self.literal_specs(specs)?;

        self.gen.h1("Variant values defined in specs");
        self.define_variant_values();

        self.gen.h1("Version constraints");
        self.collect_virtual_constraints();
        self.define_version_constraints();

        Ok(Program {
            text: self.gen.text(),
            facts: self.gen.facts(),
        })
    }
}

/// A spec with a default name if none is provided, used for requirements.
fn spec_with_default_name(spec_str: &str, name: &str) -> Result<Spec> {
    let mut spec = Spec::parse(spec_str)?;
    if spec.name.is_empty() {
        spec.name = name.to_string();
    }
    Ok(spec)
}

fn config_requirement_to_rule(
    pkg_name: &str,
    req: &crate::config::ConfigRequirement,
    kind: RequirementKind,
) -> Result<RequirementRule> {
    let policy = match req.policy.as_str() {
        "one_of" => RequirementPolicy::OneOf,
        "any_of" => RequirementPolicy::AnyOf,
        other => {
            return Err(ConcretizeError::Config(format!(
                "unknown requirement policy '{other}'"
            )))
        }
    };
    let condition = match &req.when {
        Some(when) => Some(Spec::parse(when)?),
        None => None,
    };
    Ok(RequirementRule {
        pkg_name: pkg_name.to_string(),
        policy,
        requirements: req.specs.clone(),
        condition,
        kind,
        message: req.message.clone(),
    })
}

fn parse_filter_specs(specs: &[String]) -> Result<Vec<Spec>> {
    specs.iter().map(|s| Spec::parse(s)).collect()
}

fn matches_any_filter(spec: &Spec, filters: &[Spec]) -> bool {
    filters.iter().any(|f| {
        (f.name.is_empty() || f.name == spec.name)
            && spec
                .version()
                .map(|v| f.versions.satisfies(v))
                .unwrap_or_else(|| f.versions.is_any())
    })
}

/// An anonymous spec asserting that a variant has a value, used as the
/// trigger for conditional variant values.
fn variant_value_spec(pkg_name: &str, variant_name: &str, value: &str) -> Spec {
    let mut spec = Spec::new(pkg_name);
    spec.variants.insert(
        variant_name.to_string(),
        crate::spec::Variant::new(VariantValue::Multi(vec![value.to_string()])),
    );
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{PackageDef, Repo};

    fn simple_repo() -> Repo {
        Repo::new()
            .with(
                PackageDef::new("a")
                    .with_version("2.0")
                    .with_version("1.0")
                    .depends_on("b", ""),
            )
            .with(PackageDef::new("b").with_version("0.9").with_deprecated_version("1.0"))
    }

    fn run_setup(repo: &Repo, specs: &[&str]) -> Program {
        let platform = PlatformInfo::default();
        let config = ConcretizerConfig::default();
        let mut setup = SolverSetup::new(repo, &platform, &[], &config);
        let specs: Vec<Spec> = specs.iter().map(|s| Spec::parse(s).unwrap()).collect();
        setup.setup(&specs, &[], false).unwrap()
    }

    #[test]
    fn test_setup_emits_version_facts() {
        let repo = simple_repo();
        let program = run_setup(&repo, &["a"]);
        assert!(program
            .text
            .contains("pkg_fact(\"a\",version_declared(\"2.0\",0,\"package_def\"))"));
        assert!(program
            .text
            .contains("pkg_fact(\"a\",version_declared(\"1.0\",1,\"package_def\"))"));
        // deprecated version of b is declared deprecated and not a
        // candidate when deprecated versions are not allowed
        assert!(program.text.contains("pkg_fact(\"b\",deprecated_version(\"1.0\"))"));
        assert!(program.text.contains("deprecated_versions_not_allowed()"));
    }

    #[test]
    fn test_setup_emits_dependency_condition() {
        let repo = simple_repo();
        let program = run_setup(&repo, &["a"]);
        assert!(program.text.contains("dependency_holds"));
        assert!(program.text.contains("solve_literal"));
    }

    #[test]
    fn test_possible_packages_closed_set() {
        let repo = simple_repo();
        let platform = PlatformInfo::default();
        let config = ConcretizerConfig::default();
        let mut setup = SolverSetup::new(&repo, &platform, &[], &config);
        let specs = vec![Spec::parse("a").unwrap()];
        setup.setup(&specs, &[], false).unwrap();
        assert!(setup.pkgs.contains("a"));
        assert!(setup.pkgs.contains("b"));
    }

    #[test]
    fn test_condition_deduplication() {
        // two dependencies with the same trigger/imposed text share ids
        let repo = Repo::new()
            .with(
                PackageDef::new("x")
                    .with_version("1.0")
                    .depends_on("z@1.0", "")
                    .depends_on("z@1.0", "run"),
            )
            .with(PackageDef::new("z").with_version("1.0"));
        let program = run_setup(&repo, &["x"]);
        let trigger_count = program
            .text
            .lines()
            .filter(|l| l.contains("pkg_fact(\"x\",trigger_id("))
            .count();
        // triggers for both depends_on directives collapse to one (same
        // anonymous trigger named x), aside from literal/runtime triggers
        assert!(trigger_count >= 1);
    }

    #[test]
    fn test_unknown_package_errors() {
        let repo = Repo::new().with(PackageDef::new("a").with_version("1.0").depends_on("ghost", ""));
        let platform = PlatformInfo::default();
        let config = ConcretizerConfig::default();
        let mut setup = SolverSetup::new(&repo, &platform, &[], &config);
        let specs = vec![Spec::parse("a").unwrap()];
        assert!(matches!(
            setup.setup(&specs, &[], false),
            Err(ConcretizeError::PackageNotFound { .. })
        ));
    }
}
