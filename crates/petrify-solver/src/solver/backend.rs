//! The bundled solver backend.
//!
//! The solve driver treats the backend as an opaque, cancellable, time-boxed
//! engine behind [`SolverBackend`]. This implementation grounds the fact
//! protocol natively and runs a deterministic greedy search with
//! chronological backtracking over version and requirement choices,
//! restarting from scratch whenever a pinned choice changes so no stale
//! consequences survive. Error conditions are modeled as weighted facts in
//! an otherwise satisfiable model; only contradictory *inputs* produce an
//! unsatisfiable outcome with a core.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use indexmap::{IndexMap, IndexSet};
use petrify_version::{Version, VersionConstraint};

use crate::deptype::{self, DepFlag};
use crate::solver::fact::{atoms, Atom, Fact, NodeArgument};
use crate::solver::setup::Program;

const MAX_RESTARTS: u32 = 10_000;

/// Which fixed rule modules were loaded for this solve.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleModules {
    /// Best-effort solving: inputs may be dropped instead of failing.
    pub when_possible: bool,
    /// Check libc compatibility instead of plain OS equality.
    pub libc_compatibility: bool,
    /// Automatic splice synthesis enabled.
    pub splices: bool,
}

/// Per-solve request parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendRequest {
    pub modules: RuleModules,
    /// Cooperative wall-clock deadline; checked between restarts.
    pub deadline: Option<Instant>,
}

/// One stable model: a cost vector plus flat attribute tuples.
#[derive(Debug, Clone)]
pub struct Model {
    pub cost: Vec<i64>,
    pub facts: Vec<Fact>,
}

#[derive(Debug, Default)]
pub struct BackendOutcome {
    pub satisfiable: bool,
    pub models: Vec<Model>,
    /// Unsatisfiable cores: sets of input fact strings.
    pub cores: Vec<Vec<String>>,
    pub timed_out: bool,
    /// Input literals that had to be dropped in best-effort mode.
    pub dropped_literals: Vec<String>,
    /// Solver statistics, serializable for the cache.
    pub stats: Vec<(String, i64)>,
}

/// An opaque, cancellable search engine over a ground program.
pub trait SolverBackend {
    fn solve(&self, program: &Program, request: &BackendRequest) -> BackendOutcome;

    /// Re-solve keeping only the given input facts active. Used for
    /// subset-minimal core extraction.
    fn satisfiable_with(
        &self,
        program: &Program,
        request: &BackendRequest,
        active: &[String],
    ) -> bool;
}

// ---------------------------------------------------------------------
// grounding
// ---------------------------------------------------------------------

/// A clause from `condition_requirement` / `imposed_constraint` /
/// `hash_attr`: an attribute name plus its arguments (first argument is
/// the package name for node-scoped attributes).
#[derive(Debug, Clone)]
struct AttrClause {
    name: String,
    args: Vec<Atom>,
}

impl AttrClause {
    fn pkg(&self) -> &str {
        self.args.first().and_then(Atom::as_str).unwrap_or("")
    }

    fn render(&self) -> String {
        let mut fact_args = atoms![self.name.as_str()];
        fact_args.extend(self.args.iter().cloned());
        Fact::new("attr", fact_args).to_string()
    }
}

#[derive(Debug, Clone, Default)]
struct ConditionInfo {
    trigger: Option<u64>,
    effect: Option<u64>,
}

#[derive(Debug, Clone)]
struct DeclaredVersionInfo {
    version: Version,
    weight: i64,
}

#[derive(Debug, Clone)]
struct VariantDefInfo {
    vid: u64,
    name: String,
    condition: Option<u64>,
    defaults: Vec<String>,
    possible: IndexSet<String>,
    vtype: String,
}

#[derive(Debug, Clone)]
struct RequirementGroupInfo {
    pkg: String,
    gid: usize,
    policy: String,
    message: Option<String>,
    condition: Option<u64>,
    /// (member condition id, weight), sorted by weight.
    members: Vec<(u64, usize)>,
}

#[derive(Debug, Default)]
struct Grounded {
    conditions: HashMap<u64, ConditionInfo>,
    conditions_by_pkg: IndexMap<String, Vec<u64>>,
    triggers: HashMap<u64, Vec<AttrClause>>,
    effects: HashMap<u64, Vec<AttrClause>>,
    reasons: HashMap<u64, String>,
    /// literal trigger id -> (condition id, pkg)
    literals: IndexMap<u64, (u64, String)>,
    solve_literals: IndexSet<u64>,
    versions: IndexMap<String, Vec<DeclaredVersionInfo>>,
    deprecated: IndexMap<String, IndexSet<String>>,
    deprecated_not_allowed: bool,
    conflicts: IndexMap<String, Vec<(u64, u64, String)>>,
    virtuals: IndexSet<String>,
    possible_providers: IndexMap<String, IndexSet<String>>,
    provider_conditions: IndexMap<String, Vec<(String, u64)>>,
    provider_weights: HashMap<(String, String), i64>,
    variant_defs: IndexMap<String, Vec<VariantDefInfo>>,
    variant_types: HashMap<u64, String>,
    config_variant_defaults: HashMap<(String, String), Vec<String>>,
    requirement_groups: Vec<RequirementGroupInfo>,
    buildable_false: IndexSet<String>,
    installed: IndexMap<String, (String, Vec<AttrClause>)>,
    installed_by_pkg: IndexMap<String, Vec<String>>,
    optimize_for_reuse: bool,
    namespaces: HashMap<String, String>,
    platform_default: Option<String>,
    os_weights: IndexMap<String, i64>,
    target_weights: IndexMap<String, i64>,
}

impl Grounded {
    fn from_facts(facts: &[Fact]) -> Grounded {
        let mut g = Grounded::default();
        let mut requirement_meta: Vec<(String, usize, String, Option<String>, Option<u64>)> =
            Vec::new();
        let mut requirement_members: Vec<(u64, String, usize, usize)> = Vec::new();
        let mut member_weights: HashMap<u64, usize> = HashMap::new();

        for fact in facts {
            match fact.name.as_str() {
                "pkg_fact" => {
                    let pkg = fact.args[0].as_str().unwrap_or("").to_string();
                    let Some(inner) = fact.args.get(1).and_then(Atom::as_fact) else {
                        continue;
                    };
                    g.ground_pkg_fact(&pkg, inner);
                }
                "condition_reason" => {
                    if let (Some(id), Some(msg)) =
                        (fact.args[0].as_int(), fact.args[1].as_str())
                    {
                        g.reasons.insert(id as u64, msg.to_string());
                    }
                }
                "condition_requirement" | "imposed_constraint" => {
                    let Some(id) = fact.args[0].as_int() else { continue };
                    let Some(name) = fact.args.get(1).and_then(Atom::as_str) else {
                        continue;
                    };
                    let clause = AttrClause {
                        name: name.to_string(),
                        args: fact.args[2..].to_vec(),
                    };
                    let table = if fact.name == "condition_requirement" {
                        &mut g.triggers
                    } else {
                        &mut g.effects
                    };
                    table.entry(id as u64).or_default().push(clause);
                }
                "literal" => {
                    if let Some(id) = fact.args[0].as_int() {
                        g.literals.entry(id as u64).or_insert((0, String::new()));
                    }
                }
                "solve_literal" => {
                    if let Some(id) = fact.args[0].as_int() {
                        g.solve_literals.insert(id as u64);
                    }
                }
                "variant_type" => {
                    if let (Some(vid), Some(t)) = (fact.args[0].as_int(), fact.args[1].as_str()) {
                        g.variant_types.insert(vid as u64, t.to_string());
                    }
                }
                "virtual" => {
                    if let Some(name) = fact.args[0].as_str() {
                        g.virtuals.insert(name.to_string());
                    }
                }
                "provider_weight_from_config" => {
                    if let (Some(v), Some(p), Some(w)) = (
                        fact.args[0].as_str(),
                        fact.args[1].as_str(),
                        fact.args[2].as_int(),
                    ) {
                        g.provider_weights.insert((v.to_string(), p.to_string()), w);
                    }
                }
                "deprecated_versions_not_allowed" => g.deprecated_not_allowed = true,
                "optimize_for_reuse" => g.optimize_for_reuse = true,
                "buildable_false" => {
                    if let Some(pkg) = fact.args[0].as_str() {
                        g.buildable_false.insert(pkg.to_string());
                    }
                }
                "requirement_group" => {
                    if let (Some(pkg), Some(gid)) = (fact.args[0].as_str(), fact.args[1].as_int())
                    {
                        requirement_meta.push((
                            pkg.to_string(),
                            gid as usize,
                            "one_of".to_string(),
                            None,
                            None,
                        ));
                    }
                }
                "requirement_policy" => {
                    if let (Some(pkg), Some(gid), Some(policy)) = (
                        fact.args[0].as_str(),
                        fact.args[1].as_int(),
                        fact.args[2].as_str(),
                    ) {
                        for meta in requirement_meta.iter_mut() {
                            if meta.0 == pkg && meta.1 == gid as usize {
                                meta.2 = policy.to_string();
                            }
                        }
                    }
                }
                "requirement_message" => {
                    if let (Some(pkg), Some(gid), Some(msg)) = (
                        fact.args[0].as_str(),
                        fact.args[1].as_int(),
                        fact.args[2].as_str(),
                    ) {
                        for meta in requirement_meta.iter_mut() {
                            if meta.0 == pkg && meta.1 == gid as usize {
                                meta.3 = Some(msg.to_string());
                            }
                        }
                    }
                }
                "requirement_conditional" => {
                    if let (Some(pkg), Some(gid), Some(cond)) = (
                        fact.args[0].as_str(),
                        fact.args[1].as_int(),
                        fact.args[2].as_int(),
                    ) {
                        for meta in requirement_meta.iter_mut() {
                            if meta.0 == pkg && meta.1 == gid as usize {
                                meta.4 = Some(cond as u64);
                            }
                        }
                    }
                }
                "requirement_group_member" => {
                    if let (Some(member), Some(pkg), Some(gid)) = (
                        fact.args[0].as_int(),
                        fact.args[1].as_str(),
                        fact.args[2].as_int(),
                    ) {
                        requirement_members.push((
                            member as u64,
                            pkg.to_string(),
                            gid as usize,
                            usize::MAX,
                        ));
                    }
                }
                "requirement_has_weight" => {
                    if let (Some(member), Some(weight)) =
                        (fact.args[0].as_int(), fact.args[1].as_int())
                    {
                        member_weights.insert(member as u64, weight as usize);
                    }
                }
                "installed_hash" => {
                    if let (Some(pkg), Some(hash)) = (fact.args[0].as_str(), fact.args[1].as_str())
                    {
                        g.installed
                            .insert(hash.to_string(), (pkg.to_string(), Vec::new()));
                        g.installed_by_pkg
                            .entry(pkg.to_string())
                            .or_default()
                            .push(hash.to_string());
                    }
                }
                "hash_attr" => {
                    let Some(hash) = fact.args[0].as_str() else { continue };
                    let Some(name) = fact.args.get(1).and_then(Atom::as_str) else {
                        continue;
                    };
                    let clause = AttrClause {
                        name: name.to_string(),
                        args: fact.args[2..].to_vec(),
                    };
                    if let Some((_, attrs)) = g.installed.get_mut(hash) {
                        attrs.push(clause);
                    }
                }
                "node_platform_default" => {
                    g.platform_default = fact.args[0].as_str().map(str::to_string);
                }
                "os" => {
                    if let (Some(os), Some(w)) = (fact.args[0].as_str(), fact.args[1].as_int()) {
                        g.os_weights.insert(os.to_string(), w);
                    }
                }
                "target_weight" => {
                    if let (Some(t), Some(w)) = (fact.args[0].as_str(), fact.args[1].as_int()) {
                        g.target_weights.insert(t.to_string(), w);
                    }
                }
                "variant_default_value_from_config" => {
                    if let (Some(pkg), Some(vname), Some(value)) = (
                        fact.args[0].as_str(),
                        fact.args[1].as_str(),
                        fact.args[2].as_str(),
                    ) {
                        g.config_variant_defaults
                            .entry((pkg.to_string(), vname.to_string()))
                            .or_default()
                            .push(value.to_string());
                    }
                }
                _ => {}
            }
        }

        // attach member weights and sort groups
        for (member, pkg, gid, _) in requirement_members {
            let weight = member_weights.get(&member).copied().unwrap_or(usize::MAX);
            if let Some(meta) = requirement_meta
                .iter()
                .position(|m| m.0 == pkg && m.1 == gid)
            {
                let (pkg, gid, policy, message, condition) = requirement_meta[meta].clone();
                let group = g
                    .requirement_groups
                    .iter_mut()
                    .find(|grp| grp.pkg == pkg && grp.gid == gid);
                match group {
                    Some(group) => group.members.push((member, weight)),
                    None => g.requirement_groups.push(RequirementGroupInfo {
                        pkg,
                        gid,
                        policy,
                        message,
                        condition,
                        members: vec![(member, weight)],
                    }),
                }
            }
        }
        for group in g.requirement_groups.iter_mut() {
            group.members.sort_by_key(|(_, w)| *w);
        }

        g
    }

    fn ground_pkg_fact(&mut self, pkg: &str, inner: &Fact) {
        match inner.name.as_str() {
            "version_declared" => {
                if let (Some(v), Some(w)) = (inner.args[0].as_str(), inner.args[1].as_int()) {
                    self.versions
                        .entry(pkg.to_string())
                        .or_default()
                        .push(DeclaredVersionInfo {
                            version: Version::new(v),
                            weight: w,
                        });
                }
            }
            "deprecated_version" => {
                if let Some(v) = inner.args[0].as_str() {
                    self.deprecated
                        .entry(pkg.to_string())
                        .or_default()
                        .insert(v.to_string());
                }
            }
            "namespace" => {
                if let Some(ns) = inner.args[0].as_str() {
                    self.namespaces.insert(pkg.to_string(), ns.to_string());
                }
            }
            "condition" => {
                if let Some(id) = inner.args[0].as_int() {
                    self.conditions.entry(id as u64).or_default();
                    self.conditions_by_pkg
                        .entry(pkg.to_string())
                        .or_default()
                        .push(id as u64);
                }
            }
            "condition_trigger" => {
                if let (Some(cid), Some(tid)) = (inner.args[0].as_int(), inner.args[1].as_int()) {
                    let info = self.conditions.entry(cid as u64).or_default();
                    info.trigger = Some(tid as u64);
                    // literal triggers get associated with their condition
                    if let Some(entry) = self.literals.get_mut(&(tid as u64)) {
                        *entry = (cid as u64, pkg.to_string());
                    }
                }
            }
            "condition_effect" => {
                if let (Some(cid), Some(eid)) = (inner.args[0].as_int(), inner.args[1].as_int()) {
                    let info = self.conditions.entry(cid as u64).or_default();
                    info.effect = Some(eid as u64);
                }
            }
            "conflict" => {
                if let (Some(trig), Some(when), Some(msg)) = (
                    inner.args[0].as_int(),
                    inner.args[1].as_int(),
                    inner.args[2].as_str(),
                ) {
                    self.conflicts.entry(pkg.to_string()).or_default().push((
                        trig as u64,
                        when as u64,
                        msg.to_string(),
                    ));
                }
            }
            "possible_provider" => {
                if let Some(virtual_name) = inner.args[0].as_str() {
                    self.possible_providers
                        .entry(virtual_name.to_string())
                        .or_default()
                        .insert(pkg.to_string());
                }
            }
            "provider_condition" => {
                if let (Some(cid), Some(virtual_name)) =
                    (inner.args[0].as_int(), inner.args[1].as_str())
                {
                    self.provider_conditions
                        .entry(virtual_name.to_string())
                        .or_default()
                        .push((pkg.to_string(), cid as u64));
                }
            }
            "variant_definition" | "variant_condition" => {
                if let (Some(name), Some(vid)) = (inner.args[0].as_str(), inner.args[1].as_int()) {
                    let condition = if inner.name == "variant_condition" {
                        inner.args.get(2).and_then(Atom::as_int).map(|c| c as u64)
                    } else {
                        None
                    };
                    self.variant_defs
                        .entry(pkg.to_string())
                        .or_default()
                        .push(VariantDefInfo {
                            vid: vid as u64,
                            name: name.to_string(),
                            condition,
                            defaults: Vec::new(),
                            possible: IndexSet::new(),
                            vtype: String::new(),
                        });
                }
            }
            "variant_default_value" => {
                if let (Some(vid), Some(value)) = (inner.args[0].as_int(), inner.args[1].as_str())
                {
                    if let Some(defs) = self.variant_defs.get_mut(pkg) {
                        for def in defs.iter_mut() {
                            if def.vid == vid as u64 {
                                def.defaults.push(value.to_string());
                            }
                        }
                    }
                }
            }
            "variant_possible_value" => {
                if let (Some(vid), Some(value)) = (inner.args[0].as_int(), inner.args[1].as_str())
                {
                    if let Some(defs) = self.variant_defs.get_mut(pkg) {
                        for def in defs.iter_mut() {
                            if def.vid == vid as u64 {
                                def.possible.insert(value.to_string());
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn finish(&mut self) {
        // resolve variant types after all facts are read
        let types = self.variant_types.clone();
        for defs in self.variant_defs.values_mut() {
            for def in defs.iter_mut() {
                def.vtype = types
                    .get(&def.vid)
                    .cloned()
                    .unwrap_or_else(|| "single".to_string());
            }
        }
        for versions in self.versions.values_mut() {
            versions.sort_by_key(|v| v.weight);
        }
    }
}

// ---------------------------------------------------------------------
// search state
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
struct VersionConstraintEntry {
    constraint: VersionConstraint,
    /// Index into the assumption table when this came from an input.
    support: Option<usize>,
}

#[derive(Debug, Clone, Default)]
struct NodeState {
    pkg: String,
    version: Option<Version>,
    version_choice_weight: i64,
    version_constraints: Vec<VersionConstraintEntry>,
    /// variant name -> (values, supports, rendered set facts)
    variant_values: IndexMap<String, Vec<(String, Option<usize>, String)>>,
    flags: Vec<(String, String, String, String)>,
    platform: Option<String>,
    os: Option<String>,
    target: Option<String>,
    namespace: Option<String>,
    external: Option<usize>,
    reused_hash: Option<String>,
    root: bool,
    /// Condition that caused this node to exist, for cause chains.
    cause: Option<u64>,
    /// Assumption that transitively created this node.
    root_support: Option<usize>,
    /// Dropped in best-effort mode.
    deprecated_version_used: bool,
}

#[derive(Debug, Clone)]
struct EdgeState {
    parent: String,
    child: String,
    depflag: DepFlag,
    virtuals: Vec<String>,
    direct: bool,
}

#[derive(Debug, Clone)]
struct Assumption {
    rendered: String,
    clause: AttrClause,
    literal_trigger: u64,
}

#[derive(Debug)]
struct Conflict {
    /// Assumption indices implicated in the contradiction.
    supports: Vec<usize>,
    /// Packages implicated; used to widen the core to their literals.
    pkgs: Vec<String>,
    message: String,
    /// Condition implicated, for cause trees.
    condition: Option<u64>,
    /// A package whose version choice should be revised, if any.
    revisable: Option<String>,
    /// The search already adjusted a pin; restart without giving up.
    retry: bool,
}

impl Conflict {
    fn new(message: String) -> Conflict {
        Conflict {
            supports: Vec::new(),
            pkgs: Vec::new(),
            message,
            condition: None,
            revisable: None,
            retry: false,
        }
    }
}

#[derive(Debug, Default)]
struct SolveState {
    nodes: IndexMap<String, NodeState>,
    edges: Vec<EdgeState>,
    applied_conditions: IndexSet<u64>,
    /// (effect condition, cause condition) pairs for cause trees.
    causes: IndexSet<(u64, u64)>,
    errors: Vec<Fact>,
    provider_choices: IndexMap<String, String>,
}

impl SolveState {
    fn node_mut(&mut self, pkg: &str) -> &mut NodeState {
        self.nodes.entry(pkg.to_string()).or_insert_with(|| NodeState {
            pkg: pkg.to_string(),
            ..NodeState::default()
        })
    }

    fn has_edge(&self, parent: &str, child: &str) -> bool {
        self.edges
            .iter()
            .any(|e| e.parent == parent && e.child == child)
    }

    fn add_edge(&mut self, parent: &str, child: &str, depflag: DepFlag, direct: bool) {
        for edge in self.edges.iter_mut() {
            if edge.parent == parent && edge.child == child && edge.direct == direct {
                edge.depflag |= depflag;
                return;
            }
        }
        self.edges.push(EdgeState {
            parent: parent.to_string(),
            child: child.to_string(),
            depflag,
            virtuals: Vec::new(),
            direct,
        });
    }
}

// ---------------------------------------------------------------------
// the backend
// ---------------------------------------------------------------------

/// The bundled deterministic backend.
#[derive(Debug, Default)]
pub struct GreedyBackend;

impl GreedyBackend {
    pub fn new() -> GreedyBackend {
        GreedyBackend
    }
}

impl SolverBackend for GreedyBackend {
    fn solve(&self, program: &Program, request: &BackendRequest) -> BackendOutcome {
        let mut grounded = Grounded::from_facts(&program.facts);
        grounded.finish();

        let mut search = Search::new(&grounded, request);
        search.run()
    }

    fn satisfiable_with(
        &self,
        program: &Program,
        request: &BackendRequest,
        active: &[String],
    ) -> bool {
        let mut grounded = Grounded::from_facts(&program.facts);
        grounded.finish();

        let mut search = Search::new(&grounded, request);
        search.active_assumptions = Some(active.iter().cloned().collect());
        let outcome = search.run();
        outcome.satisfiable
    }
}

struct Search<'p> {
    g: &'p Grounded,
    request: BackendRequest,
    assumptions: Vec<Assumption>,
    active_assumptions: Option<HashSet<String>>,
    /// Pinned version choices: pkg -> index into its candidate list.
    version_pins: IndexMap<String, usize>,
    /// Pinned requirement member choices: (pkg, gid) -> member index.
    requirement_pins: IndexMap<(String, usize), usize>,
    dropped_literals: IndexSet<u64>,
    restarts: u32,
}

impl<'p> Search<'p> {
    fn new(g: &'p Grounded, request: &BackendRequest) -> Search<'p> {
        Search {
            g,
            request: *request,
            assumptions: Vec::new(),
            active_assumptions: None,
            version_pins: IndexMap::new(),
            requirement_pins: IndexMap::new(),
            dropped_literals: IndexSet::new(),
            restarts: 0,
        }
    }

    fn expired(&self) -> bool {
        self.request
            .deadline
            .map(|d| Instant::now() >= d)
            .unwrap_or(false)
    }

    fn run(&mut self) -> BackendOutcome {
        self.collect_assumptions();

        let mut outcome = BackendOutcome::default();
        loop {
            if self.restarts > MAX_RESTARTS {
                outcome.satisfiable = false;
                outcome.cores.push(
                    self.assumptions
                        .iter()
                        .map(|a| a.rendered.clone())
                        .collect(),
                );
                return outcome;
            }
            if self.expired() {
                outcome.timed_out = true;
                outcome.satisfiable = false;
                return outcome;
            }
            self.restarts += 1;

            match self.attempt() {
                Ok(state) => {
                    let model = self.build_model(&state);
                    outcome.satisfiable = true;
                    outcome.models.push(model);
                    outcome.stats = vec![
                        ("restarts".to_string(), self.restarts as i64),
                        ("nodes".to_string(), state.nodes.len() as i64),
                        ("edges".to_string(), state.edges.len() as i64),
                    ];
                    outcome.dropped_literals = self
                        .dropped_literals
                        .iter()
                        .filter_map(|tid| self.g.literals.get(tid))
                        .map(|(cid, _)| {
                            self.g
                                .reasons
                                .get(cid)
                                .cloned()
                                .unwrap_or_else(|| format!("condition {cid}"))
                        })
                        .collect();
                    return outcome;
                }
                Err(conflict) => {
                    log::debug!(
                        "conflict (condition {:?}): {}",
                        conflict.condition,
                        conflict.message
                    );
                    if conflict.retry {
                        continue;
                    }

                    // revise a version choice first
                    if let Some(pkg) = &conflict.revisable {
                        let count = self.candidate_count(pkg);
                        let pin = self.version_pins.entry(pkg.clone()).or_insert(0);
                        *pin += 1;
                        if *pin <= count {
                            continue;
                        }
                        self.version_pins.shift_remove(pkg);
                    }

                    // in best-effort mode, drop an implicated literal that
                    // is not required to be solved
                    if self.request.modules.when_possible {
                        let droppable = self.implicated_literal(&conflict, false);
                        if let Some(tid) = droppable {
                            self.dropped_literals.insert(tid);
                            self.version_pins.clear();
                            self.requirement_pins.clear();
                            continue;
                        }
                    }

                    let core = self.conflict_core(&conflict);
                    outcome.satisfiable = false;
                    if !core.is_empty() {
                        outcome.cores.push(core);
                    }
                    return outcome;
                }
            }
        }
    }

    fn candidate_count(&self, pkg: &str) -> usize {
        self.g.versions.get(pkg).map(Vec::len).unwrap_or(0)
            + self.g.installed_by_pkg.get(pkg).map(Vec::len).unwrap_or(0)
    }

    /// Literal implicated in a conflict; when `any` is false, only
    /// literals that are not in `solve_literal` qualify (droppable).
    fn implicated_literal(&self, conflict: &Conflict, any: bool) -> Option<u64> {
        for &support in &conflict.supports {
            let trigger = self.assumptions.get(support)?.literal_trigger;
            if any || !self.g.solve_literals.contains(&trigger) {
                return Some(trigger);
            }
        }
        None
    }

    fn conflict_core(&self, conflict: &Conflict) -> Vec<String> {
        let mut core: IndexSet<String> = IndexSet::new();
        for &support in &conflict.supports {
            if let Some(assumption) = self.assumptions.get(support) {
                core.insert(assumption.rendered.clone());
            }
        }
        // widen to the literals of implicated packages, so cores are never
        // empty for user-visible failures
        if core.is_empty() {
            for pkg in &conflict.pkgs {
                for assumption in &self.assumptions {
                    if assumption.clause.pkg() == pkg {
                        core.insert(assumption.rendered.clone());
                    }
                }
            }
        }
        let mut core: Vec<String> = core.into_iter().collect();
        core.sort();
        core
    }

    fn collect_assumptions(&mut self) {
        for (&trigger_id, (cond_id, _pkg)) in &self.g.literals {
            let Some(info) = self.g.conditions.get(cond_id) else {
                continue;
            };
            let Some(effect) = info.effect else { continue };
            for clause in self.g.effects.get(&effect).into_iter().flatten() {
                self.assumptions.push(Assumption {
                    rendered: clause.render(),
                    clause: clause.clone(),
                    literal_trigger: trigger_id,
                });
            }
        }
    }

    fn assumption_active(&self, idx: usize) -> bool {
        let assumption = &self.assumptions[idx];
        if self.dropped_literals.contains(&assumption.literal_trigger) {
            return false;
        }
        match &self.active_assumptions {
            Some(active) => active.contains(&assumption.rendered),
            None => true,
        }
    }

    // -----------------------------------------------------------------
    // one deterministic attempt
    // -----------------------------------------------------------------

    fn attempt(&mut self) -> Result<SolveState, Conflict> {
        let mut state = SolveState::default();

        // apply input assumptions
        for idx in 0..self.assumptions.len() {
            if !self.assumption_active(idx) {
                continue;
            }
            let clause = self.assumptions[idx].clause.clone();
            self.apply_clause(&mut state, &clause, Some(idx), None)?;
        }

        // fixpoint: choose versions, fire conditions, resolve virtuals
        let mut iterations = 0u32;
        loop {
            iterations += 1;
            if iterations > MAX_RESTARTS {
                return Err(Conflict::new(
                    "solver exceeded maximum iterations".to_string(),
                ));
            }
            let mut progress = false;

            progress |= self.choose_versions(&mut state)?;
            progress |= self.fire_conditions(&mut state)?;
            progress |= self.resolve_virtuals(&mut state)?;
            progress |= self.enforce_requirements(&mut state)?;

            if !progress {
                break;
            }
        }

        self.finalize_variants(&mut state)?;
        self.check_conflicts(&mut state)?;
        self.check_externals(&mut state)?;
        Ok(state)
    }

    fn apply_clause(
        &self,
        state: &mut SolveState,
        clause: &AttrClause,
        support: Option<usize>,
        cause: Option<u64>,
    ) -> Result<(), Conflict> {
        let pkg = clause.pkg().to_string();
        match clause.name.as_str() {
            "node" => {
                if !self.g.virtuals.contains(&pkg) {
                    let node = state.node_mut(&pkg);
                    node.cause = node.cause.or(cause);
                    node.root_support = node.root_support.or(support);
                }
            }
            "virtual_node" => {
                // materialized when an edge needs it; remember constraints
                state.node_mut(&pkg);
            }
            "root" | "virtual_root" => {
                state.node_mut(&pkg).root = true;
            }
            "version" | "node_version_satisfies" => {
                let text = clause.args.get(1).and_then(Atom::as_str).unwrap_or("");
                let constraint: VersionConstraint = if clause.name == "version" {
                    VersionConstraint::exact(Version::new(text))
                } else {
                    text.parse().unwrap_or(VersionConstraint::Any)
                };
                let node = state.node_mut(&pkg);
                node.version_constraints.push(VersionConstraintEntry {
                    constraint,
                    support,
                });
                // a version chosen earlier may now be invalid
                if let Some(version) = node.version.clone() {
                    let entry = node.version_constraints.last().unwrap();
                    if !entry.constraint.satisfies(&version) {
                        let mut conflict = Conflict::new(format!(
                            "cannot satisfy '{}@{}'",
                            pkg, entry.constraint
                        ));
                        conflict.supports = supports_of(node, support);
                        conflict.pkgs = vec![pkg.clone()];
                        conflict.condition = cause;
                        conflict.revisable = Some(pkg);
                        return Err(conflict);
                    }
                }
            }
            "variant_set" | "variant_value" => {
                let vname = clause
                    .args
                    .get(1)
                    .and_then(Atom::as_str)
                    .unwrap_or("")
                    .to_string();
                let value = clause
                    .args
                    .get(2)
                    .and_then(Atom::as_str)
                    .unwrap_or("")
                    .to_string();
                let rendered = clause.render();
                let multi = self.variant_is_multi(&pkg, &vname);
                let node = state.node_mut(&pkg);
                let values = node.variant_values.entry(vname.clone()).or_default();
                if !values.iter().any(|(v, _, _)| v == &value) {
                    values.push((value.clone(), support, rendered.clone()));
                }
                if !multi && values.len() > 1 {
                    let supports: Vec<usize> =
                        values.iter().filter_map(|(_, s, _)| *s).collect();
                    let mut conflict = Conflict::new(format!(
                        "cannot select a single \"{vname}\" value for package \"{pkg}\""
                    ));
                    conflict.supports = supports;
                    conflict.pkgs = vec![pkg.clone()];
                    conflict.condition = cause;
                    return Err(conflict);
                }
            }
            "variant_default_value_from_cli" => {}
            "node_flag" | "node_flag_set" => {
                if let Some(nested) = clause.args.get(1).and_then(Atom::as_fact) {
                    let flag_type = nested.args[0].as_str().unwrap_or("").to_string();
                    let flag = nested.args[1].as_str().unwrap_or("").to_string();
                    let group = nested.args[2].as_str().unwrap_or("").to_string();
                    let source = nested.args[3].as_str().unwrap_or("").to_string();
                    let node = state.node_mut(&pkg);
                    if !node
                        .flags
                        .iter()
                        .any(|(t, f, g, s)| t == &flag_type && f == &flag && g == &group && s == &source)
                    {
                        node.flags.push((flag_type, flag, group, source));
                    }
                }
            }
            "node_platform" | "node_platform_set" => {
                let value = clause.args.get(1).and_then(Atom::as_str).unwrap_or("");
                set_arch_part(state, &pkg, ArchPart::Platform, value, support, cause)?;
            }
            "node_os" | "node_os_set" => {
                let value = clause.args.get(1).and_then(Atom::as_str).unwrap_or("");
                set_arch_part(state, &pkg, ArchPart::Os, value, support, cause)?;
            }
            "node_target" | "node_target_set" => {
                let value = clause.args.get(1).and_then(Atom::as_str).unwrap_or("");
                set_arch_part(state, &pkg, ArchPart::Target, value, support, cause)?;
            }
            "namespace" | "namespace_set" => {
                let value = clause.args.get(1).and_then(Atom::as_str).unwrap_or("");
                state.node_mut(&pkg).namespace = Some(value.to_string());
            }
            "hash" => {
                let hash = clause.args.get(1).and_then(Atom::as_str).unwrap_or("");
                self.apply_installed(state, &pkg, hash, support)?;
            }
            "dependency_holds" => {
                let dep = clause.args.get(1).and_then(Atom::as_str).unwrap_or("");
                let dtype = clause.args.get(2).and_then(Atom::as_str).unwrap_or("build");
                let depflag = deptype::str_to_flag(dtype).unwrap_or(deptype::BUILD);
                state.add_edge(&pkg, dep, depflag, false);
                let parent_support = state.nodes.get(&pkg).and_then(|n| n.root_support);
                if !self.g.virtuals.contains(dep) {
                    let node = state.node_mut(dep);
                    node.cause = node.cause.or(cause);
                    node.root_support = node.root_support.or(support.or(parent_support));
                } else {
                    state.node_mut(dep);
                }
            }
            "depends_on" => {
                let dep = clause.args.get(1).and_then(Atom::as_str).unwrap_or("");
                let dtype = clause.args.get(2).and_then(Atom::as_str).unwrap_or("build");
                let depflag = deptype::str_to_flag(dtype).unwrap_or(deptype::BUILD);
                state.add_edge(&pkg, dep, depflag, false);
                state.node_mut(dep);
            }
            "virtual_on_edge" => {
                let dep = clause.args.get(1).and_then(Atom::as_str).unwrap_or("");
                let virtual_name = clause.args.get(2).and_then(Atom::as_str).unwrap_or("");
                for edge in state.edges.iter_mut() {
                    if edge.parent == pkg && edge.child == dep {
                        if !edge.virtuals.iter().any(|v| v == virtual_name) {
                            edge.virtuals.push(virtual_name.to_string());
                        }
                    }
                }
            }
            "external_conditions_hold" => {
                let idx = clause.args.get(1).and_then(Atom::as_int).unwrap_or(0);
                let node = state.node_mut(&pkg);
                if node.external.is_none() {
                    node.external = Some(idx as usize);
                }
            }
            "direct_dependency" => {
                if let Some(nested) = clause.args.get(1).and_then(Atom::as_fact) {
                    // node_requirement(attr_name, dep, ...)
                    if nested.name == "node_requirement" && !nested.args.is_empty() {
                        let inner = AttrClause {
                            name: nested.args[0].as_str().unwrap_or("").to_string(),
                            args: nested.args[1..].to_vec(),
                        };
                        let dep = inner.pkg().to_string();
                        if !dep.is_empty() && dep != pkg {
                            state.add_edge(&pkg, &dep, deptype::BUILD, true);
                        }
                        self.apply_clause(state, &inner, support, cause)?;
                    }
                }
            }
            "propagate" | "track_dependencies" | "uses_virtual" | "provider_set"
            | "compatible_runtime" | "needs_libc" | "compatible_libc"
            | "concrete_build_dependency" | "package_hash" => {}
            other => {
                log::debug!("ignoring unknown clause attribute '{other}'");
            }
        }
        Ok(())
    }

    fn variant_is_multi(&self, pkg: &str, vname: &str) -> bool {
        if vname == "patches" {
            return true;
        }
        self.g
            .variant_defs
            .get(pkg)
            .map(|defs| {
                defs.iter()
                    .filter(|d| d.name == vname)
                    .next_back()
                    .map(|d| d.vtype == "multi")
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Mark a node as reused from an installed hash: its attributes (and
    /// its dependencies' hashes) are imposed from the recorded facts.
    fn apply_installed(
        &self,
        state: &mut SolveState,
        pkg: &str,
        hash: &str,
        support: Option<usize>,
    ) -> Result<(), Conflict> {
        {
            let node = state.node_mut(pkg);
            if node.reused_hash.as_deref() == Some(hash) {
                return Ok(());
            }
            node.reused_hash = Some(hash.to_string());
        }
        let Some((_, attrs)) = self.g.installed.get(hash) else {
            let mut conflict = Conflict::new(format!("no installed spec with hash {hash}"));
            conflict.supports = support.into_iter().collect();
            conflict.pkgs = vec![pkg.to_string()];
            return Err(conflict);
        };
        for clause in attrs.clone() {
            self.apply_clause(state, &clause, support, None)?;
        }
        Ok(())
    }

    /// Choose an assignment for every node that does not have a version
    /// yet, preferring an installed spec when reuse is enabled and one
    /// satisfies all constraints on the node.
    fn choose_versions(&mut self, state: &mut SolveState) -> Result<bool, Conflict> {
        let pkgs: Vec<String> = state
            .nodes
            .iter()
            .filter(|(pkg, node)| {
                node.version.is_none() && !self.g.virtuals.contains(*pkg)
            })
            .map(|(pkg, _)| pkg.clone())
            .collect();

        let mut progress = false;
        for pkg in pkgs {
            // reuse first: an installed hash consistent with the node's
            // constraints is cheaper than building
            if self.g.optimize_for_reuse
                && state
                    .nodes
                    .get(&pkg)
                    .map(|n| n.reused_hash.is_none() && n.external.is_none())
                    .unwrap_or(false)
            {
                let hashes = self.g.installed_by_pkg.get(&pkg).cloned().unwrap_or_default();
                let mut reused = false;
                for hash in hashes {
                    if self.installed_satisfies(&hash, &pkg, state) {
                        self.apply_installed(state, &pkg, &hash, None)?;
                        progress = true;
                        reused = true;
                        break;
                    }
                }
                if reused {
                    continue;
                }
            }
            let candidates = self.version_candidates(&pkg, state);
            let skip = self.version_pins.get(&pkg).copied().unwrap_or(0);
            match candidates.get(skip) {
                Some((version, weight)) => {
                    let deprecated = self
                        .g
                        .deprecated
                        .get(&pkg)
                        .map(|set| set.contains(&version.to_string()))
                        .unwrap_or(false);
                    let node = state.node_mut(&pkg);
                    node.version = Some(version.clone());
                    node.version_choice_weight = *weight;
                    node.deprecated_version_used = deprecated;
                    progress = true;
                }
                None => {
                    let node = &state.nodes[&pkg];
                    let constraints: Vec<String> = node
                        .version_constraints
                        .iter()
                        .map(|c| c.constraint.to_string())
                        .collect();
                    let mut conflict = Conflict::new(format!(
                        "no version of '{}' satisfies {}",
                        pkg,
                        constraints.join(" and ")
                    ));
                    conflict.supports = supports_of(node, None);
                    conflict.pkgs = vec![pkg.clone()];
                    conflict.condition = node.cause;
                    return Err(conflict);
                }
            }
        }
        Ok(progress)
    }

    /// True if the installed spec behind `hash` is consistent with every
    /// constraint currently recorded on the node.
    fn installed_satisfies(&self, hash: &str, pkg: &str, state: &SolveState) -> bool {
        let Some((_, attrs)) = self.g.installed.get(hash) else {
            return false;
        };
        let Some(node) = state.nodes.get(pkg) else {
            return false;
        };

        let installed_version = attrs.iter().find_map(|clause| {
            if clause.name == "version" && clause.pkg() == pkg {
                clause.args.get(1).and_then(Atom::as_str).map(Version::new)
            } else {
                None
            }
        });
        let Some(installed_version) = installed_version else {
            return false;
        };
        if !node
            .version_constraints
            .iter()
            .all(|c| c.constraint.satisfies(&installed_version))
        {
            return false;
        }

        // explicitly requested variant values must be present as-is
        for (vname, values) in &node.variant_values {
            for (value, _, _) in values {
                let present = attrs.iter().any(|clause| {
                    clause.name == "variant_value"
                        && clause.pkg() == pkg
                        && clause.args.get(1).and_then(Atom::as_str) == Some(vname.as_str())
                        && clause.args.get(2).and_then(Atom::as_str) == Some(value.as_str())
                });
                if !present {
                    return false;
                }
            }
        }
        true
    }

    /// Candidate versions for a package, best first, honoring declared
    /// weights, deprecation and all current constraints.
    fn version_candidates(&self, pkg: &str, state: &SolveState) -> Vec<(Version, i64)> {
        let node = state.nodes.get(pkg);
        let empty = Vec::new();
        let declared = self.g.versions.get(pkg).unwrap_or(&empty);
        let mut result: Vec<(Version, i64)> = Vec::new();
        for info in declared {
            if self.g.deprecated_not_allowed {
                let deprecated = self
                    .g
                    .deprecated
                    .get(pkg)
                    .map(|set| set.contains(&info.version.to_string()))
                    .unwrap_or(false);
                if deprecated {
                    continue;
                }
            }
            let ok = node
                .map(|n| {
                    n.version_constraints
                        .iter()
                        .all(|c| c.constraint.satisfies(&info.version))
                })
                .unwrap_or(true);
            if ok && !result.iter().any(|(v, _)| v == &info.version) {
                result.push((info.version.clone(), info.weight));
            }
        }
        result
    }

    /// Fire package conditions whose triggers hold. Returns true if any
    /// new condition was applied.
    fn fire_conditions(&mut self, state: &mut SolveState) -> Result<bool, Conflict> {
        let mut progress = false;
        let pkgs: Vec<String> = state.nodes.keys().cloned().collect();
        for pkg in &pkgs {
            let cond_ids = match self.g.conditions_by_pkg.get(pkg) {
                Some(ids) => ids.clone(),
                None => continue,
            };
            for cond_id in cond_ids {
                if state.applied_conditions.contains(&cond_id) {
                    continue;
                }
                let info = &self.g.conditions[&cond_id];
                let Some(trigger) = info.trigger else { continue };
                if !self.trigger_holds(trigger, state) {
                    continue;
                }
                state.applied_conditions.insert(cond_id);
                progress = true;

                // remember why downstream facts hold, for cause trees
                if let Some(node) = state.nodes.get(pkg) {
                    if let Some(parent_cause) = node.cause {
                        if parent_cause != cond_id {
                            state.causes.insert((cond_id, parent_cause));
                        }
                    }
                }

                if let Some(effect) = info.effect {
                    for clause in self.g.effects.get(&effect).cloned().into_iter().flatten() {
                        self.apply_clause(state, &clause, None, Some(cond_id))?;
                    }
                }
            }
        }
        Ok(progress)
    }

    fn trigger_holds(&self, trigger: u64, state: &SolveState) -> bool {
        let Some(clauses) = self.g.triggers.get(&trigger) else {
            return false;
        };
        clauses.iter().all(|clause| self.clause_holds(clause, state))
    }

    fn clause_holds(&self, clause: &AttrClause, state: &SolveState) -> bool {
        let pkg = clause.pkg();
        match clause.name.as_str() {
            "node" => state.nodes.contains_key(pkg),
            "virtual_node" => state.nodes.contains_key(pkg),
            "version" => {
                let wanted = clause.args.get(1).and_then(Atom::as_str).unwrap_or("");
                state
                    .nodes
                    .get(pkg)
                    .and_then(|n| n.version.as_ref())
                    .map(|v| v == &Version::new(wanted))
                    .unwrap_or(false)
            }
            "node_version_satisfies" => {
                let text = clause.args.get(1).and_then(Atom::as_str).unwrap_or("");
                let constraint: VersionConstraint = text.parse().unwrap_or(VersionConstraint::Any);
                state
                    .nodes
                    .get(pkg)
                    .and_then(|n| n.version.as_ref())
                    .map(|v| constraint.satisfies(v))
                    .unwrap_or(false)
            }
            "variant_value" => {
                let vname = clause.args.get(1).and_then(Atom::as_str).unwrap_or("");
                let value = clause.args.get(2).and_then(Atom::as_str).unwrap_or("");
                self.effective_variant_values(pkg, vname, state)
                    .iter()
                    .any(|v| v == value)
            }
            "node_platform" => {
                let wanted = clause.args.get(1).and_then(Atom::as_str).unwrap_or("");
                self.effective_platform(pkg, state) == wanted
            }
            "node_os" => {
                let wanted = clause.args.get(1).and_then(Atom::as_str).unwrap_or("");
                self.effective_os(pkg, state) == wanted
            }
            "node_target" => {
                let wanted = clause.args.get(1).and_then(Atom::as_str).unwrap_or("");
                self.effective_target(pkg, state) == wanted
            }
            "node_flag" => {
                let Some(nested) = clause.args.get(1).and_then(Atom::as_fact) else {
                    return false;
                };
                let flag_type = nested.args[0].as_str().unwrap_or("");
                let flag = nested.args[1].as_str().unwrap_or("");
                state
                    .nodes
                    .get(pkg)
                    .map(|n| n.flags.iter().any(|(t, f, _, _)| t == flag_type && f == flag))
                    .unwrap_or(false)
            }
            "depends_on" => {
                let dep = clause.args.get(1).and_then(Atom::as_str).unwrap_or("");
                state.has_edge(pkg, dep)
            }
            "hash" => {
                let hash = clause.args.get(1).and_then(Atom::as_str).unwrap_or("");
                state
                    .nodes
                    .get(pkg)
                    .map(|n| n.reused_hash.as_deref() == Some(hash))
                    .unwrap_or(false)
            }
            "namespace" => {
                let wanted = clause.args.get(1).and_then(Atom::as_str).unwrap_or("");
                let effective = state
                    .nodes
                    .get(pkg)
                    .and_then(|n| n.namespace.clone())
                    .or_else(|| self.g.namespaces.get(pkg).cloned())
                    .unwrap_or_default();
                effective == wanted
            }
            "direct_dependency" => {
                let Some(nested) = clause.args.get(1).and_then(Atom::as_fact) else {
                    return false;
                };
                if nested.name != "node_requirement" || nested.args.is_empty() {
                    return false;
                }
                let inner = AttrClause {
                    name: nested.args[0].as_str().unwrap_or("").to_string(),
                    args: nested.args[1..].to_vec(),
                };
                self.clause_holds(&inner, state)
            }
            "track_dependencies" | "uses_virtual" | "dependency_holds" => true,
            _ => {
                log::debug!("trigger clause '{}' treated as not holding", clause.name);
                false
            }
        }
    }

    fn effective_variant_values(&self, pkg: &str, vname: &str, state: &SolveState) -> Vec<String> {
        if let Some(node) = state.nodes.get(pkg) {
            if let Some(values) = node.variant_values.get(vname) {
                if !values.is_empty() {
                    return values.iter().map(|(v, _, _)| v.clone()).collect();
                }
            }
        }
        // configured default, then latest applicable package default
        if let Some(values) = self
            .g
            .config_variant_defaults
            .get(&(pkg.to_string(), vname.to_string()))
        {
            return values.clone();
        }
        self.g
            .variant_defs
            .get(pkg)
            .and_then(|defs| {
                defs.iter()
                    .filter(|d| d.name == vname)
                    .filter(|d| {
                        d.condition
                            .map(|cid| {
                                self.g.conditions[&cid]
                                    .trigger
                                    .map(|t| self.trigger_holds(t, state))
                                    .unwrap_or(false)
                            })
                            .unwrap_or(true)
                    })
                    .next_back()
                    .map(|d| d.defaults.clone())
            })
            .unwrap_or_default()
    }

    fn effective_platform(&self, pkg: &str, state: &SolveState) -> String {
        state
            .nodes
            .get(pkg)
            .and_then(|n| n.platform.clone())
            .or_else(|| self.g.platform_default.clone())
            .unwrap_or_default()
    }

    fn effective_os(&self, pkg: &str, state: &SolveState) -> String {
        state
            .nodes
            .get(pkg)
            .and_then(|n| n.os.clone())
            .or_else(|| {
                self.g
                    .os_weights
                    .iter()
                    .min_by_key(|(_, w)| **w)
                    .map(|(os, _)| os.clone())
            })
            .unwrap_or_default()
    }

    fn effective_target(&self, pkg: &str, state: &SolveState) -> String {
        state
            .nodes
            .get(pkg)
            .and_then(|n| n.target.clone())
            .or_else(|| {
                self.g
                    .target_weights
                    .iter()
                    .min_by_key(|(_, w)| **w)
                    .map(|(t, _)| t.clone())
            })
            .unwrap_or_default()
    }

    /// Replace virtual dependency edges with provider edges, and resolve
    /// virtual roots to a provider node.
    fn resolve_virtuals(&mut self, state: &mut SolveState) -> Result<bool, Conflict> {
        let mut progress = false;

        let virtual_roots: Vec<String> = state
            .nodes
            .iter()
            .filter(|(pkg, node)| {
                self.g.virtuals.contains(*pkg)
                    && node.root
                    && !state.provider_choices.contains_key(*pkg)
            })
            .map(|(pkg, _)| pkg.clone())
            .collect();
        for virtual_name in virtual_roots {
            let Some(provider) = self.choose_provider(&virtual_name, state) else {
                let support = state
                    .nodes
                    .get(&virtual_name)
                    .and_then(|n| n.root_support);
                let mut conflict = Conflict::new(format!(
                    "no provider satisfies virtual '{virtual_name}'"
                ));
                conflict.supports = support.into_iter().collect();
                conflict.pkgs = vec![virtual_name.clone()];
                return Err(conflict);
            };
            state
                .provider_choices
                .insert(virtual_name.clone(), provider.clone());
            let support = state
                .nodes
                .get(&virtual_name)
                .and_then(|n| n.root_support);
            let node = state.node_mut(&provider);
            node.root = true;
            node.root_support = node.root_support.or(support);
            progress = true;
        }

        let virtual_edges: Vec<(String, String, DepFlag, bool)> = state
            .edges
            .iter()
            .filter(|e| self.g.virtuals.contains(&e.child))
            .map(|e| (e.parent.clone(), e.child.clone(), e.depflag, e.direct))
            .collect();

        for (parent, virtual_name, depflag, direct) in virtual_edges {
            let provider = match state.provider_choices.get(&virtual_name) {
                Some(provider) => provider.clone(),
                None => {
                    let Some(provider) = self.choose_provider(&virtual_name, state) else {
                        let support = state
                            .nodes
                            .get(&virtual_name)
                            .and_then(|n| n.root_support)
                            .or_else(|| {
                                state.nodes.get(&parent).and_then(|n| n.root_support)
                            });
                        let mut conflict = Conflict::new(format!(
                            "no provider satisfies virtual '{virtual_name}'"
                        ));
                        conflict.supports = support.into_iter().collect();
                        conflict.pkgs = vec![parent.clone(), virtual_name.clone()];
                        conflict.condition =
                            state.nodes.get(&parent).and_then(|n| n.cause);
                        return Err(conflict);
                    };
                    state
                        .provider_choices
                        .insert(virtual_name.clone(), provider.clone());
                    provider
                }
            };

            // rewrite the edge to the provider; the constraints recorded
            // on the virtual node were checked against the provider's
            // provided version in choose_provider
            let mut changed = false;
            for edge in state.edges.iter_mut() {
                if edge.parent == parent && edge.child == virtual_name {
                    edge.child = provider.clone();
                    edge.depflag |= depflag;
                    edge.direct |= direct;
                    if !edge.virtuals.contains(&virtual_name) {
                        edge.virtuals.push(virtual_name.clone());
                    }
                    changed = true;
                }
            }
            if changed {
                progress = true;
                let parent_support = state.nodes.get(&parent).and_then(|n| n.root_support);
                let parent_cause = state.nodes.get(&parent).and_then(|n| n.cause);
                let node = state.node_mut(&provider);
                node.root_support = node.root_support.or(parent_support);
                node.cause = node.cause.or(parent_cause);
            }
        }
        Ok(progress)
    }

    /// Deterministic provider choice: configured weight, then name order,
    /// filtered to providers whose provided virtual version can satisfy
    /// the constraints recorded on the virtual node.
    fn choose_provider(&self, virtual_name: &str, state: &SolveState) -> Option<String> {
        let candidates = self.g.possible_providers.get(virtual_name)?;
        let mut ordered: Vec<String> = candidates.iter().cloned().collect();
        ordered.sort_by_key(|pkg| {
            (
                self.g
                    .provider_weights
                    .get(&(virtual_name.to_string(), pkg.clone()))
                    .copied()
                    .unwrap_or(i64::MAX),
                pkg.clone(),
            )
        });

        let virtual_constraints: Vec<VersionConstraint> = state
            .nodes
            .get(virtual_name)
            .map(|n| {
                n.version_constraints
                    .iter()
                    .map(|c| c.constraint.clone())
                    .collect()
            })
            .unwrap_or_default();

        for pkg in ordered {
            if virtual_constraints.is_empty() {
                return Some(pkg);
            }
            // the provided virtual version must satisfy the constraints;
            // a provider without version information only satisfies
            // unconstrained virtuals
            let conditions = self.g.provider_conditions.get(virtual_name);
            for (provider, cid) in conditions.into_iter().flatten() {
                if provider != &pkg {
                    continue;
                }
                let Some(effect) = self.g.conditions[cid].effect else {
                    continue;
                };
                for clause in self.g.effects.get(&effect).into_iter().flatten() {
                    if clause.pkg() != virtual_name {
                        continue;
                    }
                    let provided: Option<Version> = match clause.name.as_str() {
                        "version" => clause
                            .args
                            .get(1)
                            .and_then(Atom::as_str)
                            .map(Version::new),
                        "node_version_satisfies" => clause
                            .args
                            .get(1)
                            .and_then(Atom::as_str)
                            .and_then(|t| t.parse::<VersionConstraint>().ok())
                            .and_then(|c| c.mentioned_versions().into_iter().next()),
                        _ => None,
                    };
                    if let Some(provided) = provided {
                        if virtual_constraints.iter().all(|c| c.satisfies(&provided)) {
                            return Some(pkg);
                        }
                    }
                }
            }
        }
        None
    }

    /// Enforce requirement groups on active nodes.
    fn enforce_requirements(&mut self, state: &mut SolveState) -> Result<bool, Conflict> {
        let mut progress = false;
        for group in &self.g.requirement_groups {
            if !state.nodes.contains_key(&group.pkg) {
                continue;
            }
            if self.g.virtuals.contains(&group.pkg) {
                continue;
            }
            if let Some(cid) = group.condition {
                let holds = self.g.conditions[&cid]
                    .trigger
                    .map(|t| self.trigger_holds(t, state))
                    .unwrap_or(false);
                if !holds {
                    continue;
                }
            }

            // satisfied already?
            let satisfied = group.members.iter().any(|(member, _)| {
                self.g.conditions[member]
                    .trigger
                    .map(|t| self.trigger_holds(t, state))
                    .unwrap_or(false)
            });
            if satisfied {
                continue;
            }

            let key = (group.pkg.clone(), group.gid);
            let pin = self.requirement_pins.get(&key).copied().unwrap_or(0);
            match group.members.get(pin) {
                Some((member, _)) => {
                    if state.applied_conditions.contains(member) {
                        continue;
                    }
                    state.applied_conditions.insert(*member);
                    progress = true;
                    if let Some(effect) = self.g.conditions[member].effect {
                        let clauses: Vec<AttrClause> = self
                            .g
                            .effects
                            .get(&effect)
                            .cloned()
                            .unwrap_or_default();
                        for clause in clauses {
                            if let Err(mut conflict) =
                                self.apply_clause(state, &clause, None, Some(*member))
                            {
                                // try the next member before giving up
                                if pin + 1 < group.members.len() {
                                    self.requirement_pins.insert(key.clone(), pin + 1);
                                    conflict.revisable = None;
                                    conflict.supports.clear();
                                    conflict.pkgs = vec![group.pkg.clone()];
                                    conflict.retry = true;
                                }
                                return Err(conflict);
                            }
                        }
                    }
                }
                None => {
                    let message = group.message.clone().unwrap_or_else(|| {
                        format!(
                            "cannot satisfy the requirements of package '{}'",
                            group.pkg
                        )
                    });
                    state.errors.push(Fact::new(
                        "error",
                        atoms![1100usize, "{0}", message],
                    ));
                }
            }
        }
        Ok(progress)
    }

    /// Resolve final variant values, apply defaults, and verify that every
    /// chosen value is a possible value of some applicable definition.
    fn finalize_variants(&mut self, state: &mut SolveState) -> Result<(), Conflict> {
        let pkgs: Vec<String> = state.nodes.keys().cloned().collect();
        for pkg in pkgs {
            if self.g.virtuals.contains(&pkg) {
                continue;
            }
            if state.nodes[&pkg].reused_hash.is_some() {
                continue;
            }
            let defs = self.g.variant_defs.get(&pkg).cloned().unwrap_or_default();
            for def in &defs {
                let applicable = def
                    .condition
                    .map(|cid| {
                        self.g.conditions[&cid]
                            .trigger
                            .map(|t| self.trigger_holds(t, state))
                            .unwrap_or(false)
                    })
                    .unwrap_or(true);
                if !applicable {
                    continue;
                }
                let effective = self.effective_variant_values(&pkg, &def.name, state);
                // check values are possible
                for value in &effective {
                    if !def.possible.is_empty() && !def.possible.contains(value) {
                        state.errors.push(Fact::new(
                            "error",
                            atoms![
                                1100usize,
                                "'{0}' is not a valid value for variant '{1}' of package '{2}'",
                                value.as_str(),
                                def.name.as_str(),
                                pkg.as_str()
                            ],
                        ));
                    }
                }
                // record the effective assignment so it lands in the model
                let node = state.node_mut(&pkg);
                let values = node.variant_values.entry(def.name.clone()).or_default();
                if values.is_empty() {
                    for value in effective {
                        values.push((value, None, String::new()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Evaluate declared conflicts; a firing conflict is an error fact in
    /// an otherwise satisfiable model unless a version revision can avoid
    /// it.
    fn check_conflicts(&mut self, state: &mut SolveState) -> Result<(), Conflict> {
        for (pkg, conflicts) in &self.g.conflicts {
            if !state.nodes.contains_key(pkg) {
                continue;
            }
            for (trigger_cond, when_cond, msg) in conflicts {
                let trigger_holds = self.g.conditions[trigger_cond]
                    .trigger
                    .map(|t| self.trigger_holds(t, state))
                    .unwrap_or(false);
                let when_holds = self.g.conditions[when_cond]
                    .trigger
                    .map(|t| self.trigger_holds(t, state))
                    .unwrap_or(false);
                if trigger_holds && when_holds {
                    // prefer another version if one is available
                    let has_alternative = {
                        let pin = self.version_pins.get(pkg).copied().unwrap_or(0);
                        pin + 1 < self.version_candidates(pkg, state).len()
                    };
                    if has_alternative {
                        let mut conflict = Conflict::new(msg.clone());
                        conflict.pkgs = vec![pkg.clone()];
                        conflict.condition = Some(*trigger_cond);
                        conflict.revisable = Some(pkg.clone());
                        return Err(conflict);
                    }
                    let mut args = atoms![1000usize, "{0}", msg.as_str()];
                    args.push(Atom::Str("startcauses".to_string()));
                    args.push(Atom::Int(*trigger_cond as i64));
                    args.push(Atom::Int(0));
                    state.errors.push(Fact::new("error", args));
                }
            }
        }
        Ok(())
    }

    /// Non-buildable packages must have selected an external.
    fn check_externals(&mut self, state: &mut SolveState) -> Result<(), Conflict> {
        for pkg in &self.g.buildable_false {
            if let Some(node) = state.nodes.get(pkg) {
                if node.external.is_none() && node.reused_hash.is_none() {
                    state.errors.push(Fact::new(
                        "error",
                        atoms![
                            1200usize,
                            "'{0}' is not buildable and no external satisfies its constraints",
                            pkg.as_str()
                        ],
                    ));
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // model construction
    // -----------------------------------------------------------------

    fn build_model(&self, state: &SolveState) -> Model {
        let mut facts: Vec<Fact> = Vec::new();

        for (pkg, node) in &state.nodes {
            if self.g.virtuals.contains(pkg) {
                continue;
            }
            let arg = NodeArgument::make(pkg);

            if let Some(hash) = &node.reused_hash {
                facts.push(Fact::attr("hash", atoms![arg.clone(), hash]));
            }
            facts.push(Fact::attr("node", atoms![arg.clone()]));

            if let Some(ns) = state
                .nodes
                .get(pkg)
                .and_then(|n| n.namespace.clone())
                .or_else(|| self.g.namespaces.get(pkg).cloned())
            {
                facts.push(Fact::attr("namespace", atoms![arg.clone(), ns]));
            }
            if let Some(version) = &node.version {
                facts.push(Fact::attr("version", atoms![arg.clone(), version]));
                if node.deprecated_version_used {
                    facts.push(Fact::attr("deprecated", atoms![arg.clone(), version]));
                }
            }
            facts.push(Fact::attr(
                "node_platform",
                atoms![arg.clone(), self.effective_platform(pkg, state)],
            ));
            facts.push(Fact::attr(
                "node_os",
                atoms![arg.clone(), self.effective_os(pkg, state)],
            ));
            facts.push(Fact::attr(
                "node_target",
                atoms![arg.clone(), self.effective_target(pkg, state)],
            ));

            for (vname, values) in &node.variant_values {
                let vtype = if self.variant_is_multi(pkg, vname) {
                    "multi"
                } else if values.iter().all(|(v, _, _)| v == "true" || v == "false") {
                    "bool"
                } else {
                    "single"
                };
                for (value, _, _) in values {
                    facts.push(Fact::attr(
                        "variant_selected",
                        atoms![arg.clone(), vname, value, vtype],
                    ));
                }
            }

            for (flag_type, flag, group, source) in &node.flags {
                let nested = Fact::new("node_flag", atoms![flag_type, flag, group, source]);
                facts.push(Fact::attr("node_flag", atoms![arg.clone(), nested]));
            }

            if let Some(idx) = node.external {
                facts.push(Fact::attr(
                    "external_spec_selected",
                    atoms![arg.clone(), idx],
                ));
            }
        }

        for edge in &state.edges {
            if self.g.virtuals.contains(&edge.child) {
                continue;
            }
            let parent = NodeArgument::make(&edge.parent);
            let child = NodeArgument::make(&edge.child);
            for flag in deptype::flag_to_parts(edge.depflag) {
                facts.push(Fact::attr(
                    "depends_on",
                    atoms![
                        parent.clone(),
                        child.clone(),
                        deptype::flag_to_str(flag)
                    ],
                ));
            }
            for virtual_name in &edge.virtuals {
                facts.push(Fact::attr(
                    "virtual_on_edge",
                    atoms![parent.clone(), child.clone(), virtual_name],
                ));
            }
        }

        // errors and cause chains
        facts.extend(state.errors.iter().cloned());
        for (effect, cause) in &state.causes {
            facts.push(Fact::new(
                "condition_cause",
                atoms![*effect as usize, 0usize, *cause as usize, 0usize],
            ));
        }
        for (cid, reason) in &self.g.reasons {
            facts.push(Fact::new(
                "condition_reason",
                atoms![*cid as usize, reason],
            ));
        }

        // optimization criteria, high priority first; all in the fixed
        // band so they carry no separate build counterpart
        let criteria: Vec<(i64, &str, i64)> = vec![
            (150, "number of packages to build (vs. reuse)", self.cost_builds(state)),
            (140, "deprecated versions used", self.cost_deprecated(state)),
            (130, "version weight", self.cost_version_weight(state)),
            (125, "preferred providers", self.cost_providers(state)),
            (120, "number of non-default variants", self.cost_variants(state)),
            (115, "non-preferred OS's", self.cost_os(state)),
            (110, "non-preferred targets", self.cost_targets(state)),
        ];
        let mut cost = Vec::new();
        for (priority, name, value) in &criteria {
            facts.push(Fact::new(
                "opt_criterion",
                atoms![*priority as usize, *name],
            ));
            cost.push(*value);
        }

        Model { cost, facts }
    }

    fn cost_builds(&self, state: &SolveState) -> i64 {
        state
            .nodes
            .values()
            .filter(|n| {
                !self.g.virtuals.contains(&n.pkg)
                    && n.reused_hash.is_none()
                    && n.external.is_none()
            })
            .count() as i64
    }

    fn cost_deprecated(&self, state: &SolveState) -> i64 {
        state
            .nodes
            .values()
            .filter(|n| n.deprecated_version_used)
            .count() as i64
    }

    fn cost_version_weight(&self, state: &SolveState) -> i64 {
        state
            .nodes
            .values()
            .filter(|n| n.reused_hash.is_none())
            .map(|n| n.version_choice_weight)
            .sum()
    }

    fn cost_providers(&self, state: &SolveState) -> i64 {
        state
            .provider_choices
            .iter()
            .map(|(virtual_name, provider)| {
                self.g
                    .provider_weights
                    .get(&(virtual_name.clone(), provider.clone()))
                    .copied()
                    .unwrap_or(0)
            })
            .sum()
    }

    fn cost_variants(&self, state: &SolveState) -> i64 {
        let mut count = 0;
        for (pkg, node) in &state.nodes {
            for (vname, values) in &node.variant_values {
                let defaults: Vec<String> = self
                    .g
                    .variant_defs
                    .get(pkg)
                    .and_then(|defs| {
                        defs.iter()
                            .filter(|d| &d.name == vname)
                            .next_back()
                            .map(|d| d.defaults.clone())
                    })
                    .unwrap_or_default();
                let actual: Vec<&String> = values.iter().map(|(v, _, _)| v).collect();
                if !defaults.is_empty() && actual.len() == defaults.len() {
                    if actual.iter().zip(defaults.iter()).all(|(a, b)| *a == b) {
                        continue;
                    }
                }
                if defaults.is_empty() && actual.is_empty() {
                    continue;
                }
                count += 1;
            }
        }
        count
    }

    fn cost_os(&self, state: &SolveState) -> i64 {
        state
            .nodes
            .keys()
            .map(|pkg| {
                let os = self.effective_os(pkg, state);
                self.g.os_weights.get(&os).copied().unwrap_or(0)
            })
            .sum()
    }

    fn cost_targets(&self, state: &SolveState) -> i64 {
        state
            .nodes
            .keys()
            .map(|pkg| {
                let target = self.effective_target(pkg, state);
                self.g.target_weights.get(&target).copied().unwrap_or(0)
            })
            .sum()
    }
}

fn supports_of(node: &NodeState, extra: Option<usize>) -> Vec<usize> {
    let mut supports: Vec<usize> = node
        .version_constraints
        .iter()
        .filter_map(|c| c.support)
        .collect();
    if let Some(extra) = extra {
        if !supports.contains(&extra) {
            supports.push(extra);
        }
    }
    if let Some(root) = node.root_support {
        if !supports.contains(&root) {
            supports.push(root);
        }
    }
    supports
}

enum ArchPart {
    Platform,
    Os,
    Target,
}

fn set_arch_part(
    state: &mut SolveState,
    pkg: &str,
    part: ArchPart,
    value: &str,
    support: Option<usize>,
    cause: Option<u64>,
) -> Result<(), Conflict> {
    let node = state.node_mut(pkg);
    let current = match part {
        ArchPart::Platform => node.platform.clone(),
        ArchPart::Os => node.os.clone(),
        ArchPart::Target => node.target.clone(),
    };
    if let Some(existing) = current {
        if existing != value {
            let mut conflict =
                Conflict::new(format!("conflicting architecture values for '{pkg}'"));
            conflict.supports = supports_of(node, support);
            conflict.pkgs = vec![pkg.to_string()];
            conflict.condition = cause;
            return Err(conflict);
        }
        return Ok(());
    }
    let slot = match part {
        ArchPart::Platform => &mut node.platform,
        ArchPart::Os => &mut node.os,
        ArchPart::Target => &mut node.target,
    };
    *slot = Some(value.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConcretizerConfig;
    use crate::package::{PackageDef, Repo};
    use crate::platform::PlatformInfo;
    use crate::solver::setup::SolverSetup;
    use crate::spec::Spec;

    fn solve(repo: &Repo, specs: &[&str]) -> BackendOutcome {
        let platform = PlatformInfo::default();
        let config = ConcretizerConfig::default();
        let mut setup = SolverSetup::new(repo, &platform, &[], &config);
        let specs: Vec<Spec> = specs.iter().map(|s| Spec::parse(s).unwrap()).collect();
        let program = setup.setup(&specs, &[], false).unwrap();
        GreedyBackend::new().solve(&program, &BackendRequest::default())
    }

    fn model_has(model: &Model, needle: &str) -> bool {
        model.facts.iter().any(|f| f.to_string().contains(needle))
    }

    #[test]
    fn test_simple_solve() {
        let repo = Repo::new()
            .with(PackageDef::new("a").with_version("2.0").depends_on("b", ""))
            .with(PackageDef::new("b").with_version("1.0"));
        let outcome = solve(&repo, &["a"]);
        assert!(outcome.satisfiable);
        let model = &outcome.models[0];
        assert!(model_has(model, "attr(\"version\",node(0,\"a\"),\"2.0\")"));
        assert!(model_has(model, "attr(\"version\",node(0,\"b\"),\"1.0\")"));
        assert!(model_has(model, "attr(\"depends_on\",node(0,\"a\"),node(0,\"b\"),\"build\")"));
    }

    #[test]
    fn test_deprecated_version_avoided() {
        let repo = Repo::new()
            .with(PackageDef::new("a").with_version("1.0").depends_on("b", ""))
            .with(
                PackageDef::new("b")
                    .with_deprecated_version("1.0")
                    .with_version("0.9"),
            );
        let outcome = solve(&repo, &["a"]);
        assert!(outcome.satisfiable);
        assert!(model_has(&outcome.models[0], "attr(\"version\",node(0,\"b\"),\"0.9\")"));
    }

    #[test]
    fn test_version_constraint_from_input() {
        let repo = Repo::new()
            .with(PackageDef::new("x").with_version("1.0").depends_on("y", ""))
            .with(PackageDef::new("y").with_version("3.0").with_version("2.0"));
        let outcome = solve(&repo, &["x ^y@=2.0"]);
        assert!(outcome.satisfiable);
        assert!(model_has(&outcome.models[0], "attr(\"version\",node(0,\"y\"),\"2.0\")"));
    }

    #[test]
    fn test_self_conflicting_input_is_unsat() {
        let repo = Repo::new().with(
            PackageDef::new("a")
                .with_version("1.0")
                .with_variant(crate::package::VariantDef::bool("foo", false)),
        );
        let outcome = solve(&repo, &["a +foo ~foo"]);
        assert!(!outcome.satisfiable);
        assert!(!outcome.cores.is_empty());
        assert!(!outcome.cores[0].is_empty());
    }

    #[test]
    fn test_conditional_dependency() {
        let repo = Repo::new()
            .with(
                PackageDef::new("a")
                    .with_version("1.0")
                    .with_variant(crate::package::VariantDef::bool("ssl", false))
                    .depends_on_when("openssl", "", Some("+ssl")),
            )
            .with(PackageDef::new("openssl").with_version("3.0"));
        let without = solve(&repo, &["a"]);
        assert!(without.satisfiable);
        assert!(!model_has(&without.models[0], "node(0,\"openssl\")"));

        let with = solve(&repo, &["a +ssl"]);
        assert!(with.satisfiable);
        assert!(model_has(&with.models[0], "attr(\"node\",node(0,\"openssl\"))"));
    }

    #[test]
    fn test_virtual_provider_resolution() {
        let repo = Repo::new()
            .with(PackageDef::new("app").with_version("1.0").depends_on("ssl", ""))
            .with(PackageDef::new("openssl").with_version("3.0").provides("ssl@3.0", None))
            .with(PackageDef::new("libressl").with_version("3.8").provides("ssl@3.8", None));
        let outcome = solve(&repo, &["app"]);
        assert!(outcome.satisfiable);
        let model = &outcome.models[0];
        // deterministic choice: name order without configured weights
        assert!(model_has(model, "attr(\"virtual_on_edge\",node(0,\"app\"),node(0,\"libressl\"),\"ssl\")"));
    }

    #[test]
    fn test_package_conflict_reports_error() {
        let repo = Repo::new().with(
            PackageDef::new("a")
                .with_version("1.0")
                .conflicts_with("a@1.0", None, Some("a 1.0 is broken")),
        );
        let outcome = solve(&repo, &["a@=1.0"]);
        assert!(outcome.satisfiable);
        assert!(model_has(&outcome.models[0], "a 1.0 is broken"));
    }

    #[test]
    fn test_conflict_avoided_by_other_version() {
        let repo = Repo::new().with(
            PackageDef::new("a")
                .with_version("2.0")
                .with_version("1.0")
                .conflicts_with("a@2.0", None, None),
        );
        let outcome = solve(&repo, &["a"]);
        assert!(outcome.satisfiable);
        let model = &outcome.models[0];
        assert!(model_has(model, "attr(\"version\",node(0,\"a\"),\"1.0\")"));
        assert!(!model.facts.iter().any(|f| f.name == "error"));
    }
}
