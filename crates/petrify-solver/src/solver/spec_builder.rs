//! The answer interpreter: rebuilds concrete specs from the flat
//! attribute tuples of the winning model.
//!
//! Attribute kinds form a closed enumeration, matched exhaustively;
//! attributes that exist purely to drive the solve are one explicit
//! `Ignored` variant, and genuinely unknown attributes are logged and
//! skipped (non-fatal). Processing order is attribute-kind-dependent:
//! `hash` first (reused specs short-circuit reconstruction), then `node`,
//! then everything else, with `external_spec_selected` and
//! `virtual_on_edge` last.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use petrify_version::{Version, VersionConstraint};

use crate::config::ConcretizerConfig;
use crate::deptype::{self, DepFlag};
use crate::error::{ConcretizeError, Result};
use crate::package::PackageRepository;
use crate::solver::condition::ConstraintOrigin;
use crate::solver::fact::{Atom, Fact, NodeArgument};
use crate::spec::{
    extend_flag_list, tokenize_flags, CompilerFlag, ConcreteSpecsByHash, Spec, Variant,
    VariantValue, FLAG_TYPES,
};

/// One attribute from the model, decoded into typed arguments.
#[derive(Debug, Clone)]
enum AttrAction {
    Hash(NodeArgument, String),
    Node(NodeArgument),
    Namespace(NodeArgument, String),
    Version(NodeArgument, Version),
    VariantSelected(NodeArgument, String, String, String),
    NodePlatform(NodeArgument, String),
    NodeOs(NodeArgument, String),
    NodeTarget(NodeArgument, String),
    NodeFlag(NodeArgument, CompilerFlag, String),
    DependsOn(NodeArgument, NodeArgument, DepFlag),
    VirtualOnEdge(NodeArgument, NodeArgument, String),
    ExternalSpecSelected(NodeArgument, usize),
    Deprecated(NodeArgument, String),
    SpliceAtHash(NodeArgument, NodeArgument, String, String),
    /// Attributes that drive the solve but carry no reconstruction
    /// semantics.
    Ignored,
    Unknown(String),
}

/// Attributes that are expected in models and deliberately not acted on.
const IGNORED_ATTRIBUTES: [&str; 12] = [
    "depends_on_virtual",
    "external_conditions_hold",
    "dependency_holds",
    "needs_libc",
    "compatible_libc",
    "compatible_runtime",
    "package_hash",
    "root",
    "track_dependencies",
    "uses_virtual",
    "virtual_node",
    "virtual_root",
];

fn node_arg(atom: Option<&Atom>) -> Result<NodeArgument> {
    atom.and_then(Atom::as_node).cloned().ok_or_else(|| {
        ConcretizeError::Internal(
            "expected a node argument in a model attribute; the solver is ground truth here"
                .to_string(),
        )
    })
}

fn str_arg(atom: Option<&Atom>) -> Result<String> {
    atom.and_then(Atom::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            ConcretizeError::Internal("expected a string argument in a model attribute".to_string())
        })
}

impl AttrAction {
    fn decode(fact: &Fact) -> Result<AttrAction> {
        let Some(name) = fact.attr_name() else {
            return Ok(AttrAction::Ignored);
        };
        if IGNORED_ATTRIBUTES.contains(&name)
            || name.ends_with("_set")
            || name.ends_with("_satisfies")
            || name.ends_with("_propagate")
        {
            return Ok(AttrAction::Ignored);
        }
        let args = fact.attr_args();
        let action = match name {
            "hash" => AttrAction::Hash(node_arg(args.first())?, str_arg(args.get(1))?),
            "node" => AttrAction::Node(node_arg(args.first())?),
            "namespace" => AttrAction::Namespace(node_arg(args.first())?, str_arg(args.get(1))?),
            "version" => AttrAction::Version(
                node_arg(args.first())?,
                Version::new(&str_arg(args.get(1))?),
            ),
            "variant_selected" => AttrAction::VariantSelected(
                node_arg(args.first())?,
                str_arg(args.get(1))?,
                str_arg(args.get(2))?,
                str_arg(args.get(3))?,
            ),
            "node_platform" => {
                AttrAction::NodePlatform(node_arg(args.first())?, str_arg(args.get(1))?)
            }
            "node_os" => AttrAction::NodeOs(node_arg(args.first())?, str_arg(args.get(1))?),
            "node_target" => {
                AttrAction::NodeTarget(node_arg(args.first())?, str_arg(args.get(1))?)
            }
            "node_flag" => {
                let nested = args.get(1).and_then(Atom::as_fact).ok_or_else(|| {
                    ConcretizeError::Internal("node_flag without flag payload".to_string())
                })?;
                let flag_type = str_arg(nested.args.first())?;
                let flag = CompilerFlag::new(
                    &str_arg(nested.args.get(1))?,
                    false,
                    &str_arg(nested.args.get(2))?,
                    &str_arg(nested.args.get(3))?,
                );
                AttrAction::NodeFlag(node_arg(args.first())?, flag, flag_type)
            }
            "depends_on" => {
                let dtype = str_arg(args.get(2))?;
                AttrAction::DependsOn(
                    node_arg(args.first())?,
                    node_arg(args.get(1))?,
                    deptype::str_to_flag(&dtype).unwrap_or(deptype::BUILD),
                )
            }
            "virtual_on_edge" => AttrAction::VirtualOnEdge(
                node_arg(args.first())?,
                node_arg(args.get(1))?,
                str_arg(args.get(2))?,
            ),
            "external_spec_selected" => {
                let idx = args.get(1).and_then(Atom::as_int).unwrap_or(0);
                AttrAction::ExternalSpecSelected(node_arg(args.first())?, idx as usize)
            }
            "deprecated" => {
                AttrAction::Deprecated(node_arg(args.first())?, str_arg(args.get(1))?)
            }
            "splice_at_hash" => AttrAction::SpliceAtHash(
                node_arg(args.first())?,
                node_arg(args.get(1))?,
                str_arg(args.get(2))?,
                str_arg(args.get(3))?,
            ),
            other => AttrAction::Unknown(other.to_string()),
        };
        Ok(action)
    }

    /// Processing rank; lower runs earlier.
    fn order_key(&self) -> i32 {
        match self {
            // hash attributes imply entire concrete specs
            AttrAction::Hash(..) => -5,
            // node attributes instantiate nodes
            AttrAction::Node(..) => -4,
            // evaluated last, so all nodes are fully constructed
            AttrAction::ExternalSpecSelected(..) => 1,
            AttrAction::VirtualOnEdge(..) => 2,
            _ => 0,
        }
    }
}

enum Slot {
    /// A reused, already-concrete spec; further actions are skipped
    /// except splice bookkeeping.
    Reused(Arc<Spec>),
    Building(Spec),
}

struct EdgeData {
    parent: NodeArgument,
    child: NodeArgument,
    depflag: DepFlag,
    virtuals: Vec<String>,
}

/// A pending "splice at hash" request from the model.
struct SpliceRequest {
    parent: NodeArgument,
    child_name: String,
    child_hash: String,
}

pub struct SpecBuilder<'a> {
    repo: &'a dyn PackageRepository,
    config: &'a ConcretizerConfig,
    hash_lookup: &'a ConcreteSpecsByHash,
    slots: IndexMap<NodeArgument, Slot>,
    edges: Vec<EdgeData>,
    splices: Vec<SpliceRequest>,
}

impl<'a> SpecBuilder<'a> {
    pub fn new(
        repo: &'a dyn PackageRepository,
        config: &'a ConcretizerConfig,
        hash_lookup: &'a ConcreteSpecsByHash,
    ) -> SpecBuilder<'a> {
        SpecBuilder {
            repo,
            config,
            hash_lookup,
            slots: IndexMap::new(),
            edges: Vec::new(),
            splices: Vec::new(),
        }
    }

    /// The canonical node for a package name.
    pub fn make_node(pkg: &str) -> NodeArgument {
        NodeArgument::make(pkg)
    }

    /// Consume the model's attribute tuples and reconstruct one concrete
    /// spec per node.
    pub fn build_specs(
        &mut self,
        model_facts: &[Fact],
    ) -> Result<IndexMap<NodeArgument, Arc<Spec>>> {
        let mut actions: Vec<AttrAction> = Vec::new();
        for fact in model_facts {
            if fact.name != "attr" {
                continue;
            }
            actions.push(AttrAction::decode(fact)?);
        }
        actions.sort_by_key(AttrAction::order_key);

        for action in actions {
            self.apply(action)?;
        }

        self.reorder_flags()?;
        self.inject_patches()?;

        let mut specs = self.assemble()?;

        // hash unification: structurally identical subtrees become one
        // physical object
        let mut unifier = ConcreteSpecsByHash::new();
        for spec in specs.values() {
            unifier.add(spec)?;
        }
        for (_, spec) in specs.iter_mut() {
            let hash = spec.dag_hash().expect("assembled specs are concrete");
            *spec = unifier
                .get(hash)
                .expect("all assembled specs were unified")
                .clone();
        }

        let specs = self.execute_splices_at_hash(specs)?;
        let specs = self.execute_explicit_splices(specs)?;
        Ok(specs)
    }

    fn building_mut(&mut self, node: &NodeArgument) -> Result<Option<&mut Spec>> {
        match self.slots.get_mut(node) {
            Some(Slot::Building(spec)) => Ok(Some(spec)),
            // concrete specs are immutable; skip further actions
            Some(Slot::Reused(_)) => Ok(None),
            None => Err(ConcretizeError::Internal(format!(
                "model attribute on unknown node {}/{}; the solver is ground truth here",
                node.id, node.pkg
            ))),
        }
    }

    fn apply(&mut self, action: AttrAction) -> Result<()> {
        match action {
            AttrAction::Hash(node, hash) => {
                if !self.slots.contains_key(&node) {
                    let spec = self.hash_lookup.get(&hash).cloned().ok_or_else(|| {
                        ConcretizeError::Internal(format!(
                            "model references unknown installed hash {hash}"
                        ))
                    })?;
                    self.slots.insert(node, Slot::Reused(spec));
                }
            }
            AttrAction::Node(node) => {
                if !self.slots.contains_key(&node) {
                    let spec = Spec::new(&node.pkg);
                    self.slots.insert(node, Slot::Building(spec));
                }
            }
            AttrAction::Namespace(node, ns) => {
                if let Some(spec) = self.building_mut(&node)? {
                    spec.namespace = Some(ns);
                }
            }
            AttrAction::Version(node, version) => {
                if let Some(spec) = self.building_mut(&node)? {
                    spec.versions = VersionConstraint::exact(version);
                }
            }
            AttrAction::VariantSelected(node, name, value, vtype) => {
                if let Some(spec) = self.building_mut(&node)? {
                    match spec.variants.get_mut(&name) {
                        None => {
                            let value = match vtype.as_str() {
                                "multi" => VariantValue::Multi(vec![value]),
                                "bool" => VariantValue::Bool(value == "true"),
                                _ => VariantValue::Single(value),
                            };
                            spec.variants.insert(name, Variant::new(value));
                        }
                        Some(variant) => match &mut variant.value {
                            VariantValue::Multi(values) => {
                                if !values.contains(&value) {
                                    values.push(value);
                                }
                            }
                            _ => {
                                return Err(ConcretizeError::Internal(format!(
                                    "cannot have multiple values for single-valued variant \
                                     {name} on {}",
                                    node.pkg
                                )))
                            }
                        },
                    }
                }
            }
            AttrAction::NodePlatform(node, platform) => {
                if let Some(spec) = self.building_mut(&node)? {
                    spec.arch.platform = Some(platform);
                }
            }
            AttrAction::NodeOs(node, os) => {
                if let Some(spec) = self.building_mut(&node)? {
                    spec.arch.os = Some(os);
                }
            }
            AttrAction::NodeTarget(node, target) => {
                if let Some(spec) = self.building_mut(&node)? {
                    spec.arch.target = Some(target);
                }
            }
            AttrAction::NodeFlag(node, flag, flag_type) => {
                if let Some(spec) = self.building_mut(&node)? {
                    spec.compiler_flags.add_flag(
                        &flag_type,
                        &flag.flag,
                        flag.propagate,
                        &flag.flag_group,
                        &flag.source,
                    );
                }
            }
            AttrAction::DependsOn(parent, child, depflag) => {
                // dependency edges of reused parents are already wired
                if matches!(self.slots.get(&parent), Some(Slot::Reused(_))) {
                    return Ok(());
                }
                for edge in self.edges.iter_mut() {
                    if edge.parent == parent && edge.child == child {
                        edge.depflag |= depflag;
                        return Ok(());
                    }
                }
                self.edges.push(EdgeData {
                    parent,
                    child,
                    depflag,
                    virtuals: Vec::new(),
                });
            }
            AttrAction::VirtualOnEdge(parent, child, virtual_name) => {
                if matches!(self.slots.get(&parent), Some(Slot::Reused(_))) {
                    return Ok(());
                }
                let edge = self
                    .edges
                    .iter_mut()
                    .find(|e| e.parent == parent && e.child == child)
                    .ok_or_else(|| {
                        ConcretizeError::Internal(format!(
                            "virtual {virtual_name} on missing edge {} -> {}",
                            parent.pkg, child.pkg
                        ))
                    })?;
                if !edge.virtuals.contains(&virtual_name) {
                    edge.virtuals.push(virtual_name);
                }
            }
            AttrAction::ExternalSpecSelected(node, idx) => {
                let prefix = self
                    .config
                    .package_policy(&node.pkg)
                    .and_then(|policy| policy.externals.get(idx))
                    .map(|entry| entry.prefix.clone())
                    .ok_or_else(|| {
                        ConcretizeError::InvalidExternal(format!(
                            "no external entry {idx} for package {}",
                            node.pkg
                        ))
                    })?;
                if let Some(spec) = self.building_mut(&node)? {
                    spec.external_path = Some(prefix);
                }
            }
            AttrAction::Deprecated(node, version) => {
                log::warn!("using \"{}@{}\" which is a deprecated version", node.pkg, version);
            }
            AttrAction::SpliceAtHash(parent, _splice_node, child_name, child_hash) => {
                self.splices.push(SpliceRequest {
                    parent,
                    child_name,
                    child_hash,
                });
            }
            AttrAction::Ignored => {}
            AttrAction::Unknown(name) => {
                log::debug!("unknown model attribute '{name}' ignored");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // flag reordering
    // -----------------------------------------------------------------

    /// Determine the order of compiler flags on each node.
    ///
    /// The solver determines which flags are on nodes; this routine
    /// imposes order afterwards:
    ///
    /// 1. flags from compiler definitions come first;
    /// 2. flags applied by dependents are ordered topologically, parents
    ///    before children, ties broken lexicographically by flag group;
    /// 3. flags from package requirements follow;
    /// 4. command-line flags come last.
    ///
    /// Within one source, original flag order and grouping are preserved.
    fn reorder_flags(&mut self) -> Result<()> {
        let dependents = self.dependent_index();
        let nodes: Vec<NodeArgument> = self.slots.keys().cloned().collect();

        for node in nodes {
            let topo_order = self.parent_post_order(&node.pkg, &dependents);

            let Some(Slot::Building(spec)) = self.slots.get_mut(&node) else {
                continue;
            };
            for flag_type in FLAG_TYPES {
                let current: Vec<CompilerFlag> = spec.compiler_flags.get(flag_type).to_vec();
                if current.is_empty() {
                    continue;
                }

                let from_compiler: Vec<CompilerFlag> = current
                    .iter()
                    .filter(|f| f.source == "compiler")
                    .cloned()
                    .collect();

                // flags from literal specs are reordered to the input
                // order of their flag group
                let from_cli: Vec<CompilerFlag> = {
                    let literal: Vec<&CompilerFlag> =
                        current.iter().filter(|f| f.source == "literal").collect();
                    match literal.first() {
                        None => Vec::new(),
                        Some(first) => tokenize_flags(&first.flag_group)
                            .into_iter()
                            .map(|flag| {
                                CompilerFlag::new(
                                    &flag,
                                    first.propagate,
                                    &first.flag_group,
                                    &first.source,
                                )
                            })
                            .collect(),
                    }
                };

                let mut ordered: Vec<CompilerFlag> = Vec::new();
                extend_flag_list(&mut ordered, &from_compiler);

                // unique flag groups, then sort them by (origin kind,
                // topological position of the source, lexicographic group)
                let mut groups: Vec<CompilerFlag> = Vec::new();
                for flag in &current {
                    let group_marker = CompilerFlag::new(
                        &flag.flag_group,
                        flag.propagate,
                        &flag.flag_group,
                        &flag.source,
                    );
                    if !groups
                        .iter()
                        .any(|g| g.flag_group == group_marker.flag_group && g.source == group_marker.source)
                    {
                        groups.push(group_marker);
                    }
                }
                let lex_order: Vec<String> = {
                    let mut order: Vec<String> =
                        groups.iter().map(|g| g.flag_group.clone()).collect();
                    order.sort();
                    order
                };
                groups.sort_by_key(|group| {
                    let (origin, source_pkg) = ConstraintOrigin::strip_type_suffix(&group.source);
                    let type_index = ConstraintOrigin::order_rank(origin);
                    let (major, minor) = match topo_order.iter().position(|p| p == source_pkg) {
                        Some(position) => (
                            position,
                            lex_order
                                .iter()
                                .position(|g| g == &group.flag_group)
                                .unwrap_or(0),
                        ),
                        None => (
                            topo_order.len()
                                + lex_order
                                    .iter()
                                    .position(|g| g == &group.flag_group)
                                    .unwrap_or(0),
                            0,
                        ),
                    };
                    (type_index, major, minor)
                });

                let compiler_flag_strings: Vec<String> =
                    from_compiler.iter().map(|f| f.flag.clone()).collect();
                for group in &groups {
                    if group.source == "literal" {
                        continue;
                    }
                    let group_flags: Vec<String> = tokenize_flags(&group.flag_group);
                    if group_flags == compiler_flag_strings && group.source == "compiler" {
                        continue;
                    }
                    let as_flags: Vec<CompilerFlag> = group_flags
                        .iter()
                        .map(|flag| {
                            CompilerFlag::new(flag, group.propagate, &group.flag_group, &group.source)
                        })
                        .collect();
                    extend_flag_list(&mut ordered, &as_flags);
                }

                // command-line flags last
                extend_flag_list(&mut ordered, &from_cli);

                // same flag set, different order only
                let mut before: Vec<String> = current.iter().map(|f| f.flag.clone()).collect();
                let mut after: Vec<String> = ordered.iter().map(|f| f.flag.clone()).collect();
                before.sort();
                before.dedup();
                after.sort();
                after.dedup();
                if before != after {
                    return Err(ConcretizeError::Internal(format!(
                        "cannot reorder compiler flags for concretized specs: {before:?} \
                         does not equal {after:?}"
                    )));
                }

                spec.compiler_flags.set(flag_type, ordered);
            }
        }
        Ok(())
    }

    /// child package -> dependent packages, from the model's edges.
    fn dependent_index(&self) -> HashMap<String, Vec<String>> {
        let mut index: HashMap<String, Vec<String>> = HashMap::new();
        for edge in &self.edges {
            let parents = index.entry(edge.child.pkg.clone()).or_default();
            if !parents.contains(&edge.parent.pkg) {
                parents.push(edge.parent.pkg.clone());
            }
        }
        for parents in index.values_mut() {
            parents.sort();
        }
        index
    }

    /// Post-order traversal in the dependents (parent) direction starting
    /// from a package, computed with an explicit work stack. Parents end
    /// up before their children in the returned order... reversed so the
    /// result lists ancestors first.
    fn parent_post_order(
        &self,
        start: &str,
        dependents: &HashMap<String, Vec<String>>,
    ) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        let mut stack: Vec<(String, bool)> = vec![(start.to_string(), false)];
        let mut seen: Vec<String> = Vec::new();

        while let Some((pkg, expanded)) = stack.pop() {
            if expanded {
                order.push(pkg);
                continue;
            }
            if seen.contains(&pkg) {
                continue;
            }
            seen.push(pkg.clone());
            stack.push((pkg.clone(), true));
            for parent in dependents.get(&pkg).into_iter().flatten() {
                stack.push((parent.clone(), false));
            }
        }
        order
    }

    // -----------------------------------------------------------------
    // patches
    // -----------------------------------------------------------------

    /// Collect applicable patches into the multi-valued `patches` variant,
    /// ordered by declaration index then content hash. The ordering is
    /// load-bearing for cache-key stability.
    fn inject_patches(&mut self) -> Result<()> {
        let nodes: Vec<NodeArgument> = self.slots.keys().cloned().collect();
        for node in &nodes {
            let Some(Slot::Building(spec)) = self.slots.get(node) else {
                continue;
            };
            let Ok(pkg) = self.repo.get(&node.pkg) else {
                continue;
            };

            let mut applicable: Vec<(usize, String)> = Vec::new();
            for patch in &pkg.patches {
                let applies = patch
                    .when
                    .as_ref()
                    .map(|when| spec.satisfies(when))
                    .unwrap_or(true);
                if applies {
                    applicable.push((patch.index, patch.sha256.clone()));
                }
            }

            // patches declared by dependents on incoming edges
            for edge in &self.edges {
                if edge.child != *node {
                    continue;
                }
                let Some(Slot::Building(parent_spec)) = self.slots.get(&edge.parent) else {
                    continue;
                };
                let Ok(parent_pkg) = self.repo.get(&edge.parent.pkg) else {
                    continue;
                };
                for dep in &parent_pkg.dependencies {
                    if dep.spec.name != node.pkg && !edge.virtuals.contains(&dep.spec.name) {
                        continue;
                    }
                    let condition_holds = dep
                        .when
                        .as_ref()
                        .map(|when| parent_spec.satisfies(when))
                        .unwrap_or(true);
                    if !condition_holds {
                        continue;
                    }
                    for patch in &dep.patches {
                        let applies = patch
                            .when
                            .as_ref()
                            .map(|when| spec.satisfies(when))
                            .unwrap_or(true);
                        if applies {
                            applicable.push((patch.index, patch.sha256.clone()));
                        }
                    }
                }
            }

            if applicable.is_empty() {
                continue;
            }
            applicable.sort();
            applicable.dedup();
            let values: Vec<String> = applicable.into_iter().map(|(_, sha)| sha).collect();
            if let Some(Slot::Building(spec)) = self.slots.get_mut(node) {
                spec.variants
                    .insert("patches".to_string(), Variant::new(VariantValue::Multi(values)));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // assembly
    // -----------------------------------------------------------------

    /// Assemble shells into shared, immutable concrete specs,
    /// children-first. Rejects dependency cycles.
    fn assemble(&mut self) -> Result<IndexMap<NodeArgument, Arc<Spec>>> {
        // Kahn's algorithm over the building edges
        let mut remaining: IndexMap<NodeArgument, usize> = IndexMap::new();
        for node in self.slots.keys() {
            remaining.insert(node.clone(), 0);
        }
        for edge in &self.edges {
            if !remaining.contains_key(&edge.child) {
                return Err(ConcretizeError::Internal(format!(
                    "edge to unknown node {}",
                    edge.child.pkg
                )));
            }
            *remaining.get_mut(&edge.parent).ok_or_else(|| {
                ConcretizeError::Internal(format!("edge from unknown node {}", edge.parent.pkg))
            })? += 1;
        }

        let mut ready: Vec<NodeArgument> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| node.clone())
            .collect();
        let mut built: IndexMap<NodeArgument, Arc<Spec>> = IndexMap::new();

        while let Some(node) = ready.pop() {
            let slot = self.slots.get(&node).expect("node is known");
            let arc = match slot {
                Slot::Reused(spec) => spec.clone(),
                Slot::Building(spec) => {
                    let mut spec = spec.clone();
                    for edge in self.edges.iter().filter(|e| e.parent == node) {
                        let child = built.get(&edge.child).expect("children built first");
                        spec.add_dependency_edge(
                            child.clone(),
                            edge.depflag,
                            edge.virtuals.clone(),
                            false,
                        );
                    }
                    spec.finalize()?
                }
            };
            built.insert(node.clone(), arc);

            for edge in self.edges.iter().filter(|e| e.child == node) {
                let count = remaining.get_mut(&edge.parent).expect("parent is known");
                *count -= 1;
                if *count == 0 {
                    ready.push(edge.parent.clone());
                }
            }
        }

        if built.len() != self.slots.len() {
            return Err(ConcretizeError::Internal(
                "dependency graph contains a cycle; graphs are acyclic by construction"
                    .to_string(),
            ));
        }
        Ok(built)
    }

    // -----------------------------------------------------------------
    // splicing
    // -----------------------------------------------------------------

    fn execute_splices_at_hash(
        &self,
        specs: IndexMap<NodeArgument, Arc<Spec>>,
    ) -> Result<IndexMap<NodeArgument, Arc<Spec>>> {
        if self.splices.is_empty() {
            return Ok(specs);
        }
        let mut result = specs;
        for request in &self.splices {
            let replacement = self
                .hash_lookup
                .get(&request.child_hash)
                .cloned()
                .ok_or_else(|| {
                    ConcretizeError::InvalidSplice(format!(
                        "no installed spec with hash {} to splice in",
                        request.child_hash
                    ))
                })?;
            let target = Spec::new(&request.child_name);
            for (node, spec) in result.iter_mut() {
                if node.pkg == request.parent.pkg {
                    *spec = splice_subtree(spec, &target, &replacement, false)?;
                }
            }
        }
        Ok(result)
    }

    /// Explicit, configuration-driven splices: replace any subtree
    /// matching a target pattern with a named, hash-pinned replacement.
    fn execute_explicit_splices(
        &self,
        specs: IndexMap<NodeArgument, Arc<Spec>>,
    ) -> Result<IndexMap<NodeArgument, Arc<Spec>>> {
        if self.config.splice.explicit.is_empty() {
            return Ok(specs);
        }

        let mut triples: Vec<(Spec, Arc<Spec>, bool)> = Vec::new();
        for splice in &self.config.splice.explicit {
            let target = Spec::parse(&splice.target)?;
            // replacements are specified as "<name>/<hash>"
            let Some((_, hash)) = splice.replacement.split_once('/') else {
                return Err(ConcretizeError::InvalidSplice(format!(
                    "explicit splice replacement '{}' does not include a hash; \
                     splice replacements must be specified by hash",
                    splice.replacement
                )));
            };
            let replacement = self.hash_lookup.get(hash).cloned().ok_or_else(|| {
                ConcretizeError::InvalidSplice(format!(
                    "explicit splice replacement hash {hash} is not an installed spec"
                ))
            })?;
            triples.push((target, replacement, splice.transitive));
        }

        let mut result: IndexMap<NodeArgument, Arc<Spec>> = IndexMap::new();
        for (node, spec) in specs {
            let mut current = spec;
            for (target, replacement, transitive) in &triples {
                let matches_somewhere =
                    current.traverse().iter().any(|n| n.satisfies(target));
                if matches_somewhere {
                    current = splice_subtree(&current, target, replacement, *transitive)?;
                }
            }
            let new_node = NodeArgument {
                id: node.id,
                pkg: current.name.clone(),
            };
            result.insert(new_node, current);
        }
        Ok(result)
    }
}

/// Replace every subtree satisfying `target` with `replacement`,
/// rebuilding ancestors bottom-up. Rebuilt nodes record the hash of the
/// spec they were built as. When `transitive` is false, only the matched
/// node is replaced; otherwise the replacement's own dependencies win
/// wherever they overlap.
pub(crate) fn splice_subtree(
    root: &Arc<Spec>,
    target: &Spec,
    replacement: &Arc<Spec>,
    transitive: bool,
) -> Result<Arc<Spec>> {
    let mut rebuilt: HashMap<String, Arc<Spec>> = HashMap::new();
    splice_node(root, target, replacement, transitive, &mut rebuilt)
}

fn splice_node(
    node: &Arc<Spec>,
    target: &Spec,
    replacement: &Arc<Spec>,
    transitive: bool,
    rebuilt: &mut HashMap<String, Arc<Spec>>,
) -> Result<Arc<Spec>> {
    let hash = node.dag_hash().unwrap_or_default().to_string();
    if let Some(done) = rebuilt.get(&hash) {
        return Ok(done.clone());
    }

    if node.satisfies(target) && node.name == replacement.name {
        rebuilt.insert(hash, replacement.clone());
        return Ok(replacement.clone());
    }

    let mut new_children: Vec<(Arc<Spec>, DepFlag, Vec<String>, bool)> = Vec::new();
    let mut changed = false;
    for edge in &node.edges {
        let new_child = splice_node(&edge.spec, target, replacement, transitive, rebuilt)?;
        if !Arc::ptr_eq(&new_child, &edge.spec) {
            changed = true;
        }
        new_children.push((
            new_child,
            edge.depflag,
            edge.virtuals.clone(),
            edge.direct,
        ));
    }

    if !changed {
        rebuilt.insert(hash, node.clone());
        return Ok(node.clone());
    }

    let mut copy = node.as_ref().clone();
    copy.edges.clear();
    copy.concrete = false;
    copy.build_spec = Some(hash.clone());
    for (child, depflag, virtuals, direct) in new_children {
        copy.add_dependency_edge(child, depflag, virtuals, direct);
    }
    let arc = copy.finalize()?;
    rebuilt.insert(hash, arc.clone());
    Ok(arc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{PackageDef, Repo};
    use crate::solver::fact::atoms;

    fn builder_fixture() -> (Repo, ConcretizerConfig, ConcreteSpecsByHash) {
        let repo = Repo::new()
            .with(PackageDef::new("a").with_version("1.0").depends_on("b", ""))
            .with(PackageDef::new("b").with_version("2.0"));
        (repo, ConcretizerConfig::default(), ConcreteSpecsByHash::new())
    }

    fn attr(name: &str, args: Vec<Atom>) -> Fact {
        Fact::attr(name, args)
    }

    fn node(pkg: &str) -> NodeArgument {
        NodeArgument::make(pkg)
    }

    #[test]
    fn test_build_simple_graph() {
        let (repo, config, lookup) = builder_fixture();
        let mut builder = SpecBuilder::new(&repo, &config, &lookup);
        let facts = vec![
            attr("node", atoms![node("a")]),
            attr("node", atoms![node("b")]),
            attr("version", atoms![node("a"), "1.0"]),
            attr("version", atoms![node("b"), "2.0"]),
            attr("depends_on", atoms![node("a"), node("b"), "build"]),
            attr("depends_on", atoms![node("a"), node("b"), "link"]),
        ];
        let specs = builder.build_specs(&facts).unwrap();
        let a = &specs[&node("a")];
        assert!(a.concrete);
        assert_eq!(a.edges.len(), 1);
        assert_eq!(a.edges[0].spec.name, "b");
        assert_eq!(a.edges[0].depflag, deptype::DEFAULT);
    }

    #[test]
    fn test_unknown_attribute_is_nonfatal() {
        let (repo, config, lookup) = builder_fixture();
        let mut builder = SpecBuilder::new(&repo, &config, &lookup);
        let facts = vec![
            attr("node", atoms![node("b")]),
            attr("version", atoms![node("b"), "2.0"]),
            attr("some_future_attribute", atoms![node("b"), "x"]),
        ];
        assert!(builder.build_specs(&facts).is_ok());
    }

    #[test]
    fn test_attribute_on_unknown_node_is_internal_error() {
        let (repo, config, lookup) = builder_fixture();
        let mut builder = SpecBuilder::new(&repo, &config, &lookup);
        let facts = vec![attr("version", atoms![node("ghost"), "2.0"])];
        assert!(matches!(
            builder.build_specs(&facts),
            Err(ConcretizeError::Internal(_))
        ));
    }

    #[test]
    fn test_flag_reorder_cli_last_multiset_preserved() {
        let (repo, config, lookup) = builder_fixture();
        let mut builder = SpecBuilder::new(&repo, &config, &lookup);
        let cli_flag = Fact::new("node_flag", atoms!["cflags", "-a", "-a", "literal"]);
        let dep_flag = Fact::new("node_flag", atoms!["cflags", "-b", "-b", "a_dep"]);
        let facts = vec![
            attr("node", atoms![node("b")]),
            attr("version", atoms![node("b"), "2.0"]),
            attr("node_flag", atoms![node("b"), cli_flag]),
            attr("node_flag", atoms![node("b"), dep_flag]),
        ];
        let specs = builder.build_specs(&facts).unwrap();
        let flags: Vec<String> = specs[&node("b")]
            .compiler_flags
            .get("cflags")
            .iter()
            .map(|f| f.flag.clone())
            .collect();
        // the dependent-sourced flag comes before the literal one
        assert_eq!(flags, vec!["-b".to_string(), "-a".to_string()]);
    }

    #[test]
    fn test_patch_injection_ordered_by_declaration() {
        let repo = Repo::new().with(
            PackageDef::new("b")
                .with_version("2.0")
                .with_patch("bbbb", None)
                .with_patch("aaaa", None),
        );
        let config = ConcretizerConfig::default();
        let lookup = ConcreteSpecsByHash::new();
        let mut builder = SpecBuilder::new(&repo, &config, &lookup);
        let facts = vec![
            attr("node", atoms![node("b")]),
            attr("version", atoms![node("b"), "2.0"]),
        ];
        let specs = builder.build_specs(&facts).unwrap();
        let patches = specs[&node("b")].variants.get("patches").unwrap();
        // declaration order, not lexicographic
        assert_eq!(
            patches.value,
            VariantValue::Multi(vec!["bbbb".to_string(), "aaaa".to_string()])
        );
    }

    #[test]
    fn test_cycle_is_rejected() {
        let (repo, config, lookup) = builder_fixture();
        let mut builder = SpecBuilder::new(&repo, &config, &lookup);
        let facts = vec![
            attr("node", atoms![node("a")]),
            attr("node", atoms![node("b")]),
            attr("version", atoms![node("a"), "1.0"]),
            attr("version", atoms![node("b"), "2.0"]),
            attr("depends_on", atoms![node("a"), node("b"), "build"]),
            attr("depends_on", atoms![node("b"), node("a"), "build"]),
        ];
        assert!(matches!(
            builder.build_specs(&facts),
            Err(ConcretizeError::Internal(_))
        ));
    }
}
