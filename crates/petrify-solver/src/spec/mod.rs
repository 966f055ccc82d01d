//! The spec data model: nodes of a dependency graph.
//!
//! A spec is either *abstract* (an under-constrained request) or *concrete*
//! (fully resolved, immutable, content-hashed). Concrete specs are shared
//! via `Arc` and structurally identical subgraphs are reference-shared; the
//! `ConcreteSpecsByHash` container maintains that invariant.

mod by_hash;
mod flags;
mod parse;

pub use by_hash::ConcreteSpecsByHash;
pub use flags::{
    extend_flag_list, is_flag_type, tokenize_flags, CompilerFlag, FlagMap, FLAG_TYPES,
};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use petrify_version::{Version, VersionConstraint};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::deptype::{self, DepFlag};
use crate::error::{ConcretizeError, Result};

/// Architecture triple of a node. All parts are optional on abstract specs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arch {
    pub platform: Option<String>,
    pub os: Option<String>,
    pub target: Option<String>,
}

impl Arch {
    pub fn is_empty(&self) -> bool {
        self.platform.is_none() && self.os.is_none() && self.target.is_none()
    }
}

/// Value of a variant on a spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VariantValue {
    Bool(bool),
    Single(String),
    Multi(Vec<String>),
}

impl VariantValue {
    /// The variant type tag used in solver facts: `bool`, `single`, `multi`.
    pub fn type_str(&self) -> &'static str {
        match self {
            VariantValue::Bool(_) => "bool",
            VariantValue::Single(_) => "single",
            VariantValue::Multi(_) => "multi",
        }
    }

    /// Individual value strings, in declaration order.
    pub fn value_strings(&self) -> Vec<String> {
        match self {
            VariantValue::Bool(b) => vec![b.to_string()],
            VariantValue::Single(v) => vec![v.clone()],
            VariantValue::Multi(vs) => vs.clone(),
        }
    }

    /// True if `self` (a concrete assignment) satisfies `other` (a request).
    pub fn satisfies(&self, other: &VariantValue) -> bool {
        match (self, other) {
            (VariantValue::Multi(mine), VariantValue::Multi(wanted)) => {
                wanted.iter().all(|w| mine.contains(w))
            }
            (VariantValue::Multi(mine), VariantValue::Single(w)) => mine.contains(w),
            _ => {
                self.value_strings() == other.value_strings()
            }
        }
    }
}

impl fmt::Display for VariantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariantValue::Bool(b) => write!(f, "{}", b),
            VariantValue::Single(v) => write!(f, "{}", v),
            VariantValue::Multi(vs) => write!(f, "{}", vs.join(",")),
        }
    }
}

/// A variant assignment on a spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub value: VariantValue,
    pub propagate: bool,
}

impl Variant {
    pub fn new(value: VariantValue) -> Variant {
        Variant {
            value,
            propagate: false,
        }
    }
}

/// A directed dependency edge from a dependent to one of its dependencies.
#[derive(Debug, Clone)]
pub struct DepEdge {
    pub spec: Arc<Spec>,
    pub depflag: DepFlag,
    /// Virtual names this edge satisfies for the dependent.
    pub virtuals: Vec<String>,
    /// True for direct-dependency (`%`) syntax, false for `^`.
    pub direct: bool,
}

/// A node in a dependency graph.
///
/// Abstract specs are created by callers (usually via [`Spec::parse`]) and
/// never mutated by the concretizer. Concrete specs are produced by answer
/// interpretation, become immutable once hashed and are always handled
/// through `Arc`.
#[derive(Debug, Clone)]
pub struct Spec {
    /// Package name. Empty for anonymous constraint specs.
    pub name: String,
    pub namespace: Option<String>,
    pub versions: VersionConstraint,
    pub variants: IndexMap<String, Variant>,
    pub compiler_flags: FlagMap,
    pub arch: Arch,
    pub external_path: Option<String>,
    pub edges: Vec<DepEdge>,
    pub concrete: bool,
    /// Content hash over the canonical concrete state. Set at finalization.
    dag_hash: Option<String>,
    /// Hash of the spec this node was originally built as, when it has been
    /// spliced. `None` for ordinary nodes.
    pub build_spec: Option<String>,
}

impl Default for Spec {
    fn default() -> Self {
        Spec::anonymous()
    }
}

impl Spec {
    /// An anonymous constraint spec (no name).
    pub fn anonymous() -> Spec {
        Spec {
            name: String::new(),
            namespace: None,
            versions: VersionConstraint::Any,
            variants: IndexMap::new(),
            compiler_flags: FlagMap::new(),
            arch: Arch::default(),
            external_path: None,
            edges: Vec::new(),
            concrete: false,
            dag_hash: None,
            build_spec: None,
        }
    }

    pub fn new(name: &str) -> Spec {
        let mut spec = Spec::anonymous();
        spec.name = name.to_string();
        spec
    }

    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }

    /// True if this spec carries no constraints at all (an empty trigger).
    pub fn is_empty_constraint(&self) -> bool {
        self.is_anonymous()
            && self.versions.is_any()
            && self.variants.is_empty()
            && self.compiler_flags.is_empty()
            && self.arch.is_empty()
            && self.edges.is_empty()
    }

    /// The concrete version, if the version constraint pins one.
    pub fn version(&self) -> Option<&Version> {
        self.versions.as_exact()
    }

    pub fn dag_hash(&self) -> Option<&str> {
        self.dag_hash.as_deref()
    }

    /// Add a dependency edge. Duplicate edges to the same node are merged by
    /// or-ing dependency types and unioning virtuals.
    pub fn add_dependency_edge(
        &mut self,
        spec: Arc<Spec>,
        depflag: DepFlag,
        virtuals: Vec<String>,
        direct: bool,
    ) {
        for edge in self.edges.iter_mut() {
            if Arc::ptr_eq(&edge.spec, &spec) && edge.direct == direct {
                edge.depflag |= depflag;
                for v in virtuals {
                    if !edge.virtuals.contains(&v) {
                        edge.virtuals.push(v);
                    }
                }
                edge.virtuals.sort();
                return;
            }
        }
        let mut virtuals = virtuals;
        virtuals.sort();
        self.edges.push(DepEdge {
            spec,
            depflag,
            virtuals,
            direct,
        });
    }

    /// Finalize this spec as concrete: computes the DAG hash and returns the
    /// shared, immutable node. All dependencies must already be concrete.
    pub fn finalize(mut self) -> Result<Arc<Spec>> {
        for edge in &self.edges {
            if !edge.spec.concrete {
                return Err(ConcretizeError::Internal(format!(
                    "cannot finalize '{}': dependency '{}' is not concrete",
                    self.name, edge.spec.name
                )));
            }
        }
        if self.version().is_none() {
            return Err(ConcretizeError::Internal(format!(
                "cannot finalize '{}' without a concrete version",
                self.name
            )));
        }
        self.concrete = true;
        self.dag_hash = Some(self.compute_dag_hash());
        Ok(Arc::new(self))
    }

    /// Content hash over the canonical concrete state of this node and the
    /// hashes of its dependencies.
    fn compute_dag_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b";");
        if let Some(ns) = &self.namespace {
            hasher.update(ns.as_bytes());
        }
        hasher.update(b";");
        hasher.update(self.versions.to_string().as_bytes());
        hasher.update(b";");

        let mut variant_keys: Vec<&String> = self.variants.keys().collect();
        variant_keys.sort();
        for key in variant_keys {
            let variant = &self.variants[key];
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(variant.value.to_string().as_bytes());
            hasher.update(b";");
        }

        for flag_type in FLAG_TYPES {
            for flag in self.compiler_flags.get(flag_type) {
                hasher.update(flag_type.as_bytes());
                hasher.update(b"=");
                hasher.update(flag.flag.as_bytes());
                hasher.update(b";");
            }
        }

        for part in [&self.arch.platform, &self.arch.os, &self.arch.target] {
            if let Some(part) = part {
                hasher.update(part.as_bytes());
            }
            hasher.update(b";");
        }
        if let Some(path) = &self.external_path {
            hasher.update(path.as_bytes());
        }
        hasher.update(b";");

        let mut dep_lines: Vec<String> = self
            .edges
            .iter()
            .map(|edge| {
                format!(
                    "dep:{}:{}:{}:{}:{}",
                    edge.spec.name,
                    edge.spec.dag_hash().unwrap_or(""),
                    deptype::flag_to_string(edge.depflag),
                    edge.virtuals.join(","),
                    edge.direct
                )
            })
            .collect();
        dep_lines.sort();
        for line in dep_lines {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }

        let digest = hasher.finalize();
        let hex = format!("{:x}", digest);
        hex[..32].to_string()
    }

    /// Depth-first traversal over this spec and its dependencies, root
    /// first, each node visited once. Implemented with an explicit stack.
    pub fn traverse(&self) -> Vec<&Spec> {
        let mut seen: HashSet<*const Spec> = HashSet::new();
        let mut order = Vec::new();
        let mut stack: Vec<&Spec> = vec![self];
        while let Some(current) = stack.pop() {
            let ptr = current as *const Spec;
            if !seen.insert(ptr) {
                continue;
            }
            order.push(current);
            for edge in current.edges.iter().rev() {
                stack.push(&edge.spec);
            }
        }
        order
    }

    /// All edges reachable from this spec, each once, paired with the
    /// dependent they originate from.
    pub fn traverse_edges(&self) -> Vec<(&Spec, &DepEdge)> {
        let mut result = Vec::new();
        for node in self.traverse() {
            for edge in &node.edges {
                result.push((node, edge));
            }
        }
        result
    }

    /// True if this spec satisfies the constraints of `other`.
    ///
    /// `self` is typically concrete; `other` is an abstract request. Version
    /// constraints, variants, flags, architecture and (transitively)
    /// dependency constraints of `other` must all hold on `self`.
    pub fn satisfies(&self, other: &Spec) -> bool {
        if !other.is_anonymous() && self.name != other.name {
            return false;
        }
        if let Some(ns) = &other.namespace {
            if self.namespace.as_ref() != Some(ns) {
                return false;
            }
        }

        if let Some(version) = self.version() {
            if !other.versions.satisfies(version) {
                return false;
            }
        } else if !other.versions.is_any() && self.versions != other.versions {
            return false;
        }

        for (name, wanted) in &other.variants {
            match self.variants.get(name) {
                Some(mine) if mine.value.satisfies(&wanted.value) => {}
                _ => return false,
            }
        }

        for (flag_type, wanted) in other.compiler_flags.iter() {
            let mine = self.compiler_flags.get(flag_type);
            if !wanted.iter().all(|w| mine.contains(w)) {
                return false;
            }
        }

        for (wanted, mine) in [
            (&other.arch.platform, &self.arch.platform),
            (&other.arch.os, &self.arch.os),
            (&other.arch.target, &self.arch.target),
        ] {
            if let Some(wanted) = wanted {
                if mine.as_ref() != Some(wanted) {
                    return false;
                }
            }
        }

        // Every dependency constraint must be satisfied somewhere in the
        // closure of self, either by package name or by a provided virtual.
        for dep_edge in &other.edges {
            let wanted = &dep_edge.spec;
            let mut found = false;
            for (_, edge) in self.traverse_edges() {
                let name_match = edge.spec.name == wanted.name
                    || edge.virtuals.iter().any(|v| v == &wanted.name);
                if name_match {
                    let target_ok = if edge.virtuals.iter().any(|v| v == &wanted.name) {
                        // Match virtual constraints against the provider,
                        // ignoring the name mismatch.
                        let mut unnamed = wanted.as_ref().clone();
                        unnamed.name = edge.spec.name.clone();
                        edge.spec.satisfies(&unnamed)
                    } else {
                        edge.spec.satisfies(wanted)
                    };
                    if target_ok {
                        found = true;
                        break;
                    }
                }
            }
            if !found {
                return false;
            }
        }

        true
    }

    /// Serialize a concrete spec (and its dependency closure) to JSON.
    pub fn to_json(&self) -> Value {
        let nodes: Vec<Value> = self.traverse().iter().map(|node| node.node_json()).collect();
        json!({ "nodes": nodes })
    }

    fn node_json(&self) -> Value {
        let variants: Value = self
            .variants
            .iter()
            .map(|(name, variant)| {
                let value = match &variant.value {
                    VariantValue::Bool(b) => json!(b),
                    VariantValue::Single(v) => json!(v),
                    VariantValue::Multi(vs) => json!(vs),
                };
                (name.clone(), json!({ "value": value, "propagate": variant.propagate }))
            })
            .collect::<serde_json::Map<String, Value>>()
            .into();

        let flags: Value = self
            .compiler_flags
            .iter()
            .map(|(flag_type, flag_list)| {
                let values: Vec<Value> = flag_list
                    .iter()
                    .map(|f| {
                        json!({
                            "flag": f.flag,
                            "propagate": f.propagate,
                            "flag_group": f.flag_group,
                            "source": f.source,
                        })
                    })
                    .collect();
                (flag_type.clone(), json!(values))
            })
            .collect::<serde_json::Map<String, Value>>()
            .into();

        let dependencies: Vec<Value> = self
            .edges
            .iter()
            .map(|edge| {
                json!({
                    "name": edge.spec.name,
                    "hash": edge.spec.dag_hash(),
                    "deptypes": deptype::flag_to_parts(edge.depflag)
                        .map(deptype::flag_to_str)
                        .collect::<Vec<_>>(),
                    "virtuals": edge.virtuals,
                    "direct": edge.direct,
                })
            })
            .collect();

        json!({
            "name": self.name,
            "namespace": self.namespace,
            "version": self.version().map(|v| v.to_string()),
            "arch": {
                "platform": self.arch.platform,
                "os": self.arch.os,
                "target": self.arch.target,
            },
            "variants": variants,
            "flags": flags,
            "external_path": self.external_path,
            "build_spec": self.build_spec,
            "hash": self.dag_hash(),
            "dependencies": dependencies,
        })
    }

    /// Rebuild a concrete spec from its [`Spec::to_json`] form. The first
    /// node in the list is the root.
    pub fn from_json(value: &Value) -> Result<Arc<Spec>> {
        let nodes = value
            .get("nodes")
            .and_then(Value::as_array)
            .ok_or_else(|| ConcretizeError::Internal("spec JSON has no 'nodes' list".into()))?;
        if nodes.is_empty() {
            return Err(ConcretizeError::Internal("spec JSON has no nodes".into()));
        }

        let mut by_hash: HashMap<String, &Value> = HashMap::new();
        for node in nodes {
            let hash = node
                .get("hash")
                .and_then(Value::as_str)
                .ok_or_else(|| ConcretizeError::Internal("spec node without hash".into()))?;
            by_hash.insert(hash.to_string(), node);
        }

        let root_hash = nodes[0]
            .get("hash")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut built: HashMap<String, Arc<Spec>> = HashMap::new();
        Spec::build_from_json(&root_hash, &by_hash, &mut built, &mut HashSet::new())
    }

    fn build_from_json(
        hash: &str,
        by_hash: &HashMap<String, &Value>,
        built: &mut HashMap<String, Arc<Spec>>,
        in_progress: &mut HashSet<String>,
    ) -> Result<Arc<Spec>> {
        if let Some(done) = built.get(hash) {
            return Ok(done.clone());
        }
        if !in_progress.insert(hash.to_string()) {
            return Err(ConcretizeError::Internal(format!(
                "dependency cycle through spec hash {hash}"
            )));
        }

        let node = by_hash.get(hash).ok_or_else(|| {
            ConcretizeError::Internal(format!("spec JSON references unknown hash {hash}"))
        })?;

        let name = node.get("name").and_then(Value::as_str).unwrap_or_default();
        let mut spec = Spec::new(name);
        spec.namespace = node
            .get("namespace")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(version) = node.get("version").and_then(Value::as_str) {
            spec.versions = VersionConstraint::exact(Version::new(version));
        }
        if let Some(arch) = node.get("arch") {
            spec.arch.platform = arch.get("platform").and_then(Value::as_str).map(String::from);
            spec.arch.os = arch.get("os").and_then(Value::as_str).map(String::from);
            spec.arch.target = arch.get("target").and_then(Value::as_str).map(String::from);
        }
        if let Some(variants) = node.get("variants").and_then(Value::as_object) {
            for (vname, vdata) in variants {
                let propagate = vdata
                    .get("propagate")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let value = match vdata.get("value") {
                    Some(Value::Bool(b)) => VariantValue::Bool(*b),
                    Some(Value::String(s)) => VariantValue::Single(s.clone()),
                    Some(Value::Array(items)) => VariantValue::Multi(
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(String::from)
                            .collect(),
                    ),
                    _ => continue,
                };
                spec.variants
                    .insert(vname.clone(), Variant { value, propagate });
            }
        }
        if let Some(flags) = node.get("flags").and_then(Value::as_object) {
            for (flag_type, flag_list) in flags {
                for f in flag_list.as_array().into_iter().flatten() {
                    spec.compiler_flags.add_flag(
                        flag_type,
                        f.get("flag").and_then(Value::as_str).unwrap_or_default(),
                        f.get("propagate").and_then(Value::as_bool).unwrap_or(false),
                        f.get("flag_group").and_then(Value::as_str).unwrap_or_default(),
                        f.get("source").and_then(Value::as_str).unwrap_or_default(),
                    );
                }
            }
        }
        spec.external_path = node
            .get("external_path")
            .and_then(Value::as_str)
            .map(String::from);
        spec.build_spec = node
            .get("build_spec")
            .and_then(Value::as_str)
            .map(String::from);

        for dep in node
            .get("dependencies")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let dep_hash = dep
                .get("hash")
                .and_then(Value::as_str)
                .ok_or_else(|| ConcretizeError::Internal("dependency without hash".into()))?;
            let child = Spec::build_from_json(dep_hash, by_hash, built, in_progress)?;
            let depflag = dep
                .get("deptypes")
                .and_then(Value::as_array)
                .map(|types| {
                    types
                        .iter()
                        .filter_map(Value::as_str)
                        .filter_map(deptype::str_to_flag)
                        .fold(0, |acc, f| acc | f)
                })
                .unwrap_or(deptype::DEFAULT);
            let virtuals = dep
                .get("virtuals")
                .and_then(Value::as_array)
                .map(|vs| {
                    vs.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            let direct = dep.get("direct").and_then(Value::as_bool).unwrap_or(false);
            spec.add_dependency_edge(child, depflag, virtuals, direct);
        }

        in_progress.remove(hash);
        spec.concrete = true;
        spec.dag_hash = Some(hash.to_string());
        let arc = Arc::new(spec);
        built.insert(hash.to_string(), arc.clone());
        Ok(arc)
    }

    /// Used by the hash-keyed container to re-create a node with rewired
    /// edges while keeping the recorded hash.
    pub(crate) fn rewired_copy(&self, edges: Vec<DepEdge>) -> Spec {
        let mut copy = self.clone();
        copy.edges = edges;
        copy
    }
}

impl fmt::Display for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.versions.is_any() {
            write!(f, "@{}", self.versions)?;
        }
        for (name, variant) in &self.variants {
            let op = if variant.propagate { "==" } else { "=" };
            match &variant.value {
                VariantValue::Bool(true) => write!(f, " +{}", name)?,
                VariantValue::Bool(false) => write!(f, " ~{}", name)?,
                value => write!(f, " {}{}{}", name, op, value)?,
            }
        }
        for (flag_type, flag_list) in self.compiler_flags.iter() {
            if flag_list.is_empty() {
                continue;
            }
            let joined: Vec<&str> = flag_list.iter().map(|x| x.flag.as_str()).collect();
            write!(f, " {}=\"{}\"", flag_type, joined.join(" "))?;
        }
        if let Some(platform) = &self.arch.platform {
            write!(f, " platform={}", platform)?;
        }
        if let Some(os) = &self.arch.os {
            write!(f, " os={}", os)?;
        }
        if let Some(target) = &self.arch.target {
            write!(f, " target={}", target)?;
        }
        if let Some(ns) = &self.namespace {
            write!(f, " namespace={}", ns)?;
        }
        for edge in &self.edges {
            let sigil = if edge.direct { "%" } else { "^" };
            write!(f, " {}{}", sigil, edge.spec)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concrete(name: &str, version: &str) -> Arc<Spec> {
        let mut spec = Spec::new(name);
        spec.versions = VersionConstraint::exact(Version::new(version));
        spec.finalize().unwrap()
    }

    #[test]
    fn test_finalize_assigns_hash() {
        let spec = concrete("zlib", "1.3");
        assert!(spec.concrete);
        assert_eq!(spec.dag_hash().unwrap().len(), 32);
    }

    #[test]
    fn test_identical_specs_share_hash() {
        assert_eq!(concrete("zlib", "1.3").dag_hash(), concrete("zlib", "1.3").dag_hash());
        assert_ne!(concrete("zlib", "1.3").dag_hash(), concrete("zlib", "1.2").dag_hash());
    }

    #[test]
    fn test_hash_covers_dependencies() {
        let dep_a = concrete("dep", "1.0");
        let dep_b = concrete("dep", "2.0");

        let mut x = Spec::new("x");
        x.versions = VersionConstraint::exact(Version::new("1.0"));
        x.add_dependency_edge(dep_a, crate::deptype::DEFAULT, vec![], false);
        let mut y = Spec::new("x");
        y.versions = VersionConstraint::exact(Version::new("1.0"));
        y.add_dependency_edge(dep_b, crate::deptype::DEFAULT, vec![], false);

        assert_ne!(
            x.finalize().unwrap().dag_hash(),
            y.finalize().unwrap().dag_hash()
        );
    }

    #[test]
    fn test_satisfies_version_and_variants() {
        let mut spec = Spec::new("pkg");
        spec.versions = VersionConstraint::exact(Version::new("1.2.3"));
        spec.variants
            .insert("shared".into(), Variant::new(VariantValue::Bool(true)));
        let spec = spec.finalize().unwrap();

        assert!(spec.satisfies(&Spec::parse("pkg@1.2").unwrap()));
        assert!(spec.satisfies(&Spec::parse("pkg +shared").unwrap()));
        assert!(!spec.satisfies(&Spec::parse("pkg ~shared").unwrap()));
        assert!(!spec.satisfies(&Spec::parse("pkg@2.0").unwrap()));
    }

    #[test]
    fn test_satisfies_transitive_dependency() {
        let dep = concrete("zlib", "1.3");
        let mut mid = Spec::new("mid");
        mid.versions = VersionConstraint::exact(Version::new("1.0"));
        mid.add_dependency_edge(dep, crate::deptype::DEFAULT, vec![], false);
        let mid = mid.finalize().unwrap();

        let mut root = Spec::new("root");
        root.versions = VersionConstraint::exact(Version::new("1.0"));
        root.add_dependency_edge(mid, crate::deptype::DEFAULT, vec![], false);
        let root = root.finalize().unwrap();

        assert!(root.satisfies(&Spec::parse("root ^zlib@1.3").unwrap()));
        assert!(!root.satisfies(&Spec::parse("root ^zlib@2.0").unwrap()));
    }

    #[test]
    fn test_json_round_trip() {
        let dep = concrete("zlib", "1.3");
        let mut root = Spec::new("root");
        root.versions = VersionConstraint::exact(Version::new("2.0"));
        root.variants
            .insert("opt".into(), Variant::new(VariantValue::Single("high".into())));
        root.add_dependency_edge(dep, crate::deptype::DEFAULT, vec!["compress".into()], false);
        let root = root.finalize().unwrap();

        let restored = Spec::from_json(&root.to_json()).unwrap();
        assert_eq!(restored.dag_hash(), root.dag_hash());
        assert_eq!(restored.edges.len(), 1);
        assert_eq!(restored.edges[0].virtuals, vec!["compress".to_string()]);
    }

    #[test]
    fn test_traverse_visits_shared_node_once() {
        let shared = concrete("shared", "1.0");
        let mut a = Spec::new("a");
        a.versions = VersionConstraint::exact(Version::new("1.0"));
        a.add_dependency_edge(shared.clone(), crate::deptype::DEFAULT, vec![], false);
        let a = a.finalize().unwrap();

        let mut root = Spec::new("root");
        root.versions = VersionConstraint::exact(Version::new("1.0"));
        root.add_dependency_edge(a, crate::deptype::DEFAULT, vec![], false);
        root.add_dependency_edge(shared, crate::deptype::DEFAULT, vec![], false);
        let root = root.finalize().unwrap();

        assert_eq!(root.traverse().len(), 3);
    }
}
