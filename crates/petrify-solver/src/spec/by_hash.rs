use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{ConcretizeError, Result};
use crate::spec::{DepEdge, Spec};

/// Mapping containing concrete specs keyed by DAG hash.
///
/// The mapping is kept consistent: if a spec in the mapping has a dependency
/// with hash X, that dependency is the identical `Arc` as the spec keyed by
/// X. Adding a spec recursively copies and rewires its dependency subgraph
/// to restore the invariant; re-adding a spec whose hash is already present
/// is a no-op.
#[derive(Debug, Default)]
pub struct ConcreteSpecsByHash {
    data: HashMap<String, Arc<Spec>>,
    explicit: HashSet<String>,
}

impl ConcreteSpecsByHash {
    pub fn new() -> ConcreteSpecsByHash {
        ConcreteSpecsByHash::default()
    }

    pub fn get(&self, dag_hash: &str) -> Option<&Arc<Spec>> {
        self.data.get(dag_hash)
    }

    pub fn contains(&self, dag_hash: &str) -> bool {
        self.data.contains_key(dag_hash)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<Spec>)> {
        self.data.iter()
    }

    /// Items that were added explicitly, not just reached as dependencies.
    pub fn explicit_items(&self) -> impl Iterator<Item = (&String, &Arc<Spec>)> {
        self.data
            .iter()
            .filter(|(hash, _)| self.explicit.contains(*hash))
    }

    /// Add a concrete spec. Returns `true` if the spec was added, `false`
    /// if its hash was already present (idempotent re-add).
    pub fn add(&mut self, spec: &Arc<Spec>) -> Result<bool> {
        if !spec.concrete {
            return Err(ConcretizeError::Internal(format!(
                "trying to store the non-concrete spec '{}' in a container that only \
                 accepts concrete specs",
                spec
            )));
        }
        let dag_hash = spec
            .dag_hash()
            .ok_or_else(|| {
                ConcretizeError::Internal(format!("concrete spec '{}' has no hash", spec))
            })?
            .to_string();

        self.explicit.insert(dag_hash.clone());
        if self.data.contains_key(&dag_hash) {
            return Ok(false);
        }

        // Rebuild the subgraph children-first so every edge of a copied node
        // can point at the container's canonical object for that hash.
        for node in post_order(spec) {
            let node_hash = node.dag_hash().expect("concrete node has a hash");
            if self.data.contains_key(node_hash) {
                continue;
            }
            let edges = node
                .edges
                .iter()
                .map(|edge| {
                    let child_hash = edge.spec.dag_hash().expect("concrete child has a hash");
                    DepEdge {
                        spec: self
                            .data
                            .get(child_hash)
                            .expect("children are inserted before parents")
                            .clone(),
                        depflag: edge.depflag,
                        virtuals: edge.virtuals.clone(),
                        direct: edge.direct,
                    }
                })
                .collect();
            let rewired = Arc::new(node.rewired_copy(edges));
            self.data.insert(node_hash.to_string(), rewired);
        }

        Ok(true)
    }
}

/// Children-before-parents order over the dependency DAG, deduplicated by
/// hash, computed with an explicit work stack.
fn post_order(root: &Arc<Spec>) -> Vec<Arc<Spec>> {
    let mut order: Vec<Arc<Spec>> = Vec::new();
    let mut emitted: HashSet<String> = HashSet::new();
    // (node, children already expanded)
    let mut stack: Vec<(Arc<Spec>, bool)> = vec![(root.clone(), false)];

    while let Some((node, expanded)) = stack.pop() {
        let hash = node.dag_hash().expect("concrete node has a hash").to_string();
        if emitted.contains(&hash) {
            continue;
        }
        if expanded {
            emitted.insert(hash);
            order.push(node);
        } else {
            stack.push((node.clone(), true));
            for edge in &node.edges {
                stack.push((edge.spec.clone(), false));
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deptype;
    use petrify_version::{Version, VersionConstraint};

    fn leaf(name: &str, version: &str) -> Arc<Spec> {
        let mut spec = Spec::new(name);
        spec.versions = VersionConstraint::exact(Version::new(version));
        spec.finalize().unwrap()
    }

    fn with_dep(name: &str, version: &str, dep: Arc<Spec>) -> Arc<Spec> {
        let mut spec = Spec::new(name);
        spec.versions = VersionConstraint::exact(Version::new(version));
        spec.add_dependency_edge(dep, deptype::DEFAULT, vec![], false);
        spec.finalize().unwrap()
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut container = ConcreteSpecsByHash::new();
        let spec = leaf("zlib", "1.3");
        assert!(container.add(&spec).unwrap());
        assert!(!container.add(&spec).unwrap());
        assert_eq!(container.len(), 1);
    }

    #[test]
    fn test_rejects_abstract_specs() {
        let mut container = ConcreteSpecsByHash::new();
        let abstract_spec = Arc::new(Spec::parse("zlib@1.3").unwrap());
        assert!(container.add(&abstract_spec).is_err());
    }

    #[test]
    fn test_structural_sharing_across_roots() {
        // Two independently built graphs over an identical dependency: the
        // container must collapse the dependency to one object.
        let mut container = ConcreteSpecsByHash::new();
        let x = with_dep("x", "1.0", leaf("y", "2.0"));
        let z = with_dep("z", "1.0", leaf("y", "2.0"));
        container.add(&x).unwrap();
        container.add(&z).unwrap();

        let x = container.get(x.dag_hash().unwrap()).unwrap();
        let z = container.get(z.dag_hash().unwrap()).unwrap();
        assert!(Arc::ptr_eq(&x.edges[0].spec, &z.edges[0].spec));
        assert_eq!(container.len(), 3);
    }

    #[test]
    fn test_explicit_items_exclude_dependencies() {
        let mut container = ConcreteSpecsByHash::new();
        let root = with_dep("x", "1.0", leaf("y", "2.0"));
        container.add(&root).unwrap();

        let explicit: Vec<_> = container.explicit_items().map(|(_, s)| s.name.clone()).collect();
        assert_eq!(explicit, vec!["x".to_string()]);
    }
}
