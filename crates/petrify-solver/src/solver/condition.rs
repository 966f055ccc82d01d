//! Conditions and the trigger/effect caches.
//!
//! Every conditional relationship (dependency, conflict, provision,
//! requirement, external, splice) is reduced to a *trigger* (facts that
//! must hold) and an optional *effect* (facts imposed once it does). Both
//! halves are deduplicated by (spec text, transform): identical conditions
//! across packages share one encoded rule.

use indexmap::IndexMap;

use crate::deptype::{self, DepFlag};
use crate::solver::fact::{atoms, Atom, Fact};
use crate::spec::Spec;

/// Origin suffix attached to constraint sources, so the answer interpreter
/// can later tell apart flags contributed by dependents, requirements and
/// conditional specs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOrigin {
    ConditionalSpec,
    DependsOn,
    Require,
}

impl ConstraintOrigin {
    fn suffix(&self) -> &'static str {
        match self {
            ConstraintOrigin::ConditionalSpec => "_cond",
            ConstraintOrigin::DependsOn => "_dep",
            ConstraintOrigin::Require => "_req",
        }
    }

    pub fn append_type_suffix(pkg_id: &str, kind: ConstraintOrigin) -> String {
        format!("{}{}", pkg_id, kind.suffix())
    }

    /// Split a combined source back into its origin and package id.
    /// Returns `None` origin for sources without a known suffix.
    pub fn strip_type_suffix(source: &str) -> (Option<ConstraintOrigin>, &str) {
        for kind in [
            ConstraintOrigin::ConditionalSpec,
            ConstraintOrigin::DependsOn,
            ConstraintOrigin::Require,
        ] {
            if let Some(stripped) = source.strip_suffix(kind.suffix()) {
                return (Some(kind), stripped);
            }
        }
        (None, source)
    }

    /// Rank used when ordering flag groups: dependencies and conditional
    /// specs sort before requirements.
    pub fn order_rank(origin: Option<ConstraintOrigin>) -> i64 {
        match origin {
            Some(ConstraintOrigin::ConditionalSpec) => 0,
            Some(ConstraintOrigin::DependsOn) => 1,
            Some(ConstraintOrigin::Require) => 2,
            None => 3,
        }
    }
}

/// Post-processing applied to the fact list generated from a condition
/// spec. A closed enumeration (rather than arbitrary callbacks) so that
/// transforms can participate in cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FactTransform {
    /// Remove bare node-existence facts (the default for imposed specs).
    RemoveNodeFacts,
    /// Remove `depends_on` facts (requirement triggers).
    RemoveDependsOn,
    /// Remove node-existence and `depends_on` facts (requirement effects
    /// for non-virtual requirements).
    RemoveNodeAndDependsOn,
    /// Tag the trigger with `track_dependencies` (dependency triggers).
    TrackDependencies,
    /// Strip node facts and add `dependency_holds` per dependency type
    /// (dependency effects).
    DependencyHolds { pkg: String, depflag: DepFlag },
    /// Keep only facts about the external spec itself (external triggers).
    ExternalRequirement,
    /// External effects: own-package facts plus the selected-slot marker.
    ExternalImposition { index: usize },
    /// Replace `virtual_node` facts with `uses_virtual` on the parent
    /// (conditional-dependency triggers).
    UsesVirtual,
    /// Leave the fact list unchanged.
    Identity,
}

impl FactTransform {
    pub fn apply(&self, spec: &Spec, facts: Vec<Fact>) -> Vec<Fact> {
        match self {
            FactTransform::Identity => facts,
            FactTransform::RemoveNodeFacts => remove_attrs(facts, &["node", "virtual_node"]),
            FactTransform::RemoveDependsOn => remove_attrs(facts, &["depends_on"]),
            FactTransform::RemoveNodeAndDependsOn => {
                remove_attrs(facts, &["node", "virtual_node", "depends_on"])
            }
            FactTransform::TrackDependencies => {
                let mut facts = facts;
                facts.push(Fact::attr("track_dependencies", atoms![&spec.name]));
                facts
            }
            FactTransform::DependencyHolds { pkg, depflag } => {
                let mut result = remove_attrs(facts, &["node", "virtual_node"]);
                for flag in deptype::flag_to_parts(*depflag) {
                    result.push(Fact::attr(
                        "dependency_holds",
                        atoms![pkg, &spec.name, deptype::flag_to_str(flag)],
                    ));
                }
                result
            }
            FactTransform::ExternalRequirement => facts
                .into_iter()
                .filter(|f| {
                    f.attr_name() != Some("depends_on")
                        && f.attr_args().first().and_then(Atom::as_str) == Some(spec.name.as_str())
                })
                .collect(),
            FactTransform::ExternalImposition { index } => {
                let mut result: Vec<Fact> = facts
                    .into_iter()
                    .filter(|f| {
                        f.attr_name() != Some("depends_on")
                            && f.attr_args().first().and_then(Atom::as_str) == Some(spec.name.as_str())
                    })
                    .collect();
                result.push(Fact::attr(
                    "external_conditions_hold",
                    atoms![&spec.name, *index],
                ));
                result
            }
            FactTransform::UsesVirtual => {
                let mut result = remove_attrs(facts, &["virtual_node"]);
                for (parent, edge) in spec.traverse_edges() {
                    for virtual_name in &edge.virtuals {
                        result.push(Fact::attr(
                            "uses_virtual",
                            atoms![&parent.name, virtual_name],
                        ));
                    }
                }
                result
            }
        }
    }
}

fn remove_attrs(facts: Vec<Fact>, names: &[&str]) -> Vec<Fact> {
    facts
        .into_iter()
        .filter(|f| match f.attr_name() {
            Some(name) => !names.contains(&name),
            None => true,
        })
        .collect()
}

/// Context for one half of a condition (trigger or effect).
#[derive(Debug, Clone, Default)]
pub struct ConditionIdContext {
    pub source: Option<String>,
    pub transform: Option<FactTransform>,
    pub wrap_node_requirement: Option<bool>,
}

/// Context in which a whole condition is generated (e.g. a `depends_on`
/// directive). May modify the clause sets generated for the required and
/// imposed specs.
#[derive(Debug, Clone, Default)]
pub struct ConditionContext {
    pub source: Option<String>,
    /// Transformation for facts from the required spec. `None` leaves the
    /// facts as they are.
    pub transform_required: Option<FactTransform>,
    /// Transformation for facts from the imposed spec. `None` means the
    /// default of removing bare node facts.
    pub transform_imposed: Option<FactTransform>,
    /// Whether direct-dependency facts are wrapped as node requirements.
    /// `None` uses the default: wrap in rule heads, not in rule bodies.
    pub wrap_node_requirement: Option<bool>,
}

impl ConditionContext {
    pub fn requirement_context(&self) -> ConditionIdContext {
        ConditionIdContext {
            source: self.source.clone(),
            transform: self.transform_required.clone(),
            wrap_node_requirement: self.wrap_node_requirement,
        }
    }

    pub fn impose_context(&self) -> ConditionIdContext {
        ConditionIdContext {
            source: self.source.clone(),
            transform: self.transform_imposed.clone(),
            wrap_node_requirement: self.wrap_node_requirement,
        }
    }
}

/// Key identifying one cached trigger or effect.
type ConditionKey = (String, Option<FactTransform>);

/// Cache of trigger or effect clause-sets, grouped by package name.
/// Iteration order is deterministic; the cache is flushed to facts once
/// per package after all directives have been visited.
#[derive(Debug, Default)]
pub struct ConditionCache {
    entries: IndexMap<String, IndexMap<ConditionKey, (u64, Vec<Fact>)>>,
}

impl ConditionCache {
    pub fn new() -> ConditionCache {
        ConditionCache::default()
    }

    pub fn get(&self, pkg: &str, key: &ConditionKey) -> Option<&(u64, Vec<Fact>)> {
        self.entries.get(pkg).and_then(|cache| cache.get(key))
    }

    pub fn insert(&mut self, pkg: &str, key: ConditionKey, id: u64, facts: Vec<Fact>) {
        self.entries
            .entry(pkg.to_string())
            .or_default()
            .insert(key, (id, facts));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain all cached entries in deterministic order:
    /// (pkg, spec text, id, facts).
    pub fn drain(&mut self) -> Vec<(String, String, u64, Vec<Fact>)> {
        let mut result = Vec::new();
        let entries = std::mem::take(&mut self.entries);
        for (pkg, cache) in entries {
            for ((spec_str, _), (id, facts)) in cache {
                result.push((pkg.clone(), spec_str, id, facts));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_suffix_round_trip() {
        let source = ConstraintOrigin::append_type_suffix("curl", ConstraintOrigin::DependsOn);
        assert_eq!(source, "curl_dep");
        let (origin, pkg) = ConstraintOrigin::strip_type_suffix(&source);
        assert_eq!(origin, Some(ConstraintOrigin::DependsOn));
        assert_eq!(pkg, "curl");

        let (origin, pkg) = ConstraintOrigin::strip_type_suffix("literal");
        assert_eq!(origin, None);
        assert_eq!(pkg, "literal");
    }

    #[test]
    fn test_remove_node_facts() {
        let spec = Spec::parse("zlib").unwrap();
        let facts = vec![
            Fact::attr("node", atoms!["zlib"]),
            Fact::attr("version", atoms!["zlib", "1.3"]),
        ];
        let out = FactTransform::RemoveNodeFacts.apply(&spec, facts);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].attr_name(), Some("version"));
    }

    #[test]
    fn test_dependency_holds_adds_one_fact_per_type() {
        let spec = Spec::parse("zlib").unwrap();
        let out = FactTransform::DependencyHolds {
            pkg: "curl".to_string(),
            depflag: deptype::DEFAULT,
        }
        .apply(&spec, vec![Fact::attr("node", atoms!["zlib"])]);
        let holds: Vec<String> = out
            .iter()
            .filter(|f| f.attr_name() == Some("dependency_holds"))
            .map(|f| f.to_string())
            .collect();
        assert_eq!(holds.len(), 2);
        assert!(holds[0].contains("\"build\""));
        assert!(holds[1].contains("\"link\""));
    }

    #[test]
    fn test_cache_deduplicates_by_spec_and_transform() {
        let mut cache = ConditionCache::new();
        let key = ("zlib@1.3".to_string(), Some(FactTransform::RemoveNodeFacts));
        cache.insert("zlib", key.clone(), 7, vec![]);
        assert!(cache.get("zlib", &key).is_some());

        let other = ("zlib@1.3".to_string(), None);
        assert!(cache.get("zlib", &other).is_none());
    }
}
