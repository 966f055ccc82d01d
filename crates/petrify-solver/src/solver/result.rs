//! The serializable outcome of one solve.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{json, Value};

use crate::error::{ConcretizeError, Result};
use crate::solver::fact::NodeArgument;
use crate::spec::Spec;

/// Priority offset for "build" criteria: criteria shifted to a higher
/// priority for specs that have to be built.
pub const BUILD_PRIORITY_OFFSET: i64 = 200;

/// Priority offset of "fixed" criteria (those without build criteria).
pub const FIXED_PRIORITY_OFFSET: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OptimizationKind {
    Build,
    Concrete,
    Other,
}

/// One named optimization criterion with its achieved value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OptimizationCriteria {
    pub priority: i64,
    pub value: i64,
    pub name: String,
    pub kind: OptimizationKind,
}

/// Construct an ordered mapping from criteria names to costs.
///
/// Criteria with a priority below the fixed offset have an associated
/// build priority: the same criterion counted separately for nodes that
/// have to be built.
pub fn build_criteria_names(
    costs: &[i64],
    arg_tuples: &[(i64, String)],
) -> Vec<OptimizationCriteria> {
    let mut priorities_names: Vec<(i64, String, OptimizationKind)> = Vec::new();
    for (priority, name) in arg_tuples {
        if *priority < FIXED_PRIORITY_OFFSET {
            priorities_names.push((*priority, name.clone(), OptimizationKind::Concrete));
            priorities_names.push((
                *priority + BUILD_PRIORITY_OFFSET,
                name.clone(),
                OptimizationKind::Build,
            ));
        } else {
            priorities_names.push((*priority, name.clone(), OptimizationKind::Other));
        }
    }
    priorities_names.sort_by(|a, b| (b.0, &b.1).cmp(&(a.0, &a.1)));

    // error-type criteria come first in the cost vector and have no names
    let error_criteria = costs.len().saturating_sub(priorities_names.len());
    let costs = &costs[error_criteria..];

    priorities_names
        .into_iter()
        .zip(costs.iter())
        .map(|((priority, name, kind), value)| OptimizationCriteria {
            priority,
            value: *value,
            name,
            kind,
        })
        .collect()
}

/// One candidate answer: a cost vector and the concrete spec per node.
#[derive(Debug, Clone)]
pub struct Answer {
    pub cost: Vec<i64>,
    pub rank: i64,
    pub specs: IndexMap<NodeArgument, Arc<Spec>>,
}

/// Checks satisfiability of a subset of the input facts; retained on
/// unsatisfiable results so cores can be minimized later.
pub trait AssumptionChecker: Send + Sync {
    fn satisfiable_with(&self, active: &[String]) -> bool;
}

/// Result of a concretization solve.
pub struct SolveResult {
    /// Abstract user requests.
    pub abstract_specs: Vec<Spec>,
    pub satisfiable: Option<bool>,
    pub optimal: Option<bool>,
    pub warnings: Vec<String>,
    pub nmodels: usize,
    /// Answers ordered by optimization level.
    pub answers: Vec<Answer>,
    pub criteria: Vec<OptimizationCriteria>,
    /// Raw unsatisfiable cores (input fact strings).
    pub cores: Vec<Vec<String>>,
    /// Retained solver handle for core minimization; not serialized.
    pub(crate) checker: Option<Arc<dyn AssumptionChecker>>,
}

impl std::fmt::Debug for SolveResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolveResult")
            .field("satisfiable", &self.satisfiable)
            .field("nmodels", &self.nmodels)
            .field("answers", &self.answers.len())
            .field("cores", &self.cores.len())
            .finish()
    }
}

impl SolveResult {
    pub fn new(abstract_specs: Vec<Spec>) -> SolveResult {
        SolveResult {
            abstract_specs,
            satisfiable: None,
            optimal: None,
            warnings: Vec::new(),
            nmodels: 0,
            answers: Vec::new(),
            criteria: Vec::new(),
            cores: Vec::new(),
            checker: None,
        }
    }

    /// The best (lexicographically minimal cost) answer.
    pub fn best_answer(&self) -> Option<&Answer> {
        self.answers.iter().min_by(|a, b| a.cost.cmp(&b.cost))
    }

    /// Concrete specs matched to each input, for solved inputs.
    pub fn specs_by_input(&self) -> IndexMap<String, Arc<Spec>> {
        let mut result = IndexMap::new();
        let Some(answer) = self.best_answer() else {
            return result;
        };
        for input in &self.abstract_specs {
            if let Some(spec) = match_input(input, answer) {
                result.insert(input.to_string(), spec);
            }
        }
        result
    }

    /// Concretized specs satisfying the initial abstract request.
    pub fn specs(&self) -> Vec<Arc<Spec>> {
        self.specs_by_input().into_values().collect()
    }

    /// Input specs that were not solved, paired with the best candidate
    /// the solver produced for them (if any).
    pub fn unsolved_specs(&self) -> Vec<(Spec, Option<Arc<Spec>>)> {
        if self.satisfiable != Some(true) {
            return self
                .abstract_specs
                .iter()
                .map(|s| (s.clone(), None))
                .collect();
        }
        let mut unsolved = Vec::new();
        let Some(answer) = self.best_answer() else {
            return unsolved;
        };
        for input in &self.abstract_specs {
            if match_input(input, answer).is_some() {
                continue;
            }
            let candidate = answer
                .specs
                .get(&NodeArgument::make(&input.name))
                .cloned();
            unsolved.push((input.clone(), candidate));
        }
        unsolved
    }

    /// Message describing unsolved input specs and their candidates.
    pub fn format_unsolved(unsolved: &[(Spec, Option<Arc<Spec>>)]) -> String {
        let mut msg = "Unsatisfied input specs:".to_string();
        for (input, candidate) in unsolved {
            msg.push_str(&format!("\n\tInput spec: {input}"));
            match candidate {
                Some(candidate) => msg.push_str(&format!("\n\tCandidate spec: {candidate}")),
                None => msg.push_str("\n\t(No candidate specs from solver)"),
            }
        }
        msg
    }

    /// Sorted, human-readable form of one core.
    pub fn format_core(core: &[String]) -> Vec<String> {
        let mut lines: Vec<String> = core.to_vec();
        lines.sort();
        lines
    }

    /// Return a subset-minimal subset of the core.
    ///
    /// Cores may be much larger than necessary; greedily drop one fact at
    /// a time and keep it only if its removal makes the rest satisfiable.
    /// This is O(|core|) re-solves and yields a subset-minimal (not
    /// necessarily globally minimum) explanation.
    pub fn minimize_core(&self, core: &[String]) -> Result<Vec<String>> {
        let checker = self.checker.as_ref().ok_or_else(|| {
            ConcretizeError::Internal(
                "result solver handle not populated; cannot minimize cores".to_string(),
            )
        })?;
        let mut min_core: Vec<String> = core.to_vec();
        for fact in core {
            let without: Vec<String> =
                min_core.iter().filter(|f| *f != fact).cloned().collect();
            if checker.satisfiable_with(&without) {
                // removing the fact restores satisfiability: essential
                continue;
            }
            min_core = without;
        }
        Ok(min_core)
    }

    pub fn minimal_cores(&self) -> Result<Vec<Vec<String>>> {
        self.cores
            .iter()
            .map(|core| self.minimize_core(core))
            .collect()
    }

    pub fn format_minimal_cores(&self) -> Result<Vec<String>> {
        let mut lines: Vec<String> = Vec::new();
        for core in self.minimal_cores()? {
            if !lines.is_empty() {
                lines.push(String::new());
            }
            lines.extend(SolveResult::format_core(&core));
        }
        Ok(lines)
    }

    /// Raise an appropriate error if the result is unsatisfiable, with the
    /// minimized cores formatted to be human readable.
    pub fn raise_if_unsat(&self) -> Result<()> {
        if self.satisfiable == Some(true) {
            return Ok(());
        }
        let constraints: Vec<String> = self
            .abstract_specs
            .iter()
            .map(|s| s.to_string())
            .collect();
        // fall back to the raw cores when no solver handle is available
        let conflicts = self.format_minimal_cores().unwrap_or_else(|_| {
            self.cores
                .iter()
                .flat_map(|core| SolveResult::format_core(core))
                .collect()
        });
        let mut msg = format!("{} is unsatisfiable", constraints.join(", "));
        if !conflicts.is_empty() {
            msg.push_str(", errors are:");
            for conflict in conflicts {
                msg.push_str(&format!("\n    {conflict}"));
            }
        }
        Err(ConcretizeError::Unsatisfiable(msg))
    }

    // -----------------------------------------------------------------
    // serialization
    // -----------------------------------------------------------------

    /// JSON representation. Unsatisfiability data is not included; only
    /// satisfiable results are worth persisting.
    pub fn to_json(&self) -> Value {
        let answers: Vec<Value> = self
            .answers
            .iter()
            .map(|answer| {
                let mut by_node = serde_json::Map::new();
                for (node, spec) in &answer.specs {
                    let key = json!({ "id": node.id.to_string(), "pkg": node.pkg }).to_string();
                    by_node.insert(key, spec.to_json());
                }
                json!([answer.cost, answer.rank, Value::Object(by_node)])
            })
            .collect();

        let mut specs_by_input = serde_json::Map::new();
        for (input, spec) in self.specs_by_input() {
            specs_by_input.insert(input, spec.to_json());
        }

        json!({
            "criteria": serde_json::to_value(&self.criteria).unwrap_or(Value::Null),
            "optimal": self.optimal,
            "warnings": self.warnings,
            "nmodels": self.nmodels,
            "abstract_specs": self.abstract_specs.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            "satisfiable": self.satisfiable,
            "answers": answers,
            "specs_by_input": Value::Object(specs_by_input),
        })
    }

    /// Rebuild a result from its [`SolveResult::to_json`] form.
    pub fn from_json(value: &Value) -> Result<SolveResult> {
        let spec_strings = value
            .get("abstract_specs")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ConcretizeError::Internal("invalid JSON for concretization result".to_string())
            })?;
        let abstract_specs: Vec<Spec> = spec_strings
            .iter()
            .filter_map(Value::as_str)
            .map(Spec::parse)
            .collect::<Result<_>>()?;

        let mut result = SolveResult::new(abstract_specs);
        result.satisfiable = value.get("satisfiable").and_then(Value::as_bool);
        result.optimal = value.get("optimal").and_then(Value::as_bool);
        result.nmodels = value
            .get("nmodels")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        result.warnings = value
            .get("warnings")
            .and_then(Value::as_array)
            .map(|w| {
                w.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if let Some(criteria) = value.get("criteria") {
            result.criteria = serde_json::from_value(criteria.clone()).unwrap_or_default();
        }

        for answer in value
            .get("answers")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let cost: Vec<i64> = answer
                .get(0)
                .and_then(Value::as_array)
                .map(|c| c.iter().filter_map(Value::as_i64).collect())
                .unwrap_or_default();
            let rank = answer.get(1).and_then(Value::as_i64).unwrap_or(0);
            let mut specs: IndexMap<NodeArgument, Arc<Spec>> = IndexMap::new();
            for (key, spec_value) in answer
                .get(2)
                .and_then(Value::as_object)
                .into_iter()
                .flatten()
            {
                let node_value: Value = serde_json::from_str(key)?;
                let node = NodeArgument {
                    id: node_value
                        .get("id")
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0),
                    pkg: node_value
                        .get("pkg")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                };
                specs.insert(node, Spec::from_json(spec_value)?);
            }
            result.answers.push(Answer { cost, rank, specs });
        }

        Ok(result)
    }
}

/// Find the concrete spec in an answer satisfying an input request;
/// virtual inputs match the provider that satisfies them.
fn match_input(input: &Spec, answer: &Answer) -> Option<Arc<Spec>> {
    let node = NodeArgument::make(&input.name);
    if let Some(candidate) = answer.specs.get(&node) {
        if candidate.satisfies(input) {
            return Some(candidate.clone());
        }
        // an explicit splice may have replaced the matching spec; the
        // build spec still satisfies the input
        if candidate.build_spec.is_some() {
            return Some(candidate.clone());
        }
        return None;
    }
    // virtual input: some node must satisfy the request modulo the name
    for candidate in answer.specs.values() {
        let mut renamed = input.clone();
        renamed.name = candidate.name.clone();
        if candidate.satisfies(&renamed) {
            return Some(candidate.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use petrify_version::{Version, VersionConstraint};

    fn concrete(name: &str, version: &str) -> Arc<Spec> {
        let mut spec = Spec::new(name);
        spec.versions = VersionConstraint::exact(Version::new(version));
        spec.finalize().unwrap()
    }

    fn satisfiable_result() -> SolveResult {
        let mut result = SolveResult::new(vec![Spec::parse("a").unwrap()]);
        result.satisfiable = Some(true);
        result.optimal = Some(true);
        result.nmodels = 1;
        let mut specs = IndexMap::new();
        specs.insert(NodeArgument::make("a"), concrete("a", "1.0"));
        specs.insert(NodeArgument::make("b"), concrete("b", "2.0"));
        result.answers.push(Answer {
            cost: vec![0, 1],
            rank: 0,
            specs,
        });
        result.criteria = vec![OptimizationCriteria {
            priority: 150,
            value: 1,
            name: "number of packages to build (vs. reuse)".to_string(),
            kind: OptimizationKind::Other,
        }];
        result
    }

    #[test]
    fn test_specs_by_input() {
        let result = satisfiable_result();
        let by_input = result.specs_by_input();
        assert_eq!(by_input.len(), 1);
        assert_eq!(by_input["a"].name, "a");
        assert!(result.unsolved_specs().is_empty());
    }

    #[test]
    fn test_json_round_trip() {
        let result = satisfiable_result();
        let restored = SolveResult::from_json(&result.to_json()).unwrap();

        assert_eq!(restored.satisfiable, result.satisfiable);
        assert_eq!(restored.criteria, result.criteria);
        assert_eq!(restored.answers.len(), 1);
        let original_hashes: Vec<Option<&str>> = result.answers[0]
            .specs
            .values()
            .map(|s| s.dag_hash())
            .collect();
        let restored_hashes: Vec<Option<&str>> = restored.answers[0]
            .specs
            .values()
            .map(|s| s.dag_hash())
            .collect();
        for hash in original_hashes {
            assert!(restored_hashes.contains(&hash));
        }
    }

    #[test]
    fn test_build_criteria_names_doubles_low_priorities() {
        let names = vec![(70i64, "version weight".to_string())];
        let costs = vec![3i64, 5];
        let criteria = build_criteria_names(&costs, &names);
        assert_eq!(criteria.len(), 2);
        assert_eq!(criteria[0].priority, 270);
        assert_eq!(criteria[0].kind, OptimizationKind::Build);
        assert_eq!(criteria[0].value, 3);
        assert_eq!(criteria[1].priority, 70);
        assert_eq!(criteria[1].kind, OptimizationKind::Concrete);
        assert_eq!(criteria[1].value, 5);
    }

    #[test]
    fn test_raise_if_unsat() {
        let mut result = SolveResult::new(vec![Spec::parse("a +foo ~foo").unwrap()]);
        result.satisfiable = Some(false);
        result
            .cores
            .push(vec!["attr(\"variant_set\",\"a\",\"foo\",\"true\")".to_string()]);
        let err = result.raise_if_unsat().unwrap_err();
        assert!(err.to_string().contains("unsatisfiable"));
    }
}
