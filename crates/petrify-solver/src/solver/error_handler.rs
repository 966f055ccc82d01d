//! Diagnostics for solver-encoded errors.
//!
//! Error conditions are weighted facts inside a nominally satisfiable
//! model. Each carries a priority, a message template with positional
//! `{n}` arguments and, optionally, a chain of condition back-pointers
//! after a `startcauses` marker, rendered as an indented tree of
//! "required because ..." lines.

use std::collections::HashSet;

use regex::Regex;

use crate::error::{ConcretizeError, Result};
use crate::solver::fact::{Atom, Fact};
use crate::spec::Spec;

/// One decoded error fact.
#[derive(Debug, Clone)]
struct SolverErrorFact {
    priority: i64,
    template: String,
    args: Vec<String>,
    /// (condition id, condition set id) pairs after `startcauses`.
    causes: Vec<(i64, i64)>,
}

pub struct ErrorHandler<'a> {
    model: &'a [Fact],
    input_specs: &'a [Spec],
}

impl<'a> ErrorHandler<'a> {
    pub fn new(model: &'a [Fact], input_specs: &'a [Spec]) -> ErrorHandler<'a> {
        ErrorHandler { model, input_specs }
    }

    fn errors(&self) -> Vec<SolverErrorFact> {
        let mut errors: Vec<SolverErrorFact> = Vec::new();
        for fact in self.model {
            if fact.name != "error" {
                continue;
            }
            let priority = fact.args.first().and_then(Atom::as_int).unwrap_or(0);
            let template = fact
                .args
                .get(1)
                .and_then(Atom::as_str)
                .unwrap_or("")
                .to_string();
            let rest: Vec<&Atom> = fact.args.iter().skip(2).collect();

            let marker = rest
                .iter()
                .position(|a| a.as_str() == Some("startcauses"));
            let (msg_atoms, cause_atoms) = match marker {
                Some(idx) => (&rest[..idx], &rest[idx + 1..]),
                None => (&rest[..], &rest[..0]),
            };

            let args: Vec<String> = msg_atoms
                .iter()
                .map(|a| match a {
                    Atom::Str(s) => s.clone(),
                    Atom::Int(i) => i.to_string(),
                    other => format!("{other}"),
                })
                .collect();
            let causes: Vec<(i64, i64)> = cause_atoms
                .chunks(2)
                .filter_map(|pair| match pair {
                    [cond, set] => Some((cond.as_int()?, set.as_int()?)),
                    _ => None,
                })
                .collect();

            errors.push(SolverErrorFact {
                priority,
                template,
                args,
                causes,
            });
        }
        // highest priority first
        errors.sort_by(|a, b| b.priority.cmp(&a.priority));
        errors
    }

    /// Condition reasons recorded in the model.
    fn condition_reasons(&self) -> Vec<(i64, String)> {
        self.model
            .iter()
            .filter(|f| f.name == "condition_reason")
            .filter_map(|f| {
                Some((
                    f.args.first().and_then(Atom::as_int)?,
                    f.args.get(1).and_then(Atom::as_str)?.to_string(),
                ))
            })
            .collect()
    }

    /// (effect, cause) pairs recorded in the model, where each side is a
    /// (condition id, condition set id) pair.
    fn condition_causes(&self) -> Vec<((i64, i64), (i64, i64))> {
        self.model
            .iter()
            .filter(|f| f.name == "condition_cause")
            .filter_map(|f| {
                Some((
                    (
                        f.args.first().and_then(Atom::as_int)?,
                        f.args.get(1).and_then(Atom::as_int)?,
                    ),
                    (
                        f.args.get(2).and_then(Atom::as_int)?,
                        f.args.get(3).and_then(Atom::as_int)?,
                    ),
                ))
            })
            .collect()
    }

    /// Expand a cause chain into indented "required because ..." lines,
    /// with an explicit work stack and cycle protection keyed on
    /// (condition id, set id) pairs.
    pub fn get_cause_tree(&self, root: (i64, i64)) -> Vec<String> {
        let reasons = self.condition_reasons();
        let causes = self.condition_causes();

        let mut lines: Vec<String> = Vec::new();
        let mut seen: HashSet<(i64, i64)> = HashSet::new();
        let mut stack: Vec<((i64, i64), String)> = vec![(root, "        ".to_string())];

        while let Some((cause, indent)) = stack.pop() {
            if !seen.insert(cause) {
                continue;
            }
            let reason = reasons
                .iter()
                .find(|(id, _)| *id == cause.0)
                .map(|(_, msg)| msg.clone())
                .unwrap_or_else(|| format!("condition {}", cause.0));
            lines.push(format!("{indent}required because {reason} "));

            // parents in reverse so the first recorded cause is printed
            // first
            for (effect, parent) in causes.iter().rev() {
                if *effect == cause && !seen.contains(parent) {
                    stack.push((*parent, format!("{indent}  ")));
                }
            }
        }
        lines
    }

    /// Render one error: format the template, then append cause trees.
    fn handle_error(&self, error: &SolverErrorFact) -> String {
        let mut msg = error.template.clone();
        for (i, arg) in error.args.iter().enumerate() {
            msg = msg.replace(&format!("{{{i}}}"), arg);
        }

        // Spec(...) placeholders are replaced with the canonical spec text
        let spec_re = Regex::new(r"Spec\(([^)]*)\)").expect("valid regex");
        let replaced = spec_re
            .replace_all(&msg, |caps: &regex::Captures| {
                match Spec::parse(&caps[1]) {
                    Ok(spec) => spec.to_string(),
                    Err(_) => caps[1].to_string(),
                }
            })
            .to_string();
        msg = replaced;

        let mut unique_causes: Vec<(i64, i64)> = Vec::new();
        for cause in &error.causes {
            if !unique_causes.contains(cause) {
                unique_causes.push(*cause);
            }
        }
        for cause in unique_causes {
            for line in self.get_cause_tree(cause) {
                msg.push('\n');
                msg.push_str(&line);
            }
        }
        msg
    }

    fn message(&self, errors: &[SolverErrorFact]) -> String {
        let input_specs: Vec<String> = self
            .input_specs
            .iter()
            .map(|s| format!("`{s}`"))
            .collect();
        let input_specs = elide_list(&input_specs, 5).join(", ");
        let mut out = format!("failed to concretize {input_specs} for the following reasons:");
        for (idx, error) in errors.iter().enumerate() {
            out.push_str(&format!("\n    {:2}. {}", idx + 1, self.handle_error(error)));
        }
        out
    }

    /// Error facts always abort concretization, even though the underlying
    /// search succeeded.
    pub fn raise_if_errors(&self) -> Result<()> {
        let errors = self.errors();
        if errors.is_empty() {
            return Ok(());
        }
        Err(ConcretizeError::Unsatisfiable(self.message(&errors)))
    }
}

/// Shorten a long list for display: first elements, an ellipsis, then the
/// last element.
pub fn elide_list(items: &[String], max: usize) -> Vec<String> {
    if items.len() <= max {
        return items.to_vec();
    }
    let mut out: Vec<String> = items[..max - 1].to_vec();
    out.push("...".to_string());
    out.push(items[items.len() - 1].clone());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::fact::atoms;

    fn error_fact(priority: usize, template: &str, args: Vec<Atom>) -> Fact {
        let mut all = atoms![priority, template];
        all.extend(args);
        Fact::new("error", all)
    }

    #[test]
    fn test_no_errors_is_ok() {
        let model = vec![Fact::new("attr", atoms!["node"])];
        let specs = vec![Spec::parse("a").unwrap()];
        assert!(ErrorHandler::new(&model, &specs).raise_if_errors().is_ok());
    }

    #[test]
    fn test_errors_sorted_by_priority() {
        let model = vec![
            error_fact(10, "minor issue with {0}", atoms!["a"]),
            error_fact(1000, "major issue with {0}", atoms!["b"]),
        ];
        let specs = vec![Spec::parse("a").unwrap()];
        let handler = ErrorHandler::new(&model, &specs);
        let err = handler.raise_if_errors().unwrap_err();
        let text = err.to_string();
        let major = text.find("major issue with b").unwrap();
        let minor = text.find("minor issue with a").unwrap();
        assert!(major < minor);
        assert!(text.starts_with("failed to concretize `a`"));
    }

    #[test]
    fn test_cause_tree_with_cycle_protection() {
        let model = vec![
            Fact::new("condition_reason", atoms![1usize, "x depends on y"]),
            Fact::new("condition_reason", atoms![2usize, "y requested explicitly"]),
            // 1 caused by 2, and a self-referential cause on 2
            Fact::new("condition_cause", atoms![1usize, 0usize, 2usize, 0usize]),
            Fact::new("condition_cause", atoms![2usize, 0usize, 2usize, 0usize]),
        ];
        let specs = vec![Spec::parse("x").unwrap()];
        let handler = ErrorHandler::new(&model, &specs);
        let tree = handler.get_cause_tree((1, 0));
        assert_eq!(tree.len(), 2);
        assert!(tree[0].contains("x depends on y"));
        assert!(tree[1].contains("y requested explicitly"));
        assert!(tree[1].starts_with("          "));
    }

    #[test]
    fn test_elide_list() {
        let items: Vec<String> = (0..8).map(|i| i.to_string()).collect();
        let elided = elide_list(&items, 5);
        assert_eq!(elided.len(), 6);
        assert_eq!(elided[4], "...");
        assert_eq!(elided[5], "7");
    }
}
