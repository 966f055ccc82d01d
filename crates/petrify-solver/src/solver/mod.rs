//! The concretization engine.
//!
//! Resolves abstract package requests into fully concrete, mutually
//! consistent dependency graphs by compiling the request and all candidate
//! package metadata into a ground fact program and delegating the search
//! to a solver backend.
//!
//! # Architecture
//!
//! - [`ProgramBuilder`]: append-only emitter of typed ground facts with
//!   deterministic ordering
//! - [`SolverSetup`]: the constraint encoder; walks possible packages,
//!   versions, variants, virtuals, externals, requirements and compilers,
//!   deduplicating conditions through the trigger/effect caches
//! - [`SolveDriver`]: owns the solver session: cache lookup, rule module
//!   selection, time budget, model selection and result assembly
//! - [`SpecBuilder`]: the answer interpreter; deterministically rebuilds a
//!   hash-consed dependency DAG from the model's flat attribute tuples
//! - [`ErrorHandler`] and the cores on [`SolveResult`]: diagnostics for
//!   solver-encoded errors and over-constrained inputs
//! - [`ConcretizationCache`]: persistent, size/age-bounded store of
//!   results keyed by problem hash
//!
//! # Example
//!
//! ```ignore
//! use petrify_solver::{ConcretizerConfig, PlatformInfo, Repo, Solver, Spec};
//!
//! let repo = Repo::new();
//! // ... add package definitions to the repo
//! let platform = PlatformInfo::default();
//! let config = ConcretizerConfig::default();
//!
//! let solver = Solver::new(&repo, &platform, &[], &config);
//! let result = solver.solve(&[Spec::parse("curl +ssl")?])?;
//! for spec in result.specs() {
//!     println!("{spec}");
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod condition;
pub mod driver;
pub mod error_handler;
pub mod fact;
pub mod result;
pub mod setup;
pub mod spec_builder;
pub mod versions;

#[cfg(test)]
mod tests;

pub use backend::{BackendOutcome, BackendRequest, GreedyBackend, Model, RuleModules, SolverBackend};
pub use cache::ConcretizationCache;
pub use condition::{ConditionContext, ConstraintOrigin, FactTransform};
pub use driver::{OutputConfiguration, SolveDriver, SolveOptions, Solver};
pub use error_handler::ErrorHandler;
pub use fact::{Atom, Fact, NodeArgument, ProgramBuilder};
pub use result::{
    build_criteria_names, Answer, OptimizationCriteria, OptimizationKind, SolveResult,
};
pub use setup::{Program, SolverSetup, Tests};
pub use spec_builder::SpecBuilder;
pub use versions::{DeclaredVersion, Provenance};
