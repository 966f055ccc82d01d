//! The solve driver and the main solver facade.
//!
//! The driver owns one solver session: it builds the problem instance,
//! consults the concretization cache, runs the backend under the
//! configured time budget, interprets the winning model and assembles the
//! [`SolveResult`]. The [`Solver`] facade validates inputs, wires the
//! collaborators together and exposes `solve` / `solve_in_rounds`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ConcretizerConfig;
use crate::error::{ConcretizeError, Result};
use crate::package::PackageRepository;
use crate::platform::{Compiler, PlatformInfo};
use crate::solver::backend::{
    BackendRequest, GreedyBackend, RuleModules, SolverBackend,
};
use crate::solver::cache::ConcretizationCache;
use crate::solver::error_handler::{elide_list, ErrorHandler};
use crate::solver::result::{build_criteria_names, Answer, AssumptionChecker, SolveResult};
use crate::solver::setup::{Program, SolverSetup, Tests};
use crate::solver::spec_builder::SpecBuilder;
use crate::spec::Spec;

/// What a solve should output besides the result itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfiguration {
    /// Log coarse timers for the solve phases.
    pub timers: bool,
    /// Log the backend's internal statistics.
    pub stats: bool,
    /// Stop after problem generation, without solving.
    pub setup_only: bool,
}

/// Options for one solve.
#[derive(Debug, Clone, Default)]
pub struct SolveOptions {
    pub tests: Tests,
    pub allow_deprecated: bool,
    pub setup_only: bool,
    pub timers: bool,
    pub stats: bool,
    /// Additional concrete specs that may be reused.
    pub reuse: Vec<Arc<Spec>>,
}

/// Fixed rule modules shipped with the crate. Their bytes participate in
/// the cache key, so any rule change invalidates old cache entries.
const RULE_FILES: [(&str, &str); 8] = [
    ("concretize", include_str!("../../rules/concretize.rules")),
    ("heuristic", include_str!("../../rules/heuristic.rules")),
    ("display", include_str!("../../rules/display.rules")),
    (
        "direct_dependency",
        include_str!("../../rules/direct_dependency.rules"),
    ),
    (
        "when_possible",
        include_str!("../../rules/when_possible.rules"),
    ),
    (
        "os_compatibility",
        include_str!("../../rules/os_compatibility.rules"),
    ),
    (
        "libc_compatibility",
        include_str!("../../rules/libc_compatibility.rules"),
    ),
    ("splices", include_str!("../../rules/splices.rules")),
];

fn rule_file(name: &str) -> &'static str {
    RULE_FILES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, content)| *content)
        .expect("rule module exists")
}

/// Re-solves the program with a subset of input facts, for core
/// minimization. Retained on unsatisfiable results.
struct BackendChecker {
    program: Program,
    request: BackendRequest,
    backend: Arc<GreedyBackend>,
}

impl AssumptionChecker for BackendChecker {
    fn satisfiable_with(&self, active: &[String]) -> bool {
        self.backend
            .satisfiable_with(&self.program, &self.request, active)
    }
}

/// Driver for one solver session at a time.
pub struct SolveDriver {
    backend: Arc<GreedyBackend>,
    cache: Option<Arc<ConcretizationCache>>,
}

impl SolveDriver {
    pub fn new() -> SolveDriver {
        SolveDriver {
            backend: Arc::new(GreedyBackend::new()),
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<ConcretizationCache>) -> SolveDriver {
        self.cache = Some(cache);
        self
    }

    /// Set up the problem and solve for the dependencies of `specs`.
    pub fn solve(
        &self,
        setup: &mut SolverSetup,
        specs: &[Spec],
        reuse: &[Arc<Spec>],
        output: &OutputConfiguration,
        allow_deprecated: bool,
    ) -> Result<(SolveResult, Vec<(String, i64)>)> {
        let config = setup.config;
        let setup_start = Instant::now();
        let program = setup.setup(specs, reuse, allow_deprecated)?;
        if output.timers {
            log::info!("setup completed in {:?}", setup_start.elapsed());
        }
        if output.setup_only {
            return Ok((SolveResult::new(specs.to_vec()), Vec::new()));
        }

        // deterministic problem representation: sorted fact lines plus the
        // bytes of every loaded rule file
        let mut control_files = vec!["concretize", "heuristic", "display", "direct_dependency"];
        if !setup.concretize_everything {
            control_files.push("when_possible");
        }
        if config.check_libc {
            control_files.push("libc_compatibility");
        } else {
            control_files.push("os_compatibility");
        }
        if config.splice.automatic {
            control_files.push("splices");
        }

        let mut sorted_lines: Vec<&str> = program.text.lines().collect();
        sorted_lines.sort_unstable();
        let mut problem_repr = sorted_lines.join("\n");
        for name in &control_files {
            problem_repr.push('\n');
            problem_repr.push_str(rule_file(name));
        }

        if let Some(cache) = &self.cache {
            if let Some((result, statistics)) = cache.fetch(&problem_repr) {
                log::debug!("concretization cache hit, skipping the solve");
                return Ok((result, statistics));
            }
        }

        let request = BackendRequest {
            modules: RuleModules {
                when_possible: !setup.concretize_everything,
                libc_compatibility: config.check_libc,
                splices: config.splice.automatic,
            },
            deadline: match config.timeout {
                0 => None,
                seconds => Some(Instant::now() + Duration::from_secs(seconds)),
            },
        };

        let solve_start = Instant::now();
        let outcome = self.backend.solve(&program, &request);
        if output.timers {
            log::info!(
                "dependency resolution completed in {:.3} seconds",
                solve_start.elapsed().as_secs_f64()
            );
        }
        if output.stats {
            for (name, value) in &outcome.stats {
                log::info!("solver statistic {name} = {value}");
            }
        }

        let mut result = SolveResult::new(specs.to_vec());

        if outcome.timed_out {
            let specs_str = elide_list(
                &specs.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                4,
            )
            .join(", ");
            let header = format!(
                "the solver is taking more than {} seconds to solve for {specs_str}",
                config.timeout
            );
            if config.error_on_timeout {
                return Err(ConcretizeError::Timeout(format!(
                    "{header}, stopping concretization"
                )));
            }
            log::warn!("{header}, using the best configuration found so far");
            result.warnings.push(header);
        }

        result.satisfiable = Some(outcome.satisfiable);

        if outcome.satisfiable {
            // the chosen model's cost vector is globally minimal
            let best = outcome
                .models
                .iter()
                .min_by(|a, b| a.cost.cmp(&b.cost))
                .expect("a satisfiable outcome has at least one model");

            // errors can coexist with a nominally satisfiable model; they
            // always abort concretization
            ErrorHandler::new(&best.facts, specs).raise_if_errors()?;

            let mut builder =
                SpecBuilder::new(setup.repo, config, &setup.reusable_and_possible);
            let answers = builder.build_specs(&best.facts)?;
            result.answers.push(Answer {
                cost: best.cost.clone(),
                rank: 0,
                specs: answers,
            });

            let criteria_args: Vec<(i64, String)> = best
                .facts
                .iter()
                .filter(|f| f.name == "opt_criterion")
                .filter_map(|f| {
                    Some((
                        f.args.first()?.as_int()?,
                        f.args.get(1)?.as_str()?.to_string(),
                    ))
                })
                .collect();
            result.criteria = build_criteria_names(&best.cost, &criteria_args);
            result.nmodels = outcome.models.len();
            result.optimal = Some(true);

            for dropped in &outcome.dropped_literals {
                result
                    .warnings
                    .push(format!("input not solved this round: {dropped}"));
            }
        } else {
            // preserve the raw cores and the solver handle for later
            // minimization
            result.cores = outcome.cores.clone();
            result.checker = Some(Arc::new(BackendChecker {
                program: program.clone(),
                request: BackendRequest {
                    modules: request.modules,
                    deadline: None,
                },
                backend: self.backend.clone(),
            }));
        }

        result.raise_if_unsat()?;

        if result.satisfiable == Some(true) && setup.concretize_everything {
            let unsolved = result.unsolved_specs();
            if !unsolved.is_empty() {
                return Err(ConcretizeError::OutputDoesNotSatisfyInput(
                    SolveResult::format_unsolved(&unsolved),
                ));
            }
        }

        if let Some(cache) = &self.cache {
            // cache writes are best-effort and write-once
            if let Err(err) = cache.store(&problem_repr, &result, &outcome.stats) {
                log::warn!("could not store concretization result in the cache: {err}");
            } else if let Err(err) = cache.flush_manifest() {
                log::warn!("could not update the concretization cache manifest: {err}");
            }
        }

        Ok((result, outcome.stats))
    }
}

impl Default for SolveDriver {
    fn default() -> Self {
        SolveDriver::new()
    }
}

/// The main external interface for solving: manages configuration and
/// collaborators in one place, sets up the problem and passes it to the
/// driver.
pub struct Solver<'a> {
    repo: &'a dyn PackageRepository,
    platform: &'a PlatformInfo,
    compilers: &'a [Compiler],
    config: &'a ConcretizerConfig,
    driver: SolveDriver,
    cache: Option<Arc<ConcretizationCache>>,
}

impl<'a> Solver<'a> {
    pub fn new(
        repo: &'a dyn PackageRepository,
        platform: &'a PlatformInfo,
        compilers: &'a [Compiler],
        config: &'a ConcretizerConfig,
    ) -> Solver<'a> {
        // an unusable cache degrades to always-solve, never a hard failure
        let cache = if config.cache.enable {
            match &config.cache.root {
                Some(root) => {
                    match ConcretizationCache::new(
                        root,
                        config.cache.entry_limit,
                        config.cache.size_limit,
                    ) {
                        Ok(cache) => Some(Arc::new(cache)),
                        Err(err) => {
                            log::warn!("concretization cache disabled: {err}");
                            None
                        }
                    }
                }
                None => {
                    log::warn!("concretization cache enabled but no root configured");
                    None
                }
            }
        } else {
            None
        };

        let mut driver = SolveDriver::new();
        if let Some(cache) = &cache {
            driver = driver.with_cache(cache.clone());
        }
        Solver {
            repo,
            platform,
            compilers,
            config,
            driver,
            cache,
        }
    }

    /// Check that all packages in the request exist and collect concrete
    /// subtrees of the inputs as reusable specs.
    fn check_input_and_extract_concrete_specs(
        &self,
        specs: &[Spec],
    ) -> Result<Vec<Arc<Spec>>> {
        let mut reusable = Vec::new();
        for root in specs {
            for node in root.traverse() {
                if node.name.is_empty() {
                    continue;
                }
                if node.concrete {
                    reusable.push(Spec::from_json(&node.to_json())?);
                    continue;
                }
                if self.repo.is_virtual(&node.name) {
                    continue;
                }
                if !self.repo.exists(&node.name) {
                    return Err(ConcretizeError::Unsatisfiable(format!(
                        "cannot concretize '{root}', since '{}' does not exist",
                        node.name
                    )));
                }
            }
        }
        Ok(reusable)
    }

    /// Concretize a set of specs, ignoring timing and statistics.
    pub fn solve(&self, specs: &[Spec]) -> Result<SolveResult> {
        self.solve_with_stats(specs, &SolveOptions::default())
            .map(|(result, _)| result)
    }

    pub fn solve_with_options(
        &self,
        specs: &[Spec],
        options: &SolveOptions,
    ) -> Result<SolveResult> {
        self.solve_with_stats(specs, options).map(|(result, _)| result)
    }

    /// Concretize a set of specs and report backend statistics.
    pub fn solve_with_stats(
        &self,
        specs: &[Spec],
        options: &SolveOptions,
    ) -> Result<(SolveResult, Vec<(String, i64)>)> {
        let mut reusable = self.check_input_and_extract_concrete_specs(specs)?;
        reusable.extend(options.reuse.iter().cloned());

        if let Some(cache) = &self.cache {
            if let Err(err) = cache.flush_manifest() {
                log::warn!("could not flush the concretization cache manifest: {err}");
            }
            if let Err(err) = cache.cleanup() {
                log::warn!("could not clean up the concretization cache: {err}");
            }
        }

        let mut setup =
            SolverSetup::new(self.repo, self.platform, self.compilers, self.config)
                .with_tests(options.tests.clone());
        let output = OutputConfiguration {
            timers: options.timers,
            stats: options.stats,
            setup_only: options.setup_only,
        };
        self.driver
            .solve(&mut setup, specs, &reusable, &output, options.allow_deprecated)
    }

    /// Solve for a stable model in multiple rounds.
    ///
    /// Relaxes the assumption that everything must be solved at once: each
    /// round maximizes reuse of specs from previous rounds, until no input
    /// is left unsolved. Returns the result of every round, in order.
    pub fn solve_in_rounds(
        &self,
        specs: &[Spec],
        options: &SolveOptions,
    ) -> Result<Vec<SolveResult>> {
        let mut reusable = self.check_input_and_extract_concrete_specs(specs)?;
        reusable.extend(options.reuse.iter().cloned());

        let mut input_specs: Vec<Spec> = specs.to_vec();
        let mut rounds: Vec<SolveResult> = Vec::new();

        loop {
            let mut setup =
                SolverSetup::new(self.repo, self.platform, self.compilers, self.config)
                    .with_tests(options.tests.clone());
            // inputs do not all have to be solved in one round
            setup.concretize_everything = false;

            let output = OutputConfiguration {
                timers: options.timers,
                stats: options.stats,
                setup_only: false,
            };
            let (result, _) = self.driver.solve(
                &mut setup,
                &input_specs,
                &reusable,
                &output,
                options.allow_deprecated,
            )?;

            let unsolved = result.unsolved_specs();
            let solved = result.specs();
            rounds.push(result);

            if unsolved.is_empty() {
                break;
            }
            if solved.is_empty() {
                // no progress: trying again would loop forever
                return Err(ConcretizeError::OutputDoesNotSatisfyInput(
                    SolveResult::format_unsolved(&unsolved),
                ));
            }

            input_specs = unsolved.into_iter().map(|(input, _)| input).collect();
            for spec in solved {
                reusable.push(spec);
            }
        }

        if let Some(cache) = &self.cache {
            if let Err(err) = cache.flush_manifest() {
                log::warn!("could not flush the concretization cache manifest: {err}");
            }
            if let Err(err) = cache.cleanup() {
                log::warn!("could not clean up the concretization cache: {err}");
            }
        }
        Ok(rounds)
    }
}
