pub mod config;
pub mod deptype;
pub mod error;
pub mod package;
pub mod platform;
pub mod solver;
pub mod spec;

pub use config::{CacheConfig, ConcretizerConfig, PackagePolicy, PackagesConfig, SpliceConfig};
pub use error::{ConcretizeError, Result};
pub use package::{PackageDef, PackageRepository, Repo, RequirementPolicy, RequirementRule, VariantDef};
pub use platform::{Compiler, PlatformInfo, TargetDef};
pub use solver::{
    ConcretizationCache, SolveDriver, SolveOptions, SolveResult, Solver, SolverSetup, Tests,
};
pub use spec::{ConcreteSpecsByHash, Spec, Variant, VariantValue};
