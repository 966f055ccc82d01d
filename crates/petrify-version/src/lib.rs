//! Version values and version constraints for the petrify concretizer.
//!
//! Versions are dot-separated sequences of numeric and alphanumeric
//! components with a total order. Constraints cover exact pins (`=1.2.3`),
//! prefix matches (`1.2` matches `1.2` and `1.2.x`), inclusive ranges with
//! optional bounds (`1.2:1.4`, `1.2:`, `:1.4`) and comma-separated unions.

mod constraint;
mod version;

pub use constraint::{ConstraintParseError, VersionConstraint};
pub use version::Version;
