use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConcretizeError {
    // Spec parsing errors
    #[error("Invalid spec '{spec}': {message}")]
    SpecParse { spec: String, message: String },

    #[error("Invalid version constraint: {0}")]
    InvalidConstraint(#[from] petrify_version::ConstraintParseError),

    // Package errors
    #[error("Package not found: {name}")]
    PackageNotFound { name: String },

    // User constraint errors: the request cannot be satisfied
    #[error("{0}")]
    Unsatisfiable(String),

    // The solve exceeded its time budget and the policy is to fail hard
    #[error("{0}")]
    Timeout(String),

    // Errors that indicate a bug in the concretizer itself
    #[error("internal concretizer error: {0}. Please report a bug")]
    Internal(String),

    #[error(
        "internal solver error: the solver completed but produced specs that \
         do not satisfy the request. Please report a bug\n{0}"
    )]
    OutputDoesNotSatisfyInput(String),

    // Splice configuration errors
    #[error("Invalid splice: {0}")]
    InvalidSplice(String),

    // External package configuration errors
    #[error("Invalid external: {0}")]
    InvalidExternal(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConcretizeError>;
