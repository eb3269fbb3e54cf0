//! KL-002: Error taxonomy — validation, driver, graph, resolution, busy.

use thiserror::Error;

/// Malformed or incomplete user input. Raised before any output is built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("resource '{resource}': {message}")]
pub struct ValidationError {
    pub resource: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

/// The external infrastructure-as-code tool failed.
///
/// `message` is always passed through secret redaction before this value
/// is constructed; see [`crate::drivers::redact`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("recipe '{recipe}' ({template}) failed: {message}")]
pub struct DriverExecutionError {
    pub recipe: String,
    pub template: String,
    pub message: String,
}

/// Structural problems in one deployment's output graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate output resource LocalID '{0}'")]
    DuplicateLocalId(String),

    #[error("output resource '{local_id}' depends on unknown LocalID '{dependency}'")]
    DanglingDependency { local_id: String, dependency: String },

    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// A deferred reference could not be resolved after deployment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot resolve value '{name}' from '{local_id}' at '{pointer}': {reason}")]
pub struct ResolutionError {
    pub name: String,
    pub local_id: String,
    pub pointer: String,
    pub reason: String,
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum KilnError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("driver execution failed: {0}")]
    DriverExecution(#[from] DriverExecutionError),

    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("{0} is busy; another operation is in progress")]
    Busy(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),
}

impl KilnError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, KilnError>;
