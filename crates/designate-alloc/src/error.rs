//! Allocation error types.

use thiserror::Error;

/// Errors raised while building a pipeline from its description.
///
/// These only happen at startup; a process holding an invalid pipeline
/// must refuse to serve.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConstructionError {
    #[error("empty pipeline description")]
    Empty,

    #[error("unknown command {0:?}, expected \"pipe\" or \"or\"")]
    UnknownCommand(String),

    #[error("a bare algorithm name cannot be a command: {0:?}")]
    LeafAsCommand(String),

    #[error("\"{command}\" needs at least {min} children, got {got}")]
    TooFewChildren {
        command: &'static str,
        min: usize,
        got: usize,
    },

    #[error("unknown algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("algorithm {algorithm} requires {capability} but nothing earlier in the pipeline provides it")]
    MissingCapability {
        algorithm: String,
        capability: String,
    },

    #[error("invalid owner-server predicate: {0}")]
    Predicate(#[from] PredicateError),
}

/// Errors from the capability hooks supplied by the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InventoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("inventory unavailable: {0}")]
    Unavailable(String),

    #[error("inventory request failed: {0}")]
    Request(String),
}

/// Errors compiling an owner-server predicate rule.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PredicateError {
    #[error("unknown field {0:?}")]
    UnknownField(String),

    #[error("invalid regex {pattern:?}: {message}")]
    Regex { pattern: String, message: String },
}

/// Errors that abort an allocation or capacity request.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{algorithm}: {message}")]
    Algorithm { algorithm: String, message: String },

    #[error("inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("invalid owner-server predicate: {0}")]
    Predicate(#[from] PredicateError),

    #[error("{0}")]
    AffinityUnsatisfiable(String),
}

impl AllocError {
    pub fn algorithm(algorithm: &str, message: impl Into<String>) -> Self {
        AllocError::Algorithm {
            algorithm: algorithm.to_string(),
            message: message.into(),
        }
    }
}

pub type AllocResult<T> = Result<T, AllocError>;
