//! Error types for wirecut-sim.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SolveError {
    #[error("singular matrix")]
    Singular,

    #[error("sparse LU failed: {0}")]
    Sparse(String),
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule has no id")]
    MissingId,

    #[error("rule {0} has no type")]
    MissingType(String),

    #[error("rule {id} has unknown type {kind}")]
    UnknownType { id: String, kind: String },

    #[error("rule {id} has an invalid config: {source}")]
    InvalidConfig {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MigrationError {
    #[error("rule document is not an object")]
    NotAnObject,

    #[error("rule schema {found} is newer than supported {supported}")]
    FromTheFuture { found: u64, supported: u64 },
}
