use super::{PartitionId, ProcedureId, TxnId};

/// Errors produced by the estimator, its graphs and their persisted artifacts.
#[derive(thiserror::Error, Debug)]
pub enum MarkovError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// The artifact is not valid JSON or does not match the document shape.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// A required top-level section is absent from the artifact.
    #[error("artifact is missing section {0}")]
    MissingSection(&'static str),
    /// A catalog key in the artifact does not resolve against the schema.
    #[error("unresolved {kind} key `{key}`")]
    UnresolvedKey {
        /// What the key names (procedure or statement).
        kind: &'static str,
        /// The key as written in the artifact.
        key: String,
    },
    /// The artifact parsed but describes an inconsistent graph.
    #[error("malformed artifact: {0}")]
    Malformed(String),
    /// The graph was taken out of service after an internal-consistency violation.
    #[error("graph for procedure {0} is quarantined")]
    Quarantined(ProcedureId),
    /// The transaction has no cursor registered with the estimator.
    #[error("unknown transaction {0}")]
    UnknownTransaction(TxnId),
    /// The learning worker has stopped and no longer accepts updates.
    #[error("learning worker stopped")]
    LearnerStopped,
    /// A partition id does not fit the signed classification-id range.
    #[error("partition {0} exceeds the classification id range")]
    PartitionOutOfRange(PartitionId),
    /// A declared extension point that has no implementation.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// Configuration values are out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Configuration file could not be parsed.
    #[error("config: {0}")]
    Config(#[from] toml::de::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MarkovError>;

impl MarkovError {
    pub(crate) fn unresolved(kind: &'static str, key: impl Into<String>) -> Self {
        MarkovError::UnresolvedKey {
            kind,
            key: key.into(),
        }
    }
}
