use thiserror::Error;

/// The error kinds a coordination component can surface.
///
/// Each kind maps to exactly one variant so callers match on kind rather
/// than message content. See the crate-level docs for which caller is
/// expected to retry which variant. Contention (a duplicate-key race on
/// a claim insert) is deliberately not one of these: it's an expected
/// outcome, not a failure, and is signaled through
/// [`crate::store::WriteOutcome::DuplicateKey`] instead.
#[derive(Error, Debug)]
pub enum CoordError {
    /// Store or pipe I/O. Callers retry a short, bounded number of times
    /// before surfacing the failure as a component failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// `not-found` / `constraint-violation` on a non-claim write. Logged,
    /// surfaced, not retried.
    #[error("semantic error: {0}")]
    Semantic(String),

    /// Pipeline failure attributable to a specific in-flight file.
    #[error("pipeline failure on file {file_key}: {source}")]
    PipelineFileFailure {
        file_key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Pipeline failure not attributable to any specific file (backend
    /// offline, model missing, ...).
    #[error("systemic pipeline failure: {0}")]
    PipelineSystemicFailure(anyhow::Error),

    /// A worker subprocess died. Surfaced only for logging; C2/C3 handle
    /// this exclusively and it is never returned to a caller awaiting
    /// file-processing results.
    #[error("subprocess {component_id} died")]
    SubprocessDeath { component_id: String },

    /// Restart policy exhausted; `component_id` is terminally `failed`
    /// until an operator resets its restart counter.
    #[error("restart policy exhausted for {component_id}: {reason}")]
    PolicyExhausted { component_id: String, reason: String },

    /// `std::io::Error` passthrough (pipe setup, file descriptors, ...).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Document-store driver error that doesn't carry its own kind.
    #[error("store error: {0}")]
    Store(#[from] surrealdb::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoordError {
    pub fn transport(msg: impl Into<String>) -> Self {
        CoordError::Transport(msg.into())
    }

    pub fn semantic(msg: impl Into<String>) -> Self {
        CoordError::Semantic(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;
