//! The processing pipeline is the one capability intentionally left
//! outside this crate's scope (model execution, audio decoding, and
//! file-format parsing are all non-goals). `ProcessingPipeline` is the
//! seam an embedder implements to plug real tagging logic into the
//! worker loop; this crate only drives discovery, claiming, and
//! finalization around whatever the trait object does.

use async_trait::async_trait;

use crate::error::{CoordError, Result};
use crate::types::FileKey;

/// A single versioned unit of work. `version()` is stamped onto
/// `library_files.tagged_version` on success, so recalibration and
/// re-tagging runs can tell which pipeline produced a given result.
///
/// Implementations report file-attributable failures as
/// [`CoordError::PipelineFileFailure`] (the file itself is considered
/// toxic — marked and released, no retry) and everything else as
/// [`CoordError::PipelineSystemicFailure`] (backend down, model
/// missing, ...; claim is released and the file stays claimable).
#[async_trait]
pub trait ProcessingPipeline: Send + Sync {
    fn version(&self) -> &str;

    async fn process(&self, file_key: &FileKey) -> Result<serde_json::Value>;
}

/// Test/demo pipeline: always succeeds with an empty prediction payload.
pub struct NoopPipeline {
    version: String,
}

impl NoopPipeline {
    pub fn new(version: impl Into<String>) -> Self {
        Self { version: version.into() }
    }
}

#[async_trait]
impl ProcessingPipeline for NoopPipeline {
    fn version(&self) -> &str {
        &self.version
    }

    async fn process(&self, _file_key: &FileKey) -> Result<serde_json::Value> {
        Ok(serde_json::json!({}))
    }
}

/// Classifies a pipeline error for the worker loop's branching, without
/// the loop needing to match on `CoordError` variants directly.
pub enum PipelineOutcome {
    Success(serde_json::Value),
    Toxic(String),
    Systemic(String),
}

pub fn classify(result: Result<serde_json::Value>) -> PipelineOutcome {
    match result {
        Ok(v) => PipelineOutcome::Success(v),
        Err(CoordError::PipelineFileFailure { source, .. }) => PipelineOutcome::Toxic(source.to_string()),
        Err(other) => PipelineOutcome::Systemic(other.to_string()),
    }
}
