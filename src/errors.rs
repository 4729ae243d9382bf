//! Typed error hierarchy for the lectern pipeline.
//!
//! Segment-level failures are `PipelineError`; failures that stay contained to
//! a single plan or artifact are `GenerationError` and `StorageError`. Claim
//! conflicts and unmet dependencies are *not* errors: they travel as structured
//! outcomes (`ClaimDecision`, `SegmentOutcome`) so callers can poll safely.

use thiserror::Error;

/// Errors returned by a content-analysis provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider request failed: {0}")]
    Transport(String),

    #[error("Provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Provider returned malformed output: {0}")]
    Malformed(String),
}

/// Errors that fail a whole segment. The segment is marked failed and waits
/// for an external reattempt.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Segment {segment_id} not found")]
    SegmentNotFound { segment_id: String },

    #[error("Course {course_id} not found")]
    CourseNotFound { course_id: String },

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Content analysis failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Lease on segment {segment_id} was lost to another worker")]
    LeaseLost { segment_id: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

impl PipelineError {
    /// Whether this error should be written to the segment row as a failure.
    /// Datastore failures and lost leases cannot be recorded safely.
    pub fn marks_segment_failed(&self) -> bool {
        matches!(
            self,
            PipelineError::Integrity(_)
                | PipelineError::Provider(_)
                | PipelineError::SegmentNotFound { .. }
        )
    }
}

/// Failure of a single plan's generation. Never aborts sibling plans.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("No generator registered for archetype '{archetype}'")]
    UnsupportedArchetype { archetype: String },

    #[error("Generator produced a {produced} artifact for a {expected} plan")]
    ArchetypeMismatch { expected: String, produced: String },

    #[error("Generator failed: {0}")]
    Failed(String),

    #[error("Generated artifact is invalid: {0}")]
    InvalidArtifact(String),
}

/// Failure to persist a single artifact. Never aborts sibling artifacts.
#[derive(Debug, Error)]
#[error("Failed to store artifact for plan {plan_id}: {source}")]
pub struct StorageError {
    pub plan_id: String,
    #[source]
    pub source: anyhow::Error,
}
