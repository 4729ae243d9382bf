//! Upsert-only progress reporting keyed by `(course_id, session_id)`.
//!
//! Progress writes are best effort: a failed write is logged and never fails
//! the segment that reported it.

use anyhow::Result;

use crate::store::DbHandle;
use crate::store::models::{ProgressRecord, ProgressStage, SegmentStatus};

/// Session used when the caller does not name one.
pub const DEFAULT_SESSION: &str = "pipeline";

const PLANNING_WEIGHT: f64 = 0.2;
const GENERATION_WEIGHT: f64 = 0.6;
const STORAGE_WEIGHT: f64 = 0.2;

/// Offset and width of a stage within one segment's share of the course.
fn stage_span(stage: ProgressStage) -> (f64, f64) {
    match stage {
        ProgressStage::Queued | ProgressStage::Failed => (0.0, 0.0),
        ProgressStage::Planning => (0.0, PLANNING_WEIGHT),
        ProgressStage::Generation => (PLANNING_WEIGHT, GENERATION_WEIGHT),
        ProgressStage::Storage => (PLANNING_WEIGHT + GENERATION_WEIGHT, STORAGE_WEIGHT),
        ProgressStage::SegmentComplete | ProgressStage::Completed => (1.0, 0.0),
    }
}

/// Course-wide progress in `[0, 1]` for a segment at `stage`.
pub fn overall_progress(
    completed_segments: i64,
    total_segments: i64,
    stage: ProgressStage,
    stage_progress: f64,
) -> f64 {
    if stage == ProgressStage::Completed {
        return 1.0;
    }
    if total_segments <= 0 {
        return 0.0;
    }
    let (offset, width) = stage_span(stage);
    let within = offset + width * stage_progress.clamp(0.0, 1.0);
    ((completed_segments as f64 + within) / total_segments as f64).clamp(0.0, 1.0)
}

#[derive(Clone)]
pub struct ProgressTracker {
    db: DbHandle,
    session_id: String,
}

impl ProgressTracker {
    pub fn new(db: DbHandle, session_id: impl Into<String>) -> Self {
        Self {
            db,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Record a stage transition for a course. Never fails the caller.
    pub async fn report(
        &self,
        course_id: &str,
        stage: ProgressStage,
        step: &str,
        stage_progress: f64,
    ) {
        if let Err(e) = self.try_report(course_id, stage, step, stage_progress).await {
            tracing::warn!(course_id, stage = stage.as_str(), error = %e, "Failed to record progress");
        }
    }

    async fn try_report(
        &self,
        course_id: &str,
        stage: ProgressStage,
        step: &str,
        stage_progress: f64,
    ) -> Result<()> {
        let course_id = course_id.to_string();
        let session_id = self.session_id.clone();
        let step = step.to_string();
        self.db
            .call(move |db| {
                let total = db
                    .get_course(&course_id)?
                    .map(|c| c.total_segments)
                    .unwrap_or(0);
                let completed = db
                    .list_segments(&course_id)?
                    .iter()
                    .filter(|s| s.status == SegmentStatus::Completed)
                    .count() as i64;
                // The reporting segment is counted in `within` until it completes.
                let completed = match stage {
                    ProgressStage::SegmentComplete => completed.saturating_sub(1),
                    _ => completed,
                };
                let stage_progress = stage_progress.clamp(0.0, 1.0);
                db.upsert_progress(&ProgressRecord {
                    overall_progress: overall_progress(completed, total, stage, stage_progress),
                    course_id,
                    session_id,
                    stage,
                    step,
                    stage_progress,
                    updated_at: String::new(),
                })
            })
            .await
    }
}

/// Mark every progress session of a course completed at 100%.
pub async fn mark_course_completed(db: &DbHandle, course_id: &str) -> Result<()> {
    let course_id = course_id.to_string();
    db.call(move |db| {
        let mut sessions: Vec<String> = db
            .list_progress(&course_id)?
            .into_iter()
            .map(|r| r.session_id)
            .collect();
        if sessions.is_empty() {
            sessions.push(DEFAULT_SESSION.to_string());
        }
        for session_id in sessions {
            db.upsert_progress(&ProgressRecord {
                course_id: course_id.clone(),
                session_id,
                stage: ProgressStage::Completed,
                step: "published".to_string(),
                stage_progress: 1.0,
                overall_progress: 1.0,
                updated_at: String::new(),
            })?;
        }
        Ok(())
    })
    .await
}
