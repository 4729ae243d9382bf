//! Per-segment stage pipeline: Planning → Generation → Storage → Done.
//!
//! A [`SegmentPipeline`] run claims the segment, checks that its predecessor
//! is completed, then drives the stages while renewing its lease between
//! them. Plan and artifact failures are contained; provider and integrity
//! failures mark the whole segment failed and wait for an external reattempt.

pub mod generation;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use crate::claim::{ClaimDecision, ClaimManager, ClaimReason, Clock, Lease, LeaseRelease, SystemClock};
use crate::context::{ContextPropagator, MergedContext, merge};
use crate::errors::PipelineError;
use crate::planning::build_plans;
use crate::progress::{DEFAULT_SESSION, ProgressTracker};
use crate::provider::{AnalysisRequest, ContentAnalyzer, GeneratorRegistry};
use crate::store::DbHandle;
use crate::store::models::{Course, PlanStatus, ProgressStage, Segment, SegmentStatus};

/// Note recorded on segments whose transcript had nothing to ask about.
pub const NO_SPEECH_NOTE: &str = "no usable spoken content in transcript";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub lease_timeout: Duration,
    pub max_plans: usize,
    pub generation_concurrency: usize,
    pub storage_concurrency: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            lease_timeout: crate::claim::DEFAULT_LEASE_TIMEOUT,
            max_plans: 6,
            generation_concurrency: 8,
            storage_concurrency: 8,
        }
    }
}

/// Result of one pipeline run. Only datastore failures are returned as `Err`.
#[derive(Debug, Clone)]
pub enum SegmentOutcome {
    Completed(CompletedSegment),
    AlreadyDone {
        segment_id: String,
    },
    Conflict {
        segment_id: String,
    },
    /// The predecessor is not completed; the segment went back to pending.
    DependencyNotReady {
        segment_id: String,
        predecessor_status: SegmentStatus,
    },
    Failed {
        segment_id: String,
        error: String,
    },
    /// The lease was taken over mid-run; the new owner finishes the segment.
    Superseded {
        segment_id: String,
    },
}

impl SegmentOutcome {
    pub fn segment_id(&self) -> &str {
        match self {
            Self::Completed(c) => &c.segment_id,
            Self::AlreadyDone { segment_id }
            | Self::Conflict { segment_id }
            | Self::DependencyNotReady { segment_id, .. }
            | Self::Failed { segment_id, .. }
            | Self::Superseded { segment_id } => segment_id,
        }
    }

    /// Outcomes worth retrying later without operator action.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::DependencyNotReady { .. })
    }
}

#[derive(Debug, Clone)]
pub struct CompletedSegment {
    pub course_id: String,
    pub segment_id: String,
    pub segment_index: i64,
    pub is_last: bool,
    pub questions_count: i64,
    pub failed_plans: usize,
    pub context: MergedContext,
    pub note: Option<String>,
}

/// What a successful stage run hands back before the lease is released.
struct StagesDone {
    course: Course,
    segment: Segment,
    context: MergedContext,
    questions_count: i64,
    failed_plans: usize,
    note: Option<String>,
}

enum StageResult {
    Done(Box<StagesDone>),
    NotReady(SegmentStatus),
}

pub struct SegmentPipeline {
    db: DbHandle,
    claims: ClaimManager,
    analyzer: Arc<dyn ContentAnalyzer>,
    generators: GeneratorRegistry,
    propagator: ContextPropagator,
    progress: ProgressTracker,
    settings: PipelineSettings,
}

impl SegmentPipeline {
    pub fn new(
        db: DbHandle,
        analyzer: Arc<dyn ContentAnalyzer>,
        generators: GeneratorRegistry,
        settings: PipelineSettings,
    ) -> Self {
        Self::with_clock(db, analyzer, generators, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        db: DbHandle,
        analyzer: Arc<dyn ContentAnalyzer>,
        generators: GeneratorRegistry,
        settings: PipelineSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let claims = ClaimManager::new(Arc::new(db.clone()), clock, settings.lease_timeout);
        Self {
            progress: ProgressTracker::new(db.clone(), DEFAULT_SESSION),
            db,
            claims,
            analyzer,
            generators,
            propagator: ContextPropagator::default(),
            settings,
        }
    }

    pub fn with_propagator(mut self, propagator: ContextPropagator) -> Self {
        self.propagator = propagator;
        self
    }

    pub fn with_progress_session(mut self, session_id: impl Into<String>) -> Self {
        self.progress = ProgressTracker::new(self.db.clone(), session_id);
        self
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn claims(&self) -> &ClaimManager {
        &self.claims
    }

    /// Claim and process one segment.
    #[tracing::instrument(skip(self), fields(segment_index = tracing::field::Empty))]
    pub async fn run(&self, segment_id: &str, worker_id: &str) -> Result<SegmentOutcome, PipelineError> {
        let lease = match self.claims.attempt_claim(segment_id, worker_id).await? {
            ClaimDecision::Granted(lease) => lease,
            ClaimDecision::Denied(ClaimReason::AlreadyDone) => {
                return Ok(SegmentOutcome::AlreadyDone {
                    segment_id: segment_id.to_string(),
                });
            }
            ClaimDecision::Denied(ClaimReason::Conflict) => {
                return Ok(SegmentOutcome::Conflict {
                    segment_id: segment_id.to_string(),
                });
            }
        };

        match self.run_stages(&lease).await {
            Ok(StageResult::Done(done)) => self.finish(&lease, *done).await,
            Ok(StageResult::NotReady(predecessor_status)) => {
                self.claims.release(&lease, LeaseRelease::Pending).await?;
                tracing::info!(
                    segment_id,
                    predecessor = %predecessor_status,
                    "Predecessor not completed; segment returned to pending"
                );
                Ok(SegmentOutcome::DependencyNotReady {
                    segment_id: segment_id.to_string(),
                    predecessor_status,
                })
            }
            Err(PipelineError::LeaseLost { .. }) => {
                tracing::warn!(segment_id, worker_id, "Lease lost mid-run; abandoning segment");
                Ok(SegmentOutcome::Superseded {
                    segment_id: segment_id.to_string(),
                })
            }
            Err(e) if e.marks_segment_failed() => {
                let error = e.to_string();
                tracing::error!(segment_id, error = %error, "Segment failed");
                let released = self
                    .claims
                    .release(&lease, LeaseRelease::Failed { error: error.clone() })
                    .await?;
                if !released {
                    return Ok(SegmentOutcome::Superseded {
                        segment_id: segment_id.to_string(),
                    });
                }
                if let Some(course_id) = self.course_id_of(segment_id).await {
                    self.progress
                        .report(&course_id, ProgressStage::Failed, &error, 0.0)
                        .await;
                }
                Ok(SegmentOutcome::Failed {
                    segment_id: segment_id.to_string(),
                    error,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn course_id_of(&self, segment_id: &str) -> Option<String> {
        let id = segment_id.to_string();
        self.db
            .call(move |db| db.get_segment(&id))
            .await
            .ok()
            .flatten()
            .map(|s| s.course_id)
    }

    async fn finish(&self, lease: &Lease, done: StagesDone) -> Result<SegmentOutcome, PipelineError> {
        let released = self
            .claims
            .release(
                lease,
                LeaseRelease::Completed {
                    context: done.context.clone(),
                    questions_count: done.questions_count,
                    note: done.note.clone(),
                },
            )
            .await?;
        if !released {
            return Ok(SegmentOutcome::Superseded {
                segment_id: done.segment.id,
            });
        }

        self.progress
            .report(
                &done.course.id,
                ProgressStage::SegmentComplete,
                &format!("segment {} complete", done.segment.segment_index),
                1.0,
            )
            .await;
        tracing::info!(
            segment_id = %done.segment.id,
            segment_index = done.segment.segment_index,
            questions = done.questions_count,
            failed_plans = done.failed_plans,
            "Segment completed"
        );

        Ok(SegmentOutcome::Completed(CompletedSegment {
            is_last: done.segment.segment_index + 1 >= done.course.total_segments,
            course_id: done.course.id,
            segment_id: done.segment.id,
            segment_index: done.segment.segment_index,
            questions_count: done.questions_count,
            failed_plans: done.failed_plans,
            context: done.context,
            note: done.note,
        }))
    }

    async fn load(&self, segment_id: &str) -> Result<(Segment, Course, Option<Segment>), PipelineError> {
        let id = segment_id.to_string();
        let loaded = self
            .db
            .call(move |db| {
                let Some(segment) = db.get_segment(&id)? else {
                    return Ok(None);
                };
                let course = db.get_course(&segment.course_id)?;
                let predecessor = if segment.segment_index > 0 {
                    db.get_segment_by_index(&segment.course_id, segment.segment_index - 1)?
                } else {
                    None
                };
                Ok(Some((segment, course, predecessor)))
            })
            .await
            .map_err(PipelineError::Database)?;

        let (segment, course, predecessor) = loaded.ok_or_else(|| PipelineError::SegmentNotFound {
            segment_id: segment_id.to_string(),
        })?;
        let course = course.ok_or_else(|| {
            PipelineError::Integrity(format!(
                "course {} for segment {} is missing",
                segment.course_id, segment.id
            ))
        })?;
        if segment.segment_index > 0 && predecessor.is_none() {
            return Err(PipelineError::Integrity(format!(
                "predecessor segment {} of course {} is missing",
                segment.segment_index - 1,
                course.id
            )));
        }
        Ok((segment, course, predecessor))
    }

    async fn run_stages(&self, lease: &Lease) -> Result<StageResult, PipelineError> {
        let (segment, course, predecessor) = self.load(&lease.segment_id).await?;
        tracing::Span::current().record("segment_index", segment.segment_index);

        if let Some(prev) = &predecessor
            && prev.status != SegmentStatus::Completed
        {
            return Ok(StageResult::NotReady(prev.status));
        }
        let inherited = predecessor.and_then(|p| p.cumulative_context);

        // ── Planning ──
        self.progress
            .report(&course.id, ProgressStage::Planning, "analyzing content", 0.0)
            .await;
        let analysis = self
            .analyzer
            .analyze(&AnalysisRequest {
                video_ref: course.video_ref.clone(),
                time_range: segment.time_range,
                max_plans: self.settings.max_plans,
                inherited_context: inherited.clone(),
            })
            .await?;
        let lease = self.claims.renew(lease).await?;

        if !analysis.transcript.has_spoken_content() {
            tracing::info!(segment_id = %segment.id, "Transcript has no spoken content; skipping generation");
            let delta = self.propagator.extract(&segment, &analysis.transcript, &[]);
            return Ok(StageResult::Done(Box::new(StagesDone {
                context: merge(inherited.as_ref(), &delta),
                course,
                segment,
                questions_count: 0,
                failed_plans: 0,
                note: Some(NO_SPEECH_NOTE.to_string()),
            })));
        }

        let drafts = build_plans(&segment, &analysis.plan_drafts, self.settings.max_plans);
        let segment_id = segment.id.clone();
        let plans = self
            .db
            .call(move |db| {
                for plan in &drafts {
                    db.insert_plan(plan)?;
                }
                db.list_plans(&segment_id)
            })
            .await
            .map_err(PipelineError::Database)?;
        let pending: Vec<_> = plans
            .into_iter()
            .filter(|p| matches!(p.status, PlanStatus::Planned | PlanStatus::Generating))
            .collect();
        self.progress
            .report(
                &course.id,
                ProgressStage::Planning,
                &format!("{} plans ready", pending.len()),
                1.0,
            )
            .await;

        // ── Generation ──
        let generation = generation::generate_all(
            &self.db,
            &self.generators,
            &self.progress,
            pending,
            &analysis.transcript,
            self.settings.generation_concurrency,
        )
        .await?;
        let lease = self.claims.renew(&lease).await?;

        // ── Storage ──
        self.progress
            .report(&course.id, ProgressStage::Storage, "storing artifacts", 0.0)
            .await;
        let stored = storage::store_all(&self.db, generation.generated, self.settings.storage_concurrency).await?;
        self.claims.renew(&lease).await?;

        let segment_id = segment.id.clone();
        let (questions, failed_plans, in_flight) = self
            .db
            .call(move |db| {
                let questions = db.list_generated_questions(&segment_id)?;
                let plans = db.list_plans(&segment_id)?;
                let failed = plans
                    .iter()
                    .filter(|p| p.status == PlanStatus::Failed)
                    .count();
                let in_flight = plans
                    .iter()
                    .filter(|p| matches!(p.status, PlanStatus::Planned | PlanStatus::Generating))
                    .count();
                Ok((questions, failed, in_flight))
            })
            .await
            .map_err(PipelineError::Database)?;
        // Completed segments are never reclaimed; every plan must be terminal first.
        if in_flight > 0 {
            return Err(PipelineError::Integrity(format!(
                "{} plan(s) of segment {} still in flight after storage",
                in_flight, segment.id
            )));
        }

        tracing::debug!(
            segment_id = %segment.id,
            stored = stored.stored,
            storage_failures = stored.failed,
            generation_failures = generation.failed,
            skipped = generation.skipped,
            "Stages finished"
        );

        let delta = self
            .propagator
            .extract(&segment, &analysis.transcript, &questions);
        Ok(StageResult::Done(Box::new(StagesDone {
            context: merge(inherited.as_ref(), &delta),
            course,
            segment,
            questions_count: questions.len() as i64,
            failed_plans,
            note: None,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archetype::{Archetype, QuestionArtifact};
    use crate::claim::ManualClock;
    use crate::errors::{GenerationError, ProviderError};
    use crate::gate;
    use crate::provider::{AnalysisResponse, GenerationRequest, PlanDraft, QuestionGenerator};
    use crate::store::models::TimeRange;
    use crate::store::segment_id_for;
    use crate::transcript::{Transcript, TranscriptLine};
    use async_trait::async_trait;

    struct OneDraftAnalyzer;

    #[async_trait]
    impl ContentAnalyzer for OneDraftAnalyzer {
        async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResponse, ProviderError> {
            let start = request.time_range.start;
            Ok(AnalysisResponse {
                transcript: Transcript {
                    lines: vec![TranscriptLine {
                        start,
                        end: start + 10.0,
                        text: "Pressure is force per unit area".into(),
                    }],
                    key_concepts: Vec::new(),
                    synopsis: None,
                },
                plan_drafts: vec![PlanDraft {
                    archetype: Some("true_false".into()),
                    rationale: Some("checks the pressure definition".into()),
                    target_timestamp: Some(start + 5.0),
                    ..PlanDraft::default()
                }],
            })
        }
    }

    struct TrueFalseGenerator;

    #[async_trait]
    impl QuestionGenerator for TrueFalseGenerator {
        async fn generate(&self, _: &GenerationRequest) -> Result<QuestionArtifact, GenerationError> {
            Ok(QuestionArtifact::TrueFalse {
                statement: "Pressure is force per unit area".into(),
                answer: true,
                explanation: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_plan_status_write_failure_never_completes_segment() {
        let db = DbHandle::in_memory().unwrap();
        let course = db
            .call(|db| db.create_course("Fluids", "video://fluids", &[TimeRange::new(0.0, 600.0)]))
            .await
            .unwrap();
        let seg = segment_id_for(&course.id, 0);
        db.call(|db| {
            db.execute_batch(
                "CREATE TRIGGER reject_plan_completion BEFORE UPDATE OF status ON question_plans
                 WHEN NEW.status IN ('completed', 'failed')
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
        })
        .await
        .unwrap();

        let clock = Arc::new(ManualClock::new(1_000_000));
        let pipeline = SegmentPipeline::with_clock(
            db.clone(),
            Arc::new(OneDraftAnalyzer),
            GeneratorRegistry::new().with(Archetype::TrueFalse, Arc::new(TrueFalseGenerator)),
            PipelineSettings::default(),
            clock.clone(),
        );

        let result = pipeline.run(&seg, "worker-a").await;
        assert!(matches!(result, Err(PipelineError::Database(_))), "got {:?}", result);

        let id = seg.clone();
        let (segment, plans) = db
            .call(move |db| Ok((db.get_segment(&id)?, db.list_plans(&id)?)))
            .await
            .unwrap();
        let segment = segment.unwrap();
        assert_eq!(segment.status, SegmentStatus::Processing);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].status, PlanStatus::Generating);

        // Once the datastore recovers, the abandoned lease is taken over and finished.
        db.call(|db| db.execute_batch("DROP TRIGGER reject_plan_completion;"))
            .await
            .unwrap();
        clock.advance(PipelineSettings::default().lease_timeout);
        let outcome = pipeline.run(&seg, "worker-b").await.unwrap();
        assert!(matches!(outcome, SegmentOutcome::Completed(_)), "got {:?}", outcome);

        let gate = gate::evaluate(&db, &course.id).await.unwrap();
        assert!(gate.published, "blocked by {:?}", gate.blocking);
    }
}
