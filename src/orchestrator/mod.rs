//! Chains segment completions into the next segment or course finalization.
//!
//! Hand-offs are durable [`DispatchTask`] rows rather than direct calls:
//! finishing segment `i` enqueues `process_segment` for `i + 1`, and finishing
//! the last segment enqueues `finalize_course`. [`Orchestrator::drain`] works
//! the queue until it is empty or only deferred tasks remain.

pub mod queue;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::claim::{Clock, SystemClock};
use crate::errors::PipelineError;
use crate::gate::{self, GateOutcome};
use crate::pipeline::{CompletedSegment, SegmentOutcome, SegmentPipeline};
use crate::store::DbHandle;
use crate::store::models::{DispatchAction, DispatchTask, HandOff};

pub use queue::DispatchQueue;

/// Default cap on tasks processed by one drain call.
pub const DEFAULT_MAX_STEPS: usize = 1_000;

/// Tally of one drain pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct DrainReport {
    pub steps: usize,
    pub segments_completed: usize,
    pub segments_failed: usize,
    pub deferred: usize,
    pub published: Vec<String>,
    pub blocked: Vec<GateOutcome>,
}

pub struct Orchestrator {
    db: DbHandle,
    pipeline: Arc<SegmentPipeline>,
    queue: DispatchQueue,
    worker_id: String,
}

impl Orchestrator {
    pub fn new(pipeline: Arc<SegmentPipeline>, worker_id: impl Into<String>) -> Self {
        Self::with_clock(pipeline, worker_id, Arc::new(SystemClock))
    }

    pub fn with_clock(
        pipeline: Arc<SegmentPipeline>,
        worker_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let db = pipeline.db().clone();
        Self {
            queue: DispatchQueue::new(db.clone(), clock),
            db,
            pipeline,
            worker_id: worker_id.into(),
        }
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Enqueue the first segment of a course.
    pub async fn start_course(&self, course_id: &str) -> Result<i64> {
        let id = course_id.to_string();
        let first = self
            .db
            .call(move |db| db.get_segment_by_index(&id, 0))
            .await?
            .with_context(|| format!("Course {} has no segment 0", course_id))?;
        self.queue
            .enqueue(
                DispatchAction::ProcessSegment,
                HandOff {
                    course_id: course_id.to_string(),
                    segment_id: Some(first.id),
                    time_range: Some(first.time_range),
                    inherited_context: None,
                },
            )
            .await
    }

    /// Run one segment and hand off on success. This is also the entry point
    /// for an external reattempt of a failed segment.
    pub async fn process_segment(&self, segment_id: &str) -> Result<SegmentOutcome, PipelineError> {
        let outcome = self.pipeline.run(segment_id, &self.worker_id).await?;
        match &outcome {
            SegmentOutcome::Completed(done) => self.hand_off(done).await,
            SegmentOutcome::AlreadyDone { segment_id } => self.resume_chain(segment_id).await,
            _ => {}
        }
        Ok(outcome)
    }

    /// Enqueue whatever follows a completed segment. Failures are logged and
    /// never reflected on the completed segment.
    pub async fn hand_off(&self, done: &CompletedSegment) {
        if let Err(e) = self.try_hand_off(done).await {
            tracing::warn!(
                course_id = %done.course_id,
                segment_id = %done.segment_id,
                error = %e,
                "Hand-off after segment completion failed"
            );
        }
    }

    async fn try_hand_off(&self, done: &CompletedSegment) -> Result<()> {
        if done.is_last {
            self.queue
                .enqueue(
                    DispatchAction::FinalizeCourse,
                    HandOff {
                        course_id: done.course_id.clone(),
                        segment_id: None,
                        time_range: None,
                        inherited_context: None,
                    },
                )
                .await?;
            return Ok(());
        }

        let course_id = done.course_id.clone();
        let next_index = done.segment_index + 1;
        let next = self
            .db
            .call(move |db| db.get_segment_by_index(&course_id, next_index))
            .await?
            .with_context(|| {
                format!(
                    "Segment {} of course {} is missing",
                    next_index, done.course_id
                )
            })?;
        self.queue
            .enqueue(
                DispatchAction::ProcessSegment,
                HandOff {
                    course_id: done.course_id.clone(),
                    segment_id: Some(next.id),
                    time_range: Some(next.time_range),
                    inherited_context: Some(done.context.clone()),
                },
            )
            .await?;
        Ok(())
    }

    /// A segment found already completed may have lost its hand-off; replay it.
    async fn resume_chain(&self, segment_id: &str) {
        let id = segment_id.to_string();
        let loaded = self
            .db
            .call(move |db| {
                let Some(segment) = db.get_segment(&id)? else {
                    return Ok(None);
                };
                let course = db.get_course(&segment.course_id)?;
                Ok(course.map(|c| (segment, c)))
            })
            .await;
        match loaded {
            Ok(Some((segment, course))) => {
                let done = CompletedSegment {
                    is_last: segment.segment_index + 1 >= course.total_segments,
                    course_id: course.id,
                    segment_id: segment.id,
                    segment_index: segment.segment_index,
                    questions_count: segment.questions_count,
                    failed_plans: 0,
                    context: segment.cumulative_context.unwrap_or_default(),
                    note: segment.note,
                };
                self.hand_off(&done).await;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(segment_id, error = %e, "Could not resume chain"),
        }
    }

    /// Run the Completion Gate for a course.
    pub async fn finalize(&self, course_id: &str) -> Result<GateOutcome, PipelineError> {
        gate::evaluate(&self.db, course_id).await
    }

    async fn run_task(&self, task: &DispatchTask, report: &mut DrainReport) -> Result<TaskDisposition> {
        match task.action {
            DispatchAction::ProcessSegment => {
                let segment_id = task
                    .segment_id
                    .as_deref()
                    .or(task.payload.segment_id.as_deref())
                    .with_context(|| format!("Dispatch task {} has no segment", task.id))?;
                let outcome = self.process_segment(segment_id).await?;
                Ok(match outcome {
                    SegmentOutcome::Completed(_) => {
                        report.segments_completed += 1;
                        TaskDisposition::Done(None)
                    }
                    SegmentOutcome::AlreadyDone { .. } => {
                        TaskDisposition::Done(Some("already done".to_string()))
                    }
                    SegmentOutcome::Superseded { .. } => {
                        TaskDisposition::Done(Some("superseded by another worker".to_string()))
                    }
                    SegmentOutcome::Conflict { .. } => {
                        TaskDisposition::Deferred("segment held by another worker".to_string())
                    }
                    SegmentOutcome::DependencyNotReady {
                        predecessor_status, ..
                    } => TaskDisposition::Deferred(format!(
                        "predecessor segment is {}",
                        predecessor_status
                    )),
                    SegmentOutcome::Failed { error, .. } => {
                        report.segments_failed += 1;
                        TaskDisposition::Failed(error)
                    }
                })
            }
            DispatchAction::FinalizeCourse => {
                let outcome = self.finalize(&task.course_id).await?;
                let note = (!outcome.published).then(|| outcome.summary());
                if outcome.published {
                    report.published.push(task.course_id.clone());
                } else {
                    report.blocked.push(outcome);
                }
                Ok(TaskDisposition::Done(note))
            }
        }
    }

    /// Work the queue until it is empty, only deferred tasks remain, or
    /// `max_steps` tasks have been run.
    pub async fn drain(&self, max_steps: usize) -> Result<DrainReport> {
        self.queue
            .requeue_stale(self.pipeline.claims().ttl())
            .await?;

        let mut report = DrainReport::default();
        let mut deferred: HashSet<i64> = HashSet::new();
        while report.steps < max_steps {
            let Some(task) = self.queue.claim_next(&deferred).await? else {
                break;
            };
            report.steps += 1;
            tracing::debug!(
                task_id = task.id,
                action = task.action.as_str(),
                course_id = %task.course_id,
                "Running dispatch task"
            );

            let disposition = match self.run_task(&task, &mut report).await {
                Ok(d) => d,
                Err(e) => {
                    let message = format!("{:#}", e);
                    if let Err(record) = self.queue.fail(task.id, message.clone()).await {
                        tracing::warn!(task_id = task.id, error = %record, "Could not record task failure");
                    }
                    return Err(e.context(format!("Dispatch task {} failed", task.id)));
                }
            };

            match disposition {
                TaskDisposition::Done(note) => self.queue.complete(task.id, note).await?,
                TaskDisposition::Deferred(reason) => {
                    report.deferred += 1;
                    deferred.insert(task.id);
                    self.queue.requeue(task.id, reason).await?;
                }
                TaskDisposition::Failed(error) => self.queue.fail(task.id, error).await?,
            }
        }
        Ok(report)
    }
}

enum TaskDisposition {
    Done(Option<String>),
    Deferred(String),
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archetype::{Archetype, QuestionArtifact};
    use crate::claim::ManualClock;
    use crate::errors::{GenerationError, ProviderError};
    use crate::pipeline::PipelineSettings;
    use crate::provider::{
        AnalysisRequest, AnalysisResponse, ContentAnalyzer, GenerationRequest, GeneratorRegistry,
        PlanDraft, QuestionGenerator,
    };
    use crate::store::models::{SegmentStatus, TaskStatus, TimeRange};
    use crate::store::segment_id_for;
    use crate::transcript::{Transcript, TranscriptLine};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers every segment with one true/false draft, except starts listed
    /// in `fail_at`.
    struct ScriptedAnalyzer {
        fail_at: Mutex<Vec<f64>>,
        seen_context: Mutex<Vec<bool>>,
    }

    impl ScriptedAnalyzer {
        fn new(fail_at: Vec<f64>) -> Self {
            Self {
                fail_at: Mutex::new(fail_at),
                seen_context: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ContentAnalyzer for ScriptedAnalyzer {
        async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResponse, ProviderError> {
            self.seen_context
                .lock()
                .unwrap()
                .push(request.inherited_context.is_some());
            if self.fail_at.lock().unwrap().contains(&request.time_range.start) {
                return Err(ProviderError::Transport("connection reset".into()));
            }
            let start = request.time_range.start;
            Ok(AnalysisResponse {
                transcript: Transcript {
                    lines: vec![TranscriptLine {
                        start,
                        end: start + 10.0,
                        text: "Torque is force times lever arm".into(),
                    }],
                    key_concepts: Vec::new(),
                    synopsis: None,
                },
                plan_drafts: vec![PlanDraft {
                    archetype: Some("true_false".into()),
                    rationale: Some("checks the torque definition".into()),
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
                statement: "Torque is force times lever arm".into(),
                answer: true,
                explanation: String::new(),
            })
        }
    }

    async fn setup(segments: usize, analyzer: Arc<ScriptedAnalyzer>) -> (Orchestrator, String) {
        let db = DbHandle::in_memory().unwrap();
        let ranges: Vec<TimeRange> = (0..segments)
            .map(|i| TimeRange::new(i as f64 * 60.0, (i + 1) as f64 * 60.0))
            .collect();
        let course = db
            .call(move |db| db.create_course("Rotation", "video://rotation", &ranges))
            .await
            .unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let registry = GeneratorRegistry::new().with(Archetype::TrueFalse, Arc::new(TrueFalseGenerator));
        let pipeline = SegmentPipeline::with_clock(
            db,
            analyzer,
            registry,
            PipelineSettings::default(),
            clock.clone(),
        );
        (
            Orchestrator::with_clock(Arc::new(pipeline), "worker-a", clock),
            course.id,
        )
    }

    #[tokio::test]
    async fn test_drain_walks_the_chain_and_publishes() {
        let analyzer = Arc::new(ScriptedAnalyzer::new(Vec::new()));
        let (orch, course_id) = setup(3, analyzer.clone()).await;
        orch.start_course(&course_id).await.unwrap();

        let report = orch.drain(DEFAULT_MAX_STEPS).await.unwrap();
        assert_eq!(report.segments_completed, 3);
        assert_eq!(report.steps, 4);
        assert_eq!(report.published, vec![course_id.clone()]);

        // First segment starts fresh, the rest inherit.
        assert_eq!(*analyzer.seen_context.lock().unwrap(), vec![false, true, true]);

        let tasks = orch.queue().list(&course_id).await.unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Done));
    }

    #[tokio::test]
    async fn test_failed_segment_stops_the_chain() {
        let analyzer = Arc::new(ScriptedAnalyzer::new(vec![60.0]));
        let (orch, course_id) = setup(3, analyzer).await;
        orch.start_course(&course_id).await.unwrap();

        let report = orch.drain(DEFAULT_MAX_STEPS).await.unwrap();
        assert_eq!(report.segments_completed, 1);
        assert_eq!(report.segments_failed, 1);
        assert!(report.published.is_empty());

        let seg = segment_id_for(&course_id, 1);
        let segment = orch
            .db
            .call(move |db| db.get_segment(&seg))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(segment.status, SegmentStatus::Failed);
        assert!(segment.error_message.unwrap().contains("connection reset"));

        let third = segment_id_for(&course_id, 2);
        let tasks = orch.queue().list(&course_id).await.unwrap();
        assert!(tasks.iter().all(|t| t.segment_id.as_deref() != Some(third.as_str())));
    }

    #[tokio::test]
    async fn test_reattempt_resumes_after_failure() {
        let analyzer = Arc::new(ScriptedAnalyzer::new(vec![60.0]));
        let (orch, course_id) = setup(2, analyzer.clone()).await;
        orch.start_course(&course_id).await.unwrap();
        orch.drain(DEFAULT_MAX_STEPS).await.unwrap();

        analyzer.fail_at.lock().unwrap().clear();
        let outcome = orch
            .process_segment(&segment_id_for(&course_id, 1))
            .await
            .unwrap();
        assert!(matches!(outcome, SegmentOutcome::Completed(_)));

        let report = orch.drain(DEFAULT_MAX_STEPS).await.unwrap();
        assert_eq!(report.published, vec![course_id]);
    }

    #[tokio::test]
    async fn test_out_of_order_task_is_deferred() {
        let analyzer = Arc::new(ScriptedAnalyzer::new(Vec::new()));
        let (orch, course_id) = setup(2, analyzer).await;
        let seg = segment_id_for(&course_id, 1);
        orch.queue()
            .enqueue(
                DispatchAction::ProcessSegment,
                HandOff {
                    course_id: course_id.clone(),
                    segment_id: Some(seg.clone()),
                    time_range: None,
                    inherited_context: None,
                },
            )
            .await
            .unwrap();

        let report = orch.drain(DEFAULT_MAX_STEPS).await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.segments_completed, 0);

        let tasks = orch.queue().list(&course_id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert!(tasks[0].last_error.as_deref().unwrap().contains("pending"));
    }

    #[tokio::test]
    async fn test_rerun_of_completed_course_is_idempotent() {
        let analyzer = Arc::new(ScriptedAnalyzer::new(Vec::new()));
        let (orch, course_id) = setup(2, analyzer.clone()).await;
        orch.start_course(&course_id).await.unwrap();
        orch.drain(DEFAULT_MAX_STEPS).await.unwrap();

        orch.start_course(&course_id).await.unwrap();
        let report = orch.drain(DEFAULT_MAX_STEPS).await.unwrap();
        assert_eq!(report.segments_completed, 0);
        // Already published: the gate reports published without re-flipping.
        assert_eq!(report.published, vec![course_id.clone()]);
        assert_eq!(analyzer.seen_context.lock().unwrap().len(), 2);
    }
}
