//! Completion Gate: the terminal, idempotent check that publishes a course.

use serde::Serialize;

use crate::errors::PipelineError;
use crate::progress;
use crate::store::DbHandle;
use crate::store::models::SegmentStatus;

/// One reason a course cannot be published yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BlockingReason {
    SegmentNotCompleted {
        segment_index: i64,
        status: SegmentStatus,
    },
    PlansInFlight {
        count: i64,
    },
    NoPersistedQuestions,
}

impl std::fmt::Display for BlockingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SegmentNotCompleted {
                segment_index,
                status,
            } => write!(f, "segment {} is {}", segment_index, status),
            Self::PlansInFlight { count } => {
                write!(f, "{} question plan(s) still planned or generating", count)
            }
            Self::NoPersistedQuestions => write!(f, "no questions have been persisted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateOutcome {
    pub course_id: String,
    pub published: bool,
    /// True only for the call that flipped the flag.
    pub newly_published: bool,
    pub blocking: Vec<BlockingReason>,
}

impl GateOutcome {
    pub fn summary(&self) -> String {
        if self.published {
            return "published".to_string();
        }
        self.blocking
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Evaluate the gate and publish if every check holds. Safe to call any
/// number of times from any worker.
pub async fn evaluate(db: &DbHandle, course_id: &str) -> Result<GateOutcome, PipelineError> {
    let id = course_id.to_string();
    let checked = db
        .call(move |db| {
            let Some(course) = db.get_course(&id)? else {
                return Ok(None);
            };
            if course.published {
                return Ok(Some((true, false, Vec::new())));
            }

            let mut blocking: Vec<BlockingReason> = db
                .list_segments(&id)?
                .into_iter()
                .filter(|s| s.status != SegmentStatus::Completed)
                .map(|s| BlockingReason::SegmentNotCompleted {
                    segment_index: s.segment_index,
                    status: s.status,
                })
                .collect();
            let in_flight = db.count_unfinished_plans(&id)?;
            if in_flight > 0 {
                blocking.push(BlockingReason::PlansInFlight { count: in_flight });
            }
            if db.count_generated_for_course(&id)? == 0 {
                blocking.push(BlockingReason::NoPersistedQuestions);
            }
            if !blocking.is_empty() {
                return Ok(Some((false, false, blocking)));
            }

            let flipped = db.publish_course(&id)?;
            Ok(Some((true, flipped, Vec::new())))
        })
        .await
        .map_err(PipelineError::Database)?;

    let (published, newly_published, blocking) =
        checked.ok_or_else(|| PipelineError::CourseNotFound {
            course_id: course_id.to_string(),
        })?;

    if published {
        // Idempotent; repairs a progress write lost after an earlier publish.
        progress::mark_course_completed(db, course_id)
            .await
            .map_err(PipelineError::Database)?;
    }
    if newly_published {
        tracing::info!(course_id, "Course published");
    } else if !published {
        tracing::info!(course_id, blocking = blocking.len(), "Course not ready to publish");
    }

    Ok(GateOutcome {
        course_id: course_id.to_string(),
        published,
        newly_published,
        blocking,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archetype::{Archetype, PlanIntent, QuestionArtifact};
    use crate::context::MergedContext;
    use crate::store::models::{GeneratedQuestion, PlanStatus, QuestionPlan, TimeRange};
    use crate::store::segment_id_for;

    async fn course(db: &DbHandle, segments: usize) -> String {
        let ranges: Vec<TimeRange> = (0..segments)
            .map(|i| TimeRange::new(i as f64 * 60.0, (i + 1) as f64 * 60.0))
            .collect();
        db.call(move |db| db.create_course("Statics", "video://statics", &ranges))
            .await
            .unwrap()
            .id
    }

    async fn complete_segment(db: &DbHandle, course_id: &str, index: i64) {
        let seg = segment_id_for(course_id, index);
        db.call(move |db| {
            db.try_acquire_segment(&seg, "w", 0, 1_000)?;
            let epoch = db.get_segment(&seg)?.map(|s| s.lease_epoch).unwrap_or(0);
            db.complete_segment(&seg, "w", epoch, &MergedContext::default(), 0, None)
        })
        .await
        .unwrap();
    }

    async fn persist_question(db: &DbHandle, course_id: &str, status: PlanStatus) {
        let seg = segment_id_for(course_id, 0);
        let course_id = course_id.to_string();
        db.call(move |db| {
            let plan = QuestionPlan {
                id: QuestionPlan::plan_id(&seg, "q01"),
                segment_id: seg.clone(),
                course_id: course_id.clone(),
                question_id: "q01".into(),
                archetype: Archetype::TrueFalse,
                target_timestamp: 5.0,
                status: PlanStatus::Planned,
                intent: PlanIntent {
                    rationale: "recall".into(),
                    learning_objective: String::new(),
                    cognitive_level: None,
                    focus: None,
                },
                error_message: None,
            };
            db.insert_plan(&plan)?;
            if status != PlanStatus::Planned {
                db.transition_plan(&plan.id, PlanStatus::Generating, None)?;
            }
            if status == PlanStatus::Completed {
                db.upsert_generated_question(&GeneratedQuestion {
                    plan_id: plan.id.clone(),
                    segment_id: seg.clone(),
                    course_id: course_id.clone(),
                    question_id: "q01".into(),
                    target_timestamp: 5.0,
                    artifact: QuestionArtifact::TrueFalse {
                        statement: "Forces balance at rest".into(),
                        answer: true,
                        explanation: String::new(),
                    },
                    created_at: String::new(),
                })?;
                db.transition_plan(&plan.id, PlanStatus::Completed, None)?;
            }
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_blocks_until_all_segments_complete() {
        let db = DbHandle::in_memory().unwrap();
        let id = course(&db, 2).await;
        complete_segment(&db, &id, 0).await;
        persist_question(&db, &id, PlanStatus::Completed).await;

        let outcome = evaluate(&db, &id).await.unwrap();
        assert!(!outcome.published);
        assert_eq!(
            outcome.blocking,
            vec![BlockingReason::SegmentNotCompleted {
                segment_index: 1,
                status: SegmentStatus::Pending
            }]
        );
        assert!(outcome.summary().contains("segment 1 is pending"));
    }

    #[tokio::test]
    async fn test_lists_every_blocking_reason() {
        let db = DbHandle::in_memory().unwrap();
        let id = course(&db, 1).await;
        persist_question(&db, &id, PlanStatus::Generating).await;

        let outcome = evaluate(&db, &id).await.unwrap();
        assert_eq!(outcome.blocking.len(), 3);
        assert!(outcome.blocking.contains(&BlockingReason::PlansInFlight { count: 1 }));
        assert!(outcome.blocking.contains(&BlockingReason::NoPersistedQuestions));
    }

    #[tokio::test]
    async fn test_publishes_once_and_stays_published() {
        let db = DbHandle::in_memory().unwrap();
        let id = course(&db, 1).await;
        complete_segment(&db, &id, 0).await;
        persist_question(&db, &id, PlanStatus::Completed).await;

        let first = evaluate(&db, &id).await.unwrap();
        assert!(first.published);
        assert!(first.newly_published);

        let second = evaluate(&db, &id).await.unwrap();
        assert!(second.published);
        assert!(!second.newly_published);

        let course_id = id.clone();
        let record = db
            .call(move |db| db.get_progress(&course_id, progress::DEFAULT_SESSION))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.overall_progress, 1.0);
    }

    #[tokio::test]
    async fn test_published_course_progress_is_repaired_on_reevaluation() {
        let db = DbHandle::in_memory().unwrap();
        let id = course(&db, 1).await;
        complete_segment(&db, &id, 0).await;
        persist_question(&db, &id, PlanStatus::Completed).await;
        assert!(evaluate(&db, &id).await.unwrap().newly_published);

        // Simulate the completion write having been lost.
        let course_id = id.clone();
        db.call(move |db| {
            db.upsert_progress(&crate::store::models::ProgressRecord {
                course_id,
                session_id: progress::DEFAULT_SESSION.to_string(),
                stage: crate::store::models::ProgressStage::Storage,
                step: "storing artifacts".into(),
                stage_progress: 0.5,
                overall_progress: 0.9,
                updated_at: String::new(),
            })
        })
        .await
        .unwrap();

        let again = evaluate(&db, &id).await.unwrap();
        assert!(again.published);
        assert!(!again.newly_published);

        let course_id = id.clone();
        let record = db
            .call(move |db| db.get_progress(&course_id, progress::DEFAULT_SESSION))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.stage, crate::store::models::ProgressStage::Completed);
        assert_eq!(record.overall_progress, 1.0);
    }

    #[tokio::test]
    async fn test_zero_questions_blocks_publication() {
        let db = DbHandle::in_memory().unwrap();
        let id = course(&db, 1).await;
        complete_segment(&db, &id, 0).await;
        let outcome = evaluate(&db, &id).await.unwrap();
        assert_eq!(outcome.blocking, vec![BlockingReason::NoPersistedQuestions]);
    }

    #[tokio::test]
    async fn test_unknown_course_is_an_error() {
        let db = DbHandle::in_memory().unwrap();
        assert!(matches!(
            evaluate(&db, "missing").await,
            Err(PipelineError::CourseNotFound { .. })
        ));
    }
}
