//! Generation stage: bounded, unordered fan-out of plans to their
//! archetype generators. Each plan fails on its own.

use futures::StreamExt;
use futures::stream;

use crate::archetype::QuestionArtifact;
use crate::errors::{GenerationError, PipelineError};
use crate::progress::ProgressTracker;
use crate::provider::{GenerationRequest, GeneratorRegistry};
use crate::store::DbHandle;
use crate::store::models::{PlanStatus, ProgressStage, QuestionPlan};
use crate::transcript::Transcript;

/// Seconds of transcript on each side of a plan's timestamp sent to the
/// generator.
const CONTEXT_RADIUS_SECS: f64 = 60.0;

/// A plan whose generator produced a valid artifact of the right variant.
#[derive(Debug, Clone)]
pub struct Generated {
    pub plan: QuestionPlan,
    pub artifact: QuestionArtifact,
}

#[derive(Debug, Default)]
pub struct GenerationSummary {
    pub generated: Vec<Generated>,
    pub failed: usize,
    /// Plans skipped because another worker already finished them.
    pub skipped: usize,
}

enum PlanResult {
    Generated(Generated),
    Failed,
    Skipped,
}

async fn call_generator(
    registry: &GeneratorRegistry,
    plan: &QuestionPlan,
    transcript: &Transcript,
) -> Result<QuestionArtifact, GenerationError> {
    let generator = registry
        .get(plan.archetype)
        .ok_or_else(|| GenerationError::UnsupportedArchetype {
            archetype: plan.archetype.to_string(),
        })?;
    let request = GenerationRequest {
        plan: plan.clone(),
        transcript_context: transcript.around(plan.target_timestamp, CONTEXT_RADIUS_SECS),
    };
    let artifact = generator.generate(&request).await?;
    let produced = artifact.archetype();
    if produced != plan.archetype {
        return Err(GenerationError::ArchetypeMismatch {
            expected: plan.archetype.to_string(),
            produced: produced.to_string(),
        });
    }
    artifact.validate()?;
    Ok(artifact)
}

async fn generate_one(
    db: &DbHandle,
    registry: &GeneratorRegistry,
    plan: QuestionPlan,
    transcript: &Transcript,
) -> anyhow::Result<PlanResult> {
    let plan_id = plan.id.clone();
    let started = db
        .call(move |db| db.transition_plan(&plan_id, PlanStatus::Generating, None))
        .await?;
    if !started {
        return Ok(PlanResult::Skipped);
    }

    match call_generator(registry, &plan, transcript).await {
        Ok(artifact) => {
            tracing::debug!(plan_id = %plan.id, archetype = %plan.archetype, "Plan generated");
            Ok(PlanResult::Generated(Generated { plan, artifact }))
        }
        Err(e) => {
            tracing::warn!(
                plan_id = %plan.id,
                archetype = %plan.archetype,
                error = %e,
                "Plan generation failed"
            );
            let plan_id = plan.id.clone();
            let message = e.to_string();
            db.call(move |db| db.transition_plan(&plan_id, PlanStatus::Failed, Some(&message)))
                .await?;
            Ok(PlanResult::Failed)
        }
    }
}

/// Generate every plan with at most `concurrency` calls in flight.
pub async fn generate_all(
    db: &DbHandle,
    registry: &GeneratorRegistry,
    progress: &ProgressTracker,
    plans: Vec<QuestionPlan>,
    transcript: &Transcript,
    concurrency: usize,
) -> Result<GenerationSummary, PipelineError> {
    let total = plans.len();
    let Some(course_id) = plans.first().map(|p| p.course_id.clone()) else {
        return Ok(GenerationSummary::default());
    };

    let mut results = stream::iter(plans)
        .map(|plan| generate_one(db, registry, plan, transcript))
        .buffer_unordered(concurrency.max(1));

    let mut summary = GenerationSummary::default();
    let mut finished = 0usize;
    let mut first_error = None;
    while let Some(result) = results.next().await {
        finished += 1;
        match result {
            Ok(PlanResult::Generated(g)) => summary.generated.push(g),
            Ok(PlanResult::Failed) => summary.failed += 1,
            Ok(PlanResult::Skipped) => summary.skipped += 1,
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        progress
            .report(
                &course_id,
                ProgressStage::Generation,
                &format!("generated {}/{}", finished, total),
                finished as f64 / total as f64,
            )
            .await;
    }

    // Datastore failures are not plan failures; surface the first one.
    if let Some(e) = first_error {
        return Err(PipelineError::Database(e));
    }
    Ok(summary)
}
