//! Storage stage: persist each generated artifact on its own.

use futures::StreamExt;
use futures::stream;

use super::generation::Generated;
use crate::errors::{PipelineError, StorageError};
use crate::store::DbHandle;
use crate::store::models::{GeneratedQuestion, PlanStatus};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StorageSummary {
    pub stored: usize,
    pub failed: usize,
}

/// `Ok(false)` when the artifact write failed and its plan was marked
/// failed. Failures to record plan status are datastore errors.
async fn store_one(db: &DbHandle, generated: Generated) -> anyhow::Result<bool> {
    let Generated { plan, artifact } = generated;
    let plan_id = plan.id.clone();
    let regions = artifact.hotspot_regions().to_vec();
    let question = GeneratedQuestion {
        plan_id: plan.id.clone(),
        segment_id: plan.segment_id.clone(),
        course_id: plan.course_id.clone(),
        question_id: plan.question_id.clone(),
        target_timestamp: plan.target_timestamp,
        artifact,
        created_at: String::new(),
    };

    let write = db
        .call(move |db| db.upsert_generated_question(&question))
        .await;
    if let Err(source) = write {
        let err = StorageError {
            plan_id: plan_id.clone(),
            source,
        };
        tracing::warn!(plan_id = %plan_id, error = %err, "Artifact write failed");
        let message = err.to_string();
        let id = plan_id.clone();
        db.call(move |db| db.transition_plan(&id, PlanStatus::Failed, Some(&message)))
            .await?;
        return Ok(false);
    }

    if !regions.is_empty() {
        let id = plan_id.clone();
        if let Err(e) = db
            .call(move |db| db.upsert_hotspot_regions(&id, &regions))
            .await
        {
            tracing::warn!(plan_id = %plan_id, error = %e, "Hotspot regions not stored");
        }
    }

    let id = plan_id.clone();
    let completed = db
        .call(move |db| db.transition_plan(&id, PlanStatus::Completed, None))
        .await?;
    if !completed {
        // Finished by a concurrent worker.
        tracing::debug!(plan_id = %plan_id, "Plan already terminal at storage");
    }
    Ok(true)
}

/// Persist all artifacts with at most `concurrency` writes in flight.
pub async fn store_all(
    db: &DbHandle,
    generated: Vec<Generated>,
    concurrency: usize,
) -> Result<StorageSummary, PipelineError> {
    let outcomes: Vec<anyhow::Result<bool>> = stream::iter(generated)
        .map(|g| store_one(db, g))
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut summary = StorageSummary::default();
    let mut first_error = None;
    for outcome in outcomes {
        match outcome {
            Ok(true) => summary.stored += 1,
            Ok(false) => summary.failed += 1,
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    if let Some(e) = first_error {
        return Err(PipelineError::Database(e));
    }
    Ok(summary)
}
