//! Durable dispatch queue backed by the `dispatch_tasks` table.
//!
//! Each "start the next thing" hand-off is a row. Claiming a task is a
//! pending → running conditional update, so several drainers can share one
//! queue without running a task twice.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::claim::Clock;
use crate::store::DbHandle;
use crate::store::models::{DispatchAction, DispatchTask, HandOff, TaskStatus};

#[derive(Clone)]
pub struct DispatchQueue {
    db: DbHandle,
    clock: Arc<dyn Clock>,
}

impl DispatchQueue {
    pub fn new(db: DbHandle, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Idempotent per `(course, action, segment)`.
    pub async fn enqueue(&self, action: DispatchAction, payload: HandOff) -> Result<i64> {
        let id = self
            .db
            .call(move |db| db.enqueue_task(action, &payload))
            .await?;
        tracing::debug!(task_id = id, action = action.as_str(), "Dispatch task enqueued");
        Ok(id)
    }

    /// Take the oldest pending task not in `skip`.
    pub async fn claim_next(&self, skip: &HashSet<i64>) -> Result<Option<DispatchTask>> {
        let skip = skip.clone();
        let now = self.clock.now_ms();
        self.db
            .call(move |db| {
                for id in db.pending_task_ids()? {
                    if skip.contains(&id) {
                        continue;
                    }
                    if let Some(task) = db.try_start_task(id, now)? {
                        return Ok(Some(task));
                    }
                }
                Ok(None)
            })
            .await
    }

    pub async fn complete(&self, task_id: i64, note: Option<String>) -> Result<()> {
        self.db
            .call(move |db| db.finish_task(task_id, TaskStatus::Done, note.as_deref()))
            .await
    }

    pub async fn fail(&self, task_id: i64, error: String) -> Result<()> {
        self.db
            .call(move |db| db.finish_task(task_id, TaskStatus::Failed, Some(&error)))
            .await
    }

    /// Back to pending with the reason it was deferred.
    pub async fn requeue(&self, task_id: i64, reason: String) -> Result<()> {
        self.db
            .call(move |db| db.requeue_task(task_id, &reason))
            .await
    }

    /// Release tasks whose drainer stopped before recording an outcome.
    pub async fn requeue_stale(&self, older_than: Duration) -> Result<usize> {
        let cutoff = self.clock.now_ms() - older_than.as_millis() as i64;
        let count = self
            .db
            .call(move |db| db.requeue_stale_tasks(cutoff))
            .await?;
        if count > 0 {
            tracing::warn!(count, "Requeued stale running dispatch tasks");
        }
        Ok(count)
    }

    pub async fn list(&self, course_id: &str) -> Result<Vec<DispatchTask>> {
        let course_id = course_id.to_string();
        self.db.call(move |db| db.list_tasks(&course_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::ManualClock;
    use crate::store::models::TimeRange;

    async fn setup() -> (DispatchQueue, Arc<ManualClock>, String) {
        let db = DbHandle::in_memory().unwrap();
        let course = db
            .call(|db| db.create_course("Optics", "video://optics", &[TimeRange::new(0.0, 60.0)]))
            .await
            .unwrap();
        let clock = Arc::new(ManualClock::new(10_000));
        (DispatchQueue::new(db, clock.clone()), clock, course.id)
    }

    fn finalize(course_id: &str) -> HandOff {
        HandOff {
            course_id: course_id.to_string(),
            segment_id: None,
            time_range: None,
            inherited_context: None,
        }
    }

    #[tokio::test]
    async fn test_claim_next_skips_deferred_tasks() {
        let (queue, _clock, course_id) = setup().await;
        let id = queue
            .enqueue(DispatchAction::FinalizeCourse, finalize(&course_id))
            .await
            .unwrap();

        let task = queue.claim_next(&HashSet::new()).await.unwrap().unwrap();
        assert_eq!(task.id, id);
        queue.requeue(id, "not ready".into()).await.unwrap();

        let skip: HashSet<i64> = [id].into_iter().collect();
        assert!(queue.claim_next(&skip).await.unwrap().is_none());

        let again = queue.claim_next(&HashSet::new()).await.unwrap().unwrap();
        assert_eq!(again.attempts, 2);
        assert_eq!(again.last_error.as_deref(), Some("not ready"));
    }

    #[tokio::test]
    async fn test_complete_and_fail_record_outcome() {
        let (queue, _clock, course_id) = setup().await;
        let id = queue
            .enqueue(DispatchAction::FinalizeCourse, finalize(&course_id))
            .await
            .unwrap();
        queue.claim_next(&HashSet::new()).await.unwrap();
        queue.fail(id, "provider down".into()).await.unwrap();

        let tasks = queue.list(&course_id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert_eq!(tasks[0].last_error.as_deref(), Some("provider down"));
    }

    #[tokio::test]
    async fn test_requeue_stale_uses_clock() {
        let (queue, clock, course_id) = setup().await;
        queue
            .enqueue(DispatchAction::FinalizeCourse, finalize(&course_id))
            .await
            .unwrap();
        queue.claim_next(&HashSet::new()).await.unwrap();

        assert_eq!(queue.requeue_stale(Duration::from_secs(60)).await.unwrap(), 0);
        clock.advance(Duration::from_secs(61));
        assert_eq!(queue.requeue_stale(Duration::from_secs(60)).await.unwrap(), 1);
    }
}
