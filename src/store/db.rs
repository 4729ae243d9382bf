use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;
use crate::archetype::{Archetype, HotspotRegion, PlanIntent, QuestionArtifact};
use crate::context::MergedContext;

/// Async-safe handle to the lectern database.
///
/// Wraps `LecternDb` behind `Arc<Mutex>` and runs every access on tokio's
/// blocking pool. Each `call` holds the connection for its whole closure, so a
/// read followed by a conditional write inside one closure is atomic with
/// respect to other handles.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<LecternDb>>,
}

impl DbHandle {
    pub fn new(db: LecternDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open a file-backed database and wrap it.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(LecternDb::new(path)?))
    }

    /// In-memory database, for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(LecternDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&LecternDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct LecternDb {
    conn: Connection,
}

const SEGMENT_COLUMNS: &str = "id, course_id, segment_index, start_secs, end_secs, status, lease_owner, \
     lease_started_at, lease_epoch, retry_count, cumulative_context, questions_count, error_message, note, updated_at";

const PLAN_COLUMNS: &str = "id, segment_id, course_id, question_id, archetype, target_timestamp, status, payload, error_message";

const TASK_COLUMNS: &str = "id, course_id, action, segment_id, payload, status, attempts, last_error, created_at, updated_at";

impl LecternDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Raw SQL against the connection, for fault injection in tests.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql).context("Failed to execute SQL batch")
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS courses (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    video_ref TEXT NOT NULL,
                    total_segments INTEGER NOT NULL,
                    published INTEGER NOT NULL DEFAULT 0,
                    published_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS segments (
                    id TEXT PRIMARY KEY,
                    course_id TEXT NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
                    segment_index INTEGER NOT NULL,
                    start_secs REAL NOT NULL,
                    end_secs REAL NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    lease_owner TEXT,
                    lease_started_at INTEGER,
                    lease_epoch INTEGER NOT NULL DEFAULT 0,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    cumulative_context TEXT,
                    questions_count INTEGER NOT NULL DEFAULT 0,
                    error_message TEXT,
                    note TEXT,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(course_id, segment_index)
                );

                CREATE TABLE IF NOT EXISTS question_plans (
                    id TEXT PRIMARY KEY,
                    segment_id TEXT NOT NULL REFERENCES segments(id) ON DELETE CASCADE,
                    course_id TEXT NOT NULL,
                    question_id TEXT NOT NULL,
                    archetype TEXT NOT NULL,
                    target_timestamp REAL NOT NULL,
                    status TEXT NOT NULL DEFAULT 'planned',
                    payload TEXT NOT NULL,
                    error_message TEXT,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(segment_id, question_id)
                );

                CREATE TABLE IF NOT EXISTS generated_questions (
                    plan_id TEXT PRIMARY KEY REFERENCES question_plans(id) ON DELETE CASCADE,
                    segment_id TEXT NOT NULL,
                    course_id TEXT NOT NULL,
                    question_id TEXT NOT NULL,
                    target_timestamp REAL NOT NULL,
                    archetype TEXT NOT NULL,
                    artifact TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS hotspot_regions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    plan_id TEXT NOT NULL REFERENCES generated_questions(plan_id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    label TEXT NOT NULL,
                    x REAL NOT NULL,
                    y REAL NOT NULL,
                    width REAL NOT NULL,
                    height REAL NOT NULL,
                    correct INTEGER NOT NULL DEFAULT 0,
                    UNIQUE(plan_id, position)
                );

                CREATE TABLE IF NOT EXISTS progress_records (
                    course_id TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    stage TEXT NOT NULL,
                    step TEXT NOT NULL DEFAULT '',
                    stage_progress REAL NOT NULL DEFAULT 0,
                    overall_progress REAL NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    PRIMARY KEY (course_id, session_id)
                );

                CREATE TABLE IF NOT EXISTS dispatch_tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    course_id TEXT NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
                    action TEXT NOT NULL,
                    target TEXT NOT NULL DEFAULT '',
                    segment_id TEXT,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    started_at INTEGER,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(course_id, action, target)
                );

                CREATE INDEX IF NOT EXISTS idx_segments_course ON segments(course_id, segment_index);
                CREATE INDEX IF NOT EXISTS idx_plans_segment ON question_plans(segment_id);
                CREATE INDEX IF NOT EXISTS idx_plans_course_status ON question_plans(course_id, status);
                CREATE INDEX IF NOT EXISTS idx_generated_course ON generated_questions(course_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_status ON dispatch_tasks(status, id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Courses ───────────────────────────────────────────────────────

    /// Create a course and its contiguous segments in one transaction.
    pub fn create_course(
        &self,
        title: &str,
        video_ref: &str,
        ranges: &[TimeRange],
    ) -> Result<Course> {
        let course_id = uuid::Uuid::new_v4().to_string();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin course transaction")?;
        tx.execute(
            "INSERT INTO courses (id, title, video_ref, total_segments) VALUES (?1, ?2, ?3, ?4)",
            params![course_id, title, video_ref, ranges.len() as i64],
        )
        .context("Failed to insert course")?;
        for (index, range) in ranges.iter().enumerate() {
            tx.execute(
                "INSERT INTO segments (id, course_id, segment_index, start_secs, end_secs) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    segment_id_for(&course_id, index as i64),
                    course_id,
                    index as i64,
                    range.start,
                    range.end
                ],
            )
            .context("Failed to insert segment")?;
        }
        tx.commit().context("Failed to commit course")?;
        self.get_course(&course_id)?
            .context("Course not found after insert")
    }

    pub fn get_course(&self, id: &str) -> Result<Option<Course>> {
        self.conn
            .query_row(
                "SELECT id, title, video_ref, total_segments, published, published_at, created_at FROM courses WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Course {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        video_ref: row.get(2)?,
                        total_segments: row.get(3)?,
                        published: row.get(4)?,
                        published_at: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("Failed to query course")
    }

    pub fn list_courses(&self) -> Result<Vec<Course>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, title, video_ref, total_segments, published, published_at, created_at FROM courses ORDER BY created_at, id")
            .context("Failed to prepare list_courses")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Course {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    video_ref: row.get(2)?,
                    total_segments: row.get(3)?,
                    published: row.get(4)?,
                    published_at: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })
            .context("Failed to query courses")?;
        let mut courses = Vec::new();
        for row in rows {
            courses.push(row.context("Failed to read course row")?);
        }
        Ok(courses)
    }

    /// Flip `published` exactly once. Returns false if it was already set.
    pub fn publish_course(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE courses SET published = 1, published_at = datetime('now') WHERE id = ?1 AND published = 0",
                params![id],
            )
            .context("Failed to publish course")?;
        Ok(changed == 1)
    }

    // ── Segments ──────────────────────────────────────────────────────

    pub fn get_segment(&self, id: &str) -> Result<Option<Segment>> {
        let sql = format!("SELECT {} FROM segments WHERE id = ?1", SEGMENT_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], SegmentRow::from_row)
            .optional()
            .context("Failed to query segment")?;
        row.map(SegmentRow::into_segment).transpose()
    }

    pub fn get_segment_by_index(&self, course_id: &str, index: i64) -> Result<Option<Segment>> {
        let sql = format!(
            "SELECT {} FROM segments WHERE course_id = ?1 AND segment_index = ?2",
            SEGMENT_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![course_id, index], SegmentRow::from_row)
            .optional()
            .context("Failed to query segment by index")?;
        row.map(SegmentRow::into_segment).transpose()
    }

    pub fn list_segments(&self, course_id: &str) -> Result<Vec<Segment>> {
        let sql = format!(
            "SELECT {} FROM segments WHERE course_id = ?1 ORDER BY segment_index",
            SEGMENT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_segments")?;
        let rows = stmt
            .query_map(params![course_id], SegmentRow::from_row)
            .context("Failed to query segments")?;
        let mut segments = Vec::new();
        for row in rows {
            segments.push(row.context("Failed to read segment row")?.into_segment()?);
        }
        Ok(segments)
    }

    /// The claim primitive: a single conditional update. Returns the number
    /// of rows affected (0 means another worker holds a live lease or the
    /// segment is already completed).
    pub fn try_acquire_segment(
        &self,
        segment_id: &str,
        owner: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE segments SET
                    status = 'processing',
                    lease_owner = ?2,
                    lease_started_at = ?3,
                    lease_epoch = lease_epoch + 1,
                    retry_count = CASE WHEN status = 'failed' THEN retry_count + 1 ELSE retry_count END,
                    updated_at = datetime('now')
                 WHERE id = ?1
                   AND (status IN ('pending', 'failed')
                        OR (status = 'processing' AND lease_started_at <= ?4))",
                params![segment_id, owner, now_ms, now_ms - ttl_ms],
            )
            .context("Failed to acquire segment lease")
    }

    /// Extend a lease the caller still holds.
    pub fn renew_segment_lease(
        &self,
        segment_id: &str,
        owner: &str,
        epoch: i64,
        now_ms: i64,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE segments SET lease_started_at = ?4, updated_at = datetime('now')
                 WHERE id = ?1 AND lease_owner = ?2 AND lease_epoch = ?3 AND status = 'processing'",
                params![segment_id, owner, epoch, now_ms],
            )
            .context("Failed to renew segment lease")?;
        Ok(changed == 1)
    }

    /// Give the segment back to `pending` without counting a retry.
    pub fn revert_segment_to_pending(
        &self,
        segment_id: &str,
        owner: &str,
        epoch: i64,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE segments SET status = 'pending', lease_owner = NULL, lease_started_at = NULL,
                    updated_at = datetime('now')
                 WHERE id = ?1 AND lease_owner = ?2 AND lease_epoch = ?3 AND status = 'processing'",
                params![segment_id, owner, epoch],
            )
            .context("Failed to revert segment to pending")?;
        Ok(changed == 1)
    }

    pub fn complete_segment(
        &self,
        segment_id: &str,
        owner: &str,
        epoch: i64,
        context: &MergedContext,
        questions_count: i64,
        note: Option<&str>,
    ) -> Result<bool> {
        let context_json =
            serde_json::to_string(context).context("Failed to serialize merged context")?;
        let changed = self
            .conn
            .execute(
                "UPDATE segments SET status = 'completed', cumulative_context = ?4, questions_count = ?5,
                    note = ?6, error_message = NULL, lease_owner = NULL, lease_started_at = NULL,
                    updated_at = datetime('now')
                 WHERE id = ?1 AND lease_owner = ?2 AND lease_epoch = ?3 AND status = 'processing'",
                params![segment_id, owner, epoch, context_json, questions_count, note],
            )
            .context("Failed to complete segment")?;
        Ok(changed == 1)
    }

    pub fn fail_segment(
        &self,
        segment_id: &str,
        owner: &str,
        epoch: i64,
        error: &str,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE segments SET status = 'failed', retry_count = retry_count + 1, error_message = ?4,
                    lease_owner = NULL, lease_started_at = NULL, updated_at = datetime('now')
                 WHERE id = ?1 AND lease_owner = ?2 AND lease_epoch = ?3 AND status = 'processing'",
                params![segment_id, owner, epoch, error],
            )
            .context("Failed to mark segment failed")?;
        Ok(changed == 1)
    }

    // ── Question plans ────────────────────────────────────────────────

    /// Insert a plan unless a row with the same id exists. Existing rows are
    /// never regressed. Returns true when the row was newly created.
    pub fn insert_plan(&self, plan: &QuestionPlan) -> Result<bool> {
        let payload =
            serde_json::to_string(&plan.intent).context("Failed to serialize plan intent")?;
        let changed = self
            .conn
            .execute(
                "INSERT INTO question_plans (id, segment_id, course_id, question_id, archetype, target_timestamp, status, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    plan.id,
                    plan.segment_id,
                    plan.course_id,
                    plan.question_id,
                    plan.archetype.as_str(),
                    plan.target_timestamp,
                    plan.status.as_str(),
                    payload
                ],
            )
            .context("Failed to insert question plan")?;
        Ok(changed == 1)
    }

    pub fn get_plan(&self, id: &str) -> Result<Option<QuestionPlan>> {
        let sql = format!("SELECT {} FROM question_plans WHERE id = ?1", PLAN_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], PlanRow::from_row)
            .optional()
            .context("Failed to query plan")?;
        row.map(PlanRow::into_plan).transpose()
    }

    pub fn list_plans(&self, segment_id: &str) -> Result<Vec<QuestionPlan>> {
        let sql = format!(
            "SELECT {} FROM question_plans WHERE segment_id = ?1 ORDER BY target_timestamp, question_id",
            PLAN_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_plans")?;
        let rows = stmt
            .query_map(params![segment_id], PlanRow::from_row)
            .context("Failed to query plans")?;
        let mut plans = Vec::new();
        for row in rows {
            plans.push(row.context("Failed to read plan row")?.into_plan()?);
        }
        Ok(plans)
    }

    /// Monotonic status transition guarded by the allowed source states.
    pub fn transition_plan(
        &self,
        plan_id: &str,
        to: PlanStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let from: &[PlanStatus] = match to {
            PlanStatus::Planned => &[],
            PlanStatus::Generating => &[PlanStatus::Planned, PlanStatus::Generating],
            PlanStatus::Completed => &[PlanStatus::Generating],
            PlanStatus::Failed => &[PlanStatus::Planned, PlanStatus::Generating],
        };
        if from.is_empty() {
            return Ok(false);
        }
        let allowed = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE question_plans SET status = ?2, error_message = ?3, updated_at = datetime('now')
             WHERE id = ?1 AND status IN ({})",
            allowed
        );
        let changed = self
            .conn
            .execute(&sql, params![plan_id, to.as_str(), error])
            .context("Failed to transition plan status")?;
        Ok(changed == 1)
    }

    pub fn count_unfinished_plans(&self, course_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM question_plans WHERE course_id = ?1 AND status IN ('planned', 'generating')",
                params![course_id],
                |row| row.get(0),
            )
            .context("Failed to count unfinished plans")
    }

    pub fn count_failed_plans(&self, course_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM question_plans WHERE course_id = ?1 AND status = 'failed'",
                params![course_id],
                |row| row.get(0),
            )
            .context("Failed to count failed plans")
    }

    // ── Generated questions ───────────────────────────────────────────

    /// Idempotent by plan id: a stale worker re-storing the same plan
    /// overwrites rather than duplicates.
    pub fn upsert_generated_question(&self, question: &GeneratedQuestion) -> Result<()> {
        let artifact =
            serde_json::to_string(&question.artifact).context("Failed to serialize artifact")?;
        self.conn
            .execute(
                "INSERT INTO generated_questions (plan_id, segment_id, course_id, question_id, target_timestamp, archetype, artifact)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(plan_id) DO UPDATE SET artifact = excluded.artifact",
                params![
                    question.plan_id,
                    question.segment_id,
                    question.course_id,
                    question.question_id,
                    question.target_timestamp,
                    question.artifact.archetype().as_str(),
                    artifact
                ],
            )
            .context("Failed to upsert generated question")?;
        Ok(())
    }

    pub fn upsert_hotspot_regions(&self, plan_id: &str, regions: &[HotspotRegion]) -> Result<()> {
        for (position, region) in regions.iter().enumerate() {
            self.conn
                .execute(
                    "INSERT INTO hotspot_regions (plan_id, position, label, x, y, width, height, correct)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(plan_id, position) DO UPDATE SET
                        label = excluded.label, x = excluded.x, y = excluded.y,
                        width = excluded.width, height = excluded.height, correct = excluded.correct",
                    params![
                        plan_id,
                        position as i64,
                        region.label,
                        region.x,
                        region.y,
                        region.width,
                        region.height,
                        region.correct
                    ],
                )
                .context("Failed to upsert hotspot region")?;
        }
        Ok(())
    }

    pub fn count_hotspot_regions(&self, plan_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM hotspot_regions WHERE plan_id = ?1",
                params![plan_id],
                |row| row.get(0),
            )
            .context("Failed to count hotspot regions")
    }

    pub fn list_generated_questions(&self, segment_id: &str) -> Result<Vec<GeneratedQuestion>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT plan_id, segment_id, course_id, question_id, target_timestamp, artifact, created_at
                 FROM generated_questions WHERE segment_id = ?1 ORDER BY target_timestamp, question_id",
            )
            .context("Failed to prepare list_generated_questions")?;
        let rows = stmt
            .query_map(params![segment_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("Failed to query generated questions")?;
        let mut questions = Vec::new();
        for row in rows {
            let (plan_id, segment_id, course_id, question_id, target_timestamp, artifact, created_at) =
                row.context("Failed to read generated question row")?;
            let artifact: QuestionArtifact = serde_json::from_str(&artifact)
                .with_context(|| format!("Corrupt artifact JSON for plan {}", plan_id))?;
            questions.push(GeneratedQuestion {
                plan_id,
                segment_id,
                course_id,
                question_id,
                target_timestamp,
                artifact,
                created_at,
            });
        }
        Ok(questions)
    }

    pub fn count_generated_for_segment(&self, segment_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM generated_questions WHERE segment_id = ?1",
                params![segment_id],
                |row| row.get(0),
            )
            .context("Failed to count segment questions")
    }

    pub fn count_generated_for_course(&self, course_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM generated_questions WHERE course_id = ?1",
                params![course_id],
                |row| row.get(0),
            )
            .context("Failed to count course questions")
    }

    // ── Progress ──────────────────────────────────────────────────────

    pub fn upsert_progress(&self, record: &ProgressRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO progress_records (course_id, session_id, stage, step, stage_progress, overall_progress)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(course_id, session_id) DO UPDATE SET
                    stage = excluded.stage,
                    step = excluded.step,
                    stage_progress = excluded.stage_progress,
                    overall_progress = MAX(progress_records.overall_progress, excluded.overall_progress),
                    updated_at = datetime('now')",
                params![
                    record.course_id,
                    record.session_id,
                    record.stage.as_str(),
                    record.step,
                    record.stage_progress,
                    record.overall_progress
                ],
            )
            .context("Failed to upsert progress record")?;
        Ok(())
    }

    pub fn get_progress(&self, course_id: &str, session_id: &str) -> Result<Option<ProgressRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT course_id, session_id, stage, step, stage_progress, overall_progress, updated_at
                 FROM progress_records WHERE course_id = ?1 AND session_id = ?2",
                params![course_id, session_id],
                ProgressRow::from_row,
            )
            .optional()
            .context("Failed to query progress record")?;
        row.map(ProgressRow::into_record).transpose()
    }

    pub fn list_progress(&self, course_id: &str) -> Result<Vec<ProgressRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT course_id, session_id, stage, step, stage_progress, overall_progress, updated_at
                 FROM progress_records WHERE course_id = ?1 ORDER BY updated_at DESC",
            )
            .context("Failed to prepare list_progress")?;
        let rows = stmt
            .query_map(params![course_id], ProgressRow::from_row)
            .context("Failed to query progress records")?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("Failed to read progress row")?.into_record()?);
        }
        Ok(records)
    }

    // ── Dispatch queue ────────────────────────────────────────────────

    /// Enqueue (or re-arm) the task for `(course, action, segment)`. A task
    /// that is currently running is left untouched.
    pub fn enqueue_task(
        &self,
        action: DispatchAction,
        payload: &HandOff,
    ) -> Result<i64> {
        let target = payload.segment_id.clone().unwrap_or_default();
        let payload_json =
            serde_json::to_string(payload).context("Failed to serialize hand-off payload")?;
        self.conn
            .execute(
                "INSERT INTO dispatch_tasks (course_id, action, target, segment_id, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(course_id, action, target) DO UPDATE SET
                    status = 'pending',
                    payload = excluded.payload,
                    last_error = NULL,
                    started_at = NULL,
                    updated_at = datetime('now')
                 WHERE dispatch_tasks.status != 'running'",
                params![
                    payload.course_id,
                    action.as_str(),
                    target,
                    payload.segment_id,
                    payload_json
                ],
            )
            .context("Failed to enqueue dispatch task")?;
        self.conn
            .query_row(
                "SELECT id FROM dispatch_tasks WHERE course_id = ?1 AND action = ?2 AND target = ?3",
                params![payload.course_id, action.as_str(), target],
                |row| row.get(0),
            )
            .context("Dispatch task not found after enqueue")
    }

    pub fn pending_task_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM dispatch_tasks WHERE status = 'pending' ORDER BY id")
            .context("Failed to prepare pending_task_ids")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .context("Failed to query pending tasks")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read task id")?);
        }
        Ok(ids)
    }

    /// CAS a pending task to running. Returns None if someone else took it.
    pub fn try_start_task(&self, id: i64, now_ms: i64) -> Result<Option<DispatchTask>> {
        let changed = self
            .conn
            .execute(
                "UPDATE dispatch_tasks SET status = 'running', attempts = attempts + 1, started_at = ?2,
                    updated_at = datetime('now')
                 WHERE id = ?1 AND status = 'pending'",
                params![id, now_ms],
            )
            .context("Failed to start dispatch task")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_task(id)
    }

    pub fn finish_task(&self, id: i64, status: TaskStatus, error: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE dispatch_tasks SET status = ?2, last_error = ?3, updated_at = datetime('now')
                 WHERE id = ?1 AND status = 'running'",
                params![id, status.as_str(), error],
            )
            .context("Failed to finish dispatch task")?;
        Ok(())
    }

    /// Put a running task back in the queue with the reason it was deferred.
    pub fn requeue_task(&self, id: i64, reason: &str) -> Result<()> {
        self.finish_task(id, TaskStatus::Pending, Some(reason))
    }

    /// Tasks left `running` by a drainer that died are made pending again.
    pub fn requeue_stale_tasks(&self, started_before_ms: i64) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE dispatch_tasks SET status = 'pending', last_error = 'stale running task requeued',
                    updated_at = datetime('now')
                 WHERE status = 'running' AND started_at < ?1",
                params![started_before_ms],
            )
            .context("Failed to requeue stale tasks")
    }

    pub fn get_task(&self, id: i64) -> Result<Option<DispatchTask>> {
        let sql = format!("SELECT {} FROM dispatch_tasks WHERE id = ?1", TASK_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], TaskRow::from_row)
            .optional()
            .context("Failed to query dispatch task")?;
        row.map(TaskRow::into_task).transpose()
    }

    pub fn list_tasks(&self, course_id: &str) -> Result<Vec<DispatchTask>> {
        let sql = format!(
            "SELECT {} FROM dispatch_tasks WHERE course_id = ?1 ORDER BY id",
            TASK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_tasks")?;
        let rows = stmt
            .query_map(params![course_id], TaskRow::from_row)
            .context("Failed to query dispatch tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }
}

/// Segment ids are derived from the course id and index so they stay
/// readable in logs.
pub fn segment_id_for(course_id: &str, index: i64) -> String {
    format!("{}-s{:03}", course_id, index)
}

/// Intermediate row struct for segments before parsing status and context.
struct SegmentRow {
    id: String,
    course_id: String,
    segment_index: i64,
    start_secs: f64,
    end_secs: f64,
    status: String,
    lease_owner: Option<String>,
    lease_started_at: Option<i64>,
    lease_epoch: i64,
    retry_count: i64,
    cumulative_context: Option<String>,
    questions_count: i64,
    error_message: Option<String>,
    note: Option<String>,
    updated_at: String,
}

impl SegmentRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            course_id: row.get(1)?,
            segment_index: row.get(2)?,
            start_secs: row.get(3)?,
            end_secs: row.get(4)?,
            status: row.get(5)?,
            lease_owner: row.get(6)?,
            lease_started_at: row.get(7)?,
            lease_epoch: row.get(8)?,
            retry_count: row.get(9)?,
            cumulative_context: row.get(10)?,
            questions_count: row.get(11)?,
            error_message: row.get(12)?,
            note: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_segment(self) -> Result<Segment> {
        let status = SegmentStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse segment status")?;
        let cumulative_context = self
            .cumulative_context
            .as_deref()
            .map(serde_json::from_str::<MergedContext>)
            .transpose()
            .with_context(|| format!("Corrupt cumulative_context for segment {}", self.id))?;
        Ok(Segment {
            id: self.id,
            course_id: self.course_id,
            segment_index: self.segment_index,
            time_range: TimeRange::new(self.start_secs, self.end_secs),
            status,
            lease_owner: self.lease_owner,
            lease_started_at: self.lease_started_at,
            lease_epoch: self.lease_epoch,
            retry_count: self.retry_count,
            cumulative_context,
            questions_count: self.questions_count,
            error_message: self.error_message,
            note: self.note,
            updated_at: self.updated_at,
        })
    }
}

struct PlanRow {
    id: String,
    segment_id: String,
    course_id: String,
    question_id: String,
    archetype: String,
    target_timestamp: f64,
    status: String,
    payload: String,
    error_message: Option<String>,
}

impl PlanRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            segment_id: row.get(1)?,
            course_id: row.get(2)?,
            question_id: row.get(3)?,
            archetype: row.get(4)?,
            target_timestamp: row.get(5)?,
            status: row.get(6)?,
            payload: row.get(7)?,
            error_message: row.get(8)?,
        })
    }

    fn into_plan(self) -> Result<QuestionPlan> {
        let archetype = Archetype::from_str(&self.archetype)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse plan archetype")?;
        let status = PlanStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse plan status")?;
        let intent: PlanIntent = serde_json::from_str(&self.payload)
            .with_context(|| format!("Corrupt payload for plan {}", self.id))?;
        Ok(QuestionPlan {
            id: self.id,
            segment_id: self.segment_id,
            course_id: self.course_id,
            question_id: self.question_id,
            archetype,
            target_timestamp: self.target_timestamp,
            status,
            intent,
            error_message: self.error_message,
        })
    }
}

struct ProgressRow {
    course_id: String,
    session_id: String,
    stage: String,
    step: String,
    stage_progress: f64,
    overall_progress: f64,
    updated_at: String,
}

impl ProgressRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            course_id: row.get(0)?,
            session_id: row.get(1)?,
            stage: row.get(2)?,
            step: row.get(3)?,
            stage_progress: row.get(4)?,
            overall_progress: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<ProgressRecord> {
        let stage = ProgressStage::from_str(&self.stage)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse progress stage")?;
        Ok(ProgressRecord {
            course_id: self.course_id,
            session_id: self.session_id,
            stage,
            step: self.step,
            stage_progress: self.stage_progress,
            overall_progress: self.overall_progress,
            updated_at: self.updated_at,
        })
    }
}

struct TaskRow {
    id: i64,
    course_id: String,
    action: String,
    segment_id: Option<String>,
    payload: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            course_id: row.get(1)?,
            action: row.get(2)?,
            segment_id: row.get(3)?,
            payload: row.get(4)?,
            status: row.get(5)?,
            attempts: row.get(6)?,
            last_error: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_task(self) -> Result<DispatchTask> {
        let action = DispatchAction::from_str(&self.action)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse dispatch action")?;
        let status = TaskStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task status")?;
        let payload: HandOff = serde_json::from_str(&self.payload)
            .with_context(|| format!("Corrupt payload for dispatch task {}", self.id))?;
        Ok(DispatchTask {
            id: self.id,
            course_id: self.course_id,
            action,
            segment_id: self.segment_id,
            payload,
            status,
            attempts: self.attempts,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
