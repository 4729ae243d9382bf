use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::archetype::{Archetype, PlanIntent, QuestionArtifact};
use crate::context::MergedContext;

/// A contiguous slice of the source video, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t <= self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub id: String,
    pub title: String,
    pub video_ref: String,
    pub total_segments: i64,
    pub published: bool,
    pub published_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SegmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SegmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid segment status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub course_id: String,
    pub segment_index: i64,
    pub time_range: TimeRange,
    pub status: SegmentStatus,
    pub lease_owner: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub lease_started_at: Option<i64>,
    pub lease_epoch: i64,
    pub retry_count: i64,
    pub cumulative_context: Option<MergedContext>,
    pub questions_count: i64,
    pub error_message: Option<String>,
    pub note: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Planned,
    Generating,
    Completed,
    Failed,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Plan status only moves forward. `Generating -> Generating` is allowed so
    /// a takeover worker can resume a plan abandoned mid-generation.
    pub fn can_transition_to(&self, next: PlanStatus) -> bool {
        matches!(
            (self, next),
            (Self::Planned, Self::Generating)
                | (Self::Generating, Self::Generating)
                | (Self::Generating, Self::Completed)
                | (Self::Generating, Self::Failed)
                | (Self::Planned, Self::Failed)
        )
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PlanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(Self::Planned),
            "generating" => Ok(Self::Generating),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid plan status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionPlan {
    /// `<segment_id>:<question_id>`; stable across reattempts.
    pub id: String,
    pub segment_id: String,
    pub course_id: String,
    pub question_id: String,
    pub archetype: Archetype,
    pub target_timestamp: f64,
    pub status: PlanStatus,
    pub intent: PlanIntent,
    pub error_message: Option<String>,
}

impl QuestionPlan {
    pub fn plan_id(segment_id: &str, question_id: &str) -> String {
        format!("{}:{}", segment_id, question_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedQuestion {
    pub plan_id: String,
    pub segment_id: String,
    pub course_id: String,
    pub question_id: String,
    pub target_timestamp: f64,
    pub artifact: QuestionArtifact,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Queued,
    Planning,
    Generation,
    Storage,
    SegmentComplete,
    Completed,
    Failed,
}

impl ProgressStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Planning => "planning",
            Self::Generation => "generation",
            Self::Storage => "storage",
            Self::SegmentComplete => "segment_complete",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ProgressStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "planning" => Ok(Self::Planning),
            "generation" => Ok(Self::Generation),
            "storage" => Ok(Self::Storage),
            "segment_complete" => Ok(Self::SegmentComplete),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid progress stage: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub course_id: String,
    pub session_id: String,
    pub stage: ProgressStage,
    pub step: String,
    pub stage_progress: f64,
    pub overall_progress: f64,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchAction {
    ProcessSegment,
    FinalizeCourse,
}

impl DispatchAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessSegment => "process_segment",
            Self::FinalizeCourse => "finalize_course",
        }
    }
}

impl FromStr for DispatchAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process_segment" => Ok(Self::ProcessSegment),
            "finalize_course" => Ok(Self::FinalizeCourse),
            _ => Err(format!("Invalid dispatch action: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// The "start next segment" call, recorded durably.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandOff {
    pub course_id: String,
    pub segment_id: Option<String>,
    pub time_range: Option<TimeRange>,
    pub inherited_context: Option<MergedContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchTask {
    pub id: i64,
    pub course_id: String,
    pub action: DispatchAction,
    pub segment_id: Option<String>,
    pub payload: HandOff,
    pub status: TaskStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_status_roundtrip() {
        for status in [
            SegmentStatus::Pending,
            SegmentStatus::Processing,
            SegmentStatus::Completed,
            SegmentStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<SegmentStatus>().unwrap(), status);
        }
        assert!("done".parse::<SegmentStatus>().is_err());
    }

    #[test]
    fn test_plan_status_is_monotonic() {
        use PlanStatus::*;
        assert!(Planned.can_transition_to(Generating));
        assert!(Generating.can_transition_to(Completed));
        assert!(Generating.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Generating));
        assert!(!Failed.can_transition_to(Planned));
        assert!(!Generating.can_transition_to(Planned));
        assert!(!Completed.can_transition_to(Failed));
    }

    #[test]
    fn test_dispatch_action_and_task_status_roundtrip() {
        for action in [DispatchAction::ProcessSegment, DispatchAction::FinalizeCourse] {
            assert_eq!(action.as_str().parse::<DispatchAction>().unwrap(), action);
        }
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Done,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_serde_produces_snake_case_strings() {
        let json = serde_json::to_string(&ProgressStage::SegmentComplete).unwrap();
        assert_eq!(json, "\"segment_complete\"");
        let json = serde_json::to_string(&SegmentStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }

    #[test]
    fn test_time_range_duration_and_contains() {
        let range = TimeRange::new(600.0, 1200.0);
        assert_eq!(range.duration(), 600.0);
        assert!(range.contains(600.0));
        assert!(range.contains(1200.0));
        assert!(!range.contains(1200.5));
    }

    #[test]
    fn test_plan_id_joins_segment_and_question() {
        assert_eq!(QuestionPlan::plan_id("seg-a", "q03"), "seg-a:q03");
    }
}
