//! Turns untrusted plan drafts into a bounded, ordered set of question plans.
//!
//! Drafts without a rationale or with an unknown archetype are dropped. If
//! more survive than `max_plans`, they are ranked by a deterministic score and
//! truncated; ties keep provider order. Survivors are then ordered by target
//! timestamp and given stable ids `q01`, `q02`, ...

use std::collections::HashSet;

use crate::archetype::{Archetype, CognitiveLevel, PlanIntent};
use crate::provider::PlanDraft;
use crate::store::models::{PlanStatus, QuestionPlan, Segment, TimeRange};

const COGNITIVE_WEIGHT: f64 = 3.0;
const RATIONALE_WEIGHT: f64 = 1.0;
const OBJECTIVE_WEIGHT: f64 = 1.5;
const DIVERSITY_WEIGHT: f64 = 2.0;

/// A draft that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedDraft {
    pub archetype: Archetype,
    pub intent: PlanIntent,
    pub target_timestamp: f64,
    /// Position in the provider's list, used for tie-breaking.
    pub original_index: usize,
}

/// Why a draft was discarded.
#[derive(Debug, Clone, PartialEq)]
pub enum DraftRejection {
    MissingRationale,
    UnsupportedArchetype(String),
}

impl std::fmt::Display for DraftRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingRationale => write!(f, "missing educational rationale"),
            Self::UnsupportedArchetype(tag) => write!(f, "unsupported archetype '{}'", tag),
        }
    }
}

/// Validate one draft. Timestamps outside the segment are clamped into it;
/// a missing timestamp falls back to the segment start.
pub fn validate_draft(
    draft: &PlanDraft,
    index: usize,
    range: TimeRange,
) -> Result<ValidatedDraft, DraftRejection> {
    let rationale = draft
        .rationale
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .ok_or(DraftRejection::MissingRationale)?;

    let tag = draft.archetype.as_deref().unwrap_or("").trim();
    let archetype = tag
        .parse::<Archetype>()
        .map_err(|_| DraftRejection::UnsupportedArchetype(tag.to_string()))?;

    let cognitive_level = draft
        .cognitive_level
        .as_deref()
        .and_then(|l| l.parse::<CognitiveLevel>().ok());

    let target_timestamp = draft
        .target_timestamp
        .filter(|t| t.is_finite())
        .unwrap_or(range.start)
        .clamp(range.start, range.end.max(range.start));

    Ok(ValidatedDraft {
        archetype,
        intent: PlanIntent {
            rationale: rationale.to_string(),
            learning_objective: draft
                .learning_objective
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .to_string(),
            cognitive_level,
            focus: draft
                .focus
                .as_deref()
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string),
        },
        target_timestamp,
        original_index: index,
    })
}

fn rationale_bucket(rationale: &str) -> f64 {
    match rationale.chars().count() {
        0..40 => 0.0,
        40..120 => 1.0,
        _ => 2.0,
    }
}

/// How specific the learning objective is, by word count.
fn objective_bucket(objective: &str) -> f64 {
    match objective.split_whitespace().count() {
        0 => 0.0,
        1..6 => 1.0,
        _ => 2.0,
    }
}

/// Deterministic ranking score. `first_of_archetype` is true for the first
/// draft (in provider order) using its archetype.
pub fn score(draft: &ValidatedDraft, first_of_archetype: bool) -> f64 {
    let cognitive = draft
        .intent
        .cognitive_level
        .map(|l| l.ordinal() as f64)
        .unwrap_or(0.0);
    let diversity = if first_of_archetype { 1.0 } else { 0.0 };
    COGNITIVE_WEIGHT * cognitive
        + RATIONALE_WEIGHT * rationale_bucket(&draft.intent.rationale)
        + OBJECTIVE_WEIGHT * objective_bucket(&draft.intent.learning_objective)
        + DIVERSITY_WEIGHT * diversity
}

/// Keep at most `max_plans` drafts, highest score first, ties by provider order.
pub fn rank_and_truncate(drafts: Vec<ValidatedDraft>, max_plans: usize) -> Vec<ValidatedDraft> {
    if drafts.len() <= max_plans {
        return drafts;
    }
    let mut seen = HashSet::new();
    let mut scored: Vec<(f64, ValidatedDraft)> = drafts
        .into_iter()
        .map(|d| {
            let first = seen.insert(d.archetype);
            (score(&d, first), d)
        })
        .collect();
    // Stable sort keeps provider order among equal scores.
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.truncate(max_plans);
    scored.into_iter().map(|(_, d)| d).collect()
}

/// Full planning step for one segment.
pub fn build_plans(segment: &Segment, drafts: &[PlanDraft], max_plans: usize) -> Vec<QuestionPlan> {
    let mut valid = Vec::new();
    for (index, draft) in drafts.iter().enumerate() {
        match validate_draft(draft, index, segment.time_range) {
            Ok(v) => valid.push(v),
            Err(reason) => tracing::info!(
                segment_id = %segment.id,
                draft_index = index,
                %reason,
                "Discarding plan draft"
            ),
        }
    }

    let mut kept = rank_and_truncate(valid, max_plans);
    kept.sort_by(|a, b| {
        a.target_timestamp
            .total_cmp(&b.target_timestamp)
            .then(a.original_index.cmp(&b.original_index))
    });

    kept.into_iter()
        .enumerate()
        .map(|(i, d)| {
            let question_id = format!("q{:02}", i + 1);
            QuestionPlan {
                id: QuestionPlan::plan_id(&segment.id, &question_id),
                segment_id: segment.id.clone(),
                course_id: segment.course_id.clone(),
                question_id,
                archetype: d.archetype,
                target_timestamp: d.target_timestamp,
                status: PlanStatus::Planned,
                intent: d.intent,
                error_message: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::SegmentStatus;

    fn segment() -> Segment {
        Segment {
            id: "c-s001".into(),
            course_id: "c".into(),
            segment_index: 1,
            time_range: TimeRange::new(600.0, 1200.0),
            status: SegmentStatus::Processing,
            lease_owner: Some("w".into()),
            lease_started_at: Some(0),
            lease_epoch: 1,
            retry_count: 0,
            cumulative_context: None,
            questions_count: 0,
            error_message: None,
            note: None,
            updated_at: String::new(),
        }
    }

    fn draft(archetype: &str, rationale: &str, ts: f64) -> PlanDraft {
        PlanDraft {
            archetype: Some(archetype.into()),
            rationale: Some(rationale.into()),
            target_timestamp: Some(ts),
            ..Default::default()
        }
    }

    #[test]
    fn test_invalid_drafts_are_discarded() {
        let drafts = vec![
            draft("true_false", "recall check", 700.0),
            draft("essay", "open response", 710.0),
            draft("matching", "   ", 720.0),
            PlanDraft::default(),
        ];
        let plans = build_plans(&segment(), &drafts, 6);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].archetype, Archetype::TrueFalse);
    }

    #[test]
    fn test_plans_sorted_by_timestamp_with_stable_ids() {
        let drafts = vec![
            draft("hotspot", "spatial recall", 900.0),
            draft("mcq", "concept check", 650.0),
            draft("ordering", "procedure", 800.0),
        ];
        let plans = build_plans(&segment(), &drafts, 6);
        let ids: Vec<&str> = plans.iter().map(|p| p.question_id.as_str()).collect();
        assert_eq!(ids, vec!["q01", "q02", "q03"]);
        let archetypes: Vec<Archetype> = plans.iter().map(|p| p.archetype).collect();
        assert_eq!(
            archetypes,
            vec![Archetype::MultipleChoice, Archetype::Sequencing, Archetype::Hotspot]
        );
        assert_eq!(plans[0].id, "c-s001:q01");
        assert!(plans.iter().all(|p| p.status == PlanStatus::Planned));
    }

    #[test]
    fn test_timestamps_clamped_into_segment() {
        let drafts = vec![
            draft("true_false", "too early", 10.0),
            PlanDraft {
                archetype: Some("true_false".into()),
                rationale: Some("no timestamp".into()),
                ..Default::default()
            },
            draft("true_false", "too late", 5000.0),
        ];
        let plans = build_plans(&segment(), &drafts, 6);
        let stamps: Vec<f64> = plans.iter().map(|p| p.target_timestamp).collect();
        assert_eq!(stamps, vec![600.0, 600.0, 1200.0]);
    }

    #[test]
    fn test_ranking_prefers_higher_cognitive_level() {
        let mut low = draft("true_false", "recall", 700.0);
        low.cognitive_level = Some("remember".into());
        let mut high = draft("true_false", "recall", 710.0);
        high.cognitive_level = Some("evaluate".into());
        let plans = build_plans(&segment(), &[low, high], 1);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].target_timestamp, 710.0);
    }

    #[test]
    fn test_ranking_rewards_archetype_diversity() {
        // Equal on every other axis: the first matching draft gets the
        // diversity bonus, the second (repeat archetype) does not.
        let drafts = vec![
            draft("true_false", "recall", 700.0),
            draft("true_false", "recall", 710.0),
            draft("matching", "recall", 720.0),
        ];
        let plans = build_plans(&segment(), &drafts, 2);
        let archetypes: Vec<Archetype> = plans.iter().map(|p| p.archetype).collect();
        assert_eq!(archetypes, vec![Archetype::TrueFalse, Archetype::Matching]);
        assert_eq!(plans[0].target_timestamp, 700.0);
    }

    #[test]
    fn test_ties_keep_provider_order() {
        let drafts: Vec<PlanDraft> = (0..5)
            .map(|i| draft("true_false", "recall", 1000.0 - i as f64))
            .collect();
        let plans = build_plans(&segment(), &drafts, 3);
        // First draft carries the diversity bonus, then provider order.
        let stamps: Vec<f64> = plans.iter().map(|p| p.target_timestamp).collect();
        assert_eq!(stamps, vec![998.0, 999.0, 1000.0]);
    }

    #[test]
    fn test_score_buckets() {
        assert_eq!(rationale_bucket("short"), 0.0);
        assert_eq!(rationale_bucket(&"x".repeat(40)), 1.0);
        assert_eq!(rationale_bucket(&"x".repeat(120)), 2.0);
        assert_eq!(objective_bucket(""), 0.0);
        assert_eq!(objective_bucket("explain entropy"), 1.0);
        assert_eq!(objective_bucket("explain why entropy increases in closed systems"), 2.0);
    }
}
