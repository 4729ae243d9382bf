//! Carry-forward teaching context between segments.
//!
//! Each completed segment contributes a [`ContextDelta`]; deltas are folded
//! into a [`MergedContext`] that the next segment's planning call inherits.
//! Concepts accumulate across the whole course, while the trailing transcript
//! and recent question summaries are bounded windows that get replaced.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::store::models::{GeneratedQuestion, Segment};
use crate::transcript::Transcript;

/// Default trailing transcript window, in seconds.
pub const DEFAULT_TRAILING_WINDOW_SECS: f64 = 120.0;

/// Default number of recent question summaries carried forward.
pub const DEFAULT_RECENT_QUESTIONS: usize = 3;

/// Concept count above which merges log a growth warning.
const CONCEPT_GROWTH_WARNING: usize = 500;

/// Synopsis length when the provider did not supply one.
const SYNOPSIS_FALLBACK_CHARS: usize = 400;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    /// Label as first seen (display form).
    pub label: String,
    pub first_mentioned: f64,
    /// Sorted, de-duplicated mention timestamps.
    pub mentions: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionSummary {
    pub question_id: String,
    pub archetype: String,
    pub timestamp: f64,
    pub summary: String,
}

/// What one segment adds to the running context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDelta {
    pub segment_index: i64,
    pub segment_end: f64,
    pub trailing_transcript: String,
    pub key_concepts: Vec<Concept>,
    pub last_question_summaries: Vec<QuestionSummary>,
    pub synopsis: String,
}

/// Context inherited by the next segment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedContext {
    /// Keyed by normalized label.
    pub concepts: BTreeMap<String, Concept>,
    pub trailing_transcript: String,
    pub last_question_summaries: Vec<QuestionSummary>,
    pub synopsis: String,
    pub total_processed_duration: f64,
    pub segments_merged: u32,
}

impl MergedContext {
    pub fn concept_labels(&self) -> Vec<&str> {
        self.concepts.values().map(|c| c.label.as_str()).collect()
    }
}

/// Normalize a concept label for de-duplication: lower-case, collapse
/// whitespace, strip surrounding punctuation.
pub fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

#[derive(Debug, Clone)]
pub struct ContextPropagator {
    trailing_window: f64,
    recent_questions: usize,
}

impl Default for ContextPropagator {
    fn default() -> Self {
        Self::new(DEFAULT_TRAILING_WINDOW_SECS, DEFAULT_RECENT_QUESTIONS)
    }
}

impl ContextPropagator {
    pub fn new(trailing_window: f64, recent_questions: usize) -> Self {
        Self {
            trailing_window,
            recent_questions,
        }
    }

    /// Derive the delta for a finished segment.
    pub fn extract(
        &self,
        segment: &Segment,
        transcript: &Transcript,
        questions: &[GeneratedQuestion],
    ) -> ContextDelta {
        let end = segment.time_range.end;

        let mut concepts: BTreeMap<String, Concept> = BTreeMap::new();
        for mention in &transcript.key_concepts {
            let key = normalize_label(&mention.label);
            if key.is_empty() {
                continue;
            }
            add_mentions(
                &mut concepts,
                key,
                &mention.label,
                mention.timestamp,
                &[mention.timestamp],
            );
        }

        let mut ordered: Vec<&GeneratedQuestion> = questions.iter().collect();
        ordered.sort_by(|a, b| a.target_timestamp.total_cmp(&b.target_timestamp));
        let skip = ordered.len().saturating_sub(self.recent_questions);
        let last_question_summaries = ordered
            .into_iter()
            .skip(skip)
            .map(|q| QuestionSummary {
                question_id: q.question_id.clone(),
                archetype: q.artifact.archetype().to_string(),
                timestamp: q.target_timestamp,
                summary: q.artifact.prompt().to_string(),
            })
            .collect();

        let synopsis = match &transcript.synopsis {
            Some(s) if !s.trim().is_empty() => s.trim().to_string(),
            _ => transcript
                .text()
                .chars()
                .take(SYNOPSIS_FALLBACK_CHARS)
                .collect(),
        };

        ContextDelta {
            segment_index: segment.segment_index,
            segment_end: end,
            trailing_transcript: transcript.trailing(end, self.trailing_window),
            key_concepts: concepts.into_values().collect(),
            last_question_summaries,
            synopsis,
        }
    }
}

/// Fold a delta into the previous context.
pub fn merge(previous: Option<&MergedContext>, delta: &ContextDelta) -> MergedContext {
    let mut merged = previous.cloned().unwrap_or_default();

    for concept in &delta.key_concepts {
        let key = normalize_label(&concept.label);
        if key.is_empty() {
            continue;
        }
        add_mentions(
            &mut merged.concepts,
            key,
            &concept.label,
            concept.first_mentioned,
            &concept.mentions,
        );
    }

    merged.trailing_transcript = delta.trailing_transcript.clone();
    merged.last_question_summaries = delta.last_question_summaries.clone();
    if !delta.synopsis.is_empty() {
        merged.synopsis = delta.synopsis.clone();
    }
    merged.total_processed_duration = merged.total_processed_duration.max(delta.segment_end);
    merged.segments_merged += 1;

    if merged.concepts.len() > CONCEPT_GROWTH_WARNING {
        tracing::debug!(
            concepts = merged.concepts.len(),
            "Carry-forward concept set is growing large"
        );
    }

    merged
}

fn add_mentions(
    concepts: &mut BTreeMap<String, Concept>,
    key: String,
    label: &str,
    first_mentioned: f64,
    mentions: &[f64],
) {
    let entry = concepts.entry(key).or_insert_with(|| Concept {
        label: label.trim().to_string(),
        first_mentioned,
        mentions: Vec::new(),
    });
    if first_mentioned < entry.first_mentioned {
        entry.first_mentioned = first_mentioned;
    }
    entry.mentions.extend_from_slice(mentions);
    entry.mentions.sort_by(f64::total_cmp);
    entry.mentions.dedup();
}
