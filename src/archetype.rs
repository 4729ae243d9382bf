//! Question archetypes and their tagged plan/artifact variants.
//!
//! Every archetype has exactly one artifact variant. The generation stage
//! matches on these exhaustively, so adding an archetype is a compile error
//! until every stage handles it.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::GenerationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Archetype {
    MultipleChoice,
    TrueFalse,
    Hotspot,
    Matching,
    Sequencing,
}

impl Archetype {
    pub const ALL: [Archetype; 5] = [
        Archetype::MultipleChoice,
        Archetype::TrueFalse,
        Archetype::Hotspot,
        Archetype::Matching,
        Archetype::Sequencing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MultipleChoice => "multiple_choice",
            Self::TrueFalse => "true_false",
            Self::Hotspot => "hotspot",
            Self::Matching => "matching",
            Self::Sequencing => "sequencing",
        }
    }
}

impl std::fmt::Display for Archetype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Archetype {
    type Err = String;

    /// Lenient parse: providers send `multiple-choice`, `Multiple Choice`, `mcq`...
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == '-' || c == ' ' { '_' } else { c })
            .collect();
        match normalized.as_str() {
            "multiple_choice" | "mcq" | "choice" => Ok(Self::MultipleChoice),
            "true_false" | "true_or_false" | "truefalse" => Ok(Self::TrueFalse),
            "hotspot" | "spatial" | "spatial_hotspot" => Ok(Self::Hotspot),
            "matching" | "match" => Ok(Self::Matching),
            "sequencing" | "ordering" | "sequence" => Ok(Self::Sequencing),
            _ => Err(format!("Unsupported archetype: {}", s)),
        }
    }
}

/// Bloom-style cognitive level of a planned question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CognitiveLevel {
    Remember,
    Understand,
    Apply,
    Analyze,
    Evaluate,
    Create,
}

impl CognitiveLevel {
    pub fn ordinal(&self) -> u32 {
        match self {
            Self::Remember => 1,
            Self::Understand => 2,
            Self::Apply => 3,
            Self::Analyze => 4,
            Self::Evaluate => 5,
            Self::Create => 6,
        }
    }
}

impl FromStr for CognitiveLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "remember" | "recall" => Ok(Self::Remember),
            "understand" | "comprehension" => Ok(Self::Understand),
            "apply" | "application" => Ok(Self::Apply),
            "analyze" | "analyse" | "analysis" => Ok(Self::Analyze),
            "evaluate" | "evaluation" => Ok(Self::Evaluate),
            "create" | "synthesis" => Ok(Self::Create),
            _ => Err(format!("Invalid cognitive level: {}", s)),
        }
    }
}

/// Pedagogical intent carried by a validated plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanIntent {
    pub rationale: String,
    #[serde(default)]
    pub learning_objective: String,
    #[serde(default)]
    pub cognitive_level: Option<CognitiveLevel>,
    #[serde(default)]
    pub focus: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotspotRegion {
    pub label: String,
    /// Normalized frame coordinates in `[0, 1]`.
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub correct: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingPair {
    pub left: String,
    pub right: String,
}

/// A concrete, generated question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "archetype", rename_all = "snake_case")]
pub enum QuestionArtifact {
    MultipleChoice {
        prompt: String,
        options: Vec<String>,
        correct_index: usize,
        #[serde(default)]
        explanation: String,
    },
    TrueFalse {
        statement: String,
        answer: bool,
        #[serde(default)]
        explanation: String,
    },
    Hotspot {
        prompt: String,
        frame_timestamp: f64,
        regions: Vec<HotspotRegion>,
        #[serde(default)]
        explanation: String,
    },
    Matching {
        prompt: String,
        pairs: Vec<MatchingPair>,
        #[serde(default)]
        explanation: String,
    },
    Sequencing {
        prompt: String,
        steps: Vec<String>,
        #[serde(default)]
        explanation: String,
    },
}

impl QuestionArtifact {
    pub fn archetype(&self) -> Archetype {
        match self {
            Self::MultipleChoice { .. } => Archetype::MultipleChoice,
            Self::TrueFalse { .. } => Archetype::TrueFalse,
            Self::Hotspot { .. } => Archetype::Hotspot,
            Self::Matching { .. } => Archetype::Matching,
            Self::Sequencing { .. } => Archetype::Sequencing,
        }
    }

    /// The learner-facing question text.
    pub fn prompt(&self) -> &str {
        match self {
            Self::MultipleChoice { prompt, .. }
            | Self::Hotspot { prompt, .. }
            | Self::Matching { prompt, .. }
            | Self::Sequencing { prompt, .. } => prompt,
            Self::TrueFalse { statement, .. } => statement,
        }
    }

    /// Spatial sub-records persisted alongside the artifact.
    pub fn hotspot_regions(&self) -> &[HotspotRegion] {
        match self {
            Self::Hotspot { regions, .. } => regions,
            _ => &[],
        }
    }

    /// Structural checks the provider's output must pass before storage.
    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.prompt().trim().is_empty() {
            return Err(GenerationError::InvalidArtifact("empty prompt".into()));
        }
        match self {
            Self::MultipleChoice {
                options,
                correct_index,
                ..
            } => {
                if options.len() < 2 {
                    return Err(GenerationError::InvalidArtifact(format!(
                        "multiple choice needs at least 2 options, got {}",
                        options.len()
                    )));
                }
                if *correct_index >= options.len() {
                    return Err(GenerationError::InvalidArtifact(format!(
                        "correct_index {} out of range for {} options",
                        correct_index,
                        options.len()
                    )));
                }
            }
            Self::TrueFalse { .. } => {}
            Self::Hotspot { regions, .. } => {
                if regions.is_empty() {
                    return Err(GenerationError::InvalidArtifact(
                        "hotspot has no regions".into(),
                    ));
                }
                let in_frame = |v: f64| (0.0..=1.0).contains(&v);
                if let Some(bad) = regions.iter().find(|r| {
                    !in_frame(r.x)
                        || !in_frame(r.y)
                        || !in_frame(r.x + r.width)
                        || !in_frame(r.y + r.height)
                }) {
                    return Err(GenerationError::InvalidArtifact(format!(
                        "hotspot region '{}' lies outside the frame",
                        bad.label
                    )));
                }
                if !regions.iter().any(|r| r.correct) {
                    return Err(GenerationError::InvalidArtifact(
                        "hotspot has no correct region".into(),
                    ));
                }
            }
            Self::Matching { pairs, .. } => {
                if pairs.len() < 2 {
                    return Err(GenerationError::InvalidArtifact(
                        "matching needs at least 2 pairs".into(),
                    ));
                }
            }
            Self::Sequencing { steps, .. } => {
                if steps.len() < 2 {
                    return Err(GenerationError::InvalidArtifact(
                        "sequencing needs at least 2 steps".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archetype_roundtrip() {
        for archetype in Archetype::ALL {
            assert_eq!(archetype.as_str().parse::<Archetype>().unwrap(), archetype);
        }
    }

    #[test]
    fn test_archetype_parse_is_lenient() {
        assert_eq!(
            "Multiple-Choice".parse::<Archetype>().unwrap(),
            Archetype::MultipleChoice
        );
        assert_eq!("ordering".parse::<Archetype>().unwrap(), Archetype::Sequencing);
        assert_eq!("spatial".parse::<Archetype>().unwrap(), Archetype::Hotspot);
        assert!("essay".parse::<Archetype>().is_err());
    }

    #[test]
    fn test_cognitive_level_ordinals_increase() {
        let levels = ["remember", "understand", "apply", "analyze", "evaluate", "create"];
        let ordinals: Vec<u32> = levels
            .iter()
            .map(|l| l.parse::<CognitiveLevel>().unwrap().ordinal())
            .collect();
        assert_eq!(ordinals, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_artifact_serde_uses_archetype_tag() {
        let artifact = QuestionArtifact::TrueFalse {
            statement: "Water boils at 100C at sea level".into(),
            answer: true,
            explanation: String::new(),
        };
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["archetype"], "true_false");
        assert_eq!(artifact.archetype(), Archetype::TrueFalse);
    }

    #[test]
    fn test_multiple_choice_rejects_out_of_range_answer() {
        let artifact = QuestionArtifact::MultipleChoice {
            prompt: "Pick one".into(),
            options: vec!["a".into(), "b".into()],
            correct_index: 2,
            explanation: String::new(),
        };
        assert!(matches!(
            artifact.validate(),
            Err(GenerationError::InvalidArtifact(_))
        ));
    }

    #[test]
    fn test_hotspot_requires_in_frame_correct_region() {
        let mut region = HotspotRegion {
            label: "valve".into(),
            x: 0.5,
            y: 0.5,
            width: 0.2,
            height: 0.2,
            correct: true,
        };
        let ok = QuestionArtifact::Hotspot {
            prompt: "Click the valve".into(),
            frame_timestamp: 42.0,
            regions: vec![region.clone()],
            explanation: String::new(),
        };
        assert!(ok.validate().is_ok());
        assert_eq!(ok.hotspot_regions().len(), 1);

        region.width = 0.8;
        let out_of_frame = QuestionArtifact::Hotspot {
            prompt: "Click the valve".into(),
            frame_timestamp: 42.0,
            regions: vec![region],
            explanation: String::new(),
        };
        assert!(out_of_frame.validate().is_err());
    }

    #[test]
    fn test_empty_prompt_is_invalid() {
        let artifact = QuestionArtifact::Sequencing {
            prompt: "  ".into(),
            steps: vec!["a".into(), "b".into()],
            explanation: String::new(),
        };
        assert!(artifact.validate().is_err());
    }
}
