//! Seams to the external AI providers.
//!
//! Real implementations live in [`http`]. Tests plug in scripted doubles.

pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::archetype::{Archetype, QuestionArtifact};
use crate::context::MergedContext;
use crate::errors::{GenerationError, ProviderError};
use crate::store::models::{QuestionPlan, TimeRange};
use crate::transcript::Transcript;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub video_ref: String,
    pub time_range: TimeRange,
    pub max_plans: usize,
    pub inherited_context: Option<MergedContext>,
}

/// A plan proposal exactly as the provider sent it. Every field is optional
/// because the provider is not trusted; planning validates before use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    #[serde(default)]
    pub archetype: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub learning_objective: Option<String>,
    #[serde(default)]
    pub cognitive_level: Option<String>,
    #[serde(default)]
    pub target_timestamp: Option<f64>,
    #[serde(default)]
    pub focus: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub transcript: Transcript,
    #[serde(default)]
    pub plan_drafts: Vec<PlanDraft>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub plan: QuestionPlan,
    /// Transcript text surrounding the plan's target timestamp.
    pub transcript_context: String,
}

/// Content-analysis provider: transcript plus question plan drafts for a
/// time range of the source video.
#[async_trait]
pub trait ContentAnalyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResponse, ProviderError>;
}

/// Archetype-specific question generator.
#[async_trait]
pub trait QuestionGenerator: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<QuestionArtifact, GenerationError>;
}

/// Archetype → generator lookup used by the generation stage.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    generators: HashMap<Archetype, Arc<dyn QuestionGenerator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, archetype: Archetype, generator: Arc<dyn QuestionGenerator>) {
        self.generators.insert(archetype, generator);
    }

    pub fn with(mut self, archetype: Archetype, generator: Arc<dyn QuestionGenerator>) -> Self {
        self.register(archetype, generator);
        self
    }

    pub fn get(&self, archetype: Archetype) -> Option<Arc<dyn QuestionGenerator>> {
        self.generators.get(&archetype).cloned()
    }

    pub fn archetypes(&self) -> Vec<Archetype> {
        let mut archetypes: Vec<Archetype> = self.generators.keys().copied().collect();
        archetypes.sort();
        archetypes
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }
}
