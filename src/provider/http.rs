//! JSON-over-HTTP adapters for the provider traits.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{
    AnalysisRequest, AnalysisResponse, ContentAnalyzer, GenerationRequest, GeneratorRegistry,
    QuestionGenerator,
};
use crate::archetype::{Archetype, QuestionArtifact};
use crate::errors::{GenerationError, ProviderError};

/// Longest response body echoed into an error message.
const MAX_ERROR_BODY: usize = 512;

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("lectern/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

/// POST `body` as JSON and return the raw response text on 2xx.
async fn post_json<T: serde::Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    body: &T,
) -> Result<String, ProviderError> {
    let resp = client
        .post(url)
        .header("Accept", "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| ProviderError::Transport(e.to_string()))?;

    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| ProviderError::Transport(e.to_string()))?;
    if !status.is_success() {
        return Err(ProviderError::Status {
            status: status.as_u16(),
            body: truncate_body(&text),
        });
    }
    Ok(text)
}

pub struct HttpContentAnalyzer {
    client: reqwest::Client,
    url: String,
}

impl HttpContentAnalyzer {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ContentAnalyzer for HttpContentAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResponse, ProviderError> {
        let text = post_json(&self.client, &self.url, request).await?;
        let response: AnalysisResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Malformed(format!("analysis response: {}", e)))?;
        if let Some(bad) = response
            .transcript
            .lines
            .iter()
            .find(|l| !l.start.is_finite() || !l.end.is_finite() || l.end < l.start)
        {
            return Err(ProviderError::Malformed(format!(
                "transcript line has invalid timing [{}, {}]",
                bad.start, bad.end
            )));
        }
        Ok(response)
    }
}

/// One generator endpoint serving a single archetype.
pub struct HttpQuestionGenerator {
    client: reqwest::Client,
    url: String,
    archetype: Archetype,
}

impl HttpQuestionGenerator {
    pub fn new(archetype: Archetype, url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
            archetype,
        })
    }
}

#[async_trait]
impl QuestionGenerator for HttpQuestionGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<QuestionArtifact, GenerationError> {
        let text = post_json(&self.client, &self.url, request)
            .await
            .map_err(|e| GenerationError::Failed(e.to_string()))?;
        let artifact: QuestionArtifact = serde_json::from_str(&text).map_err(|e| {
            GenerationError::InvalidArtifact(format!("{} generator response: {}", self.archetype, e))
        })?;
        Ok(artifact)
    }
}

/// Build a registry with one HTTP generator per configured archetype.
pub fn build_registry(
    endpoints: &BTreeMap<Archetype, String>,
    timeout: Duration,
) -> Result<GeneratorRegistry> {
    let mut registry = GeneratorRegistry::new();
    for (archetype, url) in endpoints {
        let generator = HttpQuestionGenerator::new(*archetype, url.clone(), timeout)?;
        registry.register(*archetype, Arc::new(generator));
    }
    Ok(registry)
}
