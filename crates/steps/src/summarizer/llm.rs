// SPDX-License-Identifier: MIT

//! The LLM embedding+chat adapter `SummarizerStep` calls per entity. Kept
//! behind a trait the same way `AstTool` wraps the container runtime: the
//! network call is the untestable part, so it's swappable for a
//! deterministic fake in tests.

use async_trait::async_trait;
use codestory_core::ErrorKind;
use codestory_core::ErrorRecord;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const EMBEDDING_DIMENSIONS: usize = 16;

/// Everything the adapter needs to produce one entity's summary. `context`
/// is already truncated to the step's token budget by the caller.
///
/// `chat_model`/`embedding_model`/`prompt_template` are per-job overrides
/// of `LlmConfig`'s startup defaults (`None` falls back to the adapter's
/// configured model and server-side template).
#[derive(Debug, Clone, Default)]
pub struct SummaryPrompt {
    pub entity_kind: &'static str,
    pub name: String,
    pub context: String,
    pub chat_model: Option<String>,
    pub embedding_model: Option<String>,
    pub prompt_template: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SummaryResult {
    pub text: String,
    pub embedding: Vec<f32>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn summarize(&self, prompt: SummaryPrompt) -> Result<SummaryResult, ErrorRecord>;
}

/// Connection settings for the real HTTP-backed adapter.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

pub struct HttpLlmClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[derive(Serialize)]
struct SummarizeRequest<'a> {
    model: &'a str,
    embedding_model: &'a str,
    entity_kind: &'a str,
    name: &'a str,
    context: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt_template: Option<&'a str>,
}

#[derive(Deserialize)]
struct SummarizeResponse {
    text: String,
    embedding: Vec<f32>,
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn summarize(&self, prompt: SummaryPrompt) -> Result<SummaryResult, ErrorRecord> {
        let request = SummarizeRequest {
            model: prompt.chat_model.as_deref().unwrap_or(&self.config.model),
            embedding_model: prompt.embedding_model.as_deref().unwrap_or(&self.config.model),
            entity_kind: prompt.entity_kind,
            name: &prompt.name,
            context: &prompt.context,
            prompt_template: prompt.prompt_template.as_deref(),
        };
        let response = self
            .client
            .post(format!("{}/v1/summarize", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .timeout(self.config.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|err| ErrorRecord::new(ErrorKind::LlmError, err.to_string()))?;

        if !response.status().is_success() {
            return Err(ErrorRecord::new(
                ErrorKind::LlmError,
                format!("llm adapter returned {}", response.status()),
            ));
        }

        let body: SummarizeResponse = response
            .json()
            .await
            .map_err(|err| ErrorRecord::new(ErrorKind::LlmError, err.to_string()))?;
        Ok(SummaryResult { text: body.text, embedding: body.embedding })
    }
}

/// Deterministic stand-in for `HttpLlmClient`: every summary is derived
/// from the prompt itself, so tests can assert on its content without a
/// network call.
#[cfg(any(test, feature = "test-support"))]
pub struct FakeLlmClient;

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl LlmClient for FakeLlmClient {
    async fn summarize(&self, prompt: SummaryPrompt) -> Result<SummaryResult, ErrorRecord> {
        let text = format!("Summary of {} {}: {}", prompt.entity_kind, prompt.name, first_line(&prompt.context));
        let embedding = deterministic_embedding(&prompt.name);
        Ok(SummaryResult { text, embedding })
    }
}

fn first_line(context: &str) -> &str {
    context.lines().next().unwrap_or("").trim()
}

#[cfg(any(test, feature = "test-support"))]
fn deterministic_embedding(seed: &str) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    (0..EMBEDDING_DIMENSIONS)
        .map(|i| {
            let mut hasher = DefaultHasher::new();
            (seed, i).hash(&mut hasher);
            let bits = hasher.finish();
            ((bits % 2000) as f32 / 1000.0) - 1.0
        })
        .collect()
}
