//! LLM endpoint seam.
//!
//! The reasoner treats the model as an external function
//! `prompt -> response text` with well-defined failure modes; everything
//! here is swappable for a fake in tests.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::errors::{LlmError, LlmResult};

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Sends one prompt and returns the raw response text.
    async fn complete(&self, prompt: &str) -> LlmResult<String>;
}

/// Client for a Gemini-style `generateContent` endpoint.
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

impl HttpLlmClient {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> LlmResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    /// Cheap credential check used at startup: lists models and maps an
    /// auth rejection to [`LlmError::Credential`].
    pub async fn verify_credentials(&self) -> LlmResult<()> {
        let url = format!("{}/models?key={}", self.base_url, self.api_key);
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(LlmError::Credential(status.as_u16()));
        }
        if !status.is_success() {
            return Err(LlmError::Http {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str) -> LlmResult<String> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": 0.1,
                "topP": 0.8,
                "maxOutputTokens": 1024,
            },
        });

        let response = self.http.post(url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Http {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: GenerateResponse = response.json().await?;
        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .into_iter()
                    .map(|part| part.text)
                    .collect()
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        debug!(length = text.len(), "llm response received");
        Ok(text)
    }
}
