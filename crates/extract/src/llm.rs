//! Remote LLM extractor.
//!
//! Speaks the OpenAI-compatible `chat/completions` protocol with a structured-output
//! (`json_schema`) response format, so any compatible gateway works.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::extractor::Extractor;
use crate::field::FieldSet;
use crate::result::{ExtractError, StructuredResult};
use crate::schema;

const SYSTEM_PROMPT: &str = "You extract contact and profile data from the user's text. \
Respond only with JSON matching the provided schema. Use null for optional fields that \
are not present and empty arrays for lists with no entries. Never invent values.";

/// Connection settings for the remote extractor.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_base_url: String,
    pub api_key: String,
    pub model: String,
    /// Client-side HTTP timeout. Keep it at or below the extraction deadline.
    pub request_timeout: Duration,
}

impl LlmConfig {
    pub fn new(api_base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// LLM-backed extractor.
#[derive(Debug, Clone)]
pub struct LlmExtractor {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl LlmExtractor {
    pub fn new(config: LlmConfig) -> Result<Self, ExtractError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ExtractError::upstream(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.api_base_url.trim_end_matches('/')),
            api_key: config.api_key,
            model: config.model,
            request_timeout: config.request_timeout,
        })
    }

    fn request_body(&self, text: &str, fields: &FieldSet) -> serde_json::Value {
        json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": text},
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "extraction",
                    "strict": true,
                    "schema": schema::json_schema(fields),
                },
            },
        })
    }
}

#[async_trait::async_trait]
impl Extractor for LlmExtractor {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn extract(&self, text: &str, fields: &FieldSet) -> Result<StructuredResult, ExtractError> {
        debug!(model = %self.model, text_len = text.len(), "calling LLM extractor");

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(text, fields))
            .send()
            .await
            .map_err(|e| {
                warn!(model = %self.model, error = %e, "LLM request failed");
                if e.is_timeout() {
                    ExtractError::Timeout(self.request_timeout.as_millis() as u64)
                } else {
                    ExtractError::upstream(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            warn!(model = %self.model, %status, "LLM returned error status");
            return Err(ExtractError::upstream(format!("status {status}: {snippet}")));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| ExtractError::upstream(format!("malformed completion body: {e}")))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ExtractError::upstream("completion has no content"))?;

        let value: serde_json::Value = serde_json::from_str(content.trim())
            .map_err(|e| ExtractError::upstream(format!("content is not JSON: {e}")))?;

        debug!(model = %self.model, "LLM extraction returned");
        schema::validate(&value, fields)
    }
}
