//! OpenAI chat-completions summarizer.
//!
//! One request per call. Retry, backoff, and response caching live in
//! the rate-limited caller; this adapter only classifies failures so
//! the caller knows how to react.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::Summary;

use super::{CallError, Summarizer};

/// Hard cap on input characters; roughly 8k tokens of paper text
const MAX_INPUT_CHARS: usize = 30_000;

/// Per-request timeout. Long papers take a while.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

const MAX_OUTPUT_TOKENS: u32 = 1500;

/// One summarization request, normalized for caching
#[derive(Debug, Clone)]
pub struct SummarizeRequest {
    pub text: String,
    pub language: String,
    pub model: String,
}

impl SummarizeRequest {
    /// Build a request, truncating oversized input
    pub fn new(
        text: impl Into<String>,
        language: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let mut text = text.into();
        if text.chars().count() > MAX_INPUT_CHARS {
            text = text.chars().take(MAX_INPUT_CHARS).collect();
            text.push_str("... [truncated]");
        }
        Self {
            text,
            language: language.into(),
            model: model.into(),
        }
    }

    /// Cache key over everything that changes the response
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.model.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.language.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.text.as_bytes());
        let hash = hasher.finalize();
        hex::encode(&hash[..8])
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Chat-completions client
pub struct OpenAiSummarizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl OpenAiSummarizer {
    pub fn new(endpoint: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }

    /// Create from resolved config, reading the API key from the
    /// configured environment variable
    pub fn from_config() -> Result<Self> {
        let settings = crate::config::config()?.summarizer.clone();
        let api_key = std::env::var(&settings.api_key_env).with_context(|| {
            format!("{} environment variable required", settings.api_key_env)
        })?;
        Ok(Self::new(settings.endpoint, api_key))
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    fn name(&self) -> &str {
        "openai"
    }

    async fn summarize(&self, request: &SummarizeRequest) -> Result<Summary, CallError> {
        let payload = ChatRequest {
            model: request.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt(&request.language),
                },
                ChatMessage {
                    role: "user",
                    content: request.text.clone(),
                },
            ],
            max_tokens: MAX_OUTPUT_TOKENS,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(&payload)
            .send()
            .await
            .map_err(|e| CallError::Transient(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CallError::RateLimited);
        }
        if status.is_server_error() {
            return Err(CallError::Transient(format!("server error ({status})")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::NonRetryable(format!("{status}: {body}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CallError::Transient(format!("invalid response body: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| CallError::Transient("response had no choices".to_string()))?;

        parse_summary(&content)
    }
}

/// Parse the model's JSON reply into a summary. Models occasionally
/// wrap JSON in code fences despite the response format, so strip them
/// first. Malformed or incomplete output is transient: a retry usually
/// yields valid JSON.
fn parse_summary(content: &str) -> Result<Summary, CallError> {
    let body = strip_code_fences(content);
    let summary: Summary = serde_json::from_str(body)
        .map_err(|e| CallError::Transient(format!("malformed summary JSON: {e}")))?;
    if !summary.is_complete() {
        return Err(CallError::Transient(
            "summary missing required sections".to_string(),
        ));
    }
    Ok(summary)
}

fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed);
    trimmed.trim()
}

fn system_prompt(language: &str) -> String {
    format!(
        "You are a research assistant summarizing academic papers. \
         Respond with a single JSON object containing exactly these keys: \
         \"short_summary\" (one paragraph), \"long_summary\" (detailed notes, markdown allowed), \
         \"contributions\", \"limitations\", \"ideas\", \
         and \"keywords\" (an array of topic strings). \
         Write all prose in {}.",
        language_name(language)
    )
}

fn language_name(code: &str) -> &str {
    match code {
        "ko" => "Korean",
        "en" => "English",
        "ja" => "Japanese",
        "zh" => "Chinese",
        other => other,
    }
}
