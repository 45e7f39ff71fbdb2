/// LLM provider trait and supporting types
///
/// Provides a pluggable interface for chat completion with optional structured
/// (JSON schema) output. Supports Ollama (local, default, no API key) and
/// OpenAI-compatible APIs.

pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors that can occur during LLM calls.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Inference or JSON parse failure
    #[error("LLM generation error: {0}")]
    Generation(String),

    /// API provider returned an HTTP error
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Provider not configured (e.g., missing API key or model)
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    /// Request exceeded the configured timeout
    #[error("LLM timeout: {0}")]
    Timeout(String),
}

impl LlmError {
    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout(e.to_string())
        } else {
            LlmError::Generation(format!("HTTP request failed: {}", e))
        }
    }
}

/// A single chat completion request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// System instructions
    pub system: String,
    /// User turn
    pub prompt: String,
    /// JSON schema the output must follow. `None` means free text.
    pub schema: Option<serde_json::Value>,
}

impl LlmRequest {
    pub fn text(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        LlmRequest {
            system: system.into(),
            prompt: prompt.into(),
            schema: None,
        }
    }

    pub fn json(
        system: impl Into<String>,
        prompt: impl Into<String>,
        schema: serde_json::Value,
    ) -> Self {
        LlmRequest {
            system: system.into(),
            prompt: prompt.into(),
            schema: Some(schema),
        }
    }
}

/// Core trait for chat completion.
///
/// Implementations must be Send + Sync to support use in async contexts
/// and across thread boundaries (e.g., Arc<dyn LlmProvider>).
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Run one completion and return the raw assistant content.
    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError>;

    /// Return the model name identifier used by this provider.
    fn model_name(&self) -> &str;
}

/// Strip a surrounding markdown code fence (```json, ```sql or bare ```).
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let inner = match trimmed.strip_prefix("```") {
        Some(rest) => {
            // Drop the language tag on the opening fence line
            match rest.find('\n') {
                Some(idx) => &rest[idx + 1..],
                None => rest,
            }
        }
        None => trimmed,
    };
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Cut the outermost `{ ... }` out of model output that wrapped JSON in prose.
fn extract_json_object(raw: &str) -> &str {
    let body = strip_code_fences(raw);
    match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if end > start => &body[start..=end],
        _ => body,
    }
}

/// Parse model output into `T`, tolerating code fences and surrounding prose.
pub fn parse_json_reply<T: DeserializeOwned>(raw: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str::<T>(extract_json_object(raw))
}

/// Run a structured completion and deserialize it into `T`.
///
/// When the output does not parse into `T`, the request is repeated with the
/// parse error appended so the model can correct itself, up to `max_attempts`
/// calls in total. Transport and API errors are returned immediately.
pub async fn complete_json<T: DeserializeOwned>(
    provider: &dyn LlmProvider,
    request: LlmRequest,
    max_attempts: u8,
) -> Result<T, LlmError> {
    let max_attempts = max_attempts.max(1);
    let mut current = request.clone();
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        let content = provider.complete(&current).await?;
        match parse_json_reply::<T>(&content) {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(
                    model = provider.model_name(),
                    attempt,
                    error = %e,
                    "LLM output did not match the expected shape"
                );
                last_error = format!("{} (content: {})", e, content);
                current.prompt = format!(
                    "{}\n\nYour previous answer could not be parsed: {}. \
                     Reply again with only a JSON object matching the schema.",
                    request.prompt, e
                );
            }
        }
    }

    Err(LlmError::Generation(format!(
        "Model output did not match schema after {} attempts: {}",
        max_attempts, last_error
    )))
}
