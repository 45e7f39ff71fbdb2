/// OpenAI-compatible LLM provider
///
/// Calls any OpenAI-compatible Chat Completions API. Structured requests use the
/// json_object response format with the schema spelled out in the system prompt,
/// since json_object mode does not enforce a schema by itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{LlmError, LlmProvider, LlmRequest};

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat provider.
///
/// base_url is configurable so any OpenAI-compatible endpoint works, not only
/// api.openai.com.
pub struct OpenAILlmProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAILlmProvider {
    /// Create a new OpenAILlmProvider.
    ///
    /// # Errors
    /// Returns `LlmError::NotConfigured` if api_key is empty.
    pub fn new(
        base_url: String,
        api_key: String,
        model: String,
        temperature: f32,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        if api_key.trim().is_empty() {
            return Err(LlmError::NotConfigured(
                "OpenAI API key is required when using the openai LLM provider. \
                 Set RENTQL_LLM__OPENAI_API_KEY or llm.openai_api_key in rentql.toml"
                    .to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::NotConfigured(format!("Failed to build HTTP client: {}", e)))?;

        Ok(OpenAILlmProvider {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            temperature,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAILlmProvider {
    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let (system, response_format) = match request.schema {
            Some(ref schema) => (
                format!(
                    "{}\n\nRespond with a single JSON object matching this JSON schema:\n{}",
                    request.system, schema
                ),
                Some(ResponseFormat {
                    format_type: "json_object".to_string(),
                }),
            ),
            None => (request.system.clone(), None),
        };

        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system,
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: request.prompt.clone(),
                },
            ],
            temperature: self.temperature,
            response_format,
        };

        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(LlmError::Api { status, message: body });
        }

        let chat_response: ChatResponse = response.json().await.map_err(|e| {
            LlmError::Generation(format!("Failed to parse OpenAI response: {}", e))
        })?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Generation("OpenAI returned empty choices list".to_string()))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
