/// Ollama LLM provider
///
/// Calls the Ollama /api/chat endpoint. Structured requests pass the JSON schema
/// in the `format` field so the server constrains decoding.
/// No API key required; designed for self-hosted Ollama deployments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{LlmError, LlmProvider, LlmRequest};

#[derive(Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

pub struct OllamaLlmProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OllamaLlmProvider {
    /// # Arguments
    /// * `base_url` - Ollama server base URL (e.g., "http://localhost:11434")
    /// * `model` - Model name (e.g., "qwen2.5:7b")
    pub fn new(
        base_url: String,
        model: String,
        temperature: f32,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        if model.trim().is_empty() {
            return Err(LlmError::NotConfigured(
                "Ollama model name is required. Set RENTQL_LLM__OLLAMA_MODEL".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::NotConfigured(format!("Failed to build HTTP client: {}", e)))?;

        Ok(OllamaLlmProvider {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            temperature,
        })
    }
}

#[async_trait]
impl LlmProvider for OllamaLlmProvider {
    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let body = OllamaChatRequest {
            model: self.model.clone(),
            messages: vec![
                OllamaMessage {
                    role: "system".to_string(),
                    content: request.system.clone(),
                },
                OllamaMessage {
                    role: "user".to_string(),
                    content: request.prompt.clone(),
                },
            ],
            stream: false,
            options: OllamaOptions { temperature: self.temperature },
            format: request.schema.clone(),
        };

        let url = format!("{}/api/chat", self.base_url);

        let response = self
            .client
            .post(&url)
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

        let chat_response: OllamaChatResponse = response.json().await.map_err(|e| {
            LlmError::Generation(format!("Failed to parse Ollama response: {}", e))
        })?;

        Ok(chat_response.message.content)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
