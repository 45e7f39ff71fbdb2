/// OpenAI-compatible embedding provider
///
/// Posts to `{base_url}/embeddings`. The default text-embedding-3-small
/// handles Vietnamese noticeably better than the local MiniLM model.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{EmbeddingError, EmbeddingProvider};

/// Inputs per request; well under the API's per-request limit.
const MAX_BATCH: usize = 64;

#[derive(Serialize)]
struct EmbedRequest<'a> {
    input: &'a [&'a str],
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    index: usize,
    embedding: Vec<f32>,
}

/// Vector size for the known OpenAI embedding models.
pub fn model_dimension(model: &str) -> Option<usize> {
    match model {
        "text-embedding-3-small" | "text-embedding-ada-002" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        _ => None,
    }
}

pub struct OpenAIEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dim: usize,
}

impl OpenAIEmbeddingProvider {
    /// # Errors
    /// `NotConfigured` when the API key is empty or the model is unknown.
    pub fn new(base_url: String, api_key: String, model: String) -> Result<Self, EmbeddingError> {
        if api_key.trim().is_empty() {
            return Err(EmbeddingError::NotConfigured(
                "OpenAI API key is required when using the openai embedding provider. \
                 Set RENTQL_EMBEDDING__OPENAI_API_KEY or embedding.openai_api_key in rentql.toml"
                    .to_string(),
            ));
        }
        let dim = model_dimension(&model).ok_or_else(|| {
            EmbeddingError::NotConfigured(format!(
                "Unknown embedding model '{}': expected text-embedding-3-small, \
                 text-embedding-3-large or text-embedding-ada-002",
                model
            ))
        })?;

        Ok(OpenAIEmbeddingProvider {
            client: reqwest::Client::new(),
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            api_key,
            model,
            dim,
        })
    }

    async fn request(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&EmbedRequest { input: texts, model: &self.model })
            .send()
            .await
            .map_err(|e| EmbeddingError::Generation(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(EmbeddingError::Api { status: status.as_u16(), message });
        }

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Generation(format!("Failed to parse API response: {}", e)))?;
        order_by_index(body.data, texts.len())
    }
}

/// The API tags each vector with its input position; put them back in order.
fn order_by_index(mut data: Vec<EmbedData>, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if data.len() != expected {
        return Err(EmbeddingError::CountMismatch { expected, got: data.len() });
    }
    data.sort_by_key(|d| d.index);
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.request(&[text])
            .await?
            .pop()
            .ok_or(EmbeddingError::CountMismatch { expected: 1, got: 0 })
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(MAX_BATCH) {
            vectors.extend(self.request(chunk).await?);
        }
        Ok(vectors)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}
