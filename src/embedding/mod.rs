/// Embeddings for knowledge chunks and questions
///
/// Local fastembed (no API key, English-leaning MiniLM) or any
/// OpenAI-compatible embeddings endpoint. Vectors are written by the
/// background [`pipeline`] and read by hybrid retrieval.

pub mod local;
pub mod openai;
pub mod pipeline;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle of a chunk's vector. Chunks start `pending`; `failed` chunks
/// are picked up again by backfill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStatus {
    Pending,
    Complete,
    Failed,
}

impl EmbeddingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingStatus::Pending => "pending",
            EmbeddingStatus::Complete => "complete",
            EmbeddingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EmbeddingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbeddingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EmbeddingStatus::Pending),
            "complete" => Ok(EmbeddingStatus::Complete),
            "failed" => Ok(EmbeddingStatus::Failed),
            other => Err(format!("Unknown embedding status: {}", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("Model initialization error: {0}")]
    ModelInit(String),

    #[error("Embedding generation error: {0}")]
    Generation(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Missing API key or unknown model
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    /// The provider returned a different number of vectors than texts
    #[error("Expected {expected} embeddings, got {got}")]
    CountMismatch { expected: usize, got: usize },
}

/// One chunk waiting for its vector.
#[derive(Debug, Clone)]
pub struct EmbeddingJob {
    pub chunk_id: String,
    /// Output of [`build_embedding_text`]
    pub text: String,
    /// Failed tries so far
    pub attempt: u8,
}

impl EmbeddingJob {
    pub fn for_chunk(chunk_id: &str, title: &str, content: &str) -> Self {
        EmbeddingJob {
            chunk_id: chunk_id.to_string(),
            text: build_embedding_text(title, content),
            attempt: 0,
        }
    }
}

/// Turns text into fixed-dimension vectors for knowledge retrieval.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed several texts in one call, in input order.
    ///
    /// Providers with a native batch API override this; the default embeds
    /// one text at a time.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    /// Stored next to each vector so a model switch re-embeds everything.
    fn model_name(&self) -> &str;

    fn dimension(&self) -> usize;
}

/// Text that gets embedded for a chunk: the title gives short chunks
/// (column lists, one-line rules) enough lexical anchor to be found.
pub fn build_embedding_text(title: &str, content: &str) -> String {
    let title = title.trim();
    if title.is_empty() {
        content.to_string()
    } else {
        format!("{}\n{}", title, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_status_round_trips_through_str() {
        for status in [EmbeddingStatus::Pending, EmbeddingStatus::Complete, EmbeddingStatus::Failed] {
            assert_eq!(status.to_string().parse::<EmbeddingStatus>().unwrap(), status);
        }
        assert!("stale".parse::<EmbeddingStatus>().is_err());
    }

    #[tokio::test]
    async fn test_default_embed_batch_keeps_order() {
        struct LengthEmbedder;

        #[async_trait]
        impl EmbeddingProvider for LengthEmbedder {
            async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
                Ok(vec![text.chars().count() as f32])
            }
            fn model_name(&self) -> &str {
                "length"
            }
            fn dimension(&self) -> usize {
                1
            }
        }

        let vectors = LengthEmbedder.embed_batch(&["a", "phòng", "rooms"]).await.unwrap();
        assert_eq!(vectors, vec![vec![1.0], vec![5.0], vec![5.0]]);
    }

    #[test]
    fn test_job_for_chunk_uses_title() {
        let job = EmbeddingJob::for_chunk("schema:rooms", "rooms", "id, price");
        assert_eq!(job.text, "rooms\nid, price");
        assert_eq!(job.attempt, 0);
    }

    #[test]
    fn test_build_embedding_text() {
        assert_eq!(build_embedding_text("rooms", "id, price"), "rooms\nid, price");
        assert_eq!(build_embedding_text("  ", "only content"), "only content");
    }
}
