/// Knowledge base for retrieval-augmented SQL generation
///
/// Holds three kinds of chunks: table schemas, business rules written by
/// operators, and curated question/SQL examples. Chunks are embedded by the
/// background pipeline and retrieved by hybrid full-text + vector search.

pub mod fusion;
pub mod ingest;
pub mod postgres;
pub mod schema_sync;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::embedding::EmbeddingStatus;
use crate::errors::RentqlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    /// One table: columns, types, relationships
    Schema,
    /// Domain rules ("a room is vacant when it has no active contract")
    Business,
    /// A question paired with the SQL that answers it
    Qa,
}

impl ChunkKind {
    pub const ALL: [ChunkKind; 3] = [ChunkKind::Schema, ChunkKind::Business, ChunkKind::Qa];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Schema => "schema",
            ChunkKind::Business => "business",
            ChunkKind::Qa => "qa",
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schema" => Ok(ChunkKind::Schema),
            "business" => Ok(ChunkKind::Business),
            "qa" => Ok(ChunkKind::Qa),
            other => Err(format!("Unknown chunk kind: {}", other)),
        }
    }
}

/// A stored knowledge chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: String,
    pub kind: ChunkKind,
    pub title: String,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub embedding_status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for inserting or replacing a chunk.
///
/// With `id: None` the store generates one; with a stable id (e.g.
/// `schema:rooms`) an existing chunk is replaced and re-queued for embedding
/// only when its text changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChunk {
    #[serde(default)]
    pub id: Option<String>,
    pub kind: ChunkKind,
    #[serde(default)]
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// A search hit with its fused relevance score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: KnowledgeChunk,
    /// Reciprocal Rank Fusion score
    pub score: f64,
    /// "hybrid", "text_only" or "vector_only"
    pub match_source: String,
}

/// Parameters for one per-kind search.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub kind: ChunkKind,
    pub text: String,
    /// Query embedding; the vector leg is skipped when absent
    pub embedding: Option<Vec<f32>>,
    pub limit: i64,
    pub min_similarity: f64,
    pub rrf_k: f64,
}

/// Persistence and retrieval for knowledge chunks.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Insert a chunk, or replace the chunk with the same id.
    async fn upsert(&self, input: NewChunk) -> Result<KnowledgeChunk, RentqlError>;

    async fn get(&self, id: &str) -> Result<KnowledgeChunk, RentqlError>;

    async fn delete(&self, id: &str) -> Result<(), RentqlError>;

    /// Hybrid search within one chunk kind, best first.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredChunk>, RentqlError>;

    /// Chunks whose embedding is pending or failed: pending first, then
    /// oldest first.
    async fn pending(&self, limit: i64) -> Result<Vec<KnowledgeChunk>, RentqlError>;

    /// Store a new current embedding for a chunk and mark it complete.
    async fn store_embedding(
        &self,
        chunk_id: &str,
        model_name: &str,
        embedding: Vec<f32>,
    ) -> Result<(), RentqlError>;

    async fn set_embedding_status(
        &self,
        chunk_id: &str,
        status: EmbeddingStatus,
    ) -> Result<(), RentqlError>;

    /// Counts by kind and embedding status, plus embeddings per model.
    async fn stats(&self) -> Result<serde_json::Value, RentqlError>;
}
