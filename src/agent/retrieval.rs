/// Knowledge retrieval for one question
///
/// Embeds the question once and runs the three per-kind searches
/// concurrently. If embedding fails the searches fall back to full text.

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingProvider;
use crate::errors::RentqlError;
use crate::knowledge::{ChunkKind, KnowledgeStore, ScoredChunk, SearchQuery};

#[derive(Debug, Clone, Default)]
pub struct RetrievedKnowledge {
    pub schema: Vec<ScoredChunk>,
    pub business: Vec<ScoredChunk>,
    pub qa: Vec<ScoredChunk>,
}

impl RetrievedKnowledge {
    pub fn chunk_ids(&self) -> Vec<String> {
        self.schema
            .iter()
            .chain(&self.business)
            .chain(&self.qa)
            .map(|hit| hit.chunk.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.schema.len() + self.business.len() + self.qa.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub async fn retrieve(
    store: &dyn KnowledgeStore,
    embedder: Option<&dyn EmbeddingProvider>,
    question: &str,
    config: &RetrievalConfig,
) -> Result<RetrievedKnowledge, RentqlError> {
    let embedding = match embedder {
        Some(provider) => match provider.embed(question).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                tracing::warn!(error = %e, "Question embedding failed, searching full text only");
                None
            }
        },
        None => None,
    };

    let query = |kind: ChunkKind, limit: i64| SearchQuery {
        kind,
        text: question.to_string(),
        embedding: embedding.clone(),
        limit,
        min_similarity: config.min_similarity,
        rrf_k: config.rrf_k,
    };
    let schema_q = query(ChunkKind::Schema, config.schema_top_k);
    let business_q = query(ChunkKind::Business, config.business_top_k);
    let qa_q = query(ChunkKind::Qa, config.qa_top_k);

    let (schema, business, qa) = tokio::try_join!(
        store.search(&schema_q),
        store.search(&business_q),
        store.search(&qa_q),
    )?;

    Ok(RetrievedKnowledge { schema, business, qa })
}
