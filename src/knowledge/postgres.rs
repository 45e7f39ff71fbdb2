/// PostgreSQL-backed implementation of KnowledgeStore
///
/// Full-text leg on the generated `search_tsv` column, vector leg on pgvector
/// cosine distance, fused with RRF in Rust.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{
    postgres::{PgPool, PgRow},
    Row,
};
use std::collections::HashMap;
use uuid::Uuid;

use super::fusion::{build_or_tsquery, rrf_fuse};
use super::{ChunkKind, KnowledgeChunk, KnowledgeStore, NewChunk, ScoredChunk, SearchQuery};
use crate::embedding::EmbeddingStatus;
use crate::errors::RentqlError;

const CHUNK_COLUMNS: &str =
    "id, kind, title, content, metadata, embedding_status, created_at, updated_at";

pub struct PostgresKnowledgeStore {
    pool: PgPool,
}

impl PostgresKnowledgeStore {
    pub fn new(pool: PgPool) -> Self {
        PostgresKnowledgeStore { pool }
    }

    async fn text_leg(&self, query: &SearchQuery) -> Result<Vec<String>, RentqlError> {
        let Some(tsquery) = build_or_tsquery(&query.text) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            "SELECT id FROM knowledge_chunks \
             WHERE kind = $1 AND search_tsv @@ to_tsquery('simple', $2) \
             ORDER BY ts_rank_cd(search_tsv, to_tsquery('simple', $2)) DESC, id ASC \
             LIMIT $3",
        )
        .bind(query.kind.as_str())
        .bind(&tsquery)
        .bind(query.limit * 2)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RentqlError::Storage(format!("Full-text search failed: {}", e)))?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("id").map_err(|e| RentqlError::Storage(e.to_string())))
            .collect()
    }

    async fn vector_leg(&self, query: &SearchQuery) -> Result<Vec<String>, RentqlError> {
        let Some(ref embedding) = query.embedding else {
            return Ok(Vec::new());
        };
        let dimension = embedding.len() as i32;
        let vector = pgvector::Vector::from(embedding.clone());

        // Embeddings from another model/dimension are skipped: pgvector cannot
        // compare vectors of different sizes.
        let rows = sqlx::query(
            "SELECT ce.chunk_id, (1 - (ce.embedding <=> $1))::float8 AS similarity \
             FROM chunk_embeddings ce \
             JOIN knowledge_chunks kc ON kc.id = ce.chunk_id \
             WHERE ce.is_current = TRUE AND ce.dimension = $2 AND kc.kind = $3 \
             ORDER BY ce.embedding <=> $1 ASC \
             LIMIT $4",
        )
        .bind(&vector)
        .bind(dimension)
        .bind(query.kind.as_str())
        .bind(query.limit * 2)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RentqlError::Storage(format!("Vector search failed: {}", e)))?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let similarity: f64 = row
                .try_get("similarity")
                .map_err(|e| RentqlError::Storage(e.to_string()))?;
            if similarity < query.min_similarity {
                continue;
            }
            ids.push(
                row.try_get::<String, _>("chunk_id")
                    .map_err(|e| RentqlError::Storage(e.to_string()))?,
            );
        }
        Ok(ids)
    }

    async fn fetch_many(&self, ids: &[String]) -> Result<HashMap<String, KnowledgeChunk>, RentqlError> {
        let sql = format!("SELECT {} FROM knowledge_chunks WHERE id = ANY($1)", CHUNK_COLUMNS);
        let rows = sqlx::query(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RentqlError::Storage(e.to_string()))?;

        let mut by_id = HashMap::with_capacity(rows.len());
        for row in &rows {
            let chunk = row_to_chunk(row)?;
            by_id.insert(chunk.id.clone(), chunk);
        }
        Ok(by_id)
    }
}

fn row_to_chunk(row: &PgRow) -> Result<KnowledgeChunk, RentqlError> {
    let kind: String = row.try_get("kind").map_err(|e| RentqlError::Storage(e.to_string()))?;
    Ok(KnowledgeChunk {
        id: row.try_get("id").map_err(|e| RentqlError::Storage(e.to_string()))?,
        kind: kind.parse::<ChunkKind>().map_err(RentqlError::Storage)?,
        title: row.try_get("title").map_err(|e| RentqlError::Storage(e.to_string()))?,
        content: row.try_get("content").map_err(|e| RentqlError::Storage(e.to_string()))?,
        metadata: row.try_get("metadata").map_err(|e| RentqlError::Storage(e.to_string()))?,
        embedding_status: row.try_get("embedding_status").map_err(|e| RentqlError::Storage(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(|e| RentqlError::Storage(e.to_string()))?,
        updated_at: row.try_get("updated_at").map_err(|e| RentqlError::Storage(e.to_string()))?,
    })
}

#[async_trait]
impl KnowledgeStore for PostgresKnowledgeStore {
    async fn upsert(&self, input: NewChunk) -> Result<KnowledgeChunk, RentqlError> {
        if input.content.trim().is_empty() {
            return Err(RentqlError::validation("content", "Chunk content cannot be empty"));
        }

        let id = input.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();

        // Text changes send the chunk back through the embedding pipeline;
        // metadata-only changes keep the existing embedding.
        let sql = format!(
            "INSERT INTO knowledge_chunks (id, kind, title, content, metadata, embedding_status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, 'pending', $6, $6) \
             ON CONFLICT (id) DO UPDATE SET \
                kind = EXCLUDED.kind, \
                title = EXCLUDED.title, \
                content = EXCLUDED.content, \
                metadata = EXCLUDED.metadata, \
                embedding_status = CASE \
                    WHEN knowledge_chunks.title IS DISTINCT FROM EXCLUDED.title \
                      OR knowledge_chunks.content IS DISTINCT FROM EXCLUDED.content \
                    THEN 'pending' ELSE knowledge_chunks.embedding_status END, \
                updated_at = EXCLUDED.updated_at \
             RETURNING {}",
            CHUNK_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(&id)
            .bind(input.kind.as_str())
            .bind(&input.title)
            .bind(&input.content)
            .bind(&input.metadata)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RentqlError::Storage(format!("Failed to upsert chunk: {}", e)))?;

        row_to_chunk(&row)
    }

    async fn get(&self, id: &str) -> Result<KnowledgeChunk, RentqlError> {
        let sql = format!("SELECT {} FROM knowledge_chunks WHERE id = $1", CHUNK_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RentqlError::Storage(e.to_string()))?
            .ok_or_else(|| RentqlError::NotFound { id: id.to_string() })?;

        row_to_chunk(&row)
    }

    async fn delete(&self, id: &str) -> Result<(), RentqlError> {
        let result = sqlx::query("DELETE FROM knowledge_chunks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RentqlError::Storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RentqlError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredChunk>, RentqlError> {
        if query.limit <= 0 {
            return Ok(Vec::new());
        }

        let (text_ids, vector_ids) = tokio::try_join!(self.text_leg(query), self.vector_leg(query))?;
        let fused = rrf_fuse(&text_ids, &vector_ids, query.rrf_k);

        let top: Vec<_> = fused.into_iter().take(query.limit as usize).collect();
        if top.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = top.iter().map(|h| h.id.clone()).collect();
        let mut chunks = self.fetch_many(&ids).await?;

        Ok(top
            .into_iter()
            .filter_map(|hit| {
                chunks.remove(&hit.id).map(|chunk| ScoredChunk {
                    chunk,
                    score: hit.score,
                    match_source: hit.match_source,
                })
            })
            .collect())
    }

    async fn pending(&self, limit: i64) -> Result<Vec<KnowledgeChunk>, RentqlError> {
        let sql = format!(
            "SELECT {} FROM knowledge_chunks WHERE embedding_status IN ('pending', 'failed') \
             ORDER BY embedding_status = 'failed' ASC, created_at ASC, id ASC LIMIT $1",
            CHUNK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RentqlError::Storage(e.to_string()))?;

        rows.iter().map(row_to_chunk).collect()
    }

    async fn store_embedding(
        &self,
        chunk_id: &str,
        model_name: &str,
        embedding: Vec<f32>,
    ) -> Result<(), RentqlError> {
        let now = Utc::now();
        let dimension = embedding.len() as i32;
        let vector = pgvector::Vector::from(embedding);

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE chunk_embeddings SET is_current = FALSE, updated_at = $2 \
             WHERE chunk_id = $1 AND is_current = TRUE",
        )
        .bind(chunk_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| RentqlError::Storage(format!("Failed to retire old embedding: {}", e)))?;

        sqlx::query(
            "INSERT INTO chunk_embeddings \
             (id, chunk_id, model_name, dimension, embedding, is_current, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, TRUE, $6, $6)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(chunk_id)
        .bind(model_name)
        .bind(dimension)
        .bind(&vector)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| RentqlError::Storage(format!("Failed to insert embedding: {}", e)))?;

        sqlx::query("UPDATE knowledge_chunks SET embedding_status = 'complete' WHERE id = $1")
            .bind(chunk_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| RentqlError::Storage(format!("Failed to update embedding status: {}", e)))?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_embedding_status(
        &self,
        chunk_id: &str,
        status: EmbeddingStatus,
    ) -> Result<(), RentqlError> {
        sqlx::query("UPDATE knowledge_chunks SET embedding_status = $1 WHERE id = $2")
            .bind(status.to_string())
            .bind(chunk_id)
            .execute(&self.pool)
            .await
            .map_err(|e| RentqlError::Storage(format!("Failed to update embedding status: {}", e)))?;

        Ok(())
    }

    async fn stats(&self) -> Result<serde_json::Value, RentqlError> {
        let status_rows = sqlx::query(
            "SELECT kind, embedding_status, COUNT(*) AS count FROM knowledge_chunks \
             GROUP BY kind, embedding_status ORDER BY kind, embedding_status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RentqlError::Storage(e.to_string()))?;

        let mut by_kind = serde_json::Map::new();
        for row in &status_rows {
            let kind: String = row.try_get("kind").map_err(|e| RentqlError::Storage(e.to_string()))?;
            let status: String = row
                .try_get("embedding_status")
                .map_err(|e| RentqlError::Storage(e.to_string()))?;
            let count: i64 = row.try_get("count").map_err(|e| RentqlError::Storage(e.to_string()))?;
            let entry = by_kind
                .entry(kind)
                .or_insert_with(|| serde_json::json!({}));
            entry[status] = serde_json::json!(count);
        }

        let model_rows = sqlx::query(
            "SELECT model_name, dimension, COUNT(*) AS count FROM chunk_embeddings \
             WHERE is_current = TRUE GROUP BY model_name, dimension",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RentqlError::Storage(e.to_string()))?;

        let mut by_model: Vec<serde_json::Value> = Vec::new();
        for row in &model_rows {
            let model_name: String = row
                .try_get("model_name")
                .map_err(|e| RentqlError::Storage(e.to_string()))?;
            let dimension: i32 = row.try_get("dimension").map_err(|e| RentqlError::Storage(e.to_string()))?;
            let count: i64 = row.try_get("count").map_err(|e| RentqlError::Storage(e.to_string()))?;
            by_model.push(serde_json::json!({
                "model_name": model_name,
                "dimension": dimension,
                "count": count,
            }));
        }

        Ok(serde_json::json!({
            "by_kind": by_kind,
            "by_model": by_model,
        }))
    }
}
