/// Offline embeddings with fastembed (all-MiniLM-L6-v2, 384 dimensions)
///
/// Weights are downloaded once into `embedding.cache_dir`. fastembed is
/// synchronous, so inference runs on the blocking pool.

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::task;

use super::{EmbeddingError, EmbeddingProvider};

const MODEL_NAME: &str = "all-MiniLM-L6-v2";
const MODEL_DIMENSION: usize = 384;

pub struct LocalEmbeddingProvider {
    model: Arc<Mutex<TextEmbedding>>,
}

impl LocalEmbeddingProvider {
    pub async fn new(cache_dir: &str) -> Result<Self, EmbeddingError> {
        let cache_path = PathBuf::from(cache_dir);
        tracing::info!(cache_dir = %cache_path.display(), model = MODEL_NAME, "Loading local embedding model");

        let model = task::spawn_blocking(move || {
            std::fs::create_dir_all(&cache_path)
                .map_err(|e| EmbeddingError::ModelInit(format!("Failed to create cache dir: {}", e)))?;
            TextEmbedding::try_new(
                InitOptions::new(EmbeddingModel::AllMiniLML6V2)
                    .with_cache_dir(cache_path)
                    .with_show_download_progress(false),
            )
            .map_err(|e| EmbeddingError::ModelInit(e.to_string()))
        })
        .await
        .map_err(|e| EmbeddingError::ModelInit(e.to_string()))??;

        Ok(LocalEmbeddingProvider {
            model: Arc::new(Mutex::new(model)),
        })
    }

    async fn run(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let model = Arc::clone(&self.model);
        let expected = texts.len();

        let vectors = task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| EmbeddingError::Generation("Embedding model lock poisoned".to_string()))?;
            model
                .embed(texts, None)
                .map_err(|e| EmbeddingError::Generation(e.to_string()))
        })
        .await
        .map_err(|e| EmbeddingError::Generation(e.to_string()))??;

        if vectors.len() != expected {
            return Err(EmbeddingError::CountMismatch { expected, got: vectors.len() });
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.run(vec![text.to_string()])
            .await?
            .pop()
            .ok_or(EmbeddingError::CountMismatch { expected: 1, got: 0 })
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.run(texts.iter().map(|t| t.to_string()).collect()).await
    }

    fn model_name(&self) -> &str {
        MODEL_NAME
    }

    fn dimension(&self) -> usize {
        MODEL_DIMENSION
    }
}
