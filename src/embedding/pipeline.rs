/// Background embedding of knowledge chunks
///
/// Chunks are queued on a bounded channel and embedded by one worker task in
/// batches. A failed batch is retried with exponential backoff (1s, 2s, 4s);
/// after that its chunks are marked failed and left for backfill.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{EmbeddingError, EmbeddingJob, EmbeddingProvider, EmbeddingStatus};
use crate::knowledge::{KnowledgeChunk, KnowledgeStore};

/// Jobs embedded per provider call.
const BATCH_SIZE: usize = 16;
const MAX_RETRIES: u8 = 3;
/// Chunks read from the store per backfill round.
const BACKFILL_PAGE: i64 = 100;

pub struct EmbeddingPipeline {
    sender: mpsc::Sender<EmbeddingJob>,
    /// Jobs enqueued but not yet finished; flush() waits for zero.
    pending_count: Arc<AtomicUsize>,
}

struct Worker {
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn KnowledgeStore>,
    retry_tx: mpsc::Sender<EmbeddingJob>,
    pending_count: Arc<AtomicUsize>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<EmbeddingJob>) {
        let mut batch = Vec::with_capacity(BATCH_SIZE);
        while rx.recv_many(&mut batch, BATCH_SIZE).await > 0 {
            let jobs = std::mem::take(&mut batch);
            self.process(jobs).await;
        }
    }

    async fn process(&self, jobs: Vec<EmbeddingJob>) {
        let texts: Vec<&str> = jobs.iter().map(|j| j.text.as_str()).collect();
        let result = match self.provider.embed_batch(&texts).await {
            Ok(vectors) if vectors.len() != jobs.len() => Err(EmbeddingError::CountMismatch {
                expected: jobs.len(),
                got: vectors.len(),
            }),
            other => other,
        };

        match result {
            Ok(vectors) => {
                for (job, vector) in jobs.iter().zip(vectors) {
                    self.save(job, vector).await;
                }
                tracing::debug!(count = jobs.len(), model = self.provider.model_name(), "Embedded batch");
            }
            Err(e) => self.retry_or_fail(jobs, &e).await,
        }
    }

    async fn save(&self, job: &EmbeddingJob, vector: Vec<f32>) {
        if let Err(e) = self
            .store
            .store_embedding(&job.chunk_id, self.provider.model_name(), vector)
            .await
        {
            // Storage errors are not retried
            tracing::error!(chunk_id = %job.chunk_id, error = %e, "Failed to store embedding");
            let _ = self.store.set_embedding_status(&job.chunk_id, EmbeddingStatus::Failed).await;
        }
        self.pending_count.fetch_sub(1, Ordering::Relaxed);
    }

    async fn retry_or_fail(&self, jobs: Vec<EmbeddingJob>, error: &EmbeddingError) {
        let (retry, exhausted): (Vec<_>, Vec<_>) = jobs.into_iter().partition(|j| j.attempt < MAX_RETRIES);

        for job in exhausted {
            tracing::error!(
                chunk_id = %job.chunk_id,
                attempts = MAX_RETRIES,
                error = %error,
                "Embedding failed after retries, marking as failed"
            );
            let _ = self.store.set_embedding_status(&job.chunk_id, EmbeddingStatus::Failed).await;
            self.pending_count.fetch_sub(1, Ordering::Relaxed);
        }

        let Some(attempt) = retry.iter().map(|j| j.attempt).min() else {
            return;
        };
        tracing::warn!(count = retry.len(), attempt = attempt + 1, error = %error, "Embedding batch failed, retrying");
        tokio::time::sleep(Duration::from_secs(2u64.pow(attempt as u32))).await;

        for job in retry {
            let next = EmbeddingJob { attempt: job.attempt + 1, ..job };
            if self.retry_tx.try_send(next).is_err() {
                // Still pending in the store; backfill picks it up
                self.pending_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }
}

impl EmbeddingPipeline {
    /// Spawn the worker. `capacity` bounds the queue (1000 in practice).
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn KnowledgeStore>,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<EmbeddingJob>(capacity);
        let pending_count = Arc::new(AtomicUsize::new(0));

        let worker = Worker {
            provider,
            store,
            retry_tx: tx.clone(),
            pending_count: Arc::clone(&pending_count),
        };
        tokio::spawn(worker.run(rx));

        EmbeddingPipeline { sender: tx, pending_count }
    }

    /// Queue a job without waiting. A full queue drops the job; the chunk
    /// stays pending for backfill.
    pub fn enqueue(&self, job: EmbeddingJob) {
        self.pending_count.fetch_add(1, Ordering::Relaxed);
        if self.sender.try_send(job).is_err() {
            self.pending_count.fetch_sub(1, Ordering::Relaxed);
            tracing::warn!("Embedding queue full, chunk stored, embedding deferred to backfill");
        }
    }

    /// Queue a chunk unless its embedding is already complete.
    pub fn enqueue_chunk(&self, chunk: &KnowledgeChunk) {
        if chunk.embedding_status == EmbeddingStatus::Complete.as_str() {
            return;
        }
        self.enqueue(EmbeddingJob::for_chunk(&chunk.id, &chunk.title, &chunk.content));
    }

    /// Wait until every queued job has succeeded or failed.
    pub async fn flush(&self) {
        loop {
            let pending = self.pending_count.load(Ordering::Relaxed);
            if pending == 0 {
                break;
            }
            tracing::debug!(pending, "Waiting for embedding pipeline to flush");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Re-embed every pending or failed chunk. Returns how many were queued.
///
/// The pipeline is flushed after each page so the same pending chunks are
/// not read twice.
pub async fn backfill(store: &dyn KnowledgeStore, pipeline: &EmbeddingPipeline) -> u64 {
    let mut total_queued: u64 = 0;

    loop {
        let page = match store.pending(BACKFILL_PAGE).await {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch pending chunks for backfill");
                break;
            }
        };
        if page.is_empty() {
            break;
        }

        let page_len = page.len() as u64;
        let any_pending = page
            .iter()
            .any(|c| c.embedding_status == EmbeddingStatus::Pending.as_str());
        for chunk in &page {
            pipeline.enqueue(EmbeddingJob::for_chunk(&chunk.id, &chunk.title, &chunk.content));
        }
        total_queued += page_len;
        pipeline.flush().await;

        // Failed chunks stay failed after their retries; stop instead of looping on them
        if page_len < BACKFILL_PAGE as u64 || !any_pending {
            break;
        }
    }

    if total_queued > 0 {
        tracing::info!(count = total_queued, "Queued chunks for embedding backfill");
    }
    total_queued
}
