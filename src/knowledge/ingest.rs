/// Knowledge file ingestion
///
/// Operators maintain business rules and example questions in a TOML file:
///
/// ```toml
/// [[chunks]]
/// kind = "business"
/// title = "Phòng trống"
/// content = "Một phòng được coi là trống khi không có hợp đồng nào ở trạng thái ACTIVE."
///
/// [[chunks]]
/// id = "qa:revenue-by-month"
/// kind = "qa"
/// title = "Doanh thu theo tháng"
/// content = "Q: Doanh thu tháng này?\nSQL: SELECT SUM(amount) FROM payments WHERE ..."
/// ```

use figment::{
    Figment,
    providers::{Format, Toml},
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::path::Path;

use super::{KnowledgeStore, NewChunk};
use crate::embedding::pipeline::EmbeddingPipeline;
use crate::errors::RentqlError;

#[derive(Debug, Deserialize)]
struct KnowledgeFile {
    #[serde(default)]
    chunks: Vec<NewChunk>,
}

/// Outcome of an ingestion run.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct IngestReport {
    pub upserted: usize,
    pub queued_for_embedding: usize,
    pub skipped: usize,
}

/// Parse a knowledge TOML file into chunk inputs.
pub fn load_knowledge_file(path: &Path) -> Result<Vec<NewChunk>, RentqlError> {
    if !path.is_file() {
        return Err(RentqlError::validation(
            "path",
            &format!("Knowledge file not found: {}", path.display()),
        ));
    }

    let file: KnowledgeFile = Figment::from(Toml::file(path))
        .extract()
        .map_err(|e| RentqlError::Validation {
            message: format!("Invalid knowledge file {}: {}", path.display(), e),
            field: Some("chunks".to_string()),
        })?;

    Ok(file.chunks)
}

/// Upsert chunks and queue changed ones for embedding.
///
/// Empty chunks are skipped with a warning rather than failing the batch.
pub async fn ingest_chunks(
    store: &dyn KnowledgeStore,
    pipeline: Option<&EmbeddingPipeline>,
    chunks: Vec<NewChunk>,
    show_progress: bool,
) -> Result<IngestReport, RentqlError> {
    let pb = if show_progress {
        let pb = ProgressBar::new(chunks.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{pos}/{len}] {msg} [{elapsed_precise}]")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut report = IngestReport::default();

    for chunk in chunks {
        pb.set_message(chunk.title.clone());

        if chunk.content.trim().is_empty() {
            tracing::warn!(title = %chunk.title, "Skipping knowledge chunk with empty content");
            report.skipped += 1;
            pb.inc(1);
            continue;
        }

        let stored = store.upsert(chunk).await?;
        report.upserted += 1;

        if let Some(pipeline) = pipeline {
            if stored.embedding_status != "complete" {
                pipeline.enqueue_chunk(&stored);
                report.queued_for_embedding += 1;
            }
        }
        pb.inc(1);
    }

    pb.finish_and_clear();

    tracing::info!(
        upserted = report.upserted,
        queued = report.queued_for_embedding,
        skipped = report.skipped,
        "Knowledge ingestion finished"
    );

    Ok(report)
}
