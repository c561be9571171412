//! Corpus ingestion pipeline: extract → chunk → embed → store.
//!
//! The pipeline owns the knowledge-document status machine. A run flips the
//! document to `processing`, and either lands on `ready` with a freshly
//! replaced chunk set or on `failed` with a human-readable message — the
//! error is still returned so the scheduler's retry path observes it. A
//! retried run starts over from `processing`; chunk replacement is atomic,
//! so re-execution is safe.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};

use crate::chunker::Chunker;
use crate::corpus::{ChunkInsert, CorpusError, CorpusStore};
use crate::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::extract::{ExtractionError, extractor_for};
use crate::types::{DocStatus, KbDocumentId};

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    /// Source file unreadable or unsupported; terminal.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Extraction(#[from] ExtractionError),

    /// Non-empty extraction chunked to nothing; terminal.
    #[error("no text content could be extracted from the document")]
    #[diagnostic(code(draftsmith::ingest::no_chunks))]
    NoChunksProduced,

    /// Provider failure; retried with backoff.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Corpus(#[from] CorpusError),
}

impl IngestError {
    /// Whether the scheduler should retry this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::Embedding(_))
    }
}

/// Where the ingestion text comes from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum IngestSource {
    /// A file on disk, routed through [`crate::extract`] by extension.
    File { path: PathBuf },
    /// Text already extracted by an external collaborator.
    Text {
        text: String,
        page_or_row_count: Option<u32>,
    },
}

#[derive(Clone)]
pub struct IngestPipeline {
    corpus: Arc<CorpusStore>,
    embeddings: Arc<dyn EmbeddingProvider>,
    chunker: Chunker,
}

impl IngestPipeline {
    pub fn new(
        corpus: Arc<CorpusStore>,
        embeddings: Arc<dyn EmbeddingProvider>,
        chunker: Chunker,
    ) -> Self {
        Self {
            corpus,
            embeddings,
            chunker,
        }
    }

    /// Run ingestion for `document_id` from `source`.
    #[instrument(skip(self, source))]
    pub async fn ingest(
        &self,
        document_id: KbDocumentId,
        source: &IngestSource,
    ) -> Result<usize, IngestError> {
        self.corpus
            .set_status(document_id, DocStatus::Processing, None)
            .await?;

        let result = self.run(document_id, source).await;
        if let Err(e) = &result {
            // Record the failure on the document before propagating; a
            // transient retry will flip it back to processing.
            let message = e.to_string();
            self.corpus
                .set_status(document_id, DocStatus::Failed, Some(message))
                .await?;
        }
        result
    }

    async fn run(
        &self,
        document_id: KbDocumentId,
        source: &IngestSource,
    ) -> Result<usize, IngestError> {
        let (text, pages) = match source {
            IngestSource::File { path } => {
                let extraction = extract_file(path)?;
                (extraction.text, extraction.page_or_row_count)
            }
            IngestSource::Text {
                text,
                page_or_row_count,
            } => (text.clone(), *page_or_row_count),
        };

        if let Some(pages) = pages {
            self.corpus.set_pages(document_id, pages).await?;
        }

        let chunks = self.chunker.chunk(&text);
        if chunks.is_empty() {
            return Err(IngestError::NoChunksProduced);
        }

        let embeddings = self.embeddings.embed(&chunks).await?;
        let inserts: Vec<ChunkInsert> = chunks
            .iter()
            .zip(embeddings)
            .enumerate()
            .map(|(idx, (text, embedding))| ChunkInsert {
                ordinal: idx as u32,
                tokens: self.chunker.count_tokens(text) as u32,
                text: text.clone(),
                page_start: None,
                page_end: None,
                embedding,
            })
            .collect();
        let count = inserts.len();

        self.corpus.replace_chunks(document_id, inserts).await?;
        self.corpus
            .set_status(document_id, DocStatus::Ready, None)
            .await?;
        info!(document = %document_id, chunks = count, "ingestion complete");
        Ok(count)
    }
}

fn extract_file(path: &Path) -> Result<crate::extract::Extraction, ExtractionError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    extractor_for(extension)?.extract(path)
}
