//! Knowledge corpus: uploaded source documents and their embedded chunks.
//!
//! A [`KnowledgeDocument`] is created when a file is uploaded and mutated
//! only by the ingestion pipeline; it is soft-deactivated rather than
//! deleted while chunks reference it. Chunks carry contiguous ordinals from
//! zero and are immutable once written — reprocessing swaps the whole chunk
//! set atomically (see [`store::CorpusStore::replace_chunks`]).

pub mod store;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ChunkId, DocStatus, KbDocumentId};

pub use store::{CorpusStore, SearchScope};

#[derive(Debug, Error, Diagnostic)]
pub enum CorpusError {
    #[error("corpus storage error: {0}")]
    #[diagnostic(code(draftsmith::corpus::storage))]
    Storage(String),

    #[error("knowledge document {0} not found")]
    #[diagnostic(code(draftsmith::corpus::not_found))]
    NotFound(KbDocumentId),
}

/// Uploaded source material, owner of a chunk set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub id: KbDocumentId,
    pub org_id: Option<String>,
    pub title: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: Option<u64>,
    pub status: DocStatus,
    pub error_message: Option<String>,
    /// Pages for paginated sources, rows for tabular ones.
    pub pages: Option<u32>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Fields supplied at upload time.
#[derive(Clone, Debug, Default)]
pub struct NewKnowledgeDocument {
    pub org_id: Option<String>,
    pub title: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: Option<u64>,
}

/// One chunk ready for persistence, embedding included.
#[derive(Clone, Debug)]
pub struct ChunkInsert {
    pub ordinal: u32,
    pub text: String,
    pub tokens: u32,
    pub page_start: Option<i32>,
    pub page_end: Option<i32>,
    pub embedding: Vec<f32>,
}

/// A stored chunk as read back from the corpus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredChunk {
    pub id: ChunkId,
    pub document_id: KbDocumentId,
    pub ordinal: u32,
    pub text: String,
    pub tokens: u32,
    pub page_start: Option<i32>,
    pub page_end: Option<i32>,
}

/// A similarity-search hit, cosine distance ascending (lower = closer).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: ChunkId,
    pub document_id: KbDocumentId,
    pub document_title: String,
    pub ordinal: u32,
    pub text: String,
    pub distance: f32,
}
