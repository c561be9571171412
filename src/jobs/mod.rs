//! Asynchronous job model: ingestion, generation, publication, and export
//! all run as queued units of work with bounded retries.

pub mod scheduler;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ingestion::IngestSource;
use crate::types::{DocumentId, ExportId, JobId, KbDocumentId, SectionId};

pub use scheduler::{JobExecutor, SchedulerConfig, TaskScheduler};

/// The unit of work a job performs.
///
/// Every variant is safe to re-execute: ingestion replaces its chunk set
/// atomically, publication targets a pre-created corpus document, export
/// re-assembles deterministically, and generation appends to an append-only
/// chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum JobKind {
    IngestDocument {
        kb_document_id: KbDocumentId,
        source: IngestSource,
    },
    GenerateSection {
        section_id: SectionId,
        instruction: Option<String>,
    },
    GenerateDocument {
        document_id: DocumentId,
        instruction: Option<String>,
    },
    ExportDocument {
        export_id: ExportId,
    },
    /// Ingest a finalized document back into the knowledge corpus.
    PublishToCorpus {
        document_id: DocumentId,
        kb_document_id: KbDocumentId,
    },
}

impl JobKind {
    /// Short label for logs and job listings.
    pub fn label(&self) -> &'static str {
        match self {
            JobKind::IngestDocument { .. } => "ingest_document",
            JobKind::GenerateSection { .. } => "generate_section",
            JobKind::GenerateDocument { .. } => "generate_document",
            JobKind::ExportDocument { .. } => "export_document",
            JobKind::PublishToCorpus { .. } => "publish_to_corpus",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Scheduler-facing failure classification.
#[derive(Debug, Error, Diagnostic)]
pub enum JobError {
    /// Retried with exponential backoff up to the configured maximum.
    #[error("{0}")]
    #[diagnostic(code(draftsmith::jobs::transient))]
    Transient(String),

    /// Fails the job immediately; no retry.
    #[error("{0}")]
    #[diagnostic(code(draftsmith::jobs::terminal))]
    Terminal(String),
}

/// A job record as tracked by the scheduler.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
