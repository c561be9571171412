//! Authored documents, sections, version chains, and section locks.
//!
//! A section's editable content is a pointer (`current_version_id`) over an
//! append-only arena of versions ordered by a per-section `seq`. Editing
//! appends a version at the end of the chain and repoints `current`; undo
//! only moves the pointer one position backward in creation order — history
//! is never rewritten or deleted.
//!
//! Locks are soft leases: a row with an owner and an optional expiry. An
//! expired lock counts as released even while the row still exists. The
//! store does not gate writes on the lock; callers that must not clobber
//! each other (interactive edits, generation jobs) acquire it first.

pub mod store;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DocumentId, DraftStatus, ExportId, ExportStatus, SectionId, VersionId};

pub use store::SectionStore;

#[derive(Debug, Error, Diagnostic)]
pub enum SectionError {
    #[error("section {0} not found")]
    #[diagnostic(code(draftsmith::sections::not_found))]
    NotFound(SectionId),

    #[error("document {0} not found")]
    #[diagnostic(code(draftsmith::sections::document_not_found))]
    DocumentNotFound(DocumentId),

    #[error("no previous version to revert to")]
    #[diagnostic(
        code(draftsmith::sections::no_previous_version),
        help("Undo needs at least two versions and a pointer not already at the chain head.")
    )]
    NoPreviousVersion,

    #[error("section is being edited by {owner}")]
    #[diagnostic(code(draftsmith::sections::lock_conflict))]
    LockConflict { owner: String },

    #[error("authoring storage error: {0}")]
    #[diagnostic(code(draftsmith::sections::storage))]
    Storage(String),
}

impl From<sqlx::Error> for SectionError {
    fn from(e: sqlx::Error) -> Self {
        SectionError::Storage(e.to_string())
    }
}

/// The authored artifact: an ordered collection of sections.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub org_id: Option<String>,
    pub template_key: Option<String>,
    pub title: String,
    pub status: DraftStatus,
    /// `None` until the outcome is known; `Some(true)` = accepted/funded.
    pub success: Option<bool>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when creating a document.
#[derive(Clone, Debug, Default)]
pub struct NewDocument {
    pub org_id: Option<String>,
    pub template_key: Option<String>,
    pub title: String,
}

/// A named, ordered subdivision of a document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Section {
    pub id: SectionId,
    pub document_id: DocumentId,
    /// Unique key within the document (e.g. `"background"`).
    pub key: String,
    pub title: String,
    pub order_index: u32,
    pub current_version_id: Option<VersionId>,
}

/// One immutable content snapshot in a section's chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SectionVersion {
    pub id: VersionId,
    pub section_id: SectionId,
    /// Position in creation order, 1-based and contiguous per section.
    pub seq: i64,
    pub content: String,
    pub diff: Option<String>,
    pub author: Option<String>,
    pub ai_generated: bool,
    pub metadata: serde_json::Value,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Inputs for appending a version.
#[derive(Clone, Debug, Default)]
pub struct NewSectionVersion {
    pub content: String,
    pub diff: Option<String>,
    pub author: Option<String>,
    pub ai_generated: bool,
    pub metadata: serde_json::Value,
    pub summary: Option<String>,
}

impl NewSectionVersion {
    pub fn human(content: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            author: Some(author.into()),
            ..Default::default()
        }
    }

    pub fn generated(content: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            author: Some(author.into()),
            ai_generated: true,
            ..Default::default()
        }
    }
}

/// A soft mutual-exclusion lease on a section.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SectionLock {
    pub section_id: SectionId,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    /// `None` means the lease never expires on its own.
    pub expires_at: Option<DateTime<Utc>>,
}

impl SectionLock {
    /// A lease past its expiry is treated as released even if the row is
    /// still present.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| now > t)
    }
}

/// Supported export targets; rendering is delegated to external exporters,
/// the job here assembles the content they consume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Docx,
    Pdf,
    Excel,
}

impl ExportFormat {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            ExportFormat::Docx => "docx",
            ExportFormat::Pdf => "pdf",
            ExportFormat::Excel => "excel",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Self {
        match s {
            "pdf" => ExportFormat::Pdf,
            "excel" => ExportFormat::Excel,
            _ => ExportFormat::Docx,
        }
    }
}

/// An export request and its assembled artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentExport {
    pub id: ExportId,
    pub document_id: DocumentId,
    pub format: ExportFormat,
    pub status: ExportStatus,
    pub error: Option<String>,
    /// Assembled document text (sections in order plus citation appendix).
    pub artifact: Option<String>,
    pub created_at: DateTime<Utc>,
}
