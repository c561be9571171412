//! Core identifier and status types shared across the pipeline.
//!
//! Ids are UUID-backed newtypes so a section id can never be passed where a
//! corpus document id is expected. Status enums carry an
//! [`encode`](DocStatus::encode)/[`decode`](DocStatus::decode) pair because
//! they are persisted as plain text columns; decoding is total and falls back
//! to the failure state for unknown strings rather than erroring, so a schema
//! ahead of the binary degrades loudly but safely.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(
    /// A knowledge-corpus document (uploaded source material).
    KbDocumentId
);
id_type!(
    /// A single embedded chunk within a corpus document.
    ChunkId
);
id_type!(
    /// An authored document (the artifact being drafted).
    DocumentId
);
id_type!(
    /// A section within an authored document.
    SectionId
);
id_type!(
    /// One immutable snapshot in a section's version chain.
    VersionId
);
id_type!(
    /// A persisted citation row.
    CitationId
);
id_type!(
    /// An export request.
    ExportId
);
id_type!(
    /// A scheduled unit of work.
    JobId
);

/// Lifecycle of a corpus document as it moves through ingestion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocStatus {
    Uploaded,
    Processing,
    Ready,
    Failed,
}

impl DocStatus {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            DocStatus::Uploaded => "uploaded",
            DocStatus::Processing => "processing",
            DocStatus::Ready => "ready",
            DocStatus::Failed => "failed",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Self {
        match s {
            "uploaded" => DocStatus::Uploaded,
            "processing" => DocStatus::Processing,
            "ready" => DocStatus::Ready,
            _ => DocStatus::Failed,
        }
    }
}

impl fmt::Display for DocStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode())
    }
}

/// Review lifecycle of an authored document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Draft,
    InReview,
    Approved,
    Final,
}

impl DraftStatus {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            DraftStatus::Draft => "draft",
            DraftStatus::InReview => "in_review",
            DraftStatus::Approved => "approved",
            DraftStatus::Final => "final",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Self {
        match s {
            "in_review" => DraftStatus::InReview,
            "approved" => DraftStatus::Approved,
            "final" => DraftStatus::Final,
            _ => DraftStatus::Draft,
        }
    }
}

impl fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode())
    }
}

/// Lifecycle of an export request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    Pending,
    Completed,
    Failed,
}

impl ExportStatus {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            ExportStatus::Pending => "pending",
            ExportStatus::Completed => "completed",
            ExportStatus::Failed => "failed",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Self {
        match s {
            "pending" => ExportStatus::Pending,
            "completed" => ExportStatus::Completed,
            _ => ExportStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in [
            DocStatus::Uploaded,
            DocStatus::Processing,
            DocStatus::Ready,
            DocStatus::Failed,
        ] {
            assert_eq!(DocStatus::decode(s.encode()), s);
        }
        for s in [
            DraftStatus::Draft,
            DraftStatus::InReview,
            DraftStatus::Approved,
            DraftStatus::Final,
        ] {
            assert_eq!(DraftStatus::decode(s.encode()), s);
        }
    }

    #[test]
    fn unknown_status_degrades_to_failed() {
        assert_eq!(DocStatus::decode("archived"), DocStatus::Failed);
    }

    #[test]
    fn ids_are_distinct_types_with_display() {
        let id = SectionId::new();
        assert_eq!(id.to_string().len(), 36);
        assert_eq!(SectionId::parse(&id.to_string()).unwrap(), id);
    }
}
