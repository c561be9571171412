//! SQLite-backed authoring store (documents, sections, versions, citations,
//! locks, exports) on an `sqlx` pool with embedded migrations.
//!
//! Version creation and the `current` pointer update commit together in one
//! transaction, as do version-plus-citations writes from generation jobs.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use super::{
    Document, DocumentExport, ExportFormat, NewDocument, NewSectionVersion, Section, SectionError,
    SectionLock, SectionVersion,
};
use crate::citations::{Citation, CitationDraft};
use crate::types::{
    CitationId, DocumentId, DraftStatus, ExportId, ExportStatus, SectionId, VersionId,
};

#[derive(Clone)]
pub struct SectionStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectionStore").finish()
    }
}

impl SectionStore {
    /// Connect to (or create) the authoring database and run migrations.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self, SectionError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| SectionError::Storage(format!("migration failure: {e}")))?;
        Ok(Self { pool })
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    pub async fn create_document(&self, new: NewDocument) -> Result<Document, SectionError> {
        let doc = Document {
            id: DocumentId::new(),
            org_id: new.org_id,
            template_key: new.template_key,
            title: new.title,
            status: DraftStatus::Draft,
            success: None,
            finalized_at: None,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO documents (id, org_id, template_key, title, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(doc.id.to_string())
        .bind(&doc.org_id)
        .bind(&doc.template_key)
        .bind(&doc.title)
        .bind(doc.status.encode())
        .bind(doc.created_at)
        .execute(&self.pool)
        .await?;
        Ok(doc)
    }

    pub async fn get_document(&self, id: DocumentId) -> Result<Document, SectionError> {
        sqlx::query(
            "SELECT id, org_id, template_key, title, status, success, finalized_at, created_at \
             FROM documents WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row_to_document(&row))
        .transpose()?
        .ok_or(SectionError::DocumentNotFound(id))
    }

    pub async fn set_document_status(
        &self,
        id: DocumentId,
        status: DraftStatus,
    ) -> Result<(), SectionError> {
        let changed = sqlx::query("UPDATE documents SET status = ?2 WHERE id = ?1")
            .bind(id.to_string())
            .bind(status.encode())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if changed == 0 {
            return Err(SectionError::DocumentNotFound(id));
        }
        Ok(())
    }

    /// Mark a document final, recording the outcome tri-state.
    pub async fn finalize_document(
        &self,
        id: DocumentId,
        success: Option<bool>,
    ) -> Result<Document, SectionError> {
        let changed = sqlx::query(
            "UPDATE documents SET status = 'final', success = ?2, finalized_at = ?3 WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(success)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if changed == 0 {
            return Err(SectionError::DocumentNotFound(id));
        }
        self.get_document(id).await
    }

    // ------------------------------------------------------------------
    // Sections
    // ------------------------------------------------------------------

    pub async fn add_section(
        &self,
        document_id: DocumentId,
        key: impl Into<String>,
        title: impl Into<String>,
        order_index: u32,
    ) -> Result<Section, SectionError> {
        // Fails with a storage error on duplicate (document, key) per the
        // unique index; callers treat that as a template bug.
        self.get_document(document_id).await?;
        let section = Section {
            id: SectionId::new(),
            document_id,
            key: key.into(),
            title: title.into(),
            order_index,
            current_version_id: None,
        };
        sqlx::query(
            "INSERT INTO sections (id, document_id, key, title, ord) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(section.id.to_string())
        .bind(section.document_id.to_string())
        .bind(&section.key)
        .bind(&section.title)
        .bind(section.order_index)
        .execute(&self.pool)
        .await?;
        Ok(section)
    }

    pub async fn get_section(&self, id: SectionId) -> Result<Section, SectionError> {
        sqlx::query(
            "SELECT id, document_id, key, title, ord, current_version_id \
             FROM sections WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row_to_section(&row))
        .transpose()?
        .ok_or(SectionError::NotFound(id))
    }

    /// Sections of a document in ascending order index.
    pub async fn sections_for_document(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<Section>, SectionError> {
        let rows = sqlx::query(
            "SELECT id, document_id, key, title, ord, current_version_id \
             FROM sections WHERE document_id = ?1 ORDER BY ord ASC, key ASC",
        )
        .bind(document_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_section).collect()
    }

    // ------------------------------------------------------------------
    // Version chain
    // ------------------------------------------------------------------

    /// Append a version at the end of the chain and repoint `current`.
    pub async fn create_version(
        &self,
        section_id: SectionId,
        new: NewSectionVersion,
    ) -> Result<SectionVersion, SectionError> {
        self.create_version_with_citations(section_id, new, Vec::new())
            .await
    }

    /// Append a version and its citations in a single transaction.
    ///
    /// Citations are appended per generation event; nothing is deduplicated
    /// here (presentation-layer grouping handles that).
    #[instrument(skip(self, new, citations), fields(citations = citations.len()))]
    pub async fn create_version_with_citations(
        &self,
        section_id: SectionId,
        new: NewSectionVersion,
        citations: Vec<CitationDraft>,
    ) -> Result<SectionVersion, SectionError> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT id FROM sections WHERE id = ?1")
            .bind(section_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(SectionError::NotFound(section_id));
        }

        let last_seq: i64 =
            sqlx::query("SELECT COALESCE(MAX(seq), 0) FROM section_versions WHERE section_id = ?1")
                .bind(section_id.to_string())
                .fetch_one(&mut *tx)
                .await?
                .try_get(0)?;

        let version = SectionVersion {
            id: VersionId::new(),
            section_id,
            seq: last_seq + 1,
            content: new.content,
            diff: new.diff,
            author: new.author,
            ai_generated: new.ai_generated,
            metadata: new.metadata,
            summary: new.summary,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO section_versions \
             (id, section_id, seq, content, diff, author, ai_generated, metadata, summary, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(version.id.to_string())
        .bind(version.section_id.to_string())
        .bind(version.seq)
        .bind(&version.content)
        .bind(&version.diff)
        .bind(&version.author)
        .bind(version.ai_generated)
        .bind(version.metadata.to_string())
        .bind(&version.summary)
        .bind(version.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE sections SET current_version_id = ?2 WHERE id = ?1")
            .bind(section_id.to_string())
            .bind(version.id.to_string())
            .execute(&mut *tx)
            .await?;

        let now = Utc::now();
        for draft in &citations {
            sqlx::query(
                "INSERT INTO citations \
                 (id, section_id, marker, reference_text, kb_document_id, external_url, confidence, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .bind(CitationId::new().to_string())
            .bind(section_id.to_string())
            .bind(&draft.marker)
            .bind(&draft.reference_text)
            .bind(draft.kb_document_id.map(|id| id.to_string()))
            .bind(&draft.external_url)
            .bind(draft.confidence)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(version)
    }

    /// Repoint `current` one position backward in creation order.
    ///
    /// Fails with [`SectionError::NoPreviousVersion`] when fewer than two
    /// versions exist or `current` already sits at the chain head.
    pub async fn undo(&self, section_id: SectionId) -> Result<SectionVersion, SectionError> {
        let mut tx = self.pool.begin().await?;

        let current_id: Option<String> =
            sqlx::query("SELECT current_version_id FROM sections WHERE id = ?1")
                .bind(section_id.to_string())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(SectionError::NotFound(section_id))?
                .try_get(0)?;
        let current_id = current_id.ok_or(SectionError::NoPreviousVersion)?;

        let current_seq: i64 = sqlx::query("SELECT seq FROM section_versions WHERE id = ?1")
            .bind(&current_id)
            .fetch_one(&mut *tx)
            .await?
            .try_get(0)?;

        let previous = sqlx::query(
            "SELECT id, section_id, seq, content, diff, author, ai_generated, metadata, summary, created_at \
             FROM section_versions WHERE section_id = ?1 AND seq < ?2 \
             ORDER BY seq DESC LIMIT 1",
        )
        .bind(section_id.to_string())
        .bind(current_seq)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row_to_version(&row))
        .transpose()?
        .ok_or(SectionError::NoPreviousVersion)?;

        sqlx::query("UPDATE sections SET current_version_id = ?2 WHERE id = ?1")
            .bind(section_id.to_string())
            .bind(previous.id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(previous)
    }

    /// Content of the version `current` points at; empty when none exists.
    pub async fn read_content(&self, section_id: SectionId) -> Result<String, SectionError> {
        let section = self.get_section(section_id).await?;
        let Some(version_id) = section.current_version_id else {
            return Ok(String::new());
        };
        let content: String = sqlx::query("SELECT content FROM section_versions WHERE id = ?1")
            .bind(version_id.to_string())
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;
        Ok(content)
    }

    /// Full chain in creation order (audit/export).
    pub async fn list_versions(
        &self,
        section_id: SectionId,
    ) -> Result<Vec<SectionVersion>, SectionError> {
        let rows = sqlx::query(
            "SELECT id, section_id, seq, content, diff, author, ai_generated, metadata, summary, created_at \
             FROM section_versions WHERE section_id = ?1 ORDER BY seq ASC",
        )
        .bind(section_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_version).collect()
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    /// Acquire (or refresh) the section lease for `owner`.
    ///
    /// Conflicts only with an unexpired lease held by a different owner;
    /// an expired lease is overwritten without requiring a release.
    #[instrument(skip(self))]
    pub async fn acquire_lock(
        &self,
        section_id: SectionId,
        owner: &str,
        ttl: Option<Duration>,
    ) -> Result<SectionLock, SectionError> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT id FROM sections WHERE id = ?1")
            .bind(section_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(SectionError::NotFound(section_id));
        }

        let now = Utc::now();
        if let Some(row) = sqlx::query(
            "SELECT owner, acquired_at, expires_at FROM section_locks WHERE section_id = ?1",
        )
        .bind(section_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        {
            let holder: String = row.try_get("owner")?;
            let expires_at: Option<DateTime<Utc>> = row.try_get("expires_at")?;
            let expired = expires_at.is_some_and(|t| now > t);
            if holder != owner && !expired {
                return Err(SectionError::LockConflict { owner: holder });
            }
        }

        let lock = SectionLock {
            section_id,
            owner: owner.to_string(),
            acquired_at: now,
            expires_at: ttl
                .map(|d| now + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())),
        };
        sqlx::query(
            "INSERT INTO section_locks (section_id, owner, acquired_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (section_id) DO UPDATE SET \
             owner = excluded.owner, acquired_at = excluded.acquired_at, \
             expires_at = excluded.expires_at",
        )
        .bind(section_id.to_string())
        .bind(&lock.owner)
        .bind(lock.acquired_at)
        .bind(lock.expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(lock)
    }

    pub async fn release_lock(&self, section_id: SectionId) -> Result<(), SectionError> {
        sqlx::query("DELETE FROM section_locks WHERE section_id = ?1")
            .bind(section_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Release only if `owner` still holds the lease; a holder whose lease
    /// expired and was re-acquired by someone else must not clear theirs.
    pub async fn release_lock_owned(
        &self,
        section_id: SectionId,
        owner: &str,
    ) -> Result<(), SectionError> {
        sqlx::query("DELETE FROM section_locks WHERE section_id = ?1 AND owner = ?2")
            .bind(section_id.to_string())
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_lock(
        &self,
        section_id: SectionId,
    ) -> Result<Option<SectionLock>, SectionError> {
        let row = sqlx::query(
            "SELECT section_id, owner, acquired_at, expires_at FROM section_locks \
             WHERE section_id = ?1",
        )
        .bind(section_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(SectionLock {
                section_id: parse_id(row.try_get::<String, _>("section_id")?)?,
                owner: row.try_get("owner")?,
                acquired_at: row.try_get("acquired_at")?,
                expires_at: row.try_get("expires_at")?,
            })
        })
        .transpose()
    }

    // ------------------------------------------------------------------
    // Citations
    // ------------------------------------------------------------------

    /// Citations of one section in creation order.
    pub async fn citations_for_section(
        &self,
        section_id: SectionId,
    ) -> Result<Vec<Citation>, SectionError> {
        let rows = sqlx::query(
            "SELECT id, section_id, marker, reference_text, kb_document_id, external_url, \
             confidence, created_at \
             FROM citations WHERE section_id = ?1 ORDER BY created_at ASC, marker ASC",
        )
        .bind(section_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_citation).collect()
    }

    /// Citations across every section of a document, creation order.
    pub async fn citations_for_document(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<Citation>, SectionError> {
        let rows = sqlx::query(
            "SELECT c.id, c.section_id, c.marker, c.reference_text, c.kb_document_id, \
             c.external_url, c.confidence, c.created_at \
             FROM citations c JOIN sections s ON s.id = c.section_id \
             WHERE s.document_id = ?1 ORDER BY c.created_at ASC, c.marker ASC",
        )
        .bind(document_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_citation).collect()
    }

    // ------------------------------------------------------------------
    // Exports
    // ------------------------------------------------------------------

    pub async fn create_export(
        &self,
        document_id: DocumentId,
        format: ExportFormat,
    ) -> Result<DocumentExport, SectionError> {
        self.get_document(document_id).await?;
        let export = DocumentExport {
            id: ExportId::new(),
            document_id,
            format,
            status: ExportStatus::Pending,
            error: None,
            artifact: None,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO exports (id, document_id, format, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(export.id.to_string())
        .bind(export.document_id.to_string())
        .bind(export.format.encode())
        .bind(export.status.encode())
        .bind(export.created_at)
        .execute(&self.pool)
        .await?;
        Ok(export)
    }

    pub async fn get_export(&self, id: ExportId) -> Result<Option<DocumentExport>, SectionError> {
        let row = sqlx::query(
            "SELECT id, document_id, format, status, error, artifact, created_at \
             FROM exports WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| row_to_export(&row)).transpose()
    }

    pub async fn complete_export(
        &self,
        id: ExportId,
        artifact: String,
    ) -> Result<(), SectionError> {
        sqlx::query(
            "UPDATE exports SET status = 'completed', artifact = ?2, error = NULL WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(artifact)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_export(&self, id: ExportId, error: String) -> Result<(), SectionError> {
        sqlx::query("UPDATE exports SET status = 'failed', error = ?2 WHERE id = ?1")
            .bind(id.to_string())
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn parse_id<T: From<Uuid>>(raw: String) -> Result<T, SectionError> {
    Uuid::parse_str(&raw)
        .map(T::from)
        .map_err(|e| SectionError::Storage(format!("malformed id '{raw}': {e}")))
}

fn row_to_document(row: &SqliteRow) -> Result<Document, SectionError> {
    Ok(Document {
        id: parse_id(row.try_get::<String, _>("id")?)?,
        org_id: row.try_get("org_id")?,
        template_key: row.try_get("template_key")?,
        title: row.try_get("title")?,
        status: DraftStatus::decode(&row.try_get::<String, _>("status")?),
        success: row.try_get("success")?,
        finalized_at: row.try_get("finalized_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_section(row: &SqliteRow) -> Result<Section, SectionError> {
    Ok(Section {
        id: parse_id(row.try_get::<String, _>("id")?)?,
        document_id: parse_id(row.try_get::<String, _>("document_id")?)?,
        key: row.try_get("key")?,
        title: row.try_get("title")?,
        order_index: row.try_get::<i64, _>("ord")? as u32,
        current_version_id: row
            .try_get::<Option<String>, _>("current_version_id")?
            .map(parse_id)
            .transpose()?,
    })
}

fn row_to_version(row: &SqliteRow) -> Result<SectionVersion, SectionError> {
    let metadata_raw: String = row.try_get("metadata")?;
    Ok(SectionVersion {
        id: parse_id(row.try_get::<String, _>("id")?)?,
        section_id: parse_id(row.try_get::<String, _>("section_id")?)?,
        seq: row.try_get("seq")?,
        content: row.try_get("content")?,
        diff: row.try_get("diff")?,
        author: row.try_get("author")?,
        ai_generated: row.try_get("ai_generated")?,
        metadata: serde_json::from_str(&metadata_raw).unwrap_or(serde_json::Value::Null),
        summary: row.try_get("summary")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_citation(row: &SqliteRow) -> Result<Citation, SectionError> {
    Ok(Citation {
        id: parse_id(row.try_get::<String, _>("id")?)?,
        section_id: parse_id(row.try_get::<String, _>("section_id")?)?,
        marker: row.try_get("marker")?,
        reference_text: row.try_get("reference_text")?,
        kb_document_id: row
            .try_get::<Option<String>, _>("kb_document_id")?
            .map(parse_id)
            .transpose()?,
        external_url: row.try_get("external_url")?,
        confidence: row.try_get("confidence")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_export(row: &SqliteRow) -> Result<DocumentExport, SectionError> {
    Ok(DocumentExport {
        id: parse_id(row.try_get::<String, _>("id")?)?,
        document_id: parse_id(row.try_get::<String, _>("document_id")?)?,
        format: ExportFormat::decode(&row.try_get::<String, _>("format")?),
        status: ExportStatus::decode(&row.try_get::<String, _>("status")?),
        error: row.try_get("error")?,
        artifact: row.try_get("artifact")?,
        created_at: row.try_get("created_at")?,
    })
}
