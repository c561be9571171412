//! SQLite-backed corpus store with vector search via `sqlite-vec`.
//!
//! Relational rows (documents, chunks) and vector rows (`chunk_embeddings`)
//! live in the same database file; embeddings are written with `vec_f32(?)`
//! and queried with `vec_distance_cosine`, so nearest-neighbor results come
//! back as cosine distances ascending.

use std::mem::transmute;
use std::os::raw::c_char;
use std::path::Path;
use std::sync::Once;

use chrono::{DateTime, Utc};
use tokio_rusqlite::{Connection, OptionalExtension, ffi};
use tracing::instrument;
use uuid::Uuid;

use super::{
    ChunkInsert, CorpusError, KnowledgeDocument, NewKnowledgeDocument, RetrievedChunk, StoredChunk,
};
use crate::types::{ChunkId, DocStatus, KbDocumentId};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kb_documents (
    id             TEXT PRIMARY KEY,
    org_id         TEXT,
    title          TEXT NOT NULL,
    file_name      TEXT,
    mime_type      TEXT,
    size_bytes     INTEGER,
    status         TEXT NOT NULL DEFAULT 'uploaded',
    error_message  TEXT,
    pages          INTEGER,
    is_active      INTEGER NOT NULL DEFAULT 1,
    created_at     TEXT NOT NULL,
    processed_at   TEXT
);
CREATE INDEX IF NOT EXISTS idx_kb_documents_org ON kb_documents (org_id, status);
CREATE TABLE IF NOT EXISTS chunks (
    id           TEXT PRIMARY KEY,
    document_id  TEXT NOT NULL REFERENCES kb_documents (id),
    chunk_index  INTEGER NOT NULL,
    text         TEXT NOT NULL,
    tokens       INTEGER NOT NULL DEFAULT 0,
    page_start   INTEGER,
    page_end     INTEGER,
    UNIQUE (document_id, chunk_index)
);
CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks (document_id, chunk_index);
CREATE TABLE IF NOT EXISTS chunk_embeddings (
    id         TEXT PRIMARY KEY,
    embedding  BLOB NOT NULL
);
"#;

/// Scope restricting a similarity search to eligible documents.
#[derive(Clone, Debug, Default)]
pub struct SearchScope {
    /// Organization the corpus documents must belong to; `None` matches
    /// documents without an organization.
    pub org_id: Option<String>,
    /// Optional restriction to a specific set of documents.
    pub document_ids: Option<Vec<KbDocumentId>>,
}

#[derive(Clone)]
pub struct CorpusStore {
    conn: Connection,
}

impl std::fmt::Debug for CorpusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorpusStore").finish()
    }
}

impl CorpusStore {
    /// Open (or create) the corpus database at `path`.
    #[instrument(skip(path))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CorpusError> {
        Self::register_sqlite_vec()?;
        let conn = Connection::open(path)
            .await
            .map_err(|e| CorpusError::Storage(e.to_string()))?;
        conn.call(|conn| {
            // Verify the vec extension is live before touching the schema.
            conn.query_row("select vec_version()", [], |row| row.get::<_, String>(0))
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
            conn.execute_batch(SCHEMA)
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
            Ok(())
        })
        .await
        .map_err(|e| CorpusError::Storage(e.to_string()))?;
        Ok(Self { conn })
    }

    fn register_sqlite_vec() -> Result<(), CorpusError> {
        use std::sync::Mutex;

        static INIT: Once = Once::new();
        static INIT_RESULT: Mutex<Option<Result<(), String>>> = Mutex::new(None);

        INIT.call_once(|| {
            let result = unsafe {
                type SqliteExtensionInit = unsafe extern "C" fn(
                    *mut ffi::sqlite3,
                    *mut *mut c_char,
                    *const ffi::sqlite3_api_routines,
                ) -> i32;

                let init: unsafe extern "C" fn() = sqlite_vec::sqlite3_vec_init;
                let init_fn: SqliteExtensionInit =
                    transmute::<unsafe extern "C" fn(), SqliteExtensionInit>(init);
                let rc = ffi::sqlite3_auto_extension(Some(init_fn));
                if rc != 0 {
                    Err(format!(
                        "failed to register sqlite-vec extension (code {rc})"
                    ))
                } else {
                    Ok(())
                }
            };
            *INIT_RESULT.lock().expect("init result mutex poisoned") = Some(result);
        });

        INIT_RESULT
            .lock()
            .expect("init result mutex poisoned")
            .clone()
            .expect("init was called but result not set")
            .map_err(CorpusError::Storage)
    }

    /// Persist a freshly uploaded document in `uploaded` state.
    pub async fn create_document(
        &self,
        new: NewKnowledgeDocument,
    ) -> Result<KnowledgeDocument, CorpusError> {
        let doc = KnowledgeDocument {
            id: KbDocumentId::new(),
            org_id: new.org_id,
            title: new.title,
            file_name: new.file_name,
            mime_type: new.mime_type,
            size_bytes: new.size_bytes,
            status: DocStatus::Uploaded,
            error_message: None,
            pages: None,
            is_active: true,
            created_at: Utc::now(),
            processed_at: None,
        };
        let row = doc.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO kb_documents \
                     (id, org_id, title, file_name, mime_type, size_bytes, status, is_active, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
                    rusqlite::params![
                        row.id.to_string(),
                        row.org_id,
                        row.title,
                        row.file_name,
                        row.mime_type,
                        row.size_bytes.map(|v| v as i64),
                        row.status.encode(),
                        row.created_at.to_rfc3339(),
                    ],
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(|e| CorpusError::Storage(e.to_string()))?;
        Ok(doc)
    }

    pub async fn get_document(
        &self,
        id: KbDocumentId,
    ) -> Result<Option<KnowledgeDocument>, CorpusError> {
        let key = id.to_string();
        self.conn
            .call(move |conn| {
                let doc = conn
                    .query_row(
                        "SELECT id, org_id, title, file_name, mime_type, size_bytes, status, \
                         error_message, pages, is_active, created_at, processed_at \
                         FROM kb_documents WHERE id = ?1",
                        [&key],
                        row_to_document,
                    )
                    .optional()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(doc)
            })
            .await
            .map_err(|e| CorpusError::Storage(e.to_string()))
    }

    /// Transition a document's lifecycle status, replacing the error message.
    #[instrument(skip(self))]
    pub async fn set_status(
        &self,
        id: KbDocumentId,
        status: DocStatus,
        error_message: Option<String>,
    ) -> Result<(), CorpusError> {
        let key = id.to_string();
        let processed_at = matches!(status, DocStatus::Ready).then(|| Utc::now().to_rfc3339());
        let changed = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE kb_documents SET status = ?2, error_message = ?3, \
                     processed_at = COALESCE(?4, processed_at) WHERE id = ?1",
                    rusqlite::params![key, status.encode(), error_message, processed_at],
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)
            })
            .await
            .map_err(|e| CorpusError::Storage(e.to_string()))?;
        if changed == 0 {
            return Err(CorpusError::NotFound(id));
        }
        Ok(())
    }

    pub async fn set_pages(&self, id: KbDocumentId, pages: u32) -> Result<(), CorpusError> {
        let key = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE kb_documents SET pages = ?2 WHERE id = ?1",
                    rusqlite::params![key, pages],
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)
            })
            .await
            .map_err(|e| CorpusError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Soft-delete: the document and its chunks stop being eligible for
    /// retrieval but stay on disk for provenance.
    pub async fn deactivate(&self, id: KbDocumentId) -> Result<(), CorpusError> {
        let key = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE kb_documents SET is_active = 0 WHERE id = ?1",
                    [&key],
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)
            })
            .await
            .map_err(|e| CorpusError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Atomically replace the document's chunk set.
    ///
    /// Old chunk and embedding rows are deleted and the new set inserted in
    /// one transaction, so a concurrent reader sees either the previous
    /// complete set or the new one, never a mix.
    #[instrument(skip(self, chunks), fields(chunks = chunks.len()))]
    pub async fn replace_chunks(
        &self,
        document_id: KbDocumentId,
        chunks: Vec<ChunkInsert>,
    ) -> Result<Vec<ChunkId>, CorpusError> {
        let doc_key = document_id.to_string();
        let ids: Vec<ChunkId> = chunks.iter().map(|_| ChunkId::new()).collect();
        let id_strings: Vec<String> = ids.iter().map(ChunkId::to_string).collect();
        self.conn
            .call(move |conn| {
                let tx = conn
                    .transaction()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.execute(
                    "DELETE FROM chunk_embeddings WHERE id IN \
                     (SELECT id FROM chunks WHERE document_id = ?1)",
                    [&doc_key],
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.execute("DELETE FROM chunks WHERE document_id = ?1", [&doc_key])
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                for (chunk, id) in chunks.iter().zip(&id_strings) {
                    tx.execute(
                        "INSERT INTO chunks \
                         (id, document_id, chunk_index, text, tokens, page_start, page_end) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        rusqlite::params![
                            id,
                            doc_key,
                            chunk.ordinal,
                            chunk.text,
                            chunk.tokens,
                            chunk.page_start,
                            chunk.page_end,
                        ],
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    let vector_json = serde_json::to_string(&chunk.embedding)
                        .map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))?;
                    tx.execute(
                        "INSERT INTO chunk_embeddings (id, embedding) VALUES (?1, vec_f32(?2))",
                        rusqlite::params![id, vector_json],
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                }
                tx.commit().map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(|e| CorpusError::Storage(e.to_string()))?;
        Ok(ids)
    }

    /// All chunks of a document in ordinal order.
    pub async fn chunks_for_document(
        &self,
        document_id: KbDocumentId,
    ) -> Result<Vec<StoredChunk>, CorpusError> {
        let doc_key = document_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, document_id, chunk_index, text, tokens, page_start, page_end \
                         FROM chunks WHERE document_id = ?1 ORDER BY chunk_index ASC",
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map([&doc_key], |row| {
                        Ok(StoredChunk {
                            id: parse_id(row.get::<_, String>(0)?, 0)?,
                            document_id: parse_id(row.get::<_, String>(1)?, 1)?,
                            ordinal: row.get(2)?,
                            text: row.get(3)?,
                            tokens: row.get(4)?,
                            page_start: row.get(5)?,
                            page_end: row.get(6)?,
                        })
                    })
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(out)
            })
            .await
            .map_err(|e| CorpusError::Storage(e.to_string()))
    }

    /// Nearest-neighbor search over eligible chunks.
    ///
    /// Eligible = chunk of an active, `ready` document inside `scope`.
    /// Results are ordered by cosine distance ascending with deterministic
    /// tie-breaking on (ordinal, document id).
    #[instrument(skip(self, query_vector, scope))]
    pub async fn search_similar(
        &self,
        query_vector: &[f32],
        scope: &SearchScope,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>, CorpusError> {
        let vector_json = serde_json::to_string(query_vector)
            .map_err(|e| CorpusError::Storage(e.to_string()))?;

        let mut sql = String::from(
            "SELECT c.id, c.document_id, c.chunk_index, c.text, d.title, \
             vec_distance_cosine(e.embedding, vec_f32(?1)) AS distance \
             FROM chunks c \
             JOIN chunk_embeddings e ON e.id = c.id \
             JOIN kb_documents d ON d.id = c.document_id \
             WHERE d.is_active = 1 AND d.status = 'ready'",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql + Send>> = vec![Box::new(vector_json)];
        match &scope.org_id {
            Some(org) => {
                params.push(Box::new(org.clone()));
                sql.push_str(&format!(" AND d.org_id = ?{}", params.len()));
            }
            None => sql.push_str(" AND d.org_id IS NULL"),
        }
        if let Some(ids) = &scope.document_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders: Vec<String> = ids
                .iter()
                .map(|id| {
                    params.push(Box::new(id.to_string()));
                    format!("?{}", params.len())
                })
                .collect();
            sql.push_str(&format!(
                " AND c.document_id IN ({})",
                placeholders.join(", ")
            ));
        }
        params.push(Box::new(limit as i64));
        sql.push_str(&format!(
            " ORDER BY distance ASC, c.chunk_index ASC, c.document_id ASC LIMIT ?{}",
            params.len()
        ));

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql).map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map(
                        rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                        |row| {
                            Ok(RetrievedChunk {
                                chunk_id: parse_id(row.get::<_, String>(0)?, 0)?,
                                document_id: parse_id(row.get::<_, String>(1)?, 1)?,
                                ordinal: row.get(2)?,
                                text: row.get(3)?,
                                document_title: row.get(4)?,
                                distance: row.get::<_, f64>(5)? as f32,
                            })
                        },
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(out)
            })
            .await
            .map_err(|e| CorpusError::Storage(e.to_string()))
    }

    /// Total chunk rows across the corpus.
    pub async fn chunk_count(&self) -> Result<usize, CorpusError> {
        self.conn
            .call(|conn| {
                let count: i64 = conn
                    .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(count as usize)
            })
            .await
            .map_err(|e| CorpusError::Storage(e.to_string()))
    }
}

fn parse_id<T: From<Uuid>>(raw: String, column: usize) -> rusqlite::Result<T> {
    Uuid::parse_str(&raw).map(T::from).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeDocument> {
    Ok(KnowledgeDocument {
        id: parse_id(row.get::<_, String>(0)?, 0)?,
        org_id: row.get(1)?,
        title: row.get(2)?,
        file_name: row.get(3)?,
        mime_type: row.get(4)?,
        size_bytes: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
        status: DocStatus::decode(&row.get::<_, String>(6)?),
        error_message: row.get(7)?,
        pages: row.get(8)?,
        is_active: row.get::<_, i64>(9)? != 0,
        created_at: parse_timestamp(row.get::<_, String>(10)?, 10)?,
        processed_at: row
            .get::<_, Option<String>>(11)?
            .map(|s| parse_timestamp(s, 11))
            .transpose()?,
    })
}

fn parse_timestamp(raw: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}
