//! High-level authoring service: wiring, synchronous edit/undo, and the
//! asynchronous job surface.
//!
//! Interactive operations (edit, undo, reads) run inline; ingestion,
//! generation, publication, and export are always enqueued and return a job
//! id. The service also implements [`JobExecutor`], mapping domain errors to
//! the scheduler's transient/terminal classification and recording terminal
//! failures on the owning entity.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::chunker::{Chunker, ChunkerError};
use crate::citations::{SourceGroup, group_by_source};
use crate::config::PipelineConfig;
use crate::corpus::{CorpusError, CorpusStore, KnowledgeDocument, NewKnowledgeDocument};
use crate::embeddings::EmbeddingProvider;
use crate::generation::orchestrator::{GenerationOrchestrator, OrchestratorError};
use crate::generation::{GenerationClient, WebSearchProvider};
use crate::ingestion::{IngestError, IngestPipeline, IngestSource};
use crate::jobs::{JobError, JobExecutor, JobKind, SchedulerConfig, TaskScheduler};
use crate::retrieval::Retriever;
use crate::sections::{
    Document, DocumentExport, ExportFormat, NewDocument, NewSectionVersion, Section, SectionError,
    SectionStore, SectionVersion,
};
use crate::types::{DocumentId, ExportId, JobId, KbDocumentId, SectionId};

#[derive(Debug, Error, Diagnostic)]
pub enum ServiceError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Corpus(#[from] CorpusError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Section(#[from] SectionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Chunker(#[from] ChunkerError),

    #[error("document {0} has no sections to generate")]
    #[diagnostic(code(draftsmith::service::no_sections))]
    NoSections(DocumentId),

    #[error("service builder is missing the {0} provider")]
    #[diagnostic(code(draftsmith::service::missing_provider))]
    MissingProvider(&'static str),
}

/// Template describing the sections a new document starts with.
#[derive(Clone, Debug, Default)]
pub struct TemplateSpec {
    pub key: String,
    pub sections: Vec<TemplateSection>,
}

#[derive(Clone, Debug)]
pub struct TemplateSection {
    pub key: String,
    pub title: String,
}

impl TemplateSpec {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            sections: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_section(mut self, key: impl Into<String>, title: impl Into<String>) -> Self {
        self.sections.push(TemplateSection {
            key: key.into(),
            title: title.into(),
        });
        self
    }
}

/// Everything the job executor needs; shared between the service facade and
/// the worker tasks.
struct Engine {
    config: PipelineConfig,
    corpus: Arc<CorpusStore>,
    sections: Arc<SectionStore>,
    ingest: IngestPipeline,
    orchestrator: GenerationOrchestrator,
}

pub struct AuthoringService {
    engine: Arc<Engine>,
    scheduler: TaskScheduler,
}

pub struct AuthoringServiceBuilder {
    config: PipelineConfig,
    embeddings: Option<Arc<dyn EmbeddingProvider>>,
    generation: Option<Arc<dyn GenerationClient>>,
    search: Option<Arc<dyn WebSearchProvider>>,
}

impl AuthoringServiceBuilder {
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn embeddings(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embeddings = Some(provider);
        self
    }

    #[must_use]
    pub fn generation_client(mut self, client: Arc<dyn GenerationClient>) -> Self {
        self.generation = Some(client);
        self
    }

    #[must_use]
    pub fn web_search(mut self, search: Arc<dyn WebSearchProvider>) -> Self {
        self.search = Some(search);
        self
    }

    /// Open the stores, build the pipeline, and start the worker pool.
    pub async fn build(self) -> Result<AuthoringService, ServiceError> {
        let embeddings = self
            .embeddings
            .ok_or(ServiceError::MissingProvider("embeddings"))?;
        let generation = self
            .generation
            .ok_or(ServiceError::MissingProvider("generation"))?;
        let search = self.search.ok_or(ServiceError::MissingProvider("search"))?;
        let config = self.config;

        let corpus = Arc::new(CorpusStore::open(&config.corpus_db_path).await?);
        let sections = Arc::new(SectionStore::connect(&config.authoring_db_url).await?);
        let chunker = Chunker::new(config.chunk_tokens, config.chunk_overlap)?;
        let retriever = Retriever::new(Arc::clone(&corpus), config.max_top_k);
        let ingest = IngestPipeline::new(
            Arc::clone(&corpus),
            Arc::clone(&embeddings),
            chunker.clone(),
        );
        let orchestrator = GenerationOrchestrator::new(
            Arc::clone(&sections),
            retriever,
            Arc::clone(&embeddings),
            generation,
            search,
            config.top_k,
            config.lock_ttl,
        );

        let engine = Arc::new(Engine {
            corpus,
            sections,
            ingest,
            orchestrator,
            config: config.clone(),
        });
        let scheduler = TaskScheduler::start(
            SchedulerConfig {
                workers: config.workers,
                max_retries: config.max_retries,
                retry_base_delay: config.retry_base_delay,
                stuck_job_timeout: config.stuck_job_timeout,
                sweep_interval: config.stuck_job_timeout.min(std::time::Duration::from_secs(60)),
            },
            Arc::clone(&engine) as Arc<dyn JobExecutor>,
        );
        Ok(AuthoringService { engine, scheduler })
    }
}

impl AuthoringService {
    pub fn builder() -> AuthoringServiceBuilder {
        AuthoringServiceBuilder {
            config: PipelineConfig::default(),
            embeddings: None,
            generation: None,
            search: None,
        }
    }

    // ------------------------------------------------------------------
    // Knowledge corpus
    // ------------------------------------------------------------------

    /// Register uploaded source material and queue its ingestion.
    pub async fn upload_knowledge_document(
        &self,
        new: NewKnowledgeDocument,
        source: IngestSource,
    ) -> Result<(KnowledgeDocument, JobId), ServiceError> {
        let document = self.engine.corpus.create_document(new).await?;
        let job_id = self.scheduler.enqueue(JobKind::IngestDocument {
            kb_document_id: document.id,
            source,
        });
        Ok((document, job_id))
    }

    /// Re-run ingestion for an existing corpus document; the chunk set is
    /// replaced atomically.
    pub fn reprocess_knowledge_document(
        &self,
        kb_document_id: KbDocumentId,
        source: IngestSource,
    ) -> JobId {
        self.scheduler.enqueue(JobKind::IngestDocument {
            kb_document_id,
            source,
        })
    }

    pub async fn knowledge_document(
        &self,
        id: KbDocumentId,
    ) -> Result<Option<KnowledgeDocument>, ServiceError> {
        Ok(self.engine.corpus.get_document(id).await?)
    }

    pub async fn deactivate_knowledge_document(
        &self,
        id: KbDocumentId,
    ) -> Result<(), ServiceError> {
        Ok(self.engine.corpus.deactivate(id).await?)
    }

    // ------------------------------------------------------------------
    // Documents & sections
    // ------------------------------------------------------------------

    /// Create a document and materialize its template sections explicitly.
    pub async fn create_document(
        &self,
        title: impl Into<String>,
        org_id: Option<String>,
        template: &TemplateSpec,
    ) -> Result<(Document, Vec<Section>), ServiceError> {
        let document = self
            .engine
            .sections
            .create_document(NewDocument {
                org_id,
                template_key: Some(template.key.clone()),
                title: title.into(),
            })
            .await?;
        let mut sections = Vec::with_capacity(template.sections.len());
        for (idx, spec) in template.sections.iter().enumerate() {
            sections.push(
                self.engine
                    .sections
                    .add_section(document.id, &spec.key, &spec.title, idx as u32)
                    .await?,
            );
        }
        Ok((document, sections))
    }

    pub async fn document(&self, id: DocumentId) -> Result<Document, ServiceError> {
        Ok(self.engine.sections.get_document(id).await?)
    }

    pub async fn sections(&self, document_id: DocumentId) -> Result<Vec<Section>, ServiceError> {
        Ok(self.engine.sections.sections_for_document(document_id).await?)
    }

    /// Synchronous interactive edit: holds the section lease for the author
    /// around the version append, so a concurrent generation job cannot
    /// interleave.
    #[instrument(skip(self, content, summary))]
    pub async fn edit_section(
        &self,
        section_id: SectionId,
        content: String,
        author: &str,
        summary: Option<String>,
    ) -> Result<SectionVersion, ServiceError> {
        self.engine
            .sections
            .acquire_lock(section_id, author, Some(self.engine.config.lock_ttl))
            .await?;
        let result = self
            .engine
            .sections
            .create_version(
                section_id,
                NewSectionVersion {
                    summary,
                    ..NewSectionVersion::human(content, author)
                },
            )
            .await;
        let _ = self
            .engine
            .sections
            .release_lock_owned(section_id, author)
            .await;
        Ok(result?)
    }

    /// Step the section's `current` pointer one version backward.
    pub async fn undo_section(&self, section_id: SectionId) -> Result<SectionVersion, ServiceError> {
        Ok(self.engine.sections.undo(section_id).await?)
    }

    pub async fn read_section(&self, section_id: SectionId) -> Result<String, ServiceError> {
        Ok(self.engine.sections.read_content(section_id).await?)
    }

    // ------------------------------------------------------------------
    // Generation & export jobs
    // ------------------------------------------------------------------

    pub fn queue_section_generation(
        &self,
        section_id: SectionId,
        instruction: Option<String>,
    ) -> JobId {
        self.scheduler.enqueue(JobKind::GenerateSection {
            section_id,
            instruction,
        })
    }

    pub async fn queue_document_generation(
        &self,
        document_id: DocumentId,
        instruction: Option<String>,
    ) -> Result<JobId, ServiceError> {
        if self
            .engine
            .sections
            .sections_for_document(document_id)
            .await?
            .is_empty()
        {
            return Err(ServiceError::NoSections(document_id));
        }
        Ok(self.scheduler.enqueue(JobKind::GenerateDocument {
            document_id,
            instruction,
        }))
    }

    /// Mark the document final and queue its publication back into the
    /// knowledge corpus, so future drafts can retrieve from it.
    pub async fn finalize_document(
        &self,
        document_id: DocumentId,
        success: Option<bool>,
    ) -> Result<(Document, JobId), ServiceError> {
        let document = self
            .engine
            .sections
            .finalize_document(document_id, success)
            .await?;
        let kb_document = self
            .engine
            .corpus
            .create_document(NewKnowledgeDocument {
                org_id: document.org_id.clone(),
                title: document.title.clone(),
                file_name: Some(format!("document-{document_id}.txt")),
                mime_type: Some("text/plain".to_string()),
                size_bytes: None,
            })
            .await?;
        let job_id = self.scheduler.enqueue(JobKind::PublishToCorpus {
            document_id,
            kb_document_id: kb_document.id,
        });
        Ok((document, job_id))
    }

    pub async fn request_export(
        &self,
        document_id: DocumentId,
        format: ExportFormat,
    ) -> Result<(DocumentExport, JobId), ServiceError> {
        let export = self
            .engine
            .sections
            .create_export(document_id, format)
            .await?;
        let job_id = self
            .scheduler
            .enqueue(JobKind::ExportDocument { export_id: export.id });
        Ok((export, job_id))
    }

    pub async fn export(&self, id: ExportId) -> Result<Option<DocumentExport>, ServiceError> {
        Ok(self.engine.sections.get_export(id).await?)
    }

    // ------------------------------------------------------------------
    // Jobs & citations
    // ------------------------------------------------------------------

    pub fn job(&self, id: JobId) -> Option<crate::jobs::Job> {
        self.scheduler.job(id)
    }

    /// Poll a job until it reaches a terminal status (test/CLI convenience).
    pub async fn wait_for_job(
        &self,
        id: JobId,
        timeout: std::time::Duration,
    ) -> Option<crate::jobs::Job> {
        self.scheduler.wait(id, timeout).await
    }

    /// Flat citation list for one section, in creation order.
    pub async fn section_citations(
        &self,
        section_id: SectionId,
    ) -> Result<Vec<crate::citations::Citation>, ServiceError> {
        Ok(self.engine.sections.citations_for_section(section_id).await?)
    }

    /// Grouped citation view for a document: one entry per cited source
    /// document, deduplicated per (chunk, section).
    pub async fn grouped_citations(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<SourceGroup>, ServiceError> {
        let citations = self
            .engine
            .sections
            .citations_for_document(document_id)
            .await?;
        let mut titles: HashMap<KbDocumentId, Option<String>> = HashMap::new();
        for citation in &citations {
            if let Some(kb_id) = citation.kb_document_id {
                if !titles.contains_key(&kb_id) {
                    let title = self
                        .engine
                        .corpus
                        .get_document(kb_id)
                        .await?
                        .map(|d| d.title);
                    titles.insert(kb_id, title);
                }
            }
        }
        let rows: Vec<_> = citations
            .into_iter()
            .map(|c| {
                let title = c
                    .kb_document_id
                    .and_then(|id| titles.get(&id).cloned().flatten());
                (c, title)
            })
            .collect();
        Ok(group_by_source(&rows))
    }
}

impl Engine {
    /// Assemble the document body handed to external exporters: title,
    /// sections in order, and a references appendix grouped by source.
    async fn assemble_export(&self, document_id: DocumentId) -> Result<String, ServiceError> {
        let document = self.sections.get_document(document_id).await?;
        let mut out = format!("# {}\n", document.title);
        for section in self.sections.sections_for_document(document_id).await? {
            let content = self.sections.read_content(section.id).await?;
            out.push_str(&format!("\n## {}\n\n{}\n", section.title, content));
        }

        let citations = self.sections.citations_for_document(document_id).await?;
        let mut rows = Vec::with_capacity(citations.len());
        for citation in citations {
            let title = match citation.kb_document_id {
                Some(id) => self.corpus.get_document(id).await?.map(|d| d.title),
                None => None,
            };
            rows.push((citation, title));
        }
        let groups = group_by_source(&rows);
        if !groups.is_empty() {
            out.push_str("\n## References\n");
            for group in groups {
                let markers = group
                    .chunks_used
                    .iter()
                    .map(|c| c.marker.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                out.push_str(&format!("\n- {} ({markers})", group.document_title));
            }
            out.push('\n');
        }
        Ok(out)
    }

    /// Concatenate section titles and current content for corpus publication.
    async fn assemble_publication(&self, document_id: DocumentId) -> Result<String, ServiceError> {
        let mut parts = Vec::new();
        for section in self.sections.sections_for_document(document_id).await? {
            let content = self.sections.read_content(section.id).await?;
            if !content.is_empty() {
                parts.push(format!("{}\n\n{}", section.title, content));
            }
        }
        Ok(parts.join("\n\n"))
    }
}

#[async_trait]
impl JobExecutor for Engine {
    async fn execute(&self, kind: &JobKind) -> Result<(), JobError> {
        match kind {
            JobKind::IngestDocument {
                kb_document_id,
                source,
            } => {
                self.ingest
                    .ingest(*kb_document_id, source)
                    .await
                    .map_err(classify_ingest)?;
                Ok(())
            }
            JobKind::GenerateSection {
                section_id,
                instruction,
            } => {
                self.orchestrator
                    .generate_section(*section_id, instruction.as_deref())
                    .await
                    .map_err(classify_orchestrator)?;
                Ok(())
            }
            JobKind::GenerateDocument {
                document_id,
                instruction,
            } => {
                self.orchestrator
                    .generate_document(*document_id, instruction.as_deref())
                    .await
                    .map_err(classify_orchestrator)?;
                Ok(())
            }
            JobKind::ExportDocument { export_id } => {
                let export = self
                    .sections
                    .get_export(*export_id)
                    .await
                    .map_err(|e| JobError::Terminal(e.to_string()))?
                    .ok_or_else(|| JobError::Terminal(format!("export {export_id} not found")))?;
                let artifact = self
                    .assemble_export(export.document_id)
                    .await
                    .map_err(|e| JobError::Terminal(e.to_string()))?;
                self.sections
                    .complete_export(*export_id, artifact)
                    .await
                    .map_err(|e| JobError::Terminal(e.to_string()))?;
                Ok(())
            }
            JobKind::PublishToCorpus {
                document_id,
                kb_document_id,
            } => {
                let combined = self
                    .assemble_publication(*document_id)
                    .await
                    .map_err(|e| JobError::Terminal(e.to_string()))?;
                if combined.is_empty() {
                    // Nothing to publish is not a failure; leave the corpus
                    // document in its uploaded state.
                    info!(document = %document_id, "finalized document has no content to publish");
                    return Ok(());
                }
                self.ingest
                    .ingest(
                        *kb_document_id,
                        &IngestSource::Text {
                            text: combined,
                            page_or_row_count: None,
                        },
                    )
                    .await
                    .map_err(classify_ingest)?;
                Ok(())
            }
        }
    }

    async fn on_failed(&self, kind: &JobKind, message: &str) {
        match kind {
            JobKind::IngestDocument { kb_document_id, .. }
            | JobKind::PublishToCorpus { kb_document_id, .. } => {
                if let Err(e) = self
                    .corpus
                    .set_status(
                        *kb_document_id,
                        crate::types::DocStatus::Failed,
                        Some(message.to_string()),
                    )
                    .await
                {
                    error!(document = %kb_document_id, error = %e, "failed to record ingest failure");
                }
            }
            JobKind::ExportDocument { export_id } => {
                if let Err(e) = self
                    .sections
                    .fail_export(*export_id, message.to_string())
                    .await
                {
                    error!(export = %export_id, error = %e, "failed to record export failure");
                }
            }
            JobKind::GenerateSection { section_id, .. } => {
                error!(section = %section_id, %message, "section generation failed");
            }
            JobKind::GenerateDocument { document_id, .. } => {
                error!(document = %document_id, %message, "document generation failed");
            }
        }
    }
}

fn classify_ingest(e: IngestError) -> JobError {
    if e.is_transient() {
        JobError::Transient(e.to_string())
    } else {
        JobError::Terminal(e.to_string())
    }
}

fn classify_orchestrator(e: OrchestratorError) -> JobError {
    match &e {
        // Provider faults are worth retrying; everything else (missing
        // entities, lock conflicts, storage faults) fails fast and is
        // reported.
        OrchestratorError::Embedding(_) | OrchestratorError::Generation(_) => {
            JobError::Transient(e.to_string())
        }
        _ => JobError::Terminal(e.to_string()),
    }
}
