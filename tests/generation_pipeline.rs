//! End-to-end pipeline tests with mock providers: ingestion, grounded
//! generation with tool use, sequential whole-document drafting, citation
//! provenance, export assembly, and scheduler failure handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use draftsmith::config::PipelineConfig;
use draftsmith::corpus::NewKnowledgeDocument;
use draftsmith::embeddings::{EmbeddingError, EmbeddingProvider, MockEmbeddingProvider};
use draftsmith::generation::{
    Completion, MockGenerationClient, MockWebSearch, SearchResult, ToolCall,
};
use draftsmith::ingestion::IngestSource;
use draftsmith::jobs::{JobKind, JobStatus};
use draftsmith::service::{AuthoringService, TemplateSpec};
use draftsmith::types::DocStatus;

const WAIT: Duration = Duration::from_secs(10);

fn test_config(dir: &tempfile::TempDir) -> PipelineConfig {
    PipelineConfig::default()
        .with_chunking(50, 0)
        .with_databases(
            format!("sqlite://{}", dir.path().join("authoring.db").display()),
            dir.path().join("corpus.db").display().to_string(),
        )
        .with_retry(3, Duration::from_millis(5))
        .with_workers(2)
}

struct Harness {
    service: AuthoringService,
    generation: Arc<MockGenerationClient>,
    search: Arc<MockWebSearch>,
    _dir: tempfile::TempDir,
}

async fn harness_with(
    embeddings: Arc<dyn EmbeddingProvider>,
    search: Arc<MockWebSearch>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let generation = Arc::new(MockGenerationClient::new());
    let service = AuthoringService::builder()
        .config(test_config(&dir))
        .embeddings(embeddings)
        .generation_client(generation.clone())
        .web_search(search.clone())
        .build()
        .await
        .unwrap();
    Harness {
        service,
        generation,
        search,
        _dir: dir,
    }
}

async fn harness() -> Harness {
    harness_with(
        Arc::new(MockEmbeddingProvider::new(64)),
        Arc::new(MockWebSearch::new()),
    )
    .await
}

async fn seed_corpus(service: &AuthoringService, title: &str, text: &str) {
    let (_, job) = service
        .upload_knowledge_document(
            NewKnowledgeDocument {
                org_id: Some("org-1".into()),
                title: title.into(),
                ..Default::default()
            },
            IngestSource::Text {
                text: text.into(),
                page_or_row_count: None,
            },
        )
        .await
        .unwrap();
    let job = service.wait_for_job(job, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.error);
}

#[tokio::test]
async fn section_generation_grounds_in_corpus_and_merges_web_citations() {
    let search = Arc::new(MockWebSearch::with_results(vec![SearchResult {
        title: "County statistics".into(),
        url: "https://example.com/stats".into(),
        content: "recent county data".into(),
        score: Some(0.9),
    }]));
    let h = harness_with(Arc::new(MockEmbeddingProvider::new(64)), search).await;

    seed_corpus(&h.service, "Water handbook", "boreholes supply rural water").await;

    let template = TemplateSpec::new("note")
        .with_section("background", "Background")
        .with_section("costing", "Costing");
    let (document, sections) = h
        .service
        .create_document("Water project", Some("org-1".into()), &template)
        .await
        .unwrap();

    h.generation.push(Completion::tool_request(ToolCall {
        id: "call_1".into(),
        name: "tavily_search".into(),
        arguments: json!({"query": "county statistics"}),
    }));
    h.generation
        .push(Completion::text("Grounded background [1][2]."));

    let job = h
        .service
        .queue_section_generation(sections[0].id, Some("Draft the background".into()));
    let job = h.service.wait_for_job(job, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.error);

    assert_eq!(
        h.service.read_section(sections[0].id).await.unwrap(),
        "Grounded background [1][2]."
    );

    // exactly one search call was executed
    assert_eq!(h.search.queries(), vec!["county statistics".to_string()]);

    // knowledge-base markers start at [1]; the web citation continues the run
    let citations = h.service.section_citations(sections[0].id).await.unwrap();
    assert!(!citations.is_empty());
    let kb: Vec<_> = citations.iter().filter(|c| c.kb_document_id.is_some()).collect();
    let web: Vec<_> = citations.iter().filter(|c| c.external_url.is_some()).collect();
    assert_eq!(kb[0].marker, "[1]");
    assert_eq!(web.len(), 1);
    assert_eq!(web[0].marker, format!("[{}]", kb.len() + 1));
    assert!(web[0].reference_text.starts_with("Web: County statistics"));

    // first model call carried the numbered knowledge-base sources; second
    // carried the tool result
    let captured = h.generation.captured();
    assert_eq!(captured.len(), 2);
    assert!(captured[0][1].content.contains("--- Knowledge Base Sources ---"));
    assert!(captured[0][1].content.contains("boreholes supply rural water"));
    let tool_turn = captured[1].iter().find(|m| m.role == "tool").unwrap();
    assert!(tool_turn.content.contains("--- Web Search Results ---"));

    // grouped view exposes only the knowledge-base source, stably
    let groups = h.service.grouped_citations(document.id).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].document_title, "Water handbook");
    let again = h.service.grouped_citations(document.id).await.unwrap();
    assert_eq!(groups[0].chunks_used, again[0].chunks_used);
}

#[tokio::test]
async fn failed_search_tool_is_surfaced_to_model_not_fatal() {
    let h = harness_with(
        Arc::new(MockEmbeddingProvider::new(64)),
        Arc::new(MockWebSearch::failing()),
    )
    .await;
    seed_corpus(&h.service, "Handbook", "relevant source text").await;

    let template = TemplateSpec::new("note").with_section("body", "Body");
    let (_, sections) = h
        .service
        .create_document("Doc", Some("org-1".into()), &template)
        .await
        .unwrap();

    h.generation.push(Completion::tool_request(ToolCall {
        id: "call_1".into(),
        name: "tavily_search".into(),
        arguments: json!({"query": "anything"}),
    }));
    h.generation.push(Completion::text("Content without web sources."));

    let job = h.service.queue_section_generation(sections[0].id, None);
    let job = h.service.wait_for_job(job, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.error);

    let captured = h.generation.captured();
    let tool_turn = captured[1].iter().find(|m| m.role == "tool").unwrap();
    assert!(tool_turn.content.contains("Error performing search"));

    // no web citation was recorded
    let citations = h.service.section_citations(sections[0].id).await.unwrap();
    assert!(citations.iter().all(|c| c.external_url.is_none()));
}

#[tokio::test]
async fn whole_document_generation_accumulates_context_left_to_right() {
    let h = harness().await;
    seed_corpus(&h.service, "Handbook", "general source material").await;

    let template = TemplateSpec::new("note")
        .with_section("intro", "Introduction")
        .with_section("approach", "Approach")
        .with_section("costing", "Costing");
    let (document, sections) = h
        .service
        .create_document("Sequential draft", Some("org-1".into()), &template)
        .await
        .unwrap();

    h.generation.push(Completion::text("Generated intro text."));
    h.generation.push(Completion::text("Generated approach text."));
    h.generation.push(Completion::text("Generated costing text."));

    let job = h
        .service
        .queue_document_generation(document.id, None)
        .await
        .unwrap();
    let job = h.service.wait_for_job(job, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.error);

    for (section, expected) in sections.iter().zip([
        "Generated intro text.",
        "Generated approach text.",
        "Generated costing text.",
    ]) {
        assert_eq!(h.service.read_section(section.id).await.unwrap(), expected);
    }

    let captured = h.generation.captured();
    assert_eq!(captured.len(), 3);

    // section 1 sees no prior context
    assert!(captured[0][1].content.contains("None yet"));

    // section 2 sees exactly section 1's committed text, and nothing of
    // section 3 — not even its title
    let second_prompt = &captured[1][1].content;
    assert!(second_prompt.contains("Generated intro text."));
    assert!(second_prompt.contains("## Introduction"));
    assert!(!second_prompt.contains("Costing"));

    // section 3 sees both predecessors in order
    let third_prompt = &captured[2][1].content;
    assert!(third_prompt.contains("Generated intro text."));
    assert!(third_prompt.contains("Generated approach text."));
}

#[tokio::test]
async fn document_generation_requires_sections() {
    let h = harness().await;
    let (document, _) = h
        .service
        .create_document("Empty", Some("org-1".into()), &TemplateSpec::new("empty"))
        .await
        .unwrap();
    assert!(
        h.service
            .queue_document_generation(document.id, None)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn export_assembles_sections_and_reference_appendix() {
    let h = harness().await;
    seed_corpus(&h.service, "Handbook", "reference source text").await;

    let template = TemplateSpec::new("note").with_section("body", "Body");
    let (document, sections) = h
        .service
        .create_document("Exported doc", Some("org-1".into()), &template)
        .await
        .unwrap();

    h.generation.push(Completion::text("Body content [1]."));
    let job = h.service.queue_section_generation(sections[0].id, None);
    assert_eq!(
        h.service.wait_for_job(job, WAIT).await.unwrap().status,
        JobStatus::Succeeded
    );

    let (export, job) = h
        .service
        .request_export(document.id, draftsmith::sections::ExportFormat::Docx)
        .await
        .unwrap();
    let job = h.service.wait_for_job(job, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.error);

    let export = h.service.export(export.id).await.unwrap().unwrap();
    let artifact = export.artifact.unwrap();
    assert!(artifact.contains("# Exported doc"));
    assert!(artifact.contains("## Body"));
    assert!(artifact.contains("Body content [1]."));
    assert!(artifact.contains("## References"));
    assert!(artifact.contains("Handbook"));
}

#[tokio::test]
async fn finalize_publishes_document_back_into_corpus() {
    let h = harness().await;

    let template = TemplateSpec::new("note").with_section("body", "Body");
    let (document, sections) = h
        .service
        .create_document("Finalized doc", Some("org-1".into()), &template)
        .await
        .unwrap();
    h.service
        .edit_section(sections[0].id, "Final body text.".into(), "alice", None)
        .await
        .unwrap();

    let (finalized, job) = h.service.finalize_document(document.id, Some(true)).await.unwrap();
    assert_eq!(finalized.success, Some(true));

    let job = h.service.wait_for_job(job, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.error);

    let JobKind::PublishToCorpus { kb_document_id, .. } = job.kind else {
        panic!("expected publish job");
    };
    let kb_doc = h
        .service
        .knowledge_document(kb_document_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(kb_doc.status, DocStatus::Ready);
    assert_eq!(kb_doc.title, "Finalized doc");
}

#[tokio::test]
async fn generation_does_not_clobber_a_held_lock() {
    use draftsmith::corpus::CorpusStore;
    use draftsmith::generation::{GenerationOrchestrator, OrchestratorError};
    use draftsmith::retrieval::Retriever;
    use draftsmith::sections::{NewDocument, SectionError, SectionStore};

    let dir = tempfile::tempdir().unwrap();
    let sections = Arc::new(
        SectionStore::connect(&format!(
            "sqlite://{}",
            dir.path().join("authoring.db").display()
        ))
        .await
        .unwrap(),
    );
    let corpus = Arc::new(
        CorpusStore::open(dir.path().join("corpus.db"))
            .await
            .unwrap(),
    );
    let client = Arc::new(MockGenerationClient::new());
    client.push(Completion::text("draft that must not commit"));
    let orchestrator = GenerationOrchestrator::new(
        Arc::clone(&sections),
        Retriever::new(corpus, 24),
        Arc::new(MockEmbeddingProvider::new(64)),
        client,
        Arc::new(MockWebSearch::new()),
        6,
        Duration::from_secs(60),
    );

    let document = sections
        .create_document(NewDocument {
            title: "Locked".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let section = sections
        .add_section(document.id, "body", "Body", 0)
        .await
        .unwrap();
    sections
        .acquire_lock(section.id, "alice", Some(Duration::from_secs(300)))
        .await
        .unwrap();

    let err = orchestrator
        .generate_section(section.id, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Section(SectionError::LockConflict { .. })
    ));
    // the drafted content was discarded uncommitted
    assert_eq!(sections.read_content(section.id).await.unwrap(), "");
    assert!(sections.list_versions(section.id).await.unwrap().is_empty());
}

/// Embedding provider that fails a fixed number of calls before recovering.
struct FlakyEmbeddings {
    inner: MockEmbeddingProvider,
    failures: AtomicU32,
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
            (f > 0).then(|| f - 1)
        })
        .is_ok()
        {
            return Err(EmbeddingError::Provider("rate limited".into()));
        }
        self.inner.embed(texts).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

#[tokio::test]
async fn transient_embedding_failures_are_retried_with_backoff() {
    let h = harness_with(
        Arc::new(FlakyEmbeddings {
            inner: MockEmbeddingProvider::new(64),
            failures: AtomicU32::new(2),
        }),
        Arc::new(MockWebSearch::new()),
    )
    .await;

    let (doc, job) = h
        .service
        .upload_knowledge_document(
            NewKnowledgeDocument {
                org_id: Some("org-1".into()),
                title: "Flaky".into(),
                ..Default::default()
            },
            IngestSource::Text {
                text: "some source text".into(),
                page_or_row_count: None,
            },
        )
        .await
        .unwrap();
    let job = h.service.wait_for_job(job, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.error);
    assert_eq!(job.attempts, 3);

    let kb_doc = h.service.knowledge_document(doc.id).await.unwrap().unwrap();
    assert_eq!(kb_doc.status, DocStatus::Ready);
}

#[tokio::test]
async fn exhausted_retries_mark_the_document_failed_with_message() {
    let h = harness_with(
        Arc::new(FlakyEmbeddings {
            inner: MockEmbeddingProvider::new(64),
            failures: AtomicU32::new(u32::MAX),
        }),
        Arc::new(MockWebSearch::new()),
    )
    .await;

    let (doc, job) = h
        .service
        .upload_knowledge_document(
            NewKnowledgeDocument {
                org_id: Some("org-1".into()),
                title: "Doomed".into(),
                ..Default::default()
            },
            IngestSource::Text {
                text: "some source text".into(),
                page_or_row_count: None,
            },
        )
        .await
        .unwrap();
    let job = h.service.wait_for_job(job, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);

    let kb_doc = h.service.knowledge_document(doc.id).await.unwrap().unwrap();
    assert_eq!(kb_doc.status, DocStatus::Failed);
    let message = kb_doc.error_message.unwrap();
    assert!(message.contains("retries exhausted"), "{message}");
}
