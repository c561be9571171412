//! Generation orchestration: retrieval-grounded drafting committed into the
//! section version chain.
//!
//! A drafting round embeds the prompt, retrieves the nearest knowledge
//! chunks, and calls the model with the search tool offered. If the model
//! requests `tavily_search`, exactly one search runs, its results are
//! appended as numbered sources continuing the knowledge-base markers, and a
//! second model call produces the final content. The new version and the
//! merged citations commit in one transaction, under a job-owned section
//! lease so interactive edits and generation jobs cannot silently clobber
//! each other.

use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::client::{ChatMessage, GenerationClient, GenerationError, ToolCall};
use super::prompt;
use super::search::{WebSearchProvider, tavily_tool_spec};
use crate::citations::{CitationDraft, merge_citations, number_kb_sources, number_web_sources};
use crate::corpus::SearchScope;
use crate::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::retrieval::{RetrievalError, Retriever};
use crate::sections::{NewSectionVersion, SectionError, SectionStore, SectionVersion};
use crate::types::{DocumentId, SectionId};

#[derive(Debug, Error, Diagnostic)]
pub enum OrchestratorError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Section(#[from] SectionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Generation(#[from] GenerationError),
}

/// Output of one drafting round, before persistence.
struct DraftOutcome {
    content: String,
    citations: Vec<CitationDraft>,
}

pub struct GenerationOrchestrator {
    sections: Arc<SectionStore>,
    retriever: Retriever,
    embeddings: Arc<dyn EmbeddingProvider>,
    client: Arc<dyn GenerationClient>,
    search: Arc<dyn WebSearchProvider>,
    top_k: usize,
    lock_ttl: Duration,
}

impl GenerationOrchestrator {
    pub fn new(
        sections: Arc<SectionStore>,
        retriever: Retriever,
        embeddings: Arc<dyn EmbeddingProvider>,
        client: Arc<dyn GenerationClient>,
        search: Arc<dyn WebSearchProvider>,
        top_k: usize,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            sections,
            retriever,
            embeddings,
            client,
            search,
            top_k,
            lock_ttl,
        }
    }

    /// Regenerate a single section with full sibling context.
    #[instrument(skip(self, instruction))]
    pub async fn generate_section(
        &self,
        section_id: SectionId,
        instruction: Option<&str>,
    ) -> Result<SectionVersion, OrchestratorError> {
        let section = self.sections.get_section(section_id).await?;
        let document = self.sections.get_document(section.document_id).await?;

        // Sibling context: current content of every other section, so the
        // regenerated text does not drift from the rest of the draft.
        let mut siblings = Vec::new();
        for other in self
            .sections
            .sections_for_document(document.id)
            .await?
            .into_iter()
            .filter(|s| s.id != section.id)
        {
            let content = self.sections.read_content(other.id).await?;
            if !content.is_empty() {
                siblings.push((other.title, content));
            }
        }

        let prompt_text =
            prompt::section_prompt(&document.title, &section.title, &siblings, instruction);
        let scope = SearchScope {
            org_id: document.org_id.clone(),
            document_ids: None,
        };
        let outcome = self.draft(&prompt_text, &scope).await?;

        let version = self
            .commit_under_lock(section.id, outcome, "ai-generation")
            .await?;
        info!(section = %section.id, version = %version.id, "section generated");
        Ok(version)
    }

    /// Generate every section of a document sequentially.
    ///
    /// Section *i*'s prompt sees only the committed content of sections
    /// 1..i-1; each section commits before the next prompt is assembled.
    /// A failure aborts the remainder but earlier sections stay committed
    /// (per-section transaction boundary).
    #[instrument(skip(self, instruction))]
    pub async fn generate_document(
        &self,
        document_id: DocumentId,
        instruction: Option<&str>,
    ) -> Result<Vec<SectionVersion>, OrchestratorError> {
        let document = self.sections.get_document(document_id).await?;
        let ordered = self.sections.sections_for_document(document_id).await?;

        let mut prior = String::new();
        let mut versions = Vec::with_capacity(ordered.len());
        for section in ordered {
            let prompt_text =
                prompt::sequential_prompt(&document.title, &section.title, &prior, instruction);
            let scope = SearchScope {
                org_id: document.org_id.clone(),
                document_ids: None,
            };
            let outcome = self.draft(&prompt_text, &scope).await?;
            let content = outcome.content.clone();
            let version = self
                .commit_under_lock(section.id, outcome, "ai-generation")
                .await?;
            prior.push_str(&prompt::prior_context_entry(&section.title, &content));
            versions.push(version);
        }
        info!(document = %document_id, sections = versions.len(), "document generated");
        Ok(versions)
    }

    /// One retrieval-grounded drafting round with at most one search call.
    async fn draft(
        &self,
        prompt_text: &str,
        scope: &SearchScope,
    ) -> Result<DraftOutcome, OrchestratorError> {
        let embed_input = [prompt_text.to_string()];
        let query = self
            .embeddings
            .embed(&embed_input)
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();
        let hits = self.retriever.search(&query, scope, self.top_k).await?;
        let (kb_context, kb_citations) = number_kb_sources(&hits);

        let mut messages = vec![
            ChatMessage::system(prompt::SYSTEM_PROMPT),
            ChatMessage::user(format!("{prompt_text}{kb_context}")),
        ];
        let completion = self
            .client
            .complete(&messages, &[tavily_tool_spec()])
            .await?;

        let Some(call) = completion.tool_calls.first().cloned() else {
            return Ok(DraftOutcome {
                content: completion.content,
                citations: kb_citations,
            });
        };

        let (tool_output, web_citations) = self.run_search_tool(&call, kb_citations.len()).await;
        messages.push(ChatMessage::assistant_tool_calls(
            completion.content,
            vec![call.clone()],
        ));
        messages.push(ChatMessage::tool(call.id.clone(), tool_output));

        let final_completion = self.client.complete(&messages, &[]).await?;
        Ok(DraftOutcome {
            content: final_completion.content,
            citations: merge_citations(kb_citations, web_citations),
        })
    }

    /// Execute the requested search tool call.
    ///
    /// Failures are not fatal: the error text goes back to the model as the
    /// tool output and drafting continues without web sources.
    async fn run_search_tool(
        &self,
        call: &ToolCall,
        kb_citation_count: usize,
    ) -> (String, Vec<CitationDraft>) {
        if call.name != "tavily_search" {
            warn!(tool = %call.name, "model requested unknown tool");
            return (format!("Unknown tool: {}", call.name), Vec::new());
        }
        let Some(query) = call.arguments.get("query").and_then(|v| v.as_str()) else {
            return (
                "Error performing search: missing 'query' argument".to_string(),
                Vec::new(),
            );
        };
        match self.search.search(query).await {
            Ok(results) => number_web_sources(&results, kb_citation_count + 1),
            Err(e) => {
                warn!(error = %e, "search tool failed, continuing without web sources");
                (format!("Error performing search: {e}"), Vec::new())
            }
        }
    }

    /// Commit a drafted version and its citations under a job-owned lease.
    ///
    /// A conflicting unexpired lease surfaces as `LockConflict` and the
    /// draft is discarded uncommitted.
    async fn commit_under_lock(
        &self,
        section_id: SectionId,
        outcome: DraftOutcome,
        owner: &str,
    ) -> Result<SectionVersion, OrchestratorError> {
        self.sections
            .acquire_lock(section_id, owner, Some(self.lock_ttl))
            .await?;
        let result = self
            .sections
            .create_version_with_citations(
                section_id,
                NewSectionVersion::generated(outcome.content, owner),
                outcome.citations,
            )
            .await;
        if let Err(e) = self.sections.release_lock_owned(section_id, owner).await {
            warn!(section = %section_id, error = %e, "failed to release generation lease");
        }
        Ok(result?)
    }
}
