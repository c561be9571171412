//! Citation records, marker numbering, and grouped presentation.
//!
//! A generation round yields two runs of citations: knowledge-base sources
//! numbered from `[1]` and web-search sources continuing the sequence. The
//! runs are appended per generation event — no global dedup across events.
//! Deduplication happens only at the presentation layer, where citations are
//! grouped by source document and collapsed on (document, chunk ordinal,
//! section).

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::corpus::RetrievedChunk;
use crate::generation::search::SearchResult;
use crate::types::{CitationId, KbDocumentId, SectionId};

/// A citation produced during generation, not yet persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CitationDraft {
    /// Inline reference label, e.g. `[3]`.
    pub marker: String,
    pub reference_text: String,
    pub kb_document_id: Option<KbDocumentId>,
    pub external_url: Option<String>,
    pub confidence: Option<f32>,
}

/// A citation as stored against a section.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Citation {
    pub id: CitationId,
    pub section_id: SectionId,
    pub marker: String,
    pub reference_text: String,
    pub kb_document_id: Option<KbDocumentId>,
    pub external_url: Option<String>,
    pub confidence: Option<f32>,
    pub created_at: DateTime<Utc>,
}

/// One cited chunk inside a [`SourceGroup`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupedChunk {
    pub chunk_ordinal: i64,
    pub marker: String,
    pub section_id: SectionId,
    pub confidence: Option<f32>,
    pub citation_id: CitationId,
}

/// Citations of one source document, deduplicated and ordered for display.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceGroup {
    pub kb_document_id: KbDocumentId,
    pub document_title: String,
    pub chunks_used: Vec<GroupedChunk>,
}

/// Number retrieved chunks as knowledge-base sources starting at `[1]`.
///
/// Returns the context block handed to the model and the matching citation
/// drafts, one per chunk, in retrieval order.
pub fn number_kb_sources(chunks: &[RetrievedChunk]) -> (String, Vec<CitationDraft>) {
    let mut context = String::new();
    let mut drafts = Vec::with_capacity(chunks.len());
    if !chunks.is_empty() {
        context.push_str("\n\n--- Knowledge Base Sources ---\n");
    }
    for (idx, chunk) in chunks.iter().enumerate() {
        let marker = format!("[{}]", idx + 1);
        context.push_str(&format!("Source {marker}: {}\n", chunk.text));
        drafts.push(CitationDraft {
            marker,
            reference_text: format!(
                "Knowledge Base: {} (Chunk {})",
                chunk.document_title, chunk.ordinal
            ),
            kb_document_id: Some(chunk.document_id),
            external_url: None,
            confidence: Some(chunk.distance),
        });
    }
    (context, drafts)
}

/// Number web-search results continuing the marker sequence at `start`.
pub fn number_web_sources(results: &[SearchResult], start: usize) -> (String, Vec<CitationDraft>) {
    let mut context = String::from("\n\n--- Web Search Results ---\n");
    let mut drafts = Vec::with_capacity(results.len());
    for (offset, result) in results.iter().enumerate() {
        let marker = format!("[{}]", start + offset);
        context.push_str(&format!("Source {marker}: {}\n", result.content));
        drafts.push(CitationDraft {
            marker,
            reference_text: format!("Web: {} - {}", result.title, result.url),
            kb_document_id: None,
            external_url: Some(result.url.clone()),
            confidence: result.score,
        });
    }
    (context, drafts)
}

/// Merge the knowledge-base and web citation runs into one ordered list.
///
/// Markers were assigned in non-overlapping runs, so merging is pure
/// concatenation; this seam exists so the invariant is checked in one place.
pub fn merge_citations(
    kb: Vec<CitationDraft>,
    web: Vec<CitationDraft>,
) -> Vec<CitationDraft> {
    debug_assert!(
        web.first()
            .map(|c| c.marker == format!("[{}]", kb.len() + 1))
            .unwrap_or(true),
        "web markers must continue the knowledge-base sequence"
    );
    let mut merged = kb;
    merged.extend(web);
    merged
}

fn chunk_ordinal_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(Chunk (\d+)\)").expect("static regex"))
}

/// Chunk ordinal embedded in a knowledge-base reference text, `-1` if absent.
pub fn parse_chunk_ordinal(reference_text: &str) -> i64 {
    chunk_ordinal_regex()
        .captures(reference_text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(-1)
}

/// Group stored citations by source document for display.
///
/// Citations without a knowledge-base document (web sources) are skipped.
/// Within a document, duplicate (chunk ordinal, section) pairs collapse to
/// the first occurrence, keeping its marker and confidence. Groups are
/// sorted by document title and entries by (section id, chunk ordinal), so
/// repeated calls over unchanged input yield identical output.
pub fn group_by_source(
    citations: &[(Citation, Option<String>)],
) -> Vec<SourceGroup> {
    // document id -> (title, dedup key -> chunk)
    let mut groups: BTreeMap<KbDocumentId, (String, BTreeMap<(SectionId, i64), GroupedChunk>)> =
        BTreeMap::new();

    for (citation, title) in citations {
        let Some(kb_document_id) = citation.kb_document_id else {
            continue;
        };
        let ordinal = parse_chunk_ordinal(&citation.reference_text);
        let entry = groups.entry(kb_document_id).or_insert_with(|| {
            (
                title.clone().unwrap_or_default(),
                BTreeMap::new(),
            )
        });
        entry
            .1
            .entry((citation.section_id, ordinal))
            .or_insert_with(|| GroupedChunk {
                chunk_ordinal: ordinal,
                marker: citation.marker.clone(),
                section_id: citation.section_id,
                confidence: citation.confidence,
                citation_id: citation.id,
            });
    }

    let mut out: Vec<SourceGroup> = groups
        .into_iter()
        .map(|(kb_document_id, (document_title, chunks))| SourceGroup {
            kb_document_id,
            document_title,
            chunks_used: chunks.into_values().collect(),
        })
        .collect();
    out.sort_by(|a, b| a.document_title.cmp(&b.document_title));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kb_citation(
        section_id: SectionId,
        doc: KbDocumentId,
        marker: &str,
        ordinal: u32,
    ) -> (Citation, Option<String>) {
        (
            Citation {
                id: CitationId::new(),
                section_id,
                marker: marker.to_string(),
                reference_text: format!("Knowledge Base: Handbook (Chunk {ordinal})"),
                kb_document_id: Some(doc),
                external_url: None,
                confidence: Some(0.12),
                created_at: Utc::now(),
            },
            Some("Handbook".to_string()),
        )
    }

    #[test]
    fn web_markers_continue_after_kb_markers() {
        let chunks = vec![
            RetrievedChunk {
                chunk_id: crate::types::ChunkId::new(),
                document_id: KbDocumentId::new(),
                document_title: "Handbook".into(),
                ordinal: 0,
                text: "chunk text".into(),
                distance: 0.1,
            },
            RetrievedChunk {
                chunk_id: crate::types::ChunkId::new(),
                document_id: KbDocumentId::new(),
                document_title: "Handbook".into(),
                ordinal: 1,
                text: "more text".into(),
                distance: 0.2,
            },
        ];
        let (_, kb) = number_kb_sources(&chunks);
        let results = vec![SearchResult {
            title: "Site".into(),
            url: "https://example.com".into(),
            content: "web text".into(),
            score: Some(0.9),
        }];
        let (_, web) = number_web_sources(&results, kb.len() + 1);
        let merged = merge_citations(kb, web);
        let markers: Vec<&str> = merged.iter().map(|c| c.marker.as_str()).collect();
        assert_eq!(markers, vec!["[1]", "[2]", "[3]"]);
        assert!(merged[2].reference_text.starts_with("Web: Site"));
    }

    #[test]
    fn parses_chunk_ordinal_from_reference_text() {
        assert_eq!(
            parse_chunk_ordinal("Knowledge Base: Handbook (Chunk 7)"),
            7
        );
        assert_eq!(parse_chunk_ordinal("Web: Site - https://x"), -1);
    }

    #[test]
    fn grouping_dedupes_and_keeps_first_marker() {
        let section = SectionId::new();
        let doc = KbDocumentId::new();
        let rows = vec![
            kb_citation(section, doc, "[1]", 3),
            kb_citation(section, doc, "[4]", 3), // duplicate triple, later marker
            kb_citation(section, doc, "[2]", 1),
        ];
        let groups = group_by_source(&rows);
        assert_eq!(groups.len(), 1);
        let chunks = &groups[0].chunks_used;
        assert_eq!(chunks.len(), 2);
        // sorted by (section, ordinal); duplicate kept first marker
        assert_eq!(chunks[0].chunk_ordinal, 1);
        assert_eq!(chunks[1].chunk_ordinal, 3);
        assert_eq!(chunks[1].marker, "[1]");
    }

    #[test]
    fn grouping_is_stable_across_calls_and_sorted_by_title() {
        let section = SectionId::new();
        let doc_a = KbDocumentId::new();
        let doc_b = KbDocumentId::new();
        let rows = vec![
            (
                Citation {
                    id: CitationId::new(),
                    section_id: section,
                    marker: "[1]".into(),
                    reference_text: "Knowledge Base: Zebra report (Chunk 0)".into(),
                    kb_document_id: Some(doc_a),
                    external_url: None,
                    confidence: None,
                    created_at: Utc::now(),
                },
                Some("Zebra report".to_string()),
            ),
            (
                Citation {
                    id: CitationId::new(),
                    section_id: section,
                    marker: "[2]".into(),
                    reference_text: "Knowledge Base: Annual plan (Chunk 2)".into(),
                    kb_document_id: Some(doc_b),
                    external_url: None,
                    confidence: None,
                    created_at: Utc::now(),
                },
                Some("Annual plan".to_string()),
            ),
        ];
        let first = group_by_source(&rows);
        let second = group_by_source(&rows);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].document_title, "Annual plan");
        assert_eq!(first[1].document_title, "Zebra report");
        assert_eq!(
            first.iter().map(|g| &g.document_title).collect::<Vec<_>>(),
            second.iter().map(|g| &g.document_title).collect::<Vec<_>>()
        );
    }

    #[test]
    fn web_citations_are_excluded_from_grouping() {
        let section = SectionId::new();
        let rows = vec![(
            Citation {
                id: CitationId::new(),
                section_id: section,
                marker: "[3]".into(),
                reference_text: "Web: Site - https://example.com".into(),
                kb_document_id: None,
                external_url: Some("https://example.com".into()),
                confidence: None,
                created_at: Utc::now(),
            },
            None,
        )];
        assert!(group_by_source(&rows).is_empty());
    }
}
