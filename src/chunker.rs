//! Token-aware text chunking with paragraph-granular overlap.
//!
//! Splits source text into newline-delimited paragraphs and greedily packs
//! them into chunks bounded by a token budget. When a chunk closes, the next
//! one is seeded with a trailing slice of the closed chunk so adjacent chunks
//! share context; the slice is chosen by walking paragraphs backward until
//! the overlap budget would be exceeded.
//!
//! Token counts come from the cl100k_base subword vocabulary via
//! `tiktoken-rs`, so counts are deterministic for a given tokenizer version
//! and line up with what the embedding provider bills.

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;
use tiktoken_rs::CoreBPE;

#[derive(Debug, Error, Diagnostic)]
pub enum ChunkerError {
    #[error("tokenizer initialization failed: {0}")]
    #[diagnostic(code(draftsmith::chunker::tokenizer))]
    Tokenizer(String),
}

/// Paragraph-greedy chunker with a fixed token budget and overlap.
#[derive(Clone)]
pub struct Chunker {
    bpe: Arc<CoreBPE>,
    max_tokens: usize,
    overlap_tokens: usize,
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("max_tokens", &self.max_tokens)
            .field("overlap_tokens", &self.overlap_tokens)
            .finish()
    }
}

impl Chunker {
    /// Build a chunker over the cl100k_base vocabulary.
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Result<Self, ChunkerError> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| ChunkerError::Tokenizer(e.to_string()))?;
        Ok(Self {
            bpe: Arc::new(bpe),
            max_tokens,
            overlap_tokens,
        })
    }

    /// Number of subword tokens in `text`.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    /// Split `text` into overlapping chunks.
    ///
    /// Empty or whitespace-only input yields an empty vec — callers treat
    /// that as "nothing to ingest", not an error. A chunk always receives at
    /// least one paragraph, so a single paragraph larger than the budget
    /// becomes a chunk of its own rather than being dropped.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        let paragraphs: Vec<&str> = text
            .split('\n')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();

        let mut chunks: Vec<String> = Vec::new();
        // Current chunk paragraphs with their counted token sizes; the seed
        // carried over from the previous chunk counts as one paragraph.
        let mut current: Vec<(String, usize)> = Vec::new();
        let mut current_tokens = 0usize;

        for p in paragraphs {
            let ptokens = self.count_tokens(p);
            if current_tokens + ptokens <= self.max_tokens || current.is_empty() {
                current.push((p.to_string(), ptokens));
                current_tokens += ptokens;
                continue;
            }

            chunks.push(join_paragraphs(&current));

            // Seed the next chunk with trailing paragraphs of the one just
            // closed, walking backward until the overlap budget would be
            // exceeded. The seed's token count is the sum of its paragraphs'
            // counted sizes, not a recount of the joined text.
            let mut seed: Vec<&(String, usize)> = Vec::new();
            let mut seed_tokens = 0usize;
            if self.overlap_tokens > 0 {
                for entry in current.iter().rev() {
                    if seed_tokens + entry.1 > self.overlap_tokens {
                        break;
                    }
                    seed_tokens += entry.1;
                    seed.push(entry);
                }
            }
            let next = if seed.is_empty() {
                Vec::new()
            } else {
                let text = seed
                    .iter()
                    .rev()
                    .map(|(t, _)| t.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                vec![(text, seed_tokens)]
            };
            current = next;
            current_tokens = seed_tokens;
            current.push((p.to_string(), ptokens));
            current_tokens += ptokens;
        }

        if !current.is_empty() {
            chunks.push(join_paragraphs(&current));
        }
        chunks
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn overlap_tokens(&self) -> usize {
        self.overlap_tokens
    }
}

fn join_paragraphs(paragraphs: &[(String, usize)]) -> String {
    paragraphs
        .iter()
        .map(|(t, _)| t.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(max_tokens: usize, overlap: usize) -> Chunker {
        Chunker::new(max_tokens, overlap).unwrap()
    }

    /// A word that cl100k_base encodes as exactly one token, repeated.
    fn para(tokens: usize) -> String {
        vec!["alpha"; tokens].join(" ")
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let c = chunker(10, 3);
        assert!(c.chunk("").is_empty());
        assert!(c.chunk("\n\n   \n").is_empty());
    }

    #[test]
    fn single_paragraph_over_budget_is_kept_whole() {
        let c = chunker(4, 0);
        let big = para(12);
        let chunks = c.chunk(&big);
        assert_eq!(chunks, vec![big]);
    }

    #[test]
    fn packs_paragraphs_up_to_budget() {
        let c = chunker(10, 0);
        let text = format!("{}\n{}\n{}", para(4), para(4), para(4));
        let chunks = c.chunk(&text);
        // 4 + 4 fits, third paragraph overflows into a new chunk
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], format!("{}\n{}", para(4), para(4)));
        assert_eq!(chunks[1], para(4));
    }

    #[test]
    fn overlap_seed_walks_backward_within_budget() {
        let c = chunker(10, 5);
        let text = format!("{}\n{}\n{}", para(4), para(4), para(4));
        let chunks = c.chunk(&text);
        // Seed takes only the last paragraph (4 <= 5; adding the one before
        // would make 8 > 5), so chunk 2 = seed + overflowing paragraph.
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], format!("{}\n{}", para(4), para(4)));
    }

    #[test]
    fn overlap_smaller_than_any_paragraph_seeds_nothing() {
        // The worked example: max 10, overlap 3, four 4-token paragraphs.
        // First chunk holds paragraphs 1-2; paragraph 2 (4 tokens) exceeds
        // the 3-token overlap budget so chunk 2 starts fresh.
        let c = chunker(10, 3);
        let text = format!("{}\n{}\n{}\n{}", para(4), para(4), para(4), para(4));
        let chunks = c.chunk(&text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], format!("{}\n{}", para(4), para(4)));
        assert_eq!(chunks[1], format!("{}\n{}", para(4), para(4)));
    }

    #[test]
    fn no_paragraph_is_dropped_or_reordered() {
        let c = chunker(6, 0);
        let paragraphs: Vec<String> = (0..7).map(|i| format!("paragraph number {i}")).collect();
        let text = paragraphs.join("\n");
        let chunks = c.chunk(&text);
        // With zero overlap, concatenating chunk paragraphs reconstructs the
        // original paragraph sequence exactly.
        let rejoined: Vec<String> = chunks
            .iter()
            .flat_map(|c| c.split('\n').map(str::to_string))
            .collect();
        assert_eq!(rejoined, paragraphs);
    }

    #[test]
    fn chunks_respect_budget_unless_single_paragraph() {
        let c = chunker(8, 2);
        let text = format!("{}\n{}\n{}\n{}", para(3), para(3), para(9), para(2));
        for chunk in c.chunk(&text) {
            let tokens = c.count_tokens(&chunk);
            let paragraph_count = chunk.split('\n').count();
            assert!(
                tokens <= 8 || paragraph_count == 1,
                "over-budget chunk must be a single paragraph: {tokens} tokens, {paragraph_count} paragraphs"
            );
        }
    }
}
