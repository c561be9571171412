//! Similarity retrieval over the knowledge corpus.
//!
//! Thin policy layer on top of [`CorpusStore::search_similar`]: validates
//! and clamps `top_k`, and pins down the result contract — cosine distance
//! ascending (lower = more similar), ties broken by chunk ordinal then
//! document id, and a corpus smaller than `top_k` returns everything it has.

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;
use tracing::debug;

use crate::corpus::{CorpusError, CorpusStore, RetrievedChunk, SearchScope};

#[derive(Debug, Error, Diagnostic)]
pub enum RetrievalError {
    #[error("top_k must be a positive integer")]
    #[diagnostic(code(draftsmith::retrieval::invalid_top_k))]
    InvalidTopK,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Corpus(#[from] CorpusError),
}

#[derive(Clone, Debug)]
pub struct Retriever {
    corpus: Arc<CorpusStore>,
    max_top_k: usize,
}

impl Retriever {
    pub fn new(corpus: Arc<CorpusStore>, max_top_k: usize) -> Self {
        Self {
            corpus,
            max_top_k: max_top_k.max(1),
        }
    }

    /// Return up to `top_k` nearest chunks for `query_vector` within `scope`.
    ///
    /// `top_k` greater than [`max_top_k`](Self::new) is clamped rather than
    /// rejected; zero is an error.
    pub async fn search(
        &self,
        query_vector: &[f32],
        scope: &SearchScope,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        if top_k == 0 {
            return Err(RetrievalError::InvalidTopK);
        }
        let limit = top_k.min(self.max_top_k);
        let hits = self.corpus.search_similar(query_vector, scope, limit).await?;
        debug!(
            requested = top_k,
            limit,
            returned = hits.len(),
            "similarity search"
        );
        debug_assert!(
            hits.windows(2).all(|w| w[0].distance <= w[1].distance),
            "retrieval results must be ordered by non-decreasing distance"
        );
        Ok(hits)
    }
}
