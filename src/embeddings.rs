//! Embedding provider seam.
//!
//! The pipeline only ever talks to [`EmbeddingProvider`]; the concrete
//! implementations are an OpenAI-compatible HTTP client and a deterministic
//! mock for tests and offline runs. Providers batch internally so callers can
//! hand over an arbitrary number of texts and still respect request limits.

use async_trait::async_trait;
use miette::Diagnostic;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum EmbeddingError {
    /// Transport or provider-side failure; retryable by the scheduler.
    #[error("embedding provider error: {0}")]
    #[diagnostic(code(draftsmith::embeddings::provider))]
    Provider(String),

    /// The provider returned a different number of vectors than requested.
    #[error("embedding count mismatch: requested {requested}, received {received}")]
    #[diagnostic(code(draftsmith::embeddings::count_mismatch))]
    CountMismatch { requested: usize, received: usize },

    /// A returned vector does not match the configured dimension.
    #[error("embedding dimension mismatch: expected {expected}, received {received}")]
    #[diagnostic(code(draftsmith::embeddings::dimension_mismatch))]
    DimensionMismatch { expected: usize, received: usize },
}

/// Maps text to fixed-dimension vectors, order-preserving.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed `texts`, returning one vector per input in the same order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Dimension of the vectors this provider produces.
    fn dimension(&self) -> usize;
}

/// OpenAI-compatible `/embeddings` client.
pub struct OpenAiEmbeddings {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
    batch_size: usize,
}

impl OpenAiEmbeddings {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimension: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            dimension,
            batch_size: batch_size.max(1),
        }
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        #[derive(Deserialize)]
        struct Response {
            data: Vec<Item>,
        }
        #[derive(Deserialize)]
        struct Item {
            embedding: Vec<f32>,
        }

        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": batch }))
            .send()
            .await
            .map_err(|e| EmbeddingError::Provider(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Provider(format!(
                "{status}: {body}"
            )));
        }

        let parsed: Response = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Provider(e.to_string()))?;
        Ok(parsed.data.into_iter().map(|i| i.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = self.embed_batch(batch).await?;
            if vectors.len() != batch.len() {
                return Err(EmbeddingError::CountMismatch {
                    requested: batch.len(),
                    received: vectors.len(),
                });
            }
            for v in &vectors {
                if v.len() != self.dimension {
                    return Err(EmbeddingError::DimensionMismatch {
                        expected: self.dimension,
                        received: v.len(),
                    });
                }
            }
            out.extend(vectors);
        }
        Ok(out)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic embedding provider for tests and offline pipelines.
///
/// Vectors are seeded from a hash of the input text and L2-normalized, so
/// identical texts always embed identically and similar runs are
/// reproducible without network access.
pub struct MockEmbeddingProvider {
    dimension: usize,
}

impl MockEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        // FNV-1a seed, then a splitmix-style stream per component.
        let mut seed: u64 = 0xcbf2_9ce4_8422_2325;
        for b in text.as_bytes() {
            seed ^= u64::from(*b);
            seed = seed.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let mut state = seed;
        let mut v: Vec<f32> = (0..self.dimension)
            .map(|_| {
                state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
                let mut z = state;
                z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
                z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
                z ^= z >> 31;
                // map to [-1, 1)
                (z as f64 / u64::MAX as f64 * 2.0 - 1.0) as f32
            })
            .collect();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_is_deterministic_and_normalized() {
        let provider = MockEmbeddingProvider::new(32);
        let a = provider.embed(&["hello world".to_string()]).await.unwrap();
        let b = provider.embed(&["hello world".to_string()]).await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn mock_preserves_order_and_distinguishes_texts() {
        let provider = MockEmbeddingProvider::new(16);
        let texts = vec!["one".to_string(), "two".to_string(), "one".to_string()];
        let vectors = provider.embed(&texts).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0], vectors[2]);
        assert_ne!(vectors[0], vectors[1]);
    }
}
