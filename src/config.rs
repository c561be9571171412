//! Pipeline configuration.
//!
//! Defaults mirror a small production deployment; every knob can be
//! overridden from the environment (a `.env` file is honored via `dotenvy`)
//! or through the builder-style `with_*` methods.

use std::time::Duration;

/// Tunable parameters for chunking, retrieval, generation, and scheduling.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Token budget per chunk.
    pub chunk_tokens: usize,
    /// Token budget for the overlap seed carried into the next chunk.
    pub chunk_overlap: usize,
    /// Embedding vector dimension (must match the provider's model).
    pub embedding_dim: usize,
    /// Max texts per embedding request.
    pub embedding_batch_size: usize,
    /// Default number of chunks retrieved per generation.
    pub top_k: usize,
    /// Hard ceiling on `top_k`; larger requests are clamped.
    pub max_top_k: usize,
    /// Retry attempts for transient job failures.
    pub max_retries: u32,
    /// Base delay for exponential retry backoff.
    pub retry_base_delay: Duration,
    /// Lease duration for section locks taken by generation jobs.
    pub lock_ttl: Duration,
    /// Jobs running longer than this are swept to failed.
    pub stuck_job_timeout: Duration,
    /// Worker tasks draining the job queue.
    pub workers: usize,
    /// Database file for the authoring store ("sqlite::memory:" allowed).
    pub authoring_db_url: String,
    /// Database file for the corpus/vector store.
    pub corpus_db_path: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_tokens: 900,
            chunk_overlap: 150,
            embedding_dim: 1536,
            embedding_batch_size: 64,
            top_k: 6,
            max_top_k: 24,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            lock_ttl: Duration::from_secs(120),
            stuck_job_timeout: Duration::from_secs(30 * 60),
            workers: 4,
            authoring_db_url: "sqlite://draftsmith.db".to_string(),
            corpus_db_path: "draftsmith-corpus.db".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Resolve a config from the environment, falling back to defaults.
    ///
    /// Recognized variables: `DS_CHUNK_TOKENS`, `DS_CHUNK_OVERLAP`,
    /// `DS_EMBEDDING_DIM`, `DS_TOP_K`, `DS_MAX_TOP_K`, `DS_MAX_RETRIES`,
    /// `DS_WORKERS`, `DS_AUTHORING_DB_URL`, `DS_CORPUS_DB_PATH`.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut cfg = Self::default();
        if let Some(v) = env_parse("DS_CHUNK_TOKENS") {
            cfg.chunk_tokens = v;
        }
        if let Some(v) = env_parse("DS_CHUNK_OVERLAP") {
            cfg.chunk_overlap = v;
        }
        if let Some(v) = env_parse("DS_EMBEDDING_DIM") {
            cfg.embedding_dim = v;
        }
        if let Some(v) = env_parse("DS_TOP_K") {
            cfg.top_k = v;
        }
        if let Some(v) = env_parse("DS_MAX_TOP_K") {
            cfg.max_top_k = v;
        }
        if let Some(v) = env_parse("DS_MAX_RETRIES") {
            cfg.max_retries = v;
        }
        if let Some(v) = env_parse("DS_WORKERS") {
            cfg.workers = v;
        }
        if let Ok(v) = std::env::var("DS_AUTHORING_DB_URL") {
            cfg.authoring_db_url = v;
        }
        if let Ok(v) = std::env::var("DS_CORPUS_DB_PATH") {
            cfg.corpus_db_path = v;
        }
        cfg
    }

    #[must_use]
    pub fn with_chunking(mut self, chunk_tokens: usize, chunk_overlap: usize) -> Self {
        self.chunk_tokens = chunk_tokens;
        self.chunk_overlap = chunk_overlap;
        self
    }

    #[must_use]
    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.embedding_dim = dim;
        self
    }

    #[must_use]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay;
        self
    }

    #[must_use]
    pub fn with_databases(
        mut self,
        authoring_db_url: impl Into<String>,
        corpus_db_path: impl Into<String>,
    ) -> Self {
        self.authoring_db_url = authoring_db_url.into();
        self.corpus_db_path = corpus_db_path.into();
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
