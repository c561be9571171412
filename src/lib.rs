//! # Draftsmith: retrieval-grounded document authoring
//!
//! Draftsmith is the core pipeline behind AI-assisted drafting of structured
//! documents: source material is ingested into a searchable knowledge
//! corpus, relevant passages are retrieved for a requested section, a
//! language model drafts content grounded in those passages (optionally
//! augmented by one web search per round), and every section keeps an
//! append-only version history with citation provenance.
//!
//! ## Core Concepts
//!
//! - **Chunks**: token-bounded, overlapping slices of a source document,
//!   embedded as vectors for similarity retrieval
//! - **Version chain**: the append-only sequence of content snapshots for a
//!   section; "current" is a movable pointer, undo never deletes history
//! - **Leases**: soft, expiring section locks serializing generation jobs
//!   and interactive edits
//! - **Jobs**: ingestion, generation, publication, and export run as queued
//!   units of work with bounded retries and backoff
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use draftsmith::config::PipelineConfig;
//! use draftsmith::embeddings::MockEmbeddingProvider;
//! use draftsmith::generation::{MockGenerationClient, MockWebSearch};
//! use draftsmith::service::{AuthoringService, TemplateSpec};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let service = AuthoringService::builder()
//!     .config(PipelineConfig::from_env())
//!     .embeddings(Arc::new(MockEmbeddingProvider::new(1536)))
//!     .generation_client(Arc::new(MockGenerationClient::new()))
//!     .web_search(Arc::new(MockWebSearch::new()))
//!     .build()
//!     .await?;
//!
//! let template = TemplateSpec::new("concept-note")
//!     .with_section("background", "Background")
//!     .with_section("budget", "Budget");
//! let (document, _sections) = service
//!     .create_document("Water project", None, &template)
//!     .await?;
//! let job = service.queue_document_generation(document.id, None).await?;
//! println!("generation queued: {job}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`chunker`] - token-aware paragraph chunking with overlap
//! - [`embeddings`] - embedding provider seam (OpenAI-compatible + mock)
//! - [`corpus`] - knowledge documents and vector chunk storage
//! - [`retrieval`] - scoped nearest-neighbor retrieval policy
//! - [`citations`] - marker numbering, merging, grouped presentation
//! - [`sections`] - documents, section version chains, and locks
//! - [`generation`] - model/search clients and the generation orchestrator
//! - [`ingestion`] - the extract → chunk → embed → store pipeline
//! - [`jobs`] - job model and the retrying worker-pool scheduler
//! - [`service`] - high-level facade wiring everything together

pub mod chunker;
pub mod citations;
pub mod config;
pub mod corpus;
pub mod embeddings;
pub mod extract;
pub mod generation;
pub mod ingestion;
pub mod jobs;
pub mod retrieval;
pub mod sections;
pub mod service;
pub mod telemetry;
pub mod types;
