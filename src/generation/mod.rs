//! AI generation: the language-model client seam, the web-search tool, and
//! the orchestrator that turns retrieval context into committed section
//! versions with citation provenance.

pub mod client;
pub mod orchestrator;
pub mod prompt;
pub mod search;

pub use client::{
    ChatMessage, Completion, GenerationClient, GenerationError, MockGenerationClient,
    OpenAiGenerationClient, ToolCall, ToolSpec,
};
pub use orchestrator::{GenerationOrchestrator, OrchestratorError};
pub use search::{MockWebSearch, SearchError, SearchResult, TavilySearch, WebSearchProvider};
