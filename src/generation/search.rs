//! Web search tool backend.
//!
//! Exactly one tool is offered to the model: `tavily_search`. A failing
//! search is not fatal to generation — the orchestrator surfaces the error
//! text to the model and drafting proceeds without that source.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use super::client::ToolSpec;

#[derive(Debug, Error, Diagnostic)]
pub enum SearchError {
    #[error("web search error: {0}")]
    #[diagnostic(code(draftsmith::search::provider))]
    Provider(String),
}

/// One web-search hit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub score: Option<f32>,
}

#[async_trait]
pub trait WebSearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, SearchError>;
}

/// Declaration of the `tavily_search` tool handed to the model.
pub fn tavily_tool_spec() -> ToolSpec {
    ToolSpec {
        name: "tavily_search".to_string(),
        description: "Get information from the web to answer questions, find recent data, \
                      or verify facts. Use this for any query that needs up-to-date information."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query to run.",
                }
            },
            "required": ["query"],
        }),
    }
}

/// Tavily HTTP client.
pub struct TavilySearch {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    search_depth: String,
}

impl TavilySearch {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: "https://api.tavily.com".to_string(),
            api_key: api_key.into(),
            search_depth: "advanced".to_string(),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl WebSearchProvider for TavilySearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            results: Vec<SearchResult>,
        }

        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "api_key": self.api_key,
                "query": query,
                "search_depth": self.search_depth,
            }))
            .send()
            .await
            .map_err(|e| SearchError::Provider(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Provider(format!("{status}: {body}")));
        }

        let parsed: Response = response
            .json()
            .await
            .map_err(|e| SearchError::Provider(e.to_string()))?;
        Ok(parsed.results)
    }
}

/// Canned search results (or a forced failure) for tests.
#[derive(Default)]
pub struct MockWebSearch {
    results: Mutex<Vec<SearchResult>>,
    fail: Mutex<bool>,
    queries: Mutex<Vec<String>>,
}

impl MockWebSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_results(results: Vec<SearchResult>) -> Self {
        let mock = Self::default();
        *mock.results.lock() = results;
        mock
    }

    pub fn failing() -> Self {
        let mock = Self::default();
        *mock.fail.lock() = true;
        mock
    }

    /// Queries the provider was asked to run, in order.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl WebSearchProvider for MockWebSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        self.queries.lock().push(query.to_string());
        if *self.fail.lock() {
            return Err(SearchError::Provider("search backend unavailable".into()));
        }
        Ok(self.results.lock().clone())
    }
}
