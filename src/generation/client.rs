//! Language-model client seam.
//!
//! The orchestrator sees only [`GenerationClient`]: a chat completion that
//! may answer with content or request at most one tool call per round. The
//! OpenAI-compatible implementation speaks `/chat/completions`; the mock
//! plays back scripted completions and captures every conversation it was
//! given, which is what the whole-document ordering tests assert against.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum GenerationError {
    /// Transport or provider-side failure; retryable by the scheduler.
    #[error("generation provider error: {0}")]
    #[diagnostic(code(draftsmith::generation::provider))]
    Provider(String),

    #[error("malformed completion response: {0}")]
    #[diagnostic(code(draftsmith::generation::malformed))]
    MalformedResponse(String),
}

/// One turn of the conversation sent to the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    /// The assistant turn that requested `calls`; echoed back to the model
    /// ahead of the tool result.
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: Some(calls),
        }
    }

    /// A tool result turn answering `tool_call_id`.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Declaration of a tool offered to the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the tool's arguments.
    pub parameters: serde_json::Value,
}

/// Result of one completion round.
#[derive(Clone, Debug, Default)]
pub struct Completion {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_request(call: ToolCall) -> Self {
        Self {
            content: String::new(),
            tool_calls: vec![call],
        }
    }
}

/// Chat completion with optional tool use.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<Completion, GenerationError>;
}

/// OpenAI-compatible `/chat/completions` client.
pub struct OpenAiGenerationClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAiGenerationClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.2,
        }
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn wire_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|m| {
                let mut obj = json!({ "role": m.role, "content": m.content });
                if let Some(id) = &m.tool_call_id {
                    obj["tool_call_id"] = json!(id);
                }
                if let Some(calls) = &m.tool_calls {
                    obj["tool_calls"] = json!(
                        calls
                            .iter()
                            .map(|c| {
                                json!({
                                    "id": c.id,
                                    "type": "function",
                                    "function": {
                                        "name": c.name,
                                        "arguments": c.arguments.to_string(),
                                    },
                                })
                            })
                            .collect::<Vec<_>>()
                    );
                }
                obj
            })
            .collect()
    }
}

#[async_trait]
impl GenerationClient for OpenAiGenerationClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<Completion, GenerationError> {
        #[derive(Deserialize)]
        struct Response {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: WireMessage,
        }
        #[derive(Deserialize)]
        struct WireMessage {
            content: Option<String>,
            tool_calls: Option<Vec<WireToolCall>>,
        }
        #[derive(Deserialize)]
        struct WireToolCall {
            id: String,
            function: WireFunction,
        }
        #[derive(Deserialize)]
        struct WireFunction {
            name: String,
            arguments: String,
        }

        let mut body = json!({
            "model": self.model,
            "messages": Self::wire_messages(messages),
            "temperature": self.temperature,
        });
        if !tools.is_empty() {
            body["tools"] = json!(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            },
                        })
                    })
                    .collect::<Vec<_>>()
            );
            body["tool_choice"] = json!("auto");
        }

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Provider(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Provider(format!("{status}: {body}")));
        }

        let parsed: Response = response
            .json()
            .await
            .map_err(|e| GenerationError::MalformedResponse(e.to_string()))?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GenerationError::MalformedResponse("no choices returned".into()))?
            .message;

        let tool_calls = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| {
                let arguments = serde_json::from_str(&c.function.arguments)
                    .unwrap_or(serde_json::Value::String(c.function.arguments));
                ToolCall {
                    id: c.id,
                    name: c.function.name,
                    arguments,
                }
            })
            .collect();

        Ok(Completion {
            content: message.content.unwrap_or_default(),
            tool_calls,
        })
    }
}

/// Scripted client for tests: pops queued completions in order and records
/// every conversation it was asked to complete.
#[derive(Default)]
pub struct MockGenerationClient {
    script: Mutex<VecDeque<Completion>>,
    captured: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockGenerationClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next completion to return.
    pub fn push(&self, completion: Completion) {
        self.script.lock().push_back(completion);
    }

    /// Every conversation passed to [`GenerationClient::complete`], in order.
    pub fn captured(&self) -> Vec<Vec<ChatMessage>> {
        self.captured.lock().clone()
    }
}

#[async_trait]
impl GenerationClient for MockGenerationClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolSpec],
    ) -> Result<Completion, GenerationError> {
        self.captured.lock().push(messages.to_vec());
        self.script
            .lock()
            .pop_front()
            .ok_or_else(|| GenerationError::Provider("mock script exhausted".into()))
    }
}
