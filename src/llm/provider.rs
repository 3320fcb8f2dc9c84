// Provider contract shared by every LLM backend (OpenAI-compatible
// Responses, Anthropic, Gemini, GitHub Copilot).

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the stream event channel handed to the consumer.
///
/// Small on purpose: backpressure belongs to the consumer, and the producer
/// task must not buffer a whole response.
pub const STREAM_CHANNEL_CAPACITY: usize = 16;

// ============================================================================
// Core Trait
// ============================================================================

/// Unified interface for LLM providers.
///
/// `stream` hands back the receive end of a bounded channel. The producer
/// task owns the HTTP response body, emits events in remote order, and
/// closes the channel after the terminal `Done` or `Error` event. When
/// `ctx` is cancelled the producer emits one `Error` carrying the
/// cancellation cause and closes.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Short provider name used in error records and logs
    fn name(&self) -> &'static str;

    /// Single-shot completion (no streaming)
    async fn complete(
        &self,
        ctx: CancellationToken,
        request: Request,
    ) -> Result<Response, ProviderError>;

    /// Open a streaming completion; events arrive on the returned channel
    async fn stream(
        &self,
        ctx: CancellationToken,
        request: Request,
    ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError>;
}

impl fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider").field("name", &self.name()).finish()
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// Message role in conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Message in conversation history
///
/// Invariant: `Tool` messages always follow an `Assistant` message whose
/// `tool_calls` contain the matching `tool_call_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,

    /// Tool call ID (for tool responses)
    pub tool_call_id: Option<String>,

    /// Tool calls made by assistant
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Option<Vec<ToolCall>>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls,
        }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            Role::System => write!(f, "System: {}", self.content),
            Role::User => write!(f, "User: {}", self.content),
            Role::Assistant => write!(f, "Assistant: {}", self.content),
            Role::Tool => write!(f, "Tool: {}", self.content),
        }
    }
}

/// Tool call requested by the model.
///
/// `arguments` is the raw JSON string exactly as the backend delivered it;
/// parsing is deferred to the executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Tool definition for function calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON Schema for the argument object
    pub parameters: serde_json::Value,
}

// ============================================================================
// Request / Response
// ============================================================================

/// A completion request assembled by the session runner
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub messages: Vec<Message>,
    pub tools: Option<Vec<ToolDef>>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Accumulated result of one completion
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    /// Provider-supplied reasoning summaries, when present
    pub reasoning_summary: String,
}

/// One event on the streaming channel.
///
/// `Done` and `Error` are terminal: nothing follows either, and the
/// producer closes the channel after sending one of them.
#[derive(Debug)]
pub enum StreamEvent {
    Text(String),
    Reasoning(String),
    ToolCalls(Vec<ToolCall>),
    Done,
    Error(ProviderError),
}

// ============================================================================
// Error Types
// ============================================================================

/// Provider error taxonomy.
///
/// The three sentinels (`NoProvider`, `AuthRequired`, `ModelRequired`) are
/// produced before any HTTP call; every HTTP failure funnels through
/// `normalize_http_error` into the `Http` variant.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("no provider configured (set endpoint, or provider = github-copilot)")]
    NoProvider,

    #[error("API key required (set api-key)")]
    AuthRequired,

    #[error("model required (set model)")]
    ModelRequired,

    #[error("{provider}: {message}. {guidance}")]
    Http {
        status: u16,
        provider: &'static str,
        message: String,
        guidance: String,
    },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("cancelled")]
    Cancelled,

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProviderError {
    /// HTTP status carried by this error, when it came from a response
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Map an HTTP failure to a structured, operator-facing error.
pub fn normalize_http_error(provider: &'static str, status: u16, body: &str) -> ProviderError {
    let (message, guidance) = match status {
        401 => (
            "authentication failed".to_string(),
            "set a valid API key with `rai config api-key <key>`".to_string(),
        ),
        403 => (
            "access denied".to_string(),
            "check that your API key has permission for this model".to_string(),
        ),
        404 => (
            "endpoint or model not found".to_string(),
            "verify the endpoint URL and model name".to_string(),
        ),
        429 => (
            "rate limited".to_string(),
            "wait a moment and retry".to_string(),
        ),
        s if s >= 500 => (
            format!("server error (HTTP {s})"),
            "the provider is having trouble; retry later".to_string(),
        ),
        s => (
            format!("unexpected error (HTTP {s}): {}", truncate(body, 200)),
            String::new(),
        ),
    };

    ProviderError::Http {
        status,
        provider,
        message,
        guidance,
    }
}

/// Copilot-specific refinement of `normalize_http_error`.
///
/// 401 points at the login subcommand; a 403 whose body says the model is
/// "not supported" means the model is not enabled for this account.
pub fn normalize_copilot_error(provider: &'static str, status: u16, body: &str) -> ProviderError {
    match status {
        401 => ProviderError::Http {
            status,
            provider,
            message: "authentication failed".to_string(),
            guidance: "run `rai copilot-login` to authenticate with GitHub".to_string(),
        },
        403 if body.contains("not supported") => ProviderError::Http {
            status,
            provider,
            message: "model not available".to_string(),
            guidance: "enable the model in your GitHub Copilot settings".to_string(),
        },
        _ => normalize_http_error(provider, status, body),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_status_table() {
        let cases = [
            (401, "authentication failed"),
            (403, "access denied"),
            (404, "endpoint or model not found"),
            (429, "rate limited"),
            (500, "server error (HTTP 500)"),
            (503, "server error (HTTP 503)"),
        ];
        for (status, expected) in cases {
            match normalize_http_error("openai", status, "") {
                ProviderError::Http {
                    status: s,
                    provider,
                    message,
                    ..
                } => {
                    assert_eq!(s, status);
                    assert_eq!(provider, "openai");
                    assert_eq!(message, expected);
                }
                other => panic!("expected Http error, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_normalize_other_status_truncates_body() {
        let body = "x".repeat(500);
        match normalize_http_error("gemini", 418, &body) {
            ProviderError::Http { message, .. } => {
                assert!(message.starts_with("unexpected error (HTTP 418): "));
                assert!(message.len() < 250);
            }
            other => panic!("expected Http error, got {other:?}"),
        }
    }

    #[test]
    fn test_copilot_401_points_at_login() {
        match normalize_copilot_error("github-copilot", 401, "") {
            ProviderError::Http { guidance, .. } => {
                assert!(guidance.contains("copilot-login"));
            }
            other => panic!("expected Http error, got {other:?}"),
        }
    }

    #[test]
    fn test_copilot_403_model_not_available() {
        let body = r#"{"error":{"message":"The requested model is not supported"}}"#;
        match normalize_copilot_error("github-copilot", 403, body) {
            ProviderError::Http { message, .. } => assert_eq!(message, "model not available"),
            other => panic!("expected Http error, got {other:?}"),
        }
        // Plain 403 keeps the generic message
        match normalize_copilot_error("github-copilot", 403, "forbidden") {
            ProviderError::Http { message, .. } => assert_eq!(message, "access denied"),
            other => panic!("expected Http error, got {other:?}"),
        }
    }

    #[test]
    fn test_message_constructors() {
        let msg = Message::tool("output", "call_1");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));

        let msg = Message::assistant(
            "thinking",
            Some(vec![ToolCall {
                id: "call_2".to_string(),
                name: "terminal".to_string(),
                arguments: r#"{"command":"ls"}"#.to_string(),
            }]),
        );
        assert_eq!(msg.tool_calls.as_ref().map(|c| c.len()), Some(1));
    }

    #[test]
    fn test_status_accessor() {
        assert_eq!(normalize_http_error("openai", 429, "").status(), Some(429));
        assert_eq!(ProviderError::NoProvider.status(), None);
    }
}
