// GitHub Copilot adapter.
//
// Copilot speaks two wire formats behind one base URL: Chat Completions
// for most models and the Responses API for newer GPT-5+ variants. The
// adapter is a thin dispatcher; the Responses route reuses the OpenAI
// module's request builder and event lowering.

use crate::llm::debug::DebugRecorder;
use crate::llm::openai;
use crate::llm::provider::*;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const USER_AGENT: &str = concat!("rai/", env!("CARGO_PKG_VERSION"));

/// Decide the wire format from the model id alone.
///
/// `gpt-N...` with N >= 5 goes to `/responses`, except `gpt-5-mini` which
/// Copilot still serves over Chat Completions.
pub fn should_use_responses_api(model: &str) -> bool {
    if model.starts_with("gpt-5-mini") {
        return false;
    }
    let Some(rest) = model.strip_prefix("gpt-") else {
        return false;
    };
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    match digits.parse::<u32>() {
        Ok(major) => major >= 5,
        Err(_) => false,
    }
}

/// `user` when the conversation ends on a user turn, `agent` otherwise
/// (tool results mid-loop count as agent-initiated traffic).
fn initiator_for(messages: &[Message]) -> &'static str {
    match messages.last() {
        Some(m) if m.role == Role::User => "user",
        _ => "agent",
    }
}

pub struct CopilotProvider {
    client: reqwest::Client,
    base_url: String,
    token: String,
    model: String,
    provider_name: &'static str,
    debug: Option<Arc<DebugRecorder>>,
}

impl CopilotProvider {
    pub fn new(
        base_url: String,
        token: String,
        model: String,
        enterprise: bool,
        debug: Option<Arc<DebugRecorder>>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            model,
            provider_name: if enterprise {
                "github-copilot-enterprise"
            } else {
                "github-copilot"
            },
            debug,
        }
    }

    fn model_for(&self, request: &Request) -> String {
        request.model.clone().unwrap_or_else(|| self.model.clone())
    }

    /// Copilot-specific headers applied to every request.
    fn request_builder(&self, url: &str, request: &Request) -> reqwest::RequestBuilder {
        // No message carries image input in v1, so the vision header is
        // computed but never set.
        self.client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
            .header("Openai-Intent", "conversation-edits")
            .header("x-initiator", initiator_for(&request.messages))
            .header("Content-Type", "application/json")
    }

    async fn fail(&self, response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        normalize_copilot_error(self.provider_name, status, &body)
    }
}

// ============================== Chat wire types ==============================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<openai::FunctionTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: ChatFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

fn chat_request(request: &Request, model: &str, stream: bool) -> ChatRequest {
    let messages = request
        .messages
        .iter()
        .map(|m| ChatMessage {
            role: match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            },
            content: m.content.clone(),
            tool_call_id: m.tool_call_id.clone(),
            tool_calls: m.tool_calls.as_ref().map(|calls| {
                calls
                    .iter()
                    .map(|tc| ChatToolCall {
                        id: tc.id.clone(),
                        call_type: "function".to_string(),
                        function: ChatFunctionCall {
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        },
                    })
                    .collect()
            }),
        })
        .collect();

    ChatRequest {
        model: request.model.clone().unwrap_or_else(|| model.to_string()),
        messages,
        stream: stream.then_some(true),
        tools: request.tools.as_deref().map(openai::convert_tools),
        tool_choice: request.tools.as_ref().map(|_| "auto"),
        max_tokens: request.max_tokens,
        temperature: request.temperature,
    }
}

// ============================== Chat stream state ==============================

/// Assembles streamed tool-call deltas keyed by their `index`: the id and
/// name stick at first non-empty sight, argument fragments concatenate.
#[derive(Debug, Default)]
struct ChatCallAssembler {
    calls: Vec<PartialCall>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

impl ChatCallAssembler {
    fn absorb(&mut self, delta: ToolCallDelta) {
        if self.calls.len() <= delta.index {
            self.calls.resize_with(delta.index + 1, PartialCall::default);
        }
        let call = &mut self.calls[delta.index];
        if let Some(id) = delta.id {
            if call.id.is_empty() && !id.is_empty() {
                call.id = id;
            }
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                if call.name.is_empty() && !name.is_empty() {
                    call.name = name;
                }
            }
            if let Some(arguments) = function.arguments {
                call.arguments.push_str(&arguments);
            }
        }
    }

    fn flush(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.calls)
            .into_iter()
            .filter(|c| !c.id.is_empty() || !c.name.is_empty())
            .map(|c| ToolCall {
                id: c.id,
                name: c.name,
                arguments: c.arguments,
            })
            .collect()
    }
}

/// What one chat SSE payload contributes: a text delta, and whether the
/// accumulated tool calls should be flushed (finish_reason seen).
#[derive(Debug)]
struct ChatStep {
    text: Option<String>,
    flush: bool,
}

fn lower_chat_event(data: &str, assembler: &mut ChatCallAssembler) -> ChatStep {
    let chunk: ChatChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(_) => {
            return ChatStep {
                text: None,
                flush: false,
            }
        }
    };

    let mut text = String::new();
    let mut flush = false;
    for choice in chunk.choices {
        if let Some(content) = choice.delta.content {
            text.push_str(&content);
        }
        if let Some(deltas) = choice.delta.tool_calls {
            for delta in deltas {
                assembler.absorb(delta);
            }
        }
        if matches!(choice.finish_reason.as_deref(), Some("tool_calls" | "stop")) {
            flush = true;
        }
    }

    ChatStep {
        text: (!text.is_empty()).then_some(text),
        flush,
    }
}

async fn pump_chat_stream(
    response: reqwest::Response,
    tx: mpsc::Sender<StreamEvent>,
    ctx: CancellationToken,
) {
    let mut events = response.bytes_stream().eventsource();
    let mut assembler = ChatCallAssembler::default();

    loop {
        let event = tokio::select! {
            _ = ctx.cancelled() => {
                let _ = tx.send(StreamEvent::Error(ProviderError::Cancelled)).await;
                return;
            }
            event = events.next() => event,
        };

        match event {
            Some(Ok(event)) => {
                if event.data == "[DONE]" {
                    let _ = tx.send(StreamEvent::Done).await;
                    return;
                }
                let step = lower_chat_event(&event.data, &mut assembler);
                if let Some(text) = step.text {
                    if tx.send(StreamEvent::Text(text)).await.is_err() {
                        return;
                    }
                }
                if step.flush {
                    let calls = assembler.flush();
                    if !calls.is_empty() && tx.send(StreamEvent::ToolCalls(calls)).await.is_err() {
                        return;
                    }
                }
            }
            Some(Err(err)) => {
                let _ = tx
                    .send(StreamEvent::Error(ProviderError::Stream(err.to_string())))
                    .await;
                return;
            }
            None => {
                let _ = tx.send(StreamEvent::Done).await;
                return;
            }
        }
    }
}

// ============================== Provider impl ==============================

#[async_trait::async_trait]
impl Provider for CopilotProvider {
    fn name(&self) -> &'static str {
        self.provider_name
    }

    async fn complete(
        &self,
        ctx: CancellationToken,
        request: Request,
    ) -> Result<Response, ProviderError> {
        let model = self.model_for(&request);

        if should_use_responses_api(&model) {
            let url = format!("{}/responses", self.base_url);
            let body = openai::responses_request(&request, &model, false);
            if let Some(debug) = &self.debug {
                debug.request("POST", &url, &body);
            }
            let send = self.request_builder(&url, &request).json(&body).send();
            let response = tokio::select! {
                _ = ctx.cancelled() => return Err(ProviderError::Cancelled),
                response = send => response?,
            };
            let status = response.status();
            let text = response.text().await?;
            if let Some(debug) = &self.debug {
                debug.response(status.as_u16(), Some(&text));
            }
            if !status.is_success() {
                return Err(normalize_copilot_error(
                    self.provider_name,
                    status.as_u16(),
                    &text,
                ));
            }
            return Ok(openai::parse_responses_response(&text)?);
        }

        let url = format!("{}/chat/completions", self.base_url);
        let body = chat_request(&request, &model, false);
        if let Some(debug) = &self.debug {
            debug.request("POST", &url, &body);
        }
        let send = self.request_builder(&url, &request).json(&body).send();
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(ProviderError::Cancelled),
            response = send => response?,
        };
        let status = response.status();
        let text = response.text().await?;
        if let Some(debug) = &self.debug {
            debug.response(status.as_u16(), Some(&text));
        }
        if !status.is_success() {
            return Err(normalize_copilot_error(
                self.provider_name,
                status.as_u16(),
                &text,
            ));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)?;
        let mut out = Response::default();
        if let Some(message) = parsed.choices.into_iter().next().and_then(|c| c.message) {
            out.content = message.content.unwrap_or_default();
            if let Some(calls) = message.tool_calls {
                out.tool_calls = calls
                    .into_iter()
                    .map(|tc| ToolCall {
                        id: tc.id,
                        name: tc.function.name,
                        arguments: tc.function.arguments,
                    })
                    .collect();
            }
        }
        Ok(out)
    }

    async fn stream(
        &self,
        ctx: CancellationToken,
        request: Request,
    ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
        let model = self.model_for(&request);

        if should_use_responses_api(&model) {
            let url = format!("{}/responses", self.base_url);
            let body = openai::responses_request(&request, &model, true);
            if let Some(debug) = &self.debug {
                debug.request("POST", &url, &body);
            }
            let response = self.request_builder(&url, &request).json(&body).send().await?;
            let status = response.status();
            if let Some(debug) = &self.debug {
                debug.response(status.as_u16(), None);
            }
            if !status.is_success() {
                return Err(self.fail(response).await);
            }
            let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
            tokio::spawn(openai::pump_responses_stream(response, tx, ctx));
            return Ok(rx);
        }

        let url = format!("{}/chat/completions", self.base_url);
        let body = chat_request(&request, &model, true);
        if let Some(debug) = &self.debug {
            debug.request("POST", &url, &body);
        }
        let response = self.request_builder(&url, &request).json(&body).send().await?;
        let status = response.status();
        if let Some(debug) = &self.debug {
            debug.response(status.as_u16(), None);
        }
        if !status.is_success() {
            return Err(self.fail(response).await);
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(pump_chat_stream(response, tx, ctx));
        Ok(rx)
    }
}
