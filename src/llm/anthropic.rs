// Anthropic Messages API adapter using reqwest + named-event SSE.

use crate::llm::debug::DebugRecorder;
use crate::llm::provider::*;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// `max_tokens` is mandatory on this API; used when the caller left it unset.
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    debug: Option<Arc<DebugRecorder>>,
}

impl AnthropicProvider {
    pub fn new(
        endpoint: String,
        api_key: String,
        model: String,
        debug: Option<Arc<DebugRecorder>>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            model,
            debug,
        }
    }

    fn url(&self) -> String {
        format!("{}/v1/messages", self.endpoint)
    }

    fn request_builder(&self, body: &CreateMessageRequest) -> reqwest::RequestBuilder {
        self.client
            .post(self.url())
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
    }
}

// ============================== Wire types ==============================

#[derive(Debug, Serialize)]
struct CreateMessageRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CreateMessageResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStart {
    index: usize,
    content_block: StartedBlock,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StartedBlock {
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    index: usize,
    delta: ContentDelta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStop {
    index: usize,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    #[serde(default)]
    error: ErrorBody,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

// ============================== Request build ==============================

fn build_request(request: &Request, model: &str, stream: bool) -> CreateMessageRequest {
    let mut system = None;
    let mut messages = Vec::new();

    for msg in &request.messages {
        match msg.role {
            Role::System => {
                if system.is_none() {
                    system = Some(msg.content.clone());
                }
            }
            Role::User | Role::Tool => messages.push(AnthropicMessage {
                role: "user",
                content: msg.content.clone(),
            }),
            Role::Assistant => messages.push(AnthropicMessage {
                role: "assistant",
                content: msg.content.clone(),
            }),
        }
    }

    CreateMessageRequest {
        model: request.model.clone().unwrap_or_else(|| model.to_string()),
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system,
        temperature: request.temperature,
        stream: stream.then_some(true),
        tools: request.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| AnthropicTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.parameters.clone(),
                })
                .collect()
        }),
    }
}

// ============================== Stream state ==============================

/// Per-block accumulation of streamed `tool_use` input JSON.
///
/// Keyed by block index; a block is flushed (one `ToolCalls` event) at its
/// `content_block_stop` and the slot cleared, so a reused index starts clean.
#[derive(Default)]
struct BlockAssembler {
    blocks: HashMap<usize, (String, String, String)>,
}

impl BlockAssembler {
    fn start(&mut self, index: usize, id: String, name: String) {
        self.blocks.insert(index, (id, name, String::new()));
    }

    fn push_json(&mut self, index: usize, partial: &str) {
        if let Some((_, _, json)) = self.blocks.get_mut(&index) {
            json.push_str(partial);
        }
    }

    fn stop(&mut self, index: usize) -> Option<ToolCall> {
        let (id, name, json) = self.blocks.remove(&index)?;
        Some(ToolCall {
            id,
            name,
            arguments: if json.is_empty() {
                "{}".to_string()
            } else {
                json
            },
        })
    }
}

/// Lower one named SSE event. The assembler carries tool-use state across
/// events; `Some(event)` is sent to the channel, `None` is internal-only.
fn lower_event(name: &str, data: &str, assembler: &mut BlockAssembler) -> Option<StreamEvent> {
    match name {
        "content_block_start" => {
            if let Ok(start) = serde_json::from_str::<ContentBlockStart>(data) {
                if let StartedBlock::ToolUse { id, name } = start.content_block {
                    assembler.start(start.index, id, name);
                }
            }
            None
        }
        "content_block_delta" => match serde_json::from_str::<ContentBlockDelta>(data) {
            Ok(delta) => match delta.delta {
                ContentDelta::TextDelta { text } => Some(StreamEvent::Text(text)),
                ContentDelta::InputJsonDelta { partial_json } => {
                    assembler.push_json(delta.index, &partial_json);
                    None
                }
                ContentDelta::Other => None,
            },
            Err(_) => None,
        },
        "content_block_stop" => {
            let stop: ContentBlockStop = serde_json::from_str(data).ok()?;
            assembler
                .stop(stop.index)
                .map(|call| StreamEvent::ToolCalls(vec![call]))
        }
        "message_stop" => Some(StreamEvent::Done),
        "error" => {
            let message = serde_json::from_str::<ErrorEvent>(data)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| data.to_string());
            Some(StreamEvent::Error(ProviderError::Stream(format!(
                "anthropic: {message}"
            ))))
        }
        _ => None,
    }
}

async fn pump_stream(
    response: reqwest::Response,
    tx: mpsc::Sender<StreamEvent>,
    ctx: CancellationToken,
) {
    let mut events = response.bytes_stream().eventsource();
    let mut assembler = BlockAssembler::default();

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
                match lower_event(&event.event, &event.data, &mut assembler) {
                    Some(terminal @ (StreamEvent::Done | StreamEvent::Error(_))) => {
                        let _ = tx.send(terminal).await;
                        return;
                    }
                    Some(ev) => {
                        if tx.send(ev).await.is_err() {
                            return;
                        }
                    }
                    None => {}
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
impl Provider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn complete(
        &self,
        ctx: CancellationToken,
        request: Request,
    ) -> Result<Response, ProviderError> {
        let body = build_request(&request, &self.model, false);
        if let Some(debug) = &self.debug {
            debug.request("POST", &self.url(), &body);
        }

        let send = self.request_builder(&body).send();
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
            return Err(normalize_http_error(self.name(), status.as_u16(), &text));
        }

        let parsed: CreateMessageResponse = serde_json::from_str(&text)?;
        let mut out = Response::default();
        for block in parsed.content {
            match block {
                ResponseBlock::Text { text } => out.content.push_str(&text),
                ResponseBlock::ToolUse { id, name, input } => out.tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input.to_string(),
                }),
                ResponseBlock::Other => {}
            }
        }
        Ok(out)
    }

    async fn stream(
        &self,
        ctx: CancellationToken,
        request: Request,
    ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
        let body = build_request(&request, &self.model, true);
        if let Some(debug) = &self.debug {
            debug.request("POST", &self.url(), &body);
        }

        let response = self.request_builder(&body).send().await?;
        let status = response.status();
        if let Some(debug) = &self.debug {
            debug.response(status.as_u16(), None);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(normalize_http_error(self.name(), status.as_u16(), &text));
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(pump_stream(response, tx, ctx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_carries_max_tokens_default() {
        let request = Request {
            messages: vec![Message::user("hi")],
            ..Default::default()
        };
        let body = serde_json::to_value(build_request(&request, "claude-sonnet-4", true)).unwrap();
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["stream"], true);
        assert!(body.get("system").is_none());
    }

    #[test]
    fn test_request_system_and_tool_schema_field() {
        let request = Request {
            messages: vec![Message::system("be brief"), Message::user("hi")],
            tools: Some(vec![ToolDef {
                name: "get_weather".to_string(),
                description: "weather lookup".to_string(),
                parameters: serde_json::json!({"type": "object"}),
            }]),
            max_tokens: Some(1024),
            ..Default::default()
        };
        let body = serde_json::to_value(build_request(&request, "claude-sonnet-4", false)).unwrap();
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["max_tokens"], 1024);
        // Only the user message lands in `messages`
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert!(body["tools"][0].get("input_schema").is_some());
    }

    #[test]
    fn test_lower_text_delta() {
        let mut asm = BlockAssembler::default();
        let ev = lower_event(
            "content_block_delta",
            r#"{"index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
            &mut asm,
        );
        match ev {
            Some(StreamEvent::Text(t)) => assert_eq!(t, "Hi"),
            other => panic!("expected Text, got {other:?}"),
        }
    }

    #[test]
    fn test_tool_use_block_accumulation() {
        let mut asm = BlockAssembler::default();
        assert!(lower_event(
            "content_block_start",
            r#"{"index":1,"content_block":{"type":"tool_use","id":"tu_1","name":"get_weather"}}"#,
            &mut asm,
        )
        .is_none());
        assert!(lower_event(
            "content_block_delta",
            r#"{"index":1,"delta":{"type":"input_json_delta","partial_json":"{\"city\":"}}"#,
            &mut asm,
        )
        .is_none());
        assert!(lower_event(
            "content_block_delta",
            r#"{"index":1,"delta":{"type":"input_json_delta","partial_json":"\"Paris\"}"}}"#,
            &mut asm,
        )
        .is_none());

        let ev = lower_event("content_block_stop", r#"{"index":1}"#, &mut asm);
        match ev {
            Some(StreamEvent::ToolCalls(calls)) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].id, "tu_1");
                assert_eq!(calls[0].name, "get_weather");
                assert_eq!(calls[0].arguments, r#"{"city":"Paris"}"#);
            }
            other => panic!("expected ToolCalls, got {other:?}"),
        }

        // The slot is cleared: a second stop on the same index yields nothing
        assert!(lower_event("content_block_stop", r#"{"index":1}"#, &mut asm).is_none());
    }

    #[test]
    fn test_text_block_stop_emits_nothing() {
        let mut asm = BlockAssembler::default();
        assert!(lower_event(
            "content_block_start",
            r#"{"index":0,"content_block":{"type":"text","text":""}}"#,
            &mut asm,
        )
        .is_none());
        assert!(lower_event("content_block_stop", r#"{"index":0}"#, &mut asm).is_none());
    }

    #[test]
    fn test_message_stop_and_error() {
        let mut asm = BlockAssembler::default();
        assert!(matches!(
            lower_event("message_stop", "{}", &mut asm),
            Some(StreamEvent::Done)
        ));
        match lower_event(
            "error",
            r#"{"error":{"type":"overloaded_error","message":"overloaded"}}"#,
            &mut asm,
        ) {
            Some(StreamEvent::Error(ProviderError::Stream(msg))) => {
                assert_eq!(msg, "anthropic: overloaded");
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_tool_input_defaults_to_object() {
        let mut asm = BlockAssembler::default();
        asm.start(0, "tu_2".to_string(), "noop".to_string());
        let call = asm.stop(0).unwrap();
        assert_eq!(call.arguments, "{}");
    }
}
