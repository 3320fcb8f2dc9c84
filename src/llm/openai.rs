// OpenAI-compatible Responses API adapter using reqwest + SSE streaming.
//
// The request builder and event lowering are crate-visible: the Copilot
// adapter reuses them for its Responses route instead of duplicating the
// wire format.

use crate::llm::debug::DebugRecorder;
use crate::llm::provider::*;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct OpenAiProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    debug: Option<Arc<DebugRecorder>>,
}

impl OpenAiProvider {
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
        format!("{}/responses", self.endpoint)
    }
}

// ============================== Wire types ==============================

#[derive(Debug, Serialize)]
pub(crate) struct ResponsesRequest {
    model: String,
    input: Vec<InputMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<FunctionTool>>,
}

#[derive(Debug, Serialize)]
struct InputMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct FunctionTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: FunctionDef,
}

#[derive(Debug, Serialize)]
struct FunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponsesResponse {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(rename = "type")]
    item_type: String,
    #[serde(default)]
    content: Vec<ContentPart>,
    #[serde(default)]
    summary: Vec<SummaryPart>,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    part_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct SummaryPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    item: Option<FunctionCallItem>,
}

#[derive(Debug, Deserialize)]
struct FunctionCallItem {
    #[serde(default)]
    call_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

// ============================== Wire helpers ==============================

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

pub(crate) fn convert_tools(tools: &[ToolDef]) -> Vec<FunctionTool> {
    tools
        .iter()
        .map(|t| FunctionTool {
            tool_type: "function",
            function: FunctionDef {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

/// Build the `/responses` request body shared by OpenAI and Copilot.
pub(crate) fn responses_request(request: &Request, model: &str, stream: bool) -> ResponsesRequest {
    ResponsesRequest {
        model: request.model.clone().unwrap_or_else(|| model.to_string()),
        input: request
            .messages
            .iter()
            .map(|m| InputMessage {
                role: role_name(m.role).to_string(),
                content: m.content.clone(),
                tool_call_id: m.tool_call_id.clone(),
            })
            .collect(),
        stream: stream.then_some(true),
        max_output_tokens: request.max_tokens,
        temperature: request.temperature,
        tools: request.tools.as_deref().map(convert_tools),
    }
}

/// Fold a non-streaming `/responses` body into a `Response`.
pub(crate) fn parse_responses_response(body: &str) -> Result<Response, serde_json::Error> {
    let parsed: ResponsesResponse = serde_json::from_str(body)?;
    let mut response = Response::default();

    for item in parsed.output {
        match item.item_type.as_str() {
            "message" => {
                for part in item.content {
                    if part.part_type == "text" {
                        response.content.push_str(&part.text);
                    }
                }
            }
            "reasoning" | "reasoning_summary" => {
                for part in item.summary {
                    response.reasoning_summary.push_str(&part.text);
                }
            }
            "function_call" => {
                response.tool_calls.push(ToolCall {
                    id: item.call_id.unwrap_or_default(),
                    name: item.name.unwrap_or_default(),
                    arguments: item.arguments.unwrap_or_default(),
                });
            }
            _ => {}
        }
    }

    Ok(response)
}

/// Lower one SSE payload into a stream event. `None` means skip (unknown
/// or malformed events are ignored per the wire contract).
pub(crate) fn lower_responses_event(data: &str) -> Option<StreamEvent> {
    let payload: StreamPayload = serde_json::from_str(data).ok()?;
    match payload.event_type.as_str() {
        "response.output_text.delta" => Some(StreamEvent::Text(payload.delta?)),
        "response.reasoning_summary_text.delta" => Some(StreamEvent::Reasoning(payload.delta?)),
        "response.function_call_arguments.done" => {
            let item = payload.item?;
            Some(StreamEvent::ToolCalls(vec![ToolCall {
                id: item.call_id,
                name: item.name,
                arguments: item.arguments,
            }]))
        }
        "response.completed" => Some(StreamEvent::Done),
        _ => None,
    }
}

/// Drive an SSE `/responses` body to completion, writing events into `tx`.
/// Shared by the OpenAI adapter and the Copilot Responses route.
pub(crate) async fn pump_responses_stream(
    response: reqwest::Response,
    tx: mpsc::Sender<StreamEvent>,
    ctx: CancellationToken,
) {
    let mut events = response.bytes_stream().eventsource();

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
                match lower_responses_event(&event.data) {
                    Some(StreamEvent::Done) => {
                        let _ = tx.send(StreamEvent::Done).await;
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
impl Provider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(
        &self,
        ctx: CancellationToken,
        request: Request,
    ) -> Result<Response, ProviderError> {
        let body = responses_request(&request, &self.model, false);
        if let Some(debug) = &self.debug {
            debug.request("POST", &self.url(), &body);
        }

        let send = self
            .client
            .post(self.url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send();
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

        Ok(parse_responses_response(&text)?)
    }

    async fn stream(
        &self,
        ctx: CancellationToken,
        request: Request,
    ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
        let body = responses_request(&request, &self.model, true);
        if let Some(debug) = &self.debug {
            debug.request("POST", &self.url(), &body);
        }

        let response = self
            .client
            .post(self.url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if let Some(debug) = &self.debug {
            debug.response(status.as_u16(), None);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(normalize_http_error(self.name(), status.as_u16(), &text));
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(pump_responses_stream(response, tx, ctx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let request = Request {
            messages: vec![
                Message::system("be brief"),
                Message::user("hi"),
                Message::tool("result", "call_1"),
            ],
            tools: Some(vec![ToolDef {
                name: "terminal".to_string(),
                description: "run a command".to_string(),
                parameters: serde_json::json!({"type": "object"}),
            }]),
            model: None,
            max_tokens: Some(256),
            temperature: Some(0.2),
        };

        let body = serde_json::to_value(responses_request(&request, "gpt-4", true)).unwrap();
        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_output_tokens"], 256);
        assert_eq!(body["input"][0]["role"], "system");
        assert_eq!(body["input"][2]["tool_call_id"], "call_1");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "terminal");
        // Non-streaming requests omit the stream flag entirely
        let body = serde_json::to_value(responses_request(&request, "gpt-4", false)).unwrap();
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_request_model_override() {
        let request = Request {
            model: Some("gpt-5".to_string()),
            ..Default::default()
        };
        let body = serde_json::to_value(responses_request(&request, "gpt-4", false)).unwrap();
        assert_eq!(body["model"], "gpt-5");
    }

    #[test]
    fn test_parse_non_stream_response() {
        let body = r#"{
            "output": [
                {"type": "reasoning", "summary": [{"text": "thinking "}, {"text": "hard"}]},
                {"type": "message", "content": [
                    {"type": "text", "text": "Hello"},
                    {"type": "annotation", "text": "skip me"},
                    {"type": "text", "text": " world"}
                ]},
                {"type": "function_call", "call_id": "c1", "name": "terminal",
                 "arguments": "{\"command\":\"ls\"}"}
            ]
        }"#;
        let response = parse_responses_response(body).unwrap();
        assert_eq!(response.content, "Hello world");
        assert_eq!(response.reasoning_summary, "thinking hard");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].id, "c1");
        assert_eq!(response.tool_calls[0].arguments, r#"{"command":"ls"}"#);
    }

    #[test]
    fn test_lower_text_delta() {
        let ev = lower_responses_event(r#"{"type":"response.output_text.delta","delta":"Hi"}"#);
        match ev {
            Some(StreamEvent::Text(t)) => assert_eq!(t, "Hi"),
            other => panic!("expected Text, got {other:?}"),
        }
    }

    #[test]
    fn test_lower_reasoning_delta() {
        let ev = lower_responses_event(
            r#"{"type":"response.reasoning_summary_text.delta","delta":"because"}"#,
        );
        match ev {
            Some(StreamEvent::Reasoning(t)) => assert_eq!(t, "because"),
            other => panic!("expected Reasoning, got {other:?}"),
        }
    }

    #[test]
    fn test_lower_function_call_done() {
        let ev = lower_responses_event(
            r#"{"type":"response.function_call_arguments.done",
                "item":{"call_id":"c9","name":"terminal","arguments":"{\"command\":\"pwd\"}"}}"#,
        );
        match ev {
            Some(StreamEvent::ToolCalls(calls)) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].id, "c9");
                assert_eq!(calls[0].name, "terminal");
            }
            other => panic!("expected ToolCalls, got {other:?}"),
        }
    }

    #[test]
    fn test_lower_completed_and_noise() {
        assert!(matches!(
            lower_responses_event(r#"{"type":"response.completed"}"#),
            Some(StreamEvent::Done)
        ));
        // Unknown event types and malformed JSON are skipped
        assert!(lower_responses_event(r#"{"type":"response.created"}"#).is_none());
        assert!(lower_responses_event("not json").is_none());
    }
}
