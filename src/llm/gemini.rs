// Google Gemini adapter using reqwest + SSE streaming.
//
// The stream endpoint (`:streamGenerateContent?alt=sse`) delivers one
// complete generateContent response per SSE data payload; each element is
// folded into text / tool-call events.

use crate::llm::debug::DebugRecorder;
use crate::llm::provider::*;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct GeminiProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    debug: Option<Arc<DebugRecorder>>,
}

impl GeminiProvider {
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

    /// API key travels in the query string on this API.
    fn url(&self, model: &str, stream: bool) -> String {
        let method = if stream {
            "streamGenerateContent?alt=sse&key="
        } else {
            "generateContent?key="
        };
        format!(
            "{}/v1beta/models/{}:{}{}",
            self.endpoint, model, method, self.api_key
        )
    }

    fn model_for(&self, request: &Request) -> String {
        request.model.clone().unwrap_or_else(|| self.model.clone())
    }
}

// ============================== Wire types ==============================

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
struct RequestPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GeminiTool {
    #[serde(rename = "functionDeclarations")]
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(rename = "functionCall", default)]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

// ============================== Request build ==============================

fn build_request(request: &Request) -> GenerateContentRequest {
    let mut contents = Vec::new();
    let mut system_instruction = None;

    for msg in &request.messages {
        match msg.role {
            Role::System => {
                if system_instruction.is_none() {
                    system_instruction = Some(GeminiContent {
                        role: None,
                        parts: vec![RequestPart {
                            text: msg.content.clone(),
                        }],
                    });
                }
            }
            Role::User | Role::Tool => contents.push(GeminiContent {
                role: Some("user"),
                parts: vec![RequestPart {
                    text: msg.content.clone(),
                }],
            }),
            Role::Assistant => contents.push(GeminiContent {
                role: Some("model"),
                parts: vec![RequestPart {
                    text: msg.content.clone(),
                }],
            }),
        }
    }

    let generation_config = if request.max_tokens.is_some() || request.temperature.is_some() {
        Some(GenerationConfig {
            max_output_tokens: request.max_tokens,
            temperature: request.temperature,
        })
    } else {
        None
    };

    GenerateContentRequest {
        contents,
        system_instruction,
        tools: request.tools.as_ref().map(|tools| {
            vec![GeminiTool {
                function_declarations: tools
                    .iter()
                    .map(|t| FunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    })
                    .collect(),
            }]
        }),
        generation_config,
    }
}

// ============================== Response parse ==============================

/// Fold one response element into events: concatenated text parts first,
/// then one `ToolCalls` per functionCall part. Call ids are synthesized;
/// Gemini does not assign them.
fn lower_element(data: &str, call_counter: &mut u64) -> Vec<StreamEvent> {
    let parsed: GenerateContentResponse = match serde_json::from_str(data) {
        Ok(parsed) => parsed,
        Err(_) => return Vec::new(),
    };

    let mut events = Vec::new();
    let mut text = String::new();
    let mut calls = Vec::new();

    for candidate in parsed.candidates {
        let Some(content) = candidate.content else {
            continue;
        };
        for part in content.parts {
            if let Some(t) = part.text {
                text.push_str(&t);
            }
            if let Some(fc) = part.function_call {
                *call_counter += 1;
                calls.push(ToolCall {
                    id: format!("gemini_call_{call_counter}"),
                    name: fc.name,
                    arguments: fc.args.to_string(),
                });
            }
        }
    }

    if !text.is_empty() {
        events.push(StreamEvent::Text(text));
    }
    if !calls.is_empty() {
        events.push(StreamEvent::ToolCalls(calls));
    }
    events
}

async fn pump_stream(
    response: reqwest::Response,
    tx: mpsc::Sender<StreamEvent>,
    ctx: CancellationToken,
) {
    let mut events = response.bytes_stream().eventsource();
    let mut call_counter = 0u64;

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
                if event.data.trim().is_empty() {
                    continue;
                }
                for ev in lower_element(&event.data, &mut call_counter) {
                    if tx.send(ev).await.is_err() {
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
impl Provider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn complete(
        &self,
        ctx: CancellationToken,
        request: Request,
    ) -> Result<Response, ProviderError> {
        let model = self.model_for(&request);
        let url = self.url(&model, false);
        let body = build_request(&request);
        if let Some(debug) = &self.debug {
            debug.request("POST", &url, &body);
        }

        let send = self
            .client
            .post(&url)
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

        let mut out = Response::default();
        let mut counter = 0u64;
        for ev in lower_element(&text, &mut counter) {
            match ev {
                StreamEvent::Text(t) => out.content.push_str(&t),
                StreamEvent::ToolCalls(calls) => out.tool_calls.extend(calls),
                _ => {}
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
        let url = self.url(&model, true);
        let body = build_request(&request);
        if let Some(debug) = &self.debug {
            debug.request("POST", &url, &body);
        }

        let response = self
            .client
            .post(&url)
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
        tokio::spawn(pump_stream(response, tx, ctx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roles_and_system_instruction() {
        let request = Request {
            messages: vec![
                Message::system("be brief"),
                Message::user("hi"),
                Message::assistant("hello", None),
                Message::tool("[terminal result]\nok", "c1"),
            ],
            ..Default::default()
        };
        let body = serde_json::to_value(build_request(&request)).unwrap();
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            "be brief"
        );
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["role"], "user");
    }

    #[test]
    fn test_request_tool_declarations() {
        let request = Request {
            messages: vec![Message::user("hi")],
            tools: Some(vec![ToolDef {
                name: "terminal".to_string(),
                description: "run a command".to_string(),
                parameters: serde_json::json!({"type": "object"}),
            }]),
            ..Default::default()
        };
        let body = serde_json::to_value(build_request(&request)).unwrap();
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            "terminal"
        );
    }

    #[test]
    fn test_stream_url_places_key_in_query() {
        let provider = GeminiProvider::new(
            "https://generativelanguage.googleapis.com".to_string(),
            "secret".to_string(),
            "gemini-2.5-pro".to_string(),
            None,
        );
        let url = provider.url("gemini-2.5-pro", true);
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse&key=secret"
        );
        let url = provider.url("gemini-2.5-pro", false);
        assert!(url.ends_with(":generateContent?key=secret"));
    }

    #[test]
    fn test_lower_element_text() {
        let mut counter = 0;
        let events = lower_element(
            r#"{"candidates":[{"content":{"parts":[{"text":"Hello "},{"text":"world"}]}}]}"#,
            &mut counter,
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Text(t) => assert_eq!(t, "Hello world"),
            other => panic!("expected Text, got {other:?}"),
        }
    }

    #[test]
    fn test_lower_element_function_call() {
        let mut counter = 0;
        let events = lower_element(
            r#"{"candidates":[{"content":{"parts":[
                {"functionCall":{"name":"get_weather","args":{"city":"Paris"}}}
            ]}}]}"#,
            &mut counter,
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::ToolCalls(calls) => {
                assert_eq!(calls[0].name, "get_weather");
                assert_eq!(calls[0].arguments, r#"{"city":"Paris"}"#);
                assert_eq!(calls[0].id, "gemini_call_1");
            }
            other => panic!("expected ToolCalls, got {other:?}"),
        }
    }

    #[test]
    fn test_lower_element_skips_malformed() {
        let mut counter = 0;
        assert!(lower_element("not json", &mut counter).is_empty());
        assert!(lower_element("{}", &mut counter).is_empty());
    }
}
