//! HTTP debug capture for `--log DEBUG`.
//!
//! Installed by the resolver only when a writable session log exists. SSE
//! response bodies are never captured; the stream would be consumed twice.

use crate::sink::OutputSink;
use serde::Serialize;
use std::sync::Arc;

pub struct DebugRecorder {
    sink: Arc<OutputSink>,
}

impl DebugRecorder {
    pub fn new(sink: Arc<OutputSink>) -> Self {
        Self { sink }
    }

    /// Record an outgoing request with its JSON body.
    pub fn request<B: Serialize>(&self, method: &str, url: &str, body: &B) {
        let body = serde_json::to_string(body).unwrap_or_else(|e| format!("<unserializable: {e}>"));
        self.sink.append_debug(&format!("-> {method} {url} {body}"));
    }

    /// Record a response status; `body` is `None` for SSE responses.
    pub fn response(&self, status: u16, body: Option<&str>) {
        match body {
            Some(body) => self.sink.append_debug(&format!("<- {status} {body}")),
            None => self.sink.append_debug(&format!("<- {status} <sse stream>")),
        }
    }
}
