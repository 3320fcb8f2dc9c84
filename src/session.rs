//! Session runner: one prompt, one bounded stream/tool loop.
//!
//! Each iteration re-sends the full accumulated conversation, consumes
//! the provider's event channel while mirroring text to the sink, and
//! either finishes on a text-only response or executes the requested
//! tools and loops. Tool failures are conversational (the model sees
//! them); stream errors are terminal.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::llm::{Message, Provider, ProviderError, Request, StreamEvent, ToolCall};
use crate::sink::{OutputSink, RecordKind};
use crate::skills::{skill_context_block, Skill};
use crate::tools::ToolExecutor;

/// Upper bound on provider stream calls per invocation.
pub const MAX_ITERATIONS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("maximum tool call iterations reached")]
    IterationLimit,
}

pub struct SessionOptions {
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub silent: bool,
}

pub struct SessionRunner {
    provider: Arc<dyn Provider>,
    executor: ToolExecutor,
    sink: Arc<OutputSink>,
    skills: Vec<Skill>,
    options: SessionOptions,
}

impl SessionRunner {
    pub fn new(
        provider: Arc<dyn Provider>,
        executor: ToolExecutor,
        sink: Arc<OutputSink>,
        skills: Vec<Skill>,
        options: SessionOptions,
    ) -> Self {
        Self {
            provider,
            executor,
            sink,
            skills,
            options,
        }
    }

    /// Initial conversation: a system message when there is a system
    /// prompt or any skills, then the user prompt.
    fn initial_messages(&self, prompt: &str) -> Vec<Message> {
        let mut messages = Vec::new();

        if self.options.system_prompt.is_some() || !self.skills.is_empty() {
            let mut body = self
                .options
                .system_prompt
                .clone()
                .unwrap_or_default();
            if !self.skills.is_empty() {
                if !body.is_empty() {
                    body.push_str("\n\n");
                }
                body.push_str(&skill_context_block(&self.skills));
            }
            messages.push(Message::system(body));
        }

        messages.push(Message::user(prompt));
        messages
    }

    /// Drive the loop to a final answer. Returns the answer text.
    pub async fn run(&self, ctx: CancellationToken, prompt: &str) -> Result<String, SessionError> {
        let mut messages = self.initial_messages(prompt);
        let tools = self.executor.definitions();

        for _ in 0..MAX_ITERATIONS {
            let request = Request {
                messages: messages.clone(),
                tools: Some(tools.clone()),
                model: None,
                max_tokens: self.options.max_tokens,
                temperature: self.options.temperature,
            };

            let mut rx = match self.provider.stream(ctx.clone(), request).await {
                Ok(rx) => rx,
                Err(err) => {
                    self.sink.emit(RecordKind::Err, &err.to_string());
                    return Err(err.into());
                }
            };

            let mut full_text = String::new();
            let mut reasoning = String::new();
            let mut tool_calls: Vec<ToolCall> = Vec::new();
            let mut streaming = false;

            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::Text(chunk) => {
                        if !streaming {
                            streaming = true;
                            self.sink.begin_ai_stream();
                        }
                        full_text.push_str(&chunk);
                        self.sink.emit_ai_chunk(&chunk);
                    }
                    StreamEvent::Reasoning(chunk) => reasoning.push_str(&chunk),
                    StreamEvent::ToolCalls(calls) => tool_calls.extend(calls),
                    StreamEvent::Done => break,
                    StreamEvent::Error(err) => {
                        self.sink.emit(RecordKind::Err, &err.to_string());
                        return Err(err.into());
                    }
                }
            }

            if tool_calls.is_empty() {
                if self.options.silent {
                    self.sink.emit_final(&full_text);
                } else {
                    self.sink.end_ai_stream(&full_text);
                }
                if !reasoning.is_empty() {
                    self.sink.emit(RecordKind::Reason, &reasoning);
                }
                return Ok(full_text);
            }

            if streaming && !self.options.silent {
                // Terminate the in-flight console line before CMD records
                self.sink.end_ai_stream(&full_text);
            }

            messages.push(Message::assistant(full_text.clone(), Some(tool_calls.clone())));

            for call in &tool_calls {
                self.sink
                    .emit(RecordKind::Cmd, &self.executor.display_label(call));

                let body = match self.executor.execute(&ctx, call).await {
                    Ok(output) => {
                        self.sink.emit(RecordKind::Out, &output);
                        format!("[{} result]\n{}", call.name, output)
                    }
                    Err(failure) => {
                        self.sink.emit(RecordKind::Err, &failure.error);
                        self.sink.emit(RecordKind::Out, &failure.output);
                        format!(
                            "[{} result]\n{}\n{}",
                            call.name, failure.error, failure.output
                        )
                    }
                };
                messages.push(Message::tool(body, call.id.clone()));
            }
        }

        self.sink
            .emit(RecordKind::Err, "maximum tool call iterations reached");
        Err(SessionError::IterationLimit)
    }
}
