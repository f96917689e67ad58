//! Scripted in-memory provider for tests and offline development.
//!
//! Responses are queued ahead of time; each `chat`/`chat_stream` call pops
//! the next one. An empty queue yields a canned echo so ad-hoc use never
//! hangs. Received requests are recorded for assertions.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use osa_domain::error::Result;
use osa_domain::message::ToolCall;
use osa_domain::stream::{BoxStream, StreamEvent, Usage};

use crate::traits::{ChatRequest, ChatResponse, LlmCapabilities, LlmProvider};

pub struct MockProvider {
    id: String,
    responses: Mutex<VecDeque<Result<ChatResponse>>>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
    capabilities: LlmCapabilities,
}

impl MockProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            responses: Mutex::new(VecDeque::new()),
            requests: Arc::new(Mutex::new(Vec::new())),
            capabilities: LlmCapabilities {
                supports_tools: true,
                supports_streaming: true,
                supports_json_mode: true,
                supports_vision: false,
                supports_thinking: true,
                context_window_tokens: Some(128_000),
                max_output_tokens: Some(8_192),
            },
        }
    }

    /// Queue a full response.
    pub fn push_response(&self, resp: ChatResponse) {
        self.responses.lock().push_back(Ok(resp));
    }

    /// Queue a plain text answer.
    pub fn push_text(&self, text: impl Into<String>) {
        self.push_response(ChatResponse {
            content: text.into(),
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            model: self.id.clone(),
            finish_reason: Some("stop".into()),
            ..Default::default()
        });
    }

    /// Queue a response that requests a single tool call.
    pub fn push_tool_call(
        &self,
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
    ) {
        self.push_response(ChatResponse {
            tool_calls: vec![ToolCall {
                call_id: call_id.into(),
                tool_name: tool_name.into(),
                arguments,
            }],
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            model: self.id.clone(),
            finish_reason: Some("tool_calls".into()),
            ..Default::default()
        });
    }

    /// Queue an error.
    pub fn push_error(&self, err: osa_domain::Error) {
        self.responses.lock().push_back(Err(err));
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn next_response(&self) -> Result<ChatResponse> {
        self.responses.lock().pop_front().unwrap_or_else(|| {
            Ok(ChatResponse {
                content: "ok".into(),
                usage: Some(Usage {
                    prompt_tokens: 1,
                    completion_tokens: 1,
                    total_tokens: 2,
                }),
                model: self.id.clone(),
                finish_reason: Some("stop".into()),
                ..Default::default()
            })
        })
    }
}

/// Convert a canned response into the event sequence a real provider
/// would stream.
fn response_to_events(resp: &ChatResponse) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();
    for block in &resp.thinking {
        events.push(Ok(StreamEvent::Thinking {
            text: block.text.clone(),
        }));
        events.push(Ok(StreamEvent::ThinkingFinished {
            text: block.text.clone(),
            signature: block.signature.clone(),
        }));
    }
    if !resp.content.is_empty() {
        events.push(Ok(StreamEvent::Token {
            text: resp.content.clone(),
        }));
    }
    for tc in &resp.tool_calls {
        events.push(Ok(StreamEvent::ToolCallStarted {
            call_id: tc.call_id.clone(),
            tool_name: tc.tool_name.clone(),
        }));
        events.push(Ok(StreamEvent::ToolCallFinished {
            call_id: tc.call_id.clone(),
            tool_name: tc.tool_name.clone(),
            arguments: tc.arguments.clone(),
        }));
    }
    events.push(Ok(StreamEvent::Done {
        usage: resp.usage.clone(),
        finish_reason: resp.finish_reason.clone(),
    }));
    events
}

#[async_trait::async_trait]
impl LlmProvider for MockProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        self.requests.lock().push(req.clone());
        self.next_response()
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        self.requests.lock().push(req.clone());
        let resp = self.next_response()?;
        let events = response_to_events(&resp);
        Ok(Box::pin(futures_util::stream::iter(events)))
    }

    fn capabilities(&self) -> &LlmCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}
