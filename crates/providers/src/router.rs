//! Fallback-chain LLM router.
//!
//! The router maps a canonical chat request onto a concrete provider: an
//! explicit per-call override, the configured default, or the next member
//! of the fallback chain when the previous one fails with a retriable
//! error. Callers see a single result or the terminal error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use osa_domain::config::Config;
use osa_domain::error::{Error, Result};
use osa_domain::message::{Message, ToolCall, ToolDefinition};
use osa_domain::stream::StreamEvent;

use crate::registry::ProviderRegistry;
use crate::traits::{ChatRequest, ChatResponse, LlmProvider, ThinkingBlock};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CallOptions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-call overrides. Everything is optional; unset fields fall back to
/// the router's defaults.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub json_mode: bool,
    pub thinking_budget: Option<u32>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ProviderRouter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ProviderRouter {
    registry: Arc<ProviderRegistry>,
    chain: Vec<String>,
    default_provider: Option<String>,
    default_model: Option<String>,
    timeout: Duration,
}

impl ProviderRouter {
    pub fn new(registry: Arc<ProviderRegistry>, config: &Config) -> Self {
        let chain = if config.fallback_chain.is_empty() {
            registry.preferred_order()
        } else {
            config.fallback_chain.clone()
        };
        Self {
            registry,
            chain,
            default_provider: config.default_provider.clone(),
            default_model: config.default_model.clone(),
            timeout: Duration::from_secs(config.provider_timeout_secs),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// The fallback chain currently in effect.
    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    /// The provider a call with these options would hit first.
    pub fn primary(&self, opts: &CallOptions) -> Option<Arc<dyn LlmProvider>> {
        self.candidates(opts).into_iter().next()
    }

    /// Ordered candidate providers for a call: explicit override, then the
    /// configured default, then the remaining chain members.
    fn candidates(&self, opts: &CallOptions) -> Vec<Arc<dyn LlmProvider>> {
        if let Some(id) = &opts.provider {
            return self.registry.get(id).into_iter().collect();
        }
        let mut seen = Vec::new();
        let mut out = Vec::new();
        let ids = self
            .default_provider
            .iter()
            .chain(self.chain.iter());
        for id in ids {
            if seen.contains(id) {
                continue;
            }
            seen.push(id.clone());
            if let Some(p) = self.registry.get(id) {
                out.push(p);
            }
        }
        out
    }

    fn build_request(
        &self,
        provider: &Arc<dyn LlmProvider>,
        messages: &[Message],
        tools: &[ToolDefinition],
        opts: &CallOptions,
    ) -> ChatRequest {
        // The configured default model only applies to the default
        // provider; fallback members use their own defaults.
        let model = opts.model.clone().or_else(|| {
            match (&self.default_provider, &self.default_model) {
                (Some(dp), Some(dm)) if dp == provider.provider_id() => Some(dm.clone()),
                (None, Some(dm)) => Some(dm.clone()),
                _ => None,
            }
        });
        let thinking_budget = if provider.capabilities().supports_thinking {
            opts.thinking_budget
        } else {
            None
        };
        ChatRequest {
            messages: messages.to_vec(),
            tools: tools.to_vec(),
            temperature: opts.temperature,
            max_tokens: opts.max_tokens,
            json_mode: opts.json_mode && provider.capabilities().supports_json_mode,
            model,
            thinking_budget,
        }
    }

    async fn try_chat(
        &self,
        provider: &Arc<dyn LlmProvider>,
        req: &ChatRequest,
    ) -> Result<ChatResponse> {
        match tokio::time::timeout(self.timeout, provider.chat(req)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "provider '{}' did not respond within {}s",
                provider.provider_id(),
                self.timeout.as_secs()
            ))),
        }
    }

    // ── Public routing API ─────────────────────────────────────────

    /// Non-streaming chat. Walks the candidate chain on retriable errors.
    pub async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        opts: &CallOptions,
    ) -> Result<ChatResponse> {
        let candidates = self.candidates(opts);
        if candidates.is_empty() {
            return Err(Error::ConfigMissing(
                "no LLM provider available; set ANTHROPIC_API_KEY, OPENAI_API_KEY, \
                 or run a local Ollama server"
                    .into(),
            ));
        }

        let mut last_err = None;
        for provider in candidates {
            let req = self.build_request(&provider, messages, tools, opts);
            match self.try_chat(&provider, &req).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retriable() => {
                    tracing::warn!(
                        provider = provider.provider_id(),
                        error = %e,
                        "provider failed, trying next chain member"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Provider {
            provider: "router".into(),
            message: "all providers in the fallback chain failed".into(),
        }))
    }

    /// Streaming chat. `on_event` receives every delta in order; the
    /// aggregated response is returned once the stream completes.
    ///
    /// Fallback applies only to connection-phase failures; once deltas
    /// have flowed, a mid-stream error is terminal for this call.
    pub async fn chat_stream<F>(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        opts: &CallOptions,
        on_event: &mut F,
    ) -> Result<ChatResponse>
    where
        F: FnMut(&StreamEvent) + Send,
    {
        let candidates = self.candidates(opts);
        if candidates.is_empty() {
            return Err(Error::ConfigMissing(
                "no LLM provider available; set ANTHROPIC_API_KEY, OPENAI_API_KEY, \
                 or run a local Ollama server"
                    .into(),
            ));
        }

        let mut last_err = None;
        for provider in candidates {
            let req = self.build_request(&provider, messages, tools, opts);
            let connect = tokio::time::timeout(self.timeout, provider.chat_stream(&req)).await;
            let stream = match connect {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) if e.is_retriable() => {
                    tracing::warn!(
                        provider = provider.provider_id(),
                        error = %e,
                        "stream connect failed, trying next chain member"
                    );
                    last_err = Some(e);
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    last_err = Some(Error::Timeout(format!(
                        "provider '{}' did not open a stream within {}s",
                        provider.provider_id(),
                        self.timeout.as_secs()
                    )));
                    continue;
                }
            };

            let mut aggregate =
                tokio::time::timeout(self.timeout, consume_stream(stream, on_event))
                    .await
                    .map_err(|_| {
                        Error::Timeout(format!(
                            "provider '{}' stream stalled past {}s",
                            provider.provider_id(),
                            self.timeout.as_secs()
                        ))
                    })??;
            if aggregate.model.is_empty() {
                aggregate.model = provider.provider_id().to_string();
            }
            return Ok(aggregate);
        }
        Err(last_err.unwrap_or_else(|| Error::Provider {
            provider: "router".into(),
            message: "all providers in the fallback chain failed".into(),
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream aggregation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drain a provider stream, forwarding every event to `on_event` and
/// assembling the final [`ChatResponse`] in a caller-local slot.
pub async fn consume_stream<F>(
    mut stream: osa_domain::stream::BoxStream<'static, Result<StreamEvent>>,
    on_event: &mut F,
) -> Result<ChatResponse>
where
    F: FnMut(&StreamEvent) + Send,
{
    let mut resp = ChatResponse::default();
    // call_id -> (tool_name, argument buffer); order preserved separately.
    let mut open: HashMap<String, (String, String)> = HashMap::new();
    let mut open_order: Vec<String> = Vec::new();
    let mut thinking_buf = String::new();

    while let Some(event) = stream.next().await {
        let event = event?;
        on_event(&event);
        match event {
            StreamEvent::Token { text } => resp.content.push_str(&text),
            StreamEvent::Thinking { text } => thinking_buf.push_str(&text),
            StreamEvent::ThinkingFinished { text, signature } => {
                thinking_buf.clear();
                resp.thinking.push(ThinkingBlock { text, signature });
            }
            StreamEvent::ToolCallStarted { call_id, tool_name } => {
                open.insert(call_id.clone(), (tool_name, String::new()));
                open_order.push(call_id);
            }
            StreamEvent::ToolCallDelta { call_id, delta } => {
                if let Some((_, buf)) = open.get_mut(&call_id) {
                    buf.push_str(&delta);
                }
            }
            StreamEvent::ToolCallFinished {
                call_id,
                tool_name,
                arguments,
            } => {
                open.remove(&call_id);
                open_order.retain(|c| c != &call_id);
                resp.tool_calls.push(ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                });
            }
            StreamEvent::Done {
                usage,
                finish_reason,
            } => {
                if usage.is_some() {
                    resp.usage = usage;
                }
                if resp.finish_reason.is_none() {
                    resp.finish_reason = finish_reason;
                }
            }
            StreamEvent::Error { message } => {
                return Err(Error::Provider {
                    provider: "stream".into(),
                    message,
                });
            }
        }
    }

    // Flush calls that streamed start/delta but no finish marker.
    for call_id in open_order {
        if let Some((tool_name, args)) = open.remove(&call_id) {
            let arguments = if args.trim().is_empty() {
                serde_json::Value::Object(Default::default())
            } else {
                serde_json::from_str(&args).unwrap_or_else(|e| {
                    tracing::warn!(
                        call_id = %call_id,
                        tool = %tool_name,
                        error = %e,
                        "tool call arguments are not valid JSON; defaulting to empty object"
                    );
                    serde_json::Value::Object(Default::default())
                })
            };
            resp.tool_calls.push(ToolCall {
                call_id,
                tool_name,
                arguments,
            });
        }
    }

    // Delta-only thinking (no signed block): keep the text.
    if resp.thinking.is_empty() && !thinking_buf.is_empty() {
        resp.thinking.push(ThinkingBlock {
            text: thinking_buf,
            signature: None,
        });
    }

    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;
    use osa_domain::stream::Usage;

    fn config_with(map: &[(&str, &str)]) -> Config {
        let owned: HashMap<String, String> = map
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(&move |key| owned.get(key).cloned())
    }

    fn router_with(providers: Vec<Arc<dyn LlmProvider>>, config: &Config) -> ProviderRouter {
        ProviderRouter::new(Arc::new(ProviderRegistry::with_providers(providers)), config)
    }

    #[tokio::test]
    async fn chat_uses_first_candidate() {
        let mock = Arc::new(MockProvider::new("anthropic"));
        mock.push_text("hello from mock");
        let config = config_with(&[]);
        let router = router_with(vec![mock.clone()], &config);

        let resp = router
            .chat(&[Message::user("hi")], &[], &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.content, "hello from mock");
        assert_eq!(mock.request_count(), 1);
    }

    #[tokio::test]
    async fn chat_falls_back_on_retriable_error() {
        let primary = Arc::new(MockProvider::new("anthropic"));
        primary.push_error(Error::Http("connection refused".into()));
        let fallback = Arc::new(MockProvider::new("openai"));
        fallback.push_text("fallback answer");

        let config = config_with(&[("OSA_FALLBACK_CHAIN", "anthropic,openai")]);
        let router = router_with(vec![primary, fallback.clone()], &config);

        let resp = router
            .chat(&[Message::user("hi")], &[], &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.content, "fallback answer");
    }

    #[tokio::test]
    async fn chat_non_retriable_error_is_terminal() {
        let primary = Arc::new(MockProvider::new("anthropic"));
        primary.push_error(Error::Provider {
            provider: "anthropic".into(),
            message: "HTTP 400 - maximum context length exceeded".into(),
        });
        let fallback = Arc::new(MockProvider::new("openai"));
        fallback.push_text("should not be reached");

        let config = config_with(&[("OSA_FALLBACK_CHAIN", "anthropic,openai")]);
        let router = router_with(vec![primary, fallback.clone()], &config);

        let err = router
            .chat(&[Message::user("hi")], &[], &CallOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_context_overflow());
        assert_eq!(fallback.request_count(), 0);
    }

    #[tokio::test]
    async fn explicit_provider_override_skips_chain() {
        let a = Arc::new(MockProvider::new("anthropic"));
        let b = Arc::new(MockProvider::new("openai"));
        b.push_text("from openai");

        let config = config_with(&[("OSA_FALLBACK_CHAIN", "anthropic,openai")]);
        let router = router_with(vec![a.clone(), b], &config);

        let opts = CallOptions {
            provider: Some("openai".into()),
            ..Default::default()
        };
        let resp = router.chat(&[Message::user("hi")], &[], &opts).await.unwrap();
        assert_eq!(resp.content, "from openai");
        assert_eq!(a.request_count(), 0);
    }

    #[tokio::test]
    async fn chat_stream_aggregates_events() {
        let mock = Arc::new(MockProvider::new("anthropic"));
        mock.push_response(ChatResponse {
            content: "streamed".into(),
            tool_calls: vec![ToolCall {
                call_id: "tc_1".into(),
                tool_name: "file_read".into(),
                arguments: serde_json::json!({"path": "x"}),
            }],
            usage: Some(Usage {
                prompt_tokens: 3,
                completion_tokens: 4,
                total_tokens: 7,
            }),
            ..Default::default()
        });

        let config = config_with(&[]);
        let router = router_with(vec![mock], &config);

        let mut tokens = String::new();
        let resp = router
            .chat_stream(
                &[Message::user("hi")],
                &[],
                &CallOptions::default(),
                &mut |ev| {
                    if let StreamEvent::Token { text } = ev {
                        tokens.push_str(text);
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(tokens, "streamed");
        assert_eq!(resp.content, "streamed");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.usage.unwrap().total_tokens, 7);
    }

    #[tokio::test]
    async fn no_providers_is_config_missing() {
        let config = config_with(&[]);
        let router = router_with(vec![], &config);
        let err = router
            .chat(&[Message::user("hi")], &[], &CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigMissing(_)));
    }
}
