//! The per-session reasoning loop.
//!
//! One `run_turn` call is one user message processed to completion:
//! classify, gate noise, persist, compact, optionally plan, then the
//! bounded ReAct loop (stream → tools → re-prompt) until the model stops
//! requesting tools or the iteration cap is hit. Context-overflow errors
//! are compacted and retried without counting against the cap.

use std::time::Instant;

use osa_domain::error::{Error, Result};
use osa_domain::message::{ContentPart, Message, MessageContent, Role, ToolCall};
use osa_domain::signal::Signal;
use osa_domain::stream::{StreamEvent, Usage};
use osa_providers::{CallOptions, ChatResponse};
use osa_sessions::{LastMeta, TranscriptLine, TranscriptWriter};
use osa_tools::{HookDecision, HookPayload, PostPayload, ToolOutput};

use crate::bus::{Event, ToolCallPhase};
use crate::classifier::{self, NoiseReason, NoiseVerdict};
use crate::context::{BudgetReport, SessionView};
use crate::state::AppState;

/// Overflow compact-and-retry attempts per call.
const MAX_OVERFLOW_RETRIES: u32 = 3;

const OVERFLOW_REPLY: &str =
    "I've exceeded the context window. Try breaking your request into smaller parts.";
const ERROR_REPLY: &str = "I encountered an error processing your request.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / result types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub message: String,
    /// Per-call provider/model overrides; persist for the session's life.
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Set by the caller after approving a returned plan.
    pub skip_plan: bool,
}

#[derive(Debug, Clone)]
pub enum TurnOutcome {
    /// Normal completion.
    Final(String),
    /// Plan-mode produced a plan awaiting approval.
    Plan(String),
    /// The message was gated as noise; canned acknowledgment.
    Noise(String),
}

impl TurnOutcome {
    pub fn text(&self) -> &str {
        match self {
            TurnOutcome::Final(t) | TurnOutcome::Plan(t) | TurnOutcome::Noise(t) => t,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnResult {
    pub outcome: TurnOutcome,
    pub signal: Signal,
    pub iterations: u32,
    pub tools_used: Vec<String>,
    /// True when the reply is an error surface (provider failure or
    /// exhausted overflow retries) rather than real model output.
    pub had_error: bool,
}

/// Mutable per-session state owned by the session actor. Everything here
/// is serialized by the actor's mailbox.
pub struct SessionCtx {
    pub session_id: String,
    pub channel: String,
    pub messages: Vec<Message>,
    pub plan_mode: bool,
    pub status: SessionStatus,
    pub signal: Option<Signal>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Thinking,
    PlanMode,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn run_turn(
    state: &AppState,
    sess: &mut SessionCtx,
    req: TurnRequest,
) -> Result<TurnResult> {
    // Per-call overrides stick for the life of the session.
    if req.provider.is_some() {
        sess.provider = req.provider.clone();
    }
    if req.model.is_some() {
        sess.model = req.model.clone();
    }
    state
        .sessions
        .set_overrides(&sess.session_id, req.provider.clone(), req.model.clone());

    // ── Classify & gate ───────────────────────────────────────────
    let signal = classifier::fast(&req.message, &sess.channel);
    sess.signal = Some(signal.clone());

    if let NoiseVerdict::Noise { reason, ack } = classifier::filter(&req.message, &signal) {
        persist(state, sess, user_line(sess, &req.message));
        persist(state, sess, TranscriptWriter::line("assistant", &ack));
        sess.messages.push(Message::user(req.message.clone()));
        sess.messages.push(Message::assistant(ack.clone()));
        if reason == NoiseReason::LowWeight {
            state.bus.emit_system(
                "signal_low_weight",
                serde_json::json!({
                    "session_id": sess.session_id,
                    "weight": signal.weight,
                }),
            );
        }
        tracing::debug!(
            session_id = %sess.session_id,
            reason = reason.as_str(),
            "message gated as noise"
        );
        return Ok(TurnResult {
            outcome: TurnOutcome::Noise(ack),
            signal,
            iterations: 0,
            tools_used: Vec::new(),
            had_error: false,
        });
    }

    // ── Persist & normalize history ───────────────────────────────
    persist(state, sess, user_line(sess, &req.message));
    sess.messages = state
        .compactor
        .maybe_compact(std::mem::take(&mut sess.messages))
        .await;
    sess.messages.push(Message::user(req.message.clone()));

    // ── Plan-mode gate ────────────────────────────────────────────
    if should_plan(state, sess, &signal, req.skip_plan) {
        sess.status = SessionStatus::PlanMode;
        match plan_call(state, sess, &signal).await {
            Ok(plan) => {
                persist(state, sess, TranscriptWriter::line("assistant", &plan));
                sess.messages.push(Message::assistant(plan.clone()));
                sess.status = SessionStatus::Idle;
                return Ok(TurnResult {
                    outcome: TurnOutcome::Plan(plan),
                    signal,
                    iterations: 1,
                    tools_used: Vec::new(),
                    had_error: false,
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "plan call failed, continuing with normal execution");
            }
        }
    }

    // ── ReAct loop ────────────────────────────────────────────────
    sess.status = SessionStatus::Thinking;
    let tool_defs = state.tools.list_direct();
    let max_iterations = state.config.max_iterations;
    let mut iterations: u32 = 0;
    let mut overflow_retries: u32 = 0;
    let mut tools_used: Vec<String> = Vec::new();
    let mut total_usage = Usage::default();
    let mut last_report: Option<BudgetReport> = None;
    let mut had_error = false;
    let final_text;

    loop {
        if iterations >= max_iterations {
            final_text = format!(
                "I stopped after {max_iterations} reasoning steps without finishing. \
                 Consider narrowing the request."
            );
            persist(state, sess, TranscriptWriter::line("assistant", &final_text));
            sess.messages.push(Message::assistant(final_text.clone()));
            break;
        }

        let (system_msg, report) = state.assembler.build(
            &SessionView {
                session_id: &sess.session_id,
                channel: &sess.channel,
                messages: &sess.messages,
                plan_overlay: false,
            },
            Some(&signal),
        );
        last_report = Some(report);

        let mut call_messages = Vec::with_capacity(sess.messages.len() + 1);
        call_messages.push(system_msg);
        call_messages.extend(sess.messages.iter().cloned());

        let opts = call_options(state, sess);
        state.bus.emit(Event::LlmRequest {
            session_id: sess.session_id.clone(),
            provider: opts.provider.clone(),
            model: opts.model.clone(),
            message_count: call_messages.len(),
        });

        let session_id = sess.session_id.clone();
        let bus = state.bus.clone();
        let started = Instant::now();
        let result = state
            .router
            .chat_stream(&call_messages, &tool_defs, &opts, &mut |ev| match ev {
                StreamEvent::Token { text } => bus.emit(Event::StreamingToken {
                    session_id: session_id.clone(),
                    text: text.clone(),
                }),
                StreamEvent::Thinking { text } => bus.emit(Event::ThinkingDelta {
                    session_id: session_id.clone(),
                    text: text.clone(),
                }),
                _ => {}
            })
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) if e.is_context_overflow() => {
                if overflow_retries < MAX_OVERFLOW_RETRIES {
                    overflow_retries += 1;
                    tracing::warn!(
                        session_id = %sess.session_id,
                        attempt = overflow_retries,
                        "context overflow; compacting and retrying"
                    );
                    sess.messages = state
                        .compactor
                        .maybe_compact(std::mem::take(&mut sess.messages))
                        .await;
                    continue;
                }
                had_error = true;
                final_text = OVERFLOW_REPLY.to_string();
                persist(state, sess, TranscriptWriter::line("assistant", &final_text));
                sess.messages.push(Message::assistant(final_text.clone()));
                break;
            }
            Err(e) => {
                tracing::error!(session_id = %sess.session_id, error = %e, "llm call failed");
                had_error = true;
                final_text = ERROR_REPLY.to_string();
                persist(state, sess, TranscriptWriter::line("assistant", &final_text));
                sess.messages.push(Message::assistant(final_text.clone()));
                break;
            }
        };

        let usage = resp.usage.clone().unwrap_or_default();
        total_usage.add(&usage);
        state.bus.emit(Event::LlmResponse {
            session_id: sess.session_id.clone(),
            duration_ms,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            tool_call_count: resp.tool_calls.len(),
        });
        record_cost(state, sess, &opts, &resp, &usage);

        if resp.tool_calls.is_empty() {
            final_text = resp.content.clone();
            let msg = assistant_message_for(&resp);
            persist(state, sess, assistant_line(&resp));
            sess.messages.push(msg);
            break;
        }

        // The model wants tools. Record the assistant turn, then run the
        // calls strictly in the order the model returned them.
        for tc in &resp.tool_calls {
            if !tools_used.contains(&tc.tool_name) {
                tools_used.push(tc.tool_name.clone());
            }
        }
        persist(state, sess, assistant_line(&resp));
        sess.messages.push(assistant_message_for(&resp));

        for tc in &resp.tool_calls {
            let (message, line) = execute_tool(state, sess, tc).await;
            sess.messages.push(message);
            persist(state, sess, line);
        }

        iterations += 1;
    }

    // ── Finalize ──────────────────────────────────────────────────
    if let Some(report) = &last_report {
        state.bus.emit_system(
            "context_pressure",
            serde_json::json!({
                "session_id": sess.session_id,
                "estimated_tokens": report.conversation_tokens + report.system_tokens,
                "max_tokens": report.max_tokens,
                "utilization": report.utilization(),
            }),
        );
    }
    state.bus.emit(Event::AgentResponse {
        session_id: sess.session_id.clone(),
        content: final_text.clone(),
        iterations,
    });
    state.sessions.record_usage(
        &sess.session_id,
        total_usage.prompt_tokens as u64,
        total_usage.completion_tokens as u64,
    );
    state.sessions.set_last_meta(
        &sess.session_id,
        LastMeta {
            iterations,
            tools_used: tools_used.clone(),
        },
    );

    sess.status = SessionStatus::Idle;
    Ok(TurnResult {
        outcome: TurnOutcome::Final(final_text),
        signal,
        iterations,
        tools_used,
        had_error,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plan mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn should_plan(state: &AppState, sess: &SessionCtx, signal: &Signal, skip_plan: bool) -> bool {
    let plan = &state.config.plan;
    plan.enabled
        && sess.plan_mode
        && !skip_plan
        && signal.weight >= plan.weight_threshold
        && plan.modes.iter().any(|m| m == signal.mode.as_str())
        && plan.types.iter().any(|t| t == &signal.kind)
}

/// One tool-less LLM call with the plan overlay active.
async fn plan_call(state: &AppState, sess: &SessionCtx, signal: &Signal) -> Result<String> {
    let (system_msg, _) = state.assembler.build(
        &SessionView {
            session_id: &sess.session_id,
            channel: &sess.channel,
            messages: &sess.messages,
            plan_overlay: true,
        },
        Some(signal),
    );
    let mut call_messages = vec![system_msg];
    call_messages.extend(sess.messages.iter().cloned());

    let opts = call_options(state, sess);
    let resp = state.router.chat(&call_messages, &[], &opts).await?;
    if let Some(usage) = &resp.usage {
        record_cost(state, sess, &opts, &resp, usage);
    }
    Ok(resp.content)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one tool call through the hook pipeline and the registry's
/// lock-free path. Returns the tool message plus its transcript line.
async fn execute_tool(
    state: &AppState,
    sess: &SessionCtx,
    tc: &ToolCall,
) -> (Message, TranscriptLine) {
    let args_hint = truncate_str(
        &serde_json::to_string(&tc.arguments).unwrap_or_default(),
        120,
    );
    state.bus.emit(Event::ToolCall {
        session_id: sess.session_id.clone(),
        name: tc.tool_name.clone(),
        phase: ToolCallPhase::Start,
        args: args_hint.clone(),
        duration_ms: None,
    });

    let payload = HookPayload {
        tool_name: tc.tool_name.clone(),
        arguments: tc.arguments.clone(),
        session_id: Some(sess.session_id.clone()),
    };
    let started = Instant::now();

    let (content, image, is_error) = match state.hooks.run_pre(&payload) {
        HookDecision::Blocked { reason } => (format!("Blocked: {reason}"), None, true),
        HookDecision::Continue => {
            match state.tools.execute_direct(&tc.tool_name, &tc.arguments).await {
                Ok(ToolOutput::Text(text)) => (text, None, false),
                Ok(ToolOutput::Image { data, media_type }) => (
                    format!("[image: {media_type}]"),
                    Some((data, media_type)),
                    false,
                ),
                Err(Error::ToolBlocked(reason)) => (format!("Blocked: {reason}"), None, true),
                Err(e) => (format!("Error: {e}"), None, true),
            }
        }
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    state.hooks.run_post(PostPayload {
        tool_name: tc.tool_name.clone(),
        arguments: tc.arguments.clone(),
        session_id: Some(sess.session_id.clone()),
        result: content.clone(),
        is_error,
        duration_ms,
    });

    state.bus.emit(Event::ToolCall {
        session_id: sess.session_id.clone(),
        name: tc.tool_name.clone(),
        phase: ToolCallPhase::End,
        args: args_hint,
        duration_ms: Some(duration_ms),
    });

    // Image results become structured content blocks alongside the
    // textual tool_result.
    let mut parts = vec![ContentPart::ToolResult {
        tool_use_id: tc.call_id.clone(),
        content: content.clone(),
        is_error,
    }];
    if let Some((data, media_type)) = image {
        parts.push(ContentPart::Image { data, media_type });
    }
    let message = Message {
        role: Role::Tool,
        content: MessageContent::Parts(parts),
    };

    let mut line = TranscriptWriter::line("tool", &content);
    line.tool_call_id = Some(tc.call_id.clone());
    (message, line)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn call_options(state: &AppState, sess: &SessionCtx) -> CallOptions {
    let mut opts = CallOptions {
        provider: sess.provider.clone(),
        model: sess.model.clone(),
        ..Default::default()
    };
    if state.config.thinking_enabled {
        let supported = state
            .router
            .primary(&opts)
            .map(|p| p.capabilities().supports_thinking)
            .unwrap_or(false);
        if supported {
            opts.thinking_budget = Some(state.config.thinking_budget_tokens);
        }
    }
    opts
}

fn record_cost(
    state: &AppState,
    sess: &SessionCtx,
    opts: &CallOptions,
    resp: &ChatResponse,
    usage: &Usage,
) {
    let provider = state
        .router
        .primary(opts)
        .map(|p| p.provider_id().to_string())
        .unwrap_or_else(|| "default".to_string());
    state.budget.record_cost(
        &provider,
        &resp.model,
        usage.prompt_tokens,
        usage.completion_tokens,
        &sess.session_id,
    );
}

/// Assistant message preserving thinking blocks and tool-use parts.
pub(crate) fn assistant_message_for(resp: &ChatResponse) -> Message {
    if resp.thinking.is_empty() && resp.tool_calls.is_empty() {
        return Message::assistant(resp.content.clone());
    }
    let mut parts = Vec::new();
    for block in &resp.thinking {
        parts.push(ContentPart::Thinking {
            text: block.text.clone(),
            signature: block.signature.clone(),
        });
    }
    if !resp.content.is_empty() {
        parts.push(ContentPart::Text {
            text: resp.content.clone(),
        });
    }
    for tc in &resp.tool_calls {
        parts.push(ContentPart::ToolUse {
            id: tc.call_id.clone(),
            name: tc.tool_name.clone(),
            input: tc.arguments.clone(),
        });
    }
    Message {
        role: Role::Assistant,
        content: MessageContent::Parts(parts),
    }
}

fn assistant_line(resp: &ChatResponse) -> TranscriptLine {
    let mut line = TranscriptWriter::line("assistant", &resp.content);
    if !resp.tool_calls.is_empty() {
        line.tool_calls = Some(resp.tool_calls.clone());
    }
    if !resp.thinking.is_empty() {
        line.thinking_blocks = serde_json::to_value(&resp.thinking).ok();
    }
    line
}

fn user_line(sess: &SessionCtx, message: &str) -> TranscriptLine {
    let mut line = TranscriptWriter::line("user", message);
    line.channel = Some(sess.channel.clone());
    line
}

fn persist(state: &AppState, sess: &SessionCtx, line: TranscriptLine) {
    if let Err(e) = state.transcripts.append(&sess.session_id, &[line]) {
        tracing::warn!(
            session_id = %sess.session_id,
            error = %e,
            "failed to persist transcript line"
        );
    }
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{state_with_mock, EchoTool};
    use std::sync::Arc;

    fn ctx(session_id: &str) -> SessionCtx {
        SessionCtx {
            session_id: session_id.into(),
            channel: "cli".into(),
            messages: Vec::new(),
            plan_mode: false,
            status: SessionStatus::Idle,
            signal: None,
            provider: None,
            model: None,
        }
    }

    fn drain_kinds(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match &event {
                Event::LlmRequest { .. } => "llm_request".to_string(),
                Event::LlmResponse { .. } => "llm_response".to_string(),
                Event::ToolCall { phase, name, .. } => format!("tool_call:{phase:?}:{name}"),
                Event::AgentResponse { .. } => "agent_response".to_string(),
                Event::StreamingToken { .. } => "token".to_string(),
                Event::ThinkingDelta { .. } => "thinking".to_string(),
                Event::System { event, .. } => format!("system:{event}"),
            });
        }
        kinds
    }

    #[tokio::test]
    async fn noise_passthrough_skips_llm() {
        let (state, mock, _guard) = state_with_mock(&[]);
        let mut rx = state.bus.subscribe();
        let mut sess = ctx("noise-1");
        state
            .sessions
            .insert(osa_sessions::SessionMeta::new("noise-1", "cli"));

        let result = run_turn(
            &state,
            &mut sess,
            TurnRequest {
                message: "thanks".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        match &result.outcome {
            TurnOutcome::Noise(ack) => assert_eq!(ack, "👍"),
            other => panic!("expected noise outcome, got {other:?}"),
        }
        assert_eq!(mock.request_count(), 0);
        let kinds = drain_kinds(&mut rx);
        assert!(!kinds.contains(&"llm_request".to_string()));

        // Both lines persisted.
        let lines = state.transcripts.read("noise-1").unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].role, "user");
        assert_eq!(lines[1].role, "assistant");
        assert_eq!(lines[1].content, "👍");
    }

    #[tokio::test]
    async fn single_tool_round_trip() {
        let (state, mock, _guard) = state_with_mock(&[]);
        state.tools.register(
            osa_domain::message::ToolDefinition::new(
                "file_read",
                "Read a file",
                serde_json::json!({"type": "object"}),
            ),
            Arc::new(EchoTool("contents of foo.txt".into())),
        );
        mock.push_tool_call("tc_1", "file_read", serde_json::json!({"path": "foo.txt"}));
        mock.push_text("foo.txt says: contents of foo.txt");

        let mut rx = state.bus.subscribe();
        let mut sess = ctx("tool-1");
        state
            .sessions
            .insert(osa_sessions::SessionMeta::new("tool-1", "cli"));

        let result = run_turn(
            &state,
            &mut sess,
            TurnRequest {
                message: "show me file foo.txt".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(matches!(result.outcome, TurnOutcome::Final(_)));
        assert_eq!(result.iterations, 1);
        assert_eq!(result.tools_used, vec!["file_read"]);
        assert_eq!(mock.request_count(), 2);

        let kinds = drain_kinds(&mut rx);
        assert_eq!(
            kinds.iter().filter(|k| *k == "llm_request").count(),
            2,
            "two llm_request events"
        );
        assert!(kinds.contains(&"tool_call:Start:file_read".to_string()));
        assert!(kinds.contains(&"tool_call:End:file_read".to_string()));
        assert!(kinds.contains(&"agent_response".to_string()));
        assert!(kinds.iter().any(|k| k.starts_with("system:context_pressure")));

        // Tool-call pairing in the persisted log: assistant tool_calls then
        // a tool line with the matching id before the next assistant line.
        let lines = state.transcripts.read("tool-1").unwrap();
        let assistant_idx = lines
            .iter()
            .position(|l| l.role == "assistant" && l.tool_calls.is_some())
            .unwrap();
        assert_eq!(lines[assistant_idx + 1].role, "tool");
        assert_eq!(lines[assistant_idx + 1].tool_call_id.as_deref(), Some("tc_1"));
    }

    #[tokio::test]
    async fn overflow_compacts_and_retries() {
        let (state, mock, _guard) = state_with_mock(&[]);
        mock.push_error(osa_domain::Error::Provider {
            provider: "anthropic".into(),
            message: "HTTP 400 - maximum context length exceeded".into(),
        });
        mock.push_text("recovered fine");

        let mut sess = ctx("overflow-1");
        state
            .sessions
            .insert(osa_sessions::SessionMeta::new("overflow-1", "cli"));

        let result = run_turn(
            &state,
            &mut sess,
            TurnRequest {
                message: "summarize everything we've discussed".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        match &result.outcome {
            TurnOutcome::Final(text) => assert_eq!(text, "recovered fine"),
            other => panic!("expected final, got {other:?}"),
        }
        // The retry happened without consuming a tool iteration.
        assert_eq!(result.iterations, 0);
        assert_eq!(mock.request_count(), 2);
    }

    #[tokio::test]
    async fn persistent_overflow_returns_user_facing_reply() {
        let (state, mock, _guard) = state_with_mock(&[]);
        for _ in 0..4 {
            mock.push_error(osa_domain::Error::Provider {
                provider: "anthropic".into(),
                message: "context_length_exceeded".into(),
            });
        }

        let mut sess = ctx("overflow-2");
        state
            .sessions
            .insert(osa_sessions::SessionMeta::new("overflow-2", "cli"));

        let result = run_turn(
            &state,
            &mut sess,
            TurnRequest {
                message: "do the big thing now please".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        match &result.outcome {
            TurnOutcome::Final(text) => assert_eq!(text, OVERFLOW_REPLY),
            other => panic!("expected final, got {other:?}"),
        }
        assert_eq!(mock.request_count(), 4);
    }

    #[tokio::test]
    async fn blocked_tool_becomes_blocked_result() {
        let (state, mock, _guard) = state_with_mock(&[]);
        state.tools.register(
            osa_domain::message::ToolDefinition::new(
                "shell_execute",
                "Run a command",
                serde_json::json!({"type": "object"}),
            ),
            Arc::new(EchoTool("should never run".into())),
        );
        state.hooks.register_pre(Arc::new(|p| {
            if p.tool_name == "shell_execute" {
                osa_tools::HookDecision::Blocked {
                    reason: "shell disabled in this deployment".into(),
                }
            } else {
                osa_tools::HookDecision::Continue
            }
        }));
        mock.push_tool_call("tc_9", "shell_execute", serde_json::json!({"command": "ls"}));
        mock.push_text("understood, the shell is unavailable");

        let mut sess = ctx("blocked-1");
        state
            .sessions
            .insert(osa_sessions::SessionMeta::new("blocked-1", "cli"));

        run_turn(
            &state,
            &mut sess,
            TurnRequest {
                message: "run ls for me".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let lines = state.transcripts.read("blocked-1").unwrap();
        let tool_line = lines.iter().find(|l| l.role == "tool").unwrap();
        assert!(tool_line.content.starts_with("Blocked: shell disabled"));
    }

    #[tokio::test]
    async fn plan_mode_returns_plan_without_tools() {
        let (state, mock, _guard) = state_with_mock(&[("OSA_PLAN_MODE", "true")]);
        mock.push_text("1. inspect\n2. change\n3. verify");

        let mut sess = ctx("plan-1");
        sess.plan_mode = true;
        state
            .sessions
            .insert(osa_sessions::SessionMeta::new("plan-1", "cli"));

        let result = run_turn(
            &state,
            &mut sess,
            TurnRequest {
                message: "deploy the new release to production".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        match &result.outcome {
            TurnOutcome::Plan(plan) => assert!(plan.contains("1. inspect")),
            other => panic!("expected plan, got {other:?}"),
        }
        // The plan call sent no tool definitions.
        let reqs = mock.requests();
        assert_eq!(reqs.len(), 1);
        assert!(reqs[0].tools.is_empty());

        // skip_plan re-invocation executes normally.
        mock.push_text("deployed");
        let result = run_turn(
            &state,
            &mut sess,
            TurnRequest {
                message: "deploy the new release to production".into(),
                skip_plan: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(matches!(result.outcome, TurnOutcome::Final(_)));
    }

    #[tokio::test]
    async fn react_loop_is_bounded_by_max_iterations() {
        let (state, mock, _guard) = state_with_mock(&[("OSA_MAX_ITERATIONS", "2")]);
        state.tools.register(
            osa_domain::message::ToolDefinition::new(
                "file_read",
                "Read a file",
                serde_json::json!({"type": "object"}),
            ),
            Arc::new(EchoTool("data".into())),
        );
        // The model never stops asking for tools.
        for i in 0..5 {
            mock.push_tool_call(format!("tc_{i}"), "file_read", serde_json::json!({"path": "x"}));
        }

        let mut sess = ctx("bounded-1");
        state
            .sessions
            .insert(osa_sessions::SessionMeta::new("bounded-1", "cli"));

        let result = run_turn(
            &state,
            &mut sess,
            TurnRequest {
                message: "read the file over and over".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(result.iterations, 2);
        // Two chat calls consumed; the cap stopped the third.
        assert_eq!(mock.request_count(), 2);
        match &result.outcome {
            TurnOutcome::Final(text) => assert!(text.contains("stopped after 2")),
            other => panic!("expected final, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn last_meta_counts_assistant_tool_requests_only() {
        let (state, mock, _guard) = state_with_mock(&[]);
        state.tools.register(
            osa_domain::message::ToolDefinition::new(
                "file_read",
                "Read a file",
                serde_json::json!({"type": "object"}),
            ),
            Arc::new(EchoTool("data".into())),
        );
        mock.push_tool_call("tc_1", "file_read", serde_json::json!({"path": "a"}));
        mock.push_tool_call("tc_2", "file_read", serde_json::json!({"path": "b"}));
        mock.push_text("done");

        let mut sess = ctx("meta-1");
        state
            .sessions
            .insert(osa_sessions::SessionMeta::new("meta-1", "cli"));

        run_turn(
            &state,
            &mut sess,
            TurnRequest {
                message: "read file a then file b".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let meta = state.sessions.get("meta-1").unwrap();
        let last = meta.last_meta.unwrap();
        assert_eq!(last.iterations, 2);
        // Distinct tool names, not per-call counts.
        assert_eq!(last.tools_used, vec!["file_read"]);
    }
}
