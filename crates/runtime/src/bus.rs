//! Process-wide typed event bus.
//!
//! Two consumption modes: registered handlers (internal wiring, invoked
//! inline per emit) and a broadcast feed (front-ends, CLI streaming).
//! Emission never fails and never propagates a handler's panic; handlers
//! see events in per-emitter order, with no ordering guarantee between
//! handlers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

/// Phase of a tool call event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallPhase {
    Start,
    End,
}

/// Everything the core emits.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    LlmRequest {
        session_id: String,
        provider: Option<String>,
        model: Option<String>,
        message_count: usize,
    },
    LlmResponse {
        session_id: String,
        duration_ms: u64,
        prompt_tokens: u32,
        completion_tokens: u32,
        tool_call_count: usize,
    },
    ToolCall {
        session_id: String,
        name: String,
        phase: ToolCallPhase,
        /// Short argument preview for UIs.
        args: String,
        duration_ms: Option<u64>,
    },
    AgentResponse {
        session_id: String,
        content: String,
        iterations: u32,
    },
    StreamingToken {
        session_id: String,
        text: String,
    },
    ThinkingDelta {
        session_id: String,
        text: String,
    },
    /// Everything else: `signal_low_weight`, `heartbeat_*`,
    /// `context_pressure`, `budget_*`, `cost_recorded`, `treasury_*`,
    /// `orchestrator_*`, `task_tracker_*`, `skill_created`.
    System {
        event: String,
        data: serde_json::Value,
    },
}

/// Handler registration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    LlmRequest,
    LlmResponse,
    ToolCall,
    AgentResponse,
    StreamingToken,
    ThinkingDelta,
    System,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::LlmRequest { .. } => EventKind::LlmRequest,
            Event::LlmResponse { .. } => EventKind::LlmResponse,
            Event::ToolCall { .. } => EventKind::ToolCall,
            Event::AgentResponse { .. } => EventKind::AgentResponse,
            Event::StreamingToken { .. } => EventKind::StreamingToken,
            Event::ThinkingDelta { .. } => EventKind::ThinkingDelta,
            Event::System { .. } => EventKind::System,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Event::LlmRequest { session_id, .. }
            | Event::LlmResponse { session_id, .. }
            | Event::ToolCall { session_id, .. }
            | Event::AgentResponse { session_id, .. }
            | Event::StreamingToken { session_id, .. }
            | Event::ThinkingDelta { session_id, .. } => Some(session_id),
            Event::System { .. } => None,
        }
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

pub struct EventBus {
    /// `None` kind = receives everything.
    handlers: RwLock<Vec<(Option<EventKind>, Handler)>>,
    feed: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(512);
        Self {
            handlers: RwLock::new(Vec::new()),
            feed,
        }
    }

    /// Register a handler for one event kind (or all kinds with `None`).
    pub fn register(&self, kind: Option<EventKind>, handler: Handler) {
        self.handlers.write().push((kind, handler));
    }

    /// Subscribe to the broadcast feed. Lagging subscribers drop events;
    /// emitters are never blocked.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.feed.subscribe()
    }

    /// Emit an event. Best-effort: handler panics are isolated and a
    /// feed without subscribers is fine.
    pub fn emit(&self, event: Event) {
        let handlers = self.handlers.read().clone();
        for (kind, handler) in handlers {
            if kind.is_some() && kind != Some(event.kind()) {
                continue;
            }
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::warn!(kind = ?event.kind(), "event handler panicked; continuing");
            }
        }
        let _ = self.feed.send(event);
    }

    /// Convenience for `System` events.
    pub fn emit_system(&self, event: &str, data: serde_json::Value) {
        self.emit(Event::System {
            event: event.to_string(),
            data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn handlers_filter_by_kind() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.register(
            Some(EventKind::System),
            Arc::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.emit_system("heartbeat_started", serde_json::json!({}));
        bus.emit(Event::StreamingToken {
            session_id: "s".into(),
            text: "x".into(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_does_not_affect_others_or_emitter() {
        let bus = EventBus::new();
        bus.register(None, Arc::new(|_| panic!("boom")));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.register(
            None,
            Arc::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.emit_system("anything", serde_json::json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broadcast_feed_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit_system("cost_recorded", serde_json::json!({"cost_usd": 0.01}));
        match rx.recv().await.unwrap() {
            Event::System { event, .. } => assert_eq!(event, "cost_recorded"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit_system("no_listeners", serde_json::json!({}));
    }
}
