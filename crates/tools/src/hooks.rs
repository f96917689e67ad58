//! Tool execution hook pipeline.
//!
//! `pre_tool_use` hooks run synchronously before a tool executes; the
//! first `Blocked` decision short-circuits and becomes the tool result.
//! `post_tool_use` hooks run in a spawned task with the payload, result,
//! and duration. Hook failures are isolated: a panicking hook logs and is
//! treated as `Continue`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

/// Payload handed to pre hooks.
#[derive(Debug, Clone)]
pub struct HookPayload {
    pub tool_name: String,
    pub arguments: Value,
    pub session_id: Option<String>,
}

/// Payload handed to post hooks: the pre payload plus outcome.
#[derive(Debug, Clone)]
pub struct PostPayload {
    pub tool_name: String,
    pub arguments: Value,
    pub session_id: Option<String>,
    pub result: String,
    pub is_error: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    Continue,
    Blocked { reason: String },
}

pub type PreHook = Arc<dyn Fn(&HookPayload) -> HookDecision + Send + Sync>;
pub type PostHook = Arc<dyn Fn(&PostPayload) + Send + Sync>;

#[derive(Default)]
pub struct HookPipeline {
    pre: RwLock<Vec<PreHook>>,
    post: RwLock<Vec<PostHook>>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_pre(&self, hook: PreHook) {
        self.pre.write().push(hook);
    }

    pub fn register_post(&self, hook: PostHook) {
        self.post.write().push(hook);
    }

    /// Run pre hooks in registration order; the first `Blocked` wins.
    pub fn run_pre(&self, payload: &HookPayload) -> HookDecision {
        let hooks = self.pre.read().clone();
        for hook in hooks {
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| hook(payload)));
            match outcome {
                Ok(HookDecision::Blocked { reason }) => {
                    return HookDecision::Blocked { reason };
                }
                Ok(HookDecision::Continue) => {}
                Err(_) => {
                    tracing::warn!(
                        tool = %payload.tool_name,
                        "pre_tool_use hook panicked; continuing"
                    );
                }
            }
        }
        HookDecision::Continue
    }

    /// Run post hooks asynchronously (fire-and-forget).
    pub fn run_post(&self, payload: PostPayload) {
        let hooks = self.post.read().clone();
        if hooks.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for hook in hooks {
                if std::panic::catch_unwind(AssertUnwindSafe(|| hook(&payload))).is_err() {
                    tracing::warn!(
                        tool = %payload.tool_name,
                        "post_tool_use hook panicked; continuing"
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn payload(tool: &str) -> HookPayload {
        HookPayload {
            tool_name: tool.into(),
            arguments: serde_json::json!({}),
            session_id: None,
        }
    }

    #[test]
    fn first_blocked_wins() {
        let pipeline = HookPipeline::new();
        pipeline.register_pre(Arc::new(|_| HookDecision::Continue));
        pipeline.register_pre(Arc::new(|_| HookDecision::Blocked {
            reason: "policy".into(),
        }));
        pipeline.register_pre(Arc::new(|_| HookDecision::Blocked {
            reason: "never reached".into(),
        }));

        match pipeline.run_pre(&payload("t")) {
            HookDecision::Blocked { reason } => assert_eq!(reason, "policy"),
            other => panic!("expected Blocked, got {other:?}"),
        }
    }

    #[test]
    fn panicking_hook_is_isolated() {
        let pipeline = HookPipeline::new();
        pipeline.register_pre(Arc::new(|_| panic!("boom")));
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        pipeline.register_pre(Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            HookDecision::Continue
        }));

        assert_eq!(pipeline.run_pre(&payload("t")), HookDecision::Continue);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn post_hooks_run_in_background() {
        let pipeline = HookPipeline::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        pipeline.register_post(Arc::new(move |p| {
            assert_eq!(p.tool_name, "t");
            c.fetch_add(1, Ordering::SeqCst);
        }));

        pipeline.run_post(PostPayload {
            tool_name: "t".into(),
            arguments: serde_json::json!({}),
            session_id: None,
            result: "done".into(),
            is_error: false,
            duration_ms: 3,
        });

        // Give the spawned task a moment.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
