//! Threshold-based history compaction.
//!
//! `maybe_compact` watches the token footprint of a conversation and
//! collapses old history when it crosses the tier thresholds. It never
//! fails: any internal error returns the input unchanged.
//!
//! Tiers on `tokens_before / max_tokens`:
//! - > 0.95  emergency truncation, no LLM call
//! - > 0.85  aggressive LLM summary of the oldest 50%
//! - > 0.80  background LLM summary of the oldest 30%

use chrono::{DateTime, Utc};
use osa_domain::config::Config;
use osa_domain::message::{Message, Role};
use osa_providers::{CallOptions, ProviderRouter};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::context::estimate_messages;

const EMERGENCY_THRESHOLD: f32 = 0.95;
const AGGRESSIVE_THRESHOLD: f32 = 0.85;
const BACKGROUND_THRESHOLD: f32 = 0.80;

/// Non-system messages kept verbatim by the emergency tier.
const EMERGENCY_KEEP: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct CompactorStats {
    pub compaction_count: u64,
    pub tokens_saved: u64,
    pub last_compaction: Option<DateTime<Utc>>,
}

pub struct Compactor {
    config: Arc<Config>,
    router: Arc<ProviderRouter>,
    stats: Mutex<CompactorStats>,
}

impl Compactor {
    pub fn new(config: Arc<Config>, router: Arc<ProviderRouter>) -> Self {
        Self {
            config,
            router,
            stats: Mutex::new(CompactorStats::default()),
        }
    }

    pub fn stats(&self) -> CompactorStats {
        self.stats.lock().clone()
    }

    /// Compact when over threshold; otherwise (and on any failure) return
    /// the input unchanged.
    pub async fn maybe_compact(&self, messages: Vec<Message>) -> Vec<Message> {
        let tokens_before = estimate_messages(&messages);
        let ratio = tokens_before as f32 / self.config.max_context_tokens.max(1) as f32;

        if ratio <= BACKGROUND_THRESHOLD {
            return messages;
        }

        let result = if ratio > EMERGENCY_THRESHOLD {
            Ok(emergency_truncate(&messages))
        } else if ratio > AGGRESSIVE_THRESHOLD {
            self.summarize(&messages, 0.50, "Summarize the following conversation as key \
                facts, bullet points only. No prose, no commentary.")
                .await
        } else {
            self.summarize(&messages, 0.30, "Summarize the following conversation. Preserve \
                decisions and key facts; keep open questions explicit.")
                .await
        };

        let compacted = match result {
            Ok(compacted) => compacted,
            Err(e) => {
                // Summarization failed; the deterministic tier still works.
                tracing::warn!(error = %e, "compaction summary failed, using emergency truncation");
                emergency_truncate(&messages)
            }
        };

        let tokens_after = estimate_messages(&compacted);
        if tokens_after >= tokens_before {
            return messages;
        }

        {
            let mut stats = self.stats.lock();
            stats.compaction_count += 1;
            stats.tokens_saved += (tokens_before - tokens_after) as u64;
            stats.last_compaction = Some(Utc::now());
        }
        tracing::info!(
            tokens_before,
            tokens_after,
            tokens_saved = tokens_before - tokens_after,
            "conversation compacted"
        );
        compacted
    }

    /// LLM-summarize the oldest `fraction` of non-system messages and
    /// replace them with a single `[Context Summary]` system message.
    async fn summarize(
        &self,
        messages: &[Message],
        fraction: f32,
        instruction: &str,
    ) -> osa_domain::Result<Vec<Message>> {
        let (system, non_system) = partition(messages);
        let cut = ((non_system.len() as f32 * fraction) as usize).max(1);
        let cut = aligned_cut(&non_system, cut);
        if cut == 0 || cut >= non_system.len() {
            return Ok(messages.to_vec());
        }
        let (old, recent) = non_system.split_at(cut);

        let conversation = conversation_text(old);
        let prompt = format!("{instruction}\n\nCONVERSATION:\n{conversation}");
        let opts = CallOptions {
            temperature: Some(0.1),
            max_tokens: Some(2000),
            ..Default::default()
        };
        let resp = self
            .router
            .chat(&[Message::user(prompt)], &[], &opts)
            .await?;

        let mut out: Vec<Message> = system.to_vec();
        out.push(Message::system(format!("[Context Summary]\n{}", resp.content)));
        out.extend(recent.iter().cloned());
        Ok(out)
    }
}

/// Keep all system messages plus the last [`EMERGENCY_KEEP`] non-system
/// messages; replace everything older with one synthetic system message
/// naming what was dropped. No LLM involved.
fn emergency_truncate(messages: &[Message]) -> Vec<Message> {
    let (system, non_system) = partition(messages);
    if non_system.len() <= EMERGENCY_KEEP {
        return messages.to_vec();
    }
    let cut = aligned_cut(&non_system, non_system.len() - EMERGENCY_KEEP);
    let (dropped, kept) = non_system.split_at(cut);

    let mut topics: Vec<String> = Vec::new();
    for msg in dropped.iter().filter(|m| m.role == Role::User) {
        let text = msg.content.extract_all_text();
        let snippet: String = text.chars().take(100).collect();
        if !snippet.is_empty() {
            topics.push(snippet);
        }
    }
    let mut summary = format!(
        "[Context truncated to fit the window. Earlier conversation was about: {}]",
        topics.join("; ")
    );
    if summary.chars().count() > 500 {
        summary = summary.chars().take(499).collect::<String>() + "]";
    }

    let mut out: Vec<Message> = system.to_vec();
    out.push(Message::system(summary));
    out.extend(kept.iter().cloned());
    out
}

fn partition(messages: &[Message]) -> (Vec<Message>, Vec<Message>) {
    let system: Vec<Message> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .cloned()
        .collect();
    let non_system: Vec<Message> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();
    (system, non_system)
}

/// Advance a cut index so the kept tail never starts with an orphaned
/// tool result (its assistant pairing would have been dropped).
fn aligned_cut(non_system: &[Message], mut cut: usize) -> usize {
    while cut < non_system.len() && non_system[cut].role == Role::Tool {
        cut += 1;
    }
    cut
}

fn conversation_text(messages: &[Message]) -> String {
    let mut buf = String::new();
    for msg in messages {
        let label = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
            Role::System => "System",
        };
        buf.push_str(label);
        buf.push_str(": ");
        let text = msg.content.extract_all_text();
        // Long tool outputs get clipped so the summary prompt stays small.
        if text.len() > 2000 {
            let head: String = text.chars().take(1000).collect();
            let tail: String = text
                .chars()
                .rev()
                .take(500)
                .collect::<String>()
                .chars()
                .rev()
                .collect();
            buf.push_str(&head);
            buf.push_str(" [...] ");
            buf.push_str(&tail);
        } else {
            buf.push_str(&text);
        }
        buf.push('\n');
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use osa_providers::mock::MockProvider;
    use osa_providers::ProviderRegistry;

    fn small_window_config(max_tokens: u32) -> Arc<Config> {
        let max = max_tokens.to_string();
        Arc::new(Config::from_lookup(&move |key| match key {
            "OSA_MAX_CONTEXT_TOKENS" => Some(max.clone()),
            _ => None,
        }))
    }

    fn compactor_with_mock(max_tokens: u32) -> (Compactor, Arc<MockProvider>) {
        let mock = Arc::new(MockProvider::new("anthropic"));
        let config = small_window_config(max_tokens);
        let registry = Arc::new(ProviderRegistry::with_providers(vec![mock.clone()]));
        let router = Arc::new(ProviderRouter::new(registry, &config));
        (Compactor::new(config, router), mock)
    }

    fn chat(n: usize, len: usize) -> Vec<Message> {
        (0..n)
            .flat_map(|i| {
                vec![
                    Message::user(format!("question {i} {}", "q".repeat(len))),
                    Message::assistant(format!("answer {i} {}", "a".repeat(len))),
                ]
            })
            .collect()
    }

    #[tokio::test]
    async fn under_threshold_is_identity() {
        let (compactor, mock) = compactor_with_mock(100_000);
        let messages = chat(3, 50);
        let before = serde_json::to_string(&messages).unwrap();
        let after = compactor.maybe_compact(messages).await;
        assert_eq!(serde_json::to_string(&after).unwrap(), before);
        assert_eq!(mock.request_count(), 0);
        assert_eq!(compactor.stats().compaction_count, 0);
    }

    #[tokio::test]
    async fn emergency_tier_skips_llm() {
        // 30 messages x ~400 chars ≈ 3.1k tokens; window 3k -> ratio > 0.95.
        let (compactor, mock) = compactor_with_mock(3_000);
        let messages = chat(15, 400);
        let after = compactor.maybe_compact(messages).await;

        assert_eq!(mock.request_count(), 0, "tier 3 must not call the LLM");
        let synthetic = after
            .iter()
            .find(|m| m.content.extract_all_text().starts_with("[Context truncated"))
            .expect("synthetic truncation message present");
        assert!(synthetic.content.extract_all_text().chars().count() <= 500);
        // Last 10 non-system messages survive.
        let non_system = after.iter().filter(|m| m.role != Role::System).count();
        assert_eq!(non_system, EMERGENCY_KEEP);
        assert_eq!(compactor.stats().compaction_count, 1);
    }

    #[tokio::test]
    async fn aggressive_tier_uses_summary() {
        // ~10.6k tokens in a 12k window -> ratio ≈ 0.88.
        let (compactor, mock) = compactor_with_mock(12_000);
        mock.push_text("- fact one\n- fact two");
        let messages = chat(25, 800);
        let after = compactor.maybe_compact(messages).await;

        assert_eq!(mock.request_count(), 1);
        let summary = after
            .iter()
            .find(|m| m.content.extract_all_text().starts_with("[Context Summary]"))
            .expect("summary message present");
        assert!(summary.content.extract_all_text().contains("fact one"));
        assert!(after.len() < 50);
    }

    #[tokio::test]
    async fn summary_failure_falls_back_to_emergency() {
        let (compactor, mock) = compactor_with_mock(12_000);
        mock.push_error(osa_domain::Error::Http("connection refused".into()));
        // One provider in the chain; the retriable error exhausts it.
        let messages = chat(25, 800);
        let after = compactor.maybe_compact(messages).await;

        assert!(after
            .iter()
            .any(|m| m.content.extract_all_text().starts_with("[Context truncated")));
    }

    #[tokio::test]
    async fn never_raises_on_weird_input() {
        let (compactor, _mock) = compactor_with_mock(1);
        let out = compactor.maybe_compact(Vec::new()).await;
        assert!(out.is_empty());
    }

    #[test]
    fn aligned_cut_skips_orphan_tool_results() {
        let msgs = vec![
            Message::user("a"),
            Message::tool_result("tc_1", "out"),
            Message::user("b"),
        ];
        assert_eq!(aligned_cut(&msgs, 1), 2);
        assert_eq!(aligned_cut(&msgs, 0), 0);
    }
}
