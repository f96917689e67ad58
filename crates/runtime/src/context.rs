//! Tiered, token-budgeted system-prompt assembly.
//!
//! Blocks are gathered from layered sources, grouped into four tiers, and
//! fitted into the budget left over after the conversation and the
//! response reserve. Tier 1 is always included in full; tiers 2-4 get
//! percentage caps of what remains.
//!
//! Token counts are estimates (chars / 4). Callers never depend on
//! exactness; the budget exists to keep prompts inside the window with
//! margin, not to bill by.

use std::path::Path;

use chrono::Utc;
use osa_domain::config::Config;
use osa_domain::message::{Message, MessageContent};
use osa_domain::signal::Signal;
use serde::Serialize;

use crate::skills::SkillRegistry;

const TIER2_PCT: f32 = 0.40;
const TIER3_PCT: f32 = 0.30;
const MIN_SYSTEM_BUDGET: u32 = 2_000;
const TRUNCATION_MARKER: &str = "\n[truncated to fit context budget]";

/// Workspace files consulted per tier, in declaration order.
const IDENTITY_FILES: &[&str] = &["SOUL.md", "IDENTITY.md"];
const PROFILE_FILE: &str = "USER.md";
const STYLE_FILE: &str = "STYLE.md";
const MACHINE_FILE: &str = "MACHINE.md";

const DEFAULT_IDENTITY: &str = "You are OSA, an autonomous operating-system agent. You act on \
the user's machine through registered tools, verify the results of your actions, and answer \
plainly. You never fabricate tool output.";

const TOOL_CONTRACT: &str = "Tool usage contract: call tools only when needed to complete the \
task; prefer reading before writing; report errors verbatim rather than guessing. Every tool \
call you make will be answered with a matching tool result before you continue.";

const PLAN_OVERLAY: &str = "PLAN MODE: Do not execute anything. Produce a short numbered plan \
of the steps you would take, the tools you would use, and anything you would need confirmed. \
The user will approve the plan before execution.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token estimation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rough token estimate: one token per four characters.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() as u32).div_ceil(4)
}

/// Estimate for a message list, including a small per-message overhead.
pub fn estimate_messages(messages: &[Message]) -> u32 {
    messages
        .iter()
        .map(|m| {
            let text = match &m.content {
                MessageContent::Text(t) => t.len(),
                MessageContent::Parts(parts) => parts
                    .iter()
                    .map(|p| serde_json::to_string(p).map(|s| s.len()).unwrap_or(0))
                    .sum(),
            };
            (text as u32).div_ceil(4) + 4
        })
        .sum()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Blocks & report
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ContextBlock {
    name: &'static str,
    tier: u8,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockReport {
    pub name: String,
    pub tier: u8,
    pub tokens: u32,
    pub truncated: bool,
    pub included: bool,
}

/// Per-call budget breakdown, also used for the `context_pressure` event.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetReport {
    pub max_tokens: u32,
    pub conversation_tokens: u32,
    pub system_budget: u32,
    pub system_tokens: u32,
    pub blocks: Vec<BlockReport>,
}

impl BudgetReport {
    /// Estimated total prompt utilization in `[0, 1+]`.
    pub fn utilization(&self) -> f32 {
        let used = self.conversation_tokens + self.system_tokens;
        used as f32 / self.max_tokens.max(1) as f32
    }
}

/// What the assembler needs to know about the calling session.
pub struct SessionView<'a> {
    pub session_id: &'a str,
    pub channel: &'a str,
    pub messages: &'a [Message],
    pub plan_overlay: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Assembler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ContextAssembler {
    config: std::sync::Arc<Config>,
    skills: std::sync::Arc<SkillRegistry>,
}

impl ContextAssembler {
    pub fn new(
        config: std::sync::Arc<Config>,
        skills: std::sync::Arc<SkillRegistry>,
    ) -> Self {
        Self { config, skills }
    }

    /// Build the system message for a call and report the budget math.
    /// The returned message is prepended to the conversation by the loop.
    pub fn build(&self, session: &SessionView<'_>, signal: Option<&Signal>) -> (Message, BudgetReport) {
        let max_tokens = self.config.max_context_tokens;
        let conversation_tokens = estimate_messages(session.messages);
        let system_budget = max_tokens
            .saturating_sub(self.config.response_reserve_tokens)
            .saturating_sub(conversation_tokens)
            .max(MIN_SYSTEM_BUDGET);

        let blocks = self.collect_blocks(session, signal);

        let mut assembled = String::new();
        let mut reports = Vec::with_capacity(blocks.len());
        let mut remaining = system_budget;

        // Tier 1 is included whole, always; its cost comes off the top.
        for block in blocks.iter().filter(|b| b.tier == 1) {
            let tokens = estimate_tokens(&block.content);
            push_block(&mut assembled, &block.content);
            remaining = remaining.saturating_sub(tokens);
            reports.push(BlockReport {
                name: block.name.into(),
                tier: 1,
                tokens,
                truncated: false,
                included: true,
            });
        }

        for (tier, pct) in [(2u8, Some(TIER2_PCT)), (3, Some(TIER3_PCT)), (4, None)] {
            let allocation = match pct {
                Some(pct) => ((system_budget as f32 * pct) as u32).min(remaining),
                None => remaining,
            };
            let mut tier_left = allocation;

            for block in blocks.iter().filter(|b| b.tier == tier) {
                if block.content.is_empty() {
                    reports.push(BlockReport {
                        name: block.name.into(),
                        tier,
                        tokens: 0,
                        truncated: false,
                        included: false,
                    });
                    continue;
                }
                let tokens = estimate_tokens(&block.content);
                if tokens <= tier_left {
                    push_block(&mut assembled, &block.content);
                    tier_left -= tokens;
                    remaining = remaining.saturating_sub(tokens);
                    reports.push(BlockReport {
                        name: block.name.into(),
                        tier,
                        tokens,
                        truncated: false,
                        included: true,
                    });
                } else if tier_left > 0 {
                    let truncated = truncate_to_tokens(&block.content, tier_left);
                    let used = estimate_tokens(&truncated);
                    push_block(&mut assembled, &truncated);
                    remaining = remaining.saturating_sub(used);
                    tier_left = 0;
                    reports.push(BlockReport {
                        name: block.name.into(),
                        tier,
                        tokens: used,
                        truncated: true,
                        included: true,
                    });
                } else {
                    reports.push(BlockReport {
                        name: block.name.into(),
                        tier,
                        tokens: 0,
                        truncated: false,
                        included: false,
                    });
                }
            }
        }

        let system_tokens = estimate_tokens(&assembled);
        let report = BudgetReport {
            max_tokens,
            conversation_tokens,
            system_budget,
            system_tokens,
            blocks: reports,
        };
        (Message::system(assembled), report)
    }

    /// The budget breakdown without building (observability path).
    pub fn token_budget(&self, session: &SessionView<'_>, signal: Option<&Signal>) -> BudgetReport {
        self.build(session, signal).1
    }

    // ── Block sources ──────────────────────────────────────────────

    fn collect_blocks(&self, session: &SessionView<'_>, signal: Option<&Signal>) -> Vec<ContextBlock> {
        let ws = &self.config.workspace_root;
        let mut blocks = Vec::new();

        // ── Tier 1: identity, contract, runtime facts, plan mode ──
        let identity = IDENTITY_FILES
            .iter()
            .filter_map(|f| read_workspace_file(ws, f))
            .collect::<Vec<_>>()
            .join("\n\n");
        blocks.push(ContextBlock {
            name: "identity",
            tier: 1,
            content: if identity.is_empty() {
                DEFAULT_IDENTITY.to_string()
            } else {
                identity
            },
        });
        blocks.push(ContextBlock {
            name: "tool_contract",
            tier: 1,
            content: TOOL_CONTRACT.to_string(),
        });
        let signal_line = signal
            .map(|s| {
                format!(
                    "\nSignal: mode={} type={} weight={:.2}",
                    s.mode, s.kind, s.weight
                )
            })
            .unwrap_or_default();
        blocks.push(ContextBlock {
            name: "runtime_facts",
            tier: 1,
            content: format!(
                "Current time: {}\nChannel: {}\nSession: {}{}",
                Utc::now().to_rfc3339(),
                session.channel,
                session.session_id,
                signal_line
            ),
        });
        if session.plan_overlay {
            blocks.push(ContextBlock {
                name: "plan_mode",
                tier: 1,
                content: PLAN_OVERLAY.to_string(),
            });
        }

        // ── Tier 2: skills, relevant memory, workflow context ─────
        let latest_user = latest_user_text(session.messages);
        blocks.push(ContextBlock {
            name: "skills",
            tier: 2,
            content: self.skills.render_index(),
        });
        blocks.push(ContextBlock {
            name: "memory_relevant",
            tier: 2,
            content: relevant_memory(&self.config.memory_path(), &latest_user),
        });

        // ── Tier 3: profiles and memory bulletin ──────────────────
        blocks.push(ContextBlock {
            name: "user_profile",
            tier: 3,
            content: read_workspace_file(ws, PROFILE_FILE).unwrap_or_default(),
        });
        blocks.push(ContextBlock {
            name: "style_profile",
            tier: 3,
            content: read_workspace_file(ws, STYLE_FILE).unwrap_or_default(),
        });
        blocks.push(ContextBlock {
            name: "memory_bulletin",
            tier: 3,
            content: memory_bulletin(&self.config.memory_path()),
        });

        // ── Tier 4: OS and machine addendums ──────────────────────
        blocks.push(ContextBlock {
            name: "os_addendum",
            tier: 4,
            content: format!(
                "Host OS: {} ({})",
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
        });
        blocks.push(ContextBlock {
            name: "machine_addendum",
            tier: 4,
            content: read_workspace_file(ws, MACHINE_FILE).unwrap_or_default(),
        });

        blocks
    }
}

fn push_block(assembled: &mut String, content: &str) {
    if !assembled.is_empty() {
        assembled.push_str("\n\n");
    }
    assembled.push_str(content);
}

fn read_workspace_file(workspace: &Path, name: &str) -> Option<String> {
    let content = std::fs::read_to_string(workspace.join(name)).ok()?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Truncate to roughly `budget` tokens with an explicit marker.
fn truncate_to_tokens(content: &str, budget: u32) -> String {
    let max_bytes = (budget as usize) * 4;
    let mut end = max_bytes.min(content.len());
    while !content.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}{}", &content[..end], TRUNCATION_MARKER)
}

fn latest_user_text(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == osa_domain::message::Role::User)
        .map(|m| m.content.extract_all_text())
        .unwrap_or_default()
}

/// Long-term memory entries sharing at least one keyword with the latest
/// user message. Entries are `## [category] timestamp` headed sections.
fn relevant_memory(memory_path: &Path, query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    let Ok(raw) = std::fs::read_to_string(memory_path) else {
        return String::new();
    };
    let keywords: Vec<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .map(String::from)
        .collect();
    if keywords.is_empty() {
        return String::new();
    }

    let mut relevant = Vec::new();
    for entry in raw.split("\n## ") {
        let lower = entry.to_lowercase();
        if keywords.iter().any(|k| lower.contains(k.as_str())) {
            relevant.push(format!("## {}", entry.trim()));
        }
    }
    if relevant.is_empty() {
        String::new()
    } else {
        format!("Relevant long-term memory:\n{}", relevant.join("\n"))
    }
}

/// The most recent memory entries, newest last.
fn memory_bulletin(memory_path: &Path) -> String {
    let Ok(raw) = std::fs::read_to_string(memory_path) else {
        return String::new();
    };
    let entries: Vec<&str> = raw.split("\n## ").filter(|e| !e.trim().is_empty()).collect();
    let recent: Vec<String> = entries
        .iter()
        .rev()
        .take(5)
        .rev()
        .map(|e| format!("## {}", e.trim()))
        .collect();
    if recent.is_empty() {
        String::new()
    } else {
        format!("Memory bulletin (recent):\n{}", recent.join("\n"))
    }
}
