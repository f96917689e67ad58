//! Shared application state.

use std::sync::Arc;

use osa_domain::config::Config;
use osa_providers::{ProviderRouter, TierMap};
use osa_sessions::{SessionStore, TranscriptWriter};
use osa_tools::{HookPipeline, ToolRegistry};
use parking_lot::RwLock;

use crate::budget::Budget;
use crate::bus::EventBus;
use crate::compactor::Compactor;
use crate::context::ContextAssembler;
use crate::skills::SkillRegistry;
use crate::tracker::TaskTracker;
use crate::treasury::Treasury;

/// Everything the runtime shares, grouped by concern. Cloning is cheap;
/// every field is an `Arc`.
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────
    pub config: Arc<Config>,
    pub bus: Arc<EventBus>,
    pub router: Arc<ProviderRouter>,
    /// Tier → model map; swapped at boot when derived dynamically.
    pub tiers: Arc<RwLock<TierMap>>,

    // ── Tools ─────────────────────────────────────────────────────
    pub tools: Arc<ToolRegistry>,
    pub hooks: Arc<HookPipeline>,

    // ── Sessions & context ────────────────────────────────────────
    pub sessions: Arc<SessionStore>,
    pub transcripts: Arc<TranscriptWriter>,
    pub assembler: Arc<ContextAssembler>,
    pub compactor: Arc<Compactor>,
    pub skills: Arc<SkillRegistry>,

    // ── Governance ────────────────────────────────────────────────
    pub budget: Arc<Budget>,
    pub treasury: Arc<Treasury>,
    pub tracker: Arc<TaskTracker>,
}
