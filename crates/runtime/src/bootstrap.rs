//! Runtime wiring: config → providers → tools → stores → background
//! engines. The dependency cycle between the scheduler and the session
//! layer is broken by construction order plus the event bus; downstream
//! components only ever talk upstream through events.

use std::sync::Arc;

use osa_domain::config::Config;
use osa_providers::{ProviderRegistry, ProviderRouter, TierMap};
use osa_sessions::{SessionStore, TranscriptWriter};
use osa_tools::{HookDecision, HookPipeline, ToolRegistry};
use parking_lot::RwLock;

use crate::budget::Budget;
use crate::builtin;
use crate::bus::{Event, EventBus, EventKind};
use crate::compactor::Compactor;
use crate::context::ContextAssembler;
use crate::orchestrator::Orchestrator;
use crate::scheduler::Scheduler;
use crate::session::SessionManager;
use crate::skills::SkillRegistry;
use crate::state::AppState;
use crate::tracker::TaskTracker;
use crate::treasury::Treasury;

/// A fully wired runtime.
pub struct Runtime {
    pub state: AppState,
    pub manager: Arc<SessionManager>,
    pub scheduler: Arc<Scheduler>,
    pub orchestrator: Arc<Orchestrator>,
}

/// Build everything and start the background engines.
pub async fn bootstrap(config: Config) -> Runtime {
    let config = Arc::new(config);
    for dir in [&config.home_dir, &config.sessions_dir, &config.config_dir] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "could not create runtime directory");
        }
    }

    let bus = Arc::new(EventBus::new());

    // ── Providers ─────────────────────────────────────────────────
    let registry = Arc::new(ProviderRegistry::from_config(&config).await);
    let router = Arc::new(ProviderRouter::new(registry.clone(), &config));

    let mut tier_map = TierMap::for_registry(&registry);
    if tier_map.is_empty() && registry.get("ollama").is_some() {
        // Local-only install: derive the tier map from installed models.
        match TierMap::derive_ollama("http://127.0.0.1:11434").await {
            Ok(map) => tier_map = map,
            Err(e) => tracing::warn!(error = %e, "could not derive ollama tier map"),
        }
    }

    // ── Tools & hooks ─────────────────────────────────────────────
    let tools = Arc::new(ToolRegistry::new());
    builtin::register_all(&tools, config.clone());

    let hooks = Arc::new(HookPipeline::new());
    // Confirmation gate: tools flagged `requires_confirmation` only run
    // when the model passes `"confirmed": true`.
    {
        let tools_for_hook = tools.clone();
        hooks.register_pre(Arc::new(move |payload| {
            let needs_confirmation = tools_for_hook
                .get_direct(&payload.tool_name)
                .map(|t| t.def.requires_confirmation)
                .unwrap_or(false);
            if needs_confirmation
                && payload
                    .arguments
                    .get("confirmed")
                    .and_then(|v| v.as_bool())
                    != Some(true)
            {
                return HookDecision::Blocked {
                    reason: format!(
                        "'{}' requires confirmation; retry with \"confirmed\": true",
                        payload.tool_name
                    ),
                };
            }
            HookDecision::Continue
        }));
    }

    // ── Stores ────────────────────────────────────────────────────
    let skills = Arc::new(SkillRegistry::load(&config.workspace_root.join("skills")));
    let state = AppState {
        config: config.clone(),
        bus: bus.clone(),
        router: router.clone(),
        tiers: Arc::new(RwLock::new(tier_map)),
        tools,
        hooks,
        sessions: Arc::new(SessionStore::new()),
        transcripts: Arc::new(TranscriptWriter::new(&config.sessions_dir)),
        assembler: Arc::new(ContextAssembler::new(config.clone(), skills.clone())),
        compactor: Arc::new(Compactor::new(config.clone(), router.clone())),
        skills,
        budget: Arc::new(Budget::new(config.budget.clone(), bus.clone())),
        treasury: Arc::new(Treasury::new(config.treasury.clone(), bus.clone())),
        tracker: Arc::new(TaskTracker::new(config.clone(), bus.clone())),
    };

    wire_treasury_auto_debit(&state);
    wire_tracker_auto_extract(&state);
    spawn_reset_timers(&state);

    // ── Sessions, scheduler, orchestrator ─────────────────────────
    let manager = SessionManager::new(state.clone());
    let scheduler = Scheduler::new(state.clone(), manager.clone());
    scheduler.start();
    let orchestrator = Orchestrator::new(state.clone());

    tracing::info!(
        providers = state.router.registry().len(),
        tools = state.tools.len(),
        "runtime ready"
    );

    Runtime {
        state,
        manager,
        scheduler,
        orchestrator,
    }
}

/// Every `cost_recorded` event becomes a treasury debit when auto-debit
/// is on. Refusals log; they never affect the emitting call.
fn wire_treasury_auto_debit(state: &AppState) {
    if !state.config.treasury.enabled || !state.config.treasury.auto_debit {
        return;
    }
    let treasury = state.treasury.clone();
    state.bus.register(
        Some(EventKind::System),
        Arc::new(move |event| {
            let Event::System { event, data } = event else {
                return;
            };
            if event != "cost_recorded" {
                return;
            }
            let cost = data.get("cost_usd").and_then(|v| v.as_f64()).unwrap_or(0.0);
            if cost <= 0.0 {
                return;
            }
            if let Err(e) = treasury.withdraw(cost, "llm cost auto-debit", None) {
                tracing::warn!(error = %e, "treasury auto-debit refused");
            }
        }),
    );
}

/// Seed empty per-session checklists from the assistant's own numbered
/// plans (post-response hook).
fn wire_tracker_auto_extract(state: &AppState) {
    let tracker = state.tracker.clone();
    state.bus.register(
        Some(EventKind::AgentResponse),
        Arc::new(move |event| {
            let Event::AgentResponse {
                session_id,
                content,
                ..
            } = event
            else {
                return;
            };
            let tracker = tracker.clone();
            let session_id = session_id.clone();
            let content = content.clone();
            tokio::spawn(async move {
                if let Err(e) = tracker.auto_extract(&session_id, &content).await {
                    tracing::debug!(error = %e, "task auto-extraction failed");
                }
            });
        }),
    );
}

/// Daily and monthly counters reset on wall-clock boundaries,
/// independent of any spend activity.
fn spawn_reset_timers(state: &AppState) {
    let budget = state.budget.clone();
    let treasury = state.treasury.clone();
    tokio::spawn(async move {
        loop {
            let secs = budget.seconds_to_daily_reset().max(1) as u64;
            tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
            budget.roll_daily();
            treasury.roll_daily();
            tracing::info!("daily budget counters reset");
        }
    });

    let budget = state.budget.clone();
    let treasury = state.treasury.clone();
    tokio::spawn(async move {
        loop {
            let secs = budget.seconds_to_monthly_reset().max(1) as u64;
            tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
            budget.roll_monthly();
            treasury.roll_monthly();
            tracing::info!("monthly budget counters reset");
        }
    });
}
