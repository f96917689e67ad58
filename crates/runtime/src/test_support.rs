//! Shared fixtures for runtime tests: an [`AppState`] wired to a scripted
//! mock provider inside a temp home/workspace.

use std::collections::HashMap;
use std::sync::Arc;

use osa_domain::config::Config;
use osa_domain::error::Result;
use osa_providers::mock::MockProvider;
use osa_providers::{ProviderRegistry, ProviderRouter, TierMap};
use osa_sessions::{SessionStore, TranscriptWriter};
use osa_tools::registry::{ToolHandler, ToolOutput};
use osa_tools::{HookPipeline, ToolRegistry};
use parking_lot::RwLock;

use crate::budget::Budget;
use crate::bus::EventBus;
use crate::compactor::Compactor;
use crate::context::ContextAssembler;
use crate::skills::SkillRegistry;
use crate::state::AppState;
use crate::tracker::TaskTracker;
use crate::treasury::Treasury;

/// A tool that returns a fixed string.
pub struct EchoTool(pub String);

#[async_trait::async_trait]
impl ToolHandler for EchoTool {
    async fn execute(&self, _arguments: &serde_json::Value) -> Result<ToolOutput> {
        Ok(ToolOutput::Text(self.0.clone()))
    }
}

/// Build an [`AppState`] over a temp directory with one mock provider
/// registered as "anthropic". Extra env pairs overlay the defaults.
pub fn state_with_mock(
    env: &[(&str, &str)],
) -> (AppState, Arc<MockProvider>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut map: HashMap<String, String> = env
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    map.insert(
        "OSA_HOME".into(),
        dir.path().join("home").to_string_lossy().into_owned(),
    );
    map.insert(
        "OSA_WORKSPACE".into(),
        dir.path().join("ws").to_string_lossy().into_owned(),
    );
    std::fs::create_dir_all(dir.path().join("ws")).unwrap();

    let config = Arc::new(Config::from_lookup(&move |key| map.get(key).cloned()));
    let bus = Arc::new(EventBus::new());
    let mock = Arc::new(MockProvider::new("anthropic"));
    let registry = Arc::new(ProviderRegistry::with_providers(vec![mock.clone()]));
    let router = Arc::new(ProviderRouter::new(registry, &config));
    let skills = Arc::new(SkillRegistry::load(&config.workspace_root.join("skills")));

    let state = AppState {
        config: config.clone(),
        bus: bus.clone(),
        router: router.clone(),
        tiers: Arc::new(RwLock::new(TierMap::for_registry(router.registry()))),
        tools: Arc::new(ToolRegistry::new()),
        hooks: Arc::new(HookPipeline::new()),
        sessions: Arc::new(SessionStore::new()),
        transcripts: Arc::new(TranscriptWriter::new(&config.sessions_dir)),
        assembler: Arc::new(ContextAssembler::new(config.clone(), skills.clone())),
        compactor: Arc::new(Compactor::new(config.clone(), router.clone())),
        skills,
        budget: Arc::new(Budget::new(config.budget.clone(), bus.clone())),
        treasury: Arc::new(Treasury::new(config.treasury.clone(), bus.clone())),
        tracker: Arc::new(TaskTracker::new(config.clone(), bus)),
    };
    (state, mock, dir)
}
