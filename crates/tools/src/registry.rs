//! Process-wide tool registry.
//!
//! Canonical state lives behind the owner lock; every mutation republishes
//! an immutable snapshot (`Arc<HashMap>`). The `*_direct` methods read the
//! snapshot and never wait on the owner, so a sub-agent spawned from
//! within a tool execution can list and execute tools without deadlocking
//! on its own caller.

use std::collections::HashMap;
use std::sync::Arc;

use osa_domain::error::{Error, Result};
use osa_domain::message::ToolDefinition;
use parking_lot::RwLock;

/// What a tool execution produces.
#[derive(Debug, Clone)]
pub enum ToolOutput {
    Text(String),
    Image {
        /// Base64-encoded image data.
        data: String,
        media_type: String,
    },
}

/// The execute function of a registered tool.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, arguments: &serde_json::Value) -> Result<ToolOutput>;
}

/// A definition plus its handler.
pub struct RegisteredTool {
    pub def: ToolDefinition,
    pub handler: Arc<dyn ToolHandler>,
}

type Snapshot = Arc<HashMap<String, Arc<RegisteredTool>>>;

#[derive(Default)]
pub struct ToolRegistry {
    owner: RwLock<HashMap<String, Arc<RegisteredTool>>>,
    snapshot: RwLock<Snapshot>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a tool and republish the snapshot.
    pub fn register(&self, def: ToolDefinition, handler: Arc<dyn ToolHandler>) {
        let name = def.name.clone();
        {
            let mut owner = self.owner.write();
            owner.insert(name.clone(), Arc::new(RegisteredTool { def, handler }));
        }
        self.republish();
        tracing::debug!(tool = %name, "registered tool");
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.owner.write().remove(name).is_some();
        if removed {
            self.republish();
        }
        removed
    }

    fn republish(&self) {
        let copy: HashMap<String, Arc<RegisteredTool>> = self
            .owner
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        *self.snapshot.write() = Arc::new(copy);
    }

    // ── Serialized path (owner) ────────────────────────────────────

    /// List definitions through the owner. Sorted by name.
    pub fn list(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.owner.read().values().map(|t| t.def.clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredTool>> {
        self.owner.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.owner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.owner.read().is_empty()
    }

    // ── Lock-free path (snapshot) ──────────────────────────────────

    /// List definitions from the published snapshot without touching the
    /// owner lock. Sorted by name.
    pub fn list_direct(&self) -> Vec<ToolDefinition> {
        let snap = self.snapshot.read().clone();
        let mut defs: Vec<ToolDefinition> = snap.values().map(|t| t.def.clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn get_direct(&self, name: &str) -> Option<Arc<RegisteredTool>> {
        self.snapshot.read().get(name).cloned()
    }

    /// Execute a tool through the snapshot path. The snapshot `Arc` is
    /// cloned before the await so no lock is held across it.
    pub async fn execute_direct(
        &self,
        name: &str,
        arguments: &serde_json::Value,
    ) -> Result<ToolOutput> {
        let tool = self
            .get_direct(name)
            .ok_or_else(|| Error::Other(format!("unknown tool: '{name}'")))?;
        tool.handler.execute(arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait::async_trait]
    impl ToolHandler for Echo {
        async fn execute(&self, arguments: &serde_json::Value) -> Result<ToolOutput> {
            Ok(ToolOutput::Text(
                arguments
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            ))
        }
    }

    fn def(name: &str) -> ToolDefinition {
        ToolDefinition::new(name, "test tool", serde_json::json!({"type": "object"}))
    }

    #[tokio::test]
    async fn register_and_execute_direct() {
        let registry = ToolRegistry::new();
        registry.register(def("echo"), Arc::new(Echo));

        let out = registry
            .execute_direct("echo", &serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert!(matches!(out, ToolOutput::Text(t) if t == "hi"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute_direct("nope", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown tool"));
    }

    #[test]
    fn snapshot_tracks_mutations() {
        let registry = ToolRegistry::new();
        registry.register(def("a"), Arc::new(Echo));
        registry.register(def("b"), Arc::new(Echo));
        assert_eq!(registry.list_direct().len(), 2);

        registry.unregister("a");
        assert_eq!(registry.list_direct().len(), 1);
        assert!(registry.get_direct("a").is_none());
    }

    #[test]
    fn listings_are_sorted() {
        let registry = ToolRegistry::new();
        registry.register(def("zeta"), Arc::new(Echo));
        registry.register(def("alpha"), Arc::new(Echo));
        let names: Vec<String> = registry.list().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        let direct: Vec<String> = registry.list_direct().into_iter().map(|d| d.name).collect();
        assert_eq!(direct, vec!["alpha", "zeta"]);
    }
}
