//! In-memory session metadata.
//!
//! The transcript file is the durable record; this store tracks the live
//! view: owner, channel, per-session provider/model overrides, cumulative
//! usage, and the last run's metadata.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Metadata from the most recent completed run of a session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LastMeta {
    pub iterations: u32,
    /// Distinct tool names the assistant requested, in first-use order.
    /// Derived from assistant messages with non-empty tool calls only.
    pub tools_used: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub user_id: Option<String>,
    pub channel: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub last_meta: Option<LastMeta>,
}

/// Thread-safe store of live session metadata.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionMeta>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session. Returns false when the id is already present.
    pub fn insert(&self, meta: SessionMeta) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&meta.session_id) {
            return false;
        }
        sessions.insert(meta.session_id.clone(), meta);
        true
    }

    pub fn get(&self, session_id: &str) -> Option<SessionMeta> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionMeta> {
        self.sessions.write().remove(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    /// Session ids, sorted for stable listings.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Accumulate token usage for a session.
    pub fn record_usage(&self, session_id: &str, prompt_tokens: u64, completion_tokens: u64) {
        if let Some(meta) = self.sessions.write().get_mut(session_id) {
            meta.prompt_tokens += prompt_tokens;
            meta.completion_tokens += completion_tokens;
        }
    }

    pub fn set_last_meta(&self, session_id: &str, last: LastMeta) {
        if let Some(meta) = self.sessions.write().get_mut(session_id) {
            meta.last_meta = Some(last);
        }
    }

    /// Persist per-call provider/model overrides for the session lifetime.
    pub fn set_overrides(
        &self,
        session_id: &str,
        provider: Option<String>,
        model: Option<String>,
    ) {
        if let Some(meta) = self.sessions.write().get_mut(session_id) {
            if provider.is_some() {
                meta.provider = provider;
            }
            if model.is_some() {
                meta.model = model;
            }
        }
    }
}

impl SessionMeta {
    pub fn new(session_id: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: None,
            channel: channel.into(),
            provider: None,
            model: None,
            created_at: Utc::now(),
            prompt_tokens: 0,
            completion_tokens: 0,
            last_meta: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_idempotent_guard() {
        let store = SessionStore::new();
        assert!(store.insert(SessionMeta::new("s1", "cli")));
        assert!(!store.insert(SessionMeta::new("s1", "cli")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn usage_accumulates() {
        let store = SessionStore::new();
        store.insert(SessionMeta::new("s1", "cli"));
        store.record_usage("s1", 100, 20);
        store.record_usage("s1", 50, 10);
        let meta = store.get("s1").unwrap();
        assert_eq!(meta.prompt_tokens, 150);
        assert_eq!(meta.completion_tokens, 30);
    }

    #[test]
    fn overrides_persist_and_merge() {
        let store = SessionStore::new();
        store.insert(SessionMeta::new("s1", "cli"));
        store.set_overrides("s1", Some("anthropic".into()), None);
        store.set_overrides("s1", None, Some("claude-sonnet-4-20250514".into()));
        let meta = store.get("s1").unwrap();
        assert_eq!(meta.provider.as_deref(), Some("anthropic"));
        assert_eq!(meta.model.as_deref(), Some("claude-sonnet-4-20250514"));
    }

    #[test]
    fn list_is_sorted() {
        let store = SessionStore::new();
        store.insert(SessionMeta::new("b", "cli"));
        store.insert(SessionMeta::new("a", "http"));
        assert_eq!(store.list(), vec!["a", "b"]);
    }
}
