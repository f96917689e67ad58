//! Per-session task checklist.
//!
//! State lives in memory and is mirrored to
//! `<sessions_dir>/<session_id>/tasks.json` with an atomic replace on
//! every mutation. Transitions emit `task_tracker_*` events. The
//! auto-extraction hook parses numbered lists and checkbox lines out of
//! assistant responses and seeds an empty checklist from them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use osa_domain::config::Config;
use osa_domain::error::{Error, Result};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::EventBus;

/// Cap on auto-extracted titles.
const EXTRACT_MAX: usize = 20;
/// Auto-extraction only seeds a session with at least this many titles.
const EXTRACT_MIN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedTask {
    pub id: String,
    pub title: String,
    pub status: TrackedStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Token accumulator for work attributed to this task.
    #[serde(default)]
    pub tokens: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TrackedTask {
    fn new(title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            status: TrackedStatus::Pending,
            reason: None,
            tokens: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

pub struct TaskTracker {
    config: Arc<Config>,
    bus: Arc<EventBus>,
    sessions: Mutex<HashMap<String, Vec<TrackedTask>>>,
}

impl TaskTracker {
    pub fn new(config: Arc<Config>, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            bus,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn add_task(&self, session_id: &str, title: &str) -> Result<TrackedTask> {
        let task = TrackedTask::new(title);
        {
            let mut sessions = self.sessions.lock();
            self.ensure_loaded(&mut sessions, session_id);
            sessions
                .entry(session_id.to_string())
                .or_default()
                .push(task.clone());
        }
        self.persist(session_id).await?;
        self.emit("task_tracker_added", session_id, &task);
        Ok(task)
    }

    pub async fn add_tasks(&self, session_id: &str, titles: &[String]) -> Result<Vec<TrackedTask>> {
        let mut out = Vec::with_capacity(titles.len());
        for title in titles {
            out.push(self.add_task(session_id, title).await?);
        }
        Ok(out)
    }

    pub async fn start_task(&self, session_id: &str, task_id: &str) -> Result<TrackedTask> {
        self.transition(session_id, task_id, |task| {
            if task.status != TrackedStatus::Pending {
                return Err(Error::Other(format!(
                    "task '{}' is {:?}, not pending",
                    task.title, task.status
                )));
            }
            task.status = TrackedStatus::InProgress;
            task.started_at = Some(Utc::now());
            Ok("task_tracker_started")
        })
        .await
    }

    pub async fn complete_task(&self, session_id: &str, task_id: &str) -> Result<TrackedTask> {
        self.transition(session_id, task_id, |task| {
            if task.status != TrackedStatus::InProgress {
                return Err(Error::Other(format!(
                    "task '{}' is {:?}, not in_progress",
                    task.title, task.status
                )));
            }
            task.status = TrackedStatus::Completed;
            task.completed_at = Some(Utc::now());
            Ok("task_tracker_completed")
        })
        .await
    }

    pub async fn fail_task(
        &self,
        session_id: &str,
        task_id: &str,
        reason: &str,
    ) -> Result<TrackedTask> {
        let reason = reason.to_string();
        self.transition(session_id, task_id, move |task| {
            if task.status != TrackedStatus::InProgress {
                return Err(Error::Other(format!(
                    "task '{}' is {:?}, not in_progress",
                    task.title, task.status
                )));
            }
            task.status = TrackedStatus::Failed;
            task.reason = Some(reason.clone());
            task.completed_at = Some(Utc::now());
            Ok("task_tracker_failed")
        })
        .await
    }

    pub async fn record_tokens(
        &self,
        session_id: &str,
        task_id: &str,
        tokens: u64,
    ) -> Result<TrackedTask> {
        self.transition(session_id, task_id, move |task| {
            task.tokens += tokens;
            Ok("task_tracker_tokens")
        })
        .await
    }

    pub fn get_tasks(&self, session_id: &str) -> Vec<TrackedTask> {
        let mut sessions = self.sessions.lock();
        self.ensure_loaded(&mut sessions, session_id);
        sessions.get(session_id).cloned().unwrap_or_default()
    }

    pub async fn clear_tasks(&self, session_id: &str) -> Result<()> {
        self.sessions.lock().insert(session_id.to_string(), Vec::new());
        self.persist(session_id).await?;
        self.bus.emit_system(
            "task_tracker_cleared",
            serde_json::json!({"session_id": session_id}),
        );
        Ok(())
    }

    /// Post-response hook: seed an empty checklist from the assistant's
    /// own plan, when it wrote one.
    pub async fn auto_extract(&self, session_id: &str, response: &str) -> Result<usize> {
        let titles = extract_titles(response);
        if titles.len() < EXTRACT_MIN {
            return Ok(0);
        }
        if !self.get_tasks(session_id).is_empty() {
            return Ok(0);
        }
        let added = self.add_tasks(session_id, &titles).await?;
        Ok(added.len())
    }

    // ── Internals ──────────────────────────────────────────────────

    async fn transition<F>(&self, session_id: &str, task_id: &str, f: F) -> Result<TrackedTask>
    where
        F: FnOnce(&mut TrackedTask) -> Result<&'static str>,
    {
        let (task, event) = {
            let mut sessions = self.sessions.lock();
            self.ensure_loaded(&mut sessions, session_id);
            let tasks = sessions
                .get_mut(session_id)
                .ok_or_else(|| Error::Other(format!("no tasks for session '{session_id}'")))?;
            let task = tasks
                .iter_mut()
                .find(|t| t.id == task_id)
                .ok_or_else(|| Error::Other(format!("no task '{task_id}'")))?;
            let event = f(task)?;
            (task.clone(), event)
        };
        self.persist(session_id).await?;
        self.emit(event, session_id, &task);
        Ok(task)
    }

    /// Lazily rehydrate a session's checklist from disk.
    fn ensure_loaded(&self, sessions: &mut HashMap<String, Vec<TrackedTask>>, session_id: &str) {
        if sessions.contains_key(session_id) {
            return;
        }
        let path = self.config.tracker_path(session_id);
        let tasks = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<Vec<TrackedTask>>(&raw).ok())
            .unwrap_or_default();
        sessions.insert(session_id.to_string(), tasks);
    }

    async fn persist(&self, session_id: &str) -> Result<()> {
        let tasks = self
            .sessions
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        let path = self.config.tracker_path(session_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
        }
        let json = serde_json::to_vec_pretty(&tasks)?;
        osa_tools::file_ops::write_atomic(&path, &json).await
    }

    fn emit(&self, event: &str, session_id: &str, task: &TrackedTask) {
        self.bus.emit_system(
            event,
            serde_json::json!({
                "session_id": session_id,
                "task_id": task.id,
                "title": task.title,
                "status": task.status,
            }),
        );
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auto-extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn numbered_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*\d+\.\s+(.+)$").expect("valid regex"))
}

fn checkbox_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*- \[[ x]\]\s+(.+)$").expect("valid regex"))
}

/// Parse candidate task titles out of an assistant response: numbered
/// list items and checkbox lines, 5..=120 chars, at most 20 unique.
pub fn extract_titles(text: &str) -> Vec<String> {
    let mut titles: Vec<String> = Vec::new();
    for re in [numbered_re(), checkbox_re()] {
        for cap in re.captures_iter(text) {
            let title = cap[1].trim().to_string();
            let len = title.chars().count();
            if !(5..=120).contains(&len) {
                continue;
            }
            if titles.contains(&title) {
                continue;
            }
            titles.push(title);
            if titles.len() >= EXTRACT_MAX {
                return titles;
            }
        }
    }
    titles
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (tempfile::TempDir, TaskTracker) {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().to_string_lossy().to_string();
        let config = Arc::new(Config::from_lookup(&move |key| match key {
            "OSA_HOME" => Some(home.clone()),
            _ => None,
        }));
        let bus = Arc::new(EventBus::new());
        (dir, TaskTracker::new(config, bus))
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let (_dir, tracker) = tracker();
        let task = tracker.add_task("s1", "write the parser").await.unwrap();
        assert_eq!(task.status, TrackedStatus::Pending);

        let task = tracker.start_task("s1", &task.id).await.unwrap();
        assert_eq!(task.status, TrackedStatus::InProgress);
        assert!(task.started_at.is_some());

        let task = tracker.complete_task("s1", &task.id).await.unwrap();
        assert_eq!(task.status, TrackedStatus::Completed);
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn invalid_transitions_rejected() {
        let (_dir, tracker) = tracker();
        let task = tracker.add_task("s1", "deploy the service").await.unwrap();
        // pending -> completed skips in_progress.
        assert!(tracker.complete_task("s1", &task.id).await.is_err());

        tracker.start_task("s1", &task.id).await.unwrap();
        tracker
            .fail_task("s1", &task.id, "build broke")
            .await
            .unwrap();
        let tasks = tracker.get_tasks("s1");
        assert_eq!(tasks[0].status, TrackedStatus::Failed);
        assert_eq!(tasks[0].reason.as_deref(), Some("build broke"));
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let (dir, tracker) = tracker();
        let task = tracker.add_task("s1", "first real task").await.unwrap();
        tracker.record_tokens("s1", &task.id, 1234).await.unwrap();

        // A fresh tracker over the same home dir rehydrates from disk.
        let home = dir.path().to_string_lossy().to_string();
        let config = Arc::new(Config::from_lookup(&move |key| match key {
            "OSA_HOME" => Some(home.clone()),
            _ => None,
        }));
        let tracker2 = TaskTracker::new(config, Arc::new(EventBus::new()));
        let tasks = tracker2.get_tasks("s1");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "first real task");
        assert_eq!(tasks[0].tokens, 1234);
    }

    #[test]
    fn extraction_rules() {
        let text = "Here's the plan:\n\
            1. Set up the project scaffolding\n\
            2. Write the tokenizer\n\
            3. ok\n\
            - [ ] Wire the CLI entrypoint\n\
            - [x] Wire the CLI entrypoint\n";
        let titles = extract_titles(text);
        // "ok" is too short; the duplicate checkbox collapses.
        assert_eq!(
            titles,
            vec![
                "Set up the project scaffolding",
                "Write the tokenizer",
                "Wire the CLI entrypoint",
            ]
        );
    }

    #[test]
    fn extraction_caps_at_twenty() {
        let text: String = (0..30)
            .map(|i| format!("{}. A perfectly sized task number {i}\n", i + 1))
            .collect();
        assert_eq!(extract_titles(&text).len(), EXTRACT_MAX);
    }

    #[tokio::test]
    async fn auto_extract_only_seeds_empty_sessions() {
        let (_dir, tracker) = tracker();
        let plan = "1. First step to take\n2. Second step to take\n3. Third step to take\n";

        assert_eq!(tracker.auto_extract("s1", plan).await.unwrap(), 3);
        // A second response must not overwrite the checklist.
        assert_eq!(tracker.auto_extract("s1", plan).await.unwrap(), 0);
        assert_eq!(tracker.get_tasks("s1").len(), 3);

        // Two titles is below the seeding threshold.
        assert_eq!(
            tracker
                .auto_extract("s2", "1. Only one thing\n2. And another\n")
                .await
                .unwrap(),
            0
        );
    }
}
