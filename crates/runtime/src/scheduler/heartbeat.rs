//! Heartbeat engine support: HEARTBEAT.md checkbox parsing and the
//! persisted per-task state.
//!
//! `HEARTBEAT.md` is a plain markdown checklist. The engine runs each
//! unchecked task through a one-shot session and, on success, rewrites
//! the line to checked with a completion timestamp. State (run counts,
//! consecutive failures, last results) persists as JSON with an atomic
//! replace.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use osa_domain::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Consecutive failures that open a task's circuit breaker.
pub const BREAKER_THRESHOLD: u32 = 3;

/// Per-task heartbeat record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRecord {
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub run_count: u32,
    pub consecutive_failures: u32,
}

/// Persisted heartbeat state, keyed by task text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatState {
    pub tasks: HashMap<String, TaskRecord>,
}

impl HeartbeatState {
    pub fn load(path: &Path) -> HeartbeatState {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        osa_tools::file_ops::write_atomic(path, &json).await
    }

    pub fn record_success(&mut self, task: &str, result: &str) {
        let record = self.tasks.entry(task.to_string()).or_default();
        record.last_run = Some(Utc::now());
        record.last_result = Some(result.to_string());
        record.run_count += 1;
        record.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self, task: &str, error: &str) {
        let record = self.tasks.entry(task.to_string()).or_default();
        record.last_run = Some(Utc::now());
        record.last_result = Some(format!("error: {error}"));
        record.run_count += 1;
        record.consecutive_failures += 1;
    }

    /// Whether this task's breaker is open (skip it).
    pub fn breaker_open(&self, task: &str) -> bool {
        self.tasks
            .get(task)
            .map(|r| r.consecutive_failures >= BREAKER_THRESHOLD)
            .unwrap_or(false)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HEARTBEAT.md parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Unchecked task lines (`- [ ] …`), in file order.
pub fn unchecked_tasks(markdown: &str) -> Vec<String> {
    markdown
        .lines()
        .filter_map(|line| line.trim().strip_prefix("- [ ] "))
        .map(|task| task.trim().to_string())
        .filter(|task| !task.is_empty())
        .collect()
}

/// Rewrite the first matching unchecked line to checked, appending the
/// completion timestamp. Returns the new content, or `None` when the
/// task is no longer present unchecked.
pub fn check_off(markdown: &str, task: &str, completed_at: DateTime<Utc>) -> Option<String> {
    let needle = format!("- [ ] {task}");
    let mut done = false;
    let lines: Vec<String> = markdown
        .lines()
        .map(|line| {
            if !done && line.trim() == needle {
                done = true;
                let indent: String = line
                    .chars()
                    .take_while(|c| c.is_whitespace())
                    .collect();
                format!(
                    "{indent}- [x] {task} (completed {})",
                    completed_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
                )
            } else {
                line.to_string()
            }
        })
        .collect();
    if !done {
        return None;
    }
    let mut out = lines.join("\n");
    if markdown.ends_with('\n') {
        out.push('\n');
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAMPLE: &str = "# Heartbeat\n\
        \n\
        - [ ] tidy the downloads folder\n\
        - [x] rotate the logs (completed 2026-01-01T00:00:00Z)\n\
        - [ ] check disk space\n";

    #[test]
    fn unchecked_tasks_parsed_in_order() {
        let tasks = unchecked_tasks(SAMPLE);
        assert_eq!(tasks, vec!["tidy the downloads folder", "check disk space"]);
    }

    #[test]
    fn check_off_rewrites_line() {
        let at = Utc.with_ymd_and_hms(2026, 2, 3, 4, 5, 6).unwrap();
        let updated = check_off(SAMPLE, "check disk space", at).unwrap();
        assert!(updated.contains("- [x] check disk space (completed 2026-02-03T04:05:06Z)"));
        // The other unchecked task is untouched.
        assert!(updated.contains("- [ ] tidy the downloads folder"));
        assert_eq!(unchecked_tasks(&updated).len(), 1);
    }

    #[test]
    fn check_off_missing_task_is_none() {
        let at = Utc::now();
        assert!(check_off(SAMPLE, "not a task", at).is_none());
    }

    #[test]
    fn breaker_opens_after_three_failures() {
        let mut state = HeartbeatState::default();
        for _ in 0..2 {
            state.record_failure("flaky", "boom");
            assert!(!state.breaker_open("flaky"));
        }
        state.record_failure("flaky", "boom");
        assert!(state.breaker_open("flaky"));

        // Success clears the breaker.
        state.record_success("flaky", "ok");
        assert!(!state.breaker_open("flaky"));
        assert_eq!(state.tasks["flaky"].run_count, 4);
    }

    #[tokio::test]
    async fn state_round_trips_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat-state.json");
        let mut state = HeartbeatState::default();
        state.record_success("tidy", "done");
        state.save(&path).await.unwrap();

        let loaded = HeartbeatState::load(&path);
        assert_eq!(loaded.tasks["tidy"].run_count, 1);
        // No stray tmp siblings.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
