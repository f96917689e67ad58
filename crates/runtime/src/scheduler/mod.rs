//! Scheduled work: heartbeat, cron jobs, and external triggers.
//!
//! The cron engine ticks once a minute and fires every enabled job whose
//! 5-field expression matches the current UTC minute, unless the job's
//! circuit breaker (3 consecutive failures) is open. The heartbeat engine
//! runs the HEARTBEAT.md checklist through one-shot sessions on its own
//! interval, suppressed during quiet hours. Triggers fire on demand with
//! payload interpolation. All of it is at-least-once; breakers bound the
//! damage of repeated failures.

pub mod cron;
pub mod heartbeat;
pub mod triggers;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use osa_domain::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::session::SessionManager;
use crate::state::AppState;
use crate::turn::TurnOutcome;

pub use cron::{cron_matches, validate_cron};
pub use heartbeat::{HeartbeatState, BREAKER_THRESHOLD};
pub use triggers::interpolate;

const CRONS_FILE: &str = "CRONS.json";
const TRIGGERS_FILE: &str = "TRIGGERS.json";
const HEARTBEAT_FILE: &str = "HEARTBEAT.md";
const HEARTBEAT_STATE_FILE: &str = "heartbeat-state.json";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job & trigger models
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Agent,
    Command,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 5-field cron expression, evaluated against UTC.
    pub schedule: String,
    #[serde(rename = "type")]
    pub kind: JobKind,
    /// Natural-language task for `agent` jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    /// Shell command for `command` jobs (sandbox policy applies).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Outbound URL for `webhook` jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    /// `"agent"` to run `failure_job` as an agent task on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_job: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Agent,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    /// Agent task template (`{{payload}}` etc. substituted).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    /// Shell command template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CronsFile {
    #[serde(default)]
    jobs: Vec<CronJob>,
}

#[derive(Debug, Default, Deserialize)]
struct TriggersFile {
    #[serde(default)]
    triggers: Vec<Trigger>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SchedulerInner {
    jobs: Vec<CronJob>,
    triggers: HashMap<String, Trigger>,
    /// Consecutive failure counts, keyed by job/trigger id. Survives
    /// `reload`; cleared per item on success.
    breakers: HashMap<String, u32>,
}

pub struct Scheduler {
    state: AppState,
    manager: Arc<SessionManager>,
    inner: RwLock<SchedulerInner>,
    http: reqwest::Client,
}

impl Scheduler {
    pub fn new(state: AppState, manager: Arc<SessionManager>) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            http: reqwest::Client::new(),
            inner: RwLock::new(SchedulerInner {
                jobs: Vec::new(),
                triggers: HashMap::new(),
                breakers: HashMap::new(),
            }),
            state,
            manager,
        });
        scheduler.reload();
        scheduler
    }

    /// Re-read CRONS.json and TRIGGERS.json without restarting the
    /// engine. Circuit-breaker state is preserved.
    pub fn reload(&self) {
        let config_dir = &self.state.config.config_dir;
        let jobs = read_json::<CronsFile>(&config_dir.join(CRONS_FILE))
            .map(|f| f.jobs)
            .unwrap_or_default();
        let triggers = read_json::<TriggersFile>(&config_dir.join(TRIGGERS_FILE))
            .map(|f| f.triggers)
            .unwrap_or_default();

        for job in &jobs {
            if let Err(e) = validate_cron(&job.schedule) {
                tracing::warn!(job_id = %job.id, error = %e, "cron job has a malformed schedule");
            }
        }

        let mut inner = self.inner.write();
        inner.jobs = jobs;
        inner.triggers = triggers.into_iter().map(|t| (t.id.clone(), t)).collect();
        tracing::info!(
            jobs = inner.jobs.len(),
            triggers = inner.triggers.len(),
            "scheduler definitions loaded"
        );
    }

    /// Start the background engines.
    pub fn start(self: &Arc<Self>) {
        let cron = self.clone();
        tokio::spawn(async move {
            // Align to the next whole minute so each tick evaluates one
            // minute exactly once.
            let now = Utc::now();
            let to_next = 60 - (now.timestamp() % 60) as u64;
            tokio::time::sleep(std::time::Duration::from_secs(to_next)).await;
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tick.tick().await;
                cron.cron_tick(Utc::now()).await;
            }
        });

        let heartbeat = self.clone();
        let interval = self.state.config.heartbeat_interval_secs;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(interval.max(1)));
            tick.tick().await; // immediate first tick consumed
            loop {
                tick.tick().await;
                heartbeat.heartbeat_tick().await;
            }
        });
    }

    // ── Cron ───────────────────────────────────────────────────────

    /// Evaluate one minute. Public for tests.
    pub async fn cron_tick(&self, now: chrono::DateTime<Utc>) {
        let due: Vec<CronJob> = {
            let inner = self.inner.read();
            inner
                .jobs
                .iter()
                .filter(|job| job.enabled)
                .filter(|job| {
                    let open = inner
                        .breakers
                        .get(&job.id)
                        .map(|n| *n >= BREAKER_THRESHOLD)
                        .unwrap_or(false);
                    if open {
                        tracing::warn!(job_id = %job.id, "circuit breaker open, skipping job");
                    }
                    !open
                })
                .filter(|job| cron_matches(&job.schedule, &now))
                .cloned()
                .collect()
        };

        for job in due {
            tracing::info!(job_id = %job.id, name = %job.name, "cron job due");
            let outcome = self.run_cron_job(&job).await;
            self.record_outcome(&job.id, outcome);
        }
    }

    async fn run_cron_job(&self, job: &CronJob) -> Result<()> {
        match job.kind {
            JobKind::Agent => {
                let task = job
                    .job
                    .as_deref()
                    .ok_or_else(|| Error::Scheduler(format!("job '{}' has no task", job.id)))?;
                self.run_agent_task(task).await
            }
            JobKind::Command => {
                let command = job
                    .command
                    .as_deref()
                    .ok_or_else(|| Error::Scheduler(format!("job '{}' has no command", job.id)))?;
                osa_tools::exec::shell_execute(
                    command,
                    &self.state.config.workspace_root,
                    std::time::Duration::from_secs(self.state.config.tool_timeout_secs),
                )
                .await
                .map(|_| ())
            }
            JobKind::Webhook => {
                let result = self.run_webhook(job).await;
                if result.is_err() && job.on_failure.as_deref() == Some("agent") {
                    if let Some(fallback) = job.failure_job.as_deref() {
                        tracing::warn!(job_id = %job.id, "webhook failed, running fallback agent task");
                        if let Err(e) = self.run_agent_task(fallback).await {
                            tracing::warn!(job_id = %job.id, error = %e, "fallback agent task failed");
                        }
                    }
                }
                result
            }
        }
    }

    async fn run_webhook(&self, job: &CronJob) -> Result<()> {
        let url = job
            .url
            .as_deref()
            .ok_or_else(|| Error::Scheduler(format!("job '{}' has no url", job.id)))?;
        let method = job.method.as_deref().unwrap_or("POST").to_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| Error::Scheduler(format!("bad method for job '{}'", job.id)))?;

        let mut request = self.http.request(method, url);
        if let Some(headers) = &job.headers {
            for (k, v) in headers {
                request = request.header(k, v);
            }
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Scheduler(format!("webhook '{}': {e}", job.id)))?;
        if !response.status().is_success() {
            return Err(Error::Scheduler(format!(
                "webhook '{}' returned HTTP {}",
                job.id,
                response.status().as_u16()
            )));
        }
        Ok(())
    }

    async fn run_agent_task(&self, task: &str) -> Result<()> {
        let result = self.manager.run_once("cron", task).await?;
        if result.had_error {
            return Err(Error::Scheduler(format!(
                "agent task errored: {}",
                result.outcome.text()
            )));
        }
        match result.outcome {
            TurnOutcome::Final(_) | TurnOutcome::Noise(_) | TurnOutcome::Plan(_) => Ok(()),
        }
    }

    fn record_outcome(&self, id: &str, outcome: Result<()>) {
        let mut inner = self.inner.write();
        match outcome {
            Ok(()) => {
                inner.breakers.remove(id);
            }
            Err(e) => {
                let count = inner.breakers.entry(id.to_string()).or_insert(0);
                *count += 1;
                tracing::warn!(
                    id,
                    consecutive_failures = *count,
                    error = %e,
                    "scheduled job failed"
                );
            }
        }
    }

    /// Consecutive failure count for a job or trigger (observability).
    pub fn breaker_count(&self, id: &str) -> u32 {
        self.inner.read().breakers.get(id).copied().unwrap_or(0)
    }

    pub fn jobs(&self) -> Vec<CronJob> {
        self.inner.read().jobs.clone()
    }

    // ── Triggers ───────────────────────────────────────────────────

    /// Fire a trigger by id with an arbitrary payload (e.g. from an
    /// external webhook receiver).
    pub async fn fire_trigger(&self, id: &str, payload: serde_json::Value) -> Result<()> {
        let trigger = {
            let inner = self.inner.read();
            inner
                .triggers
                .get(id)
                .cloned()
                .ok_or_else(|| Error::Scheduler(format!("unknown trigger '{id}'")))?
        };
        if !trigger.enabled {
            return Err(Error::Scheduler(format!("trigger '{id}' is disabled")));
        }
        if self.breaker_count(id) >= BREAKER_THRESHOLD {
            return Err(Error::Scheduler(format!("trigger '{id}' breaker is open")));
        }

        let outcome = match trigger.kind {
            TriggerKind::Agent => {
                let template = trigger
                    .job
                    .as_deref()
                    .ok_or_else(|| Error::Scheduler(format!("trigger '{id}' has no task")))?;
                let task = interpolate(template, &payload);
                self.run_agent_task(&task).await
            }
            TriggerKind::Command => {
                let template = trigger
                    .command
                    .as_deref()
                    .ok_or_else(|| Error::Scheduler(format!("trigger '{id}' has no command")))?;
                let command = interpolate(template, &payload);
                osa_tools::exec::shell_execute(
                    &command,
                    &self.state.config.workspace_root,
                    std::time::Duration::from_secs(self.state.config.tool_timeout_secs),
                )
                .await
                .map(|_| ())
            }
        };

        let failed = outcome.is_err();
        self.record_outcome(id, outcome);
        if failed {
            Err(Error::Scheduler(format!("trigger '{id}' failed")))
        } else {
            Ok(())
        }
    }

    // ── Heartbeat ──────────────────────────────────────────────────

    /// One heartbeat pass. Public for tests.
    pub async fn heartbeat_tick(&self) {
        let now_local = chrono::Local::now().time();
        if self.state.config.in_quiet_hours(now_local) {
            tracing::debug!("heartbeat suppressed by quiet hours");
            return;
        }

        let md_path = self.state.config.config_dir.join(HEARTBEAT_FILE);
        let Ok(markdown) = std::fs::read_to_string(&md_path) else {
            return;
        };
        let tasks = heartbeat::unchecked_tasks(&markdown);
        if tasks.is_empty() {
            return;
        }

        let state_path = self.state.config.config_dir.join(HEARTBEAT_STATE_FILE);
        let mut hb_state = HeartbeatState::load(&state_path);

        self.state.bus.emit_system(
            "heartbeat_started",
            serde_json::json!({"tasks": tasks.len()}),
        );

        for task in tasks {
            if hb_state.breaker_open(&task) {
                tracing::warn!(task = %task, "heartbeat breaker open, skipping task");
                continue;
            }

            match self.manager.run_once("heartbeat", &task).await {
                Ok(result) if result.had_error => {
                    tracing::warn!(task = %task, "heartbeat task errored");
                    hb_state.record_failure(&task, result.outcome.text());
                }
                Ok(result) => {
                    let reply = result.outcome.text().to_string();
                    hb_state.record_success(&task, &reply);
                    // Rewrite the checklist line; reread in case a
                    // previous task in this pass already rewrote it.
                    if let Ok(current) = std::fs::read_to_string(&md_path) {
                        if let Some(updated) = heartbeat::check_off(&current, &task, Utc::now()) {
                            if let Err(e) = osa_tools::file_ops::write_atomic(
                                &md_path,
                                updated.as_bytes(),
                            )
                            .await
                            {
                                tracing::warn!(error = %e, "failed to rewrite HEARTBEAT.md");
                            }
                        }
                    }
                    self.state.bus.emit_system(
                        "heartbeat_completed",
                        serde_json::json!({"task": task, "result": reply}),
                    );
                }
                Err(e) => {
                    tracing::warn!(task = %task, error = %e, "heartbeat task failed");
                    hb_state.record_failure(&task, &e.to_string());
                }
            }
        }

        if let Err(e) = hb_state.save(&state_path).await {
            tracing::warn!(error = %e, "failed to persist heartbeat state");
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Option<T> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "malformed scheduler file");
            None
        }
    }
}
