//! Wave-based sub-agent orchestration.
//!
//! A complex task is decomposed by a structured LLM call into named
//! sub-tasks with roles and dependency edges, topologically grouped into
//! waves, executed wave-by-wave with one bounded sub-agent loop per
//! sub-task, and synthesized into a single answer. Failures never abort a
//! wave; they surface as `FAILED: …` results in the synthesis input.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use osa_domain::agent::{AgentRole, AgentTier};
use osa_domain::error::{Error, Result};
use osa_domain::message::{Message, ToolDefinition};
use osa_providers::CallOptions;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::skills::SkillRecord;
use crate::state::AppState;
use crate::turn;

/// Hard wall-clock limit per sub-agent.
const SUB_AGENT_TIMEOUT: Duration = Duration::from_secs(300);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Role templates (data, not code)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn role_template(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Lead => "You are the lead agent. You own the overall shape of the solution: \
            decide structure, set conventions, and resolve ambiguity for the other agents. \
            Deliver decisions, not options.",
        AgentRole::Backend => "You are a backend specialist. You build server-side logic, \
            APIs, and integrations. Favor explicit error handling and small, verifiable steps.",
        AgentRole::Frontend => "You are a frontend specialist. You build user-facing surfaces \
            and wire them to the backend contract exactly as specified.",
        AgentRole::Data => "You are a data specialist. You design schemas, queries, and \
            pipelines. State your assumptions about data shapes explicitly.",
        AgentRole::Design => "You are a design specialist. You produce layouts, copy, and \
            interaction flows. Keep output concrete enough to implement directly.",
        AgentRole::Infra => "You are an infrastructure specialist. You handle deployment, \
            configuration, and operational wiring. Never leave a system half-configured.",
        AgentRole::Qa => "You are a QA specialist. You probe the other agents' output for \
            defects, missing cases, and contract violations. Report findings, do not fix.",
        AgentRole::RedTeam => "You are a red-team specialist. You attack the proposed solution: \
            security holes, abuse paths, failure cascades. Report the strongest breaks first.",
        AgentRole::Services => "You are a services specialist. You integrate third-party \
            services and background jobs, with careful attention to credentials and limits.",
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decomposition types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct SubTaskSpec {
    pub name: String,
    pub description: String,
    pub role: AgentRole,
    pub tools_needed: Vec<String>,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawSubTask {
    name: String,
    description: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    tools_needed: Vec<String>,
    #[serde(default)]
    depends_on: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawDecomposition {
    complexity: String,
    #[serde(default)]
    sub_tasks: Vec<RawSubTask>,
}

#[derive(Debug, Clone)]
pub enum Analysis {
    Simple,
    Complex(Vec<SubTaskSpec>),
}

/// Outcome of `suggest_or_create`.
pub enum SkillLifecycle {
    Created(SkillRecord),
    /// High-relevance existing skills; creation deferred to the user.
    Candidates(Vec<(SkillRecord, f32)>),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentState {
    pub id: String,
    pub name: String,
    pub role: AgentRole,
    pub tier: AgentTier,
    pub status: AgentStatus,
    pub tool_use_count: u32,
    pub estimated_tokens: u32,
    pub current_action: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    /// At least one sub-agent failed; synthesis covers the rest.
    Partial,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratedTask {
    pub id: Uuid,
    pub message: String,
    pub session_id: String,
    pub status: TaskStatus,
    pub sub_tasks: Vec<SubTaskSpec>,
    pub agents: HashMap<String, AgentState>,
    pub results: HashMap<String, String>,
    pub synthesis: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Live progress for one sub-agent, relayed onto the bus.
#[derive(Debug, Clone)]
struct AgentProgress {
    name: String,
    tool_use_count: u32,
    estimated_tokens: u32,
    current_action: String,
}

type TaskStore = Arc<RwLock<HashMap<Uuid, OrchestratedTask>>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wave scheduling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Topological wave grouping: wave N holds every sub-task whose
/// dependencies all live in earlier waves. A cycle (or a dangling
/// dependency) forces the remaining tasks into one final parallel wave
/// rather than deadlocking.
pub fn build_waves(specs: &[SubTaskSpec]) -> Vec<Vec<SubTaskSpec>> {
    let known: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
    let mut resolved: Vec<String> = Vec::new();
    let mut remaining: Vec<SubTaskSpec> = specs.to_vec();
    let mut waves: Vec<Vec<SubTaskSpec>> = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<SubTaskSpec>, Vec<SubTaskSpec>) =
            remaining.into_iter().partition(|spec| {
                spec.depends_on.iter().all(|dep| {
                    resolved.iter().any(|r| r == dep) || !known.contains(&dep.as_str())
                })
            });

        if ready.is_empty() {
            tracing::warn!(
                remaining = blocked.len(),
                "dependency cycle detected; forcing remaining sub-tasks into one wave"
            );
            waves.push(blocked);
            break;
        }

        resolved.extend(ready.iter().map(|s| s.name.clone()));
        waves.push(ready);
        remaining = blocked;
    }

    waves
}

fn dependency_context(spec: &SubTaskSpec, results: &HashMap<String, String>) -> Option<String> {
    let sections: Vec<String> = spec
        .depends_on
        .iter()
        .filter_map(|dep| {
            results
                .get(dep)
                .map(|r| format!("### {dep}\n{r}"))
        })
        .collect();
    if sections.is_empty() {
        None
    } else {
        Some(format!(
            "## Context from Previous Agents\n{}",
            sections.join("\n\n")
        ))
    }
}

fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Orchestrator {
    state: AppState,
    tasks: TaskStore,
}

impl Orchestrator {
    pub fn new(state: AppState) -> Arc<Self> {
        Arc::new(Self {
            state,
            tasks: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    // ── Analysis ───────────────────────────────────────────────────

    /// LLM decomposition. The response must be strict JSON encoding
    /// either `{"complexity": "simple"}` or a sub-task list.
    pub async fn analyze(&self, message: &str) -> Result<Analysis> {
        let tool_names: Vec<String> = self
            .state
            .tools
            .list_direct()
            .into_iter()
            .map(|d| d.name)
            .collect();
        let roles: Vec<&str> = AgentRole::ALL.iter().map(|r| r.as_str()).collect();

        let prompt = format!(
            "Decide whether this task needs a team of sub-agents.\n\
             Respond with strict JSON only, no prose.\n\
             Simple task: {{\"complexity\": \"simple\"}}\n\
             Complex task: {{\"complexity\": \"complex\", \"sub_tasks\": [{{\"name\": \"...\", \
             \"description\": \"...\", \"role\": \"...\", \"tools_needed\": [...], \
             \"depends_on\": [...]}}]}}\n\
             Roles: {roles:?}\nAvailable tools: {tool_names:?}\n\
             Sub-task names must be unique; depends_on refers to other sub-task names.\n\n\
             TASK:\n{message}"
        );
        let opts = CallOptions {
            json_mode: true,
            temperature: Some(0.2),
            max_tokens: Some(2000),
            ..Default::default()
        };
        let resp = self
            .state
            .router
            .chat(&[Message::user(prompt)], &[], &opts)
            .await?;

        let raw: RawDecomposition = serde_json::from_str(strip_fences(&resp.content))
            .map_err(|e| Error::Other(format!("decomposition is not valid JSON: {e}")))?;

        if raw.complexity != "complex" || raw.sub_tasks.is_empty() {
            return Ok(Analysis::Simple);
        }

        let mut specs: Vec<SubTaskSpec> = raw
            .sub_tasks
            .into_iter()
            .map(|t| SubTaskSpec {
                role: AgentRole::parse(&t.role),
                tools_needed: t.tools_needed,
                depends_on: t.depends_on,
                name: t.name,
                description: t.description,
            })
            .collect();

        let cap = self.state.config.max_concurrent_agents;
        if specs.len() > cap {
            tracing::warn!(
                requested = specs.len(),
                cap,
                "decomposition exceeds the sub-task cap; truncating"
            );
            specs.truncate(cap);
        }
        Ok(Analysis::Complex(specs))
    }

    // ── Execution ──────────────────────────────────────────────────

    /// Run the full pipeline. Returns the task id and the synthesis.
    pub async fn execute(&self, message: &str, session_id: &str) -> Result<(Uuid, String)> {
        let specs = match self.analyze(message).await? {
            Analysis::Complex(specs) => specs,
            Analysis::Simple => vec![SubTaskSpec {
                name: "task".into(),
                description: message.to_string(),
                role: AgentRole::Lead,
                tools_needed: self
                    .state
                    .tools
                    .list_direct()
                    .into_iter()
                    .map(|d| d.name)
                    .collect(),
                depends_on: Vec::new(),
            }],
        };

        let task_id = Uuid::new_v4();
        let waves = build_waves(&specs);

        let mut agents = HashMap::new();
        for spec in &specs {
            agents.insert(
                spec.name.clone(),
                AgentState {
                    id: Uuid::new_v4().to_string(),
                    name: spec.name.clone(),
                    role: spec.role,
                    tier: spec.role.default_tier(),
                    status: AgentStatus::Pending,
                    tool_use_count: 0,
                    estimated_tokens: 0,
                    current_action: "pending".into(),
                    started_at: None,
                    completed_at: None,
                    result: None,
                },
            );
        }
        self.tasks.write().insert(
            task_id,
            OrchestratedTask {
                id: task_id,
                message: message.to_string(),
                session_id: session_id.to_string(),
                status: TaskStatus::Running,
                sub_tasks: specs.clone(),
                agents,
                results: HashMap::new(),
                synthesis: None,
                created_at: Utc::now(),
                completed_at: None,
            },
        );

        self.state.bus.emit_system(
            "orchestrator_task_started",
            serde_json::json!({"task_id": task_id, "sub_tasks": specs.len(), "waves": waves.len()}),
        );

        let mut results: HashMap<String, String> = HashMap::new();
        let mut any_failed = false;

        for wave in &waves {
            self.state.bus.emit_system(
                "orchestrator_agents_spawning",
                serde_json::json!({
                    "task_id": task_id,
                    "agents": wave.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
                }),
            );

            let (progress_tx, progress_rx) = mpsc::unbounded_channel::<AgentProgress>();
            spawn_progress_relay(self.state.clone(), self.tasks.clone(), task_id, progress_rx);

            let futures: Vec<_> = wave
                .iter()
                .map(|spec| {
                    let dep_context = dependency_context(spec, &results);
                    self.run_sub_agent(task_id, spec, dep_context, progress_tx.clone())
                })
                .collect();
            drop(progress_tx);

            let outcomes = futures_util::future::join_all(futures).await;
            for (spec, outcome) in wave.iter().zip(outcomes) {
                let (result, failed) = match outcome {
                    Ok(text) => (text, false),
                    Err(e) => (format!("FAILED: {e}"), true),
                };
                any_failed |= failed;
                self.finish_agent(task_id, &spec.name, &result, failed);
                results.insert(spec.name.clone(), result);
            }
        }

        let synthesis = match self.synthesize(message, &specs, &results, any_failed).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "synthesis failed, concatenating agent results");
                specs
                    .iter()
                    .filter_map(|s| results.get(&s.name).map(|r| format!("## {}\n{}", s.name, r)))
                    .collect::<Vec<_>>()
                    .join("\n\n")
            }
        };

        let status = if any_failed {
            TaskStatus::Partial
        } else {
            TaskStatus::Completed
        };
        {
            let mut tasks = self.tasks.write();
            if let Some(task) = tasks.get_mut(&task_id) {
                task.results = results;
                task.synthesis = Some(synthesis.clone());
                task.status = status;
                task.completed_at = Some(Utc::now());
            }
        }
        self.state.bus.emit_system(
            "orchestrator_task_completed",
            serde_json::json!({"task_id": task_id, "status": status}),
        );

        Ok((task_id, synthesis))
    }

    pub fn progress(&self, task_id: &Uuid) -> Option<OrchestratedTask> {
        self.tasks.read().get(task_id).cloned()
    }

    pub fn list_tasks(&self) -> Vec<OrchestratedTask> {
        let mut tasks: Vec<OrchestratedTask> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    // ── Skill lifecycle ────────────────────────────────────────────

    pub fn create_skill(
        &self,
        name: &str,
        description: &str,
        instructions: &str,
        tools: &[String],
    ) -> Result<SkillRecord> {
        let record = self
            .state
            .skills
            .create_skill(name, description, instructions, tools)?;
        self.state.bus.emit_system(
            "skill_created",
            serde_json::json!({"name": record.name, "description": record.description}),
        );
        Ok(record)
    }

    /// Existing skills at or above the relevance threshold short-circuit
    /// creation; the candidates come back for user confirmation.
    pub fn suggest_or_create(
        &self,
        name: &str,
        description: &str,
        instructions: &str,
        tools: &[String],
    ) -> Result<SkillLifecycle> {
        let candidates = self.state.skills.suggest(name, description);
        if !candidates.is_empty() {
            return Ok(SkillLifecycle::Candidates(candidates));
        }
        Ok(SkillLifecycle::Created(self.create_skill(
            name,
            description,
            instructions,
            tools,
        )?))
    }

    // ── Sub-agent loop ─────────────────────────────────────────────

    /// One bounded reasoning loop for one sub-task, under the tier's
    /// envelope and the 5-minute wall clock.
    async fn run_sub_agent(
        &self,
        task_id: Uuid,
        spec: &SubTaskSpec,
        dep_context: Option<String>,
        progress: mpsc::UnboundedSender<AgentProgress>,
    ) -> Result<String> {
        {
            let mut tasks = self.tasks.write();
            if let Some(task) = tasks.get_mut(&task_id) {
                if let Some(agent) = task.agents.get_mut(&spec.name) {
                    agent.status = AgentStatus::Running;
                    agent.started_at = Some(Utc::now());
                    agent.current_action = "starting".into();
                }
            }
        }
        self.state.bus.emit_system(
            "orchestrator_agent_started",
            serde_json::json!({"task_id": task_id, "agent": spec.name, "role": spec.role}),
        );

        let work = self.sub_agent_loop(spec, dep_context, progress);
        match tokio::time::timeout(SUB_AGENT_TIMEOUT, work).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "sub-agent '{}' exceeded the {}s limit",
                spec.name,
                SUB_AGENT_TIMEOUT.as_secs()
            ))),
        }
    }

    async fn sub_agent_loop(
        &self,
        spec: &SubTaskSpec,
        dep_context: Option<String>,
        progress: mpsc::UnboundedSender<AgentProgress>,
    ) -> Result<String> {
        let tier = spec.role.default_tier();
        let params = tier.params();

        // Tier-aware model selection via the tier map.
        let (provider, model) = {
            let tiers = self.state.tiers.read();
            match tiers.resolve(tier) {
                Some(spec) => (Some(spec.provider.clone()), Some(spec.model.clone())),
                None => (None, None),
            }
        };
        let opts = CallOptions {
            provider,
            model,
            temperature: Some(params.temperature),
            max_tokens: Some(params.max_response_tokens),
            ..Default::default()
        };

        // Tool set = registered ∩ tools_needed, via the lock-free path.
        let tools: Vec<ToolDefinition> = self
            .state
            .tools
            .list_direct()
            .into_iter()
            .filter(|d| spec.tools_needed.contains(&d.name))
            .collect();

        let system = format!(
            "{}\n\nYour task: {}\n\nExecution parameters: tier={tier}, \
             max {max_iter} reasoning steps, stay within ~{budget} tokens.",
            role_template(spec.role),
            spec.description,
            max_iter = params.max_iterations,
            budget = params.token_budget,
        );
        let user = match &dep_context {
            Some(ctx) => format!("{ctx}\n\n{}", spec.description),
            None => spec.description.clone(),
        };

        let mut messages = vec![Message::system(system), Message::user(user)];
        let mut tool_use_count: u32 = 0;
        let mut estimated_tokens: u32 = 0;

        for iteration in 0..params.max_iterations {
            let resp = self.state.router.chat(&messages, &tools, &opts).await?;
            if let Some(usage) = &resp.usage {
                estimated_tokens += usage.total_tokens;
            }

            if resp.tool_calls.is_empty() {
                let _ = progress.send(AgentProgress {
                    name: spec.name.clone(),
                    tool_use_count,
                    estimated_tokens,
                    current_action: "finished".into(),
                });
                return Ok(resp.content);
            }

            messages.push(turn::assistant_message_for(&resp));
            for tc in &resp.tool_calls {
                tool_use_count += 1;
                let _ = progress.send(AgentProgress {
                    name: spec.name.clone(),
                    tool_use_count,
                    estimated_tokens,
                    current_action: format!("tool:{}", tc.tool_name),
                });

                let content = if !spec.tools_needed.contains(&tc.tool_name) {
                    format!("Error: tool '{}' is not available to this agent", tc.tool_name)
                } else {
                    match self
                        .state
                        .tools
                        .execute_direct(&tc.tool_name, &tc.arguments)
                        .await
                    {
                        Ok(osa_tools::ToolOutput::Text(text)) => text,
                        Ok(osa_tools::ToolOutput::Image { media_type, .. }) => {
                            format!("[image: {media_type}]")
                        }
                        Err(e) => format!("Error: {e}"),
                    }
                };
                messages.push(Message::tool_result(&tc.call_id, content));
            }

            tracing::debug!(
                agent = %spec.name,
                iteration,
                tool_use_count,
                "sub-agent iteration complete"
            );
        }

        Err(Error::Other(format!(
            "sub-agent '{}' hit its {} iteration cap",
            spec.name, params.max_iterations
        )))
    }

    async fn synthesize(
        &self,
        message: &str,
        specs: &[SubTaskSpec],
        results: &HashMap<String, String>,
        any_failed: bool,
    ) -> Result<String> {
        let mut sections = String::new();
        for spec in specs {
            if let Some(result) = results.get(&spec.name) {
                sections.push_str(&format!(
                    "## {} ({})\n{}\n\n",
                    spec.name, spec.role, result
                ));
            }
        }
        let partial_note = if any_failed {
            "Some sub-agents FAILED; mark the answer as PARTIAL and say what is missing.\n"
        } else {
            ""
        };
        let prompt = format!(
            "Combine the sub-agent results below into one unified answer to the original \
             request. Resolve overlaps; do not mention the agents themselves.\n{partial_note}\n\
             ORIGINAL REQUEST:\n{message}\n\nSUB-AGENT RESULTS:\n{sections}"
        );
        let opts = CallOptions {
            temperature: Some(0.3),
            max_tokens: Some(4000),
            ..Default::default()
        };
        let resp = self
            .state
            .router
            .chat(&[Message::user(prompt)], &[], &opts)
            .await?;
        Ok(resp.content)
    }

    fn finish_agent(&self, task_id: Uuid, name: &str, result: &str, failed: bool) {
        {
            let mut tasks = self.tasks.write();
            if let Some(task) = tasks.get_mut(&task_id) {
                if let Some(agent) = task.agents.get_mut(name) {
                    agent.status = if failed {
                        AgentStatus::Failed
                    } else {
                        AgentStatus::Completed
                    };
                    agent.completed_at = Some(Utc::now());
                    agent.result = Some(result.to_string());
                }
            }
        }
        self.state.bus.emit_system(
            "orchestrator_agent_completed",
            serde_json::json!({"task_id": task_id, "agent": name, "failed": failed}),
        );
    }
}

fn spawn_progress_relay(
    state: AppState,
    tasks: TaskStore,
    task_id: Uuid,
    mut rx: mpsc::UnboundedReceiver<AgentProgress>,
) {
    tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            state.bus.emit_system(
                "orchestrator_agent_progress",
                serde_json::json!({
                    "task_id": task_id,
                    "agent": progress.name,
                    "tool_use_count": progress.tool_use_count,
                    "estimated_tokens": progress.estimated_tokens,
                    "current_action": progress.current_action,
                }),
            );
            let mut tasks = tasks.write();
            if let Some(task) = tasks.get_mut(&task_id) {
                if let Some(agent) = task.agents.get_mut(&progress.name) {
                    agent.tool_use_count = progress.tool_use_count;
                    agent.estimated_tokens = progress.estimated_tokens;
                    agent.current_action = progress.current_action;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{state_with_mock, EchoTool};
    use osa_providers::ChatResponse;

    fn spec(name: &str, role: AgentRole, deps: &[&str]) -> SubTaskSpec {
        SubTaskSpec {
            name: name.into(),
            description: format!("do the {name} work"),
            role,
            tools_needed: Vec::new(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    // ── Wave building ──────────────────────────────────────────────

    #[test]
    fn linear_chain_builds_three_waves() {
        let specs = vec![
            spec("schema", AgentRole::Data, &[]),
            spec("api", AgentRole::Backend, &["schema"]),
            spec("ui", AgentRole::Frontend, &["api"]),
        ];
        let waves = build_waves(&specs);
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0][0].name, "schema");
        assert_eq!(waves[1][0].name, "api");
        assert_eq!(waves[2][0].name, "ui");
    }

    #[test]
    fn independent_tasks_share_a_wave() {
        let specs = vec![
            spec("a", AgentRole::Backend, &[]),
            spec("b", AgentRole::Frontend, &[]),
            spec("c", AgentRole::Qa, &["a", "b"]),
        ];
        let waves = build_waves(&specs);
        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0].len(), 2);
        assert_eq!(waves[1][0].name, "c");
    }

    #[test]
    fn cycle_degrades_to_single_wave() {
        let specs = vec![
            spec("a", AgentRole::Backend, &["b"]),
            spec("b", AgentRole::Frontend, &["a"]),
        ];
        let waves = build_waves(&specs);
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].len(), 2);
    }

    #[test]
    fn unknown_dependency_does_not_block() {
        let specs = vec![spec("a", AgentRole::Backend, &["ghost"])];
        let waves = build_waves(&specs);
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0][0].name, "a");
    }

    #[test]
    fn dependency_context_threads_results() {
        let s = spec("api", AgentRole::Backend, &["schema"]);
        let mut results = HashMap::new();
        results.insert("schema".to_string(), "CREATE TABLE users".to_string());
        let ctx = dependency_context(&s, &results).unwrap();
        assert!(ctx.contains("## Context from Previous Agents"));
        assert!(ctx.contains("### schema"));
        assert!(ctx.contains("CREATE TABLE users"));
    }

    #[test]
    fn strip_fences_handles_wrapped_json() {
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("{\"a\":1}"), "{\"a\":1}");
    }

    // ── Analysis ───────────────────────────────────────────────────

    #[tokio::test]
    async fn analyze_parses_complex_decomposition() {
        let (state, mock, _guard) = state_with_mock(&[]);
        mock.push_text(
            r#"{"complexity": "complex", "sub_tasks": [
                {"name": "schema", "description": "design the schema", "role": "data",
                 "tools_needed": [], "depends_on": []},
                {"name": "api", "description": "build the api", "role": "api",
                 "tools_needed": [], "depends_on": ["schema"]}
            ]}"#,
        );
        let orch = Orchestrator::new(state);
        match orch.analyze("build a todo service").await.unwrap() {
            Analysis::Complex(specs) => {
                assert_eq!(specs.len(), 2);
                // Legacy alias "api" normalizes.
                assert_eq!(specs[1].role, AgentRole::Backend);
            }
            Analysis::Simple => panic!("expected complex"),
        }
    }

    #[tokio::test]
    async fn analyze_simple_short_circuits() {
        let (state, mock, _guard) = state_with_mock(&[]);
        mock.push_text(r#"{"complexity": "simple"}"#);
        let orch = Orchestrator::new(state);
        assert!(matches!(
            orch.analyze("what time is it").await.unwrap(),
            Analysis::Simple
        ));
    }

    #[tokio::test]
    async fn analyze_caps_sub_tasks() {
        let (state, mock, _guard) = state_with_mock(&[("OSA_MAX_CONCURRENT_AGENTS", "2")]);
        let subs: Vec<String> = (0..5)
            .map(|i| {
                format!(
                    r#"{{"name": "t{i}", "description": "d", "role": "backend",
                        "tools_needed": [], "depends_on": []}}"#
                )
            })
            .collect();
        mock.push_text(format!(
            r#"{{"complexity": "complex", "sub_tasks": [{}]}}"#,
            subs.join(",")
        ));
        let orch = Orchestrator::new(state);
        match orch.analyze("big job").await.unwrap() {
            Analysis::Complex(specs) => assert_eq!(specs.len(), 2),
            Analysis::Simple => panic!("expected complex"),
        }
    }

    // ── Execution ──────────────────────────────────────────────────

    /// The DAG seed case: schema → api → ui, with dependency context
    /// threaded between waves and a final synthesis.
    #[tokio::test]
    async fn dag_execution_threads_context_and_synthesizes() {
        let (state, mock, _guard) = state_with_mock(&[]);
        // 1: decomposition
        mock.push_text(
            r#"{"complexity": "complex", "sub_tasks": [
                {"name": "schema", "description": "design the schema", "role": "data",
                 "tools_needed": [], "depends_on": []},
                {"name": "api", "description": "build the api", "role": "backend",
                 "tools_needed": [], "depends_on": ["schema"]},
                {"name": "ui", "description": "build the ui", "role": "frontend",
                 "tools_needed": [], "depends_on": ["api"]}
            ]}"#,
        );
        // 2-4: one reply per sub-agent (waves run sequentially here).
        mock.push_text("schema: users table with id and name");
        mock.push_text("api: GET /users wired to the schema");
        mock.push_text("ui: user list page calling the api");
        // 5: synthesis
        mock.push_text("A todo service: schema, api, and ui, all wired together.");

        let orch = Orchestrator::new(state.clone());
        let (task_id, synthesis) = orch.execute("build a todo service", "s1").await.unwrap();
        assert!(synthesis.contains("wired together"));

        let task = orch.progress(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.results.len(), 3);
        assert!(task
            .agents
            .values()
            .all(|a| a.status == AgentStatus::Completed));

        // The api agent saw schema's result; the ui agent saw api's.
        let reqs = mock.requests();
        let api_req = &reqs[2];
        let api_user_text = api_req
            .messages
            .iter()
            .map(|m| m.content.extract_all_text())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(api_user_text.contains("Context from Previous Agents"));
        assert!(api_user_text.contains("users table"));

        let ui_req = &reqs[3];
        let ui_user_text = ui_req
            .messages
            .iter()
            .map(|m| m.content.extract_all_text())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(ui_user_text.contains("GET /users"));
    }

    #[tokio::test]
    async fn failed_agent_feeds_failed_marker_downstream() {
        let (state, mock, _guard) = state_with_mock(&[]);
        mock.push_text(
            r#"{"complexity": "complex", "sub_tasks": [
                {"name": "schema", "description": "design the schema", "role": "data",
                 "tools_needed": [], "depends_on": []},
                {"name": "api", "description": "build the api", "role": "backend",
                 "tools_needed": [], "depends_on": ["schema"]}
            ]}"#,
        );
        // schema fails terminally.
        mock.push_error(Error::Provider {
            provider: "anthropic".into(),
            message: "HTTP 401 - bad key".into(),
        });
        // api still runs, with the FAILED marker in its context.
        mock.push_text("api built despite missing schema");
        // synthesis.
        mock.push_text("PARTIAL: api done, schema missing");

        let orch = Orchestrator::new(state);
        let (task_id, synthesis) = orch.execute("build it", "s1").await.unwrap();
        assert!(synthesis.contains("PARTIAL"));

        let task = orch.progress(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Partial);
        assert!(task.results.get("schema").unwrap().starts_with("FAILED:"));
        assert_eq!(task.agents["schema"].status, AgentStatus::Failed);
        assert_eq!(task.agents["api"].status, AgentStatus::Completed);

        let reqs = mock.requests();
        let api_text = reqs[2]
            .messages
            .iter()
            .map(|m| m.content.extract_all_text())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(api_text.contains("FAILED:"));
    }

    #[tokio::test]
    async fn synthesis_failure_concatenates_results() {
        let (state, mock, _guard) = state_with_mock(&[]);
        mock.push_text(
            r#"{"complexity": "complex", "sub_tasks": [
                {"name": "only", "description": "do it", "role": "lead",
                 "tools_needed": [], "depends_on": []}
            ]}"#,
        );
        mock.push_text("the only result");
        mock.push_error(Error::Provider {
            provider: "anthropic".into(),
            message: "HTTP 401 - bad key".into(),
        });

        let orch = Orchestrator::new(state);
        let (_, synthesis) = orch.execute("do it", "s1").await.unwrap();
        assert!(synthesis.contains("## only"));
        assert!(synthesis.contains("the only result"));
    }

    #[tokio::test]
    async fn sub_agent_uses_only_permitted_tools() {
        let (state, mock, _guard) = state_with_mock(&[]);
        state.tools.register(
            osa_domain::message::ToolDefinition::new(
                "file_read",
                "read",
                serde_json::json!({"type": "object"}),
            ),
            std::sync::Arc::new(EchoTool("file data".into())),
        );
        state.tools.register(
            osa_domain::message::ToolDefinition::new(
                "shell_execute",
                "run",
                serde_json::json!({"type": "object"}),
            ),
            std::sync::Arc::new(EchoTool("shell data".into())),
        );
        mock.push_text(
            r#"{"complexity": "complex", "sub_tasks": [
                {"name": "reader", "description": "read the file", "role": "data",
                 "tools_needed": ["file_read"], "depends_on": []}
            ]}"#,
        );
        // Sub-agent asks for a tool outside its set, then finishes.
        mock.push_response(ChatResponse {
            tool_calls: vec![osa_domain::message::ToolCall {
                call_id: "tc_1".into(),
                tool_name: "shell_execute".into(),
                arguments: serde_json::json!({"command": "ls"}),
            }],
            model: "anthropic".into(),
            ..Default::default()
        });
        mock.push_text("done with file_read only");
        mock.push_text("synthesized");

        let orch = Orchestrator::new(state);
        orch.execute("read things", "s1").await.unwrap();

        let reqs = mock.requests();
        // The sub-agent request exposed only file_read.
        let sub_req = &reqs[1];
        let names: Vec<&str> = sub_req.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["file_read"]);
    }
}
