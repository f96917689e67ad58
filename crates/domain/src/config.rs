//! Env-driven runtime configuration.
//!
//! Bootstrap order: a `.env` file in the working directory, then
//! `$HOME/.env` (project wins), with the real process environment winning
//! over both. All options have defaults; the runtime boots with zero
//! configuration and simply has no providers until a credential appears.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Provider credential env vars recognized at bootstrap, keyed by the
/// provider id they unlock.
pub const CREDENTIAL_VARS: &[(&str, &str)] = &[
    ("anthropic", "ANTHROPIC_API_KEY"),
    ("openai", "OPENAI_API_KEY"),
    ("groq", "GROQ_API_KEY"),
    ("openrouter", "OPENROUTER_API_KEY"),
];

/// A quiet-hours range in minutes-of-day; `[start, end)`, wrapping past
/// midnight when `start > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietRange {
    pub start: u32,
    pub end: u32,
}

impl QuietRange {
    /// Whether a minute-of-day lies within this range.
    pub fn contains(&self, minute_of_day: u32) -> bool {
        if self.start <= self.end {
            minute_of_day >= self.start && minute_of_day < self.end
        } else {
            minute_of_day >= self.start || minute_of_day < self.end
        }
    }
}

/// Budget limits in USD.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub daily_limit_usd: f64,
    pub monthly_limit_usd: f64,
    pub per_call_limit_usd: f64,
}

/// Treasury governance settings.
#[derive(Debug, Clone)]
pub struct TreasuryConfig {
    pub enabled: bool,
    pub auto_debit: bool,
    pub daily_limit_usd: f64,
    pub monthly_limit_usd: f64,
    pub max_single_usd: f64,
    pub min_reserve_usd: f64,
}

/// Plan-mode gate. The mode/type labels are opaque strings on purpose so
/// deployments can re-map them without code changes.
#[derive(Debug, Clone)]
pub struct PlanConfig {
    pub enabled: bool,
    pub modes: Vec<String>,
    pub types: Vec<String>,
    pub weight_threshold: f32,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Providers ─────────────────────────────────────────────────────
    /// Provider id → API key, for every credential found at bootstrap.
    pub credentials: HashMap<String, String>,
    pub default_provider: Option<String>,
    pub default_model: Option<String>,
    /// Explicit fallback chain (provider ids). Empty = auto-derive.
    pub fallback_chain: Vec<String>,
    pub provider_timeout_secs: u64,

    // ── Budget & treasury ─────────────────────────────────────────────
    pub budget: BudgetConfig,
    pub treasury: TreasuryConfig,

    // ── Reasoning loop ────────────────────────────────────────────────
    pub max_context_tokens: u32,
    pub response_reserve_tokens: u32,
    pub max_iterations: u32,
    pub plan: PlanConfig,
    pub thinking_enabled: bool,
    pub thinking_budget_tokens: u32,
    /// Start the background LLM refinement of each fast signal.
    pub signal_refine: bool,

    // ── Scheduler ─────────────────────────────────────────────────────
    pub heartbeat_interval_secs: u64,
    pub quiet_hours: Vec<QuietRange>,

    // ── Orchestrator ──────────────────────────────────────────────────
    pub max_concurrent_agents: usize,

    // ── Tools ─────────────────────────────────────────────────────────
    pub tool_timeout_secs: u64,

    // ── Auth ──────────────────────────────────────────────────────────
    pub require_auth: bool,
    /// SHA-256 of the shared secret, computed once at load.
    shared_secret_hash: Option<[u8; 32]>,

    // ── Paths ─────────────────────────────────────────────────────────
    /// OSA home (`$OSA_HOME` or `$HOME/.osa`).
    pub home_dir: PathBuf,
    /// Per-session state: `<sessions_dir>/<id>.jsonl`, `<sessions_dir>/<id>/tasks.json`.
    pub sessions_dir: PathBuf,
    /// HEARTBEAT.md, CRONS.json, TRIGGERS.json live here.
    pub config_dir: PathBuf,
    /// Root the shell and file tools are confined to.
    pub workspace_root: PathBuf,
}

impl Config {
    /// Load configuration from the environment, with `.env` bootstrap.
    pub fn load() -> Config {
        let mut file_vars = HashMap::new();
        if let Some(home) = std::env::var_os("HOME") {
            merge_env_file(&mut file_vars, &Path::new(&home).join(".env"));
        }
        merge_env_file(&mut file_vars, Path::new(".env"));
        Config::from_lookup(&|key| {
            std::env::var(key).ok().or_else(|| file_vars.get(key).cloned())
        })
    }

    /// Build a config from an explicit lookup function (tests inject maps).
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Config {
        let get = |key: &str| lookup(key);
        let get_f64 = |key: &str, default: f64| {
            get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
        };
        let get_u64 = |key: &str, default: u64| {
            get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
        };
        let get_u32 = |key: &str, default: u32| {
            get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
        };
        let get_bool = |key: &str, default: bool| {
            get(key)
                .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
                .unwrap_or(default)
        };

        let mut credentials = HashMap::new();
        for &(provider, var) in CREDENTIAL_VARS {
            if let Some(key) = get(var).filter(|k| !k.trim().is_empty()) {
                credentials.insert(provider.to_string(), key);
            }
        }

        let fallback_chain = get("OSA_FALLBACK_CHAIN")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let quiet_hours = get("OSA_QUIET_HOURS")
            .map(|v| parse_quiet_hours(&v))
            .unwrap_or_default();

        let shared_secret_hash = get("OSA_SHARED_SECRET").map(|secret| {
            let digest = Sha256::digest(secret.as_bytes());
            let mut out = [0u8; 32];
            out.copy_from_slice(&digest);
            out
        });

        let home_dir = get("OSA_HOME")
            .map(PathBuf::from)
            .or_else(|| get("HOME").map(|h| Path::new(&h).join(".osa")))
            .unwrap_or_else(|| PathBuf::from(".osa"));

        let workspace_root = get("OSA_WORKSPACE")
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let plan_list = |key: &str, default: &[&str]| -> Vec<String> {
            get(key)
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| default.iter().map(|s| s.to_string()).collect())
        };

        Config {
            default_provider: get("OSA_DEFAULT_PROVIDER"),
            default_model: get("OSA_MODEL"),
            fallback_chain,
            provider_timeout_secs: get_u64("OSA_PROVIDER_TIMEOUT_SECS", 120),
            budget: BudgetConfig {
                daily_limit_usd: get_f64("OSA_DAILY_BUDGET_USD", 10.0),
                monthly_limit_usd: get_f64("OSA_MONTHLY_BUDGET_USD", 100.0),
                per_call_limit_usd: get_f64("OSA_PER_CALL_LIMIT_USD", 1.0),
            },
            treasury: TreasuryConfig {
                enabled: get_bool("OSA_TREASURY_ENABLED", false),
                auto_debit: get_bool("OSA_TREASURY_AUTO_DEBIT", false),
                daily_limit_usd: get_f64("OSA_TREASURY_DAILY_LIMIT", 50.0),
                monthly_limit_usd: get_f64("OSA_TREASURY_MONTHLY_LIMIT", 500.0),
                max_single_usd: get_f64("OSA_TREASURY_MAX_SINGLE", 25.0),
                min_reserve_usd: get_f64("OSA_TREASURY_MIN_RESERVE", 10.0),
            },
            max_context_tokens: get_u32("OSA_MAX_CONTEXT_TOKENS", 128_000),
            response_reserve_tokens: 4096,
            max_iterations: get_u32("OSA_MAX_ITERATIONS", 30),
            plan: PlanConfig {
                enabled: get_bool("OSA_PLAN_MODE", false),
                modes: plan_list("OSA_PLAN_MODES", &["build", "execute", "maintain"]),
                types: plan_list("OSA_PLAN_TYPES", &["request", "general"]),
                weight_threshold: 0.75,
            },
            thinking_enabled: get_bool("OSA_THINKING_ENABLED", false),
            thinking_budget_tokens: get_u32("OSA_THINKING_BUDGET", 2048),
            signal_refine: get_bool("OSA_SIGNAL_REFINE", false),
            heartbeat_interval_secs: get_u64("OSA_HEARTBEAT_INTERVAL_SECS", 1800),
            quiet_hours,
            max_concurrent_agents: get_u64("OSA_MAX_CONCURRENT_AGENTS", 10) as usize,
            tool_timeout_secs: get_u64("OSA_TOOL_TIMEOUT_SECS", 30),
            require_auth: get_bool("OSA_REQUIRE_AUTH", false),
            shared_secret_hash,
            sessions_dir: home_dir.join("sessions"),
            config_dir: home_dir.clone(),
            home_dir,
            workspace_root,
            credentials,
        }
    }

    /// Constant-time shared-secret check. Always false when no secret is
    /// configured and auth is required.
    pub fn verify_secret(&self, candidate: &str) -> bool {
        match &self.shared_secret_hash {
            Some(expected) => {
                let digest = Sha256::digest(candidate.as_bytes());
                expected.ct_eq(digest.as_slice()).into()
            }
            None => !self.require_auth,
        }
    }

    /// Path of a session's transcript file.
    pub fn transcript_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{session_id}.jsonl"))
    }

    /// Path of a session's task-tracker file.
    pub fn tracker_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(session_id).join("tasks.json")
    }

    /// Long-term memory file (`MEMORY.md`, append-only).
    pub fn memory_path(&self) -> PathBuf {
        self.home_dir.join("MEMORY.md")
    }

    /// Whether the given wall-clock time falls inside configured quiet hours.
    pub fn in_quiet_hours(&self, time: chrono::NaiveTime) -> bool {
        use chrono::Timelike;
        let minute = time.hour() * 60 + time.minute();
        self.quiet_hours.iter().any(|r| r.contains(minute))
    }
}

/// Parse `OSA_QUIET_HOURS` of the form `HH:MM-HH:MM[,HH:MM-HH:MM]`.
/// Malformed ranges are skipped with a warning rather than failing boot.
pub fn parse_quiet_hours(raw: &str) -> Vec<QuietRange> {
    raw.split(',')
        .filter_map(|range| {
            let range = range.trim();
            if range.is_empty() {
                return None;
            }
            let (start, end) = range.split_once('-')?;
            match (parse_hhmm(start), parse_hhmm(end)) {
                (Some(start), Some(end)) => Some(QuietRange { start, end }),
                _ => {
                    tracing::warn!(range, "skipping malformed quiet-hours range");
                    None
                }
            }
        })
        .collect()
}

fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// Merge `KEY=VALUE` lines from a `.env` file into `vars`, overwriting
/// previous entries (caller controls precedence by merge order).
fn merge_env_file(vars: &mut HashMap<String, String>, path: &Path) {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return;
    };
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().trim_start_matches("export ").trim();
        let value = value.trim().trim_matches('"').trim_matches('\'');
        if !key.is_empty() {
            vars.insert(key.to_string(), value.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from<'a>(map: &'a HashMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn defaults_with_empty_env() {
        let map = HashMap::new();
        let cfg = Config::from_lookup(&lookup_from(&map));
        assert!(cfg.credentials.is_empty());
        assert_eq!(cfg.max_context_tokens, 128_000);
        assert_eq!(cfg.response_reserve_tokens, 4096);
        assert_eq!(cfg.max_iterations, 30);
        assert_eq!(cfg.max_concurrent_agents, 10);
        assert!(!cfg.plan.enabled);
        assert!(!cfg.treasury.enabled);
    }

    #[test]
    fn credentials_discovered() {
        let mut map = HashMap::new();
        map.insert("ANTHROPIC_API_KEY", "sk-ant-xyz");
        map.insert("GROQ_API_KEY", "gsk-abc");
        let cfg = Config::from_lookup(&lookup_from(&map));
        assert_eq!(cfg.credentials.get("anthropic").unwrap(), "sk-ant-xyz");
        assert_eq!(cfg.credentials.get("groq").unwrap(), "gsk-abc");
        assert!(!cfg.credentials.contains_key("openai"));
    }

    #[test]
    fn fallback_chain_parsed() {
        let mut map = HashMap::new();
        map.insert("OSA_FALLBACK_CHAIN", "anthropic, openai ,ollama");
        let cfg = Config::from_lookup(&lookup_from(&map));
        assert_eq!(cfg.fallback_chain, vec!["anthropic", "openai", "ollama"]);
    }

    #[test]
    fn quiet_hours_parse_and_wrap() {
        let ranges = parse_quiet_hours("22:00-06:30,12:15-13:00");
        assert_eq!(ranges.len(), 2);
        // 23:00 is inside the overnight range.
        assert!(ranges[0].contains(23 * 60));
        // 06:29 still inside; 06:30 outside (closed-open).
        assert!(ranges[0].contains(6 * 60 + 29));
        assert!(!ranges[0].contains(6 * 60 + 30));
        // Daytime range.
        assert!(ranges[1].contains(12 * 60 + 30));
        assert!(!ranges[1].contains(13 * 60));
    }

    #[test]
    fn quiet_hours_malformed_ranges_skipped() {
        let ranges = parse_quiet_hours("25:00-06:00,22:00-23:00,nonsense");
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, 22 * 60);
    }

    #[test]
    fn shared_secret_verification() {
        let mut map = HashMap::new();
        map.insert("OSA_SHARED_SECRET", "hunter2");
        map.insert("OSA_REQUIRE_AUTH", "true");
        let cfg = Config::from_lookup(&lookup_from(&map));
        assert!(cfg.verify_secret("hunter2"));
        assert!(!cfg.verify_secret("hunter3"));
    }

    #[test]
    fn no_secret_and_auth_required_rejects_all() {
        let mut map = HashMap::new();
        map.insert("OSA_REQUIRE_AUTH", "1");
        let cfg = Config::from_lookup(&lookup_from(&map));
        assert!(!cfg.verify_secret("anything"));
    }

    #[test]
    fn env_file_merge_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let home_env = dir.path().join("home.env");
        let project_env = dir.path().join("project.env");
        std::fs::write(&home_env, "A=home\nB=home\n# comment\n").unwrap();
        std::fs::write(&project_env, "B=project\nC=\"quoted\"\n").unwrap();

        let mut vars = HashMap::new();
        merge_env_file(&mut vars, &home_env);
        merge_env_file(&mut vars, &project_env);

        assert_eq!(vars.get("A").unwrap(), "home");
        assert_eq!(vars.get("B").unwrap(), "project");
        assert_eq!(vars.get("C").unwrap(), "quoted");
    }

    #[test]
    fn session_paths() {
        let map = HashMap::from([("OSA_HOME", "/srv/osa")]);
        let cfg = Config::from_lookup(&lookup_from(&map));
        assert_eq!(
            cfg.transcript_path("abc"),
            PathBuf::from("/srv/osa/sessions/abc.jsonl")
        );
        assert_eq!(
            cfg.tracker_path("abc"),
            PathBuf::from("/srv/osa/sessions/abc/tasks.json")
        );
        assert_eq!(cfg.memory_path(), PathBuf::from("/srv/osa/MEMORY.md"));
    }
}
