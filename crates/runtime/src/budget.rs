//! Cost tracking against daily/monthly limits.
//!
//! Every LLM call lands here as a ledger entry priced from a per-provider
//! table. Crossing 80% of a limit emits `budget_warning` once per period;
//! crossing 100% emits `budget_exceeded` once. Each entry also emits
//! `cost_recorded` so the treasury can auto-debit.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use osa_domain::config::BudgetConfig;
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::bus::EventBus;

/// Bounded ledger size.
const LEDGER_CAP: usize = 10_000;

/// USD per million tokens.
#[derive(Debug, Clone, Copy)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Pricing {
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_per_mtok
            + (output_tokens as f64 / 1_000_000.0) * self.output_per_mtok
    }
}

/// Per-provider pricing with a `"default"` fallback.
fn default_pricing() -> HashMap<String, Pricing> {
    let mut map = HashMap::new();
    map.insert("anthropic".into(), Pricing { input_per_mtok: 3.0, output_per_mtok: 15.0 });
    map.insert("openai".into(), Pricing { input_per_mtok: 2.5, output_per_mtok: 10.0 });
    map.insert("groq".into(), Pricing { input_per_mtok: 0.59, output_per_mtok: 0.79 });
    map.insert("openrouter".into(), Pricing { input_per_mtok: 2.0, output_per_mtok: 8.0 });
    map.insert("ollama".into(), Pricing { input_per_mtok: 0.0, output_per_mtok: 0.0 });
    map.insert("default".into(), Pricing { input_per_mtok: 2.0, output_per_mtok: 8.0 });
    map
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub daily_spent_usd: f64,
    pub daily_limit_usd: f64,
    pub monthly_spent_usd: f64,
    pub monthly_limit_usd: f64,
    pub daily_reset_at: DateTime<Utc>,
    pub monthly_reset_at: DateTime<Utc>,
    pub ledger_len: usize,
}

struct BudgetInner {
    ledger: VecDeque<BudgetEntry>,
    daily_spent: f64,
    monthly_spent: f64,
    daily_reset_at: DateTime<Utc>,
    monthly_reset_at: DateTime<Utc>,
    daily_warned: bool,
    daily_exceeded: bool,
    monthly_warned: bool,
    monthly_exceeded: bool,
}

pub struct Budget {
    config: BudgetConfig,
    pricing: HashMap<String, Pricing>,
    bus: Arc<EventBus>,
    inner: Mutex<BudgetInner>,
}

impl Budget {
    pub fn new(config: BudgetConfig, bus: Arc<EventBus>) -> Self {
        let now = Utc::now();
        Self {
            config,
            pricing: default_pricing(),
            bus,
            inner: Mutex::new(BudgetInner {
                ledger: VecDeque::new(),
                daily_spent: 0.0,
                monthly_spent: 0.0,
                daily_reset_at: next_day_utc(now),
                monthly_reset_at: next_month_utc(now),
                daily_warned: false,
                daily_exceeded: false,
                monthly_warned: false,
                monthly_exceeded: false,
            }),
        }
    }

    /// Price and record one LLM call.
    pub fn record_cost(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
        session_id: &str,
    ) -> BudgetEntry {
        let pricing = self
            .pricing
            .get(provider)
            .or_else(|| self.pricing.get("default"))
            .copied()
            .unwrap_or(Pricing { input_per_mtok: 0.0, output_per_mtok: 0.0 });
        let cost_usd = pricing.cost(input_tokens, output_tokens);

        let entry = BudgetEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            provider: provider.to_string(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cost_usd,
            session_id: session_id.to_string(),
        };

        let mut events: Vec<(String, serde_json::Value)> = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.ledger.push_back(entry.clone());
            while inner.ledger.len() > LEDGER_CAP {
                inner.ledger.pop_front();
            }
            inner.daily_spent += cost_usd;
            inner.monthly_spent += cost_usd;

            // Edge-triggered threshold events.
            let daily = inner.daily_spent;
            let monthly = inner.monthly_spent;
            if !inner.daily_warned && daily >= 0.8 * self.config.daily_limit_usd {
                inner.daily_warned = true;
                events.push((
                    "budget_warning".into(),
                    serde_json::json!({"period": "daily", "spent_usd": daily, "limit_usd": self.config.daily_limit_usd}),
                ));
            }
            if !inner.daily_exceeded && daily >= self.config.daily_limit_usd {
                inner.daily_exceeded = true;
                events.push((
                    "budget_exceeded".into(),
                    serde_json::json!({"period": "daily", "spent_usd": daily, "limit_usd": self.config.daily_limit_usd}),
                ));
            }
            if !inner.monthly_warned && monthly >= 0.8 * self.config.monthly_limit_usd {
                inner.monthly_warned = true;
                events.push((
                    "budget_warning".into(),
                    serde_json::json!({"period": "monthly", "spent_usd": monthly, "limit_usd": self.config.monthly_limit_usd}),
                ));
            }
            if !inner.monthly_exceeded && monthly >= self.config.monthly_limit_usd {
                inner.monthly_exceeded = true;
                events.push((
                    "budget_exceeded".into(),
                    serde_json::json!({"period": "monthly", "spent_usd": monthly, "limit_usd": self.config.monthly_limit_usd}),
                ));
            }
        }

        if cost_usd > self.config.per_call_limit_usd {
            events.push((
                "budget_exceeded".into(),
                serde_json::json!({"period": "per_call", "spent_usd": cost_usd, "limit_usd": self.config.per_call_limit_usd}),
            ));
        }

        for (name, data) in events {
            self.bus.emit_system(&name, data);
        }
        self.bus.emit_system(
            "cost_recorded",
            serde_json::json!({
                "provider": entry.provider,
                "model": entry.model,
                "cost_usd": entry.cost_usd,
                "session_id": entry.session_id,
            }),
        );

        entry
    }

    /// Timer-driven daily rollover.
    pub fn roll_daily(&self) {
        let mut inner = self.inner.lock();
        inner.daily_spent = 0.0;
        inner.daily_warned = false;
        inner.daily_exceeded = false;
        inner.daily_reset_at = next_day_utc(Utc::now());
    }

    /// Timer-driven monthly rollover.
    pub fn roll_monthly(&self) {
        let mut inner = self.inner.lock();
        inner.monthly_spent = 0.0;
        inner.monthly_warned = false;
        inner.monthly_exceeded = false;
        inner.monthly_reset_at = next_month_utc(Utc::now());
    }

    pub fn status(&self) -> BudgetStatus {
        let inner = self.inner.lock();
        BudgetStatus {
            daily_spent_usd: inner.daily_spent,
            daily_limit_usd: self.config.daily_limit_usd,
            monthly_spent_usd: inner.monthly_spent,
            monthly_limit_usd: self.config.monthly_limit_usd,
            daily_reset_at: inner.daily_reset_at,
            monthly_reset_at: inner.monthly_reset_at,
            ledger_len: inner.ledger.len(),
        }
    }

    /// The most recent ledger entries, newest last.
    pub fn recent_entries(&self, n: usize) -> Vec<BudgetEntry> {
        let inner = self.inner.lock();
        inner
            .ledger
            .iter()
            .rev()
            .take(n)
            .rev()
            .cloned()
            .collect()
    }

    /// Seconds until the next daily reset (timer scheduling).
    pub fn seconds_to_daily_reset(&self) -> i64 {
        (self.inner.lock().daily_reset_at - Utc::now()).num_seconds().max(1)
    }

    /// Seconds until the next monthly reset.
    pub fn seconds_to_monthly_reset(&self) -> i64 {
        (self.inner.lock().monthly_reset_at - Utc::now()).num_seconds().max(1)
    }
}

pub fn next_day_utc(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Duration::days(1);
    Utc.from_utc_datetime(&tomorrow.and_hms_opt(0, 0, 0).expect("midnight exists"))
}

pub fn next_month_utc(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .expect("first of month exists")
}
