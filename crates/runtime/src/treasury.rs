//! Financial governance: balance, reservations, and spend limits.
//!
//! Guards are checked in a fixed order (`max_single`, `daily`, `monthly`,
//! `min_reserve`); the first violated guard names the typed error and the
//! `treasury_limit_exceeded` event. Releases match the most recent
//! reserve with the same reference id.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use osa_domain::config::TreasuryConfig;
use osa_domain::error::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::bus::EventBus;

const TXN_CAP: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnKind {
    Credit,
    Debit,
    Reserve,
    Release,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreasuryTxn {
    pub id: String,
    pub kind: TxnKind,
    pub amount_usd: f64,
    pub description: String,
    pub reference_id: Option<String>,
    pub balance_after: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreasuryStatus {
    pub balance_usd: f64,
    pub reserved_usd: f64,
    pub available_usd: f64,
    pub daily_spent_usd: f64,
    pub monthly_spent_usd: f64,
    pub daily_reset_at: DateTime<Utc>,
    pub monthly_reset_at: DateTime<Utc>,
}

struct TreasuryInner {
    balance: f64,
    reserved: f64,
    daily_spent: f64,
    monthly_spent: f64,
    /// Stack of (reference_id, amount); release pops the most recent
    /// matching entry.
    reserves: Vec<(String, f64)>,
    txns: VecDeque<TreasuryTxn>,
    daily_reset_at: DateTime<Utc>,
    monthly_reset_at: DateTime<Utc>,
}

pub struct Treasury {
    config: TreasuryConfig,
    bus: Arc<EventBus>,
    inner: Mutex<TreasuryInner>,
}

impl Treasury {
    pub fn new(config: TreasuryConfig, bus: Arc<EventBus>) -> Self {
        let now = Utc::now();
        Self {
            config,
            bus,
            inner: Mutex::new(TreasuryInner {
                balance: 0.0,
                reserved: 0.0,
                daily_spent: 0.0,
                monthly_spent: 0.0,
                reserves: Vec::new(),
                txns: VecDeque::new(),
                daily_reset_at: crate::budget::next_day_utc(now),
                monthly_reset_at: crate::budget::next_month_utc(now),
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn deposit(&self, amount_usd: f64, description: &str) -> TreasuryTxn {
        let mut inner = self.inner.lock();
        inner.balance += amount_usd;
        let txn = push_txn(
            &mut inner,
            TxnKind::Credit,
            amount_usd,
            description,
            None,
        );
        drop(inner);
        self.bus.emit_system(
            "treasury_deposit",
            serde_json::json!({"amount_usd": amount_usd, "balance_after": txn.balance_after}),
        );
        txn
    }

    /// Withdraw under the spend guards. No state changes on refusal.
    pub fn withdraw(
        &self,
        amount_usd: f64,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<TreasuryTxn> {
        let mut inner = self.inner.lock();

        let guard = self.check_guards(&inner, amount_usd);
        if let Some((guard, message)) = guard {
            drop(inner);
            self.bus.emit_system(
                "treasury_limit_exceeded",
                serde_json::json!({"type": guard, "amount_usd": amount_usd, "message": message}),
            );
            return Err(Error::LimitExceeded {
                guard: guard.to_string(),
                message,
            });
        }

        inner.balance -= amount_usd;
        inner.daily_spent += amount_usd;
        inner.monthly_spent += amount_usd;
        let txn = push_txn(
            &mut inner,
            TxnKind::Debit,
            amount_usd,
            description,
            reference_id.map(String::from),
        );
        drop(inner);
        self.bus.emit_system(
            "treasury_withdraw",
            serde_json::json!({"amount_usd": amount_usd, "balance_after": txn.balance_after}),
        );
        Ok(txn)
    }

    /// Place a hold. Held funds count against `available` until released.
    pub fn reserve(&self, amount_usd: f64, reference_id: &str) -> Result<TreasuryTxn> {
        let mut inner = self.inner.lock();
        let available = inner.balance - inner.reserved;
        if available - amount_usd < self.config.min_reserve_usd {
            let message = format!(
                "reserving {amount_usd:.2} would leave {:.2}, below the {:.2} floor",
                available - amount_usd,
                self.config.min_reserve_usd
            );
            drop(inner);
            self.bus.emit_system(
                "treasury_limit_exceeded",
                serde_json::json!({"type": "min_reserve", "amount_usd": amount_usd, "message": message}),
            );
            return Err(Error::LimitExceeded {
                guard: "min_reserve".into(),
                message,
            });
        }
        inner.reserved += amount_usd;
        inner.reserves.push((reference_id.to_string(), amount_usd));
        let txn = push_txn(
            &mut inner,
            TxnKind::Reserve,
            amount_usd,
            "reserve",
            Some(reference_id.to_string()),
        );
        Ok(txn)
    }

    /// Release the most recent reserve carrying this reference id.
    pub fn release(&self, reference_id: &str) -> Result<TreasuryTxn> {
        let mut inner = self.inner.lock();
        let idx = inner
            .reserves
            .iter()
            .rposition(|(r, _)| r == reference_id)
            .ok_or_else(|| Error::Other(format!("no reserve found for '{reference_id}'")))?;
        let (_, amount) = inner.reserves.remove(idx);
        inner.reserved -= amount;
        let txn = push_txn(
            &mut inner,
            TxnKind::Release,
            amount,
            "release",
            Some(reference_id.to_string()),
        );
        Ok(txn)
    }

    pub fn status(&self) -> TreasuryStatus {
        let inner = self.inner.lock();
        TreasuryStatus {
            balance_usd: inner.balance,
            reserved_usd: inner.reserved,
            available_usd: inner.balance - inner.reserved,
            daily_spent_usd: inner.daily_spent,
            monthly_spent_usd: inner.monthly_spent,
            daily_reset_at: inner.daily_reset_at,
            monthly_reset_at: inner.monthly_reset_at,
        }
    }

    pub fn recent_txns(&self, n: usize) -> Vec<TreasuryTxn> {
        let inner = self.inner.lock();
        inner.txns.iter().rev().take(n).rev().cloned().collect()
    }

    pub fn roll_daily(&self) {
        let mut inner = self.inner.lock();
        inner.daily_spent = 0.0;
        inner.daily_reset_at = crate::budget::next_day_utc(Utc::now());
    }

    pub fn roll_monthly(&self) {
        let mut inner = self.inner.lock();
        inner.monthly_spent = 0.0;
        inner.monthly_reset_at = crate::budget::next_month_utc(Utc::now());
    }

    /// Guards in order; the first violation wins.
    fn check_guards(&self, inner: &TreasuryInner, amount: f64) -> Option<(&'static str, String)> {
        if amount > self.config.max_single_usd {
            return Some((
                "max_single",
                format!(
                    "{amount:.2} exceeds the {:.2} single-withdrawal cap",
                    self.config.max_single_usd
                ),
            ));
        }
        if inner.daily_spent + amount > self.config.daily_limit_usd {
            return Some((
                "daily",
                format!(
                    "{:.2} + {amount:.2} exceeds the {:.2} daily limit",
                    inner.daily_spent, self.config.daily_limit_usd
                ),
            ));
        }
        if inner.monthly_spent + amount > self.config.monthly_limit_usd {
            return Some((
                "monthly",
                format!(
                    "{:.2} + {amount:.2} exceeds the {:.2} monthly limit",
                    inner.monthly_spent, self.config.monthly_limit_usd
                ),
            ));
        }
        let available = inner.balance - inner.reserved;
        if available - amount < self.config.min_reserve_usd {
            return Some((
                "min_reserve",
                format!(
                    "withdrawing {amount:.2} would leave {:.2}, below the {:.2} floor",
                    available - amount,
                    self.config.min_reserve_usd
                ),
            ));
        }
        None
    }
}

fn push_txn(
    inner: &mut TreasuryInner,
    kind: TxnKind,
    amount_usd: f64,
    description: &str,
    reference_id: Option<String>,
) -> TreasuryTxn {
    let txn = TreasuryTxn {
        id: Uuid::new_v4().to_string(),
        kind,
        amount_usd,
        description: description.to_string(),
        reference_id,
        balance_after: inner.balance,
        timestamp: Utc::now(),
    };
    inner.txns.push_back(txn.clone());
    while inner.txns.len() > TXN_CAP {
        inner.txns.pop_front();
    }
    txn
}
