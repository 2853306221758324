// ===============================
// src/risk.rs
// ===============================
//
// Risk guard, dua lapis:
// - pre-trade gate per order (kill switch, hard cutoff, rate/menit,
//   exposure notional, rugi realized per simbol)
// - evaluasi portofolio (hard stop: daily loss / capital usage; soft guard
//   de-risk setelah jam derisk bila net <= 0)
//
// Counter bersifat process-local dan reset saat restart.
//
use std::collections::VecDeque;
use std::sync::Mutex;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::warn;

use crate::clock::MarketHours;
use crate::config::{Limits, Settings};
use crate::domain::{OrderIntent, Position};
use crate::metrics::RISK_REJECTS;

/// Minimum spacing between two portfolio hard-stop evaluations.
pub const HARD_STOP_THROTTLE_MS: i64 = 1000;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RiskRejection {
    #[error("kill switch is on")]
    KillSwitch,
    #[error("past the hard cutoff, no new exposure")]
    HardCutoff,
    #[error("rate limit: {count} orders in the last minute (max {max})")]
    RateLimited { count: usize, max: u32 },
    #[error("notional {notional} exceeds exposure cap {cap}")]
    ExposureCap { notional: Decimal, cap: Decimal },
    #[error("{symbol}: realized {realized} reached the per-symbol loss cap {cap}")]
    SymbolLossCap { symbol: String, realized: Decimal, cap: Decimal },
}

impl RiskRejection {
    /// Metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            RiskRejection::KillSwitch => "kill_switch",
            RiskRejection::HardCutoff => "hard_cutoff",
            RiskRejection::RateLimited { .. } => "rate_limit",
            RiskRejection::ExposureCap { .. } => "exposure",
            RiskRejection::SymbolLossCap { .. } => "symbol_loss",
        }
    }
}

/// Portfolio-level breach that stops the engine for the day.
#[derive(Debug, Clone, PartialEq)]
pub enum HardStop {
    DailyLoss { net: Decimal, limit: Decimal },
    CapitalUsage { used: Decimal, cap: Decimal },
}

impl HardStop {
    pub fn reason(&self) -> &'static str {
        match self {
            HardStop::DailyLoss { .. } => "daily_loss",
            HardStop::CapitalUsage { .. } => "capital_usage",
        }
    }
}

impl std::fmt::Display for HardStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HardStop::DailyLoss { net, limit } => write!(f, "daily loss: net {net} <= -{limit}"),
            HardStop::CapitalUsage { used, cap } => write!(f, "capital usage {used} > {cap}"),
        }
    }
}

/// Hard-stop check. A limit of zero (or less) is disabled.
/// Net exactly at `-daily_loss_limit` already breaches.
pub fn evaluate_hard_stop(settings: &Settings, net: Decimal, capital_in_use: Decimal) -> Option<HardStop> {
    let limit = settings.daily_loss_limit;
    if limit > Decimal::ZERO && net <= -limit {
        return Some(HardStop::DailyLoss { net, limit });
    }
    let cap = settings.max_capital_usage;
    if cap > Decimal::ZERO && capital_in_use > cap {
        return Some(HardStop::CapitalUsage { used: capital_in_use, cap });
    }
    None
}

/// Soft guard: late in the day and not green -> stop adding risk.
pub fn soft_guard_applies(hours: &MarketHours, now: DateTime<Utc>, net: Decimal, enabled: bool) -> bool {
    enabled && hours.is_past_derisk(now) && net <= Decimal::ZERO
}

/// Worst losing position at its mark and the quantity that halves it
/// (at least 1). `None` when nothing is losing.
pub fn worst_loser<F>(positions: &[Position], mark: F) -> Option<(&Position, u64)>
where
    F: Fn(&Position) -> Decimal,
{
    positions
        .iter()
        .map(|p| (p, p.pnl_at(mark(p))))
        .filter(|(_, pnl)| *pnl < Decimal::ZERO)
        .min_by(|a, b| a.1.cmp(&b.1))
        .map(|(p, _)| (p, (p.quantity / 2).max(1)))
}

#[derive(Debug, Default)]
struct Counters {
    window: VecDeque<DateTime<Utc>>,
    symbol_realized: HashMap<String, Decimal>,
    day: Option<String>,
    kill_switch: bool,
    last_hard_check: Option<DateTime<Utc>>,
    halted_for: Option<String>,
}

impl Counters {
    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - Duration::seconds(60);
        while self.window.front().is_some_and(|t| *t <= horizon) {
            self.window.pop_front();
        }
    }

    // rugi per simbol dihitung per hari bursa
    fn roll_day(&mut self, today: &str) {
        if self.day.as_deref() != Some(today) {
            self.symbol_realized.clear();
            self.day = Some(today.to_string());
        }
    }
}

pub struct RiskGuard {
    limits: Limits,
    hours: MarketHours,
    state: Mutex<Counters>,
}

impl RiskGuard {
    pub fn new(limits: Limits, hours: MarketHours) -> Self {
        Self { limits, hours, state: Mutex::new(Counters::default()) }
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Gate a new-exposure order. On success the submission is counted in
    /// the rate window under the same lock, so concurrent callers cannot
    /// both take the last slot.
    pub fn pre_trade(&self, intent: &OrderIntent, now: DateTime<Utc>) -> Result<(), RiskRejection> {
        let res = self.check(intent, now);
        if let Err(r) = &res {
            RISK_REJECTS.with_label_values(&[r.reason()]).inc();
            warn!(symbol = %intent.symbol, side = intent.side.as_str(), qty = intent.quantity, reason = %r, "pre-trade reject");
        }
        res
    }

    fn check(&self, intent: &OrderIntent, now: DateTime<Utc>) -> Result<(), RiskRejection> {
        let mut c = self.counters();
        if c.kill_switch {
            return Err(RiskRejection::KillSwitch);
        }
        if self.hours.is_past_hard_cutoff(now) {
            return Err(RiskRejection::HardCutoff);
        }
        c.prune(now);
        let max = self.limits.max_orders_per_min;
        if c.window.len() >= max as usize {
            return Err(RiskRejection::RateLimited { count: c.window.len(), max });
        }
        let notional = Decimal::from(intent.quantity) * intent.price.unwrap_or(intent.est_price);
        let cap = self.limits.exposure_cap;
        if cap > Decimal::ZERO && notional > cap {
            return Err(RiskRejection::ExposureCap { notional, cap });
        }
        c.roll_day(&self.hours.today_key(now));
        let realized = c.symbol_realized.get(&intent.symbol).copied().unwrap_or_default();
        let loss_cap = self.limits.per_symbol_loss_cap;
        if loss_cap > Decimal::ZERO && realized <= -loss_cap {
            return Err(RiskRejection::SymbolLossCap { symbol: intent.symbol.clone(), realized, cap: loss_cap });
        }
        c.window.push_back(now);
        Ok(())
    }

    /// Count a gate-exempt (reduce-only) submission toward the rate window.
    pub fn note_submission(&self, now: DateTime<Utc>) {
        let mut c = self.counters();
        c.prune(now);
        c.window.push_back(now);
    }

    pub fn record_realized(&self, symbol: &str, pnl: Decimal, now: DateTime<Utc>) {
        if pnl.is_zero() {
            return;
        }
        let today = self.hours.today_key(now);
        let mut c = self.counters();
        c.roll_day(&today);
        *c.symbol_realized.entry(symbol.to_string()).or_default() += pnl;
    }

    pub fn set_kill_switch(&self, on: bool) { self.counters().kill_switch = on; }

    pub fn kill_switch(&self) -> bool { self.counters().kill_switch }

    /// True at most once per [`HARD_STOP_THROTTLE_MS`].
    pub fn hard_stop_due(&self, now: DateTime<Utc>) -> bool {
        let mut c = self.counters();
        match c.last_hard_check {
            Some(t) if now - t < Duration::milliseconds(HARD_STOP_THROTTLE_MS) => false,
            _ => {
                c.last_hard_check = Some(now);
                true
            }
        }
    }

    pub fn mark_halted(&self, day: &str) { self.counters().halted_for = Some(day.to_string()); }

    pub fn halted_on(&self, day: &str) -> bool { self.counters().halted_for.as_deref() == Some(day) }
}
