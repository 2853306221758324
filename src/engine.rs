// ===============================
// src/engine.rs
// ===============================
//
// Engine loop (timer 3s) + lifecycle + market-hours guard.
//
// Urutan satu tick:
//   1) mark-to-market posisi dari snapshot
//   2) EOD controller (kalau hari ini belum selesai)
//   3) berhenti di sini kalau engine tidak running / pasar tutup
//   4) risk: hard stop (flatten + stop) atau soft guard (de-risk)
//   5) exit: stop-loss / target per posisi
//   6) entry: sinyal snapshot, cooldown 60s per simbol
//
// Error di dalam tick di-log dan dihitung; tick berikutnya tetap jalan.
//
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, MarketHours};
use crate::config::{Settings, SettingsStore};
use crate::domain::{Event, Order, OrderIntent, OrderStatus, Position};
use crate::eod::EodController;
use crate::gateway::BrokerGateway;
use crate::market::MarketSnapshot;
use crate::metrics::{
    set_money, CAPITAL_IN_USE, ENGINE_RUNNING, ENGINE_TICKS, ENGINE_TICK_ERRORS, OPEN_POSITIONS, PNL_NET, PNL_REALIZED,
    RISK_HALTS,
};
use crate::notify::{Notification, NotificationSink};
use crate::oms::Oms;
use crate::positions::{capital_in_use, mark_of, realized_from_orders, unrealized_total};
use crate::recorder::Journal;
use crate::risk::{evaluate_hard_stop, soft_guard_applies, worst_loser, RiskGuard};
use crate::signing::sha256_hex;
use crate::store::{RunStatePatch, Store, StoreError};

/// No new entry on a symbol within this many seconds of the previous one.
pub const ENTRY_COOLDOWN_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("start refused: {0}")]
    StartRefused(String),
}

/// Engine-generated key: unique per (day, epoch, purpose, intent). A new
/// epoch per tick lets the same exit or entry be issued again later in
/// the day without colliding with an earlier filled order.
pub fn order_key(day: &str, epoch: u64, purpose: &str, intent: &OrderIntent) -> String {
    sha256_hex(&format!(
        "{day}|{epoch}|{purpose}|{}|{}|{}",
        intent.symbol,
        intent.side.as_str(),
        intent.quantity
    ))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PnlView {
    pub realized: Decimal,
    pub unrealized: Decimal,
    pub net: Decimal,
    pub capital_in_use: Decimal,
    pub open_positions: usize,
}

/// Everything a tick, the EOD controller and the guard need. Passed around
/// explicitly; nothing here is global.
pub struct Services {
    pub user_id: String,
    pub store: Arc<dyn Store>,
    pub gateway: Arc<dyn BrokerGateway>,
    pub oms: Arc<Oms>,
    pub risk: Arc<RiskGuard>,
    pub market: Arc<dyn MarketSnapshot>,
    pub settings: Arc<dyn SettingsStore>,
    pub notifier: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
    pub journal: Journal,
    pub hours: MarketHours,
    pub must_end_day_profitable: bool,
}

impl Services {
    pub fn mark(&self, p: &Position) -> Decimal {
        mark_of(p, self.market.ltp(&p.symbol))
    }

    /// Refresh stored marks from live quotes; returns the marked book.
    pub async fn mark_to_market(&self, now: DateTime<Utc>) -> Result<Vec<Position>, StoreError> {
        for p in self.store.positions().await? {
            if let Some(ltp) = self.market.ltp(&p.symbol).filter(|px| *px > Decimal::ZERO) {
                self.store.mark_position(&p.symbol, ltp, now).await?;
            }
        }
        self.store.positions().await
    }

    pub async fn realized_today(&self, now: DateTime<Utc>) -> Result<Decimal, StoreError> {
        let (from, to) = self.hours.day_bounds_utc(now);
        Ok(realized_from_orders(&self.store.orders_between(from, to).await?))
    }

    pub async fn pnl(&self, now: DateTime<Utc>) -> Result<PnlView, StoreError> {
        let positions = self.store.positions().await?;
        let realized = self.realized_today(now).await?;
        let unrealized = unrealized_total(&positions, |s| self.market.ltp(s));
        Ok(PnlView {
            realized,
            unrealized,
            net: realized + unrealized,
            capital_in_use: capital_in_use(&positions, |s| self.market.ltp(s)),
            open_positions: positions.len(),
        })
    }

    async fn submit(&self, intent: OrderIntent, purpose: &str, epoch: u64, now: DateTime<Utc>) -> Option<Order> {
        let key = order_key(&self.hours.today_key(now), epoch, purpose, &intent);
        let symbol = intent.symbol.clone();
        match self.oms.place(&self.user_id, intent.with_key(key)).await {
            Ok(o) if o.status == OrderStatus::Rejected => {
                warn!(%symbol, purpose, error = o.error.as_deref().unwrap_or(""), "order rejected");
                Some(o)
            }
            Ok(o) => {
                info!(%symbol, purpose, side = o.side.as_str(), qty = o.quantity, status = o.status.as_str(), "order sent");
                Some(o)
            }
            Err(e) => {
                warn!(%symbol, purpose, error = %e, "order not placed");
                None
            }
        }
    }

    /// Reduce-only market exit of up to `qty` shares of `pos`.
    pub async fn exit(&self, pos: &Position, qty: u64, purpose: &str, epoch: u64, now: DateTime<Utc>) -> Option<Order> {
        let qty = qty.min(pos.quantity);
        if qty == 0 {
            return None;
        }
        let intent = OrderIntent::market(&pos.symbol, pos.side.exit_side(), qty, self.mark(pos)).reduce_only();
        self.submit(intent, purpose, epoch, now).await
    }

    /// Market-close every open position. Returns how many exits went out.
    pub async fn flatten_all(&self, purpose: &str, epoch: u64, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut sent = 0;
        for p in self.store.positions().await? {
            if let Some(o) = self.exit(&p, p.quantity, purpose, epoch, now).await {
                if o.status != OrderStatus::Rejected {
                    sent += 1;
                }
            }
        }
        Ok(sent)
    }

    /// Halve the worst loser (at least one share).
    pub async fn derisk(&self, epoch: u64, now: DateTime<Utc>) -> Result<(), StoreError> {
        let positions = self.store.positions().await?;
        if let Some((p, qty)) = worst_loser(&positions, |p| self.mark(p)) {
            info!(symbol = %p.symbol, qty, "de-risk: trimming worst loser");
            self.exit(p, qty, "derisk", epoch, now).await;
        }
        Ok(())
    }

    fn publish(&self, v: &PnlView) {
        OPEN_POSITIONS.set(v.open_positions as i64);
        set_money(&PNL_NET, v.net);
        set_money(&PNL_REALIZED, v.realized);
        set_money(&CAPITAL_IN_USE, v.capital_in_use);
    }
}

#[derive(Debug, Default)]
struct CtxInner {
    started_at: Option<DateTime<Utc>>,
    peak_pnl: Decimal,
    last_entry_at: HashMap<String, DateTime<Utc>>,
}

/// Mutable per-process engine state.
#[derive(Debug, Default)]
pub struct EngineContext {
    running: AtomicBool,
    entries_allowed: AtomicBool,
    epoch: AtomicU64,
    inner: Mutex<CtxInner>,
}

impl EngineContext {
    pub fn new() -> Self { Self::default() }

    fn inner(&self) -> std::sync::MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool { self.running.load(Ordering::SeqCst) }
    pub fn set_running(&self, on: bool) -> bool { self.running.swap(on, Ordering::SeqCst) }

    pub fn entries_allowed(&self) -> bool { self.entries_allowed.load(Ordering::SeqCst) }
    /// Returns the previous value.
    pub fn set_entries_allowed(&self, on: bool) -> bool { self.entries_allowed.swap(on, Ordering::SeqCst) }

    pub fn next_epoch(&self) -> u64 { self.epoch.fetch_add(1, Ordering::SeqCst) + 1 }

    pub fn started_at(&self) -> Option<DateTime<Utc>> { self.inner().started_at }
    fn set_started_at(&self, t: Option<DateTime<Utc>>) { self.inner().started_at = t; }

    pub fn peak_pnl(&self) -> Decimal { self.inner().peak_pnl }
    fn update_peak(&self, net: Decimal) {
        let mut g = self.inner();
        if net > g.peak_pnl {
            g.peak_pnl = net;
        }
    }

    fn cooling_down(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        self.inner().last_entry_at.get(symbol).is_some_and(|t| now - *t < chrono::Duration::seconds(ENTRY_COOLDOWN_SECS))
    }
    fn note_entry(&self, symbol: &str, now: DateTime<Utc>) {
        self.inner().last_entry_at.insert(symbol.to_string(), now);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineState {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub new_entries_allowed: bool,
    pub kill_switch: bool,
    pub peak_pnl: Decimal,
}

struct LoopTask {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

pub struct Engine {
    svc: Arc<Services>,
    ctx: Arc<EngineContext>,
    eod: EodController,
    tick_every: Duration,
    task: tokio::sync::Mutex<Option<LoopTask>>,
}

impl Engine {
    pub fn new(svc: Arc<Services>, tick_every: Duration) -> Arc<Self> {
        Arc::new(Self {
            eod: EodController::new(svc.clone()),
            svc,
            ctx: Arc::new(EngineContext::new()),
            tick_every,
            task: tokio::sync::Mutex::new(None),
        })
    }

    pub fn state(&self) -> EngineState {
        EngineState {
            running: self.ctx.is_running(),
            started_at: self.ctx.started_at(),
            new_entries_allowed: self.ctx.entries_allowed(),
            kill_switch: self.svc.risk.kill_switch(),
            peak_pnl: self.ctx.peak_pnl(),
        }
    }

    /// Idempotent. Refused while the kill switch is on or after a hard
    /// risk halt on the same trading day.
    pub async fn start(self: &Arc<Self>) -> Result<EngineState, EngineError> {
        let now = self.svc.clock.now();
        let today = self.svc.hours.today_key(now);
        if self.svc.risk.kill_switch() {
            return Err(EngineError::StartRefused("kill switch is on".into()));
        }
        if self.svc.risk.halted_on(&today) {
            return Err(EngineError::StartRefused(format!("risk halt in force for {today}")));
        }

        let mut task = self.task.lock().await;
        if !self.ctx.is_running() {
            let patch = RunStatePatch { running: Some(true), started_at: Some(Some(now)), ..RunStatePatch::default() };
            let persisted = self.svc.store.upsert_run_state(patch, now).await?;
            self.ctx.set_running(true);
            self.ctx.set_entries_allowed(true);
            self.ctx.set_started_at(Some(now));
            ENGINE_RUNNING.set(1);
            self.svc.journal.record(Event::RunState(persisted));
            info!(every_ms = self.tick_every.as_millis() as u64, "engine started");
        }
        if task.as_ref().map_or(true, |t| t.join.is_finished()) {
            let (stop, rx) = watch::channel(false);
            let join = tokio::spawn(run_loop(Arc::clone(self), rx));
            *task = Some(LoopTask { stop, join });
        }
        Ok(self.state())
    }

    /// Cancel the timer and wait for an in-flight tick to finish.
    pub async fn stop(&self) -> Result<EngineState, EngineError> {
        let task = self.task.lock().await.take();
        if let Some(t) = task {
            let _ = t.stop.send(true);
            if let Err(e) = t.join.await {
                warn!(?e, "engine loop ended abnormally");
            }
        }
        let was_running = self.ctx.set_running(false);
        self.ctx.set_entries_allowed(false);
        let now = self.svc.clock.now();
        let persisted = self
            .svc
            .store
            .upsert_run_state(RunStatePatch { running: Some(false), ..RunStatePatch::default() }, now)
            .await?;
        ENGINE_RUNNING.set(0);
        if was_running {
            self.svc.journal.record(Event::RunState(persisted));
            info!("engine stopped");
        }
        Ok(self.state())
    }

    /// Stop, then market-close every open position before returning.
    pub async fn emergency_stop(&self) -> Result<usize, EngineError> {
        self.stop().await?;
        let now = self.svc.clock.now();
        let closed = self.svc.flatten_all("emergency", self.ctx.next_epoch(), now).await?;
        warn!(closed, "EMERGENCY STOP: engine stopped and book flattened");
        Ok(closed)
    }

    pub fn set_kill_switch(&self, on: bool) {
        self.svc.risk.set_kill_switch(on);
        warn!(on, "kill switch toggled");
        self.svc.journal.record(Event::Note(format!("kill_switch={on}")));
    }

    /// One engine tick. Never fails; errors are logged and counted.
    pub async fn tick(&self) {
        ENGINE_TICKS.inc();
        if let Err(e) = self.tick_inner().await {
            ENGINE_TICK_ERRORS.inc();
            error!(error = %e, "engine tick failed");
        }
    }

    async fn tick_inner(&self) -> Result<(), EngineError> {
        let svc = &self.svc;
        let now = svc.clock.now();
        let epoch = self.ctx.next_epoch();

        // 1) mark-to-market
        svc.mark_to_market(now).await?;
        let view = svc.pnl(now).await?;
        self.ctx.update_peak(view.net);
        svc.publish(&view);

        // 2) EOD
        self.eod.step(&self.ctx, now, epoch).await?;

        // 3)
        if !self.ctx.is_running() || !svc.hours.is_market_open(now) {
            return Ok(());
        }
        let settings = svc.settings.settings().await;

        // 4) risk
        if self.enforce_risk(&settings, now, epoch).await? {
            return Ok(());
        }

        // 5) exits, 6) entries
        self.manage_exits(&settings, now, epoch).await?;
        self.maybe_enter(&settings, now, epoch).await?;
        Ok(())
    }

    /// Returns true when a hard stop fired this tick.
    async fn enforce_risk(&self, settings: &Settings, now: DateTime<Utc>, epoch: u64) -> Result<bool, EngineError> {
        let svc = &self.svc;
        if !svc.risk.hard_stop_due(now) {
            return Ok(false);
        }
        let view = svc.pnl(now).await?;
        if let Some(breach) = evaluate_hard_stop(settings, view.net, view.capital_in_use) {
            RISK_HALTS.with_label_values(&[breach.reason()]).inc();
            error!(reason = %breach, net = %view.net, capital = %view.capital_in_use, "HARD STOP: flattening and stopping");
            self.ctx.set_running(false);
            self.ctx.set_entries_allowed(false);
            svc.risk.mark_halted(&svc.hours.today_key(now));
            let closed = svc.flatten_all("risk-halt", epoch, now).await?;
            let persisted =
                svc.store.upsert_run_state(RunStatePatch { running: Some(false), ..RunStatePatch::default() }, now).await?;
            ENGINE_RUNNING.set(0);
            svc.journal.record(Event::RunState(persisted));
            info!(closed, "hard stop: exits sent");
            svc.notifier
                .notify(Notification::RiskHalt {
                    reason: breach.to_string(),
                    net: view.net,
                    capital_in_use: view.capital_in_use,
                })
                .await;
            return Ok(true);
        }

        if soft_guard_applies(&svc.hours, now, view.net, svc.must_end_day_profitable) {
            if self.ctx.set_entries_allowed(false) {
                warn!(net = %view.net, "soft guard: red after de-risk time, new entries blocked");
            }
            svc.derisk(epoch, now).await?;
        }
        Ok(false)
    }

    async fn manage_exits(&self, settings: &Settings, now: DateTime<Utc>, epoch: u64) -> Result<(), EngineError> {
        let svc = &self.svc;
        let hundred = Decimal::ONE_HUNDRED;
        for p in svc.store.positions().await? {
            if p.average_price <= Decimal::ZERO {
                continue;
            }
            let pct = p.per_share_pnl(svc.mark(&p)) / p.average_price * hundred;
            let purpose = if settings.stop_loss_pct > Decimal::ZERO && pct <= -settings.stop_loss_pct {
                "stop-loss"
            } else if settings.target_pct > Decimal::ZERO && pct >= settings.target_pct {
                "target"
            } else {
                continue;
            };
            info!(symbol = %p.symbol, pct = %pct.round_dp(2), purpose, "exit trigger");
            svc.exit(&p, p.quantity, purpose, epoch, now).await;
        }
        Ok(())
    }

    async fn maybe_enter(&self, settings: &Settings, now: DateTime<Utc>, epoch: u64) -> Result<(), EngineError> {
        if !self.ctx.entries_allowed() {
            return Ok(());
        }
        let svc = &self.svc;
        let positions = svc.store.positions().await?;
        let mut open = positions.len();
        if open >= settings.max_positions {
            return Ok(());
        }
        for row in svc.market.rows() {
            if open >= settings.max_positions {
                break;
            }
            let Some(side) = row.signal.side() else { continue };
            if row.last_price <= Decimal::ZERO || self.ctx.cooling_down(&row.symbol, now) {
                continue;
            }
            let qty = (settings.capital_per_trade / row.last_price).floor().to_u64().unwrap_or(0);
            if qty == 0 {
                debug!(symbol = %row.symbol, ltp = %row.last_price, "entry skipped: capital below one share");
                continue;
            }
            self.ctx.note_entry(&row.symbol, now);
            let intent = OrderIntent::market(&row.symbol, side, qty, row.last_price);
            let fresh = !positions.iter().any(|p| p.symbol == row.symbol);
            if let Some(o) = svc.submit(intent, "entry", epoch, now).await {
                if fresh && o.status != OrderStatus::Rejected {
                    open += 1;
                }
            }
        }
        Ok(())
    }

    /// One market-hours guard pass: start when the session opens, stop
    /// (flattening inside the square-off window) once it has closed and
    /// the EOD controller is done for the day.
    pub async fn guard_pass(self: &Arc<Self>) {
        let svc = &self.svc;
        let now = svc.clock.now();
        let open = svc.hours.is_market_open(now);
        let running = self.ctx.is_running();

        if open && !running {
            if !svc.gateway.is_authenticated().await {
                debug!("market guard: broker session not ready, not starting");
                return;
            }
            match self.start().await {
                Ok(_) => info!("market guard: market open, engine started"),
                Err(e) => debug!(error = %e, "market guard: not starting"),
            }
        } else if !open && running {
            let eod_done = match svc.store.run_state().await {
                Ok(s) => s.eod_done_for.as_deref() == Some(svc.hours.today_key(now).as_str()),
                Err(e) => {
                    warn!(error = %e, "market guard: run state unavailable");
                    return;
                }
            };
            if !eod_done && !svc.hours.is_weekend(now) {
                // penutupan hari ditangani EOD controller
                return;
            }
            if svc.hours.is_squareoff_window(now) {
                if let Err(e) = svc.flatten_all("market-closed", self.ctx.next_epoch(), now).await {
                    warn!(error = %e, "market guard: flatten failed");
                }
            }
            match self.stop().await {
                Ok(_) => info!("market guard: market closed, engine stopped"),
                Err(e) => warn!(error = %e, "market guard: stop failed"),
            }
        }
    }
}

async fn run_loop(engine: Arc<Engine>, mut stop: watch::Receiver<bool>) {
    let every = engine.tick_every;
    let mut timer = interval_at(Instant::now() + every, every);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            // tick yang sedang jalan tidak pernah dibatalkan
            _ = timer.tick() => engine.tick().await,
        }
    }
    debug!("engine loop exited");
}

/// Market-hours guard task.
pub async fn run_market_guard(engine: Arc<Engine>, every: Duration) {
    let mut timer = interval(every);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        timer.tick().await;
        engine.guard_pass().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Limits, Settings};
    use crate::domain::{Side, SignalKind};
    use crate::testkit::{harness, harness_with, ist};
    use rust_decimal_macros::dec;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn entry_sizes_by_capital_and_cools_down() {
        let h = harness(ist(2024, 1, 2, 10, 0));
        let engine = Engine::new(h.svc.clone(), HOUR);
        engine.start().await.unwrap();
        h.market.set("X", dec!(500), SignalKind::Buy);

        engine.tick().await;
        let orders = h.store.orders().await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!((orders[0].side, orders[0].quantity), (Side::Buy, 20));
        assert_eq!(orders[0].status, OrderStatus::Filled);

        h.clock.advance(chrono::Duration::seconds(30));
        engine.tick().await;
        assert_eq!(h.store.orders().await.unwrap().len(), 1);

        h.clock.advance(chrono::Duration::seconds(31));
        engine.tick().await;
        assert_eq!(h.store.orders().await.unwrap().len(), 2);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn entries_respect_max_positions_and_market_hours() {
        let h = harness(ist(2024, 1, 2, 10, 0));
        // settings dibaca ulang setiap tick
        h.settings.update(|s| s.max_positions = 1).await;
        let engine = Engine::new(h.svc.clone(), HOUR);
        engine.start().await.unwrap();
        h.market.set("A", dec!(100), SignalKind::Buy);
        h.market.set("B", dec!(100), SignalKind::Sell);
        engine.tick().await;
        assert_eq!(h.store.positions().await.unwrap().len(), 1);

        // sebelum jam buka: tidak ada order baru
        let h2 = harness(ist(2024, 1, 2, 8, 0));
        let e2 = Engine::new(h2.svc.clone(), HOUR);
        e2.start().await.unwrap();
        h2.market.set("A", dec!(100), SignalKind::Buy);
        e2.tick().await;
        assert!(h2.store.orders().await.unwrap().is_empty());
        engine.stop().await.unwrap();
        e2.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_loss_and_target_exit() {
        let h = harness(ist(2024, 1, 2, 10, 0));
        let engine = Engine::new(h.svc.clone(), HOUR);
        engine.start().await.unwrap();
        h.open("L", Side::Buy, 10, dec!(100)).await;
        h.open("S", Side::Sell, 10, dec!(100)).await;
        h.open("K", Side::Buy, 10, dec!(100)).await;
        h.market.set("L", dec!(97.9), SignalKind::Hold); // -2.1%
        h.market.set("S", dec!(94), SignalKind::Hold); // short +6%
        h.market.set("K", dec!(101), SignalKind::Hold); // +1%, tetap

        engine.tick().await;
        let left: Vec<String> = h.store.positions().await.unwrap().into_iter().map(|p| p.symbol).collect();
        assert_eq!(left, vec!["K".to_string()]);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn hard_stop_flattens_and_blocks_restart() {
        let settings = Settings { daily_loss_limit: dec!(500), stop_loss_pct: dec!(0), ..Settings::default() };
        let h = harness_with(ist(2024, 1, 2, 11, 0), Limits::default(), settings);
        let engine = Engine::new(h.svc.clone(), HOUR);
        engine.start().await.unwrap();
        h.open("X", Side::Buy, 10, dec!(100)).await;
        h.market.set("X", dec!(50), SignalKind::Buy); // -500 tepat di limit

        engine.tick().await;
        assert!(!engine.state().running);
        assert!(h.store.positions().await.unwrap().is_empty());
        assert!(h.gw.positions().await.unwrap().is_empty());
        assert!(h.sink.all().iter().any(|n| matches!(n, Notification::RiskHalt { .. })));
        assert!(!h.store.run_state().await.unwrap().running);

        // tidak ada entry baru setelah halt
        let orders_after = h.store.orders().await.unwrap().len();
        h.clock.advance(chrono::Duration::seconds(5));
        engine.tick().await;
        assert_eq!(h.store.orders().await.unwrap().len(), orders_after);

        assert!(matches!(engine.start().await, Err(EngineError::StartRefused(_))));
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn full_book_survives_small_green_move_on_defaults() {
        let h = harness(ist(2024, 1, 2, 10, 0));
        let engine = Engine::new(h.svc.clone(), HOUR);
        engine.start().await.unwrap();
        for s in ["A", "B", "C", "D", "E"] {
            h.market.set(s, dec!(500), SignalKind::Buy);
        }
        engine.tick().await;
        assert_eq!(h.store.positions().await.unwrap().len(), 5);

        for s in ["A", "B", "C", "D", "E"] {
            h.market.set(s, dec!(501), SignalKind::Hold);
        }
        h.clock.advance(chrono::Duration::seconds(5));
        engine.tick().await;
        assert!(engine.state().running);
        assert_eq!(h.store.positions().await.unwrap().len(), 5);
        assert!(!h.sink.all().iter().any(|n| matches!(n, Notification::RiskHalt { .. })));
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn soft_guard_blocks_entries_and_halves_worst_loser() {
        let settings = Settings { stop_loss_pct: dec!(0), ..Settings::default() };
        let h = harness_with(ist(2024, 1, 2, 14, 5), Limits::default(), settings);
        let engine = Engine::new(h.svc.clone(), HOUR);
        engine.start().await.unwrap();
        h.open("A", Side::Buy, 10, dec!(100)).await;
        h.open("B", Side::Buy, 7, dec!(100)).await;
        h.market.set("A", dec!(99), SignalKind::Hold); // -10
        h.market.set("B", dec!(95), SignalKind::Hold); // -35, terburuk
        h.market.set("C", dec!(100), SignalKind::Buy);

        engine.tick().await;
        assert!(!engine.state().new_entries_allowed);
        assert!(engine.state().running);
        let b = h.store.position("B").await.unwrap().unwrap();
        assert_eq!(b.quantity, 4); // 7 - floor(7/2)
        assert!(h.store.position("C").await.unwrap().is_none());
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn kill_switch_blocks_entries_not_exits() {
        let h = harness(ist(2024, 1, 2, 10, 0));
        let engine = Engine::new(h.svc.clone(), HOUR);
        engine.start().await.unwrap();
        h.open("X", Side::Buy, 10, dec!(100)).await;
        engine.set_kill_switch(true);
        h.market.set("Y", dec!(100), SignalKind::Buy);
        h.market.set("X", dec!(90), SignalKind::Hold); // stop-loss

        engine.tick().await;
        assert!(h.store.position("Y").await.unwrap().is_none());
        assert!(h.store.position("X").await.unwrap().is_none());
        assert!(engine.state().kill_switch);

        engine.stop().await.unwrap();
        assert!(matches!(engine.start().await, Err(EngineError::StartRefused(_))));
        engine.set_kill_switch(false);
        assert!(engine.start().await.is_ok());
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn emergency_stop_flattens_everything() {
        let h = harness(ist(2024, 1, 2, 10, 0));
        let engine = Engine::new(h.svc.clone(), HOUR);
        engine.start().await.unwrap();
        h.open("A", Side::Buy, 3, dec!(100)).await;
        h.open("B", Side::Sell, 4, dec!(50)).await;

        let closed = engine.emergency_stop().await.unwrap();
        assert_eq!(closed, 2);
        assert!(!engine.state().running);
        assert!(h.store.positions().await.unwrap().is_empty());
        assert!(h.gw.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_tick() {
        let h = harness(ist(2024, 1, 2, 10, 0));
        let engine = Engine::new(h.svc.clone(), Duration::from_millis(20));
        h.market.set("X", dec!(100), SignalKind::Buy);
        h.gw.set_latency(Duration::from_millis(200));
        engine.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        engine.stop().await.unwrap();
        let orders = h.store.orders().await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Filled);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(h.store.orders().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_persisted() {
        let h = harness(ist(2024, 1, 2, 10, 0));
        let engine = Engine::new(h.svc.clone(), HOUR);
        let a = engine.start().await.unwrap();
        h.clock.advance(chrono::Duration::seconds(10));
        let b = engine.start().await.unwrap();
        assert_eq!(a.started_at, b.started_at);
        let rs = h.store.run_state().await.unwrap();
        assert!(rs.running);
        assert_eq!(rs.started_at, a.started_at);
        assert_eq!(h.store.run_state_rows().await.unwrap().len(), 1);

        engine.stop().await.unwrap();
        engine.stop().await.unwrap();
        assert!(!h.store.run_state().await.unwrap().running);
    }

    #[tokio::test]
    async fn guard_starts_on_open_when_authenticated() {
        let h = harness(ist(2024, 1, 2, 9, 20));
        let engine = Engine::new(h.svc.clone(), HOUR);
        h.gw.set_authenticated(false);
        engine.guard_pass().await;
        assert!(!engine.state().running);

        h.gw.set_authenticated(true);
        engine.guard_pass().await;
        assert!(engine.state().running);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn guard_leaves_closing_to_eod_until_done() {
        let h = harness(ist(2024, 1, 2, 15, 12));
        let engine = Engine::new(h.svc.clone(), HOUR);
        engine.start().await.unwrap();
        engine.guard_pass().await;
        assert!(engine.state().running);

        // EOD (net 0, flat) menutup hari; guard lalu tidak perlu apa-apa
        engine.tick().await;
        assert!(!engine.state().running);
        assert_eq!(h.store.run_state().await.unwrap().eod_done_for.as_deref(), Some("2024-01-02"));

        // start manual setelah EOD: guard menghentikan lagi
        engine.start().await.unwrap();
        engine.guard_pass().await;
        assert!(!engine.state().running);
    }

    #[test]
    fn engine_keys_vary_by_epoch_and_purpose() {
        let i = OrderIntent::market("X", Side::Sell, 5, dec!(1));
        let a = order_key("2024-01-02", 1, "exit", &i);
        assert_eq!(a, order_key("2024-01-02", 1, "exit", &i));
        assert_ne!(a, order_key("2024-01-02", 2, "exit", &i));
        assert_ne!(a, order_key("2024-01-02", 1, "eod", &i));
    }
}
