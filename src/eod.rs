// ===============================
// src/eod.rs
// ===============================
//
// End-of-day controller: usahakan hari ditutup dengan net >= 0.
//
// Di jendela EOD (dan kebijakan aktif):
//   - tutup semua winner (pnl >= 0), yang paling untung dulu
//   - net = realized hari ini (setelah winner ditutup)
//   - loser, yang paling kecil ruginya dulu: tutup penuh kalau net tetap
//     >= 0, kalau tidak tutup sebagian floor(net / rugi per lembar) lalu stop
// Setelah pasar tutup: square-off total bila net >= 0 / kebijakan mati /
// hard cutoff lewat; selain itu tahan entry, de-risk, tunggu cutoff.
//
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::domain::{Event, OrderStatus, Position};
use crate::engine::{EngineContext, EngineError, Services};
use crate::metrics::{EOD_ACTIONS, ENGINE_RUNNING};
use crate::notify::{AlertLevel, EodReport, Notification};
use crate::positions::realized_from_orders;
use crate::store::RunStatePatch;

/// What to do with one losing position given the banked net.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoserStep {
    /// Not actually losing at this mark.
    Skip,
    CloseAll,
    /// Close this many shares, then stop processing losers.
    Partial(u64),
    Stop,
}

pub fn decide_loser(net: Decimal, pos: &Position, mark: Decimal) -> LoserStep {
    let loss_per_share = -pos.per_share_pnl(mark);
    if loss_per_share <= Decimal::ZERO {
        return LoserStep::Skip;
    }
    if net + pos.pnl_at(mark) >= Decimal::ZERO {
        return LoserStep::CloseAll;
    }
    if net <= Decimal::ZERO {
        return LoserStep::Stop;
    }
    let qty = (net / loss_per_share).floor().to_u64().unwrap_or(0).min(pos.quantity.saturating_sub(1));
    if qty >= 1 {
        LoserStep::Partial(qty)
    } else {
        LoserStep::Stop
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EodOutcome {
    AlreadyDone,
    NotDue,
    /// Non-negative close pass ran; session still open.
    Working,
    /// Past close but red; holding until the hard cutoff.
    Deferred,
    Closed(EodReport),
}

pub struct EodController {
    svc: Arc<Services>,
}

impl EodController {
    pub fn new(svc: Arc<Services>) -> Self { Self { svc } }

    /// Run the EOD step for `now`. Completes at most once per trading day.
    pub async fn step(&self, ctx: &EngineContext, now: DateTime<Utc>, epoch: u64) -> Result<EodOutcome, EngineError> {
        let svc = &self.svc;
        let today = svc.hours.today_key(now);
        if svc.store.run_state().await?.eod_done_for.as_deref() == Some(today.as_str()) {
            return Ok(EodOutcome::AlreadyDone);
        }

        let mut outcome = EodOutcome::NotDue;
        if svc.must_end_day_profitable && svc.hours.is_eod_window(now) {
            self.non_negative_close(now, epoch).await?;
            outcome = EodOutcome::Working;
        }
        if !svc.hours.is_after_close(now) {
            return Ok(outcome);
        }

        let net = svc.pnl(now).await?.net;
        let force = !svc.must_end_day_profitable || net >= Decimal::ZERO || svc.hours.is_past_hard_cutoff(now);
        if !force {
            if ctx.set_entries_allowed(false) {
                warn!(%net, "EOD: still red after close, square-off deferred to hard cutoff");
            }
            EOD_ACTIONS.with_label_values(&["deferred"]).inc();
            svc.derisk(epoch, now).await?;
            return Ok(EodOutcome::Deferred);
        }

        let report = self.force_close(ctx, &today, now, epoch).await?;
        Ok(EodOutcome::Closed(report))
    }

    async fn non_negative_close(&self, now: DateTime<Utc>, epoch: u64) -> Result<(), EngineError> {
        let svc = &self.svc;
        let positions = svc.mark_to_market(now).await?;
        if positions.is_empty() {
            return Ok(());
        }
        let mut marked: Vec<(Position, Decimal)> = positions
            .into_iter()
            .map(|p| {
                let m = svc.mark(&p);
                (p, m)
            })
            .collect();
        // pnl menurun: winner terbesar dulu, loser terkecil dulu
        marked.sort_by(|a, b| b.0.pnl_at(b.1).cmp(&a.0.pnl_at(a.1)));
        let (winners, losers): (Vec<_>, Vec<_>) = marked.into_iter().partition(|(p, m)| p.pnl_at(*m) >= Decimal::ZERO);

        for (p, _) in &winners {
            if svc.exit(p, p.quantity, "eod-winner", epoch, now).await.is_some() {
                EOD_ACTIONS.with_label_values(&["close_winner"]).inc();
            }
        }

        let mut net = svc.realized_today(now).await?;
        for (p, mark) in &losers {
            match decide_loser(net, p, *mark) {
                LoserStep::Skip => continue,
                LoserStep::CloseAll => {
                    svc.exit(p, p.quantity, "eod-loser", epoch, now).await;
                    EOD_ACTIONS.with_label_values(&["close_loser"]).inc();
                    net = svc.realized_today(now).await?;
                }
                LoserStep::Partial(qty) => {
                    info!(symbol = %p.symbol, qty, %net, "EOD: partial loser close");
                    svc.exit(p, qty, "eod-partial", epoch, now).await;
                    EOD_ACTIONS.with_label_values(&["partial_loser"]).inc();
                    break;
                }
                LoserStep::Stop => break,
            }
        }
        Ok(())
    }

    async fn force_close(
        &self,
        ctx: &EngineContext,
        today: &str,
        now: DateTime<Utc>,
        epoch: u64,
    ) -> Result<EodReport, EngineError> {
        let svc = &self.svc;
        self.cancel_working(now).await?;
        let closed = svc.flatten_all("eod-close", epoch, now).await?;
        EOD_ACTIONS.with_label_values(&["square_off"]).inc();

        let patch = RunStatePatch {
            running: Some(false),
            eod_done_for: Some(Some(today.to_string())),
            ..RunStatePatch::default()
        };
        let persisted = svc.store.upsert_run_state(patch, now).await?;
        ctx.set_running(false);
        ctx.set_entries_allowed(false);
        ENGINE_RUNNING.set(0);
        svc.journal.record(Event::RunState(persisted));

        let report = self.report(today, now).await?;
        info!(closed, net = %report.net, "EOD: square-off complete, engine stopped for the day");
        svc.notifier.notify(Notification::EodReport(report.clone())).await;
        self.verify_flat().await;
        Ok(report)
    }

    /// LIMIT yang masih terbuka dibatalkan dulu supaya tidak terisi
    /// setelah square-off.
    async fn cancel_working(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let svc = &self.svc;
        let (from, to) = svc.hours.day_bounds_utc(now);
        for o in svc.store.orders_between(from, to).await? {
            if !matches!(o.status, OrderStatus::Placed | OrderStatus::Modified) {
                continue;
            }
            let Some(bid) = o.broker_order_id.as_deref() else { continue };
            match svc.oms.cancel(bid).await {
                Ok(_) => EOD_ACTIONS.with_label_values(&["cancel_working"]).inc(),
                Err(e) => warn!(broker_order_id = bid, error = %e, "EOD: cancel of working order failed"),
            }
        }
        Ok(())
    }

    async fn report(&self, day: &str, now: DateTime<Utc>) -> Result<EodReport, EngineError> {
        let svc = &self.svc;
        let (from, to) = svc.hours.day_bounds_utc(now);
        let orders = svc.store.orders_between(from, to).await?;
        let filled: Vec<_> = orders.iter().filter(|o| o.status == OrderStatus::Filled).collect();
        let realized = realized_from_orders(&orders);
        Ok(EodReport {
            day: day.to_string(),
            net: svc.pnl(now).await?.net,
            realized,
            trades: filled.len(),
            wins: filled.iter().filter(|o| o.realized_pnl > Decimal::ZERO).count(),
            losses: filled.iter().filter(|o| o.realized_pnl < Decimal::ZERO).count(),
        })
    }

    /// Broker truth must be flat after the square-off.
    async fn verify_flat(&self) {
        let svc = &self.svc;
        match svc.gateway.positions().await {
            Ok(ps) => {
                let open: Vec<String> =
                    ps.iter().filter(|p| p.quantity > 0).map(|p| format!("{} {}", p.symbol, p.quantity)).collect();
                if !open.is_empty() {
                    svc.notifier
                        .notify(Notification::alert(AlertLevel::Critical, "EOD: broker not flat", open.join(", ")))
                        .await;
                }
            }
            Err(e) => {
                svc.notifier
                    .notify(Notification::alert(AlertLevel::Warning, "EOD: flat check failed", e.to_string()))
                    .await;
            }
        }
    }
}
