// ===============================
// src/reconciler.rs
// ===============================
//
// Rekonsiliasi berkala terhadap kebenaran broker:
// - status order lokal ditimpa status broker (match broker_order_id)
// - posisi dibandingkan (qty bertanda harus sama, avg toleransi 0.02)
// - paritas P&L lokal vs broker (epsilon 0.01), hanya kalau broker
//   melaporkan pnl untuk semua baris
// Hanya alert; posisi tidak pernah dikoreksi otomatis.
//
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use futures_util::future::join;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::domain::{BrokerPosition, Position};
use crate::engine::{EngineError, Services};
use crate::metrics::{RECONCILE_MISMATCHES, RECONCILE_RUNS};
use crate::notify::{AlertLevel, Notification};

pub const AVG_PRICE_TOLERANCE: Decimal = dec!(0.02);
pub const PNL_PARITY_EPSILON: Decimal = dec!(0.01);

#[derive(Debug, Clone, PartialEq)]
pub struct PositionMismatch {
    pub symbol: String,
    /// Signed quantity (short < 0).
    pub local_qty: i64,
    pub broker_qty: i64,
    pub local_avg: Decimal,
    pub broker_avg: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub broker_orders: usize,
    pub statuses_updated: usize,
    pub mismatches: Vec<PositionMismatch>,
    pub local_net: Decimal,
    pub broker_net: Option<Decimal>,
    pub parity_drift: Option<Decimal>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty() && self.parity_drift.is_none()
    }
}

fn signed(qty: u64, long: bool) -> i64 {
    let q = qty as i64;
    if long { q } else { -q }
}

/// Symbols whose signed quantity differs, or whose average price differs
/// by more than [`AVG_PRICE_TOLERANCE`]. Flat broker rows count as absent.
pub fn diff_positions(local: &[Position], broker: &[BrokerPosition]) -> Vec<PositionMismatch> {
    use crate::domain::PositionSide::Long;

    let mut sides: HashMap<&str, (i64, Decimal, i64, Decimal)> = HashMap::new();
    for p in local {
        let e = sides.entry(p.symbol.as_str()).or_default();
        e.0 = signed(p.quantity, p.side == Long);
        e.1 = p.average_price;
    }
    for b in broker.iter().filter(|b| b.quantity > 0) {
        let e = sides.entry(b.symbol.as_str()).or_default();
        e.2 = signed(b.quantity, b.side == Long);
        e.3 = b.average_price;
    }
    let mut out: Vec<PositionMismatch> = sides
        .into_iter()
        .filter(|(_, (lq, la, bq, ba))| lq != bq || (*lq != 0 && (*la - *ba).abs() > AVG_PRICE_TOLERANCE))
        .map(|(s, (lq, la, bq, ba))| PositionMismatch {
            symbol: s.to_string(),
            local_qty: lq,
            broker_qty: bq,
            local_avg: la,
            broker_avg: ba,
        })
        .collect();
    out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    out
}

pub struct Reconciler {
    svc: Arc<Services>,
}

impl Reconciler {
    pub fn new(svc: Arc<Services>) -> Self { Self { svc } }

    pub async fn reconcile(&self) -> Result<ReconcileReport, EngineError> {
        let svc = &self.svc;
        RECONCILE_RUNS.inc();
        let now = svc.clock.now();
        let (orders, positions) = join(svc.gateway.orders(), svc.gateway.positions()).await;
        let mut report = ReconcileReport::default();

        match orders {
            Ok(orders) => {
                report.broker_orders = orders.len();
                for bo in &orders {
                    let Some(local) = svc.store.find_order_by_broker_id(&bo.broker_order_id).await? else { continue };
                    if local.status != bo.status {
                        svc.store.set_order_status_by_broker_id(&bo.broker_order_id, bo.status, now).await?;
                        report.statuses_updated += 1;
                        debug!(broker_order_id = %bo.broker_order_id, from = local.status.as_str(), to = bo.status.as_str(), "reconcile: status synced");
                    }
                }
            }
            Err(e) => warn!(error = %e, "reconcile: broker orders unavailable"),
        }

        let broker_positions = match positions {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "reconcile: broker positions unavailable, skipping position checks");
                return Ok(report);
            }
        };
        let local = svc.store.positions().await?;
        report.mismatches = diff_positions(&local, &broker_positions);

        report.local_net = svc.pnl(now).await?.net;
        if !broker_positions.is_empty() && broker_positions.iter().all(|b| b.pnl.is_some()) {
            let broker_net: Decimal = broker_positions.iter().filter_map(|b| b.pnl).sum();
            report.broker_net = Some(broker_net);
            let drift = (report.local_net - broker_net).abs();
            if drift > PNL_PARITY_EPSILON {
                report.parity_drift = Some(drift);
            }
        }

        if report.is_clean() {
            debug!(orders = report.broker_orders, updated = report.statuses_updated, "reconcile: clean");
            return Ok(report);
        }

        let mut detail: Vec<String> = report
            .mismatches
            .iter()
            .map(|m| format!("{} local {}@{} broker {}@{}", m.symbol, m.local_qty, m.local_avg, m.broker_qty, m.broker_avg))
            .collect();
        if let (Some(drift), Some(bn)) = (report.parity_drift, report.broker_net) {
            detail.push(format!("pnl local {} broker {} drift {}", report.local_net, bn, drift));
        }
        let count = report.mismatches.len() + usize::from(report.parity_drift.is_some());
        RECONCILE_MISMATCHES.inc_by(count as u64);
        warn!(mismatches = count, "reconcile: drift against broker");
        svc.notifier
            .notify(Notification::alert(AlertLevel::Warning, "reconcile drift", detail.join("; ")))
            .await;
        Ok(report)
    }
}

/// Periodic reconciliation task.
pub async fn run(reconciler: Arc<Reconciler>, every: Duration) {
    let mut timer = interval(every);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(every_ms = every.as_millis() as u64, "reconciler running");
    loop {
        timer.tick().await;
        if let Err(e) = reconciler.reconcile().await {
            warn!(error = %e, "reconcile pass failed");
        }
    }
}
