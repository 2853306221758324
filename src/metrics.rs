// ===============================
// src/metrics.rs
// ===============================
use std::{convert::Infallible, net::SocketAddr};

use hyper::{
    header::CONTENT_TYPE,
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server,
};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use rust_decimal::{prelude::ToPrimitive, Decimal};
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "market data ticks").unwrap());

pub static TICKS_BY_SYMBOL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_total_by_symbol", "market data ticks per symbol"),
        &["symbol"],
    )
    .unwrap()
});

pub static FEED_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("feed_ws_connected", "1 if the tick websocket is connected, 0 otherwise"),
        &["feed"],
    )
    .unwrap()
});

pub static FEED_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("feed_reconnects_total", "tick feed reconnect attempts"),
        &["feed"],
    )
    .unwrap()
});

// -------- Engine --------
pub static ENGINE_TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("engine_ticks_total", "engine loop ticks").unwrap());

pub static ENGINE_TICK_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("engine_tick_errors_total", "engine ticks that ended in error").unwrap());

pub static ENGINE_RUNNING: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("engine_running", "1 while the engine is RUNNING").unwrap());

pub static OPEN_POSITIONS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("open_positions", "open positions in the local ledger").unwrap());

pub static PNL_NET: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_net_today", "realized + unrealized PnL for the trading day").unwrap());

pub static PNL_REALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_realized_today", "realized PnL for the trading day").unwrap());

pub static CAPITAL_IN_USE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("capital_in_use", "sum of qty x mark over open positions").unwrap());

// -------- Orders / risk --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_total", "orders by final OMS status"),
        &["status"],
    )
    .unwrap()
});

pub static ORDER_RETRIES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("order_retries_total", "gateway submissions retried by the OMS").unwrap());

pub static RISK_REJECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("risk_rejections_total", "pre-trade rejections (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

pub static RISK_HALTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("risk_halts_total", "hard-stop halts (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

pub static EOD_ACTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("eod_actions_total", "EOD controller actions (label: action)"),
        &["action"],
    )
    .unwrap()
});

// -------- Reconciler / alerts --------
pub static RECONCILE_RUNS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("reconcile_runs_total", "reconciler passes").unwrap());

pub static RECONCILE_MISMATCHES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("reconcile_mismatches_total", "position/parity mismatches found").unwrap());

pub static ALERTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("alerts_total", "notifications emitted (label: level)"),
        &["level"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_BROKER: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_broker", "selected broker (label: broker)"),
        &["broker"],
    )
    .unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_symbol", "configured symbols (label: symbol)"),
        &["symbol"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(TICKS_BY_SYMBOL.clone())),
        REGISTRY.register(Box::new(FEED_CONNECTED.clone())),
        REGISTRY.register(Box::new(FEED_RECONNECTS.clone())),
        REGISTRY.register(Box::new(ENGINE_TICKS.clone())),
        REGISTRY.register(Box::new(ENGINE_TICK_ERRORS.clone())),
        REGISTRY.register(Box::new(ENGINE_RUNNING.clone())),
        REGISTRY.register(Box::new(OPEN_POSITIONS.clone())),
        REGISTRY.register(Box::new(PNL_NET.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(CAPITAL_IN_USE.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(ORDER_RETRIES.clone())),
        REGISTRY.register(Box::new(RISK_REJECTS.clone())),
        REGISTRY.register(Box::new(RISK_HALTS.clone())),
        REGISTRY.register(Box::new(EOD_ACTIONS.clone())),
        REGISTRY.register(Box::new(RECONCILE_RUNS.clone())),
        REGISTRY.register(Box::new(RECONCILE_MISMATCHES.clone())),
        REGISTRY.register(Box::new(ALERTS.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_BROKER.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
    ] {
        let _ = m;
    }
}

/// Decimal -> f64 gauge value (0.0 if it does not fit).
pub fn set_money(g: &Gauge, v: Decimal) {
    g.set(v.to_f64().unwrap_or(0.0));
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// GET / atau /metrics -> text exposition
async fn handle(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let body = encode_metrics();
    let rsp = Response::builder()
        .header(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()));
    Ok(rsp)
}

pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = match Server::try_bind(&addr) {
        Ok(b) => b.serve(make_svc),
        Err(e) => {
            error!(?e, %addr, "metrics bind failed");
            return;
        }
    };
    info!(%addr, "metrics listening (/ and /metrics)");
    if let Err(e) = server.await {
        error!(?e, "metrics server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_contains_registered_families() {
        init();
        ORDERS.with_label_values(&["filled"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("orders_total"));
    }
}
