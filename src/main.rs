// ===============================
// src/main.rs
// ===============================
/*
 # jalankan paper trading, pasar dipaksa buka (dev)
 cargo run -- --broker paper --force-open

 # status engine & P&L
 curl -s localhost:9898/metrics | egrep '^(engine_running|pnl_|open_positions)'

 # aktivitas order / risk / EOD
 curl -s localhost:9898/metrics | egrep '^(orders_total|risk_|eod_actions_total|reconcile_)'
*/
/*
=============================================================================
Project : autotrade_rust — intraday auto-trading controller in Rust
Module  : main.rs
Version : 0.5.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Runs a 3s engine loop over a watch-listed NSE universe, gates every
          order through a risk guard, closes the day non-negative when it
          can, places orders idempotently through a broker gateway
          (paper/Zerodha/Upstox), reconciles against broker truth, exposes
          Prometheus metrics, and records JSONL events.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
mod clock;
mod config;
mod domain;
mod engine;
mod eod;
mod feed;
mod gateway;          // seam broker + paper venue
mod gateway_kite;     // Zerodha Kite Connect v3
mod gateway_upstox;   // Upstox v2
mod market;
mod metrics;
mod notify;
mod oms;
mod positions;
mod reconciler;
mod recorder;
mod risk;
mod signing;
mod store;
#[cfg(test)]
mod testkit;

use std::sync::Arc;

use clap::Parser;
use tokio::{
    select,
    sync::{broadcast, mpsc},
    time::{interval, Duration},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::clock::{Clock, SystemClock};
use crate::config::SharedSettings;
use crate::domain::{Event, Tick};
use crate::engine::{Engine, Services};
use crate::market::MarketHub;
use crate::notify::{CompositeSink, LogSink, RecorderSink, WebhookSink};
use crate::oms::Oms;
use crate::reconciler::Reconciler;
use crate::recorder::Journal;
use crate::risk::RiskGuard;
use crate::store::{MemoryStore, Store};

#[tokio::main]
async fn main() {
    // ---- Config (.env dulu, supaya RUST_LOG dari .env ikut terbaca) ----
    let cli = config::Cli::parse();
    let (args, limits, oms_cfg, settings) = config::load(&cli);

    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    info!(
        broker = args.broker.as_str(),
        user = %args.user_id,
        symbols = ?args.symbols,
        tick_ms = args.tick_every.as_millis() as u64,
        must_end_day_profitable = args.must_end_day_profitable,
        force_open = args.hours.force_open,
        ?settings,
        ?limits,
        "startup config"
    );
    for s in &args.symbols {
        metrics::CONFIG_SYMBOL.with_label_values(&[s]).set(1);
    }

    // ---- Recorder (optional) ----
    let journal = match args.record_file.clone() {
        Some(path) => {
            let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
            tokio::spawn(recorder::run(rec_rx, path));
            Journal::new(rec_tx)
        }
        None => Journal::disabled(),
    };

    // ---- Store + run-state normalization ----
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    match store::normalize_run_state(store.as_ref(), clock.now()).await {
        Ok(0) => {}
        Ok(removed) => warn!(removed, "run state: duplicate rows collapsed"),
        Err(e) => error!(error = %e, "run state normalization failed"),
    }

    // ---- Broker ----
    let gateway = gateway::from_config(&args, oms_cfg.gateway_timeout);

    // ---- Market data bus ----
    let (md_tx, _md_rx) = broadcast::channel::<Tick>(4096);
    let hub = Arc::new(MarketHub::new(args.symbols.clone()));
    tokio::spawn(market::run(hub.clone(), md_tx.subscribe()));
    if gateway.spawn_ticker(&args.symbols, md_tx.clone()).is_none() {
        warn!(broker = gateway.name(), "no live tick source; snapshot stays empty");
    }

    // ---- Notifications ----
    let mut sink = CompositeSink::new()
        .with(Arc::new(LogSink))
        .with(Arc::new(RecorderSink::new(journal.clone())));
    if let Some(url) = args.alert_webhook_url.clone() {
        sink = sink.with(Arc::new(WebhookSink::new(url, args.alert_webhook_secret.clone())));
    }

    // ---- Core services ----
    let risk = Arc::new(RiskGuard::new(limits, args.hours.clone()));
    let oms = Arc::new(Oms::new(store.clone(), gateway.clone(), risk.clone(), clock.clone(), journal.clone(), oms_cfg));
    let svc = Arc::new(Services {
        user_id: args.user_id.clone(),
        store,
        gateway: gateway.clone(),
        oms,
        risk,
        market: hub,
        settings: Arc::new(SharedSettings::new(settings)),
        notifier: Arc::new(sink),
        clock,
        journal,
        hours: args.hours.clone(),
        must_end_day_profitable: args.must_end_day_profitable,
    });

    let engine = Engine::new(svc.clone(), args.tick_every);
    if args.kill_switch {
        engine.set_kill_switch(true);
    }

    // ---- Reconciler ----
    tokio::spawn(reconciler::run(Arc::new(Reconciler::new(svc.clone())), args.reconcile_every));

    // ---- Market-hours guard (auto start/stop) ----
    if args.autostart {
        tokio::spawn(engine::run_market_guard(engine.clone(), args.market_guard_every));
    } else {
        info!("autostart disabled: monitor mode, engine will not start on its own");
    }

    // ---- Heartbeat + shutdown ----
    let mut heartbeat = interval(Duration::from_secs(30));
    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                if args.flatten_on_exit {
                    info!("shutdown requested, flattening book");
                    if let Err(e) = engine.emergency_stop().await {
                        error!(error = %e, "emergency stop failed");
                    }
                } else {
                    info!("shutdown requested, stopping engine");
                    if let Err(e) = engine.stop().await {
                        error!(error = %e, "engine stop failed");
                    }
                }
                break;
            }
            _ = heartbeat.tick() => {
                let st = engine.state();
                info!(
                    running = st.running,
                    new_entries = st.new_entries_allowed,
                    kill_switch = st.kill_switch,
                    peak_pnl = %st.peak_pnl,
                    "heartbeat"
                );
            }
        }
    }
}
