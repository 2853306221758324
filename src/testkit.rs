// ===============================
// src/testkit.rs (test-only fakes + wiring)
// ===============================
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use tokio::{sync::broadcast, task::JoinHandle};

use crate::clock::{offset_minutes, Clock, MarketHours};
use crate::config::{Limits, OmsCfg, Settings, SharedSettings};
use crate::domain::{BrokerOrder, BrokerPosition, Order, OrderIntent, Side, SignalKind, SnapshotRow, Tick};
use crate::engine::Services;
use crate::gateway::{BrokerAck, BrokerGateway, BrokerOrderRequest, GatewayError, OrderChanges, PaperGateway};
use crate::market::MarketSnapshot;
use crate::notify::{Notification, NotificationSink};
use crate::oms::Oms;
use crate::recorder::Journal;
use crate::risk::RiskGuard;
use crate::store::{MemoryStore, Store};

/// Local exchange time (IST) as UTC.
pub fn ist(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    offset_minutes(330)
        .with_ymd_and_hms(y, mo, d, h, mi, 0)
        .single()
        .map(|t| t.with_timezone(&Utc))
        .expect("valid test time")
}

pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self { Self(Mutex::new(at)) }
    pub fn set(&self, at: DateTime<Utc>) { *self.0.lock().unwrap() = at; }
    pub fn advance(&self, d: chrono::Duration) { *self.0.lock().unwrap() += d; }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> { *self.0.lock().unwrap() }
}

#[derive(Default)]
pub struct StaticSnapshot(Mutex<Vec<SnapshotRow>>);

impl StaticSnapshot {
    pub fn set(&self, symbol: &str, px: Decimal, signal: SignalKind) {
        let mut rows = self.0.lock().unwrap();
        let row = SnapshotRow { symbol: symbol.to_string(), last_price: px, change_pct: 0.0, signal };
        match rows.iter_mut().find(|r| r.symbol == symbol) {
            Some(r) => *r = row,
            None => rows.push(row),
        }
    }
}

impl MarketSnapshot for StaticSnapshot {
    fn rows(&self) -> Vec<SnapshotRow> { self.0.lock().unwrap().clone() }
    fn ltp(&self, symbol: &str) -> Option<Decimal> {
        self.0.lock().unwrap().iter().find(|r| r.symbol == symbol).map(|r| r.last_price)
    }
}

#[derive(Default)]
pub struct CollectingSink(Mutex<Vec<Notification>>);

impl CollectingSink {
    pub fn all(&self) -> Vec<Notification> { self.0.lock().unwrap().clone() }
}

#[async_trait]
impl NotificationSink for CollectingSink {
    async fn notify(&self, n: Notification) { self.0.lock().unwrap().push(n); }
}

/// Broker whose truth is whatever the test says. Orders are acked and
/// filled at the reference price; positions/orders are set by hand.
#[derive(Default)]
pub struct ScriptedGateway {
    positions: Mutex<Vec<BrokerPosition>>,
    orders: Mutex<Vec<BrokerOrder>>,
    next_id: AtomicU64,
}

impl ScriptedGateway {
    pub fn set_positions(&self, p: Vec<BrokerPosition>) { *self.positions.lock().unwrap() = p; }
    pub fn set_orders(&self, o: Vec<BrokerOrder>) { *self.orders.lock().unwrap() = o; }
}

#[async_trait]
impl BrokerGateway for ScriptedGateway {
    fn name(&self) -> &'static str { "scripted" }

    async fn place_order(&self, req: &BrokerOrderRequest) -> Result<BrokerAck, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(BrokerAck { broker_order_id: format!("S-{id}"), fill_price: Some(req.reference_price) })
    }
    async fn cancel_order(&self, _id: &str) -> Result<(), GatewayError> { Ok(()) }
    async fn modify_order(&self, _id: &str, _c: &OrderChanges) -> Result<(), GatewayError> { Ok(()) }
    async fn positions(&self) -> Result<Vec<BrokerPosition>, GatewayError> { Ok(self.positions.lock().unwrap().clone()) }
    async fn orders(&self) -> Result<Vec<BrokerOrder>, GatewayError> { Ok(self.orders.lock().unwrap().clone()) }
    async fn is_authenticated(&self) -> bool { true }
    fn spawn_ticker(&self, _s: &[String], _tx: broadcast::Sender<Tick>) -> Option<JoinHandle<()>> { None }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub gw: Arc<PaperGateway>,
    pub scripted: Arc<ScriptedGateway>,
    pub store: Arc<MemoryStore>,
    pub market: Arc<StaticSnapshot>,
    pub sink: Arc<CollectingSink>,
    pub settings: SharedSettings,
    pub svc: Arc<Services>,
    seq: AtomicU64,
}

impl Harness {
    /// Open (or add to) a position through the OMS at `px`.
    pub async fn open(&self, symbol: &str, side: Side, qty: u64, px: Decimal) -> Order {
        self.market.set(symbol, px, SignalKind::Hold);
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let intent = OrderIntent::market(symbol, side, qty, px).with_key(format!("seed-{n}"));
        self.svc.oms.place("test", intent).await.expect("seed order")
    }
}

fn build(now: DateTime<Utc>, limits: Limits, settings: Settings, eod_policy: bool, scripted: bool) -> Harness {
    let clock = Arc::new(ManualClock::new(now));
    let gw = Arc::new(PaperGateway::new());
    let scripted_gw = Arc::new(ScriptedGateway::default());
    let gateway: Arc<dyn BrokerGateway> = if scripted { scripted_gw.clone() } else { gw.clone() };
    let store = Arc::new(MemoryStore::new());
    let market = Arc::new(StaticSnapshot::default());
    let sink = Arc::new(CollectingSink::default());
    let shared = SharedSettings::new(settings);
    let hours = MarketHours::default();
    let risk = Arc::new(RiskGuard::new(limits, hours.clone()));
    let cfg = OmsCfg { max_retries: 1, backoff: Duration::from_millis(1), gateway_timeout: Duration::from_secs(2) };
    let oms = Arc::new(Oms::new(store.clone(), gateway.clone(), risk.clone(), clock.clone(), Journal::disabled(), cfg));
    let svc = Arc::new(Services {
        user_id: "test".into(),
        store: store.clone() as Arc<dyn Store>,
        gateway,
        oms,
        risk,
        market: market.clone(),
        settings: Arc::new(shared.clone()),
        notifier: sink.clone(),
        clock: clock.clone(),
        journal: Journal::disabled(),
        hours,
        must_end_day_profitable: eod_policy,
    });
    Harness { clock, gw, scripted: scripted_gw, store, market, sink, settings: shared, svc, seq: AtomicU64::new(0) }
}

pub fn harness(now: DateTime<Utc>) -> Harness {
    build(now, Limits::default(), Settings::default(), true, false)
}

pub fn harness_with(now: DateTime<Utc>, limits: Limits, settings: Settings) -> Harness {
    build(now, limits, settings, true, false)
}

pub fn harness_opts(now: DateTime<Utc>, limits: Limits, settings: Settings, eod_policy: bool) -> Harness {
    build(now, limits, settings, eod_policy, false)
}

/// Harness whose broker is a [`ScriptedGateway`].
pub fn scripted_harness(now: DateTime<Utc>) -> Harness {
    build(now, Limits::default(), Settings::default(), true, true)
}
