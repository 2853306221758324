// ===============================
// src/oms.rs
// ===============================
//
// Order Management: satu pintu untuk semua order.
//   claim key (idempotent) -> risk gate -> submit (retry + timeout)
//   -> PLACED -> (MARKET) booking posisi -> FILLED + realized
//
// Kegagalan gateway dicatat sebagai order REJECTED, bukan error yang
// menghentikan loop. Penolakan risk dikembalikan sebagai error bertipe.
//
use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::OmsCfg;
use crate::domain::{Event, Order, OrderIntent, OrderStatus, OrderType};
use crate::gateway::{BrokerAck, BrokerGateway, BrokerOrderRequest, GatewayError, OrderChanges};
use crate::metrics::{ORDERS, ORDER_RETRIES};
use crate::recorder::Journal;
use crate::risk::{RiskGuard, RiskRejection};
use crate::signing::sha256_hex;
use crate::store::{Claim, NewOrder, OrderPatch, Store, StoreError};

#[derive(Debug, Error)]
pub enum OmsError {
    #[error("risk: {0}")]
    Risk(#[from] RiskRejection),
    #[error("gateway: {0}")]
    Gateway(#[from] GatewayError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("invalid order: {0}")]
    Invalid(String),
}

/// Default idempotency key: hash of the intent's canonical fields.
pub fn intent_key(intent: &OrderIntent) -> String {
    let canonical = json!({
        "s": intent.symbol,
        "side": intent.side.as_str(),
        "q": intent.quantity,
        "t": intent.order_type.as_str(),
        "px": intent.price.unwrap_or(Decimal::ZERO).to_string(),
        "v": intent.variety,
    });
    sha256_hex(&canonical.to_string())
}

pub struct Oms {
    store: Arc<dyn Store>,
    gateway: Arc<dyn BrokerGateway>,
    risk: Arc<RiskGuard>,
    clock: Arc<dyn Clock>,
    journal: Journal,
    cfg: OmsCfg,
}

impl Oms {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn BrokerGateway>,
        risk: Arc<RiskGuard>,
        clock: Arc<dyn Clock>,
        journal: Journal,
        cfg: OmsCfg,
    ) -> Self {
        Self { store, gateway, risk, clock, journal, cfg }
    }

    /// Place an order at most once per idempotency key.
    ///
    /// A live order already holding the key is returned unchanged and the
    /// gateway is not called. Gateway failures end in a REJECTED order
    /// (`Ok`); only risk rejections and store faults surface as `Err`.
    pub async fn place(&self, user_id: &str, intent: OrderIntent) -> Result<Order, OmsError> {
        if intent.quantity == 0 {
            return Err(OmsError::Invalid("quantity must be positive".into()));
        }
        if intent.order_type == OrderType::Limit && intent.price.is_none() {
            return Err(OmsError::Invalid("limit order without price".into()));
        }
        let key = intent.idempotency_key.clone().unwrap_or_else(|| intent_key(&intent));
        let new = NewOrder {
            user_id: user_id.to_string(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            quantity: intent.quantity,
            price: intent.price.unwrap_or(intent.est_price),
            order_type: intent.order_type,
            variety: intent.variety.clone(),
            idempotency_key: key.clone(),
        };
        let order = match self.store.claim_order(new, self.clock.now()).await? {
            Claim::Existing(o) => {
                debug!(order_id = o.id, status = o.status.as_str(), "oms: duplicate intent, returning existing order");
                return Ok(o);
            }
            Claim::Inserted(o) => o,
        };

        let now = self.clock.now();
        if intent.reduce_only {
            self.risk.note_submission(now);
        } else if let Err(rej) = self.risk.pre_trade(&intent, now) {
            let patch = OrderPatch { status: Some(OrderStatus::Rejected), error: Some(rej.to_string()), ..OrderPatch::default() };
            let rejected = self.store.update_order(order.id, patch, self.clock.now()).await?;
            ORDERS.with_label_values(&["rejected"]).inc();
            self.journal.record(Event::Order(rejected));
            return Err(OmsError::Risk(rej));
        }

        let req = BrokerOrderRequest {
            symbol: intent.symbol.clone(),
            side: intent.side,
            quantity: intent.quantity,
            order_type: intent.order_type,
            price: intent.price,
            reference_price: intent.est_price,
            variety: intent.variety.clone(),
            tag: key.chars().take(20).collect(),
        };
        match self.submit(&req).await {
            Ok(ack) => self.on_accepted(order, &intent, ack).await,
            Err(e) => {
                warn!(order_id = order.id, symbol = %intent.symbol, error = %e, "oms: order rejected");
                let patch = OrderPatch { status: Some(OrderStatus::Rejected), error: Some(e.to_string()), ..OrderPatch::default() };
                let rejected = self.store.update_order(order.id, patch, self.clock.now()).await?;
                ORDERS.with_label_values(&["rejected"]).inc();
                self.journal.record(Event::Order(rejected.clone()));
                Ok(rejected)
            }
        }
    }

    /// One attempt plus `max_retries`, each bounded by `gateway_timeout`.
    /// Backoff grows linearly with the attempt number.
    async fn submit(&self, req: &BrokerOrderRequest) -> Result<BrokerAck, GatewayError> {
        let attempts = self.cfg.max_retries.saturating_add(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match timeout(self.cfg.gateway_timeout, self.gateway.place_order(req)).await {
                Ok(Ok(ack)) => return Ok(ack),
                Ok(Err(e)) => e,
                Err(_) => GatewayError::Timeout(self.cfg.gateway_timeout),
            };
            if !err.is_retryable() || attempt >= attempts {
                return Err(err);
            }
            ORDER_RETRIES.inc();
            warn!(symbol = %req.symbol, attempt, error = %err, "oms: submit failed, retrying");
            sleep(self.cfg.backoff * attempt).await;
        }
    }

    async fn on_accepted(&self, order: Order, intent: &OrderIntent, ack: BrokerAck) -> Result<Order, OmsError> {
        let fill_px = ack.fill_price.unwrap_or(intent.est_price);
        let patch = OrderPatch {
            status: Some(OrderStatus::Placed),
            broker_order_id: Some(ack.broker_order_id.clone()),
            price: Some(if intent.order_type == OrderType::Market { fill_px } else { order.price }),
            ..OrderPatch::default()
        };
        let placed = self.store.update_order(order.id, patch, self.clock.now()).await?;
        info!(
            order_id = placed.id,
            broker_order_id = %ack.broker_order_id,
            symbol = %placed.symbol,
            side = placed.side.as_str(),
            qty = placed.quantity,
            "oms: order placed"
        );
        if intent.order_type == OrderType::Limit {
            ORDERS.with_label_values(&["placed"]).inc();
            self.journal.record(Event::Order(placed.clone()));
            return Ok(placed);
        }

        // MARKET: dibukukan langsung ke posisi lokal
        let now = self.clock.now();
        let realized = self.store.apply_fill(&placed.symbol, placed.side, placed.quantity, fill_px, now).await?;
        let patch = OrderPatch { status: Some(OrderStatus::Filled), realized_pnl: Some(realized), ..OrderPatch::default() };
        let filled = self.store.update_order(placed.id, patch, now).await?;
        self.risk.record_realized(&filled.symbol, realized, now);
        ORDERS.with_label_values(&["filled"]).inc();
        self.journal.record(Event::Fill {
            symbol: filled.symbol.clone(),
            side: filled.side,
            quantity: filled.quantity,
            price: fill_px,
            realized,
            ts: now,
        });
        self.journal.record(Event::Order(filled.clone()));
        Ok(filled)
    }

    /// Pass a modification through; local status changes only on success.
    // belum ada pemanggil di binary (tanpa control surface); dipakai tes
    #[allow(dead_code)]
    pub async fn modify(&self, broker_order_id: &str, changes: OrderChanges) -> Result<Option<Order>, OmsError> {
        match timeout(self.cfg.gateway_timeout, self.gateway.modify_order(broker_order_id, &changes)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(GatewayError::Timeout(self.cfg.gateway_timeout).into()),
        }
        let Some(local) = self.store.find_order_by_broker_id(broker_order_id).await? else {
            return Ok(None);
        };
        let patch = OrderPatch {
            status: Some(OrderStatus::Modified),
            quantity: changes.quantity,
            price: changes.price,
            ..OrderPatch::default()
        };
        let updated = self.store.update_order(local.id, patch, self.clock.now()).await?;
        info!(broker_order_id, "oms: order modified");
        Ok(Some(updated))
    }

    pub async fn cancel(&self, broker_order_id: &str) -> Result<Option<Order>, OmsError> {
        match timeout(self.cfg.gateway_timeout, self.gateway.cancel_order(broker_order_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(GatewayError::Timeout(self.cfg.gateway_timeout).into()),
        }
        let updated = self
            .store
            .set_order_status_by_broker_id(broker_order_id, OrderStatus::Cancelled, self.clock.now())
            .await?;
        info!(broker_order_id, "oms: order cancelled");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::domain::Side;
    use crate::gateway::PaperGateway;
    use crate::store::MemoryStore;
    use crate::testkit::{ist, ManualClock};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Rig {
        oms: Arc<Oms>,
        gw: Arc<PaperGateway>,
        store: Arc<MemoryStore>,
    }

    fn rig(limits: Limits, cfg: OmsCfg) -> Rig {
        let clock = Arc::new(ManualClock::new(ist(2024, 1, 2, 10, 0)));
        let gw = Arc::new(PaperGateway::new());
        let store = Arc::new(MemoryStore::new());
        let risk = Arc::new(RiskGuard::new(limits, Default::default()));
        let oms = Arc::new(Oms::new(store.clone(), gw.clone(), risk, clock, Journal::disabled(), cfg));
        Rig { oms, gw, store }
    }

    fn fast() -> OmsCfg {
        OmsCfg { max_retries: 2, backoff: Duration::from_millis(1), gateway_timeout: Duration::from_millis(200) }
    }

    #[tokio::test]
    async fn concurrent_duplicates_submit_once() {
        let r = rig(Limits::default(), fast());
        let intent = OrderIntent::market("X", Side::Buy, 10, dec!(100));
        let (a, b) = tokio::join!(r.oms.place("u", intent.clone()), r.oms.place("u", intent.clone()));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.id, b.id);
        assert_eq!(r.gw.accepted(), 1);

        // sekuensial juga tidak mengirim ulang
        let again = r.oms.place("u", intent).await.unwrap();
        assert_eq!(again.id, a.id);
        assert_eq!(r.gw.accepted(), 1);
    }

    #[tokio::test]
    async fn market_order_books_position_and_realized() {
        let r = rig(Limits::default(), fast());
        let o = r.oms.place("u", OrderIntent::market("X", Side::Buy, 10, dec!(100))).await.unwrap();
        assert_eq!(o.status, OrderStatus::Filled);
        assert!(o.broker_order_id.is_some());
        let pos = r.store.position("X").await.unwrap().unwrap();
        assert_eq!(pos.quantity, 10);

        let exit = OrderIntent::market("X", Side::Sell, 10, dec!(103)).reduce_only();
        let closed = r.oms.place("u", exit).await.unwrap();
        assert_eq!(closed.realized_pnl, dec!(30));
        assert!(r.store.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let r = rig(Limits::default(), fast());
        r.gw.fail_next(GatewayError::Transient("503".into()));
        let o = r.oms.place("u", OrderIntent::market("X", Side::Buy, 1, dec!(100))).await.unwrap();
        assert_eq!(o.status, OrderStatus::Filled);
        assert_eq!(r.gw.accepted(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_reject_and_release_key() {
        let r = rig(Limits::default(), fast());
        for _ in 0..3 {
            r.gw.fail_next(GatewayError::Transient("503".into()));
        }
        let intent = OrderIntent::market("X", Side::Buy, 1, dec!(100));
        let o = r.oms.place("u", intent.clone()).await.unwrap();
        assert_eq!(o.status, OrderStatus::Rejected);
        assert!(o.error.unwrap().contains("503"));
        assert!(r.store.positions().await.unwrap().is_empty());

        // key dilepas: intent sama boleh dikirim lagi
        let retry = r.oms.place("u", intent).await.unwrap();
        assert_eq!(retry.status, OrderStatus::Filled);
        assert_ne!(retry.id, o.id);
    }

    #[tokio::test]
    async fn broker_rejection_is_not_retried() {
        let r = rig(Limits::default(), fast());
        r.gw.fail_next(GatewayError::Rejected("margin".into()));
        let o = r.oms.place("u", OrderIntent::market("X", Side::Buy, 1, dec!(100))).await.unwrap();
        assert_eq!(o.status, OrderStatus::Rejected);
        // retry akan sukses; accepted 0 berarti hanya satu percobaan
        assert_eq!(r.gw.accepted(), 0);
    }

    #[tokio::test]
    async fn slow_gateway_times_out() {
        let cfg = OmsCfg { max_retries: 0, backoff: Duration::from_millis(1), gateway_timeout: Duration::from_millis(20) };
        let r = rig(Limits::default(), cfg);
        r.gw.set_latency(Duration::from_millis(200));
        let o = r.oms.place("u", OrderIntent::market("X", Side::Buy, 1, dec!(100))).await.unwrap();
        assert_eq!(o.status, OrderStatus::Rejected);
        assert!(o.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn risk_rejection_is_typed_but_exits_pass() {
        let limits = Limits { max_orders_per_min: 30, exposure_cap: dec!(500), per_symbol_loss_cap: dec!(2000) };
        let r = rig(limits, fast());
        let err = r.oms.place("u", OrderIntent::market("X", Side::Buy, 10, dec!(100))).await.unwrap_err();
        assert!(matches!(err, OmsError::Risk(RiskRejection::ExposureCap { .. })));
        assert_eq!(r.gw.accepted(), 0);
        let logged = r.store.orders().await.unwrap();
        assert_eq!(logged[0].status, OrderStatus::Rejected);

        let exit = OrderIntent::market("X", Side::Sell, 10, dec!(100)).reduce_only();
        assert_eq!(r.oms.place("u", exit).await.unwrap().status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn limit_orders_modify_and_cancel() {
        let r = rig(Limits::default(), fast());
        let mut intent = OrderIntent::market("X", Side::Buy, 5, dec!(100));
        intent.order_type = OrderType::Limit;
        intent.price = Some(dec!(98));
        let o = r.oms.place("u", intent).await.unwrap();
        assert_eq!(o.status, OrderStatus::Placed);
        let bid = o.broker_order_id.clone().unwrap();

        let changes = OrderChanges { price: Some(dec!(97)), ..OrderChanges::default() };
        let m = r.oms.modify(&bid, changes).await.unwrap().unwrap();
        assert_eq!(m.status, OrderStatus::Modified);
        assert_eq!(m.price, dec!(97));

        let c = r.oms.cancel(&bid).await.unwrap().unwrap();
        assert_eq!(c.status, OrderStatus::Cancelled);

        // broker menolak cancel kedua -> status lokal tidak berubah
        assert!(r.oms.cancel(&bid).await.is_err());
        assert_eq!(r.store.find_order_by_broker_id(&bid).await.unwrap().unwrap().status, OrderStatus::Cancelled);
    }

    #[test]
    fn key_depends_on_intent_fields() {
        let a = OrderIntent::market("X", Side::Buy, 10, dec!(100));
        let mut b = a.clone();
        b.est_price = dec!(101);
        assert_eq!(intent_key(&a), intent_key(&b));
        b.quantity = 11;
        assert_ne!(intent_key(&a), intent_key(&b));
    }
}
