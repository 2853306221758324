// ===============================
// src/gateway.rs (broker seam + paper venue)
// ===============================
use std::{collections::VecDeque, sync::{Arc, Mutex}, time::Duration};

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle, time::sleep};
use tracing::{info, warn};

use crate::config::{Args, BrokerKind};
use crate::domain::{BrokerOrder, BrokerPosition, OrderStatus, OrderType, Position, Side, Tick};
use crate::gateway_kite::KiteGateway;
use crate::gateway_upstox::UpstoxGateway;
use crate::metrics::CONFIG_BROKER;
use crate::positions::net_fill;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    #[error("transient gateway error: {0}")]
    Transient(String),
    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),
    #[error("rejected by broker: {0}")]
    Rejected(String),
    #[error("broker session not authenticated")]
    NotAuthenticated,
}

impl GatewayError {
    /// Network blips and timeouts are worth another attempt; broker
    /// rejections and auth failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transient(_) | GatewayError::Timeout(_))
    }
}

#[derive(Debug, Clone)]
pub struct BrokerOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub order_type: OrderType,
    /// Limit price; `None` for MARKET.
    pub price: Option<Decimal>,
    /// Best known quote at submission.
    pub reference_price: Decimal,
    pub variety: String,
    /// Short client tag derived from the idempotency key.
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerAck {
    pub broker_order_id: String,
    /// Average fill price when the venue reports an immediate fill.
    pub fill_price: Option<Decimal>,
}

#[derive(Debug, Clone, Default)]
pub struct OrderChanges {
    pub quantity: Option<u64>,
    pub price: Option<Decimal>,
    pub order_type: Option<OrderType>,
}

#[async_trait]
pub trait BrokerGateway: Send + Sync {
    fn name(&self) -> &'static str;
    async fn place_order(&self, req: &BrokerOrderRequest) -> Result<BrokerAck, GatewayError>;
    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), GatewayError>;
    async fn modify_order(&self, broker_order_id: &str, changes: &OrderChanges) -> Result<(), GatewayError>;
    async fn positions(&self) -> Result<Vec<BrokerPosition>, GatewayError>;
    async fn orders(&self) -> Result<Vec<BrokerOrder>, GatewayError>;
    async fn is_authenticated(&self) -> bool;
    /// Start the venue's live tick source on `tx`, if it has one.
    fn spawn_ticker(&self, symbols: &[String], tx: broadcast::Sender<Tick>) -> Option<JoinHandle<()>>;
}

/// Pick the venue once at startup.
pub fn from_config(args: &Args, timeout: Duration) -> Arc<dyn BrokerGateway> {
    CONFIG_BROKER.with_label_values(&[args.broker.as_str()]).set(1);
    match args.broker {
        BrokerKind::Paper => Arc::new(PaperGateway::new()),
        BrokerKind::Zerodha => Arc::new(KiteGateway::new(args.kite.clone(), timeout)),
        BrokerKind::Upstox => Arc::new(UpstoxGateway::new(args.upstox.clone(), timeout)),
    }
}

/// Map an HTTP failure onto the retry taxonomy.
pub(crate) fn http_error(status: u16, body: &str) -> GatewayError {
    let msg = format!("http {status}: {}", body.chars().take(300).collect::<String>());
    match status {
        401 | 403 => GatewayError::NotAuthenticated,
        408 | 429 | 500..=599 => GatewayError::Transient(msg),
        _ => GatewayError::Rejected(msg),
    }
}

/// Transport-level failures (connect, reset, client timeout) are transient.
pub(crate) fn net_error(e: reqwest::Error) -> GatewayError {
    GatewayError::Transient(e.to_string())
}

// ======================= paper venue =======================

#[derive(Debug, Default)]
struct PaperBook {
    next_id: u64,
    orders: Vec<BrokerOrder>,
    positions: HashMap<String, Position>,
    faults: VecDeque<GatewayError>,
    accepted: usize,
    latency: Duration,
    logged_out: bool,
}

/// In-process simulated broker with its own order/position truth.
/// MARKET orders fill immediately at the reference price; LIMIT orders rest
/// as open orders.
#[derive(Debug, Default)]
pub struct PaperGateway {
    book: Mutex<PaperBook>,
}

impl PaperGateway {
    pub fn new() -> Self { Self::default() }

    fn book(&self) -> std::sync::MutexGuard<'_, PaperBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next call to `place_order`/`cancel_order`/`modify_order` with `err`.
    pub fn fail_next(&self, err: GatewayError) { self.book().faults.push_back(err); }

    /// Delay every order call by `d`.
    pub fn set_latency(&self, d: Duration) { self.book().latency = d; }

    pub fn set_authenticated(&self, ok: bool) { self.book().logged_out = !ok; }

    /// Orders the venue accepted.
    pub fn accepted(&self) -> usize { self.book().accepted }

    async fn enter(&self) -> Result<(), GatewayError> {
        let latency = self.book().latency;
        if !latency.is_zero() {
            sleep(latency).await;
        }
        let mut b = self.book();
        if b.logged_out {
            return Err(GatewayError::NotAuthenticated);
        }
        match b.faults.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn seed_price(symbol: &str) -> Decimal {
    Decimal::from(500 + symbol.bytes().map(u64::from).sum::<u64>() % 2500)
}

#[async_trait]
impl BrokerGateway for PaperGateway {
    fn name(&self) -> &'static str { "paper" }

    async fn place_order(&self, req: &BrokerOrderRequest) -> Result<BrokerAck, GatewayError> {
        self.enter().await?;
        if req.quantity == 0 {
            return Err(GatewayError::Rejected("quantity must be positive".into()));
        }
        let px = req.price.unwrap_or(req.reference_price);
        if px <= Decimal::ZERO {
            return Err(GatewayError::Rejected("no price".into()));
        }

        let mut b = self.book();
        b.next_id += 1;
        b.accepted += 1;
        let id = format!("PAPER-{}", b.next_id);
        let now = Utc::now();
        let status = match req.order_type {
            OrderType::Market => OrderStatus::Filled,
            OrderType::Limit => OrderStatus::Placed,
        };
        if status == OrderStatus::Filled {
            let out = net_fill(b.positions.get(&req.symbol), &req.symbol, req.side, req.quantity, px, now);
            match out.position {
                Some(p) => { b.positions.insert(req.symbol.clone(), p); }
                None => { b.positions.remove(&req.symbol); }
            }
        }
        b.orders.push(BrokerOrder {
            broker_order_id: id.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            quantity: req.quantity,
            price: px,
            status,
            created_at: now,
        });
        info!(broker_order_id = %id, symbol = %req.symbol, side = req.side.as_str(), qty = req.quantity, %px, "paper: order accepted");
        let fill_price = (status == OrderStatus::Filled).then_some(px);
        Ok(BrokerAck { broker_order_id: id, fill_price })
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), GatewayError> {
        self.enter().await?;
        let mut b = self.book();
        let o = b
            .orders
            .iter_mut()
            .find(|o| o.broker_order_id == broker_order_id)
            .ok_or_else(|| GatewayError::Rejected(format!("unknown order {broker_order_id}")))?;
        if o.status != OrderStatus::Placed {
            return Err(GatewayError::Rejected(format!("order {broker_order_id} is not open")));
        }
        o.status = OrderStatus::Cancelled;
        Ok(())
    }

    async fn modify_order(&self, broker_order_id: &str, changes: &OrderChanges) -> Result<(), GatewayError> {
        self.enter().await?;
        let mut b = self.book();
        let o = b
            .orders
            .iter_mut()
            .find(|o| o.broker_order_id == broker_order_id)
            .ok_or_else(|| GatewayError::Rejected(format!("unknown order {broker_order_id}")))?;
        if o.status != OrderStatus::Placed {
            return Err(GatewayError::Rejected(format!("order {broker_order_id} is not open")));
        }
        if let Some(q) = changes.quantity { o.quantity = q; }
        if let Some(p) = changes.price { o.price = p; }
        Ok(())
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, GatewayError> {
        let b = self.book();
        Ok(b.positions
            .values()
            .map(|p| BrokerPosition {
                symbol: p.symbol.clone(),
                side: p.side,
                quantity: p.quantity,
                average_price: p.average_price,
                pnl: None,
            })
            .collect())
    }

    async fn orders(&self) -> Result<Vec<BrokerOrder>, GatewayError> {
        Ok(self.book().orders.clone())
    }

    async fn is_authenticated(&self) -> bool { !self.book().logged_out }

    fn spawn_ticker(&self, symbols: &[String], tx: broadcast::Sender<Tick>) -> Option<JoinHandle<()>> {
        if symbols.is_empty() {
            warn!("paper: no symbols, mock feed not started");
            return None;
        }
        let feeds: Vec<_> = symbols
            .iter()
            .map(|s| crate::feed::run_mock(tx.clone(), s.clone(), seed_price(s), Duration::from_millis(500)))
            .collect();
        Some(tokio::spawn(async move {
            futures_util::future::join_all(feeds).await;
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PositionSide;
    use rust_decimal_macros::dec;

    fn req(side: Side, qty: u64, order_type: OrderType) -> BrokerOrderRequest {
        BrokerOrderRequest {
            symbol: "X".into(),
            side,
            quantity: qty,
            order_type,
            price: (order_type == OrderType::Limit).then_some(dec!(99)),
            reference_price: dec!(100),
            variety: "regular".into(),
            tag: "t".into(),
        }
    }

    #[tokio::test]
    async fn market_orders_fill_into_positions() {
        let gw = PaperGateway::new();
        let ack = gw.place_order(&req(Side::Buy, 10, OrderType::Market)).await.unwrap();
        assert_eq!(ack.fill_price, Some(dec!(100)));
        let pos = gw.positions().await.unwrap();
        assert_eq!(pos.len(), 1);
        assert_eq!(pos[0].side, PositionSide::Long);
        assert_eq!(pos[0].quantity, 10);

        gw.place_order(&req(Side::Sell, 10, OrderType::Market)).await.unwrap();
        assert!(gw.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn limit_orders_rest_and_cancel() {
        let gw = PaperGateway::new();
        let ack = gw.place_order(&req(Side::Buy, 5, OrderType::Limit)).await.unwrap();
        assert_eq!(ack.fill_price, None);
        let changes = OrderChanges { quantity: Some(7), ..OrderChanges::default() };
        gw.modify_order(&ack.broker_order_id, &changes).await.unwrap();
        gw.cancel_order(&ack.broker_order_id).await.unwrap();
        let err = gw.cancel_order(&ack.broker_order_id).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)));
        let orders = gw.orders().await.unwrap();
        assert_eq!(orders[0].quantity, 7);
        assert_eq!(orders[0].status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let gw = PaperGateway::new();
        gw.fail_next(GatewayError::Transient("blip".into()));
        assert!(gw.place_order(&req(Side::Buy, 1, OrderType::Market)).await.is_err());
        assert!(gw.place_order(&req(Side::Buy, 1, OrderType::Market)).await.is_ok());
        assert_eq!(gw.accepted(), 1);
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(http_error(403, "TokenException"), GatewayError::NotAuthenticated);
        assert!(http_error(503, "").is_retryable());
        assert!(http_error(429, "").is_retryable());
        assert!(matches!(http_error(400, "InputException"), GatewayError::Rejected(_)));
    }

    #[test]
    fn retryable_classification() {
        assert!(GatewayError::Transient("x".into()).is_retryable());
        assert!(GatewayError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!GatewayError::Rejected("x".into()).is_retryable());
        assert!(!GatewayError::NotAuthenticated.is_retryable());
    }
}
