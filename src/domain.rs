// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side { Buy, Sell }
impl Side {
    pub fn sign(&self) -> i64 { match self { Side::Buy => 1, Side::Sell => -1 } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }
    /// Side a fresh fill opens when there is no position yet.
    pub fn opens(&self) -> PositionSide { match self { Side::Buy => PositionSide::Long, Side::Sell => PositionSide::Short } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide { Long, Short }
impl PositionSide {
    /// Order side that reduces this position.
    pub fn exit_side(&self) -> Side { match self { PositionSide::Long => Side::Sell, PositionSide::Short => Side::Buy } }
    pub fn sign(&self) -> Decimal { match self { PositionSide::Long => Decimal::ONE, PositionSide::Short => Decimal::NEGATIVE_ONE } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType { Market, Limit }
impl OrderType {
    pub fn as_str(&self) -> &'static str { match self { OrderType::Market => "MARKET", OrderType::Limit => "LIMIT" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus { Pending, Placed, Filled, Rejected, Cancelled, Modified }
impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Placed => "placed",
            OrderStatus::Filled => "filled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Modified => "modified",
        }
    }
}

/// What a caller wants traded. `price` is the limit price (None for MARKET),
/// `est_price` is the best-known quote used for risk and local booking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub est_price: Decimal,
    pub variety: String,
    pub idempotency_key: Option<String>,
    /// Exits / flattens only shrink exposure and skip the pre-trade gate.
    pub reduce_only: bool,
}

impl OrderIntent {
    pub fn market(symbol: &str, side: Side, quantity: u64, est_price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            quantity,
            order_type: OrderType::Market,
            price: None,
            est_price,
            variety: "regular".to_string(),
            idempotency_key: None,
            reduce_only: false,
        }
    }

    pub fn reduce_only(mut self) -> Self { self.reduce_only = true; self }
    pub fn with_key(mut self, key: String) -> Self { self.idempotency_key = Some(key); self }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub price: Decimal,
    pub order_type: OrderType,
    pub variety: String,
    pub status: OrderStatus,
    pub idempotency_key: String,
    pub broker_order_id: Option<String>,
    pub error: Option<String>,
    pub realized_pnl: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: u64,
    pub average_price: Decimal,
    pub last_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Gain per share at `ltp`, signed by side (negative = losing).
    pub fn per_share_pnl(&self, ltp: Decimal) -> Decimal {
        (ltp - self.average_price) * self.side.sign()
    }
    pub fn pnl_at(&self, ltp: Decimal) -> Decimal {
        self.per_share_pnl(ltp) * Decimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineRunState {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub eod_done_for: Option<String>,
}

/// Physical row behind the run-state singleton. `id` is fixed to
/// [`crate::store::RUN_STATE_ID`] in a healthy store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStateRow { pub id: String, pub state: EngineRunState, pub updated_at: DateTime<Utc> }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick { pub symbol: String, pub last_price: Decimal, pub ts: DateTime<Utc> }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind { Buy, Sell, Hold }
impl SignalKind {
    pub fn side(&self) -> Option<Side> {
        match self { SignalKind::Buy => Some(Side::Buy), SignalKind::Sell => Some(Side::Sell), SignalKind::Hold => None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRow { pub symbol: String, pub last_price: Decimal, pub change_pct: f64, pub signal: SignalKind }

// Broker-side truth
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition { pub symbol: String, pub side: PositionSide, pub quantity: u64, pub average_price: Decimal, pub pnl: Option<Decimal> }
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder { pub broker_order_id: String, pub symbol: String, pub side: Side, pub quantity: u64, pub price: Decimal, pub status: OrderStatus, pub created_at: DateTime<Utc> }

/// Journal entries (see recorder.rs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Order(Order),
    Fill { symbol: String, side: Side, quantity: u64, price: Decimal, realized: Decimal, ts: DateTime<Utc> },
    RunState(EngineRunState),
    Note(String),
}
