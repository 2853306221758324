// ===============================
// src/store.rs
// ===============================
//
// Position/Order store. Trait di sini adalah seam ke persistence; MemoryStore
// adalah implementasi in-process (tokio RwLock). Setiap mutasi = satu call
// atomik di bawah lock, termasuk read-modify-write posisi saat fill.
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::domain::{EngineRunState, Order, OrderStatus, OrderType, Position, RunStateRow, Side};
use crate::positions::net_fill;

/// Fixed key of the run-state singleton.
pub const RUN_STATE_ID: &str = "engine";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("order {0} not found")]
    OrderNotFound(u64),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub price: Decimal,
    pub order_type: OrderType,
    pub variety: String,
    pub idempotency_key: String,
}

/// Outcome of claiming an idempotency key.
#[derive(Debug, Clone)]
pub enum Claim {
    /// Fresh PENDING row; the caller owns the submission.
    Inserted(Order),
    /// A live (non-rejected) order already holds the key.
    Existing(Order),
}

#[derive(Debug, Clone, Default)]
pub struct OrderPatch {
    pub status: Option<OrderStatus>,
    pub broker_order_id: Option<String>,
    pub error: Option<String>,
    pub price: Option<Decimal>,
    pub quantity: Option<u64>,
    pub realized_pnl: Option<Decimal>,
}

#[derive(Debug, Clone, Default)]
pub struct RunStatePatch {
    pub running: Option<bool>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub eod_done_for: Option<Option<String>>,
}

impl RunStatePatch {
    fn apply(&self, s: &mut EngineRunState) {
        if let Some(r) = self.running { s.running = r; }
        if let Some(t) = self.started_at { s.started_at = t; }
        if let Some(d) = &self.eod_done_for { s.eod_done_for = d.clone(); }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a PENDING order unless a live order already holds the key.
    async fn claim_order(&self, new: NewOrder, now: DateTime<Utc>) -> Result<Claim, StoreError>;
    async fn update_order(&self, id: u64, patch: OrderPatch, now: DateTime<Utc>) -> Result<Order, StoreError>;
    async fn find_order_by_broker_id(&self, broker_order_id: &str) -> Result<Option<Order>, StoreError>;
    /// Overwrite status of the order carrying `broker_order_id`, if known.
    async fn set_order_status_by_broker_id(
        &self,
        broker_order_id: &str,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Order>, StoreError>;
    async fn orders(&self) -> Result<Vec<Order>, StoreError>;
    /// Orders with `from <= created_at < to`, oldest first.
    async fn orders_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Order>, StoreError>;

    async fn positions(&self) -> Result<Vec<Position>, StoreError>;
    async fn position(&self, symbol: &str) -> Result<Option<Position>, StoreError>;
    /// Net a fill into the symbol's position; returns realized P&L.
    async fn apply_fill(
        &self,
        symbol: &str,
        side: Side,
        quantity: u64,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Decimal, StoreError>;
    async fn mark_position(&self, symbol: &str, ltp: Decimal, now: DateTime<Utc>) -> Result<(), StoreError>;

    async fn run_state(&self) -> Result<EngineRunState, StoreError>;
    async fn upsert_run_state(&self, patch: RunStatePatch, now: DateTime<Utc>) -> Result<EngineRunState, StoreError>;
    async fn run_state_rows(&self) -> Result<Vec<RunStateRow>, StoreError>;
    async fn replace_run_state_rows(&self, rows: Vec<RunStateRow>) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct Inner {
    orders: Vec<Order>,
    live_by_key: HashMap<String, u64>,
    by_broker_id: HashMap<String, u64>,
    positions: HashMap<String, Position>,
    run_state: Vec<RunStateRow>,
}

impl Inner {
    fn order_mut(&mut self, id: u64) -> Result<&mut Order, StoreError> {
        id.checked_sub(1)
            .and_then(|i| self.orders.get_mut(i as usize))
            .ok_or(StoreError::OrderNotFound(id))
    }

    fn canonical_state(&self) -> EngineRunState {
        self.run_state
            .iter()
            .find(|r| r.id == RUN_STATE_ID)
            .or_else(|| self.run_state.first())
            .map(|r| r.state.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl Store for MemoryStore {
    async fn claim_order(&self, new: NewOrder, now: DateTime<Utc>) -> Result<Claim, StoreError> {
        let mut g = self.inner.write().await;
        if let Some(id) = g.live_by_key.get(&new.idempotency_key).copied() {
            let existing = g.order_mut(id)?.clone();
            return Ok(Claim::Existing(existing));
        }
        let id = g.orders.len() as u64 + 1;
        let order = Order {
            id,
            user_id: new.user_id,
            symbol: new.symbol,
            side: new.side,
            quantity: new.quantity,
            price: new.price,
            order_type: new.order_type,
            variety: new.variety,
            status: OrderStatus::Pending,
            idempotency_key: new.idempotency_key.clone(),
            broker_order_id: None,
            error: None,
            realized_pnl: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        };
        g.live_by_key.insert(new.idempotency_key, id);
        g.orders.push(order.clone());
        Ok(Claim::Inserted(order))
    }

    async fn update_order(&self, id: u64, patch: OrderPatch, now: DateTime<Utc>) -> Result<Order, StoreError> {
        let mut g = self.inner.write().await;
        let o = g.order_mut(id)?;
        if let Some(s) = patch.status { o.status = s; }
        if let Some(b) = patch.broker_order_id { o.broker_order_id = Some(b); }
        if let Some(e) = patch.error { o.error = Some(e); }
        if let Some(p) = patch.price { o.price = p; }
        if let Some(q) = patch.quantity { o.quantity = q; }
        if let Some(r) = patch.realized_pnl { o.realized_pnl = r; }
        o.updated_at = now;
        let updated = o.clone();

        if updated.status == OrderStatus::Rejected {
            // key dilepas: intent yang sama boleh dicoba lagi
            if g.live_by_key.get(&updated.idempotency_key) == Some(&id) {
                g.live_by_key.remove(&updated.idempotency_key);
            }
        }
        if let Some(b) = &updated.broker_order_id {
            g.by_broker_id.insert(b.clone(), id);
        }
        Ok(updated)
    }

    async fn find_order_by_broker_id(&self, broker_order_id: &str) -> Result<Option<Order>, StoreError> {
        let g = self.inner.read().await;
        Ok(g.by_broker_id
            .get(broker_order_id)
            .and_then(|id| g.orders.get((*id - 1) as usize))
            .cloned())
    }

    async fn set_order_status_by_broker_id(
        &self,
        broker_order_id: &str,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Order>, StoreError> {
        let id = match self.inner.read().await.by_broker_id.get(broker_order_id) {
            Some(id) => *id,
            None => return Ok(None),
        };
        let patch = OrderPatch { status: Some(status), ..OrderPatch::default() };
        self.update_order(id, patch, now).await.map(Some)
    }

    async fn orders(&self) -> Result<Vec<Order>, StoreError> {
        Ok(self.inner.read().await.orders.clone())
    }

    async fn orders_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Order>, StoreError> {
        let g = self.inner.read().await;
        let mut out: Vec<Order> = g
            .orders
            .iter()
            .filter(|o| o.created_at >= from && o.created_at < to)
            .cloned()
            .collect();
        out.sort_by_key(|o| (o.created_at, o.id));
        Ok(out)
    }

    async fn positions(&self) -> Result<Vec<Position>, StoreError> {
        let g = self.inner.read().await;
        let mut out: Vec<Position> = g.positions.values().cloned().collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(out)
    }

    async fn position(&self, symbol: &str) -> Result<Option<Position>, StoreError> {
        Ok(self.inner.read().await.positions.get(symbol).cloned())
    }

    async fn apply_fill(
        &self,
        symbol: &str,
        side: Side,
        quantity: u64,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Decimal, StoreError> {
        let mut g = self.inner.write().await;
        let out = net_fill(g.positions.get(symbol), symbol, side, quantity, price, now);
        match out.position {
            Some(p) => { g.positions.insert(symbol.to_string(), p); }
            None => { g.positions.remove(symbol); }
        }
        Ok(out.realized)
    }

    async fn mark_position(&self, symbol: &str, ltp: Decimal, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut g = self.inner.write().await;
        if let Some(p) = g.positions.get_mut(symbol) {
            p.last_price = ltp;
            p.unrealized_pnl = p.pnl_at(ltp);
            p.updated_at = now;
        }
        Ok(())
    }

    async fn run_state(&self) -> Result<EngineRunState, StoreError> {
        Ok(self.inner.read().await.canonical_state())
    }

    async fn upsert_run_state(&self, patch: RunStatePatch, now: DateTime<Utc>) -> Result<EngineRunState, StoreError> {
        let mut g = self.inner.write().await;
        if let Some(row) = g.run_state.iter_mut().find(|r| r.id == RUN_STATE_ID) {
            patch.apply(&mut row.state);
            row.updated_at = now;
            return Ok(row.state.clone());
        }
        let mut state = g.canonical_state();
        patch.apply(&mut state);
        g.run_state.push(RunStateRow { id: RUN_STATE_ID.to_string(), state: state.clone(), updated_at: now });
        Ok(state)
    }

    async fn run_state_rows(&self) -> Result<Vec<RunStateRow>, StoreError> {
        Ok(self.inner.read().await.run_state.clone())
    }

    async fn replace_run_state_rows(&self, rows: Vec<RunStateRow>) -> Result<(), StoreError> {
        self.inner.write().await.run_state = rows;
        Ok(())
    }
}

/// Collapse run-state rows to the canonical one: the most recently updated
/// row's values under [`RUN_STATE_ID`].
pub fn canonical_run_state(rows: &[RunStateRow], now: DateTime<Utc>) -> RunStateRow {
    rows.iter()
        .max_by_key(|r| r.updated_at)
        .map(|r| RunStateRow { id: RUN_STATE_ID.to_string(), state: r.state.clone(), updated_at: r.updated_at })
        .unwrap_or_else(|| RunStateRow { id: RUN_STATE_ID.to_string(), state: EngineRunState::default(), updated_at: now })
}

/// Startup normalization pass. Returns the number of rows removed.
pub async fn normalize_run_state(store: &dyn Store, now: DateTime<Utc>) -> Result<usize, StoreError> {
    let rows = store.run_state_rows().await?;
    if rows.len() == 1 && rows[0].id == RUN_STATE_ID {
        return Ok(0);
    }
    let canonical = canonical_run_state(&rows, now);
    let removed = rows.len().saturating_sub(1);
    store.replace_run_state_rows(vec![canonical]).await?;
    Ok(removed)
}
