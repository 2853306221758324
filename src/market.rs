// ===============================
// src/market.rs
// ===============================
//
// Market hub: tick -> history per symbol (maks 400 harga) -> snapshot row
// {ltp, change%, signal}. Signal: RSI(14) < 30 BUY, > 70 SELL, selain itu
// tanda histogram MACD(12,26).
//
use std::collections::VecDeque;
use std::sync::RwLock;

use ahash::AHashMap as HashMap;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::domain::{SignalKind, SnapshotRow, Tick};
use crate::metrics::TICKS_BY_SYMBOL;

const HISTORY_CAP: usize = 400;

/// Read side consumed by the engine.
pub trait MarketSnapshot: Send + Sync {
    /// One row per watched symbol that has at least one price.
    fn rows(&self) -> Vec<SnapshotRow>;
    fn ltp(&self, symbol: &str) -> Option<Decimal>;
}

#[derive(Debug, Default)]
struct Series {
    closes: VecDeque<f64>,
    last: Decimal,
    prev: Option<Decimal>,
}

#[derive(Debug)]
pub struct MarketHub {
    symbols: Vec<String>,
    series: RwLock<HashMap<String, Series>>,
}

impl MarketHub {
    pub fn new(symbols: Vec<String>) -> Self {
        Self { symbols, series: RwLock::new(HashMap::new()) }
    }

    pub fn on_tick(&self, tick: &Tick) {
        if tick.last_price <= Decimal::ZERO {
            return;
        }
        let mut g = self.series.write().unwrap_or_else(|e| e.into_inner());
        let s = g.entry(tick.symbol.clone()).or_default();
        if !s.closes.is_empty() {
            s.prev = Some(s.last);
        }
        s.last = tick.last_price;
        s.closes.push_back(tick.last_price.to_f64().unwrap_or(0.0));
        if s.closes.len() > HISTORY_CAP {
            s.closes.pop_front();
        }
    }
}

impl MarketSnapshot for MarketHub {
    fn rows(&self) -> Vec<SnapshotRow> {
        let g = self.series.read().unwrap_or_else(|e| e.into_inner());
        self.symbols
            .iter()
            .filter_map(|sym| {
                let s = g.get(sym)?;
                let change_pct = match s.prev {
                    Some(p) if p > Decimal::ZERO => ((s.last - p) / p * Decimal::ONE_HUNDRED).to_f64().unwrap_or(0.0),
                    _ => 0.0,
                };
                let closes: Vec<f64> = s.closes.iter().copied().collect();
                Some(SnapshotRow { symbol: sym.clone(), last_price: s.last, change_pct, signal: signal_of(&closes) })
            })
            .collect()
    }

    fn ltp(&self, symbol: &str) -> Option<Decimal> {
        let g = self.series.read().unwrap_or_else(|e| e.into_inner());
        g.get(symbol).map(|s| s.last)
    }
}

/// Fold the tick bus into the hub. Lagging means stale ticks were skipped,
/// which is fine for a last-price view.
pub async fn run(hub: std::sync::Arc<MarketHub>, mut rx: broadcast::Receiver<Tick>) {
    info!(symbols = ?hub.symbols, "market hub started");
    loop {
        match rx.recv().await {
            Ok(t) => {
                TICKS_BY_SYMBOL.with_label_values(&[&t.symbol]).inc();
                hub.on_tick(&t);
            }
            Err(RecvError::Lagged(n)) => debug!(skipped = n, "market hub lagged, coalescing"),
            Err(RecvError::Closed) => {
                warn!("tick bus closed, market hub stopped");
                break;
            }
        }
    }
}

// ---------- indicators ----------

pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if closes.len() < period + 1 {
        return 50.0;
    }
    let (mut gains, mut losses) = (0.0, 0.0);
    for w in closes[closes.len() - period - 1..].windows(2) {
        let diff = w[1] - w[0];
        if diff >= 0.0 { gains += diff } else { losses -= diff }
    }
    if gains == 0.0 && losses == 0.0 {
        return 50.0; // flat
    }
    let rs = if losses == 0.0 { 100.0 } else { gains / losses };
    (100.0 - 100.0 / (1.0 + rs)).clamp(0.0, 100.0)
}

fn ema(values: &[f64], period: usize) -> f64 {
    let k = 2.0 / (period as f64 + 1.0);
    let mut it = values.iter();
    let Some(first) = it.next() else { return 0.0 };
    it.fold(*first, |acc, v| v * k + acc * (1.0 - k))
}

/// MACD histogram. The signal line is approximated as 0.7 × MACD, so the
/// histogram carries the MACD's sign. Needs `slow + 9` closes.
pub fn macd_hist(closes: &[f64], fast: usize, slow: usize) -> f64 {
    if closes.len() < slow + 9 {
        return 0.0;
    }
    let macd = ema(&closes[closes.len() - fast..], fast) - ema(&closes[closes.len() - slow..], slow);
    macd - macd * 0.7
}

pub fn signal_of(closes: &[f64]) -> SignalKind {
    let r = rsi(closes, 14).round();
    if r < 30.0 {
        return SignalKind::Buy;
    }
    if r > 70.0 {
        return SignalKind::Sell;
    }
    let h = macd_hist(closes, 12, 26);
    if h > 0.0 {
        SignalKind::Buy
    } else if h < 0.0 {
        SignalKind::Sell
    } else {
        SignalKind::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn tick(sym: &str, px: Decimal) -> Tick { Tick { symbol: sym.into(), last_price: px, ts: Utc::now() } }

    #[test]
    fn rsi_extremes() {
        let up: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let down: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        assert!(rsi(&up, 14) > 70.0);
        assert!(rsi(&down, 14) < 30.0);
        assert_eq!(rsi(&[1.0, 2.0], 14), 50.0);
        assert_eq!(rsi(&[5.0; 20], 14), 50.0);
    }

    #[test]
    fn short_history_holds() {
        assert_eq!(signal_of(&[100.0, 100.0, 100.0]), SignalKind::Hold);
    }

    #[test]
    fn macd_follows_trend_sign() {
        // gentle zig-zag uptrend keeps RSI mid-range while EMAs diverge
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64 * 0.1 + if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        assert!(macd_hist(&closes, 12, 26) > 0.0);
        assert!(macd_hist(&closes[..20], 12, 26) == 0.0);
    }

    #[test]
    fn hub_rows_track_ltp_and_change() {
        let hub = MarketHub::new(vec!["X".into(), "Y".into()]);
        hub.on_tick(&tick("X", dec!(100)));
        hub.on_tick(&tick("X", dec!(102)));
        hub.on_tick(&tick("Z", dec!(1))); // not watched
        let rows = hub.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].last_price, dec!(102));
        assert!((rows[0].change_pct - 2.0).abs() < 1e-9);
        assert_eq!(hub.ltp("X"), Some(dec!(102)));
        assert_eq!(hub.ltp("Y"), None);
    }

    #[test]
    fn history_is_capped() {
        let hub = MarketHub::new(vec!["X".into()]);
        for i in 0..500 {
            hub.on_tick(&tick("X", Decimal::from(100 + i % 3)));
        }
        let g = hub.series.read().unwrap();
        assert_eq!(g.get("X").unwrap().closes.len(), HISTORY_CAP);
    }
}
