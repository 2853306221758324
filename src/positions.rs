// ===============================
// src/positions.rs (netting & PnL)
// ===============================
//
// Logika posisi murni (tanpa I/O): fill -> posisi baru + realized PnL,
// replay order FILLED hari ini untuk realized harian, dan agregat
// unrealized / capital-in-use. Store memanggil net_fill di bawah lock-nya.
//
use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::{Order, OrderStatus, Position, Side};

/// Result of applying one fill to the current position of a symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct FillOutcome {
    /// `None` means the position is now flat and must be deleted.
    pub position: Option<Position>,
    pub realized: Decimal,
}

pub fn net_fill(
    existing: Option<&Position>,
    symbol: &str,
    side: Side,
    quantity: u64,
    price: Decimal,
    now: DateTime<Utc>,
) -> FillOutcome {
    let Some(p) = existing else {
        return FillOutcome { position: open(symbol, side, quantity, price, now), realized: Decimal::ZERO };
    };
    if quantity == 0 {
        return FillOutcome { position: Some(p.clone()), realized: Decimal::ZERO };
    }

    if side.opens() == p.side {
        // arah sama -> average in
        let total = p.quantity + quantity;
        let avg = (p.average_price * Decimal::from(p.quantity) + price * Decimal::from(quantity))
            / Decimal::from(total);
        let mut next = p.clone();
        next.quantity = total;
        next.average_price = avg;
        next.unrealized_pnl = next.pnl_at(next.last_price);
        next.updated_at = now;
        return FillOutcome { position: Some(next), realized: Decimal::ZERO };
    }

    // arah berlawanan -> realize
    let closed = quantity.min(p.quantity);
    let realized = (price - p.average_price) * p.side.sign() * Decimal::from(closed);
    let left_in_position = p.quantity - closed;
    let left_in_fill = quantity - closed;

    let position = if left_in_position > 0 {
        let mut next = p.clone();
        next.quantity = left_in_position;
        next.unrealized_pnl = next.pnl_at(next.last_price);
        next.updated_at = now;
        Some(next)
    } else if left_in_fill > 0 {
        // flip
        open(symbol, side, left_in_fill, price, now)
    } else {
        None
    };
    FillOutcome { position, realized }
}

fn open(symbol: &str, side: Side, quantity: u64, price: Decimal, now: DateTime<Utc>) -> Option<Position> {
    (quantity > 0).then(|| Position {
        symbol: symbol.to_string(),
        side: side.opens(),
        quantity,
        average_price: price,
        last_price: price,
        unrealized_pnl: Decimal::ZERO,
        updated_at: now,
    })
}

/// Realized P&L from replaying FILLED orders through a per-symbol book,
/// in creation order. Non-filled orders are ignored.
pub fn realized_from_orders(orders: &[Order]) -> Decimal {
    let mut filled: Vec<&Order> = orders.iter().filter(|o| o.status == OrderStatus::Filled).collect();
    filled.sort_by_key(|o| (o.created_at, o.id));

    let mut book: HashMap<&str, Position> = HashMap::new();
    let mut realized = Decimal::ZERO;
    for o in filled {
        if o.quantity == 0 {
            continue;
        }
        let out = net_fill(book.get(o.symbol.as_str()), &o.symbol, o.side, o.quantity, o.price, o.updated_at);
        realized += out.realized;
        match out.position {
            Some(p) => { book.insert(o.symbol.as_str(), p); }
            None => { book.remove(o.symbol.as_str()); }
        }
    }
    realized.round_dp(2)
}

/// Mark used for a position: live LTP when known, else the stored mark.
pub fn mark_of(p: &Position, ltp: Option<Decimal>) -> Decimal {
    ltp.filter(|px| *px > Decimal::ZERO).unwrap_or(if p.last_price > Decimal::ZERO { p.last_price } else { p.average_price })
}

pub fn unrealized_total<F>(positions: &[Position], ltp: F) -> Decimal
where
    F: Fn(&str) -> Option<Decimal>,
{
    positions.iter().map(|p| p.pnl_at(mark_of(p, ltp(&p.symbol)))).sum::<Decimal>().round_dp(2)
}

/// Σ quantity × mark over open positions.
pub fn capital_in_use<F>(positions: &[Position], ltp: F) -> Decimal
where
    F: Fn(&str) -> Option<Decimal>,
{
    positions.iter().map(|p| mark_of(p, ltp(&p.symbol)) * Decimal::from(p.quantity)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderType, PositionSide};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 1, 1, 4, 0, 0).unwrap() }

    fn long(qty: u64, avg: Decimal) -> Position {
        Position {
            symbol: "X".into(),
            side: PositionSide::Long,
            quantity: qty,
            average_price: avg,
            last_price: avg,
            unrealized_pnl: Decimal::ZERO,
            updated_at: t0(),
        }
    }

    #[test]
    fn opens_from_flat() {
        let out = net_fill(None, "X", Side::Sell, 5, dec!(100), t0());
        let p = out.position.unwrap();
        assert_eq!(p.side, PositionSide::Short);
        assert_eq!(p.quantity, 5);
        assert_eq!(out.realized, Decimal::ZERO);
    }

    #[test]
    fn same_side_reaverages() {
        let out = net_fill(Some(&long(10, dec!(100))), "X", Side::Buy, 10, dec!(110), t0());
        let p = out.position.unwrap();
        assert_eq!(p.quantity, 20);
        assert_eq!(p.average_price, dec!(105));
    }

    #[test]
    fn partial_close_keeps_average() {
        let out = net_fill(Some(&long(10, dec!(100))), "X", Side::Sell, 4, dec!(90), t0());
        let p = out.position.unwrap();
        assert_eq!(p.quantity, 6);
        assert_eq!(p.average_price, dec!(100));
        assert_eq!(out.realized, dec!(-40));
    }

    #[test]
    fn full_close_deletes() {
        let out = net_fill(Some(&long(10, dec!(100))), "X", Side::Sell, 10, dec!(103), t0());
        assert!(out.position.is_none());
        assert_eq!(out.realized, dec!(30));
    }

    #[test]
    fn oversized_exit_flips() {
        let out = net_fill(Some(&long(10, dec!(100))), "X", Side::Sell, 15, dec!(101), t0());
        let p = out.position.unwrap();
        assert_eq!(p.side, PositionSide::Short);
        assert_eq!(p.quantity, 5);
        assert_eq!(p.average_price, dec!(101));
        assert_eq!(out.realized, dec!(10));
    }

    fn order(id: u64, side: Side, qty: u64, px: Decimal, status: OrderStatus, minutes: i64) -> Order {
        let ts = t0() + Duration::minutes(minutes);
        Order {
            id,
            user_id: "default".into(),
            symbol: "X".into(),
            side,
            quantity: qty,
            price: px,
            order_type: OrderType::Market,
            variety: "regular".into(),
            status,
            idempotency_key: format!("k{id}"),
            broker_order_id: None,
            error: None,
            realized_pnl: Decimal::ZERO,
            created_at: ts,
            updated_at: ts,
        }
    }

    #[test]
    fn replay_only_counts_filled_orders() {
        let orders = vec![
            order(1, Side::Buy, 10, dec!(100), OrderStatus::Filled, 0),
            order(2, Side::Sell, 10, dec!(50), OrderStatus::Rejected, 1),
            order(3, Side::Sell, 4, dec!(105), OrderStatus::Filled, 2),
            order(4, Side::Sell, 6, dec!(98), OrderStatus::Filled, 3),
        ];
        // +20 on 4 shares, -12 on 6 shares
        assert_eq!(realized_from_orders(&orders), dec!(8));
    }

    #[test]
    fn aggregates_use_live_mark() {
        let ps = vec![long(10, dec!(100))];
        assert_eq!(unrealized_total(&ps, |_| Some(dec!(95))), dec!(-50));
        assert_eq!(capital_in_use(&ps, |_| Some(dec!(95))), dec!(950));
        // no quote -> stored mark
        assert_eq!(unrealized_total(&ps, |_| None), Decimal::ZERO);
    }
}
