// ===============================
// src/gateway_kite.rs
// ===============================
//
// Zerodha Kite Connect v3 (REST + ticker WS).
// - Auth header: "Authorization: token api_key:access_token", "X-Kite-Version: 3"
// - Order: POST /orders/{variety} (form), PUT/DELETE /orders/{variety}/{id}
// - Truth: GET /portfolio/positions (net), GET /orders
// - Produk MIS (intraday), exchange NSE.
//
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{info, warn};

use crate::clock::offset_minutes;
use crate::config::KiteCreds;
use crate::domain::{BrokerOrder, BrokerPosition, OrderStatus, OrderType, PositionSide, Side, Tick};
use crate::gateway::{http_error, net_error, BrokerAck, BrokerGateway, BrokerOrderRequest, GatewayError, OrderChanges};

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    status: String,
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaceData {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct PositionsData {
    #[serde(default)]
    net: Vec<KitePosition>,
}

#[derive(Debug, Deserialize)]
struct KitePosition {
    tradingsymbol: String,
    quantity: i64,
    #[serde(default)]
    average_price: Decimal,
    #[serde(default)]
    pnl: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct KiteOrder {
    order_id: String,
    tradingsymbol: String,
    transaction_type: String,
    #[serde(default)]
    quantity: u64,
    #[serde(default)]
    price: Decimal,
    #[serde(default)]
    average_price: Decimal,
    status: String,
    #[serde(default)]
    order_timestamp: Option<String>,
}

pub fn map_status(s: &str) -> OrderStatus {
    match s.trim().to_ascii_uppercase().as_str() {
        "COMPLETE" => OrderStatus::Filled,
        "REJECTED" => OrderStatus::Rejected,
        "CANCELLED" => OrderStatus::Cancelled,
        "MODIFIED" => OrderStatus::Modified,
        // OPEN, TRIGGER PENDING, *_PENDING, PUT ORDER REQ RECEIVED, ...
        _ => OrderStatus::Placed,
    }
}

fn unwrap_envelope<T>(env: Envelope<T>) -> Result<T, GatewayError> {
    if env.status != "success" {
        return Err(GatewayError::Rejected(env.message.unwrap_or_else(|| "kite error".into())));
    }
    env.data.ok_or_else(|| GatewayError::Transient("kite: empty data".into()))
}

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, GatewayError> {
    let env: Envelope<T> =
        serde_json::from_str(body).map_err(|e| GatewayError::Transient(format!("kite: bad payload: {e}")))?;
    unwrap_envelope(env)
}

/// GET /portfolio/positions body -> open positions (flat rows keep their pnl).
pub fn parse_positions(body: &str) -> Result<Vec<BrokerPosition>, GatewayError> {
    let data: PositionsData = decode(body)?;
    Ok(data
        .net
        .into_iter()
        .map(|p| BrokerPosition {
            symbol: p.tradingsymbol,
            side: if p.quantity < 0 { PositionSide::Short } else { PositionSide::Long },
            quantity: p.quantity.unsigned_abs(),
            average_price: p.average_price,
            pnl: p.pnl,
        })
        .collect())
}

pub fn parse_orders(body: &str) -> Result<Vec<BrokerOrder>, GatewayError> {
    let data: Vec<KiteOrder> = decode(body)?;
    let ist = offset_minutes(330);
    Ok(data
        .into_iter()
        .map(|o| {
            let created_at = o
                .order_timestamp
                .as_deref()
                .and_then(|t| NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S").ok())
                .and_then(|n| n.and_local_timezone(ist).single())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            let side = if o.transaction_type.eq_ignore_ascii_case("SELL") { Side::Sell } else { Side::Buy };
            let price = if o.average_price > Decimal::ZERO { o.average_price } else { o.price };
            BrokerOrder {
                broker_order_id: o.order_id,
                symbol: o.tradingsymbol,
                side,
                quantity: o.quantity,
                price,
                status: map_status(&o.status),
                created_at,
            }
        })
        .collect())
}

pub struct KiteGateway {
    creds: KiteCreds,
    http: reqwest::Client,
}

impl KiteGateway {
    pub fn new(creds: KiteCreds, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { creds, http }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.creds.rest_url.trim_end_matches('/'), path)
    }

    fn authed(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        rb.header("X-Kite-Version", "3")
            .header("Authorization", format!("token {}:{}", self.creds.api_key, self.creds.access_token))
    }

    async fn send(&self, rb: reqwest::RequestBuilder) -> Result<String, GatewayError> {
        if self.creds.access_token.is_empty() {
            return Err(GatewayError::NotAuthenticated);
        }
        let rsp = self.authed(rb).send().await.map_err(net_error)?;
        let code = rsp.status();
        let body = rsp.text().await.map_err(net_error)?;
        if !code.is_success() {
            return Err(http_error(code.as_u16(), &body));
        }
        Ok(body)
    }
}

fn form(pairs: &[(&str, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[async_trait]
impl BrokerGateway for KiteGateway {
    fn name(&self) -> &'static str { "zerodha" }

    async fn place_order(&self, req: &BrokerOrderRequest) -> Result<BrokerAck, GatewayError> {
        let mut params = vec![
            ("tradingsymbol", req.symbol.clone()),
            ("exchange", "NSE".to_string()),
            ("transaction_type", req.side.as_str().to_string()),
            ("order_type", req.order_type.as_str().to_string()),
            ("quantity", req.quantity.to_string()),
            ("product", "MIS".to_string()),
            ("validity", "DAY".to_string()),
            ("tag", req.tag.chars().take(20).collect()),
        ];
        if let (OrderType::Limit, Some(px)) = (req.order_type, req.price) {
            params.push(("price", px.to_string()));
        }
        let rb = self
            .http
            .post(self.url(&format!("/orders/{}", req.variety)))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(form(&params));
        let body = self.send(rb).await?;
        let data: PlaceData = decode(&body)?;
        info!(broker_order_id = %data.order_id, symbol = %req.symbol, "kite: order placed");
        // Kite hanya mengembalikan order_id; harga fill datang lewat /orders
        Ok(BrokerAck { broker_order_id: data.order_id, fill_price: None })
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), GatewayError> {
        let rb = self.http.delete(self.url(&format!("/orders/regular/{broker_order_id}")));
        self.send(rb).await.map(|_| ())
    }

    async fn modify_order(&self, broker_order_id: &str, changes: &OrderChanges) -> Result<(), GatewayError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(q) = changes.quantity { params.push(("quantity", q.to_string())); }
        if let Some(p) = changes.price { params.push(("price", p.to_string())); }
        if let Some(t) = changes.order_type { params.push(("order_type", t.as_str().to_string())); }
        let rb = self
            .http
            .put(self.url(&format!("/orders/regular/{broker_order_id}")))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(form(&params));
        self.send(rb).await.map(|_| ())
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, GatewayError> {
        let body = self.send(self.http.get(self.url("/portfolio/positions"))).await?;
        parse_positions(&body)
    }

    async fn orders(&self) -> Result<Vec<BrokerOrder>, GatewayError> {
        let body = self.send(self.http.get(self.url("/orders"))).await?;
        parse_orders(&body)
    }

    async fn is_authenticated(&self) -> bool {
        match self.send(self.http.get(self.url("/user/profile"))).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "kite: session check failed");
                false
            }
        }
    }

    fn spawn_ticker(&self, symbols: &[String], tx: broadcast::Sender<Tick>) -> Option<JoinHandle<()>> {
        let instruments: Vec<(String, u32)> = self
            .creds
            .instruments
            .iter()
            .filter(|(s, _)| symbols.contains(s))
            .cloned()
            .collect();
        Some(tokio::spawn(crate::feed::run_kite(
            tx,
            self.creds.ws_url.clone(),
            self.creds.api_key.clone(),
            self.creds.access_token.clone(),
            instruments,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn status_mapping() {
        assert_eq!(map_status("COMPLETE"), OrderStatus::Filled);
        assert_eq!(map_status("TRIGGER PENDING"), OrderStatus::Placed);
        assert_eq!(map_status("cancelled"), OrderStatus::Cancelled);
        assert_eq!(map_status("REJECTED"), OrderStatus::Rejected);
    }

    #[test]
    fn positions_payload() {
        let body = r#"{"status":"success","data":{"net":[
            {"tradingsymbol":"INFY","quantity":-10,"average_price":1500.5,"pnl":-25.0},
            {"tradingsymbol":"TCS","quantity":5,"average_price":3800,"pnl":12.5}
        ],"day":[]}}"#;
        let ps = parse_positions(body).unwrap();
        assert_eq!(ps.len(), 2);
        assert_eq!(ps[0].side, PositionSide::Short);
        assert_eq!(ps[0].quantity, 10);
        assert_eq!(ps[0].average_price, dec!(1500.5));
        assert_eq!(ps[1].pnl, Some(dec!(12.5)));
    }

    #[test]
    fn orders_payload_and_error_envelope() {
        let body = r#"{"status":"success","data":[
            {"order_id":"230101000001","tradingsymbol":"ITC","transaction_type":"SELL","quantity":3,
             "price":0,"average_price":450.25,"status":"COMPLETE","order_timestamp":"2024-01-01 09:20:00"}
        ]}"#;
        let os = parse_orders(body).unwrap();
        assert_eq!(os[0].side, Side::Sell);
        assert_eq!(os[0].price, dec!(450.25));
        assert_eq!(os[0].status, OrderStatus::Filled);
        assert_eq!(os[0].created_at.to_rfc3339(), "2024-01-01T03:50:00+00:00");

        let err = parse_orders(r#"{"status":"error","message":"Invalid token","error_type":"TokenException"}"#).unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)));
    }
}
