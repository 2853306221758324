// ===============================
// src/gateway_upstox.rs
// ===============================
//
// Upstox API v2 (REST). Bearer token; instrument key per symbol dari
// UPSTOX_INSTRUMENTS. Tidak ada WS di sini: LTP di-poll dari
// /v2/market-quote/ltp tiap 1 detik.
//
use std::time::Duration;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::Deserialize;
use serde_json::json;
use tokio::{sync::broadcast, task::JoinHandle, time::{interval, MissedTickBehavior}};
use tracing::{debug, info, warn};

use crate::clock::offset_minutes;
use crate::config::UpstoxCreds;
use crate::domain::{BrokerOrder, BrokerPosition, OrderType, PositionSide, Side, Tick};
use crate::gateway::{http_error, net_error, BrokerAck, BrokerGateway, BrokerOrderRequest, GatewayError, OrderChanges};
use crate::gateway_kite::map_status;
use crate::metrics::TICKS;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    status: String,
    data: Option<T>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PlaceData {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct UpPosition {
    #[serde(default)]
    tradingsymbol: Option<String>,
    #[serde(default)]
    trading_symbol: Option<String>,
    quantity: i64,
    #[serde(default)]
    average_price: Decimal,
    #[serde(default)]
    pnl: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct UpOrder {
    order_id: String,
    #[serde(default)]
    tradingsymbol: Option<String>,
    #[serde(default)]
    trading_symbol: Option<String>,
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

#[derive(Debug, Deserialize)]
struct UpLtp {
    last_price: Decimal,
    instrument_token: String,
}

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, GatewayError> {
    let env: Envelope<T> =
        serde_json::from_str(body).map_err(|e| GatewayError::Transient(format!("upstox: bad payload: {e}")))?;
    if env.status != "success" {
        let msg = env.errors.first().map(|e| e.to_string()).unwrap_or_else(|| "upstox error".into());
        return Err(GatewayError::Rejected(msg));
    }
    env.data.ok_or_else(|| GatewayError::Transient("upstox: empty data".into()))
}

pub fn parse_positions(body: &str) -> Result<Vec<BrokerPosition>, GatewayError> {
    let data: Vec<UpPosition> = decode(body)?;
    Ok(data
        .into_iter()
        .map(|p| BrokerPosition {
            symbol: p.trading_symbol.or(p.tradingsymbol).unwrap_or_default(),
            side: if p.quantity < 0 { PositionSide::Short } else { PositionSide::Long },
            quantity: p.quantity.unsigned_abs(),
            average_price: p.average_price,
            pnl: p.pnl,
        })
        .collect())
}

pub fn parse_orders(body: &str) -> Result<Vec<BrokerOrder>, GatewayError> {
    let data: Vec<UpOrder> = decode(body)?;
    let ist = offset_minutes(330);
    Ok(data
        .into_iter()
        .map(|o| BrokerOrder {
            created_at: o
                .order_timestamp
                .as_deref()
                .and_then(|t| NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S").ok())
                .and_then(|n| n.and_local_timezone(ist).single())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
            side: if o.transaction_type.eq_ignore_ascii_case("SELL") { Side::Sell } else { Side::Buy },
            price: if o.average_price > Decimal::ZERO { o.average_price } else { o.price },
            status: map_status(&o.status),
            broker_order_id: o.order_id,
            symbol: o.trading_symbol.or(o.tradingsymbol).unwrap_or_default(),
            quantity: o.quantity,
        })
        .collect())
}

/// LTP response keyed by "EXCHANGE:SYMBOL"; map back through the
/// instrument key we asked for.
pub fn parse_ltp(body: &str, by_key: &HashMap<String, String>) -> Result<Vec<(String, Decimal)>, GatewayError> {
    let data: std::collections::HashMap<String, UpLtp> = decode(body)?;
    Ok(data
        .into_values()
        .filter_map(|q| by_key.get(&q.instrument_token).map(|s| (s.clone(), q.last_price)))
        .collect())
}

pub struct UpstoxGateway {
    creds: UpstoxCreds,
    http: reqwest::Client,
}

impl UpstoxGateway {
    pub fn new(creds: UpstoxCreds, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { creds, http }
    }

    fn instrument_key(&self, symbol: &str) -> Option<&str> {
        self.creds.instruments.iter().find(|(s, _)| s == symbol).map(|(_, k)| k.as_str())
    }
}

async fn send(token: &str, rb: reqwest::RequestBuilder) -> Result<String, GatewayError> {
    if token.is_empty() {
        return Err(GatewayError::NotAuthenticated);
    }
    let rsp = rb
        .bearer_auth(token)
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(net_error)?;
    let code = rsp.status();
    let body = rsp.text().await.map_err(net_error)?;
    if !code.is_success() {
        return Err(http_error(code.as_u16(), &body));
    }
    Ok(body)
}

fn url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

#[async_trait]
impl BrokerGateway for UpstoxGateway {
    fn name(&self) -> &'static str { "upstox" }

    async fn place_order(&self, req: &BrokerOrderRequest) -> Result<BrokerAck, GatewayError> {
        let key = self
            .instrument_key(&req.symbol)
            .ok_or_else(|| GatewayError::Rejected(format!("no instrument key for {}", req.symbol)))?;
        let price = match req.order_type {
            OrderType::Limit => req.price.unwrap_or(Decimal::ZERO),
            OrderType::Market => Decimal::ZERO,
        };
        let payload = json!({
            "quantity": req.quantity,
            "product": "I",
            "validity": "DAY",
            "price": price.to_f64().unwrap_or(0.0),
            "tag": req.tag.chars().take(20).collect::<String>(),
            "instrument_token": key,
            "order_type": req.order_type.as_str(),
            "transaction_type": req.side.as_str(),
            "disclosed_quantity": 0,
            "trigger_price": 0,
            "is_amo": false
        });
        let rb = self.http.post(url(&self.creds.rest_url, "/v2/order/place")).json(&payload);
        let body = send(&self.creds.access_token, rb).await?;
        let data: PlaceData = decode(&body)?;
        info!(broker_order_id = %data.order_id, symbol = %req.symbol, "upstox: order placed");
        Ok(BrokerAck { broker_order_id: data.order_id, fill_price: None })
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), GatewayError> {
        let rb = self
            .http
            .delete(url(&self.creds.rest_url, "/v2/order/cancel"))
            .query(&[("order_id", broker_order_id)]);
        send(&self.creds.access_token, rb).await.map(|_| ())
    }

    async fn modify_order(&self, broker_order_id: &str, changes: &OrderChanges) -> Result<(), GatewayError> {
        let mut payload = json!({
            "order_id": broker_order_id,
            "validity": "DAY",
            "disclosed_quantity": 0,
            "trigger_price": 0
        });
        if let Some(q) = changes.quantity { payload["quantity"] = json!(q); }
        if let Some(p) = changes.price { payload["price"] = json!(p.to_f64().unwrap_or(0.0)); }
        if let Some(t) = changes.order_type { payload["order_type"] = json!(t.as_str()); }
        let rb = self.http.put(url(&self.creds.rest_url, "/v2/order/modify")).json(&payload);
        send(&self.creds.access_token, rb).await.map(|_| ())
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, GatewayError> {
        let rb = self.http.get(url(&self.creds.rest_url, "/v2/portfolio/short-term-positions"));
        parse_positions(&send(&self.creds.access_token, rb).await?)
    }

    async fn orders(&self) -> Result<Vec<BrokerOrder>, GatewayError> {
        let rb = self.http.get(url(&self.creds.rest_url, "/v2/order/retrieve-all"));
        parse_orders(&send(&self.creds.access_token, rb).await?)
    }

    async fn is_authenticated(&self) -> bool {
        let rb = self.http.get(url(&self.creds.rest_url, "/v2/user/profile"));
        match send(&self.creds.access_token, rb).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "upstox: session check failed");
                false
            }
        }
    }

    fn spawn_ticker(&self, symbols: &[String], tx: broadcast::Sender<Tick>) -> Option<JoinHandle<()>> {
        let by_key: HashMap<String, String> = self
            .creds
            .instruments
            .iter()
            .filter(|(s, _)| symbols.contains(s))
            .map(|(s, k)| (k.clone(), s.clone()))
            .collect();
        if by_key.is_empty() {
            warn!("upstox: no instruments configured (UPSTOX_INSTRUMENTS), ticker idle");
            return None;
        }
        let http = self.http.clone();
        let base = self.creds.rest_url.clone();
        let token = self.creds.access_token.clone();
        let keys = by_key.keys().cloned().collect::<Vec<_>>().join(",");

        Some(tokio::spawn(async move {
            let mut every = interval(Duration::from_secs(1));
            every.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                every.tick().await;
                let rb = http.get(url(&base, "/v2/market-quote/ltp")).query(&[("instrument_key", keys.as_str())]);
                let quotes = match send(&token, rb).await.and_then(|b| parse_ltp(&b, &by_key)) {
                    Ok(q) => q,
                    Err(e) => {
                        debug!(error = %e, "upstox: ltp poll failed");
                        continue;
                    }
                };
                for (symbol, px) in quotes {
                    if px > Decimal::ZERO {
                        let _ = tx.send(Tick { symbol, last_price: px, ts: Utc::now() });
                        TICKS.inc();
                    }
                }
            }
        }))
    }
}
