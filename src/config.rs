// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : autotrade_rust — intraday auto-trading controller in Rust
Module  : config.rs
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
use std::{env, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use clap::Parser;
use dotenvy::dotenv;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;

use crate::clock::{offset_minutes, parse_hhmm, MarketHours};

/// CLI overlay di atas ENV. Semua flag opsional.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "autotrade_rust", version, about = "Intraday auto-trading controller")]
pub struct Cli {
    /// Load this file instead of ./.env
    #[arg(long)]
    pub env_file: Option<String>,
    /// paper | zerodha | upstox (overrides BROKER)
    #[arg(long)]
    pub broker: Option<String>,
    /// Treat the market as open regardless of the clock (dev only)
    #[arg(long)]
    pub force_open: bool,
    /// Monitor mode: no market-hours guard, so the engine never starts on its own
    #[arg(long)]
    pub no_autostart: bool,
    /// On Ctrl-C, flatten every open position before exiting
    #[arg(long)]
    pub flatten_on_exit: bool,
    #[arg(long)]
    pub metrics_port: Option<u16>,
}

/// Broker yang dipakai (dipilih sekali saat startup)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerKind {
    Paper,
    Zerodha,
    Upstox,
}

impl BrokerKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paper" | "mock" => Some(BrokerKind::Paper),
            "zerodha" | "kite" => Some(BrokerKind::Zerodha),
            "upstox" => Some(BrokerKind::Upstox),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerKind::Paper => "paper",
            BrokerKind::Zerodha => "zerodha",
            BrokerKind::Upstox => "upstox",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct KiteCreds {
    pub api_key: String,
    pub access_token: String,
    pub rest_url: String,
    pub ws_url: String,
    /// symbol -> instrument token, from KITE_INSTRUMENTS=RELIANCE:738561,TCS:2953217
    pub instruments: Vec<(String, u32)>,
}

#[derive(Clone, Debug, Default)]
pub struct UpstoxCreds {
    pub access_token: String,
    pub rest_url: String,
    /// symbol -> instrument key, from UPSTOX_INSTRUMENTS=RELIANCE:NSE_EQ|INE002A01018
    pub instruments: Vec<(String, String)>,
}

#[derive(Clone, Debug)]
pub struct Args {
    pub broker: BrokerKind,
    pub user_id: String,
    pub symbols: Vec<String>,

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: u16,

    // cadence
    pub tick_every: Duration,
    pub reconcile_every: Duration,
    pub market_guard_every: Duration,
    pub autostart: bool,
    pub flatten_on_exit: bool,
    /// Kill switch state at boot
    pub kill_switch: bool,

    // market window & EOD policy
    pub hours: MarketHours,
    pub must_end_day_profitable: bool,

    // alerts
    pub alert_webhook_url: Option<String>,
    pub alert_webhook_secret: Option<String>,

    // broker credentials
    pub kite: KiteCreds,
    pub upstox: UpstoxCreds,
}

/// Pre-trade limits (process-local, see risk.rs)
#[derive(Clone, Debug)]
pub struct Limits {
    pub max_orders_per_min: u32,
    pub exposure_cap: Decimal,
    pub per_symbol_loss_cap: Decimal,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_orders_per_min: 30, exposure_cap: dec!(1000000), per_symbol_loss_cap: dec!(2000) }
    }
}

/// OMS submission policy.
#[derive(Clone, Debug)]
pub struct OmsCfg {
    pub max_retries: u32,
    pub backoff: Duration,
    pub gateway_timeout: Duration,
}

impl Default for OmsCfg {
    fn default() -> Self {
        Self { max_retries: 2, backoff: Duration::from_millis(300), gateway_timeout: Duration::from_secs(10) }
    }
}

/// Runtime-tunable trading settings.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub capital_per_trade: Decimal,
    pub max_positions: usize,
    pub stop_loss_pct: Decimal,
    pub target_pct: Decimal,
    pub daily_loss_limit: Decimal,
    pub max_capital_usage: Decimal,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            capital_per_trade: dec!(10000),
            max_positions: 5,
            stop_loss_pct: dec!(2),
            target_pct: dec!(5),
            daily_loss_limit: dec!(5000),
            // 0 = mati; buku penuh (capital_per_trade x max_positions) sudah ~50k
            max_capital_usage: Decimal::ZERO,
        }
    }
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn settings(&self) -> Settings;
}

/// In-process settings, seeded from ENV and editable at runtime.
#[derive(Clone, Debug, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<Settings>>,
}

impl SharedSettings {
    pub fn new(s: Settings) -> Self { Self { inner: Arc::new(RwLock::new(s)) } }

    #[cfg(test)]
    pub async fn update<F: FnOnce(&mut Settings)>(&self, f: F) {
        let mut g = self.inner.write().await;
        f(&mut g);
    }
}

#[async_trait]
impl SettingsStore for SharedSettings {
    async fn settings(&self) -> Settings { self.inner.read().await.clone() }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key).unwrap_or_default().trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// "A:1,B:2" -> [(A, "1"), (B, "2")]; malformed pairs skipped.
fn parse_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once(':')?;
            let (k, v) = (k.trim(), v.trim());
            (!k.is_empty() && !v.is_empty()).then(|| (k.to_ascii_uppercase(), v.to_string()))
        })
        .collect()
}

fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_ascii_uppercase())
        .collect()
}

fn env_time(key: &str, default: chrono::NaiveTime) -> chrono::NaiveTime {
    env::var(key).ok().and_then(|s| parse_hhmm(&s)).unwrap_or(default)
}

pub fn load(cli: &Cli) -> (Args, Limits, OmsCfg, Settings) {
    // Pastikan .env dibaca (agar BROKER, SYMBOLS, dll ter-load)
    let _ = match &cli.env_file {
        Some(path) => dotenvy::from_filename(path).map(|_| ()),
        None => dotenv().map(|_| ()),
    };

    // ===== Basic =====
    let broker_raw = cli.broker.clone().or_else(|| env::var("BROKER").ok());
    let broker = broker_raw.as_deref().and_then(BrokerKind::parse).unwrap_or(BrokerKind::Paper);
    let user_id = env::var("USER_ID").unwrap_or_else(|_| "default".to_string());

    let symbols = env::var("SYMBOLS")
        .ok()
        .map(|s| parse_symbols(&s))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| parse_symbols("RELIANCE,TCS,INFY,HDFC,ITC,WIPRO"));

    let record_file = env_opt("RECORD_FILE");
    let metrics_port = cli.metrics_port.unwrap_or_else(|| env_or("METRICS_PORT", 9898));

    // ===== Cadence =====
    let tick_every = Duration::from_millis(env_or("ENGINE_TICK_MS", 3000));
    let reconcile_every = Duration::from_millis(env_or("RECONCILE_MS", 30_000));
    let market_guard_every = Duration::from_millis(env_or("MARKET_GUARD_MS", 30_000));
    let autostart = !cli.no_autostart && env_flag("ENGINE_AUTOSTART", true);
    let flatten_on_exit = cli.flatten_on_exit || env_flag("FLATTEN_ON_EXIT", false);

    // ===== Market window (default NSE, IST) =====
    let d = MarketHours::default();
    let hours = MarketHours {
        offset: offset_minutes(env_or("TZ_OFFSET_MINUTES", 330)),
        open: env_time("MARKET_OPEN", d.open),
        close: env_time("MARKET_CLOSE", d.close),
        eod_start: env_time("EOD_START", d.eod_start),
        derisk_after: env_time("DERISK_AFTER", d.derisk_after),
        hard_cutoff: env_time("EOD_HARD_CUTOFF", d.hard_cutoff),
        force_open: cli.force_open || env_flag("DEV_FORCE_MARKET_OPEN", false),
    };
    let must_end_day_profitable = env_flag("MUST_END_DAY_PROFITABLE", true);

    // ===== Brokers =====
    let kite = KiteCreds {
        api_key: env::var("KITE_API_KEY").unwrap_or_default(),
        access_token: env::var("KITE_ACCESS_TOKEN").unwrap_or_default(),
        rest_url: env::var("KITE_REST_URL").unwrap_or_else(|_| "https://api.kite.trade".to_string()),
        ws_url: env::var("KITE_WS_URL").unwrap_or_else(|_| "wss://ws.kite.trade".to_string()),
        instruments: parse_pairs(&env::var("KITE_INSTRUMENTS").unwrap_or_default())
            .into_iter()
            .filter_map(|(s, t)| t.parse().ok().map(|t| (s, t)))
            .collect(),
    };
    let upstox = UpstoxCreds {
        access_token: env::var("UPSTOX_ACCESS_TOKEN").unwrap_or_default(),
        rest_url: env::var("UPSTOX_REST_URL").unwrap_or_else(|_| "https://api.upstox.com".to_string()),
        instruments: parse_pairs(&env::var("UPSTOX_INSTRUMENTS").unwrap_or_default()),
    };

    let args = Args {
        broker,
        user_id,
        symbols,
        record_file,
        metrics_port,
        tick_every,
        reconcile_every,
        market_guard_every,
        autostart,
        flatten_on_exit,
        kill_switch: env_flag("KILL_SWITCH", false),
        hours,
        must_end_day_profitable,
        alert_webhook_url: env_opt("ALERT_WEBHOOK_URL"),
        alert_webhook_secret: env_opt("ALERT_WEBHOOK_SECRET"),
        kite,
        upstox,
    };

    // ===== Limits =====
    let ld = Limits::default();
    let limits = Limits {
        max_orders_per_min: env_or("RISK_ORDERS_PER_MIN", ld.max_orders_per_min),
        exposure_cap: env_or("RISK_EXPOSURE", ld.exposure_cap),
        per_symbol_loss_cap: env_or("RISK_SYMBOL_LOSS", ld.per_symbol_loss_cap),
    };

    let od = OmsCfg::default();
    let oms = OmsCfg {
        max_retries: env_or("OMS_MAX_RETRIES", od.max_retries),
        backoff: Duration::from_millis(env_or("OMS_BACKOFF_MS", od.backoff.as_millis() as u64)),
        gateway_timeout: Duration::from_millis(env_or("GATEWAY_TIMEOUT_MS", od.gateway_timeout.as_millis() as u64)),
    };

    // ===== Settings (seed) =====
    let sd = Settings::default();
    let settings = Settings {
        capital_per_trade: env_or("CAPITAL_PER_TRADE", sd.capital_per_trade),
        max_positions: env_or("MAX_POSITIONS", sd.max_positions),
        stop_loss_pct: env_or("STOP_LOSS_PCT", sd.stop_loss_pct),
        target_pct: env_or("TARGET_PCT", sd.target_pct),
        daily_loss_limit: env_or("DAILY_LOSS_LIMIT", sd.daily_loss_limit),
        max_capital_usage: env_or("MAX_CAPITAL_USAGE", sd.max_capital_usage),
    };

    (args, limits, oms, settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_names() {
        assert_eq!(BrokerKind::parse(" Kite "), Some(BrokerKind::Zerodha));
        assert_eq!(BrokerKind::parse("upstox"), Some(BrokerKind::Upstox));
        assert_eq!(BrokerKind::parse("binance"), None);
    }

    #[test]
    fn instrument_pairs_skip_garbage() {
        let pairs = parse_pairs("reliance:738561, bad ,TCS:2953217,:1");
        assert_eq!(
            pairs,
            vec![("RELIANCE".to_string(), "738561".to_string()), ("TCS".to_string(), "2953217".to_string())]
        );
        assert_eq!(parse_symbols(" infy, ,tcs"), vec!["INFY", "TCS"]);
    }

    #[tokio::test]
    async fn shared_settings_update_is_visible() {
        let s = SharedSettings::new(Settings::default());
        s.update(|x| x.max_positions = 2).await;
        assert_eq!(s.settings().await.max_positions, 2);
    }
}
