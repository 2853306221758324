// ===============================
// src/notify.rs
// ===============================
//
// Notification sink: alert (drift, EOD belum flat), risk halt, laporan EOD.
// Sink tidak pernah menggagalkan caller; error pengiriman cukup di-log.
//
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::domain::Event;
use crate::metrics::ALERTS;
use crate::recorder::Journal;
use crate::signing::hmac_sha256_hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EodReport {
    pub day: String,
    pub net: Decimal,
    pub realized: Decimal,
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Alert { level: AlertLevel, title: String, detail: String },
    RiskHalt { reason: String, net: Decimal, capital_in_use: Decimal },
    EodReport(EodReport),
}

impl Notification {
    pub fn alert(level: AlertLevel, title: impl Into<String>, detail: impl Into<String>) -> Self {
        Notification::Alert { level, title: title.into(), detail: detail.into() }
    }

    pub fn level(&self) -> AlertLevel {
        match self {
            Notification::Alert { level, .. } => *level,
            Notification::RiskHalt { .. } => AlertLevel::Critical,
            Notification::EodReport(_) => AlertLevel::Info,
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, n: Notification);
}

/// tracing output, level follows the notification.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, n: Notification) {
        ALERTS.with_label_values(&[n.level().as_str()]).inc();
        match &n {
            Notification::Alert { level: AlertLevel::Critical, title, detail } => error!(%title, %detail, "ALERT"),
            Notification::Alert { level: AlertLevel::Warning, title, detail } => warn!(%title, %detail, "ALERT"),
            Notification::Alert { title, detail, .. } => info!(%title, %detail, "alert"),
            Notification::RiskHalt { reason, net, capital_in_use } => {
                error!(%reason, %net, %capital_in_use, "RISK HALT: flattened and stopped")
            }
            Notification::EodReport(r) => {
                info!(day = %r.day, net = %r.net, realized = %r.realized, trades = r.trades, wins = r.wins, losses = r.losses, "EOD report")
            }
        }
    }
}

/// Journal every notification as a JSON note.
#[derive(Debug, Clone)]
pub struct RecorderSink {
    journal: Journal,
}

impl RecorderSink {
    pub fn new(journal: Journal) -> Self { Self { journal } }
}

#[async_trait]
impl NotificationSink for RecorderSink {
    async fn notify(&self, n: Notification) {
        if let Ok(s) = serde_json::to_string(&n) {
            self.journal.record(Event::Note(s));
        }
    }
}

/// JSON POST; `X-Signature` = hex HMAC-SHA256 of the body when a secret is set.
pub struct WebhookSink {
    url: String,
    secret: Option<String>,
    http: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: String, secret: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { url, secret, http }
    }

    /// Body and optional signature header value for `n`.
    pub fn sign(&self, n: &Notification) -> Option<(Vec<u8>, Option<String>)> {
        let body = serde_json::to_vec(n).ok()?;
        let sig = self.secret.as_deref().and_then(|s| hmac_sha256_hex(s, &body));
        Some((body, sig))
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, n: Notification) {
        let Some((body, sig)) = self.sign(&n) else {
            error!("webhook: serialize failed");
            return;
        };
        let mut rb = self.http.post(&self.url).header("Content-Type", "application/json").body(body);
        if let Some(sig) = sig {
            rb = rb.header("X-Signature", sig);
        }
        match rb.send().await {
            Ok(rsp) if rsp.status().is_success() => {}
            Ok(rsp) => warn!(status = %rsp.status(), "webhook: non-success response"),
            Err(e) => warn!(?e, "webhook: send failed"),
        }
    }
}

/// Fan out to every sink in order.
#[derive(Default)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl CompositeSink {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl NotificationSink for CompositeSink {
    async fn notify(&self, n: Notification) {
        for s in &self.sinks {
            s.notify(n.clone()).await;
        }
    }
}
