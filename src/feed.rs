// ===============================
// src/feed.rs
// ===============================
//
// Market Data adapters (semua publish ke broadcast<Tick>):
// - run_mock : random-walk generator per symbol (paper trading / dev)
// - run_kite : Zerodha Kite ticker WS, mode "ltp" (paket biner 8 byte)
//
// Notes:
// - Broadcast = coalescing: subscriber yang lambat melewati tick basi
//   (RecvError::Lagged), tidak ada buffer tak terbatas.
// - Harga Kite dalam paise (int32) -> Decimal 2 desimal.
//
use chrono::Utc;
use futures_util::{SinkExt, StreamExt}; // for .next() / .send()
use rand::Rng;
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::{sync::broadcast, time::sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};
use url::Url;

use crate::domain::Tick;
use crate::metrics::{FEED_CONNECTED, FEED_RECONNECTS, TICKS};

/// Random walk around `start` (±5 bps per step), one tick per `every`.
pub async fn run_mock(md_tx: broadcast::Sender<Tick>, symbol: String, start: Decimal, every: Duration) {
    let floor = start / Decimal::TWO;
    let mut px = start;
    loop {
        // jangan simpan ThreadRng melewati .await
        let bps: i64 = rand::thread_rng().gen_range(-5..=5);
        px = (px + px * Decimal::new(bps, 4)).round_dp(2).max(floor);
        let _ = md_tx.send(Tick { symbol: symbol.clone(), last_price: px, ts: Utc::now() });
        TICKS.inc();
        sleep(every).await;
    }
}

/// Decode a Kite binary frame into (instrument_token, ltp in paise).
/// Layout: u16 packet count, then per packet u16 length + payload; the
/// first 8 payload bytes are token (i32) and last price (i32), big endian.
/// Single-byte heartbeats and truncated frames yield nothing.
pub fn parse_ltp_packets(buf: &[u8]) -> Vec<(u32, i64)> {
    let mut out = Vec::new();
    if buf.len() < 2 {
        return out;
    }
    let count = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let mut at = 2usize;
    for _ in 0..count {
        let Some(len_bytes) = buf.get(at..at + 2) else { break };
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        at += 2;
        let Some(pkt) = buf.get(at..at + len) else { break };
        at += len;
        if pkt.len() < 8 {
            continue;
        }
        let token = u32::from_be_bytes([pkt[0], pkt[1], pkt[2], pkt[3]]);
        let ltp = i32::from_be_bytes([pkt[4], pkt[5], pkt[6], pkt[7]]) as i64;
        out.push((token, ltp));
    }
    out
}

/// Adapter ke Kite ticker WS (read-only) untuk LTP.
///
/// - `instruments`: pasangan (symbol, instrument_token) dari KITE_INSTRUMENTS
/// - subscribe + set mode "ltp" setelah connect
/// - reconnect dengan exponential backoff + jitter
pub async fn run_kite(
    md_tx: broadcast::Sender<Tick>,
    ws_base: String,
    api_key: String,
    access_token: String,
    instruments: Vec<(String, u32)>,
) {
    if instruments.is_empty() {
        warn!("kite feed: no instruments configured (KITE_INSTRUMENTS), feed idle");
        return;
    }
    let tokens: Vec<u32> = instruments.iter().map(|(_, t)| *t).collect();
    let by_token: ahash::AHashMap<u32, String> = instruments.iter().map(|(s, t)| (*t, s.clone())).collect();

    let ws_url = format!(
        "{}?api_key={}&access_token={}",
        ws_base.trim_end_matches('/'),
        urlencoding::encode(&api_key),
        urlencoding::encode(&access_token)
    );

    let mut attempt: u32 = 0;
    loop {
        let url = match Url::parse(&ws_url) {
            Ok(u) => u,
            Err(e) => {
                error!(?e, "kite feed: bad ws url");
                return;
            }
        };

        info!(base = %ws_base, instruments = tokens.len(), "connecting kite ticker");
        match connect_async(url).await {
            Ok((mut ws, _resp)) => {
                info!("kite ticker connected");
                FEED_CONNECTED.with_label_values(&["kite"]).set(1);
                attempt = 0; // reset backoff

                let subscribe = serde_json::json!({ "a": "subscribe", "v": tokens });
                let mode = serde_json::json!({ "a": "mode", "v": ["ltp", tokens] });
                for msg in [subscribe, mode] {
                    if let Err(e) = ws.send(Message::Text(msg.to_string())).await {
                        warn!(?e, "kite feed: subscribe send failed");
                    }
                }

                while let Some(frame) = ws.next().await {
                    match frame {
                        Ok(Message::Binary(bytes)) => {
                            for (token, paise) in parse_ltp_packets(&bytes) {
                                let Some(symbol) = by_token.get(&token) else { continue };
                                if paise <= 0 {
                                    continue;
                                }
                                let tick = Tick { symbol: symbol.clone(), last_price: Decimal::new(paise, 2), ts: Utc::now() };
                                let _ = md_tx.send(tick);
                                TICKS.inc();
                            }
                        }
                        Ok(Message::Text(txt)) => {
                            // postback / error message dari server
                            info!(%txt, "kite feed: text message");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(?e, "kite feed: ws read error");
                            break;
                        }
                    }
                }
                FEED_CONNECTED.with_label_values(&["kite"]).set(0);
                info!("kite ticker disconnected, will reconnect…");
            }
            Err(e) => {
                error!(?e, "kite feed: connect failed");
            }
        }

        // Exponential backoff + jitter
        FEED_RECONNECTS.with_label_values(&["kite"]).inc();
        attempt = attempt.saturating_add(1);
        // ThreadRng bukan Send: ambil jitter sebelum await
        let jitter = rand::thread_rng().gen_range(0..=250);
        sleep(backoff_delay(attempt, jitter)).await;
    }
}

/// 0.5s × 2^min(attempt, 6) + jitter (ms).
pub fn backoff_delay(attempt: u32, jitter_ms: u64) -> Duration {
    let factor = 1u64 << attempt.min(6); // 1,2,4,...,64
    Duration::from_millis(500u64.saturating_mul(factor) + jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(token: u32, paise: i32) -> Vec<u8> {
        let mut v = 8u16.to_be_bytes().to_vec();
        v.extend_from_slice(&token.to_be_bytes());
        v.extend_from_slice(&paise.to_be_bytes());
        v
    }

    #[test]
    fn decodes_ltp_frames() {
        let mut frame = 2u16.to_be_bytes().to_vec();
        frame.extend(packet(738561, 245_050));
        frame.extend(packet(2953217, 380_000));
        assert_eq!(parse_ltp_packets(&frame), vec![(738561, 245_050), (2953217, 380_000)]);
    }

    #[test]
    fn ignores_heartbeat_and_truncation() {
        assert!(parse_ltp_packets(&[0]).is_empty());
        let mut frame = 2u16.to_be_bytes().to_vec();
        frame.extend(packet(1, 100));
        frame.extend_from_slice(&[0, 8, 0, 0]); // cut short
        assert_eq!(parse_ltp_packets(&frame), vec![(1, 100)]);
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_delay(1, 0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(40, 10), Duration::from_millis(32_010));
    }

    #[test]
    fn kite_feed_is_spawnable() {
        fn assert_send<T: Send>(_: &T) {}
        let (tx, _rx) = broadcast::channel(4);
        let fut = run_kite(tx, "wss://example.invalid".into(), "k".into(), "t".into(), vec![("X".into(), 1)]);
        assert_send(&fut);
    }

    #[tokio::test]
    async fn mock_feed_publishes_positive_prices() {
        let (tx, mut rx) = broadcast::channel(16);
        let h = tokio::spawn(run_mock(tx, "X".into(), Decimal::new(500, 0), Duration::from_millis(1)));
        let t = rx.recv().await.unwrap();
        h.abort();
        assert_eq!(t.symbol, "X");
        assert!(t.last_price > Decimal::ZERO);
    }
}
