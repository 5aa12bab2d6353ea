// =============================================================================
// StreamCapability — websocket ingestion of price and kline ticks
// =============================================================================
//
// Grounded in `market_data/candle_buffer.rs`'s combined-stream reader: one
// connection per symbol set, `tokio_tungstenite::connect_async`, a
// `read.next().await` loop translated into a single `read_events` drain call
// so the source manager controls its own poll cadence instead of owning a
// background task. Both combined-stream (`{"stream":..,"data":{...}}`) and
// single-stream envelopes are accepted, matching Binance's two WS surfaces.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::types::Candle;

#[derive(Debug, Clone)]
pub struct PriceTick {
    pub symbol: String,
    pub price: f64,
}

#[derive(Debug, Clone)]
pub struct KlineTick {
    pub symbol: String,
    pub candle: Candle,
    pub open_time_ms: i64,
    pub is_closed: bool,
}

/// Streaming capability the source manager prefers over REST polling when
/// the connection is healthy and ticks are flowing.
#[async_trait]
pub trait StreamCapability: Send + Sync {
    fn connected(&self) -> bool;
    async fn connect(&self, symbols: &[String]) -> Result<()>;
    async fn close(&self);
    /// Drains whatever has arrived since the last call without blocking for
    /// more than a short read timeout. Never blocks indefinitely: a quiet
    /// socket returns two empty vectors, leaving staleness detection to the
    /// caller.
    async fn read_events(&self) -> Result<(Vec<PriceTick>, Vec<KlineTick>)>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn parse_string_f64(val: &serde_json::Value) -> Option<f64> {
    match val {
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Extracts symbol + kline payload from either a combined-stream envelope
/// (`{"stream": "...", "data": {...}}`) or a bare single-stream message.
fn parse_kline_message(raw: &str) -> Option<KlineTick> {
    let root: serde_json::Value = serde_json::from_str(raw).ok()?;
    let data = root.get("data").unwrap_or(&root);
    let symbol = data.get("s")?.as_str()?.to_uppercase();
    let k = data.get("k")?;

    let open = parse_string_f64(k.get("o")?)?;
    let high = parse_string_f64(k.get("h")?)?;
    let low = parse_string_f64(k.get("l")?)?;
    let close = parse_string_f64(k.get("c")?)?;
    let open_time_ms = k.get("t")?.as_i64()?;
    let is_closed = k.get("x").and_then(|v| v.as_bool()).unwrap_or(false);

    Some(KlineTick { symbol, candle: Candle::new(open, high, low, close), open_time_ms, is_closed })
}

fn parse_price_message(raw: &str) -> Option<PriceTick> {
    let root: serde_json::Value = serde_json::from_str(raw).ok()?;
    let data = root.get("data").unwrap_or(&root);
    let symbol = data.get("s")?.as_str()?.to_uppercase();
    let price = data
        .get("c")
        .and_then(parse_string_f64)
        .or_else(|| data.get("p").and_then(parse_string_f64))?;
    Some(PriceTick { symbol, price })
}

/// Combined kline + mini-ticker stream against Binance USD-M futures.
pub struct BinanceFuturesStream {
    base_url: String,
    inner: Mutex<Option<WsStream>>,
}

impl BinanceFuturesStream {
    pub fn new() -> Self {
        Self::with_base_url("wss://fstream.binance.com")
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), inner: Mutex::new(None) }
    }

    fn stream_url(&self, symbols: &[String]) -> String {
        let parts: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@kline_1m/{}@miniTicker", s.to_lowercase(), s.to_lowercase()))
            .collect();
        format!("{}/stream?streams={}", self.base_url, parts.join("/"))
    }
}

impl Default for BinanceFuturesStream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamCapability for BinanceFuturesStream {
    fn connected(&self) -> bool {
        self.inner.lock().is_some()
    }

    async fn connect(&self, symbols: &[String]) -> Result<()> {
        let url = self.stream_url(symbols);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        *self.inner.lock() = Some(ws_stream);
        debug!(symbols = symbols.len(), "futures_stream_connected");
        Ok(())
    }

    async fn close(&self) {
        if let Some(mut stream) = self.inner.lock().take() {
            let _ = stream.close(None).await;
        }
    }

    async fn read_events(&self) -> Result<(Vec<PriceTick>, Vec<KlineTick>)> {
        let mut prices = Vec::new();
        let mut klines = Vec::new();

        // Takes the stream out of the mutex for the duration of the drain so
        // the lock is never held across an `.await`, then puts it back.
        let mut stream = match self.inner.lock().take() {
            Some(s) => s,
            None => anyhow::bail!("stream not connected"),
        };

        loop {
            match tokio::time::timeout(std::time::Duration::from_millis(50), stream.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    if let Some(kline) = parse_kline_message(&text) {
                        klines.push(kline);
                    } else if let Some(price) = parse_price_message(&text) {
                        prices.push(price);
                    }
                }
                Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "futures_stream_read_error");
                    *self.inner.lock() = None;
                    anyhow::bail!("websocket read error: {e}");
                }
                Ok(None) => {
                    warn!("futures_stream_closed_by_peer");
                    *self.inner.lock() = None;
                    anyhow::bail!("websocket closed by peer");
                }
                Err(_timeout) => break,
            }
        }

        *self.inner.lock() = Some(stream);
        Ok((prices, klines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_combined_stream_kline_envelope() {
        let raw = serde_json::json!({
            "stream": "btcusdt@kline_1m",
            "data": {
                "s": "BTCUSDT",
                "k": {"t": 1_700_000_000_000i64, "o": "100.0", "h": "101.0", "l": "99.0", "c": "100.5", "x": true}
            }
        })
        .to_string();
        let tick = parse_kline_message(&raw).unwrap();
        assert_eq!(tick.symbol, "BTCUSDT");
        assert_eq!(tick.candle.close, 100.5);
        assert!(tick.is_closed);
        assert_eq!(tick.open_time_ms, 1_700_000_000_000);
    }

    #[test]
    fn parses_single_stream_kline_envelope() {
        let raw = serde_json::json!({
            "s": "ETHUSDT",
            "k": {"t": 1, "o": "1", "h": "2", "l": "0.5", "c": "1.5", "x": false}
        })
        .to_string();
        let tick = parse_kline_message(&raw).unwrap();
        assert_eq!(tick.symbol, "ETHUSDT");
        assert!(!tick.is_closed);
    }

    #[test]
    fn parses_price_from_mini_ticker() {
        let raw = serde_json::json!({
            "data": {"s": "BTCUSDT", "c": "101.25"}
        })
        .to_string();
        let tick = parse_price_message(&raw).unwrap();
        assert_eq!(tick.symbol, "BTCUSDT");
        assert_eq!(tick.price, 101.25);
    }

    #[test]
    fn malformed_message_parses_as_none() {
        assert!(parse_kline_message("not json").is_none());
        assert!(parse_price_message("{}").is_none());
    }

    #[test]
    fn stream_url_builds_combined_kline_and_ticker_streams() {
        let stream = BinanceFuturesStream::new();
        let url = stream.stream_url(&["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert!(url.contains("btcusdt@kline_1m"));
        assert!(url.contains("ethusdt@miniTicker"));
    }
}
