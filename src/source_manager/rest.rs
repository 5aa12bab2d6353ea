// =============================================================================
// RestCapability — REST-side market/derivatives fetchers for perpetual futures
// =============================================================================
//
// Mirrors the field-extraction style of `binance/client.rs::get_klines` and
// `futures_intel/funding_rate.rs`/`open_interest.rs`: build the URL, GET it,
// parse into a typed result, `.context(...)` every fallible step. Unlike the
// teacher's spot `BinanceClient`, none of these calls are signed — reading
// public futures market data needs no API key.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::clock_sync::RestTimeSource;
use crate::types::{Candle, FundingRatePoint};

/// Snapshot of `/fapi/v1/premiumIndex` for one symbol.
#[derive(Debug, Clone, Copy)]
pub struct PremiumIndex {
    pub mark_price: f64,
    pub last_funding_rate: f64,
    pub next_funding_time_ms: Option<i64>,
}

/// REST-side capability the source manager polls when websocket data is
/// stale, unavailable, or for derivatives that have no streaming feed.
#[async_trait]
pub trait RestCapability: Send + Sync {
    async fn fetch_price(&self, symbol: &str) -> Result<f64>;
    async fn fetch_klines(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>>;
    async fn fetch_premium_index(&self, symbol: &str) -> Result<PremiumIndex>;
    async fn fetch_funding_rate_history(&self, symbol: &str, limit: usize) -> Result<Vec<FundingRatePoint>>;
    async fn fetch_open_interest(&self, symbol: &str) -> Result<f64>;
}

/// Public (unsigned) client against Binance USD-M futures REST endpoints.
pub struct BinanceFuturesRest {
    client: Client,
    base_url: String,
}

impl BinanceFuturesRest {
    pub fn new() -> Self {
        Self::with_base_url("https://fapi.binance.com")
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client for BinanceFuturesRest"),
            base_url: base_url.into(),
        }
    }

    fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
        match val {
            serde_json::Value::String(s) => s.parse::<f64>().with_context(|| format!("failed to parse {s} as f64")),
            serde_json::Value::Number(n) => n.as_f64().context("number is not a valid f64"),
            _ => anyhow::bail!("unexpected JSON type for numeric field"),
        }
    }
}

impl Default for BinanceFuturesRest {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RestCapability for BinanceFuturesRest {
    async fn fetch_price(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/fapi/v1/ticker/price?symbol={}", self.base_url, symbol);
        let resp = self.client.get(&url).send().await.with_context(|| format!("GET ticker price for {symbol}"))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse ticker price response")?;
        if !status.is_success() {
            anyhow::bail!("ticker price API returned {}: {}", status, body);
        }
        Self::parse_str_f64(&body["price"])
    }

    async fn fetch_klines(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval=1m&limit={}",
            self.base_url, symbol, limit
        );
        let resp = self.client.get(&url).send().await.with_context(|| format!("GET klines for {symbol}"))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse klines response")?;
        if !status.is_success() {
            anyhow::bail!("klines API returned {}: {}", status, body);
        }
        let raw = body.as_array().context("klines response is not an array")?;
        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 5 {
                continue;
            }
            let open = Self::parse_str_f64(&arr[1])?;
            let high = Self::parse_str_f64(&arr[2])?;
            let low = Self::parse_str_f64(&arr[3])?;
            let close = Self::parse_str_f64(&arr[4])?;
            candles.push(Candle::new(open, high, low, close));
        }
        debug!(symbol, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    async fn fetch_premium_index(&self, symbol: &str) -> Result<PremiumIndex> {
        let url = format!("{}/fapi/v1/premiumIndex?symbol={}", self.base_url, symbol);
        let resp = self.client.get(&url).send().await.with_context(|| format!("GET premiumIndex for {symbol}"))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse premiumIndex response")?;
        if !status.is_success() {
            anyhow::bail!("premiumIndex API returned {}: {}", status, body);
        }
        Ok(PremiumIndex {
            mark_price: Self::parse_str_f64(&body["markPrice"])?,
            last_funding_rate: Self::parse_str_f64(&body["lastFundingRate"])?,
            next_funding_time_ms: body["nextFundingTime"].as_i64(),
        })
    }

    async fn fetch_funding_rate_history(&self, symbol: &str, limit: usize) -> Result<Vec<FundingRatePoint>> {
        let url = format!(
            "{}/fapi/v1/fundingRate?symbol={}&limit={}",
            self.base_url, symbol, limit
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET fundingRate history for {symbol}"))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse fundingRate response")?;
        if !status.is_success() {
            anyhow::bail!("fundingRate API returned {}: {}", status, body);
        }
        let raw = body.as_array().context("fundingRate response is not an array")?;
        let mut points = Vec::with_capacity(raw.len());
        for entry in raw {
            let funding_rate = Self::parse_str_f64(&entry["fundingRate"])?;
            let funding_time_ms = entry["fundingTime"].as_i64().context("missing fundingTime")?;
            points.push(FundingRatePoint { funding_rate, funding_time_ms });
        }
        Ok(points)
    }

    async fn fetch_open_interest(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/fapi/v1/openInterest?symbol={}", self.base_url, symbol);
        let resp = self.client.get(&url).send().await.with_context(|| format!("GET openInterest for {symbol}"))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse openInterest response")?;
        if !status.is_success() {
            anyhow::bail!("openInterest API returned {}: {}", status, body);
        }
        Self::parse_str_f64(&body["openInterest"])
    }
}

#[async_trait]
impl RestTimeSource for BinanceFuturesRest {
    async fn fetch_server_time_ms(&self) -> Result<i64> {
        let url = format!("{}/fapi/v1/time", self.base_url);
        let resp = self.client.get(&url).send().await.context("GET server time failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse server time response")?;
        if !status.is_success() {
            anyhow::bail!("server time API returned {}: {}", status, body);
        }
        body["serverTime"].as_i64().context("missing serverTime field")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_str_f64_accepts_both_string_and_number() {
        assert_eq!(BinanceFuturesRest::parse_str_f64(&serde_json::json!("1.5")).unwrap(), 1.5);
        assert_eq!(BinanceFuturesRest::parse_str_f64(&serde_json::json!(1.5)).unwrap(), 1.5);
        assert!(BinanceFuturesRest::parse_str_f64(&serde_json::json!(null)).is_err());
    }
}
