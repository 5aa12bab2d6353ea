// =============================================================================
// DataStore — thread-safe per-symbol rolling market/derivatives state
// =============================================================================
//
// Holds the latest prices, 1m klines and derivatives snapshots per symbol,
// guarded by a single `parking_lot::RwLock` per symbol-keyed map, in the
// same style as `market_data/candle_buffer.rs`'s `CandleBuffer`. Klines use
// the append-or-replace-by-open-time rule: a still-open candle with the
// same `open_time_ms` as the buffer's tail replaces it in place, rather
// than appending a duplicate.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::types::{Candle, FundingRatePoint};

const DEFAULT_MAX_PRICE_POINTS: usize = 600;
const DEFAULT_MAX_KLINES: usize = 1440;
const DEFAULT_MAX_OI_SAMPLES: usize = 24 * 60 * 6;

/// Ingestion mode a symbol is currently being fed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Ws,
    Rest,
}

impl std::fmt::Display for SourceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ws => write!(f, "ws"),
            Self::Rest => write!(f, "rest"),
        }
    }
}

struct SymbolState {
    prices: VecDeque<(DateTime<Utc>, f64)>,
    klines_1m: VecDeque<Candle>,
    last_ws_kline_open_time_ms: Option<i64>,
    last_price_ts: Option<DateTime<Utc>>,
    last_kline_close_ts: Option<DateTime<Utc>>,

    last_funding_rate: Option<f64>,
    next_funding_time_ms: Option<i64>,
    funding_ts: Option<DateTime<Utc>>,
    funding_rate_history: VecDeque<FundingRatePoint>,

    mark_price: Option<f64>,
    mark_price_ts: Option<DateTime<Utc>>,

    open_interest: Option<f64>,
    open_interest_ts: Option<DateTime<Utc>>,
    open_interest_series: VecDeque<(DateTime<Utc>, f64)>,
}

impl SymbolState {
    fn new() -> Self {
        Self {
            prices: VecDeque::new(),
            klines_1m: VecDeque::new(),
            last_ws_kline_open_time_ms: None,
            last_price_ts: None,
            last_kline_close_ts: None,
            last_funding_rate: None,
            next_funding_time_ms: None,
            funding_ts: None,
            funding_rate_history: VecDeque::new(),
            mark_price: None,
            mark_price_ts: None,
            open_interest: None,
            open_interest_ts: None,
            open_interest_series: VecDeque::new(),
        }
    }
}

/// A consistent, cloned view of one symbol's state at a point in time.
#[derive(Debug, Clone)]
pub struct SymbolSnapshot {
    pub symbol: String,
    pub price: Option<f64>,
    pub klines_1m: Vec<Candle>,
    pub last_price_ts: Option<DateTime<Utc>>,
    pub last_kline_close_ts: Option<DateTime<Utc>>,
    pub data_source_mode: SourceMode,

    pub last_funding_rate: Option<f64>,
    pub next_funding_time_ms: Option<i64>,
    pub funding_ts: Option<DateTime<Utc>>,
    pub funding_rate_history: Vec<FundingRatePoint>,

    pub mark_price: Option<f64>,
    pub mark_price_ts: Option<DateTime<Utc>>,

    pub open_interest: Option<f64>,
    pub open_interest_ts: Option<DateTime<Utc>>,
    pub open_interest_series: Vec<(DateTime<Utc>, f64)>,
}

/// Thread-safe rolling store of market and derivatives state, one entry
/// per tracked symbol.
pub struct DataStore {
    mode: RwLock<HashMap<String, SourceMode>>,
    state: RwLock<HashMap<String, SymbolState>>,
    max_price_points: usize,
    max_klines: usize,
    max_oi_samples: usize,
}

impl DataStore {
    pub fn new(symbols: &[String]) -> Self {
        Self::with_limits(
            symbols,
            DEFAULT_MAX_PRICE_POINTS,
            DEFAULT_MAX_KLINES,
            DEFAULT_MAX_OI_SAMPLES,
        )
    }

    pub fn with_limits(
        symbols: &[String],
        max_price_points: usize,
        max_klines: usize,
        max_oi_samples: usize,
    ) -> Self {
        let mut mode = HashMap::new();
        let mut state = HashMap::new();
        for symbol in symbols {
            mode.insert(symbol.clone(), SourceMode::Rest);
            state.insert(symbol.clone(), SymbolState::new());
        }
        Self {
            mode: RwLock::new(mode),
            state: RwLock::new(state),
            max_price_points,
            max_klines,
            max_oi_samples,
        }
    }

    pub fn set_mode(&self, symbol: &str, mode: SourceMode) {
        self.mode.write().insert(symbol.to_string(), mode);
    }

    pub fn mode(&self, symbol: &str) -> SourceMode {
        self.mode
            .read()
            .get(symbol)
            .copied()
            .unwrap_or(SourceMode::Rest)
    }

    pub fn update_price(&self, symbol: &str, price: f64, ts: DateTime<Utc>) {
        let mut guard = self.state.write();
        let entry = guard.entry(symbol.to_string()).or_insert_with(SymbolState::new);
        entry.prices.push_back((ts, price));
        while entry.prices.len() > self.max_price_points {
            entry.prices.pop_front();
        }
        entry.last_price_ts = Some(ts);
    }

    /// Replace the whole 1m kline buffer with a freshly fetched REST window
    /// (full state resync).
    pub fn merge_klines(&self, symbol: &str, klines: Vec<Candle>, ts: DateTime<Utc>) {
        if klines.is_empty() {
            return;
        }
        let mut guard = self.state.write();
        let entry = guard.entry(symbol.to_string()).or_insert_with(SymbolState::new);
        entry.klines_1m.clear();
        entry.klines_1m.extend(klines);
        while entry.klines_1m.len() > self.max_klines {
            entry.klines_1m.pop_front();
        }
        entry.last_kline_close_ts = Some(ts);
        entry.last_ws_kline_open_time_ms = None;
    }

    /// Append-or-replace-by-open-time: a websocket kline event with the
    /// same `open_time_ms` as the buffer's current tail replaces that tail
    /// in place (the candle is still open); any other open time appends a
    /// new candle. `last_kline_close_ts` only advances when `is_closed` is
    /// true — a still-forming candle must not count as "freshly closed".
    pub fn upsert_ws_kline(&self, symbol: &str, candle: Candle, open_time_ms: i64, is_closed: bool, ts: DateTime<Utc>) {
        let mut guard = self.state.write();
        let entry = guard.entry(symbol.to_string()).or_insert_with(SymbolState::new);
        let replace = entry.last_ws_kline_open_time_ms == Some(open_time_ms) && !entry.klines_1m.is_empty();
        if replace {
            *entry.klines_1m.back_mut().expect("checked non-empty above") = candle;
        } else {
            entry.klines_1m.push_back(candle);
            entry.last_ws_kline_open_time_ms = Some(open_time_ms);
            while entry.klines_1m.len() > self.max_klines {
                entry.klines_1m.pop_front();
            }
        }
        if is_closed {
            entry.last_kline_close_ts = Some(ts);
        }
    }

    pub fn update_premium_index(&self, symbol: &str, mark_price: f64, ts: DateTime<Utc>) {
        let mut guard = self.state.write();
        let entry = guard.entry(symbol.to_string()).or_insert_with(SymbolState::new);
        entry.mark_price = Some(mark_price);
        entry.mark_price_ts = Some(ts);
    }

    pub fn update_funding_rate(
        &self,
        symbol: &str,
        funding_rate: f64,
        next_funding_time_ms: Option<i64>,
        ts: DateTime<Utc>,
    ) {
        let mut guard = self.state.write();
        let entry = guard.entry(symbol.to_string()).or_insert_with(SymbolState::new);
        entry.last_funding_rate = Some(funding_rate);
        entry.next_funding_time_ms = next_funding_time_ms;
        entry.funding_ts = Some(ts);
    }

    pub fn update_funding_rate_history(&self, symbol: &str, points: Vec<FundingRatePoint>) {
        let mut guard = self.state.write();
        let entry = guard.entry(symbol.to_string()).or_insert_with(SymbolState::new);
        entry.funding_rate_history = points.into();
    }

    pub fn update_open_interest(&self, symbol: &str, oi: f64, ts: DateTime<Utc>) {
        let mut guard = self.state.write();
        let entry = guard.entry(symbol.to_string()).or_insert_with(SymbolState::new);
        entry.open_interest = Some(oi);
        entry.open_interest_ts = Some(ts);
        entry.open_interest_series.push_back((ts, oi));
        while entry.open_interest_series.len() > self.max_oi_samples {
            entry.open_interest_series.pop_front();
        }
    }

    pub fn snapshot(&self, symbol: &str) -> SymbolSnapshot {
        let state_guard = self.state.read();
        let entry = state_guard.get(symbol);
        let mode = self.mode(symbol);

        match entry {
            Some(s) => SymbolSnapshot {
                symbol: symbol.to_string(),
                price: s.prices.back().map(|(_, p)| *p),
                klines_1m: s.klines_1m.iter().copied().collect(),
                last_price_ts: s.last_price_ts,
                last_kline_close_ts: s.last_kline_close_ts,
                data_source_mode: mode,
                last_funding_rate: s.last_funding_rate,
                next_funding_time_ms: s.next_funding_time_ms,
                funding_ts: s.funding_ts,
                funding_rate_history: s.funding_rate_history.iter().copied().collect(),
                mark_price: s.mark_price,
                mark_price_ts: s.mark_price_ts,
                open_interest: s.open_interest,
                open_interest_ts: s.open_interest_ts,
                open_interest_series: s.open_interest_series.iter().copied().collect(),
            },
            None => SymbolSnapshot {
                symbol: symbol.to_string(),
                price: None,
                klines_1m: Vec::new(),
                last_price_ts: None,
                last_kline_close_ts: None,
                data_source_mode: mode,
                last_funding_rate: None,
                next_funding_time_ms: None,
                funding_ts: None,
                funding_rate_history: Vec::new(),
                mark_price: None,
                mark_price_ts: None,
                open_interest: None,
                open_interest_ts: None,
                open_interest_series: Vec::new(),
            },
        }
    }

    pub fn buffer_sizes(&self, symbol: &str) -> (usize, usize) {
        let guard = self.state.read();
        match guard.get(symbol) {
            Some(s) => (s.prices.len(), s.klines_1m.len()),
            None => (0, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn symbols() -> Vec<String> {
        vec!["BTCUSDT".to_string()]
    }

    fn c(close: f64) -> Candle {
        Candle::new(close, close + 1.0, close - 1.0, close)
    }

    #[test]
    fn ring_buffer_trims_price_points() {
        let store = DataStore::with_limits(&symbols(), 3, 10, 10);
        let now = Utc::now();
        for i in 0..5 {
            store.update_price("BTCUSDT", 100.0 + i as f64, now + Duration::seconds(i));
        }
        let (price_count, _) = store.buffer_sizes("BTCUSDT");
        assert_eq!(price_count, 3);
        assert_eq!(store.snapshot("BTCUSDT").price, Some(104.0));
    }

    #[test]
    fn upsert_ws_kline_replaces_same_open_time() {
        let store = DataStore::new(&symbols());
        let now = Utc::now();
        store.upsert_ws_kline("BTCUSDT", c(100.0), 1000, false, now);
        store.upsert_ws_kline("BTCUSDT", c(101.0), 1000, true, now);
        let snap = store.snapshot("BTCUSDT");
        assert_eq!(snap.klines_1m.len(), 1);
        assert_eq!(snap.klines_1m[0].close, 101.0);
    }

    #[test]
    fn upsert_ws_kline_appends_new_open_time() {
        let store = DataStore::new(&symbols());
        let now = Utc::now();
        store.upsert_ws_kline("BTCUSDT", c(100.0), 1000, true, now);
        store.upsert_ws_kline("BTCUSDT", c(102.0), 2000, true, now);
        let snap = store.snapshot("BTCUSDT");
        assert_eq!(snap.klines_1m.len(), 2);
        assert_eq!(snap.klines_1m[1].close, 102.0);
    }

    #[test]
    fn unclosed_kline_does_not_advance_last_kline_close_ts() {
        let store = DataStore::new(&symbols());
        let t0 = Utc::now();
        store.upsert_ws_kline("BTCUSDT", c(100.0), 1000, true, t0);
        let t1 = t0 + Duration::seconds(30);
        store.upsert_ws_kline("BTCUSDT", c(101.0), 2000, false, t1);
        let snap = store.snapshot("BTCUSDT");
        assert_eq!(snap.last_kline_close_ts, Some(t0));
        assert_eq!(snap.klines_1m.len(), 2);
    }

    #[test]
    fn merge_klines_replaces_whole_buffer_and_clears_ws_open_time() {
        let store = DataStore::new(&symbols());
        let now = Utc::now();
        store.upsert_ws_kline("BTCUSDT", c(100.0), 1000, true, now);
        store.merge_klines("BTCUSDT", vec![c(1.0), c(2.0), c(3.0)], now);
        let snap = store.snapshot("BTCUSDT");
        assert_eq!(snap.klines_1m.len(), 3);
        // a subsequent ws event with any open_time must append, not replace
        store.upsert_ws_kline("BTCUSDT", c(4.0), 1000, true, now);
        assert_eq!(store.snapshot("BTCUSDT").klines_1m.len(), 4);
    }

    #[test]
    fn klines_buffer_respects_max_candles() {
        let store = DataStore::with_limits(&symbols(), 10, 3, 10);
        let now = Utc::now();
        for i in 0..5 {
            store.upsert_ws_kline("BTCUSDT", c(i as f64), 1000 + i, true, now);
        }
        assert_eq!(store.snapshot("BTCUSDT").klines_1m.len(), 3);
    }

    #[test]
    fn mode_defaults_to_rest() {
        let store = DataStore::new(&symbols());
        assert_eq!(store.mode("BTCUSDT"), SourceMode::Rest);
        store.set_mode("BTCUSDT", SourceMode::Ws);
        assert_eq!(store.mode("BTCUSDT"), SourceMode::Ws);
    }

    #[test]
    fn open_interest_series_accumulates_and_trims() {
        let store = DataStore::with_limits(&symbols(), 10, 10, 2);
        let now = Utc::now();
        store.update_open_interest("BTCUSDT", 1.0, now);
        store.update_open_interest("BTCUSDT", 2.0, now);
        store.update_open_interest("BTCUSDT", 3.0, now);
        let snap = store.snapshot("BTCUSDT");
        assert_eq!(snap.open_interest_series.len(), 2);
        assert_eq!(snap.open_interest, Some(3.0));
    }

    #[test]
    fn snapshot_unknown_symbol_returns_empty_defaults() {
        let store = DataStore::new(&symbols());
        let snap = store.snapshot("ETHUSDT");
        assert_eq!(snap.price, None);
        assert!(snap.klines_1m.is_empty());
        assert_eq!(snap.data_source_mode, SourceMode::Rest);
    }
}
