// =============================================================================
// SourceManager — dual-mode (websocket-preferred, REST-fallback) ingestion
// =============================================================================
//
// One tick of `refresh()` mirrors the original polling loop: drain whatever
// websocket events arrived, evaluate staleness per symbol, poll the three
// derivatives endpoints on their own independent periods, and — for any
// symbol currently in REST mode — poll price/klines directly and attempt
// websocket recovery. Recovery requires `ws_recover_good_ticks` consecutive
// fresh ticks before a full kline resync and the switch back to `Ws` mode,
// so a flapping connection can't bounce the symbol back and forth on a
// single lucky event.
//
// `source_manager.py`'s staleness/health logging reads a
// `last_kline_recv_ts` snapshot field tracking the last time *any* websocket
// message arrived, distinct from `last_kline_close_ts` (the last time a
// candle closed). This store only tracks the latter; recv-vs-close is a
// distinction without a behavioral difference for staleness purposes here,
// since both are pushed forward on every kline event.

pub mod rest;
pub mod stream;

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::clock_sync::{age_seconds_from_raw, dt_to_ms, raw_age_ms, ClockSync};
use crate::data_store::{DataStore, SourceMode};
use rest::RestCapability;
use stream::StreamCapability;

pub struct SourceManagerConfig {
    pub symbols: Vec<String>,
    pub staleness_seconds: f64,
    pub derivatives_poll_seconds: i64,
    pub ws_backoff_min_seconds: i64,
    pub ws_backoff_max_seconds: i64,
    pub ws_recover_good_ticks: u32,
    pub health_log_interval_seconds: i64,
    pub rest_kline_limit: usize,
}

struct SymbolRuntime {
    consecutive_fresh_ticks: u32,
    backoff_seconds: i64,
}

impl SymbolRuntime {
    fn new(backoff_min: i64) -> Self {
        Self { consecutive_fresh_ticks: 0, backoff_seconds: backoff_min }
    }
}

struct Timers {
    last_derivatives_poll_ms: HashMap<String, i64>,
    last_ws_reconnect_attempt_ms: HashMap<String, i64>,
    last_health_log_ms: i64,
}

/// Orchestrates per-symbol ingestion across a preferred websocket stream and
/// a REST fallback, feeding both into a shared `DataStore`.
pub struct SourceManager {
    config: SourceManagerConfig,
    store: std::sync::Arc<DataStore>,
    clock: std::sync::Arc<ClockSync>,
    rest: Box<dyn RestCapability>,
    stream: Box<dyn StreamCapability>,
    runtime: Mutex<HashMap<String, SymbolRuntime>>,
    timers: Mutex<Timers>,
}

impl SourceManager {
    pub fn new(
        config: SourceManagerConfig,
        store: std::sync::Arc<DataStore>,
        clock: std::sync::Arc<ClockSync>,
        rest: Box<dyn RestCapability>,
        stream: Box<dyn StreamCapability>,
    ) -> Self {
        let mut runtime = HashMap::new();
        for symbol in &config.symbols {
            runtime.insert(symbol.clone(), SymbolRuntime::new(config.ws_backoff_min_seconds));
        }
        Self {
            config,
            store,
            clock,
            rest,
            stream,
            runtime: Mutex::new(runtime),
            timers: Mutex::new(Timers {
                last_derivatives_poll_ms: HashMap::new(),
                last_ws_reconnect_attempt_ms: HashMap::new(),
                last_health_log_ms: 0,
            }),
        }
    }

    /// Bootstraps each symbol with a REST kline window and connects the
    /// websocket stream, switching symbols to `Ws` mode on success.
    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        for symbol in &self.config.symbols {
            match self.rest.fetch_klines(symbol, self.config.rest_kline_limit).await {
                Ok(klines) => self.store.merge_klines(symbol, klines, Utc::now()),
                Err(err) => warn!(symbol, error = %err, "bootstrap_kline_fetch_failed"),
            }
        }

        match self.stream.connect(&self.config.symbols).await {
            Ok(()) => {
                for symbol in &self.config.symbols {
                    self.store.set_mode(symbol, SourceMode::Ws);
                }
                info!(symbols = self.config.symbols.len(), "source_manager_bootstrap_ws_connected");
            }
            Err(err) => {
                warn!(error = %err, "bootstrap_ws_connect_failed_falling_back_to_rest");
            }
        }
        Ok(())
    }

    /// Runs one full ingestion tick across all symbols.
    pub async fn refresh(&self) {
        self.attempt_ws_events().await;

        let now_ms = self.clock.now_ms().await;
        for symbol in self.config.symbols.clone() {
            self.evaluate_staleness(&symbol, now_ms);
        }

        self.poll_derivatives(now_ms).await;

        for symbol in self.config.symbols.clone() {
            if self.store.mode(&symbol) == SourceMode::Rest {
                self.poll_rest_price_and_klines(&symbol).await;
                self.attempt_ws_recover(&symbol, now_ms).await;
            }
        }

        self.log_health_if_needed(now_ms);
    }

    async fn attempt_ws_events(&self) {
        if !self.stream.connected() {
            return;
        }
        match self.stream.read_events().await {
            Ok((prices, klines)) => {
                let now = Utc::now();
                for tick in prices {
                    if self.store.mode(&tick.symbol) != SourceMode::Ws {
                        continue;
                    }
                    self.store.update_price(&tick.symbol, tick.price, now);
                    self.mark_fresh_tick(&tick.symbol);
                }
                for tick in klines {
                    if self.store.mode(&tick.symbol) != SourceMode::Ws {
                        continue;
                    }
                    self.store.upsert_ws_kline(&tick.symbol, tick.candle, tick.open_time_ms, tick.is_closed, now);
                    self.mark_fresh_tick(&tick.symbol);
                }
            }
            Err(err) => {
                warn!(error = %err, "ws_read_events_failed_switching_all_to_rest");
                for symbol in &self.config.symbols {
                    self.store.set_mode(symbol, SourceMode::Rest);
                }
            }
        }
    }

    fn mark_fresh_tick(&self, symbol: &str) {
        let mut guard = self.runtime.lock();
        if let Some(r) = guard.get_mut(symbol) {
            r.consecutive_fresh_ticks += 1;
        }
    }

    fn evaluate_staleness(&self, symbol: &str, now_ms: i64) {
        if self.store.mode(symbol) != SourceMode::Ws {
            return;
        }
        let snap = self.store.snapshot(symbol);
        let age_seconds = age_seconds_from_raw(raw_age_ms(now_ms, dt_to_ms(snap.last_kline_close_ts)));
        let is_stale = match age_seconds {
            Some(age) => age > self.config.staleness_seconds,
            None => true,
        };
        if is_stale {
            warn!(symbol, age_seconds, "ws_stale_switching_to_rest");
            self.store.set_mode(symbol, SourceMode::Rest);
            if let Some(r) = self.runtime.lock().get_mut(symbol) {
                r.consecutive_fresh_ticks = 0;
            }
        }
    }

    async fn poll_derivatives(&self, now_ms: i64) {
        let due_symbols: Vec<String> = {
            let mut timers = self.timers.lock();
            self.config
                .symbols
                .iter()
                .filter(|symbol| {
                    let last = timers.last_derivatives_poll_ms.get(symbol.as_str()).copied().unwrap_or(0);
                    let due = now_ms - last >= self.config.derivatives_poll_seconds * 1000;
                    if due {
                        timers.last_derivatives_poll_ms.insert(symbol.to_string(), now_ms);
                    }
                    due
                })
                .cloned()
                .collect()
        };

        for symbol in due_symbols {
            let now = Utc::now();
            match self.rest.fetch_premium_index(&symbol).await {
                Ok(p) => {
                    self.store.update_funding_rate(&symbol, p.last_funding_rate, p.next_funding_time_ms, now);
                    self.store.update_premium_index(&symbol, p.mark_price, now);
                }
                Err(err) => warn!(symbol = %symbol, error = %err, "premium_index_poll_failed"),
            }
            match self.rest.fetch_open_interest(&symbol).await {
                Ok(oi) => self.store.update_open_interest(&symbol, oi, now),
                Err(err) => warn!(symbol = %symbol, error = %err, "open_interest_poll_failed"),
            }
        }
    }

    async fn poll_rest_price_and_klines(&self, symbol: &str) {
        let now = Utc::now();
        match self.rest.fetch_price(symbol).await {
            Ok(price) => self.store.update_price(symbol, price, now),
            Err(err) => warn!(symbol, error = %err, "rest_price_poll_failed"),
        }
        match self.rest.fetch_klines(symbol, self.config.rest_kline_limit).await {
            Ok(klines) => self.store.merge_klines(symbol, klines, now),
            Err(err) => warn!(symbol, error = %err, "rest_klines_poll_failed"),
        }
    }

    /// Once `ws_recover_good_ticks` consecutive fresh events have landed on
    /// a reconnected stream, do one full REST resync and flip back to `Ws`.
    async fn attempt_ws_recover(&self, symbol: &str, now_ms: i64) {
        let backoff_seconds = {
            let guard = self.runtime.lock();
            guard.get(symbol).map(|r| r.backoff_seconds).unwrap_or(self.config.ws_backoff_min_seconds)
        };

        let due = {
            let mut timers = self.timers.lock();
            let last = timers.last_ws_reconnect_attempt_ms.get(symbol).copied().unwrap_or(0);
            let due = now_ms - last >= backoff_seconds * 1000;
            if due {
                timers.last_ws_reconnect_attempt_ms.insert(symbol.to_string(), now_ms);
            }
            due
        };
        if !due {
            return;
        }

        if !self.stream.connected() {
            if let Err(err) = self.stream.connect(&self.config.symbols).await {
                warn!(symbol, error = %err, "ws_reconnect_attempt_failed");
                self.bump_backoff(symbol);
                return;
            }
        }

        let fresh_enough = {
            let guard = self.runtime.lock();
            guard.get(symbol).map(|r| r.consecutive_fresh_ticks >= self.config.ws_recover_good_ticks).unwrap_or(false)
        };
        if !fresh_enough {
            return;
        }

        match self.rest.fetch_klines(symbol, self.config.rest_kline_limit).await {
            Ok(klines) => {
                self.store.merge_klines(symbol, klines, Utc::now());
                self.store.set_mode(symbol, SourceMode::Ws);
                self.reset_backoff(symbol);
                info!(symbol, "ws_recovered_resynced_and_switched");
            }
            Err(err) => {
                warn!(symbol, error = %err, "ws_recovery_resync_failed");
            }
        }
    }

    fn bump_backoff(&self, symbol: &str) {
        let mut guard = self.runtime.lock();
        if let Some(r) = guard.get_mut(symbol) {
            r.backoff_seconds = (r.backoff_seconds * 2).min(self.config.ws_backoff_max_seconds);
        }
    }

    fn reset_backoff(&self, symbol: &str) {
        let mut guard = self.runtime.lock();
        if let Some(r) = guard.get_mut(symbol) {
            r.backoff_seconds = self.config.ws_backoff_min_seconds;
        }
    }

    fn log_health_if_needed(&self, now_ms: i64) {
        let due = {
            let mut timers = self.timers.lock();
            let due = now_ms - timers.last_health_log_ms >= self.config.health_log_interval_seconds * 1000;
            if due {
                timers.last_health_log_ms = now_ms;
            }
            due
        };
        if !due {
            return;
        }
        for symbol in &self.config.symbols {
            let snap = self.store.snapshot(symbol);
            let age_seconds = age_seconds_from_raw(raw_age_ms(now_ms, dt_to_ms(snap.last_kline_close_ts)));
            if let Some(age) = age_seconds {
                if age < 0.0 {
                    warn!(symbol, age, "health_kline_timestamp_in_future");
                }
            }
            info!(
                symbol,
                mode = %snap.data_source_mode,
                kline_age_seconds = age_seconds,
                klines_buffered = snap.klines_1m.len(),
                "source_health"
            );
        }
    }

    /// Convenience loop helper: sleeps for `interval` then calls `refresh`.
    pub async fn run_forever(&self, interval: Duration) -> ! {
        loop {
            self.refresh().await;
            tokio::time::sleep(interval).await;
        }
    }
}
