// =============================================================================
// EngineConfig — Hot-loadable engine settings with atomic save
// =============================================================================
//
// Every tunable for the signal engine lives here. All fields carry
// `#[serde(default = "...")]` so that adding a field never breaks loading an
// older config file, and persistence uses the same atomic tmp + rename
// pattern as `risk_engine.rs`. Loading values from environment variables
// (the original Python `load_settings()`) is out of scope here — callers
// construct an `EngineConfig` directly or via `EngineConfig::load(path)`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_poll_seconds() -> f64 {
    1.0
}

fn default_return_threshold() -> f64 {
    0.012
}

fn default_atr_spike_multiplier() -> f64 {
    2.0
}

fn default_max_risk_usdt() -> f64 {
    10.0
}

fn default_leverage_suggest() -> i64 {
    50
}

fn default_ttl_minutes() -> i64 {
    15
}

fn default_kline_limit() -> usize {
    300
}

fn default_max_daily_loss_usdt() -> f64 {
    30.0
}

fn default_max_cards_per_day() -> u32 {
    5
}

fn default_cooldown_after_trigger_minutes() -> i64 {
    30
}

fn default_risk_state_path() -> String {
    "data/risk_state.json".to_string()
}

fn default_data_source_preferred() -> String {
    "ws".to_string()
}

fn default_stale_seconds() -> i64 {
    5
}

fn default_kline_stale_seconds() -> i64 {
    30
}

fn default_ws_backoff_min() -> i64 {
    1
}

fn default_ws_backoff_max() -> i64 {
    60
}

fn default_rest_price_poll_seconds() -> f64 {
    1.0
}

fn default_rest_kline_poll_seconds() -> f64 {
    10.0
}

fn default_ws_recover_good_ticks() -> u32 {
    3
}

fn default_state_sync_klines() -> usize {
    120
}

fn default_funding_extreme() -> f64 {
    0.0008
}

fn default_oi_zscore_threshold() -> f64 {
    1.5
}

fn default_oi_zscore_baseline_buckets() -> usize {
    96
}

fn default_oi_delta_pct_threshold() -> f64 {
    0.03
}

fn default_sweep_pct() -> f64 {
    0.001
}

fn default_wick_body_ratio() -> f64 {
    1.5
}

fn default_stop_buffer_atr() -> f64 {
    0.3
}

fn default_min_atr_pct() -> f64 {
    0.0005
}

fn default_dedupe_window_seconds() -> i64 {
    1800
}

fn default_entry_similar_pct() -> f64 {
    0.002
}

fn default_stop_similar_pct() -> f64 {
    0.002
}

fn default_funding_stale_seconds() -> i64 {
    180
}

fn default_oi_stale_seconds() -> i64 {
    30
}

fn default_max_clock_error_ms() -> i64 {
    1000
}

fn default_clock_refresh_sec() -> i64 {
    60
}

fn default_clock_degraded_retry_sec() -> i64 {
    10
}

fn default_clock_refresh_cooldown_ms() -> i64 {
    30_000
}

fn default_clock_degraded_ttl_ms() -> i64 {
    60_000
}

/// Top-level runtime configuration for the signal engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default)]
    pub telegram_bot_token: String,
    #[serde(default)]
    pub telegram_chat_id: String,
    #[serde(default)]
    pub postback_url: String,

    #[serde(default = "default_poll_seconds")]
    pub poll_seconds: f64,

    #[serde(default = "default_return_threshold")]
    pub return_threshold: f64,
    #[serde(default = "default_atr_spike_multiplier")]
    pub atr_spike_multiplier: f64,
    #[serde(default = "default_funding_extreme")]
    pub funding_extreme: f64,
    #[serde(default = "default_oi_zscore_threshold")]
    pub oi_zscore_threshold: f64,
    /// Number of trailing 15m open-interest buckets the z-score baseline is
    /// computed over. Independent of the delta-pct lookback, which always
    /// compares against the single prior bucket.
    #[serde(default = "default_oi_zscore_baseline_buckets")]
    pub oi_zscore_baseline_buckets: usize,
    #[serde(default = "default_oi_delta_pct_threshold")]
    pub oi_delta_pct_threshold: f64,
    #[serde(default = "default_sweep_pct")]
    pub sweep_pct: f64,
    #[serde(default = "default_wick_body_ratio")]
    pub wick_body_ratio: f64,
    #[serde(default = "default_stop_buffer_atr")]
    pub stop_buffer_atr: f64,
    #[serde(default = "default_min_atr_pct")]
    pub min_atr_pct: f64,

    #[serde(default = "default_max_risk_usdt")]
    pub max_risk_usdt: f64,
    #[serde(default = "default_leverage_suggest")]
    pub leverage_suggest: i64,
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: i64,
    #[serde(default = "default_kline_limit")]
    pub kline_limit: usize,

    #[serde(default = "default_max_daily_loss_usdt")]
    pub max_daily_loss_usdt: f64,
    #[serde(default = "default_max_cards_per_day")]
    pub max_cards_per_day: u32,
    #[serde(default = "default_cooldown_after_trigger_minutes")]
    pub cooldown_after_trigger_minutes: i64,
    #[serde(default)]
    pub kill_switch: bool,
    #[serde(default = "default_risk_state_path")]
    pub risk_state_path: String,
    #[serde(default)]
    pub pnl_csv_path: Option<String>,

    #[serde(default = "default_dedupe_window_seconds")]
    pub dedupe_window_seconds: i64,
    #[serde(default = "default_entry_similar_pct")]
    pub entry_similar_pct: f64,
    #[serde(default = "default_stop_similar_pct")]
    pub stop_similar_pct: f64,

    #[serde(default = "default_data_source_preferred")]
    pub data_source_preferred: String,
    #[serde(default = "default_stale_seconds")]
    pub stale_seconds: i64,
    #[serde(default = "default_kline_stale_seconds")]
    pub kline_stale_seconds: i64,
    #[serde(default = "default_ws_backoff_min")]
    pub ws_backoff_min: i64,
    #[serde(default = "default_ws_backoff_max")]
    pub ws_backoff_max: i64,
    #[serde(default = "default_rest_price_poll_seconds")]
    pub rest_price_poll_seconds: f64,
    #[serde(default = "default_rest_kline_poll_seconds")]
    pub rest_kline_poll_seconds: f64,
    #[serde(default = "default_ws_recover_good_ticks")]
    pub ws_recover_good_ticks: u32,
    #[serde(default = "default_state_sync_klines")]
    pub state_sync_klines: usize,

    #[serde(default = "default_funding_stale_seconds")]
    pub funding_stale_seconds: i64,
    #[serde(default = "default_oi_stale_seconds")]
    pub oi_stale_seconds: i64,

    #[serde(default = "default_max_clock_error_ms")]
    pub max_clock_error_ms: i64,
    #[serde(default = "default_clock_refresh_sec")]
    pub clock_refresh_sec: i64,
    #[serde(default = "default_clock_degraded_retry_sec")]
    pub clock_degraded_retry_sec: i64,
    #[serde(default = "default_clock_refresh_cooldown_ms")]
    pub clock_refresh_cooldown_ms: i64,
    #[serde(default = "default_clock_degraded_ttl_ms")]
    pub clock_degraded_ttl_ms: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            telegram_bot_token: String::new(),
            telegram_chat_id: String::new(),
            postback_url: String::new(),
            poll_seconds: default_poll_seconds(),
            return_threshold: default_return_threshold(),
            atr_spike_multiplier: default_atr_spike_multiplier(),
            funding_extreme: default_funding_extreme(),
            oi_zscore_threshold: default_oi_zscore_threshold(),
            oi_zscore_baseline_buckets: default_oi_zscore_baseline_buckets(),
            oi_delta_pct_threshold: default_oi_delta_pct_threshold(),
            sweep_pct: default_sweep_pct(),
            wick_body_ratio: default_wick_body_ratio(),
            stop_buffer_atr: default_stop_buffer_atr(),
            min_atr_pct: default_min_atr_pct(),
            max_risk_usdt: default_max_risk_usdt(),
            leverage_suggest: default_leverage_suggest(),
            ttl_minutes: default_ttl_minutes(),
            kline_limit: default_kline_limit(),
            max_daily_loss_usdt: default_max_daily_loss_usdt(),
            max_cards_per_day: default_max_cards_per_day(),
            cooldown_after_trigger_minutes: default_cooldown_after_trigger_minutes(),
            kill_switch: false,
            risk_state_path: default_risk_state_path(),
            pnl_csv_path: None,
            dedupe_window_seconds: default_dedupe_window_seconds(),
            entry_similar_pct: default_entry_similar_pct(),
            stop_similar_pct: default_stop_similar_pct(),
            data_source_preferred: default_data_source_preferred(),
            stale_seconds: default_stale_seconds(),
            kline_stale_seconds: default_kline_stale_seconds(),
            ws_backoff_min: default_ws_backoff_min(),
            ws_backoff_max: default_ws_backoff_max(),
            rest_price_poll_seconds: default_rest_price_poll_seconds(),
            rest_kline_poll_seconds: default_rest_kline_poll_seconds(),
            ws_recover_good_ticks: default_ws_recover_good_ticks(),
            state_sync_klines: default_state_sync_klines(),
            funding_stale_seconds: default_funding_stale_seconds(),
            oi_stale_seconds: default_oi_stale_seconds(),
            max_clock_error_ms: default_max_clock_error_ms(),
            clock_refresh_sec: default_clock_refresh_sec(),
            clock_degraded_retry_sec: default_clock_degraded_retry_sec(),
            clock_refresh_cooldown_ms: default_clock_refresh_cooldown_ms(),
            clock_degraded_ttl_ms: default_clock_degraded_ttl_ms(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;
        info!(path = %path.display(), symbols = ?config.symbols, "engine config loaded");
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).context("failed to serialise engine config to JSON")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp engine config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp engine config to {}", path.display()))?;
        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}
