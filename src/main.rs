// =============================================================================
// Aurora Signal Engine — Main Entry Point
// =============================================================================
//
// Read-only by construction: this process ingests market data, derives
// features, and emits proposal cards to external sinks. It never places an
// order, never opens a position, and carries no execution engine — see
// DESIGN.md for the full list of capabilities intentionally left out of
// this build.

mod arbitrator;
mod calculations;
mod clock_sync;
mod config;
mod data_store;
mod notifier;
mod risk_engine;
mod signal_service;
mod source_manager;
mod strategies;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::arbitrator::ArbitratorConfig;
use crate::clock_sync::ClockSync;
use crate::config::EngineConfig;
use crate::data_store::DataStore;
use crate::notifier::{HttpPostback, TelegramNotifier};
use crate::risk_engine::{RiskEngine, RiskEngineConfig};
use crate::signal_service::{SignalService, SignalServiceConfig};
use crate::source_manager::rest::BinanceFuturesRest;
use crate::source_manager::stream::BinanceFuturesStream;
use crate::source_manager::{SourceManager, SourceManagerConfig};
use crate::strategies::fake_breakout_reversal::FakeBreakoutReversalStrategy;
use crate::strategies::funding_oi_skew::FundingOiSkewStrategy;
use crate::strategies::liquidation_follow::LiquidationFollowStrategy;
use crate::strategies::vol_breakout::VolBreakoutStrategy;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("aurora-signal-engine starting up");

    let mut config = EngineConfig::load("engine_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load engine config, using defaults");
        EngineConfig::default()
    });

    if let Ok(syms) = std::env::var("AURORA_SYMBOLS") {
        config.symbols = syms.split(',').map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty()).collect();
    }
    if config.symbols.is_empty() {
        config.symbols = vec!["BTCUSDT".into(), "ETHUSDT".into()];
    }
    info!(symbols = ?config.symbols, "configured trading pairs");

    // server-clock synchronizer, shared between the source manager and the
    // tick loop's card timestamps
    let clock = Arc::new(ClockSync::new(
        Box::new(BinanceFuturesRest::new()),
        config.max_clock_error_ms,
        config.clock_refresh_sec,
        config.clock_degraded_retry_sec,
        config.clock_refresh_cooldown_ms,
        config.clock_degraded_ttl_ms,
    ));
    clock.refresh_server_time(true).await;

    let store = Arc::new(DataStore::new(&config.symbols));

    let source_manager = SourceManager::new(
        SourceManagerConfig {
            symbols: config.symbols.clone(),
            staleness_seconds: config.kline_stale_seconds as f64,
            derivatives_poll_seconds: config.funding_stale_seconds.min(config.oi_stale_seconds).max(5) / 2,
            ws_backoff_min_seconds: config.ws_backoff_min,
            ws_backoff_max_seconds: config.ws_backoff_max,
            ws_recover_good_ticks: config.ws_recover_good_ticks,
            health_log_interval_seconds: 60,
            rest_kline_limit: config.state_sync_klines.max(config.kline_limit),
        },
        store.clone(),
        clock.clone(),
        Box::new(BinanceFuturesRest::new()),
        Box::new(BinanceFuturesStream::new()),
    );

    if let Err(err) = source_manager.bootstrap().await {
        error!(error = %err, "source manager bootstrap failed");
    }

    let source_manager = Arc::new(source_manager);
    let ingestion = source_manager.clone();
    tokio::spawn(async move {
        ingestion.run_forever(tokio::time::Duration::from_secs_f64(1.0)).await;
    });

    let risk_engine = Arc::new(RiskEngine::new(
        &config.risk_state_path,
        RiskEngineConfig {
            max_daily_loss_usdt: config.max_daily_loss_usdt,
            max_cards_per_day: config.max_cards_per_day,
            cooldown_after_trigger_minutes: config.cooldown_after_trigger_minutes,
            kill_switch: config.kill_switch,
            pnl_csv_path: config.pnl_csv_path.clone().map(std::path::PathBuf::from),
        },
    )?);

    let signal_service = Arc::new(SignalService::new(
        SignalServiceConfig {
            funding_stale_seconds: config.funding_stale_seconds,
            oi_stale_seconds: config.oi_stale_seconds,
            oi_samples_per_15m: (15.0 * 60.0 / config.poll_seconds.max(0.001)) as usize,
            oi_zscore_baseline_buckets: config.oi_zscore_baseline_buckets,
        },
        store.clone(),
        VolBreakoutStrategy {
            return_threshold: config.return_threshold,
            atr_spike_multiplier: config.atr_spike_multiplier,
            leverage_suggest: config.leverage_suggest,
            max_risk_usdt: config.max_risk_usdt,
            ttl_minutes: config.ttl_minutes,
            priority: 0,
        },
        FundingOiSkewStrategy {
            funding_extreme: config.funding_extreme,
            oi_zscore_threshold: config.oi_zscore_threshold,
            leverage_suggest: config.leverage_suggest,
            max_risk_usdt: config.max_risk_usdt,
            ttl_minutes: config.ttl_minutes,
            priority: 1,
        },
        LiquidationFollowStrategy {
            oi_delta_pct_threshold: config.oi_delta_pct_threshold,
            leverage_suggest: config.leverage_suggest,
            max_risk_usdt: config.max_risk_usdt,
            ttl_minutes: config.ttl_minutes,
            priority: 1,
        },
        FakeBreakoutReversalStrategy {
            sweep_pct: config.sweep_pct,
            wick_body_ratio: config.wick_body_ratio,
            stop_buffer_atr: config.stop_buffer_atr,
            min_atr_pct: config.min_atr_pct,
            leverage_suggest: config.leverage_suggest,
            max_risk_usdt: config.max_risk_usdt,
            ttl_minutes: config.ttl_minutes,
            priority: 2,
            max_kline_age_seconds: config.kline_stale_seconds,
        },
        ArbitratorConfig {
            dedupe_window_seconds: config.dedupe_window_seconds,
            entry_similar_pct: config.entry_similar_pct,
            stop_similar_pct: config.stop_similar_pct,
        },
        risk_engine,
        Box::new(TelegramNotifier::new(config.telegram_bot_token.clone(), config.telegram_chat_id.clone())),
        Box::new(HttpPostback::new(config.postback_url.clone())),
    ));

    info!("signal tick loop starting");
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs_f64(config.poll_seconds));
    loop {
        interval.tick().await;
        let now_ms = clock.now_ms().await;
        let now = chrono::DateTime::from_timestamp_millis(now_ms).unwrap_or_else(chrono::Utc::now);
        for symbol in &config.symbols {
            signal_service.tick(symbol, now).await;
        }
    }
}
