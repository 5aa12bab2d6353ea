// =============================================================================
// SignalService — per-symbol, per-tick feature build, fan-out, arbitrate, gate
// =============================================================================
//
// One `tick()` call for one symbol does, in order: freshness gating (funding
// missing/stale, OI fresh/stale/unknown), ATR warmup gate, feature
// derivation from the latest `DataStore` snapshot, fan-out across the four
// strategies, arbitration to at most one card, a risk-engine gate, trigger
// recording, and dual delivery to the notifier and postback sinks. A trace
// id is minted per tick so a card's delivery attempts can be correlated in
// logs even though neither sink echoes one back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::arbitrator::{Arbitrator, ArbitratorConfig};
use crate::calculations::{aggregate_oi_to_15m, aggregate_to_window, atr_series, oi_delta_pct, oi_zscore, return_over};
use crate::data_store::DataStore;
use crate::notifier::{Notifier, Postback};
use crate::risk_engine::RiskEngine;
use crate::strategies::fake_breakout_reversal::FakeBreakoutReversalStrategy;
use crate::strategies::funding_oi_skew::FundingOiSkewStrategy;
use crate::strategies::liquidation_follow::LiquidationFollowStrategy;
use crate::strategies::vol_breakout::VolBreakoutStrategy;
use crate::strategies::{SignalContext, Strategy};
use crate::types::OiFreshness;

/// Minimum closed 1m candles needed before ATR/return features are trusted:
/// 15m aggregation (15 candles) plus a 14-candle ATR warmup window over that
/// aggregated series needs 15 * (14 + 1) = 225 raw 1m candles; rounded down
/// slightly to the 210 the original warmup gate uses.
pub const MIN_KLINES_FOR_WARMUP: usize = 210;
const ATR_PERIOD_15M: usize = 14;
/// `oi_delta_pct` always compares the latest 15m OI bucket against the one
/// immediately before it, independent of how far back the z-score baseline
/// looks.
const OI_DELTA_PCT_LOOKBACK: usize = 1;

pub struct SignalServiceConfig {
    pub funding_stale_seconds: i64,
    pub oi_stale_seconds: i64,
    pub oi_samples_per_15m: usize,
    pub oi_zscore_baseline_buckets: usize,
}

pub struct SignalService {
    config: SignalServiceConfig,
    store: Arc<DataStore>,
    strategies: Vec<Box<dyn Strategy>>,
    arbitrator: Arbitrator,
    risk_engine: Arc<RiskEngine>,
    notifier: Box<dyn Notifier>,
    postback: Box<dyn Postback>,
}

/// Reason a tick produced no card, for structured logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InsufficientWarmup,
    FundingMissing,
    FundingStale,
    DerivativesMissing,
    NoArbitrationWinner,
    RiskDenied,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InsufficientWarmup => "insufficient_warmup",
            Self::FundingMissing => "funding_missing",
            Self::FundingStale => "funding_stale",
            Self::DerivativesMissing => "derivatives_missing",
            Self::NoArbitrationWinner => "no_arbitration_winner",
            Self::RiskDenied => "risk_denied",
        };
        write!(f, "{s}")
    }
}

/// decision ∈ {emit, no_signal, blocked}, the top-level outcome a tick's
/// structured log reports alongside its `SkipReason`/risk reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Emit,
    NoSignal,
    Blocked,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Emit => "emit",
            Self::NoSignal => "no_signal",
            Self::Blocked => "blocked",
        };
        write!(f, "{s}")
    }
}

impl SignalService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SignalServiceConfig,
        store: Arc<DataStore>,
        vol_breakout: VolBreakoutStrategy,
        funding_oi_skew: FundingOiSkewStrategy,
        liquidation_follow: LiquidationFollowStrategy,
        fake_breakout_reversal: FakeBreakoutReversalStrategy,
        arbitrator_config: ArbitratorConfig,
        risk_engine: Arc<RiskEngine>,
        notifier: Box<dyn Notifier>,
        postback: Box<dyn Postback>,
    ) -> Self {
        let strategies: Vec<Box<dyn Strategy>> = vec![
            Box::new(vol_breakout),
            Box::new(funding_oi_skew),
            Box::new(liquidation_follow),
            Box::new(fake_breakout_reversal),
        ];
        Self {
            config,
            store,
            strategies,
            arbitrator: Arbitrator::new(arbitrator_config),
            risk_engine,
            notifier,
            postback,
        }
    }

    /// Runs the full pipeline for one symbol at `now`. Returns the emitted
    /// card, if any; `None` covers both "nothing triggered" and "a trigger
    /// was suppressed" — the suppression reason is logged, not returned, to
    /// keep the pipeline's output type simple for its one caller (the tick
    /// loop in `main`).
    pub async fn tick(&self, symbol: &str, now: DateTime<Utc>) -> Option<crate::types::ProposalCard> {
        let snap = self.store.snapshot(symbol);
        let cooldown_remaining_ms = self.risk_engine.cooldown_remaining_ms(symbol, now);

        if snap.klines_1m.len() < MIN_KLINES_FOR_WARMUP || snap.price.is_none() {
            self.log_skip(symbol, SkipReason::InsufficientWarmup, cooldown_remaining_ms, None, None, None, None);
            return None;
        }
        let price = snap.price?;

        let funding_age = snap.funding_ts.map(|ts| (now - ts).num_seconds());
        match funding_age {
            None => {
                self.log_skip(symbol, SkipReason::FundingMissing, cooldown_remaining_ms, None, None, None, None);
                return None;
            }
            Some(age) if age > self.config.funding_stale_seconds => {
                self.log_skip(symbol, SkipReason::FundingStale, cooldown_remaining_ms, None, None, None, None);
                return None;
            }
            _ => {}
        }

        // funding freshness only covers `funding_ts`; mark price and open
        // interest are fetched independently and can lag or be entirely
        // absent even while funding looks fresh, so this gate is checked
        // on its own rather than folded into the funding check above.
        let derivatives_ok = snap.last_funding_rate.is_some() && snap.open_interest.is_some() && snap.mark_price.is_some();
        if !derivatives_ok {
            self.log_skip(symbol, SkipReason::DerivativesMissing, cooldown_remaining_ms, None, None, None, Some(false));
            return None;
        }

        let oi_freshness = match snap.open_interest_ts {
            None => OiFreshness::Unknown,
            Some(ts) => {
                if (now - ts).num_seconds() > self.config.oi_stale_seconds {
                    OiFreshness::Stale
                } else {
                    OiFreshness::Fresh
                }
            }
        };

        let closes: Vec<f64> = snap.klines_1m.iter().map(|c| c.close).collect();
        let return_5m = return_over(&closes, 5).unwrap_or(0.0);

        let candles_15m = aggregate_to_window(&snap.klines_1m, 15);
        let atr_15m_series = atr_series(&candles_15m, ATR_PERIOD_15M);
        let atr_15m = atr_15m_series.last().copied().unwrap_or(0.0);
        let atr_15m_baseline = if atr_15m_series.len() > 1 {
            let baseline_slice = &atr_15m_series[..atr_15m_series.len() - 1];
            baseline_slice.iter().sum::<f64>() / baseline_slice.len() as f64
        } else {
            atr_15m
        };

        let oi_series: Vec<f64> = snap.open_interest_series.iter().map(|(_, v)| *v).collect();
        let oi_buckets_15m = aggregate_oi_to_15m(&oi_series, self.config.oi_samples_per_15m.max(1));
        let open_interest_zscore_15m = oi_zscore(&oi_buckets_15m, self.config.oi_zscore_baseline_buckets);
        let open_interest_delta_15m = oi_delta_pct(&oi_buckets_15m, OI_DELTA_PCT_LOOKBACK);

        let mark_price = snap.mark_price.expect("derivatives_ok checked above");
        let price_mark_divergence = (price - mark_price).abs() / price;

        let ctx = SignalContext {
            symbol: symbol.to_string(),
            timestamp: now,
            price,
            klines_1m: snap.klines_1m.clone(),
            return_5m,
            atr_15m,
            atr_15m_baseline,
            funding_rate: snap.last_funding_rate.expect("derivatives_ok checked above"),
            open_interest: snap.open_interest.expect("derivatives_ok checked above"),
            mark_price,
            open_interest_zscore_15m,
            open_interest_delta_15m,
            last_kline_close_ts: snap.last_kline_close_ts,
        };

        let candidates: Vec<_> = self.strategies.iter().filter_map(|s| s.generate(&ctx)).collect();
        if candidates.is_empty() {
            return None;
        }

        let last_sent = self.risk_engine.get_last_trigger_time(symbol);
        let Some(mut winner) = self.arbitrator.choose_best(candidates, &ctx, last_sent) else {
            self.log_skip(
                symbol,
                SkipReason::NoArbitrationWinner,
                cooldown_remaining_ms,
                Some(atr_15m),
                Some(return_5m),
                Some(price_mark_divergence),
                Some(derivatives_ok),
            );
            return None;
        };
        winner.oi_freshness = oi_freshness;

        let risk_decision = self.risk_engine.evaluate(symbol, now);
        if !risk_decision.allowed {
            info!(
                symbol,
                decision = %Decision::Blocked,
                reason = %SkipReason::RiskDenied,
                risk_reason = %risk_decision.reason,
                cooldown_remaining_ms,
                atr_15m,
                trend_score = return_5m,
                price_mark_divergence,
                derivatives_ok,
                "risk_denied"
            );
            return None;
        }

        if let Err(err) = self.risk_engine.record_trigger(symbol, now) {
            warn!(symbol, error = %err, "risk_trigger_record_failed");
        }

        let trace_id = uuid::Uuid::new_v4().to_string();
        let payload = winner.to_payload(&trace_id);
        self.deliver(symbol, &trace_id, &payload).await;

        info!(
            symbol,
            decision = %Decision::Emit,
            strategy = %winner.strategy,
            side = %winner.side,
            cooldown_remaining_ms,
            atr_15m,
            trend_score = return_5m,
            price_mark_divergence,
            derivatives_ok,
            trace_id = %trace_id,
            "card_emitted"
        );
        Some(winner)
    }

    async fn deliver(&self, symbol: &str, trace_id: &str, payload: &serde_json::Value) {
        match self.notifier.send_json_card(payload).await {
            Ok(outcome) if outcome.ok => {
                info!(symbol, trace_id, latency_ms = outcome.latency_ms, "notifier_delivered");
            }
            Ok(outcome) => warn!(symbol, trace_id, status = ?outcome.status, "notifier_delivery_failed"),
            Err(err) => warn!(symbol, trace_id, error = %err, "notifier_delivery_errored"),
        }

        match self.postback.send(payload).await {
            Ok(outcome) if outcome.ok => {
                info!(symbol, trace_id, latency_ms = outcome.latency_ms, "postback_delivered");
            }
            Ok(outcome) => warn!(symbol, trace_id, status = ?outcome.status, "postback_delivery_failed"),
            Err(err) => warn!(symbol, trace_id, error = %err, "postback_delivery_errored"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn log_skip(
        &self,
        symbol: &str,
        reason: SkipReason,
        cooldown_remaining_ms: i64,
        atr_15m: Option<f64>,
        trend_score: Option<f64>,
        price_mark_divergence: Option<f64>,
        derivatives_ok: Option<bool>,
    ) {
        info!(
            symbol,
            decision = %Decision::NoSignal,
            reason = %reason,
            cooldown_remaining_ms,
            atr_15m = ?atr_15m,
            trend_score = ?trend_score,
            price_mark_divergence = ?price_mark_divergence,
            derivatives_ok = ?derivatives_ok,
            "signal_tick_skipped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Candle;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct NoopNotifier;
    #[async_trait]
    impl Notifier for NoopNotifier {
        async fn send_json_card(&self, _payload: &serde_json::Value) -> anyhow::Result<crate::notifier::NotifierOutcome> {
            Ok(crate::notifier::NotifierOutcome { ok: true, status: None, message_id: None, latency_ms: 0 })
        }
    }

    struct NoopPostback;
    #[async_trait]
    impl Postback for NoopPostback {
        async fn send(&self, _payload: &serde_json::Value) -> anyhow::Result<crate::notifier::PostbackOutcome> {
            Ok(crate::notifier::PostbackOutcome { ok: true, status: None, latency_ms: 0 })
        }
    }

    fn service(store: Arc<DataStore>, risk_engine: Arc<RiskEngine>) -> SignalService {
        SignalService::new(
            SignalServiceConfig {
                funding_stale_seconds: 180,
                oi_stale_seconds: 30,
                oi_samples_per_15m: 15,
                oi_zscore_baseline_buckets: 96,
            },
            store,
            VolBreakoutStrategy {
                return_threshold: 0.012,
                atr_spike_multiplier: 2.0,
                leverage_suggest: 50,
                max_risk_usdt: 10.0,
                ttl_minutes: 15,
                priority: 0,
            },
            FundingOiSkewStrategy {
                funding_extreme: 0.0008,
                oi_zscore_threshold: 1.5,
                leverage_suggest: 50,
                max_risk_usdt: 10.0,
                ttl_minutes: 15,
                priority: 1,
            },
            LiquidationFollowStrategy {
                oi_delta_pct_threshold: 0.03,
                leverage_suggest: 50,
                max_risk_usdt: 10.0,
                ttl_minutes: 15,
                priority: 1,
            },
            FakeBreakoutReversalStrategy {
                sweep_pct: 0.001,
                wick_body_ratio: 1.5,
                stop_buffer_atr: 0.3,
                min_atr_pct: 0.0005,
                leverage_suggest: 50,
                max_risk_usdt: 10.0,
                ttl_minutes: 15,
                priority: 2,
                max_kline_age_seconds: 120,
            },
            ArbitratorConfig { dedupe_window_seconds: 1800, entry_similar_pct: 0.002, stop_similar_pct: 0.002 },
            risk_engine,
            Box::new(NoopNotifier),
            Box::new(NoopPostback),
        )
    }

    fn risk_engine(dir: &tempfile::TempDir) -> Arc<RiskEngine> {
        Arc::new(
            RiskEngine::new(
                dir.path().join("risk_state.json"),
                crate::risk_engine::RiskEngineConfig {
                    max_daily_loss_usdt: 100.0,
                    max_cards_per_day: 50,
                    cooldown_after_trigger_minutes: 30,
                    kill_switch: false,
                    pnl_csv_path: None,
                },
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn skips_when_insufficient_warmup() {
        let store = Arc::new(DataStore::new(&["BTCUSDT".to_string()]));
        let dir = tempdir().unwrap();
        let svc = service(store, risk_engine(&dir));
        assert!(svc.tick("BTCUSDT", Utc::now()).await.is_none());
    }

    #[tokio::test]
    async fn skips_when_funding_missing_even_with_full_warmup() {
        let store = Arc::new(DataStore::new(&["BTCUSDT".to_string()]));
        let now = Utc::now();
        for i in 0..MIN_KLINES_FOR_WARMUP {
            store.upsert_ws_kline("BTCUSDT", Candle::new(100.0, 101.0, 99.0, 100.0), i as i64, true, now);
        }
        store.update_price("BTCUSDT", 100.0, now);
        let dir = tempdir().unwrap();
        let svc = service(store, risk_engine(&dir));
        assert!(svc.tick("BTCUSDT", now).await.is_none());
    }

    #[tokio::test]
    async fn skips_when_derivatives_missing() {
        let store = Arc::new(DataStore::new(&["BTCUSDT".to_string()]));
        let now = Utc::now();
        for i in 0..MIN_KLINES_FOR_WARMUP {
            store.upsert_ws_kline("BTCUSDT", Candle::new(100.0, 101.0, 99.0, 100.0), i as i64, true, now);
        }
        store.update_price("BTCUSDT", 100.0, now);
        store.update_funding_rate("BTCUSDT", 0.0001, None, now);
        // open interest and mark price left unset: derivatives gate must trip
        let dir = tempdir().unwrap();
        let svc = service(store, risk_engine(&dir));
        assert!(svc.tick("BTCUSDT", now).await.is_none());
    }

    #[tokio::test]
    async fn emits_card_when_volatility_breakout_triggers() {
        let store = Arc::new(DataStore::new(&["BTCUSDT".to_string()]));
        let now = Utc::now();
        for i in 0..MIN_KLINES_FOR_WARMUP {
            let close = 100.0 + (i as f64) * 0.001;
            store.upsert_ws_kline("BTCUSDT", Candle::new(close, close + 0.5, close - 0.5, close), i as i64, true, now);
        }
        // force a sharp final leg so the 5m return trips the vol_breakout threshold
        for i in 0..5 {
            let close = 103.0 + i as f64 * 0.5;
            store.upsert_ws_kline(
                "BTCUSDT",
                Candle::new(close, close + 0.5, close - 0.5, close),
                (MIN_KLINES_FOR_WARMUP + i) as i64,
                true,
                now,
            );
        }
        store.update_price("BTCUSDT", 105.0, now);
        store.update_funding_rate("BTCUSDT", 0.0001, None, now);
        store.update_open_interest("BTCUSDT", 1000.0, now);
        store.update_premium_index("BTCUSDT", 105.0, now);

        let dir = tempdir().unwrap();
        let svc = service(store, risk_engine(&dir));
        let card = svc.tick("BTCUSDT", now).await;
        assert!(card.is_some());
    }

    #[tokio::test]
    async fn risk_engine_cooldown_suppresses_second_trigger() {
        let store = Arc::new(DataStore::new(&["BTCUSDT".to_string()]));
        let now = Utc::now();
        for i in 0..MIN_KLINES_FOR_WARMUP + 5 {
            let close = 100.0 + (i as f64) * 0.5;
            store.upsert_ws_kline("BTCUSDT", Candle::new(close, close + 0.5, close - 0.5, close), i as i64, true, now);
        }
        store.update_price("BTCUSDT", 100.0 + MIN_KLINES_FOR_WARMUP as f64 * 0.5, now);
        store.update_funding_rate("BTCUSDT", 0.0001, None, now);
        store.update_open_interest("BTCUSDT", 1000.0, now);
        store.update_premium_index("BTCUSDT", 100.0 + MIN_KLINES_FOR_WARMUP as f64 * 0.5, now);

        let dir = tempdir().unwrap();
        let risk = risk_engine(&dir);
        let svc = service(store, risk.clone());
        let first = svc.tick("BTCUSDT", now).await;
        assert!(first.is_some());

        let second = svc.tick("BTCUSDT", now + chrono::Duration::seconds(5)).await;
        assert!(second.is_none());
    }
}
