// =============================================================================
// Strategies — independent signal detectors fanned out over a SignalContext
// =============================================================================
//
// Each strategy is a stateless detector: given a `SignalContext` it either
// returns a `ProposalCard` or `None`. Strategies never see each other's
// output; the arbitrator is what picks a winner among whatever a tick's
// fan-out produces.

pub mod fake_breakout_reversal;
pub mod funding_oi_skew;
pub mod liquidation_follow;
pub mod vol_breakout;

use chrono::{DateTime, Utc};

use crate::types::{Candle, ProposalCard};

/// Per-tick, per-symbol feature bundle every strategy reads from. Built by
/// the signal service from the latest `DataStore` snapshot plus derived
/// features (returns, ATR, OI stats).
#[derive(Debug, Clone)]
pub struct SignalContext {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub klines_1m: Vec<Candle>,
    pub return_5m: f64,
    pub atr_15m: f64,
    pub atr_15m_baseline: f64,
    pub funding_rate: f64,
    pub open_interest: f64,
    pub mark_price: f64,
    pub open_interest_zscore_15m: Option<f64>,
    pub open_interest_delta_15m: Option<f64>,
    pub last_kline_close_ts: Option<DateTime<Utc>>,
}

/// A signal detector. Implementations carry their own tunable thresholds
/// and are otherwise immutable and side-effect free.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, ctx: &SignalContext) -> Option<ProposalCard>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::Utc;

    pub fn base_ctx() -> SignalContext {
        SignalContext {
            symbol: "BTCUSDT".to_string(),
            timestamp: Utc::now(),
            price: 100.0,
            klines_1m: Vec::new(),
            return_5m: 0.0,
            atr_15m: 1.0,
            atr_15m_baseline: 1.0,
            funding_rate: 0.0,
            open_interest: 1000.0,
            mark_price: 100.0,
            open_interest_zscore_15m: None,
            open_interest_delta_15m: None,
            last_kline_close_ts: Some(Utc::now()),
        }
    }
}
