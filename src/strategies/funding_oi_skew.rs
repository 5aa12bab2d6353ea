// =============================================================================
// FundingOiSkewStrategy — contrarian fade of a crowded, funding-extreme trade
// =============================================================================

use crate::calculations::position_size;
use crate::strategies::{SignalContext, Strategy};
use crate::types::{ProposalCard, ProposalCardParams, Side};

/// Fades a crowded long or short once funding is extreme and open interest
/// has spiked relative to its 15m baseline — a position everyone is
/// already in is a position a squeeze can unwind.
pub struct FundingOiSkewStrategy {
    pub funding_extreme: f64,
    pub oi_zscore_threshold: f64,
    pub leverage_suggest: i64,
    pub max_risk_usdt: f64,
    pub ttl_minutes: i64,
    pub priority: i64,
}

impl Strategy for FundingOiSkewStrategy {
    fn name(&self) -> &str {
        "funding_oi_skew"
    }

    fn generate(&self, ctx: &SignalContext) -> Option<ProposalCard> {
        let oi_zscore = ctx.open_interest_zscore_15m?;

        let funding = ctx.funding_rate;
        let crowded_long = funding > 0.0 && ctx.return_5m > 0.0;
        let crowded_short = funding < 0.0 && ctx.return_5m < 0.0;

        if funding.abs() < self.funding_extreme {
            return None;
        }
        if oi_zscore < self.oi_zscore_threshold {
            return None;
        }
        if !(crowded_long || crowded_short) {
            return None;
        }

        let side = if crowded_long { Side::Short } else { Side::Long };
        let entry = ctx.price;
        let stop = match side {
            Side::Short => entry + ctx.atr_15m,
            Side::Long => entry - ctx.atr_15m,
        };
        let position_usdt = position_size(entry, stop, self.max_risk_usdt)?;

        let confidence = (45.0 + (funding.abs() / self.funding_extreme.max(1e-9)) * 20.0 + oi_zscore * 10.0)
            .min(100.0);

        let rationale = format!(
            "funding={:.6}, oi_zscore_15m={:.2}, crowded={} -> contrarian {}",
            funding,
            oi_zscore,
            if crowded_long { "long" } else { "short" },
            side,
        );

        Some(ProposalCard::create(ProposalCardParams {
            symbol: &ctx.symbol,
            strategy: self.name(),
            side,
            entry,
            stop,
            leverage_suggest: self.leverage_suggest,
            position_usdt,
            max_risk_usdt: self.max_risk_usdt,
            ttl_minutes: self.ttl_minutes,
            rationale,
            priority: self.priority,
            confidence,
        }))
    }
}
