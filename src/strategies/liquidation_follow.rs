// =============================================================================
// LiquidationFollowStrategy — follow trend when OI and funding both confirm
// =============================================================================

use crate::calculations::position_size;
use crate::strategies::{SignalContext, Strategy};
use crate::types::{ProposalCard, ProposalCardParams, Side};

/// Follows the prevailing direction when open interest is building fast,
/// the 5m return is already meaningful, and funding direction agrees with
/// the trend — a signature of forced liquidations piling onto one side.
pub struct LiquidationFollowStrategy {
    pub oi_delta_pct_threshold: f64,
    pub leverage_suggest: i64,
    pub max_risk_usdt: f64,
    pub ttl_minutes: i64,
    pub priority: i64,
}

impl Strategy for LiquidationFollowStrategy {
    fn name(&self) -> &str {
        "liquidation_follow"
    }

    fn generate(&self, ctx: &SignalContext) -> Option<ProposalCard> {
        let oi_delta = ctx.open_interest_delta_15m?;

        let trend_dir = if ctx.return_5m > 0.0 { 1 } else { -1 };
        let funding_dir = if ctx.funding_rate > 0.0 { 1 } else { -1 };
        let aligned = trend_dir == funding_dir;
        let trigger = oi_delta >= self.oi_delta_pct_threshold && ctx.return_5m.abs() >= 0.01 && aligned;
        if !trigger {
            return None;
        }

        let side = if ctx.return_5m > 0.0 { Side::Long } else { Side::Short };
        let entry = ctx.price;
        let stop = match side {
            Side::Long => entry - (1.5 * ctx.atr_15m),
            Side::Short => entry + (1.5 * ctx.atr_15m),
        };
        let position_usdt = position_size(entry, stop, self.max_risk_usdt)?;

        let confidence = (40.0
            + (oi_delta / self.oi_delta_pct_threshold.max(1e-9)) * 25.0
            + ctx.return_5m.abs() * 1000.0)
            .min(100.0);

        let rationale = format!(
            "oi_delta_15m={:.2}%, funding={:.6}, return_5m={:.2}%, aligned_trend={}",
            oi_delta * 100.0,
            ctx.funding_rate,
            ctx.return_5m * 100.0,
            aligned,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::base_ctx;

    fn strategy() -> LiquidationFollowStrategy {
        LiquidationFollowStrategy {
            oi_delta_pct_threshold: 0.03,
            leverage_suggest: 20,
            max_risk_usdt: 10.0,
            ttl_minutes: 15,
            priority: 2,
        }
    }

    #[test]
    fn no_signal_without_oi_delta() {
        let ctx = base_ctx();
        assert!(strategy().generate(&ctx).is_none());
    }

    #[test]
    fn aligned_upward_trend_produces_long() {
        let mut ctx = base_ctx();
        ctx.open_interest_delta_15m = Some(0.05);
        ctx.return_5m = 0.02;
        ctx.funding_rate = 0.0003;
        let card = strategy().generate(&ctx).unwrap();
        assert_eq!(card.side, Side::Long);
    }

    #[test]
    fn misaligned_funding_suppresses_signal() {
        let mut ctx = base_ctx();
        ctx.open_interest_delta_15m = Some(0.05);
        ctx.return_5m = 0.02;
        ctx.funding_rate = -0.0003;
        assert!(strategy().generate(&ctx).is_none());
    }

    #[test]
    fn below_return_floor_suppresses_signal() {
        let mut ctx = base_ctx();
        ctx.open_interest_delta_15m = Some(0.05);
        ctx.return_5m = 0.001;
        ctx.funding_rate = 0.0003;
        assert!(strategy().generate(&ctx).is_none());
    }
}
