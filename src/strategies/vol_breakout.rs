// =============================================================================
// VolBreakoutStrategy — 5m-return spike or ATR expansion breakout
// =============================================================================

use crate::calculations::position_size;
use crate::strategies::{SignalContext, Strategy};
use crate::types::{ProposalCard, ProposalCardParams, Side};

/// Flags a breakout when either the 5-minute return exceeds
/// `return_threshold`, or 15m ATR expands beyond `atr_spike_multiplier`
/// times its trailing baseline.
pub struct VolBreakoutStrategy {
    pub return_threshold: f64,
    pub atr_spike_multiplier: f64,
    pub leverage_suggest: i64,
    pub max_risk_usdt: f64,
    pub ttl_minutes: i64,
    pub priority: i64,
}

impl Strategy for VolBreakoutStrategy {
    fn name(&self) -> &str {
        "vol_breakout_card"
    }

    fn generate(&self, ctx: &SignalContext) -> Option<ProposalCard> {
        let return_trigger = ctx.return_5m.abs() > self.return_threshold;
        let atr_trigger = ctx.atr_15m > (ctx.atr_15m_baseline * self.atr_spike_multiplier);

        if !(return_trigger || atr_trigger) {
            return None;
        }

        let side = if ctx.return_5m >= 0.0 { Side::Long } else { Side::Short };
        let entry = ctx.price;
        let stop = match side {
            Side::Long => entry - (1.2 * ctx.atr_15m),
            Side::Short => entry + (1.2 * ctx.atr_15m),
        };
        let position_usdt = position_size(entry, stop, self.max_risk_usdt)?;

        let score_return = ctx.return_5m.abs() / self.return_threshold.max(1e-9);
        let score_atr = ctx.atr_15m / ctx.atr_15m_baseline.max(1e-9);
        let confidence = (40.0 + score_return * 20.0 + score_atr * 10.0).min(100.0);

        let rationale = format!(
            "triggered: return_5m={:.4}% (th={:.2}%), atr_15m={:.4} vs baseline={:.4}",
            ctx.return_5m * 100.0,
            self.return_threshold * 100.0,
            ctx.atr_15m,
            ctx.atr_15m_baseline,
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
