// =============================================================================
// FakeBreakoutReversalStrategy — reversal after a liquidity-sweep wick
// =============================================================================

use crate::calculations::position_size;
use crate::strategies::{SignalContext, Strategy};
use crate::types::{ProposalCard, ProposalCardParams, Side};

/// Detects a 1m candle that sweeps beyond the prior 20-candle high/low on a
/// long wick and closes back inside the range — a classic liquidity-grab
/// reversal — and fades it.
pub struct FakeBreakoutReversalStrategy {
    pub sweep_pct: f64,
    pub wick_body_ratio: f64,
    pub stop_buffer_atr: f64,
    pub min_atr_pct: f64,
    pub leverage_suggest: i64,
    pub max_risk_usdt: f64,
    pub ttl_minutes: i64,
    pub priority: i64,
    pub max_kline_age_seconds: i64,
}

impl Strategy for FakeBreakoutReversalStrategy {
    fn name(&self) -> &str {
        "fake_breakout_reversal"
    }

    fn generate(&self, ctx: &SignalContext) -> Option<ProposalCard> {
        let last_close_ts = ctx.last_kline_close_ts?;
        let age = (ctx.timestamp - last_close_ts).num_seconds();
        if age > self.max_kline_age_seconds {
            return None;
        }

        if ctx.atr_15m < (self.min_atr_pct * ctx.price) {
            return None;
        }

        if ctx.klines_1m.len() < 21 {
            return None;
        }

        let latest = *ctx.klines_1m.last()?;
        let recent_20 = &ctx.klines_1m[ctx.klines_1m.len() - 21..ctx.klines_1m.len() - 1];
        let prev_20m_high = recent_20.iter().fold(f64::MIN, |acc, c| acc.max(c.high));
        let prev_20m_low = recent_20.iter().fold(f64::MAX, |acc, c| acc.min(c.low));

        let body = (latest.close - latest.open).abs().max(1e-9);
        let upper_wick = (latest.high - latest.open.max(latest.close)).max(0.0);
        let lower_wick = (latest.open.min(latest.close) - latest.low).max(0.0);

        let sweep_high = latest.high > prev_20m_high * (1.0 + self.sweep_pct)
            && latest.close < prev_20m_high
            && (upper_wick / body) >= self.wick_body_ratio;
        let sweep_low = latest.low < prev_20m_low * (1.0 - self.sweep_pct)
            && latest.close > prev_20m_low
            && (lower_wick / body) >= self.wick_body_ratio;

        if !(sweep_high || sweep_low) {
            return None;
        }

        let side = if sweep_high { Side::Short } else { Side::Long };
        let entry = ctx.price;
        let (stop, sweep_pct_val, wick_ratio, reclaim_level) = if sweep_high {
            (
                latest.high + (self.stop_buffer_atr * ctx.atr_15m),
                (latest.high / prev_20m_high) - 1.0,
                upper_wick / body,
                prev_20m_high,
            )
        } else {
            (
                latest.low - (self.stop_buffer_atr * ctx.atr_15m),
                1.0 - (latest.low / prev_20m_low),
                lower_wick / body,
                prev_20m_low,
            )
        };

        let position_usdt = position_size(entry, stop, self.max_risk_usdt)?;
        let confidence = (50.0 + (wick_ratio * 10.0) + (sweep_pct_val * 10000.0)).min(100.0);

        let rationale = format!(
            "prev_20m_high={:.4}, prev_20m_low={:.4}, sweep_pct={:.4}%, wick_body={:.2}, reclaim={:.4} -> {}",
            prev_20m_high,
            prev_20m_low,
            sweep_pct_val * 100.0,
            wick_ratio,
            reclaim_level,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::base_ctx;
    use crate::types::Candle;

    fn strategy() -> FakeBreakoutReversalStrategy {
        FakeBreakoutReversalStrategy {
            sweep_pct: 0.001,
            wick_body_ratio: 1.5,
            stop_buffer_atr: 0.3,
            min_atr_pct: 0.0005,
            leverage_suggest: 20,
            max_risk_usdt: 10.0,
            ttl_minutes: 10,
            priority: 3,
            max_kline_age_seconds: 90,
        }
    }

    fn flat_candles(n: usize, high: f64, low: f64) -> Vec<Candle> {
        (0..n).map(|_| Candle::new(100.0, high, low, 100.0)).collect()
    }

    #[test]
    fn no_signal_with_too_few_candles() {
        let mut ctx = base_ctx();
        ctx.atr_15m = 1.0;
        ctx.klines_1m = flat_candles(10, 101.0, 99.0);
        assert!(strategy().generate(&ctx).is_none());
    }

    #[test]
    fn sweep_high_reversal_produces_short() {
        let mut ctx = base_ctx();
        ctx.atr_15m = 1.0;
        let mut candles = flat_candles(20, 101.0, 99.0);
        // latest candle sweeps above prior high then closes back inside with a long upper wick
        candles.push(Candle::new(100.0, 103.0, 99.9, 100.1));
        ctx.klines_1m = candles;
        let card = strategy().generate(&ctx).unwrap();
        assert_eq!(card.side, Side::Short);
        assert!(card.stop > card.entry);
    }

    #[test]
    fn sweep_low_reversal_produces_long() {
        let mut ctx = base_ctx();
        ctx.atr_15m = 1.0;
        let mut candles = flat_candles(20, 101.0, 99.0);
        candles.push(Candle::new(100.0, 100.1, 97.0, 99.9));
        ctx.klines_1m = candles;
        let card = strategy().generate(&ctx).unwrap();
        assert_eq!(card.side, Side::Long);
        assert!(card.stop < card.entry);
    }

    #[test]
    fn stale_kline_close_suppresses_signal() {
        let mut ctx = base_ctx();
        ctx.atr_15m = 1.0;
        let mut candles = flat_candles(20, 101.0, 99.0);
        candles.push(Candle::new(100.0, 103.0, 99.9, 100.1));
        ctx.klines_1m = candles;
        ctx.last_kline_close_ts = Some(ctx.timestamp - chrono::Duration::seconds(200));
        assert!(strategy().generate(&ctx).is_none());
    }

    #[test]
    fn low_atr_suppresses_signal() {
        let mut ctx = base_ctx();
        ctx.atr_15m = 0.0001;
        let mut candles = flat_candles(20, 101.0, 99.0);
        candles.push(Candle::new(100.0, 103.0, 99.9, 100.1));
        ctx.klines_1m = candles;
        assert!(strategy().generate(&ctx).is_none());
    }
}
