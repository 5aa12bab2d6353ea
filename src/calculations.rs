// =============================================================================
// Pure calculation functions — returns, ATR, window aggregation, OI stats
// =============================================================================
//
// Every function here is deterministic and side-effect free: given the same
// slice of candles or series it always returns the same value. Callers treat
// `None` as "not enough data", never as an error.

use crate::types::Candle;

/// K-period percentage return over `closes`, using the close `lookback`
/// candles back as the base. Returns `None` if there are fewer than
/// `lookback + 1` closes.
pub fn return_over(closes: &[f64], lookback: usize) -> Option<f64> {
    if lookback == 0 || closes.len() < lookback + 1 {
        return None;
    }
    let last = *closes.last()?;
    let base = closes[closes.len() - 1 - lookback];
    if base == 0.0 {
        return None;
    }
    Some((last - base) / base)
}

/// Aggregate a sequence of 1m candles into non-overlapping `window`-sized
/// candles (e.g. window=15 turns 1m candles into 15m candles). Any trailing
/// partial window (fewer than `window` candles left) is dropped, since it
/// does not represent a closed window.
pub fn aggregate_to_window(candles: &[Candle], window: usize) -> Vec<Candle> {
    if window == 0 {
        return Vec::new();
    }
    let full_windows = candles.len() / window;
    let mut out = Vec::with_capacity(full_windows);
    for i in 0..full_windows {
        let chunk = &candles[i * window..(i + 1) * window];
        let open = chunk[0].open;
        let close = chunk[chunk.len() - 1].close;
        let high = chunk.iter().fold(f64::MIN, |acc, c| acc.max(c.high));
        let low = chunk.iter().fold(f64::MAX, |acc, c| acc.min(c.low));
        out.push(Candle::new(open, high, low, close));
    }
    out
}

/// Per-candle true range, given the previous candle's close. The first
/// candle in `candles` has no predecessor and is skipped, so the returned
/// vector has `candles.len().saturating_sub(1)` entries.
pub fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    if candles.len() < 2 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(candles.len() - 1);
    for pair in candles.windows(2) {
        let prev_close = pair[0].close;
        let cur = pair[1];
        let tr = (cur.high - cur.low)
            .max((cur.high - prev_close).abs())
            .max((cur.low - prev_close).abs());
        out.push(tr);
    }
    out
}

/// Simple (non-Wilder) rolling mean of true range over `period` candles.
/// This is deliberately a plain SMA-of-TR, not Wilder's smoothing — the
/// source system's `calculations.atr_series` defines ATR this way.
pub fn atr_series(candles: &[Candle], period: usize) -> Vec<f64> {
    if period == 0 {
        return Vec::new();
    }
    let trs = true_ranges(candles);
    if trs.len() < period {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(trs.len() - period + 1);
    let mut window_sum: f64 = trs[..period].iter().sum();
    out.push(window_sum / period as f64);
    for i in period..trs.len() {
        window_sum += trs[i] - trs[i - period];
        out.push(window_sum / period as f64);
    }
    out
}

/// Position size in USDT such that a stop-out at `stop` loses exactly
/// `max_risk_usdt`. Returns `None` if `entry` and `stop` coincide.
pub fn position_size(entry: f64, stop: f64, max_risk_usdt: f64) -> Option<f64> {
    let risk_pct = (entry - stop).abs() / entry;
    if risk_pct <= 0.0 {
        return None;
    }
    Some(max_risk_usdt / risk_pct)
}

/// Aggregate a raw open-interest series (one sample per ingestion tick,
/// assumed roughly evenly spaced) into 15-minute buckets by averaging
/// samples that fall in the same bucket, keyed by bucket index from the
/// start of the slice. `samples_per_15m` is the expected number of raw
/// samples per 15-minute bucket (derived from the ingestion interval).
pub fn aggregate_oi_to_15m(series: &[f64], samples_per_15m: usize) -> Vec<f64> {
    if samples_per_15m == 0 || series.is_empty() {
        return Vec::new();
    }
    series
        .chunks(samples_per_15m)
        .filter(|chunk| chunk.len() == samples_per_15m)
        .map(|chunk| chunk.iter().sum::<f64>() / chunk.len() as f64)
        .collect()
}

/// Z-score of the latest 15m open-interest bucket against the trailing
/// `lookback` buckets before it (population stddev). Returns `None` if
/// there are fewer than `lookback + 1` buckets, or stddev is zero.
pub fn oi_zscore(buckets_15m: &[f64], lookback: usize) -> Option<f64> {
    if lookback == 0 || buckets_15m.len() < lookback + 1 {
        return None;
    }
    let latest = *buckets_15m.last()?;
    let history = &buckets_15m[buckets_15m.len() - 1 - lookback..buckets_15m.len() - 1];
    let mean = history.iter().sum::<f64>() / history.len() as f64;
    let variance = history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / history.len() as f64;
    let stddev = variance.sqrt();
    if stddev == 0.0 {
        return None;
    }
    Some((latest - mean) / stddev)
}

/// Percentage change of the latest 15m open-interest bucket versus the
/// bucket `lookback` buckets earlier. Returns `None` if there are fewer
/// than `lookback + 1` buckets, or the earlier bucket is zero.
pub fn oi_delta_pct(buckets_15m: &[f64], lookback: usize) -> Option<f64> {
    if lookback == 0 || buckets_15m.len() < lookback + 1 {
        return None;
    }
    let latest = *buckets_15m.last()?;
    let prior = buckets_15m[buckets_15m.len() - 1 - lookback];
    if prior == 0.0 {
        return None;
    }
    Some((latest - prior) / prior)
}
