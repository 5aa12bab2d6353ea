// =============================================================================
// Arbitrator — pick at most one winning proposal card per symbol per tick
// =============================================================================
//
// Two gates run in sequence: a per-symbol dedupe window (skip entirely if a
// card was already sent recently) and a similarity dedup among the tick's
// candidates (drop cards that echo an already-kept one on the same side
// with a close entry or stop). The remaining candidates are ranked by
// `(priority, confidence, -ttl_minutes)` descending; the top one wins.
// Sorting is stable under input permutation because ties are broken by the
// same total order every time.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::strategies::SignalContext;
use crate::types::ProposalCard;

#[derive(Debug, Clone, Copy)]
pub struct ArbitratorConfig {
    pub dedupe_window_seconds: i64,
    pub entry_similar_pct: f64,
    pub stop_similar_pct: f64,
}

/// Ranking key used both for similarity-dedup ordering and final winner
/// selection. Implements `Ord` via a tuple of ordered floats so sorting is
/// total and deterministic.
fn rank_key(card: &ProposalCard) -> (i64, i64, i64) {
    // confidence and -ttl_minutes are converted to fixed-point integers so
    // the overall key is totally ordered without relying on float Ord.
    let confidence_fp = (card.confidence * 1000.0).round() as i64;
    (card.priority, confidence_fp, -card.ttl_minutes)
}

pub struct Arbitrator {
    config: ArbitratorConfig,
}

impl Arbitrator {
    pub fn new(config: ArbitratorConfig) -> Self {
        Self { config }
    }

    /// Choose the best card among this tick's candidates, or `None` if no
    /// card survives the dedupe window, similarity dedup, or there were no
    /// candidates to begin with. `last_sent` is the last time a card was
    /// emitted for `ctx.symbol`, if any.
    pub fn choose_best(
        &self,
        mut cards: Vec<ProposalCard>,
        ctx: &SignalContext,
        last_sent: Option<DateTime<Utc>>,
    ) -> Option<ProposalCard> {
        if cards.is_empty() {
            return None;
        }

        info!(
            symbol = %ctx.symbol,
            count = cards.len(),
            "arbitration_candidates"
        );

        if let Some(last) = last_sent {
            let elapsed = (ctx.timestamp - last).num_seconds();
            if elapsed <= self.config.dedupe_window_seconds {
                info!(symbol = %ctx.symbol, reason = "dedupe_window", "arbitration_dropped");
                return None;
            }
        }

        cards.sort_by_key(|c| std::cmp::Reverse(rank_key(c)));
        let selected = self.dedupe_similar(cards);
        if selected.is_empty() {
            return None;
        }

        let winner = selected.into_iter().next()?;
        info!(
            symbol = %ctx.symbol,
            strategy = %winner.strategy,
            side = %winner.side,
            priority = winner.priority,
            confidence = winner.confidence,
            "arbitration_winner"
        );
        Some(winner)
    }

    /// `cards` must already be sorted descending by `rank_key`. Keeps the
    /// first (highest-ranked) card in each similarity group and drops the
    /// rest.
    fn dedupe_similar(&self, cards: Vec<ProposalCard>) -> Vec<ProposalCard> {
        let mut kept: Vec<ProposalCard> = Vec::new();
        'outer: for card in cards {
            for existing in &kept {
                let same_side = existing.side == card.side;
                let entry_close = (existing.entry - card.entry).abs() / existing.entry.max(1e-9)
                    < self.config.entry_similar_pct;
                let stop_close = (existing.stop - card.stop).abs() / existing.stop.abs().max(1e-9)
                    < self.config.stop_similar_pct;
                if same_side && (entry_close || stop_close) {
                    info!(
                        strategy = %card.strategy,
                        reason = "similar_entry_or_stop",
                        winner = %existing.strategy,
                        "arbitration_dropped"
                    );
                    continue 'outer;
                }
            }
            kept.push(card);
        }
        kept
    }
}
