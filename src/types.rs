// =============================================================================
// Shared types used across the signal engine
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// An immutable OHLC candle. Ordering is positional within its containing
/// sequence — candles carry no timestamp of their own.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    pub fn new(open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            open,
            high,
            low,
            close,
        }
    }
}

/// Trade direction for an emitted proposal card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Freshness tag propagated on a card when open-interest data may be stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OiFreshness {
    Fresh,
    Stale,
    Unknown,
}

impl std::fmt::Display for OiFreshness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::Stale => write!(f, "stale"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A single funding-rate observation, as returned by the funding-rate-history
/// REST endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FundingRatePoint {
    pub funding_rate: f64,
    pub funding_time_ms: i64,
}

/// An immutable trade proposal produced by one strategy and, after
/// arbitration and risk gating, emitted to the notifier/postback sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalCard {
    pub symbol: String,
    pub strategy: String,
    pub side: Side,
    pub entry: f64,
    pub stop: f64,
    pub leverage_suggest: i64,
    pub position_usdt: f64,
    pub max_risk_usdt: f64,
    pub ttl_minutes: i64,
    pub rationale: String,
    pub created_at: String,
    pub priority: i64,
    pub confidence: f64,
    pub oi_freshness: OiFreshness,
}

/// Fields every strategy supplies when building a [`ProposalCard`].
pub struct ProposalCardParams<'a> {
    pub symbol: &'a str,
    pub strategy: &'a str,
    pub side: Side,
    pub entry: f64,
    pub stop: f64,
    pub leverage_suggest: i64,
    pub position_usdt: f64,
    pub max_risk_usdt: f64,
    pub ttl_minutes: i64,
    pub rationale: String,
    pub priority: i64,
    pub confidence: f64,
}

impl ProposalCard {
    /// Build a new card. `oi_freshness` defaults to `Unknown` and is set by
    /// the signal service once a card is chosen for emission.
    pub fn create(params: ProposalCardParams<'_>) -> Self {
        Self {
            symbol: params.symbol.to_string(),
            strategy: params.strategy.to_string(),
            side: params.side,
            entry: params.entry,
            stop: params.stop,
            leverage_suggest: params.leverage_suggest,
            position_usdt: params.position_usdt,
            max_risk_usdt: params.max_risk_usdt,
            ttl_minutes: params.ttl_minutes,
            rationale: params.rationale,
            created_at: Utc::now().to_rfc3339(),
            priority: params.priority,
            confidence: params.confidence.clamp(0.0, 100.0),
            oi_freshness: OiFreshness::Unknown,
        }
    }

    /// Flatten into a payload map suitable for a notifier/postback sink,
    /// plus a trace id (spec.md §6).
    pub fn to_payload(&self, trace_id: &str) -> serde_json::Value {
        serde_json::json!({
            "symbol": self.symbol,
            "strategy": self.strategy,
            "side": self.side.to_string(),
            "entry": self.entry,
            "stop": self.stop,
            "leverage_suggest": self.leverage_suggest,
            "position_usdt": self.position_usdt,
            "max_risk_usdt": self.max_risk_usdt,
            "ttl_minutes": self.ttl_minutes,
            "rationale": self.rationale,
            "created_at": self.created_at,
            "priority": self.priority,
            "confidence": self.confidence,
            "oi_freshness": self.oi_freshness.to_string(),
            "trace_id": trace_id,
        })
    }
}
