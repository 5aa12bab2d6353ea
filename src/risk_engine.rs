// =============================================================================
// RiskEngine — daily loss cap, daily card cap, per-symbol cooldown, kill switch
// =============================================================================
//
// State (per-day card counts and realized loss, last-trigger timestamps per
// symbol) is persisted as JSON and reloaded on every evaluation so multiple
// process restarts share a consistent view. Writes use the teacher's
// write-to-temp-then-rename pattern (`runtime_config.rs`) so a crash
// mid-write can never leave a corrupt or half-written state file behind —
// the original Python implementation wrote in place, which could tear the
// file on a crash.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DayState {
    #[serde(default)]
    pub cards_count: u32,
    #[serde(default)]
    pub realized_loss_usdt: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RiskState {
    #[serde(default)]
    pub days: HashMap<String, DayState>,
    #[serde(default)]
    pub last_trigger_by_symbol: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskDecision {
    pub allowed: bool,
    pub reason: String,
}

impl RiskDecision {
    fn allow() -> Self {
        Self { allowed: true, reason: "ok".to_string() }
    }
    fn deny(reason: &str) -> Self {
        Self { allowed: false, reason: reason.to_string() }
    }
}

pub struct RiskEngineConfig {
    pub max_daily_loss_usdt: f64,
    pub max_cards_per_day: u32,
    pub cooldown_after_trigger_minutes: i64,
    pub kill_switch: bool,
    pub pnl_csv_path: Option<PathBuf>,
}

pub struct RiskEngine {
    state_path: PathBuf,
    config: RiskEngineConfig,
    state: Mutex<RiskState>,
}

impl RiskEngine {
    pub fn new(state_path: impl Into<PathBuf>, config: RiskEngineConfig) -> Result<Self> {
        let state_path = state_path.into();
        if let Some(parent) = state_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create risk state directory {}", parent.display()))?;
        }

        let state = if state_path.exists() {
            Self::load_state(&state_path)?
        } else {
            let fresh = RiskState::default();
            Self::save_state_atomic(&state_path, &fresh)?;
            fresh
        };

        Ok(Self { state_path, config, state: Mutex::new(state) })
    }

    /// Whether a new card may be emitted for `symbol` right now.
    pub fn evaluate(&self, symbol: &str, now: DateTime<Utc>) -> RiskDecision {
        if self.config.kill_switch {
            return RiskDecision::deny("kill_switch_enabled");
        }

        let state = self.state.lock();
        let date_key = now.date_naive().to_string();
        let day_state = state.days.get(&date_key).cloned().unwrap_or_default();
        let realized_loss = self.resolve_realized_loss(&date_key, &day_state);

        if realized_loss >= self.config.max_daily_loss_usdt {
            return RiskDecision::deny("max_daily_loss_exceeded");
        }

        if day_state.cards_count >= self.config.max_cards_per_day {
            return RiskDecision::deny("max_cards_per_day_exceeded");
        }

        if let Some(cooldown_until) = Self::cooldown_until(symbol, &state, self.config.cooldown_after_trigger_minutes) {
            if now < cooldown_until {
                return RiskDecision::deny("symbol_cooldown_active");
            }
        }

        RiskDecision::allow()
    }

    /// Record that a card was emitted for `symbol`, incrementing the day's
    /// card count and resetting its cooldown clock. Persists immediately.
    pub fn record_trigger(&self, symbol: &str, now: DateTime<Utc>) -> Result<()> {
        let date_key = now.date_naive().to_string();
        let mut state = self.state.lock();
        let day_state = state.days.entry(date_key).or_default();
        day_state.cards_count += 1;
        state.last_trigger_by_symbol.insert(symbol.to_string(), now);

        Self::save_state_atomic(&self.state_path, &state)?;
        info!(symbol, cards_count = day_state.cards_count, "risk_trigger_recorded");
        Ok(())
    }

    pub fn get_last_trigger_time(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.state.lock().last_trigger_by_symbol.get(symbol).copied()
    }

    /// Milliseconds left on `symbol`'s cooldown at `now`; `0` if untriggered
    /// or already past its cooldown window.
    pub fn cooldown_remaining_ms(&self, symbol: &str, now: DateTime<Utc>) -> i64 {
        let state = self.state.lock();
        match Self::cooldown_until(symbol, &state, self.config.cooldown_after_trigger_minutes) {
            Some(until) if until > now => (until - now).num_milliseconds(),
            _ => 0,
        }
    }

    /// Record a realized trade loss against today's running total. Not
    /// exercised by the signal path (no order placement), but available
    /// for an external reconciliation job to call.
    pub fn record_realized_loss(&self, loss_usdt: f64, now: DateTime<Utc>) -> Result<()> {
        let date_key = now.date_naive().to_string();
        let mut state = self.state.lock();
        let day_state = state.days.entry(date_key).or_default();
        day_state.realized_loss_usdt += loss_usdt.abs();
        Self::save_state_atomic(&self.state_path, &state)
    }

    fn cooldown_until(symbol: &str, state: &RiskState, cooldown_minutes: i64) -> Option<DateTime<Utc>> {
        let last_trigger = state.last_trigger_by_symbol.get(symbol)?;
        Some(*last_trigger + chrono::Duration::minutes(cooldown_minutes))
    }

    /// If a PnL CSV is configured and exists, sum today's negative entries
    /// from it instead of trusting the JSON state's own running total —
    /// the CSV is the read-only source of truth for realized PnL.
    fn resolve_realized_loss(&self, date_key: &str, day_state: &DayState) -> f64 {
        let Some(path) = &self.config.pnl_csv_path else {
            return day_state.realized_loss_usdt;
        };
        let Ok(content) = std::fs::read_to_string(path) else {
            return day_state.realized_loss_usdt;
        };

        let mut realized_loss = 0.0;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("date") {
                continue;
            }
            let Some((date_value, pnl_value)) = line.split_once(',') else { continue };
            if date_value.trim() != date_key {
                continue;
            }
            if let Ok(pnl) = pnl_value.trim().parse::<f64>() {
                if pnl < 0.0 {
                    realized_loss += pnl.abs();
                }
            }
        }
        realized_loss
    }

    fn load_state(path: &Path) -> Result<RiskState> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read risk state from {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("failed to parse risk state from {}", path.display()))
    }

    fn save_state_atomic(path: &Path, state: &RiskState) -> Result<()> {
        let content = serde_json::to_string_pretty(state).context("failed to serialise risk state to JSON")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp risk state to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp risk state to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;
    use tempfile::tempdir;

    fn engine(dir: &tempfile::TempDir, cfg_overrides: impl FnOnce(&mut RiskEngineConfig)) -> RiskEngine {
        let path = dir.path().join("risk_state.json");
        let mut config = RiskEngineConfig {
            max_daily_loss_usdt: 30.0,
            max_cards_per_day: 5,
            cooldown_after_trigger_minutes: 30,
            kill_switch: false,
            pnl_csv_path: None,
        };
        cfg_overrides(&mut config);
        RiskEngine::new(path, config).unwrap()
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn fresh_engine_allows_first_trigger() {
        let dir = tempdir().unwrap();
        let engine = engine(&dir, |_| {});
        let decision = engine.evaluate("BTCUSDT", ts(0));
        assert!(decision.allowed);
    }

    #[test]
    fn kill_switch_denies_everything() {
        let dir = tempdir().unwrap();
        let engine = engine(&dir, |c| c.kill_switch = true);
        let decision = engine.evaluate("BTCUSDT", ts(0));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "kill_switch_enabled");
    }

    #[test]
    fn cooldown_blocks_symbol_after_trigger_and_releases_after_window() {
        let dir = tempdir().unwrap();
        let engine = engine(&dir, |_| {});
        engine.record_trigger("BTCUSDT", ts(0)).unwrap();

        let during = engine.evaluate("BTCUSDT", ts(60));
        assert!(!during.allowed);
        assert_eq!(during.reason, "symbol_cooldown_active");

        let after = engine.evaluate("BTCUSDT", ts(31 * 60));
        assert!(after.allowed);
    }

    #[test]
    fn max_cards_per_day_trips_after_limit() {
        let dir = tempdir().unwrap();
        let engine = engine(&dir, |c| c.max_cards_per_day = 2);
        engine.record_trigger("BTCUSDT", ts(0)).unwrap();
        engine.record_trigger("ETHUSDT", ts(10)).unwrap();
        let decision = engine.evaluate("SOLUSDT", ts(20));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "max_cards_per_day_exceeded");
    }

    #[test]
    fn state_persists_atomically_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("risk_state.json");
        {
            let engine = RiskEngine::new(
                &path,
                RiskEngineConfig {
                    max_daily_loss_usdt: 30.0,
                    max_cards_per_day: 5,
                    cooldown_after_trigger_minutes: 30,
                    kill_switch: false,
                    pnl_csv_path: None,
                },
            )
            .unwrap();
            engine.record_trigger("BTCUSDT", ts(0)).unwrap();
        }
        assert!(!dir.path().join("risk_state.json.tmp").exists());
        let engine2 = RiskEngine::new(
            &path,
            RiskEngineConfig {
                max_daily_loss_usdt: 30.0,
                max_cards_per_day: 5,
                cooldown_after_trigger_minutes: 30,
                kill_switch: false,
                pnl_csv_path: None,
            },
        )
        .unwrap();
        assert!(engine2.get_last_trigger_time("BTCUSDT").is_some());
    }

    #[test]
    fn pnl_csv_overrides_json_realized_loss() {
        let dir = tempdir().unwrap();
        let csv_path = dir.path().join("pnl.csv");
        let date_key = ts(0).date_naive().to_string();
        let mut file = std::fs::File::create(&csv_path).unwrap();
        writeln!(file, "date,pnl").unwrap();
        writeln!(file, "{},-20", date_key).unwrap();
        writeln!(file, "{},-15", date_key).unwrap();

        let engine = engine(&dir, |c| {
            c.pnl_csv_path = Some(csv_path);
            c.max_daily_loss_usdt = 30.0;
        });
        let decision = engine.evaluate("BTCUSDT", ts(0));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "max_daily_loss_exceeded");
    }
}
