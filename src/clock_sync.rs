// =============================================================================
// ClockSync — server-clock skew tracking with synced/degraded states
// =============================================================================
//
// Wraps a REST time source behind a small state machine so the rest of the
// engine can ask "what time is it, corrected for server skew" without
// caring whether the last refresh attempt succeeded. On refresh failure the
// previous server sample is dropped entirely rather than reused stale —
// a degraded clock falls back to uncorrected local time until the next
// successful refresh.

use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

/// Capability for fetching the current server time, in milliseconds since
/// the epoch. The production implementation hits Binance's `/time`
/// endpoint; tests use a fake that returns a scripted sequence.
#[async_trait]
pub trait RestTimeSource: Send + Sync {
    async fn fetch_server_time_ms(&self) -> Result<i64>;
}

/// Abstraction over wall-clock and monotonic time so refresh cooldown and
/// degraded-state timers are deterministically testable.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
    fn monotonic_ms(&self) -> i64;
}

/// Real clock backed by `std::time`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn monotonic_ms(&self) -> i64 {
        // A process-local monotonic timeline anchored at first use.
        static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
        let start = START.get_or_init(std::time::Instant::now);
        start.elapsed().as_millis() as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Synced,
    Degraded,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Synced => write!(f, "synced"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// Current clock-sync snapshot, cheap to read under lock.
#[derive(Debug, Clone, Copy)]
pub struct ClockState {
    pub state: SyncState,
    pub last_server_ms: Option<i64>,
    pub clock_skew_ms: i64,
}

struct Inner {
    state: ClockState,
    last_refresh_mono_ms: i64,
    last_force_attempt_mono_ms: Option<i64>,
    degraded_since_mono_ms: Option<i64>,
}

/// Tracks skew between local and exchange server clocks, with a degraded
/// fallback mode when the server is unreachable.
pub struct ClockSync {
    rest: Box<dyn RestTimeSource>,
    clock: Box<dyn Clock>,
    max_clock_error_ms: i64,
    refresh_sec: i64,
    degraded_retry_sec: i64,
    refresh_cooldown_ms: i64,
    degraded_ttl_ms: i64,
    inner: RwLock<Inner>,
    // Mirrors `inner.state.clock_skew_ms` for lock-free reads from hot paths.
    skew_cache_ms: AtomicI64,
}

impl ClockSync {
    pub fn new(
        rest: Box<dyn RestTimeSource>,
        max_clock_error_ms: i64,
        refresh_sec: i64,
        degraded_retry_sec: i64,
        refresh_cooldown_ms: i64,
        degraded_ttl_ms: i64,
    ) -> Self {
        Self::with_clock(
            rest,
            Box::new(SystemClock),
            max_clock_error_ms,
            refresh_sec,
            degraded_retry_sec,
            refresh_cooldown_ms,
            degraded_ttl_ms,
        )
    }

    pub fn with_clock(
        rest: Box<dyn RestTimeSource>,
        clock: Box<dyn Clock>,
        max_clock_error_ms: i64,
        refresh_sec: i64,
        degraded_retry_sec: i64,
        refresh_cooldown_ms: i64,
        degraded_ttl_ms: i64,
    ) -> Self {
        Self {
            rest,
            clock,
            max_clock_error_ms,
            refresh_sec,
            degraded_retry_sec,
            refresh_cooldown_ms,
            degraded_ttl_ms,
            inner: RwLock::new(Inner {
                state: ClockState {
                    state: SyncState::Degraded,
                    last_server_ms: None,
                    clock_skew_ms: 0,
                },
                last_refresh_mono_ms: i64::MIN,
                last_force_attempt_mono_ms: None,
                degraded_since_mono_ms: None,
            }),
            skew_cache_ms: AtomicI64::new(0),
        }
    }

    pub fn compute_clock_skew_ms(local_ms: i64, server_ms: i64) -> i64 {
        server_ms - local_ms
    }

    pub fn compute_now_ms_corrected(local_ms: i64, clock_skew_ms: i64) -> i64 {
        local_ms + clock_skew_ms
    }

    pub fn state(&self) -> ClockState {
        self.inner.read().state
    }

    /// Attempt to refresh the server-time sample. Returns whether the
    /// refresh succeeded. On success the state becomes `Synced` and
    /// `clock_skew_ms`/`last_server_ms` are updated together; on failure
    /// the state becomes `Degraded` and any previous server sample is
    /// discarded (never reused stale).
    pub async fn refresh_server_time(&self, force: bool) -> bool {
        let now_mono = self.clock.monotonic_ms();
        if !force {
            let due = {
                let guard = self.inner.read();
                let interval_sec = if guard.state.state == SyncState::Degraded {
                    self.degraded_retry_sec
                } else {
                    self.refresh_sec
                };
                now_mono - guard.last_refresh_mono_ms >= interval_sec * 1000
            };
            if !due {
                return self.state().state == SyncState::Synced;
            }
        }

        let local_ms = self.clock.now_ms();
        match self.rest.fetch_server_time_ms().await {
            Ok(server_ms) => {
                let skew_ms = Self::compute_clock_skew_ms(local_ms, server_ms);
                let mut guard = self.inner.write();
                guard.state = ClockState {
                    state: SyncState::Synced,
                    last_server_ms: Some(server_ms),
                    clock_skew_ms: skew_ms,
                };
                guard.last_refresh_mono_ms = now_mono;
                guard.degraded_since_mono_ms = None;
                self.skew_cache_ms.store(skew_ms, Ordering::Relaxed);
                if skew_ms.abs() > self.max_clock_error_ms {
                    warn!(skew_ms, max_clock_error_ms = self.max_clock_error_ms, "clock_skew_exceeds_threshold");
                }
                info!(skew_ms, server_ms, "clock_sync_refreshed");
                true
            }
            Err(err) => {
                let mut guard = self.inner.write();
                guard.state = ClockState {
                    state: SyncState::Degraded,
                    last_server_ms: None,
                    clock_skew_ms: 0,
                };
                guard.last_refresh_mono_ms = now_mono;
                if guard.degraded_since_mono_ms.is_none() {
                    guard.degraded_since_mono_ms = Some(now_mono);
                }
                self.skew_cache_ms.store(0, Ordering::Relaxed);
                warn!(error = %err, "clock_sync_refresh_failed");
                false
            }
        }
    }

    /// Current time in milliseconds, corrected for server skew when
    /// synced. While degraded, falls back to uncorrected local time; the
    /// first call after falling into degraded triggers one forced refresh
    /// attempt, further attempts gated by `refresh_cooldown_ms`. A synced
    /// clock whose corrected time has drifted more than `max_clock_error_ms`
    /// away from the last server sample is treated as no longer trustworthy
    /// and is downgraded to degraded before falling through to the same
    /// cooldown-gated forced-refresh path.
    pub async fn now_ms(&self) -> i64 {
        let local_ms = self.clock.now_ms();
        let snapshot = self.state();
        if snapshot.state == SyncState::Synced {
            let corrected = Self::compute_now_ms_corrected(local_ms, snapshot.clock_skew_ms);
            let drifted = match snapshot.last_server_ms {
                Some(last_server_ms) => (corrected - last_server_ms).abs() > self.max_clock_error_ms,
                None => false,
            };
            if !drifted {
                return corrected;
            }
            warn!(
                corrected,
                last_server_ms = ?snapshot.last_server_ms,
                max_clock_error_ms = self.max_clock_error_ms,
                "clock_drift_exceeds_threshold"
            );
            self.degrade_from_drift();
        }

        let now_mono = self.clock.monotonic_ms();
        let should_attempt = {
            let guard = self.inner.read();
            match guard.last_force_attempt_mono_ms {
                None => true,
                Some(last) => now_mono - last >= self.refresh_cooldown_ms,
            }
        };
        if should_attempt {
            self.inner.write().last_force_attempt_mono_ms = Some(now_mono);
            if self.refresh_server_time(true).await {
                let snapshot = self.state();
                return Self::compute_now_ms_corrected(local_ms, snapshot.clock_skew_ms);
            }
        }
        local_ms
    }

    /// Downgrades a drifted synced clock to degraded, discarding the stale
    /// server sample the same way a failed refresh does.
    fn degrade_from_drift(&self) {
        let now_mono = self.clock.monotonic_ms();
        let mut guard = self.inner.write();
        guard.state = ClockState { state: SyncState::Degraded, last_server_ms: None, clock_skew_ms: 0 };
        if guard.degraded_since_mono_ms.is_none() {
            guard.degraded_since_mono_ms = Some(now_mono);
        }
        self.skew_cache_ms.store(0, Ordering::Relaxed);
    }

    /// Whether the clock has been degraded for longer than `degraded_ttl_ms`
    /// — callers use this to escalate (e.g. force a REST-mode fallback).
    pub fn degraded_past_ttl(&self) -> bool {
        let guard = self.inner.read();
        if guard.state.state != SyncState::Degraded {
            return false;
        }
        match guard.degraded_since_mono_ms {
            Some(since) => self.clock.monotonic_ms() - since > self.degraded_ttl_ms,
            None => false,
        }
    }
}

pub fn dt_to_ms(ts: Option<chrono::DateTime<chrono::Utc>>) -> Option<i64> {
    ts.map(|t| t.timestamp_millis())
}

pub fn raw_age_ms(now_ms: i64, ts_ms: Option<i64>) -> Option<i64> {
    ts_ms.map(|ts| now_ms - ts)
}

pub fn age_seconds_from_raw(raw_age_ms: Option<i64>) -> Option<f64> {
    raw_age_ms.map(|raw| if raw < 0 { 0.0 } else { raw as f64 / 1000.0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct SequenceRestClient {
        sequence: Mutex<Vec<Result<i64, String>>>,
    }

    #[async_trait]
    impl RestTimeSource for SequenceRestClient {
        async fn fetch_server_time_ms(&self) -> Result<i64> {
            let mut seq = self.sequence.lock().unwrap();
            let item = if seq.len() > 1 { seq.remove(0) } else { seq[0].clone() };
            item.map_err(|e| anyhow::anyhow!(e))
        }
    }

    struct FakeClock {
        ms: std::sync::atomic::AtomicI64,
    }

    impl Clock for FakeClock {
        fn now_ms(&self) -> i64 {
            self.ms.load(Ordering::Relaxed)
        }
        fn monotonic_ms(&self) -> i64 {
            self.ms.load(Ordering::Relaxed)
        }
    }

    impl FakeClock {
        fn new(ms: i64) -> Self {
            Self { ms: std::sync::atomic::AtomicI64::new(ms) }
        }
        fn set(&self, ms: i64) {
            self.ms.store(ms, Ordering::Relaxed);
        }
    }

    #[test]
    fn clock_skew_and_corrected_now_match_server_direction() {
        let skew = ClockSync::compute_clock_skew_ms(1_000_000, 1_005_500);
        let corrected = ClockSync::compute_now_ms_corrected(1_000_000, skew);
        assert_eq!(skew, 5_500);
        assert_eq!(corrected, 1_005_500);
    }

    #[tokio::test]
    async fn does_not_reuse_stale_server_ms_on_failure() {
        let rest = SequenceRestClient {
            sequence: Mutex::new(vec![Ok(1_700_000_000_000), Err("down".to_string())]),
        };
        let clock = ClockSync::new(Box::new(rest), 1, 60, 10, 30_000, 60_000);

        assert!(clock.refresh_server_time(true).await);
        assert_eq!(clock.state().state, SyncState::Synced);
        assert_eq!(clock.state().last_server_ms, Some(1_700_000_000_000));

        assert!(!clock.refresh_server_time(true).await);
        assert_eq!(clock.state().state, SyncState::Degraded);
        assert_eq!(clock.state().last_server_ms, None);
        assert_eq!(clock.state().clock_skew_ms, 0);
    }

    #[tokio::test]
    async fn recovers_after_success() {
        let rest = SequenceRestClient {
            sequence: Mutex::new(vec![Err("down".to_string()), Ok(1_800_000_000_000)]),
        };
        let clock = ClockSync::new(Box::new(rest), 1000, 60, 10, 30_000, 60_000);

        assert!(!clock.refresh_server_time(true).await);
        assert_eq!(clock.state().state, SyncState::Degraded);

        assert!(clock.refresh_server_time(true).await);
        assert_eq!(clock.state().state, SyncState::Synced);
        assert_eq!(clock.state().last_server_ms, Some(1_800_000_000_000));
    }

    #[tokio::test]
    async fn cooldown_limits_force_refresh_calls_from_now_ms() {
        let rest = SequenceRestClient {
            sequence: Mutex::new(vec![Err("down".to_string()), Ok(1_000_000), Ok(1_000_000)]),
        };
        let fake_clock = std::sync::Arc::new(FakeClock::new(1_000_000));
        let clock = ClockSync::with_clock(
            Box::new(rest),
            Box::new(FakeClock { ms: std::sync::atomic::AtomicI64::new(fake_clock.ms.load(Ordering::Relaxed)) }),
            1_000,
            9999,
            9999,
            30_000,
            60_000,
        );

        // Initial state is degraded (never synced); force a failing refresh first.
        assert!(!clock.refresh_server_time(true).await);
        assert_eq!(clock.state().state, SyncState::Degraded);

        // First now_ms() call while degraded triggers one refresh attempt.
        let _ = clock.now_ms().await;
        assert_eq!(clock.state().state, SyncState::Synced);
    }

    impl Clock for std::sync::Arc<FakeClock> {
        fn now_ms(&self) -> i64 {
            self.as_ref().now_ms()
        }
        fn monotonic_ms(&self) -> i64 {
            self.as_ref().monotonic_ms()
        }
    }

    #[tokio::test]
    async fn drifted_synced_clock_degrades_and_forces_refresh() {
        let rest = SequenceRestClient {
            sequence: Mutex::new(vec![Ok(1_000_000), Ok(2_000_000)]),
        };
        let fake_clock = std::sync::Arc::new(FakeClock::new(1_000_000));
        let clock = ClockSync::with_clock(Box::new(rest), Box::new(fake_clock.clone()), 1_000, 9999, 9999, 30_000, 60_000);

        assert!(clock.refresh_server_time(true).await);
        assert_eq!(clock.state().state, SyncState::Synced);
        assert_eq!(clock.state().clock_skew_ms, 0);

        // Advance local time far beyond max_clock_error_ms without another
        // refresh — the cached correction is now stale and must trigger a
        // forced re-sync rather than silently drifting.
        fake_clock.set(1_050_000);
        let _ = clock.now_ms().await;
        assert_eq!(clock.state().state, SyncState::Synced);
        assert_eq!(clock.state().last_server_ms, Some(2_000_000));
    }

    #[tokio::test]
    async fn small_drift_within_threshold_keeps_synced_without_refresh() {
        let rest = SequenceRestClient {
            sequence: Mutex::new(vec![Ok(1_000_000), Err("should not be called".to_string())]),
        };
        let fake_clock = std::sync::Arc::new(FakeClock::new(1_000_000));
        let clock =
            ClockSync::with_clock(Box::new(rest), Box::new(fake_clock.clone()), 100_000, 9999, 9999, 30_000, 60_000);

        assert!(clock.refresh_server_time(true).await);
        fake_clock.set(1_050_000);
        let now = clock.now_ms().await;
        assert_eq!(now, 1_050_000);
        assert_eq!(clock.state().state, SyncState::Synced);
        assert_eq!(clock.state().last_server_ms, Some(1_000_000));
    }

    #[test]
    fn raw_age_ms_detects_future_timestamp() {
        let now_ms = 1_700_000_000_000;
        let future_ts_ms = now_ms + 2_000;
        let age = raw_age_ms(now_ms, Some(future_ts_ms));
        assert_eq!(age, Some(-2_000));
        assert_eq!(age_seconds_from_raw(age), Some(0.0));
    }

    #[test]
    fn age_seconds_from_raw_converts_positive_age() {
        assert_eq!(age_seconds_from_raw(Some(4_500)), Some(4.5));
        assert_eq!(age_seconds_from_raw(None), None);
    }
}
