//! # Circuit Breaker
//!
//! Wraps fallible operations keyed by an opaque string and short-circuits
//! callers while the underlying service is failing. One breaker record is
//! kept per key, moving through the classic three states:
//!
//! ```text
//!            failures >= threshold
//!   Closed ───────────────────────▶ Open
//!     ▲                              │ recovery sweep, retry due
//!     │ probe success                ▼
//!     └────────────────────────── HalfOpen ──▶ Open (probe failure)
//! ```
//!
//! The Open→HalfOpen transition is owned exclusively by the background
//! recovery sweep; a call arriving on an Open key always fails fast, even
//! past the retry deadline. A HalfOpen key admits a limited number of
//! probe calls before it too fails fast.
//!
//! Wrapped-operation errors are counted as failures and re-surfaced to
//! the caller; the breaker never swallows them.

use crate::error::GatewayError;
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Probe calls admitted while a key is half-open.
const HALF_OPEN_MAX_ATTEMPTS: u32 = 3;

/// Breaker state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Calls flow through; failures are counted.
    Closed,
    /// Calls fail fast until the recovery sweep re-arms the key.
    Open,
    /// A limited number of probe calls decide recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    total_requests: u64,
    last_failure: Option<Instant>,
    next_retry: Option<Instant>,
    half_open_attempts: u32,
    failure_threshold: u32,
    open_duration: Duration,
}

impl BreakerState {
    fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_requests: 0,
            last_failure: None,
            next_retry: None,
            half_open_attempts: 0,
            failure_threshold,
            open_duration,
        }
    }

    fn record_success(&mut self) {
        self.success_count += 1;
        match self.state {
            CircuitState::Closed => self.failure_count = 0,
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.half_open_attempts = 0;
                self.next_retry = None;
            }
            // A success for an Open key can only come from a call that was
            // admitted before the key tripped; the state stands.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&mut self, now: Instant) {
        self.last_failure = Some(now);
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.state = CircuitState::Open;
                    self.next_retry = Some(now + self.open_duration);
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.next_retry = Some(now + self.open_duration);
            }
            CircuitState::Open => {}
        }
    }
}

/// Diagnostic snapshot of one breaker key.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerInfo {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub total_requests: u64,
    pub half_open_attempts: u32,
    pub failure_threshold: u32,
    /// Seconds until the recovery sweep may re-arm the key, if Open.
    pub retry_in_secs: Option<f64>,
}

/// Aggregate view across all keys.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub total_keys: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
    pub total_requests: u64,
    pub total_failures: u64,
}

/// Per-key circuit breaker with a background recovery sweep.
///
/// State transitions are serialized per key by the map's shard lock; the
/// wrapped operation itself runs with no lock held.
#[derive(Debug)]
pub struct CircuitBreaker {
    states: DashMap<String, BreakerState>,
    recovery_interval: Duration,
}

impl CircuitBreaker {
    pub fn new(recovery_interval: Duration) -> Self {
        Self {
            states: DashMap::new(),
            recovery_interval,
        }
    }

    /// Execute `op` under the breaker for `key`.
    ///
    /// The record for `key` is created on first use with the supplied
    /// threshold and open duration. Returns the operation's output, the
    /// operation's error wrapped as [`GatewayError::Transport`], or
    /// [`GatewayError::BreakerOpen`] when the call is rejected without
    /// running `op`.
    pub async fn execute<F, Fut, T>(
        &self,
        key: &str,
        failure_threshold: u32,
        open_duration: Duration,
        op: F,
    ) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        // Admission check. The shard lock must not be held across the
        // operation await, so this is a separate scope.
        {
            let mut entry = self
                .states
                .entry(key.to_string())
                .or_insert_with(|| BreakerState::new(failure_threshold, open_duration));
            entry.total_requests += 1;

            match entry.state {
                CircuitState::Open => {
                    debug!(key, "breaker open, failing fast");
                    return Err(GatewayError::BreakerOpen(key.to_string()));
                }
                CircuitState::HalfOpen => {
                    if entry.half_open_attempts >= HALF_OPEN_MAX_ATTEMPTS {
                        debug!(key, "half-open probe limit reached, failing fast");
                        return Err(GatewayError::BreakerOpen(key.to_string()));
                    }
                    entry.half_open_attempts += 1;
                }
                CircuitState::Closed => {}
            }
        }

        match op().await {
            Ok(value) => {
                if let Some(mut entry) = self.states.get_mut(key) {
                    entry.record_success();
                }
                Ok(value)
            }
            Err(err) => {
                if let Some(mut entry) = self.states.get_mut(key) {
                    entry.record_failure(Instant::now());
                    if entry.state == CircuitState::Open {
                        warn!(key, failures = entry.failure_count, "circuit breaker opened");
                    }
                }
                Err(GatewayError::Transport(err))
            }
        }
    }

    /// Force a key Open. The recovery sweep will re-arm it after the
    /// key's configured open duration.
    pub fn force_open(&self, key: &str) {
        if let Some(mut entry) = self.states.get_mut(key) {
            entry.state = CircuitState::Open;
            entry.next_retry = Some(Instant::now() + entry.open_duration);
            info!(key, "circuit breaker forced open");
        }
    }

    /// Force a key Closed, clearing failure and probe counters.
    pub fn force_close(&self, key: &str) {
        if let Some(mut entry) = self.states.get_mut(key) {
            entry.state = CircuitState::Closed;
            entry.failure_count = 0;
            entry.half_open_attempts = 0;
            entry.next_retry = None;
            info!(key, "circuit breaker forced closed");
        }
    }

    /// Drop the record for `key`. Returns true if one was present.
    pub fn remove(&self, key: &str) -> bool {
        self.states.remove(key).is_some()
    }

    /// Snapshot of one key's record.
    pub fn info(&self, key: &str) -> Option<BreakerInfo> {
        let now = Instant::now();
        self.states.get(key).map(|entry| BreakerInfo {
            state: entry.state,
            failure_count: entry.failure_count,
            success_count: entry.success_count,
            total_requests: entry.total_requests,
            half_open_attempts: entry.half_open_attempts,
            failure_threshold: entry.failure_threshold,
            retry_in_secs: entry
                .next_retry
                .map(|at| at.saturating_duration_since(now).as_secs_f64()),
        })
    }

    /// Aggregate counts across every key.
    pub fn stats(&self) -> BreakerStats {
        let mut stats = BreakerStats {
            total_keys: 0,
            closed: 0,
            open: 0,
            half_open: 0,
            total_requests: 0,
            total_failures: 0,
        };
        for entry in self.states.iter() {
            stats.total_keys += 1;
            match entry.state {
                CircuitState::Closed => stats.closed += 1,
                CircuitState::Open => stats.open += 1,
                CircuitState::HalfOpen => stats.half_open += 1,
            }
            stats.total_requests += entry.total_requests;
            stats.total_failures += entry.failure_count as u64;
        }
        stats
    }

    /// One pass of the Open→HalfOpen scan. This is the only state change
    /// not gated by a call arrival.
    pub fn run_recovery_sweep(&self) {
        let now = Instant::now();
        for mut entry in self.states.iter_mut() {
            if entry.state == CircuitState::Open {
                if let Some(retry_at) = entry.next_retry {
                    if now >= retry_at {
                        entry.state = CircuitState::HalfOpen;
                        entry.half_open_attempts = 0;
                        info!(key = entry.key().as_str(), "circuit breaker half-open");
                    }
                }
            }
        }
    }

    /// Spawn the periodic recovery sweep, ticking every
    /// `recovery_interval` until `cancel` fires.
    pub fn spawn_recovery(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let breaker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(breaker.recovery_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("breaker recovery sweep stopped");
                        break;
                    }
                    _ = ticker.tick() => breaker.run_recovery_sweep(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    const THRESHOLD: u32 = 3;
    const OPEN_FOR: Duration = Duration::from_millis(50);

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(Duration::from_secs(30))
    }

    async fn fail(b: &CircuitBreaker, key: &str) -> Result<(), GatewayError> {
        b.execute(key, THRESHOLD, OPEN_FOR, || async { Err(anyhow!("backend down")) })
            .await
    }

    async fn succeed(b: &CircuitBreaker, key: &str) -> Result<(), GatewayError> {
        b.execute(key, THRESHOLD, OPEN_FOR, || async { Ok(()) }).await
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let b = breaker();

        for _ in 0..THRESHOLD {
            let err = fail(&b, "t1").await.unwrap_err();
            assert!(matches!(err, GatewayError::Transport(_)));
        }

        let info = b.info("t1").unwrap();
        assert_eq!(info.state, CircuitState::Open);

        // Subsequent calls fail fast without touching the operation.
        let err = succeed(&b, "t1").await.unwrap_err();
        assert!(matches!(err, GatewayError::BreakerOpen(_)));
    }

    #[tokio::test]
    async fn success_resets_closed_failure_count() {
        let b = breaker();

        fail(&b, "t1").await.unwrap_err();
        fail(&b, "t1").await.unwrap_err();
        succeed(&b, "t1").await.unwrap();

        let info = b.info("t1").unwrap();
        assert_eq!(info.state, CircuitState::Closed);
        assert_eq!(info.failure_count, 0);

        // The counter restarted, so it takes a full threshold run to open.
        fail(&b, "t1").await.unwrap_err();
        fail(&b, "t1").await.unwrap_err();
        assert_eq!(b.info("t1").unwrap().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn recovery_sweep_is_the_only_path_out_of_open() {
        let b = breaker();
        for _ in 0..THRESHOLD {
            fail(&b, "t1").await.unwrap_err();
        }

        tokio::time::sleep(OPEN_FOR * 2).await;

        // Past the retry deadline, but no sweep has run: still fail fast.
        let err = succeed(&b, "t1").await.unwrap_err();
        assert!(matches!(err, GatewayError::BreakerOpen(_)));
        assert_eq!(b.info("t1").unwrap().state, CircuitState::Open);

        b.run_recovery_sweep();
        assert_eq!(b.info("t1").unwrap().state, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_success_closes() {
        let b = breaker();
        for _ in 0..THRESHOLD {
            fail(&b, "t1").await.unwrap_err();
        }
        tokio::time::sleep(OPEN_FOR).await;
        b.run_recovery_sweep();

        succeed(&b, "t1").await.unwrap();
        let info = b.info("t1").unwrap();
        assert_eq!(info.state, CircuitState::Closed);
        assert_eq!(info.half_open_attempts, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let b = breaker();
        for _ in 0..THRESHOLD {
            fail(&b, "t1").await.unwrap_err();
        }
        tokio::time::sleep(OPEN_FOR).await;
        b.run_recovery_sweep();

        fail(&b, "t1").await.unwrap_err();
        assert_eq!(b.info("t1").unwrap().state, CircuitState::Open);

        // The retry deadline was pushed out again.
        let err = succeed(&b, "t1").await.unwrap_err();
        assert!(matches!(err, GatewayError::BreakerOpen(_)));
    }

    #[tokio::test]
    async fn half_open_limits_in_flight_probes() {
        let b = Arc::new(breaker());
        for _ in 0..THRESHOLD {
            fail(&b, "t1").await.unwrap_err();
        }
        tokio::time::sleep(OPEN_FOR).await;
        b.run_recovery_sweep();

        // Three probes enter and park on the gate; the fourth must be
        // rejected while they are still in flight.
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let mut probes = Vec::new();
        for _ in 0..3 {
            let b = Arc::clone(&b);
            let gate = Arc::clone(&gate);
            probes.push(tokio::spawn(async move {
                b.execute("t1", THRESHOLD, OPEN_FOR, || async move {
                    let _permit = gate.acquire().await?;
                    Ok(())
                })
                .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = succeed(&b, "t1").await.unwrap_err();
        assert!(matches!(err, GatewayError::BreakerOpen(_)));

        // Release the probes; their success closes the breaker.
        gate.add_permits(3);
        for probe in probes {
            probe.await.unwrap().unwrap();
        }
        assert_eq!(b.info("t1").unwrap().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let b = breaker();
        for _ in 0..THRESHOLD {
            fail(&b, "t1").await.unwrap_err();
        }

        assert_eq!(b.info("t1").unwrap().state, CircuitState::Open);
        succeed(&b, "t2").await.unwrap();
        assert_eq!(b.info("t2").unwrap().state, CircuitState::Closed);

        let stats = b.stats();
        assert_eq!(stats.total_keys, 2);
        assert_eq!(stats.open, 1);
        assert_eq!(stats.closed, 1);
    }

    #[tokio::test]
    async fn force_and_remove() {
        let b = breaker();
        succeed(&b, "t1").await.unwrap();

        b.force_open("t1");
        assert_eq!(b.info("t1").unwrap().state, CircuitState::Open);

        b.force_close("t1");
        assert_eq!(b.info("t1").unwrap().state, CircuitState::Closed);

        assert!(b.remove("t1"));
        assert!(b.info("t1").is_none());
    }
}
