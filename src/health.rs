use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::providers::ProviderId;

/// Consecutive transient failures that put a provider into cooldown.
const TRIP_AFTER_FAILURES: u32 = 3;
const MAX_BACKOFF_EXPONENT: u32 = 6;
const RATE_WINDOW: Duration = Duration::from_secs(1);
/// Upper bound for any backoff, whatever the provider or config asks for.
const LONGEST_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub provider: ProviderId,
    pub rate_limit_qps: u32,
    pub remaining_quota: u32,
    pub consecutive_failures: u32,
    pub backoff_remaining_ms: Option<u64>,
    pub total_calls: u64,
    pub total_failures: u64,
}

#[derive(Debug)]
struct HealthState {
    consecutive_failures: u32,
    consecutive_rate_limits: u32,
    backoff_until: Option<Instant>,
    window_start: Instant,
    window_used: u32,
    total_calls: u64,
    total_failures: u64,
}

impl HealthState {
    fn backoff_remaining(&self, now: Instant) -> Option<Duration> {
        self.backoff_until
            .filter(|deadline| *deadline > now)
            .map(|deadline| deadline - now)
    }

    /// Books the earliest free slot, possibly in a later window.
    fn reserve(&mut self, now: Instant, limit: u32) -> Instant {
        if self.window_start + RATE_WINDOW <= now {
            self.window_start = now;
            self.window_used = 0;
        }
        if self.window_used >= limit {
            self.window_start += RATE_WINDOW;
            self.window_used = 0;
        }
        self.window_used += 1;
        self.total_calls += 1;
        self.window_start.max(now)
    }
}

/// Mutable per-provider state: failure counters, backoff deadline and the
/// rate-limit window. Each provider has its own lock.
#[derive(Debug)]
pub struct ProviderHealth {
    id: ProviderId,
    qps: u32,
    cooldown: Duration,
    state: Mutex<HealthState>,
}

impl ProviderHealth {
    pub fn new(id: ProviderId, qps: u32, cooldown: Duration) -> Self {
        let now = Instant::now();
        Self {
            id,
            qps: qps.max(1),
            cooldown,
            state: Mutex::new(HealthState {
                consecutive_failures: 0,
                consecutive_rate_limits: 0,
                backoff_until: None,
                window_start: now,
                window_used: 0,
                total_calls: 0,
                total_failures: 0,
            }),
        }
    }

    pub fn id(&self) -> &ProviderId {
        &self.id
    }

    /// Longest backoff this provider can be put into.
    pub fn max_backoff(&self) -> Duration {
        self.cooldown
            .saturating_mul(1 << MAX_BACKOFF_EXPONENT)
            .min(LONGEST_BACKOFF)
    }

    /// Waits for a rate-limit slot. Sleeps at most once.
    pub async fn acquire_slot(&self) {
        let now = Instant::now();
        let slot = self.state.lock().reserve(now, self.qps);
        if slot > now {
            debug!(provider = %self.id, wait_ms = (slot - now).as_millis() as u64, "waiting for rate limit slot");
            sleep_until(slot).await;
        }
    }

    pub fn backoff_remaining(&self) -> Option<Duration> {
        self.state.lock().backoff_remaining(Instant::now())
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.consecutive_rate_limits = 0;
        state.backoff_until = None;
    }

    /// The provider answered, just not usefully for this input.
    pub fn record_definitive_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.consecutive_rate_limits = 0;
        state.total_failures += 1;
    }

    pub fn record_transient_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        state.total_failures += 1;
        if state.consecutive_failures >= TRIP_AFTER_FAILURES {
            state.backoff_until = Some(deadline_after(self.cooldown.min(LONGEST_BACKOFF)));
            state.consecutive_failures = 0;
            warn!(
                provider = %self.id,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "provider keeps failing; cooling down"
            );
        }
    }

    /// Returns the backoff that was applied.
    pub fn record_rate_limited(&self, retry_after: Option<Duration>) -> Duration {
        let mut state = self.state.lock();
        state.consecutive_rate_limits += 1;
        state.total_failures += 1;
        let exponent = (state.consecutive_rate_limits - 1).min(MAX_BACKOFF_EXPONENT);
        let backoff = retry_after
            .unwrap_or_else(|| self.cooldown.saturating_mul(1 << exponent))
            .min(self.max_backoff());
        state.backoff_until = Some(deadline_after(backoff));
        warn!(
            provider = %self.id,
            backoff_ms = backoff.as_millis() as u64,
            consecutive = state.consecutive_rate_limits,
            "provider rate limited; backing off"
        );
        backoff
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let now = Instant::now();
        let state = self.state.lock();
        let remaining_quota = if state.window_start > now {
            0
        } else if state.window_start + RATE_WINDOW > now {
            self.qps.saturating_sub(state.window_used)
        } else {
            self.qps
        };
        HealthSnapshot {
            provider: self.id.clone(),
            rate_limit_qps: self.qps,
            remaining_quota,
            consecutive_failures: state.consecutive_failures,
            backoff_remaining_ms: state
                .backoff_remaining(now)
                .map(|remaining| remaining.as_millis() as u64),
            total_calls: state.total_calls,
            total_failures: state.total_failures,
        }
    }
}

fn deadline_after(backoff: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(backoff)
        .unwrap_or_else(|| now + LONGEST_BACKOFF)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn health(qps: u32) -> ProviderHealth {
        ProviderHealth::new(ProviderId::new("mock"), qps, Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn five_requests_at_one_per_second_each_wait_once() {
        let health = Arc::new(health(1));
        let started = Instant::now();
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let health = health.clone();
                tokio::spawn(async move {
                    let before = Instant::now();
                    health.acquire_slot().await;
                    Instant::now() - before
                })
            })
            .collect();

        let mut waits = Vec::new();
        for handle in handles {
            waits.push(handle.await.unwrap());
        }
        waits.sort();
        assert_eq!(waits[0], Duration::ZERO);
        for (idx, wait) in waits.iter().enumerate() {
            assert!(*wait <= Duration::from_secs(idx as u64));
        }
        assert!(Instant::now() - started >= Duration::from_secs(4));
        assert_eq!(health.snapshot().total_calls, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_backoff_grows_and_honours_retry_after() {
        let health = health(1);
        assert_eq!(health.record_rate_limited(None), Duration::from_secs(30));
        assert_eq!(health.record_rate_limited(None), Duration::from_secs(60));
        assert_eq!(
            health.record_rate_limited(Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(health.backoff_remaining(), Some(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(health.backoff_remaining(), None);
        health.record_success();
        assert_eq!(health.record_rate_limited(None), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_retry_after_is_capped() {
        let health = health(1);
        let applied = health.record_rate_limited(Some(Duration::from_secs(u64::MAX / 2)));
        assert_eq!(applied, Duration::from_secs(30 * 64));
        assert_eq!(health.backoff_remaining(), Some(Duration::from_secs(30 * 64)));

        let extreme = ProviderHealth::new(ProviderId::new("mock"), 1, Duration::MAX);
        assert_eq!(extreme.record_rate_limited(None), LONGEST_BACKOFF);
        extreme.record_transient_failure();
        extreme.record_transient_failure();
        extreme.record_transient_failure();
        assert_eq!(extreme.backoff_remaining(), Some(LONGEST_BACKOFF));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_trip_cooldown() {
        let health = health(1);
        health.record_transient_failure();
        health.record_transient_failure();
        assert!(health.backoff_remaining().is_none());
        health.record_transient_failure();
        assert_eq!(health.backoff_remaining(), Some(Duration::from_secs(30)));
        assert_eq!(health.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reports_remaining_quota() {
        let health = health(3);
        assert_eq!(health.snapshot().remaining_quota, 3);
        health.acquire_slot().await;
        health.acquire_slot().await;
        assert_eq!(health.snapshot().remaining_quota, 1);
        tokio::time::advance(RATE_WINDOW).await;
        assert_eq!(health.snapshot().remaining_quota, 3);
    }
}
