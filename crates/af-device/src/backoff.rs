//! Per-target exponential backoff.
//!
//! One `BackoffState` exists per polled target: per device in the tiered
//! poller, per `(device, channel)` in the preview service.  There is no
//! process-wide retry state.

use std::time::{Duration, Instant};

/// Delay policy: after `threshold` consecutive failures the delay grows as
/// `base * multiplier^(failures - threshold)`, capped at `max`.
///
/// The poller uses `threshold = 10` (ten fast ticks may fail before the
/// cadence degrades); the preview service uses `threshold = 1` (first
/// failure already delays by `base`).
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub threshold: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, multiplier: f64, max: Duration, threshold: u32) -> Self {
        BackoffPolicy {
            base,
            multiplier,
            max,
            threshold: threshold.max(1),
        }
    }

    /// Delay before the next attempt given `failures` consecutive failures.
    /// `None` while still below the threshold (caller keeps its normal cadence).
    pub fn delay_for(&self, failures: u32) -> Option<Duration> {
        if failures < self.threshold {
            return None;
        }
        let exponent = failures - self.threshold;
        let factor = self.multiplier.powi(i32::try_from(exponent).unwrap_or(i32::MAX));
        let delay = self.base.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max.as_secs_f64() {
            Some(self.max)
        } else {
            Some(Duration::from_secs_f64(delay))
        }
    }
}

/// Failure bookkeeping for one target.
#[derive(Debug, Clone, Default)]
pub struct BackoffState {
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
}

impl BackoffState {
    pub fn new() -> Self {
        BackoffState::default()
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(Instant::now());
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_failure_at = None;
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    /// Current delay under `policy`, or `None` below the threshold.
    pub fn current_delay(&self, policy: &BackoffPolicy) -> Option<Duration> {
        policy.delay_for(self.consecutive_failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poller_policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(60), 10)
    }

    #[test]
    fn no_delay_below_threshold() {
        let policy = poller_policy();
        for n in 0..10 {
            assert_eq!(policy.delay_for(n), None, "failures = {n}");
        }
    }

    #[test]
    fn delay_doubles_above_threshold_and_caps() {
        let policy = poller_policy();
        assert_eq!(policy.delay_for(10), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(11), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for(12), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_for(14), Some(Duration::from_secs(16)));
        // 2^6 = 64 > 60 -> capped
        assert_eq!(policy.delay_for(16), Some(Duration::from_secs(60)));
        assert_eq!(policy.delay_for(1000), Some(Duration::from_secs(60)));
    }

    #[test]
    fn delay_stays_within_contract_bounds() {
        // After n >= threshold failures the delay must sit in
        // [base * k^(n - threshold), max].
        let policy = poller_policy();
        for n in 10..40 {
            let d = policy.delay_for(n).unwrap();
            let floor = Duration::from_secs_f64(
                (policy.base.as_secs_f64() * 2f64.powi(i32::try_from(n - 10).unwrap()))
                    .min(policy.max.as_secs_f64()),
            );
            assert!(d >= floor, "n = {n}: {d:?} < {floor:?}");
            assert!(d <= policy.max, "n = {n}: {d:?} > max");
        }
    }

    #[test]
    fn preview_policy_delays_from_first_failure() {
        let policy = BackoffPolicy::new(Duration::from_secs(3), 2.0, Duration::from_secs(300), 1);
        assert_eq!(policy.delay_for(0), None);
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(3)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_secs(6)));
        assert_eq!(policy.delay_for(8), Some(Duration::from_secs(300)));
    }

    #[test]
    fn state_tracks_and_resets_failures() {
        let policy = poller_policy();
        let mut state = BackoffState::new();
        assert_eq!(state.current_delay(&policy), None);

        for _ in 0..12 {
            state.record_failure();
        }
        assert_eq!(state.failures(), 12);
        assert!(state.last_failure_at().is_some());
        assert_eq!(state.current_delay(&policy), Some(Duration::from_secs(4)));

        state.record_success();
        assert_eq!(state.failures(), 0);
        assert_eq!(state.current_delay(&policy), None);
    }
}
