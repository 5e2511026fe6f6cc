// ── Bounded exponential backoff ──
//
// Pure and deterministic: the delay depends only on the attempt number,
// the policy, and a per-item seed. Commands seed from their id and
// subscriptions from theirs, so concurrent retries spread out without a
// shared timer or RNG.

use std::time::Duration;

/// Retry policy: exponential growth from `base_delay`, capped at
/// `max_delay`, with up to `jitter` (fraction) shaved off each delay.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts before giving up. `None` = retry forever.
    pub max_attempts: Option<u32>,
    /// In `[0, 1]`; `0.25` spreads delays over 75–100% of the nominal value.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(3),
            jitter: 0.25,
        }
    }
}

impl BackoffConfig {
    /// Defaults for stream reconnects: 1s base, 30s cap, unlimited.
    pub fn reconnect() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: None,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (0-based).
    ///
    /// `min(base · 2^attempt, max) · (1 − jitter · u)` where `u ∈ [0, 1]`
    /// is derived from `attempt` and `seed`. Never exceeds `max_delay`.
    pub fn delay(&self, attempt: u32, seed: u64) -> Duration {
        let exponent = i32::try_from(attempt.min(62)).unwrap_or(62);
        let nominal = self.base_delay.as_secs_f64() * 2.0_f64.powi(exponent);
        let capped = nominal.min(self.max_delay.as_secs_f64());

        let phase = f64::from(u32::try_from(seed % 10_007).unwrap_or(0));
        let u = 0.5 * (1.0 + (f64::from(attempt) * 7.3 + phase).sin());
        let factor = 1.0 - self.jitter.clamp(0.0, 1.0) * u;

        Duration::from_secs_f64((capped * factor).max(0.0))
    }

    /// True once `attempts` failed tries have used up the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy() {
        let config = BackoffConfig::default();
        assert_eq!(config.base_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_attempts, Some(3));
        assert!(BackoffConfig::reconnect().max_attempts.is_none());
    }

    #[test]
    fn backoff_increases_exponentially() {
        let config = BackoffConfig::default();
        for seed in [0, 17, 9_999] {
            let d0 = config.delay(0, seed);
            let d1 = config.delay(1, seed);
            let d2 = config.delay(2, seed);
            assert!(d1 > d0, "seed {seed}: {d1:?} <= {d0:?}");
            assert!(d2 > d1, "seed {seed}: {d2:?} <= {d1:?}");
        }
    }

    #[test]
    fn backoff_never_exceeds_cap() {
        let config = BackoffConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: None,
            jitter: 0.25,
        };
        for attempt in 0..200 {
            let d = config.delay(attempt, 42);
            assert!(d <= Duration::from_secs(10), "attempt {attempt}: {d:?}");
        }
        assert!(config.delay(50, 42) >= Duration::from_millis(7_500));
    }

    #[test]
    fn seeds_spread_delays() {
        let config = BackoffConfig::default();
        let a = config.delay(3, 1);
        let b = config.delay(3, 2);
        assert_ne!(a, b);
        assert_eq!(a, config.delay(3, 1));
    }

    #[test]
    fn zero_jitter_is_exact() {
        let config = BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        };
        assert_eq!(config.delay(2, 99), Duration::from_secs(2));
    }

    #[test]
    fn exhaustion() {
        let config = BackoffConfig::default();
        assert!(!config.exhausted(2));
        assert!(config.exhausted(3));
        assert!(!BackoffConfig::reconnect().exhausted(u32::MAX));
    }
}
