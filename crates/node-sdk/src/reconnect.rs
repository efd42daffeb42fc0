//! Reconnect policy.
//!
//! Hub restarts are the common failure, so the default is a short fixed
//! delay retried forever: nodes should be back within seconds of the
//! hub. An exponential variant exists for drivers talking to hubs over
//! flaky links where hammering a dead address helps nobody.

use std::time::Duration;

/// How the delay between attempts is derived.
#[derive(Debug, Clone)]
pub enum ReconnectPolicy {
    /// The same delay before every attempt.
    Fixed { delay: Duration },
    /// `initial * factor^attempt`, capped at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        factor: f64,
    },
}

/// Controls how the node client reconnects after a connection drop.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    pub policy: ReconnectPolicy,
    /// Consecutive failures tolerated before giving up. `0` retries
    /// forever.
    pub max_attempts: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::Fixed {
                delay: Duration::from_secs(3),
            },
            max_attempts: 0,
        }
    }
}

impl ReconnectBackoff {
    /// Delay before the given attempt (0-indexed), with up to 25%
    /// jitter added so a fleet of nodes does not stampede a freshly
    /// restarted hub.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = match &self.policy {
            ReconnectPolicy::Fixed { delay } => *delay,
            ReconnectPolicy::Exponential {
                initial,
                max,
                factor,
            } => {
                let ms = initial.as_millis() as f64 * factor.powi(attempt as i32);
                Duration::from_millis(ms.min(max.as_millis() as f64) as u64)
            }
        };
        let jitter_ms = base.as_millis() as f64 * 0.25 * spread(attempt);
        base + Duration::from_millis(jitter_ms as u64)
    }

    pub fn should_give_up(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Deterministic fraction in [0, 1) derived from the attempt number.
/// An xorshift step is plenty to de-synchronize reconnect storms.
fn spread(attempt: u32) -> f64 {
    let mut x = u64::from(attempt) + 1;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    (x % 1024) as f64 / 1024.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_a_short_fixed_delay_forever() {
        let p = ReconnectBackoff::default();
        assert!(matches!(p.policy, ReconnectPolicy::Fixed { .. }));
        assert!(!p.should_give_up(1_000_000));
        // Fixed 3s plus at most 25% jitter.
        for attempt in 0..100 {
            let d = p.delay_for_attempt(attempt);
            assert!(d >= Duration::from_secs(3));
            assert!(d <= Duration::from_millis(3_750));
        }
    }

    #[test]
    fn exponential_grows_and_caps() {
        let p = ReconnectBackoff {
            policy: ReconnectPolicy::Exponential {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(30),
                factor: 2.0,
            },
            max_attempts: 0,
        };
        assert!(p.delay_for_attempt(3) > p.delay_for_attempt(0));
        // Far past the cap: 30s plus at most 25% jitter.
        assert!(p.delay_for_attempt(20) <= Duration::from_millis(37_500));
    }

    #[test]
    fn should_give_up_when_limited() {
        let p = ReconnectBackoff {
            max_attempts: 5,
            ..Default::default()
        };
        assert!(!p.should_give_up(4));
        assert!(p.should_give_up(5));
    }
}
