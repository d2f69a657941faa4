use std::time::Duration;

use rand::Rng;
use tether_protocol::ReconnectConfig;

/// Capped exponential backoff with additive jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter: if jitter.is_finite() {
                jitter.clamp(0.0, 0.99)
            } else {
                0.0
            },
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.base_delay(), config.max_delay(), config.jitter)
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// `min(base * 2^(n-1), cap)` for attempt `n` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// [`Self::delay`] plus up to `jitter * delay`, never above the cap.
    pub fn jittered<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter == 0.0 {
            return delay;
        }
        let extra = delay.mul_f64(rng.gen_range(0.0..self.jitter));
        (delay + extra).min(self.cap)
    }

    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.jittered(attempt, &mut rand::thread_rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.1)
    }

    #[test]
    fn doubles_until_cap() {
        let b = backoff();
        let delays: Vec<u64> = (1..=7).map(|n| b.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn attempt_zero_is_treated_as_first() {
        assert_eq!(backoff().delay(0), Duration::from_secs(1));
    }

    #[test]
    fn huge_attempt_numbers_saturate_at_cap() {
        assert_eq!(backoff().delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn zero_jitter_is_exact() {
        let b = Backoff::new(Duration::from_millis(250), Duration::from_secs(5), 0.0);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(b.jittered(3, &mut rng), Duration::from_secs(1));
    }

    #[test]
    fn cap_never_below_base() {
        let b = Backoff::new(Duration::from_secs(5), Duration::from_secs(1), 0.0);
        assert_eq!(b.delay(1), Duration::from_secs(5));
        assert_eq!(b.cap(), Duration::from_secs(5));
    }

    #[test]
    fn jittered_delays_strictly_increase_below_cap() {
        let b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.1);
        let mut rng = StdRng::seed_from_u64(42);
        let delays: Vec<Duration> = (1..=5).map(|n| b.jittered(n, &mut rng)).collect();
        assert!(delays.windows(2).all(|w| w[0] < w[1]), "{delays:?}");
    }

    proptest! {
        #[test]
        fn jittered_delay_within_bounds(
            attempt in 1u32..64,
            base_ms in 1u64..5_000,
            cap_factor in 1u64..100,
            jitter in 0.0f64..0.99,
            seed in any::<u64>(),
        ) {
            let base = Duration::from_millis(base_ms);
            let cap = Duration::from_millis(base_ms * cap_factor);
            let b = Backoff::new(base, cap, jitter);
            let mut rng = StdRng::seed_from_u64(seed);

            let exact = b.delay(attempt);
            let actual = b.jittered(attempt, &mut rng);

            prop_assert!(exact <= cap);
            prop_assert!(actual <= cap);
            prop_assert!(actual >= exact);
            prop_assert!(actual <= exact.mul_f64(1.0 + jitter) + Duration::from_micros(1));
        }

        #[test]
        fn exact_delay_is_monotonic(attempt in 1u32..64) {
            let b = backoff();
            prop_assert!(b.delay(attempt) <= b.delay(attempt + 1));
        }
    }
}
