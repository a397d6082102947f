//! Exponential backoff for merge slot contention.

use std::time::Duration;

/// Backoff schedule for acquiring a busy merge slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotBackoff {
    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry. Zero means [`SlotBackoff::DEFAULT_INITIAL`].
    pub initial_delay: Duration,

    /// Cap for exponential growth.
    pub max_delay: Duration,
}

impl SlotBackoff {
    pub const DEFAULT_INITIAL: Duration = Duration::from_millis(500);

    /// 10 retries: 0.5s, 1s, 2s, 4s, 8s, then 10s five more times.
    pub const DEFAULT: Self = Self {
        max_retries: 10,
        initial_delay: Self::DEFAULT_INITIAL,
        max_delay: Duration::from_secs(10),
    };

    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
        }
    }

    /// Delay before retry number `retry` (0-indexed), doubling and capped.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let initial = if self.initial_delay.is_zero() {
            Self::DEFAULT_INITIAL
        } else {
            self.initial_delay
        };
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        initial
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay.max(initial))
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|retry| self.delay_for_retry(retry))
    }

    /// Upper bound on time spent sleeping across a full retry budget.
    pub fn total_max_wait(&self) -> Duration {
        self.delays().sum()
    }
}

impl Default for SlotBackoff {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_schedule() {
        let delays: Vec<_> = SlotBackoff::DEFAULT.delays().collect();
        let secs: Vec<f64> = delays.iter().map(Duration::as_secs_f64).collect();
        assert_eq!(
            secs,
            vec![0.5, 1.0, 2.0, 4.0, 8.0, 10.0, 10.0, 10.0, 10.0, 10.0]
        );
        assert_eq!(SlotBackoff::DEFAULT.total_max_wait(), Duration::from_millis(65_500));
    }

    #[test]
    fn zero_initial_delay_uses_default() {
        let b = SlotBackoff::new(3, Duration::ZERO, Duration::from_secs(10));
        assert_eq!(b.delay_for_retry(0), Duration::from_millis(500));
        assert_eq!(b.delay_for_retry(1), Duration::from_secs(1));
    }

    #[test]
    fn huge_retry_index_saturates_at_cap() {
        let b = SlotBackoff::DEFAULT;
        assert_eq!(b.delay_for_retry(200), Duration::from_secs(10));
    }

    proptest! {
        #[test]
        fn delays_are_monotonic_and_capped(
            retries in 0u32..40,
            initial_ms in 1u64..2_000,
            cap_ms in 1u64..20_000,
        ) {
            let b = SlotBackoff::new(
                retries,
                Duration::from_millis(initial_ms),
                Duration::from_millis(cap_ms),
            );
            let delays: Vec<_> = b.delays().collect();
            prop_assert_eq!(delays.len(), retries as usize);
            for pair in delays.windows(2) {
                prop_assert!(pair[0] <= pair[1]);
            }
            let cap = Duration::from_millis(cap_ms.max(initial_ms));
            for d in &delays {
                prop_assert!(*d <= cap);
            }
        }
    }
}
