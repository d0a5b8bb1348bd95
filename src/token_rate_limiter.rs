use std::time::Duration;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Token bucket for outbound bytes. Tokens are kept scaled by nanoseconds per second so that
///  refills for short elapsed intervals do not lose fractional bytes.
///
/// The bucket's capacity is the number of bytes that accumulate over the maximum burst window,
///  and the bucket starts out full.
#[derive(Debug)]
pub struct TokenRateLimiter {
    rate_bytes_per_second: u64,
    /// bytes * 10^9
    remaining_scaled: u128,
    /// bytes * 10^9
    capacity_scaled: u128,
    /// bytes * 10^9
    min_capacity_scaled: u128,
}

impl TokenRateLimiter {
    pub fn new(rate_bytes_per_second: u64, window: Duration, max_burst_window: Duration) -> TokenRateLimiter {
        let mut result = TokenRateLimiter {
            rate_bytes_per_second: 0,
            remaining_scaled: 0,
            capacity_scaled: 0,
            min_capacity_scaled: 0,
        };
        result.set_rate(rate_bytes_per_second, window, max_burst_window);
        result.remaining_scaled = result.capacity_scaled;
        result
    }

    /// The capacity never drops below `min_capacity_bytes`, whatever the rate: a packet bigger
    ///  than the capacity could never be paid for.
    pub fn with_min_capacity_bytes(mut self, min_capacity_bytes: u64) -> TokenRateLimiter {
        let was_full = self.is_full();
        self.min_capacity_scaled = (min_capacity_bytes as u128).saturating_mul(NANOS_PER_SECOND);
        self.capacity_scaled = self.capacity_scaled.max(self.min_capacity_scaled);
        if was_full {
            self.remaining_scaled = self.capacity_scaled;
        }
        self
    }

    /// Changes the rate, keeping the current tokens (capped at the new capacity). `window` is the
    ///  refill interval, the capacity never drops below one window's worth of bytes.
    pub fn set_rate(&mut self, rate_bytes_per_second: u64, window: Duration, max_burst_window: Duration) {
        let burst_nanos = window.max(max_burst_window).as_nanos();
        self.rate_bytes_per_second = rate_bytes_per_second;
        self.capacity_scaled = (rate_bytes_per_second as u128).saturating_mul(burst_nanos)
            .max(self.min_capacity_scaled);
        self.remaining_scaled = self.remaining_scaled.min(self.capacity_scaled);
    }

    pub fn rate_bytes_per_second(&self) -> u64 {
        self.rate_bytes_per_second
    }

    pub fn capacity_bytes(&self) -> u64 {
        (self.capacity_scaled / NANOS_PER_SECOND) as u64
    }

    pub fn remaining_bytes(&self) -> u64 {
        (self.remaining_scaled / NANOS_PER_SECOND) as u64
    }

    pub fn can_take_tokens(&self) -> bool {
        self.remaining_scaled > 0
    }

    /// Takes tokens for `num_bytes` if enough are available. If not, nothing is taken and
    ///  the caller has to wait for a refill.
    pub fn take_tokens(&mut self, num_bytes: usize) -> bool {
        let cost = (num_bytes as u128).saturating_mul(NANOS_PER_SECOND);
        if cost > self.remaining_scaled {
            return false;
        }
        self.remaining_scaled -= cost;
        true
    }

    pub fn add_time(&mut self, elapsed: Duration) {
        let refill = (self.rate_bytes_per_second as u128).saturating_mul(elapsed.as_nanos());
        self.remaining_scaled = self.remaining_scaled
            .saturating_add(refill)
            .min(self.capacity_scaled);
    }

    pub fn is_full(&self) -> bool {
        self.remaining_scaled == self.capacity_scaled
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_starts_full() {
        let limiter = TokenRateLimiter::new(1000, Duration::from_millis(20), Duration::from_millis(500));
        assert_eq!(limiter.capacity_bytes(), 500);
        assert_eq!(limiter.remaining_bytes(), 500);
        assert!(limiter.is_full());
        assert!(limiter.can_take_tokens());
    }

    #[test]
    fn test_take_only_when_sufficient() {
        let mut limiter = TokenRateLimiter::new(1000, Duration::from_millis(20), Duration::from_millis(100));
        assert!(limiter.take_tokens(60));
        assert!(!limiter.take_tokens(60));
        assert_eq!(limiter.remaining_bytes(), 40);
        assert!(limiter.take_tokens(40));
        assert!(!limiter.can_take_tokens());
    }

    #[rstest]
    #[case::partial(Duration::from_millis(30), 30)]
    #[case::capped(Duration::from_secs(10), 100)]
    #[case::sub_byte(Duration::from_micros(500), 0)]
    fn test_add_time(#[case] elapsed: Duration, #[case] expected_remaining: u64) {
        let mut limiter = TokenRateLimiter::new(1000, Duration::from_millis(20), Duration::from_millis(100));
        assert!(limiter.take_tokens(100));
        limiter.add_time(elapsed);
        assert_eq!(limiter.remaining_bytes(), expected_remaining);
    }

    #[test]
    fn test_fractional_refills_accumulate() {
        let mut limiter = TokenRateLimiter::new(1000, Duration::from_millis(20), Duration::from_millis(100));
        assert!(limiter.take_tokens(100));
        for _ in 0..10 {
            limiter.add_time(Duration::from_micros(500));
        }
        assert_eq!(limiter.remaining_bytes(), 5);
    }

    #[test]
    fn test_set_rate_caps_remaining() {
        let mut limiter = TokenRateLimiter::new(10_000, Duration::from_millis(20), Duration::from_millis(100));
        assert_eq!(limiter.remaining_bytes(), 1000);
        limiter.set_rate(1000, Duration::from_millis(20), Duration::from_millis(100));
        assert_eq!(limiter.remaining_bytes(), 100);
        assert_eq!(limiter.rate_bytes_per_second(), 1000);
    }

    #[test]
    fn test_min_capacity_survives_rate_changes() {
        let mut limiter = TokenRateLimiter::new(1000, Duration::from_millis(20), Duration::from_millis(500))
            .with_min_capacity_bytes(9000);
        assert_eq!(limiter.capacity_bytes(), 9000);
        assert!(limiter.is_full());

        limiter.set_rate(100_000, Duration::from_millis(20), Duration::from_millis(500));
        assert_eq!(limiter.capacity_bytes(), 50_000);
        assert_eq!(limiter.remaining_bytes(), 9000);

        limiter.set_rate(10, Duration::from_millis(20), Duration::from_millis(500));
        assert_eq!(limiter.capacity_bytes(), 9000);
        assert!(limiter.take_tokens(9000));
        assert!(!limiter.take_tokens(1));
        limiter.add_time(Duration::from_secs(900));
        assert!(limiter.take_tokens(9000));
    }

    #[test]
    fn test_cumulative_bytes_never_exceed_rate_plus_burst() {
        let rate = 125_000u64;
        let mut limiter = TokenRateLimiter::new(rate, Duration::from_millis(20), Duration::from_millis(100));
        let capacity = limiter.capacity_bytes() as u128;

        let mut rng = StdRng::seed_from_u64(4711);
        let mut elapsed = Duration::ZERO;
        let mut total_taken: u128 = 0;
        for _ in 0..10_000 {
            if rng.gen_bool(0.3) {
                let dt = Duration::from_micros(rng.gen_range(0..30_000));
                limiter.add_time(dt);
                elapsed += dt;
            }
            else {
                let n = rng.gen_range(1..2000);
                if limiter.take_tokens(n) {
                    total_taken += n as u128;
                }
            }
            let bound = rate as u128 * elapsed.as_nanos() / NANOS_PER_SECOND + capacity;
            assert!(total_taken <= bound, "{} > {}", total_taken, bound);
        }
    }
}
