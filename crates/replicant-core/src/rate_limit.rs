//! Token bucket rate limiting.
//!
//! Time is passed in explicitly as Unix milliseconds so the bucket is
//! deterministic under test.

/// A token bucket.
///
/// Tokens regenerate continuously at `tokens_per_second` up to `max_tokens`.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitedValue {
    tokens: f64,
    max_tokens: f64,
    tokens_per_second: f64,
    last_regen_ms: u64,
}

impl RateLimitedValue {
    /// Create a full bucket.
    pub fn new(now_ms: u64, tokens_per_second: f64, max_tokens: f64) -> Self {
        let max_tokens = max_tokens.max(0.0);
        Self {
            tokens: max_tokens,
            max_tokens,
            tokens_per_second: tokens_per_second.max(0.0),
            last_regen_ms: now_ms,
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn max_tokens(&self) -> f64 {
        self.max_tokens
    }

    pub fn tokens_per_second(&self) -> f64 {
        self.tokens_per_second
    }

    /// Add tokens for the time elapsed since the last regeneration.
    ///
    /// Calling twice with the same `now_ms` is a no-op. A clock that moves
    /// backwards adds nothing.
    pub fn regenerate_tokens(&mut self, now_ms: u64) {
        let elapsed_ms = now_ms.saturating_sub(self.last_regen_ms);
        let added = elapsed_ms as f64 * self.tokens_per_second / 1000.0;
        self.tokens = (self.tokens + added).min(self.max_tokens);
        self.last_regen_ms = self.last_regen_ms.max(now_ms);
    }

    /// Regenerate, then take `cost` tokens if available.
    ///
    /// On failure the token count is left as regenerated.
    pub fn consume(&mut self, now_ms: u64, cost: f64) -> bool {
        self.regenerate_tokens(now_ms);
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Run `action` if `cost` tokens could be consumed.
    pub fn attempt(&mut self, now_ms: u64, cost: f64, action: impl FnOnce()) -> bool {
        if self.consume(now_ms, cost) {
            action();
            true
        } else {
            false
        }
    }

    /// Refill to capacity without changing the regeneration rate.
    pub fn fill_bucket(&mut self) {
        self.tokens = self.max_tokens;
    }

    /// Set the token count, clamped to `[0, max_tokens]`.
    pub fn set_token_count(&mut self, tokens: f64) {
        self.tokens = tokens.clamp(0.0, self.max_tokens);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_starts_full() {
        let bucket = RateLimitedValue::new(0, 1.0, 5.0);
        assert_eq!(bucket.tokens(), 5.0);
    }

    #[test]
    fn test_regenerates_per_second() {
        let mut bucket = RateLimitedValue::new(1000, 10.0, 100.0);
        bucket.set_token_count(0.0);
        bucket.regenerate_tokens(1500);
        assert!((bucket.tokens() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_regeneration_clamped_to_max() {
        let mut bucket = RateLimitedValue::new(0, 100.0, 3.0);
        bucket.set_token_count(1.0);
        bucket.regenerate_tokens(60_000);
        assert_eq!(bucket.tokens(), 3.0);
    }

    #[test]
    fn test_clock_going_backwards_adds_nothing() {
        let mut bucket = RateLimitedValue::new(2000, 10.0, 100.0);
        bucket.set_token_count(50.0);
        bucket.regenerate_tokens(1000);
        assert_eq!(bucket.tokens(), 50.0);
        // the earlier timestamp must not rewind the regeneration point
        bucket.regenerate_tokens(2000);
        assert_eq!(bucket.tokens(), 50.0);
    }

    #[test]
    fn test_attempt_runs_action_only_on_success() {
        let mut bucket = RateLimitedValue::new(0, 0.0, 1.0);
        let mut runs = 0;
        assert!(bucket.attempt(0, 1.0, || runs += 1));
        assert!(!bucket.attempt(0, 1.0, || runs += 1));
        assert_eq!(runs, 1);
    }

    #[test]
    fn test_fill_bucket_keeps_rate() {
        let mut bucket = RateLimitedValue::new(0, 2.5, 4.0);
        bucket.set_token_count(0.0);
        bucket.fill_bucket();
        assert_eq!(bucket.tokens(), 4.0);
        assert_eq!(bucket.tokens_per_second(), 2.5);
    }

    #[test]
    fn test_set_token_count_clamps() {
        let mut bucket = RateLimitedValue::new(0, 1.0, 4.0);
        bucket.set_token_count(-3.0);
        assert_eq!(bucket.tokens(), 0.0);
        bucket.set_token_count(12.0);
        assert_eq!(bucket.tokens(), 4.0);
    }

    proptest! {
        #[test]
        fn prop_consume_within_budget(max in 1.0f64..1000.0, fraction in 0.0f64..=1.0) {
            let mut bucket = RateLimitedValue::new(0, 0.0, max);
            let cost = max * fraction;
            prop_assert!(bucket.consume(0, cost));
            prop_assert!((bucket.tokens() - (max - cost)).abs() < 1e-9);
        }

        #[test]
        fn prop_consume_over_budget_leaves_tokens(max in 1.0f64..1000.0, excess in 0.001f64..1000.0) {
            let mut bucket = RateLimitedValue::new(0, 0.0, max);
            prop_assert!(!bucket.consume(0, max + excess));
            prop_assert_eq!(bucket.tokens(), max);
        }

        #[test]
        fn prop_regenerate_twice_is_idempotent(
            start in 0.0f64..50.0,
            rate in 0.0f64..100.0,
            now in 0u64..1_000_000,
        ) {
            let mut bucket = RateLimitedValue::new(0, rate, 100.0);
            bucket.set_token_count(start);
            bucket.regenerate_tokens(now);
            let once = bucket.tokens();
            bucket.regenerate_tokens(now);
            prop_assert_eq!(bucket.tokens(), once);
        }
    }
}
