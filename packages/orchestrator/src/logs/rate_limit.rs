// ABOUTME: Token bucket gating how many log lines per second reach live subscribers
// ABOUTME: Thin wrapper over a governor direct limiter with a full initial burst

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

pub struct LineRateLimiter {
    limiter: DirectLimiter,
}

impl LineRateLimiter {
    /// A rate of zero is treated as one line per second.
    pub fn per_second(lines: u32) -> Self {
        let rate = NonZeroU32::new(lines).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_second(rate)),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_is_capped_at_rate() {
        let limiter = LineRateLimiter::per_second(2);
        let allowed = (0..20).filter(|_| limiter.try_acquire()).count();
        assert_eq!(allowed, 2);
    }

    #[test]
    fn test_zero_rate_still_allows_one() {
        let limiter = LineRateLimiter::per_second(0);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }
}
