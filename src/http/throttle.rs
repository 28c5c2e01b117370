//! Throttle module provides the strategies used to wait in between retry
//! attempts. Waiting goes through a trait so the retry logic can be tested
//! without real timers.

use std::thread;

use crate::registry::CancelToken;
use crate::{log_debug, log_info, time::Milliseconds};

/// Throttle strategy
pub trait Throttle: Send + Sync {
    /// Throttle for specific amount of time.
    fn throttle_for(&self, delay: Milliseconds) {
        log_info!("Throttling for: {} ms", delay);
        thread::sleep(delay.as_duration());
    }
    /// Throttle for `delay` unless `token` is cancelled first. Returns true
    /// when the wait was cut short by a cancellation.
    fn throttle_until_cancelled(&self, delay: Milliseconds, token: &CancelToken) -> bool {
        log_info!("Throttling for: {} ms", delay);
        token.wait_timeout(delay.as_duration())
    }
    /// Return strategy type
    fn strategy(&self) -> ThrottleStrategyType;
}

#[derive(Clone, Debug, PartialEq)]
pub enum ThrottleStrategyType {
    DynamicFixed,
    NoThrottle,
}

/// Dynamically throttles for the amount of time specified in the throttle_for
/// method using the default trait implementation. This is the production
/// strategy: the backoff computes the delay and the thread sleeps for it.
#[derive(Clone, Copy, Debug, Default)]
pub struct DynamicFixed;

impl Throttle for DynamicFixed {
    fn strategy(&self) -> ThrottleStrategyType {
        ThrottleStrategyType::DynamicFixed
    }
}

/// Never sleeps. Retries happen back to back.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoThrottle;

impl NoThrottle {
    pub fn new() -> Self {
        Self {}
    }
}

impl Throttle for NoThrottle {
    fn throttle_for(&self, delay: Milliseconds) {
        log_debug!("No throttling enabled, skipping {} ms", delay);
    }
    fn throttle_until_cancelled(&self, delay: Milliseconds, token: &CancelToken) -> bool {
        self.throttle_for(delay);
        token.is_cancelled()
    }
    fn strategy(&self) -> ThrottleStrategyType {
        ThrottleStrategyType::NoThrottle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_dynamic_fixed_sleeps_for_delay() {
        let start = Instant::now();
        DynamicFixed.throttle_for(Milliseconds::new(20));
        assert!(start.elapsed().as_millis() >= 20);
        assert_eq!(ThrottleStrategyType::DynamicFixed, DynamicFixed.strategy());
    }

    #[test]
    fn test_no_throttle_returns_immediately() {
        let start = Instant::now();
        NoThrottle::new().throttle_for(Milliseconds::new(10_000));
        assert!(start.elapsed().as_millis() < 1_000);
    }

    #[test]
    fn test_dynamic_fixed_wait_is_cut_short_by_cancel() {
        let token = Arc::new(CancelToken::new());
        let canceller = {
            let token = token.clone();
            thread::spawn(move || {
                thread::sleep(std::time::Duration::from_millis(50));
                token.cancel("dispose");
            })
        };
        let start = Instant::now();
        assert!(DynamicFixed.throttle_until_cancelled(Milliseconds::new(5_000), &token));
        assert!(start.elapsed().as_millis() < 2_000);
        canceller.join().unwrap();
    }

    #[test]
    fn test_dynamic_fixed_waits_full_delay_when_not_cancelled() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert!(!DynamicFixed.throttle_until_cancelled(Milliseconds::new(20), &token));
        assert!(start.elapsed().as_millis() >= 20);
    }
}
