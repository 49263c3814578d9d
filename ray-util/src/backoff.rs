// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Exponential backoff and bounded retry policy.
//!
//! Used by the pull manager to retry transient transfer failures before
//! giving up on a remote object.

use std::time::Duration;

/// Exponential backoff calculator with jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    current_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay,
            current_delay: initial_delay,
        }
    }

    /// Returns the next backoff duration and advances the internal state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        let next = Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.multiplier);
        self.current_delay = next.min(self.max_delay);
        delay
    }

    /// Returns the next backoff duration with random jitter (0 to +50%),
    /// never exceeding the cap.
    pub fn next_delay_with_jitter(&mut self) -> Duration {
        let delay = self.next_delay();
        let jitter_factor = 1.0 + rand::random::<f64>() * 0.5;
        Duration::from_secs_f64(delay.as_secs_f64() * jitter_factor).min(self.max_delay)
    }

    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
    }
}

/// A bounded number of attempts spaced by exponential backoff.
///
/// `max_attempts` counts the first try, so a policy with `max_attempts == 3`
/// sleeps at most twice.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    attempts: u32,
    backoff: ExponentialBackoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempts: 0,
            backoff: ExponentialBackoff::new(initial_delay, 2.0, max_delay),
        }
    }

    /// Record an attempt. Returns the delay to wait before the next attempt,
    /// or `None` once the budget is exhausted.
    pub fn on_failure(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            None
        } else {
            Some(self.backoff.next_delay_with_jitter())
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), 2.0, Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
    }

    #[test]
    fn test_max_cap() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(5), 3.0, Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        assert_eq!(backoff.next_delay_with_jitter(), Duration::from_secs(10));
    }

    #[test]
    fn test_reset() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), 2.0, Duration::from_secs(10));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_retry_policy_budget() {
        let mut policy =
            RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(100));
        let first = policy.on_failure().unwrap();
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_millis(15));
        assert!(policy.on_failure().is_some());
        assert!(policy.on_failure().is_none());
        assert_eq!(policy.attempts(), 3);
    }

    #[test]
    fn test_retry_policy_single_attempt() {
        let mut policy = RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1));
        assert_eq!(policy.max_attempts(), 1);
        assert!(policy.on_failure().is_none());
    }
}
