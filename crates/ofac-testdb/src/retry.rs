//! Bounded retry loop used while waiting for an instance to come up.

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

/// How often, and how many times, to re-attempt an operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub interval: Duration,

    /// Factor applied to the delay after each failed attempt. `1.0` keeps
    /// the interval fixed.
    pub backoff: f64,

    /// Upper bound for any single delay.
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            interval: Duration::from_millis(100),
            backoff: 1.5,
            max_interval: Duration::from_secs(5),
        }
    }
}

/// The last error seen once a [`RetryPolicy`] ran out of attempts.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last: E,
}

impl RetryPolicy {
    /// A policy with a constant delay between attempts.
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            backoff: 1.0,
            max_interval: interval,
        }
    }

    /// The delay schedule as an un-jittered exponential backoff. The attempt
    /// budget is enforced by [`retry`](Self::retry), not by elapsed time.
    pub fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.interval)
            .with_randomization_factor(0.0)
            .with_multiplier(self.backoff.max(1.0))
            .with_max_interval(self.max_interval.max(self.interval))
            .with_max_elapsed_time(None)
            .build()
    }

    /// Calls `op` until it succeeds or the attempt budget is spent, sleeping
    /// between attempts. `op` receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns the final error together with the number of attempts made.
    pub fn retry<T, E, F>(&self, mut op: F) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut(u32) -> Result<T, E>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        let result = backoff::retry(self.schedule(), || {
            attempt += 1;
            op(attempt).map_err(|err| {
                if attempt >= max_attempts {
                    backoff::Error::permanent(err)
                } else {
                    backoff::Error::transient(err)
                }
            })
        });

        result.map_err(|err| {
            let last = match err {
                backoff::Error::Permanent(err) => err,
                backoff::Error::Transient { err, .. } => err,
            };
            RetryExhausted {
                attempts: attempt,
                last,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use backoff::backoff::Backoff;

    use super::*;

    #[test]
    fn fixed_policy_keeps_interval() {
        let mut schedule = RetryPolicy::fixed(5, Duration::from_millis(40)).schedule();
        for _ in 0..4 {
            assert_eq!(schedule.next_backoff(), Some(Duration::from_millis(40)));
        }
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            interval: Duration::from_millis(100),
            backoff: 2.0,
            max_interval: Duration::from_millis(500),
        };
        let mut schedule = policy.schedule();
        assert_eq!(schedule.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(schedule.next_backoff(), Some(Duration::from_millis(200)));
        assert_eq!(schedule.next_backoff(), Some(Duration::from_millis(400)));
        assert_eq!(schedule.next_backoff(), Some(Duration::from_millis(500)));
        assert_eq!(schedule.next_backoff(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn retry_returns_first_success() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let mut calls = 0;
        let value = policy
            .retry(|attempt| {
                calls += 1;
                if attempt < 3 {
                    Err("not yet")
                } else {
                    Ok(attempt)
                }
            })
            .expect("third attempt should succeed");
        assert_eq!(value, 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_gives_up_after_budget() {
        let policy = RetryPolicy::fixed(4, Duration::from_millis(1));
        let exhausted = policy
            .retry(|attempt| Err::<(), _>(format!("attempt {attempt} failed")))
            .expect_err("every attempt fails");
        assert_eq!(exhausted.attempts, 4);
        assert_eq!(exhausted.last, "attempt 4 failed");
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let policy = RetryPolicy::fixed(0, Duration::from_millis(1));
        let exhausted = policy
            .retry(|_| Err::<(), _>("down"))
            .expect_err("the single attempt fails");
        assert_eq!(exhausted.attempts, 1);
    }
}
