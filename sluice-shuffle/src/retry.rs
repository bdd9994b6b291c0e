//! Bounded exponential backoff for transient producer errors.

use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::ProducerError;

/// Retries transient errors, doubling the backoff up to a cap.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    /// Creates a policy from configuration.
    #[must_use]
    pub const fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
        }
    }

    /// Total attempts allowed, including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before attempt `attempt + 1`, where `attempt` starts at 1.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1_u32 << shift)
            .min(self.max_backoff)
    }

    /// Runs `op` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `on_retry` is called before each backoff with the attempt that failed.
    ///
    /// # Errors
    /// Returns the last error if every attempt failed or an error was fatal.
    pub fn run<T, F, R>(&self, mut op: F, mut on_retry: R) -> Result<T, ProducerError>
    where
        F: FnMut() -> Result<T, ProducerError>,
        R: FnMut(u32, &ProducerError),
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    on_retry(attempt, &err);
                    std::thread::sleep(self.backoff(attempt));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        })
    }

    fn transient() -> ProducerError {
        ProducerError::Transient {
            partition_id: "p".to_string(),
            message: "busy".to_string(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(10);
        assert_eq!(p.backoff(1), Duration::from_millis(1));
        assert_eq!(p.backoff(2), Duration::from_millis(2));
        assert_eq!(p.backoff(3), Duration::from_millis(4));
        assert_eq!(p.backoff(8), Duration::from_millis(4));
        assert_eq!(p.backoff(100), Duration::from_millis(4));
    }

    #[test]
    fn test_retry_succeeds_after_transient_errors() {
        let mut calls = 0;
        let mut retries = Vec::new();
        let result = policy(5).run(
            || {
                calls += 1;
                if calls < 3 {
                    Err(transient())
                } else {
                    Ok(calls)
                }
            },
            |attempt, _| retries.push(attempt),
        );

        assert_eq!(result, Ok(3));
        assert_eq!(retries, vec![1, 2]);
    }

    #[test]
    fn test_retry_gives_up_after_max_attempts() {
        let mut calls = 0;
        let result: Result<(), _> = policy(3).run(
            || {
                calls += 1;
                Err(transient())
            },
            |_, _| {},
        );

        assert_eq!(result, Err(transient()));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_stops_on_fatal() {
        let mut calls = 0;
        let result: Result<(), _> = policy(5).run(
            || {
                calls += 1;
                Err(ProducerError::Fatal {
                    partition_id: "p".to_string(),
                    message: "closed".to_string(),
                })
            },
            |_, _| {},
        );

        assert!(matches!(result, Err(ProducerError::Fatal { .. })));
        assert_eq!(calls, 1);
    }
}
