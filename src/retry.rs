//! Retries transient failures with exponential backoff.

use crate::error::UsageError;
use backoff::ExponentialBackoffBuilder;
use std::time::Duration;
use tracing::{event, Level};

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub initial_millis: u64,
    pub max_millis: u64,
    /// Gives up once this much time was spent retrying.
    pub max_elapsed_millis: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_millis: 50,
            max_millis: 2000,
            max_elapsed_millis: 10000,
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds, fails permanently, or the policy
    /// gives up. The last error is returned.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T, UsageError>
    where
        F: FnMut() -> Result<T, UsageError>,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_millis))
            .with_max_interval(Duration::from_millis(self.max_millis))
            .with_max_elapsed_time(Some(Duration::from_millis(self.max_elapsed_millis)))
            .build();
        let mut attempt = 0;
        backoff::retry(policy, || {
            attempt += 1;
            op().map_err(|e| {
                if e.is_transient() {
                    event!(Level::WARN, "Attempt {} to {} failed: {}", attempt, what, e);
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .map_err(|e| match e {
            backoff::Error::Permanent(e) => e,
            backoff::Error::Transient { err, .. } => err,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::RetryPolicy;
    use crate::error::UsageError;
    use crate::store::StoreError;

    fn quick() -> RetryPolicy {
        RetryPolicy {
            initial_millis: 1,
            max_millis: 2,
            max_elapsed_millis: 50,
        }
    }

    #[test]
    fn test_retries_transient_failures() {
        let mut calls = 0;
        let result = quick().run("read", || {
            calls += 1;
            if calls < 3 {
                Err(UsageError::from(StoreError::Unavailable("busy".to_string())))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_permanent_failures_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), UsageError> = quick().run("read", || {
            calls += 1;
            Err(StoreError::Corrupt {
                key: "k".to_string(),
                reason: "bad".to_string(),
            }
            .into())
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_gives_up() {
        let result: Result<(), UsageError> = quick().run("write", || {
            Err(StoreError::Unavailable("down".to_string()).into())
        });
        assert!(result.unwrap_err().is_transient());
    }
}
