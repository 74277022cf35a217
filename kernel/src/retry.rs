// Bounded Retry
//
// Conflicts with concurrent writers are recovered by re-running the whole
// operation against freshly read metadata. Retries are bounded and spaced
// with exponential backoff.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Recovery class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The base metadata went stale; retry from a fresh read.
    Conflict,

    /// The write needs a newer table format version.
    NeedsUpgrade,

    Other,
}

/// Errors that can be classified for recovery.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff_ms: 25,
            max_backoff_ms: 2_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("retry budget exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error(transparent)]
    Fatal(E),
}

impl<E: std::error::Error + 'static> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Fatal(err) => err,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-conflict error, or the
/// attempt budget is spent.
pub fn retry_on_conflict<T, E, F>(policy: &RetryPolicy, mut op: F) -> Result<T, RetryError<E>>
where
    E: std::error::Error + Classify + 'static,
    F: FnMut() -> Result<T, E>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.kind() != ErrorKind::Conflict => return Err(RetryError::Fatal(err)),
            Err(err) if attempt >= max_attempts => {
                tracing::warn!(attempts = attempt, error = %err, "giving up after repeated conflicts");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            Err(err) => {
                let delay = policy.backoff(attempt);
                tracing::warn!(attempt, ?delay, error = %err, "conflict with a concurrent writer, retrying");
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("conflict")]
        Conflict,
        #[error("boom")]
        Boom,
    }

    impl Classify for TestError {
        fn kind(&self) -> ErrorKind {
            match self {
                TestError::Conflict => ErrorKind::Conflict,
                TestError::Boom => ErrorKind::Other,
            }
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 2.0,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
        assert_eq!(policy.backoff(4), Duration::from_millis(50));
        assert_eq!(policy.backoff(40), Duration::from_millis(50));
    }

    #[test]
    fn conflicts_are_retried_until_success() {
        let mut calls = 0;
        let result = retry_on_conflict(&fast(), || {
            calls += 1;
            if calls < 3 {
                Err(TestError::Conflict)
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let mut calls = 0;
        let err = retry_on_conflict(&fast(), || -> Result<(), _> {
            calls += 1;
            Err(TestError::Boom)
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, RetryError::Fatal(TestError::Boom)));
    }

    #[test]
    fn budget_is_bounded() {
        let mut calls = 0;
        let err = retry_on_conflict(&fast(), || -> Result<(), _> {
            calls += 1;
            Err(TestError::Conflict)
        })
        .unwrap_err();
        assert_eq!(calls, 4);
        assert!(matches!(err, RetryError::Exhausted { attempts: 4, .. }));
        assert!(err.to_string().contains("exhausted after 4 attempts"));
    }
}
