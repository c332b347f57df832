//! Bounded retry of whole bus operations

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use log::warn;

use crate::error::{Error, Phase};

/// Attempts of an operation before its error is surfaced
pub const DEFAULT_ATTEMPTS: usize = 3;
/// Deadline of a single attempt
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(20);
/// Pause between a failed attempt and the next one
pub const DEFAULT_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// How often and how long an operation is tried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, at least 1
    pub attempts: usize,
    /// Deadline of each attempt
    pub timeout: Duration,
    /// Pause before each repeated attempt
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            timeout: DEFAULT_ATTEMPT_TIMEOUT,
            pause: DEFAULT_RETRY_PAUSE,
        }
    }
}

impl RetryPolicy {
    /// Policy that tries once
    pub fn once(timeout: Duration) -> Self {
        Self {
            attempts: 1,
            timeout,
            pause: Duration::ZERO,
        }
    }
}

/// Errors that know whether another attempt may help
pub trait Retryable {
    /// Whether repeating the failed operation may succeed
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        Error::is_retryable(self)
    }
}

/// Run `op` under `policy`: each attempt races the policy timeout, and
/// retryable failures start a new attempt after the policy pause until the
/// attempts run out.
///
/// A timed-out attempt fails with [`Error::Timeout`] carrying `phase`. Its
/// future is dropped mid-transaction, so the adapter is reset before the
/// next transaction takes the bus.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    phase: Phase,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display + From<Error>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        let result = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout { phase }.into()),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && e.is_retryable() => {
                warn!("{} attempt {}/{} failed: {}", phase, attempt, attempts, e);
                attempt += 1;
                if !policy.pause.is_zero() {
                    tokio::time::sleep(policy.pause).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn quick() -> RetryPolicy {
        RetryPolicy {
            pause: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<usize, Error> = with_retry(&quick(), Phase::Read, || async move {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(Error::BusBusy { phase: Phase::Read }),
                n => Ok(n),
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), Error> = with_retry(&quick(), Phase::Write, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::WriteVerificationFailed { address: 0 })
        })
        .await;

        assert_eq!(result, Err(Error::WriteVerificationFailed { address: 0 }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_usage_error_is_immediate() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), Error> = with_retry(&quick(), Phase::Write, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::LengthMismatch { new: 1, old: 2 })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout() {
        let policy = RetryPolicy {
            attempts: 2,
            timeout: Duration::from_millis(50),
            pause: Duration::ZERO,
        };
        let result: Result<(), Error> = with_retry(&policy, Phase::Read, || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;

        assert_eq!(result, Err(Error::Timeout { phase: Phase::Read }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_between_attempts() {
        let started = Mutex::new(Vec::new());
        let starts = &started;
        let result: Result<(), Error> =
            with_retry(&RetryPolicy::default(), Phase::Read, || async move {
                starts.lock().unwrap().push(Instant::now());
                Err(Error::BusBusy { phase: Phase::Read })
            })
            .await;

        assert_eq!(result, Err(Error::BusBusy { phase: Phase::Read }));
        let starts = started.lock().unwrap();
        assert_eq!(starts.len(), DEFAULT_ATTEMPTS);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= DEFAULT_RETRY_PAUSE);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_pause_after_last_attempt() {
        let policy = RetryPolicy {
            attempts: 2,
            timeout: Duration::from_secs(1),
            pause: Duration::from_secs(1),
        };
        let start = Instant::now();
        let result: Result<(), Error> = with_retry(&policy, Phase::Read, || async {
            Err(Error::BusBusy { phase: Phase::Read })
        })
        .await;

        assert!(result.is_err());
        assert!(start.elapsed() >= policy.pause);
        assert!(start.elapsed() < policy.pause * 2);
    }
}
