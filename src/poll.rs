//! Condition polling for eventually-consistent external state.
//!
//! [`Poller::wait_until`] re-evaluates an async predicate with a fixed delay
//! between attempts until it returns `true`, the timeout passes, the run is
//! cancelled, or (when errors halt the wait) the predicate fails.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default delay between attempts.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Default overall budget for one wait.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Shortest delay between attempts. Smaller intervals, zero included, are
/// raised to this so the loop always yields to the timer.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Timing and failure policy for one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOptions {
    /// Delay between the end of one attempt and the start of the next.
    pub interval: Duration,
    /// Overall budget, measured from the first attempt. A zero budget still
    /// makes one attempt.
    pub timeout: Duration,
    /// When `true`, a predicate error ends the wait. When `false`, it counts
    /// as "not yet" and polling continues.
    pub halt_on_error: bool,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            halt_on_error: true,
        }
    }
}

impl PollOptions {
    /// Set the delay between attempts, at least [`MIN_INTERVAL`].
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Set the overall budget.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Treat predicate errors as "not yet".
    pub fn tolerate_errors(mut self) -> Self {
        self.halt_on_error = false;
        self
    }

    /// Let the first predicate error end the wait.
    pub fn halt_on_error(mut self) -> Self {
        self.halt_on_error = true;
        self
    }
}

/// How a wait ended.
#[derive(Debug)]
pub enum PollOutcome<E> {
    /// The predicate returned `true`.
    Satisfied {
        /// Attempts made, including the successful one.
        attempts: u32,
        /// Time from the first attempt to success.
        elapsed: Duration,
    },
    /// The budget ran out first.
    TimedOut {
        /// Attempts started before the deadline.
        attempts: u32,
        /// Time spent waiting.
        elapsed: Duration,
    },
    /// The predicate failed and errors halt the wait.
    Failed {
        /// Attempt that failed.
        attempt: u32,
        /// The predicate's error.
        error: E,
    },
    /// The wait was cancelled.
    Cancelled {
        /// Attempts made before cancellation.
        attempts: u32,
    },
}

impl<E> PollOutcome<E> {
    /// Returns `true` if the predicate was satisfied.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied { .. })
    }

    /// Convert into a `Result` carrying the attempt count on success.
    pub fn into_result(self) -> Result<u32, PollError<E>> {
        match self {
            Self::Satisfied { attempts, .. } => Ok(attempts),
            Self::TimedOut { attempts, elapsed } => Err(PollError::Timeout { attempts, elapsed }),
            Self::Failed { attempt, error } => Err(PollError::Predicate { attempt, error }),
            Self::Cancelled { attempts } => Err(PollError::Cancelled { attempts }),
        }
    }
}

/// A wait that did not end with the predicate satisfied.
#[derive(thiserror::Error, Debug)]
pub enum PollError<E> {
    /// The condition never held within the budget.
    #[error("condition not met after {attempts} attempts in {elapsed:?}")]
    Timeout {
        /// Attempts started before the deadline.
        attempts: u32,
        /// Time spent waiting.
        elapsed: Duration,
    },

    /// The predicate failed and errors halt the wait.
    #[error("condition check failed on attempt {attempt}: {error}")]
    Predicate {
        /// Attempt that failed.
        attempt: u32,
        /// The predicate's error.
        error: E,
    },

    /// The wait was cancelled.
    #[error("wait cancelled after {attempts} attempts")]
    Cancelled {
        /// Attempts made before cancellation.
        attempts: u32,
    },
}

impl<E> PollError<E> {
    /// Returns `true` for [`PollError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Evaluates predicates under a default [`PollOptions`] and a cancellation
/// token shared with the run.
#[derive(Debug, Clone, Default)]
pub struct Poller {
    options: PollOptions,
    cancel: CancellationToken,
}

impl Poller {
    /// Create a poller with the given default options.
    pub fn new(options: PollOptions) -> Self {
        Self {
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop polling as soon as `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The default options used by [`Poller::wait_until`].
    pub fn options(&self) -> PollOptions {
        self.options
    }

    /// Wait with the default options (errors halt the wait).
    pub async fn wait_until<F, Fut, E>(&self, predicate: F) -> Result<u32, PollError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: fmt::Display,
    {
        self.poll(self.options, predicate).await.into_result()
    }

    /// Wait with explicit options.
    pub async fn wait_until_with<F, Fut, E>(
        &self,
        options: PollOptions,
        predicate: F,
    ) -> Result<u32, PollError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: fmt::Display,
    {
        self.poll(options, predicate).await.into_result()
    }

    /// Run the polling loop and report how it ended.
    pub async fn poll<F, Fut, E>(&self, options: PollOptions, mut predicate: F) -> PollOutcome<E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: fmt::Display,
    {
        let started = Instant::now();
        let deadline = started + options.timeout;
        let mut attempts = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return PollOutcome::Cancelled { attempts };
            }
            if attempts > 0 && Instant::now() >= deadline {
                return PollOutcome::TimedOut {
                    attempts,
                    elapsed: started.elapsed(),
                };
            }

            attempts += 1;
            let evaluation = tokio::time::timeout_at(deadline, predicate());
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PollOutcome::Cancelled { attempts },
                result = evaluation => result,
            };

            match result {
                Err(_) => {
                    tracing::warn!(attempt = attempts, "poll.attempt_abandoned_at_deadline");
                    return PollOutcome::TimedOut {
                        attempts,
                        elapsed: started.elapsed(),
                    };
                }
                Ok(Ok(true)) => {
                    tracing::debug!(attempt = attempts, "poll.satisfied");
                    return PollOutcome::Satisfied {
                        attempts,
                        elapsed: started.elapsed(),
                    };
                }
                Ok(Ok(false)) => {
                    tracing::debug!(attempt = attempts, "poll.not_yet");
                }
                Ok(Err(error)) if options.halt_on_error => {
                    tracing::error!(attempt = attempts, error = %error, "poll.failed");
                    return PollOutcome::Failed {
                        attempt: attempts,
                        error,
                    };
                }
                Ok(Err(error)) => {
                    tracing::warn!(attempt = attempts, error = %error, "poll.error_tolerated");
                }
            }

            let wake = (Instant::now() + options.interval.max(MIN_INTERVAL)).min(deadline);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PollOutcome::Cancelled { attempts },
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug, PartialEq)]
    struct Unreachable;

    impl fmt::Display for Unreachable {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("device unreachable")
        }
    }

    fn fast() -> PollOptions {
        PollOptions::default()
            .interval(Duration::from_secs(1))
            .timeout(Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn satisfied_on_first_attempt() {
        let poller = Poller::new(fast());
        let attempts = poller
            .wait_until(|| async { Ok::<_, Unreachable>(true) })
            .await
            .expect("predicate holds");
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn halting_wait_propagates_first_error_without_retry() {
        let calls = AtomicU32::new(0);
        let poller = Poller::new(fast());

        let result = poller
            .wait_until(|| {
                let calls = &calls;
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<bool, _>(Unreachable)
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(PollError::Predicate {
                attempt: 1,
                error: Unreachable
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tolerant_wait_retries_past_errors() {
        let calls = AtomicU32::new(0);
        let poller = Poller::new(fast());

        let attempts = poller
            .wait_until_with(fast().tolerate_errors(), || {
                let calls = &calls;
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(Unreachable)
                    } else {
                        Ok(true)
                    }
                }
            })
            .await
            .expect("third attempt succeeds");

        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn never_satisfied_is_a_timeout() {
        let poller = Poller::new(fast());
        let started = Instant::now();

        let result = poller
            .wait_until(|| async { Ok::<_, Unreachable>(false) })
            .await;

        match result {
            Err(PollError::Timeout { attempts, elapsed }) => {
                assert!(attempts >= 10, "one attempt per interval, got {attempts}");
                assert!(elapsed >= Duration::from_secs(10));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn tolerated_errors_still_time_out() {
        let poller = Poller::new(fast());
        let result = poller
            .wait_until_with(fast().tolerate_errors(), || async {
                Err::<bool, _>(Unreachable)
            })
            .await;

        assert!(result.expect_err("never satisfied").is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_predicate_is_abandoned_at_deadline() {
        let poller = Poller::new(fast());
        let outcome = poller
            .poll(fast(), || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, Unreachable>(true)
            })
            .await;

        assert!(matches!(outcome, PollOutcome::TimedOut { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_further_attempts() {
        let cancel = CancellationToken::new();
        let poller = Poller::new(fast()).with_cancellation(cancel.clone());
        let calls = AtomicU32::new(0);

        let outcome = poller
            .poll(fast(), || {
                let calls = &calls;
                let cancel = &cancel;
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                        cancel.cancel();
                    }
                    Ok::<_, Unreachable>(false)
                }
            })
            .await;

        assert!(matches!(outcome, PollOutcome::Cancelled { attempts: 2 }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn already_cancelled_makes_no_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let poller = Poller::new(fast()).with_cancellation(cancel);

        let result = poller
            .wait_until(|| async { Ok::<_, Unreachable>(true) })
            .await;

        assert!(matches!(result, Err(PollError::Cancelled { attempts: 0 })));
    }

    #[test]
    fn defaults_halt_on_error() {
        let options = PollOptions::default();
        assert!(options.halt_on_error);
        assert_eq!(options.interval, DEFAULT_INTERVAL);
        assert_eq!(options.timeout, DEFAULT_TIMEOUT);
        assert!(!options.tolerate_errors().halt_on_error);
    }

    #[test]
    fn interval_builder_enforces_floor() {
        let options = PollOptions::default().interval(Duration::ZERO);
        assert_eq!(options.interval, MIN_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_still_reaches_the_deadline() {
        let options = PollOptions {
            interval: Duration::ZERO,
            timeout: Duration::from_millis(10),
            halt_on_error: true,
        };
        let calls = AtomicU32::new(0);
        let poller = Poller::new(options);

        let outcome = poller
            .poll(options, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Unreachable>(false)
            })
            .await;

        match outcome {
            PollOutcome::TimedOut { attempts, elapsed } => {
                assert_eq!(attempts, 10);
                assert_eq!(elapsed, Duration::from_millis(10));
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }
}
