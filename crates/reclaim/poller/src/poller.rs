//! The condition poller.
//!
//! Turns push-style eventual consistency into a pull-style pass/fail: the
//! observation is repeated on a fixed cadence until the predicate holds, an
//! unrecoverable error is seen, or the overall deadline passes. The deadline
//! also bounds a single observation that never returns.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::PollConfig;
use crate::error::{Classify, ErrorClass, PollError};

/// Terminal outcome of one wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<S> {
    /// The predicate held on `state`.
    Satisfied { state: S, attempts: u32 },

    /// An observation failed in a way no retry can fix.
    Structural {
        reason: String,
        last_observed: Option<S>,
        attempts: u32,
    },

    /// The deadline passed first.
    TimedOut {
        last_observed: Option<S>,
        attempts: u32,
        elapsed: Duration,
    },
}

impl<S> PollOutcome<S> {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, PollOutcome::Satisfied { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Satisfied { attempts, .. }
            | PollOutcome::Structural { attempts, .. }
            | PollOutcome::TimedOut { attempts, .. } => *attempts,
        }
    }

    /// Most recent state seen, whether or not it satisfied the predicate.
    pub fn last_observed(&self) -> Option<&S> {
        match self {
            PollOutcome::Satisfied { state, .. } => Some(state),
            PollOutcome::Structural { last_observed, .. }
            | PollOutcome::TimedOut { last_observed, .. } => last_observed.as_ref(),
        }
    }
}

impl<S: fmt::Debug> PollOutcome<S> {
    /// Convert into a `Result`, rendering the last observed state for the
    /// failure message.
    pub fn into_result(self, condition: impl Into<String>) -> Result<S, PollError> {
        match self {
            PollOutcome::Satisfied { state, .. } => Ok(state),
            PollOutcome::Structural {
                reason,
                last_observed,
                attempts,
            } => Err(PollError::Structural {
                condition: condition.into(),
                reason,
                last_observed: last_observed.map(|s| format!("{:?}", s)),
                attempts,
            }),
            PollOutcome::TimedOut {
                last_observed,
                attempts,
                elapsed,
            } => Err(PollError::TimedOut {
                condition: condition.into(),
                elapsed,
                last_observed: last_observed.map(|s| format!("{:?}", s)),
                attempts,
            }),
        }
    }
}

/// An injectable source of observed state.
#[async_trait]
pub trait StateSource: Send + Sync {
    type State: Send;
    type Error: Classify + fmt::Display + Send;

    async fn observe(&self) -> Result<Self::State, Self::Error>;
}

/// What the poll loop has seen so far; survives cancellation by the
/// deadline.
struct Progress<S> {
    last: Option<S>,
    attempts: u32,
    seen: bool,
}

/// Bounded retry loop with error-class discrimination.
#[derive(Debug, Clone, Copy)]
pub struct ConditionPoller {
    config: PollConfig,
}

impl ConditionPoller {
    pub fn new(config: PollConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Poll an injectable [`StateSource`].
    pub async fn poll_source<Src, P>(&self, source: &Src, predicate: P) -> PollOutcome<Src::State>
    where
        Src: StateSource + ?Sized,
        P: Fn(&Src::State) -> bool,
    {
        self.poll_until(|| source.observe(), predicate).await
    }

    /// Re-run `observe` until `predicate` holds on its result.
    ///
    /// `Absent` errors before the first successful observation mean the
    /// object is still being created and are retried. `Absent` after a
    /// sighting, and every `Structural` error, end the wait at once.
    pub async fn poll_until<S, E, F, Fut, P>(&self, mut observe: F, predicate: P) -> PollOutcome<S>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<S, E>>,
        E: Classify + fmt::Display,
        P: Fn(&S) -> bool,
    {
        let start = Instant::now();
        let mut progress = Progress {
            last: None,
            attempts: 0,
            seen: false,
        };

        let result = tokio::time::timeout(
            self.config.timeout(),
            self.run(&mut observe, &predicate, &mut progress),
        )
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => {
                let elapsed = start.elapsed();
                warn!(
                    attempts = progress.attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Condition not observed before deadline"
                );
                PollOutcome::TimedOut {
                    last_observed: progress.last,
                    attempts: progress.attempts,
                    elapsed,
                }
            }
        }
    }

    async fn run<S, E, F, Fut, P>(
        &self,
        observe: &mut F,
        predicate: &P,
        progress: &mut Progress<S>,
    ) -> PollOutcome<S>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<S, E>>,
        E: Classify + fmt::Display,
        P: Fn(&S) -> bool,
    {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            progress.attempts += 1;

            match observe().await {
                Ok(state) => {
                    progress.seen = true;
                    if predicate(&state) {
                        debug!(attempts = progress.attempts, "Condition observed");
                        return PollOutcome::Satisfied {
                            state,
                            attempts: progress.attempts,
                        };
                    }
                    progress.last = Some(state);
                }
                Err(err) => match err.class() {
                    ErrorClass::Absent if !progress.seen => {
                        debug!(attempts = progress.attempts, error = %err, "Object not visible yet");
                    }
                    ErrorClass::Absent => {
                        return PollOutcome::Structural {
                            reason: format!("object disappeared after being observed: {}", err),
                            last_observed: progress.last.take(),
                            attempts: progress.attempts,
                        };
                    }
                    ErrorClass::Structural => {
                        return PollOutcome::Structural {
                            reason: err.to_string(),
                            last_observed: progress.last.take(),
                            attempts: progress.attempts,
                        };
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum FakeError {
        NotFound,
        Forbidden,
    }

    impl fmt::Display for FakeError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                FakeError::NotFound => write!(f, "not found"),
                FakeError::Forbidden => write!(f, "forbidden"),
            }
        }
    }

    impl Classify for FakeError {
        fn class(&self) -> ErrorClass {
            match self {
                FakeError::NotFound => ErrorClass::Absent,
                FakeError::Forbidden => ErrorClass::Structural,
            }
        }
    }

    /// Replays a script of observations; the last entry repeats forever.
    struct Scripted {
        steps: Mutex<VecDeque<Result<u32, FakeError>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(steps: Vec<Result<u32, FakeError>>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StateSource for Scripted {
        type State = u32;
        type Error = FakeError;

        async fn observe(&self) -> Result<u32, FakeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut steps = self.steps.lock().unwrap();
            if steps.len() > 1 {
                steps.pop_front().unwrap()
            } else {
                steps.front().cloned().unwrap()
            }
        }
    }

    fn poller(timeout_ms: u64) -> ConditionPoller {
        ConditionPoller::new(PollConfig::new(
            Duration::from_millis(100),
            Duration::from_millis(timeout_ms),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_satisfied_on_first_observation() {
        let source = Scripted::new(vec![Ok(3)]);
        let outcome = poller(1_000).poll_source(&source, |v| *v == 3).await;
        assert_eq!(
            outcome,
            PollOutcome::Satisfied {
                state: 3,
                attempts: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_satisfied_after_retries() {
        let source = Scripted::new(vec![Ok(0), Ok(1), Ok(2), Ok(3)]);
        let outcome = poller(5_000).poll_source(&source, |v| *v >= 3).await;
        assert!(outcome.is_satisfied());
        assert_eq!(outcome.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absence_before_first_sighting_is_retried() {
        let source = Scripted::new(vec![
            Err(FakeError::NotFound),
            Err(FakeError::NotFound),
            Ok(5),
        ]);
        let outcome = poller(5_000).poll_source(&source, |v| *v == 5).await;
        assert!(outcome.is_satisfied());
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_structural_error_aborts_without_retry() {
        let source = Scripted::new(vec![Err(FakeError::Forbidden), Ok(1)]);
        let outcome = poller(5_000).poll_source(&source, |v| *v == 1).await;
        assert!(matches!(
            outcome,
            PollOutcome::Structural { attempts: 1, .. }
        ));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disappearance_after_sighting_is_structural() {
        let source = Scripted::new(vec![Ok(1), Err(FakeError::NotFound)]);
        let outcome = poller(5_000).poll_source(&source, |v| *v == 2).await;
        match outcome {
            PollOutcome::Structural {
                reason,
                last_observed,
                attempts,
            } => {
                assert!(reason.contains("disappeared"));
                assert_eq!(last_observed, Some(1));
                assert_eq!(attempts, 2);
            }
            other => panic!("expected structural failure, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_last_observed() {
        let source = Scripted::new(vec![Ok(0), Ok(1)]);
        let outcome = poller(1_000).poll_source(&source, |v| *v == 2).await;
        match &outcome {
            PollOutcome::TimedOut {
                last_observed,
                attempts,
                elapsed,
            } => {
                assert_eq!(*last_observed, Some(1));
                assert!(*attempts >= 10);
                assert!(*elapsed >= Duration::from_millis(1_000));
            }
            other => panic!("expected timeout, got {:?}", other),
        }

        let err = outcome.into_result("value == 2").unwrap_err();
        assert_eq!(err.condition(), "value == 2");
        assert_eq!(err.last_observed(), Some("1"));
        assert!(err.to_string().contains("last observed: 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_while_never_visible() {
        let source = Scripted::new(vec![Err(FakeError::NotFound)]);
        let outcome = poller(500).poll_source(&source, |_| true).await;
        assert!(matches!(
            outcome,
            PollOutcome::TimedOut {
                last_observed: None,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_observation_is_bounded_by_deadline() {
        let outcome = poller(2_000)
            .poll_until(
                || std::future::pending::<Result<u32, FakeError>>(),
                |_| true,
            )
            .await;
        match outcome {
            PollOutcome::TimedOut {
                last_observed,
                attempts,
                ..
            } => {
                assert_eq!(last_observed, None);
                assert_eq!(attempts, 1);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_closure_observation() {
        let counter = AtomicU32::new(0);
        let outcome = poller(5_000)
            .poll_until(
                || async { Ok::<_, FakeError>(counter.fetch_add(1, Ordering::SeqCst)) },
                |v| *v == 2,
            )
            .await;
        assert_eq!(
            outcome.into_result("counter == 2").unwrap(),
            2
        );
    }
}
