//! Circuit breaker around the classifier.
//!
//! After `failure_threshold` consecutive failures the circuit opens and every
//! call fails fast with [`ClassifierError::CircuitOpen`] for
//! `recovery_timeout`. The first call after that is a single half-open trial:
//! success closes the circuit, failure reopens it and restarts the timer.
//!
//! The failure counters are the only classifier state shared between worker
//! threads, so all of it sits behind one lock.

use crate::classifier::{Classification, Classifier, ClassifierError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Rejecting calls until the recovery timeout elapses.
    Open,
    /// One trial call is allowed through.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
        }
    }

    /// Current state as last recorded. An open circuit whose timeout has
    /// elapsed still reports `Open` until the next call claims the trial.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Ask permission to make a call.
    pub fn try_acquire(&self) -> Result<(), ClassifierError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.recovery_timeout);
                if elapsed >= self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!("Circuit breaker half-open, allowing trial call");
                    Ok(())
                } else {
                    Err(ClassifierError::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(ClassifierError::CircuitOpen)
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!("Circuit breaker closed after successful trial call");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        failures = inner.consecutive_failures,
                        recovery_secs = self.recovery_timeout.as_secs_f64(),
                        "Circuit breaker opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                warn!("Circuit breaker trial call failed, reopening");
            }
            CircuitState::Open => {
                inner.consecutive_failures += 1;
            }
        }
    }
}

/// Wraps a classifier with a shared [`CircuitBreaker`].
pub struct CircuitBreakingClassifier<C> {
    inner: C,
    breaker: Arc<CircuitBreaker>,
}

impl<C: Classifier> CircuitBreakingClassifier<C> {
    pub fn new(inner: C, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }
}

impl<C: Classifier> Classifier for CircuitBreakingClassifier<C> {
    fn classify(&self, image: &[u8]) -> Result<Classification, ClassifierError> {
        self.breaker.try_acquire()?;

        match self.inner.classify(image) {
            Ok(classification) => {
                self.breaker.record_success();
                Ok(classification)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::testing::{labels, ScriptedClassifier};

    fn failing() -> Arc<ScriptedClassifier> {
        Arc::new(ScriptedClassifier::always(Err(ClassifierError::Transient(
            "down".into(),
        ))))
    }

    #[test]
    fn test_opens_after_threshold_and_fails_fast() {
        let inner = failing();
        let breaker = Arc::new(CircuitBreaker::new(3, Duration::from_secs(60)));
        let classifier = CircuitBreakingClassifier::new(inner.clone(), breaker.clone());

        for _ in 0..3 {
            assert!(matches!(
                classifier.classify(&[]),
                Err(ClassifierError::Transient(_))
            ));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        for _ in 0..10 {
            assert_eq!(classifier.classify(&[]), Err(ClassifierError::CircuitOpen));
        }
        assert_eq!(inner.calls(), 3);
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let inner = Arc::new(ScriptedClassifier::new(
            vec![
                Err(ClassifierError::Transient("a".into())),
                Err(ClassifierError::Transient("b".into())),
                Ok(labels(&[("Focused", 0.9)])),
                Err(ClassifierError::Transient("c".into())),
                Err(ClassifierError::Transient("d".into())),
            ],
            Ok(labels(&[("Focused", 0.9)])),
        ));
        let breaker = Arc::new(CircuitBreaker::new(3, Duration::from_secs(60)));
        let classifier = CircuitBreakingClassifier::new(inner, breaker.clone());

        for _ in 0..5 {
            let _ = classifier.classify(&[]);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 2);
    }

    #[test]
    fn test_half_open_trial_success_closes() {
        let inner = Arc::new(ScriptedClassifier::new(
            vec![
                Err(ClassifierError::Transient("a".into())),
                Err(ClassifierError::Transient("b".into())),
            ],
            Ok(labels(&[("Focused", 0.9)])),
        ));
        let breaker = Arc::new(CircuitBreaker::new(2, Duration::from_millis(30)));
        let classifier = CircuitBreakingClassifier::new(inner.clone(), breaker.clone());

        let _ = classifier.classify(&[]);
        let _ = classifier.classify(&[]);
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(50));
        assert!(classifier.classify(&[]).is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(inner.calls(), 3);
    }

    #[test]
    fn test_half_open_trial_failure_reopens_and_resets_timer() {
        let inner = failing();
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_millis(40)));
        let classifier = CircuitBreakingClassifier::new(inner.clone(), breaker.clone());

        let _ = classifier.classify(&[]);
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(
            classifier.classify(&[]),
            Err(ClassifierError::Transient(_))
        ));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(inner.calls(), 2);

        // Timer restarted: still rejecting right after the failed trial.
        assert_eq!(classifier.classify(&[]), Err(ClassifierError::CircuitOpen));
        assert_eq!(inner.calls(), 2);
    }

    #[test]
    fn test_only_one_trial_in_half_open() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.try_acquire(), Err(ClassifierError::CircuitOpen));
    }
}
