//! Retry with exponential backoff around the classifier.

use crate::classifier::{Classification, Classifier, ClassifierError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Granularity at which a backoff sleep checks for shutdown.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    /// Delay after the n-th failed attempt is `unit * base^n`.
    pub backoff_base: f64,
    pub backoff_unit: Duration,
    /// Hard cap on a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: 2.0,
            backoff_unit: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
            ..Self::default()
        }
    }

    /// Delay before the attempt following `failed_attempts` failures.
    pub fn delay_for_attempt(&self, failed_attempts: u32) -> Duration {
        let factor = self.backoff_base.max(0.0).powi(failed_attempts as i32);
        let secs = self.backoff_unit.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Retries retryable failures of the wrapped classifier.
///
/// A [`ClassifierError::CircuitOpen`] is returned immediately.
pub struct RetryingClassifier<C> {
    inner: C,
    policy: RetryPolicy,
    stop: Option<Arc<AtomicBool>>,
}

impl<C: Classifier> RetryingClassifier<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            stop: None,
        }
    }

    /// Abandon backoff sleeps once `stop` is set.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    fn stopped(&self) -> bool {
        self.stop
            .as_ref()
            .map(|s| s.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Sleep for `delay`, waking early on stop. Returns false if stopped.
    fn backoff(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

impl<C: Classifier> Classifier for RetryingClassifier<C> {
    fn classify(&self, image: &[u8]) -> Result<Classification, ClassifierError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.inner.classify(image) {
                Ok(classification) => {
                    if attempt > 1 {
                        debug!(attempt, "Classifier succeeded after retry");
                    }
                    return Ok(classification);
                }
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= self.policy.max_attempts {
                return Err(err);
            }

            let delay = self.policy.delay_for_attempt(attempt);
            match &err {
                ClassifierError::RateLimited(_) => warn!(
                    attempt,
                    max = self.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Classifier rate limited, backing off"
                ),
                _ => warn!(
                    attempt,
                    max = self.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying classifier after transient error"
                ),
            }

            if !self.backoff(delay) {
                debug!(attempt, "Retry abandoned on shutdown");
                return Err(err);
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
