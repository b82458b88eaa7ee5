//! Classifier boundary: the external image-classification service.
//!
//! The pipeline never talks to a service directly. It holds a composed
//! [`Classifier`]:
//!
//! ```text
//! RetryingClassifier ──▶ CircuitBreakingClassifier ──▶ real Classifier
//! ```
//!
//! Retry sits outside the breaker so every attempt is counted by the breaker,
//! and an open circuit short-circuits the remaining attempts.

pub mod breaker;
#[cfg(feature = "http")]
pub mod http;
pub mod retry;

use crate::capture::SampleKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use breaker::{CircuitBreaker, CircuitBreakingClassifier, CircuitState};
#[cfg(feature = "http")]
pub use http::{HttpClassifier, HttpClassifierConfig};
pub use retry::{RetryPolicy, RetryingClassifier};

/// Raw output of one classifier call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Label → confidence in [0, 1]
    pub labels: HashMap<String, f64>,
    /// Wall time spent in the call
    #[serde(with = "latency_ms")]
    pub latency: Duration,
}

impl Classification {
    pub fn new(labels: HashMap<String, f64>, latency: Duration) -> Self {
        Self { labels, latency }
    }
}

/// A classification tied to the sample it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub sample_id: Uuid,
    pub kind: SampleKind,
    pub labels: HashMap<String, f64>,
    #[serde(with = "latency_ms")]
    pub latency: Duration,
}

impl ClassificationResult {
    pub fn new(sample_id: Uuid, kind: SampleKind, classification: Classification) -> Self {
        Self {
            sample_id,
            kind,
            labels: classification.labels,
            latency: classification.latency,
        }
    }
}

/// An image classifier.
///
/// Implementations must be safe to call from several worker threads at once.
pub trait Classifier: Send + Sync {
    fn classify(&self, image: &[u8]) -> Result<Classification, ClassifierError>;

    /// Short name used in logs.
    fn name(&self) -> &str {
        "classifier"
    }
}

impl<C: Classifier + ?Sized> Classifier for Arc<C> {
    fn classify(&self, image: &[u8]) -> Result<Classification, ClassifierError> {
        (**self).classify(image)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn classify(&self, image: &[u8]) -> Result<Classification, ClassifierError> {
        (**self).classify(image)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Classifier failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClassifierError {
    /// Network failure, server error, malformed response
    #[error("Classifier transient failure: {0}")]
    Transient(String),
    /// The service asked us to slow down
    #[error("Classifier rate limited: {0}")]
    RateLimited(String),
    #[error("Classifier call timed out after {0:?}")]
    Timeout(Duration),
    /// The circuit breaker rejected the call without invoking the service
    #[error("Classifier circuit open")]
    CircuitOpen,
}

impl ClassifierError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ClassifierError::CircuitOpen)
    }
}

mod latency_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted classifiers shared by unit tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a script of results, then repeats the fallback.
    pub struct ScriptedClassifier {
        script: Mutex<VecDeque<Result<Classification, ClassifierError>>>,
        fallback: Result<Classification, ClassifierError>,
        calls: AtomicUsize,
    }

    impl ScriptedClassifier {
        pub fn new(
            script: Vec<Result<Classification, ClassifierError>>,
            fallback: Result<Classification, ClassifierError>,
        ) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn always(result: Result<Classification, ClassifierError>) -> Self {
            Self::new(Vec::new(), result)
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Classifier for ScriptedClassifier {
        fn classify(&self, _image: &[u8]) -> Result<Classification, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        }
    }

    pub fn labels(pairs: &[(&str, f64)]) -> Classification {
        Classification::new(
            pairs.iter().map(|(l, c)| (l.to_string(), *c)).collect(),
            Duration::from_millis(5),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ClassifierError::Transient("boom".into()).is_retryable());
        assert!(ClassifierError::RateLimited("429".into()).is_retryable());
        assert!(ClassifierError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ClassifierError::CircuitOpen.is_retryable());
    }

    #[test]
    fn test_result_serializes_latency_as_millis() {
        let result = ClassificationResult::new(
            Uuid::new_v4(),
            SampleKind::Camera,
            testing::labels(&[("HeadAway", 0.8)]),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["latency"], 5);
        assert_eq!(json["kind"], "camera");
    }
}
