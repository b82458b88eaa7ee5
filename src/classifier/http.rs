//! HTTP client for a remote image-classification service.
//!
//! Images are POSTed as raw bytes. The service answers with JSON in one of
//! these shapes:
//!
//! ```text
//! {"HeadAway": 0.82, "Phone": 0.10}
//! {"labels": {"HeadAway": 0.82}}
//! {"labels": [{"label": "HeadAway", "confidence": 0.82}]}
//! [{"label": "HeadAway", "confidence": 0.82}]
//! ```

use crate::classifier::{Classification, Classifier, ClassifierError};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Classifier endpoint configuration.
#[derive(Debug, Clone)]
pub struct HttpClassifierConfig {
    /// Full URL images are POSTed to
    pub endpoint: String,
    /// Bearer authentication token
    pub token: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl HttpClassifierConfig {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            token,
            timeout,
        }
    }
}

/// Async classifier client.
pub struct AsyncHttpClassifier {
    config: HttpClassifierConfig,
    client: reqwest::Client,
    device_id: String,
}

impl AsyncHttpClassifier {
    pub fn new(config: HttpClassifierConfig) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClassifierError::Transient(format!("Failed to create HTTP client: {e}")))?;

        // Generate device ID from hostname + instance
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let device_id = format!(
            "focus-{}-{}",
            hostname,
            &uuid::Uuid::new_v4().to_string()[..8]
        );

        Ok(Self {
            config,
            client,
            device_id,
        })
    }

    pub async fn classify(&self, image: &[u8]) -> Result<Classification, ClassifierError> {
        let started = Instant::now();

        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("Content-Type", "application/octet-stream")
            .header("X-Device-Id", &self.device_id)
            .body(image.to_vec());
        if let Some(token) = &self.config.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ClassifierError::Timeout(self.config.timeout)
            } else {
                ClassifierError::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unspecified")
                .to_string();
            return Err(ClassifierError::RateLimited(format!(
                "HTTP 429, retry after {retry_after}"
            )));
        }
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClassifierError::Transient(format!(
                "HTTP {}: {}",
                status.as_u16(),
                message
            )));
        }

        let body: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ClassifierError::Timeout(self.config.timeout)
            } else {
                ClassifierError::Transient(format!("Invalid response body: {e}"))
            }
        })?;

        let labels = parse_labels(&body)?;
        Ok(Classification::new(labels, started.elapsed()))
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

/// Blocking classifier client for the worker threads.
pub struct HttpClassifier {
    inner: AsyncHttpClassifier,
    runtime: tokio::runtime::Runtime,
}

impl HttpClassifier {
    pub fn new(config: HttpClassifierConfig) -> Result<Self, ClassifierError> {
        // Several workers call block_on concurrently.
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("classifier-http")
            .enable_all()
            .build()
            .map_err(|e| ClassifierError::Transient(format!("Failed to create runtime: {e}")))?;

        Ok(Self {
            inner: AsyncHttpClassifier::new(config)?,
            runtime,
        })
    }

    pub fn device_id(&self) -> &str {
        self.inner.device_id()
    }
}

impl Classifier for HttpClassifier {
    fn classify(&self, image: &[u8]) -> Result<Classification, ClassifierError> {
        self.runtime.block_on(self.inner.classify(image))
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Extract a label → confidence map from any supported response shape.
pub fn parse_labels(body: &Value) -> Result<HashMap<String, f64>, ClassifierError> {
    let payload = body.get("labels").unwrap_or(body);

    let mut labels = HashMap::new();
    match payload {
        Value::Object(map) => {
            for (label, score) in map {
                if let Some(score) = score.as_f64() {
                    labels.insert(label.clone(), score);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                let label = item.get("label").and_then(Value::as_str);
                let score = item
                    .get("confidence")
                    .or_else(|| item.get("score"))
                    .and_then(Value::as_f64);
                if let (Some(label), Some(score)) = (label, score) {
                    labels.insert(label.to_string(), score);
                }
            }
        }
        _ => {
            return Err(ClassifierError::Transient(
                "Response is neither an object nor an array".to_string(),
            ))
        }
    }

    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_flat_object() {
        let labels = parse_labels(&json!({"HeadAway": 0.82, "Phone": 0.1})).unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["HeadAway"], 0.82);
    }

    #[test]
    fn test_parse_nested_array() {
        let body = json!({"labels": [
            {"label": "HeadAway", "confidence": 0.82},
            {"label": "Phone", "score": 0.4},
            {"label": "Broken"}
        ]});
        let labels = parse_labels(&body).unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["Phone"], 0.4);
    }

    #[test]
    fn test_parse_rejects_scalar() {
        assert!(matches!(
            parse_labels(&json!("nope")),
            Err(ClassifierError::Transient(_))
        ));
    }

    #[test]
    fn test_unreachable_endpoint_is_transient() {
        let config = HttpClassifierConfig::new(
            "http://127.0.0.1:9/classify",
            None,
            Duration::from_millis(500),
        );
        let classifier = HttpClassifier::new(config).unwrap();
        assert!(classifier.device_id().starts_with("focus-"));
        let err = classifier.classify(&[1, 2, 3]).unwrap_err();
        assert!(err.is_retryable());
    }
}
