//! Configuration for the Focus Sentinel agent.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Shortest capture interval the scheduler will accept.
pub const MIN_CAPTURE_INTERVAL: Duration = Duration::from_secs(1);

/// Longest capture interval the scheduler will accept.
pub const MAX_CAPTURE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound on every minute-valued span and window (one week).
pub const MAX_SPAN_MINUTES: i64 = 7 * 24 * 60;

/// Main configuration for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capture scheduling
    pub scheduler: SchedulerConfig,

    /// Upload worker pool
    pub workers: WorkerConfig,

    /// Circuit breaker around the classifier
    pub breaker: BreakerConfig,

    /// Hysteresis voting
    pub voting: VotingConfig,

    /// Distraction rules
    pub rules: RuleConfig,

    /// Remote classifier endpoint
    pub classifier: ClassifierConfig,

    /// Path for exporting event records
    pub export_path: PathBuf,

    /// Path for storing state and transparency logs
    pub data_path: PathBuf,

    /// Whether capturing is currently paused
    pub paused: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("focus-sentinel");

        Self {
            scheduler: SchedulerConfig::default(),
            workers: WorkerConfig::default(),
            breaker: BreakerConfig::default(),
            voting: VotingConfig::default(),
            rules: RuleConfig::default(),
            classifier: ClassifierConfig::default(),
            export_path: data_dir.join("exports"),
            data_path: data_dir,
            paused: false,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("focus-sentinel")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.export_path)?;
        std::fs::create_dir_all(&self.data_path)?;
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.voting.window_size == 0 {
            return Err(ConfigError::Invalid("voting.window_size must be at least 1".into()));
        }
        if self.scheduler.interval > MAX_CAPTURE_INTERVAL {
            return Err(ConfigError::Invalid(format!(
                "scheduler.interval must be at most {}s",
                MAX_CAPTURE_INTERVAL.as_secs()
            )));
        }
        check_span_minutes("voting.min_span_minutes", self.voting.min_span_minutes)?;
        if self.workers.pool_size == 0 {
            return Err(ConfigError::Invalid("workers.pool_size must be at least 1".into()));
        }
        if self.workers.max_retries == 0 {
            return Err(ConfigError::Invalid("workers.max_retries must be at least 1".into()));
        }
        if self.scheduler.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.queue_capacity must be at least 1".into(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }
        check_span_minutes(
            "rules.alert_threshold_minutes",
            self.rules.alert_threshold_minutes,
        )?;
        if !(1..=MAX_SPAN_MINUTES).contains(&self.rules.overload_window_minutes) {
            return Err(ConfigError::Invalid(format!(
                "rules.overload_window_minutes must be between 1 and {MAX_SPAN_MINUTES}"
            )));
        }
        Ok(())
    }
}

/// Minutes to a span, clamped to `0..=MAX_SPAN_MINUTES`. NaN maps to zero.
fn span_from_minutes(minutes: f64) -> chrono::Duration {
    let minutes = if minutes.is_nan() {
        0.0
    } else {
        minutes.clamp(0.0, MAX_SPAN_MINUTES as f64)
    };
    chrono::Duration::milliseconds((minutes * 60_000.0).round() as i64)
}

/// Spans must be finite, non-negative and no longer than [`MAX_SPAN_MINUTES`].
fn check_span_minutes(name: &str, minutes: f64) -> Result<(), ConfigError> {
    if !(0.0..=MAX_SPAN_MINUTES as f64).contains(&minutes) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be between 0 and {MAX_SPAN_MINUTES} minutes"
        )));
    }
    Ok(())
}

/// Capture scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Time between capture ticks
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    /// Whether a screen capture accompanies each camera capture
    pub screen_capture: bool,
    /// Capacity of the upload queue
    pub queue_capacity: usize,
    /// How long a producer waits on a full queue before dropping the oldest item
    pub enqueue_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            screen_capture: true,
            queue_capacity: 16,
            enqueue_timeout_ms: 500,
        }
    }
}

impl SchedulerConfig {
    /// Interval clamped to the accepted range.
    pub fn effective_interval(&self) -> Duration {
        self.interval.clamp(MIN_CAPTURE_INTERVAL, MAX_CAPTURE_INTERVAL)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }
}

/// Upload worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub pool_size: usize,
    /// Total classifier attempts per image before the sample is dropped
    pub max_retries: u32,
    /// Backoff before attempt `n + 1` is `backoff_base^n` seconds
    pub backoff_base: f64,
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 3,
            max_retries: 3,
            backoff_base: 2.0,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Circuit breaker around the classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "duration_serde")]
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Hysteresis voting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VotingConfig {
    /// Number of fused samples that must agree (K)
    pub window_size: usize,
    /// Minimum time the K samples must cover, in minutes
    pub min_span_minutes: f64,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            window_size: 3,
            min_span_minutes: 1.0,
        }
    }
}

impl VotingConfig {
    pub fn min_span(&self) -> chrono::Duration {
        span_from_minutes(self.min_span_minutes)
    }
}

/// Distraction rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Minimum episode length that becomes a confirmed event, in minutes
    pub alert_threshold_minutes: f64,
    /// Rolling window for the overload heuristic, in minutes
    pub overload_window_minutes: i64,
    /// Confirmed alerts within the window that trigger a micro-break suggestion
    pub overload_alert_count: usize,
    /// Upper bound on remembered alert timestamps
    pub max_recent_alerts: usize,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            alert_threshold_minutes: 0.5,
            overload_window_minutes: 20,
            overload_alert_count: 3,
            max_recent_alerts: 50,
        }
    }
}

impl RuleConfig {
    pub fn alert_threshold(&self) -> chrono::Duration {
        span_from_minutes(self.alert_threshold_minutes)
    }

    /// Overload window, clamped so that an unvalidated config cannot overflow.
    pub fn overload_window(&self) -> chrono::Duration {
        let minutes = self.overload_window_minutes.clamp(1, MAX_SPAN_MINUTES);
        chrono::Duration::try_minutes(minutes).unwrap_or_else(|| chrono::Duration::minutes(20))
    }
}

/// Remote classifier endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// URL images are POSTed to
    pub endpoint: Option<String>,
    /// Bearer token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.scheduler.interval, Duration::from_secs(60));
        assert_eq!(config.workers.pool_size, 3);
        assert_eq!(config.workers.max_retries, 3);
        assert_eq!(config.voting.window_size, 3);
        assert_eq!(config.voting.min_span(), chrono::Duration::seconds(60));
        assert_eq!(config.rules.alert_threshold(), chrono::Duration::seconds(30));
        assert!(!config.paused);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_minimum_interval_enforced() {
        let scheduler = SchedulerConfig {
            interval: Duration::from_millis(10),
            ..SchedulerConfig::default()
        };
        assert_eq!(scheduler.effective_interval(), MIN_CAPTURE_INTERVAL);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"voting": {"window_size": 5}, "paused": true}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.voting.window_size, 5);
        assert_eq!(config.voting.min_span_minutes, 1.0);
        assert_eq!(config.workers.pool_size, 3);
        assert!(config.paused);
    }

    #[test]
    fn test_validate_rejects_empty_window() {
        let mut config = Config::default();
        config.voting.window_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_overload_window() {
        for minutes in [0, -20, i64::MAX / 1000, MAX_SPAN_MINUTES + 1] {
            let mut config = Config::default();
            config.rules.overload_window_minutes = minutes;
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "overload window of {minutes} minutes was accepted"
            );
        }

        let mut config = Config::default();
        config.rules.overload_window_minutes = MAX_SPAN_MINUTES;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overload_window_never_overflows() {
        let rules = RuleConfig {
            overload_window_minutes: i64::MAX / 1000,
            ..RuleConfig::default()
        };
        assert_eq!(rules.overload_window(), chrono::Duration::minutes(MAX_SPAN_MINUTES));

        let rules = RuleConfig {
            overload_window_minutes: -20,
            ..RuleConfig::default()
        };
        assert_eq!(rules.overload_window(), chrono::Duration::minutes(1));
    }

    #[test]
    fn test_validate_rejects_out_of_range_spans() {
        for minutes in [-1.0, f64::NAN, f64::INFINITY, 1e300] {
            let mut config = Config::default();
            config.voting.min_span_minutes = minutes;
            assert!(config.validate().is_err(), "min span {minutes} accepted");

            let mut config = Config::default();
            config.rules.alert_threshold_minutes = minutes;
            assert!(config.validate().is_err(), "alert threshold {minutes} accepted");
        }

        let voting = VotingConfig {
            min_span_minutes: f64::NEG_INFINITY,
            ..VotingConfig::default()
        };
        assert_eq!(voting.min_span(), chrono::Duration::zero());

        let rules = RuleConfig {
            alert_threshold_minutes: 1e300,
            ..RuleConfig::default()
        };
        assert_eq!(rules.alert_threshold(), chrono::Duration::minutes(MAX_SPAN_MINUTES));
    }

    #[test]
    fn test_huge_interval_rejected_and_clamped() {
        let mut config = Config::default();
        config.scheduler.interval = Duration::from_secs(u64::MAX / 2);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert_eq!(config.scheduler.effective_interval(), MAX_CAPTURE_INTERVAL);
    }
}
