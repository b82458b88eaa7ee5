//! Privacy-preserving transparency log.
//!
//! This module tracks what the pipeline did with captured images without
//! storing any of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Declares one counter per pipeline event, with its recorder and a
/// matching field in [`TransparencyStats`].
///
/// A recorder written `record(n)` takes a count instead of adding one.
macro_rules! counters {
    (@recorder $field:ident $record:ident $doc:literal) => {
        #[doc = concat!("Record: ", $doc)]
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
    (@recorder $field:ident $record:ident $n:ident $doc:literal) => {
        #[doc = concat!("Record several: ", $doc)]
        pub fn $record(&self, $n: u64) {
            self.$field.fetch_add($n, Ordering::Relaxed);
        }
    };
    ($($field:ident => $record:ident $(($n:ident))?: $doc:literal),* $(,)?) => {
        /// Pipeline counters for the current session.
        #[derive(Debug)]
        pub struct TransparencyLog {
            $(#[doc = $doc] $field: AtomicU64,)*
            /// Session start time
            session_start: DateTime<Utc>,
            /// Path for persisting stats
            persist_path: Option<PathBuf>,
        }

        impl TransparencyLog {
            /// Create a new transparency log.
            pub fn new() -> Self {
                Self {
                    $($field: AtomicU64::new(0),)*
                    session_start: Utc::now(),
                    persist_path: None,
                }
            }

            $(counters!(@recorder $field $record $($n)? $doc);)*

            /// Get the current statistics.
            pub fn stats(&self) -> TransparencyStats {
                TransparencyStats {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                    session_start: self.session_start,
                    session_duration_secs: (Utc::now() - self.session_start)
                        .num_seconds()
                        .max(0) as u64,
                }
            }

            fn restore(&self, stats: &TransparencyStats) {
                $(self.$field.store(stats.$field, Ordering::Relaxed);)*
            }

            /// Reset all counters.
            pub fn reset(&self) {
                $(self.$field.store(0, Ordering::Relaxed);)*
            }
        }

        /// Snapshot of transparency statistics.
        #[derive(Debug, Clone, Default, Serialize, Deserialize)]
        #[serde(default)]
        pub struct TransparencyStats {
            $(pub $field: u64,)*
            pub session_start: DateTime<Utc>,
            pub session_duration_secs: u64,
        }
    };
}

counters! {
    ticks => record_tick: "Capture ticks fired",
    capture_failures => record_capture_failure: "Ticks skipped because the camera capture failed",
    screen_failures => record_screen_failure: "Screen captures that failed on a good tick",
    samples_enqueued => record_sample_enqueued: "Sample pairs handed to the upload queue",
    queue_drops => record_queue_drop: "Items evicted from a full queue",
    classifications_ok => record_classification_ok: "Images classified successfully",
    classification_failures => record_classification_failure: "Images failed after retries",
    rate_limited => record_rate_limited: "Samples dropped while the classifier was rate limiting",
    circuit_rejections => record_circuit_rejection: "Samples rejected by the open circuit breaker",
    invalid_labels => record_invalid_labels(count): "Labels dropped as outside the taxonomy",
    fused_samples => record_fused_sample: "Fused samples delivered to voting",
    transitions => record_transition: "State transitions emitted",
    heads_ups => record_heads_up: "Heads-up alerts sent",
    confirmed_events => record_confirmed_event: "Distraction events confirmed",
    discarded_episodes => record_discarded_episode: "Episodes too short to confirm",
    overload_suggestions => record_overload_suggestion: "Micro-break suggestions raised",
}

impl TransparencyLog {
    /// Create a transparency log with persistence.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            warn!("Could not load previous transparency stats: {e}");
        }

        log
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Session Statistics:\n\
             - Capture ticks: {} ({} skipped)\n\
             - Images classified: {} ({} failed, {} rate limited, {} rejected by breaker)\n\
             - Queue drops: {}\n\
             - Unknown labels filtered: {}\n\
             - State transitions: {}\n\
             - Heads-up alerts: {}\n\
             - Confirmed distractions: {} ({} too short)\n\
             - Micro-break suggestions: {}\n\
             - Session duration: {} seconds\n\
             \n\
             Privacy Guarantee:\n\
             - Images are held in memory only until classified\n\
             - No image is written to disk by this agent\n\
             - Only labels, confidences and timings are retained",
            stats.ticks,
            stats.capture_failures,
            stats.classifications_ok,
            stats.classification_failures,
            stats.rate_limited,
            stats.circuit_rejections,
            stats.queue_drops,
            stats.invalid_labels,
            stats.transitions,
            stats.heads_ups,
            stats.confirmed_events,
            stats.discarded_episodes,
            stats.overload_suggestions,
            stats.session_duration_secs
        )
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let persisted = PersistedStats {
                stats: self.stats(),
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    /// Load stats from disk.
    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;
                self.restore(&persisted.stats);
            }
        }
        Ok(())
    }
}

impl Default for TransparencyLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedStats {
    #[serde(flatten)]
    pub stats: TransparencyStats,
    pub last_updated: DateTime<Utc>,
}

/// Thread-safe shared transparency log.
pub type SharedTransparencyLog = Arc<TransparencyLog>;

/// Create a new shared transparency log.
pub fn create_shared_log() -> SharedTransparencyLog {
    Arc::new(TransparencyLog::new())
}

/// Create a new shared transparency log with persistence.
pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedTransparencyLog {
    Arc::new(TransparencyLog::with_persistence(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transparency_log_counting() {
        let log = TransparencyLog::new();

        log.record_tick();
        log.record_tick();
        log.record_capture_failure();
        log.record_invalid_labels(3);

        let stats = log.stats();
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.capture_failures, 1);
        assert_eq!(stats.invalid_labels, 3);
    }

    #[test]
    fn test_transparency_log_reset() {
        let log = TransparencyLog::new();

        log.record_transition();
        log.record_confirmed_event();
        log.reset();

        let stats = log.stats();
        assert_eq!(stats.transitions, 0);
        assert_eq!(stats.confirmed_events, 0);
    }

    #[test]
    fn test_summary_format() {
        let log = TransparencyLog::new();
        let summary = log.summary();

        assert!(summary.contains("Capture ticks"));
        assert!(summary.contains("Confirmed distractions"));
        assert!(summary.contains("Privacy Guarantee"));
        assert!(summary.contains("No image is written to disk"));
    }

    #[test]
    fn test_persistence_round_trip() {
        let path = std::env::temp_dir()
            .join("focus-sentinel-test")
            .join(format!("transparency-{}.json", uuid::Uuid::new_v4()));

        let log = TransparencyLog::with_persistence(path.clone());
        log.record_heads_up();
        log.record_heads_up();
        log.save().unwrap();

        let reloaded = TransparencyLog::with_persistence(path.clone());
        assert_eq!(reloaded.stats().heads_ups, 2);

        let _ = std::fs::remove_file(&path);
    }
}
