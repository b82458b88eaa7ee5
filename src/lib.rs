//! Focus Sentinel - attention tracking from camera and screen snapshots.
//!
//! This library samples a user-facing camera and the screen at a fixed
//! interval, has each image labelled by an external classification service,
//! and turns those noisy labels into a handful of trustworthy focus events.
//!
//! # Privacy Guarantees
//!
//! - **No image storage**: Images live in memory only until classified
//! - **Labels only**: Only label names, confidences and timings are kept
//! - **Local decisions**: Voting and distraction rules run on this machine
//! - **Transparency**: All pipeline activity is counted and auditable
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              Focus Sentinel                              │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐   ┌─────────────┐   │
//! │  │  Scheduler  │──▶│   Workers   │──▶│    Voting   │──▶│    Rules    │   │
//! │  │  (capture)  │   │  (classify) │   │   (K of N)  │   │  (episodes) │   │
//! │  └─────────────┘   └─────────────┘   └─────────────┘   └─────────────┘   │
//! │         │                 │                                   │          │
//! │         ▼                 ▼                                   ▼          │
//! │  ┌─────────────┐   ┌─────────────┐                     ┌─────────────┐   │
//! │  │ Transparency│   │ Retry/Break │                     │    Sinks    │   │
//! │  │     Log     │   │  Classifier │                     │ (events/UI) │   │
//! │  └─────────────┘   └─────────────┘                     └─────────────┘   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use focus_sentinel::{
//!     capture::FileCapture, classifier::HttpClassifier, classifier::HttpClassifierConfig,
//!     sinks::{LogNotifier, NullEventSink}, transparency, Config, FocusPipeline, LabelTaxonomy,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = Config::default();
//! let classifier = HttpClassifier::new(HttpClassifierConfig::new(
//!     "http://localhost:8080/classify",
//!     None,
//!     Duration::from_secs(10),
//! ))
//! .expect("Failed to create classifier");
//!
//! let mut pipeline = FocusPipeline::new(
//!     config,
//!     LabelTaxonomy::default(),
//!     Box::new(FileCapture::new("/tmp/camera.jpg")),
//!     None,
//!     Arc::new(classifier),
//!     Arc::new(NullEventSink),
//!     Arc::new(LogNotifier),
//!     transparency::create_shared_log(),
//! )
//! .expect("Invalid configuration");
//!
//! pipeline.start().expect("Camera unavailable");
//! ```

pub mod capture;
pub mod classifier;
pub mod config;
pub mod core;
pub mod pipeline;
pub mod sinks;
pub mod taxonomy;
pub mod transparency;

// Re-export key types at crate root for convenience
pub use capture::{CaptureError, ImageCapture, Sample, SampleKind, SamplePair};
pub use classifier::{Classification, ClassificationResult, Classifier, ClassifierError};
pub use config::{Config, ConfigError};
pub use core::{
    DistractionEvent, DistractionRuleEngine, DistractionType, FocusState, FusedSample,
    StateTransition, VotingStateMachine,
};
pub use pipeline::{FocusPipeline, PipelineError};
pub use sinks::{EventSink, Notification, NotificationKind, NotificationSink, SinkRecord};
pub use taxonomy::{LabelCategory, LabelRule, LabelTaxonomy};
pub use transparency::{SharedTransparencyLog, TransparencyLog, TransparencyStats};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Privacy declaration that can be displayed to users.
pub const PRIVACY_DECLARATION: &str = r#"
╔══════════════════════════════════════════════════════════════════╗
║              FOCUS SENTINEL - PRIVACY DECLARATION                ║
╠══════════════════════════════════════════════════════════════════╣
║                                                                  ║
║  This agent takes periodic camera and screen snapshots to        ║
║  notice when your attention drifts.                              ║
║                                                                  ║
║  ✓ WHAT WE KEEP:                                                 ║
║    • Labels the classifier assigns (e.g. "Phone", "Coding")      ║
║    • How confident it was and how long it took                   ║
║    • When distractions start and end                             ║
║                                                                  ║
║  ✗ WHAT WE NEVER KEEP:                                           ║
║    • The camera images themselves                                ║
║    • The screen images themselves                                ║
║    • Any text or content visible on your screen                  ║
║                                                                  ║
║  Each image is sent to the configured classifier and dropped     ║
║  from memory as soon as it has been labelled.                    ║
║                                                                  ║
║  You can view pipeline statistics anytime with:                  ║
║    focus-sentinel status                                         ║
║                                                                  ║
╚══════════════════════════════════════════════════════════════════╝
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privacy_declaration_contents() {
        assert!(PRIVACY_DECLARATION.contains("PRIVACY"));
        assert!(PRIVACY_DECLARATION.contains("NEVER KEEP"));
        assert!(PRIVACY_DECLARATION.contains("camera images"));
    }
}
