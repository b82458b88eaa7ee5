//! Image capture for the Focus Sentinel agent.
//!
//! Device access lives behind the [`ImageCapture`] trait, one instance per
//! modality. The scheduler owns the instances and is the only caller.

pub mod sources;
pub mod types;

pub use sources::{CommandCapture, FileCapture, NoopCapture};
pub use types::{CaptureError, ImageCapture, Sample, SampleKind, SamplePair};
