//! Sample types produced by the scheduler.
//!
//! Image bytes are held in memory only until the upload workers have
//! classified them; nothing here is serialized with its payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Which sensor produced a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    Camera,
    Screen,
}

impl std::fmt::Display for SampleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleKind::Camera => write!(f, "camera"),
            SampleKind::Screen => write!(f, "screen"),
        }
    }
}

/// A single captured image.
#[derive(Debug, Clone, Serialize)]
pub struct Sample {
    pub id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub kind: SampleKind,
    /// Encoded image bytes, shared so retries never copy them
    #[serde(skip)]
    pub image: Arc<Vec<u8>>,
}

impl Sample {
    pub fn new(kind: SampleKind, captured_at: DateTime<Utc>, image: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            captured_at,
            kind,
            image: Arc::new(image),
        }
    }

    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }
}

/// The unit of work for one capture tick.
#[derive(Debug, Clone)]
pub struct SamplePair {
    pub camera: Sample,
    /// `None` when screen capture is disabled or failed this tick
    pub screen: Option<Sample>,
    pub timestamp: DateTime<Utc>,
}

impl SamplePair {
    pub fn id(&self) -> Uuid {
        self.camera.id
    }
}

/// A device the scheduler captures images from.
pub trait ImageCapture: Send {
    /// Capture one encoded image.
    fn capture(&mut self) -> Result<Vec<u8>, CaptureError>;

    /// Release the underlying device. Called once when the scheduler stops.
    fn release(&mut self) {}

    /// Short name used in logs.
    fn name(&self) -> &str {
        "capture"
    }
}

/// Errors that can occur while capturing.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture device unavailable: {0}")]
    Unavailable(String),
    #[error("Capture produced an empty image")]
    Empty,
    #[error("Capture IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Capture command failed: {0}")]
    Command(String),
}
