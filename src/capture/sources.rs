//! Concrete capture sources.

use crate::capture::types::{CaptureError, ImageCapture};
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

/// Re-reads an image file on every capture.
///
/// Useful when another process keeps the latest frame on disk.
pub struct FileCapture {
    path: PathBuf,
    name: String,
}

impl FileCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = format!("file:{}", path.display());
        Self { path, name }
    }
}

impl ImageCapture for FileCapture {
    fn capture(&mut self) -> Result<Vec<u8>, CaptureError> {
        if !self.path.exists() {
            return Err(CaptureError::Unavailable(format!(
                "{} does not exist",
                self.path.display()
            )));
        }
        let bytes = std::fs::read(&self.path)?;
        if bytes.is_empty() {
            return Err(CaptureError::Empty);
        }
        Ok(bytes)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Runs an external command and takes its stdout as the encoded image.
///
/// e.g. `ffmpeg -f avfoundation -i 0 -frames:v 1 -f image2pipe -` for a
/// camera, or `screencapture -x -t jpg /dev/stdout` for the screen.
pub struct CommandCapture {
    program: String,
    args: Vec<String>,
    name: String,
}

impl CommandCapture {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        let name = format!("cmd:{program}");
        Self {
            program,
            args,
            name,
        }
    }

    /// Split a shell-like command line on whitespace.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

impl ImageCapture for CommandCapture {
    fn capture(&mut self) -> Result<Vec<u8>, CaptureError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .map_err(|e| CaptureError::Unavailable(format!("{}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptureError::Command(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        if output.stdout.is_empty() {
            return Err(CaptureError::Empty);
        }

        debug!(program = %self.program, bytes = output.stdout.len(), "command capture");
        Ok(output.stdout)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A capture source that is never available.
///
/// Stands in for a modality that has no device on this machine.
#[derive(Debug, Default)]
pub struct NoopCapture;

impl ImageCapture for NoopCapture {
    fn capture(&mut self) -> Result<Vec<u8>, CaptureError> {
        Err(CaptureError::Unavailable("no capture device configured".into()))
    }

    fn name(&self) -> &str {
        "noop"
    }
}
