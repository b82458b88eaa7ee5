//! Transparency module for the Focus Sentinel agent.
//!
//! This module provides tools for tracking and exposing what the agent
//! does with captured images, supporting user trust.

pub mod log;

// Re-export commonly used types
pub use log::{
    create_shared_log, create_shared_log_with_persistence, PersistedStats, SharedTransparencyLog,
    TransparencyLog, TransparencyStats,
};
