//! Core decision logic for the Focus Sentinel agent.
//!
//! This module contains:
//! - Hysteresis voting that turns noisy per-sample classifications into
//!   validated state transitions
//! - The rule engine that turns transitions into distraction episodes,
//!   heads-up alerts, confirmed events and overload suggestions
//!
//! Nothing here spawns threads or touches I/O; the pipeline stages own one
//! instance each.

pub mod rules;
pub mod voting;

// Re-export commonly used types
pub use rules::{
    DistractionEpisode, DistractionEvent, DistractionRuleEngine, DistractionType,
    OverloadSuggestion, RecentAlertsWindow, RuleOutput,
};
pub use voting::{
    majority_for, Evidence, FocusState, FusedSample, LabelVotes, StateTransition, VotingBuffer,
    VotingStateMachine, AMBIGUOUS_CONFIDENCE,
};
