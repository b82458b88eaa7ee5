//! Fusion and rule-engine stage threads.
//!
//! Each stage owns its state machine outright; the only way in is its input
//! queue and the only way out is its output queue or a sink.

use crate::core::{
    DistractionRuleEngine, FusedSample, RuleOutput, StateTransition, VotingStateMachine,
};
use crate::pipeline::queue::DropOldestQueue;
use crate::pipeline::POLL_INTERVAL;
use crate::sinks::{
    EventSink, Notification, NotificationKind, NotificationSink, SinkRecord,
};
use crate::transparency::SharedTransparencyLog;
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Spawn the fusion stage: fused samples in, state transitions out.
pub fn spawn_fusion_stage(
    mut machine: VotingStateMachine,
    input: Receiver<FusedSample>,
    output: Arc<DropOldestQueue<StateTransition>>,
    events: Arc<dyn EventSink>,
    transparency: SharedTransparencyLog,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("focus-fusion".to_string())
        .spawn(move || {
            machine.reset();
            debug!("Fusion stage started");

            while running.load(Ordering::SeqCst) {
                let sample = match input.recv_timeout(POLL_INTERVAL) {
                    Ok(sample) => sample,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };

                let Some(transition) = machine.process(sample) else {
                    continue;
                };

                transparency.record_transition();
                events.record(SinkRecord::Transition(transition.clone()));

                if let Some(evicted) = output.push(transition) {
                    transparency.record_queue_drop();
                    debug!(from = %evicted.from, to = %evicted.to, "Dropped unconsumed transition");
                }
            }

            debug!(
                state = %machine.current_state(),
                since = %machine.entered_at(),
                "Fusion stage stopped"
            );
        })
}

/// Spawn the rule stage: transitions in, notifications and events out.
///
/// On exit an open episode is closed at the stop time.
pub fn spawn_rule_stage(
    mut engine: DistractionRuleEngine,
    input: Receiver<StateTransition>,
    dispatcher: RuleDispatcher,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("focus-rules".to_string())
        .spawn(move || {
            debug!("Rule stage started");

            while running.load(Ordering::SeqCst) {
                match input.recv_timeout(POLL_INTERVAL) {
                    Ok(transition) => {
                        for output in engine.handle(&transition) {
                            dispatcher.dispatch(output);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            for output in engine.finish(Utc::now()) {
                dispatcher.dispatch(output);
            }
            debug!("Rule stage stopped");
        })
}

/// Routes rule-engine decisions to the sinks.
pub struct RuleDispatcher {
    pub events: Arc<dyn EventSink>,
    pub notifier: Arc<dyn NotificationSink>,
    pub transparency: SharedTransparencyLog,
}

impl RuleDispatcher {
    pub fn dispatch(&self, output: RuleOutput) {
        match output {
            RuleOutput::HeadsUp {
                distraction_type,
                confidence,
                ..
            } => {
                self.transparency.record_heads_up();
                self.notifier.notify(Notification::new(
                    NotificationKind::HeadsUp,
                    "Heads up",
                    format!(
                        "Looks like {} ({:.0}% confidence)",
                        distraction_type,
                        confidence * 100.0
                    ),
                ));
            }
            RuleOutput::Confirmed(event) => {
                self.transparency.record_confirmed_event();
                let message = format!(
                    "{} for {}",
                    capitalize(&event.distraction_type.to_string()),
                    format_duration(event.duration_secs)
                );
                self.events.record(SinkRecord::Event(event));
                self.notifier.notify(Notification::new(
                    NotificationKind::Confirmed,
                    "Distraction detected",
                    message,
                ));
            }
            RuleOutput::Discarded {
                started_at,
                ended_at,
            } => {
                self.transparency.record_discarded_episode();
                debug!(%started_at, %ended_at, "Episode too short, discarded");
            }
            RuleOutput::Overload(suggestion) => {
                self.transparency.record_overload_suggestion();
                self.notifier.notify(Notification::new(
                    NotificationKind::Overload,
                    "Time for a micro-break",
                    format!(
                        "{} distractions in the last {} minutes. A short break may help.",
                        suggestion.alerts_in_window, suggestion.window_minutes
                    ),
                ));
            }
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn format_duration(secs: f64) -> String {
    let secs = secs.max(0.0).round() as u64;
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
