//! Hysteresis voting over fused classification samples.
//!
//! The state machine keeps the last K fused samples. A decision is only made
//! once the buffer is full and the samples cover at least `min_span` of
//! capture time, so a burst of agreeing samples cannot flip the state on its
//! own. Candidates are picked by fixed precedence: absence, then distraction,
//! then focus. A transition is emitted only when the candidate differs from
//! the current state.

use crate::capture::SampleKind;
use crate::classifier::ClassificationResult;
use crate::config::VotingConfig;
use crate::taxonomy::{LabelCategory, LabelTaxonomy};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info};
use uuid::Uuid;

/// Confidence reported when no category reaches a majority.
pub const AMBIGUOUS_CONFIDENCE: f64 = 0.3;

const DISTRACTION_CAMERA_WEIGHT: f64 = 0.7;
const DISTRACTION_SCREEN_WEIGHT: f64 = 0.3;
const FOCUS_CAMERA_WEIGHT: f64 = 0.6;
const FOCUS_SCREEN_WEIGHT: f64 = 0.4;

/// The user's attention state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusState {
    #[default]
    Focused,
    Distracted,
    Absent,
}

impl FocusState {
    /// Distracted and absent both count as "not focused".
    pub fn is_off_task(&self) -> bool {
        !matches!(self, FocusState::Focused)
    }
}

impl std::fmt::Display for FocusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FocusState::Focused => write!(f, "focused"),
            FocusState::Distracted => write!(f, "distracted"),
            FocusState::Absent => write!(f, "absent"),
        }
    }
}

/// Camera and screen classifications for one capture tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedSample {
    pub sample_id: Uuid,
    /// Capture time of the tick, not arrival time
    pub timestamp: DateTime<Utc>,
    pub camera: ClassificationResult,
    /// `None` means no screen evidence this tick
    pub screen: Option<ClassificationResult>,
}

impl FusedSample {
    fn channel(&self, kind: SampleKind) -> Option<&ClassificationResult> {
        match kind {
            SampleKind::Camera => Some(&self.camera),
            SampleKind::Screen => self.screen.as_ref(),
        }
    }
}

/// Bounded FIFO of the most recent fused samples.
#[derive(Debug, Clone)]
pub struct VotingBuffer {
    capacity: usize,
    samples: VecDeque<FusedSample>,
}

impl VotingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Push a sample, evicting and returning the oldest one when full.
    pub fn push(&mut self, sample: FusedSample) -> Option<FusedSample> {
        let evicted = if self.samples.len() >= self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        evicted
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Capture-time distance between the earliest and latest sample.
    ///
    /// Samples arrive in completion order, so this looks at every timestamp
    /// rather than the front and back of the queue.
    pub fn span(&self) -> Option<Duration> {
        let earliest = self.samples.iter().map(|s| s.timestamp).min()?;
        let latest = self.samples.iter().map(|s| s.timestamp).max()?;
        Some(latest - earliest)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FusedSample> {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Vote tally for one label on one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelVotes {
    pub category: LabelCategory,
    pub count: usize,
    pub confidence_sum: f64,
}

impl LabelVotes {
    pub fn mean_confidence(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.confidence_sum / self.count as f64
        }
    }
}

/// Everything a decision was based on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub camera_votes: BTreeMap<String, LabelVotes>,
    pub screen_votes: BTreeMap<String, LabelVotes>,
    /// Votes a label needs to count as a majority
    pub majority: usize,
    pub sample_count: usize,
    pub span_secs: f64,
    pub reason: String,
}

impl Evidence {
    pub fn votes(&self, kind: SampleKind) -> &BTreeMap<String, LabelVotes> {
        match kind {
            SampleKind::Camera => &self.camera_votes,
            SampleKind::Screen => &self.screen_votes,
        }
    }

    /// Labels on `kind` that reached the majority, strongest first.
    pub fn majority_labels(&self, kind: SampleKind) -> Vec<(&str, &LabelVotes)> {
        let mut labels: Vec<(&str, &LabelVotes)> = self
            .votes(kind)
            .iter()
            .filter(|(_, v)| v.count >= self.majority)
            .map(|(l, v)| (l.as_str(), v))
            .collect();
        labels.sort_by(|a, b| {
            b.1.count
                .cmp(&a.1.count)
                .then(b.1.confidence_sum.total_cmp(&a.1.confidence_sum))
        });
        labels
    }

    /// Strongest majority label of `category` on `kind`.
    pub fn leader(&self, kind: SampleKind, category: LabelCategory) -> Option<(&str, &LabelVotes)> {
        self.majority_labels(kind)
            .into_iter()
            .find(|(_, v)| v.category == category)
    }

    /// Mean confidence of the leading `category` label on `kind`, or 0.
    fn strength(&self, kind: SampleKind, category: LabelCategory) -> f64 {
        self.leader(kind, category)
            .map(|(_, v)| v.mean_confidence())
            .unwrap_or(0.0)
    }
}

/// A validated change of attention state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: FocusState,
    pub to: FocusState,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
    pub evidence: Evidence,
}

/// Votes needed out of `window_size`: half rounded up, at least two, never
/// more than the window.
pub fn majority_for(window_size: usize) -> usize {
    ((window_size + 1) / 2).max(2).min(window_size.max(1))
}

/// K-of-N hysteresis state machine.
pub struct VotingStateMachine {
    taxonomy: LabelTaxonomy,
    min_span: Duration,
    majority: usize,
    buffer: VotingBuffer,
    current_state: FocusState,
    entered_at: DateTime<Utc>,
    confidence: f64,
}

impl VotingStateMachine {
    pub fn new(config: &VotingConfig, taxonomy: LabelTaxonomy) -> Self {
        Self {
            taxonomy,
            min_span: config.min_span(),
            majority: majority_for(config.window_size),
            buffer: VotingBuffer::new(config.window_size),
            current_state: FocusState::Focused,
            entered_at: Utc::now(),
            confidence: 0.0,
        }
    }

    /// Start a new session: back to `Focused` with an empty buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.current_state = FocusState::Focused;
        self.entered_at = Utc::now();
        self.confidence = 0.0;
    }

    pub fn current_state(&self) -> FocusState {
        self.current_state
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn buffer(&self) -> &VotingBuffer {
        &self.buffer
    }

    /// Process a fused sample, deciding at the current wall-clock time.
    pub fn process(&mut self, sample: FusedSample) -> Option<StateTransition> {
        self.process_at(sample, Utc::now())
    }

    /// Process a fused sample, deciding at `now`.
    pub fn process_at(
        &mut self,
        sample: FusedSample,
        now: DateTime<Utc>,
    ) -> Option<StateTransition> {
        if let Some(evicted) = self.buffer.push(sample) {
            debug!(sample_id = %evicted.sample_id, "Evicted oldest sample from voting buffer");
        }
        self.evaluate(now)
    }

    /// Evaluate the buffer as it stands.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> Option<StateTransition> {
        if !self.buffer.is_full() {
            debug!(
                len = self.buffer.len(),
                needed = self.buffer.capacity(),
                "Voting buffer not full, no decision"
            );
            return None;
        }

        let span = self.buffer.span().unwrap_or_else(Duration::zero);
        if span < self.min_span {
            debug!(
                span_secs = span.num_milliseconds() as f64 / 1000.0,
                min_span_secs = self.min_span.num_milliseconds() as f64 / 1000.0,
                "Voting window span too short, no decision"
            );
            return None;
        }

        let mut evidence = self.tally(span);
        let (candidate, confidence, reason) = self.decide(&evidence);
        evidence.reason = reason;

        if candidate == self.current_state {
            self.confidence = confidence;
            return None;
        }

        let transition = StateTransition {
            from: self.current_state,
            to: candidate,
            timestamp: now,
            confidence,
            evidence,
        };

        info!(
            from = %transition.from,
            to = %transition.to,
            confidence = transition.confidence,
            reason = %transition.evidence.reason,
            "State transition"
        );

        self.current_state = candidate;
        self.entered_at = now;
        self.confidence = confidence;
        Some(transition)
    }

    /// Count votes and confidence per label, per channel.
    fn tally(&self, span: Duration) -> Evidence {
        let mut camera_votes = BTreeMap::new();
        let mut screen_votes = BTreeMap::new();

        for sample in self.buffer.iter() {
            for (kind, votes) in [
                (SampleKind::Camera, &mut camera_votes),
                (SampleKind::Screen, &mut screen_votes),
            ] {
                let Some(result) = sample.channel(kind) else {
                    continue;
                };
                for (label, &confidence) in &result.labels {
                    let Some(rule) = self.taxonomy.voting_rule(label, confidence) else {
                        continue;
                    };
                    let entry = votes.entry(label.clone()).or_insert(LabelVotes {
                        category: rule.category,
                        count: 0,
                        confidence_sum: 0.0,
                    });
                    entry.count += 1;
                    entry.confidence_sum += confidence;
                }
            }
        }

        Evidence {
            camera_votes,
            screen_votes,
            majority: self.majority,
            sample_count: self.buffer.len(),
            span_secs: span.num_milliseconds() as f64 / 1000.0,
            reason: String::new(),
        }
    }

    fn decide(&self, evidence: &Evidence) -> (FocusState, f64, String) {
        use LabelCategory::*;
        use SampleKind::*;

        let absence = evidence
            .leader(Camera, Absence)
            .or_else(|| evidence.leader(Screen, Absence));
        if let Some((label, votes)) = absence {
            return (
                FocusState::Absent,
                votes.mean_confidence(),
                format!("absence majority: {label} {}/{}", votes.count, evidence.sample_count),
            );
        }

        let camera = evidence.leader(Camera, Distraction);
        let screen = evidence.leader(Screen, Distraction);
        if camera.is_some() || screen.is_some() {
            let confidence = DISTRACTION_CAMERA_WEIGHT * evidence.strength(Camera, Distraction)
                + DISTRACTION_SCREEN_WEIGHT * evidence.strength(Screen, Distraction);
            return (
                FocusState::Distracted,
                confidence,
                format!(
                    "distraction majority: camera={} screen={}",
                    describe(camera, evidence.sample_count),
                    describe(screen, evidence.sample_count)
                ),
            );
        }

        let camera = evidence.leader(Camera, Focus);
        let screen = evidence.leader(Screen, Focus);
        if camera.is_some() || screen.is_some() {
            let confidence = FOCUS_CAMERA_WEIGHT * evidence.strength(Camera, Focus)
                + FOCUS_SCREEN_WEIGHT * evidence.strength(Screen, Focus);
            return (
                FocusState::Focused,
                confidence,
                format!(
                    "focus majority: camera={} screen={}",
                    describe(camera, evidence.sample_count),
                    describe(screen, evidence.sample_count)
                ),
            );
        }

        (
            self.current_state,
            AMBIGUOUS_CONFIDENCE,
            "no majority (ambiguous)".to_string(),
        )
    }
}

fn describe(leader: Option<(&str, &LabelVotes)>, samples: usize) -> String {
    match leader {
        Some((label, votes)) => format!("{label} {}/{samples}", votes.count),
        None => "none".to_string(),
    }
}
