//! Distraction rule engine.
//!
//! Turns validated state transitions into distraction episodes:
//!
//! ```text
//! idle ──(into Distracted/Absent)──▶ open ──(into Focused)──▶ closed
//!                                     │
//!                                     └─ heads-up sent immediately
//! ```
//!
//! A closed episode becomes a confirmed [`DistractionEvent`] only if it lasted
//! at least the alert threshold; shorter ones are dropped. Confirmed alerts
//! feed a rolling window that suggests a micro-break when they pile up.

use crate::capture::SampleKind;
use crate::config::RuleConfig;
use crate::core::voting::{Evidence, FocusState, StateTransition};
use crate::taxonomy::LabelCategory;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};
use uuid::Uuid;

/// What kind of distraction an episode was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistractionType {
    Absent,
    Phone,
    MicroSleep,
    HeadAway,
    EyesOffScreen,
    /// Social media and games
    Social,
    Video,
    Shopping,
    Unknown,
}

impl DistractionType {
    /// Map a classifier label to a distraction type, if it names one.
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized: String = label
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect();

        match normalized.as_str() {
            "absent" | "noperson" | "noface" => Some(DistractionType::Absent),
            "phone" | "phoneusage" | "phoneuse" => Some(DistractionType::Phone),
            "microsleep" | "eyesclosed" | "drowsy" => Some(DistractionType::MicroSleep),
            "headaway" | "lookingaway" | "headturned" => Some(DistractionType::HeadAway),
            "eyesoffscreen" | "gazeaway" => Some(DistractionType::EyesOffScreen),
            // Games are folded into Social until the taxonomy grows a category for them.
            "socialmedia" | "social" | "games" | "gaming" => Some(DistractionType::Social),
            "video" | "streaming" | "youtube" => Some(DistractionType::Video),
            "shopping" => Some(DistractionType::Shopping),
            _ => None,
        }
    }

    /// Types that can only be seen on the screen channel.
    pub fn is_screen_type(&self) -> bool {
        matches!(
            self,
            DistractionType::Social | DistractionType::Video | DistractionType::Shopping
        )
    }

    /// Classify an episode from its evidence by fixed precedence:
    /// absence, phone, micro-sleep, head-away/eyes-off-screen (refined by
    /// what the screen showed), screen-only types, unknown.
    pub fn classify(evidence: &Evidence, state: FocusState) -> Self {
        let camera: Vec<DistractionType> = evidence
            .majority_labels(SampleKind::Camera)
            .into_iter()
            .filter_map(|(label, _)| DistractionType::from_label(label))
            .collect();
        let screen: Option<DistractionType> = evidence
            .majority_labels(SampleKind::Screen)
            .into_iter()
            .filter_map(|(label, _)| DistractionType::from_label(label))
            .find(DistractionType::is_screen_type);

        let absent_vote = [SampleKind::Camera, SampleKind::Screen].into_iter().any(|kind| {
            evidence
                .leader(kind, LabelCategory::Absence)
                .is_some()
        });
        if state == FocusState::Absent || absent_vote || camera.contains(&DistractionType::Absent) {
            return DistractionType::Absent;
        }

        for kind in [DistractionType::Phone, DistractionType::MicroSleep] {
            if camera.contains(&kind) {
                return kind;
            }
        }

        for kind in [DistractionType::HeadAway, DistractionType::EyesOffScreen] {
            if camera.contains(&kind) {
                return screen.unwrap_or(kind);
            }
        }

        screen.unwrap_or(DistractionType::Unknown)
    }
}

impl std::fmt::Display for DistractionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DistractionType::Absent => "away from desk",
            DistractionType::Phone => "phone use",
            DistractionType::MicroSleep => "micro-sleep",
            DistractionType::HeadAway => "head turned away",
            DistractionType::EyesOffScreen => "eyes off screen",
            DistractionType::Social => "social media",
            DistractionType::Video => "video",
            DistractionType::Shopping => "shopping",
            DistractionType::Unknown => "unknown distraction",
        };
        write!(f, "{name}")
    }
}

/// An episode that has started but not yet ended.
#[derive(Debug, Clone)]
pub struct DistractionEpisode {
    pub start_state: FocusState,
    /// Latest off-task state seen while the episode was open
    pub state: FocusState,
    pub started_at: DateTime<Utc>,
    pub confidence: f64,
    pub evidence: Evidence,
}

/// A confirmed distraction, handed to the event sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistractionEvent {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    #[serde(rename = "type")]
    pub distraction_type: DistractionType,
    pub confidence: f64,
    /// Camera votes behind the strongest off-task camera label
    pub vision_votes: usize,
}

/// Advisory raised when confirmed alerts pile up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverloadSuggestion {
    pub at: DateTime<Utc>,
    pub alerts_in_window: usize,
    pub window_minutes: i64,
}

/// What the engine decided for one transition.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutput {
    /// Sent when an episode opens; never persisted.
    HeadsUp {
        distraction_type: DistractionType,
        state: FocusState,
        at: DateTime<Utc>,
        confidence: f64,
    },
    Confirmed(DistractionEvent),
    /// Episode closed too soon to count.
    Discarded {
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    },
    Overload(OverloadSuggestion),
}

/// Time- and count-bounded window of confirmed alert timestamps.
#[derive(Debug, Clone)]
pub struct RecentAlertsWindow {
    window: Duration,
    max_len: usize,
    timestamps: VecDeque<DateTime<Utc>>,
}

impl RecentAlertsWindow {
    pub fn new(window: Duration, max_len: usize) -> Self {
        Self {
            window,
            max_len: max_len.max(1),
            timestamps: VecDeque::new(),
        }
    }

    /// Record an alert and drop everything that fell out of the window.
    pub fn push(&mut self, at: DateTime<Utc>) {
        self.timestamps.push_back(at);
        self.prune(at);
        while self.timestamps.len() > self.max_len {
            self.timestamps.pop_front();
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        if let Some(cutoff) = now.checked_sub_signed(self.window) {
            self.timestamps.retain(|&t| t >= cutoff);
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Episode tracker and alert policy.
pub struct DistractionRuleEngine {
    alert_threshold: Duration,
    overload_count: usize,
    overload_window_minutes: i64,
    recent_alerts: RecentAlertsWindow,
    episode: Option<DistractionEpisode>,
}

impl DistractionRuleEngine {
    pub fn new(config: &RuleConfig) -> Self {
        Self {
            alert_threshold: config.alert_threshold(),
            overload_count: config.overload_alert_count.max(1),
            overload_window_minutes: config.overload_window().num_minutes(),
            recent_alerts: RecentAlertsWindow::new(
                config.overload_window(),
                config.max_recent_alerts,
            ),
            episode: None,
        }
    }

    pub fn open_episode(&self) -> Option<&DistractionEpisode> {
        self.episode.as_ref()
    }

    pub fn recent_alert_count(&self) -> usize {
        self.recent_alerts.len()
    }

    /// Apply one transition.
    pub fn handle(&mut self, transition: &StateTransition) -> Vec<RuleOutput> {
        if transition.to.is_off_task() {
            self.on_distraction_start(transition)
        } else if transition.from.is_off_task() {
            self.close(transition.timestamp)
        } else {
            Vec::new()
        }
    }

    /// Close whatever is open at session end.
    pub fn finish(&mut self, at: DateTime<Utc>) -> Vec<RuleOutput> {
        self.close(at)
    }

    fn on_distraction_start(&mut self, transition: &StateTransition) -> Vec<RuleOutput> {
        if let Some(episode) = self.episode.as_mut() {
            // Continuation: the latest evidence replaces the old, start time stays.
            debug!(
                from = %transition.from,
                to = %transition.to,
                started_at = %episode.started_at,
                "Distraction episode continues"
            );
            episode.state = transition.to;
            episode.confidence = transition.confidence;
            episode.evidence = transition.evidence.clone();
            return Vec::new();
        }

        let distraction_type = DistractionType::classify(&transition.evidence, transition.to);
        info!(
            state = %transition.to,
            kind = %distraction_type,
            "Distraction episode opened"
        );

        self.episode = Some(DistractionEpisode {
            start_state: transition.to,
            state: transition.to,
            started_at: transition.timestamp,
            confidence: transition.confidence,
            evidence: transition.evidence.clone(),
        });

        vec![RuleOutput::HeadsUp {
            distraction_type,
            state: transition.to,
            at: transition.timestamp,
            confidence: transition.confidence,
        }]
    }

    fn close(&mut self, ended_at: DateTime<Utc>) -> Vec<RuleOutput> {
        let Some(episode) = self.episode.take() else {
            return Vec::new();
        };

        let duration = ended_at - episode.started_at;
        if duration < self.alert_threshold {
            debug!(
                duration_secs = duration.num_milliseconds() as f64 / 1000.0,
                "Distraction episode too short, discarded"
            );
            return vec![RuleOutput::Discarded {
                started_at: episode.started_at,
                ended_at,
            }];
        }

        let distraction_type = DistractionType::classify(&episode.evidence, episode.state);
        let vision_votes = episode
            .evidence
            .majority_labels(SampleKind::Camera)
            .into_iter()
            .find(|(_, v)| {
                matches!(v.category, LabelCategory::Distraction | LabelCategory::Absence)
            })
            .map(|(_, v)| v.count)
            .unwrap_or(0);

        let event = DistractionEvent {
            id: Uuid::new_v4(),
            started_at: episode.started_at,
            ended_at,
            duration_secs: duration.num_milliseconds() as f64 / 1000.0,
            distraction_type,
            confidence: episode.confidence,
            vision_votes,
        };
        info!(
            kind = %event.distraction_type,
            duration_secs = event.duration_secs,
            "Distraction confirmed"
        );

        let mut outputs = vec![RuleOutput::Confirmed(event)];

        self.recent_alerts.push(ended_at);
        if self.recent_alerts.len() >= self.overload_count {
            info!(
                alerts = self.recent_alerts.len(),
                window_minutes = self.overload_window_minutes,
                "Alert overload, suggesting a micro-break"
            );
            outputs.push(RuleOutput::Overload(OverloadSuggestion {
                at: ended_at,
                alerts_in_window: self.recent_alerts.len(),
                window_minutes: self.overload_window_minutes,
            }));
        }

        outputs
    }
}
