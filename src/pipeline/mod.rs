//! Threaded capture → classify → vote → rules pipeline.
//!
//! ```text
//! Scheduler ─▶ upload queue ─▶ WorkerPool ─▶ fusion queue ─▶ fusion stage
//!                                                               │
//!                       sinks ◀── rule stage ◀── event queue ◀──┘
//! ```
//!
//! Every stage runs on its own thread and talks to its neighbours only
//! through bounded [`DropOldestQueue`]s. Stop propagates upstream first.

pub mod queue;
pub mod scheduler;
pub mod stages;
pub mod workers;

pub use queue::DropOldestQueue;
pub use scheduler::Scheduler;
pub use stages::RuleDispatcher;
pub use workers::{WorkerContext, WorkerPool};

use crate::capture::{CaptureError, ImageCapture, SamplePair};
use crate::classifier::{
    CircuitBreaker, CircuitBreakingClassifier, CircuitState, Classifier, RetryPolicy,
    RetryingClassifier,
};
use crate::config::{Config, ConfigError};
use crate::core::{DistractionRuleEngine, FusedSample, StateTransition, VotingStateMachine};
use crate::sinks::{EventSink, NotificationSink};
use crate::taxonomy::LabelTaxonomy;
use crate::transparency::SharedTransparencyLog;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// How often blocked stages check their stop flag.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Join budget for every stage except the workers, which also get the
/// classifier request timeout.
pub const STAGE_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can occur while starting or stopping the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Camera unavailable at session start: {0}")]
    CameraUnavailable(#[source] CaptureError),
    #[error("Pipeline is already running")]
    AlreadyRunning,
    #[error("Pipeline is not running")]
    NotRunning,
    #[error("Failed to spawn pipeline thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Wait up to `timeout` for `handle` to finish. A thread still running at the
/// deadline is detached.
pub(crate) fn join_with_timeout<T>(
    handle: JoinHandle<T>,
    timeout: Duration,
    stage: &str,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(
                stage,
                timeout_ms = timeout.as_millis() as u64,
                "Stage did not stop in time, detaching"
            );
            return None;
        }
        thread::sleep(Duration::from_millis(10));
    }
    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(stage, "Stage thread panicked");
            None
        }
    }
}

/// Threads of a running session, downstream of the scheduler.
struct RunningStages {
    workers: WorkerPool,
    fusion: JoinHandle<()>,
    fusion_running: Arc<AtomicBool>,
    rules: JoinHandle<()>,
    rules_running: Arc<AtomicBool>,
}

/// The whole focus-tracking pipeline for one session.
pub struct FocusPipeline {
    config: Config,
    taxonomy: Arc<LabelTaxonomy>,
    scheduler: Scheduler,
    upload: Arc<DropOldestQueue<SamplePair>>,
    fusion: Arc<DropOldestQueue<FusedSample>>,
    transitions: Arc<DropOldestQueue<StateTransition>>,
    classifier: Arc<dyn Classifier>,
    breaker: Arc<CircuitBreaker>,
    events: Arc<dyn EventSink>,
    notifier: Arc<dyn NotificationSink>,
    transparency: SharedTransparencyLog,
    /// Aborts retry backoff once stop begins
    shutdown: Arc<AtomicBool>,
    degraded: Arc<AtomicBool>,
    stages: Option<RunningStages>,
}

impl FocusPipeline {
    /// Assemble a pipeline around `classifier`.
    ///
    /// The classifier is wrapped as retry → circuit breaker → `classifier`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        taxonomy: LabelTaxonomy,
        camera: Box<dyn ImageCapture>,
        screen: Option<Box<dyn ImageCapture>>,
        classifier: Arc<dyn Classifier>,
        events: Arc<dyn EventSink>,
        notifier: Arc<dyn NotificationSink>,
        transparency: SharedTransparencyLog,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let put_timeout = config.scheduler.enqueue_timeout();
        let capacity = config.scheduler.queue_capacity;
        let upload = Arc::new(DropOldestQueue::new("upload", capacity, put_timeout));
        let fusion = Arc::new(DropOldestQueue::new("fusion", capacity, put_timeout));
        let transitions = Arc::new(DropOldestQueue::new("events", capacity, put_timeout));

        let shutdown = Arc::new(AtomicBool::new(false));
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker.failure_threshold,
            config.breaker.recovery_timeout,
        ));
        let classifier: Arc<dyn Classifier> = Arc::new(
            RetryingClassifier::new(
                CircuitBreakingClassifier::new(classifier, breaker.clone()),
                RetryPolicy::new(config.workers.max_retries, config.workers.backoff_base),
            )
            .with_stop_flag(shutdown.clone()),
        );

        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            camera,
            screen,
            upload.clone(),
            events.clone(),
            transparency.clone(),
        );

        if config.paused {
            scheduler.pause();
        }

        Ok(Self {
            config,
            taxonomy: Arc::new(taxonomy),
            scheduler,
            upload,
            fusion,
            transitions,
            classifier,
            breaker,
            events,
            notifier,
            transparency,
            shutdown,
            degraded: Arc::new(AtomicBool::new(false)),
            stages: None,
        })
    }

    /// Start every stage, downstream first, then capture.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The pipeline is already running
    /// - The camera cannot capture (nothing is left running)
    /// - A stage thread cannot be spawned
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.stages.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }

        self.shutdown.store(false, Ordering::SeqCst);
        self.upload.clear();
        self.fusion.clear();
        self.transitions.clear();

        let rules_running = Arc::new(AtomicBool::new(true));
        let rules = stages::spawn_rule_stage(
            DistractionRuleEngine::new(&self.config.rules),
            self.transitions.receiver(),
            RuleDispatcher {
                events: self.events.clone(),
                notifier: self.notifier.clone(),
                transparency: self.transparency.clone(),
            },
            rules_running.clone(),
        )?;

        let fusion_running = Arc::new(AtomicBool::new(true));
        let fusion = match stages::spawn_fusion_stage(
            VotingStateMachine::new(&self.config.voting, (*self.taxonomy).clone()),
            self.fusion.receiver(),
            self.transitions.clone(),
            self.events.clone(),
            self.transparency.clone(),
            fusion_running.clone(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                rules_running.store(false, Ordering::SeqCst);
                join_with_timeout(rules, STAGE_JOIN_TIMEOUT, "rules");
                return Err(PipelineError::Spawn(e));
            }
        };

        let ctx = Arc::new(WorkerContext {
            classifier: self.classifier.clone(),
            taxonomy: self.taxonomy.clone(),
            fusion: self.fusion.clone(),
            events: self.events.clone(),
            notifier: self.notifier.clone(),
            transparency: self.transparency.clone(),
            degraded: self.degraded.clone(),
        });
        let pool_size = self.config.workers.pool_size;
        let workers = match WorkerPool::start(pool_size, self.upload.receiver(), ctx) {
            Ok(pool) => pool,
            Err(e) => {
                fusion_running.store(false, Ordering::SeqCst);
                rules_running.store(false, Ordering::SeqCst);
                join_with_timeout(fusion, STAGE_JOIN_TIMEOUT, "fusion");
                join_with_timeout(rules, STAGE_JOIN_TIMEOUT, "rules");
                return Err(e);
            }
        };

        let stages = RunningStages {
            workers,
            fusion,
            fusion_running,
            rules,
            rules_running,
        };

        if let Err(e) = self.scheduler.start() {
            self.stop_stages(stages);
            return Err(e);
        }

        self.stages = Some(stages);
        info!(
            workers = self.config.workers.pool_size,
            window = self.config.voting.window_size,
            labels = self.taxonomy.len(),
            "Focus pipeline started"
        );
        Ok(())
    }

    /// Stop upstream first: scheduler, workers, fusion, then rules. An episode
    /// still open is closed at the stop time. Queued work is discarded.
    pub fn stop(&mut self) -> Result<(), PipelineError> {
        let stages = self.stages.take().ok_or(PipelineError::NotRunning)?;

        self.shutdown.store(true, Ordering::SeqCst);
        self.scheduler.stop(STAGE_JOIN_TIMEOUT);
        self.stop_stages(stages);

        let dropped = self.upload.clear() + self.fusion.clear() + self.transitions.clear();
        info!(discarded = dropped, "Focus pipeline stopped");
        Ok(())
    }

    fn stop_stages(&self, stages: RunningStages) {
        let RunningStages {
            mut workers,
            fusion,
            fusion_running,
            rules,
            rules_running,
        } = stages;

        workers.stop(self.config.workers.request_timeout + STAGE_JOIN_TIMEOUT);

        fusion_running.store(false, Ordering::SeqCst);
        join_with_timeout(fusion, STAGE_JOIN_TIMEOUT, "fusion");

        rules_running.store(false, Ordering::SeqCst);
        join_with_timeout(rules, STAGE_JOIN_TIMEOUT, "rules");
    }

    pub fn pause(&self) {
        self.scheduler.pause();
    }

    pub fn resume(&self) {
        self.scheduler.resume();
    }

    pub fn is_running(&self) -> bool {
        self.stages.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.scheduler.is_paused()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Whether the classifier is currently considered unreachable.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn transparency(&self) -> &SharedTransparencyLog {
        &self.transparency
    }

    pub fn taxonomy(&self) -> &LabelTaxonomy {
        &self.taxonomy
    }
}

impl Drop for FocusPipeline {
    fn drop(&mut self) {
        if self.stages.is_some() {
            let _ = self.stop();
        }
    }
}
