//! Upload worker pool.
//!
//! Each worker takes a sample pair off the upload queue, classifies the
//! camera image and, if present, the screen image, and forwards the fused
//! result. A worker never fails: a sample whose camera classification fails
//! is recorded and dropped, and the worker moves on to the next one.

use crate::capture::{Sample, SamplePair};
use crate::classifier::{Classification, ClassificationResult, Classifier, ClassifierError};
use crate::core::FusedSample;
use crate::pipeline::queue::DropOldestQueue;
use crate::pipeline::{join_with_timeout, PipelineError, POLL_INTERVAL};
use crate::sinks::{
    EventSink, Notification, NotificationKind, NotificationSink, SinkRecord, StatusUpdate,
};
use crate::taxonomy::LabelTaxonomy;
use crate::transparency::SharedTransparencyLog;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Everything a worker shares with its siblings.
pub struct WorkerContext {
    pub classifier: Arc<dyn Classifier>,
    pub taxonomy: Arc<LabelTaxonomy>,
    pub fusion: Arc<DropOldestQueue<FusedSample>>,
    pub events: Arc<dyn EventSink>,
    pub notifier: Arc<dyn NotificationSink>,
    pub transparency: SharedTransparencyLog,
    /// Set while the classifier is known to be unreachable
    pub degraded: Arc<AtomicBool>,
}

impl WorkerContext {
    /// Classify one pair and forward it to fusion.
    pub fn process(&self, pair: SamplePair) {
        let sample_id = pair.id();

        let camera = match self.classify(&pair.camera) {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    sample_id = %sample_id,
                    error = %e,
                    "Camera classification failed, dropping sample"
                );
                self.events.record(SinkRecord::status(StatusUpdate::Failed {
                    sample_id,
                    error: e.to_string(),
                }));
                return;
            }
        };

        // A failed screen classification only means no screen evidence this tick.
        let screen = pair.screen.as_ref().and_then(|sample| match self.classify(sample) {
            Ok(result) => Some(result),
            Err(e) => {
                debug!(sample_id = %sample_id, error = %e, "Screen classification failed");
                None
            }
        });

        self.events.record(SinkRecord::status(StatusUpdate::Classified {
            sample_id,
            latency_ms: camera.latency.as_millis() as u64,
            has_screen: screen.is_some(),
        }));

        let fused = FusedSample {
            sample_id,
            timestamp: pair.timestamp,
            camera,
            screen,
        };
        self.transparency.record_fused_sample();
        if let Some(evicted) = self.fusion.push(fused) {
            self.transparency.record_queue_drop();
            self.events.record(SinkRecord::status(StatusUpdate::Dropped {
                sample_id: evicted.sample_id,
                queue: self.fusion.name().to_string(),
            }));
        }
    }

    fn classify(&self, sample: &Sample) -> Result<ClassificationResult, ClassifierError> {
        match self.classifier.classify(&sample.image) {
            Ok(classification) => {
                self.transparency.record_classification_ok();
                self.mark_recovered();

                let (labels, invalid) = self.taxonomy.filter(classification.labels);
                if invalid > 0 {
                    debug!(
                        sample_id = %sample.id,
                        invalid,
                        "Discarded labels outside the taxonomy"
                    );
                    self.transparency.record_invalid_labels(invalid as u64);
                }

                Ok(ClassificationResult::new(
                    sample.id,
                    sample.kind,
                    Classification::new(labels, classification.latency),
                ))
            }
            Err(e) => {
                match e {
                    ClassifierError::CircuitOpen => {
                        self.transparency.record_circuit_rejection();
                        self.mark_degraded();
                    }
                    ClassifierError::RateLimited(_) => self.transparency.record_rate_limited(),
                    ClassifierError::Transient(_) | ClassifierError::Timeout(_) => {}
                }
                self.transparency.record_classification_failure();
                Err(e)
            }
        }
    }

    fn mark_degraded(&self) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!("Classifier unreachable, running in degraded mode");
            self.notifier.notify(Notification::new(
                NotificationKind::Degraded,
                "Classifier unreachable",
                "Focus tracking is paused until the classification service responds again.",
            ));
        }
    }

    fn mark_recovered(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!("Classifier reachable again");
            self.notifier.notify(Notification::new(
                NotificationKind::Recovered,
                "Classifier recovered",
                "Focus tracking has resumed.",
            ));
        }
    }
}

/// Fixed-size pool of upload workers.
pub struct WorkerPool {
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers consuming from `receiver`.
    pub fn start(
        size: usize,
        receiver: Receiver<SamplePair>,
        ctx: Arc<WorkerContext>,
    ) -> Result<Self, PipelineError> {
        let running = Arc::new(AtomicBool::new(true));
        let mut pool = Self {
            running: running.clone(),
            handles: Vec::with_capacity(size),
        };

        for index in 0..size.max(1) {
            let receiver = receiver.clone();
            let ctx = ctx.clone();
            let running = running.clone();

            let handle = thread::Builder::new()
                .name(format!("focus-worker-{index}"))
                .spawn(move || run_worker(index, &receiver, &ctx, &running));

            match handle {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    pool.stop(Duration::from_secs(1));
                    return Err(PipelineError::Spawn(e));
                }
            }
        }

        info!(workers = pool.handles.len(), "Worker pool started");
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every worker and wait up to `timeout` in total for them to exit.
    ///
    /// A worker in the middle of a classification finishes that item first.
    pub fn stop(&mut self, timeout: Duration) {
        self.running.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        for (index, handle) in self.handles.drain(..).enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            join_with_timeout(handle, remaining, &format!("worker-{index}"));
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn run_worker(
    index: usize,
    receiver: &Receiver<SamplePair>,
    ctx: &WorkerContext,
    running: &AtomicBool,
) {
    debug!(worker = index, "Worker started");
    while running.load(Ordering::SeqCst) {
        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(pair) => ctx.process(pair),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(worker = index, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SampleKind;
    use crate::classifier::testing::{labels, ScriptedClassifier};
    use crate::classifier::{RetryPolicy, RetryingClassifier};
    use crate::sinks::{ChannelNotifier, MemoryEventSink};
    use crate::transparency::create_shared_log;
    use chrono::Utc;

    struct Harness {
        ctx: WorkerContext,
        events: Arc<MemoryEventSink>,
        notifications: Receiver<Notification>,
    }

    fn harness(classifier: ScriptedClassifier) -> Harness {
        harness_with(Arc::new(classifier))
    }

    fn harness_with(classifier: Arc<dyn Classifier>) -> Harness {
        let events = Arc::new(MemoryEventSink::new());
        let (notifier, notifications) = ChannelNotifier::new(8);
        let ctx = WorkerContext {
            classifier,
            taxonomy: Arc::new(LabelTaxonomy::default()),
            fusion: Arc::new(DropOldestQueue::new("fusion", 8, Duration::from_millis(10))),
            events: events.clone(),
            notifier: Arc::new(notifier),
            transparency: create_shared_log(),
            degraded: Arc::new(AtomicBool::new(false)),
        };
        Harness {
            ctx,
            events,
            notifications,
        }
    }

    fn pair(with_screen: bool) -> SamplePair {
        let now = Utc::now();
        SamplePair {
            camera: Sample::new(SampleKind::Camera, now, vec![1]),
            screen: with_screen.then(|| Sample::new(SampleKind::Screen, now, vec![2])),
            timestamp: now,
        }
    }

    #[test]
    fn test_success_forwards_fused_sample() {
        let h = harness(ScriptedClassifier::always(Ok(labels(&[
            ("HeadAway", 0.8),
            ("Banana", 0.9),
        ]))));
        let pair = pair(true);
        let id = pair.id();

        h.ctx.process(pair);

        let fused = h.ctx.fusion.receiver().try_recv().unwrap();
        assert_eq!(fused.sample_id, id);
        assert_eq!(fused.camera.labels.len(), 1);
        assert!(fused.screen.is_some());
        assert_eq!(h.ctx.transparency.stats().invalid_labels, 2);
    }

    #[test]
    fn test_camera_failure_drops_sample() {
        let h = harness(ScriptedClassifier::always(Err(ClassifierError::Transient(
            "boom".into(),
        ))));

        h.ctx.process(pair(false));
        h.ctx.process(pair(false));

        assert!(h.ctx.fusion.is_empty());
        assert_eq!(failed_count(&h.events), 2);
    }

    fn failed_count(events: &MemoryEventSink) -> usize {
        events
            .records()
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    SinkRecord::Status {
                        update: StatusUpdate::Failed { .. },
                        ..
                    }
                )
            })
            .count()
    }

    #[test]
    fn test_exhausted_retries_drop_one_sample_and_next_proceeds() {
        let max_attempts = 3;
        let scripted = Arc::new(ScriptedClassifier::new(
            (0..max_attempts)
                .map(|_| Err(ClassifierError::Transient("connection reset".into())))
                .collect(),
            Ok(labels(&[("Phone", 0.9)])),
        ));
        let policy = RetryPolicy {
            max_attempts,
            backoff_base: 2.0,
            backoff_unit: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        };
        let h = harness_with(Arc::new(RetryingClassifier::new(scripted.clone(), policy)));

        let first = pair(false);
        let second = pair(false);
        let second_id = second.id();
        h.ctx.process(first);
        h.ctx.process(second);

        assert_eq!(scripted.calls(), max_attempts as usize + 1);
        assert_eq!(failed_count(&h.events), 1);

        let fused: Vec<FusedSample> = h.ctx.fusion.receiver().try_iter().collect();
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].sample_id, second_id);

        let stats = h.ctx.transparency.stats();
        assert_eq!(stats.classification_failures, 1);
        assert_eq!(stats.fused_samples, 1);
    }

    #[test]
    fn test_screen_failure_is_not_an_error() {
        let h = harness(ScriptedClassifier::new(
            vec![Ok(labels(&[("Focused", 0.9)]))],
            Err(ClassifierError::Timeout(Duration::from_secs(1))),
        ));

        h.ctx.process(pair(true));

        let fused = h.ctx.fusion.receiver().try_recv().unwrap();
        assert!(fused.screen.is_none());
    }

    #[test]
    fn test_degraded_then_recovered_notifications() {
        let h = harness(ScriptedClassifier::new(
            vec![
                Err(ClassifierError::CircuitOpen),
                Err(ClassifierError::CircuitOpen),
            ],
            Ok(labels(&[("Focused", 0.9)])),
        ));

        h.ctx.process(pair(false));
        h.ctx.process(pair(false));
        h.ctx.process(pair(false));

        let kinds: Vec<NotificationKind> = h.notifications.try_iter().map(|n| n.kind).collect();
        assert_eq!(
            kinds,
            vec![NotificationKind::Degraded, NotificationKind::Recovered]
        );
        assert_eq!(h.ctx.transparency.stats().circuit_rejections, 2);
    }

    #[test]
    fn test_pool_consumes_and_stops() {
        let h = harness(ScriptedClassifier::always(Ok(labels(&[("Focused", 0.9)]))));
        let upload = DropOldestQueue::new("upload", 8, Duration::from_millis(10));
        for _ in 0..4 {
            upload.push(pair(false));
        }
        let fusion = h.ctx.fusion.clone();

        let mut pool = WorkerPool::start(2, upload.receiver(), Arc::new(h.ctx)).unwrap();
        assert_eq!(pool.len(), 2);

        let receiver = fusion.receiver();
        for _ in 0..4 {
            receiver.recv_timeout(Duration::from_secs(2)).unwrap();
        }

        let started = Instant::now();
        pool.stop(Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(pool.is_empty());
    }
}
