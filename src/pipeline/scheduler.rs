//! Capture scheduler.
//!
//! Fires a capture tick at a fixed interval anchored to the session start, so
//! a slow capture or a stalled consumer never shifts later ticks. The loop
//! sleeps in short slices to observe pause and stop promptly.

use crate::capture::{CaptureError, ImageCapture, Sample, SampleKind, SamplePair};
use crate::config::SchedulerConfig;
use crate::pipeline::queue::DropOldestQueue;
use crate::pipeline::{join_with_timeout, PipelineError, POLL_INTERVAL};
use crate::sinks::{EventSink, SinkRecord, StatusUpdate};
use crate::transparency::SharedTransparencyLog;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Capture devices, owned by the scheduler thread while it runs.
struct Devices {
    camera: Box<dyn ImageCapture>,
    screen: Option<Box<dyn ImageCapture>>,
}

impl Devices {
    fn release(&mut self) {
        self.camera.release();
        if let Some(screen) = self.screen.as_mut() {
            screen.release();
        }
        debug!("Capture devices released");
    }
}

/// Produces one [`SamplePair`] per tick into the upload queue.
pub struct Scheduler {
    config: SchedulerConfig,
    devices: Option<Devices>,
    queue: Arc<DropOldestQueue<SamplePair>>,
    events: Arc<dyn EventSink>,
    transparency: SharedTransparencyLog,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    handle: Option<JoinHandle<Devices>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        camera: Box<dyn ImageCapture>,
        screen: Option<Box<dyn ImageCapture>>,
        queue: Arc<DropOldestQueue<SamplePair>>,
        events: Arc<dyn EventSink>,
        transparency: SharedTransparencyLog,
    ) -> Self {
        Self {
            config,
            devices: Some(Devices { camera, screen }),
            queue,
            events,
            transparency,
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Capture immediately, then every interval until stopped.
    ///
    /// The first capture happens on the calling thread so an unavailable
    /// camera is reported here instead of as a skipped tick. While paused, the
    /// first capture is still taken but discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The scheduler is already running
    /// - The camera cannot capture
    /// - The scheduler thread cannot be spawned
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.running.load(Ordering::SeqCst) || self.handle.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }
        let mut devices = self.devices.take().ok_or(PipelineError::AlreadyRunning)?;

        let ctx = TickContext {
            screen_enabled: self.config.screen_capture && devices.screen.is_some(),
            queue: self.queue.clone(),
            events: self.events.clone(),
            transparency: self.transparency.clone(),
        };

        let first = match ctx.capture_pair(&mut devices) {
            Ok(pair) => pair,
            Err(e) => {
                self.devices = Some(devices);
                return Err(PipelineError::CameraUnavailable(e));
            }
        };
        ctx.transparency.record_tick();
        if self.paused.load(Ordering::SeqCst) {
            debug!("Paused at start, discarding first capture");
        } else {
            ctx.enqueue(first);
        }

        let interval = self.config.effective_interval();
        if interval != self.config.interval {
            warn!(
                requested_secs = self.config.interval.as_secs_f64(),
                interval_secs = interval.as_secs_f64(),
                "Capture interval raised to the minimum"
            );
        }

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let paused = self.paused.clone();
        let started = Instant::now();

        let spawned = thread::Builder::new()
            .name("focus-scheduler".to_string())
            .spawn(move || {
                run_tick_loop(&ctx, &mut devices, started, interval, &running, &paused);
                devices.release();
                running.store(false, Ordering::SeqCst);
                devices
            });

        match spawned {
            Ok(handle) => {
                info!(interval_secs = interval.as_secs_f64(), "Scheduler started");
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(PipelineError::Spawn(e))
            }
        }
    }

    /// Stop the loop and wait up to `timeout` for it to release the devices.
    pub fn stop(&mut self, timeout: Duration) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if let Some(devices) = join_with_timeout(handle, timeout, "scheduler") {
                self.devices = Some(devices);
            }
            info!("Scheduler stopped");
        }
    }

    /// Suspend capturing. Devices stay open.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("Capture paused");
        }
    }

    /// Continue on the existing schedule. Ticks missed while paused are skipped.
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("Capture resumed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop(Duration::from_secs(1));
    }
}

/// Shared handles the tick body needs.
struct TickContext {
    screen_enabled: bool,
    queue: Arc<DropOldestQueue<SamplePair>>,
    events: Arc<dyn EventSink>,
    transparency: SharedTransparencyLog,
}

impl TickContext {
    /// One camera capture plus, when enabled, one screen capture.
    ///
    /// Only a camera failure fails the pair.
    fn capture_pair(&self, devices: &mut Devices) -> Result<SamplePair, CaptureError> {
        let timestamp = Utc::now();
        let camera = capture_sample(&mut *devices.camera, SampleKind::Camera)?;

        let screen = match devices.screen.as_mut() {
            Some(screen) if self.screen_enabled => {
                match capture_sample(&mut **screen, SampleKind::Screen) {
                    Ok(sample) => Some(sample),
                    Err(e) => {
                        warn!(
                            device = screen.name(),
                            error = %e,
                            "Screen capture failed, continuing without it"
                        );
                        self.transparency.record_screen_failure();
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(SamplePair {
            camera,
            screen,
            timestamp,
        })
    }

    fn tick(&self, devices: &mut Devices) {
        self.transparency.record_tick();
        match self.capture_pair(devices) {
            Ok(pair) => self.enqueue(pair),
            Err(e) => {
                warn!(
                    device = devices.camera.name(),
                    error = %e,
                    "Camera capture failed, skipping tick"
                );
                self.transparency.record_capture_failure();
                self.events
                    .record(SinkRecord::status(StatusUpdate::CaptureSkipped {
                        error: e.to_string(),
                    }));
            }
        }
    }

    fn enqueue(&self, pair: SamplePair) {
        debug!(sample_id = %pair.id(), has_screen = pair.screen.is_some(), "Enqueuing sample pair");
        self.transparency.record_sample_enqueued();
        if let Some(evicted) = self.queue.push(pair) {
            self.transparency.record_queue_drop();
            self.events.record(SinkRecord::status(StatusUpdate::Dropped {
                sample_id: evicted.id(),
                queue: self.queue.name().to_string(),
            }));
        }
    }
}

fn capture_sample(device: &mut dyn ImageCapture, kind: SampleKind) -> Result<Sample, CaptureError> {
    let captured_at = Utc::now();
    let image = device.capture()?;
    if image.is_empty() {
        return Err(CaptureError::Empty);
    }
    Ok(Sample::new(kind, captured_at, image))
}

fn run_tick_loop(
    ctx: &TickContext,
    devices: &mut Devices,
    started: Instant,
    interval: Duration,
    running: &AtomicBool,
    paused: &AtomicBool,
) {
    let mut next_tick: u32 = 1;

    while running.load(Ordering::SeqCst) {
        let Some(due) = interval
            .checked_mul(next_tick)
            .and_then(|offset| started.checked_add(offset))
        else {
            warn!(next_tick, "Capture schedule overflowed, stopping tick loop");
            break;
        };
        let now = Instant::now();
        if now < due {
            thread::sleep((due - now).min(POLL_INTERVAL));
            continue;
        }

        // Schedule from the anchor; anything missed while slow or paused is skipped.
        let elapsed_ticks = (now - started).as_secs_f64() / interval.as_secs_f64();
        let missed = (elapsed_ticks as u32).saturating_sub(next_tick);
        if missed > 0 {
            debug!(missed, "Skipping missed capture ticks");
        }
        next_tick = elapsed_ticks as u32 + 1;

        if paused.load(Ordering::SeqCst) {
            continue;
        }
        ctx.tick(devices);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::MemoryEventSink;
    use crate::transparency::create_shared_log;
    use std::sync::atomic::AtomicUsize;

    /// Counts captures and releases; fails when told to.
    struct CountingCapture {
        captures: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
        fail: Arc<AtomicBool>,
    }

    impl CountingCapture {
        fn new() -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<AtomicBool>) {
            let captures = Arc::new(AtomicUsize::new(0));
            let releases = Arc::new(AtomicUsize::new(0));
            let fail = Arc::new(AtomicBool::new(false));
            (
                Self {
                    captures: captures.clone(),
                    releases: releases.clone(),
                    fail: fail.clone(),
                },
                captures,
                releases,
                fail,
            )
        }
    }

    impl ImageCapture for CountingCapture {
        fn capture(&mut self) -> Result<Vec<u8>, CaptureError> {
            self.captures.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(CaptureError::Unavailable("test".into()));
            }
            Ok(vec![0xFF, 0xD8, 0xFF])
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn scheduler_config() -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(1),
            screen_capture: true,
            queue_capacity: 8,
            enqueue_timeout_ms: 10,
        }
    }

    fn build(
        camera: CountingCapture,
        screen: Option<Box<dyn ImageCapture>>,
    ) -> (Scheduler, Arc<DropOldestQueue<SamplePair>>, Arc<MemoryEventSink>) {
        let queue = Arc::new(DropOldestQueue::new("upload", 8, Duration::from_millis(10)));
        let events = Arc::new(MemoryEventSink::new());
        let scheduler = Scheduler::new(
            scheduler_config(),
            Box::new(camera),
            screen,
            queue.clone(),
            events.clone(),
            create_shared_log(),
        );
        (scheduler, queue, events)
    }

    #[test]
    fn test_start_captures_immediately() {
        let (camera, captures, _, _) = CountingCapture::new();
        let (mut scheduler, queue, _) = build(camera, None);

        scheduler.start().unwrap();
        assert_eq!(captures.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 1);

        let pair = queue.receiver().try_recv().unwrap();
        assert!(pair.screen.is_none());
        assert_eq!(pair.camera.kind, SampleKind::Camera);

        scheduler.stop(Duration::from_secs(2));
    }

    #[test]
    fn test_start_fails_when_camera_unavailable() {
        let (camera, _, _, fail) = CountingCapture::new();
        fail.store(true, Ordering::SeqCst);
        let (mut scheduler, queue, _) = build(camera, None);

        assert!(matches!(
            scheduler.start(),
            Err(PipelineError::CameraUnavailable(_))
        ));
        assert!(!scheduler.is_running());
        assert!(queue.is_empty());

        // Devices are kept, so a later start can succeed.
        fail.store(false, Ordering::SeqCst);
        scheduler.start().unwrap();
        scheduler.stop(Duration::from_secs(2));
    }

    #[test]
    fn test_double_start_is_rejected() {
        let (camera, _, _, _) = CountingCapture::new();
        let (mut scheduler, _, _) = build(camera, None);

        scheduler.start().unwrap();
        assert!(matches!(scheduler.start(), Err(PipelineError::AlreadyRunning)));
        scheduler.stop(Duration::from_secs(2));
    }

    #[test]
    fn test_stop_is_prompt_and_releases_devices() {
        let (camera, _, releases, _) = CountingCapture::new();
        let (mut scheduler, _, _) = build(camera, None);

        scheduler.start().unwrap();
        let started = Instant::now();
        scheduler.stop(Duration::from_secs(2));

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!scheduler.is_running());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ticks_follow_interval() {
        let (camera, captures, _, _) = CountingCapture::new();
        let (mut scheduler, _, _) = build(camera, None);

        scheduler.start().unwrap();
        thread::sleep(Duration::from_millis(2500));
        scheduler.stop(Duration::from_secs(2));

        // Immediate capture plus ticks at 1s and 2s.
        assert_eq!(captures.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failed_tick_is_skipped_and_recorded() {
        let (camera, _, _, fail) = CountingCapture::new();
        let (mut scheduler, queue, events) = build(camera, None);

        scheduler.start().unwrap();
        fail.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(1500));
        scheduler.stop(Duration::from_secs(2));

        assert_eq!(queue.len(), 1);
        assert!(events.records().iter().any(|r| matches!(
            r,
            SinkRecord::Status {
                update: StatusUpdate::CaptureSkipped { .. },
                ..
            }
        )));
    }

    #[test]
    fn test_pause_suspends_capture() {
        let (camera, captures, releases, _) = CountingCapture::new();
        let (mut scheduler, _, _) = build(camera, None);

        scheduler.start().unwrap();
        scheduler.pause();
        thread::sleep(Duration::from_millis(1500));
        assert_eq!(captures.load(Ordering::SeqCst), 1);
        assert_eq!(releases.load(Ordering::SeqCst), 0);

        scheduler.resume();
        thread::sleep(Duration::from_millis(1000));
        scheduler.stop(Duration::from_secs(2));
        assert_eq!(captures.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_screen_failure_keeps_camera() {
        let (camera, _, _, _) = CountingCapture::new();
        let (screen, _, _, screen_fail) = CountingCapture::new();
        screen_fail.store(true, Ordering::SeqCst);
        let (mut scheduler, queue, _) = build(camera, Some(Box::new(screen)));

        scheduler.start().unwrap();
        scheduler.stop(Duration::from_secs(2));

        let pair = queue.receiver().try_recv().unwrap();
        assert!(pair.screen.is_none());
    }
}
