//! Live detection pipeline.
//!
//! Two activities share one `FrameSlot`:
//! - capture: owns the opened camera and keeps the slot filled with the newest frame
//! - inference: takes the newest frame, letterboxes it, runs the detector, filters
//!   the result for temporal stability, maps boxes into display space, renders
//!   annotations and hands everything to the registered `PipelineSink`
//!
//! The controller owns both threads for the duration of a session and tears
//! them down on `stop`. Per-frame failures never leave the inference activity.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::coords::CoordinateMapper;
use crate::detect::{Detection, SharedBackend};
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{Frame, FrameSlot};
use crate::ingest::{CameraDiscovery, ReleaseHandle};
use crate::preprocess::Preprocessor;
use crate::render::{RenderedFrame, Renderer};
use crate::stability::{StabilityConfig, StabilityFilter};

// ----------------------------------------------------------------------------
// Configuration and state
// ----------------------------------------------------------------------------

/// Runtime settings for one pipeline session.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub confidence_threshold: f32,
    pub display_width: u32,
    pub display_height: u32,
    pub input_width: u32,
    pub input_height: u32,
    pub stability: StabilityConfig,
    /// Sleep while the frame slot is empty.
    pub idle_backoff: Duration,
    /// Sleep after a failed camera read.
    pub capture_retry: Duration,
    /// Upper bound on waiting for both activities to exit.
    pub stop_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.4,
            display_width: 640,
            display_height: 640,
            input_width: 640,
            input_height: 640,
            stability: StabilityConfig::default(),
            idle_backoff: Duration::from_millis(1),
            capture_retry: Duration::from_millis(10),
            stop_timeout: Duration::from_millis(1000),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Stopped => "stopped",
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Counters for the current or most recent session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_captured: u64,
    /// Captured frames replaced before inference picked them up.
    pub frames_dropped: u64,
    pub frames_processed: u64,
    pub frames_failed: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
}

// ----------------------------------------------------------------------------
// Sinks
// ----------------------------------------------------------------------------

/// Receives pipeline output on the inference thread.
///
/// Each processed frame produces exactly one call of each method, in the order
/// plain frame, annotated frame, detections. Implementations should return
/// quickly; slow sinks delay the next inference.
pub trait PipelineSink: Send {
    /// The frame resized to display resolution, without annotations.
    fn on_plain_frame(&mut self, _frame: &RgbImage) {}

    /// The annotated display frame, or the plain frame when nothing survived.
    fn on_annotated_frame(&mut self, _frame: &RenderedFrame) {}

    /// Corroborated detections in display coordinates (possibly empty).
    fn on_detections(&mut self, _detections: &[Detection]) {}
}

/// Discards everything.
pub struct NullSink;

impl PipelineSink for NullSink {}

/// Owned copy of one sink callback.
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    PlainFrame(RgbImage),
    AnnotatedFrame(RenderedFrame),
    Detections(Vec<Detection>),
}

/// Forwards every callback as a `PipelineEvent` over a channel.
pub struct ChannelSink {
    tx: Sender<PipelineEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<PipelineEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: PipelineEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("pipeline: event receiver dropped");
        }
    }
}

impl PipelineSink for ChannelSink {
    fn on_plain_frame(&mut self, frame: &RgbImage) {
        self.send(PipelineEvent::PlainFrame(frame.clone()));
    }

    fn on_annotated_frame(&mut self, frame: &RenderedFrame) {
        self.send(PipelineEvent::AnnotatedFrame(frame.clone()));
    }

    fn on_detections(&mut self, detections: &[Detection]) {
        self.send(PipelineEvent::Detections(detections.to_vec()));
    }
}

type PlainCallback = Box<dyn FnMut(&RgbImage) + Send>;
type AnnotatedCallback = Box<dyn FnMut(&RenderedFrame) + Send>;
type DetectionsCallback = Box<dyn FnMut(&[Detection]) + Send>;

/// Sink built from closures; unset callbacks are skipped.
#[derive(Default)]
pub struct CallbackSink {
    plain: Option<PlainCallback>,
    annotated: Option<AnnotatedCallback>,
    detections: Option<DetectionsCallback>,
}

impl CallbackSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plain(mut self, f: impl FnMut(&RgbImage) + Send + 'static) -> Self {
        self.plain = Some(Box::new(f));
        self
    }

    pub fn annotated(mut self, f: impl FnMut(&RenderedFrame) + Send + 'static) -> Self {
        self.annotated = Some(Box::new(f));
        self
    }

    pub fn detections(mut self, f: impl FnMut(&[Detection]) + Send + 'static) -> Self {
        self.detections = Some(Box::new(f));
        self
    }
}

impl PipelineSink for CallbackSink {
    fn on_plain_frame(&mut self, frame: &RgbImage) {
        if let Some(f) = self.plain.as_mut() {
            f(frame);
        }
    }

    fn on_annotated_frame(&mut self, frame: &RenderedFrame) {
        if let Some(f) = self.annotated.as_mut() {
            f(frame);
        }
    }

    fn on_detections(&mut self, detections: &[Detection]) {
        if let Some(f) = self.detections.as_mut() {
            f(detections);
        }
    }
}

// ----------------------------------------------------------------------------
// Controller
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Activity {
    Capture,
    Inference,
}

impl Activity {
    fn name(self) -> &'static str {
        match self {
            Activity::Capture => "capture",
            Activity::Inference => "inference",
        }
    }
}

enum ActivityExit {
    Capture,
    Inference(Box<dyn PipelineSink>),
}

struct Session {
    stop: Arc<AtomicBool>,
    camera: ReleaseHandle,
    slot: Arc<FrameSlot>,
    exits: Receiver<ActivityExit>,
    capture: Option<JoinHandle<()>>,
    inference: Option<JoinHandle<()>>,
}

/// Owns one camera + detector session at a time.
pub struct PipelineController {
    config: PipelineConfig,
    discovery: CameraDiscovery,
    detector: Option<SharedBackend>,
    renderer: Renderer,
    sink: Option<Box<dyn PipelineSink>>,
    state: PipelineState,
    session: Option<Session>,
    counters: Arc<Counters>,
    last_slot: Option<Arc<FrameSlot>>,
}

impl PipelineController {
    pub fn new(config: PipelineConfig, discovery: CameraDiscovery) -> Self {
        Self {
            config,
            discovery,
            detector: None,
            renderer: Renderer::new(),
            sink: Some(Box::new(NullSink)),
            state: PipelineState::Stopped,
            session: None,
            counters: Arc::new(Counters::default()),
            last_slot: None,
        }
    }

    pub fn with_renderer(mut self, renderer: Renderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn attach_detector(&mut self, detector: SharedBackend) {
        self.detector = Some(detector);
    }

    pub fn detach_detector(&mut self) -> Option<SharedBackend> {
        self.detector.take()
    }

    pub fn has_detector(&self) -> bool {
        self.detector.is_some()
    }

    /// Replace the output sink. Takes effect at the next start.
    pub fn set_sink(&mut self, sink: Box<dyn PipelineSink>) {
        self.sink = Some(sink);
    }

    /// Confidence threshold used from the next start on.
    pub fn set_confidence_threshold(&mut self, threshold: f32) -> PipelineResult<()> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(PipelineError::Internal(format!(
                "confidence threshold {} outside [0, 1]",
                threshold
            )));
        }
        self.config.confidence_threshold = threshold;
        Ok(())
    }

    pub fn stats(&self) -> PipelineStats {
        let slot = self
            .session
            .as_ref()
            .map(|s| s.slot.stats())
            .or_else(|| self.last_slot.as_ref().map(|s| s.stats()))
            .unwrap_or_default();
        PipelineStats {
            frames_captured: slot.pushed,
            frames_dropped: slot.overwritten,
            frames_processed: self.counters.processed.load(Ordering::Relaxed),
            frames_failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    fn transition(&mut self, next: PipelineState) {
        if self.state != next {
            log::info!("pipeline: {} -> {}", self.state, next);
            self.state = next;
        }
    }

    /// Open the camera and launch the capture and inference activities.
    pub fn start(&mut self) -> PipelineResult<()> {
        if self.state != PipelineState::Stopped {
            return Err(PipelineError::AlreadyRunning);
        }
        let detector = self.detector.clone().ok_or(PipelineError::ModelNotLoaded)?;

        self.transition(PipelineState::Starting);
        match self.launch(detector) {
            Ok(session) => {
                self.session = Some(session);
                self.transition(PipelineState::Running);
                Ok(())
            }
            Err(err) => {
                log::error!("pipeline: start failed: {}", err);
                self.transition(PipelineState::Stopped);
                Err(err)
            }
        }
    }

    fn launch(&mut self, detector: SharedBackend) -> PipelineResult<Session> {
        let preprocessor = Preprocessor::new(self.config.input_width, self.config.input_height)
            .map_err(|err| PipelineError::Internal(format!("{:#}", err)))?;
        if self.config.display_width == 0 || self.config.display_height == 0 {
            return Err(PipelineError::Internal("display size must be non-zero".into()));
        }

        let source = self.discovery.open()?;
        let camera = source.release_handle();

        let stop = Arc::new(AtomicBool::new(false));
        let slot = Arc::new(FrameSlot::new());
        let (exit_tx, exits) = mpsc::channel();
        self.counters = Arc::new(Counters::default());

        let capture = {
            let slot = slot.clone();
            let stop = stop.clone();
            let exit_tx = exit_tx.clone();
            let retry = self.config.capture_retry;
            std::thread::Builder::new()
                .name("binwise-capture".into())
                .spawn(move || {
                    source.run_capture(slot, stop, retry);
                    let _ = exit_tx.send(ActivityExit::Capture);
                })
                .map_err(|err| PipelineError::Internal(format!("spawn capture thread: {}", err)))?
        };

        let sink = self.sink.take().unwrap_or_else(|| {
            log::warn!("pipeline: previous sink was lost; events are discarded");
            Box::new(NullSink)
        });
        let worker = InferenceLoop {
            slot: slot.clone(),
            stop: stop.clone(),
            detector,
            preprocessor,
            filter: StabilityFilter::new(self.config.stability),
            mapper: CoordinateMapper::new(self.config.display_width, self.config.display_height),
            renderer: self.renderer.clone(),
            sink,
            threshold: self.config.confidence_threshold,
            idle_backoff: self.config.idle_backoff,
            counters: self.counters.clone(),
        };
        let inference = std::thread::Builder::new()
            .name("binwise-inference".into())
            .spawn(move || {
                let sink = worker.run();
                let _ = exit_tx.send(ActivityExit::Inference(sink));
            });
        let inference = match inference {
            Ok(handle) => handle,
            Err(err) => {
                stop.store(true, Ordering::SeqCst);
                camera.release();
                let _ = capture.join();
                self.sink = Some(Box::new(NullSink));
                return Err(PipelineError::Internal(format!(
                    "spawn inference thread: {}",
                    err
                )));
            }
        };

        Ok(Session {
            stop,
            camera,
            slot,
            exits,
            capture: Some(capture),
            inference: Some(inference),
        })
    }

    /// Signal both activities, release the camera, and wait for them up to
    /// `stop_timeout`. Releasing first wakes a capture read blocked in the driver.
    /// Always ends in `Stopped`; an activity that did not exit in time is reported
    /// as `StopTimeout`.
    pub fn stop(&mut self) -> PipelineResult<()> {
        let Some(mut session) = self.session.take() else {
            self.transition(PipelineState::Stopped);
            return Ok(());
        };
        self.transition(PipelineState::Stopping);
        session.stop.store(true, Ordering::SeqCst);
        session.camera.release();

        let deadline = Instant::now() + self.config.stop_timeout;
        let mut pending: BTreeSet<Activity> = [Activity::Capture, Activity::Inference].into();
        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match session.exits.recv_timeout(remaining) {
                Ok(ActivityExit::Capture) => {
                    pending.remove(&Activity::Capture);
                    join_quietly(session.capture.take(), Activity::Capture);
                }
                Ok(ActivityExit::Inference(sink)) => {
                    pending.remove(&Activity::Inference);
                    self.sink = Some(sink);
                    join_quietly(session.inference.take(), Activity::Inference);
                }
                Err(RecvTimeoutError::Timeout) => break,
                // Every sender is gone: the remaining activities panicked.
                Err(RecvTimeoutError::Disconnected) => {
                    join_quietly(session.capture.take(), Activity::Capture);
                    join_quietly(session.inference.take(), Activity::Inference);
                    pending.clear();
                }
            }
        }

        session.slot.clear();
        self.last_slot = Some(session.slot.clone());
        self.transition(PipelineState::Stopped);

        if pending.is_empty() {
            let stats = self.stats();
            log::info!(
                "pipeline: session ended ({} captured, {} dropped, {} processed, {} failed)",
                stats.frames_captured,
                stats.frames_dropped,
                stats.frames_processed,
                stats.frames_failed
            );
            return Ok(());
        }

        let activities: Vec<&'static str> = pending.iter().map(|a| a.name()).collect();
        let timeout_ms = self.config.stop_timeout.as_millis() as u64;
        log::error!(
            "pipeline: {} still running after {}ms; abandoning thread(s)",
            activities.join(", "),
            timeout_ms
        );
        Err(PipelineError::StopTimeout {
            timeout_ms,
            activities,
        })
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        if self.session.is_some() {
            if let Err(err) = self.stop() {
                log::warn!("pipeline: stop on drop failed: {}", err);
            }
        }
    }
}

fn join_quietly(handle: Option<JoinHandle<()>>, activity: Activity) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            log::error!("pipeline: {} thread panicked", activity.name());
        }
    }
}

// ----------------------------------------------------------------------------
// Inference activity
// ----------------------------------------------------------------------------

struct InferenceLoop {
    slot: Arc<FrameSlot>,
    stop: Arc<AtomicBool>,
    detector: SharedBackend,
    preprocessor: Preprocessor,
    filter: StabilityFilter,
    mapper: CoordinateMapper,
    renderer: Renderer,
    sink: Box<dyn PipelineSink>,
    threshold: f32,
    idle_backoff: Duration,
    counters: Arc<Counters>,
}

impl InferenceLoop {
    /// Process frames until stopped; hands the sink back on exit.
    fn run(mut self) -> Box<dyn PipelineSink> {
        while !self.stop.load(Ordering::SeqCst) {
            match self.slot.take() {
                Some(frame) => self.handle(frame),
                None => std::thread::sleep(self.idle_backoff),
            }
        }
        self.sink
    }

    fn handle(&mut self, frame: Frame) {
        let source = frame.to_rgb_image();
        let display = self.to_display(&source);

        let detections = match self.detect(&source) {
            Ok(detections) => detections,
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("pipeline: frame {} processing failed: {:#}", frame.sequence, err);
                Vec::new()
            }
        };
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        self.sink.on_plain_frame(&display);
        let annotated = if detections.is_empty() {
            RenderedFrame {
                image: display,
                labels: Vec::new(),
            }
        } else {
            self.renderer.render(&display, &detections)
        };
        self.sink.on_annotated_frame(&annotated);
        self.sink.on_detections(&detections);
    }

    fn to_display(&self, source: &RgbImage) -> RgbImage {
        let (w, h) = (self.mapper.display_width, self.mapper.display_height);
        if source.dimensions() == (w, h) {
            source.clone()
        } else {
            imageops::resize(source, w, h, FilterType::Triangle)
        }
    }

    fn detect(&mut self, source: &RgbImage) -> Result<Vec<Detection>> {
        let (tensor, transform) = self.preprocessor.process_image(source)?;
        let raw = {
            let mut backend = self
                .detector
                .lock()
                .map_err(|_| anyhow!("detector lock poisoned"))?;
            backend.infer(&tensor, self.threshold)?
        };
        let stable = self.filter.filter(raw);
        Ok(self.mapper.map_all(&stable, &transform))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubBackend;
    use crate::ingest::{CaptureBackend, CaptureSettings, SyntheticDriver};
    use std::sync::Mutex;

    // Synthetic devices honor the requested resolution, so keep frames small.
    fn discovery(driver: SyntheticDriver) -> CameraDiscovery {
        let settings = CaptureSettings {
            width: 64,
            height: 48,
            fps: 100,
            buffer_depth: 1,
        };
        CameraDiscovery::new(vec![0], vec![CaptureBackend::Any], settings)
            .with_driver(Arc::new(driver))
    }

    fn stub() -> SharedBackend {
        Arc::new(Mutex::new(StubBackend::new(vec!["bottle".into()])))
    }

    #[test]
    fn start_without_detector_stays_stopped() {
        let mut pipeline = PipelineController::new(
            PipelineConfig::default(),
            discovery(SyntheticDriver::new(64, 48)),
        );
        assert!(matches!(pipeline.start(), Err(PipelineError::ModelNotLoaded)));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[test]
    fn missing_camera_fails_start() {
        let driver = SyntheticDriver::new(64, 48).with_available_indices(vec![]);
        let mut pipeline = PipelineController::new(PipelineConfig::default(), discovery(driver));
        pipeline.attach_detector(stub());
        assert!(matches!(
            pipeline.start(),
            Err(PipelineError::CameraUnavailable { attempts: 1, .. })
        ));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[test]
    fn stop_is_idempotent_and_start_twice_is_rejected() -> Result<()> {
        let mut pipeline = PipelineController::new(
            PipelineConfig::default(),
            discovery(SyntheticDriver::new(64, 48)),
        );
        pipeline.attach_detector(stub());
        pipeline.stop()?;
        pipeline.start()?;
        assert_eq!(pipeline.state(), PipelineState::Running);
        assert!(matches!(pipeline.start(), Err(PipelineError::AlreadyRunning)));
        pipeline.stop()?;
        pipeline.stop()?;
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        Ok(())
    }

    #[test]
    fn per_frame_failures_emit_plain_frames() -> Result<()> {
        let backend: SharedBackend = Arc::new(Mutex::new(
            StubBackend::new(vec!["bottle".into()]).with_failures(u32::MAX),
        ));
        let mut pipeline = PipelineController::new(
            PipelineConfig {
                display_width: 32,
                display_height: 32,
                ..PipelineConfig::default()
            },
            discovery(SyntheticDriver::new(64, 48)),
        );
        pipeline.attach_detector(backend);
        let (sink, rx) = ChannelSink::new();
        pipeline.set_sink(Box::new(sink));
        pipeline.start()?;

        let mut saw_empty_detections = false;
        let mut annotated_without_labels = false;
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && !(saw_empty_detections && annotated_without_labels) {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(PipelineEvent::Detections(d)) => saw_empty_detections |= d.is_empty(),
                Ok(PipelineEvent::AnnotatedFrame(f)) => {
                    assert_eq!(f.image.dimensions(), (32, 32));
                    annotated_without_labels |= f.labels.is_empty();
                }
                Ok(PipelineEvent::PlainFrame(_)) | Err(_) => {}
            }
        }
        pipeline.stop()?;

        assert!(saw_empty_detections && annotated_without_labels);
        let stats = pipeline.stats();
        assert!(stats.frames_failed >= 1);
        assert_eq!(stats.frames_failed, stats.frames_processed);
        Ok(())
    }

    #[test]
    fn threshold_outside_unit_range_is_rejected() {
        let mut pipeline = PipelineController::new(
            PipelineConfig::default(),
            discovery(SyntheticDriver::new(8, 8)),
        );
        assert!(pipeline.set_confidence_threshold(1.5).is_err());
        assert!(pipeline.set_confidence_threshold(0.25).is_ok());
        assert!((pipeline.config().confidence_threshold - 0.25).abs() < f32::EPSILON);
    }
}
