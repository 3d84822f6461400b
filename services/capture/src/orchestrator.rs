//! Capture loop: acquisition, evaluation, retries and out-of-service signalling.
//!
//! One orchestrator owns one [`FrameSource`] for its whole lifetime. A cycle
//! reads a frame, measures it, classifies it against the rolling baseline and
//! either stores it or retries after a fixed delay. When the attempts of a
//! cycle run out the last frame is stored anyway and an [`OutOfService`]
//! signal is raised; the loop itself keeps going. Opening the device is the
//! only step whose failure ends [`CaptureOrchestrator::run`] with an error.
//!
//! ```text
//! Idle -> Opening -> Capturing -> Evaluating -> Accepted --sleep--> Capturing
//!                       ^             |
//!                       +--Retrying<--+--> Failed --sleep--> Capturing
//! ```
//!
//! Cancellation is cooperative through a [`CancellationToken`]; every sleep
//! and every read races against it, and the device is released by a
//! [`DeviceGuard`] on every way out of `run`.

use crate::baseline::BaselineTracker;
use crate::classifier::{AnomalyClassifier, BandMode, MetricFlag, ReferenceProfile, Verdict};
use crate::config::{CalibrationConfig, CaptureServiceConfig};
use crate::frame::Frame;
use crate::frame_source::{DeviceGuard, FrameSource, SourceError};
use crate::metrics::{self, MetricError, QualityMetrics};
use crate::photo_store::PhotoStore;
use crate::signals::{LogSink, OutOfService, OutOfServiceReason, StatusSink};
use backoff::backoff::{Backoff, Constant};
use chrono::{DateTime, Utc};
use image::GrayImage;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that end a capture run.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Device open failed: {0}")]
    DeviceOpen(#[source] SourceError),
}

/// State of the capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Opening,
    Capturing,
    Evaluating,
    Accepted,
    Retrying,
    Failed,
    Stopped,
}

/// Why an attempt did not produce an accepted frame.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptFailure {
    Read(String),
    Anomalous {
        metrics: QualityMetrics,
        flags: Vec<MetricFlag>,
    },
}

impl AttemptFailure {
    fn flags(&self) -> Vec<MetricFlag> {
        match self {
            AttemptFailure::Anomalous { flags, .. } => flags.clone(),
            AttemptFailure::Read(_) => Vec::new(),
        }
    }
}

/// Outcome of one attempt or one cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureResult {
    /// Frame accepted and (if the write succeeded) stored at `path`
    Accepted {
        metrics: QualityMetrics,
        path: Option<PathBuf>,
    },
    /// Attempt failed and another one follows
    Retried { attempt: u32, reason: AttemptFailure },
    /// Every attempt failed; the last frame read, if any, was stored at `path`
    Failed {
        reason: AttemptFailure,
        path: Option<PathBuf>,
    },
}

/// Counters for the capture loop.
#[derive(Debug, Default, Clone)]
pub struct CaptureStats {
    pub cycles: u64,
    pub attempts: u64,
    pub accepted: u64,
    pub anomalies: u64,
    pub read_failures: u64,
    pub store_failures: u64,
    pub signals_raised: u64,
    /// Frames that passed the startup reference check
    pub calibrated: u64,
    pub last_accepted_at: Option<DateTime<Utc>>,
}

/// Cloneable view of a running orchestrator.
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    state: Arc<RwLock<CaptureState>>,
    stats: Arc<RwLock<CaptureStats>>,
    last_result: Arc<RwLock<Option<CaptureResult>>>,
    cancel: CancellationToken,
}

impl CaptureHandle {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            state: Arc::new(RwLock::new(CaptureState::Idle)),
            stats: Arc::new(RwLock::new(CaptureStats::default())),
            last_result: Arc::new(RwLock::new(None)),
            cancel,
        }
    }

    pub fn state(&self) -> CaptureState {
        *self.state.read()
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats.read().clone()
    }

    /// The most recent attempt or cycle outcome.
    pub fn last_result(&self) -> Option<CaptureResult> {
        self.last_result.read().clone()
    }

    /// Request the loop to stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == CaptureState::Stopped
    }
}

/// Timing and retry policy of the capture loop.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub device_index: u32,
    pub zone: u32,
    pub capture_period: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub duplicate_repeat_threshold: u32,
    pub frozen_similarity: f64,
}

impl CaptureSettings {
    pub fn from_config(config: &CaptureServiceConfig) -> Self {
        Self {
            device_index: config.camera.device_index,
            zone: config.camera.zone,
            capture_period: config.capture.capture_period(),
            max_retries: config.capture.max_retries,
            retry_delay: config.capture.retry_delay(),
            duplicate_repeat_threshold: config.capture.duplicate_repeat_threshold,
            frozen_similarity: config.capture.frozen_similarity,
        }
    }
}

/// Startup validation against a reference image.
#[derive(Debug, Clone)]
pub struct Calibration {
    pub profile: ReferenceProfile,
    pub frames: u32,
    pub interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Calibration {
    /// Build from configuration; `None` when no reference image is set.
    pub fn from_config(config: &CalibrationConfig) -> Result<Option<Self>, MetricError> {
        let Some(path) = &config.reference_image else {
            return Ok(None);
        };
        let profile = ReferenceProfile::from_image(path, config.rule, config.tolerance)?;
        info!(
            reference = %path.display(),
            metrics = ?profile.metrics(),
            rule = ?config.rule,
            "Reference profile loaded"
        );
        Ok(Some(Self {
            profile,
            frames: config.frames,
            interval: config.interval(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
        }))
    }
}

/// Detects a capture that stopped advancing.
///
/// A cycle counts as stuck when nothing new was stored or when the stored
/// frame is near-identical to the previous stored frame.
#[derive(Debug)]
struct RepeatMonitor {
    threshold: u32,
    frozen_similarity: f64,
    repeats: u32,
    last_head: u64,
    last_luma: Option<GrayImage>,
}

impl RepeatMonitor {
    fn new(threshold: u32, frozen_similarity: f64, head: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            frozen_similarity,
            repeats: 0,
            last_head: head,
            last_luma: None,
        }
    }

    /// Record the end of a cycle. Returns the repeat count when the threshold
    /// is reached; the counter restarts afterwards.
    fn observe(&mut self, head: u64, stored: Option<GrayImage>) -> Option<u32> {
        let stuck = if head == self.last_head {
            true
        } else {
            let frozen = match (&stored, &self.last_luma) {
                (Some(current), Some(previous)) => metrics::similarity(current, previous)
                    .is_some_and(|s| s >= self.frozen_similarity),
                _ => false,
            };
            if stored.is_some() {
                self.last_luma = stored;
            }
            frozen
        };
        self.last_head = head;

        if !stuck {
            self.repeats = 0;
            return None;
        }

        self.repeats += 1;
        if self.repeats >= self.threshold {
            let repeats = self.repeats;
            self.repeats = 0;
            Some(repeats)
        } else {
            None
        }
    }
}

/// What a finished cycle left behind.
struct CycleOutcome {
    result: CaptureResult,
    stored: Option<GrayImage>,
    sequence: Option<u64>,
}

/// Drives capture for one device.
pub struct CaptureOrchestrator<S: FrameSource> {
    source: S,
    engine: CaptureEngine,
}

/// Everything except the device, so the device can be borrowed by its guard
/// while the engine is mutated.
struct CaptureEngine {
    settings: CaptureSettings,
    store: PhotoStore,
    baseline: BaselineTracker,
    classifier: AnomalyClassifier,
    calibration: Option<Calibration>,
    sink: Arc<dyn StatusSink>,
    handle: CaptureHandle,
    cancel: CancellationToken,
}

impl<S: FrameSource> CaptureOrchestrator<S> {
    pub fn new(
        source: S,
        store: PhotoStore,
        settings: CaptureSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            engine: CaptureEngine {
                settings,
                store,
                baseline: BaselineTracker::new(10, 3),
                classifier: AnomalyClassifier::new(BandMode::Sigma { multiplier: 3.0 }),
                calibration: None,
                sink: Arc::new(LogSink),
                handle: CaptureHandle::new(cancel.clone()),
                cancel,
            },
        }
    }

    pub fn with_baseline(mut self, baseline: BaselineTracker) -> Self {
        self.engine.baseline = baseline;
        self
    }

    pub fn with_classifier(mut self, classifier: AnomalyClassifier) -> Self {
        self.engine.classifier = classifier;
        self
    }

    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.engine.sink = sink;
        self
    }

    pub fn with_calibration(mut self, calibration: Calibration) -> Self {
        self.engine.calibration = Some(calibration);
        self
    }

    pub fn handle(&self) -> CaptureHandle {
        self.engine.handle.clone()
    }

    /// Run until cancelled.
    ///
    /// Returns the final counters, or [`CaptureError::DeviceOpen`] if the
    /// device could not be acquired.
    pub async fn run(self) -> Result<CaptureStats, CaptureError> {
        let Self {
            mut source,
            mut engine,
        } = self;

        if engine.cancel.is_cancelled() {
            engine.set_state(CaptureState::Stopped);
            return Ok(engine.handle.stats());
        }

        engine.set_state(CaptureState::Opening);
        let device_index = engine.settings.device_index;
        let mut device = match DeviceGuard::open(&mut source, device_index).await {
            Ok(device) => device,
            Err(e) => {
                engine.set_state(CaptureState::Failed);
                error!(device_index, error = %e, "Failed to open frame source");
                return Err(CaptureError::DeviceOpen(e));
            }
        };
        info!(device_index, zone = engine.settings.zone, "Capture started");

        if let Some(calibration) = engine.calibration.take() {
            engine.calibrate(&mut *device, &calibration).await;
        }
        engine.capture_loop(&mut *device).await;

        drop(device);
        engine.set_state(CaptureState::Stopped);

        let stats = engine.handle.stats();
        info!(
            cycles = stats.cycles,
            accepted = stats.accepted,
            signals = stats.signals_raised,
            "Capture stopped"
        );
        Ok(stats)
    }
}

impl CaptureEngine {
    fn set_state(&self, state: CaptureState) {
        *self.handle.state.write() = state;
    }

    fn record(&self, result: &CaptureResult) {
        *self.handle.last_result.write() = Some(result.clone());
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Read one frame. `None` on cancellation.
    async fn read<S: FrameSource + ?Sized>(
        &self,
        source: &mut S,
    ) -> Option<Result<Frame, SourceError>> {
        self.handle.stats.write().attempts += 1;
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            read = source.read_frame() => Some(read),
        }
    }

    fn persist(&mut self, frame: &Frame) -> Option<PathBuf> {
        match self.store.push(frame) {
            Ok(path) => Some(path),
            Err(e) => {
                self.handle.stats.write().store_failures += 1;
                error!(sequence = frame.sequence(), error = %e, "Failed to store frame");
                None
            }
        }
    }

    async fn raise(&self, reason: OutOfServiceReason, sequence: Option<u64>) {
        warn!(zone = self.settings.zone, reason = %reason, "Raising out-of-service signal");
        self.handle.stats.write().signals_raised += 1;
        self.sink
            .raise(OutOfService::new(self.settings.zone, reason, sequence))
            .await;
    }

    async fn capture_loop<S: FrameSource + ?Sized>(&mut self, source: &mut S) {
        let mut monitor = RepeatMonitor::new(
            self.settings.duplicate_repeat_threshold,
            self.settings.frozen_similarity,
            self.store.head(),
        );

        while !self.cancel.is_cancelled() {
            let Some(outcome) = self.run_cycle(source).await else {
                break;
            };
            self.handle.stats.write().cycles += 1;
            self.record(&outcome.result);

            if let Some(repeats) = monitor.observe(self.store.head(), outcome.stored) {
                self.raise(OutOfServiceReason::FrozenFrames { repeats }, outcome.sequence)
                    .await;
            }

            if !self.pause(self.settings.capture_period).await {
                break;
            }
        }
    }

    /// One capture cycle with retries. `None` when cancelled part way.
    async fn run_cycle<S: FrameSource + ?Sized>(&mut self, source: &mut S) -> Option<CycleOutcome> {
        let max_attempts = self.settings.max_retries.saturating_add(1);
        let mut backoff = Constant::new(self.settings.retry_delay);
        let mut last_frame: Option<Frame> = None;
        let mut last_failure = AttemptFailure::Read("no attempt made".to_string());

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                return None;
            }
            if attempt > 1 {
                self.set_state(CaptureState::Retrying);
                let delay = backoff.next_backoff().unwrap_or(self.settings.retry_delay);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying capture");
                if !self.pause(delay).await {
                    return None;
                }
            }

            self.set_state(CaptureState::Capturing);
            let frame = match self.read(source).await? {
                Ok(frame) => frame,
                Err(e) => {
                    self.handle.stats.write().read_failures += 1;
                    warn!(attempt, error = %e, "Frame read failed");
                    last_failure = AttemptFailure::Read(e.to_string());
                    self.note_retry(attempt, max_attempts, &last_failure);
                    continue;
                }
            };

            self.set_state(CaptureState::Evaluating);
            let luma = frame.luma();
            let metrics = QualityMetrics::measure(&luma);
            let verdict = self
                .classifier
                .classify(&metrics, &self.baseline.snapshot());
            let cold_start = verdict == Verdict::ColdStart;

            match verdict {
                Verdict::Accepted | Verdict::ColdStart => {
                    self.set_state(CaptureState::Accepted);
                    let path = self.persist(&frame);
                    self.baseline.update(metrics);
                    {
                        let mut stats = self.handle.stats.write();
                        stats.accepted += 1;
                        stats.last_accepted_at = Some(frame.captured_at());
                    }
                    debug!(
                        sequence = frame.sequence(),
                        attempt,
                        cold_start,
                        path = ?path,
                        "Frame accepted"
                    );
                    let stored = path.is_some().then_some(luma);
                    return Some(CycleOutcome {
                        result: CaptureResult::Accepted { metrics, path },
                        stored,
                        sequence: Some(frame.sequence()),
                    });
                }
                Verdict::Anomalous(flags) => {
                    self.handle.stats.write().anomalies += 1;
                    for flag in &flags {
                        warn!(
                            sequence = frame.sequence(),
                            attempt,
                            metric = %flag.metric,
                            value = flag.value,
                            lower = flag.lower,
                            upper = flag.upper,
                            "Anomalous frame"
                        );
                    }
                    last_failure = AttemptFailure::Anomalous { metrics, flags };
                    last_frame = Some(frame);
                    self.note_retry(attempt, max_attempts, &last_failure);
                }
            }
        }

        self.set_state(CaptureState::Failed);
        let sequence = last_frame.as_ref().map(Frame::sequence);
        let (path, stored) = match &last_frame {
            Some(frame) => match self.persist(frame) {
                Some(path) => (Some(path), Some(frame.luma())),
                None => (None, None),
            },
            None => (None, None),
        };
        error!(
            attempts = max_attempts,
            path = ?path,
            "Capture attempts exhausted"
        );
        self.raise(
            OutOfServiceReason::RetriesExhausted {
                flags: last_failure.flags(),
            },
            sequence,
        )
        .await;

        Some(CycleOutcome {
            result: CaptureResult::Failed {
                reason: last_failure,
                path,
            },
            stored,
            sequence,
        })
    }

    fn note_retry(&self, attempt: u32, max_attempts: u32, failure: &AttemptFailure) {
        if attempt < max_attempts {
            self.record(&CaptureResult::Retried {
                attempt,
                reason: failure.clone(),
            });
        }
    }

    /// Validate the sensor against the reference before the main loop.
    ///
    /// Passing frames are stored and seed the baseline. A frame that keeps
    /// failing ends calibration with a signal; the main loop starts anyway.
    async fn calibrate<S: FrameSource + ?Sized>(&mut self, source: &mut S, calibration: &Calibration) {
        info!(frames = calibration.frames, "Calibrating against reference");
        let max_attempts = calibration.max_retries.saturating_add(1);

        for index in 0..calibration.frames {
            if index > 0 && !self.pause(calibration.interval).await {
                return;
            }

            let mut backoff = Constant::new(calibration.retry_delay);
            let mut last_frame: Option<Frame> = None;
            let mut last_flags = Vec::new();
            let mut passed = false;

            for attempt in 1..=max_attempts {
                if attempt > 1 {
                    let delay = backoff.next_backoff().unwrap_or(calibration.retry_delay);
                    if !self.pause(delay).await {
                        return;
                    }
                }

                self.set_state(CaptureState::Capturing);
                let frame = match self.read(source).await {
                    None => return,
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        self.handle.stats.write().read_failures += 1;
                        warn!(index, attempt, error = %e, "Calibration read failed");
                        continue;
                    }
                };

                self.set_state(CaptureState::Evaluating);
                let metrics = QualityMetrics::from_frame(&frame);
                match calibration.profile.check(&metrics) {
                    Verdict::Anomalous(flags) => {
                        self.handle.stats.write().anomalies += 1;
                        debug!(index, attempt, flagged = flags.len(), "Calibration frame rejected");
                        last_flags = flags;
                        last_frame = Some(frame);
                    }
                    _ => {
                        self.persist(&frame);
                        self.baseline.update(metrics);
                        self.handle.stats.write().calibrated += 1;
                        debug!(index, attempt, sequence = frame.sequence(), "Calibration frame passed");
                        passed = true;
                        break;
                    }
                }
            }

            if !passed {
                let sequence = last_frame.as_ref().map(Frame::sequence);
                if let Some(frame) = &last_frame {
                    self.persist(frame);
                }
                for flag in &last_flags {
                    warn!(metric = %flag.metric, value = flag.value, "Reference check failed");
                }
                self.raise(
                    OutOfServiceReason::CalibrationFailed { flags: last_flags },
                    sequence,
                )
                .await;
                return;
            }
        }

        info!(
            calibrated = self.handle.stats().calibrated,
            "Calibration complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ReferenceRule, ReferenceTolerance};
    use crate::signals::ChannelSink;
    use async_trait::async_trait;
    use image::{Luma, Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio::time::Instant;

    #[derive(Clone)]
    enum Step {
        Frame(RgbImage),
        Fail,
    }

    /// Plays a fixed script of reads; the last step repeats forever.
    struct ScriptedSource {
        script: Vec<Step>,
        reads: usize,
        fail_open: bool,
        open: bool,
        closes: Arc<AtomicUsize>,
        /// Cancel this token when the given read number is reached
        cancel_at: Option<(usize, CancellationToken)>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Step>) -> (Self, Arc<AtomicUsize>) {
            let closes = Arc::new(AtomicUsize::new(0));
            let source = Self {
                script,
                reads: 0,
                fail_open: false,
                open: false,
                closes: closes.clone(),
                cancel_at: None,
            };
            (source, closes)
        }

        fn cancel_on_read(mut self, read: usize, token: CancellationToken) -> Self {
            self.cancel_at = Some((read, token));
            self
        }
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn open(&mut self, _device_index: u32) -> Result<(), SourceError> {
            if self.fail_open {
                return Err(SourceError::DeviceOpen {
                    device: "scripted".to_string(),
                    reason: "no such device".to_string(),
                });
            }
            self.open = true;
            Ok(())
        }

        async fn read_frame(&mut self) -> Result<Frame, SourceError> {
            self.reads += 1;
            if let Some((at, token)) = &self.cancel_at {
                if self.reads >= *at {
                    token.cancel();
                }
            }
            let index = (self.reads - 1).min(self.script.len() - 1);
            match &self.script[index] {
                Step::Frame(image) => Ok(Frame::new(image.clone(), self.reads as u64 - 1)),
                Step::Fail => Err(SourceError::FrameRead("scripted failure".to_string())),
            }
        }

        fn close(&mut self) {
            self.open = false;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    fn noise(seed: u32) -> RgbImage {
        let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        RgbImage::from_fn(32, 24, |_, _| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let v = (state >> 16) as u8;
            Rgb([v, v, v])
        })
    }

    fn black() -> RgbImage {
        RgbImage::new(32, 24)
    }

    fn settings() -> CaptureSettings {
        CaptureSettings {
            device_index: 0,
            zone: 7,
            capture_period: Duration::from_millis(5),
            max_retries: 2,
            retry_delay: Duration::from_millis(5),
            duplicate_repeat_threshold: 3,
            frozen_similarity: 0.9999,
        }
    }

    struct Harness {
        dir: TempDir,
        signals: mpsc::Receiver<OutOfService>,
        cancel: CancellationToken,
    }

    fn orchestrator(
        source: ScriptedSource,
        settings: CaptureSettings,
    ) -> (CaptureOrchestrator<ScriptedSource>, Harness) {
        let dir = TempDir::new().unwrap();
        let store = PhotoStore::open(dir.path(), 5).unwrap();
        let (sink, signals) = ChannelSink::channel(64);
        let cancel = CancellationToken::new();
        let orchestrator = CaptureOrchestrator::new(source, store, settings, cancel.clone())
            .with_status_sink(Arc::new(sink));
        (
            orchestrator,
            Harness {
                dir,
                signals,
                cancel,
            },
        )
    }

    async fn wait_for(handle: &CaptureHandle, condition: impl Fn(&CaptureStats) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition(&handle.stats()) {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn finish(
        task: JoinHandle<Result<CaptureStats, CaptureError>>,
    ) -> Result<CaptureStats, CaptureError> {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("orchestrator did not stop")
            .unwrap()
    }

    fn drain(signals: &mut mpsc::Receiver<OutOfService>) -> Vec<OutOfService> {
        let mut out = Vec::new();
        while let Ok(signal) = signals.try_recv() {
            out.push(signal);
        }
        out
    }

    #[tokio::test]
    async fn test_accepted_frames_are_stored() {
        let (source, closes) =
            ScriptedSource::new((0..20).map(|i| Step::Frame(noise(i))).collect());
        let (orchestrator, mut harness) = orchestrator(source, settings());
        let orchestrator = orchestrator.with_baseline(BaselineTracker::new(50, 50));
        let handle = orchestrator.handle();

        let task = tokio::spawn(orchestrator.run());
        wait_for(&handle, |s| s.accepted >= 3).await;
        handle.stop();
        let stats = finish(task).await.unwrap();

        assert!(stats.accepted >= 3);
        assert_eq!(stats.anomalies, 0);
        assert!(matches!(
            handle.last_result(),
            Some(CaptureResult::Accepted { path: Some(_), .. })
        ));
        assert!(harness.dir.path().join("000.png").exists());
        assert!(harness.dir.path().join("002.png").exists());
        assert!(drain(&mut harness.signals).is_empty());
        assert_eq!(handle.state(), CaptureState::Stopped);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_store_last_frame_and_signal() {
        let mut script: Vec<Step> = (0..3).map(|i| Step::Frame(noise(i))).collect();
        script.push(Step::Frame(black()));
        let (source, _closes) = ScriptedSource::new(script);
        let (orchestrator, mut harness) = orchestrator(source, settings());
        let handle = orchestrator.handle();

        let task = tokio::spawn(orchestrator.run());
        wait_for(&handle, |s| s.signals_raised >= 1).await;
        handle.stop();
        let stats = finish(task).await.unwrap();

        assert_eq!(stats.accepted, 3);
        assert!(stats.anomalies >= 3);

        let first = harness.signals.recv().await.unwrap();
        assert_eq!(first.count, 0);
        assert_eq!(first.zone, 7);
        let OutOfServiceReason::RetriesExhausted { flags } = first.reason else {
            panic!("expected retries exhausted, got {:?}", first.reason);
        };
        assert!(flags
            .iter()
            .any(|f| f.metric == crate::metrics::Metric::Brightness));

        // the forensic copy of the black frame went to the next slot
        let stored = QualityMetrics::from_path(&harness.dir.path().join("003.png")).unwrap();
        assert_eq!(stored.brightness, 0.0);
    }

    #[tokio::test]
    async fn test_unchanged_store_signals_once_then_resets() {
        let cancel_token = CancellationToken::new();
        let (source, _closes) = ScriptedSource::new(vec![Step::Fail]);
        // one read per cycle with no retries; cancel during the fourth cycle
        let source = source.cancel_on_read(4, cancel_token.clone());
        let mut settings = settings();
        settings.max_retries = 0;

        let dir = TempDir::new().unwrap();
        let store = PhotoStore::open(dir.path(), 5).unwrap();
        let (sink, mut signals) = ChannelSink::channel(64);
        let orchestrator = CaptureOrchestrator::new(source, store, settings, cancel_token)
            .with_status_sink(Arc::new(sink));

        finish(tokio::spawn(orchestrator.run())).await.unwrap();

        let frozen: Vec<OutOfService> = drain(&mut signals)
            .into_iter()
            .filter(|s| matches!(s.reason, OutOfServiceReason::FrozenFrames { .. }))
            .collect();
        assert_eq!(frozen.len(), 1);
        assert_eq!(frozen[0].count, 0);
        assert_eq!(
            frozen[0].reason,
            OutOfServiceReason::FrozenFrames { repeats: 3 }
        );
    }

    #[tokio::test]
    async fn test_identical_frames_count_as_frozen() {
        let (source, _closes) = ScriptedSource::new(vec![Step::Frame(noise(1))]);
        let (orchestrator, harness) = orchestrator(source, settings());
        let Harness {
            dir: _dir,
            mut signals,
            cancel,
        } = harness;
        // stored frames: 1 is the reference, 2..4 repeat, signal on 4
        let orchestrator = orchestrator.with_baseline(BaselineTracker::new(50, 50));
        let handle = orchestrator.handle();

        let task = tokio::spawn(orchestrator.run());
        let signal = tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .unwrap()
            .unwrap();
        cancel.cancel();
        finish(task).await.unwrap();

        assert_eq!(signal.reason, OutOfServiceReason::FrozenFrames { repeats: 3 });
        assert!(handle.stats().accepted >= 4);
    }

    #[tokio::test]
    async fn test_cancel_during_retry_delay_stops_promptly() {
        let (source, closes) = ScriptedSource::new(vec![Step::Fail]);
        let mut settings = settings();
        settings.max_retries = 100;
        settings.retry_delay = Duration::from_millis(500);
        let (orchestrator, _harness) = orchestrator(source, settings);
        let handle = orchestrator.handle();

        let task = tokio::spawn(orchestrator.run());
        wait_for(&handle, |s| s.read_failures >= 1).await;
        assert_eq!(handle.state(), CaptureState::Retrying);

        let started = Instant::now();
        handle.stop();
        finish(task).await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(handle.state(), CaptureState::Stopped);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_device_open_failure_is_fatal() {
        let (mut source, closes) = ScriptedSource::new(vec![Step::Fail]);
        source.fail_open = true;
        let (orchestrator, _harness) = orchestrator(source, settings());
        let handle = orchestrator.handle();

        let result = orchestrator.run().await;
        assert!(matches!(result, Err(CaptureError::DeviceOpen(_))));
        assert_eq!(handle.state(), CaptureState::Failed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_never_opens() {
        let (source, closes) = ScriptedSource::new(vec![Step::Fail]);
        let (orchestrator, harness) = orchestrator(source, settings());
        harness.cancel.cancel();

        let handle = orchestrator.handle();
        orchestrator.run().await.unwrap();
        assert_eq!(handle.state(), CaptureState::Stopped);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    fn calibration(reference: &RgbImage, frames: u32) -> Calibration {
        let metrics = QualityMetrics::measure(&image::imageops::grayscale(reference));
        Calibration {
            profile: ReferenceProfile::new(
                metrics,
                ReferenceRule::Outside,
                ReferenceTolerance::default(),
            ),
            frames,
            interval: Duration::from_millis(1),
            max_retries: 1,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_calibration_seeds_baseline() {
        // metrics within tolerance of the reference only hold for the same image
        let (source, _closes) = ScriptedSource::new(vec![Step::Frame(noise(0))]);
        let (orchestrator, harness) = orchestrator(source, settings());
        let orchestrator = orchestrator
            .with_baseline(BaselineTracker::new(10, 3))
            .with_calibration(calibration(&noise(0), 3));
        let handle = orchestrator.handle();

        let task = tokio::spawn(orchestrator.run());
        wait_for(&handle, |s| s.cycles >= 1).await;
        harness.cancel.cancel();
        let stats = finish(task).await.unwrap();

        assert_eq!(stats.calibrated, 3);
        assert!(harness.dir.path().join("002.png").exists());
    }

    #[tokio::test]
    async fn test_failed_calibration_is_not_fatal() {
        let mut script = vec![Step::Frame(black()), Step::Frame(black())];
        script.extend((0..30).map(|i| Step::Frame(noise(i))));
        let (source, _closes) = ScriptedSource::new(script);
        let (orchestrator, mut harness) = orchestrator(source, settings());
        let orchestrator = orchestrator
            .with_baseline(BaselineTracker::new(50, 50))
            .with_calibration(calibration(&noise(0), 3));
        let handle = orchestrator.handle();

        let task = tokio::spawn(orchestrator.run());
        wait_for(&handle, |s| s.cycles >= 2).await;
        harness.cancel.cancel();
        let stats = finish(task).await.unwrap();

        assert_eq!(stats.calibrated, 0);
        assert!(stats.accepted >= 2);

        let first = harness.signals.recv().await.unwrap();
        assert!(matches!(
            first.reason,
            OutOfServiceReason::CalibrationFailed { ref flags } if !flags.is_empty()
        ));
        // the rejected frame was kept for inspection
        assert!(harness.dir.path().join("000.png").exists());
    }

    #[test]
    fn test_repeat_monitor_counts_unchanged_head() {
        let mut monitor = RepeatMonitor::new(3, 0.9999, 0);
        assert_eq!(monitor.observe(0, None), None);
        assert_eq!(monitor.observe(0, None), None);
        assert_eq!(monitor.observe(0, None), Some(3));
        assert_eq!(monitor.repeats, 0);
        assert_eq!(monitor.observe(0, None), None);
    }

    #[test]
    fn test_repeat_monitor_resets_on_progress() {
        let mut monitor = RepeatMonitor::new(3, 0.9999, 0);
        let a = GrayImage::from_fn(16, 16, |x, y| Luma([((x * 16 + y) % 256) as u8]));
        let b = GrayImage::from_fn(16, 16, |x, y| Luma([((y * 37 + x * 11) % 256) as u8]));

        assert_eq!(monitor.observe(0, None), None);
        assert_eq!(monitor.observe(0, None), None);
        assert_eq!(monitor.observe(1, Some(a.clone())), None);
        assert_eq!(monitor.repeats, 0);

        // same content stored again counts as frozen
        assert_eq!(monitor.observe(2, Some(a.clone())), None);
        assert_eq!(monitor.repeats, 1);
        assert_eq!(monitor.observe(3, Some(b)), None);
        assert_eq!(monitor.repeats, 0);
    }
}
