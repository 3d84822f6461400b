//! Headcount Capture Service
//!
//! Camera capture and image-quality sentinel for the headcount people-counting
//! pipeline. The service decides, frame by frame, whether the camera produced
//! a usable image, keeps a rolling statistical baseline of normal frames,
//! retries degraded captures and raises an out-of-service signal when the
//! sensor can no longer be trusted. Accepted frames land in a fixed-size ring
//! of files that a separately scheduled consumer polls for counting.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────────────────────┐
//! ┌──────────────┐   │ CaptureOrchestrator          │   ┌──────────────┐
//! │ FrameSource  │──▶│  metrics ─▶ AnomalyClassifier│──▶│ PhotoStore   │
//! │ (camera /    │   │               ▲              │   │ 000.png ...  │
//! │  replay)     │   │        BaselineTracker       │   └──────────────┘
//! └──────────────┘   └──────────────┬───────────────┘          │
//!                                   │ OutOfService             │ newest slot
//!                                   ▼                          ▼
//!                            ┌──────────────┐          ┌──────────────┐
//!                            │ StatusSink   │          │ Occupancy    │
//!                            └──────────────┘          │ Poller       │
//!                                                      └──────────────┘
//! ```
//!
//! ## Features
//!
//! - `gstreamer`: enables [`camera::GstCameraSource`], a V4L2 device read
//!   through GStreamer. Without it only the replay source is available.

pub mod baseline;
#[cfg(feature = "gstreamer")]
pub mod camera;
pub mod classifier;
pub mod config;
pub mod frame;
pub mod frame_source;
pub mod metrics;
pub mod occupancy;
pub mod orchestrator;
pub mod photo_store;
pub mod signals;

pub use baseline::{BaselineSnapshot, BaselineStats, BaselineTracker, MetricStats};
#[cfg(feature = "gstreamer")]
pub use camera::GstCameraSource;
pub use classifier::{
    AnomalyClassifier, BandMode, MetricFlag, ReferenceProfile, ReferenceRule,
    ReferenceTolerance, Verdict,
};
pub use config::{CaptureServiceConfig, ConfigValidationError, SourceKind};
pub use frame::Frame;
pub use frame_source::{DeviceGuard, FrameSource, ReplaySource, SourceError};
pub use metrics::{Metric, MetricError, MetricFn, QualityMetrics};
pub use occupancy::{
    ChannelReportSink, LogReportSink, OccupancyPoller, OccupancyReport, PersonCounter,
    PollOutcome, ReportSink,
};
pub use orchestrator::{
    AttemptFailure, Calibration, CaptureError, CaptureHandle, CaptureOrchestrator,
    CaptureResult, CaptureSettings, CaptureState, CaptureStats,
};
pub use photo_store::{PhotoStore, SlotReader, StoreError};
pub use signals::{ChannelSink, LogSink, OutOfService, OutOfServiceReason, StatusSink};
