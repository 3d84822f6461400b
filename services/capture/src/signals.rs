//! Out-of-service signalling.
//!
//! The capture loop never delivers reports itself. It hands an
//! [`OutOfService`] to a [`StatusSink`], and whatever sits behind the sink
//! (a log, a channel feeding an HTTP reporter) takes it from there.

use crate::classifier::MetricFlag;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Why the sensor is no longer trusted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutOfServiceReason {
    /// Every attempt in a cycle was anomalous or failed to read
    RetriesExhausted { flags: Vec<MetricFlag> },
    /// The stored frame stopped changing
    FrozenFrames { repeats: u32 },
    /// A startup frame could not match the reference image
    CalibrationFailed { flags: Vec<MetricFlag> },
}

impl fmt::Display for OutOfServiceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutOfServiceReason::RetriesExhausted { flags } => {
                write!(f, "retries exhausted ({} metric flags)", flags.len())
            }
            OutOfServiceReason::FrozenFrames { repeats } => {
                write!(f, "frame unchanged for {repeats} cycles")
            }
            OutOfServiceReason::CalibrationFailed { flags } => {
                write!(f, "calibration failed ({} metric flags)", flags.len())
            }
        }
    }
}

/// Signal that the camera of a zone cannot be trusted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutOfService {
    pub zone: u32,
    pub reason: OutOfServiceReason,
    /// Person count reported alongside the signal; always zero
    pub count: u32,
    pub raised_at: DateTime<Utc>,
    /// Sequence of the last frame read, if any
    pub sequence: Option<u64>,
}

impl OutOfService {
    pub fn new(zone: u32, reason: OutOfServiceReason, sequence: Option<u64>) -> Self {
        Self {
            zone,
            reason,
            count: 0,
            raised_at: Utc::now(),
            sequence,
        }
    }
}

/// Receiver of out-of-service signals.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn raise(&self, signal: OutOfService);
}

/// Writes signals to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl StatusSink for LogSink {
    async fn raise(&self, signal: OutOfService) {
        error!(
            zone = signal.zone,
            reason = %signal.reason,
            sequence = ?signal.sequence,
            raised_at = %signal.raised_at,
            "Camera out of service"
        );
    }
}

/// Forwards signals into a bounded channel without waiting.
///
/// A full or closed channel drops the signal with a warning; the capture loop
/// is never held up by a slow consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<OutOfService>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<OutOfService>) -> Self {
        Self { sender }
    }

    /// Create a sink and the receiving end of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutOfService>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl StatusSink for ChannelSink {
    async fn raise(&self, signal: OutOfService) {
        match self.sender.try_send(signal) {
            Ok(()) => debug!("Out-of-service signal queued"),
            Err(mpsc::error::TrySendError::Full(signal)) => {
                warn!(zone = signal.zone, "Status channel full, signal dropped");
            }
            Err(mpsc::error::TrySendError::Closed(signal)) => {
                warn!(zone = signal.zone, "Status channel closed, signal dropped");
            }
        }
    }
}
