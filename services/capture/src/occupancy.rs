//! Consumer side of the photo store: poll, count, report.
//!
//! The poller shares nothing with the capture loop except the store
//! directory. Each tick it looks up the newest slot; a slot it has not seen
//! before is handed to a [`PersonCounter`] and the result goes out through a
//! [`ReportSink`]. A directory that stops changing drives its own repeat
//! counter, independent of the orchestrator's, and ends in an
//! out-of-service report with a count of zero.

use crate::photo_store::SlotReader;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Occupancy figure delivered to the reporting collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OccupancyReport {
    pub zone: u32,
    pub count: u32,
    pub timestamp: DateTime<Utc>,
    /// English day name, e.g. "Monday"
    pub weekday: String,
    pub out_of_service: bool,
}

impl OccupancyReport {
    pub fn new(zone: u32, count: u32, out_of_service: bool, timestamp: DateTime<Utc>) -> Self {
        Self {
            zone,
            count,
            weekday: timestamp.format("%A").to_string(),
            timestamp,
            out_of_service,
        }
    }
}

/// Detection collaborator: counts the people in an image.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersonCounter: Send + Sync {
    async fn count(&self, path: &Path) -> anyhow::Result<u32>;
}

/// Reporting collaborator: delivers occupancy reports.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn send(&self, report: OccupancyReport) -> anyhow::Result<()>;
}

/// Writes reports to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReportSink;

#[async_trait]
impl ReportSink for LogReportSink {
    async fn send(&self, report: OccupancyReport) -> anyhow::Result<()> {
        info!(
            zone = report.zone,
            count = report.count,
            weekday = %report.weekday,
            out_of_service = report.out_of_service,
            "Occupancy report"
        );
        Ok(())
    }
}

/// Forwards reports into a channel.
#[derive(Debug, Clone)]
pub struct ChannelReportSink {
    sender: mpsc::Sender<OccupancyReport>,
}

impl ChannelReportSink {
    pub fn new(sender: mpsc::Sender<OccupancyReport>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl ReportSink for ChannelReportSink {
    async fn send(&self, report: OccupancyReport) -> anyhow::Result<()> {
        self.sender
            .send(report)
            .await
            .map_err(|_| anyhow::anyhow!("report channel closed"))
    }
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// A new slot was counted and reported
    Reported(OccupancyReport),
    /// No new slot since the previous poll
    Unchanged { repeats: u32 },
    /// The repeat threshold was reached and a zero-count report sent
    OutOfService(OccupancyReport),
    /// A new slot was found but the counter failed on it
    CounterFailed,
}

/// Polls a photo store directory and reports occupancy.
pub struct OccupancyPoller<C, R> {
    reader: SlotReader,
    counter: C,
    sink: R,
    zone: u32,
    interval: Duration,
    repeat_threshold: u32,
    last_seen: Option<(PathBuf, Option<SystemTime>)>,
    repeats: u32,
}

impl<C: PersonCounter, R: ReportSink> OccupancyPoller<C, R> {
    pub fn new(
        reader: SlotReader,
        counter: C,
        sink: R,
        zone: u32,
        interval: Duration,
        repeat_threshold: u32,
    ) -> Self {
        Self {
            reader,
            counter,
            sink,
            zone,
            interval,
            repeat_threshold: repeat_threshold.max(1),
            last_seen: None,
            repeats: 0,
        }
    }

    pub fn repeats(&self) -> u32 {
        self.repeats
    }

    /// Check the directory once.
    pub async fn poll_once(&mut self) -> PollOutcome {
        let newest = match self.reader.newest_path() {
            Ok(newest) => newest,
            Err(e) => {
                warn!(error = %e, "Failed to scan photo store");
                None
            }
        };

        // a slot rewritten in place keeps its path but not its mtime
        let current = newest.map(|path| {
            let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
            (path, modified)
        });

        match current {
            Some(seen) if self.last_seen.as_ref() != Some(&seen) => {
                self.repeats = 0;
                let path = seen.0.clone();
                self.last_seen = Some(seen);
                self.report_count(&path).await
            }
            _ => self.note_unchanged().await,
        }
    }

    async fn report_count(&mut self, path: &Path) -> PollOutcome {
        let count = match self.counter.count(path).await {
            Ok(count) => count,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Person counter failed");
                return PollOutcome::CounterFailed;
            }
        };

        debug!(path = %path.display(), count, "Counted new slot");
        let report = OccupancyReport::new(self.zone, count, false, Utc::now());
        self.deliver(report.clone()).await;
        PollOutcome::Reported(report)
    }

    async fn note_unchanged(&mut self) -> PollOutcome {
        self.repeats += 1;
        if self.repeats < self.repeat_threshold {
            debug!(repeats = self.repeats, "No new slot");
            return PollOutcome::Unchanged {
                repeats: self.repeats,
            };
        }

        warn!(
            zone = self.zone,
            repeats = self.repeats,
            "Photo store stopped changing"
        );
        self.repeats = 0;
        let report = OccupancyReport::new(self.zone, 0, true, Utc::now());
        self.deliver(report.clone()).await;
        PollOutcome::OutOfService(report)
    }

    async fn deliver(&self, report: OccupancyReport) {
        if let Err(e) = self.sink.send(report).await {
            warn!(error = %e, "Failed to deliver occupancy report");
        }
    }

    /// Poll on the configured interval until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(zone = self.zone, interval_ms = self.interval.as_millis() as u64, "Occupancy poller started");
        while !cancel.is_cancelled() {
            self.poll_once().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!(zone = self.zone, "Occupancy poller stopped");
    }
}
