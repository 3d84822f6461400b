//! V4L2 camera source backed by a GStreamer pipeline.
//!
//! The pipeline converts whatever the device negotiates into packed RGB at the
//! configured resolution and parks the newest frame in an appsink. Frames are
//! pulled on demand; the sink keeps a single buffer and drops older ones, so a
//! read always returns a recent image rather than a queued backlog.

use crate::config::CameraConfig;
use crate::frame::Frame;
use crate::frame_source::{FrameSource, SourceError};
use async_trait::async_trait;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use std::time::Duration;
use tracing::{debug, info, warn};

const BYTES_PER_PIXEL: usize = 3;

/// Camera device read through `v4l2src`.
pub struct GstCameraSource {
    width: u32,
    height: u32,
    open_timeout: Duration,
    read_timeout: Duration,
    device: Option<String>,
    pipeline: Option<gst::Pipeline>,
    appsink: Option<gst_app::AppSink>,
    sequence: u64,
}

impl GstCameraSource {
    /// Create a camera source. GStreamer is initialised here; the device is
    /// not touched until [`FrameSource::open`].
    pub fn new(config: &CameraConfig) -> Result<Self, SourceError> {
        gst::init().map_err(|e| SourceError::DeviceOpen {
            device: "gstreamer".to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            width: config.width,
            height: config.height,
            open_timeout: config.open_timeout(),
            read_timeout: config.read_timeout(),
            device: None,
            pipeline: None,
            appsink: None,
            sequence: 0,
        })
    }

    fn build_pipeline_string(&self, device: &str) -> String {
        format!(
            "v4l2src device={device} \
             ! videoconvert ! videoscale \
             ! video/x-raw,format=RGB,width={width},height={height} \
             ! appsink name=sink sync=false max-buffers=1 drop=true",
            device = device,
            width = self.width,
            height = self.height,
        )
    }

    /// Build the pipeline and wait for it to reach PLAYING.
    fn start_pipeline(
        description: &str,
        device: &str,
        timeout: Duration,
    ) -> Result<(gst::Pipeline, gst_app::AppSink), SourceError> {
        let open_error = |reason: String| SourceError::DeviceOpen {
            device: device.to_string(),
            reason,
        };

        let pipeline = gst::parse::launch(description)
            .map_err(|e| open_error(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| open_error("Failed to cast to Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| open_error("appsink not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| open_error("Could not cast to AppSink".to_string()))?;

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(open_error(e.to_string()));
        }

        let (result, state, pending) =
            pipeline.state(gst::ClockTime::from_mseconds(timeout.as_millis() as u64));
        if !reached_playing(result, state) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(open_error(format!(
                "Pipeline did not reach PLAYING within {:?} (state {:?}, pending {:?})",
                timeout, state, pending
            )));
        }

        Ok((pipeline, appsink))
    }
}

/// Whether a state query reports a pipeline that has settled in PLAYING.
///
/// A query that times out returns `Ok(Async)` with the pipeline still
/// prerolling, which counts as not started.
fn reached_playing(
    result: Result<gst::StateChangeSuccess, gst::StateChangeError>,
    state: gst::State,
) -> bool {
    matches!(
        result,
        Ok(gst::StateChangeSuccess::Success | gst::StateChangeSuccess::NoPreroll)
    ) && state == gst::State::Playing
}

/// Copy a sample into a tightly packed RGB image, dropping row padding.
fn sample_to_image(sample: &gst::Sample) -> Result<RgbImage, SourceError> {
    let read_error = |reason: &str| SourceError::FrameRead(reason.to_string());

    let caps = sample.caps().ok_or_else(|| read_error("sample has no caps"))?;
    let info = gst_video::VideoInfo::from_caps(caps)
        .map_err(|e| SourceError::FrameRead(e.to_string()))?;
    let buffer = sample
        .buffer()
        .ok_or_else(|| read_error("sample has no buffer"))?;
    let map = buffer
        .map_readable()
        .map_err(|_| read_error("buffer not readable"))?;

    let width = info.width() as usize;
    let height = info.height() as usize;
    let stride = info.stride()[0] as usize;
    let row_bytes = width * BYTES_PER_PIXEL;
    let data = map.as_slice();

    if stride < row_bytes || data.len() < stride * (height.saturating_sub(1)) + row_bytes {
        return Err(read_error("buffer smaller than negotiated frame"));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height);
    for row in data.chunks(stride).take(height) {
        pixels.extend_from_slice(&row[..row_bytes]);
    }

    RgbImage::from_raw(info.width(), info.height(), pixels)
        .ok_or_else(|| read_error("pixel buffer size mismatch"))
}

#[async_trait]
impl FrameSource for GstCameraSource {
    async fn open(&mut self, device_index: u32) -> Result<(), SourceError> {
        if self.pipeline.is_some() {
            return Err(SourceError::DeviceOpen {
                device: format!("/dev/video{device_index}"),
                reason: "source already open".to_string(),
            });
        }

        let device = format!("/dev/video{device_index}");
        let description = self.build_pipeline_string(&device);
        debug!(pipeline = %description, "Creating GStreamer pipeline");

        let timeout = self.open_timeout;
        let device_for_task = device.clone();
        let (pipeline, appsink) = tokio::task::spawn_blocking(move || {
            Self::start_pipeline(&description, &device_for_task, timeout)
        })
        .await
        .map_err(|e| SourceError::DeviceOpen {
            device: device.clone(),
            reason: e.to_string(),
        })??;

        info!(
            device = %device,
            width = self.width,
            height = self.height,
            "Camera opened"
        );

        self.device = Some(device);
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Frame, SourceError> {
        let appsink = self
            .appsink
            .clone()
            .ok_or_else(|| SourceError::FrameRead("source is not open".to_string()))?;
        let timeout = gst::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);

        let image = tokio::task::spawn_blocking(move || {
            let sample = appsink.try_pull_sample(timeout).ok_or_else(|| {
                if appsink.is_eos() {
                    SourceError::FrameRead("end of stream".to_string())
                } else {
                    SourceError::FrameRead("timed out waiting for frame".to_string())
                }
            })?;
            sample_to_image(&sample)
        })
        .await
        .map_err(|e| SourceError::FrameRead(e.to_string()))??;

        let sequence = self.sequence;
        self.sequence += 1;
        Ok(Frame::new(image, sequence))
    }

    fn close(&mut self) {
        self.appsink = None;
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(gst::State::Null) {
                warn!(error = %e, "Failed to stop camera pipeline");
            }
            info!(device = ?self.device, "Camera closed");
        }
        self.device = None;
    }

    fn is_open(&self) -> bool {
        self.pipeline.is_some()
    }
}

impl Drop for GstCameraSource {
    fn drop(&mut self) {
        self.close();
    }
}
