//! Captured frame type.

use chrono::{DateTime, Utc};
use image::{GrayImage, RgbImage};

/// A single frame read from a [`FrameSource`](crate::frame_source::FrameSource).
///
/// Owned by the orchestrator until it is handed to the photo store or dropped.
#[derive(Clone)]
pub struct Frame {
    /// RGB pixel data
    image: RgbImage,

    /// Monotonic sequence number assigned by the source
    sequence: u64,

    /// Wall-clock capture time
    captured_at: DateTime<Utc>,
}

impl Frame {
    /// Create a frame stamped with the current time.
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self::with_timestamp(image, sequence, Utc::now())
    }

    pub fn with_timestamp(image: RgbImage, sequence: u64, captured_at: DateTime<Utc>) -> Self {
        Self {
            image,
            sequence,
            captured_at,
        }
    }

    #[inline]
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[inline]
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Luma channel used by every quality metric.
    pub fn luma(&self) -> GrayImage {
        image::imageops::grayscale(&self.image)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("sequence", &self.sequence)
            .field("captured_at", &self.captured_at)
            .finish()
    }
}
