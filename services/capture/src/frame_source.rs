//! Frame sources and scoped device ownership.
//!
//! A [`FrameSource`] owns one device handle. The orchestrator never calls
//! `open` directly; it goes through [`DeviceGuard::open`], whose `Drop`
//! releases the device on every exit path including task cancellation.

use crate::frame::Frame;
use async_trait::async_trait;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur while acquiring or reading a device.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The device could not be opened; fatal for the orchestrator.
    #[error("Failed to open device {device}: {reason}")]
    DeviceOpen { device: String, reason: String },

    /// A single read failed; the caller may retry.
    #[error("Failed to read frame: {0}")]
    FrameRead(String),
}

impl SourceError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::DeviceOpen { .. })
    }
}

/// A device that produces frames on demand.
///
/// Implementations allow at most one open handle and no concurrent reads;
/// `&mut self` on every operation enforces both.
#[async_trait]
pub trait FrameSource: Send {
    /// Acquire the device.
    async fn open(&mut self, device_index: u32) -> Result<(), SourceError>;

    /// Read one frame from an open device.
    async fn read_frame(&mut self) -> Result<Frame, SourceError>;

    /// Release the device. Safe to call any number of times.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

#[async_trait]
impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    async fn open(&mut self, device_index: u32) -> Result<(), SourceError> {
        (**self).open(device_index).await
    }

    async fn read_frame(&mut self) -> Result<Frame, SourceError> {
        (**self).read_frame().await
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

/// An open device that is closed when the guard goes out of scope.
pub struct DeviceGuard<'a, S: FrameSource + ?Sized> {
    source: &'a mut S,
}

impl<'a, S: FrameSource + ?Sized> DeviceGuard<'a, S> {
    /// Open `source` and tie its lifetime to the returned guard.
    ///
    /// The source is closed even when opening fails, so partially acquired
    /// resources are released.
    pub async fn open(source: &'a mut S, device_index: u32) -> Result<Self, SourceError> {
        let opened = source.open(device_index).await;
        match opened {
            Ok(()) => Ok(Self { source }),
            Err(e) => {
                source.close();
                Err(e)
            }
        }
    }
}

impl<S: FrameSource + ?Sized> Deref for DeviceGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.source
    }
}

impl<S: FrameSource + ?Sized> DerefMut for DeviceGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.source
    }
}

impl<S: FrameSource + ?Sized> Drop for DeviceGuard<'_, S> {
    fn drop(&mut self) {
        self.source.close();
    }
}

const REPLAY_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Replays a directory of recorded images as if it were a camera.
///
/// Files are read in name order. With `looping` the sequence wraps around,
/// otherwise reading past the last file is a read error.
#[derive(Debug)]
pub struct ReplaySource {
    directory: PathBuf,
    looping: bool,
    resolution: Option<(u32, u32)>,
    files: Vec<PathBuf>,
    cursor: usize,
    sequence: u64,
    open: bool,
}

impl ReplaySource {
    pub fn new(directory: impl Into<PathBuf>, looping: bool) -> Self {
        Self {
            directory: directory.into(),
            looping,
            resolution: None,
            files: Vec::new(),
            cursor: 0,
            sequence: 0,
            open: false,
        }
    }

    /// Resize every frame to `width`×`height`, mimicking a fixed-resolution device.
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some((width, height));
        self
    }

    fn device_name(&self) -> String {
        self.directory.display().to_string()
    }

    fn list_images(directory: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(directory)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && has_image_extension(path))
            .collect();
        files.sort();
        Ok(files)
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            REPLAY_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

#[async_trait]
impl FrameSource for ReplaySource {
    async fn open(&mut self, device_index: u32) -> Result<(), SourceError> {
        let files = Self::list_images(&self.directory).map_err(|e| SourceError::DeviceOpen {
            device: self.device_name(),
            reason: e.to_string(),
        })?;

        if files.is_empty() {
            return Err(SourceError::DeviceOpen {
                device: self.device_name(),
                reason: "no image files found".to_string(),
            });
        }

        info!(
            directory = %self.directory.display(),
            device_index,
            files = files.len(),
            looping = self.looping,
            "Replay source opened"
        );

        self.files = files;
        self.cursor = 0;
        self.open = true;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Frame, SourceError> {
        if !self.open {
            return Err(SourceError::FrameRead("source is not open".to_string()));
        }

        if self.cursor >= self.files.len() {
            if !self.looping {
                return Err(SourceError::FrameRead("end of replay".to_string()));
            }
            debug!("Replay wrapped around");
            self.cursor = 0;
        }

        let path = self.files[self.cursor].clone();
        self.cursor += 1;

        let resolution = self.resolution;
        let decoded = tokio::task::spawn_blocking(move || -> Result<RgbImage, String> {
            let image = image::open(&path)
                .map_err(|e| format!("{}: {}", path.display(), e))?
                .to_rgb8();
            Ok(match resolution {
                Some((w, h)) if image.dimensions() != (w, h) => {
                    imageops::resize(&image, w, h, FilterType::Triangle)
                }
                _ => image,
            })
        })
        .await
        .map_err(|e| SourceError::FrameRead(e.to_string()))?
        .map_err(SourceError::FrameRead)?;

        let sequence = self.sequence;
        self.sequence += 1;
        Ok(Frame::new(decoded, sequence))
    }

    fn close(&mut self) {
        if self.open {
            debug!(directory = %self.directory.display(), "Replay source closed");
        }
        self.open = false;
        self.files.clear();
        self.cursor = 0;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write_image(dir: &Path, name: &str, value: u8) {
        RgbImage::from_pixel(8, 6, Rgb([value, value, value]))
            .save(dir.join(name))
            .unwrap();
    }

    fn recording() -> TempDir {
        let dir = TempDir::new().unwrap();
        write_image(dir.path(), "b.png", 20);
        write_image(dir.path(), "a.png", 10);
        write_image(dir.path(), "c.jpg", 30);
        std::fs::write(dir.path().join("README"), b"not an image").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_replay_reads_in_name_order() {
        let dir = recording();
        let mut source = ReplaySource::new(dir.path(), false);
        source.open(0).await.unwrap();

        let first = source.read_frame().await.unwrap();
        let second = source.read_frame().await.unwrap();
        assert_eq!(first.image().get_pixel(0, 0).0[0], 10);
        assert_eq!(second.image().get_pixel(0, 0).0[0], 20);
        assert_eq!(first.sequence(), 0);
        assert_eq!(second.sequence(), 1);

        source.read_frame().await.unwrap();
        assert!(matches!(
            source.read_frame().await,
            Err(SourceError::FrameRead(_))
        ));
    }

    #[tokio::test]
    async fn test_replay_loops() {
        let dir = recording();
        let mut source = ReplaySource::new(dir.path(), true);
        source.open(0).await.unwrap();

        for _ in 0..3 {
            source.read_frame().await.unwrap();
        }
        let wrapped = source.read_frame().await.unwrap();
        assert_eq!(wrapped.image().get_pixel(0, 0).0[0], 10);
        assert_eq!(wrapped.sequence(), 3);
    }

    #[tokio::test]
    async fn test_replay_resizes_to_configured_resolution() {
        let dir = recording();
        let mut source = ReplaySource::new(dir.path(), true).with_resolution(4, 3);
        source.open(0).await.unwrap();

        let frame = source.read_frame().await.unwrap();
        assert_eq!((frame.width(), frame.height()), (4, 3));
    }

    #[tokio::test]
    async fn test_open_fails_for_missing_or_empty_directory() {
        let dir = TempDir::new().unwrap();

        let mut empty = ReplaySource::new(dir.path(), true);
        let err = empty.open(0).await.unwrap_err();
        assert!(err.is_fatal());

        let mut missing = ReplaySource::new(dir.path().join("absent"), true);
        assert!(matches!(
            missing.open(0).await,
            Err(SourceError::DeviceOpen { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_before_open_fails() {
        let dir = recording();
        let mut source = ReplaySource::new(dir.path(), true);
        let err = source.read_frame().await.unwrap_err();
        assert!(!err.is_fatal());
    }

    /// Counts `close` calls so guard behavior can be observed.
    struct CountingSource {
        fail_open: bool,
        open: bool,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FrameSource for CountingSource {
        async fn open(&mut self, _device_index: u32) -> Result<(), SourceError> {
            if self.fail_open {
                return Err(SourceError::DeviceOpen {
                    device: "test".to_string(),
                    reason: "busy".to_string(),
                });
            }
            self.open = true;
            Ok(())
        }

        async fn read_frame(&mut self) -> Result<Frame, SourceError> {
            Ok(Frame::new(RgbImage::new(2, 2), 0))
        }

        fn close(&mut self) {
            self.open = false;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    #[tokio::test]
    async fn test_guard_closes_on_drop() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut source = CountingSource {
            fail_open: false,
            open: false,
            closes: closes.clone(),
        };

        {
            let mut guard = DeviceGuard::open(&mut source, 0).await.unwrap();
            assert!(guard.is_open());
            guard.read_frame().await.unwrap();
        }

        assert!(!source.is_open());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guard_closes_when_open_fails() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut source = CountingSource {
            fail_open: true,
            open: false,
            closes: closes.clone(),
        };

        assert!(DeviceGuard::open(&mut source, 0).await.is_err());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_boxed_source_delegates() {
        let dir = recording();
        let mut source: Box<dyn FrameSource> = Box::new(ReplaySource::new(dir.path(), true));
        source.open(0).await.unwrap();
        assert!(source.is_open());
        source.close();
        source.close();
        assert!(!source.is_open());
    }
}
