//! Configuration management for the capture service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use crate::classifier::{BandMode, ReferenceRule, ReferenceTolerance};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the capture service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureServiceConfig {
    /// Camera device configuration
    #[serde(default)]
    pub camera: CameraConfig,

    /// Capture loop timing and retry policy
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Rolling baseline configuration
    #[serde(default)]
    pub baseline: BaselineConfig,

    /// Anomaly band configuration
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Startup calibration against a reference image
    #[serde(default)]
    pub calibration: CalibrationConfig,

    /// Photo ring buffer configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A V4L2 camera opened through GStreamer
    Device,
    /// A directory of recorded images
    Replay,
}

/// Camera device configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Frame source backend
    #[serde(default = "default_source")]
    pub source: SourceKind,

    /// Camera index (maps to /dev/video{index})
    #[serde(default)]
    pub device_index: u32,

    /// Capture width in pixels
    #[serde(default = "default_width")]
    pub width: u32,

    /// Capture height in pixels
    #[serde(default = "default_height")]
    pub height: u32,

    /// Time allowed for the device to start streaming, in milliseconds
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Time allowed for a single frame read, in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Directory of images used by the replay source
    #[serde(default)]
    pub replay_dir: Option<PathBuf>,

    /// Whether the replay source wraps around at the end of the directory
    #[serde(default = "default_true")]
    pub replay_loop: bool,

    /// Zone identifier attached to out-of-service signals
    #[serde(default = "default_zone")]
    pub zone: u32,
}

/// Capture loop timing and retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Time between capture cycles in milliseconds
    #[serde(default = "default_capture_period_ms")]
    pub capture_period_ms: u64,

    /// Extra attempts after an anomalous or failed read
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Consecutive stuck cycles before an out-of-service signal
    #[serde(default = "default_duplicate_repeat_threshold")]
    pub duplicate_repeat_threshold: u32,

    /// Similarity at or above which a new frame counts as frozen
    #[serde(default = "default_frozen_similarity")]
    pub frozen_similarity: f64,
}

/// Rolling baseline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BaselineConfig {
    /// Maximum number of accepted frames kept (K)
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Samples required before classification starts
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

/// Anomaly band configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Band shape: "sigma" or "percentile"
    #[serde(default = "default_band")]
    pub band: String,

    /// Multiplier m for mean ± m·std
    #[serde(default = "default_sigma_multiplier")]
    pub sigma_multiplier: f64,

    /// Lower percentile for the percentile band
    #[serde(default = "default_percentile_low")]
    pub percentile_low: f64,

    /// Upper percentile for the percentile band
    #[serde(default = "default_percentile_high")]
    pub percentile_high: f64,
}

/// Startup calibration configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationConfig {
    /// Reference image; calibration is skipped when unset
    #[serde(default)]
    pub reference_image: Option<PathBuf>,

    /// Number of frames validated before the main loop
    #[serde(default = "default_calibration_frames")]
    pub frames: u32,

    /// Spacing between calibration frames in milliseconds
    #[serde(default = "default_calibration_interval_ms")]
    pub interval_ms: u64,

    /// Extra attempts for a frame that fails the reference check
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between calibration attempts in milliseconds
    #[serde(default = "default_calibration_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Comparison rule against the reference
    #[serde(default)]
    pub rule: ReferenceRule,

    /// Per-metric tolerances
    #[serde(default)]
    pub tolerance: ReferenceTolerance,
}

/// Photo ring buffer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the slot files
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Number of slots
    #[serde(default = "default_max_photos")]
    pub max_photos: usize,

    /// Continue numbering after the newest existing slot instead of from 0
    #[serde(default)]
    pub resume: bool,

    /// Delete every slot on startup
    #[serde(default)]
    pub clear_on_start: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to include source code location
    #[serde(default)]
    pub include_location: bool,
}

// Default value functions
fn default_source() -> SourceKind {
    SourceKind::Device
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_open_timeout_ms() -> u64 {
    5000
}
fn default_read_timeout_ms() -> u64 {
    2000
}
fn default_true() -> bool {
    true
}
fn default_zone() -> u32 {
    1
}
fn default_capture_period_ms() -> u64 {
    10_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_duplicate_repeat_threshold() -> u32 {
    3
}
fn default_frozen_similarity() -> f64 {
    0.9999
}
fn default_window_size() -> usize {
    10
}
fn default_min_samples() -> usize {
    3
}
fn default_band() -> String {
    "sigma".to_string()
}
fn default_sigma_multiplier() -> f64 {
    3.0
}
fn default_percentile_low() -> f64 {
    10.0
}
fn default_percentile_high() -> f64 {
    90.0
}
fn default_calibration_frames() -> u32 {
    10
}
fn default_calibration_interval_ms() -> u64 {
    1000
}
fn default_calibration_retry_delay_ms() -> u64 {
    250
}
fn default_directory() -> PathBuf {
    PathBuf::from("capture_log")
}
fn default_max_photos() -> usize {
    100
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            device_index: 0,
            width: default_width(),
            height: default_height(),
            open_timeout_ms: default_open_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            replay_dir: None,
            replay_loop: true,
            zone: default_zone(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capture_period_ms: default_capture_period_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            duplicate_repeat_threshold: default_duplicate_repeat_threshold(),
            frozen_similarity: default_frozen_similarity(),
        }
    }
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            min_samples: default_min_samples(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            band: default_band(),
            sigma_multiplier: default_sigma_multiplier(),
            percentile_low: default_percentile_low(),
            percentile_high: default_percentile_high(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            reference_image: None,
            frames: default_calibration_frames(),
            interval_ms: default_calibration_interval_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_calibration_retry_delay_ms(),
            rule: ReferenceRule::default(),
            tolerance: ReferenceTolerance::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            max_photos: default_max_photos(),
            resume: false,
            clear_on_start: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_location: false,
        }
    }
}

impl CaptureServiceConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with CAPTURE_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. CAPTURE_CAMERA__DEVICE_INDEX=2
            .add_source(
                Environment::with_prefix("CAPTURE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("CAPTURE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.width/height".to_string(),
                message: "Dimensions must be greater than 0".to_string(),
            });
        }

        if self.camera.source == SourceKind::Replay && self.camera.replay_dir.is_none() {
            return Err(ConfigValidationError::MissingField(
                "camera.replay_dir".to_string(),
            ));
        }

        if self.capture.duplicate_repeat_threshold == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.duplicate_repeat_threshold".to_string(),
                message: "Threshold must be at least 1".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.capture.frozen_similarity) {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.frozen_similarity".to_string(),
                message: "Similarity must lie in [0, 1]".to_string(),
            });
        }

        if self.baseline.window_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "baseline.window_size".to_string(),
                message: "Window must hold at least one sample".to_string(),
            });
        }

        if self.baseline.min_samples > self.baseline.window_size {
            return Err(ConfigValidationError::InvalidValue {
                field: "baseline.min_samples".to_string(),
                message: format!(
                    "min_samples ({}) cannot exceed window_size ({})",
                    self.baseline.min_samples, self.baseline.window_size
                ),
            });
        }

        self.classifier.band_mode()?;

        if self.storage.max_photos == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.max_photos".to_string(),
                message: "Store must have at least one slot".to_string(),
            });
        }

        if self.storage.directory.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.directory".to_string(),
            ));
        }

        Ok(())
    }
}

impl CameraConfig {
    /// Get device open timeout as Duration.
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    /// Get frame read timeout as Duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl CaptureConfig {
    /// Get capture period as Duration.
    pub fn capture_period(&self) -> Duration {
        Duration::from_millis(self.capture_period_ms)
    }

    /// Get retry delay as Duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl CalibrationConfig {
    /// Get spacing between calibration frames as Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Get delay between calibration attempts as Duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl ClassifierConfig {
    /// Resolve the configured band shape.
    pub fn band_mode(&self) -> Result<BandMode, ConfigValidationError> {
        match self.band.to_lowercase().as_str() {
            "sigma" => {
                if !self.sigma_multiplier.is_finite() || self.sigma_multiplier <= 0.0 {
                    return Err(ConfigValidationError::InvalidValue {
                        field: "classifier.sigma_multiplier".to_string(),
                        message: "Multiplier must be a positive number".to_string(),
                    });
                }
                Ok(BandMode::Sigma {
                    multiplier: self.sigma_multiplier,
                })
            }
            "percentile" => {
                let (low, high) = (self.percentile_low, self.percentile_high);
                if !(0.0..=100.0).contains(&low) || !(0.0..=100.0).contains(&high) || low >= high
                {
                    return Err(ConfigValidationError::InvalidValue {
                        field: "classifier.percentile_low/high".to_string(),
                        message: format!("Expected 0 <= low < high <= 100, got {low} and {high}"),
                    });
                }
                Ok(BandMode::Percentile { low, high })
            }
            other => Err(ConfigValidationError::InvalidValue {
                field: "classifier.band".to_string(),
                message: format!("Unknown band '{other}', expected sigma or percentile"),
            }),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CaptureServiceConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_replay_requires_directory() {
        let mut config = CaptureServiceConfig::default();
        config.camera.source = SourceKind::Replay;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));

        config.camera.replay_dir = Some(PathBuf::from("recordings"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_dimensions() {
        let mut config = CaptureServiceConfig::default();
        config.camera.height = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_min_samples_cannot_exceed_window() {
        let mut config = CaptureServiceConfig::default();
        config.baseline.window_size = 4;
        config.baseline.min_samples = 5;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_band_mode_resolution() {
        let mut classifier = ClassifierConfig::default();
        assert_eq!(
            classifier.band_mode().unwrap(),
            BandMode::Sigma { multiplier: 3.0 }
        );

        classifier.band = "Percentile".to_string();
        assert_eq!(
            classifier.band_mode().unwrap(),
            BandMode::Percentile {
                low: 10.0,
                high: 90.0
            }
        );

        classifier.percentile_low = 95.0;
        assert!(classifier.band_mode().is_err());

        classifier.band = "median".to_string();
        assert!(classifier.band_mode().is_err());
    }

    #[test]
    fn test_zero_slots_rejected() {
        let mut config = CaptureServiceConfig::default();
        config.storage.max_photos = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_durations() {
        let config = CaptureServiceConfig::default();
        assert_eq!(config.capture.capture_period(), Duration::from_secs(10));
        assert_eq!(config.capture.retry_delay(), Duration::from_secs(1));
        assert_eq!(config.camera.read_timeout(), Duration::from_secs(2));
    }
}
