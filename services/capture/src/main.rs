//! Headcount capture service.
//!
//! Opens the configured frame source, optionally calibrates it against a
//! reference image, then runs the capture loop until Ctrl+C. Accepted frames
//! are written to the photo store directory, where the counting consumer
//! picks them up.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with CAPTURE_)
//!
//! See `config.rs` for detailed configuration options.

use headcount_capture::config::{self, CaptureServiceConfig, SourceKind};
use headcount_capture::{
    AnomalyClassifier, BaselineTracker, Calibration, CaptureHandle, CaptureOrchestrator,
    CaptureSettings, FrameSource, LogSink, PhotoStore, ReplaySource,
};

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "headcount-capture",
        version = env!("CARGO_PKG_VERSION"),
        zone = config.camera.zone,
        source = ?config.camera.source,
        "Starting capture service"
    );

    // Validate configuration
    config.validate()?;

    match run(config).await {
        Ok(()) => {
            info!("Capture service completed successfully");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Capture service failed");
            Err(e)
        }
    }
}

/// Load configuration.
fn load_config() -> anyhow::Result<CaptureServiceConfig> {
    // Try loading from files first, fall back to environment
    let config = CaptureServiceConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        CaptureServiceConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &config::LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("headcount_capture={}", level).parse()?)
        .add_directive("gstreamer=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);
    let with_location = config.include_location;

    if config.format == "json" {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_file(with_location)
                    .with_line_number(with_location),
            )
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(with_location)
                    .with_line_number(with_location),
            )
            .init();
    }

    Ok(())
}

/// Build the frame source selected by configuration.
fn build_source(config: &CaptureServiceConfig) -> anyhow::Result<Box<dyn FrameSource>> {
    match config.camera.source {
        SourceKind::Replay => {
            let directory = config
                .camera
                .replay_dir
                .clone()
                .ok_or_else(|| anyhow::anyhow!("camera.replay_dir is required for replay"))?;
            let source = ReplaySource::new(directory, config.camera.replay_loop)
                .with_resolution(config.camera.width, config.camera.height);
            Ok(Box::new(source))
        }
        #[cfg(feature = "gstreamer")]
        SourceKind::Device => Ok(Box::new(headcount_capture::GstCameraSource::new(
            &config.camera,
        )?)),
        #[cfg(not(feature = "gstreamer"))]
        SourceKind::Device => Err(anyhow::anyhow!(
            "camera.source = \"device\" needs the `gstreamer` feature; rebuild with --features gstreamer or use the replay source"
        )),
    }
}

/// Open the photo store, honouring the resume and clear options.
fn open_store(config: &config::StorageConfig) -> anyhow::Result<PhotoStore> {
    let mut store = if config.resume {
        PhotoStore::resume(&config.directory, config.max_photos)?
    } else {
        PhotoStore::open(&config.directory, config.max_photos)?
    };

    if config.clear_on_start {
        info!(directory = %config.directory.display(), "Clearing photo store");
        store.clear()?;
    }

    Ok(store)
}

/// Wire the orchestrator from configuration and run it until shutdown.
async fn run(config: CaptureServiceConfig) -> anyhow::Result<()> {
    let source = build_source(&config)?;
    let store = open_store(&config.storage)?;

    let cancel = CancellationToken::new();
    let mut orchestrator = CaptureOrchestrator::new(
        source,
        store,
        CaptureSettings::from_config(&config),
        cancel.clone(),
    )
    .with_baseline(BaselineTracker::new(
        config.baseline.window_size,
        config.baseline.min_samples,
    ))
    .with_classifier(AnomalyClassifier::new(config.classifier.band_mode()?))
    .with_status_sink(Arc::new(LogSink));

    if let Some(calibration) = Calibration::from_config(&config.calibration)? {
        orchestrator = orchestrator.with_calibration(calibration);
    }

    let handle = orchestrator.handle();
    let mut capture_task = tokio::spawn(orchestrator.run());

    let stats_task = tokio::spawn(log_stats(handle.clone(), cancel.clone()));

    // Wait for shutdown signal or for the loop to end on its own
    let outcome = tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("Received shutdown signal, initiating graceful shutdown...");
            cancel.cancel();
            (&mut capture_task).await
        }
        result = &mut capture_task => {
            warn!("Capture task exited before shutdown was requested");
            cancel.cancel();
            result
        }
    };

    stats_task.abort();

    let stats = outcome??;
    info!(
        cycles = stats.cycles,
        attempts = stats.attempts,
        accepted = stats.accepted,
        anomalies = stats.anomalies,
        read_failures = stats.read_failures,
        store_failures = stats.store_failures,
        signals_raised = stats.signals_raised,
        calibrated = stats.calibrated,
        "Capture final stats"
    );

    info!("Shutdown complete");
    Ok(())
}

/// Periodically log capture counters.
async fn log_stats(handle: CaptureHandle, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let stats = handle.stats();
        info!(
            state = ?handle.state(),
            cycles = stats.cycles,
            accepted = stats.accepted,
            anomalies = stats.anomalies,
            read_failures = stats.read_failures,
            signals_raised = stats.signals_raised,
            last_accepted_at = ?stats.last_accepted_at,
            "Capture stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_replay_source_from_config() {
        let dir = TempDir::new().unwrap();
        let mut config = CaptureServiceConfig::default();
        config.camera.source = SourceKind::Replay;
        config.camera.replay_dir = Some(dir.path().to_path_buf());

        let source = build_source(&config).unwrap();
        assert!(!source.is_open());
    }

    #[cfg(not(feature = "gstreamer"))]
    #[test]
    fn test_device_source_needs_feature() {
        let config = CaptureServiceConfig::default();
        assert!(build_source(&config).is_err());
    }

    #[test]
    fn test_open_store_clears_on_start() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("000.png"), b"stale").unwrap();

        let storage = config::StorageConfig {
            directory: dir.path().to_path_buf(),
            max_photos: 4,
            resume: false,
            clear_on_start: true,
        };
        let store = open_store(&storage).unwrap();
        assert_eq!(store.occupied_count(), 0);
        assert!(!dir.path().join("000.png").exists());
    }
}
