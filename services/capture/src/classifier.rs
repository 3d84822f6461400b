//! Frame classification against the rolling baseline or a fixed reference.

use crate::baseline::{BaselineSnapshot, BaselineStats};
use crate::metrics::{Metric, MetricError, QualityMetrics};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Shape of the acceptance band around the baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BandMode {
    /// mean ± multiplier·std
    Sigma { multiplier: f64 },
    /// Between two percentiles of the window
    Percentile { low: f64, high: f64 },
}

/// One metric that fell outside its band.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricFlag {
    pub metric: Metric,
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
}

impl fmt::Display for MetricFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={:.3} outside [{:.3}, {:.3}]",
            self.metric, self.value, self.lower, self.upper
        )
    }
}

/// Outcome of classifying one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Every metric inside its band
    Accepted,
    /// Baseline not ready; accepted without comparison
    ColdStart,
    /// At least one metric outside its band
    Anomalous(Vec<MetricFlag>),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Verdict::Anomalous(_))
    }

    pub fn flags(&self) -> &[MetricFlag] {
        match self {
            Verdict::Anomalous(flags) => flags,
            _ => &[],
        }
    }
}

/// Compares frame metrics with the rolling baseline.
#[derive(Debug, Clone, Copy)]
pub struct AnomalyClassifier {
    mode: BandMode,
}

impl AnomalyClassifier {
    pub fn new(mode: BandMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> BandMode {
        self.mode
    }

    pub fn classify(&self, metrics: &QualityMetrics, baseline: &BaselineSnapshot) -> Verdict {
        let stats = match baseline {
            BaselineSnapshot::Insufficient { .. } => return Verdict::ColdStart,
            BaselineSnapshot::Ready(stats) => stats,
        };

        let flags: Vec<MetricFlag> = Metric::SCALAR
            .into_iter()
            .filter_map(|metric| {
                let value = metrics.get(metric)?;
                let (lower, upper) = self.band(stats, metric)?;
                (value < lower || value > upper).then_some(MetricFlag {
                    metric,
                    value,
                    lower,
                    upper,
                })
            })
            .collect();

        if flags.is_empty() {
            Verdict::Accepted
        } else {
            Verdict::Anomalous(flags)
        }
    }

    fn band(&self, stats: &BaselineStats, metric: Metric) -> Option<(f64, f64)> {
        match self.mode {
            BandMode::Sigma { multiplier } => {
                let s = stats.get(metric)?;
                Some((s.mean - multiplier * s.std, s.mean + multiplier * s.std))
            }
            BandMode::Percentile { low, high } => Some((
                stats.percentile(metric, low)?,
                stats.percentile(metric, high)?,
            )),
        }
    }
}

/// Comparison applied between a calibration frame and the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceRule {
    /// Flag when actual < reference − tolerance
    #[default]
    Below,
    /// Flag when actual ≤ reference + tolerance
    NotAbove,
    /// Flag when |actual − reference| > tolerance
    Outside,
}

impl ReferenceRule {
    fn flags(self, actual: f64, reference: f64, tolerance: f64) -> bool {
        match self {
            ReferenceRule::Below => actual < reference - tolerance,
            ReferenceRule::NotAbove => actual <= reference + tolerance,
            ReferenceRule::Outside => (actual - reference).abs() > tolerance,
        }
    }

    /// Band reported alongside a flag, for diagnostics.
    fn band(self, reference: f64, tolerance: f64) -> (f64, f64) {
        match self {
            ReferenceRule::Below => (reference - tolerance, f64::INFINITY),
            ReferenceRule::NotAbove => (reference + tolerance, f64::INFINITY),
            ReferenceRule::Outside => (reference - tolerance, reference + tolerance),
        }
    }
}

/// Per-metric tolerances for the reference check.
///
/// A metric with no tolerance is not compared.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReferenceTolerance {
    pub brightness: Option<f64>,
    pub sharpness: Option<f64>,
    pub entropy: Option<f64>,
    pub contrast: Option<f64>,
    pub noise_level: Option<f64>,
}

impl Default for ReferenceTolerance {
    fn default() -> Self {
        Self {
            brightness: Some(10.0),
            sharpness: Some(10.0),
            entropy: Some(1.0),
            contrast: Some(10.0),
            noise_level: None,
        }
    }
}

impl ReferenceTolerance {
    pub fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Brightness => self.brightness,
            Metric::Sharpness => self.sharpness,
            Metric::Entropy => self.entropy,
            Metric::Contrast => self.contrast,
            Metric::Noise => self.noise_level,
            Metric::Similarity => None,
        }
    }
}

/// Metrics of a known-good image, measured once at startup.
#[derive(Debug, Clone)]
pub struct ReferenceProfile {
    metrics: QualityMetrics,
    rule: ReferenceRule,
    tolerance: ReferenceTolerance,
}

impl ReferenceProfile {
    pub fn new(metrics: QualityMetrics, rule: ReferenceRule, tolerance: ReferenceTolerance) -> Self {
        Self {
            metrics,
            rule,
            tolerance,
        }
    }

    /// Measure the reference image at `path`.
    pub fn from_image(
        path: &Path,
        rule: ReferenceRule,
        tolerance: ReferenceTolerance,
    ) -> Result<Self, MetricError> {
        Ok(Self::new(QualityMetrics::from_path(path)?, rule, tolerance))
    }

    pub fn metrics(&self) -> &QualityMetrics {
        &self.metrics
    }

    pub fn check(&self, actual: &QualityMetrics) -> Verdict {
        let flags: Vec<MetricFlag> = Metric::SCALAR
            .into_iter()
            .filter_map(|metric| {
                let tolerance = self.tolerance.get(metric)?;
                let reference = self.metrics.get(metric)?;
                let value = actual.get(metric)?;
                if !self.rule.flags(value, reference, tolerance) {
                    return None;
                }
                let (lower, upper) = self.rule.band(reference, tolerance);
                Some(MetricFlag {
                    metric,
                    value,
                    lower,
                    upper,
                })
            })
            .collect();

        if flags.is_empty() {
            Verdict::Accepted
        } else {
            Verdict::Anomalous(flags)
        }
    }
}
