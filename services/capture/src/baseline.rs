//! Rolling baseline of accepted frame metrics.

use crate::metrics::{Metric, QualityMetrics};
use std::collections::VecDeque;

/// Summary statistics of one metric across the window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricStats {
    pub mean: f64,
    /// Population standard deviation
    pub std: f64,
    pub p10: f64,
    pub p90: f64,
}

/// Per-metric statistics of a ready baseline.
#[derive(Debug, Clone)]
pub struct BaselineStats {
    samples: Vec<QualityMetrics>,
    brightness: MetricStats,
    sharpness: MetricStats,
    entropy: MetricStats,
    contrast: MetricStats,
    noise_level: MetricStats,
}

impl BaselineStats {
    fn from_samples(samples: Vec<QualityMetrics>) -> Self {
        let stats_of = |metric: Metric| {
            let values: Vec<f64> = samples.iter().filter_map(|m| m.get(metric)).collect();
            summarize(&values)
        };

        Self {
            brightness: stats_of(Metric::Brightness),
            sharpness: stats_of(Metric::Sharpness),
            entropy: stats_of(Metric::Entropy),
            contrast: stats_of(Metric::Contrast),
            noise_level: stats_of(Metric::Noise),
            samples,
        }
    }

    /// Statistics for a scalar metric; `None` for [`Metric::Similarity`].
    pub fn get(&self, metric: Metric) -> Option<&MetricStats> {
        match metric {
            Metric::Brightness => Some(&self.brightness),
            Metric::Sharpness => Some(&self.sharpness),
            Metric::Entropy => Some(&self.entropy),
            Metric::Contrast => Some(&self.contrast),
            Metric::Noise => Some(&self.noise_level),
            Metric::Similarity => None,
        }
    }

    /// Arbitrary percentile (0–100) of a scalar metric across the window.
    pub fn percentile(&self, metric: Metric, p: f64) -> Option<f64> {
        let mut values: Vec<f64> = self.samples.iter().filter_map(|m| m.get(metric)).collect();
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);
        Some(percentile_sorted(&values, p))
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// Result of asking the tracker for its statistics.
#[derive(Debug, Clone)]
pub enum BaselineSnapshot {
    /// Fewer than the required samples; callers skip classification
    Insufficient { samples: usize, required: usize },
    Ready(BaselineStats),
}

impl BaselineSnapshot {
    pub fn is_ready(&self) -> bool {
        matches!(self, BaselineSnapshot::Ready(_))
    }
}

/// FIFO window of the last K accepted metric sets.
#[derive(Debug, Clone)]
pub struct BaselineTracker {
    window: VecDeque<QualityMetrics>,
    capacity: usize,
    min_samples: usize,
}

impl BaselineTracker {
    /// Create a tracker holding at most `capacity` samples.
    ///
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize, min_samples: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            min_samples,
        }
    }

    /// Append metrics from an accepted frame, evicting the oldest at capacity.
    pub fn update(&mut self, metrics: QualityMetrics) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(metrics);
    }

    pub fn snapshot(&self) -> BaselineSnapshot {
        if self.window.len() < self.min_samples || self.window.is_empty() {
            return BaselineSnapshot::Insufficient {
                samples: self.window.len(),
                required: self.min_samples.max(1),
            };
        }
        BaselineSnapshot::Ready(BaselineStats::from_samples(
            self.window.iter().copied().collect(),
        ))
    }

    /// Samples in insertion order, oldest first.
    pub fn samples(&self) -> impl Iterator<Item = &QualityMetrics> {
        self.window.iter()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}

fn summarize(values: &[f64]) -> MetricStats {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    MetricStats {
        mean,
        std: variance.sqrt(),
        p10: percentile_sorted(&sorted, 10.0),
        p90: percentile_sorted(&sorted, 90.0),
    }
}

/// Linear interpolation between closest ranks.
fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(brightness: f64) -> QualityMetrics {
        QualityMetrics {
            brightness,
            sharpness: brightness * 2.0,
            entropy: 7.0,
            contrast: 40.0,
            noise_level: 5.0,
        }
    }

    #[test]
    fn test_window_length_tracks_accepted_frames() {
        let mut tracker = BaselineTracker::new(4, 3);
        for i in 0..10 {
            tracker.update(metrics(i as f64));
            assert_eq!(tracker.len(), (i + 1).min(4));
        }
    }

    #[test]
    fn test_oldest_entry_evicted_first() {
        let mut tracker = BaselineTracker::new(3, 1);
        for i in 0..5 {
            tracker.update(metrics(i as f64));
        }
        let kept: Vec<f64> = tracker.samples().map(|m| m.brightness).collect();
        assert_eq!(kept, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_insufficient_until_min_samples() {
        let mut tracker = BaselineTracker::new(10, 3);
        tracker.update(metrics(1.0));
        tracker.update(metrics(2.0));

        match tracker.snapshot() {
            BaselineSnapshot::Insufficient { samples, required } => {
                assert_eq!(samples, 2);
                assert_eq!(required, 3);
            }
            BaselineSnapshot::Ready(_) => panic!("expected insufficient data"),
        }

        tracker.update(metrics(3.0));
        assert!(tracker.snapshot().is_ready());
    }

    #[test]
    fn test_statistics_match_population_formulas() {
        let mut tracker = BaselineTracker::new(10, 1);
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            tracker.update(metrics(v));
        }

        let BaselineSnapshot::Ready(stats) = tracker.snapshot() else {
            panic!("expected ready baseline");
        };
        let brightness = stats.get(Metric::Brightness).unwrap();
        assert!((brightness.mean - 5.0).abs() < 1e-12);
        assert!((brightness.std - 2.0).abs() < 1e-12);
        // rank 0.7 between 2.0 and 4.0
        assert!((brightness.p10 - 3.4).abs() < 1e-12);
        // rank 6.3 between 7.0 and 9.0
        assert!((brightness.p90 - 7.6).abs() < 1e-12);

        let contrast = stats.get(Metric::Contrast).unwrap();
        assert_eq!(contrast.std, 0.0);
        assert!(stats.get(Metric::Similarity).is_none());
    }

    #[test]
    fn test_arbitrary_percentile() {
        let mut tracker = BaselineTracker::new(5, 1);
        for v in [10.0, 20.0, 30.0, 40.0, 50.0] {
            tracker.update(metrics(v));
        }
        let BaselineSnapshot::Ready(stats) = tracker.snapshot() else {
            panic!("expected ready baseline");
        };
        assert_eq!(stats.percentile(Metric::Brightness, 50.0), Some(30.0));
        assert_eq!(stats.percentile(Metric::Brightness, 25.0), Some(20.0));
        assert_eq!(stats.sample_count(), 5);
    }

    #[test]
    fn test_zero_min_samples_still_needs_one() {
        let tracker = BaselineTracker::new(3, 0);
        assert!(!tracker.snapshot().is_ready());
    }
}
