//! Image quality metrics.
//!
//! Every metric is a pure function of the luma channel. The set is closed and
//! described by [`Metric`]; implementations are looked up through
//! [`Metric::implementation`] instead of being spread across ad hoc helpers.
//!
//! | Metric     | Measures                                   | Low value means          |
//! |------------|--------------------------------------------|--------------------------|
//! | Brightness | mean luma                                  | dark or covered lens     |
//! | Sharpness  | variance of the Laplacian                  | blur or obstruction      |
//! | Entropy    | Shannon entropy of the luma histogram (bits) | flat, information-poor |
//! | Contrast   | standard deviation of luma                 | washed out               |
//! | Noise      | spectral peak over mean log-magnitude      | (high value) sensor noise |
//! | Similarity | SSIM between two frames                    | (near 1) frozen capture  |

use crate::frame::Frame;
use image::GrayImage;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Guard added before taking logarithms.
const LOG_EPSILON: f64 = f64::EPSILON;

/// SSIM window side.
const SSIM_WINDOW: usize = 7;
const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;
const SSIM_DATA_RANGE: f64 = 255.0;

/// Errors raised while measuring images read from disk.
#[derive(Debug, Error)]
pub enum MetricError {
    #[error("Failed to load image {path}: {source}")]
    ImageLoad {
        path: String,
        #[source]
        source: image::ImageError,
    },
}

/// The quality metrics known to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Brightness,
    Sharpness,
    Entropy,
    Contrast,
    Noise,
    Similarity,
}

/// Signature of a metric implementation.
#[derive(Clone, Copy)]
pub enum MetricFn {
    /// Computed from a single frame
    Unary(fn(&GrayImage) -> f64),
    /// Computed from a pair of frames; `None` when the pair is not comparable
    Pairwise(fn(&GrayImage, &GrayImage) -> Option<f64>),
}

const METRIC_TABLE: [(Metric, MetricFn); 6] = [
    (Metric::Brightness, MetricFn::Unary(brightness)),
    (Metric::Sharpness, MetricFn::Unary(sharpness)),
    (Metric::Entropy, MetricFn::Unary(entropy)),
    (Metric::Contrast, MetricFn::Unary(contrast)),
    (Metric::Noise, MetricFn::Unary(noise_level)),
    (Metric::Similarity, MetricFn::Pairwise(similarity)),
];

impl Metric {
    /// Metrics that describe one frame and make up [`QualityMetrics`].
    pub const SCALAR: [Metric; 5] = [
        Metric::Brightness,
        Metric::Sharpness,
        Metric::Entropy,
        Metric::Contrast,
        Metric::Noise,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Metric::Brightness => "brightness",
            Metric::Sharpness => "sharpness",
            Metric::Entropy => "entropy",
            Metric::Contrast => "contrast",
            Metric::Noise => "noise_level",
            Metric::Similarity => "similarity",
        }
    }

    /// Look up the implementation for this metric.
    pub fn implementation(self) -> MetricFn {
        // table rows follow declaration order
        METRIC_TABLE[self as usize].1
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scalar quality metrics of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct QualityMetrics {
    pub brightness: f64,
    pub sharpness: f64,
    pub entropy: f64,
    pub contrast: f64,
    pub noise_level: f64,
}

impl QualityMetrics {
    /// Measure every scalar metric on a luma image.
    pub fn measure(luma: &GrayImage) -> Self {
        let mut metrics = Self::default();
        for metric in Metric::SCALAR {
            if let MetricFn::Unary(f) = metric.implementation() {
                metrics.set(metric, f(luma));
            }
        }
        metrics
    }

    pub fn from_frame(frame: &Frame) -> Self {
        Self::measure(&frame.luma())
    }

    /// Measure an image file on disk.
    ///
    /// The file goes through the same RGB to luma conversion as a live frame,
    /// so a stored frame measures exactly like the frame it came from.
    pub fn from_path(path: &Path) -> Result<Self, MetricError> {
        let image = image::open(path).map_err(|source| MetricError::ImageLoad {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::measure(&image::imageops::grayscale(&image.to_rgb8())))
    }

    /// Value of a scalar metric; `None` for [`Metric::Similarity`].
    pub fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Brightness => Some(self.brightness),
            Metric::Sharpness => Some(self.sharpness),
            Metric::Entropy => Some(self.entropy),
            Metric::Contrast => Some(self.contrast),
            Metric::Noise => Some(self.noise_level),
            Metric::Similarity => None,
        }
    }

    fn set(&mut self, metric: Metric, value: f64) {
        match metric {
            Metric::Brightness => self.brightness = value,
            Metric::Sharpness => self.sharpness = value,
            Metric::Entropy => self.entropy = value,
            Metric::Contrast => self.contrast = value,
            Metric::Noise => self.noise_level = value,
            Metric::Similarity => {}
        }
    }
}

/// Mean and population variance of a sequence.
fn mean_variance(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (mut n, mut sum, mut sum_sq) = (0usize, 0.0f64, 0.0f64);
    for v in values {
        n += 1;
        sum += v;
        sum_sq += v * v;
    }
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = sum / n as f64;
    let variance = (sum_sq / n as f64 - mean * mean).max(0.0);
    (mean, variance)
}

/// Mean luma.
pub fn brightness(luma: &GrayImage) -> f64 {
    mean_variance(luma.as_raw().iter().map(|&v| v as f64)).0
}

/// Variance of the Laplacian-filtered luma.
pub fn sharpness(luma: &GrayImage) -> f64 {
    let laplacian = imageproc::filter::laplacian_filter(luma);
    mean_variance(laplacian.as_raw().iter().map(|&v| v as f64)).1
}

/// Shannon entropy (bits) of the 256-bin luma histogram.
pub fn entropy(luma: &GrayImage) -> f64 {
    let mut histogram = [0u64; 256];
    for &v in luma.as_raw() {
        histogram[v as usize] += 1;
    }
    let total = luma.as_raw().len() as f64;
    if total == 0.0 {
        return 0.0;
    }
    -histogram
        .iter()
        .map(|&count| {
            let p = count as f64 / total;
            p * (p + LOG_EPSILON).log2()
        })
        .sum::<f64>()
}

/// Population standard deviation of luma.
pub fn contrast(luma: &GrayImage) -> f64 {
    mean_variance(luma.as_raw().iter().map(|&v| v as f64))
        .1
        .sqrt()
}

/// Peak minus mean of the natural-log magnitude spectrum.
///
/// Max and mean do not depend on element order, so the spectrum is not shifted.
pub fn noise_level(luma: &GrayImage) -> f64 {
    let (width, height) = (luma.width() as usize, luma.height() as usize);
    if width == 0 || height == 0 {
        return 0.0;
    }

    let mut planner = FftPlanner::<f64>::new();

    // Rows
    let mut rows: Vec<Complex<f64>> = luma
        .as_raw()
        .iter()
        .map(|&v| Complex::new(v as f64, 0.0))
        .collect();
    planner.plan_fft_forward(width).process(&mut rows);

    // Columns, laid out contiguously
    let mut columns = vec![Complex::new(0.0, 0.0); width * height];
    for y in 0..height {
        for x in 0..width {
            columns[x * height + y] = rows[y * width + x];
        }
    }
    planner.plan_fft_forward(height).process(&mut columns);

    let mut peak = f64::NEG_INFINITY;
    let mut sum = 0.0;
    for c in &columns {
        let log_magnitude = (c.norm() + LOG_EPSILON).ln();
        peak = peak.max(log_magnitude);
        sum += log_magnitude;
    }
    peak - sum / columns.len() as f64
}

/// Summed-area table with one row and column of zero padding.
struct Integral {
    stride: usize,
    data: Vec<f64>,
}

impl Integral {
    fn build(width: usize, height: usize, value: impl Fn(usize, usize) -> f64) -> Self {
        let stride = width + 1;
        let mut data = vec![0.0; stride * (height + 1)];
        for y in 0..height {
            let mut row_sum = 0.0;
            for x in 0..width {
                row_sum += value(x, y);
                data[(y + 1) * stride + x + 1] = data[y * stride + x + 1] + row_sum;
            }
        }
        Self { stride, data }
    }

    /// Sum over the `side`×`side` window whose top-left corner is (x, y).
    fn window(&self, x: usize, y: usize, side: usize) -> f64 {
        let s = self.stride;
        self.data[(y + side) * s + x + side] - self.data[y * s + x + side]
            - self.data[(y + side) * s + x]
            + self.data[y * s + x]
    }
}

/// Structural similarity of two luma images.
///
/// Uses a 7×7 uniform window with sample covariance and averages over every
/// window that fits inside the image. Returns `None` when the dimensions differ
/// or either side is smaller than the window.
pub fn similarity(a: &GrayImage, b: &GrayImage) -> Option<f64> {
    if a.dimensions() != b.dimensions() {
        return None;
    }
    let (width, height) = (a.width() as usize, a.height() as usize);
    if width < SSIM_WINDOW || height < SSIM_WINDOW {
        return None;
    }

    let pa = a.as_raw();
    let pb = b.as_raw();
    let at = |x: usize, y: usize| pa[y * width + x] as f64;
    let bt = |x: usize, y: usize| pb[y * width + x] as f64;

    let sum_a = Integral::build(width, height, &at);
    let sum_b = Integral::build(width, height, &bt);
    let sum_aa = Integral::build(width, height, |x, y| at(x, y) * at(x, y));
    let sum_bb = Integral::build(width, height, |x, y| bt(x, y) * bt(x, y));
    let sum_ab = Integral::build(width, height, |x, y| at(x, y) * bt(x, y));

    let n = (SSIM_WINDOW * SSIM_WINDOW) as f64;
    let cov_norm = n / (n - 1.0);
    let c1 = (SSIM_K1 * SSIM_DATA_RANGE).powi(2);
    let c2 = (SSIM_K2 * SSIM_DATA_RANGE).powi(2);

    let mut total = 0.0;
    let mut windows = 0usize;
    for y in 0..=(height - SSIM_WINDOW) {
        for x in 0..=(width - SSIM_WINDOW) {
            let ux = sum_a.window(x, y, SSIM_WINDOW) / n;
            let uy = sum_b.window(x, y, SSIM_WINDOW) / n;
            let uxx = sum_aa.window(x, y, SSIM_WINDOW) / n;
            let uyy = sum_bb.window(x, y, SSIM_WINDOW) / n;
            let uxy = sum_ab.window(x, y, SSIM_WINDOW) / n;

            let vx = cov_norm * (uxx - ux * ux);
            let vy = cov_norm * (uyy - uy * uy);
            let vxy = cov_norm * (uxy - ux * uy);

            let numerator = (2.0 * ux * uy + c1) * (2.0 * vxy + c2);
            let denominator = (ux * ux + uy * uy + c1) * (vx + vy + c2);
            total += numerator / denominator;
            windows += 1;
        }
    }

    Some(total / windows as f64)
}
