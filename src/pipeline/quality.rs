//! Statistical image quality assessment.
//!
//! Pure read-only analysis: one luminance derivation, four metrics, then the
//! rule table in [`super::selector`]. The input image is never modified.

use std::path::Path;

use image::RgbImage;
use tracing::debug;

use super::raster::{load_rgb_image, luminance, Plane};
use super::selector::select_filter;
use super::types::{OverallQuality, QualityAssessment, QualityMetrics};
use super::ImageLoadError;

/// 3x3 Laplacian: `[0,1,0; 1,-4,1; 0,1,0]`.
const LAPLACIAN_KERNEL: [[f32; 3]; 3] = [[0.0, 1.0, 0.0], [1.0, -4.0, 1.0], [0.0, 1.0, 0.0]];

/// Smoothing used as the noise-free reference.
const NOISE_KERNEL_SIZE: usize = 5;
const NOISE_SIGMA: f32 = 1.0;

/// Assesses image quality without modifying it.
pub trait QualityAssessor: Send + Sync {
    fn assess(&self, image: &RgbImage) -> QualityAssessment;
}

/// Decode `path` and assess it.
pub fn assess_file(
    assessor: &dyn QualityAssessor,
    path: &Path,
) -> Result<QualityAssessment, ImageLoadError> {
    let image = load_rgb_image(path)?;
    Ok(assessor.assess(&image))
}

/// Production assessor: Laplacian variance, mean, standard deviation and
/// Gaussian residual noise on BT.601 luminance.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatisticalQualityAssessor;

impl QualityAssessor for StatisticalQualityAssessor {
    fn assess(&self, image: &RgbImage) -> QualityAssessment {
        let metrics = compute_metrics(image);
        let selection = select_filter(&metrics);

        let overall_quality = if selection.issues.is_empty() {
            OverallQuality::Good
        } else {
            OverallQuality::NeedsEnhancement
        };

        debug!(
            blur_variance = metrics.blur_variance,
            brightness = metrics.brightness,
            contrast = metrics.contrast,
            noise_level = metrics.noise_level,
            issues = selection.issues.len(),
            recommended = %selection.recommended,
            "Image quality assessed"
        );

        QualityAssessment {
            metrics,
            issues: selection.issues,
            recommended_filter: selection.recommended,
            overall_quality,
        }
    }
}

/// All metrics from a single luminance plane.
pub fn compute_metrics(image: &RgbImage) -> QualityMetrics {
    let gray = luminance(image);
    QualityMetrics {
        blur_variance: laplacian_variance(&gray),
        brightness: gray.mean(),
        contrast: gray.std_dev(),
        noise_level: noise_level(&gray),
        resolution: (image.width(), image.height()),
    }
}

/// Variance of the Laplacian response. Higher = sharper.
pub fn laplacian_variance(gray: &Plane) -> f64 {
    if gray.is_empty() {
        return 0.0;
    }
    gray.convolve3x3(&LAPLACIAN_KERNEL).variance()
}

/// Standard deviation of `gray - gaussian(gray)`.
pub fn noise_level(gray: &Plane) -> f64 {
    if gray.is_empty() {
        return 0.0;
    }
    let smoothed = gray.gaussian(NOISE_KERNEL_SIZE, NOISE_SIGMA);
    gray.difference(&smoothed).std_dev()
}

/// Assessor that returns a fixed assessment, for tests.
#[cfg(test)]
pub struct FixedQualityAssessor(pub QualityAssessment);

#[cfg(test)]
impl QualityAssessor for FixedQualityAssessor {
    fn assess(&self, _image: &RgbImage) -> QualityAssessment {
        self.0.clone()
    }
}
