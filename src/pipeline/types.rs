use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::detector::DetectionArtifacts;
use super::dispatch::PreprocessOutcome;

/// Objective statistics of one image, computed from its luminance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Variance of the Laplacian response. Low = few sharp edges.
    pub blur_variance: f64,
    /// Mean luminance, 0-255.
    pub brightness: f64,
    /// Standard deviation of luminance.
    pub contrast: f64,
    /// Standard deviation of the residual against a Gaussian-smoothed copy.
    pub noise_level: f64,
    /// (width, height)
    pub resolution: (u32, u32),
}

/// A quality problem detected by the assessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssue {
    Blurry,
    Noisy,
    TooDark,
    TooBright,
    LowContrast,
}

impl QualityIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blurry => "blurry",
            Self::Noisy => "noisy",
            Self::TooDark => "too_dark",
            Self::TooBright => "too_bright",
            Self::LowContrast => "low_contrast",
        }
    }
}

impl fmt::Display for QualityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Corrective filter. `Auto` defers the choice and is never what actually runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    Auto,
    Blur,
    Sharpen,
    Denoise,
    Clahe,
    Edge,
}

impl FilterKind {
    pub const ALL: [FilterKind; 6] = [
        Self::Auto,
        Self::Blur,
        Self::Sharpen,
        Self::Denoise,
        Self::Clahe,
        Self::Edge,
    ];

    /// Concrete choice when no quality rule fires.
    pub const DEFAULT_CONCRETE: FilterKind = FilterKind::Blur;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Blur => "blur",
            Self::Sharpen => "sharpen",
            Self::Denoise => "denoise",
            Self::Clahe => "clahe",
            Self::Edge => "edge",
        }
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, Self::Auto)
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown filter '{0}'")]
pub struct UnknownFilter(pub String);

impl FromStr for FilterKind {
    type Err = UnknownFilter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == lower)
            .ok_or_else(|| UnknownFilter(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallQuality {
    Good,
    NeedsEnhancement,
}

impl fmt::Display for OverallQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Good => "good",
            Self::NeedsEnhancement => "needs_enhancement",
        })
    }
}

/// Assessor output. `recommended_filter` is always concrete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub metrics: QualityMetrics,
    /// Detection order, no duplicates.
    pub issues: Vec<QualityIssue>,
    pub recommended_filter: FilterKind,
    pub overall_quality: OverallQuality,
}

impl QualityAssessment {
    pub fn has_issue(&self, issue: QualityIssue) -> bool {
        self.issues.contains(&issue)
    }
}

/// Wall-clock time spent per stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub assessment: Duration,
    pub preprocessing: Duration,
    pub detection: Duration,
    pub total: Duration,
}

/// Aggregated outcome of one full pipeline run.
///
/// Each stage's output is kept even when a later stage fails or is skipped.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub input: PathBuf,
    pub filter_requested: FilterKind,
    pub filter_applied: FilterKind,
    pub assessment: Option<QualityAssessment>,
    pub preprocessed_image: Option<PreprocessOutcome>,
    pub detection_results: Option<DetectionArtifacts>,
    pub timings: StageTimings,
}
