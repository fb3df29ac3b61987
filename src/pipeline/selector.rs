//! Issue detection and filter recommendation.
//!
//! An ordered rule table. Every matching rule records its issue; every
//! matching rule also overwrites the recommendation, so the LAST match in
//! table order wins. Downstream tuning depends on this order.

use super::types::{FilterKind, QualityAssessment, QualityIssue, QualityMetrics};

/// Laplacian variance below this = blurry.
pub const BLUR_VARIANCE_THRESHOLD: f64 = 100.0;

/// Residual standard deviation above this = noisy.
pub const NOISE_THRESHOLD: f64 = 15.0;

/// Mean luminance below this = too dark.
pub const DARK_THRESHOLD: f64 = 50.0;

/// Mean luminance above this = too bright.
pub const BRIGHT_THRESHOLD: f64 = 200.0;

/// Luminance standard deviation below this = low contrast.
pub const LOW_CONTRAST_THRESHOLD: f64 = 30.0;

/// One `(predicate, issue, filter)` entry.
#[derive(Clone, Copy)]
pub struct QualityRule {
    pub issue: QualityIssue,
    pub filter: FilterKind,
    matches: fn(&QualityMetrics) -> bool,
}

impl QualityRule {
    pub fn matches(&self, metrics: &QualityMetrics) -> bool {
        (self.matches)(metrics)
    }
}

impl std::fmt::Debug for QualityRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityRule")
            .field("issue", &self.issue)
            .field("filter", &self.filter)
            .finish()
    }
}

/// Evaluated top to bottom. The two brightness rules are mutually exclusive.
pub const QUALITY_RULES: [QualityRule; 5] = [
    QualityRule {
        issue: QualityIssue::Blurry,
        filter: FilterKind::Sharpen,
        matches: |m: &QualityMetrics| m.blur_variance < BLUR_VARIANCE_THRESHOLD,
    },
    QualityRule {
        issue: QualityIssue::Noisy,
        filter: FilterKind::Denoise,
        matches: |m: &QualityMetrics| m.noise_level > NOISE_THRESHOLD,
    },
    QualityRule {
        issue: QualityIssue::TooDark,
        filter: FilterKind::Clahe,
        matches: |m: &QualityMetrics| m.brightness < DARK_THRESHOLD,
    },
    QualityRule {
        issue: QualityIssue::TooBright,
        filter: FilterKind::Clahe,
        matches: |m: &QualityMetrics| m.brightness > BRIGHT_THRESHOLD,
    },
    QualityRule {
        issue: QualityIssue::LowContrast,
        filter: FilterKind::Clahe,
        matches: |m: &QualityMetrics| m.contrast < LOW_CONTRAST_THRESHOLD,
    },
];

/// Issues found and the filter they resolve to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub issues: Vec<QualityIssue>,
    pub recommended: FilterKind,
}

/// Run the rule table. Total: falls back to [`FilterKind::DEFAULT_CONCRETE`]
/// when nothing fires.
pub fn select_filter(metrics: &QualityMetrics) -> Selection {
    let mut issues = Vec::new();
    let mut recommended = FilterKind::Auto;

    for rule in QUALITY_RULES.iter().filter(|r| r.matches(metrics)) {
        if !issues.contains(&rule.issue) {
            issues.push(rule.issue);
        }
        recommended = rule.filter;
    }

    if recommended.is_auto() {
        recommended = FilterKind::DEFAULT_CONCRETE;
    }

    Selection {
        issues,
        recommended,
    }
}

/// Filter to dispatch for a caller request.
///
/// An explicit request always wins; the assessment is advisory. `Auto`
/// adopts the recommendation, or stays `Auto` (deferred to the native side)
/// when there is no assessment.
pub fn resolve_requested(
    requested: FilterKind,
    assessment: Option<&QualityAssessment>,
) -> FilterKind {
    match (requested, assessment) {
        (FilterKind::Auto, Some(a)) => a.recommended_filter,
        (requested, _) => requested,
    }
}
