//! Pipeline orchestrator: assess → preprocess → detect.
//!
//! Uses trait-based DI for the assessor, the process runner behind the
//! dispatcher, and the detector, so every failure branch is testable
//! without real binaries.
//!
//! Failure policy:
//! - missing input: fatal before any stage
//! - assessment failure: logged, the requested filter is kept
//! - preprocessing failure (native and fallback): fatal
//! - detection failure: logged, result returned without detections

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::detector::{CommandDetector, DetectionArtifacts, DetectionError, DetectionRequest, ObjectDetector};
use super::dispatch::{PreprocessDispatcher, PreprocessOutcome};
use super::quality::{assess_file, QualityAssessor, StatisticalQualityAssessor};
use super::scratch::ScratchDir;
use super::selector::resolve_requested;
use super::types::{FilterKind, PipelineResult, QualityAssessment, StageTimings};
use super::PipelineError;
use crate::config::{PipelineConfig, DEFAULT_CONFIDENCE, DEFAULT_DEVICE};

// ═══════════════════════════════════════════════════════════
// Stage tracking
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Idle,
    Assessing,
    Preprocessing,
    Detecting,
    Complete,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Assessing => "assessing",
            Self::Preprocessing => "preprocessing",
            Self::Detecting => "detecting",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// Legal forward moves. `Failed` is only reachable from preprocessing.
    pub fn can_transition_to(&self, next: PipelineStage) -> bool {
        use PipelineStage::*;
        matches!(
            (self, next),
            (Idle, Assessing)
                | (Assessing, Preprocessing)
                | (Preprocessing, Detecting)
                | (Preprocessing, Failed)
                | (Detecting, Complete)
        )
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current stage of one run, logged on every move.
#[derive(Debug)]
struct StageTracker {
    run_id: Uuid,
    current: PipelineStage,
}

impl StageTracker {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            current: PipelineStage::Idle,
        }
    }

    fn advance(&mut self, next: PipelineStage) {
        if !self.current.can_transition_to(next) {
            warn!(run_id = %self.run_id, from = %self.current, to = %next, "Unexpected stage transition");
        }
        debug!(run_id = %self.run_id, from = %self.current, to = %next, "Pipeline stage");
        self.current = next;
    }
}

// ═══════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════

/// Per-run options from the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Detector results directory. `None` uses the configured default.
    pub output_dir: Option<PathBuf>,
    pub filter: FilterKind,
    pub confidence: f32,
    pub device: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            output_dir: None,
            filter: FilterKind::Auto,
            confidence: DEFAULT_CONFIDENCE,
            device: DEFAULT_DEVICE.to_string(),
        }
    }
}

pub struct VisionPipeline {
    config: PipelineConfig,
    assessor: Box<dyn QualityAssessor>,
    dispatcher: PreprocessDispatcher,
    detector: Box<dyn ObjectDetector>,
}

impl VisionPipeline {
    pub fn new(
        config: PipelineConfig,
        assessor: Box<dyn QualityAssessor>,
        dispatcher: PreprocessDispatcher,
        detector: Box<dyn ObjectDetector>,
    ) -> Self {
        Self {
            config,
            assessor,
            dispatcher,
            detector,
        }
    }

    /// Production wiring: statistical assessor, native-then-fallback
    /// dispatcher, command-line detector.
    pub fn from_config(config: PipelineConfig) -> Self {
        let dispatcher = PreprocessDispatcher::from_config(&config);
        if !dispatcher.native_available() {
            warn!(
                path = %dispatcher.native_binary().display(),
                "Native preprocessing executable not found, in-process filters will be used"
            );
        }
        let detector = CommandDetector::from_config(&config.detector);
        Self::new(
            config,
            Box::new(StatisticalQualityAssessor),
            dispatcher,
            Box::new(detector),
        )
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Load and assess `image_path`.
    pub fn assess_image_quality(&self, image_path: &Path) -> Result<QualityAssessment, PipelineError> {
        ensure_exists(image_path)?;
        let assessment = assess_file(self.assessor.as_ref(), image_path)?;
        info!(
            path = %image_path.display(),
            quality = %assessment.overall_quality,
            issues = assessment.issues.len(),
            recommended = %assessment.recommended_filter,
            "Quality assessment complete"
        );
        Ok(assessment)
    }

    /// Apply `filter` to `input`. Without an explicit `output` the result
    /// goes to a per-run scratch file, which is kept only on success.
    pub fn preprocess_image(
        &self,
        input: &Path,
        output: Option<&Path>,
        filter: FilterKind,
    ) -> Result<PreprocessOutcome, PipelineError> {
        ensure_exists(input)?;
        self.preprocess_into(input, output, filter, Uuid::new_v4())
    }

    fn preprocess_into(
        &self,
        input: &Path,
        output: Option<&Path>,
        filter: FilterKind,
        run_id: Uuid,
    ) -> Result<PreprocessOutcome, PipelineError> {
        if let Some(output) = output {
            return Ok(self.dispatcher.apply(input, output, filter)?);
        }

        let scratch = ScratchDir::new(&self.config.scratch_dir)?;
        let artifact = scratch.artifact_path(input, run_id);
        let outcome = self.dispatcher.apply(input, artifact.path(), filter)?;
        artifact.keep();
        Ok(outcome)
    }

    /// Run the detector on an already preprocessed image.
    pub fn run_detection(
        &self,
        image_path: &Path,
        options: &RunOptions,
    ) -> Result<DetectionArtifacts, DetectionError> {
        let request = DetectionRequest {
            source: image_path.to_path_buf(),
            output_dir: options
                .output_dir
                .clone()
                .unwrap_or_else(|| self.config.detector.output_dir.clone()),
            device: options.device.clone(),
            confidence: options.confidence,
        };
        self.detector.detect(&request)
    }

    /// Assess, preprocess and detect. Only a missing input or a failure of
    /// both preprocessing paths is an error; everything else is recorded
    /// on the result.
    pub fn run_full_pipeline(
        &self,
        input: &Path,
        options: &RunOptions,
    ) -> Result<PipelineResult, PipelineError> {
        ensure_exists(input)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let mut timings = StageTimings::default();
        let mut stage = StageTracker::new(run_id);

        info!(run_id = %run_id, input = %input.display(), filter = %options.filter, "Pipeline run started");

        // Step 1: assess
        stage.advance(PipelineStage::Assessing);
        let t = Instant::now();
        let assessment = match self.assess_image_quality(input) {
            Ok(a) => Some(a),
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Quality assessment failed, keeping requested filter");
                None
            }
        };
        timings.assessment = t.elapsed();

        let filter = resolve_requested(options.filter, assessment.as_ref());
        if filter != options.filter {
            info!(run_id = %run_id, filter = %filter, "Using recommended filter");
        }

        // Step 2: preprocess
        stage.advance(PipelineStage::Preprocessing);
        let t = Instant::now();
        let preprocessed = match self.preprocess_into(input, None, filter, run_id) {
            Ok(outcome) => outcome,
            Err(e) => {
                stage.advance(PipelineStage::Failed);
                warn!(run_id = %run_id, error = %e, "Preprocessing failed");
                return Err(e);
            }
        };
        timings.preprocessing = t.elapsed();
        info!(
            run_id = %run_id,
            output = %preprocessed.output_path.display(),
            backend = ?preprocessed.backend,
            elapsed_ms = timings.preprocessing.as_millis() as u64,
            "Preprocessing complete"
        );

        // Step 3: detect
        stage.advance(PipelineStage::Detecting);
        let t = Instant::now();
        let detection_results = match self.run_detection(&preprocessed.output_path, options) {
            Ok(artifacts) => Some(artifacts),
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Object detection failed, continuing without detections");
                None
            }
        };
        timings.detection = t.elapsed();

        stage.advance(PipelineStage::Complete);
        timings.total = started.elapsed();
        info!(
            run_id = %run_id,
            total_ms = timings.total.as_millis() as u64,
            detections = detection_results.as_ref().map(|d| d.detections.len()),
            "Pipeline run complete"
        );

        Ok(PipelineResult {
            run_id,
            started_at,
            input: input.to_path_buf(),
            filter_requested: options.filter,
            filter_applied: filter,
            assessment,
            preprocessed_image: Some(preprocessed),
            detection_results,
            timings,
        })
    }
}

fn ensure_exists(path: &Path) -> Result<(), PipelineError> {
    if path.exists() {
        Ok(())
    } else {
        Err(PipelineError::InputNotFound(path.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use image::{Rgb, RgbImage};

    use super::*;
    use crate::pipeline::detector::mock::MockDetector;
    use crate::pipeline::detector::{BoundingBox, Detection};
    use crate::pipeline::dispatch::PreprocessBackend;
    use crate::pipeline::process::mock::MockProcessRunner;
    use crate::pipeline::quality::FixedQualityAssessor;
    use crate::pipeline::types::{OverallQuality, QualityIssue, QualityMetrics};

    struct Harness {
        dir: tempfile::TempDir,
        input: PathBuf,
        config: PipelineConfig,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("frame.png");
        RgbImage::from_pixel(40, 30, Rgb([128, 128, 128]))
            .save(&input)
            .unwrap();
        let config = PipelineConfig::for_root(dir.path());
        Harness { dir, input, config }
    }

    fn pipeline(config: &PipelineConfig, runner: MockProcessRunner, detector: MockDetector) -> VisionPipeline {
        let dispatcher = PreprocessDispatcher::new(
            config.native_binary.clone(),
            Duration::from_secs(60),
            Box::new(runner),
        );
        VisionPipeline::new(
            config.clone(),
            Box::new(StatisticalQualityAssessor),
            dispatcher,
            Box::new(detector),
        )
    }

    fn one_detection() -> Vec<Detection> {
        vec![Detection {
            class_id: 0,
            confidence: Some(0.8),
            bbox: BoundingBox {
                cx: 0.5,
                cy: 0.5,
                width: 0.1,
                height: 0.2,
            },
        }]
    }

    #[test]
    fn stage_transitions() {
        use PipelineStage::*;
        assert!(Idle.can_transition_to(Assessing));
        assert!(Assessing.can_transition_to(Preprocessing));
        assert!(Preprocessing.can_transition_to(Failed));
        assert!(Detecting.can_transition_to(Complete));
        assert!(!Assessing.can_transition_to(Failed));
        assert!(!Detecting.can_transition_to(Failed));
        assert!(!Complete.can_transition_to(Idle));
    }

    #[test]
    fn full_run_adopts_recommendation_and_detects() {
        let h = harness();
        let detector = MockDetector::finding(one_detection());
        let requests = detector.requests.clone();
        let p = pipeline(&h.config, MockProcessRunner::exiting(0, ""), detector);

        let result = p.run_full_pipeline(&h.input, &RunOptions::default()).unwrap();

        // Uniform gray: blurry then low contrast, last rule wins.
        assert_eq!(result.filter_requested, FilterKind::Auto);
        assert_eq!(result.filter_applied, FilterKind::Clahe);
        let pre = result.preprocessed_image.as_ref().unwrap();
        assert_eq!(pre.backend, PreprocessBackend::Fallback);
        assert!(pre.output_path.starts_with(&h.config.scratch_dir));
        assert!(pre.output_path.exists());

        let detections = result.detection_results.as_ref().unwrap();
        assert_eq!(detections.detections.len(), 1);
        assert_eq!(detections.output_dir, h.config.detector.output_dir);

        let requests = requests.lock().unwrap();
        assert_eq!(requests[0].source, pre.output_path);
        assert_eq!(requests[0].device, "cpu");
        assert_eq!(requests[0].confidence, 0.25);
        assert!(result.timings.total >= result.timings.preprocessing);
    }

    #[test]
    fn explicit_filter_overrides_recommendation() {
        let h = harness();
        let p = pipeline(&h.config, MockProcessRunner::exiting(0, ""), MockDetector::finding(vec![]));
        let options = RunOptions {
            filter: FilterKind::Denoise,
            ..Default::default()
        };

        let result = p.run_full_pipeline(&h.input, &options).unwrap();
        assert_eq!(result.filter_applied, FilterKind::Denoise);
        assert!(result.assessment.is_some());
    }

    #[test]
    fn detector_failure_is_not_fatal() {
        let h = harness();
        let p = pipeline(
            &h.config,
            MockProcessRunner::exiting(0, ""),
            MockDetector::failing(DetectionError::Unavailable("not installed".into())),
        );

        let result = p.run_full_pipeline(&h.input, &RunOptions::default()).unwrap();
        assert!(result.preprocessed_image.is_some());
        assert!(result.detection_results.is_none());
    }

    #[test]
    fn both_preprocessing_paths_failing_is_fatal() {
        let h = harness();
        let corrupt = h.dir.path().join("corrupt.png");
        std::fs::write(&corrupt, b"not an image").unwrap();
        let detector = MockDetector::finding(vec![]);
        let requests = detector.requests.clone();
        let p = pipeline(&h.config, MockProcessRunner::exiting(1, ""), detector);

        let err = p.run_full_pipeline(&corrupt, &RunOptions::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Preprocessing(_)));
        assert_eq!(err.stage(), PipelineStage::Preprocessing);
        assert!(requests.lock().unwrap().is_empty());

        // No partial artifact left behind.
        let leftovers = std::fs::read_dir(&h.config.scratch_dir).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn failed_assessment_keeps_requested_filter() {
        let h = harness();
        // Native "succeeds" by writing the output itself, so an undecodable
        // input still makes it through preprocessing.
        let runner = MockProcessRunner::new(|spec| {
            std::fs::write(&spec.args[1], b"native output").unwrap();
            Ok(crate::pipeline::process::ProcessOutput {
                exit_code: Some(0),
                ..Default::default()
            })
        });
        std::fs::create_dir_all(h.config.native_binary.parent().unwrap()).unwrap();
        std::fs::write(&h.config.native_binary, b"").unwrap();
        let raw = h.dir.path().join("frame.raw");
        std::fs::write(&raw, b"sensor dump").unwrap();
        let p = pipeline(&h.config, runner, MockDetector::finding(vec![]));

        let result = p.run_full_pipeline(&raw, &RunOptions::default()).unwrap();
        assert!(result.assessment.is_none());
        assert_eq!(result.filter_applied, FilterKind::Auto);
        assert_eq!(
            result.preprocessed_image.unwrap().backend,
            PreprocessBackend::Native
        );
    }

    #[test]
    fn missing_input_fails_before_any_stage() {
        let h = harness();
        let detector = MockDetector::finding(vec![]);
        let requests = detector.requests.clone();
        let runner = MockProcessRunner::exiting(0, "");
        let calls = runner.calls.clone();
        let p = pipeline(&h.config, runner, detector);

        let missing = h.dir.path().join("nope.jpg");
        let err = p.run_full_pipeline(&missing, &RunOptions::default()).unwrap_err();
        assert!(matches!(err, PipelineError::InputNotFound(ref p) if *p == missing));
        assert_eq!(err.stage(), PipelineStage::Idle);
        assert!(calls.lock().unwrap().is_empty());
        assert!(requests.lock().unwrap().is_empty());
    }

    #[test]
    fn injected_assessor_drives_selection() {
        let h = harness();
        let fixed = QualityAssessment {
            metrics: QualityMetrics {
                blur_variance: 500.0,
                brightness: 30.0,
                contrast: 40.0,
                noise_level: 2.0,
                resolution: (40, 30),
            },
            issues: vec![QualityIssue::TooDark],
            recommended_filter: FilterKind::Clahe,
            overall_quality: OverallQuality::NeedsEnhancement,
        };
        let dispatcher = PreprocessDispatcher::new(
            h.config.native_binary.clone(),
            Duration::from_secs(60),
            Box::new(MockProcessRunner::exiting(0, "")),
        );
        let p = VisionPipeline::new(
            h.config.clone(),
            Box::new(FixedQualityAssessor(fixed.clone())),
            dispatcher,
            Box::new(MockDetector::finding(vec![])),
        );

        assert_eq!(p.assess_image_quality(&h.input).unwrap(), fixed);
        let result = p.run_full_pipeline(&h.input, &RunOptions::default()).unwrap();
        assert_eq!(result.filter_applied, FilterKind::Clahe);
    }

    #[test]
    fn preprocess_to_explicit_output() {
        let h = harness();
        let p = pipeline(&h.config, MockProcessRunner::exiting(0, ""), MockDetector::finding(vec![]));
        let out = h.dir.path().join("sharp.png");

        let outcome = p.preprocess_image(&h.input, Some(&out), FilterKind::Sharpen).unwrap();
        assert_eq!(outcome.output_path, out);
        assert!(out.exists());
    }

    #[test]
    fn preprocess_in_place_rewrites_input() {
        let h = harness();
        std::fs::create_dir_all(h.config.native_binary.parent().unwrap()).unwrap();
        std::fs::write(&h.config.native_binary, b"").unwrap();
        let p = pipeline(&h.config, MockProcessRunner::exiting(0, ""), MockDetector::finding(vec![]));

        let outcome = p.preprocess_image(&h.input, Some(&h.input), FilterKind::Clahe).unwrap();
        assert_eq!(outcome.backend, PreprocessBackend::Fallback);
        let img = image::open(&h.input).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (40, 30));
    }

    #[test]
    fn run_detection_honours_output_override() {
        let h = harness();
        let p = pipeline(&h.config, MockProcessRunner::exiting(0, ""), MockDetector::finding(vec![]));
        let options = RunOptions {
            output_dir: Some(h.dir.path().join("custom")),
            device: "cuda:0".into(),
            confidence: 0.5,
            ..Default::default()
        };

        let artifacts = p.run_detection(&h.input, &options).unwrap();
        assert_eq!(artifacts.output_dir, h.dir.path().join("custom"));
    }

    #[test]
    fn result_serializes_to_json() {
        let h = harness();
        let p = pipeline(&h.config, MockProcessRunner::exiting(0, ""), MockDetector::finding(one_detection()));
        let result = p.run_full_pipeline(&h.input, &RunOptions::default()).unwrap();

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["filter_applied"], "clahe");
        assert_eq!(json["preprocessed_image"]["backend"], "fallback");
        assert_eq!(json["assessment"]["overall_quality"], "needs_enhancement");
        assert_eq!(json["detection_results"]["detections"][0]["class_id"], 0);
    }
}
