//! External object detector.
//!
//! The detector is a separate program (YOLOv5's `detect.py` by default)
//! configured as a command line. It writes an annotated copy of the source
//! under `<output_dir>` and, with `--save-txt --save-conf`, one
//! `labels/<stem>.txt` file with a `class cx cy w h conf` line per object.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::orchestrator::PipelineStage;
use super::process::{ProcessRunner, ProcessSpec, TokioProcessRunner};
use crate::config::DetectorConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectionError {
    #[error("Object detector unavailable: {0}")]
    Unavailable(String),

    #[error("Object detector exited with code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("Object detector timed out after {}s", .after.as_secs_f64())]
    TimedOut { after: Duration },
}

impl DetectionError {
    pub fn stage(&self) -> PipelineStage {
        PipelineStage::Detecting
    }
}

/// One detection request.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRequest {
    pub source: PathBuf,
    /// Results directory. Its parent is passed as `--project`, its file name
    /// as `--name`.
    pub output_dir: PathBuf,
    pub device: String,
    pub confidence: f32,
}

/// Normalized box: centre and size as fractions of the image dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub cx: f32,
    pub cy: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: u32,
    /// Absent when the detector was run without `--save-conf`.
    pub confidence: Option<f32>,
    pub bbox: BoundingBox,
}

/// Where the detector wrote its results, plus the parsed labels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionArtifacts {
    pub output_dir: PathBuf,
    /// `None` when nothing was detected (no labels file is written).
    pub labels_file: Option<PathBuf>,
    pub detections: Vec<Detection>,
}

/// Runs object detection on a preprocessed image. Mocked in tests.
pub trait ObjectDetector: Send + Sync {
    fn detect(&self, request: &DetectionRequest) -> Result<DetectionArtifacts, DetectionError>;
}

// ═══════════════════════════════════════════════════════════
// Command-line detector
// ═══════════════════════════════════════════════════════════

pub struct CommandDetector {
    config: DetectorConfig,
    runner: Box<dyn ProcessRunner>,
}

impl CommandDetector {
    pub fn new(config: DetectorConfig, runner: Box<dyn ProcessRunner>) -> Self {
        Self { config, runner }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(config.clone(), Box::new(TokioProcessRunner))
    }

    /// Build the invocation, or `None` when no command is configured.
    fn command_for(&self, request: &DetectionRequest, run_dir: &RunDir) -> Option<ProcessSpec> {
        let (program, leading) = self.config.command.split_first()?;
        let spec = ProcessSpec::new(program, self.config.timeout())
            .args(leading.iter().cloned())
            .arg("--weights")
            .arg(&self.config.weights_path)
            .arg("--source")
            .arg(&request.source)
            .arg("--device")
            .arg(&request.device)
            .arg("--project")
            .arg(&run_dir.project)
            .arg("--name")
            .arg(&run_dir.name)
            .arg("--conf-thres")
            .arg(request.confidence.to_string())
            .args(["--save-txt", "--save-conf", "--exist-ok"]);
        Some(spec)
    }
}

impl ObjectDetector for CommandDetector {
    fn detect(&self, request: &DetectionRequest) -> Result<DetectionArtifacts, DetectionError> {
        let run_dir = RunDir::split(&request.output_dir);
        let spec = self
            .command_for(request, &run_dir)
            .ok_or_else(|| DetectionError::Unavailable("no detector command configured".into()))?;

        info!(source = %request.source.display(), device = %request.device, "Running object detection");
        debug!(command = %spec.display(), "Detector invocation");

        let output = self.runner.run(&spec).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                DetectionError::Unavailable(format!("{} not found", spec.program.display()))
            }
            _ => DetectionError::Unavailable(e.to_string()),
        })?;

        if output.timed_out {
            return Err(DetectionError::TimedOut {
                after: spec.timeout,
            });
        }
        if !output.success() {
            return Err(DetectionError::Failed {
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        let results_dir = run_dir.path();
        Ok(collect_artifacts(&results_dir, &request.source))
    }
}

/// `--project` / `--name` pair for a results directory.
struct RunDir {
    project: PathBuf,
    name: String,
}

impl RunDir {
    fn split(output_dir: &Path) -> Self {
        let name = output_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pipeline_results".to_string());
        let project = match output_dir.parent() {
            Some(p) if output_dir.file_name().is_some() => p.to_path_buf(),
            _ => output_dir.to_path_buf(),
        };
        Self { project, name }
    }

    fn path(&self) -> PathBuf {
        self.project.join(&self.name)
    }
}

/// Locate and parse the labels file the detector wrote for `source`.
pub fn collect_artifacts(results_dir: &Path, source: &Path) -> DetectionArtifacts {
    let labels_path = source
        .file_stem()
        .map(|stem| results_dir.join("labels").join(format!("{}.txt", stem.to_string_lossy())));

    let (labels_file, detections) = match labels_path {
        Some(path) if path.is_file() => match std::fs::read_to_string(&path) {
            Ok(text) => {
                let detections = parse_labels(&text);
                (Some(path), detections)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read detector labels");
                (Some(path), Vec::new())
            }
        },
        _ => (None, Vec::new()),
    };

    info!(
        output_dir = %results_dir.display(),
        objects = detections.len(),
        "Object detection complete"
    );

    DetectionArtifacts {
        output_dir: results_dir.to_path_buf(),
        labels_file,
        detections,
    }
}

/// Parse YOLO label lines: `class cx cy w h [conf]`. Malformed lines are skipped.
pub fn parse_labels(text: &str) -> Vec<Detection> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let parsed = parse_label_line(line);
            if parsed.is_none() {
                debug!(line, "Skipping malformed label line");
            }
            parsed
        })
        .collect()
}

fn parse_label_line(line: &str) -> Option<Detection> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 5 && fields.len() != 6 {
        return None;
    }
    let class_id = fields[0].parse().ok()?;
    let num = |i: usize| fields[i].parse::<f32>().ok();
    let bbox = BoundingBox {
        cx: num(1)?,
        cy: num(2)?,
        width: num(3)?,
        height: num(4)?,
    };
    let confidence = match fields.get(5) {
        Some(_) => Some(num(5)?),
        None => None,
    };
    Some(Detection {
        class_id,
        confidence,
        bbox,
    })
}

// ═══════════════════════════════════════════════════════════
// Test double
// ═══════════════════════════════════════════════════════════
