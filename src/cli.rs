//! Command-line front end.

use std::fmt::Write as _;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::config::{PipelineConfig, DEFAULT_CONFIDENCE, DEFAULT_DEVICE};
use crate::pipeline::{FilterKind, PipelineError, PipelineResult, QualityAssessment, RunOptions, VisionPipeline};

#[derive(Debug, Parser)]
#[command(name = "visionprep")]
#[command(about = "Adaptive image preprocessing ahead of object detection")]
#[command(version)]
pub struct Cli {
    /// Input image path.
    pub input: PathBuf,

    /// Output directory for detection results.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Preprocessing filter. `auto` uses the quality assessment's recommendation.
    #[arg(short, long, value_enum, default_value_t = FilterArg::Auto)]
    pub filter: FilterArg,

    /// Detector confidence threshold.
    #[arg(short, long, default_value_t = DEFAULT_CONFIDENCE)]
    pub confidence: f32,

    /// Device for detector inference (cpu, cuda, mps).
    #[arg(short, long, default_value = DEFAULT_DEVICE)]
    pub device: String,

    /// Verbose output: per-stage details and debug logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Only assess image quality, don't run the full pipeline.
    #[arg(long)]
    pub assess_only: bool,

    /// Pipeline config file (JSON).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FilterArg {
    Auto,
    Blur,
    Sharpen,
    Denoise,
    Clahe,
    Edge,
}

impl FilterArg {
    fn to_core(self) -> FilterKind {
        match self {
            Self::Auto => FilterKind::Auto,
            Self::Blur => FilterKind::Blur,
            Self::Sharpen => FilterKind::Sharpen,
            Self::Denoise => FilterKind::Denoise,
            Self::Clahe => FilterKind::Clahe,
            Self::Edge => FilterKind::Edge,
        }
    }
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Cannot serialize output: {0}")]
    Json(#[from] serde_json::Error),
}

impl Cli {
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            output_dir: self.output.clone(),
            filter: self.filter.to_core(),
            confidence: self.confidence,
            device: self.device.clone(),
        }
    }
}

/// Execute the parsed command and return what should be printed.
pub fn execute(cli: &Cli) -> Result<String, CliError> {
    let config = PipelineConfig::resolve(cli.config.as_deref()).map_err(PipelineError::from)?;
    let pipeline = VisionPipeline::from_config(config);

    if cli.assess_only {
        let assessment = pipeline.assess_image_quality(&cli.input)?;
        return Ok(if cli.json {
            serde_json::to_string_pretty(&assessment)?
        } else {
            format_assessment(&assessment)
        });
    }

    let result = pipeline.run_full_pipeline(&cli.input, &cli.run_options())?;
    Ok(if cli.json {
        serde_json::to_string_pretty(&result)?
    } else {
        format_result(&result, cli.verbose)
    })
}

pub fn format_assessment(assessment: &QualityAssessment) -> String {
    let m = &assessment.metrics;
    let mut out = String::from("=== Image Quality Assessment ===\n");
    let _ = writeln!(out, "Resolution: {}x{}", m.resolution.0, m.resolution.1);
    let _ = writeln!(out, "Blur variance: {:.1}", m.blur_variance);
    let _ = writeln!(out, "Brightness: {:.1}", m.brightness);
    let _ = writeln!(out, "Contrast: {:.1}", m.contrast);
    let _ = writeln!(out, "Noise level: {:.1}", m.noise_level);
    let _ = writeln!(out, "Overall quality: {}", assessment.overall_quality);
    let issues = if assessment.issues.is_empty() {
        "none".to_string()
    } else {
        assessment
            .issues
            .iter()
            .map(|i| i.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let _ = writeln!(out, "Quality issues: {issues}");
    let _ = writeln!(out, "Recommended filter: {}", assessment.recommended_filter);
    out
}

pub fn format_result(result: &PipelineResult, verbose: bool) -> String {
    let mut out = String::from("=== Computer Vision Pipeline ===\n");
    let _ = writeln!(out, "Input: {}", result.input.display());

    if verbose {
        match &result.assessment {
            Some(a) => {
                out.push('\n');
                out.push_str(&format_assessment(a));
            }
            None => out.push_str("\nQuality assessment failed\n"),
        }
    }

    if let Some(pre) = &result.preprocessed_image {
        let _ = writeln!(
            out,
            "\nPreprocessed ({}, {:?}): {}",
            pre.filter,
            pre.backend,
            pre.output_path.display()
        );
        if verbose {
            if let Some(reason) = &pre.native_failure {
                let _ = writeln!(out, "Native path skipped: {reason}");
            }
        }
    }

    out.push_str("\n=== Pipeline Complete ===\n");
    let _ = writeln!(out, "Preprocessing time: {:.2}s", result.timings.preprocessing.as_secs_f64());
    let _ = writeln!(out, "Total time: {:.2}s", result.timings.total.as_secs_f64());
    match &result.detection_results {
        Some(d) => {
            let _ = writeln!(out, "Results saved to: {}", d.output_dir.display());
            let _ = writeln!(out, "Objects detected: {}", d.detections.len());
        }
        None => out.push_str("Object detection unavailable, no results written\n"),
    }
    out
}
