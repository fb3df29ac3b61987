pub mod types;
pub mod raster;
pub mod selector;
pub mod quality;
pub mod filters;
pub mod process;
pub mod dispatch;
pub mod detector;
pub mod scratch;
pub mod orchestrator;

pub use types::*;
pub use quality::{QualityAssessor, StatisticalQualityAssessor};
pub use dispatch::{
    FallbackError, NativeExecutionError, PreprocessBackend, PreprocessDispatcher, PreprocessError,
    PreprocessOutcome,
};
pub use detector::{
    CommandDetector, Detection, DetectionArtifacts, DetectionError, DetectionRequest, ObjectDetector,
};
pub use orchestrator::{PipelineStage, RunOptions, VisionPipeline};

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

/// An input file that could not be decoded as an image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cannot load image {path}: {reason}")]
pub struct ImageLoadError {
    pub path: PathBuf,
    pub reason: String,
}

/// Errors that end a pipeline run. Detection failures are not here: they
/// are recorded on the result and the run still completes.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Input image not found: {0}")]
    InputNotFound(PathBuf),

    #[error(transparent)]
    ImageLoad(#[from] ImageLoadError),

    #[error(transparent)]
    Preprocessing(#[from] PreprocessError),

    #[error("Cannot prepare scratch directory {path}: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// Stage that was running when the error occurred.
    pub fn stage(&self) -> PipelineStage {
        match self {
            Self::InputNotFound(_) | Self::Config(_) => PipelineStage::Idle,
            Self::ImageLoad(_) => PipelineStage::Assessing,
            Self::Preprocessing(_) | Self::Scratch { .. } => PipelineStage::Preprocessing,
        }
    }
}
