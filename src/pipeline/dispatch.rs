//! Filter dispatch: native executable first, in-process fallback second.
//!
//! Native contract: `preprocess <input> <output> <filter|auto>`, exit 0 and
//! the output file present on success. Any native failure is recoverable
//! and triggers the fallback exactly once; the native path is never retried.
//! Both paths write a staging sibling and rename it over the output, so an
//! output path equal to the input never loses the input.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::filters::apply_filter;
use super::process::{ProcessRunner, ProcessSpec, TokioProcessRunner};
use super::raster::load_rgb_image;
use super::scratch::staging_path;
use super::types::FilterKind;
use super::orchestrator::PipelineStage;
use super::ImageLoadError;
use crate::config::PipelineConfig;

// ═══════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════

/// Why the native path did not produce an output. Always recoverable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NativeExecutionError {
    #[error("native executable not found at {0}")]
    Missing(PathBuf),

    #[error("failed to start native executable: {0}")]
    Spawn(String),

    #[error("native executable exited with code {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("native executable timed out after {}s", .after.as_secs_f64())]
    TimedOut { after: Duration },

    #[error("native executable exited 0 but wrote no output at {0}")]
    OutputMissing(PathBuf),

    #[error("cannot move native output into place at {path}: {reason}")]
    Install { path: PathBuf, reason: String },
}

/// Why the in-process fallback failed.
#[derive(Error, Debug)]
pub enum FallbackError {
    #[error(transparent)]
    Load(#[from] ImageLoadError),

    #[error("Cannot write {path}: {reason}")]
    Save { path: PathBuf, reason: String },
}

/// Both paths exhausted. Terminal for the pipeline.
#[derive(Error, Debug)]
#[error("Preprocessing {input} failed (native: {native}; fallback: {fallback})")]
pub struct PreprocessError {
    pub input: PathBuf,
    pub native: NativeExecutionError,
    #[source]
    pub fallback: FallbackError,
}

impl NativeExecutionError {
    pub fn stage(&self) -> PipelineStage {
        PipelineStage::Preprocessing
    }
}

impl FallbackError {
    pub fn stage(&self) -> PipelineStage {
        PipelineStage::Preprocessing
    }
}

impl PreprocessError {
    pub fn stage(&self) -> PipelineStage {
        PipelineStage::Preprocessing
    }
}

// ═══════════════════════════════════════════════════════════
// Result types
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessBackend {
    Native,
    Fallback,
}

/// A corrected image on disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreprocessOutcome {
    pub output_path: PathBuf,
    pub filter: FilterKind,
    pub backend: PreprocessBackend,
    /// Why the native path was skipped, when the fallback ran.
    pub native_failure: Option<String>,
}

// ═══════════════════════════════════════════════════════════
// Dispatcher
// ═══════════════════════════════════════════════════════════

pub struct PreprocessDispatcher {
    native_binary: PathBuf,
    timeout: Duration,
    runner: Box<dyn ProcessRunner>,
}

impl PreprocessDispatcher {
    pub fn new(native_binary: PathBuf, timeout: Duration, runner: Box<dyn ProcessRunner>) -> Self {
        Self {
            native_binary,
            timeout,
            runner,
        }
    }

    /// Production dispatcher for a pipeline config.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.native_binary.clone(),
            config.native_timeout(),
            Box::new(TokioProcessRunner),
        )
    }

    pub fn native_binary(&self) -> &Path {
        &self.native_binary
    }

    pub fn native_available(&self) -> bool {
        self.native_binary.exists()
    }

    /// Apply `filter` to `input`, writing `output`.
    pub fn apply(
        &self,
        input: &Path,
        output: &Path,
        filter: FilterKind,
    ) -> Result<PreprocessOutcome, PreprocessError> {
        let native = match self.run_native(input, output, filter) {
            Ok(()) => {
                info!(output = %output.display(), filter = %filter, "Native preprocessing succeeded");
                return Ok(PreprocessOutcome {
                    output_path: output.to_path_buf(),
                    filter,
                    backend: PreprocessBackend::Native,
                    native_failure: None,
                });
            }
            Err(e) => e,
        };

        warn!(error = %native, filter = %filter, "Native preprocessing failed, using in-process fallback");

        match apply_fallback(input, output, filter) {
            Ok(()) => Ok(PreprocessOutcome {
                output_path: output.to_path_buf(),
                filter,
                backend: PreprocessBackend::Fallback,
                native_failure: Some(native.to_string()),
            }),
            Err(fallback) => Err(PreprocessError {
                input: input.to_path_buf(),
                native,
                fallback,
            }),
        }
    }

    fn run_native(
        &self,
        input: &Path,
        output: &Path,
        filter: FilterKind,
    ) -> Result<(), NativeExecutionError> {
        if !self.native_available() {
            return Err(NativeExecutionError::Missing(self.native_binary.clone()));
        }

        // Never hand the native side `output` directly: it may be `input`.
        let staging = staging_path(output);

        let spec = ProcessSpec::new(&self.native_binary, self.timeout)
            .arg(input)
            .arg(staging.path())
            .arg(filter.as_str());
        debug!(command = %spec.display(), "Running native preprocessing");

        let result = self.runner.run(&spec).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => NativeExecutionError::Missing(self.native_binary.clone()),
            _ => NativeExecutionError::Spawn(e.to_string()),
        })?;

        if result.timed_out {
            return Err(NativeExecutionError::TimedOut {
                after: self.timeout,
            });
        }
        if result.exit_code != Some(0) {
            return Err(NativeExecutionError::NonZeroExit {
                code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
            });
        }
        if !result.stdout.trim().is_empty() {
            debug!(stdout = %result.stdout.trim(), "Native preprocessing output");
        }
        if !staging.path().exists() {
            return Err(NativeExecutionError::OutputMissing(output.to_path_buf()));
        }
        std::fs::rename(staging.path(), output).map_err(|e| NativeExecutionError::Install {
            path: output.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

/// In-process path: decode, filter, encode (format from `output`'s extension).
/// `output` is only replaced once the encoded image is complete.
pub fn apply_fallback(input: &Path, output: &Path, filter: FilterKind) -> Result<(), FallbackError> {
    let image = load_rgb_image(input)?;
    let filtered = apply_filter(image, filter);
    let staging = staging_path(output);
    let save_error = |e: &dyn std::fmt::Display| FallbackError::Save {
        path: output.to_path_buf(),
        reason: e.to_string(),
    };
    filtered.save(staging.path()).map_err(|e| save_error(&e))?;
    std::fs::rename(staging.path(), output).map_err(|e| save_error(&e))?;
    debug!(output = %output.display(), filter = %filter, "Fallback preprocessing written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::process::mock::MockProcessRunner;
    use image::{Rgb, RgbImage};

    struct Fixture {
        dir: tempfile::TempDir,
        input: PathBuf,
        output: PathBuf,
        native: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("scene.png");
        RgbImage::from_fn(30, 20, |x, y| Rgb([(x * 8) as u8, (y * 12) as u8, 60]))
            .save(&input)
            .unwrap();
        let native = dir.path().join("preprocess");
        std::fs::write(&native, b"").unwrap();
        let output = dir.path().join("out.png");
        Fixture {
            dir,
            input,
            output,
            native,
        }
    }

    fn dispatcher(native: PathBuf, runner: MockProcessRunner) -> PreprocessDispatcher {
        PreprocessDispatcher::new(native, Duration::from_secs(60), Box::new(runner))
    }

    #[test]
    fn missing_native_uses_fallback_without_spawning() {
        let f = fixture();
        let runner = MockProcessRunner::exiting(0, "");
        let calls = runner.calls.clone();
        let d = dispatcher(f.dir.path().join("absent"), runner);

        let outcome = d.apply(&f.input, &f.output, FilterKind::Blur).unwrap();
        assert_eq!(outcome.backend, PreprocessBackend::Fallback);
        assert!(outcome.native_failure.unwrap().contains("not found"));
        assert!(f.output.exists());
        assert!(calls.lock().unwrap().is_empty());
    }

    fn writing_native() -> MockProcessRunner {
        MockProcessRunner::new(|spec| {
            std::fs::write(&spec.args[1], b"native").unwrap();
            Ok(crate::pipeline::process::ProcessOutput {
                exit_code: Some(0),
                ..Default::default()
            })
        })
    }

    #[test]
    fn native_arguments_are_positional() {
        let f = fixture();
        let runner = writing_native();
        let calls = runner.calls.clone();
        let d = dispatcher(f.native.clone(), runner);

        let outcome = d.apply(&f.input, &f.output, FilterKind::Auto).unwrap();
        assert_eq!(outcome.backend, PreprocessBackend::Native);
        assert_eq!(outcome.native_failure, None);
        assert_eq!(std::fs::read(&f.output).unwrap(), b"native");

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, f.native);
        assert_eq!(calls[0].args.len(), 3);
        assert_eq!(calls[0].args[0].as_os_str(), f.input.as_os_str());
        // Written beside the output, then renamed over it.
        let staged = Path::new(&calls[0].args[1]);
        assert_eq!(staged.parent(), f.output.parent());
        assert!(staged.to_string_lossy().ends_with("_out.png"));
        assert!(!staged.exists());
        assert_eq!(calls[0].args[2], "auto");
        assert_eq!(calls[0].timeout, Duration::from_secs(60));
    }

    #[test]
    fn timeout_falls_back_exactly_once() {
        let f = fixture();
        let runner = MockProcessRunner::timing_out();
        let calls = runner.calls.clone();
        let d = dispatcher(f.native.clone(), runner);

        let outcome = d.apply(&f.input, &f.output, FilterKind::Sharpen).unwrap();
        assert_eq!(outcome.backend, PreprocessBackend::Fallback);
        assert!(outcome.native_failure.unwrap().contains("timed out"));
        assert_eq!(calls.lock().unwrap().len(), 1, "native must not be retried");
        assert!(f.output.exists());
    }

    #[test]
    fn non_zero_exit_falls_back() {
        let f = fixture();
        let d = dispatcher(f.native.clone(), MockProcessRunner::exiting(1, "cannot open input\n"));

        let outcome = d.apply(&f.input, &f.output, FilterKind::Clahe).unwrap();
        assert_eq!(outcome.backend, PreprocessBackend::Fallback);
        assert!(outcome.native_failure.unwrap().contains("cannot open input"));
    }

    #[test]
    fn zero_exit_without_output_falls_back() {
        let f = fixture();
        std::fs::write(&f.output, b"stale").unwrap();
        let d = dispatcher(f.native.clone(), MockProcessRunner::exiting(0, ""));

        let outcome = d.apply(&f.input, &f.output, FilterKind::Denoise).unwrap();
        assert_eq!(outcome.backend, PreprocessBackend::Fallback);
        assert!(outcome.native_failure.unwrap().contains("wrote no output"));
        // Fallback replaced the stale bytes with a decodable image.
        assert!(image::open(&f.output).is_ok());
    }

    #[test]
    fn both_paths_failing_is_error() {
        let f = fixture();
        let unreadable = f.dir.path().join("corrupt.png");
        std::fs::write(&unreadable, b"garbage").unwrap();
        let d = dispatcher(f.native.clone(), MockProcessRunner::exiting(1, "bad input"));

        let err = d.apply(&unreadable, &f.output, FilterKind::Blur).unwrap_err();
        assert_eq!(err.input, unreadable);
        assert!(matches!(err.native, NativeExecutionError::NonZeroExit { code: Some(1), .. }));
        assert!(matches!(err.fallback, FallbackError::Load(_)));
    }

    #[test]
    fn in_place_output_keeps_input_when_native_fails() {
        let f = fixture();
        let original = load_rgb_image(&f.input).unwrap();
        let d = dispatcher(f.native.clone(), MockProcessRunner::exiting(1, "cannot open input"));

        let outcome = d.apply(&f.input, &f.input, FilterKind::Blur).unwrap();
        assert_eq!(outcome.backend, PreprocessBackend::Fallback);
        assert_eq!(outcome.output_path, f.input);
        let filtered = load_rgb_image(&f.input).unwrap();
        assert_eq!(filtered.dimensions(), original.dimensions());
        assert_ne!(filtered, original);
    }

    #[test]
    fn in_place_output_keeps_input_when_native_writes_nothing() {
        let f = fixture();
        let d = dispatcher(f.native.clone(), MockProcessRunner::exiting(0, ""));

        let outcome = d.apply(&f.input, &f.input, FilterKind::Sharpen).unwrap();
        assert!(outcome.native_failure.unwrap().contains("wrote no output"));
        assert!(load_rgb_image(&f.input).is_ok());
    }

    #[test]
    fn in_place_native_success_replaces_input() {
        let f = fixture();
        let d = dispatcher(f.native.clone(), writing_native());

        let outcome = d.apply(&f.input, &f.input, FilterKind::Edge).unwrap();
        assert_eq!(outcome.backend, PreprocessBackend::Native);
        assert_eq!(std::fs::read(&f.input).unwrap(), b"native");
    }

    #[test]
    fn failed_native_leaves_no_staging_files() {
        let f = fixture();
        let d = dispatcher(f.native.clone(), MockProcessRunner::exiting(1, "bad input"));
        d.apply(&f.input, &f.output, FilterKind::Blur).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(f.dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(".staging_"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn spawn_not_found_maps_to_missing() {
        let f = fixture();
        let runner = MockProcessRunner::new(|_| {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))
        });
        let d = dispatcher(f.native.clone(), runner);

        let outcome = d.apply(&f.input, &f.output, FilterKind::Blur).unwrap();
        assert!(outcome.native_failure.unwrap().contains("not found"));
    }

    #[test]
    fn fallback_output_keeps_dimensions_for_every_filter() {
        let f = fixture();
        for kind in FilterKind::ALL {
            let out = f.dir.path().join(format!("{kind}.png"));
            apply_fallback(&f.input, &out, kind).unwrap();
            let img = image::open(&out).unwrap().to_rgb8();
            assert_eq!(img.dimensions(), (30, 20), "{kind}");
        }
    }

    #[cfg(unix)]
    mod real_process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("preprocess.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[test]
        fn successful_native_run() {
            let f = fixture();
            let native = script(f.dir.path(), r#"cp "$1" "$2""#);
            let d = PreprocessDispatcher::new(native, Duration::from_secs(10), Box::new(TokioProcessRunner));

            let outcome = d.apply(&f.input, &f.output, FilterKind::Edge).unwrap();
            assert_eq!(outcome.backend, PreprocessBackend::Native);
            assert_eq!(std::fs::read(&f.output).unwrap(), std::fs::read(&f.input).unwrap());
        }

        #[test]
        fn hung_native_is_killed_and_fallback_runs() {
            let f = fixture();
            let native = script(f.dir.path(), "sleep 5");
            let d = PreprocessDispatcher::new(native, Duration::from_millis(200), Box::new(TokioProcessRunner));

            let outcome = d.apply(&f.input, &f.output, FilterKind::Blur).unwrap();
            assert_eq!(outcome.backend, PreprocessBackend::Fallback);
            assert!(outcome.native_failure.unwrap().contains("timed out"));
        }
    }
}
