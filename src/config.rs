//! Application constants and pipeline configuration.
//!
//! Paths are resolved once, up front, and handed to the pipeline at
//! construction. Nothing here mutates process-wide state.
//!
//! Resolution order:
//! 1. Explicit config file (`--config <file>`)
//! 2. `<config_dir>/visionprep/config.json` if it exists
//! 3. Layout derived from the project root (`VISIONPREP_HOME`, else the
//!    current working directory)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "visionprep";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable overriding the project root.
pub const HOME_ENV: &str = "VISIONPREP_HOME";

/// Hard limit for one native preprocessing invocation.
pub const NATIVE_TIMEOUT_SECS: u64 = 60;

/// Detector inference on CPU can be slow on first run (weights download).
pub const DETECTOR_TIMEOUT_SECS: u64 = 600;

/// Minimum detector score for a reported object.
pub const DEFAULT_CONFIDENCE: f32 = 0.25;

pub const DEFAULT_DEVICE: &str = "cpu";

const CONFIG_FILE_NAME: &str = "config.json";

/// Default `EnvFilter` directive when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "visionprep_lib=info,visionprep=info"
}

/// Filter used when the CLI is run with `--verbose`.
pub fn verbose_log_filter() -> &'static str {
    "visionprep_lib=debug,visionprep=debug"
}

/// Project root: `VISIONPREP_HOME` if set, else the working directory.
pub fn project_root() -> PathBuf {
    if let Ok(dir) = std::env::var(HOME_ENV) {
        return PathBuf::from(dir);
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Per-user config file location, if the platform has a config dir.
pub fn user_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_NAME).join(CONFIG_FILE_NAME))
}

// ═══════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// ═══════════════════════════════════════════════════════════
// Configuration types
// ═══════════════════════════════════════════════════════════

/// Where and how the external object detector is invoked.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Program followed by leading arguments, e.g. `["python3", "detect.py"]`.
    /// Empty means no detector is installed.
    pub command: Vec<String>,
    /// Model weights passed as `--weights`.
    pub weights_path: PathBuf,
    /// Default results directory when the caller gives none.
    pub output_dir: PathBuf,
    pub timeout_secs: u64,
}

impl DetectorConfig {
    pub fn for_root(root: &Path) -> Self {
        let script = root.join("external").join("yolov5").join("detect.py");
        Self {
            command: vec!["python3".into(), script.to_string_lossy().into_owned()],
            weights_path: root.join("yolov5s.pt"),
            output_dir: root.join("runs").join("detect").join("pipeline_results"),
            timeout_secs: DETECTOR_TIMEOUT_SECS,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Everything the pipeline needs to locate its collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub project_root: PathBuf,
    /// Native preprocessing executable.
    pub native_binary: PathBuf,
    /// Shared directory for intermediate preprocessed images.
    pub scratch_dir: PathBuf,
    pub native_timeout_secs: u64,
    pub detector: DetectorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::for_root(&project_root())
    }
}

impl PipelineConfig {
    /// Standard layout under a project root:
    /// `bin/preprocess`, `temp/`, `yolov5s.pt`, `runs/detect/pipeline_results`.
    pub fn for_root(root: &Path) -> Self {
        Self {
            project_root: root.to_path_buf(),
            native_binary: root.join("bin").join("preprocess"),
            scratch_dir: root.join("temp"),
            native_timeout_secs: NATIVE_TIMEOUT_SECS,
            detector: DetectorConfig::for_root(root),
        }
    }

    pub fn native_timeout(&self) -> Duration {
        Duration::from_secs(self.native_timeout_secs)
    }

    /// Load a JSON config file. Missing keys fall back to the layout of the
    /// file's `project_root` (or the default root). A relative `project_root`
    /// is taken from the file's own directory; other relative paths are
    /// resolved against the root.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ConfigFile = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        Ok(file.into_config(base, project_root()))
    }

    /// Apply the resolution order described in the module docs.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match user_config_file() {
            Some(path) if path.is_file() => {
                tracing::debug!(path = %path.display(), "Using user config file");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }
}

/// On-disk shape: every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    project_root: Option<PathBuf>,
    native_binary: Option<PathBuf>,
    scratch_dir: Option<PathBuf>,
    native_timeout_secs: Option<u64>,
    detector_command: Option<Vec<String>>,
    weights_path: Option<PathBuf>,
    detector_output_dir: Option<PathBuf>,
    detector_timeout_secs: Option<u64>,
}

impl ConfigFile {
    fn into_config(self, base: &Path, fallback_root: PathBuf) -> PipelineConfig {
        let root = match self.project_root {
            Some(p) if p.is_relative() => base.join(p),
            Some(p) => p,
            None => fallback_root,
        };
        let mut config = PipelineConfig::for_root(&root);
        let rooted = |p: PathBuf| if p.is_relative() { root.join(p) } else { p };

        if let Some(p) = self.native_binary {
            config.native_binary = rooted(p);
        }
        if let Some(p) = self.scratch_dir {
            config.scratch_dir = rooted(p);
        }
        if let Some(secs) = self.native_timeout_secs {
            config.native_timeout_secs = secs;
        }
        if let Some(command) = self.detector_command {
            config.detector.command = command;
        }
        if let Some(p) = self.weights_path {
            config.detector.weights_path = rooted(p);
        }
        if let Some(p) = self.detector_output_dir {
            config.detector.output_dir = rooted(p);
        }
        if let Some(secs) = self.detector_timeout_secs {
            config.detector.timeout_secs = secs;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_follows_project_root() {
        let root = Path::new("/opt/vision");
        let config = PipelineConfig::for_root(root);
        assert_eq!(config.native_binary, root.join("bin/preprocess"));
        assert_eq!(config.scratch_dir, root.join("temp"));
        assert_eq!(config.detector.weights_path, root.join("yolov5s.pt"));
        assert_eq!(
            config.detector.output_dir,
            root.join("runs/detect/pipeline_results")
        );
        assert_eq!(config.native_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn default_detector_command_points_at_vendored_script() {
        let config = DetectorConfig::for_root(Path::new("/opt/vision"));
        assert_eq!(config.command[0], "python3");
        assert!(config.command[1].ends_with("detect.py"));
    }

    #[test]
    fn load_partial_file_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let root = dir.path().join("proj");
        let json = format!(
            r#"{{
                "project_root": {root:?},
                "native_binary": "tools/fastfilter",
                "native_timeout_secs": 5,
                "detector_command": []
            }}"#,
            root = root.to_string_lossy()
        );
        std::fs::write(&path, json).unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.project_root, root);
        assert_eq!(config.native_binary, root.join("tools/fastfilter"));
        assert_eq!(config.scratch_dir, root.join("temp"));
        assert_eq!(config.native_timeout_secs, 5);
        assert!(config.detector.command.is_empty());
    }

    #[test]
    fn relative_project_root_is_anchored_to_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"project_root": "proj", "scratch_dir": "cache"}"#).unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.project_root, dir.path().join("proj"));
        assert_eq!(config.native_binary, dir.path().join("proj/bin/preprocess"));
        assert_eq!(config.scratch_dir, dir.path().join("proj/cache"));
    }

    #[test]
    fn load_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"native_binray": "/x"}"#).unwrap();

        let err = PipelineConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn load_missing_file_is_read_error() {
        let err = PipelineConfig::load(Path::new("/nonexistent/visionprep.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn explicit_config_wins_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        std::fs::write(&path, r#"{"native_timeout_secs": 7}"#).unwrap();
        let config = PipelineConfig::resolve(Some(&path)).unwrap();
        assert_eq!(config.native_timeout_secs, 7);
    }

    #[test]
    fn app_name_is_visionprep() {
        assert_eq!(APP_NAME, "visionprep");
    }
}
