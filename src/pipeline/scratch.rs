//! Scratch directory for intermediate preprocessed images.

use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use super::PipelineError;

#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    /// Use `root`, creating it if needed.
    pub fn new(root: &Path) -> Result<Self, PipelineError> {
        std::fs::create_dir_all(root).map_err(|source| PipelineError::Scratch {
            path: root.to_path_buf(),
            source,
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `preprocessed_<run-id>_<input file name>`. The run id keeps concurrent
    /// runs on same-named inputs apart; the original name keeps the extension
    /// (and thus the encoder) intact.
    pub fn artifact_path(&self, input: &Path, run_id: Uuid) -> ScratchPath {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image.png".to_string());
        ScratchPath {
            path: self.root.join(format!("preprocessed_{run_id}_{name}")),
            keep: false,
        }
    }
}

/// Hidden sibling of `target` to write into before renaming over it. Same
/// directory (so the rename is atomic) and same trailing name (so the
/// extension still selects the encoder).
pub fn staging_path(target: &Path) -> ScratchPath {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image.png".to_string());
    ScratchPath {
        path: target.with_file_name(format!(".staging_{}_{name}", Uuid::new_v4())),
        keep: false,
    }
}

/// A scratch file that is removed on drop unless [`ScratchPath::keep`] is called.
#[derive(Debug)]
pub struct ScratchPath {
    path: PathBuf,
    keep: bool,
}

impl ScratchPath {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the file and release the guard.
    pub fn keep(mut self) -> PathBuf {
        self.keep = true;
        self.path.clone()
    }
}

impl Drop for ScratchPath {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed partial scratch artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(path = %self.path.display(), error = %e, "Cannot remove scratch artifact"),
        }
    }
}
