//! Staged, all-or-nothing output of generated artifacts, and the generation
//! manifest that records which schema they were produced from.

use crate::loader::{DataLoadError, deserialize_file, serialize_file};
use paramforge_core::fingerprint::Checkpoints;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.ron";

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ===========================================================================
// Staging
// ===========================================================================

/// Files written into a staging directory next to `target`, moved into
/// `target` by [`commit`](Self::commit). Dropping an uncommitted set removes
/// the staging directory and leaves `target` untouched.
#[derive(Debug)]
pub struct ArtifactSet {
    target: PathBuf,
    staging: PathBuf,
    committed: bool,
}

impl ArtifactSet {
    pub fn begin(target: &Path) -> Result<Self, ArtifactError> {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let staging = target.with_file_name(format!(".{name}.staging-{}", std::process::id()));
        if staging.exists() {
            std::fs::remove_dir_all(&staging).map_err(io_error(&staging))?;
        }
        std::fs::create_dir_all(&staging).map_err(io_error(&staging))?;
        Ok(Self {
            target: target.to_path_buf(),
            staging,
            committed: false,
        })
    }

    /// Where external tools should write their output.
    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    pub fn write(&mut self, relative: &str, bytes: &[u8]) -> Result<PathBuf, ArtifactError> {
        let path = self.staging.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        std::fs::write(&path, bytes).map_err(io_error(&path))?;
        Ok(path)
    }

    /// Every staged file, relative to the staging directory.
    pub fn staged_files(&self) -> Result<BTreeSet<PathBuf>, ArtifactError> {
        let mut out = BTreeSet::new();
        collect_files(&self.staging, &self.staging, &mut out)?;
        Ok(out)
    }

    /// Move every staged file into the target directory, replacing files of
    /// the same name. Returns the committed paths, relative to the target.
    pub fn commit(mut self) -> Result<Vec<PathBuf>, ArtifactError> {
        let files = self.staged_files()?;
        std::fs::create_dir_all(&self.target).map_err(io_error(&self.target))?;
        for rel in &files {
            let to = self.target.join(rel);
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent).map_err(io_error(parent))?;
            }
            let from = self.staging.join(rel);
            std::fs::rename(&from, &to).map_err(io_error(&from))?;
        }
        std::fs::remove_dir_all(&self.staging).map_err(io_error(&self.staging))?;
        self.committed = true;
        tracing::info!(target = %self.target.display(), files = files.len(), "artifacts committed");
        Ok(files.into_iter().collect())
    }
}

impl Drop for ArtifactSet {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_dir_all(&self.staging);
        }
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut BTreeSet<PathBuf>) -> Result<(), ArtifactError> {
    for entry in std::fs::read_dir(dir).map_err(io_error(dir))? {
        let path = entry.map_err(io_error(dir))?.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.insert(rel.to_path_buf());
        }
    }
    Ok(())
}

// ===========================================================================
// Manifest
// ===========================================================================

/// Written to `<output_dir>/manifest.ron` after each generation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationManifest {
    #[serde(default)]
    pub checkpoints: Checkpoints,
    /// Artifacts produced by the last code generation, relative to the
    /// output directory.
    #[serde(default)]
    pub code_artifacts: Vec<PathBuf>,
    #[serde(default)]
    pub data_artifacts: Vec<PathBuf>,
}

impl GenerationManifest {
    /// The manifest in `output_dir`, or an empty one if none was written yet.
    pub fn load(output_dir: &Path) -> Result<Self, DataLoadError> {
        let path = output_dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        deserialize_file(&path)
    }

    pub fn save(&self, output_dir: &Path) -> Result<(), DataLoadError> {
        serialize_file(&output_dir.join(MANIFEST_FILE), self)
    }

    /// Whether every recorded code artifact still exists.
    pub fn code_artifacts_present(&self, output_dir: &Path) -> bool {
        !self.code_artifacts.is_empty()
            && self.code_artifacts.iter().all(|p| output_dir.join(p).is_file())
    }
}
