//! Media file copying with staleness check and size verification

use crate::export::{CopyOutcome, FileCopier};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// File copy errors
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("Source file not found: {0}")]
    SourceMissing(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("Cannot express {path} relative to {base}")]
    NoRelativePath { path: PathBuf, base: PathBuf },
}

impl CopyError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Copies files on the local filesystem
#[derive(Debug, Clone)]
pub struct FsFileCopier {
    max_retries: usize,
}

impl Default for FsFileCopier {
    fn default() -> Self {
        Self::new(3)
    }
}

impl FsFileCopier {
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries: max_retries.max(1),
        }
    }
}

impl FileCopier for FsFileCopier {
    fn copy_if_stale(
        &self,
        source: &Path,
        destination: &Path,
        relative_to: &Path,
    ) -> Result<CopyOutcome, CopyError> {
        let source_meta = match std::fs::metadata(source) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CopyError::SourceMissing(source.to_path_buf()))
            }
            Err(e) => return Err(CopyError::io(source, e)),
        };
        let relative_path = relative_path(destination, relative_to)?;

        if !is_stale(source_meta.modified().ok(), destination) {
            log::debug!("[copy] {} is up to date", destination.display());
            return Ok(CopyOutcome {
                relative_path,
                copied: false,
            });
        }

        copy_with_verification(source, destination, source_meta.len(), self.max_retries)?;
        log::debug!("[copy] {} -> {}", source.display(), destination.display());
        Ok(CopyOutcome {
            relative_path,
            copied: true,
        })
    }
}

/// Destination is missing, or older than the source
fn is_stale(source_modified: Option<SystemTime>, destination: &Path) -> bool {
    let Ok(dest_meta) = std::fs::metadata(destination) else {
        return true;
    };
    match (source_modified, dest_meta.modified().ok()) {
        (Some(src), Some(dst)) => src > dst,
        _ => true,
    }
}

/// `path` relative to `base` with `/` separators
pub fn relative_path(path: &Path, base: &Path) -> Result<String, CopyError> {
    let relative = pathdiff::diff_paths(path, base).ok_or_else(|| CopyError::NoRelativePath {
        path: path.to_path_buf(),
        base: base.to_path_buf(),
    })?;

    let parts: Vec<String> = relative
        .components()
        .map(|c| match c {
            Component::ParentDir => "..".to_string(),
            Component::CurDir => ".".to_string(),
            other => other.as_os_str().to_string_lossy().into_owned(),
        })
        .collect();
    Ok(parts.join("/"))
}

/// Copy a file and verify the written size, retrying on mismatch
pub fn copy_with_verification(
    source: &Path,
    destination: &Path,
    expected_size: u64,
    max_retries: usize,
) -> Result<(), CopyError> {
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CopyError::io(parent, e))?;
    }

    let mut actual = 0;
    for attempt in 1..=max_retries.max(1) {
        std::fs::copy(source, destination).map_err(|e| CopyError::io(destination, e))?;

        match std::fs::metadata(destination) {
            Ok(meta) if meta.len() == expected_size => return Ok(()),
            Ok(meta) => {
                actual = meta.len();
                log::warn!(
                    "Size mismatch on attempt {} for {}: expected {} got {}",
                    attempt,
                    destination.display(),
                    expected_size,
                    actual
                );
            }
            Err(e) => {
                log::warn!(
                    "Size verification failed on attempt {} for {}: {}",
                    attempt,
                    destination.display(),
                    e
                );
            }
        }
    }

    Err(CopyError::SizeMismatch {
        path: destination.to_path_buf(),
        expected: expected_size,
        actual,
    })
}
