//! Cache directory checks and listing.

use crate::error::SyncError;
use std::path::{Path, PathBuf};
use tracing::debug;

const WRITE_PROBE: &str = ".pwnsync-write-probe";
// Extension of a download that has not been renamed into place yet.
const PARTIAL_EXTENSION: &str = "part";

/// Fails unless `dir` exists, is a directory, and can be listed and written.
///
/// Runs once before any stage starts. Errors are fatal and never retried.
pub fn validate_cache_dir(dir: &Path) -> Result<(), SyncError> {
    let metadata = std::fs::metadata(dir)
        .map_err(|e| SyncError::CacheDir(format!("{}: {}", dir.display(), e)))?;
    if !metadata.is_dir() {
        return Err(SyncError::CacheDir(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    std::fs::read_dir(dir)
        .map_err(|e| SyncError::CacheDir(format!("{} is not readable: {}", dir.display(), e)))?;

    let probe = dir.join(WRITE_PROBE);
    std::fs::File::create(&probe)
        .and_then(|_| std::fs::remove_file(&probe))
        .map_err(|e| SyncError::CacheDir(format!("{} is not writable: {}", dir.display(), e)))?;

    debug!("Cache directory {} is usable", dir.display());
    Ok(())
}

/// Regular files directly inside a directory, yielded one at a time.
///
/// Subdirectories and symlinks are skipped and never descended into, and so
/// are `.part` files left behind by a download that was killed mid-body.
pub struct CacheFiles {
    entries: tokio::fs::ReadDir,
}

impl CacheFiles {
    pub async fn open(dir: &Path) -> Result<Self, SyncError> {
        Ok(Self {
            entries: tokio::fs::read_dir(dir).await?,
        })
    }

    /// Next regular file, or `None` once the directory is exhausted.
    pub async fn next_file(&mut self) -> Result<Option<PathBuf>, SyncError> {
        while let Some(entry) = self.entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                debug!("Skipping {}, not a regular file", path.display());
            } else if path.extension().is_some_and(|ext| ext == PARTIAL_EXTENSION) {
                debug!("Skipping {}, unfinished download", path.display());
            } else {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

/// Collects every regular file directly inside `dir`, sorted by path.
pub async fn list_cache_files(dir: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let mut files = CacheFiles::open(dir).await?;
    let mut paths = Vec::new();
    while let Some(path) = files.next_file().await? {
        paths.push(path);
    }
    paths.sort();
    Ok(paths)
}
