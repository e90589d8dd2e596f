//! Retention of run directories.
//!
//! Run directories are named by their start time (`%Y-%m-%dT%H-%M-%S`), so
//! a descending lexicographic sort puts the newest first.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use bwsync_common::{Error, Result};

/// What a prune pass removed and what it could not.
#[derive(Debug, Default)]
pub struct PruneReport {
    /// Directories removed, newest first.
    pub deleted: Vec<PathBuf>,
    /// One `Error::Prune` per directory that could not be removed.
    pub failed: Vec<Error>,
}

impl PruneReport {
    /// Number of directories removed.
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    /// Whether every selected directory was removed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Delete all but the newest `keep` subdirectories of `data_directory`.
///
/// `None` disables retention. Plain files and symlinks are left alone. A
/// directory that cannot be removed is reported and the pass continues.
///
/// # Errors
/// - `Prune` when `data_directory` cannot be listed
pub async fn prune(data_directory: &Path, keep: Option<usize>) -> Result<PruneReport> {
    prune_with(data_directory, keep, |dir| async move {
        tokio::fs::remove_dir_all(dir).await
    })
    .await
}

async fn prune_with<F, Fut>(
    data_directory: &Path,
    keep: Option<usize>,
    mut remove: F,
) -> Result<PruneReport>
where
    F: FnMut(PathBuf) -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    let Some(keep) = keep else {
        debug!("Retention disabled, keeping all run directories");
        return Ok(PruneReport::default());
    };

    let mut candidates = list_run_directories(data_directory)
        .await
        .map_err(|source| Error::Prune {
            path: data_directory.to_path_buf(),
            source,
        })?;

    if candidates.len() <= keep {
        debug!(
            "{} run directories present, retention allows {}",
            candidates.len(),
            keep
        );
        return Ok(PruneReport::default());
    }

    candidates.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
    let expired = candidates.split_off(keep);
    info!(
        "Deleting {} directories to meet retention policy (max. {})",
        expired.len(),
        keep
    );

    let mut report = PruneReport::default();
    for dir in expired {
        match remove(dir.clone()).await {
            Ok(()) => {
                debug!("Deleted {}", dir.display());
                report.deleted.push(dir);
            }
            Err(source) => {
                warn!("Failed to delete {}: {}", dir.display(), source);
                report.failed.push(Error::Prune { path: dir, source });
            }
        }
    }

    Ok(report)
}

async fn list_run_directories(data_directory: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(data_directory).await?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}
