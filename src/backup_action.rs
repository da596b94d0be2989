//! The actions that flow from the stabilization pipeline to the
//! backup queue, and the upload work items the queue hands to the
//! upload pool.
use std::path::Path;
use std::path::PathBuf;
use tempfile::TempPath;

use crate::snapshot_tracker::SnapshotReference;

#[derive(Debug)]
pub enum BackupAction {
    /// Upload the stable snapshotted contents of `source.path()`.
    Upload { source: SnapshotReference },
    /// `from` (a file or a directory) was renamed to `to`.
    Move { from: PathBuf, to: PathBuf },
    /// `path` (a file or a directory) was deleted.
    Delete { path: PathBuf },
}

impl BackupAction {
    /// Returns the live path the action is about (the source, for moves).
    pub fn path(&self) -> &Path {
        match self {
            BackupAction::Upload { source } => source.path(),
            BackupAction::Move { from, .. } => from,
            BackupAction::Delete { path } => path,
        }
    }

    pub fn is_upload(&self) -> bool {
        matches!(self, BackupAction::Upload { .. })
    }
}

/// Receives the actions the stabilization pipeline produces.
pub trait ActionSink: std::fmt::Debug + Send + Sync {
    fn enqueue(&self, action: BackupAction);
}

/// Where an upload reads its bytes from.  Dropping the source
/// releases the snapshot reference, or deletes the staged copy.
#[derive(Debug)]
pub enum FileSource {
    Snapshot(SnapshotReference),
    Staged(TempPath),
}

impl FileSource {
    pub fn path(&self) -> &Path {
        match self {
            FileSource::Snapshot(reference) => reference.snapshot_path(),
            FileSource::Staged(path) => path,
        }
    }
}

/// A file the backup queue decided to upload.
#[derive(Debug)]
pub struct FileReference {
    /// The live path.
    pub path: PathBuf,
    /// The cache and remote storage key for `path`.
    pub remote_path: String,
    pub source: FileSource,
    pub size: u64,
    pub last_modified_ticks: i64,
    pub checksum: String,
}
