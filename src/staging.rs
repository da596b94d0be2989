//! Small files are copied out of their snapshot into a private,
//! read-only staging file, so the snapshot can be released before the
//! upload even starts.
use std::fs::Permissions;
use std::io::ErrorKind;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempPath;
use tracing::instrument;

use crate::chain_error;
use crate::chain_warn;
use crate::filtered_io_error;
use crate::result::Level;
use crate::result::Result;

/// Staged copies are named `.snapvault-stage.XXXXXX.tmp`.
const STAGE_PREFIX: &str = ".snapvault-stage.";
const STAGE_SUFFIX: &str = ".tmp";

/// Staged files older than this when we start up belong to a dead
/// process.
const STALE_STAGE_GRACE_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct Staging {
    directory: PathBuf,
}

/// Determines whether the file at `path` has been untouched for
/// `max_age` or longer.
fn file_is_stale(path: &Path, max_age: Duration) -> Result<bool> {
    let meta = std::fs::metadata(path).map_err(|e| {
        filtered_io_error!(e, ErrorKind::NotFound => Level::DEBUG, "failed to stat file", ?path)
    })?;
    let modified = meta
        .modified()
        .map_err(|e| chain_error!(e, "failed to read mtime", ?path))?;
    let elapsed = modified
        .elapsed()
        .map_err(|e| chain_warn!(e, "time went backward", ?path))?;
    Ok(elapsed >= max_age)
}

impl Staging {
    /// Returns a stager for `directory`, after creating it if needed.
    #[instrument(err)]
    pub fn new(directory: PathBuf) -> Result<Staging> {
        std::fs::create_dir_all(&directory)
            .map_err(|e| chain_error!(e, "failed to create staging directory", ?directory))?;
        Ok(Staging { directory })
    }

    /// Copies `contents` to a fresh read-only staging file.  The file
    /// is deleted when the returned path is dropped.
    pub fn stage_file(&self, contents: &mut impl Read) -> Result<TempPath> {
        let mut temp = tempfile::Builder::new()
            .prefix(STAGE_PREFIX)
            .suffix(STAGE_SUFFIX)
            .tempfile_in(&self.directory)
            .map_err(|e| chain_error!(e, "failed to create staging file", directory=?self.directory))?;

        std::io::copy(contents, temp.as_file_mut())
            .map_err(|e| chain_error!(e, "failed to copy to staging file", path=?temp.path()))?;

        temp.as_file()
            .set_permissions(Permissions::from_mode(0o444))
            .map_err(|e| chain_error!(e, "failed to set staging file read-only", path=?temp.path()))?;
        Ok(temp.into_temp_path())
    }

    /// Deletes staged files left behind by earlier processes.
    #[instrument(skip(self), fields(directory=?self.directory), err)]
    pub fn cleanup_stale_files(&self) -> Result<usize> {
        self.cleanup_older_than(STALE_STAGE_GRACE_PERIOD)
    }

    fn cleanup_older_than(&self, max_age: Duration) -> Result<usize> {
        let mut removed = 0;

        for entry in std::fs::read_dir(&self.directory)
            .map_err(|e| chain_error!(e, "failed to list staging directory", directory=?self.directory))?
            .flatten()
        {
            let is_staged = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(STAGE_PREFIX) && name.ends_with(STAGE_SUFFIX))
                .unwrap_or(false);
            let path = entry.path();
            if !is_staged || !matches!(file_is_stale(&path, max_age), Ok(true)) {
                continue;
            }

            match std::fs::remove_file(&path) {
                Ok(_) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(error) => tracing::error!(%error, ?path, "failed to remove stale staging file"),
            }
        }

        Ok(removed)
    }
}

#[test]
fn test_stage_file() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let staging = Staging::new(dir.path().join("staging")).expect("should create staging");

    let staged = staging
        .stage_file(&mut &b"hello"[..])
        .expect("should stage");
    assert_eq!(std::fs::read(&staged).expect("should read"), b"hello");
    assert!(std::fs::metadata(&staged)
        .expect("should stat")
        .permissions()
        .readonly());

    let path = staged.to_path_buf();
    drop(staged);
    assert!(!path.exists());
}

#[test]
fn test_cleanup_stale_files() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let staging = Staging::new(dir.path().to_owned()).expect("should create staging");

    let leftover = staging
        .stage_file(&mut &b"left behind"[..])
        .expect("should stage");
    let leftover = leftover.keep().expect("should keep");
    std::fs::write(dir.path().join("unrelated"), b"keep me").expect("should write");

    assert_eq!(staging.cleanup_older_than(Duration::ZERO).expect("should clean up"), 1);
    assert!(!leftover.exists());
    assert!(dir.path().join("unrelated").exists());

    // Fresh files survive the default grace period.
    let fresh = staging
        .stage_file(&mut &b"fresh"[..])
        .expect("should stage")
        .keep()
        .expect("should keep");
    assert_eq!(staging.cleanup_stale_files().expect("should clean up"), 0);
    assert!(fresh.exists());
}
