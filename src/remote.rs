//! Remote storage holds opaque blobs at slash-separated paths.  Large
//! files are stored as numbered parts, next to (not inside) the
//! whole-file blob.
//!
//! Every operation is cancellable, and every failure is classified
//! as transient or permanent (see `result::Error::is_transient`).
use std::fs::File;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::chain_error;
use crate::chain_transient;
use crate::fresh_info;
use crate::fresh_transient;
use crate::result::Error;
use crate::result::Result;

/// One blob listed by `RemoteStorage::list`.
#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct RemoteEntry {
    pub path: String,
    pub size: u64,
}

pub trait RemoteStorage: std::fmt::Debug + Send + Sync {
    /// Uploads `contents` as the blob at `path`.  Returns the new
    /// content key, if the storage uses one.
    fn upload_whole(
        &self,
        path: &str,
        contents: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<String>>;

    /// Uploads `contents` as part `part` of the file at `path`.
    fn upload_part(
        &self,
        path: &str,
        part: u32,
        contents: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<String>>;

    /// Deletes the blob at `path`.  Deleting a missing blob succeeds.
    fn delete_whole(&self, path: &str, cancel: &CancellationToken) -> Result<()>;

    /// Deletes part `part` of `path`.  Deleting a missing part succeeds.
    fn delete_part(&self, path: &str, part: u32, cancel: &CancellationToken) -> Result<()>;

    /// Moves the blob at `from`, and all its parts, to `to`.
    fn rename(&self, from: &str, to: &str, cancel: &CancellationToken) -> Result<()>;

    /// Lists all the blobs whose path starts with `prefix`.
    fn list(&self, prefix: &str, cancel: &CancellationToken) -> Result<Vec<RemoteEntry>>;
}

/// Returns the remote (and cache) path for the local file `path`:
/// absolute paths lose their leading slash.
pub fn remote_path_for(path: &Path) -> Result<String> {
    let string = path
        .to_str()
        .ok_or_else(|| fresh_info!("local path is not valid utf-8", ?path))?;

    let trimmed = string.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(fresh_info!("local path has no remote equivalent", ?path));
    }

    Ok(trimmed.to_string())
}

/// Inverse of `remote_path_for`.
pub fn local_path_for(remote: &str) -> PathBuf {
    Path::new("/").join(remote)
}

/// Returns the name of the blob for part `part` of `path`.
pub fn part_blob_path(path: &str, part: u32) -> String {
    format!("{}.part{}", path, part)
}

/// Returns true if the remote path `candidate` is `path` or a
/// descendant of `path`.
pub(crate) fn is_at_or_under(candidate: &str, path: &str) -> bool {
    match candidate.strip_prefix(path) {
        Some("") => true,
        Some(rest) => rest.starts_with('/') || path.ends_with('/'),
        None => false,
    }
}

/// Returns Err if `cancel` has fired.
pub(crate) fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(fresh_transient!("remote operation cancelled"))
    } else {
        Ok(())
    }
}

/// Classifies a local I/O error: only interruptions and timeouts are
/// worth retrying.
fn classify_io_error(error: std::io::Error, message: &'static str, path: &Path) -> Error {
    match error.kind() {
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            chain_transient!(error, "local blob operation failed", %message, ?path)
        }
        _ => chain_error!(error, "local blob operation failed", %message, ?path),
    }
}

/// A `LocalDirectoryStorage` stores blobs as files under a root
/// directory: whole files at `root/path`, and parts at
/// `root/path.part<N>`.
#[derive(Debug)]
pub struct LocalDirectoryStorage {
    root: PathBuf,
}

impl LocalDirectoryStorage {
    pub fn new(root: PathBuf) -> Result<LocalDirectoryStorage> {
        std::fs::create_dir_all(&root)
            .map_err(|e| chain_error!(e, "failed to create local storage root", ?root))?;
        Ok(LocalDirectoryStorage { root })
    }

    fn blob_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Atomically publishes `contents` at `target`.
    fn write_blob(&self, target: &Path, contents: &[u8]) -> Result<()> {
        let parent = target.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(parent)
            .map_err(|e| classify_io_error(e, "failed to create blob directory", parent))?;

        let mut temp = tempfile::Builder::new()
            .suffix(".tmp")
            .tempfile_in(parent)
            .map_err(|e| classify_io_error(e, "failed to create temporary blob", parent))?;
        temp.write_all(contents)
            .map_err(|e| classify_io_error(e, "failed to write temporary blob", target))?;
        temp.persist(target)
            .map_err(|e| classify_io_error(e.error, "failed to publish blob", target))?;
        Ok(())
    }

    fn remove_blob(&self, target: &Path) -> Result<()> {
        match std::fs::remove_file(target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(classify_io_error(e, "failed to delete blob", target)),
        }
    }

    /// Returns the part numbers stored for `path`.
    fn list_parts(&self, path: &str) -> Result<Vec<u32>> {
        let whole = self.blob_path(path);
        let (parent, name) = match (whole.parent(), whole.file_name().and_then(|n| n.to_str())) {
            (Some(parent), Some(name)) => (parent, format!("{}.part", name)),
            _ => return Ok(Vec::new()),
        };

        let entries = match std::fs::read_dir(parent) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(classify_io_error(e, "failed to list blob directory", parent)),
        };

        let mut parts: Vec<u32> = entries
            .flatten()
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()?
                    .strip_prefix(name.as_str())?
                    .parse()
                    .ok()
            })
            .collect();
        parts.sort_unstable();
        Ok(parts)
    }
}

impl RemoteStorage for LocalDirectoryStorage {
    #[instrument(level = "debug", skip(contents, cancel), fields(len = contents.len()), err)]
    fn upload_whole(
        &self,
        path: &str,
        contents: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        check_cancelled(cancel)?;
        self.write_blob(&self.blob_path(path), contents)?;
        Ok(None)
    }

    #[instrument(level = "debug", skip(contents, cancel), fields(len = contents.len()), err)]
    fn upload_part(
        &self,
        path: &str,
        part: u32,
        contents: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        check_cancelled(cancel)?;
        self.write_blob(&self.blob_path(&part_blob_path(path, part)), contents)?;
        Ok(None)
    }

    #[instrument(level = "debug", skip(cancel), err)]
    fn delete_whole(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        self.remove_blob(&self.blob_path(path))
    }

    #[instrument(level = "debug", skip(cancel), err)]
    fn delete_part(&self, path: &str, part: u32, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        self.remove_blob(&self.blob_path(&part_blob_path(path, part)))
    }

    #[instrument(level = "debug", skip(cancel), err)]
    fn rename(&self, from: &str, to: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;

        let mut moves = vec![(self.blob_path(from), self.blob_path(to))];
        for part in self.list_parts(from)? {
            moves.push((
                self.blob_path(&part_blob_path(from, part)),
                self.blob_path(&part_blob_path(to, part)),
            ));
        }

        let mut moved = false;
        for (source, destination) in moves {
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| classify_io_error(e, "failed to create blob directory", parent))?;
            }

            match std::fs::rename(&source, &destination) {
                Ok(()) => moved = true,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(classify_io_error(e, "failed to rename blob", &source)),
            }
        }

        if !moved {
            return Err(fresh_info!("no blob to rename", %from, %to));
        }

        Ok(())
    }

    #[instrument(level = "debug", skip(cancel), err)]
    fn list(&self, prefix: &str, cancel: &CancellationToken) -> Result<Vec<RemoteEntry>> {
        check_cancelled(cancel)?;

        let prefix = prefix.trim_start_matches('/');
        let base = match prefix.rfind('/') {
            Some(index) => self.root.join(&prefix[..index]),
            None => self.root.clone(),
        };

        let mut ret = Vec::new();
        for entry in walkdir::WalkDir::new(&base).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = match entry
                .path()
                .strip_prefix(&self.root)
                .ok()
                .and_then(|p| p.to_str())
            {
                Some(relative) => relative.to_string(),
                None => continue,
            };

            if relative.starts_with(prefix) && !relative.ends_with(".tmp") {
                let size = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
                ret.push(RemoteEntry {
                    path: relative,
                    size,
                });
            }
        }

        ret.sort();
        Ok(ret)
    }
}

/// Reads the whole file at `path`, mapping failures to permanent
/// errors (at `DEBUG` level when the file vanished).
pub(crate) fn read_local_file(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| {
        crate::filtered_io_error!(e, ErrorKind::NotFound => crate::result::Level::DEBUG, "failed to open local file", ?path)
    })?;

    let mut contents = Vec::new();
    std::io::Read::read_to_end(&mut file, &mut contents)
        .map_err(|e| chain_error!(e, "failed to read local file", ?path))?;
    Ok(contents)
}

#[test]
fn test_remote_path_for() {
    assert_eq!(
        remote_path_for(Path::new("/home/user/a b.txt")).expect("should convert"),
        "home/user/a b.txt"
    );
    assert_eq!(local_path_for("home/user/x"), PathBuf::from("/home/user/x"));
    assert!(remote_path_for(Path::new("/")).is_err());
}

#[test]
fn test_local_storage_parts_and_rename() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let storage = LocalDirectoryStorage::new(dir.path().to_owned()).expect("should create");
    let cancel = CancellationToken::new();

    storage
        .upload_whole("a/b.txt", b"hello", &cancel)
        .expect("should upload");
    storage
        .upload_part("a/big", 0, b"p0", &cancel)
        .expect("should upload");
    storage
        .upload_part("a/big", 1, b"p1", &cancel)
        .expect("should upload");

    assert_eq!(
        std::fs::read(dir.path().join("a/big.part1")).expect("should read"),
        b"p1"
    );

    storage
        .rename("a/big", "c/big", &cancel)
        .expect("should rename");
    storage
        .delete_part("c/big", 1, &cancel)
        .expect("should delete");
    // Deleting twice is fine.
    storage
        .delete_part("c/big", 1, &cancel)
        .expect("should delete");

    let listed = storage.list("", &cancel).expect("should list");
    assert_eq!(
        listed,
        vec![
            RemoteEntry {
                path: "a/b.txt".into(),
                size: 5
            },
            RemoteEntry {
                path: "c/big.part0".into(),
                size: 2
            },
        ]
    );

    assert!(storage.rename("nope", "other", &cancel).is_err());

    cancel.cancel();
    assert!(storage
        .upload_whole("x", b"", &cancel)
        .expect_err("should fail")
        .is_transient());
}
