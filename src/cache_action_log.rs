//! The cache action log is a crash-safe queue of remote mutations
//! (batch uploads and deletions) for the file state cache.
//!
//! Each pending action lives in its own file in the log directory,
//! named by a strictly increasing 20-digit key.  The file is written
//! before the action enters the in-memory queue, and only removed
//! once the remote operation is confirmed, so restarting the process
//! replays whatever was in flight.
//!
//! An action file has three newline-terminated lines (type, path,
//! source path), each escaped as `N` for null or `V` followed by the
//! percent-encoded value.
//!
//! Upload sources are private copies under `tmp/`, owned by the
//! action: the cache is free to rewrite or delete the original.
use percent_encoding::percent_decode_str;
use percent_encoding::utf8_percent_encode;
use percent_encoding::AsciiSet;
use percent_encoding::CONTROLS;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::chain_error;
use crate::drop_result;
use crate::fresh_info;
use crate::remote::read_local_file;
use crate::remote::RemoteStorage;
use crate::result::Result;
use crate::retry::retry_transient;
use crate::retry::RetryPolicy;

/// Escape control characters (including newlines) and the escape
/// character itself.
const ESCAPE_SET: &AsciiSet = &CONTROLS.add(b'%');

/// Temporary copies of upload sources live in this subdirectory.
const TMP_SUBDIR: &str = "tmp";

const UPLOAD_FILE: &str = "UploadFile";
const DELETE_FILE: &str = "DeleteFile";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CacheActionKind {
    /// Uploads the local file `source` to the remote path `destination`.
    UploadFile { source: PathBuf, destination: String },
    /// Deletes the remote path `path`.
    DeleteFile { path: String },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CacheAction {
    /// Durable key; also the action file's name.
    pub key: u64,
    pub kind: CacheActionKind,
}

impl CacheAction {
    fn file_name(&self) -> String {
        action_file_name(self.key)
    }

    /// Returns the remote path this action affects.
    pub fn remote_path(&self) -> &str {
        match &self.kind {
            CacheActionKind::UploadFile { destination, .. } => destination,
            CacheActionKind::DeleteFile { path } => path,
        }
    }
}

fn action_file_name(key: u64) -> String {
    format!("{:020}", key)
}

fn escape(value: Option<&str>) -> String {
    match value {
        None => "N\n".to_string(),
        Some(value) => format!("V{}\n", utf8_percent_encode(value, ESCAPE_SET)),
    }
}

fn unescape(line: &str) -> Result<Option<String>> {
    if line == "N" {
        return Ok(None);
    }

    let encoded = line
        .strip_prefix('V')
        .ok_or_else(|| fresh_info!("invalid escaped action field", %line))?;
    let decoded = percent_decode_str(encoded)
        .decode_utf8()
        .map_err(|e| chain_error!(e, "invalid utf-8 in action field", %line))?;
    Ok(Some(decoded.into_owned()))
}

/// Serialises `kind` in the action file format.
fn encode_action(kind: &CacheActionKind) -> Result<String> {
    Ok(match kind {
        CacheActionKind::UploadFile {
            source,
            destination,
        } => {
            let source = source
                .to_str()
                .ok_or_else(|| fresh_info!("upload source is not valid utf-8", ?source))?;
            format!(
                "{}{}{}",
                escape(Some(UPLOAD_FILE)),
                escape(Some(destination)),
                escape(Some(source))
            )
        }
        CacheActionKind::DeleteFile { path } => format!(
            "{}{}{}",
            escape(Some(DELETE_FILE)),
            escape(Some(path)),
            escape(None)
        ),
    })
}

fn decode_action(contents: &str) -> Result<CacheActionKind> {
    let mut fields = Vec::new();
    for line in contents.split_terminator('\n') {
        fields.push(unescape(line)?);
    }

    match fields.as_slice() {
        [Some(kind), Some(destination), Some(source)] if kind == UPLOAD_FILE => {
            Ok(CacheActionKind::UploadFile {
                source: PathBuf::from(source),
                destination: destination.clone(),
            })
        }
        [Some(kind), Some(path), None] if kind == DELETE_FILE => {
            Ok(CacheActionKind::DeleteFile { path: path.clone() })
        }
        _ => Err(fresh_info!("unknown cache action", ?fields)),
    }
}

/// Returns a key that is probably larger than anything used by
/// earlier incarnations of the process.
fn initial_key() -> u64 {
    match std::time::SystemTime::UNIX_EPOCH.elapsed() {
        Ok(duration) => duration.as_micros() as u64,
        Err(_) => 0,
    }
}

#[derive(Debug, Default)]
struct LogState {
    queue: VecDeque<CacheAction>,
    next_key: u64,
    // True while the action thread works on the queue's head.
    busy: bool,
    stopping: bool,
}

#[derive(Debug)]
pub struct CacheActionLog {
    directory: PathBuf,
    remote: Arc<dyn RemoteStorage>,
    retry: RetryPolicy,
    network_retry_delay: Duration,
    cancel: CancellationToken,
    state: Mutex<LogState>,
    // Signalled whenever the queue or `busy`/`stopping` change.
    cond: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CacheActionLog {
    /// Opens the action log in `directory`, and rehydrates any action
    /// left by a previous process.  The action thread isn't running
    /// until `start`.
    #[instrument(skip(remote, cancel), err)]
    pub fn open(
        directory: PathBuf,
        remote: Arc<dyn RemoteStorage>,
        retry: RetryPolicy,
        network_retry_delay: Duration,
        cancel: CancellationToken,
    ) -> Result<Arc<CacheActionLog>> {
        let tmp = directory.join(TMP_SUBDIR);
        std::fs::create_dir_all(&tmp)
            .map_err(|e| chain_error!(e, "failed to create action log directory", ?tmp))?;

        let queue = rehydrate(&directory)?;
        let next_key = queue
            .back()
            .map(|action| action.key + 1)
            .unwrap_or(0)
            .max(initial_key());

        tracing::info!(?directory, pending = queue.len(), "opened cache action log");
        Ok(Arc::new(CacheActionLog {
            directory,
            remote,
            retry,
            network_retry_delay,
            cancel,
            state: Mutex::new(LogState {
                queue,
                next_key,
                ..Default::default()
            }),
            cond: Condvar::new(),
            worker: Mutex::new(None),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().expect("action log lock should not be poisoned")
    }

    /// Spawns the action thread.
    pub fn start(self: &Arc<Self>) {
        let log = self.clone();
        let handle = std::thread::Builder::new()
            .name("snapvault-cache-actions".into())
            .spawn(move || log.process_actions());

        match handle {
            Ok(handle) => {
                *self.worker.lock().expect("worker lock should not be poisoned") = Some(handle)
            }
            Err(e) => {
                let _ = chain_error!(e, "failed to spawn cache action thread");
            }
        }
    }

    /// Durably enqueues an upload of a private copy of `source` to
    /// `destination`.
    #[instrument(skip(self), err)]
    pub fn enqueue_upload(&self, source: &Path, destination: String) -> Result<u64> {
        let tmp = self.directory.join(TMP_SUBDIR);
        let mut copy = tempfile::Builder::new()
            .suffix(".copy")
            .tempfile_in(&tmp)
            .map_err(|e| chain_error!(e, "failed to create upload copy", ?tmp))?;

        let mut original = std::fs::File::open(source)
            .map_err(|e| chain_error!(e, "failed to open upload source", ?source))?;
        std::io::copy(&mut original, copy.as_file_mut())
            .and_then(|_| copy.as_file().sync_all())
            .map_err(|e| chain_error!(e, "failed to copy upload source", ?source))?;

        let (_, copy_path) = copy
            .keep()
            .map_err(|e| chain_error!(e, "failed to keep upload copy", ?source))?;

        let ret = self.enqueue(CacheActionKind::UploadFile {
            source: copy_path.clone(),
            destination,
        });
        if ret.is_err() {
            drop_result!(std::fs::remove_file(&copy_path), e => chain_error!(e, "failed to remove upload copy", ?copy_path));
        }

        ret
    }

    /// Durably enqueues a deletion of the remote path `path`.
    #[instrument(skip(self), err)]
    pub fn enqueue_delete(&self, path: String) -> Result<u64> {
        self.enqueue(CacheActionKind::DeleteFile { path })
    }

    /// Writes `kind` to a fresh action file, then pushes it to the
    /// in-memory queue.  Returns the action's key.
    fn enqueue(&self, kind: CacheActionKind) -> Result<u64> {
        let contents = encode_action(&kind)?;

        let mut state = self.lock();
        if state.stopping {
            return Err(fresh_info!("cache action log is stopped", ?kind));
        }

        let key = self.persist_action_file(state.next_key, &contents)?;
        state.next_key = key + 1;
        state.queue.push_back(CacheAction { key, kind });
        self.cond.notify_all();
        Ok(key)
    }

    /// Publishes `contents` at the first free action key at or after
    /// `key`.
    fn persist_action_file(&self, mut key: u64, contents: &str) -> Result<u64> {
        let mut temp = tempfile::Builder::new()
            .suffix(".tmp")
            .tempfile_in(self.directory.join(TMP_SUBDIR))
            .map_err(|e| chain_error!(e, "failed to create action file"))?;

        temp.write_all(contents.as_bytes())
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| chain_error!(e, "failed to write action file"))?;

        loop {
            let target = self.directory.join(action_file_name(key));
            match temp.persist_noclobber(&target) {
                Ok(_) => return Ok(key),
                Err(tempfile::PersistError { error, file }) if error.kind() == ErrorKind::AlreadyExists => {
                    tracing::debug!(key, "action key collision; probing the next key");
                    temp = file;
                    key += 1;
                }
                Err(e) => return Err(chain_error!(e, "failed to publish action file", ?target)),
            }
        }
    }

    /// Returns the number of actions not yet completed.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Returns a copy of the pending actions, in queue order.
    pub fn pending_actions(&self) -> Vec<CacheAction> {
        self.lock().queue.iter().cloned().collect()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.queue.is_empty() && !state.busy
    }

    /// Blocks until the queue is empty, or the log is stopping.
    pub fn wait_while_busy(&self) {
        let mut state = self.lock();
        while (state.busy || !state.queue.is_empty()) && !state.stopping {
            state = self
                .cond
                .wait(state)
                .expect("action log lock should not be poisoned");
        }
    }

    /// Stops the action thread after its current action.  Pending
    /// action files stay on disk for the next process.
    pub fn stop(&self) {
        {
            let mut state = self.lock();
            state.stopping = true;
            self.cond.notify_all();
        }

        let handle = self
            .worker
            .lock()
            .expect("worker lock should not be poisoned")
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("cache action thread panicked");
            }
        }
    }

    /// Returns the next action to execute, or None if we're stopping.
    ///
    /// An upload is elided (and its source and action file deleted)
    /// when a later queued action deletes the same destination.
    fn next_action(&self) -> Option<CacheAction> {
        let mut state = self.lock();

        loop {
            if state.stopping {
                return None;
            }

            let front = match state.queue.front() {
                Some(front) => front.clone(),
                None => {
                    state = self
                        .cond
                        .wait(state)
                        .expect("action log lock should not be poisoned");
                    continue;
                }
            };

            if let CacheActionKind::UploadFile { destination, .. } = &front.kind {
                let deleted_later = state.queue.iter().skip(1).any(|action| {
                    matches!(&action.kind, CacheActionKind::DeleteFile { path } if path == destination)
                });

                if deleted_later {
                    tracing::debug!(?front, "skipping upload of a file that will be deleted");
                    state.queue.pop_front();
                    self.complete(&front);
                    self.cond.notify_all();
                    continue;
                }
            }

            state.busy = true;
            return Some(front);
        }
    }

    /// Removes all on-disk traces of `action`.
    fn complete(&self, action: &CacheAction) {
        if let CacheActionKind::UploadFile { source, .. } = &action.kind {
            drop_result!(std::fs::remove_file(source),
                         e if e.kind() == ErrorKind::NotFound => (),
                         e => chain_error!(e, "failed to remove upload source", ?source));
        }

        let path = self.directory.join(action.file_name());
        drop_result!(std::fs::remove_file(&path),
                     e if e.kind() == ErrorKind::NotFound => (),
                     e => chain_error!(e, "failed to remove action file", ?path));
    }

    fn execute(&self, action: &CacheAction) -> Result<()> {
        match &action.kind {
            CacheActionKind::UploadFile {
                source,
                destination,
            } => {
                let contents = read_local_file(source)?;
                retry_transient(&self.retry, &self.cancel, "upload batch", || {
                    self.remote
                        .upload_whole(destination, &contents, &self.cancel)
                        .map(|_| ())
                })
            }
            CacheActionKind::DeleteFile { path } => {
                retry_transient(&self.retry, &self.cancel, "delete batch", || {
                    self.remote.delete_whole(path, &self.cancel)
                })
            }
        }
    }

    /// The action thread's body: executes actions in queue order until
    /// stopped.
    fn process_actions(&self) {
        while let Some(action) = self.next_action() {
            let result = self.execute(&action);

            let mut state = self.lock();
            match result {
                Ok(()) => {
                    tracing::debug!(?action, "completed cache action");
                    state.queue.pop_front();
                    self.complete(&action);
                }
                Err(_) if self.cancel.is_cancelled() || state.stopping => {
                    // Leave the action file for the next process.
                    state.busy = false;
                    self.cond.notify_all();
                    return;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(?action, "cache action failed transiently; waiting for the network");
                    state.busy = false;
                    self.cond.notify_all();

                    // Keep the action at the head of the queue, and
                    // retry once the delay elapses (or we're told to stop).
                    let deadline = std::time::Instant::now() + self.network_retry_delay;
                    while !state.stopping {
                        let now = std::time::Instant::now();
                        if now >= deadline {
                            break;
                        }

                        state = self
                            .cond
                            .wait_timeout(state, deadline - now)
                            .expect("action log lock should not be poisoned")
                            .0;
                    }
                    continue;
                }
                Err(e) => {
                    let _ = chain_error!(e, "dropping failed cache action", ?action);
                    state.queue.pop_front();
                    self.complete(&action);
                }
            }

            state.busy = false;
            self.cond.notify_all();
        }
    }
}

/// Lists and parses the action files in `directory`, in key order.
/// Malformed action files are logged and deleted; temporary copies
/// that no action refers to are deleted.
fn rehydrate(directory: &Path) -> Result<VecDeque<CacheAction>> {
    let mut actions = Vec::new();

    for entry in std::fs::read_dir(directory)
        .map_err(|e| chain_error!(e, "failed to list action log", ?directory))?
        .flatten()
    {
        let name = entry.file_name();
        let key = match name.to_str().and_then(|name| name.parse::<u64>().ok()) {
            Some(key) => key,
            None => continue,
        };

        let path = entry.path();
        let parsed = std::fs::read_to_string(&path)
            .map_err(|e| chain_error!(e, "failed to read action file", ?path))
            .and_then(|contents| decode_action(&contents));

        match parsed {
            Ok(kind) => actions.push(CacheAction { key, kind }),
            Err(e) => {
                let _ = chain_error!(e, "removing malformed action file", ?path);
                drop_result!(std::fs::remove_file(&path), e => chain_error!(e, "failed to remove action file", ?path));
            }
        }
    }

    actions.sort_by_key(|action| action.key);

    let live_sources: HashSet<PathBuf> = actions
        .iter()
        .filter_map(|action| match &action.kind {
            CacheActionKind::UploadFile { source, .. } => Some(source.clone()),
            CacheActionKind::DeleteFile { .. } => None,
        })
        .collect();

    let tmp = directory.join(TMP_SUBDIR);
    if let Ok(entries) = std::fs::read_dir(&tmp) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !live_sources.contains(&path) {
                tracing::debug!(?path, "removing stale action log temporary file");
                drop_result!(std::fs::remove_file(&path), e => chain_error!(e, "failed to remove stale file", ?path));
            }
        }
    }

    Ok(actions.into())
}

#[cfg(test)]
fn test_log(
    directory: &Path,
    remote: Arc<dyn RemoteStorage>,
) -> Arc<CacheActionLog> {
    CacheActionLog::open(
        directory.to_owned(),
        remote,
        RetryPolicy {
            limit: 2,
            delay: Duration::from_millis(1),
        },
        Duration::from_millis(10),
        CancellationToken::new(),
    )
    .expect("should open action log")
}

#[test]
fn test_action_file_format() {
    let kind = CacheActionKind::UploadFile {
        source: PathBuf::from("/tmp/a b\nc"),
        destination: "cache/batch-0000000000000001".into(),
    };

    let encoded = encode_action(&kind).expect("should encode");
    assert_eq!(
        encoded,
        "VUploadFile\nVcache/batch-0000000000000001\nV/tmp/a b%0Ac\n"
    );
    assert_eq!(decode_action(&encoded).expect("should decode"), kind);

    let delete = CacheActionKind::DeleteFile { path: "x%y".into() };
    let encoded = encode_action(&delete).expect("should encode");
    assert_eq!(encoded, "VDeleteFile\nVx%25y\nN\n");
    assert_eq!(decode_action(&encoded).expect("should decode"), delete);

    assert!(decode_action("VMystery\nVx\nN\n").is_err());
    assert!(decode_action("Q\n").is_err());
}

#[test]
fn test_rehydrate_in_key_order() {
    use crate::test_support::MemoryStorage;

    let dir = tempfile::tempdir().expect("should create temp dir");
    let source = dir.path().join("source");
    std::fs::write(&source, b"batch").expect("should write");

    let remote = Arc::new(MemoryStorage::default());
    {
        let log = test_log(dir.path(), remote.clone());
        let first = log.enqueue_delete("a".into()).expect("should enqueue");
        let second = log
            .enqueue_upload(&source, "b".into())
            .expect("should enqueue");
        assert!(second > first);

        // Simulate a collision with a file left by someone else.
        std::fs::write(dir.path().join(action_file_name(second + 1)), "junk")
            .expect("should write");
        let third = log.enqueue_delete("c".into()).expect("should enqueue");
        assert_eq!(third, second + 2);
    }

    // A fresh log sees the same queue; the junk file is dropped.
    let log = test_log(dir.path(), remote.clone());
    let paths: Vec<String> = log
        .pending_actions()
        .iter()
        .map(|action| action.remote_path().to_string())
        .collect();
    assert_eq!(paths, vec!["a", "b", "c"]);

    log.start();
    log.wait_while_busy();
    log.stop();

    assert_eq!(remote.contents("b"), Some(b"batch".to_vec()));
    assert_eq!(remote.delete_count("a"), 1);
    assert_eq!(remote.delete_count("c"), 1);

    // Everything is gone from disk, except the source we own.
    let leftover: Vec<_> = std::fs::read_dir(dir.path())
        .expect("should list")
        .flatten()
        .map(|entry| entry.file_name())
        .collect();
    assert_eq!(leftover.len(), 2, "{:?}", leftover); // `source` and `tmp/`
    assert_eq!(
        std::fs::read_dir(dir.path().join(TMP_SUBDIR))
            .expect("should list")
            .count(),
        0
    );
}

#[test]
fn test_redundant_upload_elision() {
    use crate::test_support::MemoryStorage;

    let dir = tempfile::tempdir().expect("should create temp dir");
    let source = dir.path().join("source");
    std::fs::write(&source, b"batch").expect("should write");

    let remote = Arc::new(MemoryStorage::default());
    let log = test_log(dir.path(), remote.clone());

    log.enqueue_upload(&source, "cache/batch-1".into())
        .expect("should enqueue");
    log.enqueue_upload(&source, "cache/batch-2".into())
        .expect("should enqueue");
    log.enqueue_delete("cache/batch-1".into())
        .expect("should enqueue");

    let copies: Vec<PathBuf> = log
        .pending_actions()
        .iter()
        .filter_map(|action| match &action.kind {
            CacheActionKind::UploadFile { source, .. } => Some(source.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(copies.len(), 2);

    log.start();
    log.wait_while_busy();
    log.stop();

    assert_eq!(remote.upload_count("cache/batch-1"), 0);
    assert_eq!(remote.delete_count("cache/batch-1"), 1);
    assert_eq!(remote.upload_count("cache/batch-2"), 1);
    for copy in copies {
        assert!(!copy.exists(), "{:?}", copy);
    }
}

#[test]
fn test_transient_failures_keep_the_action() {
    use crate::test_support::MemoryStorage;

    let dir = tempfile::tempdir().expect("should create temp dir");
    let remote = Arc::new(MemoryStorage::default());
    // More failures than one retry round allows.
    remote.fail_next(5);

    let log = test_log(dir.path(), remote.clone());
    log.enqueue_delete("x".into()).expect("should enqueue");
    log.start();
    log.wait_while_busy();
    log.stop();

    assert_eq!(remote.delete_count("x"), 1);
    assert_eq!(log.pending(), 0);
}

#[test]
fn test_stop_leaves_action_files() {
    use crate::test_support::MemoryStorage;

    let dir = tempfile::tempdir().expect("should create temp dir");
    let remote = Arc::new(MemoryStorage::default());

    {
        let log = test_log(dir.path(), remote.clone());
        log.enqueue_delete("x".into()).expect("should enqueue");
        // Never started: stopping must keep the file.
        log.stop();
        assert!(log.enqueue_delete("y".into()).is_err());
    }

    let log = test_log(dir.path(), remote);
    assert_eq!(log.pending(), 1);
}
