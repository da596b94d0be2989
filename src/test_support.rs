//! Fakes for the collaborators the backup engine talks to.
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backup_action::ActionSink;
use crate::backup_action::BackupAction;
use crate::fresh_info;
use crate::fresh_transient;
use crate::open_handles::Access;
use crate::open_handles::OpenHandle;
use crate::open_handles::OpenHandleEnumerator;
use crate::remote::check_cancelled;
use crate::remote::part_blob_path;
use crate::remote::RemoteEntry;
use crate::remote::RemoteStorage;
use crate::result::Result;
use crate::snapshot_provider::Snapshot;
use crate::snapshot_provider::SnapshotProvider;
use crate::snapshot_provider::Volume;

#[derive(Debug, Default)]
struct MemoryState {
    blobs: BTreeMap<String, Vec<u8>>,
    uploads: HashMap<String, usize>,
    deletes: HashMap<String, usize>,
    renames: Vec<(String, String)>,
    // Fail this many upcoming calls with a transient error.
    fail_remaining: usize,
    // Fail this many upcoming calls for the blob, transiently.
    failing_blobs: HashMap<String, usize>,
    in_flight: usize,
    max_in_flight: usize,
    // While true, uploads block.
    gated: bool,
}

/// In-memory `RemoteStorage`, with call counters.
#[derive(Debug, Default)]
pub(crate) struct MemoryStorage {
    state: Mutex<MemoryState>,
    cond: Condvar,
}

impl MemoryStorage {
    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("lock should not be poisoned")
    }

    /// Makes the next `count` calls fail transiently.
    pub fn fail_next(&self, count: usize) {
        self.lock().fail_remaining = count;
    }

    /// Makes the next `count` calls for the blob `key` fail
    /// transiently.
    pub fn fail_blob(&self, key: &str, count: usize) {
        self.lock().failing_blobs.insert(key.to_string(), count);
    }

    /// Blocks uploads until `release_uploads`.
    pub fn block_uploads(&self) {
        self.lock().gated = true;
    }

    pub fn release_uploads(&self) {
        self.lock().gated = false;
        self.cond.notify_all();
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().blobs.get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock().blobs.keys().cloned().collect()
    }

    /// Number of successful uploads to `path`.
    pub fn upload_count(&self, path: &str) -> usize {
        self.lock().uploads.get(path).copied().unwrap_or(0)
    }

    pub fn total_uploads(&self) -> usize {
        self.lock().uploads.values().sum()
    }

    /// Number of successful deletions of `path`.
    pub fn delete_count(&self, path: &str) -> usize {
        self.lock().deletes.get(path).copied().unwrap_or(0)
    }

    pub fn renames(&self) -> Vec<(String, String)> {
        self.lock().renames.clone()
    }

    pub fn max_concurrent_uploads(&self) -> usize {
        self.lock().max_in_flight
    }

    /// Waits until `count` uploads are blocked on the gate.
    pub fn wait_for_blocked_uploads(&self, count: usize) {
        let mut state = self.lock();
        while state.in_flight < count {
            state = self
                .cond
                .wait_timeout(state, std::time::Duration::from_millis(10))
                .expect("lock should not be poisoned")
                .0;
        }
    }

    fn maybe_fail(state: &mut MemoryState, key: &str) -> Result<()> {
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(fresh_transient!("injected failure"));
        }

        if let Some(remaining) = state.failing_blobs.get_mut(key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(fresh_transient!("injected failure", %key));
            }
        }

        Ok(())
    }

    fn put(&self, key: String, contents: &[u8], cancel: &CancellationToken) -> Result<Option<String>> {
        check_cancelled(cancel)?;

        let mut state = self.lock();
        Self::maybe_fail(&mut state, &key)?;

        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        self.cond.notify_all();
        while state.gated && !cancel.is_cancelled() {
            state = self
                .cond
                .wait_timeout(state, std::time::Duration::from_millis(5))
                .expect("lock should not be poisoned")
                .0;
        }
        state.in_flight -= 1;
        check_cancelled(cancel)?;

        *state.uploads.entry(key.clone()).or_default() += 1;
        state.blobs.insert(key, contents.to_vec());
        Ok(Some(uuid::Uuid::new_v4().to_simple().to_string()))
    }

    fn remove(&self, key: String, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;

        let mut state = self.lock();
        Self::maybe_fail(&mut state, &key)?;
        state.blobs.remove(&key);
        *state.deletes.entry(key).or_default() += 1;
        Ok(())
    }
}

impl RemoteStorage for MemoryStorage {
    fn upload_whole(
        &self,
        path: &str,
        contents: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        self.put(path.to_string(), contents, cancel)
    }

    fn upload_part(
        &self,
        path: &str,
        part: u32,
        contents: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        self.put(part_blob_path(path, part), contents, cancel)
    }

    fn delete_whole(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        self.remove(path.to_string(), cancel)
    }

    fn delete_part(&self, path: &str, part: u32, cancel: &CancellationToken) -> Result<()> {
        self.remove(part_blob_path(path, part), cancel)
    }

    fn rename(&self, from: &str, to: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;

        let mut state = self.lock();
        Self::maybe_fail(&mut state, from)?;

        let part_prefix = format!("{}.part", from);
        let keys: Vec<String> = state
            .blobs
            .keys()
            .filter(|key| {
                key.as_str() == from
                    || key
                        .strip_prefix(part_prefix.as_str())
                        .map(|n| n.parse::<u32>().is_ok())
                        .unwrap_or(false)
            })
            .cloned()
            .collect();

        if keys.is_empty() {
            return Err(fresh_info!("no blob to rename", %from, %to));
        }

        for key in keys {
            if let Some(blob) = state.blobs.remove(&key) {
                state.blobs.insert(format!("{}{}", to, &key[from.len()..]), blob);
            }
        }

        state.renames.push((from.to_string(), to.to_string()));
        Ok(())
    }

    fn list(&self, prefix: &str, cancel: &CancellationToken) -> Result<Vec<RemoteEntry>> {
        check_cancelled(cancel)?;

        Ok(self
            .lock()
            .blobs
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, blob)| RemoteEntry {
                path: path.clone(),
                size: blob.len() as u64,
            })
            .collect())
    }
}

/// A snapshot that only counts `destroy` calls.
#[derive(Debug)]
pub(crate) struct CountingSnapshot {
    mount_point: PathBuf,
    destroyed: Arc<AtomicUsize>,
}

impl CountingSnapshot {
    pub fn new(mount_point: &str) -> (CountingSnapshot, Arc<AtomicUsize>) {
        let destroyed = Arc::new(AtomicUsize::new(0));
        (
            CountingSnapshot {
                mount_point: mount_point.into(),
                destroyed: destroyed.clone(),
            },
            destroyed,
        )
    }
}

impl Snapshot for CountingSnapshot {
    fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    fn destroy(self: Box<Self>) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A snapshot that's a full copy of the volume in a temporary directory.
#[derive(Debug)]
struct CopySnapshot {
    copy: tempfile::TempDir,
    destroyed: Arc<AtomicUsize>,
}

impl Snapshot for CopySnapshot {
    fn mount_point(&self) -> &Path {
        self.copy.path()
    }

    fn destroy(self: Box<Self>) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Snapshots temporary "volume" directories by copying them.
#[derive(Debug)]
pub(crate) struct FakeSnapshotProvider {
    roots: Vec<tempfile::TempDir>,
    created: AtomicUsize,
    destroyed: Arc<AtomicUsize>,
}

impl FakeSnapshotProvider {
    /// Creates a provider with `count` empty volumes.
    pub fn new(count: usize) -> FakeSnapshotProvider {
        FakeSnapshotProvider {
            roots: (0..count)
                .map(|_| tempfile::tempdir().expect("should create temp dir"))
                .collect(),
            created: AtomicUsize::new(0),
            destroyed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn volumes(&self) -> Vec<Volume> {
        self.roots
            .iter()
            .enumerate()
            .map(|(i, root)| Volume {
                mount_point: root.path().to_owned(),
                dataset: format!("volume{}", i),
            })
            .collect()
    }

    pub fn root(&self, volume: usize) -> &Path {
        self.roots[volume].path()
    }

    /// Writes `contents` at `relative` in volume `volume`, and returns
    /// the live path.
    pub fn write_file(&self, volume: usize, relative: &str, contents: &[u8]) -> PathBuf {
        let path = self.root(volume).join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("should create parent");
        }

        std::fs::write(&path, contents).expect("should write");
        path
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Number of snapshots not yet destroyed.
    pub fn live(&self) -> usize {
        self.created() - self.destroyed()
    }
}

impl SnapshotProvider for FakeSnapshotProvider {
    fn create_snapshot(&self, volume: &Volume, _name: &str) -> Result<Box<dyn Snapshot>> {
        let copy = tempfile::tempdir().expect("should create temp dir");

        for entry in walkdir::WalkDir::new(&volume.mount_point).into_iter().flatten() {
            let relative = entry
                .path()
                .strip_prefix(&volume.mount_point)
                .expect("should be under the volume");
            let target = copy.path().join(relative);

            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target).expect("should create dir");
            } else if entry.file_type().is_file() {
                std::fs::copy(entry.path(), &target).expect("should copy");
            }
        }

        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CopySnapshot {
            copy,
            destroyed: self.destroyed.clone(),
        }))
    }

    fn enumerate_volumes(&self) -> Result<Vec<Volume>> {
        Ok(self.volumes())
    }
}

/// An open-handle enumerator that reports whatever the test says.
#[derive(Debug, Default)]
pub(crate) struct ScriptedOpenHandles {
    writers: Mutex<HashSet<PathBuf>>,
    calls: AtomicUsize,
}

impl ScriptedOpenHandles {
    pub fn set_writer(&self, path: &Path, open: bool) {
        let mut writers = self.writers.lock().expect("lock should not be poisoned");
        if open {
            writers.insert(path.to_owned());
        } else {
            writers.remove(path);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OpenHandleEnumerator for ScriptedOpenHandles {
    fn enumerate_all(&self) -> Result<Vec<OpenHandle>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        Ok(self
            .writers
            .lock()
            .expect("lock should not be poisoned")
            .iter()
            .map(|path| OpenHandle {
                path: path.clone(),
                access: Access::Write,
            })
            .collect())
    }
}

/// An action sink that keeps everything it receives.
#[derive(Debug, Default)]
pub(crate) struct RecordingActions {
    actions: Mutex<Vec<BackupAction>>,
}

impl RecordingActions {
    pub fn len(&self) -> usize {
        self.actions.lock().expect("lock should not be poisoned").len()
    }

    /// Returns the path of each action received, in order.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.actions
            .lock()
            .expect("lock should not be poisoned")
            .iter()
            .map(|action| action.path().to_owned())
            .collect()
    }

    pub fn take(&self) -> Vec<BackupAction> {
        std::mem::take(&mut *self.actions.lock().expect("lock should not be poisoned"))
    }
}

impl ActionSink for RecordingActions {
    fn enqueue(&self, action: BackupAction) {
        self.actions
            .lock()
            .expect("lock should not be poisoned")
            .push(action);
    }
}

/// Returns a cache in `directory`, backed by `remote`.  Its action
/// log isn't started, so batch uploads stay queued.
pub(crate) fn test_cache(
    directory: &Path,
    remote: Arc<dyn RemoteStorage>,
) -> Arc<crate::file_state_cache::RemoteFileStateCache> {
    let actions = crate::cache_action_log::CacheActionLog::open(
        directory.join("actions"),
        remote,
        crate::retry::RetryPolicy {
            limit: 1,
            delay: std::time::Duration::from_millis(1),
        },
        std::time::Duration::from_millis(1),
        CancellationToken::new(),
    )
    .expect("should open action log");

    crate::file_state_cache::RemoteFileStateCache::new(
        directory.join("batches"),
        "cache".into(),
        std::time::Duration::from_secs(3600),
        crate::consolidation::ConsolidationPolicy {
            min_batches: 10,
            bytes_per_batch: 1 << 20,
        },
        actions,
    )
}

/// Polls `condition` until it holds, or panics after a few seconds.
pub(crate) fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while !condition() {
        assert!(std::time::Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
}
