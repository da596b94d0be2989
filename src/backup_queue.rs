//! The backup queue executes stabilized actions one at a time, in
//! FIFO order.
//!
//! Uploads are classified and handed to the upload pool; once the
//! pool's stack reaches the high water mark, the dispatcher stops
//! taking uploads off the queue (moves and deletes still go through)
//! until the pool drains to its low water mark.
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::fs::File;
use std::io::ErrorKind;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::backup_action::ActionSink;
use crate::backup_action::BackupAction;
use crate::backup_action::FileReference;
use crate::backup_action::FileSource;
use crate::chain_error;
use crate::chain_warn;
use crate::checksum::checksum_reader;
use crate::file_state::ticks_from_system_time;
use crate::file_state_cache::RemoteFileStateCache;
use crate::intake::IntakeHandle;
use crate::remote::local_path_for;
use crate::remote::remote_path_for;
use crate::remote::RemoteStorage;
use crate::result::Result;
use crate::retry::retry_transient;
use crate::retry::RetryPolicy;
use crate::snapshot_tracker::SnapshotReference;
use crate::staging::Staging;
use crate::upload_pool::UploadObserver;
use crate::upload_pool::UploadPool;

#[derive(Clone, Copy, Debug)]
pub struct BackupQueueConfig {
    pub high_water_mark: usize,
    pub low_water_mark: usize,
    /// Files at least this large are uploaded straight from their
    /// snapshot; smaller ones are staged first.
    pub large_file_threshold: u64,
    pub retry: RetryPolicy,
    /// How long to hold off after a move fails for lack of network.
    pub network_retry_delay: Duration,
}

#[derive(Debug, Default)]
struct QueueState {
    actions: VecDeque<BackupAction>,
    uploads_paused: bool,
    executing: bool,
    stopping: bool,
    retry_after: Option<Instant>,
}

#[derive(Debug)]
pub struct BackupQueue {
    config: BackupQueueConfig,
    cache: Arc<RemoteFileStateCache>,
    remote: Arc<dyn RemoteStorage>,
    pool: Arc<UploadPool>,
    staging: Staging,
    intake: IntakeHandle,
    cancel: CancellationToken,
    state: Mutex<QueueState>,
    cond: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Whether a move went through.
#[derive(Debug)]
enum MoveOutcome {
    Done,
    /// The network is down; try again later.
    Retry(BackupAction),
}

impl BackupQueue {
    pub fn new(
        config: BackupQueueConfig,
        cache: Arc<RemoteFileStateCache>,
        remote: Arc<dyn RemoteStorage>,
        pool: Arc<UploadPool>,
        staging: Staging,
        intake: IntakeHandle,
        cancel: CancellationToken,
    ) -> Arc<BackupQueue> {
        let queue = Arc::new(BackupQueue {
            config,
            cache,
            remote,
            pool: pool.clone(),
            staging,
            intake,
            cancel,
            state: Default::default(),
            cond: Condvar::new(),
            worker: Mutex::new(None),
        });

        let observer = Arc::downgrade(&queue) as Weak<dyn UploadObserver>;
        pool.set_observer(observer);
        queue
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .expect("backup queue lock should not be poisoned")
    }

    /// Spawns the dispatcher thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let queue = self.clone();
        let handle = std::thread::Builder::new()
            .name("snapvault-dispatch".into())
            .spawn(move || queue.run())
            .map_err(|e| chain_error!(e, "failed to spawn backup queue dispatcher"))?;

        *self.worker.lock().expect("worker lock should not be poisoned") = Some(handle);
        Ok(())
    }

    /// Returns the number of queued actions.
    pub fn len(&self) -> usize {
        self.lock().actions.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.actions.is_empty() && !state.executing
    }

    pub fn uploads_paused(&self) -> bool {
        self.lock().uploads_paused
    }

    fn push(&self, action: BackupAction, front: bool) {
        let mut state = self.lock();
        if state.stopping {
            drop(state);
            tracing::debug!(?action, "backup queue is stopped; dropping action");
            return;
        }

        if front {
            state.actions.push_front(action);
        } else {
            state.actions.push_back(action);
        }

        self.cond.notify_all();
    }

    /// Blocks until there's an action we may execute now.  Returns
    /// None when stopping.
    fn next_action(&self) -> Option<BackupAction> {
        let mut state = self.lock();

        loop {
            if state.stopping {
                return None;
            }

            if let Some(retry_after) = state.retry_after {
                let now = Instant::now();
                if now < retry_after {
                    state = self
                        .cond
                        .wait_timeout(state, retry_after - now)
                        .expect("backup queue lock should not be poisoned")
                        .0;
                    continue;
                }

                state.retry_after = None;
            }

            let index = if state.uploads_paused {
                state.actions.iter().position(|action| !action.is_upload())
            } else if state.actions.is_empty() {
                None
            } else {
                Some(0)
            };

            if let Some(action) = index.and_then(|index| state.actions.remove(index)) {
                state.executing = true;
                return Some(action);
            }

            state = self
                .cond
                .wait(state)
                .expect("backup queue lock should not be poisoned");
        }
    }

    fn run(&self) {
        while let Some(action) = self.next_action() {
            self.execute(action);

            let mut state = self.lock();
            state.executing = false;
            self.cond.notify_all();
        }
    }

    fn execute(&self, action: BackupAction) {
        let action = match self.defer_if_uploading(action) {
            Some(action) => action,
            None => return,
        };

        match action {
            BackupAction::Upload { source } => {
                let path = source.path().to_owned();
                if let Err(e) = self.upload(source) {
                    if !self.cancel.is_cancelled() {
                        tracing::info!(?e, ?path, "failed to prepare upload; rechecking");
                        self.intake.recheck(path);
                    }
                }
            }
            BackupAction::Move { from, to } => match self.move_path(from, to) {
                Ok(MoveOutcome::Done) => {}
                Ok(MoveOutcome::Retry(action)) => {
                    let mut state = self.lock();
                    state.retry_after = Some(Instant::now() + self.config.network_retry_delay);
                    state.actions.push_front(action);
                }
                Err(e) => tracing::info!(?e, "dropping failed move"),
            },
            BackupAction::Delete { path } => {
                if let Err(e) = self.delete(path) {
                    tracing::info!(?e, "dropping failed delete");
                }
            }
        }
    }

    /// Pauses upload dispatch if the pool is still above its low
    /// water mark.
    fn maybe_pause_uploads(&self) {
        let mut state = self.lock();
        // The pool lock nests inside ours.
        let depth = self.pool.len();
        if depth > self.config.low_water_mark && !state.uploads_paused {
            tracing::info!(depth, "upload queue is full; pausing upload dispatch");
            state.uploads_paused = true;
        }
    }

    #[instrument(level = "debug", skip(self, source), fields(path=?source.path()), err)]
    fn upload(&self, source: SnapshotReference) -> Result<()> {
        let remote_path = remote_path_for(source.path())?;
        let snapshot_path = source.snapshot_path();

        let mut file = match File::open(snapshot_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(?snapshot_path, "snapshotted file is gone; rechecking");
                self.intake.recheck(source.path().to_owned());
                return Ok(());
            }
            Err(e) => return Err(chain_error!(e, "failed to open snapshotted file", ?snapshot_path)),
        };

        let meta = file
            .metadata()
            .map_err(|e| chain_error!(e, "failed to stat snapshotted file", ?snapshot_path))?;
        if !meta.is_file() {
            tracing::debug!(?snapshot_path, "not a regular file; skipping");
            return Ok(());
        }

        let last_modified_ticks = meta
            .modified()
            .map(ticks_from_system_time)
            .map_err(|e| chain_error!(e, "failed to read mtime", ?snapshot_path))?;
        let (checksum, size) = checksum_reader(&mut file)
            .map_err(|e| chain_error!(e, "failed to checksum snapshotted file", ?snapshot_path))?;

        if let Some(current) = self.cache.get_file_state(&remote_path)? {
            if current.checksum == checksum && current.size == size as i64 {
                tracing::debug!(%remote_path, "remote copy is up to date");
                return Ok(());
            }
        }

        let path = source.path().to_owned();
        let source = if size >= self.config.large_file_threshold {
            FileSource::Snapshot(source)
        } else {
            file.seek(SeekFrom::Start(0))
                .map_err(|e| chain_error!(e, "failed to rewind snapshotted file", ?snapshot_path))?;
            let staged = self.staging.stage_file(&mut file)?;
            drop(source);
            FileSource::Staged(staged)
        };

        let depth = self.pool.enqueue(FileReference {
            path,
            remote_path,
            source,
            size,
            last_modified_ticks,
            checksum,
        });

        if depth >= self.config.high_water_mark {
            self.maybe_pause_uploads();
        }

        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        retry_transient(&self.config.retry, &self.cancel, "rename", || {
            self.remote.rename(from, to, &self.cancel)
        })
    }

    /// Deletes the blobs at `target` that renaming `source` onto it
    /// would leave behind: parts `source` doesn't have, and the whole
    /// blob if `source` is stored in parts.
    fn clear_stale_target(&self, source: &str, target: &str) -> Result<()> {
        let carried: BTreeSet<u32> = self
            .cache
            .part_states(source)?
            .into_iter()
            .filter_map(|state| state.part)
            .collect();

        for state in self.cache.part_states(target)? {
            let part = match state.part {
                Some(part) if !carried.contains(&part) => part,
                _ => continue,
            };

            retry_transient(&self.config.retry, &self.cancel, "delete stale part", || {
                self.remote.delete_part(target, part, &self.cancel)
            })?;
            self.cache.remove_part_state(target, part)?;
        }

        if !carried.is_empty() && self.cache.contains_path(target)? {
            retry_transient(&self.config.retry, &self.cancel, "delete stale file", || {
                self.remote.delete_whole(target, &self.cancel)
            })?;
        }

        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    fn move_path(&self, from: PathBuf, to: PathBuf) -> Result<MoveOutcome> {
        let from_remote = remote_path_for(&from)?;
        let to_remote = remote_path_for(&to)?;

        let sources: Vec<String> = self
            .cache
            .file_states_under(&from_remote)?
            .into_iter()
            .filter(|state| state.part.is_none())
            .map(|state| state.path)
            .collect();

        if sources.is_empty() {
            tracing::debug!(?from, ?to, "nothing cached at move source; treating as delete");
            self.delete_now(&from_remote)?;
            self.intake.recheck(to);
            return Ok(MoveOutcome::Done);
        }

        for source in sources {
            let target = format!("{}{}", to_remote, &source[from_remote.len()..]);

            match self
                .clear_stale_target(&source, &target)
                .and_then(|()| self.rename(&source, &target))
            {
                Ok(()) => {
                    self.cache.move_file_state(&source, &target)?;
                }
                Err(e) if e.is_transient() => {
                    if self.cancel.is_cancelled() {
                        return Err(e);
                    }

                    tracing::info!(%source, %target, "network unavailable; will retry move");
                    return Ok(MoveOutcome::Retry(BackupAction::Move { from, to }));
                }
                Err(e) => {
                    let _ = chain_warn!(e, "remote rename failed; re-uploading", %source, %target);
                    // The target's blobs may be partly gone, so it
                    // gets uploaded from scratch.
                    self.cache.remove_states_under(&source)?;
                    self.cache.remove_states_under(&target)?;
                    self.intake.recheck(local_path_for(&target));
                }
            }
        }

        Ok(MoveOutcome::Done)
    }

    /// Parks moves and deletes that touch a path being uploaded with
    /// the upload pool, which requeues them once the upload is done.
    fn defer_if_uploading(&self, action: BackupAction) -> Option<BackupAction> {
        let paths: Vec<&Path> = match &action {
            BackupAction::Upload { .. } => return Some(action),
            BackupAction::Move { from, to } => vec![from.as_path(), to.as_path()],
            BackupAction::Delete { path } => vec![path.as_path()],
        };

        let remote_paths: Vec<String> = paths
            .into_iter()
            .filter_map(|path| remote_path_for(path).ok())
            .collect();
        remote_paths
            .iter()
            .try_fold(action, |action, remote_path| {
                self.pool.defer_if_uploading(remote_path, action)
            })
    }

    #[instrument(level = "debug", skip(self), err)]
    fn delete(&self, path: PathBuf) -> Result<()> {
        let remote_path = remote_path_for(&path)?;
        self.delete_now(&remote_path)
    }

    /// Tombstones everything at or under `remote_path`, then deletes
    /// the corresponding blobs.
    fn delete_now(&self, remote_path: &str) -> Result<()> {
        let removed = self.cache.remove_states_under(remote_path)?;

        if removed.is_empty() {
            // We don't know of anything there, but the remote might.
            if let Err(e) = retry_transient(&self.config.retry, &self.cancel, "delete", || {
                self.remote.delete_whole(remote_path, &self.cancel)
            }) {
                tracing::debug!(?e, %remote_path, "best-effort delete failed");
            }

            return Ok(());
        }

        for state in removed {
            let result = retry_transient(&self.config.retry, &self.cancel, "delete", || match state.part {
                Some(part) => self.remote.delete_part(&state.path, part, &self.cancel),
                None => self.remote.delete_whole(&state.path, &self.cancel),
            });

            if let Err(e) = result {
                let _ = chain_warn!(e, "failed to delete remote blob", path=%state.path, part=?state.part);
            }
        }

        Ok(())
    }

    /// Stops the dispatcher after its current action, and drops (and
    /// thus releases) every queued action.
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
                tracing::error!("backup queue dispatcher panicked");
            }
        }

        let actions = std::mem::take(&mut self.lock().actions);
        tracing::debug!(dropped = actions.len(), "stopped backup queue");
    }
}

impl ActionSink for BackupQueue {
    fn enqueue(&self, action: BackupAction) {
        self.push(action, false);
    }
}

impl UploadObserver for BackupQueue {
    fn upload_queue_drained(&self) {
        let mut state = self.lock();
        if state.uploads_paused {
            tracing::info!("upload queue drained; resuming upload dispatch");
            state.uploads_paused = false;
            self.cond.notify_all();
        }
    }

    fn requeue(&self, action: BackupAction) {
        self.push(action, true);
    }
}

#[cfg(test)]
struct Fixture {
    dir: tempfile::TempDir,
    // Stands in for the mount point of the snapshots in the tests.
    snapshot: tempfile::TempDir,
    remote: Arc<crate::test_support::MemoryStorage>,
    cache: Arc<RemoteFileStateCache>,
    intake: crate::intake::IntakeReceiver,
    pool: Arc<UploadPool>,
    queue: Arc<BackupQueue>,
}

#[cfg(test)]
impl Fixture {
    /// Returns a running queue in front of a pool without workers.
    fn new(large_file_threshold: u64) -> Fixture {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let snapshot = tempfile::tempdir().expect("should create temp dir");
        let remote = Arc::new(crate::test_support::MemoryStorage::default());
        let cache = crate::test_support::test_cache(dir.path(), remote.clone());
        let (handle, intake) = IntakeHandle::channel();
        let cancel = CancellationToken::new();
        let retry = RetryPolicy {
            limit: 1,
            delay: Duration::from_millis(1),
        };

        let pool = UploadPool::new(
            crate::upload_pool::UploadPoolConfig {
                part_size: 1 << 20,
                low_water_mark: 50,
                retry,
            },
            cache.clone(),
            remote.clone(),
            handle.clone(),
            cancel.clone(),
        );

        let queue = BackupQueue::new(
            BackupQueueConfig {
                high_water_mark: 100,
                low_water_mark: 50,
                large_file_threshold,
                retry,
                network_retry_delay: Duration::from_millis(10),
            },
            cache.clone(),
            remote.clone(),
            pool.clone(),
            Staging::new(dir.path().join("staging")).expect("should create staging"),
            handle,
            cancel,
        );
        queue.start().expect("should start");

        Fixture {
            dir,
            snapshot,
            remote,
            cache,
            intake,
            pool,
            queue,
        }
    }

    /// Writes `contents` at `/vol/<name>` in the fake snapshot, and
    /// returns a tracker for the snapshot along with its destroy count.
    fn snapshot_file(
        &self,
        name: &str,
        contents: &[u8],
    ) -> (
        crate::snapshot_tracker::SnapshotTracker,
        Arc<std::sync::atomic::AtomicUsize>,
    ) {
        std::fs::write(self.snapshot.path().join(name), contents).expect("should write");

        let mount = self.snapshot.path().to_str().expect("should be utf-8");
        let (snapshot, destroyed) = crate::test_support::CountingSnapshot::new(mount);
        (
            crate::snapshot_tracker::SnapshotTracker::new(Path::new("/vol"), Box::new(snapshot)),
            destroyed,
        )
    }

    fn wait_until_idle(&self) {
        crate::test_support::wait_for("idle queue", || self.queue.is_idle());
    }

    fn stop(&self) {
        self.queue.stop();
        self.pool.stop();
    }
}

#[test]
fn test_watermarks() {
    use std::sync::atomic::Ordering;

    let fixture = Fixture::new(1 << 20);
    let (tracker, destroyed) = fixture.snapshot_file("file", b"contents");

    for _ in 0..10_000 {
        fixture.queue.enqueue(BackupAction::Upload {
            source: tracker.add_reference(Path::new("/vol/file")),
        });
    }

    crate::test_support::wait_for("full upload queue", || fixture.pool.len() == 100);
    crate::test_support::wait_for("paused dispatch", || fixture.queue.uploads_paused());
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fixture.pool.len(), 100);
    assert_eq!(fixture.queue.len(), 9_900);

    // Moves and deletes still go through.
    fixture.queue.enqueue(BackupAction::Delete {
        path: "/vol/gone".into(),
    });
    fixture.queue.enqueue(BackupAction::Move {
        from: "/vol/a".into(),
        to: "/vol/b".into(),
    });
    crate::test_support::wait_for("moves and deletes", || {
        fixture.queue.len() == 9_900 && fixture.remote.delete_count("vol/a") == 1
    });
    assert_eq!(fixture.remote.delete_count("vol/gone"), 1);
    assert_eq!(
        fixture.intake.try_recv(),
        Some(crate::intake::IntakeCommand::Recheck("/vol/b".into()))
    );

    // Still above the low water mark.
    for _ in 0..49 {
        assert!(fixture.pool.pop_for_test().is_some());
    }
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fixture.pool.len(), 51);
    assert_eq!(fixture.queue.len(), 9_900);

    // Draining to the low water mark refills the upload queue.
    assert!(fixture.pool.pop_for_test().is_some());
    crate::test_support::wait_for("refilled upload queue", || {
        fixture.pool.len() == 100 && fixture.queue.uploads_paused()
    });
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fixture.pool.len(), 100);
    assert_eq!(fixture.queue.len(), 9_850);

    // Staged uploads don't pin the snapshot; queued actions do until
    // they're dropped.
    fixture.stop();
    assert_eq!(destroyed.load(Ordering::SeqCst), 0);
    drop(tracker);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_duplicate_uploads_resume_dispatch() {
    use crate::intake::IntakeCommand;

    let fixture = Fixture::new(1 << 20);
    let (tracker, _) = fixture.snapshot_file("hot.log", b"contents");
    fixture.remote.block_uploads();

    for _ in 0..150 {
        fixture.queue.enqueue(BackupAction::Upload {
            source: tracker.add_reference(Path::new("/vol/hot.log")),
        });
    }

    crate::test_support::wait_for("paused dispatch", || fixture.queue.uploads_paused());
    assert_eq!(fixture.pool.len(), 100);

    // One worker blocks on the upload, and the other only finds
    // duplicates of the same path.
    fixture.pool.start(2).expect("should start workers");
    fixture.remote.wait_for_blocked_uploads(1);
    crate::test_support::wait_for("drained duplicates", || {
        fixture.queue.is_idle() && fixture.pool.len() == 0
    });
    assert!(!fixture.queue.uploads_paused());

    fixture.remote.release_uploads();
    crate::test_support::wait_for("idle pool", || fixture.pool.is_idle());
    assert_eq!(fixture.remote.upload_count("vol/hot.log"), 1);
    assert_eq!(
        fixture.intake.try_recv(),
        Some(IntakeCommand::Recheck("/vol/hot.log".into()))
    );
    assert_eq!(fixture.intake.try_recv(), None);

    fixture.stop();
}

#[test]
fn test_upload_classification() {
    use std::sync::atomic::Ordering;

    let fixture = Fixture::new(8);

    // Small files are staged, and release their snapshot right away.
    let (tracker, destroyed) = fixture.snapshot_file("small", b"tiny");
    let source = tracker.add_reference(Path::new("/vol/small"));
    drop(tracker);
    fixture.queue.enqueue(BackupAction::Upload { source });
    fixture.wait_until_idle();
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);

    let file = fixture.pool.pop_for_test().expect("should have queued the file");
    assert!(matches!(file.source, FileSource::Staged(_)));
    assert_eq!(file.remote_path, "vol/small");
    assert_eq!(file.size, 4);
    assert_eq!(
        std::fs::read(file.source.path()).expect("should read staged copy"),
        b"tiny"
    );

    // Large ones are read from the snapshot.
    let (tracker, destroyed) = fixture.snapshot_file("large", b"0123456789");
    let source = tracker.add_reference(Path::new("/vol/large"));
    drop(tracker);
    fixture.queue.enqueue(BackupAction::Upload { source });
    fixture.wait_until_idle();
    assert_eq!(destroyed.load(Ordering::SeqCst), 0);

    let file = fixture.pool.pop_for_test().expect("should have queued the file");
    assert!(matches!(file.source, FileSource::Snapshot(_)));
    drop(file);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);

    fixture.stop();
}

#[test]
fn test_upload_skips_unchanged_file() {
    use crate::checksum::checksum_bytes;
    use crate::file_state::FileState;

    let fixture = Fixture::new(1 << 20);
    let (tracker, _) = fixture.snapshot_file("same", b"contents");
    fixture
        .cache
        .update_file_state(FileState::whole(
            "vol/same".into(),
            None,
            8,
            0,
            checksum_bytes(b"contents"),
        ))
        .expect("should update");

    fixture.queue.enqueue(BackupAction::Upload {
        source: tracker.add_reference(Path::new("/vol/same")),
    });
    fixture.wait_until_idle();
    assert_eq!(fixture.pool.len(), 0);

    // A vanished file goes back to intake.
    fixture.queue.enqueue(BackupAction::Upload {
        source: tracker.add_reference(Path::new("/vol/missing")),
    });
    fixture.wait_until_idle();
    assert_eq!(fixture.pool.len(), 0);
    assert_eq!(
        fixture.intake.try_recv(),
        Some(crate::intake::IntakeCommand::Recheck("/vol/missing".into()))
    );

    fixture.stop();
}

#[test]
fn test_move_retries_when_network_is_down() {
    use crate::file_state::FileState;

    let fixture = Fixture::new(1 << 20);
    let cancel = CancellationToken::new();
    fixture
        .remote
        .upload_whole("vol/dir/a", b"a", &cancel)
        .expect("should upload");
    for path in ["vol/dir/a", "vol/dirt"] {
        fixture
            .cache
            .update_file_state(FileState::whole(path.into(), None, 1, 0, "sum".into()))
            .expect("should update");
    }

    // More failures than one retry absorbs.
    fixture.remote.fail_next(2);
    fixture.queue.enqueue(BackupAction::Move {
        from: "/vol/dir".into(),
        to: "/vol/moved".into(),
    });

    crate::test_support::wait_for("move", || {
        fixture
            .cache
            .contains_path("vol/moved/a")
            .expect("should look up")
    });
    fixture.wait_until_idle();

    assert!(!fixture.cache.contains_path("vol/dir/a").expect("should look up"));
    assert!(fixture.cache.contains_path("vol/dirt").expect("should look up"));
    assert_eq!(fixture.remote.contents("vol/moved/a"), Some(b"a".to_vec()));
    assert_eq!(
        fixture.remote.renames(),
        vec![("vol/dir/a".to_string(), "vol/moved/a".to_string())]
    );

    fixture.stop();
}

#[test]
fn test_failed_move_reuploads_target() {
    use crate::file_state::FileState;

    let fixture = Fixture::new(1 << 20);
    // Cached, but missing from the remote: the rename fails for good.
    fixture
        .cache
        .update_file_state(FileState::whole("vol/a".into(), None, 1, 0, "sum".into()))
        .expect("should update");

    fixture.queue.enqueue(BackupAction::Move {
        from: "/vol/a".into(),
        to: "/vol/b".into(),
    });
    fixture.wait_until_idle();

    assert!(!fixture.cache.contains_path("vol/a").expect("should look up"));
    assert!(!fixture.cache.contains_path("vol/b").expect("should look up"));
    assert_eq!(
        fixture.intake.try_recv(),
        Some(crate::intake::IntakeCommand::Recheck("/vol/b".into()))
    );

    fixture.stop();
}

#[test]
fn test_move_onto_file_with_other_layout() {
    use crate::file_state::FileState;

    let fixture = Fixture::new(1 << 20);
    let cancel = CancellationToken::new();
    let whole = |path: &str, checksum: &str| {
        fixture
            .cache
            .update_file_state(FileState::whole(path.into(), None, 2, 0, checksum.into()))
            .expect("should update");
    };
    let parts = |path: &str, checksum: &str| {
        for part in 0..2 {
            fixture
                .remote
                .upload_part(path, part, checksum.as_bytes(), &cancel)
                .expect("should upload");
            fixture
                .cache
                .update_file_state(FileState::part(path.into(), part, None, checksum.into()))
                .expect("should update");
        }
        whole(path, checksum);
    };

    fixture
        .remote
        .upload_whole("vol/a", b"a", &cancel)
        .expect("should upload");
    whole("vol/a", "sum-a");
    parts("vol/b", "sum-b");

    // A whole file replaces a multipart one: the old parts go away.
    fixture.queue.enqueue(BackupAction::Move {
        from: "/vol/a".into(),
        to: "/vol/b".into(),
    });
    fixture.wait_until_idle();

    assert_eq!(
        fixture
            .cache
            .get_file_state("vol/b")
            .expect("should look up")
            .map(|state| state.checksum),
        Some("sum-a".to_string())
    );
    assert!(fixture.cache.part_states("vol/b").expect("should look up").is_empty());
    assert_eq!(fixture.remote.paths(), vec!["vol/b".to_string()]);
    assert_eq!(fixture.remote.contents("vol/b"), Some(b"a".to_vec()));

    // A multipart file replaces a whole one: the old blob goes away.
    parts("vol/c", "sum-c");
    fixture.queue.enqueue(BackupAction::Move {
        from: "/vol/c".into(),
        to: "/vol/b".into(),
    });
    fixture.wait_until_idle();

    assert_eq!(fixture.cache.part_states("vol/b").expect("should look up").len(), 2);
    assert!(!fixture.cache.contains_path("vol/c").expect("should look up"));
    assert_eq!(
        fixture.remote.paths(),
        vec!["vol/b.part0".to_string(), "vol/b.part1".to_string()]
    );

    fixture.stop();
}

#[test]
fn test_delete_directory() {
    use crate::file_state::FileState;
    use crate::remote::part_blob_path;

    let fixture = Fixture::new(1 << 20);
    let cancel = CancellationToken::new();
    for path in ["vol/dir/x", "vol/dirt"] {
        fixture
            .remote
            .upload_whole(path, b"x", &cancel)
            .expect("should upload");
        fixture
            .cache
            .update_file_state(FileState::whole(path.into(), None, 1, 0, "sum".into()))
            .expect("should update");
    }

    fixture
        .remote
        .upload_part("vol/dir/y", 0, b"y", &cancel)
        .expect("should upload");
    fixture
        .cache
        .update_file_state(FileState::part("vol/dir/y".into(), 0, None, "sum".into()))
        .expect("should update");
    fixture
        .cache
        .update_file_state(FileState::whole("vol/dir/y".into(), None, 1, 0, "sum".into()))
        .expect("should update");

    fixture.queue.enqueue(BackupAction::Delete {
        path: "/vol/dir".into(),
    });
    fixture.wait_until_idle();

    assert!(fixture
        .cache
        .file_states_under("vol/dir")
        .expect("should look up")
        .is_empty());
    assert!(fixture.cache.contains_path("vol/dirt").expect("should look up"));
    assert_eq!(
        fixture.remote.paths(),
        vec!["vol/dirt".to_string()],
        "parts and whole files under the directory should be gone"
    );
    assert_eq!(fixture.remote.delete_count(&part_blob_path("vol/dir/y", 0)), 1);

    fixture.stop();
}
