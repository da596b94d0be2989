//! The upload pool's workers drain a stack of files to upload: the
//! most recently queued file goes first.
//!
//! Files larger than the part size are uploaded as numbered parts,
//! and only the parts whose checksum changed since the last upload
//! hit the network.  A file that fails to upload goes back to intake,
//! to be re-examined from scratch.
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::thread::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::backup_action::BackupAction;
use crate::backup_action::FileReference;
use crate::chain_error;
use crate::checksum::checksum_bytes;
use crate::file_state::FileState;
use crate::file_state_cache::RemoteFileStateCache;
use crate::filtered_io_error;
use crate::fresh_error;
use crate::intake::IntakeHandle;
use crate::remote::check_cancelled;
use crate::remote::is_at_or_under;
use crate::remote::read_local_file;
use crate::remote::RemoteStorage;
use crate::result::Level;
use crate::result::Result;
use crate::retry::retry_transient;
use crate::retry::RetryPolicy;

/// The pool reports back to whoever feeds it.
pub trait UploadObserver: std::fmt::Debug + Send + Sync {
    /// Called whenever a worker takes a file and leaves at most the
    /// low water mark in the queue.
    fn upload_queue_drained(&self);

    /// Receives an action that waited for an upload to complete.
    fn requeue(&self, action: BackupAction);
}

#[derive(Clone, Copy, Debug)]
pub struct UploadPoolConfig {
    /// Files larger than this are uploaded in parts of this size.
    pub part_size: u64,
    pub low_water_mark: usize,
    pub retry: RetryPolicy,
}

/// Bookkeeping for a path some worker is uploading.
#[derive(Debug, Default)]
struct InFlight {
    // Another upload for the same path was skipped.
    recheck: bool,
    // Moves and deletes waiting for the upload.
    deferred: Vec<BackupAction>,
}

#[derive(Debug, Default)]
struct PoolState {
    stack: Vec<FileReference>,
    uploading: HashMap<String, InFlight>,
    stopping: bool,
}

#[derive(Debug)]
pub struct UploadPool {
    config: UploadPoolConfig,
    cache: Arc<RemoteFileStateCache>,
    remote: Arc<dyn RemoteStorage>,
    intake: IntakeHandle,
    cancel: CancellationToken,
    state: Mutex<PoolState>,
    cond: Condvar,
    observer: Mutex<Option<Weak<dyn UploadObserver>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl UploadPool {
    pub fn new(
        config: UploadPoolConfig,
        cache: Arc<RemoteFileStateCache>,
        remote: Arc<dyn RemoteStorage>,
        intake: IntakeHandle,
        cancel: CancellationToken,
    ) -> Arc<UploadPool> {
        Arc::new(UploadPool {
            config,
            cache,
            remote,
            intake,
            cancel,
            state: Default::default(),
            cond: Condvar::new(),
            observer: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .expect("upload pool lock should not be poisoned")
    }

    pub fn set_observer(&self, observer: Weak<dyn UploadObserver>) {
        *self
            .observer
            .lock()
            .expect("observer lock should not be poisoned") = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn UploadObserver>> {
        self.observer
            .lock()
            .expect("observer lock should not be poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Spawns `count` worker threads.
    pub fn start(self: &Arc<Self>, count: usize) -> Result<()> {
        let mut workers = self
            .workers
            .lock()
            .expect("workers lock should not be poisoned");

        for index in 0..count {
            let pool = self.clone();
            let handle = std::thread::Builder::new()
                .name(format!("snapvault-upload-{}", index))
                .spawn(move || pool.run_worker())
                .map_err(|e| chain_error!(e, "failed to spawn upload worker", index))?;
            workers.push(handle);
        }

        Ok(())
    }

    /// Pushes `file` on the stack, and returns the new stack depth.
    pub fn enqueue(&self, file: FileReference) -> usize {
        let mut state = self.lock();
        if state.stopping {
            drop(state);
            tracing::debug!(path=?file.path, "upload pool is stopped; dropping file");
            return 0;
        }

        state.stack.push(file);
        self.cond.notify_one();
        state.stack.len()
    }

    /// Returns the number of files waiting for a worker.
    pub fn len(&self) -> usize {
        self.lock().stack.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.stack.is_empty() && state.uploading.is_empty()
    }

    /// If a worker is uploading `remote_path` or a path under it,
    /// parks `action` until that upload completes, and returns None.
    /// Otherwise, hands `action` back.
    pub fn defer_if_uploading(&self, remote_path: &str, action: BackupAction) -> Option<BackupAction> {
        let mut state = self.lock();
        let busy = state
            .uploading
            .keys()
            .find(|uploading| is_at_or_under(uploading, remote_path))
            .cloned();

        match busy.and_then(|key| state.uploading.get_mut(&key)) {
            Some(in_flight) => {
                tracing::debug!(%remote_path, ?action, "deferring action until upload completes");
                in_flight.deferred.push(action);
                None
            }
            None => Some(action),
        }
    }

    /// Tells the observer about the stack depth after a pop.
    fn after_pop(&self, remaining: usize) {
        if remaining <= self.config.low_water_mark {
            if let Some(observer) = self.observer() {
                observer.upload_queue_drained();
            }
        }
    }

    /// Blocks until there's a file no other worker is uploading, and
    /// marks it as in flight.  Returns None when stopping.
    fn next_file(&self) -> Option<FileReference> {
        let mut skipped = Vec::new();
        let (file, remaining) = {
            let mut state = self.lock();
            loop {
                if state.stopping {
                    return None;
                }

                let file = match state.stack.pop() {
                    Some(file) => file,
                    None if !skipped.is_empty() => {
                        // The duplicates drained the stack, so no
                        // successful pop will report it.
                        drop(state);
                        skipped.clear();
                        self.after_pop(0);
                        state = self.lock();
                        continue;
                    }
                    None => {
                        state = self
                            .cond
                            .wait(state)
                            .expect("upload pool lock should not be poisoned");
                        continue;
                    }
                };

                match state.uploading.get_mut(&file.remote_path) {
                    Some(in_flight) => {
                        tracing::debug!(path=?file.path, "already uploading; will recheck afterwards");
                        in_flight.recheck = true;
                        skipped.push(file);
                    }
                    None => {
                        state
                            .uploading
                            .insert(file.remote_path.clone(), InFlight::default());
                        break (file, state.stack.len());
                    }
                }
            }
        };

        // Release the skipped files' snapshots outside the lock.
        drop(skipped);
        self.after_pop(remaining);
        Some(file)
    }

    /// Clears `file`'s in-flight marker, and follows up on what
    /// happened during the upload.
    fn finish(&self, file: &FileReference) {
        // The path stays in flight until every deferred action is
        // handed back.
        loop {
            let deferred = {
                let mut state = self.lock();
                let in_flight = match state.uploading.get_mut(&file.remote_path) {
                    Some(in_flight) => in_flight,
                    None => return,
                };

                if std::mem::take(&mut in_flight.recheck) {
                    self.intake.recheck(file.path.clone());
                }

                let deferred = std::mem::take(&mut in_flight.deferred);
                if deferred.is_empty() {
                    state.uploading.remove(&file.remote_path);
                    self.cond.notify_all();
                    return;
                }

                deferred
            };

            match self.observer() {
                Some(observer) => deferred
                    .into_iter()
                    .for_each(|action| observer.requeue(action)),
                None => tracing::warn!(count = deferred.len(), "no observer for deferred actions"),
            }
        }
    }

    fn run_worker(&self) {
        while let Some(file) = self.next_file() {
            match self.upload(&file) {
                Ok(()) => tracing::debug!(path=?file.path, size = file.size, "uploaded file"),
                Err(_) if self.cancel.is_cancelled() || self.lock().stopping => {}
                Err(e) => {
                    tracing::info!(?e, path=?file.path, "upload failed; rechecking the file");
                    self.intake.recheck(file.path.clone());
                }
            }

            self.finish(&file);
        }
    }

    #[instrument(level = "debug", skip(self, file), fields(path=%file.remote_path, size=file.size), err)]
    fn upload(&self, file: &FileReference) -> Result<()> {
        if file.size > self.config.part_size {
            self.upload_parts(file)
        } else {
            self.upload_whole(file)
        }
    }

    fn delete_part(&self, path: &str, part: u32) -> Result<()> {
        retry_transient(&self.config.retry, &self.cancel, "delete part", || {
            self.remote.delete_part(path, part, &self.cancel)
        })?;
        self.cache.remove_part_state(path, part).map(|_| ())
    }

    fn upload_whole(&self, file: &FileReference) -> Result<()> {
        let contents = read_local_file(file.source.path())?;
        let content_key = retry_transient(&self.config.retry, &self.cancel, "upload file", || {
            self.remote
                .upload_whole(&file.remote_path, &contents, &self.cancel)
        })?;

        // The previous version may have been uploaded in parts.
        for state in self.cache.part_states(&file.remote_path)? {
            if let Some(part) = state.part {
                self.delete_part(&file.remote_path, part)?;
            }
        }

        self.cache.update_file_state(FileState::whole(
            file.remote_path.clone(),
            content_key,
            file.size,
            file.last_modified_ticks,
            file.checksum.clone(),
        ))
    }

    fn upload_parts(&self, file: &FileReference) -> Result<()> {
        let part_size = self.config.part_size.max(1);
        let count = (file.size + part_size - 1) / part_size;
        let count = u32::try_from(count)
            .map_err(|e| fresh_error!("file has too many parts", ?e, path=?file.path, count))?;

        let source = file.source.path();
        let handle = File::open(source).map_err(|e| {
            filtered_io_error!(e, ErrorKind::NotFound => Level::INFO, "failed to open upload source", ?source)
        })?;

        let existing: BTreeMap<u32, String> = self
            .cache
            .part_states(&file.remote_path)?
            .into_iter()
            .filter_map(|state| state.part.map(|part| (part, state.checksum)))
            .collect();
        // Only the file-level state is trusted here: part states may
        // come from an earlier attempt that failed halfway.
        let was_whole = match self.cache.get_file_state(&file.remote_path)? {
            Some(state) if !state.is_tombstone() => {
                state.content_key.is_some() || state.size <= part_size as i64
            }
            _ => false,
        };

        let mut buf = vec![0u8; part_size.min(file.size) as usize];
        let mut uploaded = 0;
        for part in 0..count {
            check_cancelled(&self.cancel)?;

            let offset = part as u64 * part_size;
            let bytes = &mut buf[..part_size.min(file.size - offset) as usize];
            handle
                .read_exact_at(bytes, offset)
                .map_err(|e| chain_error!(e, "failed to read part", ?source, part))?;

            let checksum = checksum_bytes(bytes);
            if existing.get(&part) == Some(&checksum) {
                continue;
            }

            let bytes = &*bytes;
            let content_key = retry_transient(&self.config.retry, &self.cancel, "upload part", || {
                self.remote
                    .upload_part(&file.remote_path, part, bytes, &self.cancel)
            })?;
            self.cache.update_file_state(FileState::part(
                file.remote_path.clone(),
                part,
                content_key,
                checksum,
            ))?;
            uploaded += 1;
        }

        // The file shrank.
        for part in existing.range(count..).map(|(part, _)| *part) {
            self.delete_part(&file.remote_path, part)?;
        }

        if was_whole {
            retry_transient(&self.config.retry, &self.cancel, "delete whole file", || {
                self.remote.delete_whole(&file.remote_path, &self.cancel)
            })?;
        }

        tracing::debug!(path=?file.path, uploaded, parts = count, "uploaded changed parts");
        self.cache.update_file_state(FileState::whole(
            file.remote_path.clone(),
            None,
            file.size,
            file.last_modified_ticks,
            file.checksum.clone(),
        ))
    }

    /// Pops the top of the stack without uploading it.
    #[cfg(test)]
    pub(crate) fn pop_for_test(&self) -> Option<FileReference> {
        let (file, remaining) = {
            let mut state = self.lock();
            let file = state.stack.pop()?;
            (file, state.stack.len())
        };

        self.after_pop(remaining);
        Some(file)
    }

    /// Stops the workers after their current upload, and drops the
    /// files still queued.
    pub fn stop(&self) {
        {
            let mut state = self.lock();
            state.stopping = true;
            self.cond.notify_all();
        }

        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .expect("workers lock should not be poisoned"),
        );
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("upload worker panicked");
            }
        }

        let stack = std::mem::take(&mut self.lock().stack);
        tracing::debug!(dropped = stack.len(), "stopped upload pool");
    }
}

#[cfg(test)]
struct Fixture {
    dir: tempfile::TempDir,
    remote: Arc<crate::test_support::MemoryStorage>,
    cache: Arc<RemoteFileStateCache>,
    intake: crate::intake::IntakeReceiver,
    pool: Arc<UploadPool>,
}

#[cfg(test)]
impl Fixture {
    fn new(part_size: u64, workers: usize) -> Fixture {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let remote = Arc::new(crate::test_support::MemoryStorage::default());
        let cache = crate::test_support::test_cache(dir.path(), remote.clone());
        let (handle, intake) = IntakeHandle::channel();

        let pool = UploadPool::new(
            UploadPoolConfig {
                part_size,
                low_water_mark: 0,
                retry: RetryPolicy {
                    limit: 1,
                    delay: std::time::Duration::from_millis(1),
                },
            },
            cache.clone(),
            remote.clone(),
            handle,
            CancellationToken::new(),
        );
        pool.start(workers).expect("should start");

        Fixture {
            dir,
            remote,
            cache,
            intake,
            pool,
        }
    }

    /// Returns a reference to a staged copy of `contents`, for the
    /// live path `/data/<name>`.
    fn file(&self, name: &str, contents: &[u8]) -> FileReference {
        use std::io::Write;

        let mut temp = tempfile::NamedTempFile::new_in(self.dir.path()).expect("should create");
        temp.write_all(contents).expect("should write");

        FileReference {
            path: format!("/data/{}", name).into(),
            remote_path: format!("data/{}", name),
            source: crate::backup_action::FileSource::Staged(temp.into_temp_path()),
            size: contents.len() as u64,
            last_modified_ticks: 42,
            checksum: checksum_bytes(contents),
        }
    }

    fn upload(&self, name: &str, contents: &[u8]) {
        self.pool.enqueue(self.file(name, contents));
        crate::test_support::wait_for("upload", || self.pool.is_idle());
    }
}

#[test]
fn test_single_part_upload() {
    let fixture = Fixture::new(1024, 2);
    fixture.upload("small", b"hello");

    assert_eq!(fixture.remote.contents("data/small"), Some(b"hello".to_vec()));
    let state = fixture
        .cache
        .get_file_state("data/small")
        .expect("should look up")
        .expect("should exist");
    assert_eq!(state.size, 5);
    assert_eq!(state.last_modified_ticks, 42);
    assert_eq!(state.checksum, checksum_bytes(b"hello"));
    assert!(state.content_key.is_some());

    fixture.pool.stop();
}

#[test]
fn test_multipart_reuses_unchanged_parts() {
    use crate::remote::part_blob_path;

    let fixture = Fixture::new(4, 2);
    let part = |n| part_blob_path("data/big", n);

    fixture.upload("big", b"aaaabbbbcc");
    assert_eq!(fixture.cache.part_states("data/big").expect("should look up").len(), 3);
    assert_eq!(fixture.remote.contents(&part(2)), Some(b"cc".to_vec()));
    assert_eq!(fixture.remote.contents("data/big"), None);

    // Only the changed part goes over the network.
    fixture.upload("big", b"aaaaBBBBcc");
    assert_eq!(fixture.remote.upload_count(&part(0)), 1);
    assert_eq!(fixture.remote.upload_count(&part(1)), 2);
    assert_eq!(fixture.remote.upload_count(&part(2)), 1);

    // Shrinking deletes the trailing parts.
    fixture.upload("big", b"aaaaBB");
    assert_eq!(fixture.remote.upload_count(&part(0)), 1);
    assert_eq!(fixture.remote.upload_count(&part(1)), 3);
    assert_eq!(fixture.remote.delete_count(&part(2)), 1);
    assert_eq!(fixture.cache.part_states("data/big").expect("should look up").len(), 2);

    let state = fixture
        .cache
        .get_file_state("data/big")
        .expect("should look up")
        .expect("should exist");
    assert_eq!(state.size, 6);
    assert_eq!(state.content_key, None);

    // Small enough for a single part: the parts go away.
    fixture.upload("big", b"abc");
    assert_eq!(fixture.remote.contents("data/big"), Some(b"abc".to_vec()));
    assert!(fixture.cache.part_states("data/big").expect("should look up").is_empty());
    assert_eq!(fixture.remote.contents(&part(0)), None);
    assert_eq!(fixture.remote.contents(&part(1)), None);

    fixture.pool.stop();
}

#[test]
fn test_interrupted_conversion_to_parts() {
    use crate::intake::IntakeCommand;
    use crate::remote::part_blob_path;

    let fixture = Fixture::new(4, 1);
    fixture.upload("conv", b"abc");
    assert_eq!(fixture.remote.contents("data/conv"), Some(b"abc".to_vec()));

    // The last part fails after the first two made it.
    fixture.remote.fail_blob(&part_blob_path("data/conv", 2), 10);
    fixture.upload("conv", b"aaaabbbbcc");
    assert_eq!(
        fixture.intake.try_recv(),
        Some(IntakeCommand::Recheck("/data/conv".into()))
    );
    assert_eq!(fixture.cache.part_states("data/conv").expect("should look up").len(), 2);
    assert_eq!(fixture.remote.contents("data/conv"), Some(b"abc".to_vec()));

    // The retry still cleans up the whole-file blob.
    fixture.remote.fail_blob(&part_blob_path("data/conv", 2), 0);
    fixture.upload("conv", b"aaaabbbbcc");
    assert_eq!(fixture.remote.contents("data/conv"), None);
    assert_eq!(fixture.remote.delete_count("data/conv"), 1);
    assert_eq!(fixture.remote.upload_count(&part_blob_path("data/conv", 0)), 1);
    assert_eq!(fixture.cache.part_states("data/conv").expect("should look up").len(), 3);

    let state = fixture
        .cache
        .get_file_state("data/conv")
        .expect("should look up")
        .expect("should exist");
    assert_eq!(state.size, 10);
    assert_eq!(state.content_key, None);

    // Later part-wise uploads leave the whole-file path alone.
    fixture.upload("conv", b"aaaabbbbCC");
    assert_eq!(fixture.remote.delete_count("data/conv"), 1);

    fixture.pool.stop();
}

#[test]
fn test_no_double_upload() {
    use crate::intake::IntakeCommand;

    let fixture = Fixture::new(1024, 2);
    fixture.remote.block_uploads();

    fixture.pool.enqueue(fixture.file("same", b"first"));
    fixture.pool.enqueue(fixture.file("same", b"second"));
    fixture.remote.wait_for_blocked_uploads(1);

    // The other worker skips the duplicate instead of uploading it.
    crate::test_support::wait_for("skipped duplicate", || fixture.pool.len() == 0);
    fixture.remote.release_uploads();
    crate::test_support::wait_for("upload", || fixture.pool.is_idle());

    assert_eq!(fixture.remote.upload_count("data/same"), 1);
    assert_eq!(fixture.remote.max_concurrent_uploads(), 1);
    assert_eq!(
        fixture.intake.try_recv(),
        Some(IntakeCommand::Recheck("/data/same".into()))
    );
    assert_eq!(fixture.intake.try_recv(), None);

    fixture.pool.stop();
}

#[test]
fn test_failed_upload_is_rechecked() {
    use crate::intake::IntakeCommand;

    let fixture = Fixture::new(1024, 1);
    fixture.remote.fail_next(10);
    fixture.upload("flaky", b"contents");

    assert_eq!(fixture.remote.upload_count("data/flaky"), 0);
    assert!(!fixture.cache.contains_path("data/flaky").expect("should look up"));
    assert_eq!(
        fixture.intake.try_recv(),
        Some(IntakeCommand::Recheck("/data/flaky".into()))
    );

    fixture.pool.stop();
}

#[test]
fn test_defer_until_upload_completes() {
    #[derive(Debug, Default)]
    struct Observer {
        requeued: Mutex<Vec<BackupAction>>,
    }

    impl UploadObserver for Observer {
        fn upload_queue_drained(&self) {}

        fn requeue(&self, action: BackupAction) {
            self.requeued
                .lock()
                .expect("lock should not be poisoned")
                .push(action);
        }
    }

    let fixture = Fixture::new(1024, 1);
    let observer = Arc::new(Observer::default());
    let weak = Arc::downgrade(&observer) as Weak<dyn UploadObserver>;
    fixture.pool.set_observer(weak);

    fixture.remote.block_uploads();
    fixture.pool.enqueue(fixture.file("busy", b"contents"));
    fixture.remote.wait_for_blocked_uploads(1);

    let delete = BackupAction::Delete {
        path: "/data".into(),
    };
    assert!(fixture.pool.defer_if_uploading("data", delete).is_none());

    let unrelated = BackupAction::Delete {
        path: "/database".into(),
    };
    assert!(fixture.pool.defer_if_uploading("database", unrelated).is_some());

    fixture.remote.release_uploads();
    crate::test_support::wait_for("requeue", || {
        observer.requeued.lock().expect("lock should not be poisoned").len() == 1
    });

    fixture.pool.stop();
}
