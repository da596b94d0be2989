//! The remote file state cache tracks what remote storage holds for
//! every backed up path.
//!
//! The in-memory map is rebuilt at load time by replaying the batch
//! files in ascending order.  Every mutation is appended to the
//! current batch (`batch-N.open`) before it's applied in memory.
//! Rolling over closes the current batch and durably enqueues its
//! upload; consolidation periodically merges old batches.
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;
use tracing::instrument;

use crate::batch_file::apply_state;
use crate::batch_file::batch_path;
use crate::batch_file::list_batches;
use crate::batch_file::open_batch_path;
use crate::batch_file::remote_batch_path;
use crate::batch_file::replay_batch;
use crate::batch_file::BatchFileInfo;
use crate::batch_file::BatchWriter;
use crate::cache_action_log::CacheActionLog;
use crate::chain_error;
use crate::chain_warn;
use crate::consolidation::finish_consolidation;
use crate::consolidation::merge_batches;
use crate::consolidation::select_candidates;
use crate::consolidation::write_consolidated;
use crate::consolidation::ConsolidationPolicy;
use crate::file_state::FileState;
use crate::file_state::StateKey;
use crate::fresh_info;
use crate::remote::is_at_or_under;
use crate::result::Result;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lifecycle {
    Unloaded,
    Loaded,
    Stopped,
}

#[derive(Debug)]
struct CacheState {
    lifecycle: Lifecycle,
    states: BTreeMap<StateKey, FileState>,
    // Closed batches: number -> size in bytes.
    batches: BTreeMap<u64, u64>,
    // Opened lazily on the first write after a rollover.
    current: Option<BatchWriter>,
    next_batch: u64,
    rollover_deadline: Option<Instant>,
}

#[derive(Debug)]
pub struct RemoteFileStateCache {
    directory: PathBuf,
    remote_prefix: String,
    rollover: Duration,
    consolidation: ConsolidationPolicy,
    actions: Arc<CacheActionLog>,
    state: Mutex<CacheState>,
    // Wakes the rollover timer.
    cond: Condvar,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Returns the cache key for `path`'s file-level state.
fn whole_key(path: &str) -> StateKey {
    StateKey {
        path: path.to_string(),
        part: None,
    }
}

impl RemoteFileStateCache {
    /// Returns a cache for the batch files in `directory`.  Batches
    /// are uploaded under `remote_prefix`, via `actions`.
    ///
    /// The cache is loaded lazily, on first access.
    pub fn new(
        directory: PathBuf,
        remote_prefix: String,
        rollover: Duration,
        consolidation: ConsolidationPolicy,
        actions: Arc<CacheActionLog>,
    ) -> Arc<RemoteFileStateCache> {
        Arc::new(RemoteFileStateCache {
            directory,
            remote_prefix,
            rollover,
            consolidation,
            actions,
            state: Mutex::new(CacheState {
                lifecycle: Lifecycle::Unloaded,
                states: BTreeMap::new(),
                batches: BTreeMap::new(),
                current: None,
                next_batch: 1,
                rollover_deadline: None,
            }),
            cond: Condvar::new(),
            timer: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().expect("cache lock should not be poisoned")
    }

    /// Locks the cache, after loading it if necessary.
    fn lock_loaded(&self) -> Result<MutexGuard<'_, CacheState>> {
        let mut state = self.lock();
        if state.lifecycle == Lifecycle::Unloaded {
            self.load_locked(&mut state)?;
        }

        Ok(state)
    }

    /// Locks the cache for a mutation.
    fn lock_mutable(&self) -> Result<MutexGuard<'_, CacheState>> {
        let state = self.lock_loaded()?;
        if state.lifecycle == Lifecycle::Stopped {
            return Err(fresh_info!("cache is stopped", directory=?self.directory));
        }

        Ok(state)
    }

    fn remote_batch(&self, number: u64) -> String {
        remote_batch_path(&self.remote_prefix, number)
    }

    /// Loads the cache from its batch files.  Idempotent.
    #[instrument(skip(self), fields(directory=?self.directory), err)]
    pub fn load_cache(&self) -> Result<()> {
        self.lock_loaded().map(|_| ())
    }

    fn load_locked(&self, state: &mut CacheState) -> Result<()> {
        std::fs::create_dir_all(&self.directory).map_err(
            |e| chain_error!(e, "failed to create cache directory", directory=?self.directory),
        )?;

        let mut listing = list_batches(&self.directory)?;
        let mut max_seen = listing.closed.keys().next_back().copied().unwrap_or(0);

        // Batches left open by a crash are complete logs: close and
        // upload them.
        for number in listing.open {
            let source = open_batch_path(&self.directory, number);
            let target = batch_path(&self.directory, number);
            std::fs::rename(&source, &target)
                .map_err(|e| chain_error!(e, "failed to close leftover batch", ?source))?;

            let size = std::fs::metadata(&target).map(|meta| meta.len()).unwrap_or(0);
            self.actions
                .enqueue_upload(&target, self.remote_batch(number))?;
            listing.closed.insert(number, size);
            max_seen = max_seen.max(number);
        }

        // Finish interrupted consolidations.
        for newest in listing.consolidating {
            let older: Vec<u64> = listing.closed.range(..newest).map(|(n, _)| *n).collect();
            tracing::info!(newest, older=?older, "finishing interrupted consolidation");

            let size = finish_consolidation(
                &self.directory,
                newest,
                &older,
                &self.actions,
                &self.remote_prefix,
            )?;
            for number in older {
                listing.closed.remove(&number);
            }

            listing.closed.insert(newest, size);
            max_seen = max_seen.max(newest);
        }

        let mut states = BTreeMap::new();
        for number in listing.closed.keys() {
            replay_batch(&batch_path(&self.directory, *number), &mut states)?;
        }

        tracing::info!(
            directory=?self.directory,
            batches = listing.closed.len(),
            states = states.len(),
            "loaded remote file state cache"
        );

        state.states = states;
        state.batches = listing.closed;
        state.next_batch = state.next_batch.max(max_seen + 1);
        state.lifecycle = Lifecycle::Loaded;
        Ok(())
    }

    /// Appends `record` to the current batch, opening a new batch
    /// (and arming the rollover timer) if needed.
    fn append_locked(&self, state: &mut CacheState, record: &FileState) -> Result<()> {
        if state.current.is_none() {
            let writer = BatchWriter::create(&self.directory, state.next_batch)?;
            state.next_batch += 1;
            state.current = Some(writer);
            state.rollover_deadline = Some(Instant::now() + self.rollover);
            self.cond.notify_all();
        }

        if let Some(writer) = state.current.as_mut() {
            writer.append(record)?;
        }

        Ok(())
    }

    /// Logs and applies `record`.
    fn record_locked(&self, state: &mut CacheState, record: FileState) -> Result<()> {
        self.append_locked(state, &record)?;
        apply_state(&mut state.states, record);
        Ok(())
    }

    pub fn get_file_state(&self, path: &str) -> Result<Option<FileState>> {
        Ok(self.lock_loaded()?.states.get(&whole_key(path)).cloned())
    }

    pub fn get_part_state(&self, path: &str, part: u32) -> Result<Option<FileState>> {
        let key = StateKey {
            path: path.to_string(),
            part: Some(part),
        };

        Ok(self.lock_loaded()?.states.get(&key).cloned())
    }

    pub fn contains_path(&self, path: &str) -> Result<bool> {
        Ok(self.lock_loaded()?.states.contains_key(&whole_key(path)))
    }

    /// Returns the part states for `path`, in part order.
    pub fn part_states(&self, path: &str) -> Result<Vec<FileState>> {
        let state = self.lock_loaded()?;
        let start = StateKey {
            path: path.to_string(),
            part: Some(0),
        };

        Ok(state
            .states
            .range(start..)
            .take_while(|(key, _)| key.path == path)
            .map(|(_, state)| state.clone())
            .collect())
    }

    /// Returns all the states (file-level and parts) for `path` and
    /// any path under the directory `path`.
    pub fn file_states_under(&self, path: &str) -> Result<Vec<FileState>> {
        let state = self.lock_loaded()?;

        Ok(state
            .states
            .range(whole_key(path)..)
            .take_while(|(key, _)| key.path.starts_with(path))
            .filter(|(key, _)| is_at_or_under(&key.path, path))
            .map(|(_, state)| state.clone())
            .collect())
    }

    /// Returns a copy of every state in the cache, in key order.
    pub fn all_states(&self) -> Result<Vec<FileState>> {
        Ok(self.lock_loaded()?.states.values().cloned().collect())
    }

    /// Returns the closed batches, as batch number -> size.
    pub fn batches(&self) -> Result<BTreeMap<u64, u64>> {
        Ok(self.lock_loaded()?.batches.clone())
    }

    /// Records `state` as the new remote state for its key.
    #[instrument(level = "debug", skip(self), err)]
    pub fn update_file_state(&self, state: FileState) -> Result<()> {
        let mut guard = self.lock_mutable()?;
        self.record_locked(&mut guard, state)
    }

    /// Removes the file-level state for `path`.  Returns whether there
    /// was one.
    #[instrument(level = "debug", skip(self), err)]
    pub fn remove_file_state(&self, path: &str) -> Result<bool> {
        let mut guard = self.lock_mutable()?;
        if !guard.states.contains_key(&whole_key(path)) {
            return Ok(false);
        }

        self.record_locked(&mut guard, FileState::tombstone(path.to_string(), None))?;
        Ok(true)
    }

    /// Removes the state for part `part` of `path`.  Returns whether
    /// there was one.
    #[instrument(level = "debug", skip(self), err)]
    pub fn remove_part_state(&self, path: &str, part: u32) -> Result<bool> {
        let mut guard = self.lock_mutable()?;
        let key = StateKey {
            path: path.to_string(),
            part: Some(part),
        };

        if !guard.states.contains_key(&key) {
            return Ok(false);
        }

        self.record_locked(&mut guard, FileState::tombstone(path.to_string(), Some(part)))?;
        Ok(true)
    }

    /// Removes every state at or under `path`, and returns them.
    #[instrument(level = "debug", skip(self), err)]
    pub fn remove_states_under(&self, path: &str) -> Result<Vec<FileState>> {
        let mut guard = self.lock_mutable()?;
        let removed: Vec<FileState> = guard
            .states
            .range(whole_key(path)..)
            .take_while(|(key, _)| key.path.starts_with(path))
            .filter(|(key, _)| is_at_or_under(&key.path, path))
            .map(|(_, state)| state.clone())
            .collect();

        for state in &removed {
            self.record_locked(&mut guard, FileState::tombstone(state.path.clone(), state.part))?;
        }

        Ok(removed)
    }

    /// Moves the file-level state and part states of `from` to `to`,
    /// atomically with respect to other cache operations.  States at
    /// `to` that `from` doesn't overwrite are removed.  Returns
    /// whether anything moved.
    #[instrument(level = "debug", skip(self), err)]
    pub fn move_file_state(&self, from: &str, to: &str) -> Result<bool> {
        let mut guard = self.lock_mutable()?;
        let moved: Vec<FileState> = guard
            .states
            .range(whole_key(from)..)
            .take_while(|(key, _)| key.path == from)
            .map(|(_, state)| state.clone())
            .collect();
        if moved.is_empty() {
            return Ok(false);
        }

        let carried: BTreeSet<Option<u32>> = moved.iter().map(|state| state.part).collect();
        let stale: Vec<Option<u32>> = guard
            .states
            .range(whole_key(to)..)
            .take_while(|(key, _)| key.path == to)
            .map(|(key, _)| key.part)
            .filter(|part| !carried.contains(part))
            .collect();
        for part in stale {
            self.record_locked(&mut guard, FileState::tombstone(to.to_string(), part))?;
        }

        for state in &moved {
            self.record_locked(&mut guard, FileState::tombstone(from.to_string(), state.part))?;
            self.record_locked(
                &mut guard,
                FileState {
                    path: to.to_string(),
                    ..state.clone()
                },
            )?;
        }

        Ok(true)
    }

    /// Closes the current batch, enqueues its upload, and consolidates
    /// if there are enough closed batches (unless `defer_consolidation`).
    ///
    /// The next write opens a fresh batch.
    #[instrument(level = "debug", skip(self), err)]
    pub fn upload_current_batch_and_begin_next(
        &self,
        defer_consolidation: bool,
    ) -> Result<Option<BatchFileInfo>> {
        let mut guard = self.lock_mutable()?;
        self.roll_locked(&mut guard, defer_consolidation)
    }

    fn roll_locked(
        &self,
        state: &mut CacheState,
        defer_consolidation: bool,
    ) -> Result<Option<BatchFileInfo>> {
        state.rollover_deadline = None;

        let writer = match state.current.take() {
            Some(writer) => writer,
            None => return Ok(None),
        };

        let info = writer.close(&self.directory)?;
        state.batches.insert(info.number, info.size);
        self.actions.enqueue_upload(
            &batch_path(&self.directory, info.number),
            self.remote_batch(info.number),
        )?;

        tracing::debug!(?info, "rolled over batch");
        if !defer_consolidation && state.batches.len() > self.consolidation.min_batches {
            self.consolidate_locked(state)?;
        }

        Ok(Some(info))
    }

    /// Consolidates the oldest batches if the policy says it's worth
    /// it.  Returns the consolidated batch, if any.
    #[instrument(level = "debug", skip(self), err)]
    pub fn consolidate_batches(&self) -> Result<Option<BatchFileInfo>> {
        let mut guard = self.lock_loaded()?;
        self.consolidate_locked(&mut guard)
    }

    fn consolidate_locked(&self, state: &mut CacheState) -> Result<Option<BatchFileInfo>> {
        let candidates = match select_candidates(&state.batches, &self.consolidation) {
            Some(candidates) => candidates,
            None => return Ok(None),
        };

        let (newest, older) = match candidates.split_last() {
            Some((newest, older)) => (*newest, older),
            None => return Ok(None),
        };

        let merged = merge_batches(&self.directory, &candidates)?;
        write_consolidated(&self.directory, newest, &merged)?;
        let size = finish_consolidation(
            &self.directory,
            newest,
            older,
            &self.actions,
            &self.remote_prefix,
        )?;

        for number in older {
            state.batches.remove(number);
        }
        state.batches.insert(newest, size);

        Ok(Some(BatchFileInfo {
            number: newest,
            size,
        }))
    }

    /// Spawns the thread that rolls the current batch over once it's
    /// been open for the rollover period.
    pub fn start_rollover_timer(self: &Arc<Self>) {
        let cache = self.clone();
        let spawned = std::thread::Builder::new()
            .name("snapvault-rollover".into())
            .spawn(move || cache.run_rollover_timer());

        match spawned {
            Ok(handle) => *self.timer.lock().expect("timer lock should not be poisoned") = Some(handle),
            Err(e) => {
                let _ = chain_error!(e, "failed to spawn rollover timer");
            }
        }
    }

    fn run_rollover_timer(&self) {
        let mut state = self.lock();

        loop {
            if state.lifecycle == Lifecycle::Stopped {
                return;
            }

            let deadline = state.rollover_deadline;
            match deadline {
                None => {
                    state = self
                        .cond
                        .wait(state)
                        .expect("cache lock should not be poisoned")
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        if let Err(e) = self.roll_locked(&mut state, false) {
                            let _ = chain_warn!(e, "failed to roll over batch");
                        }
                    } else {
                        state = self
                            .cond
                            .wait_timeout(state, deadline - now)
                            .expect("cache lock should not be poisoned")
                            .0;
                    }
                }
            }
        }
    }

    /// Blocks until the pending batch uploads and deletions are done.
    pub fn wait_while_busy(&self) {
        self.actions.wait_while_busy();
    }

    /// Rolls the current batch over (without consolidating) and
    /// rejects further mutations.
    #[instrument(skip(self), fields(directory=?self.directory))]
    pub fn stop(&self) {
        {
            let mut state = self.lock();
            if state.lifecycle == Lifecycle::Loaded {
                if let Err(e) = self.roll_locked(&mut state, true) {
                    let _ = chain_warn!(e, "failed to roll over batch on stop");
                }
            }

            state.lifecycle = Lifecycle::Stopped;
            self.cond.notify_all();
        }

        let timer = self
            .timer
            .lock()
            .expect("timer lock should not be poisoned")
            .take();
        if let Some(handle) = timer {
            if handle.join().is_err() {
                tracing::error!("rollover timer panicked");
            }
        }
    }
}

#[cfg(test)]
struct TestCache {
    dir: tempfile::TempDir,
    remote: Arc<crate::test_support::MemoryStorage>,
}

#[cfg(test)]
impl TestCache {
    fn new() -> TestCache {
        TestCache {
            dir: tempfile::tempdir().expect("should create temp dir"),
            remote: Arc::new(Default::default()),
        }
    }

    fn batch_dir(&self) -> PathBuf {
        self.dir.path().join("batches")
    }

    fn open_with(&self, batch_dir: PathBuf, policy: ConsolidationPolicy) -> Arc<RemoteFileStateCache> {
        let actions = CacheActionLog::open(
            self.dir.path().join("actions"),
            self.remote.clone(),
            crate::retry::RetryPolicy {
                limit: 1,
                delay: Duration::from_millis(1),
            },
            Duration::from_millis(1),
            tokio_util::sync::CancellationToken::new(),
        )
        .expect("should open action log");

        RemoteFileStateCache::new(batch_dir, "cache".into(), Duration::from_secs(3600), policy, actions)
    }

    fn open(&self) -> Arc<RemoteFileStateCache> {
        self.open_with(
            self.batch_dir(),
            ConsolidationPolicy {
                min_batches: 1000,
                bytes_per_batch: 1 << 20,
            },
        )
    }
}

#[cfg(test)]
fn whole(path: &str, checksum: &str) -> FileState {
    FileState::whole(path.into(), Some(format!("key-{}", checksum)), 10, 20, checksum.into())
}

#[test]
fn test_basic_operations() {
    let test = TestCache::new();
    let cache = test.open();

    cache.update_file_state(whole("a/x", "1")).expect("should update");
    cache
        .update_file_state(FileState::part("a/y".into(), 0, None, "p0".into()))
        .expect("should update");
    cache
        .update_file_state(FileState::part("a/y".into(), 1, None, "p1".into()))
        .expect("should update");
    cache.update_file_state(whole("a/y", "2")).expect("should update");
    cache.update_file_state(whole("a b", "3")).expect("should update");
    cache.update_file_state(whole("a/z/w", "4")).expect("should update");

    assert!(cache.contains_path("a/x").expect("should look up"));
    assert_eq!(
        cache.get_file_state("a/x").expect("should look up"),
        Some(whole("a/x", "1"))
    );
    assert_eq!(
        cache
            .part_states("a/y")
            .expect("should look up")
            .iter()
            .map(|state| state.checksum.as_str())
            .collect::<Vec<_>>(),
        vec!["p0", "p1"]
    );
    assert_eq!(
        cache
            .get_part_state("a/y", 1)
            .expect("should look up")
            .map(|state| state.checksum),
        Some("p1".to_string())
    );

    let under: Vec<String> = cache
        .file_states_under("a")
        .expect("should look up")
        .into_iter()
        .map(|state| state.path)
        .collect();
    assert_eq!(under, vec!["a/x", "a/y", "a/y", "a/y", "a/z/w"]);

    assert!(cache.move_file_state("a/y", "b/y").expect("should move"));
    assert!(!cache.move_file_state("a/y", "b/y").expect("should move"));
    assert_eq!(cache.part_states("b/y").expect("should look up").len(), 2);
    assert!(cache.part_states("a/y").expect("should look up").is_empty());

    assert!(cache.remove_file_state("a/x").expect("should remove"));
    assert!(!cache.remove_file_state("a/x").expect("should remove"));
    assert!(cache.remove_part_state("b/y", 1).expect("should remove"));

    let removed = cache.remove_states_under("a").expect("should remove");
    assert_eq!(removed.len(), 1);
    assert!(cache.contains_path("a b").expect("should look up"));

    // Everything survives a reload.
    let expected = cache.all_states().expect("should list");
    cache.stop();
    assert!(cache.update_file_state(whole("q", "5")).is_err());

    let reloaded = test.open();
    assert_eq!(reloaded.all_states().expect("should list"), expected);
}

#[test]
fn test_idempotent_replay() {
    use rand::Rng;
    use rand::SeedableRng;

    let test = TestCache::new();
    let cache = test.open();
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);

    for batch in 0..6 {
        for i in 0..50 {
            let path = format!("dir/file{}", rng.gen_range(0..20));
            if rng.gen_bool(0.3) {
                cache.remove_file_state(&path).expect("should remove");
            } else {
                cache
                    .update_file_state(whole(&path, &format!("{}.{}", batch, i)))
                    .expect("should update");
            }
        }

        cache
            .upload_current_batch_and_begin_next(true)
            .expect("should roll");
    }

    let expected = cache.all_states().expect("should list");
    cache.load_cache().expect("loading again is a no-op");
    assert_eq!(cache.all_states().expect("should list"), expected);

    let numbers: Vec<u64> = cache
        .batches()
        .expect("should list")
        .keys()
        .copied()
        .collect();
    assert_eq!(numbers.len(), 6);

    // Load every prefix of the batch sequence, then the full
    // sequence in the same directory.
    for split in 0..=numbers.len() {
        let partial_dir = test.dir.path().join(format!("partial{}", split));
        std::fs::create_dir_all(&partial_dir).expect("should create");

        let copy = |number: &u64| {
            std::fs::copy(
                batch_path(&test.batch_dir(), *number),
                batch_path(&partial_dir, *number),
            )
            .expect("should copy");
        };

        numbers[..split].iter().for_each(copy);
        let policy = ConsolidationPolicy {
            min_batches: 1000,
            bytes_per_batch: 1,
        };
        test.open_with(partial_dir.clone(), policy)
            .load_cache()
            .expect("should load");

        numbers[split..].iter().for_each(copy);
        let full = test.open_with(partial_dir, policy);
        assert_eq!(full.all_states().expect("should list"), expected);
    }
}

#[test]
fn test_tombstones_survive_reload() {
    let test = TestCache::new();
    let cache = test.open();

    for i in 0..10 {
        cache
            .update_file_state(whole(&format!("f{}", i), "x"))
            .expect("should update");
    }
    cache
        .upload_current_batch_and_begin_next(true)
        .expect("should roll");

    for i in 0..10 {
        if i % 2 == 0 {
            cache.remove_file_state(&format!("f{}", i)).expect("should remove");
        }
    }
    cache
        .upload_current_batch_and_begin_next(true)
        .expect("should roll");

    // Re-create one path in a later batch.
    cache.update_file_state(whole("f4", "y")).expect("should update");
    cache.stop();

    let reloaded = test.open();
    for i in 0..10 {
        let expected = i % 2 == 1 || i == 4;
        assert_eq!(
            reloaded.contains_path(&format!("f{}", i)).expect("should look up"),
            expected,
            "f{}",
            i
        );
    }
}

#[test]
fn test_rollover_enqueues_upload() {
    let test = TestCache::new();
    let cache = test.open();

    assert_eq!(
        cache
            .upload_current_batch_and_begin_next(false)
            .expect("should roll"),
        None
    );

    cache.update_file_state(whole("a", "1")).expect("should update");
    let info = cache
        .upload_current_batch_and_begin_next(false)
        .expect("should roll")
        .expect("should close a batch");

    assert_eq!(cache.batches().expect("should list").get(&info.number), Some(&info.size));
    let pending = cache.actions.pending_actions();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].remote_path(), remote_batch_path("cache", info.number));

    // The next write opens a fresh batch.
    cache.update_file_state(whole("b", "2")).expect("should update");
    assert!(open_batch_path(&test.batch_dir(), info.number + 1).exists());
}

#[test]
fn test_leftover_open_batch_is_closed_on_load() {
    let test = TestCache::new();
    {
        let cache = test.open();
        cache.update_file_state(whole("a", "1")).expect("should update");
        // Simulate a crash: no stop, no rollover.
    }

    let cache = test.open();
    assert!(cache.contains_path("a").expect("should look up"));
    assert_eq!(cache.batches().expect("should list").len(), 1);
    assert_eq!(cache.actions.pending(), 1);

    // New batches never reuse the leftover's number.
    cache.update_file_state(whole("b", "2")).expect("should update");
    let info = cache
        .upload_current_batch_and_begin_next(true)
        .expect("should roll")
        .expect("should close");
    assert_eq!(info.number, 2);
}

#[test]
fn test_consolidation_preserves_state() {
    let test = TestCache::new();
    let policy = ConsolidationPolicy {
        min_batches: 3,
        bytes_per_batch: 1 << 20,
    };
    let cache = test.open_with(test.batch_dir(), policy);

    let rounds: Vec<Vec<(&str, Option<&str>)>> = vec![
        vec![("a", Some("a1")), ("b", Some("b1")), ("c", Some("c1"))],
        vec![("a", Some("a2")), ("b", None)],
        vec![("c", None), ("c", Some("c3")), ("d", Some("d3"))],
        vec![("e", Some("e4"))],
        vec![("b", Some("b5"))],
    ];

    for round in &rounds {
        for (path, checksum) in round {
            match checksum {
                Some(checksum) => cache.update_file_state(whole(path, checksum)),
                None => cache.remove_file_state(path).map(|_| ()),
            }
            .expect("should apply");
        }

        cache
            .upload_current_batch_and_begin_next(true)
            .expect("should roll");
    }

    let expected = cache.all_states().expect("should list");
    let info = cache
        .consolidate_batches()
        .expect("should consolidate")
        .expect("should have consolidated");

    // Three candidates: batches 1-3 merge into batch 3.
    assert_eq!(info.number, 3);
    assert_eq!(
        cache
            .batches()
            .expect("should list")
            .keys()
            .copied()
            .collect::<Vec<_>>(),
        vec![3, 4, 5]
    );

    let mut merged = BTreeMap::new();
    replay_batch(&batch_path(&test.batch_dir(), 3), &mut merged).expect("should read");
    let checksums: Vec<String> = merged.values().map(|state| state.checksum.clone()).collect();
    assert_eq!(checksums, vec!["a2", "c3", "d3"]);

    assert_eq!(cache.all_states().expect("should list"), expected);

    let deletes: Vec<String> = cache
        .actions
        .pending_actions()
        .into_iter()
        .filter_map(|action| match action.kind {
            crate::cache_action_log::CacheActionKind::DeleteFile { path } => Some(path),
            _ => None,
        })
        .collect();
    assert_eq!(
        deletes,
        vec![remote_batch_path("cache", 1), remote_batch_path("cache", 2)]
    );

    cache.stop();
    assert_eq!(test.open().all_states().expect("should list"), expected);
}

#[test]
fn test_rollover_consolidates() {
    let test = TestCache::new();
    let policy = ConsolidationPolicy {
        min_batches: 2,
        bytes_per_batch: 1 << 20,
    };
    let cache = test.open_with(test.batch_dir(), policy);

    let batch_numbers = || {
        cache
            .batches()
            .expect("should list")
            .keys()
            .copied()
            .collect::<Vec<_>>()
    };
    let deletes = || {
        cache
            .actions
            .pending_actions()
            .into_iter()
            .filter_map(|action| match action.kind {
                crate::cache_action_log::CacheActionKind::DeleteFile { path } => Some(path),
                _ => None,
            })
            .collect::<Vec<_>>()
    };
    let roll = |path: &str, checksum: &str| {
        cache.update_file_state(whole(path, checksum)).expect("should update");
        cache
            .upload_current_batch_and_begin_next(false)
            .expect("should roll")
            .expect("should close a batch")
    };

    assert_eq!(roll("a", "1").number, 1);
    assert_eq!(roll("b", "2").number, 2);
    assert_eq!(batch_numbers(), vec![1, 2]);
    assert!(deletes().is_empty());

    // A third closed batch crosses the threshold: 1 and 2 merge into 2.
    assert_eq!(roll("a", "3").number, 3);
    assert_eq!(batch_numbers(), vec![2, 3]);
    assert_eq!(deletes(), vec![remote_batch_path("cache", 1)]);
    assert!(!batch_path(&test.batch_dir(), 1).exists());

    assert_eq!(roll("c", "4").number, 4);
    assert_eq!(batch_numbers(), vec![3, 4]);
    assert_eq!(
        deletes(),
        vec![remote_batch_path("cache", 1), remote_batch_path("cache", 2)]
    );

    let mut merged = BTreeMap::new();
    replay_batch(&batch_path(&test.batch_dir(), 3), &mut merged).expect("should read");
    let checksums: Vec<String> = merged.values().map(|state| state.checksum.clone()).collect();
    assert_eq!(checksums, vec!["3", "2"]);

    let expected = cache.all_states().expect("should list");
    assert_eq!(expected.len(), 3);
    cache.stop();
    assert_eq!(test.open().all_states().expect("should list"), expected);
}

#[test]
fn test_move_replaces_target_parts() {
    let test = TestCache::new();
    let cache = test.open();

    cache.update_file_state(whole("a", "1")).expect("should update");
    for part in 0..2 {
        cache
            .update_file_state(FileState::part("b".into(), part, None, format!("p{}", part)))
            .expect("should update");
    }
    cache.update_file_state(whole("b", "2")).expect("should update");

    assert!(cache.move_file_state("a", "b").expect("should move"));
    assert_eq!(
        cache.get_file_state("b").expect("should look up"),
        Some(whole("b", "1"))
    );
    assert!(cache.part_states("b").expect("should look up").is_empty());
    assert!(!cache.contains_path("a").expect("should look up"));

    // The stale parts stay gone after a reload.
    let expected = cache.all_states().expect("should list");
    cache.stop();
    assert_eq!(test.open().all_states().expect("should list"), expected);
}

#[test]
fn test_interrupted_consolidation_is_finished_on_load() {
    let test = TestCache::new();
    let expected;
    {
        let cache = test.open();
        for i in 0..4 {
            cache
                .update_file_state(whole(&format!("f{}", i % 3), &i.to_string()))
                .expect("should update");
            cache
                .upload_current_batch_and_begin_next(true)
                .expect("should roll");
        }

        expected = cache.all_states().expect("should list");

        // Crash right after publishing the consolidation output.
        let merged = merge_batches(&test.batch_dir(), &[1, 2, 3]).expect("should merge");
        write_consolidated(&test.batch_dir(), 3, &merged).expect("should write");
    }

    let cache = test.open();
    assert_eq!(cache.all_states().expect("should list"), expected);
    assert_eq!(
        cache
            .batches()
            .expect("should list")
            .keys()
            .copied()
            .collect::<Vec<_>>(),
        vec![3, 4]
    );
    assert!(!batch_path(&test.batch_dir(), 1).exists());
    assert!(!crate::batch_file::consolidating_batch_path(&test.batch_dir(), 3).exists());
}

#[test]
fn test_rollover_timer() {
    let test = TestCache::new();
    let actions = CacheActionLog::open(
        test.dir.path().join("actions"),
        test.remote.clone(),
        crate::retry::RetryPolicy {
            limit: 1,
            delay: Duration::from_millis(1),
        },
        Duration::from_millis(1),
        tokio_util::sync::CancellationToken::new(),
    )
    .expect("should open action log");

    let cache = RemoteFileStateCache::new(
        test.batch_dir(),
        "cache".into(),
        Duration::from_millis(20),
        ConsolidationPolicy {
            min_batches: 10,
            bytes_per_batch: 1 << 20,
        },
        actions,
    );
    cache.start_rollover_timer();

    cache.update_file_state(whole("a", "1")).expect("should update");
    crate::test_support::wait_for("rollover", || {
        cache.batches().expect("should list").len() == 1
    });

    cache.stop();
}
