//! The long-poll stabilizer handles files that stay open for writing
//! past the open-handle poller's timeout (databases, logs).
//!
//! Every cycle re-snapshots each file, and promotes it once it has no
//! writer, once its contents didn't change since the previous cycle,
//! or once its hard deadline passes.
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;
use tracing::instrument;

use crate::backup_action::ActionSink;
use crate::backup_action::BackupAction;
use crate::checksum::files_identical;
use crate::chain_error;
use crate::chain_warn;
use crate::open_handles::paths_open_for_write;
use crate::open_handles::OpenHandleEnumerator;
use crate::result::Result;
use crate::snapshot_tracker::SnapshotReference;
use crate::volumes::Snapshotter;

#[derive(Debug)]
struct Entry {
    // The baseline: contents as of the previous cycle.
    reference: SnapshotReference,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct LongPollState {
    entries: Vec<Entry>,
    cycling: bool,
    stopping: bool,
}

/// What a cycle decided for one entry.
#[derive(Debug)]
enum Decision {
    Drop,
    Promote(SnapshotReference),
    Keep(Entry),
}

#[derive(Debug)]
pub struct LongPollStabilizer {
    interval: Duration,
    deadline: Duration,
    snapshotter: Arc<Snapshotter>,
    open_handles: Arc<dyn OpenHandleEnumerator>,
    actions: Arc<dyn ActionSink>,
    state: Mutex<LongPollState>,
    cond: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LongPollStabilizer {
    /// Returns a stabilizer that polls at most every `interval`, and
    /// promotes escalated files after `deadline` at the latest.
    pub fn new(
        interval: Duration,
        deadline: Duration,
        snapshotter: Arc<Snapshotter>,
        open_handles: Arc<dyn OpenHandleEnumerator>,
        actions: Arc<dyn ActionSink>,
    ) -> Arc<LongPollStabilizer> {
        Arc::new(LongPollStabilizer {
            interval,
            deadline,
            snapshotter,
            open_handles,
            actions,
            state: Default::default(),
            cond: Condvar::new(),
            worker: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LongPollState> {
        self.state
            .lock()
            .expect("long-poll lock should not be poisoned")
    }

    /// Spawns the long-poll thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let stabilizer = self.clone();
        let handle = std::thread::Builder::new()
            .name("snapvault-long-poll".into())
            .spawn(move || stabilizer.run())
            .map_err(|e| chain_error!(e, "failed to spawn long-poll stabilizer"))?;

        *self.worker.lock().expect("worker lock should not be poisoned") = Some(handle);
        Ok(())
    }

    /// Starts tracking `reference`, a file that stayed open for too
    /// long.
    pub fn escalate(&self, reference: SnapshotReference) {
        tracing::debug!(path=?reference.path(), "escalating to long poll");

        let mut state = self.lock();
        if state.stopping {
            return;
        }

        state.entries.push(Entry {
            reference,
            deadline: Instant::now() + self.deadline,
        });
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.entries.is_empty() && !state.cycling
    }

    /// Waits until the next cycle is due, and takes the entries.
    /// Returns None to exit.
    fn wait_for_cycle(&self) -> Option<Vec<Entry>> {
        let mut state = self.lock();

        while state.entries.is_empty() && !state.stopping {
            state = self
                .cond
                .wait(state)
                .expect("long-poll lock should not be poisoned");
        }

        let start = Instant::now();
        loop {
            if state.stopping {
                return None;
            }

            // Entries may be escalated while we wait, so recompute the
            // wake up time every time.
            let earliest = state
                .entries
                .iter()
                .map(|entry| entry.deadline)
                .min()
                .unwrap_or(start + self.interval);
            let wake = earliest.min(start + self.interval);
            let now = Instant::now();
            if now >= wake {
                break;
            }

            state = self
                .cond
                .wait_timeout(state, wake - now)
                .expect("long-poll lock should not be poisoned")
                .0;
        }

        state.cycling = true;
        Some(std::mem::take(&mut state.entries))
    }

    fn run(&self) {
        while let Some(entries) = self.wait_for_cycle() {
            self.poll_once(entries);
        }
    }

    fn decide(
        entry: Entry,
        fresh: Option<SnapshotReference>,
        has_writer: bool,
        now: Instant,
    ) -> Decision {
        let fresh = match fresh {
            Some(fresh) => fresh,
            // We couldn't snapshot; try again next cycle, unless we're
            // out of time.
            None if now >= entry.deadline => return Decision::Promote(entry.reference),
            None => return Decision::Keep(entry),
        };

        let exists = std::fs::symlink_metadata(fresh.snapshot_path())
            .map(|meta| meta.file_type().is_file())
            .unwrap_or(false);
        if !exists {
            return Decision::Drop;
        }

        if now >= entry.deadline || !has_writer {
            return Decision::Promote(fresh);
        }

        match files_identical(entry.reference.snapshot_path(), fresh.snapshot_path()) {
            Ok(true) => Decision::Promote(fresh),
            Ok(false) => Decision::Keep(Entry {
                reference: fresh,
                deadline: entry.deadline,
            }),
            Err(e) => {
                let _ = chain_warn!(e, "failed to compare snapshots", path=?fresh.path());
                Decision::Keep(Entry {
                    reference: fresh,
                    deadline: entry.deadline,
                })
            }
        }
    }

    /// Re-snapshots every entry and promotes the stable ones.
    #[instrument(level = "debug", skip(self, entries), fields(count = entries.len()))]
    fn poll_once(&self, entries: Vec<Entry>) {
        let paths: Vec<_> = entries
            .iter()
            .map(|entry| entry.reference.path().to_owned())
            .collect();
        let fresh = self.snapshotter.snapshot_references(&paths);
        let writers = match paths_open_for_write(&*self.open_handles) {
            Ok(writers) => Some(writers),
            Err(e) => {
                let _ = chain_warn!(e, "failed to enumerate open handles");
                None
            }
        };

        let now = Instant::now();
        let mut promoted = Vec::new();
        let mut kept = Vec::new();
        let mut dropped = 0;
        for ((entry, fresh), path) in entries.into_iter().zip(fresh).zip(&paths) {
            // Without an enumeration, assume the file is still written to.
            let has_writer = writers
                .as_ref()
                .map(|writers| writers.contains(path))
                .unwrap_or(true);

            match Self::decide(entry, fresh, has_writer, now) {
                Decision::Drop => dropped += 1,
                Decision::Promote(reference) => promoted.push(reference),
                Decision::Keep(entry) => kept.push(entry),
            }
        }

        tracing::debug!(
            promoted = promoted.len(),
            kept = kept.len(),
            dropped,
            "long-poll cycle"
        );

        self.lock().entries.extend(kept);
        for reference in promoted {
            self.actions.enqueue(BackupAction::Upload { source: reference });
        }

        let mut state = self.lock();
        state.cycling = false;
        self.cond.notify_all();
    }

    /// Stops the long-poll thread, and releases every reference.
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
                tracing::error!("long-poll stabilizer panicked");
            }
        }

        let entries = std::mem::take(&mut self.lock().entries);
        tracing::debug!(released = entries.len(), "released long-poll snapshot references");
        drop(entries);
    }
}

#[cfg(test)]
struct Fixture {
    provider: Arc<crate::test_support::FakeSnapshotProvider>,
    snapshotter: Arc<Snapshotter>,
}

#[cfg(test)]
impl Fixture {
    fn new() -> Fixture {
        let provider = Arc::new(crate::test_support::FakeSnapshotProvider::new(1));
        let volumes = crate::volumes::VolumeMap::new(provider.volumes());
        let snapshotter = Arc::new(Snapshotter::new(provider.clone(), volumes));

        Fixture {
            provider,
            snapshotter,
        }
    }

    fn entry(&self, path: &std::path::Path, deadline: Instant) -> Entry {
        Entry {
            reference: self
                .snapshotter
                .snapshot_reference(path)
                .expect("should snapshot"),
            deadline,
        }
    }
}

#[test]
fn test_decide() {
    let fixture = Fixture::new();
    let path = fixture.provider.write_file(0, "db/data", b"v1");
    let later = Instant::now() + Duration::from_secs(3600);
    let now = Instant::now();

    // Unchanged contents promote, even with a writer.
    let fresh = fixture.snapshotter.snapshot_reference(&path);
    assert!(matches!(
        LongPollStabilizer::decide(fixture.entry(&path, later), fresh, true, now),
        Decision::Promote(_)
    ));

    // Changed contents become the new baseline.
    let entry = fixture.entry(&path, later);
    fixture.provider.write_file(0, "db/data", b"v2");
    let fresh = fixture.snapshotter.snapshot_reference(&path);
    match LongPollStabilizer::decide(entry, fresh, true, now) {
        Decision::Keep(kept) => {
            assert_eq!(std::fs::read(kept.reference.snapshot_path()).expect("should read"), b"v2");
            assert_eq!(kept.deadline, later);
        }
        other => panic!("unexpected decision {:?}", other),
    }

    // Changed contents promote once nobody writes to the file, or
    // past the deadline.
    let entry = fixture.entry(&path, later);
    fixture.provider.write_file(0, "db/data", b"v3");
    let fresh = fixture.snapshotter.snapshot_reference(&path);
    match LongPollStabilizer::decide(entry, fresh, false, now) {
        Decision::Promote(reference) => {
            assert_eq!(std::fs::read(reference.snapshot_path()).expect("should read"), b"v3")
        }
        other => panic!("unexpected decision {:?}", other),
    }

    let entry = fixture.entry(&path, now);
    fixture.provider.write_file(0, "db/data", b"v4");
    let fresh = fixture.snapshotter.snapshot_reference(&path);
    assert!(matches!(
        LongPollStabilizer::decide(entry, fresh, true, now),
        Decision::Promote(_)
    ));

    // Deleted files are dropped.
    let entry = fixture.entry(&path, later);
    std::fs::remove_file(&path).expect("should remove");
    let fresh = fixture.snapshotter.snapshot_reference(&path);
    assert!(matches!(
        LongPollStabilizer::decide(entry, fresh, true, now),
        Decision::Drop
    ));

    // Every snapshot has been released.
    assert_eq!(fixture.provider.live(), 0);
}

#[test]
fn test_long_poll_promotes_stable_file() {
    use crate::test_support::RecordingActions;
    use crate::test_support::ScriptedOpenHandles;

    let fixture = Fixture::new();
    let path = fixture.provider.write_file(0, "log", b"stable");
    let handles = Arc::new(ScriptedOpenHandles::default());
    handles.set_writer(&path, true);
    let sink = Arc::new(RecordingActions::default());

    let stabilizer = LongPollStabilizer::new(
        Duration::from_millis(10),
        Duration::from_secs(3600),
        fixture.snapshotter.clone(),
        handles,
        sink.clone(),
    );
    stabilizer.start().expect("should start");
    stabilizer.escalate(
        fixture
            .snapshotter
            .snapshot_reference(&path)
            .expect("should snapshot"),
    );

    crate::test_support::wait_for("promotion", || sink.len() == 1);
    crate::test_support::wait_for("idle stabilizer", || stabilizer.is_idle());
    assert_eq!(sink.paths(), vec![path]);

    // Only the promoted reference's snapshot is still alive.
    assert_eq!(fixture.provider.live(), 1);
    stabilizer.stop();
    drop(sink.take());
    assert_eq!(fixture.provider.live(), 0);
}

#[test]
fn test_stop_releases_references() {
    use crate::test_support::RecordingActions;
    use crate::test_support::ScriptedOpenHandles;

    let fixture = Fixture::new();
    let path = fixture.provider.write_file(0, "log", b"busy");
    let stabilizer = LongPollStabilizer::new(
        Duration::from_secs(3600),
        Duration::from_secs(3600),
        fixture.snapshotter.clone(),
        Arc::new(ScriptedOpenHandles::default()),
        Arc::new(RecordingActions::default()),
    );
    stabilizer.start().expect("should start");

    stabilizer.escalate(
        fixture
            .snapshotter
            .snapshot_reference(&path)
            .expect("should snapshot"),
    );
    assert_eq!(stabilizer.len(), 1);
    assert_eq!(fixture.provider.live(), 1);

    stabilizer.stop();
    assert_eq!(fixture.provider.live(), 0);
}
