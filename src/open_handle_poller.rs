//! The open-handle poller holds snapshot references until their file
//! has no writer left.
//!
//! Each cycle takes one bulk enumeration of open write handles, and
//! compacts the queue in one pass: references whose file has no
//! writer are promoted to the backup queue, and references still
//! written to past their deadline are escalated to the long-poll
//! stabilizer.
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
use crate::chain_error;
use crate::chain_warn;
use crate::long_poll::LongPollStabilizer;
use crate::open_handles::paths_open_for_write;
use crate::open_handles::OpenHandleEnumerator;
use crate::result::Result;
use crate::snapshot_tracker::SnapshotReference;

#[derive(Debug)]
struct Queued {
    reference: SnapshotReference,
    deadline: Instant,
    // Value of `generation` when the reference was queued.
    generation: u64,
}

#[derive(Debug, Default)]
struct PollerState {
    queue: Vec<Queued>,
    generation: u64,
    // True from the start of a poll cycle until its results are
    // handed off.
    cycling: bool,
    stopping: bool,
}

#[derive(Debug)]
pub struct OpenHandlePoller {
    interval: Duration,
    timeout: Duration,
    open_handles: Arc<dyn OpenHandleEnumerator>,
    long_poll: Arc<LongPollStabilizer>,
    actions: Arc<dyn ActionSink>,
    state: Mutex<PollerState>,
    cond: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OpenHandlePoller {
    /// Returns a poller that checks for writers every `interval`, and
    /// escalates references still written to after `timeout`.
    pub fn new(
        interval: Duration,
        timeout: Duration,
        open_handles: Arc<dyn OpenHandleEnumerator>,
        long_poll: Arc<LongPollStabilizer>,
        actions: Arc<dyn ActionSink>,
    ) -> Arc<OpenHandlePoller> {
        Arc::new(OpenHandlePoller {
            interval,
            timeout,
            open_handles,
            long_poll,
            actions,
            state: Default::default(),
            cond: Condvar::new(),
            worker: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PollerState> {
        self.state.lock().expect("poller lock should not be poisoned")
    }

    /// Spawns the polling thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let poller = self.clone();
        let handle = std::thread::Builder::new()
            .name("snapvault-handle-poller".into())
            .spawn(move || poller.run())
            .map_err(|e| chain_error!(e, "failed to spawn open-handle poller"))?;

        *self.worker.lock().expect("worker lock should not be poisoned") = Some(handle);
        Ok(())
    }

    /// Queues `references` until their files have no writer.
    pub fn enqueue(&self, references: Vec<SnapshotReference>) {
        if references.is_empty() {
            return;
        }

        let deadline = Instant::now() + self.timeout;
        let mut state = self.lock();
        if state.stopping {
            drop(state);
            tracing::debug!(count = references.len(), "poller is stopped; dropping references");
            return;
        }

        state.generation += 1;
        let generation = state.generation;
        state
            .queue
            .extend(references.into_iter().map(|reference| Queued {
                reference,
                deadline,
                generation,
            }));
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.queue.is_empty() && !state.cycling
    }

    #[cfg(test)]
    pub(crate) fn queued_paths(&self) -> Vec<std::path::PathBuf> {
        self.lock()
            .queue
            .iter()
            .map(|queued| queued.reference.path().to_owned())
            .collect()
    }

    /// Waits for work and for the poll interval.  Returns the
    /// generation at the start of the cycle, or None to exit.
    fn wait_for_cycle(&self) -> Option<u64> {
        let mut state = self.lock();

        while state.queue.is_empty() && !state.stopping {
            state = self
                .cond
                .wait(state)
                .expect("poller lock should not be poisoned");
        }

        let wake = Instant::now() + self.interval;
        loop {
            if state.stopping {
                return None;
            }

            let now = Instant::now();
            if now >= wake {
                break;
            }

            state = self
                .cond
                .wait_timeout(state, wake - now)
                .expect("poller lock should not be poisoned")
                .0;
        }

        state.cycling = true;
        Some(state.generation)
    }

    fn run(&self) {
        while let Some(generation) = self.wait_for_cycle() {
            self.poll_once(generation);
        }
    }

    /// Runs one poll cycle for the references queued at or before
    /// `generation`.
    #[instrument(level = "debug", skip(self))]
    fn poll_once(&self, generation: u64) {
        let writers = match paths_open_for_write(&*self.open_handles) {
            Ok(writers) => writers,
            Err(e) => {
                let _ = chain_warn!(e, "failed to enumerate open handles");
                let mut state = self.lock();
                state.cycling = false;
                self.cond.notify_all();
                return;
            }
        };

        let now = Instant::now();
        let mut promoted = Vec::new();
        let mut escalated = Vec::new();
        {
            let mut state = self.lock();
            let queue = std::mem::take(&mut state.queue);
            let mut kept = Vec::with_capacity(queue.len());

            for queued in queue {
                if queued.generation > generation {
                    kept.push(queued);
                } else if !writers.contains(queued.reference.path()) {
                    promoted.push(queued.reference);
                } else if now >= queued.deadline {
                    escalated.push(queued.reference);
                } else {
                    kept.push(queued);
                }
            }

            state.queue = kept;
        }

        if !promoted.is_empty() || !escalated.is_empty() {
            tracing::debug!(
                promoted = promoted.len(),
                escalated = escalated.len(),
                "open-handle poll cycle"
            );
        }

        for reference in promoted {
            self.actions.enqueue(BackupAction::Upload { source: reference });
        }

        for reference in escalated {
            self.long_poll.escalate(reference);
        }

        let mut state = self.lock();
        state.cycling = false;
        self.cond.notify_all();
    }

    /// Stops the polling thread, and releases every queued reference.
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
                tracing::error!("open-handle poller panicked");
            }
        }

        let queue = std::mem::take(&mut self.lock().queue);
        tracing::debug!(released = queue.len(), "released queued snapshot references");
        drop(queue);
    }
}

#[cfg(test)]
struct Fixture {
    provider: Arc<crate::test_support::FakeSnapshotProvider>,
    snapshotter: Arc<crate::volumes::Snapshotter>,
    handles: Arc<crate::test_support::ScriptedOpenHandles>,
    sink: Arc<crate::test_support::RecordingActions>,
    long_poll: Arc<LongPollStabilizer>,
}

#[cfg(test)]
impl Fixture {
    fn new() -> Fixture {
        let provider = Arc::new(crate::test_support::FakeSnapshotProvider::new(1));
        let volumes = crate::volumes::VolumeMap::new(provider.volumes());
        let snapshotter = Arc::new(crate::volumes::Snapshotter::new(provider.clone(), volumes));
        let handles = Arc::new(crate::test_support::ScriptedOpenHandles::default());
        let sink = Arc::new(crate::test_support::RecordingActions::default());

        // Never started: escalated references just sit there.
        let long_poll = LongPollStabilizer::new(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            snapshotter.clone(),
            handles.clone(),
            sink.clone(),
        );

        Fixture {
            provider,
            snapshotter,
            handles,
            sink,
            long_poll,
        }
    }

    fn poller(&self, timeout: Duration) -> Arc<OpenHandlePoller> {
        let poller = OpenHandlePoller::new(
            Duration::from_millis(5),
            timeout,
            self.handles.clone(),
            self.long_poll.clone(),
            self.sink.clone(),
        );
        poller.start().expect("should start");
        poller
    }
}

#[test]
fn test_promote_files_without_writers() {
    let fixture = Fixture::new();
    let busy = fixture.provider.write_file(0, "busy", b"1");
    let idle = fixture.provider.write_file(0, "idle", b"2");
    fixture.handles.set_writer(&busy, true);

    let poller = fixture.poller(Duration::from_secs(3600));
    poller.enqueue(
        fixture
            .snapshotter
            .snapshot_references(&[busy.clone(), idle.clone()])
            .into_iter()
            .flatten()
            .collect(),
    );

    crate::test_support::wait_for("idle file promotion", || fixture.sink.len() == 1);
    assert_eq!(fixture.sink.paths(), vec![idle]);
    assert_eq!(poller.queued_paths(), vec![busy.clone()]);

    fixture.handles.set_writer(&busy, false);
    crate::test_support::wait_for("busy file promotion", || fixture.sink.len() == 2);
    crate::test_support::wait_for("idle poller", || poller.is_idle());
    assert_eq!(fixture.long_poll.len(), 0);

    poller.stop();
}

#[test]
fn test_one_enumeration_per_cycle() {
    let fixture = Fixture::new();
    let paths: Vec<_> = (0..100)
        .map(|i| fixture.provider.write_file(0, &format!("dir/file{}", i), b"x"))
        .collect();
    let references: Vec<_> = fixture
        .snapshotter
        .snapshot_references(&paths)
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(references.len(), 100);

    let poller = fixture.poller(Duration::from_secs(3600));
    poller.enqueue(references);

    crate::test_support::wait_for("promotion", || fixture.sink.len() == 100);
    crate::test_support::wait_for("idle poller", || poller.is_idle());
    assert_eq!(fixture.handles.calls(), 1);

    poller.stop();
}

#[test]
fn test_escalate_after_timeout() {
    let fixture = Fixture::new();
    let log = fixture.provider.write_file(0, "app.log", b"line");
    fixture.handles.set_writer(&log, true);

    let poller = fixture.poller(Duration::ZERO);
    poller.enqueue(fixture.snapshotter.snapshot_references(&[log]).into_iter().flatten().collect());

    crate::test_support::wait_for("escalation", || fixture.long_poll.len() == 1);
    crate::test_support::wait_for("idle poller", || poller.is_idle());
    assert_eq!(fixture.sink.len(), 0);

    poller.stop();
}

#[test]
fn test_stop_releases_references() {
    let fixture = Fixture::new();
    let busy = fixture.provider.write_file(0, "busy", b"1");
    fixture.handles.set_writer(&busy, true);

    let poller = fixture.poller(Duration::from_secs(3600));
    poller.enqueue(fixture.snapshotter.snapshot_references(&[busy]).into_iter().flatten().collect());
    assert_eq!(fixture.provider.live(), 1);

    poller.stop();
    assert_eq!(fixture.provider.live(), 0);

    // A stopped poller drops new references on the floor.
    let other = fixture.provider.write_file(0, "other", b"2");
    poller.enqueue(fixture.snapshotter.snapshot_references(&[other]).into_iter().flatten().collect());
    assert_eq!(poller.len(), 0);
    assert_eq!(fixture.provider.live(), 0);
}
