//! The intake scheduler turns change notifications into snapshot
//! references.
//!
//! Notifications that arrive within one sharing window are coalesced:
//! when the window closes, the scheduler snapshots each volume touched
//! once, and hands one reference per path to the open-handle poller.
//! Moves and deletions don't need a snapshot, and go straight to the
//! backup queue.
//!
//! While paused (during a full scan), every notification only marks
//! its paths dirty; resuming replays the dirty set.
use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;
use tracing::instrument;

use crate::backup_action::ActionSink;
use crate::backup_action::BackupAction;
use crate::chain_error;
use crate::open_handle_poller::OpenHandlePoller;
use crate::result::Result;
use crate::volumes::Snapshotter;

/// What the file system watcher tells us.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChangeNotification {
    Updated(PathBuf),
    Moved { from: PathBuf, to: PathBuf },
    Deleted(PathBuf),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum IntakeCommand {
    Notify(ChangeNotification),
    /// Look at `path` again from scratch; unlike `Updated`, a missing
    /// path turns into a deletion.
    Recheck(PathBuf),
    Pause,
    Resume,
    Stop,
}

/// The producer side of the intake queue.  Cheap to clone.
#[derive(Clone, Debug)]
pub struct IntakeHandle {
    sender: Sender<IntakeCommand>,
    // Commands sent but not yet handed downstream.
    outstanding: Arc<AtomicUsize>,
}

/// The consumer side of the intake queue.
#[derive(Debug)]
pub(crate) struct IntakeReceiver {
    receiver: Receiver<IntakeCommand>,
    outstanding: Arc<AtomicUsize>,
}

impl IntakeHandle {
    pub(crate) fn channel() -> (IntakeHandle, IntakeReceiver) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let outstanding = Arc::new(AtomicUsize::new(0));

        (
            IntakeHandle {
                sender,
                outstanding: outstanding.clone(),
            },
            IntakeReceiver {
                receiver,
                outstanding,
            },
        )
    }

    fn send(&self, command: IntakeCommand) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.sender.send(command) {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(command=?e.into_inner(), "intake is stopped; dropping command");
        }
    }

    pub fn notify(&self, notification: ChangeNotification) {
        self.send(IntakeCommand::Notify(notification));
    }

    pub fn recheck(&self, path: PathBuf) {
        self.send(IntakeCommand::Recheck(path));
    }

    /// Buffers notifications as dirty paths until `resume`.
    pub fn pause(&self) {
        self.send(IntakeCommand::Pause);
    }

    pub fn resume(&self) {
        self.send(IntakeCommand::Resume);
    }

    pub(crate) fn stop(&self) {
        self.send(IntakeCommand::Stop);
    }

    /// Returns true if every command sent so far has been handed
    /// downstream.
    pub fn is_idle(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) == 0
    }
}

impl IntakeReceiver {
    fn release(&self, count: usize) {
        if count > 0 {
            self.outstanding.fetch_sub(count, Ordering::SeqCst);
        }
    }

    #[cfg(test)]
    pub(crate) fn try_recv(&self) -> Option<IntakeCommand> {
        let command = self.receiver.try_recv().ok()?;
        self.release(1);
        Some(command)
    }
}

/// Returns whether `path` is (still) a regular file.  Symlinks aren't.
fn is_regular_file(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_file())
        .unwrap_or(false)
}

#[derive(Debug)]
pub(crate) struct IntakeScheduler {
    window: Duration,
    snapshotter: Arc<Snapshotter>,
    poller: Arc<OpenHandlePoller>,
    actions: Arc<dyn ActionSink>,
    receiver: IntakeReceiver,
    paused: bool,
    // Paths waiting for the sharing window to close.
    pending: BTreeSet<PathBuf>,
    // The subset of `pending` that came from rechecks.
    rechecks: HashSet<PathBuf>,
    // Number of commands folded into `pending`.
    absorbed: usize,
    window_deadline: Option<Instant>,
    dirty: BTreeSet<PathBuf>,
}

impl IntakeScheduler {
    pub fn new(
        window: Duration,
        snapshotter: Arc<Snapshotter>,
        poller: Arc<OpenHandlePoller>,
        actions: Arc<dyn ActionSink>,
        receiver: IntakeReceiver,
    ) -> IntakeScheduler {
        IntakeScheduler {
            window,
            snapshotter,
            poller,
            actions,
            receiver,
            paused: false,
            pending: BTreeSet::new(),
            rechecks: HashSet::new(),
            absorbed: 0,
            window_deadline: None,
            dirty: BTreeSet::new(),
        }
    }

    /// Spawns the scheduler thread.
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("snapvault-intake".into())
            .spawn(move || self.run())
            .map_err(|e| chain_error!(e, "failed to spawn intake thread"))
    }

    fn run(mut self) {
        loop {
            let command = match self.window_deadline {
                None => self.receiver.receiver.recv().ok(),
                Some(deadline) => match self.receiver.receiver.recv_deadline(deadline) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => {
                        self.flush();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => None,
                },
            };

            match command {
                None | Some(IntakeCommand::Stop) => {
                    tracing::debug!(pending = self.pending.len(), "intake scheduler exiting");
                    return;
                }
                Some(command) => self.handle(command),
            }
        }
    }

    fn handle(&mut self, command: IntakeCommand) {
        match command {
            IntakeCommand::Notify(ChangeNotification::Updated(path)) => {
                if self.paused {
                    self.dirty.insert(path);
                } else {
                    self.add_pending(path, false);
                    return;
                }
            }
            IntakeCommand::Recheck(path) => {
                if self.paused {
                    self.dirty.insert(path);
                } else {
                    self.add_pending(path, true);
                    return;
                }
            }
            IntakeCommand::Notify(ChangeNotification::Moved { from, to }) => {
                if self.paused {
                    self.dirty.insert(from);
                    self.dirty.insert(to);
                } else {
                    self.actions.enqueue(BackupAction::Move { from, to });
                }
            }
            IntakeCommand::Notify(ChangeNotification::Deleted(path)) => {
                if self.paused {
                    self.dirty.insert(path);
                } else {
                    self.actions.enqueue(BackupAction::Delete { path });
                }
            }
            IntakeCommand::Pause => {
                tracing::info!(pending = self.pending.len(), "pausing intake");
                self.paused = true;
                self.dirty.append(&mut self.pending);
                self.rechecks.clear();
                self.window_deadline = None;
                self.receiver.release(std::mem::take(&mut self.absorbed));
            }
            IntakeCommand::Resume => self.resume(),
            IntakeCommand::Stop => {}
        }

        self.receiver.release(1);
    }

    /// Adds `path` to the pending set, and arms the sharing window if
    /// it's the first path.  The command stays outstanding until the
    /// window closes.
    fn add_pending(&mut self, path: PathBuf, recheck: bool) {
        if recheck {
            self.rechecks.insert(path.clone());
        }

        self.pending.insert(path);
        self.absorbed += 1;
        if self.window_deadline.is_none() {
            self.window_deadline = Some(Instant::now() + self.window);
        }
    }

    /// Replays the dirty set: files go through the pipeline, missing
    /// paths become deletions.
    #[instrument(level = "debug", skip(self), fields(dirty = self.dirty.len()))]
    fn resume(&mut self) {
        self.paused = false;

        for path in std::mem::take(&mut self.dirty) {
            let meta = std::fs::symlink_metadata(&path);
            match meta {
                Ok(meta) if meta.file_type().is_file() => {
                    self.receiver.outstanding.fetch_add(1, Ordering::SeqCst);
                    self.add_pending(path, false);
                }
                Ok(meta) if meta.file_type().is_dir() => {
                    for entry in walkdir::WalkDir::new(&path)
                        .into_iter()
                        .flatten()
                        .filter(|entry| entry.file_type().is_file())
                    {
                        self.receiver.outstanding.fetch_add(1, Ordering::SeqCst);
                        self.add_pending(entry.into_path(), false);
                    }
                }
                Ok(_) => tracing::debug!(?path, "ignoring dirty path that is not a file"),
                Err(_) => self.actions.enqueue(BackupAction::Delete { path }),
            }
        }
    }

    /// Closes the sharing window: snapshots every volume with pending
    /// paths, and sends the references to the poller.
    #[instrument(level = "debug", skip(self), fields(pending = self.pending.len()))]
    fn flush(&mut self) {
        self.window_deadline = None;
        let rechecks = std::mem::take(&mut self.rechecks);
        let mut paths = Vec::with_capacity(self.pending.len());

        for path in std::mem::take(&mut self.pending) {
            if is_regular_file(&path) {
                paths.push(path);
            } else if rechecks.contains(&path) && std::fs::symlink_metadata(&path).is_err() {
                self.actions.enqueue(BackupAction::Delete { path });
            } else {
                tracing::debug!(?path, "dropping path that is no longer a regular file");
            }
        }

        let references: Vec<_> = self
            .snapshotter
            .snapshot_references(&paths)
            .into_iter()
            .flatten()
            .collect();
        if references.len() < paths.len() {
            tracing::warn!(
                paths = paths.len(),
                snapshotted = references.len(),
                "failed to snapshot some paths"
            );
        }

        self.poller.enqueue(references);
        self.receiver.release(std::mem::take(&mut self.absorbed));
    }
}

#[cfg(test)]
struct Fixture {
    provider: Arc<crate::test_support::FakeSnapshotProvider>,
    sink: Arc<crate::test_support::RecordingActions>,
    poller: Arc<OpenHandlePoller>,
    handle: IntakeHandle,
    scheduler: Option<JoinHandle<()>>,
}

#[cfg(test)]
impl Fixture {
    fn new(volumes: usize) -> Fixture {
        use crate::long_poll::LongPollStabilizer;
        use crate::test_support::FakeSnapshotProvider;
        use crate::test_support::RecordingActions;
        use crate::test_support::ScriptedOpenHandles;
        use crate::volumes::VolumeMap;

        let provider = Arc::new(FakeSnapshotProvider::new(volumes));
        let snapshotter = Arc::new(Snapshotter::new(
            provider.clone(),
            VolumeMap::new(provider.volumes()),
        ));
        let handles = Arc::new(ScriptedOpenHandles::default());
        let sink = Arc::new(RecordingActions::default());
        let long_poll = LongPollStabilizer::new(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            snapshotter.clone(),
            handles.clone(),
            sink.clone(),
        );
        let poller = OpenHandlePoller::new(
            Duration::from_millis(5),
            Duration::from_secs(3600),
            handles,
            long_poll,
            sink.clone(),
        );
        poller.start().expect("should start poller");

        let (handle, receiver) = IntakeHandle::channel();
        let scheduler = IntakeScheduler::new(
            Duration::from_millis(20),
            snapshotter,
            poller.clone(),
            sink.clone(),
            receiver,
        )
        .spawn()
        .expect("should spawn");

        Fixture {
            provider,
            sink,
            poller,
            handle,
            scheduler: Some(scheduler),
        }
    }

    fn wait_until_idle(&self) {
        crate::test_support::wait_for("idle intake", || {
            self.handle.is_idle() && self.poller.is_idle()
        });
    }

    fn sorted_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.sink.paths();
        paths.sort();
        paths
    }
}

#[cfg(test)]
impl Drop for Fixture {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.join().expect("intake thread should not panic");
        }

        self.poller.stop();
    }
}

#[test]
fn test_one_snapshot_per_volume_per_window() {
    let fixture = Fixture::new(3);
    let mut expected = vec![
        fixture.provider.write_file(0, "a", b"a"),
        fixture.provider.write_file(0, "dir/b", b"b"),
        fixture.provider.write_file(0, "dir/c", b"c"),
        fixture.provider.write_file(1, "d", b"d"),
    ];

    for path in &expected {
        fixture.handle.notify(ChangeNotification::Updated(path.clone()));
    }
    fixture
        .handle
        .notify(ChangeNotification::Updated(expected[0].clone()));
    // Directories aren't uploaded.
    fixture
        .handle
        .notify(ChangeNotification::Updated(fixture.provider.root(0).join("dir")));

    fixture.wait_until_idle();
    expected.sort();
    assert_eq!(fixture.sorted_paths(), expected);
    assert!(fixture.sink.take().iter().all(BackupAction::is_upload));

    // Volume 2 wasn't touched.
    assert_eq!(fixture.provider.created(), 2);
    assert_eq!(fixture.provider.live(), 0);
}

#[test]
fn test_moves_and_deletes_skip_snapshots() {
    let fixture = Fixture::new(1);
    let root = fixture.provider.root(0).to_owned();

    fixture.handle.notify(ChangeNotification::Moved {
        from: root.join("old"),
        to: root.join("new"),
    });
    fixture
        .handle
        .notify(ChangeNotification::Deleted(root.join("gone")));
    fixture.wait_until_idle();

    let actions = fixture.sink.take();
    assert_eq!(actions.len(), 2);
    assert!(matches!(&actions[0], BackupAction::Move { from, to } if *from == root.join("old") && *to == root.join("new")));
    assert!(matches!(&actions[1], BackupAction::Delete { path } if *path == root.join("gone")));
    assert_eq!(fixture.provider.created(), 0);
}

#[test]
fn test_recheck_of_missing_path_deletes() {
    let fixture = Fixture::new(1);
    let root = fixture.provider.root(0).to_owned();

    fixture.handle.recheck(root.join("vanished"));
    // A plain update for a missing path is just dropped.
    fixture
        .handle
        .notify(ChangeNotification::Updated(root.join("never-existed")));
    fixture.wait_until_idle();

    assert_eq!(fixture.sorted_paths(), vec![root.join("vanished")]);
    assert!(matches!(&fixture.sink.take()[0], BackupAction::Delete { .. }));
    assert_eq!(fixture.provider.created(), 0);
}

#[test]
fn test_pause_marks_dirty_and_resume_replays() {
    let fixture = Fixture::new(1);
    let root = fixture.provider.root(0).to_owned();
    let file = fixture.provider.write_file(0, "file", b"1");
    let moved = fixture.provider.write_file(0, "newdir/inner", b"2");

    fixture.handle.pause();
    fixture.handle.notify(ChangeNotification::Updated(file.clone()));
    fixture
        .handle
        .notify(ChangeNotification::Deleted(root.join("gone")));
    fixture.handle.notify(ChangeNotification::Moved {
        from: root.join("olddir"),
        to: root.join("newdir"),
    });
    fixture.wait_until_idle();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fixture.sink.len(), 0);
    assert_eq!(fixture.provider.created(), 0);

    fixture.handle.resume();
    fixture.wait_until_idle();

    let mut expected = vec![file, moved, root.join("gone"), root.join("olddir")];
    expected.sort();
    assert_eq!(fixture.sorted_paths(), expected);

    let uploads = fixture
        .sink
        .take()
        .iter()
        .filter(|action| action.is_upload())
        .count();
    assert_eq!(uploads, 2);
    assert_eq!(fixture.provider.created(), 1);
}
