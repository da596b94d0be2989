//! A `SnapshotTracker` owns one volume snapshot, and hands out
//! `SnapshotReference`s to paths in that snapshot.  The snapshot is
//! destroyed when the tracker and every reference are gone.
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use crate::chain_error;
use crate::snapshot_provider::Snapshot;

#[derive(Debug)]
struct TrackerState {
    // Taken when `live` hits zero, so destroyed at most once.
    snapshot: Option<Box<dyn Snapshot>>,
    live: usize,
}

#[derive(Debug)]
struct TrackerInner {
    volume_mount_point: PathBuf,
    snapshot_mount_point: PathBuf,
    state: Mutex<TrackerState>,
}

impl TrackerInner {
    fn acquire(&self) {
        let mut state = self.state.lock().expect("tracker lock should not be poisoned");
        state.live += 1;
    }

    fn release(&self) {
        let to_destroy = {
            let mut state = self.state.lock().expect("tracker lock should not be poisoned");
            state.live -= 1;
            if state.live == 0 {
                state.snapshot.take()
            } else {
                None
            }
        };

        if let Some(snapshot) = to_destroy {
            tracing::debug!(?snapshot, "destroying snapshot");
            if let Err(e) = snapshot.destroy() {
                let _ = chain_error!(e, "failed to destroy snapshot",
                                     mount_point=?self.snapshot_mount_point);
            }
        }
    }
}

/// The tracker itself counts as one live reference, released on drop.
#[derive(Debug)]
pub struct SnapshotTracker {
    inner: Arc<TrackerInner>,
}

impl SnapshotTracker {
    /// Wraps `snapshot`, a snapshot of the volume mounted at
    /// `volume_mount_point`.
    pub fn new(volume_mount_point: &Path, snapshot: Box<dyn Snapshot>) -> SnapshotTracker {
        SnapshotTracker {
            inner: Arc::new(TrackerInner {
                volume_mount_point: volume_mount_point.to_owned(),
                snapshot_mount_point: snapshot.mount_point().to_owned(),
                state: Mutex::new(TrackerState {
                    snapshot: Some(snapshot),
                    live: 1,
                }),
            }),
        }
    }

    /// Returns a reference to the snapshotted version of the live
    /// path `path`.
    pub fn add_reference(&self, path: &Path) -> SnapshotReference {
        let relative = path
            .strip_prefix(&self.inner.volume_mount_point)
            .or_else(|_| path.strip_prefix("/"))
            .unwrap_or(path);

        self.inner.acquire();
        SnapshotReference {
            tracker: Some(self.inner.clone()),
            path: path.to_owned(),
            snapshot_path: self.inner.snapshot_mount_point.join(relative),
        }
    }
}

impl Drop for SnapshotTracker {
    fn drop(&mut self) {
        self.inner.release();
    }
}

/// A counted reference to one path in a snapshot.  Dropping the
/// reference disposes it.
#[derive(Debug)]
pub struct SnapshotReference {
    tracker: Option<Arc<TrackerInner>>,
    path: PathBuf,
    snapshot_path: PathBuf,
}

impl SnapshotReference {
    /// The live (logical) path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the path's frozen contents can be read.
    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Releases the reference.  Idempotent.
    pub fn dispose(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.release();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.tracker.is_none()
    }
}

impl Drop for SnapshotReference {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
fn counting_tracker() -> (SnapshotTracker, Arc<std::sync::atomic::AtomicUsize>) {
    use crate::test_support::CountingSnapshot;

    let (snapshot, destroyed) = CountingSnapshot::new("/snapshots/s1");
    (SnapshotTracker::new(Path::new("/home"), Box::new(snapshot)), destroyed)
}

#[test]
fn test_reference_paths() {
    let (tracker, _) = counting_tracker();
    let reference = tracker.add_reference(Path::new("/home/user/a.txt"));

    assert_eq!(reference.path(), Path::new("/home/user/a.txt"));
    assert_eq!(
        reference.snapshot_path(),
        Path::new("/snapshots/s1/user/a.txt")
    );
}

#[test]
fn test_snapshot_lifetime() {
    use std::sync::atomic::Ordering;

    let (tracker, destroyed) = counting_tracker();
    let mut references: Vec<_> = (0..5)
        .map(|i| tracker.add_reference(Path::new(&format!("/home/{}", i))))
        .collect();
    std::mem::drop(tracker);

    let mut last = references.pop().expect("should have references");
    for mut reference in references {
        reference.dispose();
        // Disposing twice is a no-op.
        reference.dispose();
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
    }

    last.dispose();
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    std::mem::drop(last);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_snapshot_lifetime_concurrent_dispose() {
    use std::sync::atomic::Ordering;

    for _ in 0..20 {
        let (tracker, destroyed) = counting_tracker();
        let references: Vec<_> = (0..5)
            .map(|i| tracker.add_reference(Path::new(&format!("/home/{}", i))))
            .collect();
        std::mem::drop(tracker);

        let barrier = Arc::new(std::sync::Barrier::new(references.len()));
        let workers: Vec<_> = references
            .into_iter()
            .map(|mut reference| {
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    reference.dispose();
                })
            })
            .collect();

        for worker in workers {
            worker.join().expect("should join");
        }

        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn test_tracker_without_references() {
    use std::sync::atomic::Ordering;

    let (tracker, destroyed) = counting_tracker();
    assert_eq!(destroyed.load(Ordering::SeqCst), 0);
    std::mem::drop(tracker);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}
