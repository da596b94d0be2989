//! Maps live paths to volumes, and snapshots batches of paths with one
//! snapshot per volume touched.
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::instrument;

use crate::chain_warn;
use crate::snapshot_provider::SnapshotProvider;
use crate::snapshot_provider::Volume;
use crate::snapshot_tracker::SnapshotReference;
use crate::snapshot_tracker::SnapshotTracker;

#[derive(Clone, Debug, Default)]
pub struct VolumeMap {
    // Sorted by decreasing mount point length, so the first match is
    // the longest.
    volumes: Vec<Volume>,
}

impl VolumeMap {
    pub fn new(mut volumes: Vec<Volume>) -> VolumeMap {
        volumes.sort_by_key(|volume| std::cmp::Reverse(volume.mount_point.components().count()));
        VolumeMap { volumes }
    }

    /// Returns the index of the volume with the longest mount point
    /// that contains `path`.
    fn index_for(&self, path: &Path) -> Option<usize> {
        self.volumes
            .iter()
            .position(|volume| path.starts_with(&volume.mount_point))
    }

    pub fn volume_for(&self, path: &Path) -> Option<&Volume> {
        self.index_for(path).map(|index| &self.volumes[index])
    }
}

/// Returns a name for a fresh snapshot.
fn snapshot_name() -> String {
    format!("snapvault-{}", uuid::Uuid::new_v4().to_simple())
}

#[derive(Debug)]
pub struct Snapshotter {
    provider: Arc<dyn SnapshotProvider>,
    volumes: VolumeMap,
}

impl Snapshotter {
    pub fn new(provider: Arc<dyn SnapshotProvider>, volumes: VolumeMap) -> Snapshotter {
        Snapshotter { provider, volumes }
    }

    /// Snapshots every volume that contains at least one of `paths`,
    /// and returns a reference for each path, in order.
    ///
    /// Paths outside any known volume, or on a volume we failed to
    /// snapshot, get `None`.
    #[instrument(level = "debug", skip(self, paths), fields(count = paths.len()))]
    pub fn snapshot_references(&self, paths: &[PathBuf]) -> Vec<Option<SnapshotReference>> {
        let mut ret: Vec<Option<SnapshotReference>> = paths.iter().map(|_| None).collect();
        let mut by_volume: Vec<Vec<usize>> = vec![Vec::new(); self.volumes.volumes.len()];

        for (index, path) in paths.iter().enumerate() {
            match self.volumes.index_for(path) {
                Some(volume) => by_volume[volume].push(index),
                None => tracing::warn!(?path, "path is not on a known volume"),
            }
        }

        for (volume, indices) in self.volumes.volumes.iter().zip(by_volume) {
            if indices.is_empty() {
                continue;
            }

            let snapshot = match self.provider.create_snapshot(volume, &snapshot_name()) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    let _ = chain_warn!(e, "failed to snapshot volume", ?volume, count = indices.len());
                    continue;
                }
            };

            let tracker = SnapshotTracker::new(&volume.mount_point, snapshot);
            for index in indices {
                ret[index] = Some(tracker.add_reference(&paths[index]));
            }
        }

        ret
    }

    /// Snapshots the volume for `path`, and returns a reference to it.
    pub fn snapshot_reference(&self, path: &Path) -> Option<SnapshotReference> {
        self.snapshot_references(&[path.to_owned()]).pop().flatten()
    }
}

#[test]
fn test_longest_prefix() {
    let map = VolumeMap::new(vec![
        Volume {
            mount_point: "/".into(),
            dataset: "root".into(),
        },
        Volume {
            mount_point: "/home/user".into(),
            dataset: "user".into(),
        },
        Volume {
            mount_point: "/home".into(),
            dataset: "home".into(),
        },
    ]);

    let dataset = |path: &str| map.volume_for(Path::new(path)).map(|v| v.dataset.clone());
    assert_eq!(dataset("/home/user/a"), Some("user".into()));
    assert_eq!(dataset("/home/userx/a"), Some("home".into()));
    assert_eq!(dataset("/etc/passwd"), Some("root".into()));
    assert_eq!(VolumeMap::new(Vec::new()).volume_for(Path::new("/a")), None);
}

#[test]
fn test_one_snapshot_per_volume() {
    use crate::test_support::FakeSnapshotProvider;

    let provider = Arc::new(FakeSnapshotProvider::new(2));
    let snapshotter = Snapshotter::new(provider.clone(), VolumeMap::new(provider.volumes()));

    let a = provider.write_file(0, "a.txt", b"a");
    let b = provider.write_file(0, "dir/b.txt", b"b");
    let c = provider.write_file(1, "c.txt", b"c");
    let outside = PathBuf::from("/definitely/not/a/volume");

    let refs = snapshotter.snapshot_references(&[a.clone(), b, c, outside]);
    assert_eq!(provider.created(), 2);
    assert!(refs[3].is_none());

    let a_ref = refs[0].as_ref().expect("should have a reference");
    assert_eq!(a_ref.path(), a.as_path());
    assert_eq!(std::fs::read(a_ref.snapshot_path()).expect("should read"), b"a");

    // Snapshots are frozen.
    std::fs::write(&a, b"changed").expect("should write");
    assert_eq!(std::fs::read(a_ref.snapshot_path()).expect("should read"), b"a");

    std::mem::drop(refs);
    assert_eq!(provider.destroyed(), 2);
}
