//! Point-in-time, read-only snapshots of whole volumes.
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use tracing::instrument;

use crate::chain_error;
use crate::fresh_error;
use crate::result::Result;

/// A volume is a mounted filesystem we can snapshot as a unit.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct Volume {
    pub mount_point: PathBuf,

    /// Provider-specific name for the volume (e.g., the ZFS dataset).
    #[serde(default)]
    pub dataset: String,
}

/// A live snapshot.  The provider's resources are only released by
/// `destroy`.
pub trait Snapshot: std::fmt::Debug + Send {
    /// Directory where the volume's frozen contents are visible.
    fn mount_point(&self) -> &Path;

    fn destroy(self: Box<Self>) -> Result<()>;
}

pub trait SnapshotProvider: std::fmt::Debug + Send + Sync {
    /// Creates a snapshot of `volume` called `name`.  Snapshots of
    /// independent volumes may be created concurrently.
    fn create_snapshot(&self, volume: &Volume, name: &str) -> Result<Box<dyn Snapshot>>;

    fn enumerate_volumes(&self) -> Result<Vec<Volume>>;
}

/// Snapshots ZFS datasets with the `zfs` command line tool.
#[derive(Debug)]
pub struct ZfsSnapshotProvider {
    volumes: Vec<Volume>,
}

#[derive(Debug)]
struct ZfsSnapshot {
    // `dataset@name`
    full_name: String,
    mount_point: PathBuf,
}

fn run_zfs(args: &[&str]) -> Result<()> {
    let output = Command::new("zfs")
        .args(args)
        .output()
        .map_err(|e| chain_error!(e, "failed to run zfs", ?args))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(fresh_error!("zfs command failed", ?args, status=?output.status, %stderr));
    }

    Ok(())
}

impl ZfsSnapshotProvider {
    pub fn new(volumes: Vec<Volume>) -> ZfsSnapshotProvider {
        ZfsSnapshotProvider { volumes }
    }
}

impl SnapshotProvider for ZfsSnapshotProvider {
    #[instrument(level = "debug", err)]
    fn create_snapshot(&self, volume: &Volume, name: &str) -> Result<Box<dyn Snapshot>> {
        let full_name = format!("{}@{}", volume.dataset, name);
        run_zfs(&["snapshot", &full_name])?;

        Ok(Box::new(ZfsSnapshot {
            full_name,
            mount_point: volume.mount_point.join(".zfs").join("snapshot").join(name),
        }))
    }

    fn enumerate_volumes(&self) -> Result<Vec<Volume>> {
        Ok(self.volumes.clone())
    }
}

impl Snapshot for ZfsSnapshot {
    fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    #[instrument(level = "debug", err)]
    fn destroy(self: Box<Self>) -> Result<()> {
        run_zfs(&["destroy", &self.full_name])
    }
}

#[test]
fn test_volume_serde() {
    let volume: Volume = serde_json::from_str("{\"mount_point\": \"/home\", \"dataset\": \"tank/home\"}")
        .expect("should parse");
    assert_eq!(
        volume,
        Volume {
            mount_point: "/home".into(),
            dataset: "tank/home".into()
        }
    );

    let bare: Volume = serde_json::from_str("{\"mount_point\": \"/\"}").expect("should parse");
    assert_eq!(bare.dataset, "");
}
