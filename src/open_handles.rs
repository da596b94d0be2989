//! Enumerates the files currently open on the machine, and whether
//! they're open for writing.
use regex::Regex;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use tracing::instrument;

use crate::result::Result;

/// The kernel's `O_ACCMODE` bits.
const ACCESS_MODE_MASK: u32 = 0o3;
const O_WRONLY: u32 = 0o1;
const O_RDWR: u32 = 0o2;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Access {
    Read,
    Write,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct OpenHandle {
    pub path: PathBuf,
    pub access: Access,
}

pub trait OpenHandleEnumerator: std::fmt::Debug + Send + Sync {
    /// Returns every open file handle, in one bulk call.
    fn enumerate_all(&self) -> Result<Vec<OpenHandle>>;
}

/// Returns the set of paths with at least one open write handle.
pub fn paths_open_for_write(enumerator: &dyn OpenHandleEnumerator) -> Result<HashSet<PathBuf>> {
    Ok(enumerator
        .enumerate_all()?
        .into_iter()
        .filter(|handle| handle.access == Access::Write)
        .map(|handle| handle.path)
        .collect())
}

/// Scrapes `/proc/<pid>/fd` and `/proc/<pid>/fdinfo`.  Processes we
/// can't inspect (permissions, or they exited mid-scan) are skipped.
#[derive(Debug)]
pub struct ProcOpenHandleEnumerator {
    proc_root: PathBuf,
}

impl Default for ProcOpenHandleEnumerator {
    fn default() -> Self {
        ProcOpenHandleEnumerator::new(PathBuf::from("/proc"))
    }
}

/// Extracts the octal `flags` field from an fdinfo file.
fn parse_fdinfo_flags(fdinfo: &str) -> Option<u32> {
    lazy_static::lazy_static! {
        static ref FLAGS: Regex = Regex::new(r"(?m)^flags:\s+([0-7]+)\s*$").expect("flags regex must be valid");
    }

    let captures = FLAGS.captures(fdinfo)?;
    u32::from_str_radix(captures.get(1)?.as_str(), 8).ok()
}

fn access_from_flags(flags: u32) -> Access {
    match flags & ACCESS_MODE_MASK {
        O_WRONLY | O_RDWR => Access::Write,
        _ => Access::Read,
    }
}

impl ProcOpenHandleEnumerator {
    pub fn new(proc_root: PathBuf) -> ProcOpenHandleEnumerator {
        ProcOpenHandleEnumerator { proc_root }
    }

    /// Appends the regular files open in process directory `process`
    /// to `handles`.
    fn scan_process(&self, process: &Path, handles: &mut Vec<OpenHandle>) {
        let fds = match std::fs::read_dir(process.join("fd")) {
            Ok(fds) => fds,
            Err(_) => return,
        };

        for fd in fds.flatten() {
            let target = match std::fs::read_link(fd.path()) {
                Ok(target) => target,
                Err(_) => continue,
            };

            // Sockets, pipes and anonymous inodes aren't absolute paths.
            if !target.is_absolute() {
                continue;
            }

            let flags = std::fs::read_to_string(process.join("fdinfo").join(fd.file_name()))
                .ok()
                .and_then(|fdinfo| parse_fdinfo_flags(&fdinfo));
            let access = match flags {
                Some(flags) => access_from_flags(flags),
                None => continue,
            };

            handles.push(OpenHandle {
                path: target,
                access,
            });
        }
    }
}

impl OpenHandleEnumerator for ProcOpenHandleEnumerator {
    #[instrument(level = "trace", err)]
    fn enumerate_all(&self) -> Result<Vec<OpenHandle>> {
        let processes = std::fs::read_dir(&self.proc_root).map_err(|e| {
            crate::filtered_io_error!(e, ErrorKind::PermissionDenied => crate::result::Level::WARN,
                                      "failed to list processes", proc_root=?self.proc_root)
        })?;

        let mut handles = Vec::new();
        for process in processes.flatten() {
            let is_pid = process
                .file_name()
                .to_str()
                .map(|name| !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()))
                .unwrap_or(false);

            if is_pid {
                self.scan_process(&process.path(), &mut handles);
            }
        }

        Ok(handles)
    }
}

#[test]
fn test_parse_fdinfo() {
    let fdinfo = "pos:\t0\nflags:\t0100002\nmnt_id:\t29\nino:\t1234\n";
    assert_eq!(parse_fdinfo_flags(fdinfo), Some(0o100002));
    assert_eq!(access_from_flags(0o100002), Access::Write);
    assert_eq!(access_from_flags(0o2100001), Access::Write);
    assert_eq!(access_from_flags(0o2100000), Access::Read);
    assert_eq!(parse_fdinfo_flags("pos:\t0\n"), None);
}

#[test]
fn test_fake_proc_tree() {
    use std::os::unix::fs::symlink;

    let proc_root = tempfile::tempdir().expect("should create temp dir");
    let data = tempfile::tempdir().expect("should create temp dir");
    let written = data.path().join("written.log");
    let read = data.path().join("read.txt");
    std::fs::write(&written, b"").expect("should write");
    std::fs::write(&read, b"").expect("should write");

    let pid = proc_root.path().join("1234");
    std::fs::create_dir_all(pid.join("fd")).expect("should create");
    std::fs::create_dir_all(pid.join("fdinfo")).expect("should create");
    // Not a process.
    std::fs::create_dir_all(proc_root.path().join("sys")).expect("should create");

    let add_fd = |fd: u32, target: &Path, flags: &str| {
        symlink(target, pid.join("fd").join(fd.to_string())).expect("should link");
        std::fs::write(
            pid.join("fdinfo").join(fd.to_string()),
            format!("pos:\t0\nflags:\t{}\n", flags),
        )
        .expect("should write");
    };

    add_fd(3, &written, "0102001");
    add_fd(4, &read, "0100000");
    add_fd(5, Path::new("socket:[1234]"), "02");

    let enumerator = ProcOpenHandleEnumerator::new(proc_root.path().to_owned());
    let mut handles = enumerator.enumerate_all().expect("should enumerate");
    handles.sort_by(|x, y| x.path.cmp(&y.path));

    assert_eq!(
        handles,
        vec![
            OpenHandle {
                path: read,
                access: Access::Read
            },
            OpenHandle {
                path: written.clone(),
                access: Access::Write
            },
        ]
    );

    let writers = paths_open_for_write(&enumerator).expect("should enumerate");
    assert_eq!(writers, [written].into_iter().collect());
}
