//! File content checksums, and content comparison across snapshots.
use memmap2::Mmap;
use std::fs::File;
use std::io::ErrorKind;
use std::io::Read;
use std::path::Path;
use umash::Fingerprint;

use crate::chain_error;
use crate::filtered_io_error;
use crate::result::Level;
use crate::result::Result;

/// Read files in chunks of this many bytes when fingerprinting.
const READ_BUFFER_SIZE: usize = 1 << 16;

lazy_static::lazy_static! {
    static ref CONTENT_PARAMS: umash::Params = umash::Params::derive(0, b"snapvault file content params");
}

/// Renders a fingerprint as the checksum string we store in
/// `FileState`s.
fn format_fingerprint(fprint: Fingerprint) -> String {
    format!("{:016x}{:016x}", fprint.hash[0], fprint.hash[1])
}

/// Returns the checksum for `bytes`.
pub fn checksum_bytes(bytes: &[u8]) -> String {
    format_fingerprint(CONTENT_PARAMS.fingerprinter(0).write(bytes).digest())
}

/// Returns the checksum for everything left in `reader`, and the
/// number of bytes read.
pub fn checksum_reader(reader: &mut impl Read) -> std::io::Result<(String, u64)> {
    let mut fingerprinter = CONTENT_PARAMS.fingerprinter(0);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let count = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(count) => count,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        fingerprinter.write(&buf[..count]);
        total += count as u64;
    }

    Ok((format_fingerprint(fingerprinter.digest()), total))
}

/// Maps `file` for reading, or returns None if it's empty: zero-length
/// mappings are rejected by the kernel.
fn map_file(file: &File, path: &Path) -> Result<Option<Mmap>> {
    let len = file
        .metadata()
        .map_err(|e| chain_error!(e, "failed to stat file", ?path))?
        .len();
    if len == 0 {
        return Ok(None);
    }

    // Snapshots are read-only, so the mapping can't change under us.
    let map = unsafe { Mmap::map(file) }.map_err(|e| chain_error!(e, "failed to map file", ?path))?;
    Ok(Some(map))
}

/// Determines whether the files at `left` and `right` have the same
/// contents.
pub fn files_identical(left: &Path, right: &Path) -> Result<bool> {
    let open = |path: &Path| {
        File::open(path).map_err(|e| {
            filtered_io_error!(e, ErrorKind::NotFound => Level::DEBUG, "failed to open file for comparison", ?path)
        })
    };

    let left_file = open(left)?;
    let right_file = open(right)?;

    let left_len = left_file
        .metadata()
        .map_err(|e| chain_error!(e, "failed to stat file", path=?left))?
        .len();
    let right_len = right_file
        .metadata()
        .map_err(|e| chain_error!(e, "failed to stat file", path=?right))?
        .len();
    if left_len != right_len {
        return Ok(false);
    }

    match (map_file(&left_file, left)?, map_file(&right_file, right)?) {
        (None, None) => Ok(true),
        (Some(left_map), Some(right_map)) => Ok(left_map[..] == right_map[..]),
        _ => Ok(false),
    }
}

#[test]
fn test_checksum_streaming_matches_bytes() {
    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

    let (streamed, len) = checksum_reader(&mut &data[..]).expect("should read");
    assert_eq!(len, data.len() as u64);
    assert_eq!(streamed, checksum_bytes(&data));
    assert_eq!(streamed.len(), 32);
    assert_ne!(checksum_bytes(b"a"), checksum_bytes(b"b"));
}

#[test]
fn test_files_identical() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let write = |name: &str, contents: &[u8]| {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).expect("should write");
        path
    };

    let a = write("a", b"same contents");
    let b = write("b", b"same contents");
    let c = write("c", b"diff contents");
    let d = write("d", b"short");
    let e = write("e", b"");
    let f = write("f", b"");

    assert!(files_identical(&a, &b).expect("should compare"));
    assert!(!files_identical(&a, &c).expect("should compare"));
    assert!(!files_identical(&a, &d).expect("should compare"));
    assert!(files_identical(&e, &f).expect("should compare"));
    assert!(files_identical(&a, &dir.path().join("missing")).is_err());
}
