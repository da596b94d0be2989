//! Batch files are append-only logs of `FileState` records.  The
//! cache's state is the ordered overlay of every batch file in the
//! batch directory.
//!
//! A batch that is still accepting records lives at
//! `batch-NNNN.open`; closing it renames it to `batch-NNNN`.
//! Consolidation output is first published as
//! `batch-NNNN.consolidating`, and only renamed over `batch-NNNN` once
//! every older batch it replaces is gone.
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufRead;
use std::io::BufWriter;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use tracing::instrument;
use tracing::Level;

use crate::chain_error;
use crate::file_state::FileState;
use crate::file_state::StateKey;
use crate::filtered_io_error;
use crate::result::Result;

const BATCH_PREFIX: &str = "batch-";
const OPEN_SUFFIX: &str = ".open";
const CONSOLIDATING_SUFFIX: &str = ".consolidating";

/// The on-disk state of one batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BatchFileInfo {
    pub number: u64,
    pub size: u64,
}

/// What we found when listing the batch directory.
#[derive(Debug, Default)]
pub(crate) struct BatchListing {
    /// Closed batches, keyed on batch number.
    pub closed: BTreeMap<u64, u64>,
    /// Batches that were still open when the last process exited.
    pub open: Vec<u64>,
    /// Complete consolidation outputs that were never renamed into place.
    pub consolidating: Vec<u64>,
}

pub(crate) fn batch_name(number: u64) -> String {
    format!("{}{:016}", BATCH_PREFIX, number)
}

pub(crate) fn batch_path(directory: &Path, number: u64) -> PathBuf {
    directory.join(batch_name(number))
}

/// Returns the remote path for batch `number` under `remote_prefix`.
pub(crate) fn remote_batch_path(remote_prefix: &str, number: u64) -> String {
    format!("{}/{}", remote_prefix.trim_end_matches('/'), batch_name(number))
}

pub(crate) fn open_batch_path(directory: &Path, number: u64) -> PathBuf {
    directory.join(format!("{}{}", batch_name(number), OPEN_SUFFIX))
}

pub(crate) fn consolidating_batch_path(directory: &Path, number: u64) -> PathBuf {
    directory.join(format!("{}{}", batch_name(number), CONSOLIDATING_SUFFIX))
}

/// Parses a batch directory entry's name.
fn parse_batch_name(name: &str) -> Option<(u64, &'static str)> {
    let tail = name.strip_prefix(BATCH_PREFIX)?;

    for suffix in [OPEN_SUFFIX, CONSOLIDATING_SUFFIX] {
        if let Some(number) = tail.strip_suffix(suffix) {
            return number.parse().ok().map(|n| (n, suffix));
        }
    }

    if tail.bytes().all(|b| b.is_ascii_digit()) {
        return tail.parse().ok().map(|n| (n, ""));
    }

    None
}

/// Lists all the batch files in `directory`.  Unknown files (e.g.,
/// leftover temporary files) are ignored.
#[instrument(level = "debug", err)]
pub(crate) fn list_batches(directory: &Path) -> Result<BatchListing> {
    let mut listing = BatchListing::default();

    for entry in std::fs::read_dir(directory)
        .map_err(|e| chain_error!(e, "failed to list batch directory", ?directory))?
        .flatten()
    {
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };

        match parse_batch_name(&name) {
            Some((number, "")) => {
                let size = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
                listing.closed.insert(number, size);
            }
            Some((number, OPEN_SUFFIX)) => listing.open.push(number),
            Some((number, _)) => listing.consolidating.push(number),
            None => tracing::debug!(%name, ?directory, "ignoring unknown file in batch directory"),
        }
    }

    listing.open.sort_unstable();
    listing.consolidating.sort_unstable();
    Ok(listing)
}

/// Applies one record to an in-memory state map: tombstones remove
/// the key, anything else overwrites it.
pub(crate) fn apply_state(states: &mut BTreeMap<StateKey, FileState>, state: FileState) {
    if state.is_tombstone() {
        states.remove(&state.key());
    } else {
        states.insert(state.key(), state);
    }
}

/// Calls `consumer` for each valid record in the batch file at `path`,
/// in file order.  Malformed lines are logged and skipped.
///
/// Returns the number of records consumed.
#[instrument(level = "debug", skip(consumer), err)]
pub(crate) fn read_batch(path: &Path, mut consumer: impl FnMut(FileState)) -> Result<usize> {
    let file = File::open(path).map_err(|e| {
        filtered_io_error!(e, ErrorKind::NotFound => Level::INFO, "failed to open batch file", ?path)
    })?;

    let mut count = 0;
    for (index, line_or) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line_or.map_err(|e| chain_error!(e, "failed to read batch file", ?path))?;
        if line.is_empty() {
            continue;
        }

        match line.parse::<FileState>() {
            Ok(state) => {
                consumer(state);
                count += 1;
            }
            Err(_) => {
                tracing::warn!(?path, line = index + 1, %line, "skipping malformed batch record")
            }
        }
    }

    Ok(count)
}

/// Replays the batch file at `path` on top of `states`.
pub(crate) fn replay_batch(path: &Path, states: &mut BTreeMap<StateKey, FileState>) -> Result<usize> {
    read_batch(path, |state| apply_state(states, state))
}

/// Writes `states` to `destination`, one record per line.
pub(crate) fn write_states<'a>(
    destination: &mut impl Write,
    states: impl IntoIterator<Item = &'a FileState>,
) -> std::io::Result<u64> {
    let mut written = 0;

    for state in states {
        let line = format!("{}\n", state);
        destination.write_all(line.as_bytes())?;
        written += line.len() as u64;
    }

    Ok(written)
}

/// A `BatchWriter` appends records to the current (open) batch.
#[derive(Debug)]
pub(crate) struct BatchWriter {
    number: u64,
    path: PathBuf,
    file: BufWriter<File>,
    size: u64,
}

impl BatchWriter {
    /// Creates a fresh open batch file for batch `number`.
    #[instrument(level = "debug", err)]
    pub fn create(directory: &Path, number: u64) -> Result<BatchWriter> {
        let path = open_batch_path(directory, number);
        let file = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .map_err(|e| chain_error!(e, "failed to create batch file", ?path))?;

        Ok(BatchWriter {
            number,
            path,
            file: BufWriter::new(file),
            size: 0,
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// Appends `state` to the batch.  The record reaches the file
    /// system before we return, so a process crash can't lose it.
    pub fn append(&mut self, state: &FileState) -> Result<()> {
        let written = write_states(&mut self.file, std::iter::once(state))
            .and_then(|written| self.file.flush().map(|_| written))
            .map_err(|e| chain_error!(e, "failed to append to batch file", path=?self.path))?;

        self.size += written;
        Ok(())
    }

    /// Flushes and closes the batch, and renames it to its final name.
    #[instrument(level = "debug", err)]
    pub fn close(mut self, directory: &Path) -> Result<BatchFileInfo> {
        self.file
            .flush()
            .map_err(|e| chain_error!(e, "failed to flush batch file", path=?self.path))?;
        self.file
            .get_ref()
            .sync_all()
            .map_err(|e| chain_error!(e, "failed to sync batch file", path=?self.path))?;

        let target = batch_path(directory, self.number);
        std::fs::rename(&self.path, &target)
            .map_err(|e| chain_error!(e, "failed to close batch file", path=?self.path, ?target))?;

        Ok(BatchFileInfo {
            number: self.number,
            size: self.size,
        })
    }
}

#[test]
fn test_batch_names() {
    assert_eq!(parse_batch_name(&batch_name(42)), Some((42, "")));
    assert_eq!(
        parse_batch_name("batch-0000000000000007.open"),
        Some((7, OPEN_SUFFIX))
    );
    assert_eq!(
        parse_batch_name("batch-0000000000000009.consolidating"),
        Some((9, CONSOLIDATING_SUFFIX))
    );
    assert_eq!(parse_batch_name("batch-12.tmp"), None);
    assert_eq!(parse_batch_name("tmp12345"), None);
}

#[test]
fn test_writer_and_replay() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let mut writer = BatchWriter::create(dir.path(), 3).expect("should create batch");

    writer
        .append(&FileState::whole("a".into(), None, 1, 2, "x".into()))
        .expect("should append");
    writer
        .append(&FileState::whole("b".into(), None, 1, 2, "y".into()))
        .expect("should append");
    writer
        .append(&FileState::tombstone("a".into(), None))
        .expect("should append");

    let info = writer.close(dir.path()).expect("should close");
    assert_eq!(info.number, 3);

    let listing = list_batches(dir.path()).expect("should list");
    assert_eq!(listing.closed.get(&3).copied(), Some(info.size));
    assert!(listing.open.is_empty());

    let mut states = BTreeMap::new();
    assert_eq!(
        replay_batch(&batch_path(dir.path(), 3), &mut states).expect("should replay"),
        3
    );
    assert_eq!(states.len(), 1);
    assert!(states.contains_key(&StateKey {
        path: "b".into(),
        part: None
    }));
}
