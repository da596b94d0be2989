//! Batch consolidation merges the oldest batches into one, to bound
//! the number of files a cache load must replay.
//!
//! Consolidation is crash safe: the merged batch is first published
//! as `batch-N.consolidating` (N is the newest candidate), and
//! `finish_consolidation` is idempotent, so a load that finds a
//! `.consolidating` file simply finishes the job.
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use tracing::instrument;

use crate::batch_file::batch_path;
use crate::batch_file::consolidating_batch_path;
use crate::batch_file::remote_batch_path;
use crate::batch_file::replay_batch;
use crate::batch_file::write_states;
use crate::cache_action_log::CacheActionLog;
use crate::chain_error;
use crate::drop_result;
use crate::file_state::FileState;
use crate::file_state::StateKey;
use crate::filtered_io_error;
use crate::result::Level;
use crate::result::Result;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConsolidationPolicy {
    /// Never consolidate fewer batches than this.
    pub min_batches: usize,
    /// Require one more batch for every `bytes_per_batch` bytes in
    /// the candidate set.
    pub bytes_per_batch: u64,
}

/// Returns the oldest batches to consolidate, in ascending order, or
/// None if consolidation isn't worth it yet.
///
/// `batches` maps batch number to size.  Candidates are a prefix of
/// the closed batches, and always leave the newest one out.
pub(crate) fn select_candidates(
    batches: &BTreeMap<u64, u64>,
    policy: &ConsolidationPolicy,
) -> Option<Vec<u64>> {
    let per_batch = policy.bytes_per_batch.max(1);
    let mut accumulated = 0u64;

    for (index, (_, size)) in batches.iter().enumerate() {
        let count = index + 1;
        if count >= batches.len() {
            break;
        }

        accumulated = accumulated.saturating_add(*size);
        let required = (policy.min_batches as u64)
            .saturating_add(accumulated.saturating_add(per_batch / 2) / per_batch)
            .max(2);

        if count as u64 >= required {
            return Some(batches.keys().take(count).copied().collect());
        }
    }

    None
}

/// Overlays the batches in `candidates`, in order: later records
/// replace earlier ones with the same key, and tombstones remove them.
pub(crate) fn merge_batches(
    directory: &Path,
    candidates: &[u64],
) -> Result<BTreeMap<StateKey, FileState>> {
    let mut merged = BTreeMap::new();

    for number in candidates {
        replay_batch(&batch_path(directory, *number), &mut merged)?;
    }

    Ok(merged)
}

/// Publishes `merged` as the consolidation output for batch `newest`.
/// Returns the output's size in bytes.
#[instrument(level = "debug", skip(merged), fields(count = merged.len()), err)]
pub(crate) fn write_consolidated(
    directory: &Path,
    newest: u64,
    merged: &BTreeMap<StateKey, FileState>,
) -> Result<u64> {
    let mut temp = tempfile::Builder::new()
        .suffix(".tmp")
        .tempfile_in(directory)
        .map_err(|e| chain_error!(e, "failed to create consolidation file", ?directory))?;

    let size = write_states(temp.as_file_mut(), merged.values())
        .and_then(|size| temp.as_file().sync_all().map(|_| size))
        .map_err(|e| chain_error!(e, "failed to write consolidation file", ?directory))?;

    let target = consolidating_batch_path(directory, newest);
    temp.persist(&target)
        .map_err(|e| chain_error!(e, "failed to publish consolidation file", ?target))?;
    Ok(size)
}

/// Replaces the `older` batches and batch `newest` with the
/// consolidation output for `newest`, locally and remotely.
///
/// Remote deletions are durably enqueued before the local copy
/// disappears, so calling this again after a crash is safe.  Returns
/// the size of the new batch `newest`.
#[instrument(level = "debug", skip(actions), err)]
pub(crate) fn finish_consolidation(
    directory: &Path,
    newest: u64,
    older: &[u64],
    actions: &CacheActionLog,
    remote_prefix: &str,
) -> Result<u64> {
    for number in older {
        actions.enqueue_delete(remote_batch_path(remote_prefix, *number))?;

        let path = batch_path(directory, *number);
        drop_result!(std::fs::remove_file(&path),
                     e if e.kind() == ErrorKind::NotFound => (),
                     e => chain_error!(e, "failed to remove consolidated batch", ?path));
    }

    let source = consolidating_batch_path(directory, newest);
    actions.enqueue_upload(&source, remote_batch_path(remote_prefix, newest))?;

    let target = batch_path(directory, newest);
    std::fs::rename(&source, &target).map_err(|e| {
        filtered_io_error!(e, ErrorKind::NotFound => Level::WARN,
                           "failed to rename consolidation output", ?source, ?target)
    })?;

    let size = std::fs::metadata(&target)
        .map_err(|e| chain_error!(e, "failed to stat consolidated batch", ?target))?
        .len();
    tracing::info!(newest, consolidated = older.len() + 1, size, "consolidated batches");
    Ok(size)
}

#[cfg(test)]
fn batches_of(sizes: &[u64]) -> BTreeMap<u64, u64> {
    sizes
        .iter()
        .enumerate()
        .map(|(i, size)| (i as u64 + 1, *size))
        .collect()
}

#[test]
fn test_select_small_batches() {
    let policy = ConsolidationPolicy {
        min_batches: 10,
        bytes_per_batch: 4 << 20,
    };

    // The newest batch never participates.
    assert_eq!(select_candidates(&batches_of(&[100; 10]), &policy), None);

    let candidates = select_candidates(&batches_of(&[100; 12]), &policy).expect("should select");
    assert_eq!(candidates, (1..=10).collect::<Vec<_>>());
}

#[test]
fn test_select_rounds_half_up() {
    let policy = ConsolidationPolicy {
        min_batches: 10,
        bytes_per_batch: 1000,
    };

    // With 500-byte batches, the 20th batch brings the total to
    // 10000 bytes, i.e., 10 extra batches required: 20 candidates.
    // The 19th brings it to 9500, which rounds up to 10 as well.
    let candidates = select_candidates(&batches_of(&[500; 25]), &policy).expect("should select");
    assert_eq!(candidates.len(), 20);

    assert_eq!(select_candidates(&batches_of(&[500; 20]), &policy), None);
}

#[test]
fn test_select_large_batches() {
    let policy = ConsolidationPolicy {
        min_batches: 2,
        bytes_per_batch: 1000,
    };

    // Huge batches push the requirement out of reach.
    assert_eq!(
        select_candidates(&batches_of(&[10_000, 10_000, 10_000, 10]), &policy),
        None
    );

    assert_eq!(
        select_candidates(&batches_of(&[10, 10, 10]), &policy),
        Some(vec![1, 2])
    );
}

#[test]
fn test_merge_last_write_wins() {
    use crate::batch_file::BatchWriter;

    let dir = tempfile::tempdir().expect("should create temp dir");
    let whole = |path: &str, checksum: &str| FileState::whole(path.into(), None, 1, 1, checksum.into());

    let batches: Vec<Vec<FileState>> = vec![
        vec![whole("a", "a1"), whole("b", "b1"), whole("c", "c1")],
        vec![whole("a", "a2"), FileState::tombstone("b".into(), None)],
        vec![FileState::tombstone("c".into(), None), whole("c", "c3"), whole("d", "d3")],
        // Outside the merge window: re-creates "b".
        vec![whole("b", "b4")],
    ];

    for (i, records) in batches.iter().enumerate() {
        let mut writer = BatchWriter::create(dir.path(), i as u64 + 1).expect("should create");
        for record in records {
            writer.append(record).expect("should append");
        }
        writer.close(dir.path()).expect("should close");
    }

    let merged = merge_batches(dir.path(), &[1, 2, 3]).expect("should merge");
    let checksums: Vec<(String, String)> = merged
        .values()
        .map(|state| (state.path.clone(), state.checksum.clone()))
        .collect();
    assert_eq!(
        checksums,
        vec![
            ("a".to_string(), "a2".to_string()),
            ("c".to_string(), "c3".to_string()),
            ("d".to_string(), "d3".to_string()),
        ]
    );

    write_consolidated(dir.path(), 3, &merged).expect("should write");
    let mut reread = BTreeMap::new();
    replay_batch(&consolidating_batch_path(dir.path(), 3), &mut reread).expect("should read");
    assert_eq!(reread, merged);

    // Overlaying the consolidated batch and batch 4 matches the
    // original sequence.
    let mut original = BTreeMap::new();
    for number in 1..=4 {
        replay_batch(&batch_path(dir.path(), number), &mut original).expect("should read");
    }
    replay_batch(&batch_path(dir.path(), 4), &mut reread).expect("should read");
    assert_eq!(reread, original);
}
