//! A `FileState` is the cache's record of what remote storage holds
//! for one logical path (or one part of a multipart file).
//!
//! Batch files store one `FileState` per line, as
//! `[*<part> ]checksum size last_modified_ticks content_key path`.
//! The path comes last, so it may contain spaces.  A missing content
//! key is written as the `""` token, and tombstones use the reserved
//! `-1` size and `-` checksum.
use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use std::str::FromStr;
use std::time::SystemTime;

use crate::fresh_debug;
use crate::result::Error;
use crate::result::Result;

/// File size sentinel for tombstone records.
pub const TOMBSTONE_SIZE: i64 = -1;

/// Checksum sentinel for tombstone records.
pub const TOMBSTONE_CHECKSUM: &str = "-";

/// Serialised form of an absent content key.
const EMPTY_CONTENT_KEY: &str = "\"\"";

/// Part records start with this marker, followed by the part number.
const PART_MARKER: char = '*';

/// Ticks are 100ns intervals since 0001-01-01T00:00:00Z.
const TICKS_PER_SECOND: i64 = 10_000_000;

/// Seconds between 0001-01-01T00:00:00Z and the Unix epoch.
const UNIX_EPOCH_SECONDS_FROM_YEAR_ONE: i64 = 62_135_596_800;

/// Cache entries are keyed on the logical path and the part number
/// (`None` for the file-level entry).
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    pub path: String,
    pub part: Option<u32>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileState {
    /// Logical (remote) path for the file.
    pub path: String,
    /// Opaque indirection into remote storage, if any.
    pub content_key: Option<String>,
    /// Size in bytes; zero for part records, `TOMBSTONE_SIZE` for tombstones.
    pub size: i64,
    /// Last modification time, in ticks; zero for part records.
    pub last_modified_ticks: i64,
    pub checksum: String,
    /// Part number for multipart records, `None` for file-level records.
    pub part: Option<u32>,
}

impl FileState {
    /// Returns the file-level state for a fully uploaded file.
    pub fn whole(
        path: String,
        content_key: Option<String>,
        size: u64,
        last_modified_ticks: i64,
        checksum: String,
    ) -> FileState {
        FileState {
            path,
            content_key,
            size: size.min(i64::MAX as u64) as i64,
            last_modified_ticks,
            checksum,
            part: None,
        }
    }

    /// Returns the state for part `part` of a multipart file.  The
    /// file-level state carries size and modification time, so these
    /// are zeroed for parts.
    pub fn part(path: String, part: u32, content_key: Option<String>, checksum: String) -> FileState {
        FileState {
            path,
            content_key,
            size: 0,
            last_modified_ticks: 0,
            checksum,
            part: Some(part),
        }
    }

    /// Returns a deletion marker for `path` (and `part`).
    pub fn tombstone(path: String, part: Option<u32>) -> FileState {
        FileState {
            path,
            content_key: None,
            size: TOMBSTONE_SIZE,
            last_modified_ticks: 0,
            checksum: TOMBSTONE_CHECKSUM.to_string(),
            part,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.size == TOMBSTONE_SIZE && self.checksum == TOMBSTONE_CHECKSUM
    }

    pub fn is_multipart(&self) -> bool {
        self.part.is_some()
    }

    pub fn key(&self) -> StateKey {
        StateKey {
            path: self.path.clone(),
            part: self.part,
        }
    }

    /// Returns the last modification time, if it's representable.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        datetime_from_ticks(self.last_modified_ticks)
    }
}

impl std::fmt::Display for FileState {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(part) = self.part {
            write!(fmt, "{}{} ", PART_MARKER, part)?;
        }

        write!(
            fmt,
            "{} {} {} {} {}",
            self.checksum,
            self.size,
            self.last_modified_ticks,
            self.content_key.as_deref().unwrap_or(EMPTY_CONTENT_KEY),
            self.path
        )
    }
}

impl FromStr for FileState {
    type Err = Error;

    fn from_str(line: &str) -> Result<FileState> {
        let (part, rest) = match line.strip_prefix(PART_MARKER) {
            Some(tail) => {
                let (number, rest) = tail
                    .split_once(' ')
                    .ok_or_else(|| fresh_debug!("truncated part record", %line))?;
                let number = number
                    .parse::<u32>()
                    .map_err(|_| fresh_debug!("invalid part number", %line))?;
                (Some(number), rest)
            }
            None => (None, line),
        };

        let mut fields = rest.splitn(5, ' ');
        let mut next = || {
            fields
                .next()
                .filter(|field| !field.is_empty())
                .ok_or_else(|| fresh_debug!("missing field in file state record", %line))
        };

        let checksum = next()?.to_string();
        let size = next()?
            .parse::<i64>()
            .map_err(|_| fresh_debug!("invalid size in file state record", %line))?;
        let last_modified_ticks = next()?
            .parse::<i64>()
            .map_err(|_| fresh_debug!("invalid ticks in file state record", %line))?;
        let content_key = match next()? {
            EMPTY_CONTENT_KEY => None,
            key => Some(key.to_string()),
        };
        let path = next()?.to_string();

        if size < TOMBSTONE_SIZE {
            return Err(fresh_debug!("negative size in file state record", %line));
        }

        Ok(FileState {
            path,
            content_key,
            size,
            last_modified_ticks,
            checksum,
            part,
        })
    }
}

/// Converts a wall-clock time to ticks.
pub fn ticks_from_system_time(time: SystemTime) -> i64 {
    ticks_from_datetime(DateTime::<Utc>::from(time))
}

pub fn ticks_from_datetime(time: DateTime<Utc>) -> i64 {
    (time.timestamp() + UNIX_EPOCH_SECONDS_FROM_YEAR_ONE)
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add((time.timestamp_subsec_nanos() / 100) as i64)
}

pub fn datetime_from_ticks(ticks: i64) -> Option<DateTime<Utc>> {
    let seconds = ticks.div_euclid(TICKS_PER_SECOND) - UNIX_EPOCH_SECONDS_FROM_YEAR_ONE;
    let nanos = (ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;

    Utc.timestamp_opt(seconds, nanos).single()
}

#[cfg(test)]
fn random_state(rng: &mut impl rand::Rng) -> FileState {
    use rand::distributions::Alphanumeric;

    let mut token = |len: usize| -> String {
        (0..len).map(|_| char::from(rng.sample(Alphanumeric))).collect()
    };

    let path = format!("home/{} {}/{}.dat", token(5), token(3), token(8));
    let checksum = token(32);
    let content_key = if rand::random::<bool>() {
        Some(token(32))
    } else {
        None
    };

    match rand::random::<u8>() % 3 {
        0 => FileState::whole(
            path,
            content_key,
            rand::random::<u32>() as u64,
            rand::random::<u32>() as i64,
            checksum,
        ),
        1 => FileState::part(path, rand::random::<u16>() as u32, content_key, checksum),
        _ => FileState::tombstone(path, None),
    }
}

#[test]
fn test_round_trip_random_states() {
    use rand::SeedableRng;

    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    for _ in 0..1000 {
        let state = random_state(&mut rng);
        let line = state.to_string();
        let parsed: FileState = line.parse().expect("should parse");

        assert_eq!(parsed, state, "line = {:?}", line);
    }
}

#[test]
fn test_record_format() {
    let whole = FileState::whole(
        "var/log/my file.txt".into(),
        None,
        42,
        637_000_000_000_000_000,
        "abc".into(),
    );
    assert_eq!(
        whole.to_string(),
        "abc 42 637000000000000000 \"\" var/log/my file.txt"
    );

    let part = FileState::part("a/b".into(), 3, Some("key".into()), "sum".into());
    assert_eq!(part.to_string(), "*3 sum 0 0 key a/b");
    assert!(part.is_multipart());

    let tombstone: FileState = "*7 - -1 0 \"\" a/b".parse().expect("should parse");
    assert!(tombstone.is_tombstone());
    assert_eq!(tombstone.part, Some(7));
}

#[test]
fn test_reject_malformed_records() {
    for line in [
        "",
        "abc",
        "abc 12",
        "abc x 0 \"\" path",
        "abc 12 0 \"\"",
        "*x abc 12 0 \"\" path",
        "*3",
        "abc -7 0 \"\" path",
    ] {
        assert!(line.parse::<FileState>().is_err(), "line = {:?}", line);
    }
}

#[test]
fn test_ticks_round_trip() {
    let now = Utc.timestamp_opt(1_700_000_000, 123_456_700).unwrap();
    let ticks = ticks_from_datetime(now);

    assert_eq!(datetime_from_ticks(ticks), Some(now));
    // 0001-01-01 is tick zero.
    assert_eq!(
        datetime_from_ticks(0),
        Some(Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap())
    );
}
