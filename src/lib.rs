mod agent;
mod backup_action;
mod backup_queue;
mod batch_file;
mod cache_action_log;
mod checksum;
mod consolidation;
pub mod file_state;
mod file_state_cache;
mod intake;
mod long_poll;
mod open_handle_poller;
pub mod open_handles;
pub mod remote;
pub mod remote_target;
pub mod result; // Must be exposed for the helper macros
mod retry;
mod s3_storage;
pub mod snapshot_provider;
mod snapshot_tracker;
mod staging;
mod upload_pool;
mod volumes;

#[cfg(test)]
mod test_support;

pub use agent::load_cache_states;
pub use agent::BackupAgent;
pub use agent::Collaborators;
pub use file_state::FileState;
pub use file_state_cache::RemoteFileStateCache;
pub use intake::ChangeNotification;
pub use intake::IntakeHandle;
pub use result::Result;

/// Read the snapvault configuration from this variable by default.
pub const SNAPVAULT_CONFIG_ENV_VAR: &str = "SNAPVAULT_CONFIG";

/// Configuration for a `BackupAgent`.  Durations are in milliseconds.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Options {
    /// Batch files live in `batches/` under this directory, and the
    /// cache action log in `actions/`.
    pub cache_directory: String,

    /// Small files are copied here before upload.
    pub staging_directory: String,

    /// Cache batches are uploaded under this remote directory.
    pub remote_prefix: String,

    /// Changes that arrive within this window share snapshots.
    pub sharing_window_ms: u64,

    pub handle_poll_interval_ms: u64,

    /// Files still open for writing after this long go to the long
    /// poll.
    pub handle_poll_timeout_ms: u64,

    pub long_poll_interval_ms: u64,

    /// The long poll uploads whatever it has after this long.
    pub long_poll_deadline_ms: u64,

    /// Stop dispatching uploads once this many files wait for an
    /// upload worker...
    pub queue_high_water_mark: usize,

    /// and resume once the count is back down to this.
    pub queue_low_water_mark: usize,

    pub upload_threads: usize,

    /// Files larger than this are uploaded in parts of this size.
    pub part_size: u64,

    /// Files at least this large are uploaded straight from their
    /// snapshot, without a staging copy.
    pub large_file_threshold: u64,

    /// Close the current cache batch after it's been open this long.
    pub batch_rollover_ms: u64,

    pub consolidation_min_batches: usize,
    pub consolidation_bytes_per_batch: u64,

    pub action_retry_limit: u32,
    pub action_retry_delay_ms: u64,

    /// Wait this long before retrying after a failure that looks like
    /// a network outage.
    pub network_retry_delay_ms: u64,

    pub remote: Option<remote_target::RemoteTarget>,

    /// Volumes to snapshot with ZFS.
    pub volumes: Vec<snapshot_provider::Volume>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            cache_directory: "/var/lib/snapvault/cache".into(),
            staging_directory: "/var/lib/snapvault/staging".into(),
            remote_prefix: ".snapvault-cache".into(),
            sharing_window_ms: 1_000,
            handle_poll_interval_ms: 1_000,
            handle_poll_timeout_ms: 30_000,
            long_poll_interval_ms: 60_000,
            long_poll_deadline_ms: 3_600_000,
            queue_high_water_mark: 100,
            queue_low_water_mark: 50,
            upload_threads: 4,
            part_size: 64 << 20,
            large_file_threshold: 16 << 20,
            batch_rollover_ms: 300_000,
            consolidation_min_batches: 10,
            consolidation_bytes_per_batch: 4 << 20,
            action_retry_limit: 3,
            action_retry_delay_ms: 500,
            network_retry_delay_ms: 5_000,
            remote: None,
            volumes: Vec::new(),
        }
    }
}

impl Options {
    /// Rejects settings the pipeline can't run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue_low_water_mark > self.queue_high_water_mark {
            return Err(fresh_warn!(
                "queue low water mark is above the high water mark",
                low = self.queue_low_water_mark,
                high = self.queue_high_water_mark
            ));
        }

        if self.part_size == 0 {
            return Err(fresh_warn!("part size must be positive"));
        }

        if self.upload_threads == 0 {
            return Err(fresh_warn!("need at least one upload thread"));
        }

        Ok(())
    }
}

/// Attempts to parse the snapvault config in `config`.  The string's
/// contents must be a config JSON for an `Options` struct, or a
/// "@/path/to/config_file.json".
#[tracing::instrument]
pub fn parse_configuration_string(config: &str) -> Option<Options> {
    if let Some(path) = config.strip_prefix('@') {
        let contents = match std::fs::read(path) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!(?e, %path, "failed to read snapvault configuration file");
                return None;
            }
        };

        match serde_json::from_slice(&contents) {
            Ok(parsed) => {
                tracing::info!(?parsed, %path, "found snapvault configuration");
                Some(parsed)
            }
            Err(e) => {
                tracing::warn!(?e, %path, "failed to parse snapvault configuration file");
                None
            }
        }
    } else {
        match serde_json::from_str(config) {
            Ok(parsed) => {
                tracing::info!(?parsed, "found snapvault configuration");
                Some(parsed)
            }
            Err(e) => {
                tracing::warn!(?e, %config, "failed to parse snapvault configuration string");
                None
            }
        }
    }
}

/// Attempts to load a snapvault configuration from the `var_name_or`
/// environment variable, or `SNAPVAULT_CONFIG_ENV_VAR` if `None`.
/// The variable's value should be a config JSON for an `Options`
/// struct, or "@/path/to/config_file.json".
#[tracing::instrument]
pub fn load_configuration_from_env(var_name_or: Option<&str>) -> Option<Options> {
    let var_name = var_name_or.unwrap_or(SNAPVAULT_CONFIG_ENV_VAR);

    let os_value = std::env::var_os(var_name)?;
    let value = if let Some(value) = os_value.to_str() {
        value
    } else {
        tracing::warn!(?os_value, %var_name, "invalid value for snapvault configuration string");
        return None;
    };

    // With environment variables, it's sometimes easier to set an
    // empty value than to unset the variable.
    if value.is_empty() {
        return None;
    }

    parse_configuration_string(value)
}

#[test]
fn test_parse_configuration() {
    let options = parse_configuration_string(
        r#"{
            "cache_directory": "/tmp/cache",
            "queue_high_water_mark": 10,
            "queue_low_water_mark": 5,
            "remote": {"local": {"directory": "/tmp/remote"}},
            "volumes": [{"mount_point": "/data", "dataset": "tank/data"}]
        }"#,
    )
    .expect("should parse");

    assert_eq!(options.cache_directory, "/tmp/cache");
    assert_eq!(options.queue_high_water_mark, 10);
    assert_eq!(options.part_size, 64 << 20);
    assert_eq!(
        options.remote,
        Some(remote_target::RemoteTarget::Local(
            remote_target::LocalRemoteTarget {
                directory: "/tmp/remote".into()
            }
        ))
    );
    assert_eq!(options.volumes[0].dataset, "tank/data");
    options.validate().expect("should be valid");

    assert!(parse_configuration_string("{\"part_size\": \"big\"}").is_none());
}

#[test]
fn test_parse_configuration_file() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"upload_threads": 7}"#).expect("should write");

    let options =
        parse_configuration_string(&format!("@{}", path.display())).expect("should parse");
    assert_eq!(options.upload_threads, 7);
    assert_eq!(options.remote_prefix, ".snapvault-cache");

    assert!(parse_configuration_string("@/does/not/exist.json").is_none());
}

#[test]
fn test_validate() {
    assert!(Options::default().validate().is_ok());

    let inverted = Options {
        queue_low_water_mark: 200,
        ..Default::default()
    };
    assert!(inverted.validate().is_err());

    let no_threads = Options {
        upload_threads: 0,
        ..Default::default()
    };
    assert!(no_threads.validate().is_err());

    let no_parts = Options {
        part_size: 0,
        ..Default::default()
    };
    assert!(no_parts.validate().is_err());
}
