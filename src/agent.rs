//! The `BackupAgent` wires the intake, stabilization, dispatch and
//! upload stages together, in front of the remote file state cache.
//!
//! Data flows one way: intake scheduler -> open-handle poller ->
//! (long-poll stabilizer) -> backup queue -> upload pool.  Failed
//! uploads loop back to intake as rechecks.
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::backup_queue::BackupQueue;
use crate::backup_queue::BackupQueueConfig;
use crate::cache_action_log::CacheActionLog;
use crate::consolidation::ConsolidationPolicy;
use crate::file_state_cache::RemoteFileStateCache;
use crate::fresh_error;
use crate::intake::ChangeNotification;
use crate::intake::IntakeHandle;
use crate::intake::IntakeScheduler;
use crate::long_poll::LongPollStabilizer;
use crate::open_handle_poller::OpenHandlePoller;
use crate::open_handles::OpenHandleEnumerator;
use crate::open_handles::ProcOpenHandleEnumerator;
use crate::remote::RemoteStorage;
use crate::result::Result;
use crate::retry::RetryPolicy;
use crate::snapshot_provider::SnapshotProvider;
use crate::snapshot_provider::ZfsSnapshotProvider;
use crate::staging::Staging;
use crate::upload_pool::UploadPool;
use crate::upload_pool::UploadPoolConfig;
use crate::volumes::Snapshotter;
use crate::volumes::VolumeMap;
use crate::Options;

/// Poll the pipeline this often in `wait_until_idle`.
const IDLE_CHECK_PERIOD: Duration = Duration::from_millis(10);

/// The external systems the agent talks to.
#[derive(Clone, Debug)]
pub struct Collaborators {
    pub snapshots: Arc<dyn SnapshotProvider>,
    pub open_handles: Arc<dyn OpenHandleEnumerator>,
    pub remote: Arc<dyn RemoteStorage>,
}

impl Collaborators {
    /// Returns the production collaborators for `options`: ZFS
    /// snapshots of the configured volumes, `/proc` scraping, and the
    /// configured remote target.
    pub fn from_options(options: &Options) -> Result<Collaborators> {
        Ok(Collaborators {
            snapshots: Arc::new(ZfsSnapshotProvider::new(options.volumes.clone())),
            open_handles: Arc::new(ProcOpenHandleEnumerator::default()),
            remote: remote_for_options(options)?,
        })
    }
}

fn remote_for_options(options: &Options) -> Result<Arc<dyn RemoteStorage>> {
    match &options.remote {
        Some(target) => target.build(),
        None => Err(fresh_error!("no remote target configured")),
    }
}

fn action_retry_policy(options: &Options) -> RetryPolicy {
    RetryPolicy {
        limit: options.action_retry_limit,
        delay: Duration::from_millis(options.action_retry_delay_ms),
    }
}

/// Opens the action log and the file state cache under
/// `options.cache_directory`.  Neither is started.
fn open_cache(
    options: &Options,
    remote: Arc<dyn RemoteStorage>,
    cancel: CancellationToken,
) -> Result<(Arc<CacheActionLog>, Arc<RemoteFileStateCache>)> {
    let root = PathBuf::from(&options.cache_directory);
    let actions = CacheActionLog::open(
        root.join("actions"),
        remote,
        action_retry_policy(options),
        Duration::from_millis(options.network_retry_delay_ms),
        cancel,
    )?;

    let cache = RemoteFileStateCache::new(
        root.join("batches"),
        options.remote_prefix.clone(),
        Duration::from_millis(options.batch_rollover_ms),
        ConsolidationPolicy {
            min_batches: options.consolidation_min_batches,
            bytes_per_batch: options.consolidation_bytes_per_batch,
        },
        actions.clone(),
    );

    Ok((actions, cache))
}

/// Replays the cache under `options.cache_directory`, and returns
/// every state in it, without starting anything.
pub fn load_cache_states(options: &Options) -> Result<Vec<crate::file_state::FileState>> {
    let (_, cache) = open_cache(options, remote_for_options(options)?, CancellationToken::new())?;
    cache.load_cache()?;
    cache.all_states()
}

#[derive(Debug)]
pub struct BackupAgent {
    intake: IntakeHandle,
    cancel: CancellationToken,
    actions: Arc<CacheActionLog>,
    cache: Arc<RemoteFileStateCache>,
    pool: Arc<UploadPool>,
    queue: Arc<BackupQueue>,
    long_poll: Arc<LongPollStabilizer>,
    poller: Arc<OpenHandlePoller>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl BackupAgent {
    /// Loads the cache and starts every stage of the pipeline.
    #[instrument(skip(collaborators), err)]
    pub fn start(options: &Options, collaborators: Collaborators) -> Result<BackupAgent> {
        options.validate()?;

        let cancel = CancellationToken::new();
        let retry = action_retry_policy(options);
        let (intake, receiver) = IntakeHandle::channel();

        let (actions, cache) = open_cache(options, collaborators.remote.clone(), cancel.clone())?;
        cache.load_cache()?;
        actions.start();
        cache.start_rollover_timer();

        let staging = Staging::new(PathBuf::from(&options.staging_directory))?;
        let stale = staging.cleanup_stale_files()?;
        if stale > 0 {
            tracing::info!(stale, "removed stale staging files");
        }

        let pool = UploadPool::new(
            UploadPoolConfig {
                part_size: options.part_size,
                low_water_mark: options.queue_low_water_mark,
                retry,
            },
            cache.clone(),
            collaborators.remote.clone(),
            intake.clone(),
            cancel.clone(),
        );
        let queue = BackupQueue::new(
            BackupQueueConfig {
                high_water_mark: options.queue_high_water_mark,
                low_water_mark: options.queue_low_water_mark,
                large_file_threshold: options.large_file_threshold,
                retry,
                network_retry_delay: Duration::from_millis(options.network_retry_delay_ms),
            },
            cache.clone(),
            collaborators.remote.clone(),
            pool.clone(),
            staging,
            intake.clone(),
            cancel.clone(),
        );

        let volumes = collaborators.snapshots.enumerate_volumes()?;
        tracing::info!(?volumes, "backing up volumes");
        let snapshotter = Arc::new(Snapshotter::new(
            collaborators.snapshots.clone(),
            VolumeMap::new(volumes),
        ));

        let long_poll = LongPollStabilizer::new(
            Duration::from_millis(options.long_poll_interval_ms),
            Duration::from_millis(options.long_poll_deadline_ms),
            snapshotter.clone(),
            collaborators.open_handles.clone(),
            queue.clone(),
        );
        let poller = OpenHandlePoller::new(
            Duration::from_millis(options.handle_poll_interval_ms),
            Duration::from_millis(options.handle_poll_timeout_ms),
            collaborators.open_handles.clone(),
            long_poll.clone(),
            queue.clone(),
        );

        let agent = BackupAgent {
            intake,
            cancel,
            actions,
            cache,
            pool,
            queue,
            long_poll,
            poller,
            scheduler: Mutex::new(None),
        };

        // From here on, `stop` cleans up whatever we managed to start.
        if let Err(e) = agent.start_threads(options, snapshotter, receiver) {
            agent.stop();
            return Err(e);
        }

        Ok(agent)
    }

    fn start_threads(
        &self,
        options: &Options,
        snapshotter: Arc<Snapshotter>,
        receiver: crate::intake::IntakeReceiver,
    ) -> Result<()> {
        self.pool.start(options.upload_threads)?;
        self.queue.start()?;
        self.long_poll.start()?;
        self.poller.start()?;

        let scheduler = IntakeScheduler::new(
            Duration::from_millis(options.sharing_window_ms),
            snapshotter,
            self.poller.clone(),
            self.queue.clone(),
            receiver,
        )
        .spawn()?;
        *self
            .scheduler
            .lock()
            .expect("scheduler lock should not be poisoned") = Some(scheduler);
        Ok(())
    }

    /// Returns a handle for the file system watcher.
    pub fn notifier(&self) -> IntakeHandle {
        self.intake.clone()
    }

    pub fn cache(&self) -> &Arc<RemoteFileStateCache> {
        &self.cache
    }

    /// Marks every regular file under `roots` dirty, with intake
    /// paused for the duration of the walk.
    #[instrument(skip(self), err)]
    pub fn scan(&self, roots: &[PathBuf]) -> Result<usize> {
        let mut count = 0;

        self.intake.pause();
        for root in roots {
            for entry in walkdir::WalkDir::new(root) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(error) => {
                        tracing::info!(%error, ?root, "skipping unreadable entry during scan");
                        continue;
                    }
                };

                if entry.file_type().is_file() {
                    self.intake
                        .notify(ChangeNotification::Updated(entry.into_path()));
                    count += 1;
                }
            }
        }
        self.intake.resume();

        tracing::info!(count, ?roots, "scanned files");
        Ok(count)
    }

    fn is_idle(&self) -> bool {
        self.intake.is_idle()
            && self.poller.is_idle()
            && self.long_poll.is_idle()
            && self.queue.is_idle()
            && self.pool.is_idle()
            && self.actions.is_idle()
    }

    /// Blocks until every stage of the pipeline is empty.
    pub fn wait_until_idle(&self) {
        // Work can hop between stages while we look at them, so we
        // need two clean passes in a row.
        let mut clean = 0;
        while clean < 2 {
            std::thread::sleep(IDLE_CHECK_PERIOD);
            if self.is_idle() {
                clean += 1;
            } else {
                clean = 0;
            }
        }
    }

    /// Returns whether `path`'s current contents are known to be
    /// backed up.
    pub fn is_backed_up(&self, path: &Path) -> Result<bool> {
        self.cache
            .contains_path(&crate::remote::remote_path_for(path)?)
    }

    /// Cancels in-flight remote operations, stops every thread, and
    /// releases all snapshot references.  The current batch is closed,
    /// and its upload left in the action log for the next process.
    #[instrument(skip(self))]
    pub fn stop(&self) {
        self.cancel.cancel();

        self.intake.stop();
        let scheduler = self
            .scheduler
            .lock()
            .expect("scheduler lock should not be poisoned")
            .take();
        if let Some(handle) = scheduler {
            if handle.join().is_err() {
                tracing::error!("intake scheduler panicked");
            }
        }

        self.poller.stop();
        self.long_poll.stop();
        self.queue.stop();
        self.pool.stop();
        self.cache.stop();
        self.actions.stop();
        tracing::info!("backup agent stopped");
    }
}

#[cfg(test)]
struct Fixture {
    provider: Arc<crate::test_support::FakeSnapshotProvider>,
    remote: Arc<crate::test_support::MemoryStorage>,
    options: Options,
    // Holds the cache and staging directories.
    _state: tempfile::TempDir,
}

#[cfg(test)]
impl Fixture {
    fn new() -> Fixture {
        let state = tempfile::tempdir().expect("should create temp dir");
        let options = Options {
            cache_directory: state.path().join("cache").display().to_string(),
            staging_directory: state.path().join("staging").display().to_string(),
            sharing_window_ms: 5,
            handle_poll_interval_ms: 5,
            handle_poll_timeout_ms: 1000,
            long_poll_interval_ms: 10,
            long_poll_deadline_ms: 1000,
            upload_threads: 2,
            part_size: 8,
            large_file_threshold: 16,
            action_retry_delay_ms: 1,
            network_retry_delay_ms: 10,
            ..Default::default()
        };

        Fixture {
            provider: Arc::new(crate::test_support::FakeSnapshotProvider::new(1)),
            remote: Arc::new(crate::test_support::MemoryStorage::default()),
            options,
            _state: state,
        }
    }

    fn start(&self) -> BackupAgent {
        BackupAgent::start(
            &self.options,
            Collaborators {
                snapshots: self.provider.clone(),
                open_handles: Arc::new(crate::test_support::ScriptedOpenHandles::default()),
                remote: self.remote.clone(),
            },
        )
        .expect("should start")
    }

    fn remote_path(&self, path: &Path) -> String {
        crate::remote::remote_path_for(path).expect("should be a valid path")
    }
}

#[test]
fn test_backup_update_and_delete() {
    let fixture = Fixture::new();
    let agent = fixture.start();

    let small = fixture.provider.write_file(0, "small.txt", b"hello");
    let large = fixture.provider.write_file(0, "dir/large.bin", b"0123456789abcdefghij");
    agent
        .notifier()
        .notify(ChangeNotification::Updated(small.clone()));
    agent
        .notifier()
        .notify(ChangeNotification::Updated(large.clone()));
    agent.wait_until_idle();

    assert_eq!(
        fixture.remote.contents(&fixture.remote_path(&small)),
        Some(b"hello".to_vec())
    );
    assert!(agent.is_backed_up(&small).expect("should look up"));
    assert!(agent.is_backed_up(&large).expect("should look up"));
    let large_remote = fixture.remote_path(&large);
    assert_eq!(
        agent
            .cache()
            .part_states(&large_remote)
            .expect("should look up")
            .len(),
        3
    );

    std::fs::remove_file(&small).expect("should delete");
    agent
        .notifier()
        .notify(ChangeNotification::Deleted(small.clone()));
    agent.wait_until_idle();
    assert!(!agent.is_backed_up(&small).expect("should look up"));
    assert_eq!(fixture.remote.contents(&fixture.remote_path(&small)), None);

    agent.stop();
    assert_eq!(fixture.provider.live(), 0);
}

#[test]
fn test_scan_skips_unchanged_files() {
    let fixture = Fixture::new();
    let agent = fixture.start();

    let first = fixture.provider.write_file(0, "a", b"first");
    agent
        .notifier()
        .notify(ChangeNotification::Updated(first.clone()));
    agent.wait_until_idle();
    assert_eq!(fixture.remote.upload_count(&fixture.remote_path(&first)), 1);

    let second = fixture.provider.write_file(0, "sub/b", b"second");
    let root = fixture.provider.root(0).to_owned();
    assert_eq!(agent.scan(&[root]).expect("should scan"), 2);
    agent.wait_until_idle();

    assert_eq!(fixture.remote.upload_count(&fixture.remote_path(&first)), 1);
    assert_eq!(
        fixture.remote.contents(&fixture.remote_path(&second)),
        Some(b"second".to_vec())
    );

    agent.stop();
    assert_eq!(fixture.provider.live(), 0);
}

#[test]
fn test_restart_replays_cache() {
    let fixture = Fixture::new();
    let file = fixture.provider.write_file(0, "persistent", b"data");

    let agent = fixture.start();
    agent
        .notifier()
        .notify(ChangeNotification::Updated(file.clone()));
    agent.wait_until_idle();
    agent.stop();

    // The batch upload was cancelled by the stop; its action file
    // waits for the next process.
    let agent = fixture.start();
    assert!(agent.is_backed_up(&file).expect("should look up"));
    agent.wait_until_idle();
    assert!(fixture
        .remote
        .paths()
        .iter()
        .any(|path| path.starts_with(&fixture.options.remote_prefix)));

    agent.stop();
}
