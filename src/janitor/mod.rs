//! The janitor runs all periodic maintenance: validation, mark-and-sweep
//! garbage collection, replica synchronization, account teardown. Every job
//! is a producer/consumer loop: the producer selects one due row (gated on
//! its `next_*_at` clock), the consumer processes it and re-arms the clock
//! with jitter. Two janitors racing on the same row would duplicate work,
//! never corrupt state, because the clocks are the only coordination.

pub mod accounts;
pub mod blobs;
pub mod gc;
pub mod manifests;
pub mod mounts;
pub mod security;
pub mod storage;
pub mod sync;
pub mod uploads;

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::configuration::Configuration;
use crate::db::DbPool;
use crate::drivers::{FederationDriver, StorageDriver};
use crate::errors::RegistryV2Error;
use crate::metrics;
use crate::processor::Processor;
use crate::util::{wall_clock, Clock};

pub const BLOB_SWEEP_INTERVAL_SECS: i64 = 3600;
pub const BLOB_MOUNT_SWEEP_INTERVAL_SECS: i64 = 3600;
pub const STORAGE_SWEEP_INTERVAL_SECS: i64 = 6 * 3600;
pub const MANIFEST_SYNC_INTERVAL_SECS: i64 = 3600;
pub const IMAGE_GC_INTERVAL_SECS: i64 = 3600;
pub const FEDERATION_ANNOUNCEMENT_INTERVAL_SECS: i64 = 3600;
pub const SECURITY_SCAN_INTERVAL_SECS: i64 = 3600;
pub const ABANDONED_UPLOAD_AGE_SECS: i64 = 24 * 3600;
pub const ACCOUNT_DELETION_RETRY_SECS: i64 = 60;

const IDLE_SLEEP_MIN: Duration = Duration::from_secs(5);
const IDLE_SLEEP_MAX: Duration = Duration::from_secs(300);

/// What one pass of a job loop did.
pub enum JobResult {
    /// A row was processed; poll again immediately.
    DidWork,
    /// Nothing is due; back off before polling again.
    NothingToDo,
}

#[derive(Clone)]
pub struct Janitor {
    pub(crate) db: DbPool,
    pub(crate) sd: Arc<dyn StorageDriver>,
    pub(crate) fd: Arc<dyn FederationDriver>,
    pub(crate) config: Arc<Configuration>,
    pub(crate) processor: Processor,
    pub(crate) time_now: Clock,
}

impl Janitor {
    pub fn new(
        db: DbPool,
        sd: Arc<dyn StorageDriver>,
        fd: Arc<dyn FederationDriver>,
        config: Arc<Configuration>,
    ) -> Self {
        let processor = Processor::new(db.clone(), sd.clone(), fd.clone(), config.clone());
        Janitor {
            db,
            sd,
            fd,
            config,
            processor,
            time_now: wall_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.processor = self.processor.with_clock(clock.clone());
        self.time_now = clock;
        self
    }

    pub(crate) fn now(&self) -> i64 {
        (self.time_now)()
    }

    /// `now + interval + rand[0, interval/10]`: the jitter spreads the next
    /// due times of entities that were all created in one burst.
    pub(crate) fn next_run(&self, interval_secs: i64) -> i64 {
        let jitter = if interval_secs >= 10 {
            rand::thread_rng().gen_range(0..=interval_secs / 10)
        } else {
            0
        };
        self.now() + interval_secs + jitter
    }

    /// Runs every job loop until the shutdown signal fires.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!("janitor: starting job loops");
        let mut handles = Vec::new();

        macro_rules! spawn_loop {
            ($task_name:expr, $method:ident) => {{
                let janitor = self.clone();
                let shutdown = shutdown.clone();
                handles.push(tokio::spawn(async move {
                    run_job_loop($task_name, shutdown, move || {
                        let janitor = janitor.clone();
                        async move { janitor.$method().await }
                    })
                    .await;
                }));
            }};
        }

        spawn_loop!("manifest-validation", validate_next_manifest);
        spawn_loop!("blob-validation", validate_next_blob);
        spawn_loop!("blob-mount-sweep", sweep_blob_mounts_next);
        spawn_loop!("blob-sweep", sweep_blobs_next);
        spawn_loop!("storage-sweep", sweep_storage_next);
        spawn_loop!("manifest-sync", sync_next_replica_repo);
        spawn_loop!("image-gc", collect_garbage_next);
        spawn_loop!("upload-cleanup", clean_next_abandoned_upload);
        spawn_loop!("federation-announcement", announce_next_account);
        spawn_loop!("security-scan", check_next_security_status);
        spawn_loop!("account-deletion", delete_next_marked_account);

        for handle in handles {
            let _ = handle.await;
        }
        info!("janitor: all job loops stopped");
    }
}

/// Drives one job loop: poll, process, back off exponentially while idle.
pub(crate) async fn run_job_loop<F, Fut>(
    task_name: &'static str,
    mut shutdown: watch::Receiver<bool>,
    mut execute_one: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<JobResult, RegistryV2Error>>,
{
    let mut idle_sleep = IDLE_SLEEP_MIN;
    loop {
        if *shutdown.borrow() {
            return;
        }

        let sleep_for = match execute_one().await {
            Ok(JobResult::DidWork) => {
                metrics::JANITOR_TASKS.with_label_values(&[task_name, "success"]).inc();
                idle_sleep = IDLE_SLEEP_MIN;
                continue;
            }
            Ok(JobResult::NothingToDo) => {
                debug!("janitor: {task_name} has nothing to do");
                let sleep_for = idle_sleep;
                idle_sleep = (idle_sleep * 2).min(IDLE_SLEEP_MAX);
                sleep_for
            }
            Err(err) => {
                metrics::JANITOR_TASKS.with_label_values(&[task_name, "failure"]).inc();
                error!("janitor: {task_name} failed: {err}");
                idle_sleep = IDLE_SLEEP_MIN;
                IDLE_SLEEP_MIN
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = shutdown.changed() => return,
        }
    }
}
