use crate::backup::job::{BackupJob, JobOutcome};
use crate::error::{BackupError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Shared list of database names; each name is handed out exactly once.
#[derive(Debug, Default)]
pub struct WorkQueue {
    names: Mutex<VecDeque<String>>,
}

impl WorkQueue {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names: Mutex::new(names.into()),
        }
    }

    pub fn pop(&self) -> Option<String> {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub found: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub errors: usize,
    pub bytes_uploaded: u64,
}

impl RunSummary {
    /// `errors` is derived, so jobs that crashed outright are counted too.
    pub fn new(found: usize, succeeded: usize, skipped: usize, bytes_uploaded: u64) -> Self {
        Self {
            found,
            succeeded,
            skipped,
            errors: found.saturating_sub(skipped + succeeded),
            bytes_uploaded,
        }
    }

    pub fn into_result(self) -> Result<Self> {
        if self.errors > 0 {
            return Err(BackupError::Incomplete {
                errors: self.errors,
            });
        }
        Ok(self)
    }
}

#[derive(Default)]
struct Counters {
    succeeded: AtomicUsize,
    skipped: AtomicUsize,
}

/// Drains `queue` with `concurrency` workers, each running one job at a time.
pub async fn run_workers(
    queue: Arc<WorkQueue>,
    concurrency: usize,
    job: Arc<BackupJob>,
) -> RunSummary {
    let found = queue.len();
    let concurrency = concurrency.max(1);
    let counters = Arc::new(Counters::default());
    let bytes_before = job.bytes_uploaded();

    let mut workers = JoinSet::new();
    for id in 1..=concurrency {
        workers.spawn(worker(
            id,
            concurrency,
            queue.clone(),
            job.clone(),
            counters.clone(),
        ));
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!("Backup worker crashed: {}", e);
        }
    }

    RunSummary::new(
        found,
        counters.succeeded.load(Ordering::SeqCst),
        counters.skipped.load(Ordering::SeqCst),
        job.bytes_uploaded() - bytes_before,
    )
}

async fn worker(
    id: usize,
    of: usize,
    queue: Arc<WorkQueue>,
    job: Arc<BackupJob>,
    counters: Arc<Counters>,
) {
    while let Some(database) = queue.pop() {
        debug!("Starting backup job from loop {} of {}", id, of);

        // A panicking job must not take the worker, and the rest of the queue, with it.
        let outcome = {
            let job = job.clone();
            let database = database.clone();
            tokio::spawn(async move { job.run(&database).await }).await
        };

        match outcome {
            Ok(JobOutcome::Succeeded(summary)) => {
                info!(
                    "'{}' backup successful ({} bytes, sha256 {})",
                    database, summary.bytes, summary.sha256
                );
                if let Some(e_tag) = &summary.e_tag {
                    debug!("'{}' stored with ETag {}", database, e_tag);
                }
                counters.succeeded.fetch_add(1, Ordering::SeqCst);
            }
            Ok(JobOutcome::Skipped) => {
                debug!("'{}' backup skipped...", database);
                counters.skipped.fetch_add(1, Ordering::SeqCst);
            }
            Ok(JobOutcome::Failed(e)) => error!("'{}' backup error: {}", database, e),
            Err(e) => error!("'{}' backup error: {}", database, e),
        }
    }

    debug!("Loop {} finished", id);
}
