use crate::backup::compression::{self, CompressionOptions, Wrapped};
use crate::backup::key::KeyTemplate;
use crate::backup::pipe::byte_pipe;
use crate::config::AppConfig;
use crate::database::{DumpSource, DumpSummary};
use crate::error::{BackupError, Result};
use crate::storage::{ObjectStore, ProgressFn, UploadOptions, UploadProgress, UploadSummary};
use chrono::{DateTime, Utc};
use futures::future::OptionFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum JobOutcome {
    Succeeded(UploadSummary),
    Skipped,
    Failed(BackupError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Init,
    Checking,
    Skipped,
    Starting,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Skipped | JobState::Succeeded | JobState::Failed)
    }

    fn can_move_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Init, Checking)
                | (Checking, Skipped)
                | (Checking, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
        )
    }
}

/// Single-owner state of one job. Once terminal, every further event is dropped.
#[derive(Debug)]
pub struct JobTracker {
    state: JobState,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self {
            state: JobState::Init,
        }
    }
}

impl JobTracker {
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Returns false, leaving the state untouched, if the move is not allowed.
    pub fn advance(&mut self, next: JobState) -> bool {
        if !self.state.can_move_to(next) {
            debug!("Ignoring job transition {:?} -> {:?}", self.state, next);
            return false;
        }
        self.state = next;
        true
    }
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub bucket: String,
    pub keys: KeyTemplate,
    pub compression: CompressionOptions,
    pub upload: UploadOptions,
    pub buffer_chunks: usize,
    pub timeout: Option<Duration>,
}

impl JobSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            bucket: config.s3.bucket.clone(),
            keys: KeyTemplate::new(&config.s3.key_template, &config.s3.prefix)?,
            compression: CompressionOptions::from_config(
                &config.compression,
                config.dump_buffer_chunks,
            ),
            upload: UploadOptions {
                part_size: config.s3.part_size,
                queue_size: config.s3.queue_size,
            },
            buffer_chunks: config.dump_buffer_chunks,
            timeout: config.job_timeout_secs.map(Duration::from_secs),
        })
    }
}

fn flatten<T>(joined: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    joined.map_err(BackupError::from).and_then(|r| r)
}

/// Backs up one database: existence check, then dump -> compression -> upload.
pub struct BackupJob {
    store: Arc<dyn ObjectStore>,
    dumper: Arc<dyn DumpSource>,
    settings: JobSettings,
    bytes_uploaded: Arc<AtomicU64>,
}

impl BackupJob {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        dumper: Arc<dyn DumpSource>,
        settings: JobSettings,
    ) -> Self {
        Self {
            store,
            dumper,
            settings,
            bytes_uploaded: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total bytes stored by every successful job sharing this instance.
    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded.load(Ordering::Relaxed)
    }

    pub fn target_key(&self, database: &str, at: DateTime<Utc>) -> String {
        self.settings
            .keys
            .render(database, at, self.settings.compression.kind.extension())
    }

    pub async fn run(&self, database: &str) -> JobOutcome {
        let mut tracker = JobTracker::default();
        tracker.advance(JobState::Checking);

        // Computed once: the check and the upload must agree on the key.
        let key = self.target_key(database, Utc::now());

        match self.store.exists(&self.settings.bucket, &key).await {
            Ok(true) => {
                tracker.advance(JobState::Skipped);
                return JobOutcome::Skipped;
            }
            Ok(false) => {
                tracker.advance(JobState::Starting);
            }
            Err(e) => {
                tracker.advance(JobState::Starting);
                tracker.advance(JobState::Failed);
                let err = match e {
                    BackupError::ExistenceCheck(_) => e,
                    other => BackupError::ExistenceCheck(other.to_string()),
                };
                return JobOutcome::Failed(err);
            }
        }

        info!("'{}' backup started", database);
        debug!("'{}' target key: {}", database, key);

        let job_cancel = CancellationToken::new();
        let kill_dump = job_cancel.child_token();
        let abort_upload = job_cancel.child_token();

        // Every pipe exists before any stage runs, so flow control covers the first byte.
        let (dump_sink, dump_stream) = byte_pipe(self.settings.buffer_chunks);
        let Wrapped {
            stream: upload_stream,
            worker: compressor,
        } = compression::wrap(dump_stream, &self.settings.compression);

        let upload = {
            let store = self.store.clone();
            let bucket = self.settings.bucket.clone();
            let key = key.clone();
            let options = self.settings.upload;
            let cancel = abort_upload.clone();
            let progress = progress_logger(database);
            tokio::spawn(async move {
                store
                    .upload(&bucket, &key, upload_stream, options, cancel, progress)
                    .await
            })
        };

        let dump = {
            let dumper = self.dumper.clone();
            let database = database.to_string();
            let cancel = kill_dump.clone();
            tokio::spawn(async move { dumper.dump(&database, dump_sink, cancel).await })
        };

        tracker.advance(JobState::Running);
        let stages = Stages {
            dump,
            compressor,
            upload,
            job_cancel,
            kill_dump,
            abort_upload,
        };
        let outcome = self.supervise(database, &mut tracker, stages).await;

        if let JobOutcome::Succeeded(summary) = &outcome {
            self.bytes_uploaded
                .fetch_add(summary.bytes, Ordering::Relaxed);
        }
        outcome
    }

    async fn supervise(
        &self,
        database: &str,
        tracker: &mut JobTracker,
        stages: Stages,
    ) -> JobOutcome {
        let Stages {
            mut dump,
            compressor,
            mut upload,
            job_cancel,
            kill_dump,
            abort_upload,
        } = stages;

        let timeout = self.settings.timeout;
        let deadline = async move {
            match timeout {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut outcome: Option<JobOutcome> = None;
        // A stage that only stopped because a sibling went away; reported
        // only if no real failure ever shows up.
        let mut fallback: Option<BackupError> = None;
        let mut dump_done = false;
        let mut upload_done = false;
        // Pass-through has no compressor task; the empty future resolves at once.
        let mut compressor = OptionFuture::from(compressor);
        let mut compressor_done = false;

        while !(dump_done && upload_done && compressor_done) {
            tokio::select! {
                result = &mut dump, if !dump_done => {
                    dump_done = true;
                    match flatten::<DumpSummary>(result) {
                        Ok(summary) => debug!("'{}' dump finished ({} bytes)", database, summary.bytes),
                        Err(e) if e.is_cancellation() && !tracker.state().is_terminal() => {
                            fallback.get_or_insert(e);
                        }
                        Err(e) => {
                            if tracker.advance(JobState::Failed) {
                                abort_upload.cancel();
                                outcome = Some(JobOutcome::Failed(e));
                            } else {
                                debug!("'{}' discarding dump error after completion: {}", database, e);
                            }
                        }
                    }
                }
                joined = &mut compressor, if !compressor_done => {
                    compressor_done = true;
                    if let Some(Err(e)) = joined {
                        let e = BackupError::Compression(format!("compressor task failed: {}", e));
                        if tracker.advance(JobState::Failed) {
                            kill_dump.cancel();
                            abort_upload.cancel();
                            outcome = Some(JobOutcome::Failed(e));
                        } else {
                            warn!("'{}' {} after the job ended", database, e);
                        }
                    }
                }
                result = &mut upload, if !upload_done => {
                    upload_done = true;
                    match flatten(result) {
                        Ok(summary) => {
                            if tracker.advance(JobState::Succeeded) {
                                outcome = Some(JobOutcome::Succeeded(summary));
                            }
                        }
                        Err(e) if e.is_cancellation() && !tracker.state().is_terminal() => {
                            kill_dump.cancel();
                            fallback.get_or_insert(e);
                        }
                        Err(e) => {
                            if tracker.advance(JobState::Failed) {
                                kill_dump.cancel();
                                outcome = Some(JobOutcome::Failed(e));
                            } else {
                                debug!("'{}' discarding upload error after completion: {}", database, e);
                            }
                        }
                    }
                }
                _ = &mut deadline, if !tracker.state().is_terminal() => {
                    if tracker.advance(JobState::Failed) {
                        job_cancel.cancel();
                        outcome = Some(JobOutcome::Failed(BackupError::Timeout(
                            timeout.unwrap_or_default(),
                        )));
                    }
                }
            }
        }

        outcome.unwrap_or_else(|| {
            tracker.advance(JobState::Failed);
            JobOutcome::Failed(fallback.unwrap_or_else(|| {
                BackupError::Task("pipeline stopped without a result".to_string())
            }))
        })
    }
}

struct Stages {
    dump: JoinHandle<Result<DumpSummary>>,
    compressor: Option<JoinHandle<()>>,
    upload: JoinHandle<Result<UploadSummary>>,
    job_cancel: CancellationToken,
    kill_dump: CancellationToken,
    abort_upload: CancellationToken,
}

fn progress_logger(database: &str) -> ProgressFn {
    let database = database.to_string();
    Arc::new(move |progress: UploadProgress| {
        if progress.is_complete() {
            info!(
                "'{}' finished uploading to S3 ({} bytes)",
                database, progress.loaded
            );
        } else {
            debug!("'{}' chunk uploaded to S3 ({} bytes)", database, progress.loaded);
        }
    })
}
