use crate::backup::job::{BackupJob, JobSettings};
use crate::backup::scheduler::{run_workers, RunSummary, WorkQueue};
use crate::config::AppConfig;
use crate::database::{Catalog, MysqlCatalog, MysqlDump};
use crate::error::{BackupError, Result};
use crate::storage::S3Store;
use std::sync::Arc;
use tracing::info;

/// Lists the databases, backs them all up, and fails if any job did.
pub async fn run_backup(
    catalog: &dyn Catalog,
    job: Arc<BackupJob>,
    concurrency: usize,
) -> Result<RunSummary> {
    info!("Starting backup");

    let databases = catalog.list_databases().await.map_err(|e| match e {
        BackupError::Enumeration(_) => e,
        other => BackupError::Enumeration(other.to_string()),
    })?;
    info!("{} databases found", databases.len());

    let summary = run_workers(Arc::new(WorkQueue::new(databases)), concurrency, job).await;

    info!(
        "{} successful backups; {} skipped out of {}",
        summary.succeeded, summary.skipped, summary.found
    );
    info!("{} bytes uploaded", summary.bytes_uploaded);
    summary.into_result()
}

pub async fn run(config: &AppConfig) -> Result<RunSummary> {
    let settings = JobSettings::from_config(config)?;
    let store = Arc::new(S3Store::connect(&config.s3).await);
    let dumper = Arc::new(MysqlDump::new(&config.mysql));
    let job = Arc::new(BackupJob::new(store, dumper, settings));
    let catalog = MysqlCatalog::new(&config.mysql);

    run_backup(&catalog, job, config.concurrency).await
}
