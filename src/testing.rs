//! In-memory stand-ins for S3, mysqldump and the schema catalog.

use crate::backup::pipe::{poison, ByteStream, ChunkSender};
use crate::database::{Catalog, DumpSource, DumpSummary};
use crate::error::{BackupError, Result};
use crate::storage::{
    ObjectStore, PartReader, ProgressFn, UploadOptions, UploadProgress, UploadSummary,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct MemoryStore {
    existing: Mutex<HashSet<String>>,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    progress: Mutex<Vec<UploadProgress>>,
    fail_exists: bool,
    fail_upload_after: Option<usize>,
    pub exists_calls: AtomicUsize,
    pub uploads_started: AtomicUsize,
    pub aborted: AtomicUsize,
}

impl MemoryStore {
    pub fn with_existing(self, keys: &[&str]) -> Self {
        self.existing
            .lock()
            .unwrap()
            .extend(keys.iter().map(|k| k.to_string()));
        self
    }

    pub fn failing_exists(mut self) -> Self {
        self.fail_exists = true;
        self
    }

    pub fn failing_upload_after(mut self, bytes: usize) -> Self {
        self.fail_upload_after = Some(bytes);
        self
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn final_progress_complete(&self) -> bool {
        self.progress
            .lock()
            .unwrap()
            .last()
            .map(UploadProgress::is_complete)
            .unwrap_or(false)
    }

    fn report(&self, progress: &ProgressFn, event: UploadProgress) {
        self.progress.lock().unwrap().push(event);
        progress(event);
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn exists(&self, _bucket: &str, key: &str) -> Result<bool> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_exists {
            return Err(BackupError::ExistenceCheck("access denied".to_string()));
        }
        let existing = self.existing.lock().unwrap();
        let objects = self.objects.lock().unwrap();
        Ok(existing.iter().chain(objects.keys()).any(|k| k.starts_with(key)))
    }

    async fn upload(
        &self,
        _bucket: &str,
        key: &str,
        body: ByteStream,
        options: UploadOptions,
        cancel: CancellationToken,
        progress: ProgressFn,
    ) -> Result<UploadSummary> {
        self.uploads_started.fetch_add(1, Ordering::SeqCst);
        let mut reader = PartReader::new(body, options.part_size);
        let mut data = Vec::new();

        loop {
            let part = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.aborted.fetch_add(1, Ordering::SeqCst);
                    return Err(BackupError::Cancelled("upload aborted".to_string()));
                }
                part = reader.next_part() => part,
            };
            let part = match part {
                Ok(Some(part)) => part,
                Ok(None) => break,
                Err(e) => {
                    self.aborted.fetch_add(1, Ordering::SeqCst);
                    return Err(e);
                }
            };
            data.extend_from_slice(&part);

            if let Some(limit) = self.fail_upload_after {
                if data.len() >= limit {
                    self.aborted.fetch_add(1, Ordering::SeqCst);
                    return Err(BackupError::Upload("injected failure".to_string()));
                }
            }
            let total = reader.is_finished().then(|| reader.bytes_read());
            self.report(
                &progress,
                UploadProgress {
                    loaded: data.len() as u64,
                    total,
                },
            );
        }

        let bytes = data.len() as u64;
        if !self.final_progress_complete() {
            self.report(
                &progress,
                UploadProgress {
                    loaded: bytes,
                    total: Some(bytes),
                },
            );
        }
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(UploadSummary {
            bytes,
            sha256: reader.sha256(),
            e_tag: None,
        })
    }
}

/// Dump spy: replays fixed chunks and counts what happened to it.
pub struct ScriptedDump {
    chunks: Vec<Bytes>,
    failure: Option<String>,
    failing_databases: HashSet<String>,
    hang: bool,
    chunk_delay: Duration,
    alive: AtomicUsize,
    pub invocations: AtomicUsize,
    pub killed: AtomicUsize,
    pub max_alive: AtomicUsize,
    pub seen: Mutex<Vec<String>>,
}

struct AliveGuard<'a>(&'a AtomicUsize);

impl Drop for AliveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedDump {
    pub fn new(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks
                .iter()
                .map(|c| Bytes::copy_from_slice(c.as_bytes()))
                .collect(),
            failure: None,
            failing_databases: HashSet::new(),
            hang: false,
            chunk_delay: Duration::ZERO,
            alive: AtomicUsize::new(0),
            invocations: AtomicUsize::new(0),
            killed: AtomicUsize::new(0),
            max_alive: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Exit nonzero after the chunks, for every database.
    pub fn failing(mut self, reason: &str) -> Self {
        self.failure = Some(reason.to_string());
        self
    }

    /// Exit nonzero after the chunks, only for these databases.
    pub fn failing_for(mut self, databases: &[&str]) -> Self {
        self.failing_databases = databases.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Never exit on its own; only a kill ends it.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    async fn killed_by(&self, cancel: &CancellationToken, sink: &ChunkSender) -> BackupError {
        // Like a real process blocked on a dead pipe, it only stops when killed.
        cancel.cancelled().await;
        self.killed.fetch_add(1, Ordering::SeqCst);
        poison(sink, BackupError::Cancelled, "killed".to_string()).await
    }
}

#[async_trait]
impl DumpSource for ScriptedDump {
    async fn dump(
        &self,
        database: &str,
        sink: ChunkSender,
        cancel: CancellationToken,
    ) -> Result<DumpSummary> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(database.to_string());
        let now = self.alive.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_alive.fetch_max(now, Ordering::SeqCst);
        let _alive = AliveGuard(&self.alive);

        let mut bytes = 0u64;
        for chunk in &self.chunks {
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                sent = sink.send(Ok(chunk.clone())) => sent.is_ok(),
            };
            if !sent {
                return Err(self.killed_by(&cancel, &sink).await);
            }
            bytes += chunk.len() as u64;
        }

        if self.hang {
            return Err(self.killed_by(&cancel, &sink).await);
        }
        if let Some(reason) = &self.failure {
            return Err(poison(&sink, BackupError::DumpRuntime, reason.clone()).await);
        }
        if self.failing_databases.contains(database) {
            let reason = "mysqldump exited with 2".to_string();
            return Err(poison(&sink, BackupError::DumpRuntime, reason).await);
        }
        Ok(DumpSummary { bytes })
    }
}

pub struct StaticCatalog {
    databases: Option<Vec<String>>,
}

impl StaticCatalog {
    pub fn new(databases: &[&str]) -> Self {
        Self {
            databases: Some(databases.iter().map(|d| d.to_string()).collect()),
        }
    }

    pub fn unreachable() -> Self {
        Self { databases: None }
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn list_databases(&self) -> Result<Vec<String>> {
        self.databases
            .clone()
            .ok_or_else(|| BackupError::Enumeration("connection refused".to_string()))
    }
}
