use crate::backup::pipe::ByteStream;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct UploadOptions {
    /// Upper bound for a single part.
    pub part_size: usize,
    /// Parts allowed in flight at once for one upload.
    pub queue_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub loaded: u64,
    /// Known once the input stream has ended.
    pub total: Option<u64>,
}

impl UploadProgress {
    pub fn is_complete(&self) -> bool {
        self.total == Some(self.loaded)
    }
}

pub type ProgressFn = Arc<dyn Fn(UploadProgress) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct UploadSummary {
    pub bytes: u64,
    pub sha256: String,
    pub e_tag: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// True when at least one object exists under `key`.
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Stores `body` at `key`. An error item in `body` or a cancelled
    /// `cancel` aborts the transfer and nothing is left behind.
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        options: UploadOptions,
        cancel: CancellationToken,
        progress: ProgressFn,
    ) -> Result<UploadSummary>;
}
