use crate::error::{BackupError, Result};
use bytes::Bytes;
use tokio::sync::mpsc;

/// Chunk of a byte stream; an `Err` item means the producer failed and no
/// clean end-of-data will follow.
pub type Chunk = Result<Bytes>;

pub type ChunkSender = mpsc::Sender<Chunk>;

pub type ByteStream = mpsc::Receiver<Chunk>;

pub fn byte_pipe(capacity: usize) -> (ChunkSender, ByteStream) {
    mpsc::channel(capacity.max(1))
}

/// Pushes a failure marker downstream, then builds the same error for the caller.
pub async fn poison<F>(sink: &ChunkSender, make: F, reason: String) -> BackupError
where
    F: Fn(String) -> BackupError,
{
    let _ = sink.send(Err(make(reason.clone()))).await;
    make(reason)
}
