use crate::backup::pipe::ByteStream;
use crate::error::Result;
use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};

/// Regroups a chunk stream into parts of exactly `part_size` bytes (the last
/// one may be shorter) and hashes everything it hands out.
pub struct PartReader {
    stream: ByteStream,
    pending: BytesMut,
    part_size: usize,
    ended: bool,
    hasher: Sha256,
    read: u64,
}

impl PartReader {
    pub fn new(stream: ByteStream, part_size: usize) -> Self {
        Self {
            stream,
            pending: BytesMut::new(),
            part_size: part_size.max(1),
            ended: false,
            hasher: Sha256::new(),
            read: 0,
        }
    }

    pub async fn next_part(&mut self) -> Result<Option<Bytes>> {
        while !self.ended && self.pending.len() < self.part_size {
            match self.stream.recv().await {
                Some(Ok(chunk)) => self.pending.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e),
                None => self.ended = true,
            }
        }

        if self.pending.is_empty() {
            return Ok(None);
        }
        let take = self.pending.len().min(self.part_size);
        let part = self.pending.split_to(take).freeze();
        self.hasher.update(&part);
        self.read += part.len() as u64;
        Ok(Some(part))
    }

    /// True once the stream ended and every byte has been handed out.
    pub fn is_finished(&self) -> bool {
        self.ended && self.pending.is_empty()
    }

    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    pub fn sha256(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }
}
