use crate::backup::pipe::{byte_pipe, ByteStream, ChunkSender};
use crate::config::CompressionConfig;
use crate::error::BackupError;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Write};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use xz2::stream::{Check, MtStreamBuilder};
use xz2::write::XzEncoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    Identity,
    Gzip,
    Xz,
}

impl CompressionType {
    /// Empty or unknown names fall back to pass-through.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "gz" | "gzip" => CompressionType::Gzip,
            "xz" => CompressionType::Xz,
            "" | "none" => CompressionType::Identity,
            other => {
                warn!("Unsupported compression type '{}', uploading uncompressed", other);
                CompressionType::Identity
            }
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            CompressionType::Identity => "sql",
            CompressionType::Gzip => "sql.gz",
            CompressionType::Xz => "sql.xz",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressionOptions {
    pub kind: CompressionType,
    pub level: u32,
    pub threads: u32,
    /// Capacity, in chunks, of the compressed output channel.
    pub buffer: usize,
}

impl CompressionOptions {
    pub fn from_config(config: &CompressionConfig, buffer: usize) -> Self {
        Self {
            kind: CompressionType::parse(&config.kind),
            level: config.level.min(9),
            threads: config.threads,
            buffer,
        }
    }
}

/// Output of [`wrap`]. `worker` is `None` for pass-through.
pub struct Wrapped {
    pub stream: ByteStream,
    pub worker: Option<JoinHandle<()>>,
}

trait Encoder: Send {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()>;
    fn take_output(&mut self) -> Vec<u8>;
    fn finish(self: Box<Self>) -> io::Result<Vec<u8>>;
}

impl Encoder for GzEncoder<Vec<u8>> {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.write_all(chunk)
    }

    fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(self.get_mut())
    }

    fn finish(self: Box<Self>) -> io::Result<Vec<u8>> {
        (*self).finish()
    }
}

impl Encoder for XzEncoder<Vec<u8>> {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.write_all(chunk)
    }

    fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(self.get_mut())
    }

    fn finish(self: Box<Self>) -> io::Result<Vec<u8>> {
        (*self).finish()
    }
}

fn xz_threads(hint: u32) -> u32 {
    if hint > 0 {
        return hint;
    }
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

fn build_encoder(options: &CompressionOptions) -> io::Result<Option<Box<dyn Encoder>>> {
    match options.kind {
        CompressionType::Identity => Ok(None),
        CompressionType::Gzip => Ok(Some(Box::new(GzEncoder::new(
            Vec::new(),
            Compression::new(options.level),
        )))),
        CompressionType::Xz => {
            let stream = MtStreamBuilder::new()
                .preset(options.level)
                .threads(xz_threads(options.threads))
                .check(Check::Crc32)
                .encoder()
                .map_err(io::Error::from)?;
            Ok(Some(Box::new(XzEncoder::new_stream(Vec::new(), stream))))
        }
    }
}

/// Wraps `input` with the selected compressor. Both sides are bounded
/// channels, so a slow consumer stalls the compressor which stalls the producer.
pub fn wrap(input: ByteStream, options: &CompressionOptions) -> Wrapped {
    let (output, stream) = byte_pipe(options.buffer);

    match build_encoder(options) {
        Ok(None) => Wrapped {
            stream: input,
            worker: None,
        },
        Ok(Some(encoder)) => {
            debug!("Compressing with {:?} level {}", options.kind, options.level);
            let worker = tokio::task::spawn_blocking(move || compress(encoder, input, output));
            Wrapped {
                stream,
                worker: Some(worker),
            }
        }
        Err(e) => {
            let _ = output.try_send(Err(BackupError::Compression(format!(
                "could not create compressor: {}",
                e
            ))));
            Wrapped {
                stream,
                worker: None,
            }
        }
    }
}

/// Sending half of the compressed stream. Dropped without `fail` or `close`
/// (a panicking encoder), it still pushes an error item so the upload never
/// mistakes a dead compressor for the end of the data.
struct Output {
    sender: ChunkSender,
    settled: bool,
}

impl Output {
    fn new(sender: ChunkSender) -> Self {
        Self {
            sender,
            settled: false,
        }
    }

    /// False once the consumer is gone.
    fn send(&self, chunk: Vec<u8>) -> bool {
        chunk.is_empty() || self.sender.blocking_send(Ok(Bytes::from(chunk))).is_ok()
    }

    fn fail(mut self, err: BackupError) {
        self.settled = true;
        let _ = self.sender.blocking_send(Err(err));
    }

    fn close(mut self, tail: Vec<u8>) {
        self.settled = true;
        self.send(tail);
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.sender.blocking_send(Err(BackupError::Compression(
                "compressor stopped before the end of input".to_string(),
            )));
        }
    }
}

fn compress(mut encoder: Box<dyn Encoder>, mut input: ByteStream, output: ChunkSender) {
    let output = Output::new(output);

    while let Some(item) = input.blocking_recv() {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => return output.fail(e),
        };

        if let Err(e) = encoder.write_chunk(&chunk) {
            return output.fail(BackupError::Compression(e.to_string()));
        }

        if !output.send(encoder.take_output()) {
            return;
        }
    }

    match encoder.finish() {
        Ok(tail) => output.close(tail),
        Err(e) => output.fail(BackupError::Compression(e.to_string())),
    }
}
