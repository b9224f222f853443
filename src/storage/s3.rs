use super::parts::PartReader;
use super::store::{ObjectStore, ProgressFn, UploadOptions, UploadProgress, UploadSummary};
use crate::backup::pipe::ByteStream;
use crate::config::S3Config;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream as Body;
use s3::types::{CompletedMultipartUpload, CompletedPart, ServerSideEncryption};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct S3Store {
    client: s3::Client,
}

fn upload_error<E: std::error::Error>(what: &str, err: E) -> BackupError {
    BackupError::Upload(format!("{}: {}", what, DisplayErrorContext(err)))
}

fn cancelled() -> BackupError {
    BackupError::Cancelled("upload aborted".to_string())
}

impl S3Store {
    pub async fn connect(config: &S3Config) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let mut builder = s3::config::Builder::from(&sdk_config);
        if config.endpoint.is_some() {
            builder = builder.force_path_style(true);
        }
        Self::new(s3::Client::from_conf(builder.build()))
    }

    pub fn new(client: s3::Client) -> Self {
        Self { client }
    }

    async fn put_single(&self, bucket: &str, key: &str, data: Bytes) -> Result<Option<String>> {
        let output = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .server_side_encryption(ServerSideEncryption::Aes256)
            .body(Body::from(data))
            .send()
            .await
            .map_err(|e| upload_error("PutObject failed", e))?;
        Ok(output.e_tag().map(String::from))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<(CompletedPart, u64)> {
        let len = data.len() as u64;
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(Body::from(data))
            .send()
            .await
            .map_err(|e| upload_error(&format!("UploadPart {} failed", part_number), e))?;

        let part = CompletedPart::builder()
            .set_e_tag(output.e_tag().map(String::from))
            .part_number(part_number)
            .build();
        Ok((part, len))
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        first: Bytes,
        reader: &mut PartReader,
        options: UploadOptions,
        cancel: &CancellationToken,
        progress: &ProgressFn,
    ) -> Result<Option<String>> {
        let queue_size = options.queue_size.max(1);
        let mut in_flight = FuturesUnordered::new();
        let mut completed: Vec<CompletedPart> = Vec::new();
        let mut loaded = 0u64;
        let mut reported_total = false;
        in_flight.push(self.upload_part(bucket, key, upload_id, 1, first));
        let mut part_number = 2;

        // Finished parts are collected while the next one is being read, so
        // queued parts upload alongside the dump instead of in bursts.
        while !(reader.is_finished() && in_flight.is_empty()) {
            let can_read = !reader.is_finished() && in_flight.len() < queue_size;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                Some(result) = in_flight.next(), if !in_flight.is_empty() => {
                    let (part, len) = result?;
                    completed.push(part);
                    loaded += len;
                    let total = reader.is_finished().then(|| reader.bytes_read());
                    reported_total = total == Some(loaded);
                    progress(UploadProgress { loaded, total });
                }
                part = reader.next_part(), if can_read => {
                    if let Some(data) = part? {
                        in_flight.push(self.upload_part(bucket, key, upload_id, part_number, data));
                        part_number += 1;
                    }
                }
            }
        }

        completed.sort_by_key(|p| p.part_number());
        let output = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| upload_error("CompleteMultipartUpload failed", e))?;

        if !reported_total {
            progress(UploadProgress {
                loaded,
                total: Some(loaded),
            });
        }
        Ok(output.e_tag().map(String::from))
    }

    async fn abort(&self, bucket: &str, key: &str, upload_id: &str) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
        match result {
            Ok(_) => debug!("Aborted multipart upload of {}", key),
            Err(e) => warn!(
                "Could not abort multipart upload of {}: {}",
                key,
                DisplayErrorContext(e)
            ),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(key)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| BackupError::ExistenceCheck(DisplayErrorContext(e).to_string()))?;
        Ok(!output.contents().is_empty())
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        options: UploadOptions,
        cancel: CancellationToken,
        progress: ProgressFn,
    ) -> Result<UploadSummary> {
        let mut reader = PartReader::new(body, options.part_size);

        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            part = reader.next_part() => part?,
        }
        .unwrap_or_default();

        if reader.is_finished() {
            let e_tag = self.put_single(bucket, key, first).await?;
            let bytes = reader.bytes_read();
            progress(UploadProgress {
                loaded: bytes,
                total: Some(bytes),
            });
            return Ok(UploadSummary {
                bytes,
                sha256: reader.sha256(),
                e_tag,
            });
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .server_side_encryption(ServerSideEncryption::Aes256)
            .send()
            .await
            .map_err(|e| upload_error("CreateMultipartUpload failed", e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| BackupError::Upload("S3 returned no upload id".to_string()))?
            .to_string();
        debug!("Multipart upload of {} started ({})", key, upload_id);

        let result = self
            .upload_parts(
                bucket, key, &upload_id, first, &mut reader, options, &cancel, &progress,
            )
            .await;

        match result {
            Ok(e_tag) => Ok(UploadSummary {
                bytes: reader.bytes_read(),
                sha256: reader.sha256(),
                e_tag,
            }),
            Err(e) => {
                self.abort(bucket, key, &upload_id).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::pipe::{byte_pipe, Chunk};
    use aws_smithy_http_client::test_util::infallible_client_fn;
    use s3::config::retry::RetryConfig;
    use s3::config::{BehaviorVersion, Credentials};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<(&'static str, bool)>>>;

    const XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

    fn operation<B>(req: &http::Request<B>) -> &'static str {
        let query = req.uri().query().unwrap_or("");
        match *req.method() {
            http::Method::GET => "ListObjectsV2",
            http::Method::DELETE => "AbortMultipartUpload",
            http::Method::POST if query.contains("uploadId=") => "CompleteMultipartUpload",
            http::Method::POST => "CreateMultipartUpload",
            http::Method::PUT if query.contains("partNumber=") => "UploadPart",
            _ => "PutObject",
        }
    }

    fn reply(status: u16, e_tag: Option<&str>, body: String) -> http::Response<String> {
        let mut builder = http::Response::builder().status(status);
        if let Some(e_tag) = e_tag {
            builder = builder.header("ETag", e_tag);
        }
        builder.body(body).unwrap()
    }

    /// S3 endpoint that answers every call, logging the operation and
    /// whether it asked for AES256 encryption. `fail` turns one operation
    /// into AccessDenied.
    fn fake_s3(fail: Option<&'static str>, existing: bool) -> (S3Store, Log) {
        let log: Log = Arc::default();
        let seen = log.clone();

        let http_client = infallible_client_fn(move |req| {
            let op = operation(&req);
            let encrypted = req
                .headers()
                .get("x-amz-server-side-encryption")
                .map(|v| v.as_bytes() == b"AES256")
                .unwrap_or(false);
            seen.lock().unwrap().push((op, encrypted));

            if fail == Some(op) {
                return reply(
                    403,
                    None,
                    "<Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>"
                        .to_string(),
                );
            }
            match op {
                "ListObjectsV2" => {
                    let contents = if existing {
                        "<Contents><Key>2024/03/07/shop.sql</Key><Size>5</Size></Contents>"
                    } else {
                        ""
                    };
                    reply(
                        200,
                        None,
                        format!(
                            "<ListBucketResult xmlns=\"{}\"><Name>bucket</Name><KeyCount>{}</KeyCount><MaxKeys>1</MaxKeys><IsTruncated>false</IsTruncated>{}</ListBucketResult>",
                            XMLNS,
                            existing as u8,
                            contents
                        ),
                    )
                }
                "CreateMultipartUpload" => reply(
                    200,
                    None,
                    format!(
                        "<InitiateMultipartUploadResult xmlns=\"{}\"><Bucket>bucket</Bucket><Key>k</Key><UploadId>upload-1</UploadId></InitiateMultipartUploadResult>",
                        XMLNS
                    ),
                ),
                "CompleteMultipartUpload" => reply(
                    200,
                    None,
                    format!(
                        "<CompleteMultipartUploadResult xmlns=\"{}\"><Bucket>bucket</Bucket><Key>k</Key><ETag>\"final\"</ETag></CompleteMultipartUploadResult>",
                        XMLNS
                    ),
                ),
                "UploadPart" => reply(200, Some("\"part\""), String::new()),
                "AbortMultipartUpload" => reply(204, None, String::new()),
                _ => reply(200, Some("\"object\""), String::new()),
            }
        });

        let config = s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("AKIDTEST", "secret", None, None, "test"))
            .retry_config(RetryConfig::disabled())
            .force_path_style(true)
            .http_client(http_client)
            .build();
        (S3Store::new(s3::Client::from_conf(config)), log)
    }

    fn count(log: &Log, op: &str) -> usize {
        log.lock().unwrap().iter().filter(|(seen, _)| *seen == op).count()
    }

    fn recorder() -> (ProgressFn, Arc<Mutex<Vec<UploadProgress>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let progress: ProgressFn = Arc::new(move |event| sink.lock().unwrap().push(event));
        (progress, events)
    }

    async fn stream_of(items: Vec<Chunk>) -> ByteStream {
        let (tx, rx) = byte_pipe(items.len() + 1);
        for item in items {
            tx.send(item).await.unwrap();
        }
        rx
    }

    fn options(part_size: usize, queue_size: usize) -> UploadOptions {
        UploadOptions {
            part_size,
            queue_size,
        }
    }

    async fn wait_for_parts(log: &Log, parts: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while count(log, "UploadPart") < parts {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("parts were not uploaded while the stream was open");
    }

    #[tokio::test]
    async fn test_exists_reads_listing() {
        let (store, log) = fake_s3(None, true);
        assert!(store.exists("bucket", "2024/03/07/shop.sql").await.unwrap());
        assert_eq!(count(&log, "ListObjectsV2"), 1);

        let (store, _) = fake_s3(None, false);
        assert!(!store.exists("bucket", "2024/03/07/shop.sql").await.unwrap());
    }

    #[tokio::test]
    async fn test_listing_failure_is_existence_check_error() {
        let (store, _) = fake_s3(Some("ListObjectsV2"), false);
        let err = store.exists("bucket", "k").await.unwrap_err();
        assert!(matches!(err, BackupError::ExistenceCheck(_)));
    }

    #[tokio::test]
    async fn test_small_stream_is_one_encrypted_put() {
        let (store, log) = fake_s3(None, false);
        let (progress, events) = recorder();
        let body = stream_of(vec![Ok(Bytes::from_static(b"hello world"))]).await;

        let summary = store
            .upload("bucket", "k", body, options(1024, 2), CancellationToken::new(), progress)
            .await
            .unwrap();

        assert_eq!(summary.bytes, 11);
        assert_eq!(
            summary.sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(summary.e_tag.as_deref(), Some("\"object\""));
        assert_eq!(*log.lock().unwrap(), vec![("PutObject", true)]);
        assert_eq!(
            events.lock().unwrap().last().copied(),
            Some(UploadProgress {
                loaded: 11,
                total: Some(11)
            })
        );
    }

    #[tokio::test]
    async fn test_large_stream_is_encrypted_multipart() {
        let (store, log) = fake_s3(None, false);
        let (progress, events) = recorder();
        let body = stream_of(vec![
            Ok(Bytes::from_static(b"012345")),
            Ok(Bytes::from_static(b"6789")),
        ])
        .await;

        let summary = store
            .upload("bucket", "k", body, options(4, 2), CancellationToken::new(), progress)
            .await
            .unwrap();

        assert_eq!(summary.bytes, 10);
        assert_eq!(summary.e_tag.as_deref(), Some("\"final\""));
        assert_eq!(log.lock().unwrap()[0], ("CreateMultipartUpload", true));
        assert_eq!(count(&log, "UploadPart"), 3);
        assert_eq!(count(&log, "CompleteMultipartUpload"), 1);
        assert_eq!(count(&log, "PutObject"), 0);
        assert_eq!(count(&log, "AbortMultipartUpload"), 0);

        let events = events.lock().unwrap();
        let last = events.last().unwrap();
        assert!(last.is_complete());
        assert_eq!(last.loaded, 10);
        assert_eq!(events.iter().filter(|e| e.is_complete()).count(), 1);
    }

    #[tokio::test]
    async fn test_failed_part_aborts_multipart() {
        let (store, log) = fake_s3(Some("UploadPart"), false);
        let (progress, _) = recorder();
        let body = stream_of(vec![Ok(Bytes::from_static(b"0123456789"))]).await;

        let err = store
            .upload("bucket", "k", body, options(4, 2), CancellationToken::new(), progress)
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::Upload(_)));
        assert_eq!(count(&log, "AbortMultipartUpload"), 1);
        assert_eq!(count(&log, "CompleteMultipartUpload"), 0);
    }

    #[tokio::test]
    async fn test_error_item_aborts_multipart() {
        let (store, log) = fake_s3(None, false);
        let (progress, _) = recorder();
        let body = stream_of(vec![
            Ok(Bytes::from_static(b"0123")),
            Ok(Bytes::from_static(b"4567")),
            Err(BackupError::Compression("xz encoder failed".to_string())),
        ])
        .await;

        let err = store
            .upload("bucket", "k", body, options(4, 2), CancellationToken::new(), progress)
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::Compression(_)));
        assert_eq!(count(&log, "AbortMultipartUpload"), 1);
        assert_eq!(count(&log, "CompleteMultipartUpload"), 0);
    }

    #[tokio::test]
    async fn test_parts_upload_while_stream_stays_open() {
        let (store, log) = fake_s3(None, false);
        let (progress, _) = recorder();
        let (tx, rx) = byte_pipe(4);
        tx.send(Ok(Bytes::from_static(b"01234567"))).await.unwrap();

        // The queue holds four parts; two must go out without waiting for more.
        let upload = tokio::spawn(async move {
            store
                .upload("bucket", "k", rx, options(4, 4), CancellationToken::new(), progress)
                .await
        });
        wait_for_parts(&log, 2).await;

        tx.send(Ok(Bytes::from_static(b"89"))).await.unwrap();
        drop(tx);
        let summary = upload.await.unwrap().unwrap();

        assert_eq!(summary.bytes, 10);
        assert_eq!(count(&log, "UploadPart"), 3);
        assert_eq!(count(&log, "CompleteMultipartUpload"), 1);
    }

    #[tokio::test]
    async fn test_cancel_aborts_multipart() {
        let (store, log) = fake_s3(None, false);
        let (progress, _) = recorder();
        let (tx, rx) = byte_pipe(4);
        tx.send(Ok(Bytes::from_static(b"01234567"))).await.unwrap();

        let cancel = CancellationToken::new();
        let upload = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                store
                    .upload("bucket", "k", rx, options(4, 4), cancel, progress)
                    .await
            })
        };
        wait_for_parts(&log, 1).await;

        cancel.cancel();
        let err = upload.await.unwrap().unwrap_err();

        assert!(err.is_cancellation());
        assert_eq!(count(&log, "AbortMultipartUpload"), 1);
        assert_eq!(count(&log, "CompleteMultipartUpload"), 0);
        drop(tx);
    }
}
