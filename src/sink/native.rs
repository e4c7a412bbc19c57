//! Native object-storage client sink
//!
//! Used when the caller supplies storage credentials instead of presigned
//! URLs. Provider `"AWS"` drives the AWS SDK directly (static credentials or
//! the default provider chain, custom endpoint with path-style addressing
//! for S3-compatible stores). Any other provider resolves a driver from the
//! storage URL scheme (`file://`, `s3://`, `az://`, ...); an unrecognized
//! provider or scheme never reaches the network.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::BytesMut;
use object_store::{MultipartUpload, ObjectStore, PutPayload};
use url::Url;

use super::{Sink, SinkReport};
use crate::config::{ConfigError, ObjectStorageConfig, S3Config, S3Credentials};
use crate::tee::{Feed, FeedReceiver};
use crate::upload::UploadError;

/// Part size used when chunking the stream through a native client.
const NATIVE_PART_SIZE: usize = 5 * 1024 * 1024;

const AWS_PROVIDER: &str = "AWS";

#[derive(Debug)]
pub enum NativeSink {
    S3(S3NativeSink),
    Url(UrlSink),
}

impl NativeSink {
    /// Resolve the provider once, at configuration-validation time.
    pub async fn new(
        config: &ObjectStorageConfig,
        object_id: &str,
        timeout: Duration,
    ) -> Result<Self, UploadError> {
        if config.provider == AWS_PROVIDER {
            let sink = S3NativeSink::new(
                &config.s3_credentials,
                &config.s3_config,
                object_id,
                timeout,
            )
            .await?;
            return Ok(Self::S3(sink));
        }
        if !config.url.is_empty() {
            return Ok(Self::Url(UrlSink::new(&config.url, object_id, timeout)?));
        }
        Err(ConfigError::UnsupportedProvider(config.provider.clone()).into())
    }
}

#[async_trait]
impl Sink for NativeSink {
    fn kind(&self) -> &'static str {
        match self {
            Self::S3(_) => "native_s3",
            Self::Url(_) => "native_url",
        }
    }

    async fn write(&mut self, feed: FeedReceiver) -> Result<SinkReport, UploadError> {
        match self {
            Self::S3(sink) => sink.write(feed).await,
            Self::Url(sink) => sink.write(feed).await,
        }
    }

    async fn delete(&mut self) {
        match self {
            Self::S3(sink) => sink.delete().await,
            Self::Url(sink) => sink.delete().await,
        }
    }
}

async fn with_timeout<T, E>(
    budget: Duration,
    op: &str,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, UploadError>
where
    E: std::fmt::Display,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(UploadError::Storage(format!("{op}: {err}"))),
        Err(_) => Err(UploadError::Storage(format!("{op}: deadline exceeded"))),
    }
}

/// AWS SDK sink: streams the feed through an SDK multipart upload.
#[derive(Debug)]
pub struct S3NativeSink {
    client: aws_sdk_s3::Client,
    bucket: String,
    key: String,
    timeout: Duration,
    /// Open multipart session. Lives on the sink, not in `write`, so a
    /// cancelled write still leaves something for `delete` to abort.
    session: Option<String>,
    committed: bool,
}

impl S3NativeSink {
    pub async fn new(
        credentials: &S3Credentials,
        config: &S3Config,
        key: &str,
        timeout: Duration,
    ) -> Result<Self, UploadError> {
        if config.bucket.is_empty() {
            return Err(ConfigError::ValidationError("S3 bucket is not configured".into()).into());
        }

        let region = if config.region.is_empty() {
            aws_sdk_s3::config::Region::from_static("us-east-1")
        } else {
            aws_sdk_s3::config::Region::new(config.region.clone())
        };
        let mut builder = if credentials.is_static() {
            let creds = aws_credential_types::Credentials::new(
                credentials.aws_access_key_id.clone(),
                credentials.aws_secret_access_key.clone(),
                credentials.aws_session_token.clone(),
                None,
                "filestage",
            );
            aws_sdk_s3::config::Builder::new()
                .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
                .region(region)
                .credentials_provider(creds)
        } else {
            let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(region)
                .load()
                .await;
            aws_sdk_s3::config::Builder::from(&shared)
        };
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        } else if config.path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            key: key.to_string(),
            timeout,
            session: None,
            committed: false,
        })
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        number: i32,
        body: bytes::Bytes,
    ) -> Result<CompletedPart, UploadError> {
        let out = with_timeout(
            self.timeout,
            "UploadPart",
            self.client
                .upload_part()
                .bucket(&self.bucket)
                .key(&self.key)
                .upload_id(upload_id)
                .part_number(number)
                .body(ByteStream::from(body))
                .send(),
        )
        .await?;

        Ok(CompletedPart::builder()
            .part_number(number)
            .set_e_tag(out.e_tag().map(str::to_string))
            .build())
    }

    async fn abort(&self, upload_id: &str) {
        let res = with_timeout(
            self.timeout.min(Duration::from_secs(60)),
            "AbortMultipartUpload",
            self.client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&self.key)
                .upload_id(upload_id)
                .send(),
        )
        .await;
        if let Err(err) = res {
            tracing::warn!(key = %self.key, error = %err, "failed to abort S3 multipart upload");
        }
    }

    async fn abort_open_session(&mut self) {
        if let Some(upload_id) = self.session.take() {
            self.abort(&upload_id).await;
        }
    }

    async fn write(&mut self, mut feed: FeedReceiver) -> Result<SinkReport, UploadError> {
        let created = with_timeout(
            self.timeout,
            "CreateMultipartUpload",
            self.client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(&self.key)
                .send(),
        )
        .await?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| UploadError::Storage("CreateMultipartUpload returned no upload id".into()))?
            .to_string();
        self.session = Some(upload_id.clone());

        match self.stream_parts(&mut feed, &upload_id).await {
            Ok(report) => {
                self.session = None;
                self.committed = true;
                Ok(report)
            }
            Err(err) => {
                self.abort_open_session().await;
                Err(err)
            }
        }
    }

    async fn stream_parts(
        &self,
        feed: &mut FeedReceiver,
        upload_id: &str,
    ) -> Result<SinkReport, UploadError> {
        let mut parts: Vec<CompletedPart> = Vec::new();
        let mut buf = BytesMut::with_capacity(crate::pool::CHUNK_SIZE * 2);
        let mut bytes = 0u64;
        let mut ended = false;

        while let Some(msg) = feed.recv().await {
            match msg {
                Feed::Chunk(chunk) => {
                    bytes += chunk.len() as u64;
                    buf.extend_from_slice(&chunk);
                    while buf.len() >= NATIVE_PART_SIZE {
                        let body = buf.split_to(NATIVE_PART_SIZE).freeze();
                        let number = parts.len() as i32 + 1;
                        parts.push(self.upload_part(upload_id, number, body).await?);
                    }
                }
                Feed::End => {
                    ended = true;
                    break;
                }
            }
        }
        if !ended {
            return Err(UploadError::Aborted);
        }

        if !buf.is_empty() || parts.is_empty() {
            let number = parts.len() as i32 + 1;
            parts.push(self.upload_part(upload_id, number, buf.split().freeze()).await?);
        }
        crate::metrics::record_multipart_parts(parts.len());

        with_timeout(
            self.timeout,
            "CompleteMultipartUpload",
            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(&self.key)
                .upload_id(upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send(),
        )
        .await?;

        Ok(SinkReport {
            bytes,
            ..Default::default()
        })
    }

    async fn delete(&mut self) {
        // A write future dropped mid-stream leaves its session behind.
        self.abort_open_session().await;

        if !self.committed {
            return;
        }
        self.committed = false;

        let res = with_timeout(
            Duration::from_secs(60),
            "DeleteObject",
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .send(),
        )
        .await;
        match res {
            Ok(_) => tracing::debug!(key = %self.key, "deleted staged S3 object"),
            Err(err) => tracing::warn!(key = %self.key, error = %err, "failed to delete staged S3 object"),
        }
    }
}

/// Scheme-dispatched sink backed by an `object_store` driver.
#[derive(Debug)]
pub struct UrlSink {
    store: Box<dyn ObjectStore>,
    path: object_store::path::Path,
    timeout: Duration,
    /// In-progress driver upload. Lives on the sink, not in `write`, so a
    /// cancelled write still leaves something for `delete` to abort.
    upload: Option<Box<dyn MultipartUpload>>,
    committed: bool,
}

impl UrlSink {
    pub fn new(base_url: &str, object_id: &str, timeout: Duration) -> Result<Self, UploadError> {
        let url = Url::parse(base_url).map_err(|err| {
            ConfigError::ValidationError(format!("invalid storage URL {base_url:?}: {err}"))
        })?;
        let scheme = url.scheme().to_string();
        let (store, base) =
            object_store::parse_url(&url).map_err(|_| ConfigError::UnsupportedScheme(scheme))?;

        let path = if base.as_ref().is_empty() {
            object_store::path::Path::from(object_id)
        } else {
            object_store::path::Path::from(format!("{}/{}", base.as_ref(), object_id))
        };

        Ok(Self {
            store,
            path,
            timeout,
            upload: None,
            committed: false,
        })
    }

    async fn abort_open_upload(&mut self) {
        let Some(mut upload) = self.upload.take() else {
            return;
        };
        if let Err(err) = upload.abort().await {
            tracing::warn!(path = %self.path, error = %err, "failed to abort driver upload");
        }
    }

    async fn write(&mut self, mut feed: FeedReceiver) -> Result<SinkReport, UploadError> {
        let started = with_timeout(
            self.timeout,
            "put_multipart",
            self.store.put_multipart(&self.path),
        )
        .await?;
        let upload = self.upload.insert(started);

        match Self::stream_parts(upload.as_mut(), &mut feed, self.timeout).await {
            Ok(report) => {
                self.upload = None;
                self.committed = true;
                Ok(report)
            }
            Err(err) => {
                self.abort_open_upload().await;
                Err(err)
            }
        }
    }

    async fn stream_parts(
        upload: &mut dyn MultipartUpload,
        feed: &mut FeedReceiver,
        budget: Duration,
    ) -> Result<SinkReport, UploadError> {
        let mut buf = BytesMut::with_capacity(crate::pool::CHUNK_SIZE * 2);
        let mut bytes = 0u64;
        let mut ended = false;

        while let Some(msg) = feed.recv().await {
            match msg {
                Feed::Chunk(chunk) => {
                    bytes += chunk.len() as u64;
                    buf.extend_from_slice(&chunk);
                    while buf.len() >= NATIVE_PART_SIZE {
                        let part = buf.split_to(NATIVE_PART_SIZE).freeze();
                        with_timeout(budget, "put_part", upload.put_part(PutPayload::from(part)))
                            .await?;
                    }
                }
                Feed::End => {
                    ended = true;
                    break;
                }
            }
        }
        if !ended {
            return Err(UploadError::Aborted);
        }

        if !buf.is_empty() || bytes == 0 {
            with_timeout(
                budget,
                "put_part",
                upload.put_part(PutPayload::from(buf.split().freeze())),
            )
            .await?;
        }

        with_timeout(budget, "complete", upload.complete())
            .await?;

        Ok(SinkReport {
            bytes,
            ..Default::default()
        })
    }

    async fn delete(&mut self) {
        self.abort_open_upload().await;

        if !self.committed {
            return;
        }
        self.committed = false;

        match self.store.delete(&self.path).await {
            Ok(()) => tracing::debug!(path = %self.path, "deleted staged object"),
            Err(object_store::Error::NotFound { .. }) => {}
            Err(err) => {
                tracing::warn!(path = %self.path, error = %err, "failed to delete staged object");
            }
        }
    }
}
