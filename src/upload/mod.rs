//! Upload orchestrator
//!
//! Drives one upload end to end: resolves the destination mode, builds the
//! sinks, fans the source stream out through the digest tee, collects the
//! sink reports, and hands staged artifacts to the cleanup coordinator. The
//! source is read exactly once regardless of how many destinations are
//! active.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::cleanup;
use crate::config::{ConfigError, RemoteMode, UploadOpts};
use crate::digest::HashSummary;
use crate::metrics;
use crate::sink::local::LocalFileSink;
use crate::sink::multipart::PresignedMultipartSink;
use crate::sink::native::NativeSink;
use crate::sink::presigned::PresignedPutSink;
use crate::sink::{Sink, SinkReport};
use crate::tee::{self, Tee};

pub mod finalize;

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    /// The stream exceeded `maximum_size`, either up front by declared size
    /// or mid-stream by observed bytes.
    #[error("entity is too large")]
    EntityTooLarge,

    #[error("expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: i64, actual: u64 },

    #[error("unexpected response status: {status}")]
    StatusCode { status: u16 },

    /// The backend stored different bytes than the ones hashed locally.
    #[error("ETag mismatch: expected {expected}, got {actual}")]
    ETagMismatch { expected: String, actual: String },

    #[error("ran out of presigned part URLs")]
    NotEnoughParts,

    #[error("multipart upload error: {0}")]
    Multipart(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage client error: {0}")]
    Storage(String),

    #[error("upload cancelled")]
    Cancelled,

    /// The feed closed before the end marker; another party failed first and
    /// carries the interesting error.
    #[error("upload aborted before completion")]
    Aborted,

    /// A sink dropped its feed mid-stream; the sink's own result carries the
    /// interesting error.
    #[error("a sink stopped consuming the stream")]
    SinkStopped,
}

impl UploadError {
    /// Stable tag for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EntityTooLarge => "entity_too_large",
            Self::SizeMismatch { .. } => "size_mismatch",
            Self::StatusCode { .. } => "status_code",
            Self::ETagMismatch { .. } => "etag_mismatch",
            Self::NotEnoughParts => "not_enough_parts",
            Self::Multipart(_) => "multipart",
            Self::Config(_) => "config",
            Self::Transport(_) => "transport",
            Self::Io(_) => "io",
            Self::Storage(_) => "storage",
            Self::Cancelled => "cancelled",
            Self::Aborted => "aborted",
            Self::SinkStopped => "sink_stopped",
        }
    }

    /// Precedence when pump and sinks fail concurrently. Size-policy
    /// violations outrank the secondary transport failures they provoke;
    /// marker errors lose to everything else.
    fn rank(&self) -> u8 {
        match self {
            Self::EntityTooLarge | Self::SizeMismatch { .. } | Self::NotEnoughParts => 4,
            Self::Cancelled => 2,
            Self::Aborted | Self::SinkStopped => 1,
            _ => 3,
        }
    }
}

/// Keep the more interesting of two concurrent failures.
fn prefer(current: UploadError, candidate: UploadError) -> UploadError {
    if candidate.rank() > current.rank() {
        candidate
    } else {
        current
    }
}

/// A staged upload: where the bytes landed plus their digests.
#[derive(Debug, Clone)]
pub struct FileHandle {
    /// Client-supplied name, informational only.
    pub name: String,
    /// Path of the staged local file, when the local sink was active.
    pub local_path: Option<PathBuf>,
    /// URL of the final remote object, when a remote sink was active.
    pub remote_url: String,
    /// Logical identifier of the remote object.
    pub remote_id: String,
    /// Observed stream length in bytes.
    pub size: u64,
    pub hashes: HashSummary,
    /// ETag reported by the backend for presigned uploads.
    pub etag: Option<String>,
    pub upload_duration: Duration,
}

impl FileHandle {
    pub fn md5(&self) -> Option<&str> {
        self.hashes.get("md5")
    }

    pub fn sha1(&self) -> Option<&str> {
        self.hashes.get("sha1")
    }

    pub fn sha256(&self) -> Option<&str> {
        self.hashes.get("sha256")
    }

    pub fn sha512(&self) -> Option<&str> {
        self.hashes.get("sha512")
    }
}

fn mode_label(mode: RemoteMode, local: bool) -> &'static str {
    match mode {
        RemoteMode::None if local => "local",
        RemoteMode::None => "none",
        RemoteMode::SingleShot => "single_shot",
        RemoteMode::Multipart => "multipart",
        RemoteMode::Native => "native",
    }
}

/// Stage one upload stream into its configured destinations.
///
/// Reads `reader` once to completion, hashing as it goes, and writes the
/// same bytes to every destination `opts` enables. `size < 0` means the
/// length is unknown up front. Cancelling `ctx` aborts the upload; staged
/// artifacts are deleted asynchronously on failure, and on success once
/// `ctx` is cancelled by the caller's scope ending.
#[tracing::instrument(
    name = "upload",
    skip(ctx, reader, opts),
    fields(name = %name, declared = size, mode = tracing::field::Empty),
    err
)]
pub async fn upload(
    ctx: CancellationToken,
    reader: impl AsyncRead + Send + Unpin,
    size: i64,
    name: &str,
    opts: UploadOpts,
) -> Result<FileHandle, UploadError> {
    let started = Instant::now();
    let mode = match opts.remote_mode() {
        Ok(mode) => mode,
        Err(err) => {
            metrics::record_upload_failure("invalid", "config");
            return Err(err.into());
        }
    };
    let label = mode_label(mode, opts.is_local());
    tracing::Span::current().record("mode", label);

    let result = run(ctx, reader, size, name, &opts, mode).await;
    match &result {
        Ok(handle) => {
            metrics::record_upload_success(label, handle.size);
            metrics::record_upload_duration(label, started.elapsed().as_secs_f64());
            tracing::info!(
                size = handle.size,
                local = handle.local_path.is_some(),
                "upload staged"
            );
        }
        Err(err) => {
            metrics::record_upload_failure(label, err.kind());
        }
    }
    result
}

async fn run(
    ctx: CancellationToken,
    reader: impl AsyncRead + Send + Unpin,
    size: i64,
    name: &str,
    opts: &UploadOpts,
    mode: RemoteMode,
) -> Result<FileHandle, UploadError> {
    if opts.maximum_size > 0 && size > opts.maximum_size {
        return Err(UploadError::EntityTooLarge);
    }

    let started = Instant::now();
    let timeout = opts.timeout();
    let mut sinks: Vec<Box<dyn Sink>> = Vec::new();

    if let Some(dir) = &opts.local_temp_dir {
        sinks.push(Box::new(LocalFileSink::new(dir)));
    }
    match mode {
        RemoteMode::None => {}
        RemoteMode::SingleShot => {
            let client = reqwest::Client::builder().build()?;
            sinks.push(Box::new(PresignedPutSink::new(
                client,
                opts.presigned_put.clone(),
                opts.presigned_delete.clone(),
                opts.put_headers.clone(),
                size,
                timeout,
            )));
        }
        RemoteMode::Multipart => {
            let client = reqwest::Client::builder().build()?;
            sinks.push(Box::new(PresignedMultipartSink::new(
                client,
                opts.presigned_parts.clone(),
                opts.part_size as u64,
                opts.presigned_complete_multipart.clone(),
                opts.presigned_abort_multipart.clone(),
                opts.presigned_delete.clone(),
                opts.put_headers.clone(),
                timeout,
            )));
        }
        RemoteMode::Native => {
            let sink =
                NativeSink::new(&opts.storage_config, &opts.remote_temp_object_id, timeout).await?;
            sinks.push(Box::new(sink));
        }
    }

    // Cancels the sink side as a unit when the pump fails, without touching
    // the caller's token.
    let sink_cancel = ctx.child_token();
    let mut senders = Vec::with_capacity(sinks.len());
    let mut tasks = Vec::with_capacity(sinks.len());
    for mut sink in sinks {
        let (tx, rx) = tee::feed();
        senders.push(tx);
        let cancel = sink_cancel.clone();
        tasks.push(tokio::spawn(async move {
            let result = tokio::select! {
                res = sink.write(rx) => res,
                _ = cancel.cancelled() => Err(UploadError::Cancelled),
            };
            (sink, result)
        }));
    }

    let pump_result = Tee::new(size, opts.maximum_size)
        .pump(reader, &senders, &ctx)
        .await;
    drop(senders);
    if pump_result.is_err() {
        sink_cancel.cancel();
    }

    let mut sinks = Vec::with_capacity(tasks.len());
    let mut reports: Vec<(&'static str, SinkReport)> = Vec::new();
    let mut sink_error: Option<UploadError> = None;
    for task in tasks {
        match task.await {
            Ok((sink, Ok(report))) => {
                reports.push((sink.kind(), report));
                sinks.push(sink);
            }
            Ok((sink, Err(err))) => {
                tracing::warn!(sink = sink.kind(), error = %err, "sink failed");
                let err = match sink_error.take() {
                    Some(current) => prefer(current, err),
                    None => err,
                };
                sink_error = Some(err);
                sinks.push(sink);
            }
            Err(join_err) => {
                let err = UploadError::Io(std::io::Error::other(join_err));
                sink_error = Some(match sink_error.take() {
                    Some(current) => prefer(current, err),
                    None => err,
                });
            }
        }
    }

    let hashes = match pump_result {
        Ok(hashes) => match sink_error {
            None => hashes,
            Some(err) => {
                cleanup::spawn_immediate(sinks);
                return Err(err);
            }
        },
        Err(pump_err) => {
            let err = match sink_error {
                Some(sink_err) => prefer(pump_err, sink_err),
                None => pump_err,
            };
            cleanup::spawn_immediate(sinks);
            return Err(err);
        }
    };

    let mut local_path = None;
    let mut etag = None;
    for (_, report) in &reports {
        if report.local_path.is_some() {
            local_path = report.local_path.clone();
        }
        if let Some(value) = report.etag.as_deref().filter(|v| !v.is_empty()) {
            etag = Some(value.to_string());
        }
    }

    #[cfg(not(feature = "fips"))]
    if matches!(mode, RemoteMode::SingleShot | RemoteMode::Multipart) {
        if let (Some(etag), Some(md5)) = (etag.as_deref(), hashes.get("md5")) {
            if !etag.eq_ignore_ascii_case(md5) {
                cleanup::spawn_immediate(sinks);
                return Err(UploadError::ETagMismatch {
                    expected: md5.to_string(),
                    actual: etag.to_string(),
                });
            }
        }
    }

    // Staged artifacts outlive the call; they are torn down when the
    // caller's scope ends, after the consumer had a chance to move them.
    cleanup::spawn_on_cancel(ctx, sinks);

    Ok(FileHandle {
        name: name.to_string(),
        local_path,
        remote_url: opts.remote_url.clone(),
        remote_id: opts.remote_id.clone(),
        size: hashes.count(),
        hashes,
        etag,
        upload_duration: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_class_errors_outrank_transport() {
        let kept = prefer(UploadError::SinkStopped, UploadError::EntityTooLarge);
        assert!(matches!(kept, UploadError::EntityTooLarge));

        let kept = prefer(
            UploadError::SizeMismatch {
                expected: 10,
                actual: 7,
            },
            UploadError::StatusCode { status: 500 },
        );
        assert!(matches!(kept, UploadError::SizeMismatch { .. }));
    }

    #[test]
    fn first_error_wins_at_equal_rank() {
        let kept = prefer(
            UploadError::StatusCode { status: 500 },
            UploadError::Multipart("late".into()),
        );
        assert!(matches!(kept, UploadError::StatusCode { status: 500 }));
    }

    #[test]
    fn mode_labels_distinguish_zero_destination_uploads() {
        assert_eq!(mode_label(RemoteMode::None, true), "local");
        assert_eq!(mode_label(RemoteMode::None, false), "none");
        assert_eq!(mode_label(RemoteMode::Multipart, true), "multipart");
    }

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(UploadError::EntityTooLarge.kind(), "entity_too_large");
        assert_eq!(UploadError::Cancelled.kind(), "cancelled");
        assert_eq!(
            UploadError::Config(ConfigError::ConflictingModes).kind(),
            "config"
        );
    }
}
