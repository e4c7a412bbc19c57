//! Upload sinks
//!
//! A sink consumes one fan-out feed from the tee and persists it somewhere:
//! a local temp file, a presigned object-store URL (single PUT or multipart),
//! or a native cloud-storage client. Each sink owns its resource exclusively
//! and tracks whether it committed anything, so cleanup is a safe no-op when
//! nothing was written.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::tee::FeedReceiver;
use crate::upload::UploadError;

pub mod local;
pub mod multipart;
pub mod native;
pub mod presigned;

/// What a sink produced once its feed was drained.
#[derive(Debug, Clone, Default)]
pub struct SinkReport {
    /// Bytes this sink persisted.
    pub bytes: u64,
    /// ETag of the stored object, quotes stripped. Presigned sinks only.
    pub etag: Option<String>,
    /// Path of the staged file. Local sink only.
    pub local_path: Option<PathBuf>,
}

/// One destination of the upload fan-out.
#[async_trait]
pub trait Sink: Send {
    /// Short tag for logs and metrics.
    fn kind(&self) -> &'static str;

    /// Drain the feed, persisting every chunk in arrival order. A feed that
    /// closes without [`crate::tee::Feed::End`] was aborted upstream; the
    /// sink must not treat it as a complete object.
    async fn write(&mut self, feed: FeedReceiver) -> Result<SinkReport, UploadError>;

    /// Remove whatever this sink durably created. Best-effort: failures are
    /// logged, never propagated. Calling it without a prior write, or twice,
    /// is a no-op.
    async fn delete(&mut self);
}
