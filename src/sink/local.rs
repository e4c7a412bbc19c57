//! Local temp file sink
//!
//! Stages the stream into a uniquely named file under the configured
//! directory. The name embeds a UUID so concurrent uploads of the same
//! logical name never collide. Removal is best-effort; a leftover file is
//! logged, not escalated.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{Sink, SinkReport};
use crate::tee::{Feed, FeedReceiver};
use crate::upload::UploadError;

pub struct LocalFileSink {
    dir: PathBuf,
    path: Option<PathBuf>,
}

impl LocalFileSink {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            path: None,
        }
    }
}

#[async_trait]
impl Sink for LocalFileSink {
    fn kind(&self) -> &'static str {
        "local"
    }

    #[tracing::instrument(name = "sink.local.write", skip(self, feed), fields(dir = %self.dir.display()), err)]
    async fn write(&mut self, mut feed: FeedReceiver) -> Result<SinkReport, UploadError> {
        let path = self
            .dir
            .join(format!("filestage-{}.tmp", uuid::Uuid::new_v4()));

        let mut file = fs::File::create(&path).await?;
        // Record the path before the first byte lands so a failed write
        // still gets cleaned up.
        self.path = Some(path.clone());

        let mut bytes = 0u64;
        let mut ended = false;
        while let Some(msg) = feed.recv().await {
            match msg {
                Feed::Chunk(chunk) => {
                    file.write_all(&chunk).await?;
                    bytes += chunk.len() as u64;
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
        file.flush().await?;

        tracing::debug!(path = %path.display(), bytes, "staged upload to local file");

        Ok(SinkReport {
            bytes,
            local_path: Some(path),
            ..Default::default()
        })
    }

    async fn delete(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match fs::remove_file(&path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "removed staged file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove staged file");
            }
        }
    }
}
