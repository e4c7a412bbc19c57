//! Single-pass stream tee
//!
//! The tee is the only reader of the caller's stream. It drains the source
//! once, updates the running digests, enforces the size policy, and
//! broadcasts each chunk to every active sink over a bounded channel. Sinks
//! see the same bytes in the same order; a slow sink stalls the pump through
//! channel back-pressure rather than forcing a second read of the source.
//!
//! A feed that closes without a [`Feed::End`] marker was aborted: the sink
//! must not commit what it has and reports [`UploadError::Aborted`].

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::digest::{HashSummary, MultiHash};
use crate::pool::{BufferPool, CHUNK_BUFFERS, CHUNK_SIZE};
use crate::upload::UploadError;

/// Chunks buffered per sink before the pump blocks.
pub const FEED_DEPTH: usize = 8;

/// One message on a sink feed.
#[derive(Debug, Clone)]
pub enum Feed {
    Chunk(Bytes),
    /// The source drained cleanly and passed the size checks.
    End,
}

pub type FeedSender = mpsc::Sender<Feed>;
pub type FeedReceiver = mpsc::Receiver<Feed>;

/// Create one sink feed.
pub fn feed() -> (FeedSender, FeedReceiver) {
    mpsc::channel(FEED_DEPTH)
}

/// Digest tee with an inline size guard.
pub struct Tee {
    hash: MultiHash,
    declared: i64,
    max_bytes: Option<u64>,
}

impl Tee {
    /// `declared < 0` means the size is unknown; `maximum_size <= 0`
    /// disables the limit.
    pub fn new(declared: i64, maximum_size: i64) -> Self {
        Self {
            hash: MultiHash::new(),
            declared,
            max_bytes: (maximum_size > 0).then_some(maximum_size as u64),
        }
    }

    /// Drain `reader` exactly once, hashing and fanning out as bytes arrive.
    ///
    /// Fails with [`UploadError::EntityTooLarge`] the moment observed bytes
    /// exceed the limit, with [`UploadError::SizeMismatch`] when the drained
    /// stream disagrees with a known declared size, with
    /// [`UploadError::Cancelled`] when the caller's scope ends mid-stream,
    /// and with [`UploadError::SinkStopped`] when a sink drops its feed (the
    /// sink's own error is the interesting one then). On success every sink
    /// has received [`Feed::End`] and the frozen digests are returned.
    pub async fn pump<R>(
        mut self,
        mut reader: R,
        outputs: &[FeedSender],
        cancel: &CancellationToken,
    ) -> Result<HashSummary, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        let pool: &BufferPool = &CHUNK_BUFFERS;
        let mut buf = pool.checkout();
        buf.resize(CHUNK_SIZE, 0);

        let result = self.pump_inner(&mut reader, &mut buf, outputs, cancel).await;
        pool.give_back(buf);
        result
    }

    async fn pump_inner<R>(
        &mut self,
        reader: &mut R,
        buf: &mut [u8],
        outputs: &[FeedSender],
        cancel: &CancellationToken,
    ) -> Result<HashSummary, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                read = reader.read(buf) => read?,
            };
            if n == 0 {
                break;
            }

            self.hash.update(&buf[..n]);
            if let Some(max) = self.max_bytes {
                if self.hash.count() > max {
                    return Err(UploadError::EntityTooLarge);
                }
            }

            let chunk = Bytes::copy_from_slice(&buf[..n]);
            for tx in outputs {
                if tx.send(Feed::Chunk(chunk.clone())).await.is_err() {
                    return Err(UploadError::SinkStopped);
                }
            }
        }

        if self.declared >= 0 && self.hash.count() != self.declared as u64 {
            return Err(UploadError::SizeMismatch {
                expected: self.declared,
                actual: self.hash.count(),
            });
        }

        for tx in outputs {
            if tx.send(Feed::End).await.is_err() {
                return Err(UploadError::SinkStopped);
            }
        }

        Ok(std::mem::take(&mut self.hash).finalize())
    }
}
