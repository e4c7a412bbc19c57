//! Presigned single-PUT sink
//!
//! Streams the feed as the body of one HTTP PUT against a presigned URL.
//! Content-Length is set when the declared size is known. Only a 200
//! response counts as success; its ETag (quotes stripped) is captured for
//! integrity verification by the orchestrator. Cleanup issues a DELETE
//! against the presigned delete URL.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use reqwest::header::{CONTENT_LENGTH, ETAG};
use reqwest::StatusCode;

use super::{Sink, SinkReport};
use crate::tee::{Feed, FeedReceiver};
use crate::upload::UploadError;

/// Time budget for a cleanup DELETE, independent of the upload deadline
/// (which may already have passed when cleanup runs).
const DELETE_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) fn strip_etag_quotes(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}

/// Adapts a sink feed into a request body stream, counting bytes on the way
/// through. Yields an error when the feed was aborted upstream so the HTTP
/// request fails instead of committing a truncated object.
pub(crate) struct FeedBody {
    feed: FeedReceiver,
    sent: Arc<AtomicU64>,
    ended: bool,
}

impl FeedBody {
    pub(crate) fn new(feed: FeedReceiver, sent: Arc<AtomicU64>) -> Self {
        Self {
            feed,
            sent,
            ended: false,
        }
    }
}

impl Stream for FeedBody {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.ended {
            return Poll::Ready(None);
        }
        match this.feed.poll_recv(cx) {
            Poll::Ready(Some(Feed::Chunk(chunk))) => {
                this.sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Feed::End)) => {
                this.ended = true;
                Poll::Ready(None)
            }
            Poll::Ready(None) => Poll::Ready(Some(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upload aborted before completion",
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct PresignedPutSink {
    client: reqwest::Client,
    put_url: String,
    delete_url: String,
    headers: HashMap<String, String>,
    declared_size: i64,
    timeout: Duration,
    committed: bool,
}

impl PresignedPutSink {
    pub fn new(
        client: reqwest::Client,
        put_url: String,
        delete_url: String,
        headers: HashMap<String, String>,
        declared_size: i64,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            put_url,
            delete_url,
            headers,
            declared_size,
            timeout,
            committed: false,
        }
    }
}

#[async_trait]
impl Sink for PresignedPutSink {
    fn kind(&self) -> &'static str {
        "presigned_put"
    }

    #[tracing::instrument(
        name = "sink.presigned_put.write",
        skip(self, feed),
        fields(declared_size = self.declared_size, etag = tracing::field::Empty, status = tracing::field::Empty),
        err
    )]
    async fn write(&mut self, feed: FeedReceiver) -> Result<SinkReport, UploadError> {
        let sent = Arc::new(AtomicU64::new(0));
        let body = FeedBody::new(feed, sent.clone());

        let mut req = self
            .client
            .put(&self.put_url)
            .timeout(self.timeout)
            .body(reqwest::Body::wrap_stream(body));
        if self.declared_size >= 0 {
            req = req.header(CONTENT_LENGTH, self.declared_size);
        }
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        // Bytes may land on the backend even when the request errors out, so
        // the object is up for deletion from here on.
        self.committed = true;

        let resp = req.send().await?;
        let status = resp.status();
        tracing::Span::current().record("status", status.as_u16());

        if status != StatusCode::OK {
            return Err(UploadError::StatusCode {
                status: status.as_u16(),
            });
        }

        let etag = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(strip_etag_quotes)
            .unwrap_or_default();
        tracing::Span::current().record("etag", etag.as_str());

        Ok(SinkReport {
            bytes: sent.load(Ordering::Relaxed),
            etag: Some(etag),
            ..Default::default()
        })
    }

    async fn delete(&mut self) {
        if !self.committed {
            return;
        }
        self.committed = false;

        if self.delete_url.is_empty() {
            tracing::warn!("no presigned delete URL, leaving remote object behind");
            return;
        }
        let res = self
            .client
            .delete(&self.delete_url)
            .timeout(DELETE_TIMEOUT)
            .send()
            .await;
        match res {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!("deleted remote object");
            }
            Ok(resp) => {
                tracing::warn!(status = resp.status().as_u16(), "remote object delete refused");
            }
            Err(err) => {
                tracing::warn!(error = %err, "remote object delete failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_quotes_are_stripped() {
        assert_eq!(strip_etag_quotes("\"abc123\""), "abc123");
        assert_eq!(strip_etag_quotes("abc123"), "abc123");
        assert_eq!(strip_etag_quotes(" \"abc123\" "), "abc123");
    }

    #[tokio::test]
    async fn aborted_feed_surfaces_as_body_error() {
        let (tx, rx) = crate::tee::feed();
        drop(tx);

        let mut body = FeedBody::new(rx, Arc::new(AtomicU64::new(0)));
        let item = futures::StreamExt::next(&mut body).await.unwrap();
        assert!(item.is_err());
    }

    #[tokio::test]
    async fn ended_feed_terminates_body() {
        use futures::StreamExt;

        let (tx, rx) = crate::tee::feed();
        tx.send(Feed::Chunk(Bytes::from_static(b"data")))
            .await
            .unwrap();
        tx.send(Feed::End).await.unwrap();

        let sent = Arc::new(AtomicU64::new(0));
        let mut body = FeedBody::new(rx, sent.clone());
        assert_eq!(body.next().await.unwrap().unwrap(), "data");
        assert!(body.next().await.is_none());
        assert_eq!(sent.load(Ordering::Relaxed), 4);
    }
}
