//! Presigned multipart sink
//!
//! Splits the feed into sequential parts of `part_size` bytes (the last part
//! may be shorter), PUTs each part to its presigned URL in order, then POSTs
//! the collected part ETags to the complete URL. Some S3-compatible backends
//! answer the complete call with HTTP 200 and an error document in the body,
//! so the body is inspected even on success. On failure the multipart
//! session is released through the presigned abort URL; a completed object
//! is removed through the presigned delete URL.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::presigned::strip_etag_quotes;
use super::{Sink, SinkReport};
use crate::tee::{Feed, FeedReceiver};
use crate::upload::UploadError;

/// Time budget for cleanup calls, independent of the upload deadline.
const CLEANUP_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUpload {
    #[serde(rename = "Part")]
    parts: Vec<CompletedPart>,
}

#[derive(Debug, Clone, Serialize)]
struct CompletedPart {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: String,
}

/// Error document some backends embed in a 200 response body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CompleteMultipartError {
    code: String,
    message: String,
}

/// Success document of the complete call. The ETag identifies the assembled
/// object and feeds the orchestrator's integrity check.
#[derive(Debug, Deserialize)]
struct CompleteMultipartResult {
    #[serde(rename = "ETag", default)]
    etag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MultipartState {
    Clean,
    /// Session opened on the backend, object not assembled yet.
    InFlight,
    /// Complete call succeeded, the object exists.
    Completed,
}

pub struct PresignedMultipartSink {
    client: reqwest::Client,
    part_urls: Vec<String>,
    part_size: u64,
    complete_url: String,
    abort_url: String,
    delete_url: String,
    headers: HashMap<String, String>,
    timeout: Duration,
    state: MultipartState,
}

impl PresignedMultipartSink {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: reqwest::Client,
        part_urls: Vec<String>,
        part_size: u64,
        complete_url: String,
        abort_url: String,
        delete_url: String,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            part_urls,
            part_size,
            complete_url,
            abort_url,
            delete_url,
            headers,
            timeout,
            state: MultipartState::Clean,
        }
    }

    async fn put_part(&mut self, number: u32, body: Bytes) -> Result<CompletedPart, UploadError> {
        let url = self
            .part_urls
            .get((number - 1) as usize)
            .ok_or(UploadError::NotEnoughParts)?;

        let mut req = self
            .client
            .put(url)
            .timeout(self.timeout)
            .body(body.clone());
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        self.state = MultipartState::InFlight;
        let resp = req.send().await?;
        if resp.status() != StatusCode::OK {
            return Err(UploadError::StatusCode {
                status: resp.status().as_u16(),
            });
        }

        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(strip_etag_quotes)
            .unwrap_or_default();
        tracing::debug!(part = number, bytes = body.len(), etag = %etag, "uploaded part");

        Ok(CompletedPart {
            part_number: number,
            etag,
        })
    }

    async fn complete(&mut self, parts: Vec<CompletedPart>) -> Result<Option<String>, UploadError> {
        let payload = CompleteMultipartUpload { parts };
        let body = quick_xml::se::to_string(&payload)
            .map_err(|err| UploadError::Multipart(format!("encoding complete request: {err}")))?;

        let resp = self
            .client
            .post(&self.complete_url)
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(body)
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(UploadError::StatusCode {
                status: resp.status().as_u16(),
            });
        }

        // A 200 can still carry an error document.
        let text = resp.text().await?;
        if let Ok(err) = quick_xml::de::from_str::<CompleteMultipartError>(&text) {
            return Err(UploadError::Multipart(format!(
                "CompleteMultipartUpload remote error: {}: {}",
                err.code, err.message
            )));
        }
        let etag = quick_xml::de::from_str::<CompleteMultipartResult>(&text)
            .ok()
            .and_then(|result| result.etag)
            .map(|raw| strip_etag_quotes(&raw))
            .filter(|etag| !etag.is_empty());

        self.state = MultipartState::Completed;
        Ok(etag)
    }

    async fn best_effort(&self, action: &'static str, url: &str) {
        if url.is_empty() {
            tracing::warn!(action, "no presigned cleanup URL configured");
            return;
        }
        let res = self
            .client
            .delete(url)
            .timeout(CLEANUP_CALL_TIMEOUT)
            .send()
            .await;
        match res {
            Ok(resp) if resp.status().is_success() => tracing::debug!(action, "multipart cleanup done"),
            Ok(resp) => {
                tracing::warn!(action, status = resp.status().as_u16(), "multipart cleanup refused");
            }
            Err(err) => tracing::warn!(action, error = %err, "multipart cleanup failed"),
        }
    }
}

#[async_trait]
impl Sink for PresignedMultipartSink {
    fn kind(&self) -> &'static str {
        "presigned_multipart"
    }

    #[tracing::instrument(
        name = "sink.presigned_multipart.write",
        skip(self, feed),
        fields(part_size = self.part_size, parts = tracing::field::Empty),
        err
    )]
    async fn write(&mut self, mut feed: FeedReceiver) -> Result<SinkReport, UploadError> {
        let part_size = self.part_size as usize;
        let mut parts: Vec<CompletedPart> = Vec::new();
        let mut buf = BytesMut::with_capacity(part_size.min(crate::pool::CHUNK_SIZE * 2));
        let mut bytes = 0u64;
        let mut ended = false;

        while let Some(msg) = feed.recv().await {
            match msg {
                Feed::Chunk(chunk) => {
                    bytes += chunk.len() as u64;
                    buf.extend_from_slice(&chunk);
                    while buf.len() >= part_size {
                        let body = buf.split_to(part_size).freeze();
                        let number = parts.len() as u32 + 1;
                        let part = self.put_part(number, body).await?;
                        parts.push(part);
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
            let number = parts.len() as u32 + 1;
            let part = self.put_part(number, buf.split().freeze()).await?;
            parts.push(part);
        }

        tracing::Span::current().record("parts", parts.len());
        crate::metrics::record_multipart_parts(parts.len());

        let etag = self.complete(parts.clone()).await?;
        tracing::debug!(parts = parts.len(), bytes, "multipart upload completed");

        Ok(SinkReport {
            bytes,
            etag,
            ..Default::default()
        })
    }

    async fn delete(&mut self) {
        match self.state {
            MultipartState::Clean => {}
            MultipartState::InFlight => {
                // Release the server-side session, then remove any object the
                // backend may have assembled anyway.
                self.best_effort("abort", &self.abort_url).await;
                self.best_effort("delete", &self.delete_url).await;
            }
            MultipartState::Completed => {
                self.best_effort("delete", &self.delete_url).await;
            }
        }
        self.state = MultipartState::Clean;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_body_lists_parts_in_order() {
        let payload = CompleteMultipartUpload {
            parts: vec![
                CompletedPart {
                    part_number: 1,
                    etag: "etag-1".into(),
                },
                CompletedPart {
                    part_number: 2,
                    etag: "etag-2".into(),
                },
            ],
        };
        let xml = quick_xml::se::to_string(&payload).unwrap();
        assert!(xml.starts_with("<CompleteMultipartUpload>"));
        let first = xml.find("etag-1").unwrap();
        let second = xml.find("etag-2").unwrap();
        assert!(first < second);
        assert!(xml.contains("<PartNumber>1</PartNumber>"));
    }

    #[test]
    fn complete_result_etag_is_extracted() {
        let body = r#"<CompleteMultipartUploadResult><ETag>"25f9e794323b453885f5181f1b624d0b"</ETag></CompleteMultipartUploadResult>"#;
        let result = quick_xml::de::from_str::<CompleteMultipartResult>(body).unwrap();
        assert_eq!(
            result.etag.as_deref().map(strip_etag_quotes).as_deref(),
            Some("25f9e794323b453885f5181f1b624d0b")
        );

        let bare = "<CompleteMultipartUploadResult></CompleteMultipartUploadResult>";
        let result = quick_xml::de::from_str::<CompleteMultipartResult>(bare).unwrap();
        assert_eq!(result.etag, None);
    }

    #[test]
    fn embedded_error_document_is_detected() {
        let body = r#"<Error><Code>InternalError</Code><Message>We encountered an internal error</Message></Error>"#;
        let err = quick_xml::de::from_str::<CompleteMultipartError>(body).unwrap();
        assert_eq!(err.code, "InternalError");

        let ok = r#"<CompleteMultipartUploadResult><ETag>"abc"</ETag></CompleteMultipartUploadResult>"#;
        assert!(quick_xml::de::from_str::<CompleteMultipartError>(ok).is_err());
    }
}
