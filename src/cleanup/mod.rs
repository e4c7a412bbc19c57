//! Asynchronous cleanup coordinator
//!
//! Staged artifacts (local temp file, remote temp object, multipart session)
//! are deleted off the caller's critical path. A failed upload is torn down
//! immediately; a successful one keeps its artifacts alive until the
//! caller's scope ends, giving the consumer time to move them. The teardown
//! runs on a detached task with its own bounded lifetime, so it survives the
//! cancellation that triggered it.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_OBJECT_STORE_TIMEOUT;
use crate::metrics;
use crate::sink::Sink;

/// Upper bound on one teardown run.
const CLEANUP_DEADLINE: Duration = DEFAULT_OBJECT_STORE_TIMEOUT;

/// Tear the sinks down now. Used when the upload failed and nothing
/// downstream will ever look at the staged artifacts.
pub fn spawn_immediate(sinks: Vec<Box<dyn Sink>>) {
    if sinks.is_empty() {
        return;
    }
    tokio::spawn(async move {
        metrics::record_cleanup("failure");
        run(sinks).await;
    });
}

/// Tear the sinks down once `scope` is cancelled. Used after a successful
/// upload: the artifacts stay readable until the caller's scope ends.
pub fn spawn_on_cancel(scope: CancellationToken, sinks: Vec<Box<dyn Sink>>) {
    if sinks.is_empty() {
        return;
    }
    tokio::spawn(async move {
        scope.cancelled().await;
        metrics::record_cleanup("scope_end");
        run(sinks).await;
    });
}

async fn run(mut sinks: Vec<Box<dyn Sink>>) {
    // Each sink owns a disjoint resource, so the deletes can overlap.
    let teardown = futures::future::join_all(sinks.iter_mut().map(|sink| sink.delete()));
    if tokio::time::timeout(CLEANUP_DEADLINE, teardown).await.is_err() {
        tracing::warn!("cleanup deadline exceeded, leaving artifacts behind");
    }
}
