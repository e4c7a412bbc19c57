//! Metrics module
//!
//! Prometheus counters and histograms for the upload pipeline. Registered on
//! the default registry; the embedding service decides how to expose them.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Histogram, HistogramVec,
};

lazy_static! {
    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "filestage_uploads_total",
        "Total number of uploads",
        &["mode", "status"]
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "filestage_upload_bytes_total",
        "Total bytes staged"
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "filestage_upload_duration_seconds",
        "Upload duration in seconds",
        &["mode"],
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0, 300.0]
    ).unwrap();

    // Multipart metrics
    pub static ref MULTIPART_PARTS: Histogram = register_histogram!(
        "filestage_multipart_parts",
        "Number of parts per multipart upload",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]
    ).unwrap();

    // Cleanup metrics
    pub static ref CLEANUPS_TOTAL: CounterVec = register_counter_vec!(
        "filestage_cleanups_total",
        "Asynchronous cleanup runs",
        &["trigger"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "filestage_errors_total",
        "Total upload errors",
        &["type"]
    ).unwrap();
}

/// Record a successful upload
pub fn record_upload_success(mode: &str, bytes: u64) {
    UPLOADS_TOTAL.with_label_values(&[mode, "success"]).inc();
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record a failed upload
pub fn record_upload_failure(mode: &str, error_kind: &str) {
    UPLOADS_TOTAL.with_label_values(&[mode, "failure"]).inc();
    ERRORS_TOTAL.with_label_values(&[error_kind]).inc();
}

/// Record upload duration
pub fn record_upload_duration(mode: &str, duration_secs: f64) {
    UPLOAD_DURATION
        .with_label_values(&[mode])
        .observe(duration_secs);
}

/// Record the part count of a completed multipart upload
pub fn record_multipart_parts(parts: usize) {
    MULTIPART_PARTS.observe(parts as f64);
}

/// Record an asynchronous cleanup run
pub fn record_cleanup(trigger: &str) {
    CLEANUPS_TOTAL.with_label_values(&[trigger]).inc();
}
