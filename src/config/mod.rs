//! Upload destination configuration
//!
//! `UploadOpts` describes where one upload goes. It is produced by the
//! authorizing application (delivered as JSON alongside the request) and is
//! immutable for the duration of the call. Validation resolves the remote
//! destination to exactly one mode; conflicting modes are rejected before any
//! byte is read.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Timeout applied to outbound object-store calls when the caller supplies
/// no deadline, and to the detached cleanup pass.
pub const DEFAULT_OBJECT_STORE_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("more than one remote destination mode is configured")]
    ConflictingModes,

    #[error("unsupported object storage provider: {0}")]
    UnsupportedProvider(String),

    #[error("no storage driver registered for URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

/// Static S3 credentials supplied by the authorizing application.
///
/// When both keys are empty the default provider chain (instance profile,
/// environment) is used instead.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct S3Credentials {
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub aws_session_token: Option<String>,
}

impl S3Credentials {
    pub fn is_static(&self) -> bool {
        !self.aws_access_key_id.is_empty() && !self.aws_secret_access_key.is_empty()
    }
}

/// Bucket/endpoint settings for the native S3 client.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible stores. Forces path-style addressing.
    pub endpoint: Option<String>,
    pub path_style: bool,
}

/// Native-client storage settings.
///
/// `provider` selects the driver: `"AWS"` uses the AWS SDK with `s3_config`
/// and `s3_credentials`; any other non-empty provider resolves a driver from
/// the `url` scheme (`az://`, `s3://`, `file://`, ...). An unrecognized provider
/// or scheme is a [`ConfigError`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ObjectStorageConfig {
    pub provider: String,
    pub s3_credentials: S3Credentials,
    pub s3_config: S3Config,
    /// Container URL for scheme-dispatched providers.
    pub url: String,
}

/// Destination configuration for one upload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UploadOpts {
    /// Enables the local sink: directory receiving the staged temp file.
    pub local_temp_dir: Option<PathBuf>,
    /// Logical identifier of the remote object.
    pub remote_id: String,
    /// Informational URL of the final remote object; never written to.
    pub remote_url: String,
    /// Presigned URL for a single-shot PUT.
    pub presigned_put: String,
    /// Presigned URL deleting the remote object during cleanup.
    pub presigned_delete: String,
    /// Ordered presigned part URLs; non-empty enables multipart mode.
    pub presigned_parts: Vec<String>,
    pub presigned_complete_multipart: String,
    pub presigned_abort_multipart: String,
    /// Split point for multipart uploads, in bytes.
    pub part_size: i64,
    /// Extra headers attached to presigned PUT requests.
    pub put_headers: HashMap<String, String>,
    /// Upper bound on the upload size. `0` means unlimited.
    pub maximum_size: i64,
    /// Use a native storage client instead of presigned URLs.
    pub use_native_client: bool,
    /// Object key the native client stages the upload under.
    pub remote_temp_object_id: String,
    pub storage_config: ObjectStorageConfig,
    /// Absolute deadline for all outbound calls made by sinks.
    pub deadline: Option<DateTime<Utc>>,
}

/// Remote destination mode, resolved once at validation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMode {
    None,
    SingleShot,
    Multipart,
    Native,
}

impl UploadOpts {
    /// Whether the local sink is active.
    pub fn is_local(&self) -> bool {
        self.local_temp_dir.is_some()
    }

    /// Resolve the remote destination mode.
    ///
    /// At most one of {presigned single, presigned multipart, native client}
    /// may be configured. The local sink is independent of the result.
    pub fn remote_mode(&self) -> Result<RemoteMode, ConfigError> {
        let single = !self.presigned_put.is_empty();
        let multipart = !self.presigned_parts.is_empty();
        let native = self.use_native_client;

        match (single, multipart, native) {
            (false, false, false) => Ok(RemoteMode::None),
            (true, false, false) => Ok(RemoteMode::SingleShot),
            (false, true, false) => {
                if self.part_size <= 0 {
                    return Err(ConfigError::ValidationError(
                        "multipart upload requires a positive part_size".into(),
                    ));
                }
                if self.presigned_complete_multipart.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "multipart upload requires a complete URL".into(),
                    ));
                }
                Ok(RemoteMode::Multipart)
            }
            (false, false, true) => {
                if self.remote_temp_object_id.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "native client requires remote_temp_object_id".into(),
                    ));
                }
                Ok(RemoteMode::Native)
            }
            _ => Err(ConfigError::ConflictingModes),
        }
    }

    /// Time remaining until the configured deadline.
    ///
    /// Falls back to [`DEFAULT_OBJECT_STORE_TIMEOUT`] when no deadline is set
    /// and to a zero-length budget when it already passed.
    pub fn timeout(&self) -> Duration {
        match self.deadline {
            Some(deadline) => (deadline - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO),
            None => DEFAULT_OBJECT_STORE_TIMEOUT,
        }
    }
}
