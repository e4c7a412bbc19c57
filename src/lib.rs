//! Filestage Library
//!
//! Streaming upload staging pipeline for reverse-proxy data planes.
//!
//! A single inbound byte stream is read exactly once, hashed (MD5/SHA-1/
//! SHA-256/SHA-512), checked against a maximum-size policy, and fanned out to
//! whichever sinks the caller configured: a local temp file, a presigned
//! object-store URL (single PUT or multipart), or a native cloud-storage
//! client. Everything staged is torn down asynchronously when the upload
//! fails or when the caller's scope ends.
//!
//! # Example
//!
//! ```no_run
//! use filestage::{upload, UploadOpts};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), filestage::UploadError> {
//!     let opts = UploadOpts {
//!         local_temp_dir: Some("/var/tmp/uploads".into()),
//!         ..Default::default()
//!     };
//!
//!     let ctx = CancellationToken::new();
//!     let data = std::io::Cursor::new(b"hello".to_vec());
//!     let handle = upload(ctx.clone(), data, 5, "artifact", opts).await?;
//!     println!("staged {} bytes at {:?}", handle.size, handle.local_path);
//!
//!     // Ending the request scope removes the staged artifacts.
//!     ctx.cancel();
//!     Ok(())
//! }
//! ```

pub mod cleanup;
pub mod config;
pub mod digest;
pub mod metrics;
pub mod pool;
pub mod sink;
pub mod tee;
pub mod upload;

// Re-export commonly used types
pub use config::{ConfigError, ObjectStorageConfig, S3Config, S3Credentials, UploadOpts};
pub use digest::fips_enabled;
pub use upload::finalize::{FinalizeError, TokenSigner};
pub use upload::{upload, FileHandle, UploadError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
