//! Finalize fields
//!
//! Once a stream is staged, the consumer receives a flat field map describing
//! where the bytes ended up plus their digests, and a signed token embedding
//! the same map so a downstream service can trust that this pipeline, not the
//! client, produced the values.

use std::collections::BTreeMap;

use base64::Engine;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::FileHandle;

/// Field carrying the signed token, relative to the caller's prefix.
pub const TOKEN_FIELD: &str = "filestage-upload";

/// Token lifetime. Finalize requests are forwarded immediately; an hour
/// absorbs clock skew and queueing.
const TOKEN_TTL_SECS: u64 = 3600;

#[derive(Error, Debug)]
pub enum FinalizeError {
    #[error("invalid signing secret: {0}")]
    InvalidSecret(String),

    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

/// Claims of the finalize token: the unprefixed field map plus standard
/// freshness claims.
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadClaims {
    pub upload: BTreeMap<String, String>,
    pub iat: u64,
    pub exp: u64,
}

/// HS256 signer shared with the service verifying finalize requests.
pub struct TokenSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenSigner {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    /// Secrets usually travel base64-encoded in config files.
    pub fn from_base64(encoded: &str) -> Result<Self, FinalizeError> {
        let secret = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|err| FinalizeError::InvalidSecret(err.to_string()))?;
        Ok(Self::new(&secret))
    }

    fn sign(&self, upload: BTreeMap<String, String>) -> Result<String, FinalizeError> {
        let now = jsonwebtoken::get_current_timestamp();
        let claims = UploadClaims {
            upload,
            iat: now,
            exp: now + TOKEN_TTL_SECS,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }

    /// Decode and validate a finalize token.
    pub fn verify(&self, token: &str) -> Result<UploadClaims, FinalizeError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp"]);
        let data = decode::<UploadClaims>(token, &self.decoding_key, &validation)?;
        Ok(data.claims)
    }
}

impl FileHandle {
    /// Collapse the handle into prefixed form fields.
    ///
    /// Every field also appears, unprefixed, inside the signed
    /// `<prefix>.filestage-upload` token, so the receiver can reject any
    /// field a client tampered with.
    pub fn finalize_fields(
        &self,
        prefix: &str,
        signer: &TokenSigner,
    ) -> Result<BTreeMap<String, String>, FinalizeError> {
        let mut upload = BTreeMap::new();
        upload.insert("name".to_string(), self.name.clone());
        if let Some(path) = &self.local_path {
            upload.insert("path".to_string(), path.display().to_string());
        }
        if !self.remote_url.is_empty() {
            upload.insert("remote_url".to_string(), self.remote_url.clone());
        }
        if !self.remote_id.is_empty() {
            upload.insert("remote_id".to_string(), self.remote_id.clone());
        }
        upload.insert("size".to_string(), self.size.to_string());
        for (name, value) in self.hashes.iter() {
            upload.insert(name.to_string(), value.to_string());
        }
        upload.insert(
            "upload_duration".to_string(),
            format!("{}", self.upload_duration.as_secs_f64()),
        );

        let token = signer.sign(upload.clone())?;

        let mut fields: BTreeMap<String, String> = upload
            .into_iter()
            .map(|(key, value)| (format!("{prefix}.{key}"), value))
            .collect();
        fields.insert(format!("{prefix}.{TOKEN_FIELD}"), token);
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::MultiHash;
    use std::time::Duration;

    fn handle() -> FileHandle {
        let mut hash = MultiHash::new();
        hash.update(b"123456789");
        FileHandle {
            name: "file".into(),
            local_path: Some("/tmp/filestage-test.tmp".into()),
            remote_url: "https://bucket.example/final".into(),
            remote_id: "42".into(),
            size: 9,
            hashes: hash.finalize(),
            etag: None,
            upload_duration: Duration::from_millis(1500),
        }
    }

    #[test]
    fn fields_are_prefixed_and_signed() {
        let signer = TokenSigner::new(b"secret");
        let fields = handle().finalize_fields("file", &signer).unwrap();

        assert_eq!(fields.get("file.name").map(String::as_str), Some("file"));
        assert_eq!(fields.get("file.size").map(String::as_str), Some("9"));
        assert_eq!(
            fields.get("file.sha256").map(String::as_str),
            Some("15e2b0d3c33891ebb0f1ef609ec419420c20e320ce94c65fbc8c3312448eb225")
        );
        assert_eq!(
            fields.get("file.remote_id").map(String::as_str),
            Some("42")
        );
        assert_eq!(
            fields.get("file.upload_duration").map(String::as_str),
            Some("1.5")
        );

        let token = fields.get("file.filestage-upload").unwrap();
        let claims = signer.verify(token).unwrap();
        assert_eq!(claims.upload.get("name").map(String::as_str), Some("file"));
        assert_eq!(claims.upload.get("size").map(String::as_str), Some("9"));
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn empty_remote_fields_are_omitted() {
        let signer = TokenSigner::new(b"secret");
        let mut h = handle();
        h.remote_url = String::new();
        h.remote_id = String::new();
        h.local_path = None;

        let fields = h.finalize_fields("file", &signer).unwrap();
        assert!(!fields.contains_key("file.remote_url"));
        assert!(!fields.contains_key("file.remote_id"));
        assert!(!fields.contains_key("file.path"));
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let signer = TokenSigner::new(b"secret");
        let fields = handle().finalize_fields("file", &signer).unwrap();
        let token = fields.get("file.filestage-upload").unwrap();

        let other = TokenSigner::new(b"other-secret");
        assert!(other.verify(token).is_err());
    }

    #[test]
    fn base64_secrets_round_trip() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"secret");
        let signer = TokenSigner::from_base64(&encoded).unwrap();
        let fields = handle().finalize_fields("file", &signer).unwrap();
        let verifier = TokenSigner::new(b"secret");
        assert!(verifier
            .verify(fields.get("file.filestage-upload").unwrap())
            .is_ok());
    }
}
