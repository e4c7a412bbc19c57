//! Multi-digest accumulator
//!
//! Computes MD5, SHA-1, SHA-256 and SHA-512 plus a byte count in a single
//! pass over the stream. Only the tee feeds it; sinks never touch the
//! hashers. Under the `fips` feature MD5 is not computed at all and its
//! digest slot stays empty.

use std::collections::BTreeMap;

#[cfg(not(feature = "fips"))]
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

/// Whether weak digests are disabled for compliance.
#[inline]
pub fn fips_enabled() -> bool {
    cfg!(feature = "fips")
}

/// Running digests over the bytes seen so far.
pub struct MultiHash {
    #[cfg(not(feature = "fips"))]
    md5: Md5,
    sha1: Sha1,
    sha256: Sha256,
    sha512: Sha512,
    count: u64,
}

impl MultiHash {
    pub fn new() -> Self {
        Self {
            #[cfg(not(feature = "fips"))]
            md5: Md5::new(),
            sha1: Sha1::new(),
            sha256: Sha256::new(),
            sha512: Sha512::new(),
            count: 0,
        }
    }

    /// Feed one chunk of original stream bytes.
    pub fn update(&mut self, chunk: &[u8]) {
        #[cfg(not(feature = "fips"))]
        self.md5.update(chunk);
        self.sha1.update(chunk);
        self.sha256.update(chunk);
        self.sha512.update(chunk);
        self.count += chunk.len() as u64;
    }

    /// Bytes observed so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Freeze the hashers into hex digests.
    pub fn finalize(self) -> HashSummary {
        let mut hashes = BTreeMap::new();
        #[cfg(not(feature = "fips"))]
        hashes.insert("md5", hex::encode(self.md5.finalize()));
        hashes.insert("sha1", hex::encode(self.sha1.finalize()));
        hashes.insert("sha256", hex::encode(self.sha256.finalize()));
        hashes.insert("sha512", hex::encode(self.sha512.finalize()));

        HashSummary {
            hashes,
            count: self.count,
        }
    }
}

impl Default for MultiHash {
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen digest set, produced after the stream is fully drained.
#[derive(Debug, Clone)]
pub struct HashSummary {
    hashes: BTreeMap<&'static str, String>,
    count: u64,
}

impl HashSummary {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.hashes.get(name).map(String::as_str)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Iterate digests in stable (alphabetical) order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.hashes.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digests_match_known_vectors() {
        let mut hash = MultiHash::new();
        hash.update(b"12345");
        hash.update(b"6789");
        let summary = hash.finalize();

        assert_eq!(summary.count(), 9);
        if fips_enabled() {
            assert_eq!(summary.get("md5"), None);
        } else {
            assert_eq!(
                summary.get("md5"),
                Some("25f9e794323b453885f5181f1b624d0b")
            );
        }
        assert_eq!(
            summary.get("sha1"),
            Some("f7c3bc1d808e04732adf679965ccc34ca7ae3441")
        );
        assert_eq!(
            summary.get("sha256"),
            Some("15e2b0d3c33891ebb0f1ef609ec419420c20e320ce94c65fbc8c3312448eb225")
        );
        assert_eq!(
            summary.get("sha512"),
            Some(
                "d9e6762dd1c8eaf6d61b3c6192fc408d4d6d5f1176d0c29169bc24e71c3f274ad27fcd5811b31\
                 3d681f7e55ec02d73d499c95455b6b5bb503acf574fba8ffe85"
            )
        );
    }

    #[test]
    fn digests_are_deterministic_across_chunkings() {
        let mut a = MultiHash::new();
        a.update(b"123456789");
        let a = a.finalize();

        let mut b = MultiHash::new();
        for byte in b"123456789" {
            b.update(std::slice::from_ref(byte));
        }
        let b = b.finalize();

        assert_eq!(a.get("sha256"), b.get("sha256"));
        assert_eq!(a.get("sha512"), b.get("sha512"));
    }
}
