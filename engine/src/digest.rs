//! Streaming SHA-256 digests.
//!
//! Layer blobs are large; digests are always computed incrementally as the
//! bytes flow, never by buffering a whole blob.

use sha2::{Digest, Sha256};

/// Incremental SHA-256 digest over a byte stream.
#[derive(Default)]
pub struct StreamingDigest {
    hasher: Sha256,
    bytes: u64,
}

impl StreamingDigest {
    /// Create a fresh digest state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the stream.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn bytes_seen(&self) -> u64 {
        self.bytes
    }

    /// Consume the state and return the canonical `sha256:<hex>` digest.
    pub fn finalize(self) -> String {
        format!("sha256:{}", hex::encode(self.hasher.finalize()))
    }
}

/// Compute the canonical `sha256:<hex>` digest of a complete byte slice.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Whether a string is a well-formed `sha256:<64 lowercase hex>` digest.
pub fn is_sha256_digest(s: &str) -> bool {
    match s.strip_prefix("sha256:") {
        Some(hex_part) => {
            hex_part.len() == 64
                && hex_part
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256 of the empty string.
    const EMPTY: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_sha256_digest_empty() {
        assert_eq!(sha256_digest(b""), EMPTY);
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut streaming = StreamingDigest::new();
        for chunk in data.chunks(7) {
            streaming.update(chunk);
        }
        assert_eq!(streaming.bytes_seen(), data.len() as u64);
        assert_eq!(streaming.finalize(), sha256_digest(data));
    }

    #[test]
    fn test_is_sha256_digest() {
        assert!(is_sha256_digest(EMPTY));
        assert!(!is_sha256_digest("sha256:short"));
        assert!(!is_sha256_digest("md5:abc"));
        assert!(!is_sha256_digest(
            // uppercase hex is not canonical
            "sha256:E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855"
        ));
        assert!(!is_sha256_digest(""));
    }
}
