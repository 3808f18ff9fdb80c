//! Content hashing for grammar artifacts.
//!
//! Digests are lowercase hex SHA-256. Expected digests from configuration may
//! carry a `sha256:` prefix; comparison normalizes both sides.

use std::path::Path;

use parsekit_config::normalize_hash;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// Read buffer used when hashing files.
const HASH_BUFFER_BYTES: usize = 64 * 1024;

/// Digest of a file together with its size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    /// Lowercase hex SHA-256.
    pub hash: String,
    /// Number of bytes hashed.
    pub size_bytes: u64,
}

/// Computes and checks artifact content hashes.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    /// Hash an in-memory buffer.
    pub fn hash_bytes(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Hash a file by streaming it from disk.
    pub async fn hash_file(path: &Path) -> std::io::Result<FileDigest> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0_u8; HASH_BUFFER_BYTES];
        let mut size_bytes = 0_u64;
        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            size_bytes += read as u64;
        }
        Ok(FileDigest {
            hash: hex::encode(hasher.finalize()),
            size_bytes,
        })
    }

    /// Whether two digests name the same content.
    pub fn matches(expected: &str, actual: &str) -> bool {
        normalize_hash(expected) == normalize_hash(actual)
    }

    /// Hash the file at `path` and compare against `expected`.
    ///
    /// Returns `false` when the file cannot be read.
    pub async fn verify_file(path: &Path, expected: &str) -> bool {
        match Self::hash_file(path).await {
            Ok(digest) => Self::matches(expected, &digest.hash),
            Err(e) => {
                tracing::debug!(
                    path = %path.display(),
                    error = %e,
                    "Artifact unreadable during verification"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TEST_DIGEST: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn test_hash_bytes_known_vector() {
        assert_eq!(IntegrityVerifier::hash_bytes(b"test"), TEST_DIGEST);
    }

    #[test]
    fn test_matches_ignores_prefix_and_case() {
        let upper = TEST_DIGEST.to_uppercase();
        assert!(IntegrityVerifier::matches(
            &format!("sha256:{upper}"),
            TEST_DIGEST
        ));
        assert!(!IntegrityVerifier::matches("sha256:00", TEST_DIGEST));
    }

    #[tokio::test]
    async fn test_hash_file_matches_hash_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grammar.bin");
        let content = vec![7_u8; HASH_BUFFER_BYTES * 2 + 13];
        tokio::fs::write(&path, &content).await.unwrap();

        let digest = IntegrityVerifier::hash_file(&path).await.unwrap();
        assert_eq!(digest.hash, IntegrityVerifier::hash_bytes(&content));
        assert_eq!(digest.size_bytes, content.len() as u64);
    }

    #[tokio::test]
    async fn test_verify_file_missing_is_false() {
        let dir = TempDir::new().unwrap();
        assert!(!IntegrityVerifier::verify_file(&dir.path().join("nope"), TEST_DIGEST).await);
    }

    #[tokio::test]
    async fn test_verify_file_detects_mutation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grammar.bin");
        tokio::fs::write(&path, b"test").await.unwrap();
        assert!(IntegrityVerifier::verify_file(&path, TEST_DIGEST).await);

        tokio::fs::write(&path, b"tampered").await.unwrap();
        assert!(!IntegrityVerifier::verify_file(&path, TEST_DIGEST).await);
    }
}
