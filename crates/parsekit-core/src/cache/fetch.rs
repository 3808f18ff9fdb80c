//! Artifact fetchers.
//!
//! An [`ArtifactFetcher`] copies the bytes behind a source URL into a staging
//! file and reports the digest it computed while writing. [`SourceFetcher`]
//! is the production fetcher: `http(s)://` goes through [`HttpFetcher`],
//! `file://` and bare paths through [`LocalFetcher`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::BoxFuture;
use crate::build_info;

/// Why a single fetch attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP status {status}")]
    Http { status: u16 },

    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cancelled")]
    Cancelled,

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

impl FetchError {
    /// Whether the bytes arrived but were rejected.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            FetchError::HashMismatch { .. } | FetchError::SizeMismatch { .. }
        )
    }

    /// Whether another attempt against the same source could succeed.
    ///
    /// Integrity mismatches, missing resources and client errors are
    /// permanent for a source; the manager moves on to the next one.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Http { status } => *status >= 500 || *status == 408 || *status == 429,
            FetchError::Network(_) | FetchError::Timeout(_) | FetchError::Io(_) => true,
            FetchError::NotFound(_)
            | FetchError::Cancelled
            | FetchError::HashMismatch { .. }
            | FetchError::SizeMismatch { .. } => false,
        }
    }
}

/// Digest and size of fetched bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArtifact {
    pub hash: String,
    pub size_bytes: u64,
}

/// Downloads one source into a staging path.
pub trait ArtifactFetcher: Send + Sync {
    /// Short name for logs (e.g. "http", "local", "scripted").
    fn name(&self) -> &str;

    /// Write the bytes behind `source` to `dest`, replacing its contents.
    fn fetch<'a>(
        &'a self,
        source: &'a str,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<FetchedArtifact, FetchError>>;

    /// Like [`fetch`](Self::fetch), but gives up with
    /// [`FetchError::SizeMismatch`] once more than `max_bytes` arrive.
    fn fetch_limited<'a>(
        &'a self,
        source: &'a str,
        dest: &'a Path,
        _max_bytes: Option<u64>,
    ) -> BoxFuture<'a, Result<FetchedArtifact, FetchError>> {
        self.fetch(source, dest)
    }
}

/// Writes a staging file while hashing it, optionally refusing to grow
/// past a byte limit.
pub struct StagingWriter {
    file: tokio::fs::File,
    hasher: Sha256,
    written: u64,
    limit: Option<u64>,
}

impl StagingWriter {
    /// Truncate or create `dest` for writing.
    pub async fn create(dest: &Path) -> Result<Self, FetchError> {
        Self::create_limited(dest, None).await
    }

    pub async fn create_limited(dest: &Path, limit: Option<u64>) -> Result<Self, FetchError> {
        let file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| FetchError::Io(format!("{}: {e}", dest.display())))?;
        Ok(Self {
            file,
            hasher: Sha256::new(),
            written: 0,
            limit,
        })
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), FetchError> {
        let total = self.written + chunk.len() as u64;
        if let Some(limit) = self.limit {
            if total > limit {
                return Err(FetchError::SizeMismatch {
                    expected: limit,
                    actual: total,
                });
            }
        }
        self.hasher.update(chunk);
        self.written = total;
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| FetchError::Io(e.to_string()))
    }

    /// Flush to disk and return the digest.
    pub async fn finish(mut self) -> Result<FetchedArtifact, FetchError> {
        self.file
            .flush()
            .await
            .map_err(|e| FetchError::Io(e.to_string()))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| FetchError::Io(e.to_string()))?;
        Ok(FetchedArtifact {
            hash: hex::encode(self.hasher.finalize()),
            size_bytes: self.written,
        })
    }
}

/// Whether a source names something on the local filesystem.
pub fn is_local_source(source: &str) -> bool {
    source.starts_with("file://") || !source.contains("://")
}

fn local_path(source: &str) -> PathBuf {
    PathBuf::from(source.strip_prefix("file://").unwrap_or(source))
}

// ── HTTP ────────────────────────────────────────────────────────────────

/// Fetches `http://` and `https://` sources.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    /// Build a client with the parsekit user agent and a per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(build_info::user_agent())
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }

    fn map_error(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else if let Some(status) = err.status() {
            FetchError::Http {
                status: status.as_u16(),
            }
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn name(&self) -> &str {
        "http"
    }

    fn fetch<'a>(
        &'a self,
        source: &'a str,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<FetchedArtifact, FetchError>> {
        self.fetch_limited(source, dest, None)
    }

    fn fetch_limited<'a>(
        &'a self,
        source: &'a str,
        dest: &'a Path,
        max_bytes: Option<u64>,
    ) -> BoxFuture<'a, Result<FetchedArtifact, FetchError>> {
        Box::pin(async move {
            let mut response = self
                .client
                .get(source)
                .send()
                .await
                .map_err(|e| self.map_error(e))?;

            let status = response.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(FetchError::NotFound(source.to_string()));
            }
            if !status.is_success() {
                return Err(FetchError::Http {
                    status: status.as_u16(),
                });
            }

            if let (Some(limit), Some(announced)) = (max_bytes, response.content_length()) {
                if announced > limit {
                    return Err(FetchError::SizeMismatch {
                        expected: limit,
                        actual: announced,
                    });
                }
            }

            let mut writer = StagingWriter::create_limited(dest, max_bytes).await?;
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| self.map_error(e))?
            {
                writer.write(&chunk).await?;
            }
            writer.finish().await
        })
    }
}

// ── Local files ─────────────────────────────────────────────────────────

/// Copies `file://` URLs and bare filesystem paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFetcher;

impl ArtifactFetcher for LocalFetcher {
    fn name(&self) -> &str {
        "local"
    }

    fn fetch<'a>(
        &'a self,
        source: &'a str,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<FetchedArtifact, FetchError>> {
        self.fetch_limited(source, dest, None)
    }

    fn fetch_limited<'a>(
        &'a self,
        source: &'a str,
        dest: &'a Path,
        max_bytes: Option<u64>,
    ) -> BoxFuture<'a, Result<FetchedArtifact, FetchError>> {
        Box::pin(async move {
            let path = local_path(source);
            let mut file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(FetchError::NotFound(path.display().to_string()));
                }
                Err(e) => return Err(FetchError::Io(format!("{}: {e}", path.display()))),
            };

            let mut writer = StagingWriter::create_limited(dest, max_bytes).await?;
            let mut buffer = vec![0_u8; 64 * 1024];
            loop {
                let read = file
                    .read(&mut buffer)
                    .await
                    .map_err(|e| FetchError::Io(e.to_string()))?;
                if read == 0 {
                    break;
                }
                writer.write(&buffer[..read]).await?;
            }
            writer.finish().await
        })
    }
}

// ── Scheme dispatch ─────────────────────────────────────────────────────

/// Production fetcher dispatching on the source scheme.
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    http: HttpFetcher,
    local: LocalFetcher,
}

impl SourceFetcher {
    pub fn new(request_timeout: Duration) -> Result<Self, FetchError> {
        Ok(Self {
            http: HttpFetcher::new(request_timeout)?,
            local: LocalFetcher,
        })
    }
}

impl ArtifactFetcher for SourceFetcher {
    fn name(&self) -> &str {
        "source"
    }

    fn fetch<'a>(
        &'a self,
        source: &'a str,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<FetchedArtifact, FetchError>> {
        self.fetch_limited(source, dest, None)
    }

    fn fetch_limited<'a>(
        &'a self,
        source: &'a str,
        dest: &'a Path,
        max_bytes: Option<u64>,
    ) -> BoxFuture<'a, Result<FetchedArtifact, FetchError>> {
        if is_local_source(source) {
            self.local.fetch_limited(source, dest, max_bytes)
        } else {
            self.http.fetch_limited(source, dest, max_bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::integrity::IntegrityVerifier;
    use tempfile::TempDir;

    #[test]
    fn test_is_local_source() {
        assert!(is_local_source("/opt/grammars/python.json"));
        assert!(is_local_source("file:///opt/grammars/python.json"));
        assert!(is_local_source("grammars/python.json"));
        assert!(!is_local_source("https://grammars.example/python.json"));
    }

    #[test]
    fn test_retry_classification() {
        assert!(FetchError::Network("reset".into()).is_retryable());
        assert!(FetchError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(FetchError::Http { status: 503 }.is_retryable());
        assert!(FetchError::Http { status: 429 }.is_retryable());
        assert!(!FetchError::Http { status: 403 }.is_retryable());
        assert!(!FetchError::NotFound("x".into()).is_retryable());
        let mismatch = FetchError::HashMismatch {
            expected: "a".into(),
            actual: "b".into(),
        };
        assert!(!mismatch.is_retryable());
        assert!(mismatch.is_integrity());
    }

    #[tokio::test]
    async fn test_local_fetch_copies_and_hashes() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("python.json");
        std::fs::write(&src, b"{\"language\":\"python\"}").unwrap();
        let dest = dir.path().join("staged");

        let url = format!("file://{}", src.display());
        let fetched = LocalFetcher.fetch(&url, &dest).await.unwrap();
        assert_eq!(fetched.size_bytes, 21);
        assert_eq!(
            fetched.hash,
            IntegrityVerifier::hash_bytes(b"{\"language\":\"python\"}")
        );
        assert_eq!(std::fs::read(&dest).unwrap(), std::fs::read(&src).unwrap());
    }

    #[tokio::test]
    async fn test_local_fetch_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.json");
        let err = LocalFetcher
            .fetch(missing.to_str().unwrap(), &dir.path().join("staged"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_source_fetcher_routes_paths_locally() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("go.json");
        std::fs::write(&src, b"go").unwrap();
        let fetcher = SourceFetcher::new(Duration::from_secs(5)).unwrap();
        let fetched = fetcher
            .fetch(src.to_str().unwrap(), &dir.path().join("staged"))
            .await
            .unwrap();
        assert_eq!(fetched.size_bytes, 2);
    }

    #[tokio::test]
    async fn test_limited_fetch_stops_past_expected_size() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("huge.json");
        std::fs::write(&src, vec![b'x'; 200 * 1024]).unwrap();
        let dest = dir.path().join("staged");

        let err = SourceFetcher::new(Duration::from_secs(5))
            .unwrap()
            .fetch_limited(src.to_str().unwrap(), &dest, Some(1024))
            .await
            .unwrap_err();
        match err {
            FetchError::SizeMismatch { expected, actual } => {
                assert_eq!(expected, 1024);
                assert!(actual > 1024);
            }
            other => panic!("expected size mismatch, got {other:?}"),
        }
        assert!(std::fs::metadata(&dest).unwrap().len() <= 1024);
    }

    #[tokio::test]
    async fn test_limited_fetch_accepts_exact_size() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("go.json");
        std::fs::write(&src, b"go").unwrap();
        let fetched = LocalFetcher
            .fetch_limited(src.to_str().unwrap(), &dir.path().join("staged"), Some(2))
            .await
            .unwrap();
        assert_eq!(fetched.size_bytes, 2);
    }
}
