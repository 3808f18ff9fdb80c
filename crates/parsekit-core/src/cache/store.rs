//! Filesystem persistence for grammar artifacts and their metadata.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/
//!   <language>/
//!     grammar.bin        verified artifact bytes
//!     record.json        ArtifactRecord
//!     .partial-XXXXXX    in-flight download (removed on drop)
//! ```
//!
//! The store performs no locking; the cache manager serializes writers.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parsekit_config::Tier;
use serde::{Deserialize, Serialize};
use tempfile::TempPath;

/// File name of the artifact inside a language directory.
pub const ARTIFACT_FILE: &str = "grammar.bin";
/// File name of the metadata record inside a language directory.
pub const RECORD_FILE: &str = "record.json";
/// Prefix of staging files for in-flight downloads.
pub const PARTIAL_PREFIX: &str = ".partial-";

const RECORD_TMP_FILE: &str = "record.json.tmp";

/// Errors from artifact store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt metadata record at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Which kind of source served an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Primary,
    Fallback,
    Local,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Primary => write!(f, "primary"),
            SourceKind::Fallback => write!(f, "fallback"),
            SourceKind::Local => write!(f, "local"),
        }
    }
}

/// Verification state of a stored artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityState {
    /// Matched a configured hash, or a recorded hash on re-verification.
    Verified,
    /// Accepted on first download without a configured hash.
    Pending,
    /// Last verification did not match; treated as absent.
    Failed,
}

/// Persisted metadata for one cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub language: String,
    pub local_path: PathBuf,
    /// Lowercase hex SHA-256 of the bytes at `local_path`.
    pub content_hash: String,
    pub size_bytes: u64,
    /// The URL or path that actually served the artifact.
    pub source_url: String,
    pub source_kind: SourceKind,
    pub downloaded_at: DateTime<Utc>,
    pub last_verified_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub integrity_state: IntegrityState,
    /// Tier copied from the profile at download time.
    pub tier: Tier,
}

impl ArtifactRecord {
    /// Whether the record may be served.
    pub fn is_usable(&self) -> bool {
        self.integrity_state != IntegrityState::Failed
    }

    /// Record a successful retrieval.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed_at = now;
    }
}

/// Filesystem-backed store with one directory per language.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (and create) a store rooted at `root`, sweeping leftover
    /// staging files from interrupted downloads.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { root: root.into() };
        tokio::fs::create_dir_all(&store.root)
            .await
            .map_err(|e| StoreError::io(&store.root, e))?;
        let swept = store.sweep_partials().await?;
        if swept > 0 {
            tracing::info!(root = %store.root.display(), swept, "Removed partial downloads");
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn language_dir(&self, language: &str) -> PathBuf {
        self.root.join(language)
    }

    pub fn artifact_path(&self, language: &str) -> PathBuf {
        self.language_dir(language).join(ARTIFACT_FILE)
    }

    pub fn record_path(&self, language: &str) -> PathBuf {
        self.language_dir(language).join(RECORD_FILE)
    }

    /// Load the metadata record for `language`, if one exists.
    pub async fn load_record(&self, language: &str) -> Result<Option<ArtifactRecord>, StoreError> {
        let path = self.record_path(language);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt { path, source })
    }

    /// Write a metadata record atomically (temp file, then rename).
    pub async fn save_record(&self, record: &ArtifactRecord) -> Result<(), StoreError> {
        let dir = self.language_dir(&record.language);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        let tmp = dir.join(RECORD_TMP_FILE);
        let json = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Corrupt {
            path: tmp.clone(),
            source,
        })?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;

        let dest = self.record_path(&record.language);
        tokio::fs::rename(&tmp, &dest)
            .await
            .map_err(|e| StoreError::io(&dest, e))
    }

    /// Create an empty staging file for a download of `language`.
    ///
    /// The file is deleted when the returned path is dropped, so a failed or
    /// cancelled download never leaves bytes behind.
    pub async fn stage(&self, language: &str) -> Result<TempPath, StoreError> {
        let dir = self.language_dir(language);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;
        tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .tempfile_in(&dir)
            .map(|file| file.into_temp_path())
            .map_err(|e| StoreError::io(&dir, e))
    }

    /// Move a verified staging file into place as the artifact for `language`.
    pub fn commit(&self, language: &str, staged: TempPath) -> Result<PathBuf, StoreError> {
        let dest = self.artifact_path(language);
        staged
            .persist(&dest)
            .map_err(|e| StoreError::io(&dest, e.error))?;
        Ok(dest)
    }

    /// Remove a language's artifact and record.
    pub async fn remove(&self, language: &str) -> Result<(), StoreError> {
        let dir = self.language_dir(language);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&dir, e)),
        }
    }

    /// Names of all language directories currently in the store.
    pub async fn list_languages(&self) -> Result<Vec<String>, StoreError> {
        let mut languages = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(languages),
            Err(e) => return Err(StoreError::io(&self.root, e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.root, e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    languages.push(name.to_string());
                }
            }
        }
        languages.sort();
        Ok(languages)
    }

    /// Remove every artifact and record.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let languages = self.list_languages().await?;
        for language in &languages {
            self.remove(language).await?;
        }
        Ok(languages.len())
    }

    /// Delete staging files left by interrupted downloads. Returns the count.
    pub async fn sweep_partials(&self) -> Result<usize, StoreError> {
        let mut swept = 0;
        for language in self.list_languages().await? {
            let dir = self.language_dir(&language);
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(&dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::io(&dir, e))?
            {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with(PARTIAL_PREFIX) || name == RECORD_TMP_FILE {
                    let path = entry.path();
                    tokio::fs::remove_file(&path)
                        .await
                        .map_err(|e| StoreError::io(&path, e))?;
                    swept += 1;
                }
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(store: &ArtifactStore, language: &str) -> ArtifactRecord {
        let now = Utc::now();
        ArtifactRecord {
            language: language.to_string(),
            local_path: store.artifact_path(language),
            content_hash: "ab".repeat(32),
            size_bytes: 4,
            source_url: "https://grammars.example/python.json".to_string(),
            source_kind: SourceKind::Primary,
            downloaded_at: now,
            last_verified_at: now,
            last_accessed_at: now,
            access_count: 1,
            integrity_state: IntegrityState::Verified,
            tier: Tier::Eager,
        }
    }

    #[tokio::test]
    async fn test_record_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        assert!(store.load_record("python").await.unwrap().is_none());

        let rec = record(&store, "python");
        store.save_record(&rec).await.unwrap();
        assert_eq!(store.load_record("python").await.unwrap(), Some(rec));
        assert!(!store.language_dir("python").join(RECORD_TMP_FILE).exists());
    }

    #[tokio::test]
    async fn test_record_json_uses_lowercase_enums() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let mut rec = record(&store, "go");
        rec.source_kind = SourceKind::Fallback;
        rec.integrity_state = IntegrityState::Pending;
        store.save_record(&rec).await.unwrap();

        let raw = std::fs::read_to_string(store.record_path("go")).unwrap();
        assert!(raw.contains("\"source_kind\": \"fallback\""));
        assert!(raw.contains("\"integrity_state\": \"pending\""));
        assert!(raw.contains("\"tier\": 1"));
    }

    #[tokio::test]
    async fn test_corrupt_record_is_error() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        std::fs::create_dir_all(store.language_dir("rust")).unwrap();
        std::fs::write(store.record_path("rust"), b"{not json").unwrap();
        assert!(matches!(
            store.load_record("rust").await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_staged_file_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let staged = store.stage("python").await.unwrap();
        let staged_path = staged.to_path_buf();
        assert!(staged_path.exists());
        drop(staged);
        assert!(!staged_path.exists());
    }

    #[tokio::test]
    async fn test_commit_moves_into_place() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let staged = store.stage("python").await.unwrap();
        std::fs::write(&staged, b"rules").unwrap();

        let path = store.commit("python", staged).unwrap();
        assert_eq!(path, store.artifact_path("python"));
        assert_eq!(std::fs::read(&path).unwrap(), b"rules");
    }

    #[tokio::test]
    async fn test_open_sweeps_partials() {
        let dir = TempDir::new().unwrap();
        let lang_dir = dir.path().join("python");
        std::fs::create_dir_all(&lang_dir).unwrap();
        std::fs::write(lang_dir.join(".partial-abc123"), b"half").unwrap();
        std::fs::write(lang_dir.join(ARTIFACT_FILE), b"whole").unwrap();

        let store = ArtifactStore::open(dir.path()).await.unwrap();
        assert!(!lang_dir.join(".partial-abc123").exists());
        assert!(store.artifact_path("python").exists());
    }

    #[tokio::test]
    async fn test_list_remove_and_clear() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        for lang in ["rust", "go", "python"] {
            store.save_record(&record(&store, lang)).await.unwrap();
        }
        std::fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        assert_eq!(
            store.list_languages().await.unwrap(),
            vec!["go".to_string(), "python".to_string(), "rust".to_string()]
        );

        store.remove("go").await.unwrap();
        store.remove("go").await.unwrap();
        assert_eq!(store.list_languages().await.unwrap().len(), 2);

        assert_eq!(store.clear().await.unwrap(), 2);
        assert!(store.list_languages().await.unwrap().is_empty());
    }

    #[test]
    fn test_touch_updates_access() {
        let dir = std::env::temp_dir();
        let store = ArtifactStore { root: dir };
        let mut rec = record(&store, "python");
        let later = rec.last_accessed_at + chrono::Duration::seconds(5);
        rec.touch(later);
        assert_eq!(rec.access_count, 2);
        assert_eq!(rec.last_accessed_at, later);
    }
}
