//! Grammar artifact cache.
//!
//! [`GrammarCacheManager`] hands out filesystem paths to verified grammar
//! artifacts, downloading and repairing them on demand. It is the single
//! writer of [`ArtifactRecord`]s and composes the pieces below:
//!
//! ```text
//! GrammarCacheManager
//!   ├── FallbackSourceResolver   primary → fallbacks → mirrors → local
//!   ├── ArtifactFetcher          http(s) / file, or scripted in tests
//!   ├── IntegrityVerifier        sha256 of staged and cached bytes
//!   ├── ArtifactStore            <root>/<language>/{grammar.bin,record.json}
//!   └── eviction::plan           tiered LRU under budget / max-age
//! ```

/// Tiered eviction planning.
pub mod eviction;
/// Source fetchers and per-attempt failure reasons.
pub mod fetch;
/// Content hashing.
pub mod integrity;
/// Download orchestration, verification, and eviction passes.
pub mod manager;
/// Candidate source ordering.
pub mod sources;
/// Filesystem persistence.
pub mod store;

use std::fmt;

use serde::Serialize;

pub use eviction::{EvictedArtifact, EvictionPolicy, EvictionReason, EvictionReport};
pub use fetch::{ArtifactFetcher, FetchError, FetchedArtifact, SourceFetcher};
pub use integrity::IntegrityVerifier;
pub use manager::{ArtifactLease, CacheHealth, GrammarCacheManager, PreloadReport};
pub use sources::{FallbackSourceResolver, SourceCandidate};
pub use store::{ArtifactRecord, ArtifactStore, IntegrityState, SourceKind, StoreError};

/// Every attempt made against one source, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub url: String,
    pub kind: SourceKind,
    pub attempts: u32,
    pub reasons: Vec<FetchError>,
}

impl SourceFailure {
    /// Whether the source delivered bytes that were rejected.
    pub fn is_integrity(&self) -> bool {
        self.reasons.iter().any(FetchError::is_integrity)
    }
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {} attempt{})",
            self.url,
            self.kind,
            self.attempts,
            if self.attempts == 1 { "" } else { "s" }
        )?;
        if let Some(last) = self.reasons.last() {
            write!(f, ": {last}")?;
        }
        Ok(())
    }
}

impl Serialize for SourceFailure {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let reasons: Vec<String> = self.reasons.iter().map(ToString::to_string).collect();
        let mut state = serializer.serialize_struct("SourceFailure", 4)?;
        state.serialize_field("url", &self.url)?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("attempts", &self.attempts)?;
        state.serialize_field("reasons", &reasons)?;
        state.end()
    }
}

fn summarize(sources: &[SourceFailure], empty: &str) -> String {
    if sources.is_empty() {
        return empty.to_string();
    }
    sources
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors surfaced by [`GrammarCacheManager`].
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("download failed for {language}: {}", summarize(.sources, "no sources available"))]
    DownloadFailure {
        language: String,
        sources: Vec<SourceFailure>,
    },

    #[error(
        "integrity check failed for {language}: {}",
        summarize(.sources, "no expected hash configured and trust policy is require-hash")
    )]
    IntegrityFailure {
        language: String,
        sources: Vec<SourceFailure>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("failed to initialise fetcher: {0}")]
    Fetcher(FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CacheError {
    /// Per-source failures carried by download and integrity errors.
    pub fn source_failures(&self) -> &[SourceFailure] {
        match self {
            CacheError::DownloadFailure { sources, .. }
            | CacheError::IntegrityFailure { sources, .. } => sources,
            _ => &[],
        }
    }
}
