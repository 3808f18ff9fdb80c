//! The uniform parsing boundary.
//!
//! Every backend implements [`ParsingAdapter`]: `parse_one` over in-memory
//! source and `parse_many` over files. Results are backend-neutral
//! [`SyntaxNode`] lists; failures carry a [`ParseFailureKind`] and stay scoped
//! to the item that failed.
//!
//! Backends that need a grammar artifact obtain it from the
//! [`GrammarCacheManager`](crate::cache::GrammarCacheManager) before parsing.
//! A cache failure surfaces as [`ParseFailureKind::BackendInternalError`] with
//! the cache error attached as its source.

/// Bounded-concurrency batch driver shared by all backends.
pub mod batch;
/// External parser process over JSON stdio.
pub mod external;
/// Grammar rule documents and their loader.
pub mod grammar;
/// In-process rule engine backend.
pub mod native;
/// Rule engine on an isolated worker with limits.
pub mod sandboxed;
/// Declaration scanner driven by grammar rules.
pub mod scan;

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::BoxFuture;
use crate::catalog::LanguageCatalog;
use crate::runtime::BackendKind;

pub use external::ExternalProcessBackend;
pub use native::NativeBackend;
pub use sandboxed::SandboxedBackend;

/// Path recorded for sources parsed without a path hint.
pub const STDIN_PATH: &str = "<stdin>";

// ── Nodes ───────────────────────────────────────────────────────────────

/// Byte and line extent of a node. Lines are 1-based and inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start_byte: usize,
    pub end_byte: usize,
    pub start_line: usize,
    pub end_line: usize,
}

/// Stable node identifier: the first 16 hex characters of
/// SHA-256(path, start byte, end byte, kind).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn derive(path: &str, span: &Span, kind: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        hasher.update([0]);
        hasher.update(span.start_byte.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(span.end_byte.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(kind.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(digest[..16].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A node as produced by a backend, before it is given an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawNode {
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub span: Span,
}

/// A backend-neutral syntax node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxNode {
    pub id: NodeId,
    pub kind: String,
    pub name: Option<String>,
    pub span: Span,
}

/// Successful parse of one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedSource {
    pub language: String,
    pub path: Option<PathBuf>,
    pub backend: BackendKind,
    pub nodes: Vec<SyntaxNode>,
}

impl ParsedSource {
    /// Assign identifiers to raw nodes. Identifiers depend only on the path,
    /// the span and the kind, so they are stable across runs and backends.
    pub fn from_raw(
        language: &str,
        path: Option<&Path>,
        backend: BackendKind,
        raw: Vec<RawNode>,
    ) -> Self {
        let id_path = path
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| STDIN_PATH.to_string());
        let nodes = raw
            .into_iter()
            .map(|node| SyntaxNode {
                id: NodeId::derive(&id_path, &node.span, &node.kind),
                kind: node.kind,
                name: node.name,
                span: node.span,
            })
            .collect();
        Self {
            language: language.to_string(),
            path: path.map(Path::to_path_buf),
            backend,
            nodes,
        }
    }
}

// ── Failures ────────────────────────────────────────────────────────────

/// Classification of a per-item parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParseFailureKind {
    UnsupportedLanguage,
    BackendUnavailable,
    SourceReadError,
    BackendInternalError,
}

impl fmt::Display for ParseFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseFailureKind::UnsupportedLanguage => write!(f, "unsupported language"),
            ParseFailureKind::BackendUnavailable => write!(f, "backend unavailable"),
            ParseFailureKind::SourceReadError => write!(f, "source read error"),
            ParseFailureKind::BackendInternalError => write!(f, "backend internal error"),
        }
    }
}

/// A structured parse failure, scoped to one source.
#[derive(Debug, Clone)]
pub struct ParseFailure {
    pub kind: ParseFailureKind,
    pub message: String,
    pub path: Option<PathBuf>,
    cause: Option<Arc<dyn StdError + Send + Sync>>,
}

impl ParseFailure {
    pub fn new(kind: ParseFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            path: None,
            cause: None,
        }
    }

    pub fn unsupported_language(language: &str) -> Self {
        Self::new(
            ParseFailureKind::UnsupportedLanguage,
            format!("no grammar configured for {language:?}"),
        )
    }

    pub fn source_read(path: &Path, err: std::io::Error) -> Self {
        Self::new(
            ParseFailureKind::SourceReadError,
            format!("failed to read {}: {err}", path.display()),
        )
        .with_path(path)
        .with_cause(err)
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// The underlying error, when one was attached.
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl StdError for ParseFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

/// Outcome of parsing one source.
pub type ParseOutcome = Result<ParsedSource, ParseFailure>;

// ── Batches ─────────────────────────────────────────────────────────────

/// Outcomes keyed by input path.
pub type BatchResults = BTreeMap<PathBuf, ParseOutcome>;

/// Progress after each completed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    pub path: PathBuf,
    pub succeeded: bool,
}

/// Callback invoked after every completed item.
pub type ProgressCallback = Arc<dyn Fn(&BatchProgress) + Send + Sync>;

/// Options for [`ParsingAdapter::parse_many`].
#[derive(Clone)]
pub struct BatchOptions {
    /// Maximum parses in flight.
    pub concurrency_limit: usize,
    pub on_progress: Option<ProgressCallback>,
    /// When false, the first failure aborts the batch.
    pub continue_on_error: bool,
    pub cancel: CancellationToken,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            on_progress: None,
            continue_on_error: true,
            cancel: CancellationToken::new(),
        }
    }
}

impl BatchOptions {
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_progress(
        mut self,
        callback: impl Fn(&BatchProgress) + Send + Sync + 'static,
    ) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.continue_on_error = false;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOptions")
            .field("concurrency_limit", &self.concurrency_limit)
            .field("on_progress", &self.on_progress.is_some())
            .field("continue_on_error", &self.continue_on_error)
            .finish()
    }
}

/// A batch that stopped before every item completed.
#[derive(Debug, thiserror::Error)]
pub enum BatchAborted {
    #[error("batch aborted: {} failed: {failure}", .path.display())]
    Failed {
        path: PathBuf,
        failure: ParseFailure,
        completed: BatchResults,
    },

    #[error("batch cancelled after {} of {total} items", .completed.len())]
    Cancelled { completed: BatchResults, total: usize },
}

impl BatchAborted {
    /// Outcomes that finished before the batch stopped.
    pub fn completed(&self) -> &BatchResults {
        match self {
            BatchAborted::Failed { completed, .. } | BatchAborted::Cancelled { completed, .. } => {
                completed
            }
        }
    }
}

// ── Adapter trait ───────────────────────────────────────────────────────

/// The contract every parsing backend satisfies.
pub trait ParsingAdapter: Send + Sync + 'static {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Languages this adapter resolves names and file extensions against.
    fn catalog(&self) -> &LanguageCatalog;

    /// Side-effect-free readiness check. `Ok` carries a version or readiness
    /// detail, `Err` a diagnostic.
    fn probe(&self) -> BoxFuture<'_, Result<String, String>>;

    /// Parse one in-memory source.
    fn parse_one<'a>(
        &'a self,
        source: &'a str,
        language: &'a str,
        path_hint: Option<&'a Path>,
    ) -> BoxFuture<'a, ParseOutcome>;

    /// Read and parse many files, detecting each file's language from its
    /// extension.
    fn parse_many(
        self: Arc<Self>,
        paths: Vec<PathBuf>,
        options: BatchOptions,
    ) -> BoxFuture<'static, Result<BatchResults, BatchAborted>> {
        batch::run(self, paths, options)
    }
}
