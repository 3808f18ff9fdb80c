//! Backend capability probing and selection.
//!
//! A [`CapabilityProbe`] owns the memoized availability of each backend; a
//! [`RuntimeSelector`] walks the preference order over those results and
//! caches the chosen [`BackendHandle`] for the session. Both are explicit
//! instances: nothing here is process-global.

/// Per-backend availability probing with memoization.
pub mod probe;
/// Preference-ordered backend selection.
pub mod selector;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::ParsingAdapter;

pub use probe::CapabilityProbe;
pub use selector::RuntimeSelector;

/// The closed set of parsing backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// In-process rule engine.
    Native,
    /// Rule engine on an isolated worker with time and size limits.
    Sandboxed,
    /// A separate parser process speaking JSON over stdio.
    ExternalProcess,
}

impl BackendKind {
    /// Fixed preference order used by automatic selection.
    pub const PREFERENCE_ORDER: [BackendKind; 3] = [
        BackendKind::Native,
        BackendKind::Sandboxed,
        BackendKind::ExternalProcess,
    ];
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Native => write!(f, "native"),
            BackendKind::Sandboxed => write!(f, "sandboxed"),
            BackendKind::ExternalProcess => write!(f, "external-process"),
        }
    }
}

/// Memoized outcome of probing one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityResult {
    pub backend_kind: BackendKind,
    pub available: bool,
    pub probed_at: DateTime<Utc>,
    /// Version or readiness detail when available, the failure otherwise.
    pub message: String,
}

/// Errors from backend selection.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no parsing runtime available: {}", describe(.diagnostics))]
    NoRuntimeAvailable { diagnostics: Vec<CapabilityResult> },
}

fn describe(diagnostics: &[CapabilityResult]) -> String {
    if diagnostics.is_empty() {
        return "no backends probed".to_string();
    }
    diagnostics
        .iter()
        .map(|d| format!("{}: {}", d.backend_kind, d.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// The selected backend, ready to parse.
#[derive(Clone)]
pub struct BackendHandle {
    kind: BackendKind,
    adapter: Arc<dyn ParsingAdapter>,
}

impl BackendHandle {
    pub fn new(adapter: Arc<dyn ParsingAdapter>) -> Self {
        Self {
            kind: adapter.kind(),
            adapter,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn adapter(&self) -> &Arc<dyn ParsingAdapter> {
        &self.adapter
    }
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("kind", &self.kind)
            .finish()
    }
}
