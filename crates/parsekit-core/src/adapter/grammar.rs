//! Grammar rule documents served from the artifact cache.
//!
//! The cache stores artifacts as opaque bytes. The in-process engines read
//! them as JSON [`GrammarRules`]:
//!
//! ```json
//! {
//!   "language": "python",
//!   "version": "1",
//!   "line_comment": "#",
//!   "block": "indent",
//!   "modifiers": ["async"],
//!   "rules": [
//!     { "kind": "function", "keywords": ["def"] },
//!     { "kind": "class", "keywords": ["class"] }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ParseFailure, ParseFailureKind};
use crate::cache::{ArtifactRecord, CacheError, GrammarCacheManager};

/// How the extent of a declaration is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStyle {
    /// Ends where the brace opened on the declaration closes.
    #[default]
    Braces,
    /// Ends at the last following line indented deeper than the declaration.
    Indent,
    /// The declaration line only.
    Line,
}

/// One kind of declaration and the keywords introducing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclarationRule {
    pub kind: String,
    pub keywords: Vec<String>,
    /// Overrides the grammar's block style for this rule.
    #[serde(default)]
    pub block: Option<BlockStyle>,
}

/// A grammar artifact as interpreted by the rule engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrammarRules {
    pub language: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub line_comment: Option<String>,
    #[serde(default)]
    pub block: BlockStyle,
    /// Words that may precede a keyword (`pub`, `export`, `async`).
    #[serde(default)]
    pub modifiers: Vec<String>,
    pub rules: Vec<DeclarationRule>,
}

impl GrammarRules {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn block_for(&self, rule: &DeclarationRule) -> BlockStyle {
        rule.block.unwrap_or(self.block)
    }

    /// A minimal brace-language grammar used to check the engine itself.
    pub fn smoke() -> Self {
        Self {
            language: "smoke".to_string(),
            version: Some("1".to_string()),
            line_comment: Some("//".to_string()),
            block: BlockStyle::Braces,
            modifiers: vec!["pub".to_string()],
            rules: vec![DeclarationRule {
                kind: "function".to_string(),
                keywords: vec!["fn".to_string()],
                block: None,
            }],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GrammarError {
    #[error("failed to read grammar {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid grammar {}: {source}", .path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("grammar {} declares no rules", .path.display())]
    Empty { path: PathBuf },
}

/// Parsed grammars keyed by artifact content hash.
#[derive(Debug, Default)]
pub struct GrammarLoader {
    loaded: Mutex<HashMap<String, Arc<GrammarRules>>>,
}

impl GrammarLoader {
    pub fn new() -> Self {
        Self::default()
    }

    fn cached(&self, hash: &str) -> Option<Arc<GrammarRules>> {
        self.loaded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(hash)
            .cloned()
    }

    /// Rules for the artifact behind `record`. An unchanged artifact is read
    /// from disk once.
    pub async fn load(&self, record: &ArtifactRecord) -> Result<Arc<GrammarRules>, GrammarError> {
        if let Some(rules) = self.cached(&record.content_hash) {
            return Ok(rules);
        }
        let rules = Arc::new(Self::read(&record.local_path).await?);
        debug!(
            language = %record.language,
            rules = rules.rules.len(),
            "Loaded grammar rules"
        );
        self.loaded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(record.content_hash.clone(), rules.clone());
        Ok(rules)
    }

    async fn read(path: &Path) -> Result<GrammarRules, GrammarError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| GrammarError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let rules = GrammarRules::from_slice(&bytes).map_err(|source| GrammarError::Invalid {
            path: path.to_path_buf(),
            source,
        })?;
        if rules.rules.is_empty() {
            return Err(GrammarError::Empty {
                path: path.to_path_buf(),
            });
        }
        Ok(rules)
    }

    pub fn len(&self) -> usize {
        self.loaded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves a language to verified grammar rules through the cache.
pub struct RuleEngine {
    cache: Arc<GrammarCacheManager>,
    loader: GrammarLoader,
}

impl RuleEngine {
    pub fn new(cache: Arc<GrammarCacheManager>) -> Self {
        Self {
            cache,
            loader: GrammarLoader::new(),
        }
    }

    pub fn cache(&self) -> &Arc<GrammarCacheManager> {
        &self.cache
    }

    /// Canonical language name and its grammar.
    pub async fn prepare(
        &self,
        language: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, Arc<GrammarRules>), ParseFailure> {
        // The lease keeps eviction away from the artifact while it is read.
        let lease = match self.cache.lease(language, cancel).await {
            Ok(lease) => lease,
            Err(CacheError::UnsupportedLanguage(name)) => {
                return Err(ParseFailure::unsupported_language(&name));
            }
            Err(e) => {
                return Err(ParseFailure::new(
                    ParseFailureKind::BackendInternalError,
                    format!("grammar for {language} unavailable: {e}"),
                )
                .with_cause(e));
            }
        };
        let rules = self.loader.load(lease.record()).await.map_err(|e| {
            ParseFailure::new(ParseFailureKind::BackendInternalError, e.to_string()).with_cause(e)
        })?;
        Ok((lease.language().to_string(), rules))
    }

    /// Scan a fixed snippet with the smoke grammar.
    pub fn self_test() -> Result<String, String> {
        let rules = GrammarRules::smoke();
        let nodes = super::scan::scan(&rules, "pub fn main() {\n}\n");
        match nodes.as_slice() {
            [node] if node.name.as_deref() == Some("main") => {
                Ok(format!("rule engine {}", crate::build_info::VERSION))
            }
            _ => Err(format!("rule engine self-test produced {} nodes", nodes.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use parsekit_config::Tier;
    use tempfile::TempDir;

    use super::*;
    use crate::cache::{IntegrityState, SourceKind};

    const PYTHON: &str = r##"{
        "language": "python",
        "line_comment": "#",
        "block": "indent",
        "rules": [{ "kind": "function", "keywords": ["def"] }]
    }"##;

    fn record(path: &Path, hash: &str) -> ArtifactRecord {
        let now = Utc::now();
        ArtifactRecord {
            language: "python".to_string(),
            local_path: path.to_path_buf(),
            content_hash: hash.to_string(),
            size_bytes: 0,
            source_url: "file:///grammar".to_string(),
            source_kind: SourceKind::Local,
            downloaded_at: now,
            last_verified_at: now,
            last_accessed_at: now,
            access_count: 1,
            integrity_state: IntegrityState::Verified,
            tier: Tier::Eager,
        }
    }

    #[test]
    fn test_rules_defaults() {
        let rules = GrammarRules::from_slice(PYTHON.as_bytes()).unwrap();
        assert_eq!(rules.block, BlockStyle::Indent);
        assert!(rules.modifiers.is_empty());
        assert_eq!(rules.block_for(&rules.rules[0]), BlockStyle::Indent);
    }

    #[tokio::test]
    async fn test_loader_caches_by_hash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grammar.bin");
        std::fs::write(&path, PYTHON).unwrap();

        let loader = GrammarLoader::new();
        let first = loader.load(&record(&path, "aa")).await.unwrap();
        std::fs::remove_file(&path).unwrap();
        let second = loader.load(&record(&path, "aa")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(matches!(
            loader.load(&record(&path, "bb")).await,
            Err(GrammarError::Read { .. })
        ));
    }

    #[tokio::test]
    async fn test_loader_rejects_empty_rules() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grammar.bin");
        std::fs::write(&path, r#"{"language":"x","rules":[]}"#).unwrap();
        let err = GrammarLoader::new().load(&record(&path, "cc")).await.unwrap_err();
        assert!(matches!(err, GrammarError::Empty { .. }));
    }

    #[test]
    fn test_self_test_passes() {
        assert!(RuleEngine::self_test().unwrap().starts_with("rule engine"));
    }

    #[tokio::test]
    async fn test_prepare_releases_artifact_for_eviction() {
        let dir = TempDir::new().unwrap();
        let cache = crate::adapter::testing::python_cache(dir.path()).await;
        let engine = RuleEngine::new(Arc::clone(&cache));

        let (language, rules) = engine
            .prepare("python", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(language, "python");
        assert_eq!(rules.line_comment.as_deref(), Some("#"));

        let policy = crate::cache::EvictionPolicy::default()
            .with_budget(0)
            .with_protect_recent(std::time::Duration::ZERO);
        let report = cache.evict(&policy).await.unwrap();
        assert_eq!(report.evicted.len(), 1);
    }
}
