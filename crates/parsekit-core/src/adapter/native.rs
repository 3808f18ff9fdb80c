use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use super::grammar::RuleEngine;
use super::{ParseOutcome, ParsedSource, ParsingAdapter, scan};
use crate::BoxFuture;
use crate::cache::GrammarCacheManager;
use crate::catalog::LanguageCatalog;
use crate::runtime::BackendKind;

/// Runs the rule engine on the calling task.
pub struct NativeBackend {
    engine: RuleEngine,
}

impl NativeBackend {
    pub fn new(cache: Arc<GrammarCacheManager>) -> Self {
        Self {
            engine: RuleEngine::new(cache),
        }
    }
}

impl ParsingAdapter for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn catalog(&self) -> &LanguageCatalog {
        self.engine.cache().catalog()
    }

    fn probe(&self) -> BoxFuture<'_, Result<String, String>> {
        Box::pin(async { RuleEngine::self_test() })
    }

    fn parse_one<'a>(
        &'a self,
        source: &'a str,
        language: &'a str,
        path_hint: Option<&'a Path>,
    ) -> BoxFuture<'a, ParseOutcome> {
        Box::pin(async move {
            let cancel = self.engine.cache().shutdown_token().clone();
            let (language, rules) = self.engine.prepare(language, &cancel).await?;
            let raw = scan::scan(&rules, source);
            debug!(language = %language, nodes = raw.len(), "Parsed source natively");
            Ok(ParsedSource::from_raw(
                &language,
                path_hint,
                BackendKind::Native,
                raw,
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::adapter::ParseFailureKind;
    use crate::adapter::testing::python_cache;

    #[tokio::test]
    async fn test_parses_with_cached_grammar() {
        let dir = TempDir::new().unwrap();
        let backend = NativeBackend::new(python_cache(dir.path()).await);

        let parsed = backend
            .parse_one("def main():\n    pass\n", "py", Some(Path::new("app.py")))
            .await
            .unwrap();
        assert_eq!(parsed.language, "python");
        assert_eq!(parsed.backend, BackendKind::Native);
        assert_eq!(parsed.nodes.len(), 1);
        assert_eq!(parsed.nodes[0].name.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn test_unknown_language() {
        let dir = TempDir::new().unwrap();
        let backend = NativeBackend::new(python_cache(dir.path()).await);
        let failure = backend.parse_one("x", "cobol", None).await.unwrap_err();
        assert_eq!(failure.kind, ParseFailureKind::UnsupportedLanguage);
    }

    #[tokio::test]
    async fn test_cache_failure_is_internal_error() {
        let dir = TempDir::new().unwrap();
        let cache = python_cache(dir.path()).await;
        std::fs::remove_file(dir.path().join("python.json")).unwrap();

        let backend = NativeBackend::new(cache);
        let failure = backend.parse_one("def a(): pass", "python", None).await.unwrap_err();
        assert_eq!(failure.kind, ParseFailureKind::BackendInternalError);
        assert!(failure.cause().is_some());
    }

    #[tokio::test]
    async fn test_probe_runs_self_test() {
        let dir = TempDir::new().unwrap();
        let backend = NativeBackend::new(python_cache(dir.path()).await);
        assert!(backend.probe().await.is_ok());
    }
}
