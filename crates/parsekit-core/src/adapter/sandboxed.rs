//! The rule engine behind a blocking-worker boundary.
//!
//! Scanning runs on a dedicated blocking thread with a wall-clock limit and
//! a source size cap. A panic in the engine, an exceeded limit, and a
//! timeout are all reported as `BackendInternalError` for the one source
//! involved; the async runtime is never stalled by a slow scan.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parsekit_config::SandboxLimitsConfig;
use tracing::{debug, warn};

use super::grammar::RuleEngine;
use super::{ParseFailure, ParseFailureKind, ParseOutcome, ParsedSource, ParsingAdapter, scan};
use crate::BoxFuture;
use crate::cache::GrammarCacheManager;
use crate::catalog::LanguageCatalog;
use crate::runtime::BackendKind;

/// Limits enforced per parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub max_source_bytes: usize,
}

impl From<&SandboxLimitsConfig> for SandboxLimits {
    fn from(config: &SandboxLimitsConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            max_source_bytes: config.max_source_bytes,
        }
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::from(&SandboxLimitsConfig::default())
    }
}

pub struct SandboxedBackend {
    engine: RuleEngine,
    limits: SandboxLimits,
}

impl SandboxedBackend {
    pub fn new(cache: Arc<GrammarCacheManager>, limits: SandboxLimits) -> Self {
        Self {
            engine: RuleEngine::new(cache),
            limits,
        }
    }

    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

    async fn isolated<T, F>(&self, work: F) -> Result<T, ParseFailure>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let task = tokio::task::spawn_blocking(work);
        match tokio::time::timeout(self.limits.timeout, task).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(error = %e, "Sandboxed worker failed");
                Err(ParseFailure::new(
                    ParseFailureKind::BackendInternalError,
                    format!("sandboxed worker failed: {e}"),
                ))
            }
            Err(_) => Err(ParseFailure::new(
                ParseFailureKind::BackendInternalError,
                format!("sandbox timeout after {:?}", self.limits.timeout),
            )),
        }
    }
}

impl ParsingAdapter for SandboxedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sandboxed
    }

    fn catalog(&self) -> &LanguageCatalog {
        self.engine.cache().catalog()
    }

    fn probe(&self) -> BoxFuture<'_, Result<String, String>> {
        Box::pin(async move {
            match self.isolated(RuleEngine::self_test).await {
                Ok(Ok(detail)) => Ok(format!("{detail} (isolated worker)")),
                Ok(Err(diagnostic)) => Err(diagnostic),
                Err(failure) => Err(failure.message),
            }
        })
    }

    fn parse_one<'a>(
        &'a self,
        source: &'a str,
        language: &'a str,
        path_hint: Option<&'a Path>,
    ) -> BoxFuture<'a, ParseOutcome> {
        Box::pin(async move {
            if source.len() > self.limits.max_source_bytes {
                return Err(ParseFailure::new(
                    ParseFailureKind::BackendInternalError,
                    format!(
                        "resource limit exceeded: source is {} bytes, limit is {}",
                        source.len(),
                        self.limits.max_source_bytes
                    ),
                ));
            }

            let cancel = self.engine.cache().shutdown_token().clone();
            let (language, rules) = self.engine.prepare(language, &cancel).await?;
            let owned = source.to_string();
            let raw = self.isolated(move || scan::scan(&rules, &owned)).await?;
            debug!(language = %language, nodes = raw.len(), "Parsed source in sandbox");
            Ok(ParsedSource::from_raw(
                &language,
                path_hint,
                BackendKind::Sandboxed,
                raw,
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::adapter::testing::python_cache;

    #[tokio::test]
    async fn test_matches_native_output() {
        let dir = TempDir::new().unwrap();
        let cache = python_cache(dir.path()).await;
        let sandboxed = SandboxedBackend::new(cache.clone(), SandboxLimits::default());
        let native = super::super::NativeBackend::new(cache);

        let src = "class A:\n    def b(self):\n        pass\n";
        let path = Some(Path::new("a.py"));
        let a = sandboxed.parse_one(src, "python", path).await.unwrap();
        let b = native.parse_one(src, "python", path).await.unwrap();
        assert_eq!(a.nodes, b.nodes);
        assert_eq!(a.backend, BackendKind::Sandboxed);
    }

    #[tokio::test]
    async fn test_source_size_limit() {
        let dir = TempDir::new().unwrap();
        let limits = SandboxLimits {
            timeout: Duration::from_secs(5),
            max_source_bytes: 8,
        };
        let backend = SandboxedBackend::new(python_cache(dir.path()).await, limits);
        let failure = backend
            .parse_one("def long_function_name(): pass", "python", None)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ParseFailureKind::BackendInternalError);
        assert!(failure.message.contains("resource limit exceeded"));
    }

    #[tokio::test]
    async fn test_worker_panic_is_contained() {
        let dir = TempDir::new().unwrap();
        let backend =
            SandboxedBackend::new(python_cache(dir.path()).await, SandboxLimits::default());
        let failure = backend
            .isolated(|| -> usize { panic!("engine bug") })
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ParseFailureKind::BackendInternalError);
    }

    #[tokio::test]
    async fn test_worker_timeout() {
        let dir = TempDir::new().unwrap();
        let limits = SandboxLimits {
            timeout: Duration::from_millis(20),
            max_source_bytes: 1024,
        };
        let backend = SandboxedBackend::new(python_cache(dir.path()).await, limits);
        let failure = backend
            .isolated(|| std::thread::sleep(Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert!(failure.message.contains("timeout"));
    }

    #[tokio::test]
    async fn test_probe_reports_isolated_worker() {
        let dir = TempDir::new().unwrap();
        let backend =
            SandboxedBackend::new(python_cache(dir.path()).await, SandboxLimits::default());
        assert!(backend.probe().await.unwrap().ends_with("(isolated worker)"));
    }
}
