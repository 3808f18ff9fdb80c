//! Composition of the cache, probe, selector and backends.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parsekit_config::AppConfig;
use tracing::{debug, info};

use crate::adapter::sandboxed::SandboxLimits;
use crate::adapter::{
    BatchAborted, BatchOptions, BatchResults, ExternalProcessBackend, NativeBackend, ParseFailure,
    ParseFailureKind, ParsedSource, SandboxedBackend,
};
use crate::cache::{ArtifactFetcher, CacheError, GrammarCacheManager, PreloadReport};
use crate::catalog::LanguageCatalog;
use crate::runtime::{
    BackendHandle, CapabilityProbe, CapabilityResult, RuntimeError, RuntimeSelector,
};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Parse(#[from] ParseFailure),

    #[error(transparent)]
    Batch(#[from] BatchAborted),
}

/// Entry point for callers that want parsed sources without caring which
/// backend produced them.
pub struct ParseService {
    config: AppConfig,
    catalog: Arc<LanguageCatalog>,
    cache: Arc<GrammarCacheManager>,
    probe: Arc<CapabilityProbe>,
    selector: RuntimeSelector,
}

impl ParseService {
    /// Build every component from `config`, fetching over the network.
    pub async fn open(config: AppConfig) -> Result<Self, ServiceError> {
        let catalog = Arc::new(LanguageCatalog::new(config.languages.clone()));
        let cache = GrammarCacheManager::open(&config.cache, catalog.clone()).await?;
        Ok(Self::assemble(config, catalog, cache))
    }

    /// Like [`open`](Self::open) with a custom artifact fetcher.
    pub async fn open_with_fetcher(
        config: AppConfig,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Result<Self, ServiceError> {
        let catalog = Arc::new(LanguageCatalog::new(config.languages.clone()));
        let cache =
            GrammarCacheManager::open_with_fetcher(&config.cache, catalog.clone(), fetcher).await?;
        Ok(Self::assemble(config, catalog, cache))
    }

    fn assemble(
        config: AppConfig,
        catalog: Arc<LanguageCatalog>,
        cache: GrammarCacheManager,
    ) -> Self {
        let cache = Arc::new(cache);
        let probe = CapabilityProbe::new(config.runtime.probe_timeout())
            .with_backend(Arc::new(NativeBackend::new(cache.clone())))
            .with_backend(Arc::new(SandboxedBackend::new(
                cache.clone(),
                SandboxLimits::from(&config.runtime.sandbox),
            )))
            .with_backend(Arc::new(ExternalProcessBackend::new(
                config.runtime.external.clone(),
                catalog.clone(),
            )));
        let probe = Arc::new(probe);
        let selector = RuntimeSelector::new(probe.clone(), config.runtime.backend);
        info!(
            languages = catalog.len(),
            preference = %config.runtime.backend,
            "Parse service ready"
        );
        Self {
            config,
            catalog,
            cache,
            probe,
            selector,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<LanguageCatalog> {
        &self.catalog
    }

    pub fn cache(&self) -> &Arc<GrammarCacheManager> {
        &self.cache
    }

    pub fn probe(&self) -> &Arc<CapabilityProbe> {
        &self.probe
    }

    pub fn selector(&self) -> &RuntimeSelector {
        &self.selector
    }

    /// The backend parsing requests go to.
    pub async fn backend(&self) -> Result<BackendHandle, RuntimeError> {
        self.selector.select_backend().await
    }

    /// Probe every backend the selector may consider.
    pub async fn capabilities(&self) -> Vec<CapabilityResult> {
        let mut results = Vec::new();
        for kind in self.selector.candidates() {
            results.push(self.probe.probe(kind).await);
        }
        results
    }

    /// Forget probe results so the next call re-selects a backend.
    pub fn reset_runtime(&self) {
        self.probe.reset();
    }

    /// Download every Tier-1 grammar.
    pub async fn preload(&self) -> PreloadReport {
        self.cache.preload().await
    }

    pub async fn ensure(&self, language: &str) -> Result<PathBuf, ServiceError> {
        Ok(self.cache.ensure_artifact(language).await?)
    }

    /// Parse in-memory source. Without `language` it is detected from
    /// `path_hint`.
    pub async fn parse_source(
        &self,
        source: &str,
        language: Option<&str>,
        path_hint: Option<&Path>,
    ) -> Result<ParsedSource, ServiceError> {
        let language = match (language, path_hint) {
            (Some(language), _) => language.to_string(),
            (None, Some(path)) => match self.catalog.detect(path) {
                Some(profile) => profile.name.clone(),
                None => {
                    return Err(ParseFailure::new(
                        ParseFailureKind::UnsupportedLanguage,
                        format!("no language claims {}", path.display()),
                    )
                    .with_path(path)
                    .into());
                }
            },
            (None, None) => {
                return Err(ParseFailure::new(
                    ParseFailureKind::UnsupportedLanguage,
                    "no language given and no path to detect it from",
                )
                .into());
            }
        };
        let backend = self.backend().await?;
        debug!(backend = %backend.kind(), language = %language, "Parsing source");
        Ok(backend
            .adapter()
            .parse_one(source, &language, path_hint)
            .await?)
    }

    /// Parse files on the selected backend. Per-file failures are in the
    /// returned map.
    pub async fn parse_files(
        &self,
        paths: Vec<PathBuf>,
        options: BatchOptions,
    ) -> Result<BatchResults, ServiceError> {
        let backend = self.backend().await?;
        info!(backend = %backend.kind(), files = paths.len(), "Parsing files");
        Ok(backend.adapter().clone().parse_many(paths, options).await?)
    }
}
