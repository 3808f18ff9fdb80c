//! Cache manager test helpers.

use std::path::PathBuf;
use std::sync::Arc;

use parsekit_config::AppConfig;
use parsekit_core::{GrammarCacheManager, LanguageCatalog, ParseService};
use tempfile::TempDir;

use crate::config::TestConfigBuilder;
use crate::fetcher::ScriptedFetcher;

/// A grammar cache rooted in a temporary directory and fed by a
/// [`ScriptedFetcher`].
///
/// The directory is deleted when this value is dropped.
pub struct TestCache {
    pub manager: Arc<GrammarCacheManager>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub config: AppConfig,
    temp_dir: TempDir,
}

impl TestCache {
    /// Open a cache for the config built by `builder`; its cache root is
    /// replaced with a fresh temporary directory.
    pub async fn open(builder: TestConfigBuilder, fetcher: ScriptedFetcher) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config = builder.cache_root(&temp_dir.path().join("cache")).build();
        let fetcher = Arc::new(fetcher);
        let catalog = Arc::new(LanguageCatalog::new(config.languages.clone()));
        let manager =
            GrammarCacheManager::open_with_fetcher(&config.cache, catalog, fetcher.clone())
                .await
                .expect("failed to open test cache");
        Self {
            manager: Arc::new(manager),
            fetcher,
            config,
            temp_dir,
        }
    }

    /// Open a full parse service over a fresh temporary cache.
    pub async fn service(
        builder: TestConfigBuilder,
        fetcher: ScriptedFetcher,
    ) -> (ParseService, Arc<ScriptedFetcher>, TempDir) {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config = builder.cache_root(&temp_dir.path().join("cache")).build();
        let fetcher = Arc::new(fetcher);
        let service = ParseService::open_with_fetcher(config, fetcher.clone())
            .await
            .expect("failed to open parse service");
        (service, fetcher, temp_dir)
    }

    /// A scratch directory next to the cache root.
    pub fn scratch(&self) -> PathBuf {
        let dir = self.temp_dir.path().join("scratch");
        std::fs::create_dir_all(&dir).expect("failed to create scratch dir");
        dir
    }

    pub fn artifact_path(&self, language: &str) -> PathBuf {
        self.manager.store().artifact_path(language)
    }

    /// Overwrite the cached artifact for `language` with other bytes.
    pub fn corrupt(&self, language: &str) {
        std::fs::write(self.artifact_path(language), b"corrupted bytes")
            .expect("failed to corrupt artifact");
    }
}
