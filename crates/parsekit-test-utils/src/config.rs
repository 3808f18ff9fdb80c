//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values and
//! [`ProfileBuilder`] for language profiles, without repeating boilerplate
//! across crate boundaries.

use std::path::Path;

use parsekit_config::{AppConfig, LanguageProfile, RuntimePreference, Tier, TrustPolicy};
use parsekit_core::cache::IntegrityVerifier;

/// Fluent builder for [`AppConfig`] in tests.
///
/// Retries default to no backoff so failing sources do not slow tests down.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .cache_root(dir.path())
///     .language(ProfileBuilder::new("python", "https://good").pinned_to(b"...").build())
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.cache.retry.base_delay_ms = 0;
        config.cache.retry.max_delay_ms = 0;
        config.cache.protect_recent_secs = 0;
        Self { config }
    }

    pub fn cache_root(mut self, root: &Path) -> Self {
        self.config.cache.root = root.to_string_lossy().into_owned();
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn trust_on_first_download(mut self) -> Self {
        self.config.cache.trust_policy = TrustPolicy::TrustOnFirstDownload;
        self
    }

    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.config.cache.retry.attempts = attempts;
        self
    }

    pub fn max_concurrent_downloads(mut self, n: usize) -> Self {
        self.config.cache.max_concurrent_downloads = n;
        self
    }

    pub fn budget_bytes(mut self, bytes: u64) -> Self {
        self.config.cache.budget_bytes = Some(bytes);
        self
    }

    pub fn max_age_secs(mut self, secs: u64) -> Self {
        self.config.cache.max_age_secs = Some(secs);
        self
    }

    pub fn protect_recent_secs(mut self, secs: u64) -> Self {
        self.config.cache.protect_recent_secs = secs;
        self
    }

    pub fn offline(mut self) -> Self {
        self.config.cache.offline = true;
        self
    }

    pub fn mirror(mut self, template: &str) -> Self {
        self.config.cache.mirrors.push(template.to_string());
        self
    }

    pub fn backend(mut self, preference: RuntimePreference) -> Self {
        self.config.runtime.backend = preference;
        self
    }

    /// Run `program` for the external-process backend.
    pub fn external_program(mut self, program: &str, args: &[&str]) -> Self {
        self.config.runtime.external.program = program.to_string();
        self.config.runtime.external.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn language(mut self, profile: LanguageProfile) -> Self {
        self.config = self.config.with_language(profile);
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Fluent builder for [`LanguageProfile`] in tests.
pub struct ProfileBuilder {
    profile: LanguageProfile,
}

impl ProfileBuilder {
    pub fn new(name: &str, primary_source_url: &str) -> Self {
        Self {
            profile: LanguageProfile::new(name, primary_source_url),
        }
    }

    pub fn tier(mut self, tier: Tier) -> Self {
        self.profile = self.profile.with_tier(tier);
        self
    }

    pub fn extension(mut self, ext: &str) -> Self {
        self.profile = self.profile.with_extension(ext);
        self
    }

    pub fn fallback(mut self, url: &str) -> Self {
        self.profile = self.profile.with_fallback(url);
        self
    }

    pub fn local_source(mut self, path: &str) -> Self {
        self.profile = self.profile.with_local_source(path);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.profile = self.profile.with_priority(priority);
        self
    }

    /// Expect exactly `bytes`: pins both the hash and the size.
    pub fn pinned_to(mut self, bytes: &[u8]) -> Self {
        self.profile = self
            .profile
            .with_expected_hash(IntegrityVerifier::hash_bytes(bytes))
            .with_expected_size(bytes.len() as u64);
        self
    }

    pub fn expected_hash(mut self, hash: &str) -> Self {
        self.profile = self.profile.with_expected_hash(hash);
        self
    }

    pub fn build(self) -> LanguageProfile {
        self.profile
    }
}
