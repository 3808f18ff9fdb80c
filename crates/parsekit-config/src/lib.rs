#![deny(unsafe_code)]

//! Configuration loading and validation for parsekit.
//!
//! Loads TOML configuration files and validates them. [`AppConfig`] is the
//! central configuration structure; the [`language`] module holds the
//! per-language grammar profiles the cache layer consumes.

/// Per-language grammar profiles and tiers.
pub mod language;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use language::{LanguageProfile, Tier, is_valid_hash, normalize_hash};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Grammar artifact cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Parsing backend selection configuration.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Language profiles keyed by canonical language name.
    #[serde(default)]
    pub languages: BTreeMap<String, LanguageProfile>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── Cache ───────────────────────────────────────────────────────────────

/// How to treat artifacts for languages that have no expected hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustPolicy {
    /// Refuse to download a grammar that has no configured hash.
    #[default]
    RequireHash,
    /// Accept the first download and record its hash for later checks.
    TrustOnFirstDownload,
}

impl fmt::Display for TrustPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustPolicy::RequireHash => write!(f, "require-hash"),
            TrustPolicy::TrustOnFirstDownload => write!(f, "trust-on-first-download"),
        }
    }
}

/// Retry behaviour for a single download source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per source, including the first one.
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,

    /// Delay before the second attempt; doubled for each later attempt.
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on the backoff delay.
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Backoff before attempt number `attempt` (1-based). The first attempt
    /// never waits.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(attempt - 2).unwrap_or(u64::MAX);
        let millis = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

/// Grammar artifact cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root directory holding one sub-directory per language.
    #[serde(default = "default_cache_root")]
    pub root: String,

    /// Width of the download worker pool used by Tier-1 preload.
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Retry behaviour per source.
    #[serde(default)]
    pub retry: RetryConfig,

    /// What to do when a language has no expected hash.
    #[serde(default)]
    pub trust_policy: TrustPolicy,

    /// Size budget for eviction, in bytes.
    #[serde(default)]
    pub budget_bytes: Option<u64>,

    /// Maximum idle age for Tier-2/3 artifacts, in seconds.
    #[serde(default)]
    pub max_age_secs: Option<u64>,

    /// Artifacts accessed within this window are never evicted.
    #[serde(default = "default_protect_recent_secs")]
    pub protect_recent_secs: u64,

    /// Only use local sources.
    #[serde(default)]
    pub offline: bool,

    /// Global mirror templates; `{language}` is replaced by the language name.
    #[serde(default)]
    pub mirrors: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            request_timeout_secs: default_request_timeout_secs(),
            retry: RetryConfig::default(),
            trust_policy: TrustPolicy::default(),
            budget_bytes: None,
            max_age_secs: None,
            protect_recent_secs: default_protect_recent_secs(),
            offline: false,
            mirrors: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// The cache root as a path.
    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(&self.root)
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_cache_root() -> String {
    ".parsekit/grammars".to_string()
}

fn default_max_concurrent_downloads() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_protect_recent_secs() -> u64 {
    30
}

// ── Runtime ─────────────────────────────────────────────────────────────

/// Which parsing backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimePreference {
    /// Probe backends in preference order and use the first available one.
    #[default]
    Auto,
    /// Force the in-process native engine.
    Native,
    /// Force the sandboxed engine.
    Sandboxed,
    /// Force the external parsing process.
    ExternalProcess,
}

impl fmt::Display for RuntimePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimePreference::Auto => write!(f, "auto"),
            RuntimePreference::Native => write!(f, "native"),
            RuntimePreference::Sandboxed => write!(f, "sandboxed"),
            RuntimePreference::ExternalProcess => write!(f, "external-process"),
        }
    }
}

/// Limits applied by the sandboxed engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLimitsConfig {
    /// Wall-clock limit per parse, in seconds.
    #[serde(default = "default_sandbox_timeout_secs")]
    pub timeout_secs: u64,

    /// Largest source the sandbox accepts, in bytes.
    #[serde(default = "default_sandbox_max_source_bytes")]
    pub max_source_bytes: usize,
}

impl Default for SandboxLimitsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_sandbox_timeout_secs(),
            max_source_bytes: default_sandbox_max_source_bytes(),
        }
    }
}

fn default_sandbox_timeout_secs() -> u64 {
    10
}

fn default_sandbox_max_source_bytes() -> usize {
    4 * 1024 * 1024 // 4 MiB
}

/// How to launch the external parsing process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalProcessConfig {
    /// Program to run.
    #[serde(default = "default_external_program")]
    pub program: String,

    /// Extra arguments placed before the subcommand.
    #[serde(default)]
    pub args: Vec<String>,

    /// Wall-clock limit per invocation, in seconds.
    #[serde(default = "default_external_timeout_secs")]
    pub timeout_secs: u64,

    /// Extra environment variables for the process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for ExternalProcessConfig {
    fn default() -> Self {
        Self {
            program: default_external_program(),
            args: Vec::new(),
            timeout_secs: default_external_timeout_secs(),
            env: HashMap::new(),
        }
    }
}

fn default_external_program() -> String {
    "ast-parser".to_string()
}

fn default_external_timeout_secs() -> u64 {
    60
}

/// Parsing backend selection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Backend preference.
    #[serde(default)]
    pub backend: RuntimePreference,

    /// Upper bound on a single capability probe, in seconds.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Sandboxed engine limits.
    #[serde(default)]
    pub sandbox: SandboxLimitsConfig,

    /// External parsing process settings.
    #[serde(default)]
    pub external: ExternalProcessConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: RuntimePreference::default(),
            probe_timeout_secs: default_probe_timeout_secs(),
            sandbox: SandboxLimitsConfig::default(),
            external: ExternalProcessConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Upper bound on a single capability probe.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

fn default_probe_timeout_secs() -> u64 {
    10
}

// ── Loading & validation ────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::parse(&content)?;
        tracing::debug!(
            path = %path.display(),
            languages = config.languages.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let mut config: AppConfig = toml::from_str(s)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Fill profile names from their table keys and lowercase extensions.
    fn normalize(&mut self) {
        for (key, profile) in self.languages.iter_mut() {
            if profile.name.is_empty() {
                profile.name = key.clone();
            }
            profile.file_extensions = profile
                .file_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect();
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.root.is_empty() {
            return Err(ConfigError::Validation(
                "cache.root must not be empty".to_string(),
            ));
        }
        if self.cache.max_concurrent_downloads == 0 {
            return Err(ConfigError::Validation(
                "cache.max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.cache.retry.attempts == 0 {
            return Err(ConfigError::Validation(
                "cache.retry.attempts must be at least 1".to_string(),
            ));
        }
        if self.cache.retry.max_delay_ms < self.cache.retry.base_delay_ms {
            return Err(ConfigError::Validation(format!(
                "cache.retry.max_delay_ms ({}) must be >= base_delay_ms ({})",
                self.cache.retry.max_delay_ms, self.cache.retry.base_delay_ms
            )));
        }
        for (i, mirror) in self.cache.mirrors.iter().enumerate() {
            if !mirror.contains("{language}") {
                return Err(ConfigError::Validation(format!(
                    "cache.mirrors[{i}] must contain a {{language}} placeholder, got {mirror:?}"
                )));
            }
        }
        if self.runtime.external.program.is_empty() {
            return Err(ConfigError::Validation(
                "runtime.external.program must not be empty".to_string(),
            ));
        }
        if self.runtime.sandbox.max_source_bytes == 0 {
            return Err(ConfigError::Validation(
                "runtime.sandbox.max_source_bytes must be non-zero".to_string(),
            ));
        }

        let mut claimed: HashMap<&str, &str> = HashMap::new();
        for (key, profile) in &self.languages {
            if profile.name != *key {
                return Err(ConfigError::Validation(format!(
                    "languages.{key}.name must match its table key, got {:?}",
                    profile.name
                )));
            }
            if profile.primary_source_url.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "languages.{key}.primary_source_url must not be empty"
                )));
            }
            if let Some(hash) = &profile.expected_hash {
                if !is_valid_hash(hash) {
                    return Err(ConfigError::Validation(format!(
                        "languages.{key}.expected_hash must be a SHA-256 hex digest, got {hash:?}"
                    )));
                }
            }
            for ext in &profile.file_extensions {
                if let Some(other) = claimed.insert(ext.as_str(), key.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "file extension {ext:?} is claimed by both {other:?} and {key:?}"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Insert a language profile, keyed by its name.
    pub fn with_language(mut self, profile: LanguageProfile) -> Self {
        self.languages.insert(profile.name.clone(), profile);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const HASH: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.cache.root, ".parsekit/grammars");
        assert_eq!(config.cache.max_concurrent_downloads, 4);
        assert_eq!(config.cache.retry.attempts, 3);
        assert_eq!(config.cache.trust_policy, TrustPolicy::RequireHash);
        assert_eq!(config.runtime.backend, RuntimePreference::Auto);
        assert!(config.languages.is_empty());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.cache.request_timeout_secs, 30);
        assert_eq!(config.runtime.external.program, "ast-parser");
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = format!(
            r#"
            [logging]
            level = "debug"

            [cache]
            root = "/var/cache/parsekit"
            max_concurrent_downloads = 2
            trust_policy = "trust-on-first-download"
            budget_bytes = 1048576
            mirrors = ["https://mirror.example/{{language}}.json"]

            [cache.retry]
            attempts = 5
            base_delay_ms = 10
            max_delay_ms = 100

            [runtime]
            backend = "external-process"

            [runtime.external]
            program = "/usr/local/bin/ast-parser"
            args = ["--max-parsers", "2"]

            [languages.python]
            file_extensions = ["py", ".PYI"]
            tier = 1
            primary_source_url = "https://grammars.example/python.json"
            fallback_source_urls = ["https://mirror.example/python.json"]
            expected_hash = "sha256:{HASH}"
            priority_within_tier = 1

            [languages.go]
            file_extensions = ["go"]
            tier = 3
            primary_source_url = "https://grammars.example/go.json"
        "#
        );
        let config = AppConfig::parse(&toml).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.cache.root, "/var/cache/parsekit");
        assert_eq!(config.cache.max_concurrent_downloads, 2);
        assert_eq!(
            config.cache.trust_policy,
            TrustPolicy::TrustOnFirstDownload
        );
        assert_eq!(config.cache.budget_bytes, Some(1_048_576));
        assert_eq!(config.cache.retry.attempts, 5);
        assert_eq!(config.runtime.backend, RuntimePreference::ExternalProcess);
        assert_eq!(config.runtime.external.args.len(), 2);

        let python = &config.languages["python"];
        assert_eq!(python.name, "python");
        assert_eq!(python.tier, Tier::Eager);
        assert!(python.file_extensions.contains("pyi"));
        assert_eq!(python.normalized_expected_hash().as_deref(), Some(HASH));
        assert_eq!(config.languages["go"].tier, Tier::Lazy);
    }

    #[test]
    fn test_validation_rejects_bad_tier() {
        let toml = r#"
            [languages.c]
            tier = 7
            primary_source_url = "https://grammars.example/c.json"
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_primary_source() {
        let toml = r#"
            [languages.c]
            primary_source_url = ""
        "#;
        assert!(matches!(
            AppConfig::parse(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_validation_rejects_malformed_hash() {
        let toml = r#"
            [languages.c]
            primary_source_url = "https://grammars.example/c.json"
            expected_hash = "not-a-hash"
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_shared_extension() {
        let toml = r#"
            [languages.c]
            file_extensions = ["h"]
            primary_source_url = "https://grammars.example/c.json"

            [languages.cpp]
            file_extensions = ["h", "cpp"]
            primary_source_url = "https://grammars.example/cpp.json"
        "#;
        let err = AppConfig::parse(toml).unwrap_err();
        assert!(err.to_string().contains("\"h\""));
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let toml = r#"
            [cache]
            max_concurrent_downloads = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_mirror_without_placeholder() {
        let toml = r#"
            [cache]
            mirrors = ["https://mirror.example/grammar.json"]
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let retry = RetryConfig {
            attempts: 6,
            base_delay_ms: 100,
            max_delay_ms: 350,
        };
        assert_eq!(retry.delay_before(1), Duration::ZERO);
        assert_eq!(retry.delay_before(2), Duration::from_millis(100));
        assert_eq!(retry.delay_before(3), Duration::from_millis(200));
        assert_eq!(retry.delay_before(4), Duration::from_millis(350));
        assert_eq!(retry.delay_before(60), Duration::from_millis(350));
    }

    #[test]
    fn test_display_impls() {
        assert_eq!(TrustPolicy::RequireHash.to_string(), "require-hash");
        assert_eq!(
            RuntimePreference::ExternalProcess.to_string(),
            "external-process"
        );
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("parsekit.toml");
        tokio::fs::write(
            &path,
            "[languages.rust]\nprimary_source_url = \"https://grammars.example/rust.json\"\n",
        )
        .await
        .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.languages["rust"].tier, Tier::OnDemand);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let result = AppConfig::load(&dir.path().join("missing.toml")).await;
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
